// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the bridge, driven over the simulated bus.
//!
//! Every test builds its own [`LoopbackBus`] and keeps a clone of it to
//! inject events and inspect what the bridge did on the bus side.
//!
//! # Test Coverage
//!
//! - Session lifecycle: setup guards, idempotent shutdown, release order,
//!   unwinding after acquisition failures
//! - Registry catalog updates through `update`
//! - Publish to capture round trips, renegotiation and padded strides
//! - Capture edge cases: no data yet, malformed buffers
//! - Target selection and reconnect
//! - Concurrent pump and application threads

use std::collections::BTreeMap;

use pwbridge::{
    AcceptedFormat, Bridge, BridgeConfig, Direction, ErrorCategory, GlobalObject, GlobalType,
    LoopbackBus, PixelFormat, Pixels, StreamState, VideoConfig,
    format::Fraction,
    loopback::{Handle, LoopbackBuffer},
};
use tracing::info;

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

const SMALL: VideoConfig = VideoConfig::new(64, 32, 30);

/// Initializes logging and returns a bridge on a fresh bus, plus a handle to that bus.
fn setup_test() -> (Bridge<LoopbackBus>, LoopbackBus) {
    // Initialize logging once (respects RUST_LOG environment variable)
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .init();
    });

    let bus = LoopbackBus::new();
    (Bridge::new(bus.clone()), bus)
}

fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Pixels {
    let mut pixels = Pixels::allocate(width, height, 4);
    pixels.fill(&rgba);
    pixels
}

fn accepted(format: PixelFormat, config: VideoConfig) -> AcceptedFormat {
    AcceptedFormat {
        format,
        width: config.width,
        height: config.height,
        framerate: Fraction::new(config.fps, 1),
        stride: 0,
    }
}

const ACQUISITION_ORDER: [Handle; 6] = [
    Handle::MainLoop,
    Handle::Context,
    Handle::Core,
    Handle::Registry,
    Handle::Stream(Direction::Publish),
    Handle::Stream(Direction::Capture),
];

#[test]
fn setup_without_streams_fails() {
    let (mut bridge, bus) = setup_test();
    assert!(!bridge.setup(false, false, VideoConfig::default()));
    assert!(!bridge.is_initialized());
    let err = bridge
        .try_setup(false, false, VideoConfig::default())
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ConfigurationInvalid);
    assert!(bus.released().is_empty());
    assert!(bus.requests().is_empty());
}

#[test]
fn invalid_video_config_is_rejected_before_connecting() {
    let (mut bridge, bus) = setup_test();
    let err = bridge
        .try_setup(true, false, VideoConfig::new(8, 8, 30))
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ConfigurationInvalid);
    assert!(!bridge.setup(true, false, VideoConfig::new(640, 480, 500)));
    assert!(!bridge.is_initialized());
    assert!(bus.requests().is_empty());
}

#[test]
fn shutdown_is_idempotent() {
    let (mut bridge, bus) = setup_test();
    assert!(bridge.setup(true, true, SMALL));
    bridge.shutdown();
    let released = bus.released();
    bridge.shutdown();
    assert!(!bridge.is_initialized());
    assert_eq!(bus.released(), released);
    assert_eq!(bus.open_streams(), 0);
}

#[test]
fn shutdown_releases_in_reverse_order() {
    let (mut bridge, bus) = setup_test();
    assert!(bridge.setup(true, true, SMALL));
    assert!(bus.released().is_empty());
    bridge.shutdown();
    let mut expected = ACQUISITION_ORDER.to_vec();
    expected.reverse();
    assert_eq!(bus.released(), expected);
}

#[test]
fn dropping_the_bridge_shuts_down() {
    let (mut bridge, bus) = setup_test();
    assert!(bridge.setup(false, true, SMALL));
    drop(bridge);
    assert_eq!(bus.released().last(), Some(&Handle::MainLoop));
    assert_eq!(bus.open_streams(), 0);
    assert_eq!(bus.open_registries(), 0);
}

#[test]
fn setup_on_initialized_bridge_is_a_noop() {
    let (mut bridge, bus) = setup_test();
    assert!(bridge.setup(true, false, SMALL));
    assert!(bridge.setup(false, true, VideoConfig::default()));
    assert_eq!(bus.requests().len(), 1);
    assert!(bridge.negotiated_format(Direction::Capture).is_none());
}

#[test]
fn acquisition_failure_unwinds_everything() {
    for (index, failing) in ACQUISITION_ORDER.iter().enumerate() {
        let (mut bridge, bus) = setup_test();
        bus.fail(*failing);
        let err = bridge.try_setup(true, true, SMALL).unwrap_err();
        let expected_category = match failing {
            Handle::Stream(_) => ErrorCategory::ConnectFailure,
            _ => ErrorCategory::EnvironmentUnavailable,
        };
        assert_eq!(err.category(), expected_category, "failing {failing:?}");
        assert!(!bridge.is_initialized());

        let mut expected: Vec<Handle> = ACQUISITION_ORDER[..index].to_vec();
        expected.reverse();
        assert_eq!(bus.released(), expected, "failing {failing:?}");
        assert_eq!(bus.open_streams(), 0);

        bus.clear_failures();
        assert!(bridge.setup(true, true, SMALL));
    }
}

#[test]
fn nul_bytes_in_names_fail_the_connect() {
    let (mut bridge, bus) = setup_test();
    bridge.set_node_name("cam\0era");
    let err = bridge.try_setup(true, false, SMALL).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ConnectFailure);
    assert!(!bridge.is_initialized());
    assert!(bus.requests().is_empty());
    assert_eq!(
        bus.released(),
        vec![Handle::Registry, Handle::Core, Handle::Context, Handle::MainLoop]
    );

    let (mut bridge, bus) = setup_test();
    bridge.set_capture_target_node_name("src\0");
    assert!(!bridge.setup(true, true, SMALL));
    assert_eq!(bus.open_streams(), 0);
    assert_eq!(bus.released()[0], Handle::Stream(Direction::Publish));
}

#[test]
fn registry_tracks_added_and_removed_nodes() {
    let (mut bridge, bus) = setup_test();
    assert!(bridge.setup(false, true, SMALL));

    bus.announce(GlobalObject::new(
        7,
        GlobalType::Node,
        [
            ("node.name", "v4l2_input.cam"),
            ("node.description", "Camera"),
            ("media.class", "Video/Source"),
            ("object.serial", "312"),
        ],
    ));
    assert!(bridge.get_nodes().is_empty());
    bridge.update();
    let video = bridge.get_video_nodes();
    assert_eq!(video.len(), 1);
    assert_eq!(video[0].id, 7);
    assert_eq!(video[0].serial.as_deref(), Some("312"));

    bus.retract(7);
    bridge.update();
    assert!(bridge.get_nodes().is_empty());
    assert!(bridge.get_video_nodes().is_empty());
}

#[test]
fn catalog_resolves_ports_and_clears_on_shutdown() {
    let (mut bridge, bus) = setup_test();
    bus.announce(GlobalObject::new(
        30,
        GlobalType::Node,
        [("node.name", "screen"), ("media.class", "Video/Source")],
    ));
    bus.announce(GlobalObject::new(
        31,
        GlobalType::Port,
        [
            ("node.id", "30"),
            ("port.name", "capture_0"),
            ("port.direction", "out"),
            ("port.alias", "screen:capture_0"),
        ],
    ));
    bus.announce(GlobalObject::new(
        32,
        GlobalType::Other("PipeWire:Interface:Link".to_string()),
        [("link.output.node", "30")],
    ));
    assert!(bridge.setup(false, true, SMALL));
    bridge.update();

    let ports = bridge.get_ports();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].alias.as_deref(), Some("screen:capture_0"));
    let owner = bridge.catalog().port_owner(&ports[0]).unwrap();
    assert_eq!(owner.name, "screen");

    // The node goes first; its port lingers for a cycle.
    bus.retract(30);
    bridge.update();
    assert!(bridge.catalog().port_owner(&ports[0]).is_none());
    assert_eq!(bridge.catalog().ports_of(30).len(), 1);

    bridge.shutdown();
    assert!(bridge.get_ports().is_empty());
}

#[test]
fn publish_capture_round_trip() {
    let (mut bridge, _bus) = setup_test();
    let config = VideoConfig::new(640, 360, 30);
    assert!(bridge.setup(true, true, config));

    let red = solid(640, 360, [255, 0, 0, 255]);
    assert!(bridge.submit_frame(&red));
    bridge.update();

    let negotiated = bridge.negotiated_format(Direction::Publish).unwrap();
    assert!(negotiated.valid);
    assert_eq!(negotiated.format, PixelFormat::Rgbx);

    let mut out = Pixels::new();
    assert!(bridge.get_latest_frame(&mut out));
    assert_eq!((out.width(), out.height(), out.channels()), (640, 360, 4));
    assert_eq!(out.pixel(0, 0), Some(&[255, 0, 0, 255][..]));
    assert_eq!(out.pixel(639, 359), Some(&[255, 0, 0, 255][..]));
    info!("Round trip verified");
}

#[test]
fn padding_formats_force_opaque_alpha() {
    let (mut bridge, _bus) = setup_test();
    assert!(bridge.setup(true, true, SMALL));
    assert!(bridge.submit_frame(&solid(64, 32, [10, 20, 30, 40])));
    bridge.update();
    let mut out = Pixels::new();
    assert!(bridge.get_latest_frame(&mut out));
    assert!(out.data().chunks_exact(4).all(|px| px == [10u8, 20, 30, 255]));
}

#[test]
fn rgb_frames_are_promoted() {
    let (mut bridge, bus) = setup_test();
    bus.set_format_override(Direction::Publish, PixelFormat::Rgba);
    assert!(bridge.setup(true, false, SMALL));
    bridge.update();

    let rgb_bytes: Vec<u8> = (0..64 * 32 * 3).map(|i| (i % 251) as u8).collect();
    let rgb = Pixels::from_raw(64, 32, 3, rgb_bytes.clone()).unwrap();
    assert!(bridge.submit_frame(&rgb));
    bridge.update();

    let buffer = bus.last_publish_buffer().unwrap();
    let data = buffer.data.unwrap();
    for (px, src) in data.chunks_exact(4).zip(rgb_bytes.chunks_exact(3)) {
        assert_eq!(&px[..3], src);
        assert_eq!(px[3], 255);
    }
}

#[test]
fn mismatched_frames_are_resampled() {
    let (mut bridge, _bus) = setup_test();
    assert!(bridge.setup(true, true, SMALL));
    let mut half = Pixels::allocate(32, 16, 4);
    for y in 0..16 {
        for x in 0..32 {
            let start = ((y * 32 + x) * 4) as usize;
            let value = if x < 16 { [0, 0, 255, 255] } else { [0, 255, 0, 255] };
            half.data_mut()[start..start + 4].copy_from_slice(&value);
        }
    }
    assert!(bridge.submit_frame(&half));
    bridge.update();
    let mut out = Pixels::new();
    assert!(bridge.get_latest_frame(&mut out));
    assert_eq!((out.width(), out.height()), (64, 32));
    assert_eq!(out.pixel(0, 0), Some(&[0, 0, 255, 255][..]));
    assert_eq!(out.pixel(63, 31), Some(&[0, 255, 0, 255][..]));
}

#[test]
fn unusable_frames_are_rejected() {
    let (mut bridge, bus) = setup_test();
    assert!(bridge.setup(true, false, SMALL));
    assert!(!bridge.submit_frame(&Pixels::new()));
    assert!(!bridge.submit_frame(&Pixels::allocate(64, 32, 2)));
    assert_eq!(
        bridge
            .try_submit_frame(&Pixels::allocate(64, 32, 1))
            .unwrap_err()
            .category(),
        ErrorCategory::FormatMismatch
    );
    assert!(bridge.is_initialized());

    // Nothing was stored, so the bus sees black.
    bridge.update();
    let data = bus.last_publish_buffer().unwrap().data.unwrap();
    assert!(data.iter().all(|&b| b == 0));
}

#[test]
fn frame_operations_need_an_enabled_direction() {
    let (mut bridge, _bus) = setup_test();
    let red = solid(64, 32, [255, 0, 0, 255]);
    let mut out = Pixels::new();
    assert!(!bridge.submit_frame(&red));
    assert!(!bridge.get_latest_frame(&mut out));
    assert_eq!(
        bridge.try_submit_frame(&red).unwrap_err().category(),
        ErrorCategory::NotReady
    );

    assert!(bridge.setup(false, true, SMALL));
    assert!(!bridge.submit_frame(&red));
    bridge.shutdown();

    assert!(bridge.setup(true, false, SMALL));
    bridge.update();
    assert!(!bridge.get_latest_frame(&mut out));
    assert!(bridge.try_get_latest_frame(&mut out).is_err());
}

#[test]
fn latest_frame_is_exact_and_not_consumed() {
    let (mut bridge, bus) = setup_test();
    bus.set_format_override(Direction::Capture, PixelFormat::Rgba);
    assert!(bridge.setup(false, true, SMALL));

    let mut out = Pixels::new();
    assert!(!bridge.get_latest_frame(&mut out));
    bridge.update();
    assert!(!bridge.get_latest_frame(&mut out));

    let first: Vec<u8> = (0..64 * 32 * 4).map(|i| (i * 7 % 256) as u8).collect();
    bus.inject_capture_buffer(LoopbackBuffer::new(first.clone(), 64 * 4));
    bridge.update();
    assert!(bridge.get_latest_frame(&mut out));
    assert_eq!(out.data(), &first[..]);

    let mut again = Pixels::new();
    assert!(bridge.get_latest_frame(&mut again));
    assert_eq!(again, out);

    let second: Vec<u8> = first.iter().map(|b| b.wrapping_add(1)).collect();
    bus.inject_capture_buffer(LoopbackBuffer::new(second.clone(), 0));
    bridge.update();
    assert!(bridge.get_latest_frame(&mut out));
    assert_eq!(out.data(), &second[..]);
}

#[test]
fn malformed_capture_buffers_are_ignored() {
    let (mut bridge, bus) = setup_test();
    assert!(bridge.setup(false, true, SMALL));
    bridge.update();

    bus.inject_capture_buffer(LoopbackBuffer {
        chunk: None,
        data: Some(vec![0xFF; 64 * 32 * 4]),
    });
    bus.inject_capture_buffer(LoopbackBuffer {
        chunk: LoopbackBuffer::new(Vec::new(), 256).chunk,
        data: None,
    });
    bus.inject_capture_buffer(LoopbackBuffer::new(vec![0xFF; 100], 256));
    bridge.update();

    let mut out = Pixels::new();
    assert!(!bridge.get_latest_frame(&mut out));
    assert!(bridge.is_initialized());
}

#[test]
fn renegotiation_switches_layout() {
    let (mut bridge, bus) = setup_test();
    assert!(bridge.setup(true, true, SMALL));
    bridge.update();
    assert_eq!(
        bridge.negotiated_format(Direction::Publish).unwrap().format,
        PixelFormat::Rgbx
    );

    assert!(bus.renegotiate(Direction::Publish, accepted(PixelFormat::Bgra, SMALL)));
    assert!(bus.renegotiate(Direction::Capture, accepted(PixelFormat::Bgra, SMALL)));
    bridge.update();
    assert_eq!(
        bridge.negotiated_format(Direction::Publish).unwrap().format,
        PixelFormat::Bgra
    );

    assert!(bridge.submit_frame(&solid(64, 32, [255, 0, 0, 128])));
    bridge.update();
    let data = bus.last_publish_buffer().unwrap().data.unwrap();
    assert_eq!(&data[..4], &[0, 0, 255, 128]);

    let mut out = Pixels::new();
    assert!(bridge.get_latest_frame(&mut out));
    assert_eq!(out.pixel(5, 5), Some(&[255, 0, 0, 128][..]));
}

#[test]
fn renegotiated_size_reallocates() {
    let (mut bridge, bus) = setup_test();
    assert!(bridge.setup(true, true, SMALL));
    bridge.update();
    let larger = VideoConfig::new(128, 64, 30);
    bus.renegotiate(Direction::Publish, accepted(PixelFormat::Rgbx, larger));
    bus.renegotiate(Direction::Capture, accepted(PixelFormat::Rgbx, larger));
    bridge.update();

    assert!(bridge.submit_frame(&solid(64, 32, [1, 2, 3, 255])));
    bridge.update();
    let mut out = Pixels::new();
    assert!(bridge.get_latest_frame(&mut out));
    assert_eq!((out.width(), out.height()), (128, 64));
    assert_eq!(out.pixel(127, 63), Some(&[1, 2, 3, 255][..]));
}

#[test]
fn stored_frame_survives_size_renegotiation() {
    let (mut bridge, bus) = setup_test();
    assert!(bridge.setup(true, true, SMALL));
    assert!(bridge.submit_frame(&solid(64, 32, [200, 100, 50, 255])));
    bridge.update();
    let before = bus.last_publish_buffer().unwrap().data.unwrap();
    assert_eq!(&before[..4], &[200, 100, 50, 255]);

    let larger = VideoConfig::new(128, 64, 30);
    assert!(bus.renegotiate(Direction::Publish, accepted(PixelFormat::Rgbx, larger)));
    assert!(bus.renegotiate(Direction::Capture, accepted(PixelFormat::Rgbx, larger)));
    bridge.update();
    bridge.update();

    let buffer = bus.last_publish_buffer().unwrap();
    assert_eq!(buffer.chunk.unwrap().size, 128 * 64 * 4);
    let data = buffer.data.unwrap();
    assert!(data.chunks_exact(4).all(|px| px == [200u8, 100, 50, 255]));

    let mut out = Pixels::new();
    assert!(bridge.get_latest_frame(&mut out));
    assert_eq!((out.width(), out.height()), (128, 64));
    assert_eq!(out.pixel(127, 63), Some(&[200, 100, 50, 255][..]));
}

#[test]
fn padded_stride_is_honored() {
    let (mut bridge, bus) = setup_test();
    bus.set_stride_padding(64);
    assert!(bridge.setup(true, true, SMALL));
    assert!(bridge.submit_frame(&solid(64, 32, [9, 8, 7, 255])));
    bridge.update();

    let negotiated = bridge.negotiated_format(Direction::Publish).unwrap();
    assert_eq!(negotiated.stride, 64 * 4 + 64);

    let buffer = bus.last_publish_buffer().unwrap();
    let chunk = buffer.chunk.unwrap();
    assert_eq!(chunk.offset, 0);
    assert_eq!(chunk.stride, 320);
    assert_eq!(chunk.size, 320 * 32);
    let data = buffer.data.unwrap();
    assert_eq!(&data[320..324], &[9, 8, 7, 255]);

    let mut out = Pixels::new();
    assert!(bridge.get_latest_frame(&mut out));
    assert!(out.data().chunks_exact(4).all(|px| px == [9u8, 8, 7, 255]));
}

#[test]
fn stream_states_are_reported() {
    let (mut bridge, _bus) = setup_test();
    assert!(bridge.stream_state(Direction::Publish).is_none());
    assert!(bridge.setup(true, false, SMALL));
    assert_eq!(
        bridge.stream_state(Direction::Publish),
        Some(StreamState::Connecting)
    );
    bridge.update();
    assert_eq!(
        bridge.stream_state(Direction::Publish),
        Some(StreamState::Streaming)
    );
    assert!(bridge.stream_state(Direction::Capture).is_none());
}

#[test]
fn stream_properties_carry_names_and_targets() {
    let (mut bridge, bus) = setup_test();
    bridge.set_app_name("Studio");
    bridge.set_node_name("studio-out");
    bridge.set_publish_target_object_serial("42");
    bridge.set_capture_target_node_name("v4l2_input.cam");
    assert!(bridge.setup(true, true, SMALL));

    let publish = bus.stream_properties(Direction::Publish).unwrap();
    let expected = BTreeMap::from([
        ("application.name", "Studio"),
        ("media.category", "Capture"),
        ("media.role", "Screen"),
        ("media.type", "Video"),
        ("node.name", "studio-out"),
        ("target.object", "42"),
    ]);
    assert_eq!(
        publish
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<BTreeMap<_, _>>(),
        expected
    );

    let capture = bus.stream_properties(Direction::Capture).unwrap();
    assert_eq!(capture["target.object"], "v4l2_input.cam");
    assert_eq!(capture["media.category"], "Playback");

    let names: Vec<String> = bus.requests().into_iter().map(|r| r.name).collect();
    assert_eq!(names, ["studio-out Publish", "studio-out Capture"]);
}

#[test]
fn retargeting_takes_effect_on_reconnect() {
    let (mut bridge, bus) = setup_test();
    assert!(!bridge.reconnect());
    assert!(bridge.setup(false, true, SMALL));
    assert!(!bus.stream_properties(Direction::Capture).unwrap().contains_key("target.object"));

    bridge.set_capture_target_object_serial("77");
    bridge.update();
    assert_eq!(bus.requests().len(), 1);

    assert!(bridge.reconnect());
    assert!(bridge.is_initialized());
    assert_eq!(bus.requests().len(), 2);
    assert_eq!(
        bus.stream_properties(Direction::Capture).unwrap()["target.object"],
        "77"
    );
    assert_eq!(bridge.negotiated_format(Direction::Capture).unwrap().width, 64);
}

#[test]
fn setup_from_json_config() {
    let (mut bridge, bus) = setup_test();
    let config = BridgeConfig::from_json_str(
        r#"{
            "app_name": "Studio",
            "node_name": "Studio",
            "preferred_formats": ["BGRA", "RGBA"],
            "publish": true,
            "video": {"width": 64, "height": 32, "fps": 25}
        }"#,
    )
    .unwrap();
    assert!(bridge.setup_from_config(&config));
    bridge.update();

    let negotiated = bridge.negotiated_format(Direction::Publish).unwrap();
    assert_eq!(negotiated.format, PixelFormat::Bgra);
    assert_eq!(negotiated.frame_rate, 25);
    assert!(bridge.negotiated_format(Direction::Capture).is_none());
    assert_eq!(bus.requests()[0].name, "Studio Publish");
}

#[test]
fn empty_format_preference_is_ignored() {
    let (mut bridge, _bus) = setup_test();
    bridge.set_preferred_video_formats(&[PixelFormat::Bgrx]);
    bridge.set_preferred_video_formats(&[]);
    assert_eq!(bridge.preferred_video_formats(), &[PixelFormat::Bgrx]);
}

#[test]
fn pump_and_application_on_separate_threads() {
    let (mut bridge, _bus) = setup_test();
    assert!(bridge.setup(true, true, SMALL));
    let bridge = &bridge;

    std::thread::scope(|scope| {
        scope.spawn(move || {
            for _ in 0..200 {
                bridge.update();
                std::thread::yield_now();
            }
        });
        scope.spawn(move || {
            let mut out = Pixels::new();
            for i in 0..200u32 {
                let shade = (i % 256) as u8;
                assert!(bridge.submit_frame(&solid(64, 32, [shade, 255 - shade, 0, 255])));
                if bridge.get_latest_frame(&mut out) {
                    // A frame is never observed half-written.
                    let first = out.pixel(0, 0).unwrap().to_vec();
                    assert!(out.data().chunks_exact(4).all(|px| px == first.as_slice()));
                }
                std::thread::yield_now();
            }
        });
    });

    assert!(bridge.submit_frame(&solid(64, 32, [1, 2, 3, 255])));
    bridge.update();
    let mut out = Pixels::new();
    assert!(bridge.get_latest_frame(&mut out));
    assert_eq!(out.pixel(10, 10), Some(&[1, 2, 3, 255][..]));
}
