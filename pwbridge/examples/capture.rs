// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Captures from the first video node that shows up on the PipeWire bus.
//!
//! The capture stream starts untargeted. Once a video source is discovered
//! the bridge is retargeted at it, which takes a full reconnect.

mod common;

use std::time::{Duration, Instant};

use clap::Parser;
use pwbridge::{Bridge, Direction, PipeWireBackend, Pixels, VideoConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Requested frame width in pixels.
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Requested frame height in pixels.
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Requested frames per second.
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Node name of this application's stream.
    #[arg(long, default_value = "pwbridge-capture")]
    node_name: String,

    /// How long to run, in seconds.
    #[arg(long, default_value_t = 10)]
    seconds: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::setup_logging();
    let args = Args::parse();

    let mut bridge = Bridge::new(PipeWireBackend::new());
    bridge.set_app_name("pwbridge capture example");
    bridge.set_node_name(args.node_name.clone());
    bridge.try_setup(false, true, VideoConfig::new(args.width, args.height, args.fps))?;

    let tick = Duration::from_millis(1000 / u64::from(args.fps.max(1)));
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut targeted = false;
    let mut frames = 0u64;
    let mut pixels = Pixels::new();

    while Instant::now() < deadline {
        bridge.update();

        if !targeted {
            let source = bridge
                .get_video_nodes()
                .into_iter()
                .find(|node| node.media_class.contains("Source") && node.name != args.node_name);
            if let Some(node) = source {
                info!(id = node.id, name = %node.name, description = %node.description, "Retargeting");
                match node.serial.clone() {
                    Some(serial) => bridge.set_capture_target_object_serial(serial),
                    None => bridge.set_capture_target_node_name(node.name.clone()),
                }
                if !bridge.reconnect() {
                    return Err("reconnect failed".into());
                }
                targeted = true;
            }
        }

        if bridge.get_latest_frame(&mut pixels) {
            frames += 1;
            if frames % 30 == 1 {
                info!(
                    frames,
                    width = pixels.width(),
                    height = pixels.height(),
                    center = ?pixels.pixel(pixels.width() / 2, pixels.height() / 2),
                    state = ?bridge.stream_state(Direction::Capture),
                    "Frame"
                );
            }
        }
        std::thread::sleep(tick);
    }

    println!("polled {frames} frame(s)");
    bridge.shutdown();
    Ok(())
}
