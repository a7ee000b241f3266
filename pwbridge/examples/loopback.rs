// SPDX-FileCopyrightText: 2025 Contributors to the pwbridge project.
// SPDX-License-Identifier: Apache-2.0

//! Publishes a color ramp on the simulated bus and reads it back through the
//! capture stream.

mod common;

use clap::Parser;
use pwbridge::{Bridge, BridgeConfig, Direction, LoopbackBus, PixelFormat, Pixels, VideoConfig};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Frame width in pixels.
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Frame height in pixels.
    #[arg(long, default_value_t = 360)]
    height: u32,

    /// Frames per second.
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Pixel format the bus should pick (RGBx, RGBA, BGRx or BGRA).
    #[arg(long)]
    format: Option<PixelFormat>,

    /// Number of frames to push through the bus.
    #[arg(long, default_value_t = 3)]
    frames: u32,

    /// JSON bridge configuration; overrides the size options.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::setup_logging();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)?,
        None => BridgeConfig {
            video: VideoConfig::new(args.width, args.height, args.fps),
            ..BridgeConfig::default()
        },
    };
    config.publish = true;
    config.capture = true;

    let bus = LoopbackBus::new();
    if let Some(format) = args.format {
        bus.set_format_override(Direction::Publish, format);
        bus.set_format_override(Direction::Capture, format);
    }

    let mut bridge = Bridge::new(bus);
    if !bridge.setup_from_config(&config) {
        return Err("bridge setup failed".into());
    }

    let video = config.video;
    let mut frame = Pixels::allocate(video.width, video.height, 4);
    let mut received = Pixels::new();
    for index in 0..args.frames {
        let shade = (index * 255 / args.frames.max(1)) as u8;
        frame.fill(&[255, shade, 0, 255]);
        bridge.submit_frame(&frame);
        bridge.update();

        if bridge.get_latest_frame(&mut received) {
            let pixel = received.pixel(0, 0).unwrap_or_default();
            info!(index, ?pixel, "Captured frame");
        } else {
            warn!(index, "No frame captured yet");
        }
    }

    if let Some(negotiated) = bridge.negotiated_format(Direction::Capture) {
        println!(
            "negotiated {} {}x{} @ {} fps, stride {}",
            negotiated.format,
            negotiated.width,
            negotiated.height,
            negotiated.frame_rate,
            negotiated.stride
        );
    }
    bridge.shutdown();
    Ok(())
}
