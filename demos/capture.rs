//! Capture process (Source stage)
//!
//! Creates the raw channel and publishes synthetic camera frames into it
//! until Ctrl+C. Start it first, then the transforms and the viewer:
//!
//!   cargo run --example capture
//!   cargo run --example transform -- --kind invert
//!   cargo run --example transform -- --kind motion
//!   cargo run --example viewer

#[path = "common/mod.rs"]
mod common;

use clap::Parser;
use frame_bus::config::{raw_channel_config, RAW_CHANNEL};
use frame_bus::{ProducerChannel, SourceStage};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "capture")]
#[command(about = "Publish camera frames to the raw channel", long_about = None)]
struct Cli {
    /// Channel to create
    #[arg(long, default_value = RAW_CHANNEL)]
    channel: String,

    /// Frames per second
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Seconds to wait for slow consumers before giving up (0 = forever)
    #[arg(long, default_value = "10")]
    stall_timeout: u64,
}

fn main() {
    common::init_logging();
    let args = Cli::parse();
    let stop = common::stop_on_ctrlc();

    let stall_timeout = (args.stall_timeout > 0).then(|| Duration::from_secs(args.stall_timeout));
    let config = raw_channel_config().with_stall_timeout(stall_timeout);

    let output = match ProducerChannel::create(&args.channel, config) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!(error = %e, "failed to create channel");
            std::process::exit(1);
        }
    };

    let source = common::TestPattern::new(args.fps, args.frames);
    match SourceStage::new(source, output, stop).run() {
        Ok(report) => tracing::info!(frames = report.frames, fps = report.fps, "capture finished"),
        Err(e) => {
            tracing::error!(error = %e, "capture failed");
            std::process::exit(1);
        }
    }
}
