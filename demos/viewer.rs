//! Viewer process (Sink stage)
//!
//! Reads the raw channel as the viewer's consumer index plus both transform
//! outputs, and logs what a display window would show.

#[path = "common/mod.rs"]
mod common;

use clap::Parser;
use frame_bus::config::{
    raw_channel_config, transform_channel_config, CIRCLE_CHANNEL, FLOW_CHANNEL, RAW_CHANNEL,
    VIEWER_INDEX,
};
use frame_bus::{ConsumerChannel, Result, SinkStage};

#[derive(Parser, Debug)]
#[command(name = "viewer")]
#[command(about = "Show the raw and transformed frames", long_about = None)]
struct Cli {
    /// Log every Nth cycle
    #[arg(long, default_value = "30")]
    every: u64,

    /// Quit after this many cycles
    #[arg(long)]
    frames: Option<u64>,
}

fn open_inputs() -> Result<Vec<ConsumerChannel>> {
    Ok(vec![
        ConsumerChannel::open_as(RAW_CHANNEL, VIEWER_INDEX, raw_channel_config())?,
        ConsumerChannel::open(CIRCLE_CHANNEL, transform_channel_config())?,
        ConsumerChannel::open(FLOW_CHANNEL, transform_channel_config())?,
    ])
}

fn main() {
    common::init_logging();
    let args = Cli::parse();
    let stop = common::stop_on_ctrlc();

    let inputs = match open_inputs() {
        Ok(inputs) => inputs,
        Err(e) => {
            tracing::error!(error = %e, "failed to open channels");
            std::process::exit(1);
        }
    };

    let sink = common::LogSink::new(args.every, args.frames);
    match SinkStage::new(sink, inputs, stop).run() {
        Ok(report) => tracing::info!(frames = report.frames, fps = report.fps, "viewer finished"),
        Err(e) => {
            tracing::error!(error = %e, "viewer failed");
            std::process::exit(1);
        }
    }
}
