//! Whole pipeline in one process
//!
//! Runs capture, both transforms and the viewer as threads, each with its
//! own channel handles, exactly as the separate processes would. Stops
//! after `--frames` captured frames or on Ctrl+C; closing the raw channel
//! cascades down the pipeline.

#[path = "common/mod.rs"]
mod common;

use clap::Parser;
use frame_bus::config::{
    raw_channel_config, transform_channel_config, CIRCLE_CHANNEL, CIRCLE_DETECT_INDEX,
    FLOW_CHANNEL, OPTICAL_FLOW_INDEX, RAW_CHANNEL, VIEWER_INDEX,
};
use frame_bus::{
    ConsumerChannel, FrameTransform, ProducerChannel, Result, SinkStage, SourceStage, StageReport,
    StopSignal, TransformStage,
};
use std::thread;

#[derive(Parser, Debug)]
#[command(name = "pipeline")]
#[command(about = "Run capture, transforms and viewer in one process", long_about = None)]
struct Cli {
    /// Frames to capture
    #[arg(long, default_value = "300")]
    frames: u64,

    /// Capture rate
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Log every Nth viewer cycle
    #[arg(long, default_value = "30")]
    every: u64,
}

fn transform<T>(
    transform: T,
    index: usize,
    output: &'static str,
    stop: StopSignal,
) -> thread::JoinHandle<Result<StageReport>>
where
    T: FrameTransform + Send + 'static,
{
    thread::spawn(move || {
        let output = ProducerChannel::create(output, transform_channel_config())?;
        let input = ConsumerChannel::open_as(RAW_CHANNEL, index, raw_channel_config())?;
        TransformStage::new(transform, input, output, stop).run()
    })
}

fn main() {
    common::init_logging();
    let args = Cli::parse();
    let stop = common::stop_on_ctrlc();

    let output = match ProducerChannel::create(RAW_CHANNEL, raw_channel_config()) {
        Ok(channel) => channel,
        Err(e) => {
            tracing::error!(error = %e, "failed to create raw channel");
            std::process::exit(1);
        }
    };

    let stages = vec![
        ("invert", transform(common::Invert, CIRCLE_DETECT_INDEX, CIRCLE_CHANNEL, stop.clone())),
        (
            "motion",
            transform(common::Motion::default(), OPTICAL_FLOW_INDEX, FLOW_CHANNEL, stop.clone()),
        ),
        ("viewer", {
            let stop = stop.clone();
            let every = args.every;
            thread::spawn(move || {
                let inputs = vec![
                    ConsumerChannel::open_as(RAW_CHANNEL, VIEWER_INDEX, raw_channel_config())?,
                    ConsumerChannel::open(CIRCLE_CHANNEL, transform_channel_config())?,
                    ConsumerChannel::open(FLOW_CHANNEL, transform_channel_config())?,
                ];
                SinkStage::new(common::LogSink::new(every, None), inputs, stop).run()
            })
        }),
    ];

    let source = common::TestPattern::new(args.fps, Some(args.frames));
    let mut failed = false;
    match SourceStage::new(source, output, stop.clone()).run() {
        Ok(report) => tracing::info!(stage = "capture", frames = report.frames, "stage finished"),
        Err(e) => {
            tracing::error!(stage = "capture", error = %e, "stage failed");
            failed = true;
        }
    }
    // Anything still parked stops at its next wait slice
    stop.stop();

    for (name, handle) in stages {
        match handle.join() {
            Ok(Ok(report)) => tracing::info!(stage = name, frames = report.frames, "stage finished"),
            Ok(Err(e)) => {
                tracing::error!(stage = name, error = %e, "stage failed");
                failed = true;
            }
            Err(_) => {
                tracing::error!(stage = name, "stage panicked");
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
}
