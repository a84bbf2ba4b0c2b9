//! Transform process
//!
//! Reads the raw channel as a fixed consumer index, transforms every frame
//! and publishes the result into its own channel.
//!
//!   cargo run --example transform -- --kind invert   # index 0 -> CircleDetectionFrame
//!   cargo run --example transform -- --kind motion   # index 1 -> OpticalFlowFrame

#[path = "common/mod.rs"]
mod common;

use clap::{Parser, ValueEnum};
use frame_bus::config::{
    raw_channel_config, transform_channel_config, CIRCLE_CHANNEL, CIRCLE_DETECT_INDEX,
    FLOW_CHANNEL, OPTICAL_FLOW_INDEX, RAW_CHANNEL,
};
use frame_bus::{ConsumerChannel, FrameTransform, ProducerChannel, Result, StopSignal, TransformStage};

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum Kind {
    /// Negative image, in the circle detector's slot
    Invert,
    /// Frame difference, in the optical flow slot
    Motion,
}

impl Kind {
    fn default_index(self) -> usize {
        match self {
            Kind::Invert => CIRCLE_DETECT_INDEX,
            Kind::Motion => OPTICAL_FLOW_INDEX,
        }
    }

    fn default_output(self) -> &'static str {
        match self {
            Kind::Invert => CIRCLE_CHANNEL,
            Kind::Motion => FLOW_CHANNEL,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "transform")]
#[command(about = "Transform raw frames into a derived channel", long_about = None)]
struct Cli {
    /// Transform to run
    #[arg(short, long, value_enum)]
    kind: Kind,

    /// Channel to read
    #[arg(long, default_value = RAW_CHANNEL)]
    input: String,

    /// Consumer index on the input channel (default depends on kind)
    #[arg(long)]
    index: Option<usize>,

    /// Channel to create (default depends on kind)
    #[arg(long)]
    output: Option<String>,
}

fn setup(args: &Cli) -> Result<(ConsumerChannel, ProducerChannel)> {
    let output_name = args.output.as_deref().unwrap_or(args.kind.default_output());
    let output = ProducerChannel::create(output_name, transform_channel_config())?;
    let index = args.index.unwrap_or(args.kind.default_index());
    let input = ConsumerChannel::open_as(&args.input, index, raw_channel_config())?;
    Ok((input, output))
}

fn run<T: FrameTransform>(transform: T, input: ConsumerChannel, output: ProducerChannel, stop: StopSignal) {
    match TransformStage::new(transform, input, output, stop).run() {
        Ok(report) => tracing::info!(frames = report.frames, fps = report.fps, "transform finished"),
        Err(e) => {
            tracing::error!(error = %e, "transform failed");
            std::process::exit(1);
        }
    }
}

fn main() {
    common::init_logging();
    let args = Cli::parse();
    let stop = common::stop_on_ctrlc();

    let (input, output) = match setup(&args) {
        Ok(channels) => channels,
        Err(e) => {
            tracing::error!(error = %e, "failed to set up channels");
            std::process::exit(1);
        }
    };

    match args.kind {
        Kind::Invert => run(common::Invert, input, output, stop),
        Kind::Motion => run(common::Motion::default(), input, output, stop),
    }
}
