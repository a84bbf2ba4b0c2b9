//! Pipeline stages: the process roles built on top of channels
//!
//! - [`SourceStage`]: external frame source -> one producer channel
//! - [`TransformStage`]: one consumer channel -> external transform -> one producer channel
//! - [`SinkStage`]: several consumer channels -> external sink
//!
//! Each stage runs a single loop on the calling thread until its
//! [`StopSignal`] fires, the source ends, or the sink asks to quit. The
//! stop signal is attached to the stage's channels, so a stage parked
//! inside `publish` or `consume` stops too.

use crate::channel::{ConsumerChannel, ProducerChannel};
use crate::error::Result;
use crate::frame::Frame;
use crate::rate::FrameRater;
use crate::wait::StopSignal;
use std::ops::ControlFlow;

/// Produces frames (a camera, a file, a test pattern)
pub trait FrameSource {
    /// Fill `frame` with the next image, or break to end the stream
    fn capture(&mut self, frame: &mut Frame) -> Result<ControlFlow<()>>;
}

/// Turns one frame into another
pub trait FrameTransform {
    /// Write the result for `input` into `output`
    ///
    /// Returns `false` if this input produced no output (e.g. the first
    /// frame of a transform that needs two).
    fn apply(&mut self, input: &Frame, output: &mut Frame) -> bool;
}

impl<F> FrameTransform for F
where
    F: FnMut(&Frame, &mut Frame) -> bool,
{
    fn apply(&mut self, input: &Frame, output: &mut Frame) -> bool {
        self(input, output)
    }
}

/// Presents frames (a window, a recorder, a log)
pub trait FrameSink {
    /// Show one cycle's frames, one per input channel, or break to quit
    fn present(&mut self, frames: &[(&str, &Frame)]) -> Result<ControlFlow<()>>;
}

/// Outcome of a stage run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageReport {
    /// Loop iterations completed
    pub frames: u64,
    /// Rate over the last completed one-second window
    pub fps: f64,
}

/// Treat stop requests and channel teardown as a clean end of the loop
fn unless_shutdown<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_shutdown() => {
            tracing::debug!(reason = %e, "stage interrupted");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Capture loop: source -> publish
pub struct SourceStage<S> {
    source: S,
    output: ProducerChannel,
    stop: StopSignal,
}

impl<S: FrameSource> SourceStage<S> {
    pub fn new(source: S, output: ProducerChannel, stop: StopSignal) -> Self {
        Self {
            source,
            output: output.with_stop(stop.clone()),
            stop,
        }
    }

    pub fn run(&mut self) -> Result<StageReport> {
        let mut frame = Frame::new(self.output.geometry());
        let mut rater = FrameRater::new();
        let mut report = StageReport::default();

        tracing::info!(output = %self.output.name(), "source stage started");

        while !self.stop.is_stopped() {
            if self.source.capture(&mut frame)?.is_break() {
                tracing::info!("source reached end of stream");
                break;
            }
            let Some(sequence) = unless_shutdown(self.output.publish(&frame))? else {
                break;
            };

            rater.update();
            report.frames += 1;
            tracing::trace!(sequence, "captured frame published");
        }

        report.fps = rater.fps();
        tracing::info!(frames = report.frames, fps = report.fps, "source stage stopped");
        Ok(report)
    }
}

/// Transform loop: consume -> transform -> publish
pub struct TransformStage<T> {
    transform: T,
    input: ConsumerChannel,
    output: ProducerChannel,
    stop: StopSignal,
}

impl<T: FrameTransform> TransformStage<T> {
    pub fn new(
        transform: T,
        input: ConsumerChannel,
        output: ProducerChannel,
        stop: StopSignal,
    ) -> Self {
        Self {
            transform,
            input: input.with_stop(stop.clone()),
            output: output.with_stop(stop.clone()),
            stop,
        }
    }

    pub fn run(&mut self) -> Result<StageReport> {
        let mut input = Frame::new(self.input.geometry());
        let mut output = Frame::new(self.output.geometry());
        let mut rater = FrameRater::new();
        let mut report = StageReport::default();

        tracing::info!(
            input = %self.input.name(),
            index = self.input.index(),
            output = %self.output.name(),
            "transform stage started"
        );

        while !self.stop.is_stopped() {
            let Some(sequence) = unless_shutdown(self.input.consume_into(&mut input))? else {
                break;
            };

            if self.transform.apply(&input, &mut output) {
                if unless_shutdown(self.output.publish(&output))?.is_none() {
                    break;
                }
            } else {
                tracing::trace!(sequence, "transform produced no output");
            }

            rater.update();
            report.frames += 1;
        }

        report.fps = rater.fps();
        tracing::info!(frames = report.frames, fps = report.fps, "transform stage stopped");
        Ok(report)
    }
}

/// Display loop: consume every input -> present
pub struct SinkStage<K> {
    sink: K,
    inputs: Vec<ConsumerChannel>,
    stop: StopSignal,
}

impl<K: FrameSink> SinkStage<K> {
    pub fn new(sink: K, inputs: Vec<ConsumerChannel>, stop: StopSignal) -> Self {
        Self {
            sink,
            inputs: inputs
                .into_iter()
                .map(|input| input.with_stop(stop.clone()))
                .collect(),
            stop,
        }
    }

    pub fn run(&mut self) -> Result<StageReport> {
        let mut frames: Vec<Frame> = self
            .inputs
            .iter()
            .map(|input| Frame::new(input.geometry()))
            .collect();
        let mut rater = FrameRater::new();
        let mut report = StageReport::default();

        tracing::info!(inputs = self.inputs.len(), "sink stage started");

        'cycle: while !self.stop.is_stopped() {
            for (input, frame) in self.inputs.iter().zip(frames.iter_mut()) {
                if unless_shutdown(input.consume_into(frame))?.is_none() {
                    break 'cycle;
                }
            }

            let shown: Vec<(&str, &Frame)> = self
                .inputs
                .iter()
                .map(ConsumerChannel::name)
                .zip(frames.iter())
                .collect();
            let flow = self.sink.present(&shown)?;
            rater.update();
            report.frames += 1;

            if flow.is_break() {
                tracing::info!("sink requested stop");
                break;
            }
        }

        report.fps = rater.fps();
        tracing::info!(frames = report.frames, fps = report.fps, "sink stage stopped");
        Ok(report)
    }
}
