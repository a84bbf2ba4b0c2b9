//! Pieces shared by the demo processes: logging setup, Ctrl+C handling,
//! a synthetic camera, two simple transforms and a logging viewer.

#![allow(dead_code)]

use frame_bus::{Frame, FrameBusError, FrameSink, FrameSource, FrameTransform, Result, StopSignal};
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Log to stderr, filtered by `RUST_LOG` (default `info`)
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}

/// Stop signal fired by Ctrl+C
pub fn stop_on_ctrlc() -> StopSignal {
    let stop = StopSignal::new();
    let handler = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || handler.stop()) {
        tracing::warn!(error = %e, "could not install Ctrl+C handler");
    }
    stop
}

/// Synthetic camera: a gradient with a disc sweeping across it
pub struct TestPattern {
    tick: u64,
    limit: Option<u64>,
    interval: Duration,
    next_due: Instant,
}

impl TestPattern {
    pub fn new(fps: u32, limit: Option<u64>) -> Self {
        Self {
            tick: 0,
            limit,
            interval: Duration::from_secs(1) / fps.max(1),
            next_due: Instant::now(),
        }
    }
}

impl FrameSource for TestPattern {
    fn capture(&mut self, frame: &mut Frame) -> Result<ControlFlow<()>> {
        if self.limit.is_some_and(|limit| self.tick >= limit) {
            return Ok(ControlFlow::Break(()));
        }

        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due += self.interval;

        let geometry = frame.geometry();
        let (w, h) = (geometry.width, geometry.height);
        let radius = (h / 8).max(1) as i64;
        let cx = ((self.tick * 8) % u64::from(w)) as i64;
        let cy = i64::from(h / 2);
        let shade = (self.tick % 256) as u8;

        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = (i64::from(x) - cx, i64::from(y) - cy);
                let inside = dx * dx + dy * dy <= radius * radius;
                let color = if inside {
                    [255, 0, 255]
                } else {
                    [(x * 255 / w) as u8, (y * 255 / h) as u8, shade]
                };
                if let Some(pixel) = frame.pixel_mut(x, y) {
                    for (byte, value) in pixel.iter_mut().zip(color.iter().cycle()) {
                        *byte = *value;
                    }
                }
            }
        }

        self.tick += 1;
        Ok(ControlFlow::Continue(()))
    }
}

/// Photographic negative
pub struct Invert;

impl FrameTransform for Invert {
    fn apply(&mut self, input: &Frame, output: &mut Frame) -> bool {
        for (o, i) in output.as_bytes_mut().iter_mut().zip(input.as_bytes()) {
            *o = 255 - i;
        }
        true
    }
}

/// Per-pixel absolute difference to the previous frame
///
/// Needs two inputs before its first output.
#[derive(Default)]
pub struct Motion {
    previous: Option<Frame>,
}

impl FrameTransform for Motion {
    fn apply(&mut self, input: &Frame, output: &mut Frame) -> bool {
        let produced = match &self.previous {
            Some(prev) => {
                for ((o, i), p) in output
                    .as_bytes_mut()
                    .iter_mut()
                    .zip(input.as_bytes())
                    .zip(prev.as_bytes())
                {
                    *o = i.abs_diff(*p);
                }
                true
            }
            None => false,
        };
        match &mut self.previous {
            Some(prev) => prev.as_bytes_mut().copy_from_slice(input.as_bytes()),
            None => self.previous = Some(input.clone()),
        }
        produced
    }
}

/// Stands in for a display window: logs what it would show
pub struct LogSink {
    every: u64,
    shown: u64,
    limit: Option<u64>,
}

impl LogSink {
    pub fn new(every: u64, limit: Option<u64>) -> Self {
        Self {
            every: every.max(1),
            shown: 0,
            limit,
        }
    }
}

impl FrameSink for LogSink {
    fn present(&mut self, frames: &[(&str, &Frame)]) -> Result<ControlFlow<()>> {
        if frames.is_empty() {
            return Err(FrameBusError::Sink("no input channels to show".into()));
        }
        self.shown += 1;
        if self.shown % self.every == 0 {
            for (name, frame) in frames {
                let bytes = frame.as_bytes();
                let mean = bytes.iter().map(|&b| u64::from(b)).sum::<u64>() / bytes.len().max(1) as u64;
                tracing::info!(channel = %name, sequence = frame.sequence(), mean, "frame");
            }
        }
        if self.limit.is_some_and(|limit| self.shown >= limit) {
            return Ok(ControlFlow::Break(()));
        }
        Ok(ControlFlow::Continue(()))
    }
}
