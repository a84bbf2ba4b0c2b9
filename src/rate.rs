//! Frames-per-second meter

use std::time::{Duration, Instant};

/// Window after which the rate is recomputed
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Counts frames and reports the rate over the last completed window
#[derive(Debug, Clone)]
pub struct FrameRater {
    fps: f64,
    frames: u32,
    window_start: Instant,
}

impl Default for FrameRater {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRater {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(now: Instant) -> Self {
        Self {
            fps: 0.0,
            frames: 0,
            window_start: now,
        }
    }

    /// Record one frame
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    fn update_at(&mut self, now: Instant) {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed > RATE_WINDOW {
            self.fps = f64::from(self.frames) / elapsed.as_secs_f64();
            self.frames = 0;
            self.window_start = now;
        }
    }

    /// Rate over the last completed window, 0 until one has completed
    #[inline]
    pub fn fps(&self) -> f64 {
        self.fps
    }
}
