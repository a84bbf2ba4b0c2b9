//! Stop requests and wait policies for blocking protocol calls

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default slice length for cancellable waits
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cloneable stop flag shared between a stage and whoever stops it
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder of this signal to stop
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How long the next condition wait may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitSlice {
    /// Block until notified
    Forever,
    /// Block at most this long, then re-check
    For(Duration),
    /// The overall timeout has elapsed
    Expired,
}

/// Bounds on a blocking `publish` or `consume`
///
/// Without a timeout or stop signal the wait is indefinite. With either,
/// the wait is split into `poll_interval` slices so a stop request or the
/// deadline is noticed while still parked.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    pub timeout: Option<Duration>,
    pub stop: Option<StopSignal>,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            stop: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WaitPolicy {
    /// Wait without limit
    pub fn indefinite() -> Self {
        Self::default()
    }

    /// Wait at most `timeout`
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(StopSignal::is_stopped)
    }

    pub(crate) fn next_slice(&self, elapsed: Duration) -> WaitSlice {
        let poll = self.poll_interval.max(Duration::from_millis(1));
        match self.timeout {
            Some(timeout) => match timeout.checked_sub(elapsed) {
                Some(remaining) if !remaining.is_zero() => WaitSlice::For(remaining.min(poll)),
                _ => WaitSlice::Expired,
            },
            None if self.stop.is_some() => WaitSlice::For(poll),
            None => WaitSlice::Forever,
        }
    }
}
