//! Single-slot broadcast protocol with a completion barrier
//!
//! One producer installs frames into a single slot; each of the N
//! registered consumers copies every installed frame out exactly once.
//! The producer may only overwrite the slot after all N consumers have
//! read it, so a slow consumer stalls the producer instead of missing
//! frames.
//!
//! # Cycle
//! - `publish`: wait until `consumed_count == N`, copy into the slot,
//!   mark every index pending, reset the count, broadcast `frame_ready`.
//! - `consume(i)`: wait until `pending[i]`, copy out of the slot, clear
//!   `pending[i]`, bump the count, signal `frame_done` when it reaches N.
//!
//! All state, including the slot bytes, is touched only under the header
//! mutex, so a reader never sees a torn frame.

use crate::error::{FrameBusError, Result};
use crate::layout::FrameBufferHeader;
use crate::sync::{ShmCondvar, ShmMutexGuard};
use crate::wait::{WaitPolicy, WaitSlice};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Point-in-time view of the barrier, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusState {
    /// Sequence number of the installed frame, 0 before the first publish
    pub sequence: u64,
    pub consumed_count: usize,
    pub consumers: usize,
    /// `pending[i]` is true while consumer `i` has not read the installed frame
    pub pending: Vec<bool>,
}

impl BusState {
    /// Whether a publish right now would go through without waiting
    pub fn drained(&self) -> bool {
        self.consumed_count == self.consumers
    }
}

/// Protocol operations over an initialized [`FrameBufferHeader`] and its slot
pub struct FrameBus {
    header: NonNull<FrameBufferHeader>,
    slot: NonNull<u8>,
}

// SAFETY: every access to shared state goes through the process-shared
// mutex in the header
unsafe impl Send for FrameBus {}
unsafe impl Sync for FrameBus {}

impl FrameBus {
    /// Create protocol handle from raw pointers
    ///
    /// # Safety
    /// - `header` must point to an initialized header that outlives the handle
    /// - `slot` must point to `header.slot_len()` writable bytes
    pub unsafe fn from_raw(header: NonNull<FrameBufferHeader>, slot: NonNull<u8>) -> Self {
        Self { header, slot }
    }

    #[inline(always)]
    pub fn header(&self) -> &FrameBufferHeader {
        unsafe { self.header.as_ref() }
    }

    /// Install `data` as the next frame
    ///
    /// Blocks while any registered consumer has not read the current frame.
    /// Returns the new frame's sequence number. A wait that outlives
    /// `policy.timeout` fails with [`FrameBusError::Stalled`].
    pub fn publish(&self, data: &[u8], policy: &WaitPolicy) -> Result<u64> {
        let header = self.header();
        let slot_len = header.slot_len();
        if data.len() != slot_len {
            return Err(FrameBusError::SizeMismatch {
                expected: slot_len,
                got: data.len(),
            });
        }

        let consumers = header.consumers();
        let mut guard = header.mutex.lock()?;

        // Backpressure gate
        self.wait_until(
            &header.frame_done,
            &mut guard,
            policy,
            false,
            || header.consumed_count.load(Ordering::Relaxed) as usize == consumers,
            |waited| {
                let pending = header.pending_indices();
                tracing::warn!(?pending, ?waited, "producer stalled on consumer barrier");
                FrameBusError::Stalled { pending, waited }
            },
        )?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.slot.as_ptr(), slot_len);
        }

        for pending in &header.pending[..consumers] {
            pending.store(true, Ordering::Relaxed);
        }
        header.consumed_count.store(0, Ordering::Relaxed);
        let sequence = header.sequence.load(Ordering::Relaxed) + 1;
        header.sequence.store(sequence, Ordering::Relaxed);

        header.frame_ready.notify_all()?;
        drop(guard);

        tracing::trace!(sequence, "frame published");
        Ok(sequence)
    }

    /// Copy the installed frame into `buf` as consumer `index`
    ///
    /// Blocks until a frame this consumer has not read yet is installed.
    /// Returns the frame's sequence number.
    pub fn consume_into(&self, index: usize, buf: &mut [u8], policy: &WaitPolicy) -> Result<u64> {
        let header = self.header();
        let consumers = header.consumers();
        if index >= consumers {
            return Err(FrameBusError::InvalidConsumerIndex { index, consumers });
        }
        let slot_len = header.slot_len();
        if buf.len() != slot_len {
            return Err(FrameBusError::SizeMismatch {
                expected: slot_len,
                got: buf.len(),
            });
        }

        let mut guard = header.mutex.lock()?;

        self.wait_until(
            &header.frame_ready,
            &mut guard,
            policy,
            true,
            || header.pending[index].load(Ordering::Relaxed),
            |waited| FrameBusError::Timeout { waited },
        )?;

        unsafe {
            std::ptr::copy_nonoverlapping(self.slot.as_ptr(), buf.as_mut_ptr(), slot_len);
        }

        header.pending[index].store(false, Ordering::Relaxed);
        let consumed = header.consumed_count.load(Ordering::Relaxed) + 1;
        header.consumed_count.store(consumed, Ordering::Relaxed);
        if consumed as usize == consumers {
            header.frame_done.notify_one()?;
        }
        let sequence = header.sequence.load(Ordering::Relaxed);
        drop(guard);

        tracing::trace!(index, sequence, "frame consumed");
        Ok(sequence)
    }

    /// Snapshot the barrier state
    pub fn state(&self) -> Result<BusState> {
        let header = self.header();
        let consumers = header.consumers();
        let _guard = header.mutex.lock()?;
        Ok(BusState {
            sequence: header.sequence.load(Ordering::Relaxed),
            consumed_count: header.consumed_count.load(Ordering::Relaxed) as usize,
            consumers,
            pending: header.pending[..consumers]
                .iter()
                .map(|p| p.load(Ordering::Relaxed))
                .collect(),
        })
    }

    /// Mark the channel closed and wake every waiter
    pub fn close(&self) -> Result<()> {
        let header = self.header();
        let _guard = header.mutex.lock()?;
        header.mark_closed();
        header.frame_ready.notify_all()?;
        header.frame_done.notify_all()
    }

    /// Block on `cond` until `ready` holds, honoring `policy`
    ///
    /// `stop_on_close` makes a closed channel end the wait; only consumers
    /// care, since the producer is the one closing.
    fn wait_until<R, E>(
        &self,
        cond: &ShmCondvar,
        guard: &mut ShmMutexGuard<'_>,
        policy: &WaitPolicy,
        stop_on_close: bool,
        mut ready: R,
        on_timeout: E,
    ) -> Result<()>
    where
        R: FnMut() -> bool,
        E: FnOnce(Duration) -> FrameBusError,
    {
        let start = Instant::now();
        while !ready() {
            if stop_on_close && self.header().is_closed() {
                return Err(FrameBusError::Closed);
            }
            if policy.is_stopped() {
                return Err(FrameBusError::Cancelled);
            }
            match policy.next_slice(start.elapsed()) {
                WaitSlice::Forever => cond.wait(guard)?,
                WaitSlice::For(slice) => {
                    cond.wait_timeout(guard, slice)?;
                }
                WaitSlice::Expired => return Err(on_timeout(start.elapsed())),
            }
        }
        Ok(())
    }
}
