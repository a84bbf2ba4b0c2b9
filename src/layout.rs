//! Frame buffer layout stored at the start of every channel segment
//!
//! ```text
//! +------------------------------+ 0
//! | FrameBufferHeader            |
//! |   identity + geometry        |
//! |   consumer registration      |
//! |   barrier state + sync       |
//! +------------------------------+ slot_offset (cache line aligned)
//! | frame slot                   |
//! |   width * height * channels  |
//! +------------------------------+ total_size
//! ```

use crate::error::{FrameBusError, Result};
use crate::frame::FrameGeometry;
use crate::sync::{ShmCondvar, ShmMutex};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Magic number for channel validation
const FRAME_BUS_MAGIC: u32 = 0x464D_4253; // "FMBS"
const FRAME_BUS_VERSION: u32 = 2;

/// Upper bound on consumers per channel
pub const MAX_CONSUMERS: usize = 16;

/// Cache line size
const CACHE_LINE_SIZE: usize = 64;

/// Channel lifecycle states
pub mod channel_state {
    pub const INITIALIZING: u32 = 0;
    pub const READY: u32 = 1;
    pub const CLOSED: u32 = 2;
}

#[inline]
const fn align_up(size: usize) -> usize {
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Header placed at the start of the shared segment
///
/// Identity fields are written once by the creator before `state` becomes
/// `READY`. `owners` is updated lock-free with CAS. Everything from
/// `consumed_count` on is read and written only while holding `mutex`.
#[repr(C, align(64))]
pub struct FrameBufferHeader {
    magic: u32,
    version: u32,
    state: AtomicU32,
    consumers: u32,
    geometry: FrameGeometry,
    /// Pid of the producer that initialized the segment
    creator: AtomicU32,
    slot_len: u64,
    /// Owning pid per consumer index, 0 = free
    owners: [AtomicU32; MAX_CONSUMERS],
    pub(crate) consumed_count: AtomicU32,
    pub(crate) pending: [AtomicBool; MAX_CONSUMERS],
    pub(crate) sequence: AtomicU64,
    pub(crate) mutex: ShmMutex,
    pub(crate) frame_ready: ShmCondvar,
    pub(crate) frame_done: ShmCondvar,
}

impl FrameBufferHeader {
    /// Offset of the frame slot from the segment start
    #[inline]
    pub const fn slot_offset() -> usize {
        align_up(std::mem::size_of::<FrameBufferHeader>())
    }

    /// Segment size needed for frames of `geometry`
    #[inline]
    pub const fn total_size(geometry: &FrameGeometry) -> usize {
        Self::slot_offset() + align_up(geometry.frame_len())
    }

    /// Initialize a header in place
    ///
    /// The barrier starts drained (`consumed_count == consumers`, nothing
    /// pending) so the first publish never blocks. `state` is left at
    /// `INITIALIZING`; call [`FrameBufferHeader::mark_ready`] once the
    /// handle is fully set up.
    ///
    /// # Safety
    /// `ptr` must point to zeroed, 64-byte aligned memory of at least
    /// `total_size(geometry)` bytes that nobody else is using yet
    pub unsafe fn init(ptr: *mut Self, geometry: FrameGeometry, consumers: usize) -> Result<()> {
        if consumers > MAX_CONSUMERS {
            return Err(FrameBusError::TooManyConsumers {
                max: MAX_CONSUMERS,
                got: consumers,
            });
        }
        geometry.validate()?;

        std::ptr::addr_of_mut!((*ptr).state).write(AtomicU32::new(channel_state::INITIALIZING));
        std::ptr::addr_of_mut!((*ptr).magic).write(FRAME_BUS_MAGIC);
        std::ptr::addr_of_mut!((*ptr).version).write(FRAME_BUS_VERSION);
        std::ptr::addr_of_mut!((*ptr).consumers).write(consumers as u32);
        std::ptr::addr_of_mut!((*ptr).geometry).write(geometry);
        std::ptr::addr_of_mut!((*ptr).creator).write(AtomicU32::new(std::process::id()));
        std::ptr::addr_of_mut!((*ptr).slot_len).write(geometry.frame_len() as u64);

        let owners = std::ptr::addr_of_mut!((*ptr).owners).cast::<AtomicU32>();
        let pending = std::ptr::addr_of_mut!((*ptr).pending).cast::<AtomicBool>();
        for i in 0..MAX_CONSUMERS {
            owners.add(i).write(AtomicU32::new(0));
            pending.add(i).write(AtomicBool::new(false));
        }
        std::ptr::addr_of_mut!((*ptr).consumed_count).write(AtomicU32::new(consumers as u32));
        std::ptr::addr_of_mut!((*ptr).sequence).write(AtomicU64::new(0));

        ShmMutex::init(std::ptr::addr_of_mut!((*ptr).mutex))?;
        ShmCondvar::init(std::ptr::addr_of_mut!((*ptr).frame_ready))?;
        ShmCondvar::init(std::ptr::addr_of_mut!((*ptr).frame_done))?;
        Ok(())
    }

    /// Let openers attach
    #[inline]
    pub fn mark_ready(&self) {
        self.state.store(channel_state::READY, Ordering::Release);
    }

    #[inline]
    pub(crate) fn mark_closed(&self) {
        self.state.store(channel_state::CLOSED, Ordering::Release);
    }

    #[inline]
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state() == channel_state::CLOSED
    }

    #[inline]
    pub fn creator(&self) -> u32 {
        self.creator.load(Ordering::Acquire)
    }

    /// Whether the producer that initialized the segment still runs
    ///
    /// A producer killed before it could close leaves its segment `READY`.
    pub fn creator_alive(&self) -> bool {
        process_alive(self.creator())
    }

    #[cfg(test)]
    pub(crate) fn set_creator(&self, pid: u32) {
        self.creator.store(pid, Ordering::Release);
    }

    /// Number of consumers the barrier waits for (N)
    #[inline]
    pub fn consumers(&self) -> usize {
        self.consumers as usize
    }

    #[inline]
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    #[inline]
    pub fn slot_len(&self) -> usize {
        self.slot_len as usize
    }

    /// Check that a mapped segment holds a compatible, initialized layout
    ///
    /// `expected` is the geometry the opener was configured for, if any.
    pub fn validate(&self, mapped_size: usize, expected: Option<FrameGeometry>) -> Result<()> {
        if self.magic != FRAME_BUS_MAGIC {
            return Err(FrameBusError::InvalidMagic {
                expected: FRAME_BUS_MAGIC,
                got: self.magic,
            });
        }
        if self.version != FRAME_BUS_VERSION {
            return Err(FrameBusError::VersionMismatch {
                expected: FRAME_BUS_VERSION,
                got: self.version,
            });
        }

        let expected_size = Self::total_size(&expected.unwrap_or(self.geometry));
        if expected_size != mapped_size {
            return Err(FrameBusError::SizeMismatch {
                expected: expected_size,
                got: mapped_size,
            });
        }
        if let Some(expected) = expected {
            if expected != self.geometry {
                return Err(FrameBusError::GeometryMismatch {
                    expected: expected.to_string(),
                    got: self.geometry.to_string(),
                });
            }
        }
        if self.consumers() > MAX_CONSUMERS {
            return Err(FrameBusError::TooManyConsumers {
                max: MAX_CONSUMERS,
                got: self.consumers(),
            });
        }
        Ok(())
    }

    /// Claim consumer `index` for process `pid`
    ///
    /// A claim held by a process that no longer exists is taken over.
    /// Returns the live owner's pid on conflict.
    pub fn claim(&self, index: usize, pid: u32) -> std::result::Result<(), u32> {
        let slot = &self.owners[index];
        match slot.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(owner) if owner != pid && !process_alive(owner) => {
                match slot.compare_exchange(owner, pid, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => {
                        tracing::warn!(index, dead_owner = owner, "reclaimed consumer index");
                        Ok(())
                    }
                    Err(current) => Err(current),
                }
            }
            Err(owner) => Err(owner),
        }
    }

    /// Claim the lowest free consumer index
    pub fn claim_any(&self, pid: u32) -> Option<usize> {
        (0..self.consumers()).find(|&index| self.claim(index, pid).is_ok())
    }

    /// Give up a claim made by `pid`
    pub fn release(&self, index: usize, pid: u32) {
        let _ = self.owners[index].compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Pid currently holding `index`
    pub fn owner(&self, index: usize) -> Option<u32> {
        match self.owners.get(index)?.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Number of claimed consumer indices
    pub fn registered(&self) -> usize {
        (0..self.consumers())
            .filter(|&index| self.owner(index).is_some())
            .count()
    }

    /// Indices that have not read the installed frame (caller holds `mutex`)
    pub(crate) fn pending_indices(&self) -> Vec<usize> {
        (0..self.consumers())
            .filter(|&index| self.pending[index].load(Ordering::Relaxed))
            .collect()
    }
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM still means the process exists
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Pid of a child process that has already exited
#[cfg(test)]
pub(crate) fn exited_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

/// Zeroed, aligned heap memory standing in for a mapped segment
#[cfg(test)]
pub(crate) struct HeapSegment {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

#[cfg(test)]
unsafe impl Send for HeapSegment {}
#[cfg(test)]
unsafe impl Sync for HeapSegment {}

#[cfg(test)]
impl HeapSegment {
    pub(crate) fn new(geometry: FrameGeometry, consumers: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(
            FrameBufferHeader::total_size(&geometry),
            CACHE_LINE_SIZE,
        )
        .unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        unsafe {
            FrameBufferHeader::init(ptr.cast(), geometry, consumers).unwrap();
            (*ptr.cast::<FrameBufferHeader>()).mark_ready();
        }
        Self { ptr, layout }
    }

    pub(crate) fn header(&self) -> *mut FrameBufferHeader {
        self.ptr.cast()
    }

    pub(crate) fn slot(&self) -> *mut u8 {
        unsafe { self.ptr.add(FrameBufferHeader::slot_offset()) }
    }

    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }
}

#[cfg(test)]
impl Drop for HeapSegment {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) }
    }
}
