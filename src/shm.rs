//! Low-level POSIX shared memory operations

use crate::error::{FrameBusError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

const FRAME_BUS_SHM_PREFIX: &str = "/framebus_";
const MAX_NAME_LEN: usize = 255 - FRAME_BUS_SHM_PREFIX.len();

/// Build the OS-level segment name for a channel name
fn os_name(name: &str) -> Result<CString> {
    let invalid = |reason| FrameBusError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("too long"));
    }
    if name.contains('/') {
        return Err(invalid("contains '/'"));
    }

    CString::new(format!("{}{}", FRAME_BUS_SHM_PREFIX, name)).map_err(|_| invalid("contains NUL"))
}

/// A named shared memory segment mapped into this process
///
/// The creating handle owns the name and unlinks it on drop. Openers only
/// unmap. Size is fixed at creation.
pub struct SharedRegion {
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: SharedRegion only hands out raw pointers; all access to the
// mapped bytes is synchronized by the layout stored inside it
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a new shared memory segment of `size` bytes, zero-filled
    ///
    /// Fails with an `AlreadyExists` source if a segment of that name is
    /// live. Callers that want to replace a stale segment call
    /// [`SharedRegion::remove`] first.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = os_name(name)?;

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|e| FrameBusError::ShmCreate {
            name: name.to_string(),
            source: e.into(),
        })?;

        if let Err(e) = ftruncate(&fd, size as u64) {
            let _ = shm_unlink(c_name.as_c_str());
            return Err(FrameBusError::Truncate(e.into()));
        }

        let addr = match Self::map(&fd, size) {
            Ok(addr) => addr,
            Err(e) => {
                let _ = shm_unlink(c_name.as_c_str());
                return Err(e);
            }
        };

        // Zero initialize
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: true,
        })
    }

    /// Open an existing shared memory segment
    ///
    /// Fails with a `NotFound` source if nobody has created it, and with
    /// `NotReady` if the creator has not sized it yet.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = os_name(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            FrameBusError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        // Get size from file
        let stat = rustix::fs::fstat(&fd).map_err(|e| FrameBusError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        if size == 0 {
            return Err(FrameBusError::NotReady {
                name: name.to_string(),
            });
        }

        let addr = Self::map(&fd, size)?;

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
        })
    }

    /// Remove the named segment
    ///
    /// Returns `true` if a segment was removed, `false` if none existed.
    /// Existing mappings stay valid until their handles are dropped.
    pub fn remove(name: &str) -> Result<bool> {
        let c_name = os_name(name)?;
        match shm_unlink(c_name.as_c_str()) {
            Ok(()) => Ok(true),
            Err(Errno::NOENT) => Ok(false),
            Err(e) => Err(FrameBusError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }),
        }
    }

    fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
            .map_err(|e| FrameBusError::Mmap(e.into()))?
        };

        NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| FrameBusError::Mmap(std::io::Error::other("mmap returned null")))
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of shared memory region
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the channel name of the segment
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle created (and will remove) the segment
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Check whether the name still refers to this mapping's segment
    ///
    /// False once another creator has replaced it.
    fn name_is_ours(&self, c_name: &CString) -> bool {
        let Ok(ours) = rustix::fs::fstat(&self.fd) else {
            return false;
        };
        let Ok(fd) = shm_open(c_name.as_c_str(), ShmOFlags::RDONLY, Mode::empty()) else {
            return false;
        };
        match rustix::fs::fstat(&fd) {
            Ok(current) => current.st_ino == ours.st_ino && current.st_dev == ours.st_dev,
            Err(_) => false,
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        if self.is_owner {
            if let Ok(c_name) = os_name(&self.name) {
                if self.name_is_ours(&c_name) {
                    let _ = shm_unlink(c_name.as_c_str());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn unique(tag: &str) -> String {
        format!("shm_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_create_and_open() {
        let name = unique("create_open");
        let size = 4096;

        let shm1 = SharedRegion::create(&name, size).unwrap();
        assert!(shm1.is_owner());
        assert_eq!(shm1.size(), size);

        unsafe {
            std::ptr::write(shm1.as_ptr().add(17), 42u8);
        }

        let shm2 = SharedRegion::open(&name).unwrap();
        assert!(!shm2.is_owner());
        assert_eq!(shm2.size(), size);

        let val = unsafe { std::ptr::read(shm2.as_ptr().add(17)) };
        assert_eq!(val, 42u8);

        // Opener drop leaves the segment in place
        drop(shm2);
        assert!(SharedRegion::open(&name).is_ok());

        drop(shm1);
        let err = SharedRegion::open(&name).err().unwrap();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_create_twice_fails_with_already_exists() {
        let name = unique("create_twice");
        let _shm = SharedRegion::create(&name, 64).unwrap();

        match SharedRegion::create(&name, 64) {
            Err(FrameBusError::ShmCreate { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("expected ShmCreate, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_open_missing_is_not_found() {
        match SharedRegion::open(&unique("missing")) {
            Err(FrameBusError::ShmOpen { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::NotFound)
            }
            other => panic!("expected ShmOpen, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let name = unique("remove");
        let shm = SharedRegion::create(&name, 64).unwrap();

        assert!(SharedRegion::remove(&name).unwrap());
        assert!(!SharedRegion::remove(&name).unwrap());

        // Name is free again while the old mapping is still alive
        let again = SharedRegion::create(&name, 64).unwrap();
        drop(shm);
        assert!(SharedRegion::open(&name).is_ok());
        drop(again);
        assert!(SharedRegion::open(&name).is_err());
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(matches!(
            SharedRegion::create("", 64),
            Err(FrameBusError::InvalidName { .. })
        ));
        assert!(matches!(
            SharedRegion::create("a/b", 64),
            Err(FrameBusError::InvalidName { .. })
        ));
        assert!(matches!(
            SharedRegion::open("nul\0name"),
            Err(FrameBusError::InvalidName { .. })
        ));
    }
}
