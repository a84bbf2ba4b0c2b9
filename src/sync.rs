//! Process-shared mutex and condition variable
//!
//! Both primitives live inside a shared memory segment and are initialized
//! in place by the segment creator with `PTHREAD_PROCESS_SHARED`. On Linux
//! the mutex is robust: if a process dies while holding it, the next locker
//! recovers it instead of deadlocking.

use crate::error::{FrameBusError, Result};
use std::cell::UnsafeCell;
use std::io;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::time::Duration;

#[cfg(target_os = "linux")]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(target_os = "linux"))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

#[inline]
fn check(op: &'static str, ret: libc::c_int) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(FrameBusError::Sync {
            op,
            source: io::Error::from_raw_os_error(ret),
        })
    }
}

#[cfg(target_os = "linux")]
fn owner_died(ret: libc::c_int) -> bool {
    ret == libc::EOWNERDEAD
}

#[cfg(not(target_os = "linux"))]
fn owner_died(_ret: libc::c_int) -> bool {
    false
}

/// Mutex attribute object, destroyed on drop
struct MutexAttr(MaybeUninit<libc::pthread_mutexattr_t>);

impl MutexAttr {
    fn new() -> Result<Self> {
        let mut attr = MaybeUninit::uninit();
        check("pthread_mutexattr_init", unsafe {
            libc::pthread_mutexattr_init(attr.as_mut_ptr())
        })?;
        let mut attr = MutexAttr(attr);

        check("pthread_mutexattr_setpshared", unsafe {
            libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED)
        })?;

        #[cfg(target_os = "linux")]
        check("pthread_mutexattr_setrobust", unsafe {
            libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST)
        })?;

        Ok(attr)
    }

    fn as_mut_ptr(&mut self) -> *mut libc::pthread_mutexattr_t {
        self.0.as_mut_ptr()
    }
}

impl Drop for MutexAttr {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutexattr_destroy(self.0.as_mut_ptr());
        }
    }
}

/// Condition attribute object, destroyed on drop
struct CondAttr(MaybeUninit<libc::pthread_condattr_t>);

impl CondAttr {
    fn new() -> Result<Self> {
        let mut attr = MaybeUninit::uninit();
        check("pthread_condattr_init", unsafe {
            libc::pthread_condattr_init(attr.as_mut_ptr())
        })?;
        let mut attr = CondAttr(attr);

        check("pthread_condattr_setpshared", unsafe {
            libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED)
        })?;

        #[cfg(target_os = "linux")]
        check("pthread_condattr_setclock", unsafe {
            libc::pthread_condattr_setclock(attr.as_mut_ptr(), WAIT_CLOCK)
        })?;

        Ok(attr)
    }

    fn as_mut_ptr(&mut self) -> *mut libc::pthread_condattr_t {
        self.0.as_mut_ptr()
    }
}

impl Drop for CondAttr {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_condattr_destroy(self.0.as_mut_ptr());
        }
    }
}

/// Mutex usable from every process that maps the segment
#[repr(C)]
pub struct ShmMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes are designed to be shared between threads
// (and, with PTHREAD_PROCESS_SHARED, between processes)
unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

impl ShmMutex {
    /// Initialize a mutex in place
    ///
    /// # Safety
    /// `ptr` must point to writable, properly aligned memory that no other
    /// thread or process is using yet
    pub unsafe fn init(ptr: *mut Self) -> Result<()> {
        let mut attr = MutexAttr::new()?;
        let raw = std::ptr::addr_of_mut!((*ptr).raw).cast::<libc::pthread_mutex_t>();
        check("pthread_mutex_init", libc::pthread_mutex_init(raw, attr.as_mut_ptr()))
    }

    /// Acquire the mutex, blocking until it is available
    pub fn lock(&self) -> Result<ShmMutexGuard<'_>> {
        let ret = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        self.acquired("pthread_mutex_lock", ret)?;
        Ok(ShmMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Turn the return code of a call that (re)acquires the lock into a result
    ///
    /// A robust mutex whose previous owner died is marked consistent and kept.
    fn acquired(&self, op: &'static str, ret: libc::c_int) -> Result<()> {
        if owner_died(ret) {
            tracing::warn!("previous lock holder died; recovering shared mutex");
            return self.make_consistent();
        }
        check(op, ret)
    }

    #[cfg(target_os = "linux")]
    fn make_consistent(&self) -> Result<()> {
        let ret = unsafe { libc::pthread_mutex_consistent(self.raw.get()) };
        if ret != 0 {
            unsafe {
                libc::pthread_mutex_unlock(self.raw.get());
            }
        }
        check("pthread_mutex_consistent", ret)
    }

    #[cfg(not(target_os = "linux"))]
    fn make_consistent(&self) -> Result<()> {
        Ok(())
    }
}

/// Lock held on a [`ShmMutex`]; released on drop
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
    // pthread mutexes must be unlocked by the thread that locked them
    _not_send: PhantomData<*const ()>,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw.get());
        }
    }
}

/// Condition variable usable from every process that maps the segment
#[repr(C)]
pub struct ShmCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: see ShmMutex
unsafe impl Send for ShmCondvar {}
unsafe impl Sync for ShmCondvar {}

impl ShmCondvar {
    /// Initialize a condition variable in place
    ///
    /// # Safety
    /// Same requirements as [`ShmMutex::init`]
    pub unsafe fn init(ptr: *mut Self) -> Result<()> {
        let mut attr = CondAttr::new()?;
        let raw = std::ptr::addr_of_mut!((*ptr).raw).cast::<libc::pthread_cond_t>();
        check("pthread_cond_init", libc::pthread_cond_init(raw, attr.as_mut_ptr()))
    }

    /// Release the guard's mutex and block until notified
    ///
    /// Spurious wakeups are possible; callers re-check their predicate.
    pub fn wait(&self, guard: &mut ShmMutexGuard<'_>) -> Result<()> {
        let ret = unsafe { libc::pthread_cond_wait(self.raw.get(), guard.mutex.raw.get()) };
        guard.mutex.acquired("pthread_cond_wait", ret)
    }

    /// Like [`ShmCondvar::wait`] but gives up after `timeout`
    ///
    /// Returns `true` if the wait timed out.
    pub fn wait_timeout(&self, guard: &mut ShmMutexGuard<'_>, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(timeout)?;
        let ret = unsafe {
            libc::pthread_cond_timedwait(self.raw.get(), guard.mutex.raw.get(), &deadline)
        };
        if ret == libc::ETIMEDOUT {
            return Ok(true);
        }
        guard.mutex.acquired("pthread_cond_timedwait", ret)?;
        Ok(false)
    }

    /// Wake one waiter
    #[inline]
    pub fn notify_one(&self) -> Result<()> {
        check("pthread_cond_signal", unsafe {
            libc::pthread_cond_signal(self.raw.get())
        })
    }

    /// Wake every waiter
    #[inline]
    pub fn notify_all(&self) -> Result<()> {
        check("pthread_cond_broadcast", unsafe {
            libc::pthread_cond_broadcast(self.raw.get())
        })
    }
}

/// Absolute deadline on the condition clock, `timeout` from now
fn deadline_after(timeout: Duration) -> Result<libc::timespec> {
    let mut now = MaybeUninit::<libc::timespec>::uninit();
    if unsafe { libc::clock_gettime(WAIT_CLOCK, now.as_mut_ptr()) } != 0 {
        return Err(FrameBusError::Sync {
            op: "clock_gettime",
            source: io::Error::last_os_error(),
        });
    }
    let mut deadline = unsafe { now.assume_init() };

    let secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
    let mut tv_sec = (deadline.tv_sec as i64).saturating_add(secs);
    let mut tv_nsec = deadline.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    if tv_nsec >= 1_000_000_000 {
        tv_sec = tv_sec.saturating_add(1);
        tv_nsec -= 1_000_000_000;
    }

    deadline.tv_sec = tv_sec as libc::time_t;
    deadline.tv_nsec = tv_nsec as _;
    Ok(deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[repr(C)]
    struct Shared {
        mutex: ShmMutex,
        cond: ShmCondvar,
        flag: AtomicBool,
    }

    // Heap stand-in for a mapped segment
    struct Region(*mut Shared);
    unsafe impl Send for Region {}
    unsafe impl Sync for Region {}

    impl Region {
        fn new() -> Arc<Self> {
            let ptr = Box::into_raw(Box::new(MaybeUninit::<Shared>::zeroed())).cast::<Shared>();
            unsafe {
                ShmMutex::init(std::ptr::addr_of_mut!((*ptr).mutex)).unwrap();
                ShmCondvar::init(std::ptr::addr_of_mut!((*ptr).cond)).unwrap();
            }
            Arc::new(Region(ptr))
        }

        fn get(&self) -> &Shared {
            unsafe { &*self.0 }
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            unsafe {
                drop(Box::from_raw(self.0.cast::<MaybeUninit<Shared>>()));
            }
        }
    }

    #[test]
    fn test_wait_timeout_expires() {
        let region = Region::new();
        let shared = region.get();

        let mut guard = shared.mutex.lock().unwrap();
        let start = Instant::now();
        let timed_out = shared
            .cond
            .wait_timeout(&mut guard, Duration::from_millis(30))
            .unwrap();
        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let region = Region::new();

        let waiter = {
            let region = Arc::clone(&region);
            thread::spawn(move || {
                let shared = region.get();
                let mut guard = shared.mutex.lock().unwrap();
                while !shared.flag.load(Ordering::Relaxed) {
                    shared.cond.wait(&mut guard).unwrap();
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let shared = region.get();
            let _guard = shared.mutex.lock().unwrap();
            shared.flag.store(true, Ordering::Relaxed);
            shared.cond.notify_all().unwrap();
        }

        waiter.join().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lock_recovers_after_owner_death() {
        let region = Region::new();

        // Holder exits without unlocking
        {
            let region = Arc::clone(&region);
            thread::spawn(move || {
                let guard = region.get().mutex.lock().unwrap();
                std::mem::forget(guard);
            })
            .join()
            .unwrap();
        }

        let shared = region.get();
        let guard = shared.mutex.lock().unwrap();
        drop(guard);

        // Marked consistent, so later lockers see a plain mutex
        let guard = shared.mutex.lock().unwrap();
        drop(guard);
    }

    #[test]
    fn test_deadline_normalizes_nanos() {
        let deadline = deadline_after(Duration::new(1, 999_999_999)).unwrap();
        assert!((0..1_000_000_000).contains(&(deadline.tv_nsec as i64)));
    }
}
