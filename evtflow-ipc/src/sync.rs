//! Process-shared synchronization primitives placed inside a mapped segment.
//!
//! Both types are `#[repr(transparent)]` wrappers so they can sit directly in
//! the `#[repr(C)]` ring header. They are only ever reached through a pointer
//! into shared memory, never constructed by value.

use std::cell::UnsafeCell;
use std::io;
use std::time::Instant;

/// Unnamed POSIX semaphore with `pshared = 1`
#[repr(transparent)]
pub(crate) struct SharedSemaphore(UnsafeCell<libc::sem_t>);

impl SharedSemaphore {
    /// Initialize the semaphore with a zero count.
    ///
    /// # Safety
    ///
    /// No other process may be using the semaphore while it is initialized.
    pub(crate) unsafe fn init(&self) -> io::Result<()> {
        if unsafe { libc::sem_init(self.0.get(), 1, 0) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// # Safety
    ///
    /// No process may be blocked on the semaphore.
    pub(crate) unsafe fn destroy(&self) {
        unsafe {
            libc::sem_destroy(self.0.get());
        }
    }

    pub(crate) fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.0.get()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Decrement without blocking. Returns `false` when the count is zero.
    pub(crate) fn try_wait(&self) -> io::Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.0.get()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Decrement, blocking until the count is positive or `deadline` passes.
    ///
    /// `None` waits forever. Returns `false` on timeout. Signal interruptions
    /// are retried.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> io::Result<bool> {
        loop {
            let rc = match deadline {
                None => unsafe { libc::sem_wait(self.0.get()) },
                Some(deadline) => {
                    let ts = realtime_deadline(deadline);
                    unsafe { libc::sem_timedwait(self.0.get(), &ts) }
                }
            };
            if rc == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }
}

/// Outcome of acquiring a robust mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockState {
    /// Acquired normally
    Clean,
    /// Acquired, but the previous owner died while holding it
    OwnerDied,
}

/// Robust, process-shared pthread mutex
#[repr(transparent)]
pub(crate) struct SharedMutex(UnsafeCell<libc::pthread_mutex_t>);

impl SharedMutex {
    /// # Safety
    ///
    /// No other process may be using the mutex while it is initialized.
    pub(crate) unsafe fn init(&self) -> io::Result<()> {
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut attr))?;
            let configured = check(libc::pthread_mutexattr_setpshared(
                &mut attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))
            .and_then(|_| {
                check(libc::pthread_mutexattr_setrobust(
                    &mut attr,
                    libc::PTHREAD_MUTEX_ROBUST,
                ))
            })
            .and_then(|_| check(libc::pthread_mutex_init(self.0.get(), &attr)));
            libc::pthread_mutexattr_destroy(&mut attr);
            configured
        }
    }

    /// # Safety
    ///
    /// The mutex must be unlocked and unused by every process.
    pub(crate) unsafe fn destroy(&self) {
        unsafe {
            libc::pthread_mutex_destroy(self.0.get());
        }
    }

    /// Acquire the mutex.
    ///
    /// On `OwnerDied` the mutex has already been marked consistent, so the
    /// caller holds a usable lock and must still call [`SharedMutex::unlock`].
    pub(crate) fn lock(&self) -> io::Result<LockState> {
        match unsafe { libc::pthread_mutex_lock(self.0.get()) } {
            0 => Ok(LockState::Clean),
            libc::EOWNERDEAD => {
                check(unsafe { libc::pthread_mutex_consistent(self.0.get()) })?;
                Ok(LockState::OwnerDied)
            }
            rc => Err(io::Error::from_raw_os_error(rc)),
        }
    }

    pub(crate) fn unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(self.0.get());
        }
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Convert a monotonic deadline into the absolute `CLOCK_REALTIME` timespec
/// `sem_timedwait` expects.
fn realtime_deadline(deadline: Instant) -> libc::timespec {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    let mut secs = ts.tv_sec as i64 + remaining.as_secs() as i64;
    let mut nanos = ts.tv_nsec as i64 + remaining.subsec_nanos() as i64;
    if nanos >= 1_000_000_000 {
        secs += 1;
        nanos -= 1_000_000_000;
    }
    ts.tv_sec = secs as _;
    ts.tv_nsec = nanos as _;
    ts
}
