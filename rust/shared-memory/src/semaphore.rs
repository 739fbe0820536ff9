//! Counting semaphores gating access to shared slots
//!
//! `NamedSemaphore` wraps a POSIX named semaphore shared with the peer
//! process. `LocalSemaphore` has the same contract inside one process and
//! backs loopback runs and peer stubs.

use crate::{poll_until, PlatformUtils, Provisioned, Result, SharedMemoryError, WaitOptions};
use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};
use std::ffi::CString;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// A counting semaphore
pub trait Semaphore: Send + Sync {
    /// Decrement, blocking while the count is zero. `None` waits forever;
    /// `Some(t)` fails with `Timeout` after `t`.
    fn acquire(&self, timeout: Option<Duration>) -> Result<()>;

    /// Decrement if the count is positive, without blocking
    fn try_acquire(&self) -> Result<bool>;

    /// Increment, waking one waiter
    fn release(&self) -> Result<()>;

    /// Name used in logs and errors
    fn name(&self) -> &str;
}

impl<S: Semaphore + ?Sized> Semaphore for Arc<S> {
    fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        (**self).acquire(timeout)
    }

    fn try_acquire(&self) -> Result<bool> {
        (**self).try_acquire()
    }

    fn release(&self) -> Result<()> {
        (**self).release()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// POSIX named semaphore
pub struct NamedSemaphore {
    name: String,
    sem: *mut libc::sem_t,
    is_creator: bool,
    persist: bool,
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .field("is_creator", &self.is_creator)
            .finish()
    }
}

impl NamedSemaphore {
    /// Create a semaphore with `initial` count; fails if the name exists
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY: valid C string; the variadic mode/value are passed as c_uint
        // as sem_open(3) expects after default promotion.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };

        if sem == libc::SEM_FAILED {
            return Err(match Errno::last() {
                Errno::EEXIST => SharedMemoryError::AlreadyExists(name.to_string()),
                e => SharedMemoryError::from_errno(e, format!("sem_open({}) failed", name)),
            });
        }

        info!("Created semaphore {} (initial {})", name, initial);
        Ok(Self {
            name: name.to_string(),
            sem,
            is_creator: true,
            persist: false,
        })
    }

    /// Create the semaphore, or open it if the peer created it first
    pub fn create_or_open(name: &str, initial: u32) -> Result<Provisioned<Self>> {
        match Self::create(name, initial) {
            Ok(sem) => Ok(Provisioned::Created(sem)),
            Err(SharedMemoryError::AlreadyExists(_)) => match Self::try_open(name)? {
                Some(sem) => {
                    debug!("Semaphore {} already exists, opened", name);
                    Ok(Provisioned::Existing(sem))
                }
                // Unlinked between the two calls
                None => Self::create(name, initial).map(Provisioned::Created),
            },
            Err(err) => Err(err),
        }
    }

    /// Unlink any stale semaphore of this name, then create a fresh one
    pub fn recreate(name: &str, initial: u32) -> Result<Self> {
        if Self::unlink(name)? {
            warn!("Removed stale semaphore {}", name);
        }
        Self::create(name, initial)
    }

    /// Wait until the peer has created `name`, then open it
    pub fn open_wait(name: &str, options: &WaitOptions) -> Result<Self> {
        poll_until(name, options, || Self::try_open(name))
    }

    /// Remove a semaphore name; returns whether it existed
    pub fn unlink(name: &str) -> Result<bool> {
        let c_name = c_name(name)?;
        // SAFETY: valid C string.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            debug!("Unlinked semaphore {}", name);
            return Ok(true);
        }
        match Errno::last() {
            Errno::ENOENT => Ok(false),
            e => Err(SharedMemoryError::from_errno(e, format!("sem_unlink({}) failed", name))),
        }
    }

    /// Keep the name alive after this handle drops
    pub fn persist(&mut self) {
        self.persist = true;
    }

    fn try_open(name: &str) -> Result<Option<Self>> {
        let c_name = c_name(name)?;
        // SAFETY: valid C string, no O_CREAT so no variadic arguments.
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return match Errno::last() {
                Errno::ENOENT => Ok(None),
                e => Err(SharedMemoryError::from_errno(e, format!("sem_open({}) failed", name))),
            };
        }
        Ok(Some(Self {
            name: name.to_string(),
            sem,
            is_creator: false,
            persist: false,
        }))
    }

    fn wait_forever(&self) -> Result<()> {
        loop {
            // SAFETY: `sem` is a live handle from sem_open.
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                e => return Err(SharedMemoryError::from_errno(e, format!("sem_wait({}) failed", self.name))),
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = realtime_deadline(timeout);
        loop {
            // SAFETY: live handle and a valid timespec.
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ETIMEDOUT => {
                    return Err(SharedMemoryError::Timeout(format!(
                        "acquire {} after {:?}",
                        self.name, timeout
                    )))
                }
                e => return Err(SharedMemoryError::from_errno(e, format!("sem_timedwait({}) failed", self.name))),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        // No sem_timedwait on this platform: poll sem_trywait
        let started = Instant::now();
        loop {
            if self.try_acquire()? {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(SharedMemoryError::Timeout(format!(
                    "acquire {} after {:?}",
                    self.name, timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Semaphore for NamedSemaphore {
    fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        trace!("acquire {}", self.name);
        match timeout {
            None => self.wait_forever(),
            Some(timeout) => self.wait_timeout(timeout),
        }
    }

    fn try_acquire(&self) -> Result<bool> {
        // SAFETY: live handle.
        if unsafe { libc::sem_trywait(self.sem) } == 0 {
            return Ok(true);
        }
        match Errno::last() {
            Errno::EAGAIN | Errno::EINTR => Ok(false),
            e => Err(SharedMemoryError::from_errno(e, format!("sem_trywait({}) failed", self.name))),
        }
    }

    fn release(&self) -> Result<()> {
        trace!("release {}", self.name);
        // SAFETY: live handle.
        if unsafe { libc::sem_post(self.sem) } == 0 {
            Ok(())
        } else {
            Err(SharedMemoryError::from_errno(Errno::last(), format!("sem_post({}) failed", self.name)))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: handle came from sem_open and is closed exactly once.
        unsafe {
            libc::sem_close(self.sem);
        }
        if self.is_creator && !self.persist {
            if let Err(err) = Self::unlink(&self.name) {
                warn!("Failed to unlink semaphore {}: {}", self.name, err);
            }
        }
    }
}

// SAFETY: POSIX semaphores are designed for concurrent use across threads
// and processes; the handle itself is never mutated after sem_open.
unsafe impl Send for NamedSemaphore {}
// SAFETY: see above.
unsafe impl Sync for NamedSemaphore {}

fn c_name(name: &str) -> Result<CString> {
    PlatformUtils::validate_name(name)?;
    CString::new(name).map_err(|_| SharedMemoryError::InvalidName(name.to_string()))
}

#[cfg(target_os = "linux")]
fn realtime_deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: CLOCK_REALTIME always exists and `now` is a valid out pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }
    let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
    let mut nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec { tv_sec: sec, tv_nsec: nsec }
}

/// In-process counting semaphore
#[derive(Debug)]
pub struct LocalSemaphore {
    name: String,
    count: Mutex<u64>,
    available: Condvar,
}

impl LocalSemaphore {
    /// New semaphore with `initial` count
    pub fn new(name: impl Into<String>, initial: u64) -> Self {
        Self {
            name: name.into(),
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Current count
    pub fn value(&self) -> u64 {
        *self.count.lock()
    }
}

impl Semaphore for LocalSemaphore {
    fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count.lock();
        while *count == 0 {
            match deadline {
                None => self.available.wait(&mut count),
                Some(deadline) => {
                    if self.available.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                        return Err(SharedMemoryError::Timeout(format!(
                            "acquire {} after {:?}",
                            self.name,
                            timeout.unwrap_or_default()
                        )));
                    }
                }
            }
        }
        *count -= 1;
        Ok(())
    }

    fn try_acquire(&self) -> Result<bool> {
        let mut count = self.count.lock();
        if *count == 0 {
            return Ok(false);
        }
        *count -= 1;
        Ok(true)
    }

    fn release(&self) -> Result<()> {
        *self.count.lock() += 1;
        self.available.notify_one();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
