//! Named POSIX semaphores guarding container subtrees
//!
//! One named semaphore exists per container node, created by whichever
//! process initializes the segment and reopened by everyone else. Names
//! follow `/snSem_<n>` with `n` assigned in directory-traversal order, so
//! every attacher of the same schema binds the same semaphore to the same
//! container. Semaphores are closed at drop and never unlinked, matching
//! the segment lifecycle.

use std::ffi::CString;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SEM_NAME_PREFIX;
use crate::error::{Result, StoreError};

/// A named, inter-process counting semaphore.
pub struct NamedSemaphore {
    raw: *mut libc::sem_t,
    name: String,
}

// The underlying sem_t lives in the kernel/shared mapping; the handle is
// safe to use from any thread.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Exclusive-create with the given initial value; if the semaphore
    /// already exists, reopen it (preserving its current count).
    pub fn create_or_open(name: &str, initial: u32) -> Result<Self> {
        let c_name = CString::new(name)
            .map_err(|_| StoreError::semaphore(name, "name contains a NUL byte"))?;

        let mode = (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint;
        let raw = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                mode,
                initial,
            )
        };
        let raw = if raw == libc::SEM_FAILED {
            unsafe { libc::sem_open(c_name.as_ptr(), 0) }
        } else {
            raw
        };
        if raw == libc::SEM_FAILED {
            return Err(StoreError::semaphore(
                name,
                format!("sem_open failed: {}", std::io::Error::last_os_error()),
            ));
        }

        Ok(Self {
            raw,
            name: name.to_string(),
        })
    }

    /// Semaphore name, including the leading slash.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the semaphore can be decremented.
    pub fn wait(&self) -> Result<()> {
        loop {
            let rc = unsafe { libc::sem_wait(self.raw) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(StoreError::semaphore(
                    &self.name,
                    format!("sem_wait failed: {}", err),
                ));
            }
        }
    }

    /// Bounded wait; errors on timeout or OS failure.
    pub fn timed_wait(&self, timeout: Duration) -> Result<()> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } != 0 {
            return Err(StoreError::semaphore(
                &self.name,
                "clock_gettime failed for timed wait",
            ));
        }
        ts.tv_sec += timeout.as_secs() as libc::time_t;
        ts.tv_nsec += timeout.subsec_nanos() as libc::c_long;
        if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_nsec -= 1_000_000_000;
            ts.tv_sec += 1;
        }

        loop {
            let rc = unsafe { libc::sem_timedwait(self.raw, &ts) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(StoreError::semaphore(
                    &self.name,
                    format!("sem_timedwait failed: {}", err),
                ));
            }
        }
    }

    /// Increment the semaphore, releasing one waiter.
    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.raw) } != 0 {
            return Err(StoreError::semaphore(
                &self.name,
                format!("sem_post failed: {}", std::io::Error::last_os_error()),
            ));
        }
        Ok(())
    }

    /// Current count, when the platform supports reading it.
    pub fn value(&self) -> Result<i32> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.raw, &mut value) } != 0 {
            return Err(StoreError::semaphore(
                &self.name,
                format!("sem_getvalue failed: {}", std::io::Error::last_os_error()),
            ));
        }
        Ok(value)
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.raw);
        }
    }
}

impl fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .finish()
    }
}

/// Hands out `/snSem_<n>` semaphores in directory-traversal order,
/// starting at 0 for the root container.
#[derive(Debug, Default)]
pub(crate) struct SemAllocator {
    next: u32,
}

impl SemAllocator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Open (creating if absent) the next semaphore in sequence with
    /// initial value 1.
    pub(crate) fn open_next(&mut self) -> Result<Arc<NamedSemaphore>> {
        let name = format!("{}{}", SEM_NAME_PREFIX, self.next);
        self.next += 1;
        Ok(Arc::new(NamedSemaphore::create_or_open(&name, 1)?))
    }
}

/// Fixed name of the initialization semaphore for a segment.
pub(crate) fn init_sem_name(segment: &str) -> String {
    format!("/{}_init", segment.trim_start_matches('/'))
}
