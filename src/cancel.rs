//! Registry of child processes that an abort request must terminate.
//!
//! A registry is created per build and passed by reference to everything
//! that spawns long-running children (the emulator, provisioning, image
//! writes). Spawning follows a fixed protocol:
//!
//! ```rust,ignore
//! let registration = registry.scoped_lock();
//! let child = command.spawn()?;
//! registration.register(child.id());
//! drop(registration);
//! // ... wait for the child ...
//! registry.unregister(child.id());
//! ```
//!
//! [`CancelRegistry::cancel`] takes the same lock, so it can never run
//! between a spawn and its registration.

use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Delivers a termination request to an OS process.
pub trait ProcessSignaller: Send + Sync {
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// SIGTERM on Unix, `taskkill` on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSignaller;

impl ProcessSignaller for SystemSignaller {
    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        let status = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("taskkill exited with {status}"),
            ))
        }
    }
}

pub struct CancelRegistry {
    spawn_lock: Mutex<()>,
    pids: Mutex<BTreeSet<u32>>,
    cancelled: AtomicBool,
    signaller: Box<dyn ProcessSignaller>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::with_signaller(SystemSignaller)
    }

    pub fn with_signaller(signaller: impl ProcessSignaller + 'static) -> Self {
        Self {
            spawn_lock: Mutex::new(()),
            pids: Mutex::new(BTreeSet::new()),
            cancelled: AtomicBool::new(false),
            signaller: Box::new(signaller),
        }
    }

    /// Hold this across spawn + register.
    pub fn scoped_lock(&self) -> Registration<'_> {
        Registration {
            _guard: self.spawn_lock.lock(),
            registry: self,
        }
    }

    /// Duplicates are ignored.
    pub fn register(&self, pid: u32) {
        if self.pids.lock().insert(pid) {
            debug!(pid, "registered cancellable process");
        }
    }

    /// Absent pids are ignored. Returns whether the pid was registered.
    pub fn unregister(&self, pid: u32) -> bool {
        let removed = self.pids.lock().remove(&pid);
        if removed {
            debug!(pid, "unregistered cancellable process");
        }
        removed
    }

    pub fn registered(&self) -> Vec<u32> {
        self.pids.lock().iter().copied().collect()
    }

    /// Signal every registered process. Entries stay registered until their
    /// owner reaps them. Returns the number of processes signalled.
    pub fn cancel(&self) -> usize {
        let _guard = self.spawn_lock.lock();
        self.cancelled.store(true, Ordering::SeqCst);

        let pids = self.registered();
        info!(count = pids.len(), "cancelling registered processes");
        let mut signalled = 0;
        for pid in pids {
            match self.signaller.terminate(pid) {
                Ok(()) => signalled += 1,
                Err(e) => warn!(pid, error = %e, "failed to signal process"),
            }
        }
        signalled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive spawn window on a [`CancelRegistry`].
pub struct Registration<'a> {
    _guard: MutexGuard<'a, ()>,
    registry: &'a CancelRegistry,
}

impl Registration<'_> {
    pub fn register(&self, pid: u32) {
        self.registry.register(pid);
    }
}
