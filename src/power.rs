//! Keeps the host awake while a build runs.
//!
//! macOS and Linux hold an inhibitor for as long as a `cat` child of it
//! runs; closing that child's stdin ends it. A terminal exporting
//! `WINDOWID` gets its window suspended through `xdg-screensaver` instead.
//! Windows sets the thread execution state, so the guard must be dropped
//! on the thread that took it.

use anyhow::{bail, Result};
use std::process::{Child, ChildStdin};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::process::{Cmd, HostPlatform};

const WHY: &str = "Building an appliance image";

/// How long an inhibitor gets to exit once its stdin is closed.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// The mechanism for one host.
#[derive(Debug, Clone)]
pub enum Inhibit {
    /// Held while the process runs.
    Process(Cmd),
    /// `suspend` now, `resume` on release.
    Screensaver { suspend: Cmd, resume: Cmd },
    ExecutionState,
}

impl Inhibit {
    pub fn plan(platform: HostPlatform, window_id: Option<&str>) -> Self {
        match (platform, window_id) {
            (HostPlatform::Windows, _) => Self::ExecutionState,
            (HostPlatform::MacOs, _) => Self::Process(Cmd::new("caffeinate").args(["-dis", "cat"])),
            (HostPlatform::Linux, Some(window)) => Self::Screensaver {
                suspend: Cmd::new("xdg-screensaver").args(["suspend", window]),
                resume: Cmd::new("xdg-screensaver").args(["resume", window]),
            },
            (HostPlatform::Linux, None) => {
                let why = format!("--why={WHY}");
                Self::Process(Cmd::new("systemd-inhibit").args([
                    "--what=idle:sleep",
                    "--who=appliance-builder",
                    why.as_str(),
                    "--mode=block",
                    "cat",
                ]))
            }
        }
    }
}

enum Held {
    Process { child: Child, stdin: Option<ChildStdin> },
    Screensaver(Cmd),
    ExecutionState,
    Released,
}

/// Restores the sleep policy on [`SleepGuard::release`] or drop.
pub struct SleepGuard {
    held: Held,
}

impl SleepGuard {
    pub fn acquire(plan: Inhibit) -> Result<Self> {
        let held = match plan {
            Inhibit::Process(cmd) => {
                let mut child = cmd.spawn()?;
                let stdin = child.stdin.take();
                Held::Process { child, stdin }
            }
            Inhibit::Screensaver { suspend, resume } => {
                suspend.error_msg("Failed to suspend the screensaver").run()?;
                Held::Screensaver(resume)
            }
            Inhibit::ExecutionState => {
                set_execution_state(true)?;
                Held::ExecutionState
            }
        };
        Ok(Self { held })
    }

    /// Best effort; failures are logged.
    pub fn release(&mut self) {
        match std::mem::replace(&mut self.held, Held::Released) {
            Held::Process { mut child, stdin } => {
                drop(stdin);
                end_process(&mut child);
            }
            Held::Screensaver(resume) => match resume.allow_fail().run() {
                Ok(out) if out.success() => {}
                Ok(out) => warn!(stderr = out.stderr.trim(), "screensaver resume failed"),
                Err(e) => warn!(error = %format!("{e:#}"), "screensaver resume failed"),
            },
            Held::ExecutionState => {
                if let Err(e) = set_execution_state(false) {
                    warn!(error = %format!("{e:#}"), "failed to restore execution state");
                }
            }
            Held::Released => return,
        }
        debug!("sleep policy restored");
    }
}

impl Drop for SleepGuard {
    fn drop(&mut self) {
        self.release();
    }
}

fn end_process(child: &mut Child) {
    let deadline = Instant::now() + RELEASE_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Ok(None) | Err(_) => {
                warn!(pid = child.id(), "sleep inhibitor did not exit, killing it");
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
        }
    }
}

#[cfg(windows)]
fn set_execution_state(awake: bool) -> Result<()> {
    use windows_sys::Win32::System::Power::{
        SetThreadExecutionState, ES_CONTINUOUS, ES_DISPLAY_REQUIRED, ES_SYSTEM_REQUIRED,
    };
    let flags = if awake {
        ES_CONTINUOUS | ES_SYSTEM_REQUIRED | ES_DISPLAY_REQUIRED
    } else {
        ES_CONTINUOUS
    };
    // returns the previous state, zero on failure
    if unsafe { SetThreadExecutionState(flags) } == 0 {
        bail!("SetThreadExecutionState failed");
    }
    Ok(())
}

#[cfg(not(windows))]
fn set_execution_state(_awake: bool) -> Result<()> {
    bail!("thread execution state is only available on Windows")
}

/// Keep this host awake until the guard drops, or carry on without.
pub fn prevent_sleep() -> Option<SleepGuard> {
    let window = std::env::var("WINDOWID").ok().filter(|w| !w.is_empty());
    let plan = Inhibit::plan(HostPlatform::current(), window.as_deref());
    match SleepGuard::acquire(plan) {
        Ok(guard) => {
            info!("preventing sleep during the build");
            Some(guard)
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "unable to prevent sleep");
            None
        }
    }
}
