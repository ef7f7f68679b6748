//! ARM guest emulation: console login automation, the SSH remote shell and
//! the session that ties them to one emulator process.

pub mod boot;
pub mod remote;
pub mod session;

pub use boot::{BootScript, Console, ThreadTimer, Timer, WaitMode, WaitOutcome};
pub use remote::{RemoteShell, SshShell};
pub use session::{Emulator, ExecOptions, ExecResult, LineHook, ShellConnector, VmSession};
