//! External command execution.
//!
//! [`Cmd`] wraps `std::process::Command` with the conventions used across
//! the builder: commands are logged before they run, non-zero exit is an
//! error carrying the trimmed stderr, and admin elevation is a flag rather
//! than something each caller assembles.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::debug;

use crate::cancel::CancelRegistry;
use crate::error::BuildError;

/// Operating system family the builder runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    Linux,
    MacOs,
    Windows,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(windows) {
            Self::Windows
        } else {
            Self::Linux
        }
    }
}

/// How a command is re-launched with administrator rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// `sudo`, for terminal sessions.
    Sudo,
    /// `pkexec`, for graphical Linux sessions.
    Pkexec,
    /// `osascript ... with administrator privileges`.
    AppleScript,
    /// Elevated `Start-Process -Verb RunAs`.
    RunAs,
}

impl Elevation {
    /// The mechanism for this host. `graphical` selects `pkexec` over `sudo`.
    pub fn for_host(graphical: bool) -> Self {
        if cfg!(target_os = "macos") {
            Self::AppleScript
        } else if cfg!(windows) {
            Self::RunAs
        } else if graphical {
            Self::Pkexec
        } else {
            Self::Sudo
        }
    }

    fn wrap(self, program: &OsStr, args: &[OsString]) -> (OsString, Vec<OsString>) {
        match self {
            Self::Sudo | Self::Pkexec => {
                let launcher = if self == Self::Sudo { "sudo" } else { "pkexec" };
                let mut wrapped = vec![program.to_os_string()];
                wrapped.extend(args.iter().cloned());
                (launcher.into(), wrapped)
            }
            Self::AppleScript => {
                let line = command_line(program, args);
                let script = format!(
                    "do shell script \"{}\" with administrator privileges",
                    line.replace('\\', "\\\\").replace('"', "\\\"")
                );
                ("osascript".into(), vec!["-e".into(), script.into()])
            }
            Self::RunAs => {
                let arg_list = args
                    .iter()
                    .map(|a| format!("'{}'", a.to_string_lossy().replace('\'', "''")))
                    .collect::<Vec<_>>()
                    .join(",");
                let mut script = format!(
                    "$p = Start-Process -FilePath '{}' -Verb RunAs -Wait -PassThru",
                    program.to_string_lossy().replace('\'', "''")
                );
                if !arg_list.is_empty() {
                    script.push_str(&format!(" -ArgumentList {arg_list}"));
                }
                script.push_str("; exit $p.ExitCode");
                (
                    "powershell".into(),
                    vec!["-NoProfile".into(), "-Command".into(), script.into()],
                )
            }
        }
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn command_line(program: &OsStr, args: &[OsString]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(OsString::as_os_str))
        .map(|s| shell_quote(&s.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    error_msg: Option<String>,
    allow_fail: bool,
    elevation: Option<Elevation>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            error_msg: None,
            allow_fail: false,
            elevation: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Message used as context when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of failing on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn as_admin(mut self, elevation: Elevation) -> Self {
        self.elevation = Some(elevation);
        self
    }

    /// Elevate only when `cond` holds.
    pub fn as_admin_if(self, cond: bool, elevation: Elevation) -> Self {
        if cond {
            self.as_admin(elevation)
        } else {
            self
        }
    }

    /// The command line as it will be shown in logs.
    pub fn display(&self) -> String {
        command_line(&self.program, &self.args)
    }

    fn command(&self) -> Command {
        let (program, args) = match self.elevation {
            Some(elevation) => elevation.wrap(&self.program, &self.args),
            None => (self.program.clone(), self.args.clone()),
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd
    }

    fn label(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    pub fn run(self) -> Result<CmdResult> {
        debug!(command = %self.display(), elevated = self.elevation.is_some(), "running");
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute '{}'", self.label()))?;

        self.finish(
            output.status,
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            None,
        )
    }

    /// Start in the background with stdin piped and output discarded.
    pub fn spawn(self) -> Result<Child> {
        debug!(command = %self.display(), "spawning");
        self.command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to execute '{}'", self.label()))
    }

    /// Run as a cancellable child: spawned and registered under the
    /// registry's lock, unregistered once reaped.
    pub fn run_registered(self, registry: &CancelRegistry) -> Result<CmdResult> {
        debug!(command = %self.display(), "running (cancellable)");
        let child = {
            let registration = registry.scoped_lock();
            let child = self
                .command()
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .with_context(|| format!("Failed to execute '{}'", self.label()))?;
            registration.register(child.id());
            child
        };
        let pid = child.id();
        let output = child.wait_with_output();
        registry.unregister(pid);
        let output = output.with_context(|| format!("Failed to wait for '{}'", self.label()))?;

        self.finish(
            output.status,
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            Some(registry),
        )
    }

    fn finish(
        self,
        status: ExitStatus,
        stdout: String,
        stderr: String,
        registry: Option<&CancelRegistry>,
    ) -> Result<CmdResult> {
        let result = CmdResult {
            status,
            stdout,
            stderr,
        };
        if result.success() || self.allow_fail {
            return Ok(result);
        }
        if registry.is_some_and(CancelRegistry::is_cancelled) {
            bail!(BuildError::Cancelled(self.display()));
        }

        let detail = format!(
            "'{}' exited with {}: {}",
            self.display(),
            status,
            result.stderr.trim()
        );
        match self.error_msg {
            Some(msg) => bail!("{msg}: {detail}"),
            None => bail!("{detail}"),
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// An executable `sh` script standing in for a host tool.
    pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
