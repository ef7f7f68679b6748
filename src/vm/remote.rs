//! Remote shell into the guest over the forwarded SSH port.
//!
//! The system `ssh` client is driven non-interactively: the password goes
//! through `sshpass -e` and host keys are neither checked nor recorded, the
//! guest being a throwaway emulator on localhost.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::process::shell_quote;

/// `-o` options for every ssh invocation.
const SSH_OPTS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "ConnectTimeout=10",
];

/// One line of remote command output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLine<'a> {
    Stdout(&'a str),
    Stderr(&'a str),
}

pub trait RemoteShell: Send {
    /// Run `command` through the remote shell, streaming output lines to
    /// `sink`. Returns the exit status.
    fn exec(&mut self, command: &str, sink: &mut dyn FnMut(OutputLine<'_>)) -> Result<i32>;

    /// Copy a local file to `remote`.
    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<()>;

    /// Copy the contents of a local directory into `remote`, creating it.
    fn upload_dir(&mut self, local: &Path, remote: &str) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SshShell {
    client: PathBuf,
    host: String,
    port: u16,
    user: String,
    password: String,
}

impl SshShell {
    pub fn new(port: u16, user: &str, password: &str) -> Self {
        Self {
            client: PathBuf::from("sshpass"),
            host: "127.0.0.1".into(),
            port,
            user: user.into(),
            password: password.into(),
        }
    }

    /// Use another `sshpass` compatible launcher.
    pub fn client(mut self, program: impl Into<PathBuf>) -> Self {
        self.client = program.into();
        self
    }

    /// Connect, retrying while the guest's sshd comes up.
    pub fn connect(port: u16, user: &str, password: &str, attempts: u32) -> Result<Self> {
        let mut shell = Self::new(port, user, password);
        let mut last = String::new();
        for attempt in 1..=attempts.max(1) {
            match shell.exec("true", &mut |_| {}) {
                Ok(0) => {
                    info!(port, "connected to guest over ssh");
                    return Ok(shell);
                }
                Ok(status) => last = format!("exit status {status}"),
                Err(e) => last = format!("{e:#}"),
            }
            debug!(attempt, port, reason = %last, "ssh not ready");
            thread::sleep(Duration::from_secs(2));
        }
        bail!("Could not connect to guest ssh on port {port}: {last}")
    }

    fn ssh(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new(&self.client);
        cmd.arg("-e")
            .arg("ssh")
            .args(SSH_OPTS)
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", self.user, self.host))
            .arg(remote_command)
            .env("SSHPASS", &self.password);
        cmd
    }

    /// Run `remote_command` with `feed` writing its stdin.
    fn pipe_into(
        &self,
        remote_command: &str,
        feed: impl FnOnce(&mut dyn Write) -> Result<()>,
    ) -> Result<()> {
        let mut child = self
            .ssh(remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn ssh")?;

        let fed = match child.stdin.take() {
            Some(mut stdin) => feed(&mut stdin),
            None => Err(anyhow::anyhow!("ssh stdin unavailable")),
        };
        let output = child.wait_with_output().context("Failed to wait for ssh")?;
        fed?;
        if !output.status.success() {
            bail!(
                "'{}' failed on guest: {}",
                remote_command,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Feed `reader` to `each` line by line, without the line ending. Bytes
/// that are not UTF-8 are replaced, never an error.
fn for_each_line(reader: impl Read, mut each: impl FnMut(&str)) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&raw);
        each(line.trim_end_matches(|c| c == '\n' || c == '\r'));
    }
}

/// Tar `dir`'s contents (not the directory itself) into `out`.
pub fn write_dir_tar(dir: &Path, out: &mut dyn Write) -> Result<()> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk '{}'", dir.display()))?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("'{}' escaped '{}'", entry.path().display(), dir.display()))?;
        builder
            .append_path_with_name(entry.path(), rel)
            .with_context(|| format!("Failed to archive '{}'", entry.path().display()))?;
    }
    builder.finish().context("Failed to finish tar stream")?;
    Ok(())
}

impl RemoteShell for SshShell {
    fn exec(&mut self, command: &str, sink: &mut dyn FnMut(OutputLine<'_>)) -> Result<i32> {
        let mut child = self
            .ssh(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn ssh")?;

        let stderr = child.stderr.take();
        let stderr_reader = thread::spawn(move || -> Vec<String> {
            let mut lines = Vec::new();
            if let Some(stderr) = stderr {
                if let Err(e) = for_each_line(stderr, |line| lines.push(line.to_string())) {
                    debug!(error = %e, "stopped reading remote stderr");
                }
            }
            lines
        });

        let read = match child.stdout.take() {
            Some(stdout) => for_each_line(stdout, |line| sink(OutputLine::Stdout(line))),
            None => Ok(()),
        };
        if read.is_err() {
            // nothing drains stdout any more
            let _ = child.kill();
        }
        for line in stderr_reader.join().unwrap_or_default() {
            sink(OutputLine::Stderr(&line));
        }
        let status = child.wait().context("Failed to wait for ssh");

        read.context("Failed to read remote output")?;
        // signals surface as -1
        Ok(status?.code().unwrap_or(-1))
    }

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let mut file =
            File::open(local).with_context(|| format!("Failed to open '{}'", local.display()))?;
        self.pipe_into(&format!("cat > {}", shell_quote(remote)), |stdin| {
            io::copy(&mut file, stdin)
                .with_context(|| format!("Failed to upload '{}'", local.display()))?;
            Ok(())
        })
    }

    fn upload_dir(&mut self, local: &Path, remote: &str) -> Result<()> {
        let remote = shell_quote(remote);
        self.pipe_into(
            &format!("mkdir -p {remote} && tar -x -C {remote}"),
            |stdin| write_dir_tar(local, stdin),
        )
    }

    fn close(&mut self) -> Result<()> {
        // every call is its own connection
        Ok(())
    }
}
