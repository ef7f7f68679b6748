//! Emulated ARM guest booted from the image under construction.

use anyhow::{bail, Context, Result};
use rand::Rng;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::boot::{run_boot, BootScript, Console, ThreadTimer, Timer};
use super::remote::{OutputLine, RemoteShell, SshShell};
use crate::cancel::CancelRegistry;
use crate::error::BuildError;

/// Default guest memory.
pub const DEFAULT_RAM: &str = "2G";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

const SSH_ATTEMPTS: u32 = 15;

/// Opens the remote shell once the console login is done, given the
/// forwarded port.
pub type ShellConnector =
    Arc<dyn Fn(u16, &BootScript) -> Result<Box<dyn RemoteShell>> + Send + Sync>;

fn ssh_connector() -> ShellConnector {
    Arc::new(|port: u16, script: &BootScript| -> Result<Box<dyn RemoteShell>> {
        let shell = SshShell::connect(port, &script.username, &script.password, SSH_ATTEMPTS)?;
        Ok(Box::new(shell))
    })
}

/// Builder for the emulator command line.
#[derive(Clone)]
pub struct Emulator {
    binary: PathBuf,
    kernel: PathBuf,
    dtb: PathBuf,
    image: PathBuf,
    ram: String,
    machine: String,
    script: BootScript,
    connect: ShellConnector,
    timer: Arc<dyn Timer>,
}

impl Emulator {
    pub fn new(kernel: PathBuf, dtb: PathBuf, image: PathBuf) -> Self {
        Self {
            binary: PathBuf::from("qemu-system-arm"),
            kernel,
            dtb,
            image,
            ram: DEFAULT_RAM.into(),
            machine: "vexpress-a15".into(),
            script: BootScript::default(),
            connect: ssh_connector(),
            timer: Arc::new(ThreadTimer),
        }
    }

    pub fn binary(mut self, binary: PathBuf) -> Self {
        self.binary = binary;
        self
    }

    pub fn ram(mut self, ram: &str) -> Self {
        self.ram = ram.to_string();
        self
    }

    pub fn boot_script(mut self, script: BootScript) -> Self {
        self.script = script;
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    pub fn connector(mut self, connect: ShellConnector) -> Self {
        self.connect = connect;
        self
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn image_size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.image)
            .with_context(|| format!("Failed to stat '{}'", self.image.display()))?
            .len())
    }

    /// Grow the image file to `new_size` bytes. Shrinking is refused.
    pub fn resize_image(&self, new_size: u64) -> Result<()> {
        let current = self.image_size()?;
        if new_size < current {
            bail!(BuildError::Configuration(format!(
                "cannot decrease image size ({current} bytes) to {new_size} bytes"
            )));
        }
        let file = OpenOptions::new()
            .write(true)
            .open(&self.image)
            .with_context(|| format!("Failed to open '{}'", self.image.display()))?;
        file.set_len(new_size)
            .with_context(|| format!("Failed to resize '{}'", self.image.display()))?;
        info!(image = %self.image.display(), from = current, to = new_size, "resized image");
        Ok(())
    }

    pub fn command(&self, ssh_port: u16) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-m", &self.ram, "-M", &self.machine]);
        cmd.arg("-kernel").arg(&self.kernel);
        cmd.arg("-dtb").arg(&self.dtb);
        cmd.args([
            "-append",
            "root=/dev/mmcblk0p2 console=ttyAMA0 console=tty",
            "-serial",
            "stdio",
        ]);
        cmd.args([
            "-drive",
            &format!("format=raw,if=sd,file={}", self.image.display()),
        ]);
        // user-mode network with the guest's sshd forwarded to localhost
        cmd.args([
            "-net",
            "nic",
            "-net",
            &format!("user,id=eth0,hostfwd=tcp::{ssh_port}-:22"),
        ]);
        cmd.args(["-display", "none", "-no-reboot"]);
        cmd.args(["-smp", "2", "--accel", "tcg,thread=multi", "-no-acpi"]);
        cmd
    }

    /// Boot the guest, hand a session to `f`, then shut the guest down
    /// whatever `f` returned.
    pub fn run<T>(
        &self,
        registry: &CancelRegistry,
        f: impl FnOnce(&mut VmSession) -> Result<T>,
    ) -> Result<T> {
        let port = free_port()?;
        let mut cmd = self.command(port);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        info!(image = %self.image.display(), port, "starting emulator");

        let child = {
            let registration = registry.scoped_lock();
            let child = cmd
                .spawn()
                .with_context(|| format!("Failed to start '{}'", self.binary.display()))?;
            registration.register(child.id());
            child
        };
        let mut guest = GuestProcess {
            child,
            registry,
            reaped: false,
        };

        let (Some(stdout), Some(stdin)) = (guest.child.stdout.take(), guest.child.stdin.take())
        else {
            bail!("emulator stdio unavailable");
        };
        if let Some(stderr) = guest.child.stderr.take() {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(std::io::Result::ok) {
                    warn!(target: "emulator", "{line}");
                }
            });
        }

        let mut console = Console::spawn(stdout, Box::new(stdin), Arc::clone(&self.timer));
        if let Err(e) = run_boot(&mut console, &self.script) {
            if registry.is_cancelled() {
                bail!(BuildError::Cancelled("emulator stopped during boot".into()));
            }
            return Err(e);
        }

        let shell = (self.connect)(port, &self.script)?;
        let mut session = VmSession::new(shell);
        let result = f(&mut session);
        // the guest gets its full grace period even when the request failed
        let requested = session.shutdown();
        let waited = guest.wait(SHUTDOWN_TIMEOUT);
        let shutdown = match (requested, waited) {
            (Ok(()), waited) => waited,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(waited)) => {
                warn!(error = %format!("{waited:#}"), "waiting for the emulator also failed");
                Err(e)
            }
        };

        match (result, shutdown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(shutdown)) => {
                warn!(error = %format!("{shutdown:#}"), "guest shutdown also failed");
                Err(e)
            }
        }
    }
}

/// A localhost port free at the time of the call.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("Failed to find a free port")?;
    Ok(listener.local_addr()?.port())
}

/// Emulator process registered for cancellation. Killed if dropped
/// before it was reaped.
struct GuestProcess<'a> {
    child: Child,
    registry: &'a CancelRegistry,
    reaped: bool,
}

impl GuestProcess<'_> {
    /// Wait for a clean exit, killing the process once `timeout` passes.
    fn wait(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.reap();
                    debug!(%status, "emulator exited");
                    return Ok(());
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(500)),
                Ok(None) => {
                    warn!("emulator did not power off in time, killing it");
                    self.kill();
                    return Ok(());
                }
                Err(e) => {
                    self.kill();
                    return Err(e).context("Failed to wait for emulator");
                }
            }
        }
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reap();
    }

    fn reap(&mut self) {
        self.registry.unregister(self.child.id());
        self.reaped = true;
    }
}

impl Drop for GuestProcess<'_> {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill();
        }
    }
}

/// How [`VmSession::exec`] treats a command.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Fail on non-zero exit.
    pub check: bool,
    /// Return stdout.
    pub capture: bool,
    /// Logged and reported instead of the real command.
    pub display: Option<String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            check: true,
            capture: false,
            display: None,
        }
    }
}

impl ExecOptions {
    pub fn unchecked() -> Self {
        Self {
            check: false,
            ..Default::default()
        }
    }

    pub fn capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn display(mut self, shown: impl Into<String>) -> Self {
        self.display = Some(shown.into());
        self
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub status: i32,
    /// Present when captured.
    pub stdout: Option<String>,
}

/// Receives every stdout line of remote commands.
pub type LineHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Remote access to a booted guest.
pub struct VmSession {
    shell: Box<dyn RemoteShell>,
    line_hook: Option<LineHook>,
}

impl VmSession {
    pub(crate) fn new(shell: Box<dyn RemoteShell>) -> Self {
        Self {
            shell,
            line_hook: None,
        }
    }

    pub fn set_line_hook(&mut self, hook: LineHook) {
        self.line_hook = Some(hook);
    }

    pub fn exec(&mut self, command: &str, opts: ExecOptions) -> Result<ExecResult> {
        let shown = opts.display.as_deref().unwrap_or(command).to_string();
        info!(target: "guest", "$ {shown}");

        let mut captured = String::new();
        let capture = opts.capture;
        let hook = self.line_hook.clone();
        let status = self.shell.exec(command, &mut |line| match line {
            OutputLine::Stdout(text) => {
                info!(target: "guest", "{text}");
                if let Some(hook) = &hook {
                    hook(text);
                }
                if capture {
                    captured.push_str(text);
                    captured.push('\n');
                }
            }
            OutputLine::Stderr(text) => warn!(target: "guest", "STDERR: {text}"),
        })?;

        if opts.check && status != 0 {
            bail!(BuildError::Provisioning {
                command: shown,
                status,
            });
        }
        Ok(ExecResult {
            status,
            stdout: capture.then_some(captured),
        })
    }

    /// Upload through a temporary path, then move into place as root.
    pub fn put_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let tmp = remote_tmp_path();
        self.shell.upload_file(local, &tmp)?;
        self.move_into_place(&tmp, remote)
    }

    pub fn put_dir(&mut self, local: &Path, remote: &str) -> Result<()> {
        let tmp = remote_tmp_path();
        self.shell.upload_dir(local, &tmp)?;
        self.move_into_place(&tmp, remote)
    }

    fn move_into_place(&mut self, tmp: &str, remote: &str) -> Result<()> {
        let cmd = format!(
            "sudo mv -T {} {}",
            crate::process::shell_quote(tmp),
            crate::process::shell_quote(remote)
        );
        self.exec(&cmd, ExecOptions::default())?;
        Ok(())
    }

    /// Ask the guest to power off, then close the shell either way.
    fn shutdown(&mut self) -> Result<()> {
        info!("powering off guest");
        // the connection drops mid-command, so the status is meaningless
        let requested = self.exec("sudo shutdown -P 0", ExecOptions::unchecked());
        let closed = self.shell.close();
        match (requested, closed) {
            (Ok(_), closed) => closed,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close)) => {
                warn!(error = %format!("{close:#}"), "closing the remote shell also failed");
                Err(e)
            }
        }
    }
}

/// `/tmp/` plus 31 random hex digits.
fn remote_tmp_path() -> String {
    let mut rng = rand::thread_rng();
    let hex: String = (0..31)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect();
    format!("/tmp/{hex}")
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use parking_lot::Mutex;

    /// Records calls; statuses are looked up by command prefix.
    #[derive(Clone, Default)]
    pub struct FakeShell {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub statuses: Arc<Mutex<Vec<(String, i32)>>>,
        pub stdout: Arc<Mutex<Vec<String>>>,
        /// Commands with this prefix fail to run at all.
        pub broken: Arc<Mutex<Option<String>>>,
    }

    impl FakeShell {
        pub fn fail_on(&self, prefix: &str, status: i32) {
            self.statuses.lock().push((prefix.to_string(), status));
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl RemoteShell for FakeShell {
        fn exec(&mut self, command: &str, sink: &mut dyn FnMut(OutputLine<'_>)) -> Result<i32> {
            self.calls.lock().push(format!("exec {command}"));
            if let Some(prefix) = self.broken.lock().as_deref() {
                if command.starts_with(prefix) {
                    anyhow::bail!("connection reset by guest");
                }
            }
            for line in self.stdout.lock().iter() {
                sink(OutputLine::Stdout(line));
            }
            let status = self
                .statuses
                .lock()
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                .map(|(_, s)| *s)
                .unwrap_or(0);
            Ok(status)
        }

        fn upload_file(&mut self, local: &Path, remote: &str) -> Result<()> {
            self.calls
                .lock()
                .push(format!("file {} {remote}", local.display()));
            Ok(())
        }

        fn upload_dir(&mut self, local: &Path, remote: &str) -> Result<()> {
            self.calls
                .lock()
                .push(format!("dir {} {remote}", local.display()));
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.calls.lock().push("close".into());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeShell;
    use super::*;
    use crate::error::classify;
    use tempfile::TempDir;

    #[test]
    fn test_command_line() {
        let emu = Emulator::new("k".into(), "d.dtb".into(), "/tmp/x.img".into());
        let args: Vec<String> = emu
            .command(5022)
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let line = args.join(" ");
        assert!(line.starts_with("-m 2G -M vexpress-a15 -kernel k -dtb d.dtb"));
        assert!(line.contains("-drive format=raw,if=sd,file=/tmp/x.img"));
        assert!(line.contains("hostfwd=tcp::5022-:22"));
        assert!(line.ends_with("-no-acpi"));
    }

    #[test]
    fn test_resize_grows_and_refuses_shrink() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("x.img");
        std::fs::write(&image, vec![0u8; 4096]).unwrap();
        let emu = Emulator::new("k".into(), "d".into(), image.clone());

        emu.resize_image(8192).unwrap();
        assert_eq!(emu.image_size().unwrap(), 8192);

        let err = emu.resize_image(1024).unwrap_err();
        assert!(err.to_string().contains("cannot decrease image size"));
        assert_eq!(emu.image_size().unwrap(), 8192);
    }

    #[test]
    fn test_put_file_goes_through_tmp() {
        let shell = FakeShell::default();
        let mut session = VmSession::new(Box::new(shell.clone()));
        session
            .put_file(Path::new("/local/extra-vars.yml"), "/var/lib/ansible/vars.yml")
            .unwrap();

        let calls = shell.calls();
        assert_eq!(calls.len(), 2);
        let tmp = calls[0].rsplit(' ').next().unwrap().to_string();
        assert!(tmp.starts_with("/tmp/"));
        assert_eq!(tmp.len(), "/tmp/".len() + 31);
        assert_eq!(
            calls[1],
            format!("exec sudo mv -T {tmp} /var/lib/ansible/vars.yml")
        );
    }

    #[test]
    fn test_exec_failure_is_provisioning_error_with_display() {
        let shell = FakeShell::default();
        shell.fail_on("ansible-playbook", 2);
        let mut session = VmSession::new(Box::new(shell));

        let err = session
            .exec(
                "ansible-playbook --extra-vars 'pw=secret'",
                ExecOptions::default().display("ansible-playbook --extra-vars 'pw=****'"),
            )
            .unwrap_err();
        match classify(&err) {
            Some(BuildError::Provisioning { command, status }) => {
                assert_eq!(*status, 2);
                assert!(!command.contains("secret"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_exec_capture_and_unchecked() {
        let shell = FakeShell::default();
        shell.stdout.lock().push("Linux raspberrypi".into());
        shell.fail_on("false", 1);
        let mut session = VmSession::new(Box::new(shell));

        let out = session
            .exec("uname -a", ExecOptions::default().capture())
            .unwrap();
        assert_eq!(out.stdout.as_deref(), Some("Linux raspberrypi\n"));

        let out = session.exec("false", ExecOptions::unchecked()).unwrap();
        assert_eq!(out.status, 1);
        assert_eq!(out.stdout, None);
    }

    #[test]
    fn test_line_hook_sees_stdout() {
        let shell = FakeShell::default();
        shell.stdout.lock().push("TASK [reboot] ****".into());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        let mut session = VmSession::new(Box::new(shell));
        session.set_line_hook(Arc::new(move |line| sink.lock().push(line.to_string())));

        session.exec("true", ExecOptions::default()).unwrap();
        assert_eq!(*seen.lock(), vec!["TASK [reboot] ****"]);
    }

    #[test]
    fn test_shutdown_closes_shell_after_failed_request() {
        let shell = FakeShell::default();
        *shell.broken.lock() = Some("sudo shutdown".into());
        let mut session = VmSession::new(Box::new(shell.clone()));

        let err = session.shutdown().unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(shell.calls(), vec!["exec sudo shutdown -P 0", "close"]);
    }

    /// Emulator stand-in that plays the serial login, then exits after a
    /// second the way a powered-off guest does, leaving `marker` behind.
    #[cfg(unix)]
    fn booting_guest(dir: &Path, marker: &Path) -> PathBuf {
        crate::process::test_support::write_script(
            dir,
            "qemu-system-arm",
            &format!(
                "printf 'raspberrypi login: '\n\
                 read user\n\
                 printf 'Password: '\n\
                 read password\n\
                 printf 'pi@raspberrypi:~$ '\n\
                 printf 'sudo systemctl start ssh; exit'\n\
                 read line\n\
                 printf '\\nraspberrypi login: '\n\
                 sleep 1\n\
                 touch '{}'\n",
                marker.display()
            ),
        )
    }

    #[cfg(unix)]
    fn test_emulator(dir: &Path, binary: PathBuf, shell: &FakeShell) -> Emulator {
        let shell = shell.clone();
        let connect: ShellConnector =
            Arc::new(move |_port: u16, _script: &BootScript| -> Result<Box<dyn RemoteShell>> {
                Ok(Box::new(shell.clone()))
            });
        Emulator::new("k".into(), "d.dtb".into(), dir.join("x.img"))
            .binary(binary)
            .boot_script(BootScript {
                timeout: Duration::from_secs(20),
                settle_delay: Duration::ZERO,
                ..BootScript::default()
            })
            .connector(connect)
    }

    #[cfg(unix)]
    #[test]
    fn test_run_registers_then_powers_off_and_unregisters() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("powered-off");
        let shell = FakeShell::default();
        let emu = test_emulator(temp.path(), booting_guest(temp.path(), &marker), &shell);
        let registry = CancelRegistry::new();

        let seen = emu
            .run(&registry, |vm| {
                vm.exec("uname -a", ExecOptions::default())?;
                Ok(registry.registered())
            })
            .unwrap();

        assert_eq!(seen.len(), 1);
        assert!(registry.registered().is_empty());
        assert_eq!(
            shell.calls(),
            vec!["exec uname -a", "exec sudo shutdown -P 0", "close"]
        );
        // waited for, not killed
        assert!(marker.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_run_waits_for_guest_when_shutdown_request_fails() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("powered-off");
        let shell = FakeShell::default();
        *shell.broken.lock() = Some("sudo shutdown".into());
        let emu = test_emulator(temp.path(), booting_guest(temp.path(), &marker), &shell);
        let registry = CancelRegistry::new();

        let err = emu.run(&registry, |_| Ok(())).unwrap_err();

        assert!(err.to_string().contains("connection reset"));
        assert!(shell.calls().contains(&"close".to_string()));
        assert!(marker.exists());
        assert!(registry.registered().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_boot_failure_reaps_and_unregisters() {
        let temp = TempDir::new().unwrap();
        let binary = crate::process::test_support::write_script(temp.path(), "qemu-system-arm", "exit 1\n");
        let shell = FakeShell::default();
        let emu = test_emulator(temp.path(), binary, &shell);
        let registry = CancelRegistry::new();

        let err = emu.run(&registry, |_| Ok(())).unwrap_err();

        assert!(matches!(classify(&err), Some(BuildError::EmulationTimeout { .. })));
        assert!(registry.registered().is_empty());
        assert!(shell.calls().is_empty());
    }

    #[test]
    fn test_free_port_is_nonzero() {
        assert_ne!(free_port().unwrap(), 0);
    }
}
