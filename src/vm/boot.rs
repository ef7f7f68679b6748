//! Unattended login over the emulator's serial console.
//!
//! The console is a raw byte stream with no framing. A reader thread turns
//! it into [`ConsoleEvent`]s; [`Console::wait_for_signal`] consumes them
//! through a ring buffer the size of the expected signal and compares after
//! every byte. Each wait arms a one-shot [`Timer`] whose expiry arrives on
//! the same channel, tagged with the wait's generation so a late expiry
//! from an earlier wait is ignored.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::error::BuildError;

const READ_CHUNK: usize = 1024;

/// Buffer snapshots kept for diagnostics.
const MAX_DIAGNOSTIC_STATES: usize = 64;

#[derive(Debug)]
pub enum ConsoleEvent {
    Data(Vec<u8>),
    Closed,
    /// Timer expiry for the wait with this generation.
    Expired(u64),
}

/// One-shot timers.
pub trait Timer: Send + Sync {
    /// Call `on_expiry` once after `after`, unless the returned handle is
    /// cancelled or dropped first.
    fn arm(&self, after: Duration, on_expiry: Box<dyn FnOnce() + Send>) -> ArmedTimer;
}

/// Handle to an armed timer. Dropping it cancels the timer.
pub struct ArmedTimer {
    cancel: Option<Sender<()>>,
}

impl ArmedTimer {
    /// A handle with nothing to cancel.
    pub fn inert() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

/// A watchdog thread per armed timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTimer;

impl Timer for ThreadTimer {
    fn arm(&self, after: Duration, on_expiry: Box<dyn FnOnce() + Send>) -> ArmedTimer {
        let (tx, rx) = mpsc::channel::<()>();
        thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(after) {
                on_expiry();
            }
        });
        ArmedTimer { cancel: Some(tx) }
    }
}

/// Fixed-capacity window over the most recent bytes.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, byte: u8) {
        if self.capacity == 0 {
            return;
        }
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(byte);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Exact-length match against `signal`.
    pub fn matches(&self, signal: &[u8]) -> bool {
        self.buf.len() == signal.len() && self.buf.iter().eq(signal.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Fail with [`BuildError::EmulationTimeout`].
    Strict,
    /// Return what was seen instead of failing.
    Diagnostic,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Matched,
    /// Chunks received before expiry (diagnostic mode only).
    TimedOut(Vec<Vec<u8>>),
}

/// Both directions of the serial console.
pub struct Console {
    events: Receiver<ConsoleEvent>,
    notify: Sender<ConsoleEvent>,
    input: Box<dyn Write + Send>,
    timer: Arc<dyn Timer>,
    generation: u64,
    /// Bytes received after the last match, consumed by the next wait.
    pending: Vec<u8>,
    closed: bool,
}

impl Console {
    /// Start reading `output` on a dedicated thread.
    pub fn spawn<R>(output: R, input: Box<dyn Write + Send>, timer: Arc<dyn Timer>) -> Self
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let reader_tx = tx.clone();
        thread::spawn(move || read_console(output, reader_tx));
        Self {
            events: rx,
            notify: tx,
            input,
            timer,
            generation: 0,
            pending: Vec::new(),
            closed: false,
        }
    }

    /// Write `bytes` as one discrete console write.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.input
            .write_all(bytes)
            .and_then(|()| self.input.flush())
            .context("Failed to write to emulator console")
    }

    /// Wait until the last `signal.len()` bytes received equal `signal`.
    pub fn wait_for_signal(
        &mut self,
        signal: &[u8],
        timeout: Duration,
        mode: WaitMode,
    ) -> Result<WaitOutcome> {
        self.generation += 1;
        let generation = self.generation;
        let shown = String::from_utf8_lossy(signal).into_owned();
        debug!(signal = %shown.escape_debug(), ?timeout, "waiting for console signal");

        let mut ring = RingBuffer::new(signal.len());
        let mut states: Vec<Vec<u8>> = Vec::new();

        let pending = std::mem::take(&mut self.pending);
        if self.feed(&mut ring, &pending, signal) {
            return Ok(WaitOutcome::Matched);
        }

        let notify = self.notify.clone();
        let armed = self.timer.arm(
            timeout,
            Box::new(move || {
                let _ = notify.send(ConsoleEvent::Expired(generation));
            }),
        );

        loop {
            if self.closed {
                return self.expire(&shown, timeout, mode, states, Some("console closed"));
            }
            // a sender is held by self, so recv only fails if the channel is gone
            let event = self.events.recv().unwrap_or(ConsoleEvent::Closed);
            match event {
                ConsoleEvent::Data(chunk) => {
                    trace!(target: "console", "{}", String::from_utf8_lossy(&chunk));
                    if mode == WaitMode::Diagnostic && states.len() < MAX_DIAGNOSTIC_STATES {
                        states.push(chunk.clone());
                    }
                    if self.feed(&mut ring, &chunk, signal) {
                        armed.cancel();
                        return Ok(WaitOutcome::Matched);
                    }
                }
                ConsoleEvent::Closed => self.closed = true,
                ConsoleEvent::Expired(g) if g == generation => {
                    return self.expire(&shown, timeout, mode, states, None);
                }
                ConsoleEvent::Expired(stale) => trace!(stale, "ignoring stale timer"),
            }
        }
    }

    /// Push bytes through `ring`; on a match keep the remainder for later.
    fn feed(&mut self, ring: &mut RingBuffer, bytes: &[u8], signal: &[u8]) -> bool {
        for (i, &byte) in bytes.iter().enumerate() {
            ring.push(byte);
            if ring.matches(signal) {
                self.pending = bytes[i + 1..].to_vec();
                return true;
            }
        }
        false
    }

    fn expire(
        &self,
        signal: &str,
        timeout: Duration,
        mode: WaitMode,
        states: Vec<Vec<u8>>,
        detail: Option<&str>,
    ) -> Result<WaitOutcome> {
        match mode {
            WaitMode::Diagnostic => Ok(WaitOutcome::TimedOut(states)),
            WaitMode::Strict => bail!(BuildError::EmulationTimeout {
                signal: signal.to_string(),
                timeout,
                detail: detail.map(str::to_string),
            }),
        }
    }
}

fn read_console<R: Read>(mut output: R, tx: Sender<ConsoleEvent>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match output.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(ConsoleEvent::Data(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "console read failed");
                break;
            }
        }
    }
    let _ = tx.send(ConsoleEvent::Closed);
}

/// What the login automation types and waits for.
#[derive(Debug, Clone)]
pub struct BootScript {
    pub username: String,
    pub password: String,
    pub login_prompt: Vec<u8>,
    pub password_prompt: Vec<u8>,
    pub shell_prompt: Vec<u8>,
    /// Typed one chunk at a time, each echo awaited, then submitted.
    pub enable_chunks: Vec<String>,
    pub timeout: Duration,
    /// Username resends allowed when the password prompt does not show.
    pub password_retries: u32,
    /// Pause after the guest logs out, before services are used.
    pub settle_delay: Duration,
}

impl Default for BootScript {
    fn default() -> Self {
        Self {
            username: "pi".into(),
            password: "raspberry".into(),
            login_prompt: b"login: ".to_vec(),
            password_prompt: b"Password: ".to_vec(),
            shell_prompt: b":~$ ".to_vec(),
            enable_chunks: vec![
                "sudo systemctl".into(),
                " start ssh;".into(),
                " exit".into(),
            ],
            timeout: Duration::from_secs(10 * 60),
            password_retries: 3,
            settle_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    AwaitLoginPrompt,
    SendUsername,
    AwaitPasswordPrompt,
    SendPassword,
    AwaitShellPrompt,
    SendEnableCommands,
    AwaitLogout,
    Ready,
}

/// Log in, enable the SSH service and log out again.
pub fn run_boot(console: &mut Console, script: &BootScript) -> Result<()> {
    let mut state = BootState::AwaitLoginPrompt;
    let mut resends = 0u32;

    while state != BootState::Ready {
        debug!(?state, "boot sequence");
        state = match state {
            BootState::AwaitLoginPrompt => {
                console.wait_for_signal(&script.login_prompt, script.timeout, WaitMode::Strict)?;
                BootState::SendUsername
            }
            BootState::SendUsername => {
                console.write(format!("{}\n", script.username).as_bytes())?;
                BootState::AwaitPasswordPrompt
            }
            BootState::AwaitPasswordPrompt => {
                match console.wait_for_signal(
                    &script.password_prompt,
                    script.timeout,
                    WaitMode::Diagnostic,
                )? {
                    WaitOutcome::Matched => BootState::SendPassword,
                    WaitOutcome::TimedOut(states) => {
                        let seen: Vec<String> = states
                            .iter()
                            .map(|s| String::from_utf8_lossy(s).into_owned())
                            .collect();
                        warn!(resends, ?seen, "password prompt did not appear");
                        if resends >= script.password_retries {
                            bail!(BuildError::EmulationTimeout {
                                signal: String::from_utf8_lossy(&script.password_prompt).into_owned(),
                                timeout: script.timeout,
                                detail: Some(format!("after {resends} username resends")),
                            });
                        }
                        resends += 1;
                        BootState::SendUsername
                    }
                }
            }
            BootState::SendPassword => {
                console.write(format!("{}\n", script.password).as_bytes())?;
                BootState::AwaitShellPrompt
            }
            BootState::AwaitShellPrompt => {
                console.wait_for_signal(&script.shell_prompt, script.timeout, WaitMode::Strict)?;
                BootState::SendEnableCommands
            }
            BootState::SendEnableCommands => {
                // the console drops characters on long writes
                for chunk in &script.enable_chunks {
                    console.write(chunk.as_bytes())?;
                    console.wait_for_signal(chunk.as_bytes(), script.timeout, WaitMode::Strict)?;
                }
                console.write(b"\n")?;
                BootState::AwaitLogout
            }
            BootState::AwaitLogout => {
                console.wait_for_signal(&script.login_prompt, script.timeout, WaitMode::Strict)?;
                if !script.settle_delay.is_zero() {
                    info!(delay = ?script.settle_delay, "waiting for guest services");
                    thread::sleep(script.settle_delay);
                }
                BootState::Ready
            }
            BootState::Ready => BootState::Ready,
        };
    }
    info!("guest console login sequence complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use parking_lot::Mutex;

    /// Blocks on a channel; each message is one read.
    struct ChannelReader {
        rx: Receiver<Vec<u8>>,
        leftover: Vec<u8>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.leftover.is_empty() {
                match self.rx.recv() {
                    Ok(chunk) => self.leftover = chunk,
                    Err(_) => return Ok(0),
                }
            }
            let n = self.leftover.len().min(buf.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            Ok(n)
        }
    }

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Never fires on its own; expiries are triggered by hand.
    #[derive(Default)]
    struct ManualTimer {
        armed: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    }

    impl ManualTimer {
        fn fire(&self, index: usize) {
            let callback = self.armed.lock().remove(index);
            callback();
        }
    }

    impl Timer for ManualTimer {
        fn arm(&self, _after: Duration, on_expiry: Box<dyn FnOnce() + Send>) -> ArmedTimer {
            self.armed.lock().push(on_expiry);
            ArmedTimer::inert()
        }
    }

    /// Expires as soon as it is armed.
    struct ImmediateTimer;

    impl Timer for ImmediateTimer {
        fn arm(&self, _after: Duration, on_expiry: Box<dyn FnOnce() + Send>) -> ArmedTimer {
            on_expiry();
            ArmedTimer::inert()
        }
    }

    /// Never fires for the first `skip` arms, then expires immediately.
    struct FireAfter {
        skip: usize,
        armed: std::sync::atomic::AtomicUsize,
    }

    impl Timer for FireAfter {
        fn arm(&self, _after: Duration, on_expiry: Box<dyn FnOnce() + Send>) -> ArmedTimer {
            let n = self.armed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n >= self.skip {
                on_expiry();
            }
            ArmedTimer::inert()
        }
    }

    fn console(timer: Arc<dyn Timer>) -> (Console, Sender<Vec<u8>>, SharedWriter) {
        let (tx, rx) = mpsc::channel();
        let writer = SharedWriter::default();
        let reader = ChannelReader {
            rx,
            leftover: Vec::new(),
        };
        (
            Console::spawn(reader, Box::new(writer.clone()), timer),
            tx,
            writer,
        )
    }

    #[test]
    fn test_ring_buffer_is_bounded() {
        let mut ring = RingBuffer::new(3);
        for b in b"abcdef" {
            ring.push(*b);
            assert!(ring.len() <= 3);
        }
        assert!(ring.matches(b"def"));
        assert!(!ring.matches(b"ef"));
    }

    #[test]
    fn test_signal_split_across_reads() {
        let (mut console, tx, _) = console(Arc::new(ManualTimer::default()));
        tx.send(b"Raspbian GNU/Linux\nraspberrypi log".to_vec()).unwrap();
        tx.send(b"in: ".to_vec()).unwrap();

        let outcome = console
            .wait_for_signal(b"login: ", Duration::from_secs(600), WaitMode::Strict)
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Matched);
    }

    #[test]
    fn test_timeout_with_injected_timer() {
        let (mut console, tx, _) = console(Arc::new(ImmediateTimer));
        tx.send(b"kernel messages without a prompt".to_vec()).unwrap();

        let err = console
            .wait_for_signal(b"login: ", Duration::from_secs(600), WaitMode::Strict)
            .unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(BuildError::EmulationTimeout { .. })
        ));
        drop(tx);
    }

    #[test]
    fn test_diagnostic_mode_returns_states() {
        let timer = Arc::new(ManualTimer::default());
        let (mut console, tx, _) = console(timer.clone());
        tx.send(b"Login incorrect\n".to_vec()).unwrap();

        let waiter = thread::spawn(move || {
            let outcome = console
                .wait_for_signal(b"Password: ", Duration::from_secs(1), WaitMode::Diagnostic)
                .unwrap();
            (console, outcome)
        });
        while timer.armed.lock().is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        // let the reader deliver before expiring
        thread::sleep(Duration::from_millis(50));
        timer.fire(0);

        let (_console, outcome) = waiter.join().unwrap();
        assert_eq!(
            outcome,
            WaitOutcome::TimedOut(vec![b"Login incorrect\n".to_vec()])
        );
        drop(tx);
    }

    #[test]
    fn test_stale_expiry_is_ignored() {
        let timer = Arc::new(ManualTimer::default());
        let (mut console, tx, _) = console(timer.clone());

        tx.send(b"login: ".to_vec()).unwrap();
        console
            .wait_for_signal(b"login: ", Duration::from_secs(1), WaitMode::Strict)
            .unwrap();
        // expiry of the finished wait arrives late
        timer.fire(0);

        tx.send(b"Password: ".to_vec()).unwrap();
        let outcome = console
            .wait_for_signal(b"Password: ", Duration::from_secs(1), WaitMode::Strict)
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Matched);
    }

    #[test]
    fn test_bytes_after_match_are_kept() {
        let (mut console, tx, _) = console(Arc::new(ManualTimer::default()));
        tx.send(b"login: Password: ".to_vec()).unwrap();
        console
            .wait_for_signal(b"login: ", Duration::from_secs(1), WaitMode::Strict)
            .unwrap();
        let outcome = console
            .wait_for_signal(b"Password: ", Duration::from_secs(1), WaitMode::Strict)
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Matched);
    }

    #[test]
    fn test_closed_console_fails_fast() {
        let (mut console, tx, _) = console(Arc::new(ManualTimer::default()));
        tx.send(b"Kernel panic".to_vec()).unwrap();
        drop(tx);
        let err = console
            .wait_for_signal(b"login: ", Duration::from_secs(600), WaitMode::Strict)
            .unwrap_err();
        assert!(err.to_string().contains("console closed"));
    }

    #[test]
    fn test_full_boot_sequence_writes_chunks() {
        let (mut console, tx, writer) = console(Arc::new(ManualTimer::default()));
        let script = BootScript {
            settle_delay: Duration::ZERO,
            ..Default::default()
        };
        // the guest side: prompts and echoes in order
        for chunk in [
            "raspberrypi login: ",
            "Password: ",
            "pi@raspberrypi:~$ ",
            "sudo systemctl",
            " start ssh;",
            " exit",
            "\r\nlogout\r\n\r\nraspberrypi login: ",
        ] {
            tx.send(chunk.as_bytes().to_vec()).unwrap();
        }

        run_boot(&mut console, &script).unwrap();
        let typed = String::from_utf8(writer.0.lock().clone()).unwrap();
        assert_eq!(typed, "pi\nraspberry\nsudo systemctl start ssh; exit\n");
    }

    #[test]
    fn test_password_retry_is_bounded() {
        let timer = FireAfter {
            skip: 1,
            armed: Default::default(),
        };
        let (mut console, tx, writer) = console(Arc::new(timer));
        let script = BootScript {
            settle_delay: Duration::ZERO,
            password_retries: 2,
            ..Default::default()
        };
        tx.send(b"raspberrypi login: ".to_vec()).unwrap();

        let err = run_boot(&mut console, &script).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(BuildError::EmulationTimeout { .. })
        ));
        let typed = String::from_utf8(writer.0.lock().clone()).unwrap();
        // first attempt plus two resends
        assert_eq!(typed, "pi\npi\npi\n");
        drop(tx);
    }
}
