//! Checksum-verified download cache.
//!
//! Entries live in `<build dir>/cache/` under their descriptor name and are
//! reused across runs. A download streams into a temporary file inside the
//! cache directory and is renamed into place only after its length and
//! checksum have been verified, so a cache path either holds a complete
//! archive or nothing at all.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::descriptor::ContentDescriptor;
use crate::error::BuildError;
use crate::fsutil::{sha256_file, tmp_name};

/// HTTP statuses worth retrying.
const RETRY_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Already cached with a matching checksum; no request was made.
    Found,
    Downloaded,
}

/// Byte counts of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Content-Length announced by the server, when known.
    pub expected: Option<u64>,
    pub received: u64,
}

#[derive(Debug)]
pub enum FetchError {
    /// Connection failures and retryable statuses.
    Transient(String),
    Fatal(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "{msg} (transient)"),
            Self::Fatal(msg) => f.write_str(msg),
        }
    }
}

/// Streams a URL into a sink.
pub trait HttpFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<Transfer, FetchError>;
}

/// Blocking `reqwest` client.
pub struct ReqwestFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .user_agent(concat!("appliance-builder/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<Transfer, FetchError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let msg = format!("HTTP {status}");
            return Err(if RETRY_STATUSES.contains(&status.as_u16()) {
                FetchError::Transient(msg)
            } else {
                FetchError::Fatal(msg)
            });
        }

        let expected = response.content_length();
        let received = response
            .copy_to(sink)
            .map_err(|e| FetchError::Transient(format!("transfer interrupted: {e}")))?;
        Ok(Transfer { expected, received })
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Whether `descriptor` is present in `cache_dir` with the expected size and,
/// when `verify_checksum` is set, the expected checksum.
pub fn is_cached(descriptor: &ContentDescriptor, cache_dir: &Path, verify_checksum: bool) -> bool {
    let path = descriptor.cache_path(cache_dir);
    let size_ok = fs::metadata(&path)
        .map(|m| m.is_file() && m.len() == descriptor.archive_size())
        .unwrap_or(false);
    if !size_ok {
        return false;
    }
    if !verify_checksum {
        return true;
    }
    match sha256_file(&path) {
        Ok(sum) => sum.eq_ignore_ascii_case(descriptor.checksum()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not checksum cache entry");
            false
        }
    }
}

/// Download `descriptor` into `cache_dir` unless a verified copy is there.
pub fn download_if_missing(
    descriptor: &ContentDescriptor,
    cache_dir: &Path,
    fetcher: &dyn HttpFetcher,
    retry: &RetryPolicy,
) -> Result<FetchStatus> {
    if is_cached(descriptor, cache_dir, true) {
        debug!(name = descriptor.name(), "found in cache");
        return Ok(FetchStatus::Found);
    }

    fs::create_dir_all(cache_dir)
        .with_context(|| format!("Failed to create cache dir '{}'", cache_dir.display()))?;
    let _lock = CacheLock::acquire(cache_dir, descriptor.name())?;

    let dest = descriptor.cache_path(cache_dir);
    let tmp = cache_dir.join(format!(".{}.part", tmp_name(descriptor.name())));
    let result = fetch_with_retry(descriptor, &tmp, fetcher, retry)
        .and_then(|()| verify_download(descriptor, &tmp))
        .and_then(|()| {
            fs::rename(&tmp, &dest).with_context(|| {
                format!("Failed to move download into '{}'", dest.display())
            })
        });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;

    info!(name = descriptor.name(), url = descriptor.url(), "downloaded");
    Ok(FetchStatus::Downloaded)
}

fn fetch_with_retry(
    descriptor: &ContentDescriptor,
    tmp: &Path,
    fetcher: &dyn HttpFetcher,
    retry: &RetryPolicy,
) -> Result<()> {
    let url = descriptor.url();
    let attempts = retry.attempts.max(1);
    let mut attempt = 1;
    loop {
        info!(url, attempt, attempts, "downloading {}", descriptor.name());
        let file = File::create(tmp)
            .with_context(|| format!("Failed to create '{}'", tmp.display()))?;
        let mut sink = BufWriter::new(file);

        let outcome = fetcher.fetch(url, &mut sink).and_then(|transfer| {
            sink.flush()
                .map_err(|e| FetchError::Fatal(format!("write failed: {e}")))?;
            Ok(transfer)
        });

        match outcome {
            Ok(transfer) => {
                if let Some(expected) = transfer.expected {
                    if expected != transfer.received {
                        bail!(BuildError::integrity(
                            url,
                            format!(
                                "received {} bytes, server announced {expected}",
                                transfer.received
                            )
                        ));
                    }
                }
                return Ok(());
            }
            Err(FetchError::Transient(reason)) if attempt < attempts => {
                let delay = retry.delay(attempt);
                warn!(url, attempt, %reason, ?delay, "transient download failure, retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => {
                bail!(BuildError::Download {
                    url: url.to_string(),
                    reason: format!("{err} after {attempt} attempt(s)"),
                });
            }
        }
    }
}

fn verify_download(descriptor: &ContentDescriptor, tmp: &Path) -> Result<()> {
    let size = fs::metadata(tmp)
        .with_context(|| format!("Failed to stat '{}'", tmp.display()))?
        .len();
    if size != descriptor.archive_size() {
        bail!(BuildError::integrity(
            descriptor.name(),
            format!("size {size} differs from expected {}", descriptor.archive_size())
        ));
    }
    let sum = sha256_file(tmp)?;
    if !sum.eq_ignore_ascii_case(descriptor.checksum()) {
        bail!(BuildError::integrity(
            descriptor.name(),
            format!("checksum {sum} differs from expected {}", descriptor.checksum())
        ));
    }
    Ok(())
}

/// RAII guard: unlocks and removes the lock file on drop.
#[derive(Debug)]
struct CacheLock {
    _file: File,
    path: PathBuf,
}

impl CacheLock {
    fn acquire(cache_dir: &Path, name: &str) -> Result<Self> {
        let path = cache_dir.join(format!(".{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!(
                "Cache entry '{name}' is locked by another process: {}",
                path.display()
            );
        }
        Ok(Self { _file: file, path })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
