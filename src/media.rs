//! Writing a finished image to removable media.

use anyhow::{bail, Context, Result};
use rand::Rng;
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::BuildError;
use crate::fsutil::tmp_name;
use crate::process::{Cmd, Elevation, HostPlatform};

const ONE_MIB: usize = 1 << 20;

/// Copy unit. A multiple of 512 so raw Windows devices accept every write.
pub const CHUNK_SIZE: usize = 25 * ONE_MIB;

/// Size of the region compared after writing.
pub const CHALLENGE_SIZE: usize = 4 * ONE_MIB;

/// Log every this many chunks.
const LOG_EVERY: u64 = 4;

/// Shared flag asking a running write to stop between chunks.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Completed { bytes: u64 },
    Stopped { bytes: u64 },
}

/// Copy `reader` to `writer` in `chunk` sized pieces, checking `stop`
/// before each one. `progress` receives `(copied, total)`.
pub fn copy_chunks<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    chunk: usize,
    stop: &StopFlag,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<WriteOutcome> {
    let mut buf = vec![0u8; chunk];
    let mut copied = 0u64;
    let mut chunks = 0u64;

    while copied < total {
        if stop.is_stopped() {
            info!(copied, total, "write stopped");
            return Ok(WriteOutcome::Stopped { bytes: copied });
        }
        let want = usize::try_from(total - copied).map_or(chunk, |left| left.min(chunk));
        reader
            .read_exact(&mut buf[..want])
            .with_context(|| format!("Failed to read image at offset {copied}"))?;
        writer
            .write_all(&buf[..want])
            .with_context(|| format!("Failed to write device at offset {copied}"))?;
        copied += want as u64;
        chunks += 1;
        if chunks % LOG_EVERY == 0 {
            info!(copied, total, "copying image");
        }
        progress(copied, total);
    }
    writer.flush().context("Failed to flush device")?;
    Ok(WriteOutcome::Completed { bytes: copied })
}

/// Write `image` onto `device`, syncing it once complete.
pub fn write_image(
    image: &Path,
    device: &Path,
    stop: &StopFlag,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<WriteOutcome> {
    let mut source =
        File::open(image).with_context(|| format!("Failed to open '{}'", image.display()))?;
    let total = source
        .metadata()
        .with_context(|| format!("Failed to stat '{}'", image.display()))?
        .len();
    let mut target = OpenOptions::new()
        .write(true)
        .open(device)
        .map_err(|e| BuildError::device(device.display().to_string(), format!("open failed: {e}")))?;

    info!(image = %image.display(), device = %device.display(), total, "writing image to media");
    let outcome = copy_chunks(&mut source, &mut target, total, CHUNK_SIZE, stop, progress)?;
    if let WriteOutcome::Completed { .. } = outcome {
        target
            .sync_all()
            .map_err(|e| BuildError::device(device.display().to_string(), format!("sync failed: {e}")))?;
    }
    Ok(outcome)
}

/// Compare `len` bytes at `offset` in both streams.
pub fn compare_region<A: Read + Seek, B: Read + Seek>(
    image: &mut A,
    device: &mut B,
    offset: u64,
    len: usize,
) -> Result<bool> {
    let mut expected = vec![0u8; len];
    let mut actual = vec![0u8; len];
    image.seek(SeekFrom::Start(offset))?;
    image.read_exact(&mut expected).context("Failed to read image region")?;
    device.seek(SeekFrom::Start(offset))?;
    device.read_exact(&mut actual).context("Failed to read device region")?;
    Ok(expected == actual)
}

/// 512-aligned offset of a challenge region in the first 80% of the image.
pub fn challenge_offset(total: u64, len: usize) -> u64 {
    let span = total.saturating_sub(len as u64) * 8 / 10;
    let offset = if span == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=span)
    };
    offset - offset % 512
}

/// Read a random region back from `device` and compare it with `image`.
pub fn verify_written(image: &Path, device: &Path) -> Result<()> {
    let mut source =
        File::open(image).with_context(|| format!("Failed to open '{}'", image.display()))?;
    let total = source.metadata()?.len();
    let mut target = File::open(device)
        .map_err(|e| BuildError::device(device.display().to_string(), format!("open failed: {e}")))?;

    let len = usize::try_from(total).map_or(CHALLENGE_SIZE, |t| t.min(CHALLENGE_SIZE));
    let offset = challenge_offset(total, len);
    info!(offset, len, total, "verifying media");
    if !compare_region(&mut source, &mut target, offset, len)? {
        bail!(BuildError::integrity(
            device.display().to_string(),
            format!("image and media differ in the {len} bytes at offset {offset}")
        ));
    }
    Ok(())
}

/// Drive number in a `\\.\PHYSICALDRIVEn` path.
pub fn physical_drive_number(device: &str) -> Result<u32> {
    let re = Regex::new(r"\\\\\.\\PHYSICALDRIVE(\d+)")?;
    let numbers: Vec<u32> = re
        .captures_iter(device)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();
    match numbers.as_slice() {
        [n] => Ok(*n),
        _ => bail!(BuildError::Configuration(format!(
            "cannot find the physical drive number in '{device}'"
        ))),
    }
}

/// Host permission changes made so the build can write to media, undone
/// on [`MediaGrant::revert`] or drop.
pub struct MediaGrant {
    device: String,
    reverts: Vec<Cmd>,
    reverted: bool,
}

impl MediaGrant {
    /// Commands that open up `device`, and those that undo them.
    pub fn plan(
        platform: HostPlatform,
        device: &str,
        elevation: Elevation,
    ) -> Result<(Vec<Cmd>, Vec<Cmd>)> {
        Ok(match platform {
            // read access too: verification reopens the device as the user
            HostPlatform::Linux => (
                vec![Cmd::new("chmod").args(["-c", "o+rw", device]).as_admin(elevation)],
                vec![Cmd::new("chmod").args(["-c", "o-rw", device]).as_admin(elevation)],
            ),
            HostPlatform::MacOs => (
                vec![
                    Cmd::new("diskutil").args(["unmountDisk", device]),
                    Cmd::new("chmod").args(["-v", "o+rw", device]).as_admin(elevation),
                ],
                vec![Cmd::new("chmod").args(["-v", "o-rw", device]).as_admin(elevation)],
            ),
            // a cleaned disk has no volumes for Windows to lock
            HostPlatform::Windows => {
                physical_drive_number(device)?;
                (Vec::new(), Vec::new())
            }
        })
    }

    pub fn acquire(platform: HostPlatform, device: &str, elevation: Elevation) -> Result<Self> {
        let (grants, reverts) = Self::plan(platform, device, elevation)?;
        if platform == HostPlatform::Windows {
            clean_windows_disk(physical_drive_number(device)?)?;
        }
        // dropped on a failed grant, reverting whatever was applied
        let grant = Self {
            device: device.to_string(),
            reverts,
            reverted: false,
        };
        for cmd in grants {
            cmd.error_msg(format!("Failed to prepare media '{device}'")).run()?;
        }
        Ok(grant)
    }

    /// Best effort; failures are logged.
    pub fn revert(&mut self) {
        if self.reverted {
            return;
        }
        self.reverted = true;
        for cmd in self.reverts.drain(..) {
            match cmd.allow_fail().run() {
                Ok(out) if out.success() => {}
                Ok(out) => warn!(device = %self.device, stderr = out.stderr.trim(), "media permission revert failed"),
                Err(e) => warn!(device = %self.device, error = %format!("{e:#}"), "media permission revert failed"),
            }
        }
    }
}

impl Drop for MediaGrant {
    fn drop(&mut self) {
        self.revert();
    }
}

fn diskpart_script(disk: u32) -> String {
    format!("select disk {disk}\nclean\n")
}

fn clean_windows_disk(disk: u32) -> Result<()> {
    let script = std::env::temp_dir().join(tmp_name("diskpart"));
    fs::write(&script, diskpart_script(disk))
        .with_context(|| format!("Failed to write '{}'", script.display()))?;
    info!(disk, "diskpart select disk and clean");
    let result = Cmd::new("diskpart")
        .arg("/s")
        .arg_path(&script)
        .error_msg(format!("Failed to clean disk {disk}"))
        .run();
    let _ = fs::remove_file(&script);
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_copy_chunks_with_partial_tail() {
        let data = pattern(10_000);
        let mut out = Vec::new();
        let mut seen = Vec::new();
        let outcome = copy_chunks(
            &mut Cursor::new(&data),
            &mut out,
            data.len() as u64,
            4096,
            &StopFlag::new(),
            &mut |copied, _| seen.push(copied),
        )
        .unwrap();
        assert_eq!(outcome, WriteOutcome::Completed { bytes: 10_000 });
        assert_eq!(out, data);
        assert_eq!(seen, vec![4096, 8192, 10_000]);
    }

    #[test]
    fn test_stop_flag_halts_between_chunks() {
        let data = pattern(10_000);
        let stop = StopFlag::new();
        let flag = stop.clone();
        let mut out = Vec::new();
        let outcome = copy_chunks(
            &mut Cursor::new(&data),
            &mut out,
            data.len() as u64,
            4096,
            &stop,
            &mut |_, _| flag.stop(),
        )
        .unwrap();
        assert_eq!(outcome, WriteOutcome::Stopped { bytes: 4096 });
        assert_eq!(out.len(), 4096);
    }

    #[test]
    fn test_write_and_verify_file_device() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("box.img");
        let device = temp.path().join("sdcard");
        fs::write(&image, pattern(3 * 512 * 1024)).unwrap();
        fs::write(&device, b"").unwrap();

        let outcome = write_image(&image, &device, &StopFlag::new(), &mut |_, _| {}).unwrap();
        assert_eq!(outcome, WriteOutcome::Completed { bytes: 3 * 512 * 1024 });
        verify_written(&image, &device).unwrap();
    }

    #[test]
    fn test_verify_detects_difference() {
        let temp = TempDir::new().unwrap();
        let image = temp.path().join("box.img");
        let device = temp.path().join("sdcard");
        fs::write(&image, pattern(64 * 1024)).unwrap();
        fs::write(&device, vec![0u8; 64 * 1024]).unwrap();

        let err = verify_written(&image, &device).unwrap_err();
        assert!(err.to_string().contains("differ"));
    }

    #[test]
    fn test_challenge_offset_alignment() {
        for _ in 0..50 {
            let offset = challenge_offset(1 << 30, CHALLENGE_SIZE);
            assert_eq!(offset % 512, 0);
            assert!(offset <= ((1u64 << 30) - CHALLENGE_SIZE as u64) * 8 / 10);
        }
        assert_eq!(challenge_offset(1000, 1000), 0);
    }

    #[test]
    fn test_physical_drive_number() {
        assert_eq!(physical_drive_number(r"\\.\PHYSICALDRIVE2").unwrap(), 2);
        assert!(physical_drive_number("/dev/sdb").is_err());
        assert!(physical_drive_number(r"\\.\PHYSICALDRIVE1 \\.\PHYSICALDRIVE3").is_err());
    }

    #[test]
    fn test_grant_plan_per_platform() {
        let (grant, revert) =
            MediaGrant::plan(HostPlatform::Linux, "/dev/sdb", Elevation::Sudo).unwrap();
        assert_eq!(grant[0].display(), "chmod -c o+rw /dev/sdb");
        assert_eq!(revert[0].display(), "chmod -c o-rw /dev/sdb");

        let (grant, revert) =
            MediaGrant::plan(HostPlatform::MacOs, "/dev/disk4", Elevation::AppleScript).unwrap();
        assert_eq!(grant[0].display(), "diskutil unmountDisk /dev/disk4");
        assert_eq!(grant[1].display(), "chmod -v o+rw /dev/disk4");
        assert_eq!(revert[0].display(), "chmod -v o-rw /dev/disk4");

        assert!(MediaGrant::plan(HostPlatform::Windows, "E:", Elevation::RunAs).is_err());
        assert_eq!(diskpart_script(2), "select disk 2\nclean\n");
    }
}
