//! Loop-device driver: `losetup` with an offset into the image, exFAT
//! mounted natively or through `mount.exfat-fuse`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{DeviceHandle, VirtualBlockDevice};
use crate::error::BuildError;
use crate::fsutil::tmp_name;
use crate::geometry::PartitionLayout;
use crate::process::{Cmd, Elevation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExfatSupport {
    Native,
    /// User-space driver.
    Fuse,
}

/// Whether `/proc/filesystems` lists exfat.
pub fn has_native_exfat(proc_filesystems: &str) -> bool {
    proc_filesystems
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|fs| fs == "exfat")
}

pub fn detect_exfat() -> ExfatSupport {
    match fs::read_to_string("/proc/filesystems") {
        Ok(list) if has_native_exfat(&list) => ExfatSupport::Native,
        _ => ExfatSupport::Fuse,
    }
}

/// Label flag for `mkfs.exfat`: `-L` for exfatprogs, `-n` for the older
/// exfat-utils, told apart by the `-V` banner.
pub fn exfat_label_flag(version_banner: &str) -> &'static str {
    if version_banner.contains("exfatprogs") {
        "-L"
    } else {
        "-n"
    }
}

#[derive(Debug, Clone)]
pub struct LoopDevice {
    elevation: Elevation,
    exfat: ExfatSupport,
}

impl LoopDevice {
    pub fn new(elevation: Elevation, exfat: ExfatSupport) -> Self {
        Self { elevation, exfat }
    }

    pub fn detect(elevation: Elevation) -> Self {
        let exfat = detect_exfat();
        debug!(?exfat, "exfat support");
        Self::new(elevation, exfat)
    }

    fn owner_options() -> String {
        #[cfg(unix)]
        {
            // SAFETY: getuid/getgid cannot fail.
            let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
            format!("uid={uid},gid={gid}")
        }
        #[cfg(not(unix))]
        {
            String::new()
        }
    }

    pub(crate) fn mount_command(&self, volume: &str, mount_point: &Path) -> Cmd {
        let cmd = match self.exfat {
            ExfatSupport::Native => Cmd::new("mount").args(["-t", "exfat"]),
            ExfatSupport::Fuse => Cmd::new("mount.exfat-fuse"),
        };
        let options = Self::owner_options();
        let cmd = if options.is_empty() {
            cmd
        } else {
            cmd.args(["-o", options.as_str()])
        };
        cmd.arg(volume).arg_path(mount_point).as_admin(self.elevation)
    }

    pub(crate) fn format_command(&self, volume: &str, label: &str, label_flag: &str) -> Cmd {
        Cmd::new("mkfs.exfat")
            .args([label_flag, label])
            .arg(volume)
            .as_admin(self.elevation)
    }
}

impl VirtualBlockDevice for LoopDevice {
    fn name(&self) -> &'static str {
        "loop"
    }

    fn attach(&self, image: &Path, layout: &PartitionLayout) -> Result<DeviceHandle> {
        let offset = layout.data_offset_bytes().to_string();
        let size = layout.data_size_bytes().to_string();
        let out = Cmd::new("losetup")
            .args(["--find", "--show", "--offset", offset.as_str(), "--sizelimit", size.as_str()])
            .arg_path(image)
            .as_admin(self.elevation)
            .run()
            .map_err(|e| BuildError::device(image.display().to_string(), format!("{e:#}")))?;

        let device = out.stdout_trimmed().to_string();
        if !device.starts_with("/dev/loop") {
            bail!(BuildError::device(
                image.display().to_string(),
                format!("unexpected losetup output: {device:?}")
            ));
        }
        debug!(device = %device, image = %image.display(), "attached");
        Ok(DeviceHandle::same(device))
    }

    fn format(&self, device: &DeviceHandle, label: &str) -> Result<()> {
        let banner = Cmd::new("mkfs.exfat").arg("-V").allow_fail().run()?;
        let flag = exfat_label_flag(&format!("{}{}", banner.stdout, banner.stderr));
        self.format_command(&device.volume, label, flag)
            .run()
            .map_err(|e| BuildError::device(&device.volume, format!("{e:#}")))?;
        Ok(())
    }

    fn mount(&self, device: &DeviceHandle) -> Result<PathBuf> {
        let mount_point = std::env::temp_dir().join(tmp_name("appliance-data"));
        fs::create_dir_all(&mount_point)
            .with_context(|| format!("Failed to create '{}'", mount_point.display()))?;

        if let Err(e) = self.mount_command(&device.volume, &mount_point).run() {
            let _ = fs::remove_dir(&mount_point);
            bail!(BuildError::device(&device.volume, format!("mount failed: {e:#}")));
        }
        Ok(mount_point)
    }

    fn unmount(&self, mount_point: &Path, device: &DeviceHandle) -> Result<()> {
        let umount = Cmd::new("umount")
            .arg_path(mount_point)
            .as_admin(self.elevation)
            .allow_fail()
            .run();
        match umount {
            Ok(out) if out.success() => {
                if let Err(e) = fs::remove_dir(mount_point) {
                    warn!(mount_point = %mount_point.display(), error = %e, "failed to remove mount point");
                }
            }
            Ok(out) => warn!(mount_point = %mount_point.display(), stderr = out.stderr.trim(), "umount failed"),
            Err(e) => warn!(mount_point = %mount_point.display(), error = %e, "umount failed"),
        }
        self.detach(device)
    }

    fn detach(&self, device: &DeviceHandle) -> Result<()> {
        Cmd::new("losetup")
            .arg("-d")
            .arg(&device.device)
            .as_admin(self.elevation)
            .run()
            .map_err(|e| BuildError::device(&device.device, format!("detach failed: {e:#}")))?;
        Ok(())
    }
}
