//! macOS driver: `hdiutil attach -nomount` exposes the image's partitions as
//! `/dev/diskN` slices; the data partition is slice 3.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{DeviceHandle, VirtualBlockDevice};
use crate::error::BuildError;
use crate::fsutil::tmp_name;
use crate::geometry::PartitionLayout;
use crate::process::{Cmd, Elevation};

const DATA_SLICE: u32 = 3;

/// First device node in `hdiutil attach` output.
pub fn parse_attached_device(hdiutil_output: &str) -> Option<String> {
    hdiutil_output
        .lines()
        .next()?
        .split_whitespace()
        .next()
        .filter(|dev| dev.starts_with("/dev/disk"))
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct HdiutilDevice {
    elevation: Elevation,
}

impl HdiutilDevice {
    pub fn new(elevation: Elevation) -> Self {
        Self { elevation }
    }
}

impl VirtualBlockDevice for HdiutilDevice {
    fn name(&self) -> &'static str {
        "hdiutil"
    }

    fn attach(&self, image: &Path, _layout: &PartitionLayout) -> Result<DeviceHandle> {
        let out = Cmd::new("hdiutil")
            .args(["attach", "-nomount"])
            .arg_path(image)
            .run()
            .map_err(|e| BuildError::device(image.display().to_string(), format!("{e:#}")))?;

        let Some(device) = parse_attached_device(&out.stdout) else {
            bail!(BuildError::device(
                image.display().to_string(),
                format!("unexpected hdiutil output: {:?}", out.stdout)
            ));
        };
        Ok(DeviceHandle {
            volume: format!("{device}s{DATA_SLICE}"),
            device,
        })
    }

    fn format(&self, device: &DeviceHandle, label: &str) -> Result<()> {
        Cmd::new("diskutil")
            .args(["eraseVolume", "ExFAT", label, device.volume.as_str()])
            .run()
            .map_err(|e| BuildError::device(&device.volume, format!("{e:#}")))?;
        // eraseVolume leaves the volume mounted under /Volumes
        Cmd::new("diskutil")
            .args(["unmount", device.volume.as_str()])
            .allow_fail()
            .run()?;
        Ok(())
    }

    fn mount(&self, device: &DeviceHandle) -> Result<PathBuf> {
        let mount_point = std::env::temp_dir().join(tmp_name("appliance-data"));
        fs::create_dir_all(&mount_point)
            .with_context(|| format!("Failed to create '{}'", mount_point.display()))?;

        let mounted = Cmd::new("mount")
            .args(["-t", "exfat", device.volume.as_str()])
            .arg_path(&mount_point)
            .run();
        if let Err(e) = mounted {
            let _ = fs::remove_dir(&mount_point);
            bail!(BuildError::device(&device.volume, format!("mount failed: {e:#}")));
        }
        Ok(mount_point)
    }

    fn unmount(&self, mount_point: &Path, device: &DeviceHandle) -> Result<()> {
        match Cmd::new("umount").arg_path(mount_point).allow_fail().run() {
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
        let detached = Cmd::new("hdiutil")
            .args(["detach", device.device.as_str()])
            .allow_fail()
            .run()?;
        if detached.success() {
            return Ok(());
        }
        // a lingering Finder or Spotlight handle needs -force
        Cmd::new("hdiutil")
            .args(["detach", "-force", device.device.as_str()])
            .as_admin(self.elevation)
            .run()
            .map_err(|e| BuildError::device(&device.device, format!("detach failed: {e:#}")))?;
        Ok(())
    }
}
