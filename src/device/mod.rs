//! Host access to an image's data partition.
//!
//! Each host OS exposes disk images differently (loop devices, `hdiutil`
//! pseudo-devices, an ImDisk virtual drive). [`VirtualBlockDevice`] hides
//! that behind one interface and [`host_driver`] picks the implementation
//! once at startup.
//!
//! Callers normally go through [`mount_data_partition`], which returns a
//! [`MountedPartition`] that releases the device exactly once, either
//! explicitly or on drop.

pub mod linux;
pub mod macos;
pub mod selftest;
pub mod windows;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::geometry::PartitionLayout;
use crate::process::Elevation;

/// Label given to freshly formatted data partitions.
pub const DATA_LABEL: &str = "data";

/// An attached image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// What gets released on detach (`/dev/loop3`, `/dev/disk4`, `F:`).
    pub device: String,
    /// The data partition as a block device or drive.
    pub volume: String,
}

impl DeviceHandle {
    pub fn same(device: impl Into<String>) -> Self {
        let device = device.into();
        Self {
            volume: device.clone(),
            device,
        }
    }
}

pub trait VirtualBlockDevice: Send + Sync {
    fn name(&self) -> &'static str;

    /// Expose the data partition of `image` as a device.
    fn attach(&self, image: &Path, layout: &PartitionLayout) -> Result<DeviceHandle>;

    /// Create an exFAT filesystem on the attached data partition.
    fn format(&self, device: &DeviceHandle, label: &str) -> Result<()>;

    fn mount(&self, device: &DeviceHandle) -> Result<PathBuf>;

    /// Unmount and release. Unmount failures are logged; the device is
    /// released regardless and only release failures are returned.
    fn unmount(&self, mount_point: &Path, device: &DeviceHandle) -> Result<()>;

    fn detach(&self, device: &DeviceHandle) -> Result<()>;
}

/// The driver for the running OS.
pub fn host_driver(elevation: Elevation) -> Result<Arc<dyn VirtualBlockDevice>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LoopDevice::detect(elevation)))
    }
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(macos::HdiutilDevice::new(elevation)))
    }
    #[cfg(windows)]
    {
        let _ = elevation;
        Ok(Arc::new(windows::ImDiskDevice::prepare()?))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = elevation;
        anyhow::bail!(crate::error::BuildError::Configuration(
            "no virtual block device support for this OS".into()
        ))
    }
}

/// A mounted data partition. Released once, by [`release`](Self::release)
/// or on drop.
pub struct MountedPartition {
    driver: Arc<dyn VirtualBlockDevice>,
    device: Option<DeviceHandle>,
    mount_point: PathBuf,
}

impl MountedPartition {
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.device.is_none()
    }

    /// Unmount and detach. Later calls are no-ops.
    pub fn release(&mut self) -> Result<()> {
        match self.device.take() {
            Some(device) => {
                info!(mount_point = %self.mount_point.display(), device = %device.device, "releasing data partition");
                self.driver.unmount(&self.mount_point, &device)
            }
            None => Ok(()),
        }
    }
}

impl Drop for MountedPartition {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to release data partition");
        }
    }
}

/// Attach and mount the data partition of `image`.
///
/// If mounting fails the device is detached before the mount error is
/// returned.
pub fn mount_data_partition(
    driver: Arc<dyn VirtualBlockDevice>,
    image: &Path,
    layout: &PartitionLayout,
) -> Result<MountedPartition> {
    let device = driver.attach(image, layout)?;
    match driver.mount(&device) {
        Ok(mount_point) => {
            info!(driver = driver.name(), mount_point = %mount_point.display(), "data partition mounted");
            Ok(MountedPartition {
                driver,
                device: Some(device),
                mount_point,
            })
        }
        Err(e) => {
            if let Err(release) = driver.detach(&device) {
                warn!(device = %device.device, error = %release, "failed to detach after mount failure");
            }
            Err(e)
        }
    }
}

/// Create a fresh exFAT filesystem on the data partition of `image`.
pub fn format_data_partition(
    driver: &dyn VirtualBlockDevice,
    image: &Path,
    layout: &PartitionLayout,
    label: &str,
) -> Result<()> {
    let device = driver.attach(image, layout)?;
    let formatted = driver.format(&device, label);
    let detached = driver.detach(&device);
    formatted?;
    detached
}


#[cfg(test)]
mod tests {
    use super::fake::FakeDevice;
    use super::*;
    use crate::geometry::{compute_layout, DiskExtent};
    use tempfile::TempDir;

    fn layout() -> PartitionLayout {
        compute_layout(1 << 20, DiskExtent::Sectors(100_000)).unwrap()
    }

    #[test]
    fn test_release_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let fake = Arc::new(FakeDevice::new(temp.path()));
        let mut mounted =
            mount_data_partition(fake.clone(), Path::new("x.img"), &layout()).unwrap();

        mounted.release().unwrap();
        mounted.release().unwrap();
        assert!(mounted.is_released());
        drop(mounted);
        assert_eq!(fake.count("unmount"), 1);
        assert_eq!(fake.count("detach"), 1);
    }

    #[test]
    fn test_drop_releases() {
        let temp = TempDir::new().unwrap();
        let fake = Arc::new(FakeDevice::new(temp.path()));
        {
            let _mounted =
                mount_data_partition(fake.clone(), Path::new("x.img"), &layout()).unwrap();
        }
        assert_eq!(fake.count("unmount"), 1);
    }

    #[test]
    fn test_mount_failure_detaches() {
        let temp = TempDir::new().unwrap();
        let fake = Arc::new(FakeDevice {
            fail_mount: true,
            ..FakeDevice::new(temp.path())
        });
        let result = mount_data_partition(fake.clone(), Path::new("x.img"), &layout());
        assert!(result.is_err());
        assert_eq!(fake.count("detach"), 1);
        assert_eq!(fake.count("unmount"), 0);
    }

    #[test]
    fn test_format_detaches() {
        let fake = FakeDevice::new(Path::new("/unused"));
        format_data_partition(&fake, Path::new("x.img"), &layout(), DATA_LABEL).unwrap();
        assert_eq!(*fake.calls.lock(), vec!["attach", "format", "detach"]);
    }
}
