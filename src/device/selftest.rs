//! Verify the host can mount, write and remount a data partition before a
//! long build depends on it.

use anyhow::{bail, Context, Result};
use rand::Rng;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{mount_data_partition, VirtualBlockDevice};
use crate::error::BuildError;
use crate::geometry::PartitionLayout;

const MARKER_FILE: &str = ".check-part";

/// Write a random marker value, remount, read it back and clean up.
pub fn check_mount_procedure(
    driver: Arc<dyn VirtualBlockDevice>,
    image: &Path,
    layout: &PartitionLayout,
) -> Result<()> {
    let value: u32 = rand::thread_rng().gen_range(0..1_000_000);

    {
        let mut mounted = mount_data_partition(Arc::clone(&driver), image, layout)?;
        let marker = mounted.mount_point().join(MARKER_FILE);
        fs::write(&marker, value.to_string())
            .with_context(|| format!("Failed to write marker '{}'", marker.display()))?;
        mounted.release()?;
    }

    let mut mounted = mount_data_partition(driver, image, layout)?;
    let marker = mounted.mount_point().join(MARKER_FILE);
    let read = fs::read_to_string(&marker)
        .with_context(|| format!("Failed to read marker '{}'", marker.display()))?;
    let _ = fs::remove_file(&marker);
    mounted.release()?;

    if read.trim() != value.to_string() {
        bail!(BuildError::device(
            image.display().to_string(),
            format!("marker mismatch after remount: wrote {value}, read {:?}", read.trim())
        ));
    }
    info!(image = %image.display(), "mount procedure verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;
    use crate::geometry::{compute_layout, DiskExtent};
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_through_fake_device() {
        let temp = TempDir::new().unwrap();
        let fake = Arc::new(FakeDevice::new(&temp.path().join("mnt")));
        let layout = compute_layout(1 << 20, DiskExtent::Sectors(100_000)).unwrap();

        check_mount_procedure(fake.clone(), Path::new("x.img"), &layout).unwrap();
        assert_eq!(fake.count("mount"), 2);
        assert_eq!(fake.count("unmount"), 2);
        assert!(!temp.path().join("mnt").join(MARKER_FILE).exists());
    }
}
