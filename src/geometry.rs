//! Partition geometry for the appliance's data partition.
//!
//! The system area (boot + root) occupies the start of the disk; the exFAT
//! data partition follows it, aligned to 128 sectors, and runs to the end
//! of the disk. Both the host-side mount (loop offset) and the disk report
//! parser derive their numbers from [`compute_layout`] so they always agree.

use anyhow::{bail, Result};
use regex::Regex;

use crate::error::BuildError;

pub const SECTOR_SIZE: u64 = 512;

/// Partition boundaries are aligned to this many sectors.
pub const ALIGNMENT_SECTORS: u64 = 128;

/// Space left unused at the end of a disk sized in bytes.
pub const END_MARGIN_BYTES: u64 = 4 * 1024 * 1024;

/// Disk sizes in the boundary utility are given in decimal gigabytes.
pub const ONE_GB: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub sector_size: u64,
    pub root_start: u64,
    pub root_end: u64,
    pub data_start: u64,
    pub data_end: u64,
}

impl PartitionLayout {
    pub fn data_offset_bytes(&self) -> u64 {
        self.data_start * self.sector_size
    }

    pub fn data_size_bytes(&self) -> u64 {
        (self.data_end - self.data_start + 1) * self.sector_size
    }
}

/// How the total disk extent is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskExtent {
    /// Total sector count, as reported by a partitioning tool.
    Sectors(i64),
    /// Byte budget for the whole image.
    Bytes(i64),
}

fn align_up(sector: u64) -> u64 {
    sector.div_ceil(ALIGNMENT_SECTORS) * ALIGNMENT_SECTORS
}

fn non_negative(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| BuildError::Configuration(format!("{what} must not be negative: {value}")).into())
}

/// Compute the data partition placement for a system area of
/// `root_size_bytes` measured from the start of the disk.
///
/// With [`DiskExtent::Sectors`] the data partition runs to the last sector.
/// With [`DiskExtent::Bytes`] it stops [`END_MARGIN_BYTES`] short of the end.
///
/// `root_end` is rounded up to a 128-sector boundary and `data_start` is
/// the next boundary after it, i.e. `root_end + 128`, not `root_end + 1`.
/// Layouts that put the data partition on the sector right after the root
/// partition, or that round `root_end + 512` bytes, differ from this by up
/// to 127 sectors. The `partition-boundaries` utility, which the guest's
/// resize pass reads, prints these same numbers, so the partition table and
/// the host-side loop offset agree.
pub fn compute_layout(root_size_bytes: i64, disk: DiskExtent) -> Result<PartitionLayout> {
    let root_size = non_negative(root_size_bytes, "root partition size")?;

    let root_end = align_up(root_size / SECTOR_SIZE);
    let data_start = align_up(root_end + 1);

    let data_end = match disk {
        DiskExtent::Sectors(total) => {
            let total = non_negative(total, "disk sector count")?;
            if total == 0 {
                bail!(BuildError::Configuration("disk has no sectors".into()));
            }
            total - 1
        }
        DiskExtent::Bytes(bytes) => {
            let bytes = non_negative(bytes, "disk size")?;
            let usable = bytes.saturating_sub(END_MARGIN_BYTES) / SECTOR_SIZE;
            if usable == 0 {
                bail!(BuildError::Configuration(format!(
                    "disk size {bytes} is smaller than the end margin"
                )));
            }
            usable - 1
        }
    };

    if data_start > data_end {
        bail!(BuildError::Configuration(format!(
            "root partition ({root_size} bytes) exceeds disk size ({disk:?})"
        )));
    }

    Ok(PartitionLayout {
        sector_size: SECTOR_SIZE,
        root_start: 0,
        root_end,
        data_start,
        data_end,
    })
}

/// Byte offset of the data partition inside an image.
pub fn data_partition_offset(root_size_bytes: u64) -> u64 {
    align_up(align_up(root_size_bytes / SECTOR_SIZE) + 1) * SECTOR_SIZE
}

/// Derive partition boundaries from a textual disk report (`fdisk -l`).
///
/// The report must contain exactly one disk summary line and exactly one
/// Linux partition line; the root partition's existing start sector is
/// kept and the rest is recomputed for a system area of `root_size_bytes`.
/// When `disk_size_bytes` is given it must agree with the reported sector
/// count.
pub fn parse_boundaries(
    report: &str,
    root_size_bytes: u64,
    disk_size_bytes: Option<u64>,
) -> Result<PartitionLayout> {
    let target = if report.contains(".img") {
        r"[0-9a-zA-Z.\-_]+\.img"
    } else {
        r"/dev/[0-9a-z]+"
    };

    let disk_re = Regex::new(&format!(r"^Disk {target}:.*, (\d+) sectors$"))?;
    let part_re = Regex::new(&format!(
        r"^{target}\d +(\d+) +(\d+) +\d+ +\S+ +\d+ +Linux$"
    ))?;

    let total_sectors: u64 = single_capture(report, &disk_re, "disk sector count")?;
    let root_start: u64 = single_capture(report, &part_re, "root partition")?;

    if let Some(bytes) = disk_size_bytes {
        if bytes / SECTOR_SIZE != total_sectors {
            bail!(BuildError::Configuration(format!(
                "disk size {bytes} bytes is {} sectors but the report has {total_sectors}",
                bytes / SECTOR_SIZE
            )));
        }
    }

    let root_size = i64::try_from(root_size_bytes)
        .map_err(|_| BuildError::Configuration("root size out of range".into()))?;
    let sectors = i64::try_from(total_sectors)
        .map_err(|_| BuildError::Configuration("sector count out of range".into()))?;
    let layout = compute_layout(root_size, DiskExtent::Sectors(sectors))?;

    if root_start >= layout.root_end {
        bail!(BuildError::Configuration(format!(
            "root partition starts at sector {root_start}, past the requested end {}",
            layout.root_end
        )));
    }

    Ok(PartitionLayout {
        root_start,
        ..layout
    })
}

fn single_capture(report: &str, re: &Regex, what: &str) -> Result<u64> {
    let matches: Vec<&str> = report
        .lines()
        .filter_map(|line| re.captures(line.trim_end()))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();

    match matches.as_slice() {
        [value] => Ok(value.parse()?),
        [] => bail!(BuildError::AmbiguousReport(format!("no line matches the {what}"))),
        many => bail!(BuildError::AmbiguousReport(format!(
            "{} lines match the {what}",
            many.len()
        ))),
    }
}
