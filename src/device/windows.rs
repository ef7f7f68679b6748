//! Windows driver: the ImDisk virtual disk driver mounts partition 3 of the
//! image as a drive letter.

use anyhow::{bail, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{DeviceHandle, VirtualBlockDevice};
use crate::error::BuildError;
use crate::geometry::PartitionLayout;
use crate::process::Cmd;

/// Letters never handed out.
const RESERVED_LETTERS: &[char] = &['A', 'B', 'C'];

const IMDISK_SERVICES: &[&str] = &["imdsksvc", "awealloc", "imdisk"];

/// Drive letters listed by `wmic logicaldisk get caption`.
pub fn parse_wmic_letters(output: &str) -> BTreeSet<char> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            let mut chars = line.chars();
            match (chars.next(), chars.next(), chars.next()) {
                (Some(letter), Some(':'), None) if letter.is_ascii_alphabetic() => {
                    Some(letter.to_ascii_uppercase())
                }
                _ => None,
            }
        })
        .collect()
}

/// Drive letters mapped to network shares in `net use` output.
pub fn parse_net_use_letters(output: &str) -> BTreeSet<char> {
    let Ok(re) = Regex::new(r"\s+([A-Z]):\s+\\") else {
        return BTreeSet::new();
    };
    output
        .lines()
        .filter_map(|line| re.captures(line))
        .filter_map(|caps| caps.get(1)?.as_str().chars().next())
        .collect()
}

/// First letter, alphabetically, not in `used` or reserved.
pub fn first_free_letter(used: &BTreeSet<char>) -> Option<char> {
    ('A'..='Z').find(|l| !RESERVED_LETTERS.contains(l) && !used.contains(l))
}

#[derive(Debug, Clone)]
pub struct ImDiskDevice {
    imdisk: PathBuf,
}

impl ImDiskDevice {
    /// Locate ImDisk, installing the bundled driver first if it is absent.
    pub fn prepare() -> Result<Self> {
        let system32 = std::env::var_os("SystemRoot")
            .map(|root| PathBuf::from(root).join("System32"))
            .unwrap_or_else(|| PathBuf::from(r"C:\Windows\System32"));
        let device = Self {
            imdisk: system32.join("imdisk.exe"),
        };
        if !device.imdisk.exists() {
            device.install(&system32)?;
        }
        if !device.imdisk.exists() {
            bail!(BuildError::device(
                "imdisk",
                "driver installation finished but imdisk.exe is missing; reboot and retry"
            ));
        }
        Ok(device)
    }

    fn install(&self, system32: &Path) -> Result<()> {
        let installer = std::env::current_exe()?
            .parent()
            .map(|dir| dir.join("imdiskinst"))
            .unwrap_or_else(|| PathBuf::from("imdiskinst"));
        info!(installer = %installer.display(), "installing ImDisk driver");

        Cmd::new(system32.join("rundll32.exe"))
            .args(["setupapi.dll,InstallHinfSection", "DefaultInstall", "132"])
            .arg_path(&installer.join("imdisk.inf"))
            .run()
            .map_err(|e| {
                BuildError::device("imdisk", format!("driver installation failed, reboot and retry: {e:#}"))
            })?;

        let failed: Vec<&str> = IMDISK_SERVICES
            .iter()
            .copied()
            .filter(|service| {
                !Cmd::new("net")
                    .args(["start", *service])
                    .allow_fail()
                    .run()
                    .map(|r| r.success())
                    .unwrap_or(false)
            })
            .collect();
        if !failed.is_empty() {
            bail!(BuildError::device(
                "imdisk",
                format!("installed but failed to start: {}; reboot and retry", failed.join(" "))
            ));
        }
        Ok(())
    }

    fn free_letter(&self) -> Result<char> {
        let wmic = Cmd::new("wmic")
            .args(["logicaldisk", "get", "caption"])
            .run()?;
        let net = Cmd::new("net").arg("use").allow_fail().run()?;

        let mut used = parse_wmic_letters(&wmic.stdout);
        used.extend(parse_net_use_letters(&net.stdout));
        first_free_letter(&used)
            .ok_or_else(|| BuildError::device("imdisk", "no free drive letter").into())
    }
}

impl VirtualBlockDevice for ImDiskDevice {
    fn name(&self) -> &'static str {
        "imdisk"
    }

    fn attach(&self, image: &Path, _layout: &PartitionLayout) -> Result<DeviceHandle> {
        let drive = format!("{}:", self.free_letter()?);
        Cmd::new(&self.imdisk)
            .args(["-a", "-f"])
            .arg_path(image)
            .args(["-o", "rw", "-t", "file", "-v", "3", "-m", drive.as_str()])
            .run()
            .map_err(|e| BuildError::device(&drive, format!("{e:#}")))?;
        Ok(DeviceHandle::same(drive))
    }

    fn format(&self, device: &DeviceHandle, label: &str) -> Result<()> {
        let label = format!("/V:{label}");
        Cmd::new("format")
            .args([device.volume.as_str(), "/FS:exFAT", label.as_str(), "/Q", "/Y"])
            .run()
            .map_err(|e| BuildError::device(&device.volume, format!("{e:#}")))?;
        Ok(())
    }

    fn mount(&self, device: &DeviceHandle) -> Result<PathBuf> {
        // the drive letter is live as soon as ImDisk attaches it
        Ok(PathBuf::from(format!("{}\\", device.volume)))
    }

    fn unmount(&self, _mount_point: &Path, device: &DeviceHandle) -> Result<()> {
        self.detach(device)
    }

    fn detach(&self, device: &DeviceHandle) -> Result<()> {
        let out = Cmd::new(&self.imdisk)
            .args(["-D", "-m", device.device.as_str()])
            .allow_fail()
            .run()?;
        if !out.success() {
            warn!(drive = %device.device, stderr = out.stderr.trim(), "imdisk forced removal failed");
            bail!(BuildError::device(&device.device, "imdisk could not remove the drive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wmic() {
        let out = "Caption  \r\nC:       \r\nD:       \r\nF:       \r\n\r\n";
        let letters = parse_wmic_letters(out);
        assert_eq!(letters.into_iter().collect::<String>(), "CDF");
    }

    #[test]
    fn test_parse_net_use() {
        let out = "\
New connections will be remembered.

Status       Local     Remote                    Network
-------------------------------------------------------------------------------
OK           E:        \\\\server\\share            Microsoft Windows Network
Disconnected G:        \\\\nas\\media               Microsoft Windows Network
The command completed successfully.
";
        let letters = parse_net_use_letters(out);
        assert_eq!(letters.into_iter().collect::<String>(), "EG");
    }

    #[test]
    fn test_first_free_letter_skips_used_and_reserved() {
        let used: BTreeSet<char> = ['C', 'D', 'E', 'G'].into_iter().collect();
        assert_eq!(first_free_letter(&used), Some('F'));
        assert_eq!(first_free_letter(&BTreeSet::new()), Some('D'));

        let all: BTreeSet<char> = ('A'..='Z').collect();
        assert_eq!(first_free_letter(&all), None);
    }
}
