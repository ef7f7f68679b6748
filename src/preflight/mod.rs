//! Preflight checks run before a build starts.
//!
//! Verifies the host has the tools the build shells out to and enough free
//! space in the build directory, so a long build does not fail halfway on
//! something detectable up front.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::error::BuildError;
use crate::process::HostPlatform;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Required host tools per platform. Each tuple is (command, package).
pub fn required_tools(platform: HostPlatform) -> &'static [(&'static str, &'static str)] {
    match platform {
        HostPlatform::Linux => &[
            ("qemu-system-arm", "qemu-system-arm"),
            ("losetup", "util-linux"),
            ("mount", "util-linux"),
            ("mkfs.exfat", "exfatprogs"),
            ("tar", "tar"),
            ("ssh", "openssh-client"),
            ("sshpass", "sshpass"),
        ],
        HostPlatform::MacOs => &[
            ("qemu-system-arm", "qemu"),
            ("hdiutil", "macOS"),
            ("diskutil", "macOS"),
            ("tar", "macOS"),
            ("ssh", "macOS"),
            ("sshpass", "sshpass"),
        ],
        HostPlatform::Windows => &[
            ("qemu-system-arm", "QEMU for Windows"),
            ("tar", "Windows 10 or later"),
            ("ssh", "OpenSSH client"),
            ("sshpass", "sshpass"),
        ],
    }
}

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool with its package.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!(BuildError::Configuration(format!(
            "Missing required host tools:\n{msg}"
        )));
    }

    Ok(())
}

/// Without native exFAT, Linux mounts through the FUSE driver.
pub fn check_exfat_support() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use crate::device::linux::{detect_exfat, ExfatSupport};
        if detect_exfat() == ExfatSupport::Fuse {
            debug!("no native exfat, checking for the fuse driver");
            check_required_tools(&[("mount.exfat-fuse", "exfat-fuse")])?;
        }
    }
    Ok(())
}

/// Fail unless `dir` has at least `required` bytes available.
pub fn check_free_space(dir: &Path, required: u64) -> Result<()> {
    let available = fs2::available_space(dir)
        .with_context(|| format!("Failed to query free space of '{}'", dir.display()))?;
    debug!(dir = %dir.display(), available, required, "free space");
    if available < required {
        bail!(BuildError::Space(format!(
            "not enough space available at '{}' to build image: {available} bytes free, {required} needed",
            dir.display()
        )));
    }
    Ok(())
}

/// Everything a build on this host needs before any download.
pub fn check_host(build_dir: &Path, image_size: u64) -> Result<()> {
    check_required_tools(required_tools(HostPlatform::current()))?;
    check_exfat_support()?;
    check_free_space(build_dir, image_size)?;
    info!("host preflight passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use tempfile::TempDir;

    #[test]
    fn test_command_exists() {
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure_lists_packages() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("nonexistent_command_xyz (install: fake-package)"));
    }

    #[test]
    fn test_every_platform_needs_the_emulator() {
        for platform in [HostPlatform::Linux, HostPlatform::MacOs, HostPlatform::Windows] {
            assert!(required_tools(platform)
                .iter()
                .any(|(tool, _)| *tool == "qemu-system-arm"));
        }
    }

    #[test]
    fn test_free_space() {
        let temp = TempDir::new().unwrap();
        check_free_space(temp.path(), 1).unwrap();

        let err = check_free_space(temp.path(), u64::MAX).unwrap_err();
        assert!(matches!(classify(&err), Some(BuildError::Space(_))));
        assert_eq!(classify(&err).unwrap().exit_code(), 1);
    }
}
