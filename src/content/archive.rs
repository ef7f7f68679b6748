//! Archive extraction and placement of extracted content.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::path::Path;
use tracing::{debug, warn};

use super::cache::is_cached;
use super::descriptor::ContentDescriptor;
use crate::error::BuildError;
use crate::fsutil::{move_path, tmp_name};
use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Unpacked in-process.
    Zip,
    /// Handed to the host `tar`.
    Tar,
}

impl ArchiveFormat {
    pub fn detect(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        const TAR_SUFFIXES: &[&str] = &[
            ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz",
        ];

        if name.ends_with(".zip") {
            Ok(Self::Zip)
        } else if TAR_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            Ok(Self::Tar)
        } else {
            bail!(BuildError::Configuration(format!(
                "unsupported archive format: {}",
                path.display()
            )))
        }
    }
}

/// Extract `archive` into `dest`, which is created if needed.
pub fn unarchive(archive: &Path, dest: &Path) -> Result<()> {
    let format = ArchiveFormat::detect(archive)?;
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create '{}'", dest.display()))?;
    debug!(archive = %archive.display(), dest = %dest.display(), ?format, "extracting");

    match format {
        ArchiveFormat::Zip => {
            let file = File::open(archive)
                .with_context(|| format!("Failed to open '{}'", archive.display()))?;
            let mut zip = zip::ZipArchive::new(file)
                .with_context(|| format!("Invalid zip archive '{}'", archive.display()))?;
            zip.extract(dest)
                .with_context(|| format!("Failed to extract '{}'", archive.display()))?;
        }
        ArchiveFormat::Tar => {
            Cmd::new("tar")
                .arg("-xf")
                .arg_path(archive)
                .arg("-C")
                .arg_path(dest)
                .error_msg(format!("Failed to extract '{}'", archive.display()))
                .run()?;
        }
    }
    Ok(())
}

/// Extract the single file `entry` from `archive` to `dest`.
pub fn extract_entry(archive: &Path, entry: &str, dest: &Path) -> Result<()> {
    match ArchiveFormat::detect(archive)? {
        ArchiveFormat::Zip => {
            let file = File::open(archive)
                .with_context(|| format!("Failed to open '{}'", archive.display()))?;
            let mut zip = zip::ZipArchive::new(file)
                .with_context(|| format!("Invalid zip archive '{}'", archive.display()))?;
            let mut source = zip.by_name(entry).map_err(|e| {
                BuildError::integrity(archive.display().to_string(), format!("no entry '{entry}': {e}"))
            })?;
            let mut out = File::create(dest)
                .with_context(|| format!("Failed to create '{}'", dest.display()))?;
            std::io::copy(&mut source, &mut out)
                .with_context(|| format!("Failed to extract '{entry}' to '{}'", dest.display()))?;
            out.sync_all()?;
            Ok(())
        }
        ArchiveFormat::Tar => {
            let parent = dest.parent().unwrap_or_else(|| Path::new("."));
            let workdir = parent.join(format!(".{}", tmp_name("entry")));
            let result = unarchive(archive, &workdir).and_then(|()| move_path(&workdir.join(entry), dest));
            let _ = fs::remove_dir_all(&workdir);
            result
        }
    }
}

/// Extract a cached archive under `root` and move the useful part to `dest`.
///
/// The extraction directory is always removed, whether or not the move
/// succeeded.
pub fn extract_and_move(
    descriptor: &ContentDescriptor,
    cache_dir: &Path,
    root: &Path,
    dest: &Path,
) -> Result<()> {
    if !is_cached(descriptor, cache_dir, false) {
        bail!(BuildError::integrity(
            descriptor.name(),
            "archive missing from cache or truncated"
        ));
    }
    let archive = descriptor.cache_path(cache_dir);
    let workdir = root.join(format!(".{}", tmp_name("extract")));

    let result = (|| -> Result<()> {
        unarchive(&archive, &workdir)?;
        let useful = match descriptor.folder_name() {
            Some(folder) => workdir.join(folder),
            None => workdir.clone(),
        };
        if !useful.exists() {
            bail!(BuildError::integrity(
                descriptor.name(),
                format!("archive has no '{}' folder", useful.display())
            ));
        }
        move_path(&useful, dest)
            .with_context(|| format!("Failed to place {} at '{}'", descriptor.name(), dest.display()))
    })();

    if workdir.exists() {
        if let Err(e) = fs::remove_dir_all(&workdir) {
            warn!(path = %workdir.display(), error = %e, "failed to remove extraction dir");
        }
    }
    result
}
