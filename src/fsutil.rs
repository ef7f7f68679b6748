//! Filesystem helpers shared by the cache, placement and pipeline code.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use walkdir::WalkDir;

const HASH_CHUNK: usize = 8 * 1024 * 1024;

/// Copy the tree under `src` to `dst`, returning the bytes copied.
///
/// Links are followed; the data partition is exFAT and cannot hold them.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.with_context(|| format!("Failed to walk '{}'", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = if rel.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(rel)
        };
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create '{}'", target.display()))?;
        } else {
            copied += fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy '{}' to '{}'", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(copied)
}

/// Move a file or directory. The destination must not exist.
pub fn move_path(src: &Path, dst: &Path) -> Result<()> {
    // rename would replace a file or an empty dir, the copy would merge
    if dst.symlink_metadata().is_ok() {
        bail!("Cannot move '{}': '{}' already exists", src.display(), dst.display());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    // across filesystems
    debug!(from = %src.display(), to = %dst.display(), "rename failed, copying");
    copy_tree(src, dst)?;
    let removed = if src.is_dir() {
        fs::remove_dir_all(src)
    } else {
        fs::remove_file(src)
    };
    removed.with_context(|| format!("Failed to remove '{}'", src.display()))
}

/// Lowercase hex sha256 of a file, read in 8 MiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// A name unlikely to collide with a concurrent run.
pub fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree_counts_bytes() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("videos");
        fs::create_dir_all(src.join("fr/lesson1")).unwrap();
        fs::write(src.join("index.json"), "{}").unwrap();
        fs::write(src.join("fr/lesson1/intro.mp4"), "0123456789").unwrap();

        let dst = temp.path().join("data/videos");
        assert_eq!(copy_tree(&src, &dst).unwrap(), 12);
        assert_eq!(fs::read_to_string(dst.join("fr/lesson1/intro.mp4")).unwrap(), "0123456789");
    }

    #[test]
    fn test_copy_tree_single_file() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("base.img");
        fs::write(&src, "img").unwrap();
        let dst = temp.path().join("copy.img");
        assert_eq!(copy_tree(&src, &dst).unwrap(), 3);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "img");
    }

    #[test]
    fn test_move_path_directory() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("extracted");
        fs::create_dir_all(src.join("inner")).unwrap();
        fs::write(src.join("inner/a"), "a").unwrap();

        let dst = temp.path().join("final/place");
        move_path(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read_to_string(dst.join("inner/a")).unwrap(), "a");
    }

    #[test]
    fn test_move_path_refuses_existing_destination() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("extracted");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("new"), "new").unwrap();
        let dst = temp.path().join("place");
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("old"), "old").unwrap();

        let err = move_path(&src, &dst).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert!(src.join("new").exists());
        assert!(!dst.join("new").exists());
        assert_eq!(fs::read_to_string(dst.join("old")).unwrap(), "old");
    }

    #[test]
    fn test_sha256_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_tmp_name_prefix() {
        let name = tmp_name("extract");
        assert!(name.starts_with("extract-"));
        assert_ne!(name, "extract-");
    }
}
