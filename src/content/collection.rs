//! Content collections: what to download for a selection and where each
//! item ends up on the data partition.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::archive::extract_and_move;
use super::cache::is_cached;
use super::catalog::Catalogs;
use super::descriptor::ContentDescriptor;
use crate::error::BuildError;

/// Languages Aflatoun content is available in.
pub const AFLATOUN_LANGUAGES: &[&str] = &["fr", "en"];

/// Content chosen for one build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub edupi: bool,
    pub packages: Vec<String>,
    pub kalite: Vec<String>,
    pub wikifundi: Vec<String>,
    pub aflatoun: Vec<String>,
}

/// How a downloaded item is placed, relative to the data partition root.
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    ExtractAndMove {
        descriptor: ContentDescriptor,
        dest: PathBuf,
    },
    Copy {
        descriptor: ContentDescriptor,
        dest: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub name: &'static str,
    pub downloads: Vec<ContentDescriptor>,
    pub placements: Vec<Placement>,
}

/// Anything that resolves content keys to descriptors.
pub trait ContentSource {
    fn descriptor(&self, key: &str) -> Result<ContentDescriptor>;
}

impl ContentSource for super::descriptor::ContentIndex {
    fn descriptor(&self, key: &str) -> Result<ContentDescriptor> {
        self.get(key).cloned()
    }
}

fn folder_or(descriptor: &ContentDescriptor, fallback: &str) -> PathBuf {
    PathBuf::from(descriptor.folder_name().unwrap_or(fallback))
}

/// Build the collections for `selection`, in placement order.
pub fn collections(
    selection: &Selection,
    index: &dyn ContentSource,
    catalogs: &Catalogs,
) -> Result<Vec<Collection>> {
    let mut out = Vec::new();

    if selection.edupi {
        // configured entirely inside the guest
        out.push(Collection {
            name: "EduPi",
            downloads: Vec::new(),
            placements: Vec::new(),
        });
    }

    if !selection.packages.is_empty() {
        let mut downloads = Vec::new();
        let mut placements = Vec::new();
        for id in &selection.packages {
            let descriptor = catalogs.package_descriptor(id)?;
            placements.push(Placement::Copy {
                dest: Path::new("packages").join(descriptor.name()),
                descriptor: descriptor.clone(),
            });
            downloads.push(descriptor);
        }
        out.push(Collection {
            name: "Packages",
            downloads,
            placements,
        });
    }

    if !selection.kalite.is_empty() {
        let mut downloads = Vec::new();
        let mut placements = Vec::new();
        for lang in &selection.kalite {
            let key = format!("kalite_langpack_{lang}");
            let langpack = index.descriptor(&key)?;
            placements.push(Placement::ExtractAndMove {
                descriptor: langpack.clone(),
                dest: PathBuf::from(&key),
            });
            downloads.push(langpack);
        }
        for lang in &selection.kalite {
            let key = format!("kalite_videos_{lang}");
            let videos = index.descriptor(&key)?;
            placements.push(Placement::ExtractAndMove {
                dest: folder_or(&videos, &key),
                descriptor: videos.clone(),
            });
            downloads.push(videos);
        }
        out.push(Collection {
            name: "KA-Lite",
            downloads,
            placements,
        });
    }

    if !selection.wikifundi.is_empty() {
        let mut downloads = Vec::new();
        let mut placements = Vec::new();
        for lang in &selection.wikifundi {
            let key = format!("wikifundi_langpack_{lang}");
            let langpack = index.descriptor(&key)?;
            placements.push(Placement::ExtractAndMove {
                dest: folder_or(&langpack, &key),
                descriptor: langpack.clone(),
            });
            downloads.push(langpack);
        }
        out.push(Collection {
            name: "Wikifundi",
            downloads,
            placements,
        });
    }

    if !selection.aflatoun.is_empty() {
        if let Some(lang) = selection
            .aflatoun
            .iter()
            .find(|l| !AFLATOUN_LANGUAGES.contains(&l.as_str()))
        {
            anyhow::bail!(BuildError::Configuration(format!(
                "Aflatoun is not available in '{lang}'"
            )));
        }
        let content = index.descriptor("aflatoun_content")?;
        out.push(Collection {
            name: "Aflatoun",
            placements: vec![Placement::ExtractAndMove {
                descriptor: content.clone(),
                dest: PathBuf::from("aflatoun_content"),
            }],
            downloads: vec![content],
        });
    }

    Ok(out)
}

/// Every descriptor across `collections`, in download order.
pub fn all_downloads(collections: &[Collection]) -> Vec<ContentDescriptor> {
    collections
        .iter()
        .flat_map(|c| c.downloads.iter().cloned())
        .collect()
}

/// Place a collection's cached content under `mount_point`.
pub fn place(collection: &Collection, cache_dir: &Path, mount_point: &Path) -> Result<()> {
    for placement in &collection.placements {
        match placement {
            Placement::ExtractAndMove { descriptor, dest } => {
                info!(collection = collection.name, item = descriptor.name(), "extracting");
                extract_and_move(descriptor, cache_dir, mount_point, &mount_point.join(dest))?;
            }
            Placement::Copy { descriptor, dest } => {
                let target = mount_point.join(dest);
                info!(item = descriptor.name(), dest = %target.display(), "copying");
                if !is_cached(descriptor, cache_dir, false) {
                    anyhow::bail!(BuildError::integrity(
                        descriptor.name(),
                        "archive missing from cache or truncated"
                    ));
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(descriptor.cache_path(cache_dir), &target)
                    .with_context(|| format!("Failed to copy {} to '{}'", descriptor.name(), target.display()))?;
            }
        }
    }
    Ok(())
}
