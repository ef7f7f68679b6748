//! Content descriptors and the contents index.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

pub const DEFAULT_MIRROR: &str = "http://download.kiwix.org";

/// Placeholder substituted with the mirror base URL.
const MIRROR_PLACEHOLDER: &str = "{mirror}";

/// One downloadable unit of content.
///
/// `archive_size` and `checksum` identify a valid cache entry and cannot
/// be changed once the descriptor exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    url: String,
    name: String,
    checksum: String,
    archive_size: u64,
    expanded_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    folder_name: Option<String>,
    /// Base images only: size of the system area at the start of the disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root_partition_size: Option<u64>,
}

impl ContentDescriptor {
    pub fn new(
        url: impl Into<String>,
        name: impl Into<String>,
        checksum: impl Into<String>,
        archive_size: u64,
        expanded_size: u64,
    ) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            checksum: checksum.into(),
            archive_size,
            expanded_size,
            folder_name: None,
            root_partition_size: None,
        }
    }

    pub fn with_folder_name(mut self, folder: impl Into<String>) -> Self {
        self.folder_name = Some(folder.into());
        self
    }

    pub fn with_root_partition_size(mut self, bytes: u64) -> Self {
        self.root_partition_size = Some(bytes);
        self
    }

    /// Substitute the mirror placeholder in the URL.
    pub fn with_mirror(mut self, mirror: &str) -> Self {
        self.url = self
            .url
            .replace(MIRROR_PLACEHOLDER, mirror.trim_end_matches('/'));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn archive_size(&self) -> u64 {
        self.archive_size
    }

    pub fn expanded_size(&self) -> u64 {
        self.expanded_size
    }

    pub fn folder_name(&self) -> Option<&str> {
        self.folder_name.as_deref()
    }

    pub fn root_partition_size(&self) -> Option<u64> {
        self.root_partition_size
    }

    /// Where this content lives in a cache directory.
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(&self.name)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let safe = !self.name.is_empty()
            && !self.name.contains(['/', '\\'])
            && self.name != "."
            && self.name != "..";
        if !safe {
            anyhow::bail!(BuildError::Configuration(format!(
                "content name must be a plain file name: {:?}",
                self.name
            )));
        }
        Ok(())
    }
}

/// Descriptors keyed by content key, loaded from a JSON object.
#[derive(Debug, Clone, Default)]
pub struct ContentIndex {
    entries: BTreeMap<String, ContentDescriptor>,
}

impl ContentIndex {
    pub fn from_json(json: &str, mirror: &str) -> Result<Self> {
        let raw: BTreeMap<String, ContentDescriptor> =
            serde_json::from_str(json).context("Failed to parse contents index")?;
        let mut entries = BTreeMap::new();
        for (key, descriptor) in raw {
            descriptor
                .validate()
                .with_context(|| format!("Invalid contents entry '{key}'"))?;
            entries.insert(key, descriptor.with_mirror(mirror));
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path, mirror: &str) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read contents index '{}'", path.display()))?;
        Self::from_json(&json, mirror)
            .with_context(|| format!("Invalid contents index '{}'", path.display()))
    }

    pub fn get(&self, key: &str) -> Result<&ContentDescriptor> {
        self.entries.get(key).ok_or_else(|| {
            BuildError::Configuration(format!("no content named '{key}' in the contents index"))
                .into()
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"{
        "wikifundi_langpack_fr": {
            "url": "{mirror}/wikifundi/fr.tar.gz",
            "name": "wikifundi_fr.tar.gz",
            "checksum": "abc",
            "archive_size": 100,
            "expanded_size": 300,
            "folder_name": "wikifundi_fr"
        },
        "aflatoun_content": {
            "url": "http://static.example.org/aflatoun.tar.gz",
            "name": "aflatoun.tar.gz",
            "checksum": "def",
            "archive_size": 10,
            "expanded_size": 20
        }
    }"#;

    #[test]
    fn test_index_resolves_mirror() {
        let index = ContentIndex::from_json(INDEX, "http://mirror.local/").unwrap();
        let wiki = index.get("wikifundi_langpack_fr").unwrap();
        assert_eq!(wiki.url(), "http://mirror.local/wikifundi/fr.tar.gz");
        assert_eq!(wiki.folder_name(), Some("wikifundi_fr"));

        let afla = index.get("aflatoun_content").unwrap();
        assert_eq!(afla.url(), "http://static.example.org/aflatoun.tar.gz");
        assert_eq!(afla.folder_name(), None);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let index = ContentIndex::from_json(INDEX, DEFAULT_MIRROR).unwrap();
        let err = index.get("kalite_langpack_xx").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Configuration(_))
        ));
    }

    #[test]
    fn test_rejects_path_like_names() {
        let json = r#"{"x": {"url": "u", "name": "../escape", "checksum": "c",
                       "archive_size": 1, "expanded_size": 1}}"#;
        assert!(ContentIndex::from_json(json, DEFAULT_MIRROR).is_err());
    }
}
