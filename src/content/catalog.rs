//! Package catalogs (YAML) listing installable ZIM files and static sites.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

use super::descriptor::ContentDescriptor;
use crate::error::BuildError;

pub struct CatalogSource {
    pub name: &'static str,
    pub description: &'static str,
    pub url: &'static str,
}

pub const DEFAULT_CATALOGS: &[CatalogSource] = &[
    CatalogSource {
        name: "Kiwix",
        description: "Kiwix ZIM Content",
        url: "http://download.kiwix.org/library/ideascube.yml",
    },
    CatalogSource {
        name: "StaticSites",
        description: "Static sites",
        url: "http://catalog.ideascube.org/static-sites.yml",
    },
];

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogPackage {
    pub url: String,
    pub sha256sum: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl CatalogPackage {
    /// ZIM files are served as-is; other packages grow when unpacked.
    pub fn expanded_size(&self) -> u64 {
        if self.kind == "zim" {
            self.size
        } else {
            self.size + self.size.div_ceil(10)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub all: BTreeMap<String, CatalogPackage>,
}

impl Catalog {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Invalid catalog YAML")
    }
}

/// All loaded catalogs, searched in order.
#[derive(Debug, Clone, Default)]
pub struct Catalogs {
    catalogs: Vec<Catalog>,
}

impl Catalogs {
    pub fn new(catalogs: Vec<Catalog>) -> Self {
        Self { catalogs }
    }

    /// Download and parse every catalog. Any failure is a catalog error.
    pub fn fetch(urls: &[String]) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;

        let mut catalogs = Vec::with_capacity(urls.len());
        for url in urls {
            info!(url = %url, "fetching catalog");
            let body = client
                .get(url)
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.text())
                .map_err(|e| BuildError::Catalog(format!("{url}: {e}")))?;
            let catalog = Catalog::from_yaml(&body)
                .map_err(|e| BuildError::Catalog(format!("{url}: {e:#}")))?;
            catalogs.push(catalog);
        }
        Ok(Self { catalogs })
    }

    pub fn package(&self, id: &str) -> Option<&CatalogPackage> {
        self.catalogs.iter().find_map(|c| c.all.get(id))
    }

    pub fn package_ids(&self) -> impl Iterator<Item = (&str, &CatalogPackage)> {
        self.catalogs
            .iter()
            .flat_map(|c| c.all.iter().map(|(id, p)| (id.as_str(), p)))
    }

    /// Descriptor for a catalog package, cached as `package_<id>`.
    pub fn package_descriptor(&self, id: &str) -> Result<ContentDescriptor> {
        let package = self.package(id).ok_or_else(|| {
            BuildError::Configuration(format!("package '{id}' is not in any catalog"))
        })?;
        Ok(ContentDescriptor::new(
            package.url.clone(),
            format!("package_{id}"),
            package.sha256sum.clone(),
            package.size,
            package.expanded_size(),
        ))
    }
}
