//! Build parameters.
//!
//! The command line produces a [`BuildConfig`]; an optional JSON or TOML
//! file is then laid over it key by key, so anything the file names wins.
//! [`BuildConfig::validate`] rejects combinations the build cannot honour.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::content::collection::{Selection, AFLATOUN_LANGUAGES};
use crate::content::descriptor::DEFAULT_MIRROR;
use crate::error::BuildError;

pub const ONE_MB: u64 = 1_000_000;
pub const ONE_GB: u64 = 1_000_000_000;
pub const ONE_MIB: u64 = 1 << 20;
pub const ONE_GIB: u64 = 1 << 30;

pub const DEFAULT_SIZE: u64 = 5 * ONE_GIB;

/// Interface languages the image can be configured in, with display names.
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[
    ("ar", "العربية"),
    ("bm", "Bambara"),
    ("en", "English"),
    ("es", "Español"),
    ("fa", "فارسی"),
    ("fr", "Français"),
    ("ku", "Kurdî"),
    ("sw", "Kiswahili"),
    ("wo", "Wolof"),
];

pub const KALITE_LANGUAGES: &[&str] = &["fr", "en", "es"];
pub const WIKIFUNDI_LANGUAGES: &[&str] = &["fr", "en"];

pub fn language_name(code: &str) -> Option<&'static str> {
    SUPPORTED_LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// Parse `5GiB`, `4 GB`, `500MB` or a plain byte count.
pub fn parse_size(raw: &str) -> Result<u64> {
    let text = raw.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| BuildError::Configuration(format!("invalid size '{raw}'")))?;

    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1_000,
        "kib" => 1 << 10,
        "mb" => ONE_MB,
        "mib" => ONE_MIB,
        "gb" => ONE_GB,
        "gib" => ONE_GIB,
        "tb" => 1_000 * ONE_GB,
        "tib" => 1 << 40,
        other => bail!(BuildError::Configuration(format!(
            "invalid size '{raw}': unknown unit '{other}'"
        ))),
    };
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        bail!(BuildError::Configuration(format!("invalid size '{raw}'")));
    }
    Ok(bytes.round() as u64)
}

fn size_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Float(f64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Bytes(n) => Ok(n),
        Raw::Float(f) if f >= 0.0 && f.is_finite() => Ok(f.round() as u64),
        Raw::Float(f) => Err(serde::de::Error::custom(format!("invalid size {f}"))),
        Raw::Text(s) => parse_size(&s).map_err(|e| serde::de::Error::custom(format!("{e:#}"))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    pub password: Option<String>,
    /// Unset means protected whenever a password is given.
    pub protected: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminAccountConfig {
    pub custom: bool,
    pub login: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrandingConfig {
    pub logo: Option<PathBuf>,
    pub favicon: Option<PathBuf>,
    pub css: Option<PathBuf>,
}

impl BrandingConfig {
    /// `(guest file name, local path)` for each branding file set.
    pub fn files(&self) -> Vec<(&'static str, &Path)> {
        [
            ("favicon.png", self.favicon.as_deref()),
            ("header-logo.png", self.logo.as_deref()),
            ("style.css", self.css.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, path)| path.map(|p| (name, p)))
        .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub kalite: Vec<String>,
    pub wikifundi: Vec<String>,
    pub edupi: bool,
    pub aflatoun: bool,
    pub zims: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub ram: String,
    pub boot_timeout_secs: u64,
    pub settle_delay_secs: u64,
    /// Holds the kernel, device tree and playbook directory.
    pub assets_dir: PathBuf,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            ram: crate::vm::session::DEFAULT_RAM.into(),
            boot_timeout_secs: 600,
            settle_delay_secs: 10,
            assets_dir: PathBuf::from("assets"),
        }
    }
}

impl EmulatorConfig {
    pub fn kernel(&self) -> PathBuf {
        self.assets_dir.join("zImage")
    }

    pub fn dtb(&self) -> PathBuf {
        self.assets_dir.join("vexpress-v2p-ca15_a7.dtb")
    }

    pub fn playbook_dir(&self) -> PathBuf {
        self.assets_dir.join("ansiblecube")
    }

    pub fn contents_index(&self) -> PathBuf {
        self.assets_dir.join("contents.json")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub project_name: String,
    pub language: String,
    pub timezone: String,
    pub wifi: WifiConfig,
    pub admin_account: AdminAccountConfig,
    pub branding: BrandingConfig,
    pub build_dir: PathBuf,
    #[serde(deserialize_with = "size_from_any")]
    pub size: u64,
    pub content: ContentConfig,
    pub emulator: EmulatorConfig,
    pub mirror: String,
    pub catalogs: Vec<String>,
    /// Removable device to write the finished image to.
    pub sd_card: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            project_name: "mybox".into(),
            language: "en".into(),
            timezone: "Europe/Paris".into(),
            wifi: WifiConfig::default(),
            admin_account: AdminAccountConfig::default(),
            branding: BrandingConfig::default(),
            build_dir: PathBuf::from("."),
            size: DEFAULT_SIZE,
            content: ContentConfig::default(),
            emulator: EmulatorConfig::default(),
            mirror: DEFAULT_MIRROR.into(),
            catalogs: crate::content::catalog::DEFAULT_CATALOGS
                .iter()
                .map(|c| c.url.to_string())
                .collect(),
            sd_card: None,
        }
    }
}

/// Lay `overlay` over `base`: objects merge key by key, anything else
/// replaces.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Read a config file as a JSON value, whatever its format.
pub fn read_config_file(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading build config '{}'", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let value = match ext.as_deref() {
        Some("toml") => {
            let parsed: toml::Value = toml::from_str(&raw)
                .with_context(|| format!("parsing build config '{}'", path.display()))?;
            serde_json::to_value(parsed)?
        }
        Some("json") | None => serde_json::from_str(&raw)
            .with_context(|| format!("parsing build config '{}'", path.display()))?,
        Some(other) => bail!(BuildError::Configuration(format!(
            "unsupported config format '.{other}' for '{}' (expected .json or .toml)",
            path.display()
        ))),
    };
    if !value.is_object() {
        bail!(BuildError::Configuration(format!(
            "build config '{}' is not a table",
            path.display()
        )));
    }
    Ok(value)
}

impl BuildConfig {
    /// This config with the file at `path` laid over it.
    pub fn with_file(self, path: &Path) -> Result<Self> {
        let overlay = read_config_file(path)?;
        self.with_overrides(overlay)
            .with_context(|| format!("applying build config '{}'", path.display()))
    }

    pub fn with_overrides(self, overlay: Value) -> Result<Self> {
        let mut base = serde_json::to_value(&self)?;
        merge(&mut base, overlay);
        serde_json::from_value(base)
            .map_err(|e| BuildError::Configuration(e.to_string()).into())
    }

    /// Wi-Fi password to configure; none leaves the network open.
    pub fn wifi_password(&self) -> Option<&str> {
        if self.wifi.protected == Some(false) {
            return None;
        }
        self.wifi.password.as_deref().filter(|p| !p.is_empty())
    }

    /// `(login, password)` of the custom admin account, if any.
    pub fn admin(&self) -> Option<(&str, &str)> {
        if !self.admin_account.custom {
            return None;
        }
        match (&self.admin_account.login, &self.admin_account.password) {
            (Some(login), Some(password)) => Some((login, password)),
            _ => None,
        }
    }

    pub fn language_name(&self) -> Option<&'static str> {
        language_name(&self.language)
    }

    pub fn selection(&self) -> Selection {
        Selection {
            edupi: self.content.edupi,
            packages: self.content.zims.clone(),
            kalite: self.content.kalite.clone(),
            wikifundi: self.content.wikifundi.clone(),
            aflatoun: if self.content.aflatoun {
                AFLATOUN_LANGUAGES.iter().map(|l| l.to_string()).collect()
            } else {
                Vec::new()
            },
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.build_dir.join("cache")
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { bail!(BuildError::Configuration(msg)) };

        if self.project_name.trim().is_empty() {
            return invalid("project name is empty".into());
        }
        if self.language_name().is_none() {
            return invalid(format!("unsupported language '{}'", self.language));
        }
        if self.timezone.trim().is_empty() {
            return invalid("timezone is empty".into());
        }
        if self.wifi.protected == Some(true) && self.wifi_password().is_none() {
            return invalid("protected Wi-Fi requires a password".into());
        }
        if self.admin_account.custom && self.admin().is_none() {
            return invalid("custom admin account requires both login and password".into());
        }
        if self.size == 0 {
            return invalid("image size is zero".into());
        }
        for lang in &self.content.kalite {
            if !KALITE_LANGUAGES.contains(&lang.as_str()) {
                return invalid(format!("unsupported KA-Lite language '{lang}'"));
            }
        }
        for lang in &self.content.wikifundi {
            if !WIKIFUNDI_LANGUAGES.contains(&lang.as_str()) {
                return invalid(format!("unsupported Wikifundi language '{lang}'"));
            }
        }
        for (name, path) in self.branding.files() {
            if !path.is_file() {
                return invalid(format!(
                    "branding file for {name} not found: '{}'",
                    path.display()
                ));
            }
        }
        Ok(())
    }
}
