//! Guest-side configuration through the playbook runner.
//!
//! The host never interprets the playbooks. It uploads them, writes a JSON
//! file of variables next to them and runs `ansible-playbook` with a tag
//! set per phase.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::config::{BuildConfig, ONE_GIB};
use crate::content::catalog::DEFAULT_CATALOGS;
use crate::fsutil::tmp_name;
use crate::vm::session::{ExecOptions, VmSession};

/// Where the playbooks live on the guest.
pub const GUEST_PLAYBOOK_DIR: &str = "/var/lib/ansible/local";

pub const EXTRA_VARS_FILE: &str = "extra_vars.json";

/// Overrides the project name (and derived domain) given to the playbooks.
pub const DEMO_ENV: &str = "APPLIANCE_DEMO";

pub const MASK: &str = "****";

const PHASE_ONE_TAGS: &[&str] = &["resize", "rename", "configure"];
const PHASE_TWO_TAGS: &[&str] = &["move-content"];

/// Variables handed to the playbooks, with the keys whose values are
/// never logged.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraVars {
    vars: Map<String, Value>,
    secret_keys: BTreeSet<String>,
}

impl ExtraVars {
    /// Variables for `config` on an image of `disk_size` bytes whose root
    /// partition is `root_partition_size` bytes.
    pub fn build(config: &BuildConfig, root_partition_size: u64, disk_size: u64) -> Self {
        let selection = config.selection();
        let packages: Vec<Value> = selection
            .packages
            .iter()
            .map(|name| json!({"name": name, "status": "present"}))
            .collect();

        let mut vars = Map::new();
        vars.insert("root_partition_size".into(), json!(root_partition_size / ONE_GIB));
        vars.insert("disk_size".into(), json!(disk_size / ONE_GIB));
        vars.insert("project_name".into(), json!(config.project_name));
        vars.insert("timezone".into(), json!(config.timezone));
        vars.insert("language".into(), json!(config.language));
        vars.insert(
            "language_name".into(),
            json!(config.language_name().unwrap_or(config.language.as_str())),
        );
        vars.insert("kalite_languages".into(), json!(selection.kalite));
        vars.insert("wikifundi_languages".into(), json!(selection.wikifundi));
        vars.insert("aflatoun_languages".into(), json!(selection.aflatoun));
        vars.insert("edupi".into(), json!(selection.edupi));
        vars.insert("packages".into(), Value::Array(packages));
        vars.insert("captive_portal".into(), json!(true));
        vars.insert("custom_branding_path".into(), json!("/tmp"));
        vars.insert("admin_account".into(), json!("admin"));
        vars.insert("admin_password".into(), json!("admin"));

        let mut secret_keys = BTreeSet::new();
        if let Some(pass) = config.wifi_password() {
            vars.insert("wpa_pass".into(), json!(pass));
            secret_keys.insert("wpa_pass".to_string());
        }
        if let Some((login, password)) = config.admin() {
            vars.insert("admin_account".into(), json!(login));
            vars.insert("admin_password".into(), json!(password));
            secret_keys.insert("admin_account".to_string());
            secret_keys.insert("admin_password".to_string());
        }

        let mut extra = Self { vars, secret_keys };
        if let Ok(demo) = env::var(DEMO_ENV) {
            extra.apply_demo(&demo);
        }
        extra
    }

    /// Demo builds carry a fixed identity.
    pub fn apply_demo(&mut self, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        info!(name, "demo mode");
        self.vars.insert("project_name".into(), json!(name));
        self.vars.insert("domain".into(), json!(format!("{name}.local")));
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.vars.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Secret values, for masking command lines.
    pub fn secrets(&self) -> Vec<String> {
        self.secret_keys
            .iter()
            .filter_map(|k| self.vars.get(k)?.as_str())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Mirror and catalogs first so that explicit variables win.
    fn document(&self, mirror: &str, catalogs: &[String]) -> Map<String, Value> {
        let catalogs: Vec<Value> = catalogs
            .iter()
            .map(|url| {
                let name = DEFAULT_CATALOGS
                    .iter()
                    .find(|c| c.url == url.as_str())
                    .map(|c| c.name)
                    .unwrap_or(url.as_str());
                json!({"name": name, "url": url})
            })
            .collect();
        let mut doc = Map::new();
        doc.insert("mirror".into(), json!(mirror));
        doc.insert("catalogs".into(), Value::Array(catalogs));
        for (k, v) in &self.vars {
            doc.insert(k.clone(), v.clone());
        }
        doc
    }

    pub fn to_json(&self, mirror: &str, catalogs: &[String]) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.document(mirror, catalogs))?)
    }

    /// The document with secret values replaced by [`MASK`].
    pub fn masked_json(&self, mirror: &str, catalogs: &[String]) -> Result<String> {
        let mut doc = self.document(mirror, catalogs);
        for key in &self.secret_keys {
            if let Some(slot) = doc.get_mut(key) {
                *slot = json!(MASK);
            }
        }
        Ok(serde_json::to_string_pretty(&doc)?)
    }
}

/// Replace every secret in `text` with [`MASK`].
pub fn mask_secrets(text: &str, secrets: &[String]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(text.to_string(), |acc, s| acc.replace(s.as_str(), MASK))
}

/// The full command run on the guest for `tags`.
pub fn playbook_command(tags: &[&str]) -> String {
    let extra_vars = format!("{GUEST_PLAYBOOK_DIR}/{EXTRA_VARS_FILE}");
    let playbook = format!(
        "/usr/local/bin/ansible-playbook -vvv --inventory hosts --tags {} --extra-vars=\"@{}\" main.yml",
        tags.join(","),
        extra_vars
    );
    format!("sudo sh -c 'cd {GUEST_PLAYBOOK_DIR} && {playbook}'")
}

/// Drives the playbooks on a booted guest.
pub struct Provisioner<'a> {
    config: &'a BuildConfig,
    vars: ExtraVars,
}

impl<'a> Provisioner<'a> {
    pub fn new(config: &'a BuildConfig, vars: ExtraVars) -> Self {
        Self { config, vars }
    }

    pub fn vars(&self) -> &ExtraVars {
        &self.vars
    }

    /// Replace the guest's playbook tree with `local`.
    pub fn upload_playbooks(&self, vm: &mut VmSession, local: &Path) -> Result<()> {
        vm.exec(
            &format!("sudo /bin/rm -rf {GUEST_PLAYBOOK_DIR}"),
            ExecOptions::default(),
        )?;
        vm.put_dir(local, GUEST_PLAYBOOK_DIR)
    }

    /// Branding upload, then the configuration tags.
    pub fn run_phase_one(&mut self, vm: &mut VmSession) -> Result<()> {
        let branding = self.config.branding.files();
        for (name, path) in &branding {
            vm.put_file(path, &format!("/tmp/{name}"))?;
        }
        self.vars
            .set("has_custom_branding", json!(!branding.is_empty()));
        self.run(vm, PHASE_ONE_TAGS)
    }

    /// Content relocation, and sealing when requested.
    pub fn run_phase_two(&mut self, vm: &mut VmSession, seal: bool) -> Result<()> {
        let mut tags = PHASE_TWO_TAGS.to_vec();
        if seal {
            tags.push("seal");
        }
        self.run(vm, &tags)
    }

    fn run(&self, vm: &mut VmSession, tags: &[&str]) -> Result<()> {
        let local = std::env::temp_dir().join(tmp_name("extra-vars"));
        fs::write(
            &local,
            self.vars.to_json(&self.config.mirror, &self.config.catalogs)?,
        )
        .with_context(|| format!("Failed to write '{}'", local.display()))?;
        let uploaded = vm.put_file(&local, &format!("{GUEST_PLAYBOOK_DIR}/{EXTRA_VARS_FILE}"));
        let _ = fs::remove_file(&local);
        uploaded?;

        info!(
            "playbook variables:\n{}",
            self.vars
                .masked_json(&self.config.mirror, &self.config.catalogs)?
        );

        let command = playbook_command(tags);
        let shown = mask_secrets(&command, &self.vars.secrets());
        vm.exec(&command, ExecOptions::default().display(shown))
            .with_context(|| format!("playbook run with tags {}", tags.join(",")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, BuildError};
    use crate::vm::session::fake::FakeShell;
    use serde_json::json;

    fn config() -> BuildConfig {
        BuildConfig::default()
            .with_overrides(json!({
                "project_name": "kiwixbox",
                "wifi": {"password": "wifipass"},
                "admin_account": {"custom": true, "login": "boss", "password": "hunter2"},
                "content": {"zims": ["wikipedia_fr"], "kalite": ["fr"], "aflatoun": true}
            }))
            .unwrap()
    }

    #[test]
    fn test_extra_vars_contents() {
        let vars = ExtraVars::build(&config(), 7 * ONE_GIB, 16 * ONE_GIB + 5);
        assert_eq!(vars.get("root_partition_size"), Some(&json!(7)));
        assert_eq!(vars.get("disk_size"), Some(&json!(16)));
        assert_eq!(vars.get("language_name"), Some(&json!("English")));
        assert_eq!(vars.get("aflatoun_languages"), Some(&json!(["fr", "en"])));
        assert_eq!(
            vars.get("packages"),
            Some(&json!([{"name": "wikipedia_fr", "status": "present"}]))
        );
        assert_eq!(vars.get("admin_account"), Some(&json!("boss")));
        assert_eq!(vars.get("wpa_pass"), Some(&json!("wifipass")));
    }

    #[test]
    fn test_default_admin_is_not_secret() {
        let vars = ExtraVars::build(&BuildConfig::default(), ONE_GIB, ONE_GIB);
        assert_eq!(vars.get("admin_password"), Some(&json!("admin")));
        assert!(vars.get("wpa_pass").is_none());
        assert!(vars.secrets().is_empty());
    }

    #[test]
    fn test_masked_document() {
        let cfg = config();
        let vars = ExtraVars::build(&cfg, ONE_GIB, ONE_GIB);
        let masked = vars.masked_json(&cfg.mirror, &cfg.catalogs).unwrap();
        assert!(!masked.contains("hunter2"));
        assert!(!masked.contains("wifipass"));
        assert!(masked.contains(MASK));

        let plain = vars.to_json(&cfg.mirror, &cfg.catalogs).unwrap();
        let doc: Value = serde_json::from_str(&plain).unwrap();
        assert_eq!(doc["admin_password"], json!("hunter2"));
        assert_eq!(doc["mirror"], json!(cfg.mirror));
        assert_eq!(doc["catalogs"][0]["name"], json!("Kiwix"));
    }

    #[test]
    fn test_demo_overrides_identity() {
        let mut vars = ExtraVars::build(&config(), ONE_GIB, ONE_GIB);
        vars.apply_demo("showcase");
        assert_eq!(vars.get("project_name"), Some(&json!("showcase")));
        assert_eq!(vars.get("domain"), Some(&json!("showcase.local")));
    }

    #[test]
    fn test_playbook_command() {
        assert_eq!(
            playbook_command(&["move-content", "seal"]),
            "sudo sh -c 'cd /var/lib/ansible/local && /usr/local/bin/ansible-playbook -vvv \
             --inventory hosts --tags move-content,seal \
             --extra-vars=\"@/var/lib/ansible/local/extra_vars.json\" main.yml'"
        );
    }

    #[test]
    fn test_mask_secrets() {
        let masked = mask_secrets("login boss pw hunter2", &["hunter2".into(), "".into()]);
        assert_eq!(masked, "login boss pw ****");
    }

    #[test]
    fn test_phase_two_runs_playbook() {
        let cfg = config();
        let shell = FakeShell::default();
        let mut vm = VmSession::new(Box::new(shell.clone()));
        let mut provisioner = Provisioner::new(&cfg, ExtraVars::build(&cfg, ONE_GIB, ONE_GIB));

        provisioner.run_phase_two(&mut vm, false).unwrap();
        let calls = shell.calls();
        assert!(calls[0].starts_with("file "));
        assert!(calls[1].ends_with("/var/lib/ansible/local/extra_vars.json"));
        assert!(calls[2].contains("--tags move-content "));
    }

    #[test]
    fn test_playbook_failure_is_provisioning_error() {
        let cfg = config();
        let shell = FakeShell::default();
        shell.fail_on("sudo sh -c", 4);
        let mut vm = VmSession::new(Box::new(shell));
        let mut provisioner = Provisioner::new(&cfg, ExtraVars::build(&cfg, ONE_GIB, ONE_GIB));

        let err = provisioner.run_phase_one(&mut vm).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(BuildError::Provisioning { status: 4, .. })
        ));
        assert_eq!(provisioner.vars().get("has_custom_branding"), Some(&json!(false)));
    }
}
