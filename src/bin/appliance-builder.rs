use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Map, Value};
use tracing::{error, info};

use appliance_builder::config::{parse_size, BuildConfig};
use appliance_builder::content::{Catalogs, ContentIndex};
use appliance_builder::device::{host_driver, selftest::check_mount_procedure};
use appliance_builder::geometry::{compute_layout, DiskExtent, SECTOR_SIZE};
use appliance_builder::pipeline::{HostBackend, InstallationPipeline, BASE_IMAGE_KEY};
use appliance_builder::process::Elevation;
use appliance_builder::media::StopFlag;
use appliance_builder::{classify, logging, BuildError, CancelRegistry};

/// Offline-education appliance image builder.
#[derive(Debug, Parser)]
#[command(name = "appliance-builder", version)]
struct Cli {
    /// Name of the box (mybox)
    #[arg(long)]
    name: Option<String>,

    /// Timezone (Europe/Paris)
    #[arg(long)]
    timezone: Option<String>,

    /// Interface language (en)
    #[arg(long)]
    language: Option<String>,

    /// Wi-Fi password; the network is open without one
    #[arg(long)]
    wifi_pwd: Option<String>,

    /// Install KA-Lite in these languages
    #[arg(long, num_args = 1..)]
    kalite: Option<Vec<String>>,

    /// Install Aflatoun
    #[arg(long)]
    aflatoun: bool,

    /// Install Wikifundi in these languages
    #[arg(long, num_args = 1..)]
    wikifundi: Option<Vec<String>>,

    /// Install EduPi
    #[arg(long)]
    edupi: bool,

    /// Catalog packages to install
    #[arg(long, num_args = 1..)]
    zim_install: Option<Vec<String>>,

    /// Image size, e.g. 5GiB or 8000000000 (5GiB)
    #[arg(long)]
    size: Option<String>,

    #[arg(long)]
    favicon: Option<PathBuf>,

    #[arg(long)]
    logo: Option<PathBuf>,

    /// CSS stylesheet
    #[arg(long)]
    css: Option<PathBuf>,

    /// Build directory (current directory)
    #[arg(long)]
    build_dir: Option<PathBuf>,

    /// Show catalogs and exit
    #[arg(long)]
    catalog: bool,

    /// Create an admin account
    #[arg(long, num_args = 2, value_names = ["LOGIN", "PWD"])]
    admin_account: Option<Vec<String>>,

    /// JSON or TOML config file; its values supersede the flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also write logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Write the finished image to this device
    #[arg(long)]
    sd_card: Option<String>,

    /// Check that the data partition of an existing image mounts, then exit
    #[arg(long, value_name = "IMAGE")]
    check_mount: Option<PathBuf>,
}

/// The flags that were given, shaped like the config file.
fn cli_overrides(cli: &Cli) -> Result<Value> {
    let mut top = Map::new();
    let mut content = Map::new();
    let mut branding = Map::new();

    if let Some(name) = &cli.name {
        top.insert("project_name".into(), json!(name));
    }
    if let Some(timezone) = &cli.timezone {
        top.insert("timezone".into(), json!(timezone));
    }
    if let Some(language) = &cli.language {
        top.insert("language".into(), json!(language));
    }
    if let Some(password) = &cli.wifi_pwd {
        top.insert("wifi".into(), json!({"password": password}));
    }
    if let Some(account) = &cli.admin_account {
        let [login, password] = account.as_slice() else {
            bail!(BuildError::Configuration("--admin-account takes LOGIN PWD".into()));
        };
        top.insert(
            "admin_account".into(),
            json!({"custom": true, "login": login, "password": password}),
        );
    }
    if let Some(size) = &cli.size {
        top.insert("size".into(), json!(parse_size(size)?));
    }
    if let Some(dir) = &cli.build_dir {
        top.insert("build_dir".into(), json!(dir));
    }
    if let Some(device) = &cli.sd_card {
        top.insert("sd_card".into(), json!(device));
    }

    if let Some(langs) = &cli.kalite {
        content.insert("kalite".into(), json!(langs));
    }
    if let Some(langs) = &cli.wikifundi {
        content.insert("wikifundi".into(), json!(langs));
    }
    if let Some(ids) = &cli.zim_install {
        content.insert("zims".into(), json!(ids));
    }
    if cli.aflatoun {
        content.insert("aflatoun".into(), json!(true));
    }
    if cli.edupi {
        content.insert("edupi".into(), json!(true));
    }

    for (key, path) in [("logo", &cli.logo), ("favicon", &cli.favicon), ("css", &cli.css)] {
        if let Some(path) = path {
            branding.insert(key.into(), json!(path));
        }
    }

    if !content.is_empty() {
        top.insert("content".into(), Value::Object(content));
    }
    if !branding.is_empty() {
        top.insert("branding".into(), Value::Object(branding));
    }
    Ok(Value::Object(top))
}

fn load_config(cli: &Cli) -> Result<BuildConfig> {
    let config = BuildConfig::default().with_overrides(cli_overrides(cli)?)?;
    match &cli.config {
        Some(path) => config.with_file(path),
        None => Ok(config),
    }
}

fn print_catalogs(catalogs: &Catalogs) {
    for (id, package) in catalogs.package_ids() {
        println!(
            "{id}\n  type: {}\n  size: {}\n  url: {}",
            package.kind, package.size, package.url
        );
        if let Some(name) = &package.name {
            println!("  name: {name}");
        }
        if let Some(language) = &package.language {
            println!("  language: {language}");
        }
    }
}

fn check_mount(config: &BuildConfig, image: &Path) -> Result<()> {
    let index = ContentIndex::load(&config.emulator.contents_index(), &config.mirror)?;
    let base = index.get(BASE_IMAGE_KEY)?;
    let root_size = base.root_partition_size().ok_or_else(|| {
        BuildError::Configuration("base image entry has no root_partition_size".into())
    })?;
    let image_size = std::fs::metadata(image)
        .with_context(|| format!("Failed to stat '{}'", image.display()))?
        .len();
    let layout = compute_layout(
        i64::try_from(root_size)?,
        DiskExtent::Sectors(i64::try_from(image_size / SECTOR_SIZE)?),
    )?;
    let driver = host_driver(Elevation::for_host(false))?;
    check_mount_procedure(driver, image, &layout)?;
    println!("Mount check passed for '{}'", image.display());
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;

    if let Some(image) = &cli.check_mount {
        return check_mount(&config, image);
    }

    let catalogs = Catalogs::fetch(&config.catalogs).map_err(|e| {
        eprintln!("Catalog downloads failed, you may check your internet connection");
        e
    })?;
    if cli.catalog {
        print_catalogs(&catalogs);
        return Ok(());
    }

    config.validate()?;
    let index = ContentIndex::load(&config.emulator.contents_index(), &config.mirror)?;

    let registry = Arc::new(CancelRegistry::new());
    let elevation = Elevation::for_host(false);
    let driver = host_driver(elevation)?;
    let backend = HostBackend::new(config.clone(), Arc::clone(&registry), driver, elevation)?;
    install_interrupt_handler(Arc::clone(&registry), backend.stop_flag())?;
    let pipeline = InstallationPipeline::new(&config, &index, &catalogs, backend);

    let image = pipeline.run()?;
    println!("Installation succeeded: {}", image.display());
    Ok(())
}

/// Ctrl-C stops the emulator and any media write; the pipeline then fails
/// with a cancellation and cleans up as for any other error. A second
/// Ctrl-C exits at once.
fn install_interrupt_handler(registry: Arc<CancelRegistry>, stop: StopFlag) -> Result<()> {
    ctrlc::set_handler(move || {
        if registry.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!("Interrupted, stopping the build (Ctrl-C again to quit now)");
        stop.stop();
        let stopped = registry.cancel();
        info!(stopped, "cancellation requested");
    })
    .context("Failed to install interrupt handler")
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log = logging::init(cli.log_dir.as_deref());

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Installation failed: {e:#}");
            let code = classify(&e).map_or(1, BuildError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("appliance-builder").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults_leave_config_untouched() {
        let cli = parse(&[]);
        assert_eq!(cli_overrides(&cli).unwrap(), json!({}));
        assert_eq!(load_config(&cli).unwrap(), BuildConfig::default());
    }

    #[test]
    fn test_flags_map_onto_config() {
        let cli = parse(&[
            "--name", "kiwix", "--kalite", "fr", "en", "--aflatoun", "--size", "8GiB",
            "--admin-account", "boss", "hunter2", "--logo", "/x/logo.png",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.project_name, "kiwix");
        assert_eq!(config.content.kalite, vec!["fr", "en"]);
        assert!(config.content.aflatoun);
        assert_eq!(config.size, 8 << 30);
        assert_eq!(config.admin(), Some(("boss", "hunter2")));
        assert_eq!(config.branding.logo.as_deref(), Some(Path::new("/x/logo.png")));
    }

    #[test]
    fn test_config_file_supersedes_flags() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("box.json");
        std::fs::write(&file, r#"{"project_name": "fromfile"}"#).unwrap();

        let cli = Cli::try_parse_from([
            "appliance-builder",
            "--name",
            "fromflag",
            "--timezone",
            "UTC",
            "--config",
            file.to_str().unwrap(),
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.project_name, "fromfile");
        assert_eq!(config.timezone, "UTC");
    }
}
