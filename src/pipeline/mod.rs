//! The installation pipeline.
//!
//! One run produces one image in the build directory:
//!
//! ```text
//! Master    base image from cache (or network), extracted as *.BUILDING.img
//! Download  every selected content item into cache/, one at a time
//! Setup     image grown, first guest pass (playbooks, configuration)
//! Copy      data partition mounted on the host, content placed
//! Move      second guest pass (content discovery)
//! Write     optional copy onto removable media
//! ```
//!
//! Any failure renames the image to `*.ERROR.img`, releases what the run
//! holds and returns the original error. Content already placed is not
//! rolled back.

pub mod backend;
pub mod progress;
pub mod stage;

pub use backend::{BuildBackend, HostBackend};
pub use progress::ProgressTracker;
pub use stage::Stage;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::config::BuildConfig;
use crate::content::collection::{all_downloads, collections, ContentSource};
use crate::content::sizing::{required_download_bytes, required_expanded_bytes};
use crate::content::{Catalogs, ContentDescriptor, FetchStatus};
use crate::error::BuildError;
use crate::geometry::{compute_layout, DiskExtent, SECTOR_SIZE};
use crate::provision::{ExtraVars, Provisioner};
use crate::vm::LineHook;

/// Contents index key of the base image.
pub const BASE_IMAGE_KEY: &str = "pibox_base_image";

pub const IMAGE_PREFIX: &str = "appliance";

/// The three names an image goes by during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePaths {
    pub building: PathBuf,
    pub finished: PathBuf,
    pub failed: PathBuf,
}

impl ImagePaths {
    pub fn new(build_dir: &Path, stamp: &str) -> Self {
        let name = |suffix: &str| build_dir.join(format!("{IMAGE_PREFIX}-{stamp}{suffix}.img"));
        Self {
            building: name(".BUILDING"),
            finished: name(""),
            failed: name(".ERROR"),
        }
    }

    pub fn now(build_dir: &Path) -> Self {
        Self::new(build_dir, &stamp(OffsetDateTime::now_utc()))
    }
}

/// `YYYY_MM_DD-HH_MM_SS`
pub fn stamp(t: OffsetDateTime) -> String {
    format!(
        "{:04}_{:02}_{:02}-{:02}_{:02}_{:02}",
        t.year(),
        t.month() as u8,
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

pub struct InstallationPipeline<'a, B: BuildBackend> {
    config: &'a BuildConfig,
    index: &'a dyn ContentSource,
    catalogs: &'a Catalogs,
    backend: B,
    tracker: Arc<Mutex<ProgressTracker>>,
}

impl<'a, B: BuildBackend> InstallationPipeline<'a, B> {
    pub fn new(
        config: &'a BuildConfig,
        index: &'a dyn ContentSource,
        catalogs: &'a Catalogs,
        backend: B,
    ) -> Self {
        let tracker = ProgressTracker::new(config.sd_card.is_some());
        Self {
            config,
            index,
            catalogs,
            backend,
            tracker: Arc::new(Mutex::new(tracker)),
        }
    }

    pub fn tracker(&self) -> Arc<Mutex<ProgressTracker>> {
        Arc::clone(&self.tracker)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Build into a freshly named image. Returns the finished image path.
    pub fn run(&self) -> Result<PathBuf> {
        self.run_to(&ImagePaths::now(&self.config.build_dir))
    }

    pub fn run_to(&self, paths: &ImagePaths) -> Result<PathBuf> {
        info!(image = %paths.building.display(), "build started");
        let awake = self.backend.keep_awake();
        let result = self.build(paths);
        self.backend.release_media();
        drop(awake);

        let mut tracker = self.tracker.lock();
        tracker.finish();
        for line in tracker.summary() {
            info!("{line}");
        }
        drop(tracker);

        match result {
            Ok(()) => {
                fs::rename(&paths.building, &paths.finished).with_context(|| {
                    format!("Failed to rename image to '{}'", paths.finished.display())
                })?;
                info!(image = %paths.finished.display(), "build done");
                Ok(paths.finished.clone())
            }
            Err(e) => {
                if paths.building.is_file() {
                    if let Err(rename) = fs::rename(&paths.building, &paths.failed) {
                        warn!(error = %rename, "failed to mark image as failed");
                    }
                }
                if self.backend.is_cancelled() {
                    info!("build cancelled: {e:#}");
                } else {
                    error!("build failed: {e:#}");
                }
                Err(e)
            }
        }
    }

    /// Start `stage`, unless the run was cancelled meanwhile.
    fn enter(&self, stage: Stage) -> Result<()> {
        if self.backend.is_cancelled() {
            bail!(BuildError::Cancelled(format!("stopped before {stage:?}")));
        }
        self.tracker.lock().enter(stage);
        Ok(())
    }

    fn set_progress(&self, done: usize, total: usize) {
        if total > 0 {
            self.tracker.lock().set_progress(done as f64 / total as f64);
        }
    }

    fn line_hook(&self) -> LineHook {
        let tracker = Arc::clone(&self.tracker);
        Arc::new(move |line| tracker.lock().playbook_line(line))
    }

    /// Refuse selections that cannot fit in the requested image.
    pub fn check_content_fits(
        &self,
        base: &ContentDescriptor,
        downloads: &[ContentDescriptor],
    ) -> Result<()> {
        let required = base.expanded_size() + required_expanded_bytes(downloads);
        let requested = self.config.size;
        if required > requested {
            bail!(BuildError::ContentTooLarge {
                required,
                requested
            });
        }
        Ok(())
    }

    fn build(&self, paths: &ImagePaths) -> Result<()> {
        let config = self.config;
        let cache_dir = config.cache_dir();
        let base = self.index.descriptor(BASE_IMAGE_KEY)?;
        let root_size = base.root_partition_size().ok_or_else(|| {
            BuildError::Configuration("base image entry has no root_partition_size".into())
        })?;
        let collections = collections(&config.selection(), self.index, self.catalogs)?;
        let downloads = all_downloads(&collections);

        self.check_content_fits(&base, &downloads)?;
        let mut everything = vec![base.clone()];
        everything.extend(downloads.iter().cloned());
        let required_free = config.size + required_download_bytes(&everything, &cache_dir);
        self.backend.preflight(&config.build_dir, required_free)?;

        if let Some(device) = &config.sd_card {
            self.backend.prepare_media(device)?;
        }

        self.enter(Stage::Master)?;
        let status = self
            .backend
            .download(&base, &cache_dir)
            .with_context(|| format!("Failed to retrieve base image from {}", base.url()))?;
        if status == FetchStatus::Found {
            info!("reusing cached base image");
        }
        self.backend
            .extract_base_image(&base, &cache_dir, &paths.building)?;
        if !paths.building.is_file() {
            bail!(BuildError::integrity(
                base.name(),
                format!("'{}' was not extracted", paths.building.display())
            ));
        }

        self.enter(Stage::Download)?;
        for (done, descriptor) in downloads.iter().enumerate() {
            self.set_progress(done, downloads.len());
            let status = self
                .backend
                .download(descriptor, &cache_dir)
                .with_context(|| format!("Failed to retrieve {}", descriptor.url()))?;
            info!(name = descriptor.name(), ?status, "content ready");
        }

        self.enter(Stage::Setup)?;
        self.backend.resize_image(&paths.building, config.size)?;
        let vars = ExtraVars::build(config, root_size, config.size);
        let mut provisioner = Provisioner::new(config, vars);
        self.backend
            .configure(&paths.building, &mut provisioner, self.line_hook())?;

        self.enter(Stage::Copy)?;
        // the guest's resize pass extends the data partition to the last sector
        let layout = compute_layout(
            i64::try_from(root_size)?,
            DiskExtent::Sectors(i64::try_from(config.size / SECTOR_SIZE)?),
        )?;
        let mut mounted = self.backend.mount_data(&paths.building, &layout)?;
        for (done, collection) in collections.iter().enumerate() {
            info!(collection = collection.name, "placing content");
            self.backend
                .place(collection, &cache_dir, mounted.mount_point())
                .with_context(|| format!("Failed to place {}", collection.name))?;
            self.set_progress(done + 1, collections.len());
        }
        mounted.release()?;

        self.enter(Stage::Move)?;
        self.backend
            .post_process(&paths.building, &mut provisioner, self.line_hook())?;

        if let Some(device) = &config.sd_card {
            self.enter(Stage::Write)?;
            let tracker = Arc::clone(&self.tracker);
            self.backend
                .write_media(&paths.building, device, &mut |written, total| {
                    if total > 0 {
                        tracker.lock().set_progress(written as f64 / total as f64);
                    }
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::collection::Collection;
    use crate::content::ContentIndex;
    use crate::device::fake::FakeDevice;
    use crate::device::{mount_data_partition, MountedPartition};
    use crate::error::classify;
    use crate::geometry::PartitionLayout;
    use serde_json::json;
    use crate::power::{Inhibit, SleepGuard};
    use crate::process::Cmd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const GIB: u64 = 1 << 30;

    const INDEX: &str = r#"{
        "pibox_base_image": {"url": "{mirror}/base.zip", "name": "base.zip", "checksum": "a",
            "archive_size": 10, "expanded_size": 1000000, "root_partition_size": 1000000},
        "aflatoun_content": {"url": "{mirror}/aflatoun.tar.gz", "name": "aflatoun.tar.gz",
            "checksum": "b", "archive_size": 20, "expanded_size": 2000000}
    }"#;

    const TASKS: &str = "### TASKS ###^p^play^pattern^tasks:^      one\tTAGS: []^      two\tTAGS: []";

    #[derive(Default)]
    struct FakeBackend {
        device: Arc<FakeDevice>,
        calls: Mutex<Vec<String>>,
        fail_place: bool,
        /// Raise the cancelled flag once the first guest pass is done.
        cancel_after_configure: bool,
        cancelled: AtomicBool,
        /// Inhibitor stand-in: its `cat` ends and touches this file on release.
        awake_marker: Option<PathBuf>,
    }

    impl FakeBackend {
        fn new(mount_root: &Path) -> Self {
            Self {
                device: Arc::new(FakeDevice::new(mount_root)),
                ..Default::default()
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    impl BuildBackend for FakeBackend {
        fn preflight(&self, _build_dir: &Path, _required_free: u64) -> Result<()> {
            self.record("preflight");
            Ok(())
        }

        fn prepare_media(&self, device: &str) -> Result<()> {
            self.record(format!("prepare {device}"));
            Ok(())
        }

        fn release_media(&self) {
            self.record("release");
        }

        fn download(&self, descriptor: &ContentDescriptor, _cache_dir: &Path) -> Result<FetchStatus> {
            self.record(format!("download {}", descriptor.name()));
            Ok(FetchStatus::Downloaded)
        }

        fn extract_base_image(
            &self,
            _descriptor: &ContentDescriptor,
            _cache_dir: &Path,
            dest: &Path,
        ) -> Result<()> {
            self.record("extract");
            fs::write(dest, b"image")?;
            Ok(())
        }

        fn resize_image(&self, _image: &Path, size: u64) -> Result<()> {
            self.record(format!("resize {size}"));
            Ok(())
        }

        fn configure(&self, _image: &Path, provisioner: &mut Provisioner<'_>, on_line: LineHook) -> Result<()> {
            assert!(provisioner.vars().get("disk_size").is_some());
            self.record("configure");
            if let Some(marker) = &self.awake_marker {
                assert!(!marker.exists(), "released before the guest pass");
            }
            on_line(TASKS);
            on_line("TASK [two] ****");
            if self.cancel_after_configure {
                self.cancelled.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        fn mount_data(&self, image: &Path, layout: &PartitionLayout) -> Result<MountedPartition> {
            mount_data_partition(self.device.clone(), image, layout)
        }

        fn place(&self, collection: &Collection, _cache_dir: &Path, mount_point: &Path) -> Result<()> {
            self.record(format!("place {}", collection.name));
            if self.fail_place {
                bail!(BuildError::device("/dev/fake0", "no space left on device"));
            }
            fs::write(mount_point.join(collection.name), b"content")?;
            Ok(())
        }

        fn post_process(&self, _image: &Path, _provisioner: &mut Provisioner<'_>, _on_line: LineHook) -> Result<()> {
            self.record("post-process");
            Ok(())
        }

        fn write_media(&self, _image: &Path, device: &str, progress: &mut dyn FnMut(u64, u64)) -> Result<()> {
            self.record(format!("write {device}"));
            progress(1, 2);
            Ok(())
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }

        fn keep_awake(&self) -> Option<SleepGuard> {
            let marker = self.awake_marker.as_ref()?;
            let cmd = Cmd::new("sh").args([
                "-c".to_string(),
                format!("cat >/dev/null; touch '{}'", marker.display()),
            ]);
            Some(SleepGuard::acquire(Inhibit::Process(cmd)).unwrap())
        }
    }

    struct Fixture {
        temp: TempDir,
        index: ContentIndex,
        catalogs: Catalogs,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                temp: TempDir::new().unwrap(),
                index: ContentIndex::from_json(INDEX, "http://mirror").unwrap(),
                catalogs: Catalogs::new(Vec::new()),
            }
        }

        fn config(&self, size: u64, sd_card: Option<&str>) -> BuildConfig {
            BuildConfig::default()
                .with_overrides(json!({
                    "build_dir": self.temp.path(),
                    "size": size,
                    "content": {"aflatoun": true},
                    "sd_card": sd_card,
                }))
                .unwrap()
        }

        fn paths(&self) -> ImagePaths {
            ImagePaths::new(self.temp.path(), "2024_01_02-03_04_05")
        }
    }

    #[test]
    fn test_image_names() {
        let paths = ImagePaths::new(Path::new("/b"), "2024_01_02-03_04_05");
        assert_eq!(paths.building, Path::new("/b/appliance-2024_01_02-03_04_05.BUILDING.img"));
        assert_eq!(paths.finished, Path::new("/b/appliance-2024_01_02-03_04_05.img"));
        assert_eq!(paths.failed, Path::new("/b/appliance-2024_01_02-03_04_05.ERROR.img"));

        let t = OffsetDateTime::from_unix_timestamp(1_704_164_645).unwrap();
        assert_eq!(stamp(t), "2024_01_02-03_04_05");
    }

    #[test]
    fn test_successful_build_runs_stages_in_order() {
        let fx = Fixture::new();
        let config = fx.config(3 * GIB, Some("/dev/sdz"));
        let backend = FakeBackend::new(&fx.temp.path().join("mnt"));
        let pipeline = InstallationPipeline::new(&config, &fx.index, &fx.catalogs, backend);

        let image = pipeline.run_to(&fx.paths()).unwrap();
        assert_eq!(image, fx.paths().finished);
        assert!(image.is_file());
        assert!(!fx.paths().building.exists());

        let backend = pipeline.backend();
        assert_eq!(
            backend.calls(),
            vec![
                "preflight".to_string(),
                "prepare /dev/sdz".into(),
                "download base.zip".into(),
                "extract".into(),
                "download aflatoun.tar.gz".into(),
                format!("resize {}", 3 * GIB),
                "configure".into(),
                "place Aflatoun".into(),
                "post-process".into(),
                "write /dev/sdz".into(),
                "release".into(),
            ]
        );
        assert_eq!(backend.device.count("unmount"), 1);
        assert!(fx.temp.path().join("mnt/Aflatoun").is_file());

        let tracker = pipeline.tracker();
        let stages: Vec<Stage> = tracker.lock().records().iter().map(|r| r.stage).collect();
        assert_eq!(stages, Stage::ALL.to_vec());
    }

    #[test]
    fn test_playbook_output_drives_setup_progress() {
        let fx = Fixture::new();
        let config = fx.config(3 * GIB, None);
        let backend = FakeBackend::new(&fx.temp.path().join("mnt"));
        let pipeline = InstallationPipeline::new(&config, &fx.index, &fx.catalogs, backend);

        let tracker = pipeline.tracker();
        pipeline.line_hook()("ignored outside guest stages");
        tracker.lock().enter(Stage::Setup);
        pipeline.line_hook()(TASKS);
        pipeline.line_hook()("TASK [two] ****");
        assert_eq!(tracker.lock().current_task(), Some("two"));
        let expected = 2.0 / 5.0 + 0.5 / 5.0;
        assert!((tracker.lock().overall() - expected).abs() < 1e-9);
    }

    #[cfg(unix)]
    #[test]
    fn test_host_kept_awake_for_the_whole_run() {
        let fx = Fixture::new();
        let config = fx.config(3 * GIB, None);
        let marker = fx.temp.path().join("awake-released");
        let backend = FakeBackend {
            awake_marker: Some(marker.clone()),
            fail_place: true,
            ..FakeBackend::new(&fx.temp.path().join("mnt"))
        };
        let pipeline = InstallationPipeline::new(&config, &fx.index, &fx.catalogs, backend);

        pipeline.run_to(&fx.paths()).unwrap_err();
        assert_eq!(pipeline.backend().count("configure"), 1);
        assert!(marker.exists());
    }

    #[test]
    fn test_cancellation_stops_at_next_stage() {
        let fx = Fixture::new();
        let config = fx.config(3 * GIB, Some("/dev/sdz"));
        let backend = FakeBackend {
            cancel_after_configure: true,
            ..FakeBackend::new(&fx.temp.path().join("mnt"))
        };
        let pipeline = InstallationPipeline::new(&config, &fx.index, &fx.catalogs, backend);

        let err = pipeline.run_to(&fx.paths()).unwrap_err();
        assert!(matches!(classify(&err), Some(BuildError::Cancelled(_))));
        assert!(fx.paths().failed.is_file());

        let backend = pipeline.backend();
        assert_eq!(backend.device.count("attach"), 0);
        assert_eq!(backend.count("place"), 0);
        assert_eq!(backend.count("write"), 0);
        assert_eq!(backend.count("release"), 1);
    }

    #[test]
    fn test_failed_placement_marks_image_and_releases_device_once() {
        let fx = Fixture::new();
        let config = fx.config(3 * GIB, Some("/dev/sdz"));
        let backend = FakeBackend {
            fail_place: true,
            ..FakeBackend::new(&fx.temp.path().join("mnt"))
        };
        let pipeline = InstallationPipeline::new(&config, &fx.index, &fx.catalogs, backend);

        let err = pipeline.run_to(&fx.paths()).unwrap_err();
        match classify(&err) {
            Some(BuildError::Device { device, reason }) => {
                assert_eq!(device, "/dev/fake0");
                assert_eq!(reason, "no space left on device");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(fx.paths().failed.is_file());
        assert!(!fx.paths().building.exists());
        assert!(!fx.paths().finished.exists());

        let backend = pipeline.backend();
        assert_eq!(backend.device.count("unmount"), 1);
        assert_eq!(backend.device.count("detach"), 1);
        assert_eq!(backend.count("post-process"), 0);
        assert_eq!(backend.count("release"), 1);
    }

    #[test]
    fn test_undersized_image_is_rejected_before_any_download() {
        let fx = Fixture::new();
        let config = fx.config(GIB, None);
        let backend = FakeBackend::new(&fx.temp.path().join("mnt"));
        let pipeline = InstallationPipeline::new(&config, &fx.index, &fx.catalogs, backend);

        let err = pipeline.run_to(&fx.paths()).unwrap_err();
        let build_error = classify(&err).unwrap();
        assert!(matches!(
            build_error,
            BuildError::ContentTooLarge { requested, .. } if *requested == GIB
        ));
        assert_eq!(build_error.exit_code(), 3);
        assert_eq!(pipeline.backend().count("download"), 0);
        assert_eq!(pipeline.backend().count("preflight"), 0);
        // nothing was extracted, so nothing to mark
        assert!(!fx.paths().failed.exists());
    }
}
