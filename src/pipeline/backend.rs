//! Side effects the installation pipeline depends on.
//!
//! [`InstallationPipeline`](super::InstallationPipeline) only sequences
//! stages and cleans up. Everything that touches the network, the
//! emulator, host devices or removable media goes through
//! [`BuildBackend`], so the sequencing can be exercised without any of
//! them.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cancel::CancelRegistry;
use crate::config::BuildConfig;
use crate::content::collection::{self, Collection};
use crate::content::{
    download_if_missing, extract_entry, ContentDescriptor, FetchStatus, HttpFetcher, ReqwestFetcher,
    RetryPolicy,
};
use crate::device::{mount_data_partition, MountedPartition, VirtualBlockDevice};
use crate::error::BuildError;
use crate::geometry::PartitionLayout;
use crate::media::{self, MediaGrant, StopFlag, WriteOutcome};
use crate::power::{self, SleepGuard};
use crate::preflight;
use crate::process::{Elevation, HostPlatform};
use crate::provision::Provisioner;
use crate::vm::{BootScript, Emulator, LineHook};

pub trait BuildBackend {
    /// Host checks; `required_free` is what the build dir must hold.
    fn preflight(&self, build_dir: &Path, required_free: u64) -> Result<()>;

    /// Open up `device` for writing. Undone by [`release_media`](Self::release_media).
    fn prepare_media(&self, device: &str) -> Result<()>;

    /// Best effort, safe to call when nothing was prepared.
    fn release_media(&self);

    fn download(&self, descriptor: &ContentDescriptor, cache_dir: &Path) -> Result<FetchStatus>;

    /// Extract the base image from its cached archive to `dest`.
    fn extract_base_image(
        &self,
        descriptor: &ContentDescriptor,
        cache_dir: &Path,
        dest: &Path,
    ) -> Result<()>;

    /// Grow `image` to `size` bytes.
    fn resize_image(&self, image: &Path, size: u64) -> Result<()>;

    /// First guest pass: upload playbooks, then configure.
    fn configure(&self, image: &Path, provisioner: &mut Provisioner<'_>, on_line: LineHook) -> Result<()>;

    fn mount_data(&self, image: &Path, layout: &PartitionLayout) -> Result<MountedPartition>;

    fn place(&self, collection: &Collection, cache_dir: &Path, mount_point: &Path) -> Result<()>;

    /// Second guest pass: move content into place.
    fn post_process(&self, image: &Path, provisioner: &mut Provisioner<'_>, on_line: LineHook) -> Result<()>;

    /// Write and verify. `progress` receives `(written, total)`.
    fn write_media(&self, image: &Path, device: &str, progress: &mut dyn FnMut(u64, u64)) -> Result<()>;

    /// Whether failures should be read as the result of a cancellation.
    fn is_cancelled(&self) -> bool {
        false
    }

    /// Held for the whole run.
    fn keep_awake(&self) -> Option<SleepGuard> {
        None
    }
}

/// The real thing: emulator, host block devices, HTTP.
pub struct HostBackend {
    config: BuildConfig,
    registry: Arc<CancelRegistry>,
    driver: Arc<dyn VirtualBlockDevice>,
    fetcher: Box<dyn HttpFetcher + Send + Sync>,
    retry: RetryPolicy,
    elevation: Elevation,
    stop: StopFlag,
    grant: Mutex<Option<MediaGrant>>,
}

impl HostBackend {
    pub fn new(
        config: BuildConfig,
        registry: Arc<CancelRegistry>,
        driver: Arc<dyn VirtualBlockDevice>,
        elevation: Elevation,
    ) -> Result<Self> {
        Ok(Self {
            config,
            registry,
            driver,
            fetcher: Box::new(ReqwestFetcher::new()?),
            retry: RetryPolicy::default(),
            elevation,
            stop: StopFlag::new(),
            grant: Mutex::new(None),
        })
    }

    /// Raised to interrupt a media write between chunks.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    fn emulator(&self, image: &Path) -> Emulator {
        let emu = &self.config.emulator;
        let script = BootScript {
            timeout: Duration::from_secs(emu.boot_timeout_secs),
            settle_delay: Duration::from_secs(emu.settle_delay_secs),
            ..BootScript::default()
        };
        Emulator::new(emu.kernel(), emu.dtb(), image.to_path_buf())
            .ram(&emu.ram)
            .boot_script(script)
    }
}

impl BuildBackend for HostBackend {
    fn preflight(&self, build_dir: &Path, required_free: u64) -> Result<()> {
        preflight::check_host(build_dir, required_free)
    }

    fn prepare_media(&self, device: &str) -> Result<()> {
        let grant = MediaGrant::acquire(HostPlatform::current(), device, self.elevation)?;
        *self.grant.lock() = Some(grant);
        Ok(())
    }

    fn release_media(&self) {
        if let Some(mut grant) = self.grant.lock().take() {
            grant.revert();
        }
    }

    fn download(&self, descriptor: &ContentDescriptor, cache_dir: &Path) -> Result<FetchStatus> {
        download_if_missing(descriptor, cache_dir, self.fetcher.as_ref(), &self.retry)
    }

    fn extract_base_image(
        &self,
        descriptor: &ContentDescriptor,
        cache_dir: &Path,
        dest: &Path,
    ) -> Result<()> {
        let entry = descriptor
            .name()
            .strip_suffix(".zip")
            .unwrap_or(descriptor.name());
        extract_entry(&descriptor.cache_path(cache_dir), entry, dest)
    }

    fn resize_image(&self, image: &Path, size: u64) -> Result<()> {
        self.emulator(image).resize_image(size)
    }

    fn configure(&self, image: &Path, provisioner: &mut Provisioner<'_>, on_line: LineHook) -> Result<()> {
        let playbooks = self.config.emulator.playbook_dir();
        self.emulator(image).run(&self.registry, |vm| {
            vm.set_line_hook(on_line);
            provisioner.upload_playbooks(vm, &playbooks)?;
            provisioner.run_phase_one(vm)
        })
    }

    fn mount_data(&self, image: &Path, layout: &PartitionLayout) -> Result<MountedPartition> {
        mount_data_partition(Arc::clone(&self.driver), image, layout)
    }

    fn place(&self, collection: &Collection, cache_dir: &Path, mount_point: &Path) -> Result<()> {
        collection::place(collection, cache_dir, mount_point)
    }

    fn post_process(&self, image: &Path, provisioner: &mut Provisioner<'_>, on_line: LineHook) -> Result<()> {
        self.emulator(image).run(&self.registry, |vm| {
            vm.set_line_hook(on_line);
            provisioner.run_phase_two(vm, false)
        })
    }

    fn write_media(&self, image: &Path, device: &str, progress: &mut dyn FnMut(u64, u64)) -> Result<()> {
        let target = Path::new(device);
        match media::write_image(image, target, &self.stop, progress)? {
            WriteOutcome::Completed { bytes } => {
                info!(bytes, device, "image written, verifying");
                media::verify_written(image, target)
            }
            WriteOutcome::Stopped { bytes } => {
                bail!(BuildError::Cancelled(format!("media write after {bytes} bytes")))
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.registry.is_cancelled() || self.stop.is_stopped()
    }

    fn keep_awake(&self) -> Option<SleepGuard> {
        power::prevent_sleep()
    }
}
