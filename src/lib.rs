//! Builds offline-education appliance disk images.
//!
//! A build takes a prepared base image, boots it in an emulated ARM guest
//! to configure it, copies bulk content onto its data partition from the
//! host, runs a second guest pass to register that content and optionally
//! writes the result to removable media.
//!
//! # Architecture
//!
//! ```text
//! pipeline ──┬── content   descriptors, cache, archives, catalogs, collections
//!            ├── vm        emulator process, serial login, SSH session
//!            │     └── provision   playbook runs on the guest
//!            ├── device    data partition attach/mount per host OS
//!            │     └── geometry    partition offsets
//!            ├── media     write and verify removable media
//!            ├── preflight host tools and free space
//!            └── power     keeps the host awake while it runs
//!
//! cancel, process, error, config, logging: shared by all of the above
//! ```
//!
//! The pipeline talks to the outside world only through
//! [`pipeline::BuildBackend`]; [`pipeline::HostBackend`] is the real one.

pub mod cancel;
pub mod config;
pub mod content;
pub mod device;
pub mod error;
pub mod fsutil;
pub mod geometry;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod power;
pub mod preflight;
pub mod process;
pub mod provision;
pub mod vm;

pub use cancel::CancelRegistry;
pub use config::BuildConfig;
pub use error::{classify, BuildError};
pub use pipeline::{InstallationPipeline, Stage};
