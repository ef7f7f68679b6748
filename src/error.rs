//! Error taxonomy for appliance builds.
//!
//! Operations return `anyhow::Result` and attach context as errors bubble
//! up. Failures that callers need to tell apart are raised as a
//! [`BuildError`] so they can be recovered with `downcast_ref`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid parameter or parameter combination.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Not enough free space on the host for the requested image.
    #[error("insufficient space: {0}")]
    Space(String),

    /// Selected content does not fit in the requested image size.
    #[error("selected content requires {required} bytes but the image size is {requested} bytes")]
    ContentTooLarge { required: u64, requested: u64 },

    #[error("catalog retrieval failed: {0}")]
    Catalog(String),

    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("device {device}: {reason}")]
    Device { device: String, reason: String },

    #[error("console signal {signal:?} not observed within {timeout:?}{}", detail_suffix(.detail))]
    EmulationTimeout {
        signal: String,
        timeout: Duration,
        detail: Option<String>,
    },

    #[error("provisioning command exited with status {status}: {command}")]
    Provisioning { command: String, status: i32 },

    #[error("integrity check failed for {subject}: {reason}")]
    Integrity { subject: String, reason: String },

    #[error("ambiguous disk report: {0}")]
    AmbiguousReport(String),

    /// A command failed after the build was cancelled.
    #[error("cancelled while running {0}")]
    Cancelled(String),
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(" ({d})"),
        None => String::new(),
    }
}

impl BuildError {
    pub fn device(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Device {
            device: device.into(),
            reason: reason.into(),
        }
    }

    pub fn integrity(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Integrity {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for the command-line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Catalog(_) => 2,
            Self::ContentTooLarge { .. } => 3,
            _ => 1,
        }
    }
}

/// Find the first [`BuildError`] in an error chain.
pub fn classify(err: &anyhow::Error) -> Option<&BuildError> {
    err.chain().find_map(|cause| cause.downcast_ref::<BuildError>())
}
