//! Named phases of an installation.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Retrieve and extract the base image.
    Master,
    Download,
    /// First guest pass.
    Setup,
    /// Host-side placement onto the data partition.
    Copy,
    /// Second guest pass.
    Move,
    /// Optional write to removable media.
    Write,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Master,
        Stage::Download,
        Stage::Setup,
        Stage::Copy,
        Stage::Move,
        Stage::Write,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Stage::Master => "master",
            Stage::Download => "download",
            Stage::Setup => "setup",
            Stage::Copy => "copy",
            Stage::Move => "move",
            Stage::Write => "write",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Master => "Retrieve Master Image",
            Stage::Download => "Download contents",
            Stage::Setup => "Image configuration (virtualized)",
            Stage::Copy => "Copy contents onto image",
            Stage::Move => "Post-process contents (virtualized)",
            Stage::Write => "SD-card creation",
        }
    }

    /// 1-based position.
    pub fn number(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).map_or(0, |i| i + 1)
    }

    /// Whether playbook output drives this stage's progress.
    pub fn is_virtualized(self) -> bool {
        matches!(self, Stage::Setup | Stage::Move)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
