use thiserror::Error;

use crate::image::SegmentName;
use crate::version::Version;

/// Failure classes of the engine.
///
/// Every class except [`ErrorKind::Config`] is fatal once it reaches a patch site: a
/// partially applied patch set is worse than none, so callers are expected to turn these
/// into a process abort via [`crate::fatal::OrFail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Attach,
    LayoutMismatch,
    CapacityExhausted,
    ProtectionFailure,
    Config,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to obtain module handle for host executable: {0}")]
    ModuleHandle(String),

    #[error("Failed to obtain file version info for: {0}")]
    VersionInfo(String),

    #[error("Operation not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("Invalid image at {base:#x}: {message}")]
    InvalidImage { base: usize, message: String },

    #[error("Unsupported host version: {0}")]
    UnsupportedVersion(Version),

    #[error("ID {id} has no offset for host version {version}")]
    UnknownId { id: u64, version: Version },

    #[error("Segment {0} not present in host image")]
    SegmentMissing(SegmentName),

    #[error("Pattern mismatch at {address:#x}: expected [{expected}], found [{found}]")]
    PatternMismatch {
        address: usize,
        expected: String,
        found: String,
    },

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Displacement from {from:#x} to {to:#x} does not fit in 32 bits")]
    DisplacementOutOfRange { from: usize, to: usize },

    #[error("Null address for {0}")]
    NullAddress(&'static str),

    #[error("Trampoline capacity exhausted: requested {requested} bytes, {remaining} of {capacity} remaining")]
    CapacityExhausted {
        requested: usize,
        remaining: usize,
        capacity: usize,
    },

    #[error("Failed to {stage} protection for {len} bytes at {address:#x}: {message}")]
    ProtectionFailure {
        address: usize,
        len: usize,
        stage: ProtectStage,
        message: String,
    },

    #[error("Failed to allocate {size} bytes of executable memory: {message}")]
    AllocationFailed { size: usize, message: String },

    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Which half of a protect/restore pair failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ProtectStage {
    #[strum(serialize = "unprotect")]
    Unprotect,
    #[strum(serialize = "restore")]
    Restore,
    #[strum(serialize = "query")]
    Query,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ModuleHandle(_) | Error::VersionInfo(_) | Error::Unsupported(_) => {
                ErrorKind::Attach
            }
            Error::InvalidImage { .. }
            | Error::UnsupportedVersion(_)
            | Error::UnknownId { .. }
            | Error::SegmentMissing(_)
            | Error::PatternMismatch { .. }
            | Error::InvalidPattern(_)
            | Error::DisplacementOutOfRange { .. }
            | Error::NullAddress(_) => ErrorKind::LayoutMismatch,
            Error::CapacityExhausted { .. } => ErrorKind::CapacityExhausted,
            Error::ProtectionFailure { .. } | Error::AllocationFailed { .. } => {
                ErrorKind::ProtectionFailure
            }
            Error::InvalidVersion(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Toml(_)
            | Error::TomlSer(_) => {
                ErrorKind::Config
            }
        }
    }

    /// Re-tag a protection failure with the stage it happened in.
    pub(crate) fn at_stage(self, stage: ProtectStage) -> Self {
        match self {
            Error::ProtectionFailure {
                address,
                len,
                message,
                ..
            } => Error::ProtectionFailure {
                address,
                len,
                stage,
                message,
            },
            other => other,
        }
    }

    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
