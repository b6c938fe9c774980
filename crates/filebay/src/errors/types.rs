//! Error type definitions for the filebay core.
//!
//! Producer-level failures (decode errors, external tool failures, timeouts)
//! are caught at the component boundary and surface as `None` results plus a
//! log line; they never unwind through the cache or trash layers. The types
//! here cover the structural failures that do propagate: sandbox violations,
//! vanished sources, and manifest update failures.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Sandbox violations (path traversal, invalid candidate paths)
    #[error(transparent)]
    Sandbox(#[from] sandboxed_roots::SandboxError),

    /// Artifact cache failures
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Trash manifest failures
    #[error("trash error: {0}")]
    Trash(#[from] TrashError),

    /// A requested source file does not exist
    #[error("not found: {path:?}")]
    NotFound { path: PathBuf },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Uncategorized I/O failures
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport-neutral classification of an [`AppError`].
///
/// The HTTP layer (out of scope here) maps these to status codes in one
/// place; the core never depends on transport concepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidInput,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sandbox(sandboxed_roots::SandboxError::PathTraversal { .. }) => {
                ErrorKind::Forbidden
            }
            Self::Sandbox(sandboxed_roots::SandboxError::PathValidation { .. }) => {
                ErrorKind::InvalidInput
            }
            Self::Sandbox(sandboxed_roots::SandboxError::Io { .. }) => ErrorKind::Internal,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Cache(CacheError::SourceUnavailable { .. }) => ErrorKind::NotFound,
            Self::Configuration { .. } => ErrorKind::InvalidInput,
            Self::Cache(_) | Self::Trash(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Artifact cache errors.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The source file vanished between key computation steps; callers treat
    /// this as not-found
    #[error("source unavailable: {path:?}")]
    SourceUnavailable { path: PathBuf },

    /// Cache directory or entry I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trash subsystem errors.
///
/// The manifest file is the durable record for original-path recovery, so
/// failures to persist it are structural and propagate; an entry whose
/// backing file is missing is merely inconsistent and is pruned lazily.
#[derive(Error, Debug)]
pub enum TrashError {
    /// Sandbox violation while resolving an original path
    #[error(transparent)]
    Sandbox(#[from] sandboxed_roots::SandboxError),

    /// Manifest could not be written back
    #[error("manifest serialization failed: {0}")]
    ManifestSerialize(#[from] serde_json::Error),

    /// Filesystem operation on the trash directory failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// External tool invocation failures.
///
/// These stay inside the producing component: every variant is converted to a
/// `None` artifact at the boundary after logging.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The executable is not installed or not on PATH; the feature degrades
    /// instead of crashing
    #[error("{tool} not found - install ffmpeg")]
    Unavailable { tool: String },

    /// The process exceeded its time budget and was killed
    #[error("{tool} timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    /// Non-zero exit or unusable output
    #[error("{tool} failed: {message}")]
    Failed { tool: String, message: String },
}

impl ToolError {
    /// Map a process spawn error: a missing executable degrades the feature,
    /// anything else is a plain failure.
    pub fn from_spawn(tool: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::Unavailable {
                tool: tool.to_string(),
            }
        } else {
            Self::Failed {
                tool: tool.to_string(),
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        let traversal = AppError::Sandbox(sandboxed_roots::SandboxError::PathTraversal {
            path: PathBuf::from("../x"),
        });
        assert_eq!(traversal.kind(), ErrorKind::Forbidden);

        let missing = AppError::NotFound {
            path: PathBuf::from("/gone.txt"),
        };
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let vanished = AppError::Cache(CacheError::SourceUnavailable {
            path: PathBuf::from("/gone.mp4"),
        });
        assert_eq!(vanished.kind(), ErrorKind::NotFound);
    }
}
