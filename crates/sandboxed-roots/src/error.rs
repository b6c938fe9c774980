//! Error types for multi-root path sandboxing.

use std::path::PathBuf;

/// Result type for sandboxed path resolution.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur while resolving paths against the configured roots.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The candidate path escapes (or cannot be pinned inside) every
    /// configured root. Resolution fails closed: a path that cannot be
    /// proven to stay within its root is rejected, never partially resolved.
    #[error("path traversal attempt: {path:?}")]
    PathTraversal { path: PathBuf },

    /// Path failed basic validation before resolution was attempted
    #[error("path validation failed: {path:?} - {reason}")]
    PathValidation { path: PathBuf, reason: String },

    /// The filesystem refused an operation needed for resolution
    #[error("I/O error resolving {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
