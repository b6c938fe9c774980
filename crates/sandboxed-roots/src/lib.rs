//! # Sandboxed Roots
//!
//! Multi-root path sandboxing with fail-closed traversal protection.
//!
//! User-supplied paths are resolved against a primary root plus any number of
//! named mount points. Resolution canonicalizes the existing portion of the
//! path (so `..`, `.` and symlinks are handled by the OS, not by string
//! matching) and then requires the chosen root to remain a strict prefix of
//! the result. A path that cannot be proven to stay inside its root is
//! rejected with [`SandboxError::PathTraversal`], never partially resolved.
//!
//! ## Usage
//!
//! ```rust
//! use sandboxed_roots::{Mount, RootSet};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let roots = RootSet::new(
//!     "/srv/files",
//!     vec![Mount {
//!         name: "media".to_string(),
//!         path: "/mnt/media".into(),
//!         icon: Some("hard-drive".to_string()),
//!     }],
//! )?;
//!
//! // Relative (or `/`-prefixed) paths resolve under the primary root.
//! let doc = roots.resolve("documents/report.pdf")?;
//!
//! // Absolute paths below a mount resolve inside that mount.
//! let movie = roots.resolve("/mnt/media/movie.mkv")?;
//!
//! // These fail closed:
//! assert!(roots.resolve("../../etc/passwd").is_err());
//!
//! // relativize is the inverse mapping for user-facing output.
//! assert_eq!(roots.relativize(&doc), "/documents/report.pdf");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod roots;

pub use error::{Result, SandboxError};
pub use roots::{Mount, RootSet};
