//! Error handling for the filebay core.

pub mod types;

pub use types::{AppError, CacheError, ErrorKind, ToolError, TrashError};
