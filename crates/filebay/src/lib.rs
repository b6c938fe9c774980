pub mod cache;
pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use cache::ArtifactCache;
pub use config::Config;
pub use errors::{AppError, ErrorKind};
pub use services::{ThumbnailService, TranscodingService, TrashService};
