//! Service layer: thumbnail generation, video transcoding, trash.

pub mod ebook_cover;
pub mod stream_prober;
pub mod thumbnails;
pub mod transcoding;
pub mod trash;

pub use stream_prober::{ProbeSummary, StreamProber};
pub use thumbnails::ThumbnailService;
pub use transcoding::TranscodingService;
pub use trash::TrashService;
