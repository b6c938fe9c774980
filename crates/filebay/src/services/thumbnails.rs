//! Thumbnail generation.
//!
//! Produces a bounded-size JPEG for raster images, animated images, vector
//! images, e-book covers and video frames. Results are cached through an
//! [`ArtifactCache`]; generation failures surface as `None` (no artifact),
//! never as an error page.

use crate::cache::ArtifactCache;
use crate::config::{ThumbnailsConfig, ToolsConfig};
use crate::errors::{CacheError, ToolError};
use crate::services::ebook_cover;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use resvg::{tiny_skia, usvg};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

const DEFAULT_TARGET: u32 = 256;
const FRAME_GRAB_TIMEOUT: Duration = Duration::from_secs(30);

/// What pipeline a source file goes through, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceCategory {
    Raster,
    Animated,
    Vector,
    Ebook,
    Video,
    /// HEIF/AVIF stills, decoded by the external tool when enabled
    HeifStill,
    Unsupported,
}

fn categorize(path: &Path, heif_enabled: bool) -> SourceCategory {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return SourceCategory::Unsupported;
    };
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tiff" | "tif" => SourceCategory::Raster,
        "gif" => SourceCategory::Animated,
        "svg" => SourceCategory::Vector,
        "epub" => SourceCategory::Ebook,
        "mp4" | "mkv" | "avi" | "mov" | "webm" | "flv" | "wmv" | "m4v" => SourceCategory::Video,
        "heic" | "heif" | "avif" if heif_enabled => SourceCategory::HeifStill,
        _ => SourceCategory::Unsupported,
    }
}

/// Thumbnail generation service, one per process.
pub struct ThumbnailService {
    cache: ArtifactCache,
    sizes: HashMap<String, u32>,
    quality: u8,
    heif: bool,
    ffmpeg_command: String,
}

impl ThumbnailService {
    pub fn new(config: &ThumbnailsConfig, tools: &ToolsConfig) -> Result<Self, CacheError> {
        let cache = ArtifactCache::new(
            config.cache_dir.clone(),
            "jpg",
            config.max_cache_size_mb * 1024 * 1024,
            config.eviction_check_every,
        )?;
        Ok(Self {
            cache,
            sizes: config.sizes.clone(),
            quality: config.quality,
            heif: config.heif,
            ffmpeg_command: tools.ffmpeg_command.clone(),
        })
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Return the JPEG thumbnail for `path` at the named size variant.
    ///
    /// `Ok(None)` means no thumbnail is available: the extension is
    /// unsupported, the source did not decode, or the external tool failed.
    ///
    /// # Errors
    /// [`CacheError::SourceUnavailable`] if the source vanished; callers
    /// treat this as not-found.
    pub async fn get_thumbnail(
        &self,
        path: &Path,
        size: &str,
    ) -> Result<Option<Vec<u8>>, CacheError> {
        let category = categorize(path, self.heif);
        if category == SourceCategory::Unsupported {
            return Ok(None);
        }
        let target = self.sizes.get(size).copied().unwrap_or(DEFAULT_TARGET);

        let entry = self
            .cache
            .get_or_create(path, size, |tmp| async move {
                match self.generate(category, path, target).await {
                    Some(bytes) => tokio::fs::write(&tmp, &bytes).await.is_ok(),
                    None => false,
                }
            })
            .await?;

        match entry {
            Some(entry_path) => Ok(Some(tokio::fs::read(&entry_path).await?)),
            None => Ok(None),
        }
    }

    /// Best-effort pixel dimensions of an image file.
    pub async fn dimensions(&self, path: &Path) -> Option<(u32, u32)> {
        let data = tokio::fs::read(path).await.ok()?;
        tokio::task::spawn_blocking(move || {
            image::load_from_memory(&data)
                .ok()
                .map(|img| (img.width(), img.height()))
        })
        .await
        .ok()
        .flatten()
    }

    async fn generate(
        &self,
        category: SourceCategory,
        path: &Path,
        target: u32,
    ) -> Option<Vec<u8>> {
        match category {
            // GIF decoding yields the first frame, so Animated shares the
            // raster pipeline.
            SourceCategory::Raster | SourceCategory::Animated => {
                self.raster_thumbnail(path, target).await
            }
            SourceCategory::Vector => self.vector_thumbnail(path, target).await,
            SourceCategory::Ebook => self.ebook_thumbnail(path, target).await,
            SourceCategory::Video => self.frame_grab(path, target, true).await,
            SourceCategory::HeifStill => self.frame_grab(path, target, false).await,
            SourceCategory::Unsupported => None,
        }
    }

    async fn raster_thumbnail(&self, path: &Path, target: u32) -> Option<Vec<u8>> {
        let data = tokio::fs::read(path).await.ok()?;
        let quality = self.quality;
        tokio::task::spawn_blocking(move || raster_from_bytes(&data, target, quality))
            .await
            .ok()
            .flatten()
    }

    async fn vector_thumbnail(&self, path: &Path, target: u32) -> Option<Vec<u8>> {
        let data = tokio::fs::read(path).await.ok()?;
        let quality = self.quality;
        tokio::task::spawn_blocking(move || rasterize_svg(&data, target, quality))
            .await
            .ok()
            .flatten()
    }

    async fn ebook_thumbnail(&self, path: &Path, target: u32) -> Option<Vec<u8>> {
        let data = tokio::fs::read(path).await.ok()?;
        let quality = self.quality;
        tokio::task::spawn_blocking(move || {
            let cover = ebook_cover::extract_cover(&data)?;
            raster_from_bytes(&cover, target, quality)
        })
        .await
        .ok()
        .flatten()
    }

    /// Grab one frame via the external tool, scaled preserving aspect ratio.
    /// For videos the frame is taken near the 1-second mark; stills are read
    /// from the start.
    async fn frame_grab(&self, path: &Path, target: u32, seek: bool) -> Option<Vec<u8>> {
        match self.run_frame_grab(path, target, seek).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(file = %path.display(), "frame grab failed: {err}");
                None
            }
        }
    }

    async fn run_frame_grab(
        &self,
        path: &Path,
        target: u32,
        seek: bool,
    ) -> Result<Vec<u8>, ToolError> {
        let scale = format!("scale={target}:{target}:force_original_aspect_ratio=decrease");
        let mut cmd = Command::new(&self.ffmpeg_command);
        cmd.arg("-i").arg(path);
        if seek {
            cmd.args(["-ss", "00:00:01"]);
        }
        cmd.args([
            "-vframes", "1", "-vf", &scale, "-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "5",
            "-",
        ]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(FRAME_GRAB_TIMEOUT, cmd.output())
            .await
            .map_err(|_| ToolError::Timeout {
                tool: self.ffmpeg_command.clone(),
                seconds: FRAME_GRAB_TIMEOUT.as_secs(),
            })?
            .map_err(|err| ToolError::from_spawn(&self.ffmpeg_command, err))?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: self.ffmpeg_command.clone(),
                message: format!("exit status {}", output.status),
            });
        }
        if output.stdout.is_empty() {
            return Err(ToolError::Failed {
                tool: self.ffmpeg_command.clone(),
                message: "no frame data".to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Decode, flatten, resize and JPEG-encode raster bytes.
fn raster_from_bytes(data: &[u8], target: u32, quality: u8) -> Option<Vec<u8>> {
    let img = match image::load_from_memory(data) {
        Ok(img) => img,
        Err(err) => {
            warn!("image decode failed: {err}");
            return None;
        }
    };
    let resized = img.resize(target, target, FilterType::Lanczos3);
    encode_jpeg(&flatten_onto_white(&resized), quality)
}

/// Composite any alpha channel onto a white background.
fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u32::from(pixel[3]);
        let blend =
            |channel: u8| ((u32::from(channel) * alpha + 255 * (255 - alpha)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    out
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    match encoder.encode_image(rgb) {
        Ok(()) => Some(buf),
        Err(err) => {
            warn!("jpeg encode failed: {err}");
            None
        }
    }
}

/// Rasterize an SVG so its longer edge equals the target size, over white.
fn rasterize_svg(data: &[u8], target: u32, quality: u8) -> Option<Vec<u8>> {
    let tree = match usvg::Tree::from_data(data, &usvg::Options::default()) {
        Ok(tree) => tree,
        Err(err) => {
            warn!("svg parse failed: {err}");
            return None;
        }
    };
    let size = tree.size();
    let longer = size.width().max(size.height());
    if longer <= 0.0 {
        return None;
    }
    let scale = target as f32 / longer;
    let width = ((size.width() * scale).round() as u32).max(1);
    let height = ((size.height() * scale).round() as u32).max(1);

    let mut pixmap = tiny_skia::Pixmap::new(width, height)?;
    pixmap.fill(tiny_skia::Color::WHITE);
    resvg::render(
        &tree,
        tiny_skia::Transform::from_scale(scale, scale),
        &mut pixmap.as_mut(),
    );

    // The opaque white fill underneath makes every pixel fully opaque, so the
    // premultiplied channels are the straight values.
    let mut rgb = RgbImage::new(width, height);
    for (i, pixel) in pixmap.pixels().iter().enumerate() {
        let x = (i as u32) % width;
        let y = (i as u32) / width;
        rgb.put_pixel(x, y, Rgb([pixel.red(), pixel.green(), pixel.blue()]));
    }
    encode_jpeg(&rgb, quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> ThumbnailService {
        let config = ThumbnailsConfig {
            cache_dir: dir.path().join("cache"),
            sizes: HashMap::from([("thumb".to_string(), 16), ("large".to_string(), 64)]),
            ..ThumbnailsConfig::default()
        };
        ThumbnailService::new(&config, &ToolsConfig::default()).unwrap()
    }

    fn write_png(dir: &TempDir, name: &str, img: image::RgbaImage) -> PathBuf {
        let path = dir.path().join(name);
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        std::fs::write(&path, buf).unwrap();
        path
    }

    #[tokio::test]
    async fn raster_thumbnail_bounds_the_longer_edge() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let source = write_png(
            &dir,
            "wide.png",
            image::RgbaImage::from_pixel(64, 32, image::Rgba([200, 10, 10, 255])),
        );

        let jpeg = service
            .get_thumbnail(&source, "thumb")
            .await
            .unwrap()
            .expect("thumbnail generated");
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[tokio::test]
    async fn transparency_is_flattened_onto_white() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let source = write_png(
            &dir,
            "clear.png",
            image::RgbaImage::from_pixel(8, 8, image::Rgba([0, 0, 0, 0])),
        );

        let jpeg = service
            .get_thumbnail(&source, "thumb")
            .await
            .unwrap()
            .expect("thumbnail generated");
        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        let pixel = decoded.get_pixel(0, 0);
        assert!(
            pixel[0] > 250 && pixel[1] > 250 && pixel[2] > 250,
            "expected white, got {pixel:?}"
        );
    }

    #[tokio::test]
    async fn unsupported_extension_yields_none_without_caching() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let source = dir.path().join("notes.txt");
        std::fs::write(&source, "plain text").unwrap();

        assert!(service.get_thumbnail(&source, "thumb").await.unwrap().is_none());
        let cached = std::fs::read_dir(service.cache().cache_dir())
            .unwrap()
            .count();
        assert_eq!(cached, 0);
    }

    #[tokio::test]
    async fn repeated_requests_hit_the_cache() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let source = write_png(
            &dir,
            "photo.png",
            image::RgbaImage::from_pixel(32, 32, image::Rgba([5, 120, 80, 255])),
        );

        let first = service.get_thumbnail(&source, "thumb").await.unwrap().unwrap();
        let second = service.get_thumbnail(&source, "thumb").await.unwrap().unwrap();
        assert_eq!(first, second);

        let entries = std::fs::read_dir(service.cache().cache_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "jpg"))
            .count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn svg_rasterizes_at_target_size() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let source = dir.path().join("shape.svg");
        std::fs::write(
            &source,
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="20">
                <rect width="10" height="20" fill="#336699"/>
            </svg>"##,
        )
        .unwrap();

        let jpeg = service
            .get_thumbnail(&source, "large")
            .await
            .unwrap()
            .expect("svg rasterized");
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 64));
    }

    #[tokio::test]
    async fn epub_cover_goes_through_the_raster_pipeline() {
        use std::io::Write;

        let dir = TempDir::new().unwrap();
        let service = service(&dir);

        let mut cover_png = Vec::new();
        DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            32,
            32,
            image::Rgba([90, 20, 20, 255]),
        ))
        .write_to(&mut Cursor::new(&mut cover_png), image::ImageFormat::Png)
        .unwrap();

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("cover.png", options).unwrap();
        writer.write_all(&cover_png).unwrap();
        let epub = writer.finish().unwrap().into_inner();

        let source = dir.path().join("book.epub");
        std::fs::write(&source, epub).unwrap();

        let jpeg = service
            .get_thumbnail(&source, "thumb")
            .await
            .unwrap()
            .expect("cover thumbnail generated");
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[tokio::test]
    async fn vanished_source_is_source_unavailable() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let gone = dir.path().join("gone.png");

        let result = service.get_thumbnail(&gone, "thumb").await;
        assert!(matches!(result, Err(CacheError::SourceUnavailable { .. })));
    }

    #[test]
    fn categorize_covers_the_dispatch_table() {
        assert_eq!(
            categorize(Path::new("a/photo.JPG"), false),
            SourceCategory::Raster
        );
        assert_eq!(categorize(Path::new("anim.gif"), false), SourceCategory::Animated);
        assert_eq!(categorize(Path::new("icon.svg"), false), SourceCategory::Vector);
        assert_eq!(categorize(Path::new("book.epub"), false), SourceCategory::Ebook);
        assert_eq!(categorize(Path::new("clip.mkv"), false), SourceCategory::Video);
        assert_eq!(
            categorize(Path::new("shot.heic"), false),
            SourceCategory::Unsupported
        );
        assert_eq!(
            categorize(Path::new("shot.heic"), true),
            SourceCategory::HeifStill
        );
        assert_eq!(
            categorize(Path::new("archive.tar"), false),
            SourceCategory::Unsupported
        );
    }
}
