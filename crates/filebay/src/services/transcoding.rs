//! Video transcoding/remuxing.
//!
//! Decides whether a source video is browser-playable as-is, needs only a
//! container change, or needs a full re-encode, and drives the external codec
//! tool to produce a cached MP4. The re-encode is the one long-running job in
//! the system, so it runs under a global concurrency gate in addition to the
//! cache's per-key single-flight lock.

use crate::cache::ArtifactCache;
use crate::config::{ToolsConfig, TranscodingConfig};
use crate::errors::{CacheError, ToolError};
use crate::services::stream_prober::{ProbeSummary, StreamProber};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Codecs browsers play natively inside an MP4 container.
const BROWSER_VIDEO_CODECS: [&str; 6] = ["h264", "h265", "hevc", "vp8", "vp9", "av1"];
const BROWSER_AUDIO_CODECS: [&str; 5] = ["aac", "mp3", "opus", "vorbis", "flac"];

/// Containers that need remuxing or transcoding before browser playback.
const NEEDS_PROCESSING_CONTAINERS: [&str; 8] =
    ["mov", "mkv", "avi", "flv", "wmv", "ts", "mts", "m2ts"];

const REMUX_TIMEOUT: Duration = Duration::from_secs(120);
const TRANSCODE_VARIANT: &str = "mp4";

/// How a source gets turned into a browser-playable MP4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Copy streams into an MP4 container without re-encoding
    Remux,
    /// Re-encode video and audio to widely-supported codecs
    Transcode,
}

/// Classify a probe result: remux only when both streams are browser-native
/// (or audio is absent). A failed probe forces the re-encode path.
pub fn classify(probe: Option<&ProbeSummary>) -> ProcessingMode {
    let Some(probe) = probe else {
        return ProcessingMode::Transcode;
    };
    let video_ok = probe
        .video_codec
        .as_deref()
        .is_some_and(|codec| BROWSER_VIDEO_CODECS.contains(&codec));
    let audio_ok = match probe.audio_codec.as_deref() {
        None => true,
        Some(codec) => BROWSER_AUDIO_CODECS.contains(&codec),
    };
    if video_ok && audio_ok {
        ProcessingMode::Remux
    } else {
        ProcessingMode::Transcode
    }
}

/// Video processing service, one per process.
pub struct TranscodingService {
    cache: ArtifactCache,
    prober: StreamProber,
    ffmpeg_command: String,
    transcode_timeout: Duration,
    gate: Arc<Semaphore>,
}

impl TranscodingService {
    pub fn new(config: &TranscodingConfig, tools: &ToolsConfig) -> Result<Self, CacheError> {
        let cache = ArtifactCache::new(
            config.cache_dir.clone(),
            "mp4",
            config.max_cache_size_mb * 1024 * 1024,
            config.eviction_check_every,
        )?;
        Ok(Self {
            cache,
            prober: StreamProber::new(tools.ffprobe_command.clone()),
            ffmpeg_command: tools.ffmpeg_command.clone(),
            transcode_timeout: Duration::from_secs(config.transcode_timeout_secs),
            gate: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        })
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Whether this container needs processing before browser playback.
    pub fn needs_processing(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                NEEDS_PROCESSING_CONTAINERS.contains(&ext.to_lowercase().as_str())
            })
    }

    /// Return the cached browser-playable MP4 for `source`, producing it on
    /// miss. Probe, classification and the encoder run inside the cache's
    /// producer slot, so concurrent requests for the same file share one job.
    ///
    /// # Errors
    /// [`CacheError::SourceUnavailable`] if the source vanished; callers
    /// treat this as not-found.
    pub async fn get_or_create_mp4(&self, source: &Path) -> Result<Option<PathBuf>, CacheError> {
        self.cache
            .get_or_create(source, TRANSCODE_VARIANT, |tmp| async move {
                // The gate bounds simultaneous encoder processes across all
                // requests; callers queue here instead of spawning more.
                let Ok(_permit) = self.gate.acquire().await else {
                    return false;
                };

                let probe = self.prober.probe_file(source).await;
                let mode = classify(probe.as_ref());
                info!(
                    file = %source.display(),
                    ?mode,
                    video = probe.as_ref().and_then(|p| p.video_codec.as_deref()).unwrap_or("unknown"),
                    audio = probe.as_ref().and_then(|p| p.audio_codec.as_deref()).unwrap_or("unknown"),
                    "processing video"
                );

                let budget = match mode {
                    ProcessingMode::Remux => REMUX_TIMEOUT,
                    ProcessingMode::Transcode => self.transcode_timeout,
                };
                match self.run_ffmpeg(source, &tmp, mode, budget).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(file = %source.display(), "video processing failed: {err}");
                        false
                    }
                }
            })
            .await
    }

    async fn run_ffmpeg(
        &self,
        source: &Path,
        output: &Path,
        mode: ProcessingMode,
        budget: Duration,
    ) -> Result<(), ToolError> {
        let mut cmd = Command::new(&self.ffmpeg_command);
        cmd.arg("-y").arg("-i").arg(source);
        match mode {
            ProcessingMode::Remux => {
                cmd.args(["-c", "copy"]);
            }
            ProcessingMode::Transcode => {
                cmd.args([
                    "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-c:a", "aac", "-b:a",
                    "192k", "-pix_fmt", "yuv420p",
                ]);
            }
        }
        // The temp path carries no extension, so the container is explicit.
        cmd.args(["-movflags", "+faststart", "-f", "mp4"]).arg(output);
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|err| ToolError::from_spawn(&self.ffmpeg_command, err))?;

        match tokio::time::timeout(budget, child.wait_with_output()).await {
            // Dropping the in-flight future reaps the child via kill_on_drop.
            Err(_) => Err(ToolError::Timeout {
                tool: self.ffmpeg_command.clone(),
                seconds: budget.as_secs(),
            }),
            Ok(Err(err)) => Err(ToolError::Failed {
                tool: self.ffmpeg_command.clone(),
                message: err.to_string(),
            }),
            Ok(Ok(result)) if !result.status.success() => {
                let stderr = String::from_utf8_lossy(&result.stderr);
                Err(ToolError::Failed {
                    tool: self.ffmpeg_command.clone(),
                    message: format!("exit status {}: {}", result.status, tail(&stderr, 500)),
                })
            }
            Ok(Ok(_)) => Ok(()),
        }
    }
}

/// Last `limit` characters of tool output, enough to see the actual error.
fn tail(text: &str, limit: usize) -> &str {
    let count = text.chars().count();
    if count <= limit {
        return text.trim_end();
    }
    let skip = count - limit;
    let start = text
        .char_indices()
        .nth(skip)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    text[start..].trim_end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn probe(video: Option<&str>, audio: Option<&str>) -> ProbeSummary {
        ProbeSummary {
            video_codec: video.map(String::from),
            audio_codec: audio.map(String::from),
            duration: Some(60.0),
            container: ".mkv".to_string(),
        }
    }

    #[test]
    fn browser_native_codecs_remux() {
        let summary = probe(Some("h264"), Some("aac"));
        assert_eq!(classify(Some(&summary)), ProcessingMode::Remux);

        let summary = probe(Some("vp9"), Some("opus"));
        assert_eq!(classify(Some(&summary)), ProcessingMode::Remux);
    }

    #[test]
    fn missing_audio_still_remuxes() {
        let summary = probe(Some("h264"), None);
        assert_eq!(classify(Some(&summary)), ProcessingMode::Remux);
    }

    #[test]
    fn foreign_codecs_transcode() {
        let summary = probe(Some("mpeg4"), Some("pcm_s16le"));
        assert_eq!(classify(Some(&summary)), ProcessingMode::Transcode);

        // A native video codec with a foreign audio codec still re-encodes.
        let summary = probe(Some("h264"), Some("pcm_s16le"));
        assert_eq!(classify(Some(&summary)), ProcessingMode::Transcode);
    }

    #[test]
    fn failed_probe_transcodes() {
        assert_eq!(classify(None), ProcessingMode::Transcode);

        // A probe with no recognizable streams behaves like a failed probe.
        let summary = probe(None, None);
        assert_eq!(classify(Some(&summary)), ProcessingMode::Transcode);
    }

    #[test]
    fn container_gate_for_processing() {
        assert!(TranscodingService::needs_processing(Path::new("a/movie.MKV")));
        assert!(TranscodingService::needs_processing(Path::new("clip.avi")));
        assert!(!TranscodingService::needs_processing(Path::new("ok.mp4")));
        assert!(!TranscodingService::needs_processing(Path::new("ok.webm")));
        assert!(!TranscodingService::needs_processing(Path::new("noext")));
    }

    #[test]
    fn tail_keeps_the_end_of_long_output() {
        assert_eq!(tail("short", 500), "short");
        let long = "x".repeat(600) + "the actual error";
        assert!(tail(&long, 500).ends_with("the actual error"));
        assert_eq!(tail(&long, 500).chars().count(), 500);
    }

    #[tokio::test]
    async fn missing_tools_degrade_to_no_artifact() {
        let dir = TempDir::new().unwrap();
        let config = TranscodingConfig {
            cache_dir: dir.path().join("cache"),
            ..TranscodingConfig::default()
        };
        let tools = ToolsConfig {
            ffmpeg_command: "definitely-not-ffmpeg".to_string(),
            ffprobe_command: "definitely-not-ffprobe".to_string(),
        };
        let service = TranscodingService::new(&config, &tools).unwrap();

        let source = dir.path().join("movie.mkv");
        std::fs::write(&source, b"not really a video").unwrap();

        // Probe fails (no tool) -> transcode path -> encoder also missing ->
        // producer failure -> miss, not an error.
        let result = service.get_or_create_mp4(&source).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn vanished_source_is_source_unavailable() {
        let dir = TempDir::new().unwrap();
        let config = TranscodingConfig {
            cache_dir: dir.path().join("cache"),
            ..TranscodingConfig::default()
        };
        let service = TranscodingService::new(&config, &ToolsConfig::default()).unwrap();

        let result = service.get_or_create_mp4(&dir.path().join("gone.mkv")).await;
        assert!(matches!(result, Err(CacheError::SourceUnavailable { .. })));
    }
}
