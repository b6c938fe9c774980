//! Stream probing
//!
//! Inspects a media file with ffprobe and reduces the report to what the
//! transcoding classifier needs: the primary video/audio codec names and the
//! duration. Probe failure is not an error: callers fall back to the
//! fail-safe classification (full re-encode).

use crate::errors::ToolError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Codec summary for a probed media file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSummary {
    /// Codec name of the first video stream, lowercase
    pub video_codec: Option<String>,
    /// Codec name of the first audio stream, lowercase
    pub audio_codec: Option<String>,
    /// Container duration in seconds
    pub duration: Option<f64>,
    /// Source container suffix, e.g. ".mkv"
    pub container: String,
}

/// Service for probing local media files.
pub struct StreamProber {
    ffprobe_command: String,
}

impl StreamProber {
    pub fn new(ffprobe_command: impl Into<String>) -> Self {
        Self {
            ffprobe_command: ffprobe_command.into(),
        }
    }

    /// Probe a media file.
    ///
    /// Tool absence, timeout, non-zero exit and unparsable output all yield
    /// `None` rather than an error: an unprobeable file is still worth a
    /// re-encode attempt.
    pub async fn probe_file(&self, path: &Path) -> Option<ProbeSummary> {
        match self.run_ffprobe(path).await {
            Ok(summary) => {
                debug!(
                    file = %path.display(),
                    video = summary.video_codec.as_deref().unwrap_or("-"),
                    audio = summary.audio_codec.as_deref().unwrap_or("-"),
                    "probe complete"
                );
                Some(summary)
            }
            Err(err) => {
                warn!(file = %path.display(), "probe failed: {err}");
                None
            }
        }
    }

    async fn run_ffprobe(&self, path: &Path) -> Result<ProbeSummary, ToolError> {
        let mut cmd = Command::new(&self.ffprobe_command);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ]);
        cmd.arg(path);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| ToolError::Timeout {
                tool: self.ffprobe_command.clone(),
                seconds: PROBE_TIMEOUT.as_secs(),
            })?
            .map_err(|err| ToolError::from_spawn(&self.ffprobe_command, err))?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: self.ffprobe_command.clone(),
                message: format!("exit status {}", output.status),
            });
        }

        let data: serde_json::Value =
            serde_json::from_slice(&output.stdout).map_err(|err| ToolError::Failed {
                tool: self.ffprobe_command.clone(),
                message: format!("unparsable report: {err}"),
            })?;
        Ok(parse_probe_output(&data, container_suffix(path)))
    }
}

fn container_suffix(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

/// Reduce an ffprobe JSON report to the first video/audio codec and the
/// container duration.
pub(crate) fn parse_probe_output(data: &serde_json::Value, container: String) -> ProbeSummary {
    let mut video_codec = None;
    let mut audio_codec = None;

    if let Some(streams) = data.get("streams").and_then(|v| v.as_array()) {
        for stream in streams {
            let codec_type = stream
                .get("codec_type")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let codec_name = stream
                .get("codec_name")
                .and_then(|v| v.as_str())
                .map(|name| name.to_lowercase());
            match codec_type {
                "video" if video_codec.is_none() => video_codec = codec_name,
                "audio" if audio_codec.is_none() => audio_codec = codec_name,
                _ => {}
            }
        }
    }

    let duration = data
        .get("format")
        .and_then(|f| f.get("duration"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok());

    ProbeSummary {
        video_codec,
        audio_codec,
        duration,
        container,
    }
}
