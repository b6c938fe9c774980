use anyhow::Result;
use sandboxed_roots::Mount;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

pub mod defaults;

use defaults::*;

/// Sandbox roots: one primary directory plus optional named mounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Primary root every relative path resolves against
    #[serde(default = "default_root_path")]
    pub root_path: PathBuf,
    /// Additional read-only roots, addressed by absolute path
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

/// Thumbnail generation and caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_thumbnail_cache_dir")]
    pub cache_dir: PathBuf,
    /// Named size variants mapped to the target length of the longer edge
    #[serde(default = "default_thumbnail_sizes")]
    pub sizes: HashMap<String, u32>,
    /// JPEG re-encode quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub quality: u8,
    /// Cache size bound in MB; 0 = unbounded
    #[serde(default = "default_thumbnail_cache_mb")]
    pub max_cache_size_mb: u64,
    /// Run eviction every Nth successful cache write
    #[serde(default = "default_eviction_check_every")]
    pub eviction_check_every: u64,
    /// Route HEIF/HEIC/AVIF stills through the external frame grabber
    #[serde(default)]
    pub heif: bool,
}

/// Video remux/transcode caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_transcode_cache_dir")]
    pub cache_dir: PathBuf,
    /// Cache size bound in MB; 0 = unbounded
    #[serde(default = "default_transcode_cache_mb")]
    pub max_cache_size_mb: u64,
    /// Simultaneous external encoder processes across all requests
    #[serde(default = "default_max_concurrent_transcodes")]
    pub max_concurrent: usize,
    /// Budget for a full re-encode; remux and probe budgets are fixed
    #[serde(default = "default_transcode_timeout_secs")]
    pub transcode_timeout_secs: u64,
    /// Run eviction every Nth successful cache write
    #[serde(default = "default_eviction_check_every")]
    pub eviction_check_every: u64,
}

/// External command-line tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,
    #[serde(default = "default_ffprobe_command")]
    pub ffprobe_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub thumbnails: ThumbnailsConfig,
    #[serde(default)]
    pub transcoding: TranscodingConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            mounts: Vec::new(),
        }
    }
}

impl Default for ThumbnailsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: default_thumbnail_cache_dir(),
            sizes: default_thumbnail_sizes(),
            quality: default_jpeg_quality(),
            max_cache_size_mb: default_thumbnail_cache_mb(),
            eviction_check_every: default_eviction_check_every(),
            heif: false,
        }
    }
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: default_transcode_cache_dir(),
            max_cache_size_mb: default_transcode_cache_mb(),
            max_concurrent: default_max_concurrent_transcodes(),
            transcode_timeout_secs: default_transcode_timeout_secs(),
            eviction_check_every: default_eviction_check_every(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_command: default_ffmpeg_command(),
            ffprobe_command: default_ffprobe_command(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            thumbnails: ThumbnailsConfig::default(),
            transcoding: TranscodingConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from_file(&config_file)
    }

    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
            Ok(default_config)
        }
    }
}
