//! Default values for configuration fields.

use std::collections::HashMap;
use std::path::PathBuf;

pub fn default_true() -> bool {
    true
}

pub fn default_root_path() -> PathBuf {
    PathBuf::from("./files")
}

pub fn default_thumbnail_cache_dir() -> PathBuf {
    PathBuf::from("./cache/thumbnails")
}

pub fn default_transcode_cache_dir() -> PathBuf {
    PathBuf::from("./cache/transcodes")
}

pub fn default_thumbnail_sizes() -> HashMap<String, u32> {
    HashMap::from([("thumb".to_string(), 256), ("large".to_string(), 1024)])
}

pub fn default_jpeg_quality() -> u8 {
    85
}

pub fn default_thumbnail_cache_mb() -> u64 {
    500
}

pub fn default_transcode_cache_mb() -> u64 {
    2000
}

pub fn default_max_concurrent_transcodes() -> usize {
    2
}

pub fn default_transcode_timeout_secs() -> u64 {
    3600
}

pub fn default_eviction_check_every() -> u64 {
    10
}

pub fn default_ffmpeg_command() -> String {
    "ffmpeg".to_string()
}

pub fn default_ffprobe_command() -> String {
    "ffprobe".to_string()
}
