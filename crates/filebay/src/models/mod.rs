//! Shared data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One record in the trash manifest.
///
/// The manifest is the single source of truth for original-path recovery:
/// the physical trash filename carries only a disambiguating timestamp and
/// basename, not the original nesting. Schema evolution must be additive
/// (new optional fields only); there is no format versioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashEntry {
    /// Opaque, time-ordered identifier; equals the physical trash name
    pub id: String,
    /// Root-relative form of the item's pre-deletion location
    pub original_path: String,
    /// Name of the physical item inside the trash directory
    pub trash_name: String,
    /// When the item was moved to trash
    pub deleted_at: DateTime<Utc>,
}

/// Whether a trashed item is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// Listing row for one live trash entry.
#[derive(Debug, Clone, Serialize)]
pub struct TrashItemInfo {
    /// Physical trash name (doubles as the entry id)
    pub name: String,
    /// Basename the item had before deletion
    pub original_name: String,
    /// Root-relative path the item was deleted from
    pub original_path: String,
    /// User-facing path of the item inside the trash directory
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Byte size; 0 for directories
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub deleted_at: DateTime<Utc>,
    pub extension: Option<String>,
}

/// Aggregate trash statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TrashInfo {
    /// Number of manifest entries whose physical item still exists
    pub count: usize,
    /// Recursive byte size across live entries
    pub size: u64,
}
