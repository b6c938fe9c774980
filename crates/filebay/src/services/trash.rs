//! Trash (soft delete).
//!
//! Deleted items are physically moved into a trash directory under the
//! primary root; a JSON manifest inside it maps each generated trash
//! identifier to the item's original location. The manifest is the single
//! source of truth for original-path recovery: the physical trash filename
//! carries only a timestamp and basename, not the original nesting.
//!
//! Every operation serializes its whole read-modify-write of the manifest
//! behind one lock, and updates the filesystem before the manifest: a crash
//! mid-operation can at worst leave an orphaned manifest entry (omitted from
//! listings, pruned by the next mutating call), never a silently lost file.

use crate::errors::TrashError;
use crate::models::{EntryKind, TrashEntry, TrashInfo, TrashItemInfo};
use chrono::{DateTime, Utc};
use sandboxed_roots::RootSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const TRASH_DIR_NAME: &str = ".deleted_items";
const MANIFEST_NAME: &str = ".manifest.json";

/// Soft-delete service, one per process.
pub struct TrashService {
    roots: Arc<RootSet>,
    trash_dir: PathBuf,
    manifest_path: PathBuf,
    lock: Mutex<()>,
}

impl TrashService {
    pub fn new(roots: Arc<RootSet>) -> Self {
        let trash_dir = roots.primary().join(TRASH_DIR_NAME);
        let manifest_path = trash_dir.join(MANIFEST_NAME);
        Self {
            roots,
            trash_dir,
            manifest_path,
            lock: Mutex::new(()),
        }
    }

    pub fn trash_dir(&self) -> &Path {
        &self.trash_dir
    }

    /// Move each existing path into the trash. Missing sources are silently
    /// skipped; anything already inside the trash directory is ignored.
    /// Returns the number of items moved.
    ///
    /// # Errors
    /// Sandbox violations and filesystem/manifest write failures propagate.
    pub async fn move_to_trash(&self, paths: &[String]) -> Result<usize, TrashError> {
        let _guard = self.lock.lock().await;
        fs::create_dir_all(&self.trash_dir).await?;

        let mut manifest = self.read_manifest().await;
        let mut moved = 0;

        for path in paths {
            let resolved = self.roots.resolve(path)?;
            if !exists(&resolved).await {
                continue;
            }
            if resolved.starts_with(&self.trash_dir) {
                continue;
            }

            let basename = resolved
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "item".to_string());

            // Millisecond timestamp plus basename; on a physical collision
            // the timestamp is incremented rather than re-read, keeping ids
            // time-ordered.
            let mut timestamp = Utc::now().timestamp_millis();
            let (trash_name, trash_path) = loop {
                let name = format!("{timestamp}_{basename}");
                let candidate = self.trash_dir.join(&name);
                if !exists(&candidate).await {
                    break (name, candidate);
                }
                timestamp += 1;
            };

            move_path(&resolved, &trash_path).await?;
            debug!(
                from = %resolved.display(),
                to = %trash_path.display(),
                "moved to trash"
            );
            manifest.push(TrashEntry {
                id: trash_name.clone(),
                original_path: self.roots.relativize(&resolved),
                trash_name,
                deleted_at: Utc::now(),
            });
            moved += 1;
        }

        self.write_manifest(&manifest).await?;
        Ok(moved)
    }

    /// List every manifest entry whose physical item still exists.
    ///
    /// Entries without a backing file are omitted but not pruned here:
    /// listing stays read-only, and orphans are dropped by the next mutating
    /// operation.
    pub async fn list_trash(&self) -> Vec<TrashItemInfo> {
        let _guard = self.lock.lock().await;
        let manifest = self.read_manifest().await;

        let mut items = Vec::with_capacity(manifest.len());
        for entry in &manifest {
            let trash_path = self.trash_dir.join(&entry.trash_name);
            let Ok(meta) = fs::metadata(&trash_path).await else {
                debug!(id = %entry.trash_name, "manifest entry without backing file, omitting");
                continue;
            };
            let is_dir = meta.is_dir();
            let original_name = entry
                .trash_name
                .split_once('_')
                .map(|(_, rest)| rest.to_string())
                .unwrap_or_else(|| entry.trash_name.clone());
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| entry.deleted_at);

            items.push(TrashItemInfo {
                name: entry.trash_name.clone(),
                original_name,
                original_path: entry.original_path.clone(),
                path: self.roots.relativize(&trash_path),
                kind: if is_dir {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
                size: if is_dir { 0 } else { meta.len() },
                modified,
                deleted_at: entry.deleted_at,
                extension: if is_dir {
                    None
                } else {
                    trash_path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .map(|ext| ext.to_lowercase())
                },
            });
        }
        items
    }

    /// Restore items to their original locations, recreating missing parent
    /// directories and renaming with a `(n)` suffix on collision. An id whose
    /// physical item is already gone is treated as resolved: the stale entry
    /// is dropped and counts zero. Returns the number of items restored.
    pub async fn restore(&self, ids: &[String]) -> Result<usize, TrashError> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read_manifest().await;
        let mut restored = 0;

        for id in ids {
            let Some(position) = manifest.iter().position(|e| e.trash_name == *id) else {
                continue;
            };
            let trash_path = self.trash_dir.join(id);
            if !exists(&trash_path).await {
                warn!(id = %id, "pruning manifest entry without backing file");
                manifest.remove(position);
                continue;
            }

            let original = self
                .roots
                .resolve_allowing_missing(&manifest[position].original_path)?;
            if let Some(parent) = original.parent() {
                fs::create_dir_all(parent).await?;
            }
            let destination = collision_free(&original).await;

            move_path(&trash_path, &destination).await?;
            debug!(id = %id, to = %destination.display(), "restored from trash");
            manifest.remove(position);
            restored += 1;
        }

        self.write_manifest(&manifest).await?;
        Ok(restored)
    }

    /// Permanently remove items (recursively for directories) and drop their
    /// manifest entries. Unknown ids are no-ops. Returns the number of
    /// physical items removed.
    pub async fn delete_permanent(&self, ids: &[String]) -> Result<usize, TrashError> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read_manifest().await;
        let mut deleted = 0;

        for id in ids {
            if !valid_trash_id(id) {
                continue;
            }
            let trash_path = self.trash_dir.join(id);
            if exists(&trash_path).await {
                remove_all(&trash_path).await?;
                deleted += 1;
            }
            manifest.retain(|e| e.trash_name != *id);
        }

        self.write_manifest(&manifest).await?;
        Ok(deleted)
    }

    /// Remove every manifest entry's physical item and reset the manifest to
    /// an empty list. Returns the number of physical items removed.
    pub async fn empty_trash(&self) -> Result<usize, TrashError> {
        let _guard = self.lock.lock().await;
        let manifest = self.read_manifest().await;
        let mut deleted = 0;

        for entry in &manifest {
            let trash_path = self.trash_dir.join(&entry.trash_name);
            if exists(&trash_path).await {
                remove_all(&trash_path).await?;
                deleted += 1;
            }
        }

        self.write_manifest(&[]).await?;
        Ok(deleted)
    }

    /// Count of live entries and their recursive byte size.
    pub async fn get_info(&self) -> TrashInfo {
        let _guard = self.lock.lock().await;
        let manifest = self.read_manifest().await;
        let trash_dir = self.trash_dir.clone();

        let computed = tokio::task::spawn_blocking(move || {
            let mut count = 0;
            let mut size: u64 = 0;
            for entry in &manifest {
                let path = trash_dir.join(&entry.trash_name);
                let Ok(meta) = std::fs::metadata(&path) else {
                    continue;
                };
                count += 1;
                if meta.is_dir() {
                    for item in walkdir::WalkDir::new(&path).into_iter().flatten() {
                        if item.file_type().is_file()
                            && let Ok(item_meta) = item.metadata()
                        {
                            size += item_meta.len();
                        }
                    }
                } else {
                    size += meta.len();
                }
            }
            TrashInfo { count, size }
        })
        .await;

        match computed {
            Ok(info) => info,
            Err(err) => {
                warn!("trash sizing task failed: {err}");
                TrashInfo { count: 0, size: 0 }
            }
        }
    }

    /// Read the manifest, treating a missing or unreadable file as empty.
    async fn read_manifest(&self) -> Vec<TrashEntry> {
        let Ok(contents) = fs::read_to_string(&self.manifest_path).await else {
            return Vec::new();
        };
        match serde_json::from_str(&contents) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("trash manifest is unreadable, starting empty: {err}");
                Vec::new()
            }
        }
    }

    async fn write_manifest(&self, entries: &[TrashEntry]) -> Result<(), TrashError> {
        fs::create_dir_all(&self.trash_dir).await?;
        let contents = serde_json::to_string_pretty(entries)?;
        fs::write(&self.manifest_path, contents).await?;
        Ok(())
    }
}

/// Reject ids that could address anything outside the trash directory. Ids
/// are always single path components generated by `move_to_trash`.
fn valid_trash_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id != MANIFEST_NAME
        && !id.contains('/')
        && !id.contains('\\')
}

async fn exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Move a filesystem entry, falling back to copy+remove when rename fails
/// (sources under a mount can sit on a different filesystem than the trash).
async fn move_path(source: &Path, dest: &Path) -> std::io::Result<()> {
    if fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }
    let (source, dest) = (source.to_path_buf(), dest.to_path_buf());
    tokio::task::spawn_blocking(move || {
        copy_tree(&source, &dest)?;
        if source.is_dir() {
            std::fs::remove_dir_all(&source)
        } else {
            std::fs::remove_file(&source)
        }
    })
    .await
    .map_err(std::io::Error::other)?
}

fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(source, dest).map(|_| ())
    }
}

async fn remove_all(path: &Path) -> std::io::Result<()> {
    if fs::metadata(path).await?.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

/// First free destination: the path itself, else `name(1).ext`, `name(2).ext`…
async fn collision_free(path: &Path) -> PathBuf {
    if !exists(path).await {
        return path.to_path_buf();
    }
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1;
    loop {
        let candidate = parent.join(format!("{stem}({counter}){extension}"));
        if !exists(&candidate).await {
            return candidate;
        }
        counter += 1;
    }
}
