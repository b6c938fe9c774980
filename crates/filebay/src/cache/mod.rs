//! Disk-backed cache for derived artifacts (thumbnails, transcoded videos).
//!
//! Entries are addressed by a content-sensitive key: any mutation of the
//! source file (size or mtime change) produces a new key, so stale artifacts
//! are never served and the cache needs no explicit invalidation besides
//! eviction pressure. Concurrent requests for the same key collapse to a
//! single producer; everyone else waits on its completion signal and then
//! re-checks the entry file.

use crate::errors::CacheError;
use filetime::FileTime;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

type InFlightMap = Mutex<HashMap<String, watch::Receiver<()>>>;

/// Generic disk cache mapping (source identity, variant) to a derived file.
///
/// One instance per artifact family: the entry extension, size bound and
/// eviction cadence are fixed per instance. Producers write into a temp path
/// inside the cache directory; the entry becomes visible only through an
/// atomic rename, so no caller ever observes a partial file.
pub struct ArtifactCache {
    cache_dir: PathBuf,
    extension: &'static str,
    max_bytes: u64,
    evict_check_every: u64,
    write_count: AtomicU64,
    in_flight: InFlightMap,
}

enum Role {
    Leader(watch::Sender<()>),
    Follower(watch::Receiver<()>),
}

impl ArtifactCache {
    /// Create a cache rooted at `cache_dir`, creating the directory if needed.
    ///
    /// `max_bytes == 0` disables the size bound.
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        extension: &'static str,
        max_bytes: u64,
        evict_check_every: u64,
    ) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            extension,
            max_bytes,
            evict_check_every: evict_check_every.max(1),
            write_count: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Return the cached artifact for `(source, variant)`, producing it on
    /// miss.
    ///
    /// The producer receives a temp path inside the cache directory and
    /// returns whether it wrote a usable artifact there. At most one producer
    /// runs per key at any time; concurrent callers for the same key all
    /// observe the single producer's outcome. A producer failure is a miss
    /// (`Ok(None)`), never an error.
    ///
    /// # Errors
    /// [`CacheError::SourceUnavailable`] if the source file cannot be
    /// stat'ed; callers should treat this as not-found.
    pub async fn get_or_create<F, Fut>(
        &self,
        source: &Path,
        variant: &str,
        producer: F,
    ) -> Result<Option<PathBuf>, CacheError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = bool>,
    {
        let key = self.cache_key(source, variant)?;
        let entry_path = self.entry_path(&key);

        if entry_exists(&entry_path) {
            touch(&entry_path);
            return Ok(Some(entry_path));
        }

        let role = {
            let mut in_flight = lock_unpoisoned(&self.in_flight);
            match in_flight.get(&key) {
                Some(receiver) => Role::Follower(receiver.clone()),
                None => {
                    let (sender, receiver) = watch::channel(());
                    in_flight.insert(key.clone(), receiver);
                    Role::Leader(sender)
                }
            }
        };

        match role {
            Role::Follower(mut receiver) => {
                // Wakes when the leader drops its sender, success or failure.
                let _ = receiver.changed().await;
                if entry_exists(&entry_path) {
                    touch(&entry_path);
                    Ok(Some(entry_path))
                } else {
                    Ok(None)
                }
            }
            Role::Leader(sender) => {
                // The guard removes the key and then drops the sender, waking
                // every waiter, also on early return, panic or cancellation.
                let _flight = FlightGuard {
                    map: &self.in_flight,
                    key,
                    _completion: sender,
                };
                self.produce(source, &entry_path, producer).await
            }
        }
    }

    async fn produce<F, Fut>(
        &self,
        source: &Path,
        entry_path: &Path,
        producer: F,
    ) -> Result<Option<PathBuf>, CacheError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = bool>,
    {
        // A previous leader may have completed between our miss check and
        // registration.
        if entry_exists(entry_path) {
            touch(entry_path);
            return Ok(Some(entry_path.to_path_buf()));
        }

        // No extension on the temp name: eviction only considers `.<ext>`
        // files, so in-progress work is invisible to it.
        let temp = tempfile::Builder::new()
            .prefix(".producing-")
            .tempfile_in(&self.cache_dir)?
            .into_temp_path();

        if !producer(temp.to_path_buf()).await {
            debug!(source = %source.display(), "producer reported failure");
            return Ok(None);
        }

        let written = std::fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            warn!(source = %source.display(), "producer left an empty artifact, discarding");
            return Ok(None);
        }

        temp.persist(entry_path)
            .map_err(|persist| CacheError::Io(persist.error))?;
        debug!(
            source = %source.display(),
            entry = %entry_path.display(),
            size = written,
            "cached artifact"
        );

        let writes = self.write_count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_bytes > 0 && writes % self.evict_check_every == 0 {
            self.evict_if_needed().await;
        }

        Ok(Some(entry_path.to_path_buf()))
    }

    /// Remove every cache entry. Returns the number of files removed.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let cache_dir = self.cache_dir.clone();
        let extension = self.extension;
        let removed = tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
            let mut removed = 0;
            for entry in std::fs::read_dir(&cache_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) == Some(extension)
                    && std::fs::remove_file(&path).is_ok()
                {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
        .map_err(|join| CacheError::Io(std::io::Error::other(join)))??;
        info!(removed, cache_dir = %self.cache_dir.display(), "cache cleared");
        Ok(removed)
    }

    /// Delete oldest-accessed entries until the cache fits its bound.
    async fn evict_if_needed(&self) {
        let cache_dir = self.cache_dir.clone();
        let extension = self.extension;
        let max_bytes = self.max_bytes;
        let outcome =
            tokio::task::spawn_blocking(move || evict_sync(&cache_dir, extension, max_bytes))
                .await;
        match outcome {
            Ok(Ok((removed, total))) if removed > 0 => {
                info!(
                    removed,
                    total_bytes = total,
                    cache_dir = %self.cache_dir.display(),
                    "cache eviction complete"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!("cache eviction scan failed: {err}"),
            Err(join) => warn!("cache eviction task failed: {join}"),
        }
    }

    /// Derive the cache key for `(source, variant)` from the source's
    /// absolute path, mtime and size. Deterministic across processes.
    fn cache_key(&self, source: &Path, variant: &str) -> Result<String, CacheError> {
        let meta = std::fs::metadata(source).map_err(|_| CacheError::SourceUnavailable {
            path: source.to_path_buf(),
        })?;
        let mtime = FileTime::from_last_modification_time(&meta);
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}:{}.{}:{}:{}",
            source.display(),
            mtime.unix_seconds(),
            mtime.nanoseconds(),
            meta.len(),
            variant
        ));
        Ok(hex::encode(hasher.finalize()))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.{}", self.extension))
    }
}

/// Removes the in-flight key, then (by field drop order) drops the completion
/// sender so every waiter wakes and re-checks the entry file.
struct FlightGuard<'a> {
    map: &'a InFlightMap,
    key: String,
    _completion: watch::Sender<()>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        lock_unpoisoned(self.map).remove(&self.key);
    }
}

fn lock_unpoisoned(map: &InFlightMap) -> MutexGuard<'_, HashMap<String, watch::Receiver<()>>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn entry_exists(path: &Path) -> bool {
    path.is_file()
}

fn touch(path: &Path) {
    if let Err(err) = filetime::set_file_atime(path, FileTime::now()) {
        debug!("could not bump atime for {}: {err}", path.display());
    }
}

fn evict_sync(cache_dir: &Path, extension: &str, max_bytes: u64) -> std::io::Result<(usize, u64)> {
    let mut entries = Vec::new();
    let mut total: u64 = 0;
    for entry in std::fs::read_dir(cache_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        total += meta.len();
        entries.push((path, meta.len(), FileTime::from_last_access_time(&meta)));
    }
    if total <= max_bytes {
        return Ok((0, total));
    }

    entries.sort_by_key(|(_, _, atime)| *atime);
    let mut removed = 0;
    for (path, size, _) in entries {
        if total <= max_bytes {
            break;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                total -= size;
                removed += 1;
            }
            Err(err) => warn!("eviction could not remove {}: {err}", path.display()),
        }
    }
    Ok((removed, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_source(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn key_changes_with_size_and_mtime() {
        let dir = TempDir::new().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"), "jpg", 0, 10).unwrap();
        let source = write_source(&dir, "photo.png", b"aaaa");

        let original = cache.cache_key(&source, "thumb").unwrap();

        // Size change.
        std::fs::write(&source, b"aaaaaaaa").unwrap();
        let grown = cache.cache_key(&source, "thumb").unwrap();
        assert_ne!(original, grown);

        // Same size, different mtime.
        filetime::set_file_mtime(&source, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        let touched = cache.cache_key(&source, "thumb").unwrap();
        assert_ne!(grown, touched);

        // Variant is part of the key.
        let other_variant = cache.cache_key(&source, "large").unwrap();
        assert_ne!(touched, other_variant);
    }

    #[tokio::test]
    async fn missing_source_is_source_unavailable() {
        let dir = TempDir::new().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"), "jpg", 0, 10).unwrap();
        let gone = dir.path().join("never-existed.png");

        let result = cache
            .get_or_create(&gone, "thumb", |_| async { true })
            .await;
        assert!(matches!(result, Err(CacheError::SourceUnavailable { .. })));
    }

    #[tokio::test]
    async fn hit_skips_the_producer() {
        let dir = TempDir::new().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"), "jpg", 0, 10).unwrap();
        let source = write_source(&dir, "photo.png", b"pixels");

        let first = cache
            .get_or_create(&source, "thumb", |tmp| async move {
                std::fs::write(&tmp, b"artifact").unwrap();
                true
            })
            .await
            .unwrap()
            .expect("first call produces");

        let second = cache
            .get_or_create(&source, "thumb", |_| async {
                panic!("producer must not run on a hit");
            })
            .await
            .unwrap()
            .expect("second call hits");

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), b"artifact");
    }

    #[tokio::test]
    async fn failed_or_empty_producers_leave_no_entry() {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("cache");
        let cache = ArtifactCache::new(&cache_dir, "jpg", 0, 10).unwrap();
        let source = write_source(&dir, "photo.png", b"pixels");

        // Producer writes a partial artifact, then reports failure.
        let failed = cache
            .get_or_create(&source, "thumb", |tmp| async move {
                std::fs::write(&tmp, b"parti").unwrap();
                false
            })
            .await
            .unwrap();
        assert!(failed.is_none());

        // Producer claims success but wrote nothing.
        let empty = cache
            .get_or_create(&source, "thumb", |_| async { true })
            .await
            .unwrap();
        assert!(empty.is_none());

        // No partial file is ever visible at a final path.
        let visible: Vec<_> = std::fs::read_dir(&cache_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "jpg"))
            .collect();
        assert!(visible.is_empty());
    }

    #[tokio::test]
    async fn eviction_removes_oldest_accessed_first() {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("cache");
        // 3 KiB bound, eviction check on every 5th write.
        let cache = ArtifactCache::new(&cache_dir, "jpg", 3072, 5).unwrap();
        let source = write_source(&dir, "photo.png", b"pixels");

        let mut entries = Vec::new();
        for n in 0..4 {
            let path = cache
                .get_or_create(&source, &format!("v{n}"), |tmp| async move {
                    std::fs::write(&tmp, vec![0u8; 1024]).unwrap();
                    true
                })
                .await
                .unwrap()
                .unwrap();
            // Oldest access times on the earliest entries.
            filetime::set_file_atime(&path, FileTime::from_unix_time(1_000 + n, 0)).unwrap();
            entries.push(path);
        }

        // Fifth write crosses the bound and triggers the eviction check.
        let newest = cache
            .get_or_create(&source, "v4", |tmp| async move {
                std::fs::write(&tmp, vec![0u8; 1024]).unwrap();
                true
            })
            .await
            .unwrap()
            .unwrap();

        let total: u64 = std::fs::read_dir(&cache_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "jpg"))
            .map(|e| e.metadata().unwrap().len())
            .sum();
        assert!(total <= 3072, "cache size {total} exceeds bound");

        // The two oldest-accessed entries are the victims.
        assert!(!entries[0].exists());
        assert!(!entries[1].exists());
        assert!(entries[2].exists());
        assert!(entries[3].exists());
        assert!(newest.exists());
    }

    #[tokio::test]
    async fn clear_removes_all_entries() {
        let dir = TempDir::new().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"), "jpg", 0, 10).unwrap();
        let source = write_source(&dir, "photo.png", b"pixels");

        for n in 0..3 {
            cache
                .get_or_create(&source, &format!("v{n}"), |tmp| async move {
                    std::fs::write(&tmp, b"data").unwrap();
                    true
                })
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(cache.clear().await.unwrap(), 3);
        assert_eq!(cache.clear().await.unwrap(), 0);
    }
}
