//! Root set resolution: a primary root plus named mount points.

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// An additional permitted root besides the primary one.
///
/// Mounts are read-only configuration: they are canonicalized once when the
/// [`RootSet`] is built and never mutated at runtime. User-facing paths under
/// a mount stay absolute (mounts are identified by their absolute path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub icon: Option<String>,
}

/// The set of filesystem roots that user-supplied paths may resolve into.
///
/// A candidate path is either relative to the primary root (a leading `/` is
/// stripped) or lexically prefixed by one of the configured mount paths. The
/// resolved result is canonicalized and must keep the chosen root as a strict
/// prefix; anything else is a [`SandboxError::PathTraversal`].
#[derive(Debug, Clone)]
pub struct RootSet {
    primary: PathBuf,
    mounts: Vec<Mount>,
}

impl RootSet {
    /// Build a root set, canonicalizing the primary root and every mount.
    ///
    /// # Errors
    /// Returns an error if any root does not exist or cannot be canonicalized.
    pub fn new(primary: impl AsRef<Path>, mounts: Vec<Mount>) -> Result<Self> {
        let primary = canonicalize_root(primary.as_ref())?;
        let mounts = mounts
            .into_iter()
            .map(|mut mount| {
                mount.path = canonicalize_root(&mount.path)?;
                Ok(mount)
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(primary = %primary.display(), mounts = mounts.len(), "root set initialized");
        Ok(Self { primary, mounts })
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// Resolve a user-supplied path to an absolute path inside one of the
    /// configured roots.
    ///
    /// The target itself does not have to exist, but its parent directory
    /// must, so symlinks on the existing portion are always resolved before
    /// the prefix check.
    ///
    /// # Errors
    /// [`SandboxError::PathTraversal`] if the path escapes or cannot be
    /// pinned inside its root.
    pub fn resolve(&self, candidate: &str) -> Result<PathBuf> {
        self.resolve_impl(candidate, false)
    }

    /// Like [`RootSet::resolve`], but tolerates a missing parent chain.
    ///
    /// Used for restore-style destinations whose ancestor directories are
    /// created after resolution. The existing portion of the path is still
    /// canonicalized and the prefix check still applies.
    pub fn resolve_allowing_missing(&self, candidate: &str) -> Result<PathBuf> {
        self.resolve_impl(candidate, true)
    }

    fn resolve_impl(&self, candidate: &str, allow_missing: bool) -> Result<PathBuf> {
        validate_candidate(candidate)?;

        let candidate_path = Path::new(candidate);
        for mount in &self.mounts {
            if let Ok(remainder) = candidate_path.strip_prefix(&mount.path) {
                return resolve_within(&mount.path, remainder, allow_missing);
            }
        }

        let relative = candidate.strip_prefix('/').unwrap_or(candidate);
        resolve_within(&self.primary, Path::new(relative), allow_missing)
    }

    /// Map an absolute path back to its user-facing form.
    ///
    /// Paths under a mount are returned as absolute strings, paths under the
    /// primary root as `/`-prefixed relative strings, and the primary root
    /// itself as `"/"`. Anything outside every root falls back to `"/"`.
    pub fn relativize(&self, absolute: &Path) -> String {
        for mount in &self.mounts {
            if absolute.starts_with(&mount.path) {
                return absolute.display().to_string();
            }
        }
        match absolute.strip_prefix(&self.primary) {
            Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
            Ok(rel) => format!("/{}", rel.display()),
            Err(_) => "/".to_string(),
        }
    }
}

fn canonicalize_root(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|source| SandboxError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn validate_candidate(candidate: &str) -> Result<()> {
    if candidate.contains('\0') {
        return Err(SandboxError::PathValidation {
            path: PathBuf::from(candidate),
            reason: "path contains null bytes".to_string(),
        });
    }
    Ok(())
}

/// Lexically normalize `relative`, join it under `root`, canonicalize the
/// existing portion and verify the result still has `root` as a prefix.
fn resolve_within(root: &Path, relative: &Path, allow_missing: bool) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping past the root is an escape, not a no-op.
                if !clean.pop() {
                    return Err(SandboxError::PathTraversal {
                        path: relative.to_path_buf(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::PathTraversal {
                    path: relative.to_path_buf(),
                });
            }
        }
    }

    let joined = root.join(&clean);
    let canonical = canonicalize_partial(&joined, allow_missing).ok_or_else(|| {
        SandboxError::PathTraversal {
            path: joined.clone(),
        }
    })?;

    if !canonical.starts_with(root) {
        return Err(SandboxError::PathTraversal { path: joined });
    }
    Ok(canonical)
}

/// Canonicalize `path`, handling targets that do not exist yet.
///
/// When the target is missing, its parent is canonicalized and the file name
/// re-appended. With `allow_missing`, the walk continues up to the longest
/// existing ancestor instead, re-appending every missing component.
fn canonicalize_partial(path: &Path, allow_missing: bool) -> Option<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Some(canonical);
    }

    if !allow_missing {
        let parent = path.parent()?;
        let name = path.file_name()?;
        let canonical_parent = parent.canonicalize().ok()?;
        return Some(canonical_parent.join(name));
    }

    let mut missing: Vec<OsString> = Vec::new();
    let mut cursor = path.to_path_buf();
    loop {
        match cursor.canonicalize() {
            Ok(canonical) => {
                let mut result = canonical;
                for part in missing.iter().rev() {
                    result.push(part);
                }
                return Some(result);
            }
            Err(_) => match (cursor.parent(), cursor.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name.to_os_string());
                    cursor = parent.to_path_buf();
                }
                _ => return None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root_set(dir: &TempDir) -> RootSet {
        RootSet::new(dir.path(), Vec::new()).unwrap()
    }

    #[test]
    fn resolves_simple_and_normalized_paths_identically() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();
        std::fs::write(dir.path().join("file.txt"), "data").unwrap();

        let roots = root_set(&dir);
        let direct = roots.resolve("file.txt").unwrap();
        let indirect = roots.resolve("subdir/../file.txt").unwrap();
        assert_eq!(direct, indirect);

        // Leading slash means primary-root-relative.
        assert_eq!(roots.resolve("/file.txt").unwrap(), direct);
    }

    #[test]
    fn rejects_escape_attempts() {
        let dir = TempDir::new().unwrap();
        let roots = root_set(&dir);

        assert!(matches!(
            roots.resolve("../../etc/passwd"),
            Err(SandboxError::PathTraversal { .. })
        ));
        // Not a mount prefix, and no `etc/` exists under the root.
        assert!(matches!(
            roots.resolve("/etc/passwd"),
            Err(SandboxError::PathTraversal { .. })
        ));
    }

    #[test]
    fn rejects_null_bytes() {
        let dir = TempDir::new().unwrap();
        let roots = root_set(&dir);
        assert!(matches!(
            roots.resolve("file\0.txt"),
            Err(SandboxError::PathValidation { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escapes() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("leak")).unwrap();

        let roots = root_set(&dir);
        assert!(matches!(
            roots.resolve("leak/secret.txt"),
            Err(SandboxError::PathTraversal { .. })
        ));
    }

    #[test]
    fn resolves_mount_prefixed_paths() {
        let dir = TempDir::new().unwrap();
        let mount_dir = TempDir::new().unwrap();
        std::fs::write(mount_dir.path().join("movie.mkv"), "x").unwrap();

        let mount_path = mount_dir.path().canonicalize().unwrap();
        let roots = RootSet::new(
            dir.path(),
            vec![Mount {
                name: "media".to_string(),
                path: mount_path.clone(),
                icon: None,
            }],
        )
        .unwrap();

        let candidate = format!("{}/movie.mkv", mount_path.display());
        let resolved = roots.resolve(&candidate).unwrap();
        assert_eq!(resolved, mount_path.join("movie.mkv"));

        // Escaping upward out of the mount is rejected.
        let escape = format!("{}/../movie.mkv", mount_path.display());
        assert!(matches!(
            roots.resolve(&escape),
            Err(SandboxError::PathTraversal { .. })
        ));
    }

    #[test]
    fn relativize_round_trips() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/note.txt"), "n").unwrap();

        let roots = root_set(&dir);
        let abs = roots.resolve("docs/note.txt").unwrap();
        assert_eq!(roots.relativize(&abs), "/docs/note.txt");
        assert_eq!(roots.relativize(roots.primary()), "/");

        // Outside every root falls back to "/".
        let outside = TempDir::new().unwrap();
        assert_eq!(roots.relativize(outside.path()), "/");
    }

    #[test]
    fn relativize_keeps_mount_paths_absolute() {
        let dir = TempDir::new().unwrap();
        let mount_dir = TempDir::new().unwrap();
        let mount_path = mount_dir.path().canonicalize().unwrap();

        let roots = RootSet::new(
            dir.path(),
            vec![Mount {
                name: "usb".to_string(),
                path: mount_path.clone(),
                icon: Some("usb-drive".to_string()),
            }],
        )
        .unwrap();

        let inside = mount_path.join("photo.jpg");
        assert_eq!(roots.relativize(&inside), inside.display().to_string());
    }

    #[test]
    fn allowing_missing_resolves_deep_absent_paths() {
        let dir = TempDir::new().unwrap();
        let roots = root_set(&dir);

        // Strict resolution needs the parent to exist.
        assert!(roots.resolve("a/b/c.txt").is_err());

        let resolved = roots.resolve_allowing_missing("a/b/c.txt").unwrap();
        assert_eq!(resolved, roots.primary().join("a/b/c.txt"));

        // Escapes are still rejected.
        assert!(matches!(
            roots.resolve_allowing_missing("a/../../b.txt"),
            Err(SandboxError::PathTraversal { .. })
        ));
    }
}
