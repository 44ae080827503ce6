//! On-disk layout of local copies: final names, partial names, and eviction.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use fft_player_types::{AssetDescriptor, AssetId};

/// Suffix carried by copies that are still being written.
pub(crate) const PARTIAL_SUFFIX: &str = ".part";

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(1);

/// A completed local copy of an asset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalSource {
    pub asset_id: AssetId,
    pub path: PathBuf,
    pub byte_len: u64,
    /// Container hint taken from the asset locator (`flac`, `mp3`, ...).
    pub extension: Option<String>,
}

/// Extension of the asset locator, lowercased.
pub(crate) fn locator_extension(asset: &AssetDescriptor) -> Option<String> {
    Path::new(&asset.locator)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Deterministic cache path for an asset: sanitized id, id hash, locator extension.
pub(crate) fn copy_path(dir: &Path, asset: &AssetDescriptor) -> PathBuf {
    let id = asset.id.as_str();
    let mut stem: String = id
        .chars()
        .take(48)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    stem.push('-');
    stem.push_str(&hash_id(id));
    if let Some(ext) = locator_extension(asset) {
        stem.push('.');
        stem.push_str(&ext);
    }
    dir.join(stem)
}

/// Unique partial path next to `final_path`; two copies of the same asset never collide.
pub(crate) fn partial_path(final_path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!("-{nanos}-{seq}{PARTIAL_SUFFIX}"));
    final_path.with_file_name(name)
}

/// Remove partial copies left behind by an interrupted run.
pub(crate) fn cleanup_partials(dir: &Path) -> io::Result<usize> {
    let mut removed = 0usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if !file_name.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        if std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn hash_id(id: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in id.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

/// Completed copies already in `dir`, oldest modification time first.
pub(crate) fn existing_copies(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut copies = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        copies.push((modified, entry.path()));
    }
    copies.sort();
    Ok(copies.into_iter().map(|(_, path)| path).collect())
}

/// Delete evicted copies; a copy that is already gone is not an error.
pub(crate) fn remove_copies(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::debug!(path = ?path, error = %e, "evict local copy failed");
        }
    }
}

/// Completed copies on disk, least recently used first.
pub(crate) struct CopyIndex {
    retain: usize,
    entries: VecDeque<PathBuf>,
}

impl CopyIndex {
    pub(crate) fn new(retain: usize) -> Self {
        Self {
            retain: retain.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Record `path` as the most recently used copy and return the copies
    /// evicted to stay within `retain`. `path` itself is never evicted.
    pub(crate) fn insert(&mut self, path: PathBuf) -> Vec<PathBuf> {
        self.entries.retain(|entry| *entry != path);
        self.entries.push_back(path);
        let mut evicted = Vec::new();
        while self.entries.len() > self.retain {
            if let Some(old) = self.entries.pop_front() {
                evicted.push(old);
            }
        }
        evicted
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy(name: &str) -> PathBuf {
        PathBuf::from(format!("/cache/{name}"))
    }

    #[test]
    fn copy_path_is_stable_and_keeps_extension() {
        let asset = AssetDescriptor::new("a/b c", "Song", "/music/Song.FLAC");
        let first = copy_path(Path::new("/cache"), &asset);
        let second = copy_path(Path::new("/cache"), &asset);
        assert_eq!(first, second);
        let name = first.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("a_b_c-"));
        assert!(name.ends_with(".flac"));
    }

    #[test]
    fn similar_ids_do_not_collide() {
        let a = AssetDescriptor::new("a/b", "Song", "/x.mp3");
        let b = AssetDescriptor::new("a_b", "Song", "/x.mp3");
        assert_ne!(copy_path(Path::new("/c"), &a), copy_path(Path::new("/c"), &b));
    }

    #[test]
    fn partial_paths_are_unique() {
        let final_path = Path::new("/cache/song.flac");
        let a = partial_path(final_path);
        let b = partial_path(final_path);
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with(PARTIAL_SUFFIX));
        assert_eq!(a.parent(), final_path.parent());
    }

    #[test]
    fn cleanup_removes_only_partials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("done.flac"), b"x").unwrap();
        std::fs::write(dir.path().join("done.flac-1-1.part"), b"x").unwrap();
        assert_eq!(cleanup_partials(dir.path()).unwrap(), 1);
        assert!(dir.path().join("done.flac").exists());
    }

    #[test]
    fn index_evicts_least_recently_used_beyond_retain() {
        let mut index = CopyIndex::new(2);
        assert!(index.insert(copy("a")).is_empty());
        assert!(index.insert(copy("b")).is_empty());
        assert!(index.insert(copy("a")).is_empty());
        let evicted = index.insert(copy("c"));
        assert_eq!(evicted, vec![copy("b")]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn reinserting_same_copy_does_not_duplicate() {
        let mut index = CopyIndex::new(3);
        index.insert(copy("a"));
        index.insert(copy("a"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn existing_copies_skip_partials_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.flac"), b"x").unwrap();
        std::fs::write(dir.path().join("a.flac-1-1.part"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let copies = existing_copies(dir.path()).unwrap();
        assert_eq!(copies, vec![dir.path().join("a.flac")]);
    }
}
