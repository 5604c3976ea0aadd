//! Fingerprint store: a shadow tree kept fresh against served files.
//!
//! For every served file `<base>/<rel>/name.ext` the store maintains
//! `<base>/.slicesync/<rel>/name.ext.slicesync`. Fingerprints are written
//! to a `.tmp.slicesync` sibling and atomically renamed into place, so a
//! concurrent reader only ever observes published files. The store is the
//! sole writer under the shadow root; the rename is the only cross-task
//! synchronization it relies on.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::{Result, SliceSyncError};
use crate::fingerprint::{
    effective_slice, write_fingerprint, SHADOW_DIR, SLICESYNC_EXT, TMP_SLICESYNC_EXT,
};

/// Owns the `.slicesync/` shadow tree under a served directory.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    base: PathBuf,
    cancel: CancelToken,
}

impl FingerprintStore {
    /// Create a store for the served directory `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            cancel: CancelToken::new(),
        }
    }

    /// Attach a cancellation token observed between slices while hashing.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The served directory this store mirrors.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Root of the shadow tree.
    #[must_use]
    pub fn shadow_root(&self) -> PathBuf {
        self.base.join(SHADOW_DIR)
    }

    /// Published fingerprint path for a served file.
    #[must_use]
    pub fn fingerprint_path(&self, rel: &Path) -> PathBuf {
        shadow_sibling(&self.shadow_root(), rel, SLICESYNC_EXT)
    }

    /// Is the published fingerprint for `rel` at least as new as its source?
    #[must_use]
    pub fn is_fresh(&self, rel: &Path) -> bool {
        let source = match fs::metadata(self.base.join(rel)) {
            Ok(meta) => meta,
            Err(_) => return false,
        };
        let fingerprint = match fs::metadata(self.fingerprint_path(rel)) {
            Ok(meta) => meta,
            Err(_) => return false,
        };
        match (fingerprint.modified(), source.modified()) {
            (Ok(fp), Ok(src)) => fp >= src,
            _ => false,
        }
    }

    /// Open the published fingerprint for `rel`.
    pub fn read(&self, rel: &Path) -> Result<File> {
        Ok(File::open(self.fingerprint_path(rel))?)
    }

    /// Fingerprint one served file and publish the result atomically.
    ///
    /// The dump streams into `<...>.tmp.slicesync`; only a complete dump is
    /// renamed to `<...>.slicesync`. A failed dump is removed instead of
    /// published.
    pub fn hash_file(&self, rel: &Path, slice: u64) -> Result<()> {
        let slice = effective_slice(slice);
        let source_path = self.base.join(rel);
        let source = File::open(&source_path)?;
        let length = source.metadata()?.len();
        let basename = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let final_path = self.fingerprint_path(rel);
        let tmp_path = shadow_sibling(&self.shadow_root(), rel, TMP_SLICESYNC_EXT);
        if let Some(parent) = tmp_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let out = BufWriter::new(File::create(&tmp_path)?);
        let written = write_fingerprint(source, length, &basename, slice, out, &self.cancel);
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        fs::rename(&tmp_path, &final_path)?;
        info!(file = %rel.display(), length, slice, "published fingerprint");
        Ok(())
    }

    /// Refresh the whole tree: drop fingerprints whose source is gone, then
    /// fingerprint every stale file larger than one slice.
    ///
    /// Per-file failures are logged and skipped so one unreadable file does
    /// not starve the rest; the first failure is reported once the scan
    /// completes. Independent files are hashed in parallel.
    pub fn hash_dir(&self, slice: u64, recursive: bool) -> Result<()> {
        let slice = effective_slice(slice);
        if !fs::metadata(&self.base)?.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("{} is not a directory", self.base.display()),
            )
            .into());
        }

        self.remove_orphans(recursive)?;

        let mut first_error = None;
        let mut candidates = Vec::new();
        let max_depth = if recursive { usize::MAX } else { 1 };
        let walker = WalkDir::new(&self.base)
            .min_depth(1)
            .max_depth(max_depth)
            .into_iter()
            .filter_entry(|e| e.file_name() != std::ffi::OsStr::new(SHADOW_DIR));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "directory scan error");
                    first_error.get_or_insert_with(|| {
                        SliceSyncError::Io(std::io::Error::other(err.to_string()))
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.base)
                .expect("walked entries live under the base")
                .to_path_buf();
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size <= slice {
                continue;
            }
            if self.is_fresh(&rel) {
                debug!(file = %rel.display(), "fingerprint is fresh");
                continue;
            }
            candidates.push(rel);
        }

        let failures: Vec<SliceSyncError> = candidates
            .par_iter()
            .filter_map(|rel| match self.hash_file(rel, slice) {
                Ok(()) => None,
                Err(err) => {
                    warn!(file = %rel.display(), error = %err, "fingerprinting failed");
                    Some(err)
                }
            })
            .collect();

        match first_error.or_else(|| failures.into_iter().next()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop shadow entries whose source no longer exists, plus any stale
    /// `.tmp.slicesync` leftovers from an interrupted run.
    fn remove_orphans(&self, recursive: bool) -> Result<()> {
        let shadow = self.shadow_root();
        if !shadow.is_dir() {
            return Ok(());
        }

        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut emptied_dirs = Vec::new();
        for entry in WalkDir::new(&shadow)
            .min_depth(1)
            .max_depth(max_depth)
            .contents_first(true)
        {
            let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
            let path = entry.path();
            if entry.file_type().is_dir() {
                emptied_dirs.push(path.to_path_buf());
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            let stale_tmp = name.ends_with(TMP_SLICESYNC_EXT);
            let orphan = !stale_tmp
                && name.ends_with(SLICESYNC_EXT)
                && !self.source_of(path).is_some_and(|src| src.exists());
            // Anything else inside the shadow tree is outside the mirrored
            // structure and gets cleaned up as well.
            let foreign = !stale_tmp && !name.ends_with(SLICESYNC_EXT);

            if stale_tmp || orphan || foreign {
                debug!(file = %path.display(), "removing shadow entry");
                fs::remove_file(path)?;
            }
        }

        // contents_first ordering means children were visited already, so a
        // now-empty directory can go too. Non-empty ones refuse the remove.
        for dir in emptied_dirs {
            let _ = fs::remove_dir(dir);
        }
        Ok(())
    }

    /// Served file a shadow entry mirrors, if the path maps back cleanly.
    fn source_of(&self, fingerprint: &Path) -> Option<PathBuf> {
        let rel = fingerprint.strip_prefix(self.shadow_root()).ok()?;
        let name = rel.file_name()?.to_str()?;
        let source_name = name.strip_suffix(SLICESYNC_EXT)?;
        Some(match rel.parent() {
            Some(parent) if parent != Path::new("") => {
                self.base.join(parent).join(source_name)
            }
            _ => self.base.join(source_name),
        })
    }
}

/// Mirror `rel` under the shadow root with `ext` appended to its file name.
fn shadow_sibling(shadow_root: &Path, rel: &Path, ext: &str) -> PathBuf {
    let mut path = shadow_root.join(rel);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.set_file_name(format!("{name}{ext}"));
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    use crate::fingerprint::FingerprintReader;

    const TESTFILE: &[u8] =
        b"AAAAAAAAA\nBBBBBBBBB\nCCCCCCCCC\nDDDDDDDDD\nEEEEEEEEE\nAAAAAAAAA\n";

    fn served_dir(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for rel in files {
            let path = dir.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, TESTFILE).unwrap();
        }
        dir
    }

    fn shadow_files(store: &FingerprintStore) -> Vec<String> {
        let mut found = Vec::new();
        if store.shadow_root().is_dir() {
            for entry in WalkDir::new(store.shadow_root()).min_depth(1) {
                let entry = entry.unwrap();
                if entry.file_type().is_file() {
                    found.push(
                        entry
                            .path()
                            .strip_prefix(store.shadow_root())
                            .unwrap()
                            .to_string_lossy()
                            .into_owned(),
                    );
                }
            }
        }
        found.sort();
        found
    }

    // ==========================================================================
    // HASH FILE
    // ==========================================================================

    #[test]
    fn hash_file_publishes_parseable_fingerprint() {
        let dir = served_dir(&["f1.txt"]);
        let store = FingerprintStore::new(dir.path());

        store.hash_file(Path::new("f1.txt"), 10).unwrap();

        let mut reader = FingerprintReader::new(BufReader::new(
            store.read(Path::new("f1.txt")).unwrap(),
        ));
        let length = reader.read_header("f1.txt", 10).unwrap();
        assert_eq!(length, 60);
        let mut count = 0;
        while reader.read_slice_hash().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 6);
        assert!(reader.read_total().unwrap().is_some());
    }

    #[test]
    fn hash_file_creates_nested_shadow_dirs() {
        let dir = served_dir(&["a/b/f.txt"]);
        let store = FingerprintStore::new(dir.path());

        store.hash_file(Path::new("a/b/f.txt"), 10).unwrap();
        assert!(store.fingerprint_path(Path::new("a/b/f.txt")).is_file());
    }

    #[test]
    fn hash_file_missing_source_fails() {
        let dir = served_dir(&[]);
        let store = FingerprintStore::new(dir.path());
        assert!(matches!(
            store.hash_file(Path::new("absent.txt"), 10),
            Err(SliceSyncError::Io(_))
        ));
    }

    #[test]
    fn no_tmp_file_survives_publication() {
        let dir = served_dir(&["f1.txt", "f2.txt"]);
        let store = FingerprintStore::new(dir.path());
        store.hash_dir(10, true).unwrap();

        for name in shadow_files(&store) {
            assert!(
                !name.ends_with(TMP_SLICESYNC_EXT),
                "unpublished dump leaked: {name}"
            );
        }
    }

    // ==========================================================================
    // FRESHNESS
    // ==========================================================================

    #[test]
    fn fingerprint_is_fresh_after_hashing() {
        let dir = served_dir(&["f1.txt"]);
        let store = FingerprintStore::new(dir.path());

        assert!(!store.is_fresh(Path::new("f1.txt")));
        store.hash_file(Path::new("f1.txt"), 10).unwrap();
        assert!(store.is_fresh(Path::new("f1.txt")));
    }

    #[test]
    fn source_newer_than_fingerprint_is_stale() {
        let dir = served_dir(&["f1.txt"]);
        let store = FingerprintStore::new(dir.path());
        store.hash_file(Path::new("f1.txt"), 10).unwrap();

        // Push the source mtime past the fingerprint's.
        let source = File::options()
            .write(true)
            .open(dir.path().join("f1.txt"))
            .unwrap();
        source
            .set_modified(SystemTime::now() + std::time::Duration::from_secs(10))
            .unwrap();

        assert!(!store.is_fresh(Path::new("f1.txt")));
    }

    // ==========================================================================
    // DIRECTORY SCANS
    // ==========================================================================

    #[test]
    fn hash_dir_covers_large_files_only() {
        let dir = served_dir(&["big.txt"]);
        fs::write(dir.path().join("small.txt"), b"tiny").unwrap();

        let store = FingerprintStore::new(dir.path());
        store.hash_dir(10, false).unwrap();

        // 60 > 10 gets a fingerprint, 4 <= 10 does not.
        assert_eq!(shadow_files(&store), vec!["big.txt.slicesync".to_string()]);
    }

    #[test]
    fn hash_dir_non_recursive_skips_subdirs() {
        let dir = served_dir(&["top.txt", "sub/inner.txt"]);
        let store = FingerprintStore::new(dir.path());
        store.hash_dir(10, false).unwrap();

        assert_eq!(shadow_files(&store), vec!["top.txt.slicesync".to_string()]);
    }

    #[test]
    fn hash_dir_recursive_mirrors_structure() {
        let dir = served_dir(&["top.txt", "sub/inner.txt"]);
        let store = FingerprintStore::new(dir.path());
        store.hash_dir(10, true).unwrap();

        assert_eq!(
            shadow_files(&store),
            vec![
                "sub/inner.txt.slicesync".to_string(),
                "top.txt.slicesync".to_string(),
            ]
        );
    }

    #[test]
    fn deleted_source_loses_its_fingerprint() {
        // The refresh scenario: hash three files, delete one, re-scan.
        let dir = served_dir(&["f1.txt", "f2.txt", "f3.txt"]);
        let store = FingerprintStore::new(dir.path());
        store.hash_dir(10, true).unwrap();
        assert_eq!(shadow_files(&store).len(), 3);

        fs::remove_file(dir.path().join("f3.txt")).unwrap();
        store.hash_dir(10, true).unwrap();

        assert_eq!(
            shadow_files(&store),
            vec!["f1.txt.slicesync".to_string(), "f2.txt.slicesync".to_string()]
        );
    }

    #[test]
    fn deleted_nested_sources_clean_their_dirs() {
        let dir = served_dir(&["dir/f1.txt", "dir/f2.txt"]);
        let store = FingerprintStore::new(dir.path());
        store.hash_dir(10, true).unwrap();

        fs::remove_file(dir.path().join("dir/f1.txt")).unwrap();
        fs::remove_file(dir.path().join("dir/f2.txt")).unwrap();
        fs::remove_dir(dir.path().join("dir")).unwrap();
        store.hash_dir(10, true).unwrap();

        assert!(shadow_files(&store).is_empty());
        assert!(!store.shadow_root().join("dir").exists());
    }

    #[test]
    fn stale_tmp_files_are_cleaned() {
        let dir = served_dir(&["f1.txt"]);
        let store = FingerprintStore::new(dir.path());
        fs::create_dir_all(store.shadow_root()).unwrap();
        fs::write(
            store.shadow_root().join("f1.txt.tmp.slicesync"),
            b"half-written",
        )
        .unwrap();

        store.hash_dir(10, true).unwrap();
        assert_eq!(shadow_files(&store), vec!["f1.txt.slicesync".to_string()]);
    }

    #[test]
    fn foreign_shadow_entries_are_cleaned() {
        let dir = served_dir(&["f1.txt"]);
        let store = FingerprintStore::new(dir.path());
        fs::create_dir_all(store.shadow_root()).unwrap();
        fs::write(store.shadow_root().join("notes.txt"), b"stray").unwrap();

        store.hash_dir(10, true).unwrap();
        assert_eq!(shadow_files(&store), vec!["f1.txt.slicesync".to_string()]);
    }

    #[test]
    fn rescan_skips_fresh_fingerprints() {
        let dir = served_dir(&["f1.txt"]);
        let store = FingerprintStore::new(dir.path());
        store.hash_dir(10, true).unwrap();

        let fingerprint = store.fingerprint_path(Path::new("f1.txt"));
        let first_mtime = fs::metadata(&fingerprint).unwrap().modified().unwrap();

        store.hash_dir(10, true).unwrap();
        let second_mtime = fs::metadata(&fingerprint).unwrap().modified().unwrap();
        assert_eq!(first_mtime, second_mtime);
    }

    #[test]
    fn hash_dir_on_file_fails() {
        let dir = served_dir(&["f1.txt"]);
        let store = FingerprintStore::new(dir.path().join("f1.txt"));
        assert!(store.hash_dir(10, true).is_err());
    }

    #[test]
    fn cancelled_store_publishes_nothing() {
        let dir = served_dir(&["f1.txt"]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let store = FingerprintStore::new(dir.path()).with_cancel(cancel);

        assert!(matches!(
            store.hash_file(Path::new("f1.txt"), 10),
            Err(SliceSyncError::Cancelled)
        ));
        assert!(shadow_files(&store).is_empty());
    }
}
