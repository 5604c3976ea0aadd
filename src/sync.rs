//! Core orchestrator: glue fingerprints, diff and reconstruction together.
//!
//! [`SliceSync::sync`] reconstructs one remote file into a destination,
//! reusing as much of a local alike file as the diff allows. Both ends are
//! modeled by [`HashSource`]: something that can serve a fingerprint
//! stream and byte ranges of its files. The local implementation serves a
//! stored fingerprint when the store has a fresh one and otherwise
//! computes it on the fly into an OS pipe, so the diff can start consuming
//! while hashing is still under way.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::diff::{basename, naive_diff, shifted_diff, Plan, Segment};
use crate::error::Result;
use crate::fingerprint::{
    effective_slice, write_fingerprint, FingerprintReader, SHADOW_DIR, SLICESYNC_EXT,
};
use crate::range::{HttpRangeReader, LocalRangeReader, RangeReader, AUTOSIZE};
use crate::reconstruct::reconstruct;
use crate::store::FingerprintStore;

/// A file service that can hand out fingerprint streams and byte ranges.
///
/// The client core needs exactly this much from either side of the wire.
pub trait HashSource: RangeReader {
    /// Open the fingerprint stream for `name`, sliced at `slice`.
    fn fingerprint(&self, name: &str, slice: u64) -> Result<Box<dyn Read + Send>>;
}

/// Serves fingerprints and ranges from a local directory.
pub struct LocalHashSource {
    ranges: LocalRangeReader,
    store: FingerprintStore,
    cancel: CancelToken,
}

impl LocalHashSource {
    /// Create a source rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            ranges: LocalRangeReader::new(&base),
            store: FingerprintStore::new(&base),
            cancel: CancelToken::new(),
        }
    }

    /// Attach a cancellation token to on-the-fly fingerprint runs.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The underlying range reader.
    #[must_use]
    pub fn ranges(&self) -> &LocalRangeReader {
        &self.ranges
    }
}

impl RangeReader for LocalHashSource {
    fn open(&self, name: &str, offset: u64, length: u64) -> Result<(Box<dyn Read + Send>, u64)> {
        self.ranges.open(name, offset, length)
    }
}

impl HashSource for LocalHashSource {
    /// Serve the stored fingerprint when it is fresh; otherwise spawn a
    /// producer thread that streams a just-in-time fingerprint through an
    /// anonymous pipe. The pipe's kernel buffer bounds how far the
    /// producer runs ahead, and a consumer that drops its end fails the
    /// producer's next write, ending it cleanly.
    fn fingerprint(&self, name: &str, slice: u64) -> Result<Box<dyn Read + Send>> {
        let rel = Path::new(name);
        if self.store.is_fresh(rel) {
            debug!(file = name, "serving stored fingerprint");
            return Ok(Box::new(self.store.read(rel)?));
        }

        let path = self.ranges.resolve(name)?;
        let file = File::open(&path)?;
        let length = file.metadata()?.len();
        let slice = effective_slice(slice);
        let name = basename(name).to_string();
        debug!(file = %path.display(), length, "fingerprinting on the fly");

        let (reader, writer) = std::io::pipe()?;
        let cancel = self.cancel.clone();
        std::thread::Builder::new()
            .name("fingerprint".to_string())
            .spawn(move || {
                let out = BufWriter::new(writer);
                if let Err(err) = write_fingerprint(file, length, &name, slice, out, &cancel) {
                    debug!(error = %err, "on-the-fly fingerprint ended early");
                }
            })?;
        Ok(Box::new(reader))
    }
}

/// Serves fingerprints and ranges from a slicesync-enabled HTTP server.
pub struct RemoteHashSource {
    ranges: HttpRangeReader,
}

impl RemoteHashSource {
    /// Create a source for the given server base URL. A bare `host:port`
    /// is promoted to `http://host:port`.
    pub fn new(server: &str) -> Result<Self> {
        Ok(Self {
            ranges: HttpRangeReader::new(normalize_server(server))?,
        })
    }

    /// URL the fingerprint of `name` is published at.
    #[must_use]
    pub fn fingerprint_url(&self, name: &str) -> String {
        self.ranges
            .url_for(&format!("{SHADOW_DIR}/{name}{SLICESYNC_EXT}"))
    }
}

impl RangeReader for RemoteHashSource {
    fn open(&self, name: &str, offset: u64, length: u64) -> Result<(Box<dyn Read + Send>, u64)> {
        self.ranges.open(name, offset, length)
    }
}

impl HashSource for RemoteHashSource {
    fn fingerprint(&self, name: &str, _slice: u64) -> Result<Box<dyn Read + Send>> {
        let (stream, _) = self.ranges.get(&self.fingerprint_url(name))?;
        Ok(stream)
    }
}

/// Prefix a scheme onto scheme-less server strings.
fn normalize_server(server: &str) -> String {
    if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        format!("http://{server}")
    }
}

/// Which diff engine a sync run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffMode {
    /// Compare slice hashes at aligned offsets only.
    #[default]
    Aligned,
    /// Scan the alike for remote slices at any byte offset.
    Shifted,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Slice size for fingerprints and diffing; zero means the default.
    pub slice: u64,
    /// Diff engine to use.
    pub mode: DiffMode,
    /// Cancellation token observed at slice boundaries.
    pub cancel: CancelToken,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            slice: crate::fingerprint::DEFAULT_SLICE,
            mode: DiffMode::Aligned,
            cancel: CancelToken::new(),
        }
    }
}

/// Builder for [`SliceSync`] engines.
///
/// # Example
///
/// ```rust
/// use slicesync::{DiffMode, SyncBuilder};
///
/// let sync = SyncBuilder::new()
///     .slice(64 * 1024)
///     .mode(DiffMode::Shifted)
///     .build();
/// assert_eq!(sync.slice(), 64 * 1024);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SyncBuilder {
    config: SyncConfig,
}

impl SyncBuilder {
    /// Start from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the slice size.
    #[must_use]
    pub fn slice(mut self, slice: u64) -> Self {
        self.config.slice = slice;
        self
    }

    /// Pick the diff engine.
    #[must_use]
    pub fn mode(mut self, mode: DiffMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Attach a cancellation token.
    #[must_use]
    pub fn cancel(mut self, cancel: CancelToken) -> Self {
        self.config.cancel = cancel;
        self
    }

    /// Build the engine.
    #[must_use]
    pub fn build(self) -> SliceSync {
        SliceSync {
            config: self.config,
        }
    }
}

/// The sync engine.
pub struct SliceSync {
    config: SyncConfig,
}

impl SliceSync {
    /// An engine with default configuration.
    #[must_use]
    pub fn new() -> Self {
        SyncBuilder::new().build()
    }

    /// An engine with a custom slice size.
    #[must_use]
    pub fn with_slice(slice: u64) -> Self {
        SyncBuilder::new().slice(slice).build()
    }

    /// The configured slice size.
    #[must_use]
    pub fn slice(&self) -> u64 {
        self.config.slice
    }

    /// Copy `filename` from `server` into `dest`, reusing as much of
    /// `alike` as possible.
    ///
    /// `dest` defaults to the remote file's basename in the current
    /// directory; `alike` defaults to `dest`. When the alike does not
    /// exist the remote file is downloaded outright, with no fingerprints
    /// and no hash check, and the returned plan is one remote segment.
    pub fn sync(
        &self,
        server: &str,
        filename: &str,
        dest: Option<&Path>,
        alike: Option<&Path>,
    ) -> Result<Plan> {
        let remote = RemoteHashSource::new(server)?;
        let dest = dest
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(basename(filename)));
        let alike = alike.map_or_else(|| dest.clone(), Path::to_path_buf);

        let mut plan = if alike.exists() {
            self.sync_with(&remote, filename, &dest, &alike)?
        } else {
            info!(file = filename, "no alike file, downloading directly");
            self.download_with(&remote, filename, &dest)?
        };
        plan.remote = normalize_server(server);
        Ok(plan)
    }

    /// Plain full download of `filename` into `dest`: the no-alike
    /// shortcut. Needs no fingerprint on either side and performs no hash
    /// check; the plan is a single remote segment of whatever arrived.
    pub fn download_with(
        &self,
        remote: &dyn RangeReader,
        filename: &str,
        dest: &Path,
    ) -> Result<Plan> {
        let (mut stream, _) = remote.open(filename, 0, AUTOSIZE)?;
        let mut file = File::create(dest)?;
        let downloaded = std::io::copy(&mut stream, &mut file)?;

        let mut plan = Plan::new(filename, "", self.config.slice, downloaded);
        plan.push(Segment::remote(0, downloaded));
        plan.differences = downloaded;
        Ok(plan)
    }

    /// Sync against an explicit remote source, for callers that already
    /// hold one (or stand one in for tests).
    pub fn sync_with(
        &self,
        remote: &dyn HashSource,
        filename: &str,
        dest: &Path,
        alike: &Path,
    ) -> Result<Plan> {
        let slice = effective_slice(self.config.slice);
        let cancel = &self.config.cancel;

        let alike_dir = match alike.parent() {
            Some(parent) if parent != Path::new("") => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let alike_name = alike
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let local = LocalHashSource::new(&alike_dir).with_cancel(cancel.clone());

        let plan = match self.config.mode {
            DiffMode::Aligned => {
                // The producer side of the local pipe hashes concurrently
                // with the remote fetch this lockstep read drives.
                let local_fp = FingerprintReader::new(BufReader::new(
                    local.fingerprint(&alike_name, slice)?,
                ));
                let remote_fp =
                    FingerprintReader::new(BufReader::new(remote.fingerprint(filename, slice)?));
                naive_diff(local_fp, remote_fp, &alike_name, filename, slice, cancel)?
            }
            DiffMode::Shifted => {
                let alike_bytes = std::fs::read(alike)?;
                let remote_fp =
                    FingerprintReader::new(BufReader::new(remote.fingerprint(filename, slice)?));
                shifted_diff(
                    &alike_bytes,
                    remote_fp,
                    &alike_name,
                    filename,
                    slice,
                    cancel,
                )?
            }
        };

        reconstruct(dest, &plan, &local, &alike_name, remote, filename, cancel)?;
        Ok(plan)
    }
}

impl Default for SliceSync {
    fn default() -> Self {
        Self::new()
    }
}
