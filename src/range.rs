//! Byte-range readers over a local directory or a remote HTTP endpoint.
//!
//! Both implementations expose the same capability: open a stream for
//! `(path, offset, length)` that yields exactly the returned effective
//! length and then ends. The diff and reconstruction engines consume the
//! capability without caring which side of the wire the bytes come from.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SliceSyncError};
use crate::hasher::{NamedHash, SliceHash, WholeHash};

/// Length value meaning "to the end of the file".
pub const AUTOSIZE: u64 = 0;

/// Default timeout applied to remote range requests.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A source of byte ranges addressed by file name.
///
/// `length == AUTOSIZE` requests everything from `offset` to the end. The
/// returned stream delivers exactly the effective length; dropping it
/// releases the underlying file handle or response body.
pub trait RangeReader {
    /// Open a stream over `[offset, offset + length)` of `name`.
    fn open(&self, name: &str, offset: u64, length: u64) -> Result<(Box<dyn Read + Send>, u64)>;
}

/// Serves ranges of files under a base directory.
#[derive(Debug, Clone)]
pub struct LocalRangeReader {
    base: PathBuf,
}

impl LocalRangeReader {
    /// Create a reader rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// The base directory this reader serves from.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Join `name` under the base, refusing anything that would land
    /// outside it.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let requested = Path::new(name);
        let mut cleaned = PathBuf::new();
        for component in requested.components() {
            match component {
                Component::Normal(part) => cleaned.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !cleaned.pop() {
                        return Err(SliceSyncError::Unsafe {
                            path: requested.to_path_buf(),
                            base: self.base.clone(),
                        });
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SliceSyncError::Unsafe {
                        path: requested.to_path_buf(),
                        base: self.base.clone(),
                    });
                }
            }
        }
        let joined = self.base.join(&cleaned);

        // Symlinks can still point outside; compare canonical forms when the
        // target exists.
        if let (Ok(canonical), Ok(canonical_base)) = (joined.canonicalize(), self.base.canonicalize())
        {
            if !canonical.starts_with(&canonical_base) {
                return Err(SliceSyncError::Unsafe {
                    path: requested.to_path_buf(),
                    base: self.base.clone(),
                });
            }
        }
        Ok(joined)
    }
}

impl RangeReader for LocalRangeReader {
    fn open(&self, name: &str, offset: u64, length: u64) -> Result<(Box<dyn Read + Send>, u64)> {
        let path = self.resolve(name)?;
        let mut file = File::open(&path)?;
        let size = file.metadata()?.len();

        let effective = clamp_length(size, offset, length);
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        Ok((Box::new(file.take(effective)), effective))
    }
}

/// The slice of a file that remains readable from `offset`.
///
/// `AUTOSIZE` and any length past the end both clamp to the remaining
/// bytes; offsets past the end clamp to zero.
#[must_use]
pub fn clamp_length(size: u64, offset: u64, length: u64) -> u64 {
    let remaining = size.saturating_sub(offset);
    if length == AUTOSIZE {
        remaining
    } else {
        length.min(remaining)
    }
}

/// Serves ranges of files from an HTTP endpoint via `Range` requests.
pub struct HttpRangeReader {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpRangeReader {
    /// Create a reader for files under `base_url`.
    ///
    /// Redirects are refused: a fingerprint fetched from one host must not
    /// silently pair with ranges fetched from another.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SliceSyncError::Transport {
                url: String::new(),
                reason: format!("building HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a reader reusing an existing client.
    pub fn with_client(client: reqwest::blocking::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url }
    }

    /// URL a given file name is fetched from.
    #[must_use]
    pub fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name.trim_start_matches('/'))
    }

    /// The `Range` header value for an `(offset, length)` request, or
    /// `None` when the whole file is wanted.
    #[must_use]
    pub fn range_header(offset: u64, length: u64) -> Option<String> {
        if offset == 0 && length == AUTOSIZE {
            None
        } else if length == AUTOSIZE {
            Some(format!("bytes={offset}-"))
        } else {
            Some(format!("bytes={offset}-{}", offset + length - 1))
        }
    }

    /// Issue a plain GET for `url`, without any range.
    pub fn get(&self, url: &str) -> Result<(Box<dyn Read + Send>, u64)> {
        self.request(url, None)
    }

    fn request(&self, url: &str, range: Option<String>) -> Result<(Box<dyn Read + Send>, u64)> {
        let mut req = self.client.get(url);
        if let Some(range) = &range {
            req = req.header(reqwest::header::RANGE, range);
        }
        let resp = req.send().map_err(|e| SliceSyncError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if status.is_redirection() {
            return Err(SliceSyncError::Transport {
                url: url.to_string(),
                reason: format!("refusing redirect: status {status}"),
            });
        }
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(SliceSyncError::Transport {
                url: url.to_string(),
                reason: format!("status {status}"),
            });
        }

        let effective = resp.content_length().unwrap_or(0);
        Ok((Box::new(resp), effective))
    }
}

impl RangeReader for HttpRangeReader {
    fn open(&self, name: &str, offset: u64, length: u64) -> Result<(Box<dyn Read + Send>, u64)> {
        let url = self.url_for(name);
        self.request(&url, Self::range_header(offset, length))
    }
}

/// Digest of one file slice, as reported by the single-slice hash
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashInfo {
    /// Total size of the file.
    pub size: u64,
    /// Offset the digest starts at.
    pub offset: u64,
    /// Bytes actually digested (clamped to the end of the file).
    pub slice: u64,
    /// `<hash-name>-<hex>` record, empty when the range is empty.
    pub hash: String,
}

/// Hash one slice of a file under `base`.
///
/// `offset == 0 && slice == AUTOSIZE` digests the whole file with the
/// whole-file hash; any other range uses the slice hash.
pub fn hash_info(base: &LocalRangeReader, name: &str, offset: u64, slice: u64) -> Result<HashInfo> {
    let path = base.resolve(name)?;
    let size = std::fs::metadata(&path)?.len();
    let (mut stream, effective) = base.open(name, offset, slice)?;

    let mut hash = String::new();
    if effective > 0 {
        let mut hasher: Box<dyn NamedHash> = if offset == 0 && slice == AUTOSIZE {
            Box::new(WholeHash::new())
        } else {
            Box::new(SliceHash::new())
        };
        let mut buf = [0u8; 8192];
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.write(&buf[..n]);
        }
        hash = format!("{}-{}", hasher.name(), hex::encode(hasher.sum()));
    }

    Ok(HashInfo {
        size,
        offset,
        slice: effective,
        hash,
    })
}
