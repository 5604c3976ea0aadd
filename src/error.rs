//! Error types for slicesync operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during slicesync operations.
#[derive(Error, Debug)]
pub enum SliceSyncError {
    /// I/O error during read/write operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network or HTTP failure, including non-200/206 statuses and redirects.
    #[error("transport error for {url}: {reason}")]
    Transport {
        /// URL of the failed request.
        url: String,
        /// What went wrong (status line, connect failure, timeout).
        reason: String,
    },

    /// A fingerprint line could not be parsed.
    #[error("format error: {reason} (got {line:?})")]
    Format {
        /// The offending line, as read.
        line: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A fingerprint header field does not match the expected value.
    #[error("header mismatch: {field} expected {expected:?} but got {actual:?}")]
    HeaderMismatch {
        /// Header field name (`Version`, `Filename`, `Slice`, `Slice Hashing`).
        field: &'static str,
        /// Value this implementation requires.
        expected: String,
        /// Value found in the stream.
        actual: String,
    },

    /// An `Error:` marker was embedded in a fingerprint stream by its producer.
    #[error("fingerprint stream error: {0}")]
    InBand(String),

    /// A stream ended before delivering the promised byte count.
    #[error("short read at offset {offset}: expected {expected} bytes but got {actual}")]
    ShortRead {
        /// Byte offset of the segment being copied.
        offset: u64,
        /// Bytes the segment promised.
        expected: u64,
        /// Bytes actually delivered.
        actual: u64,
    },

    /// The reconstructed file's whole hash disagrees with the advertised one.
    #[error("hash check failed: expected {expected} but got {actual}")]
    HashMismatch {
        /// Digest advertised by the remote fingerprint.
        expected: String,
        /// Digest computed over the reconstructed bytes.
        actual: String,
    },

    /// A requested path escapes the served base directory.
    #[error("illegal path {path:?}, not within {base:?}")]
    Unsafe {
        /// The offending path as requested.
        path: PathBuf,
        /// The base directory it must stay under.
        base: PathBuf,
    },

    /// The operation observed a cancellation signal.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for slicesync operations.
pub type Result<T> = std::result::Result<T, SliceSyncError>;
