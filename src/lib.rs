//! # Slicesync
//!
//! Delta file synchronization over HTTP ranges, in pure Rust.
//!
//! A client reconstructs a remote file out of a local "alike" file that
//! shares most of its content, fetching only the differing slices. The
//! server side is just static files plus a `.slicesync/` shadow tree of
//! fingerprints that [`FingerprintStore`] keeps fresh; any range-capable
//! HTTP server can serve both.
//!
//! ## Features
//!
//! - **Fingerprints**: line-oriented slice-hash dumps, streamable and
//!   cacheable, with a whole-file SHA-1 total
//! - **Rolling checksum**: Adler-32 with O(1) window sliding for the
//!   shift-tolerant diff mode
//! - **Atomic publication**: fingerprints appear in the shadow tree only
//!   via rename, never half-written
//! - **Verified reconstruction**: every sync ends with a whole-file hash
//!   check against the remote's advertised digest
//!
//! ## Example
//!
//! ```rust,no_run
//! use slicesync::SliceSync;
//!
//! // Reconstruct backup.tar into ./backup.tar, reusing ./backup.tar as
//! // the alike if it exists, with 1 MiB slices.
//! let sync = SliceSync::with_slice(1 << 20);
//! let plan = sync.sync("backups.example.com:8000", "backup.tar", None, None).unwrap();
//! println!("fetched {} of {} bytes", plan.differences, plan.length);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

mod cancel;
mod diff;
mod error;
mod fingerprint;
mod hasher;
mod range;
mod reconstruct;
mod rolling;
mod store;
mod sync;

pub use cancel::CancelToken;
pub use diff::{basename, naive_diff, shifted_diff, Plan, Segment, Source};
pub use error::{Result, SliceSyncError};
pub use fingerprint::{
    effective_slice, slice_count, write_fingerprint, FingerprintReader, DEFAULT_SLICE,
    FORMAT_VERSION, MIB, SHADOW_DIR, SLICESYNC_EXT, TMP_SLICESYNC_EXT,
};
pub use hasher::{
    split_slice_digest, NamedHash, SliceHash, WholeHash, SLICE_HASH_NAME, WHOLE_HASH_NAME,
};
pub use range::{
    clamp_length, hash_info, HashInfo, HttpRangeReader, LocalRangeReader, RangeReader, AUTOSIZE,
};
pub use reconstruct::reconstruct;
pub use rolling::RollingAdler32;
pub use store::FingerprintStore;
pub use sync::{
    DiffMode, HashSource, LocalHashSource, RemoteHashSource, SliceSync, SyncBuilder, SyncConfig,
};
