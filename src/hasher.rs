//! Named hash capabilities for whole files and slices.
//!
//! Two distinct hashes appear in a fingerprint, chosen at the call site
//! rather than through a runtime selector:
//!
//! - the *whole* hash ([`WholeHash`], SHA-1) digests an entire file and
//!   backs the final verification after reconstruction;
//! - the *slice* hash ([`SliceHash`], `adler32+md5`) digests one slice and
//!   is composite: a 32-bit rolling sum for cheap shifted matching glued to
//!   an MD5 digest that rejects weak-hash false positives.
//!
//! The header of every fingerprint names the hashes in use, so these names
//! are part of the wire format.

use digest::Digest;

use crate::rolling::RollingAdler32;

/// Wire name of the whole-file hash.
pub const WHOLE_HASH_NAME: &str = "sha1";

/// Wire name of the per-slice hash.
pub const SLICE_HASH_NAME: &str = "adler32+md5";

/// A resettable streaming hash that knows its wire name and digest width.
pub trait NamedHash {
    /// Restore the initial state.
    fn reset(&mut self);

    /// Feed bytes into the digest state.
    fn write(&mut self, data: &[u8]);

    /// Current digest. Does not alter the running state.
    fn sum(&self) -> Vec<u8>;

    /// Name this hash goes by in fingerprint headers and records.
    fn name(&self) -> &'static str;

    /// Digest width in bytes.
    fn size(&self) -> usize;
}

/// Strong whole-file hash (SHA-1).
#[derive(Clone)]
pub struct WholeHash {
    inner: sha1::Sha1,
}

impl WholeHash {
    /// Create a hasher with an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: sha1::Sha1::new(),
        }
    }

    /// One-shot digest of `data`, hex encoded.
    #[must_use]
    pub fn hex_digest(data: &[u8]) -> String {
        let mut hasher = Self::new();
        hasher.write(data);
        hasher.hex_sum()
    }

    /// Current digest, hex encoded as it appears on the total line.
    #[must_use]
    pub fn hex_sum(&self) -> String {
        hex::encode(self.sum())
    }
}

impl Default for WholeHash {
    fn default() -> Self {
        Self::new()
    }
}

impl NamedHash for WholeHash {
    fn reset(&mut self) {
        self.inner = sha1::Sha1::new();
    }

    fn write(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn sum(&self) -> Vec<u8> {
        self.inner.clone().finalize().to_vec()
    }

    fn name(&self) -> &'static str {
        WHOLE_HASH_NAME
    }

    fn size(&self) -> usize {
        20
    }
}

/// Composite per-slice hash: 4-byte big-endian rolling Adler-32 sum
/// followed by a 16-byte MD5 digest. Fixed 20-byte output.
#[derive(Clone)]
pub struct SliceHash {
    rolling: RollingAdler32,
    strong: md5::Md5,
}

impl SliceHash {
    /// Create a hasher with an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rolling: RollingAdler32::new(),
            strong: md5::Md5::new(),
        }
    }

    /// The rolling half of the current digest.
    #[must_use]
    pub fn rolling_sum(&self) -> u32 {
        self.rolling.sum32()
    }
}

impl Default for SliceHash {
    fn default() -> Self {
        Self::new()
    }
}

impl NamedHash for SliceHash {
    fn reset(&mut self) {
        self.rolling.reset();
        self.strong = md5::Md5::new();
    }

    fn write(&mut self, data: &[u8]) {
        self.rolling.write(data);
        self.strong.update(data);
    }

    fn sum(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&self.rolling.sum32().to_be_bytes());
        out.extend_from_slice(&self.strong.clone().finalize());
        out
    }

    fn name(&self) -> &'static str {
        SLICE_HASH_NAME
    }

    fn size(&self) -> usize {
        4 + 16
    }
}

/// Split a 20-byte slice digest into its rolling and strong halves.
///
/// Returns `None` when `digest` is not exactly 20 bytes.
#[must_use]
pub fn split_slice_digest(digest: &[u8]) -> Option<(u32, &[u8])> {
    if digest.len() != 20 {
        return None;
    }
    let weak = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    Some((weak, &digest[4..]))
}
