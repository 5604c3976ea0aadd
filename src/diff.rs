//! Diff engine: turns two fingerprint streams into a reconstruction plan.
//!
//! A [`Plan`] is an ordered list of segments covering `[0, remote_length)`;
//! each segment is either copied from the local alike file or fetched from
//! the remote. Two modes produce the same contract:
//!
//! - [`naive_diff`] compares slice hashes in lockstep at aligned offsets,
//!   reading both streams sequentially with constant memory;
//! - [`shifted_diff`] scans the alike at byte granularity with the rolling
//!   hash, so content that moved inside the file still matches. Matched
//!   segments then carry the alike offset the bytes live at.

use std::io::BufRead;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Result, SliceSyncError};
use crate::fingerprint::FingerprintReader;
use crate::hasher::{split_slice_digest, NamedHash, SliceHash, WholeHash};
use crate::rolling::RollingAdler32;

/// Where a segment's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    /// Copy from the local alike file, starting at `alike_offset`.
    ///
    /// Aligned diffs always use `alike_offset == offset`; shifted diffs may
    /// point anywhere in the alike.
    Local {
        /// Offset of the bytes within the alike file.
        alike_offset: u64,
    },
    /// Fetch from the remote file at the segment's own offset.
    Remote,
}

/// One contiguous piece of the reconstruction plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Starting offset in the remote file.
    pub offset: u64,
    /// Byte count.
    pub size: u64,
    /// Origin of the bytes.
    pub source: Source,
}

impl Segment {
    /// An aligned local segment (alike offset equals the remote offset).
    #[must_use]
    pub const fn local(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            source: Source::Local {
                alike_offset: offset,
            },
        }
    }

    /// A local segment whose bytes live at `alike_offset` in the alike.
    #[must_use]
    pub const fn local_at(offset: u64, size: u64, alike_offset: u64) -> Self {
        Self {
            offset,
            size,
            source: Source::Local { alike_offset },
        }
    }

    /// A remote segment.
    #[must_use]
    pub const fn remote(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            source: Source::Remote,
        }
    }

    /// Is this segment served from the alike file?
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.source, Source::Local { .. })
    }
}

/// The reconstruction plan for one remote file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Server base URL, filled in by the orchestrator.
    pub remote: String,
    /// Remote file name.
    pub filename: String,
    /// Local alike file name, empty when none was used.
    pub alike: String,
    /// Slice size the fingerprints were computed with.
    pub slice: u64,
    /// Remote file length; the segments cover exactly `[0, length)`.
    pub length: u64,
    /// Bytes that must travel: the sum of all remote segment sizes.
    pub differences: u64,
    /// Ordered segments.
    pub segments: Vec<Segment>,
    /// Whole-file hash advertised by the remote fingerprint.
    pub hash: Option<String>,
    /// Whole-file hash of the alike, when its fingerprint carried one.
    pub alike_hash: Option<String>,
}

impl Plan {
    /// An empty plan scaffold.
    #[must_use]
    pub fn new(filename: &str, alike: &str, slice: u64, length: u64) -> Self {
        Self {
            remote: String::new(),
            filename: filename.to_string(),
            alike: alike.to_string(),
            slice,
            length,
            differences: 0,
            segments: Vec::new(),
            hash: None,
            alike_hash: None,
        }
    }

    /// Sum of all segment sizes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.size).sum()
    }

    /// Bytes served from the alike file.
    #[must_use]
    pub fn bytes_local(&self) -> u64 {
        self.segments
            .iter()
            .filter(|s| s.is_local())
            .map(|s| s.size)
            .sum()
    }

    /// Append a segment, merging it into the previous one when both sides
    /// are contiguous and of the same kind.
    pub fn push(&mut self, segment: Segment) {
        if segment.size == 0 {
            return;
        }
        if let Some(last) = self.segments.last_mut() {
            let contiguous = last.offset + last.size == segment.offset;
            let merges = match (last.source, segment.source) {
                (Source::Remote, Source::Remote) => contiguous,
                (
                    Source::Local {
                        alike_offset: prev_alike,
                    },
                    Source::Local { alike_offset },
                ) => contiguous && prev_alike + last.size == alike_offset,
                _ => false,
            };
            if merges {
                last.size += segment.size;
                return;
            }
        }
        self.segments.push(segment);
    }

    /// Check the plan invariants: coverage starts at zero, segments are
    /// contiguous, they end exactly at the remote length, and no adjacent
    /// pair should have been merged.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut expected = 0u64;
        for (i, seg) in self.segments.iter().enumerate() {
            if seg.size == 0 {
                return Err(format!("segment {i} has zero size"));
            }
            if seg.offset != expected {
                return Err(format!(
                    "segment {i} starts at {} but {} was expected",
                    seg.offset, expected
                ));
            }
            if i > 0 {
                let prev = &self.segments[i - 1];
                match (prev.source, seg.source) {
                    (Source::Remote, Source::Remote) => {
                        return Err(format!("segments {} and {i} are both remote", i - 1));
                    }
                    (
                        Source::Local {
                            alike_offset: prev_alike,
                        },
                        Source::Local { alike_offset },
                    ) if prev_alike + prev.size == alike_offset => {
                        return Err(format!(
                            "segments {} and {i} are contiguous local copies",
                            i - 1
                        ));
                    }
                    _ => {}
                }
            }
            expected += seg.size;
        }
        if expected != self.length {
            return Err(format!(
                "segments cover {expected} bytes of a {} byte file",
                self.length
            ));
        }
        Ok(())
    }

    /// Pretty-printed JSON report of the plan.
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| e.to_string())
    }
}

/// Strip any directory part from a file name.
#[must_use]
pub fn basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Aligned diff: compare the two fingerprint streams slice by slice.
///
/// Both headers are validated against the expected names and slice size.
/// The walk keeps a single in-or-out-of-diff state and extends the current
/// segment while consecutive slices keep agreeing or disagreeing, so the
/// plan comes out maximally merged. When the alike is shorter than the
/// remote, the uncovered tail becomes one final remote segment.
pub fn naive_diff<L: BufRead, R: BufRead>(
    mut local: FingerprintReader<L>,
    mut remote: FingerprintReader<R>,
    alike_name: &str,
    remote_name: &str,
    slice: u64,
    cancel: &CancelToken,
) -> Result<Plan> {
    let local_len = local.read_header(basename(alike_name), slice)?;
    let remote_len = remote.read_header(basename(remote_name), slice)?;

    let mut plan = Plan::new(remote_name, alike_name, slice, remote_len);
    let end = local_len.min(remote_len);
    let mut pos = 0u64;
    let mut in_diff = false;
    let mut start = 0u64;

    // Segment boundaries are only known once the state flips, so sizes are
    // patched onto the previously opened segment at each transition.
    let mut open: Vec<Segment> = Vec::new();
    while pos < end {
        cancel.check()?;
        let segment = slice.min(end - pos);
        let local_hash = local.read_slice_hash()?.ok_or_else(|| truncated(alike_name))?;
        let remote_hash = remote
            .read_slice_hash()?
            .ok_or_else(|| truncated(remote_name))?;

        let differ = local_hash != remote_hash;
        if !in_diff && differ {
            if open.is_empty() && pos > 0 {
                open.push(Segment::local(0, 0));
            }
            if let Some(last) = open.last_mut() {
                last.size = pos - start;
            }
            start = pos;
            open.push(Segment::remote(start, 0));
            in_diff = true;
        } else if in_diff && !differ {
            if let Some(last) = open.last_mut() {
                last.size = pos - start;
            }
            start = pos;
            open.push(Segment::local(start, 0));
            in_diff = false;
        }
        pos += segment;
    }

    if open.is_empty() {
        if pos > 0 {
            open.push(Segment::local(0, pos));
        }
    } else if let Some(last) = open.last_mut() {
        last.size = pos - start;
    }
    for seg in open {
        plan.push(seg);
    }
    if local_len < remote_len {
        plan.push(Segment::remote(local_len, remote_len - local_len));
    }
    plan.differences = plan
        .segments
        .iter()
        .filter(|s| !s.is_local())
        .map(|s| s.size)
        .sum();

    // Any slice hashes past the compared prefix are drained so the totals
    // are read from the right position in both streams.
    while local.read_slice_hash()?.is_some() {
        cancel.check()?;
    }
    while remote.read_slice_hash()?.is_some() {
        cancel.check()?;
    }
    plan.alike_hash = local.read_total()?;
    plan.hash = remote.read_total()?;
    if remote_len > 0 && plan.hash.is_none() {
        return Err(SliceSyncError::Format {
            line: String::new(),
            reason: format!("fingerprint of {remote_name} is missing its total"),
        });
    }

    debug!(
        remote = remote_name,
        segments = plan.segments.len(),
        differences = plan.differences,
        "aligned diff complete"
    );
    Ok(plan)
}

fn truncated(name: &str) -> SliceSyncError {
    SliceSyncError::Format {
        line: String::new(),
        reason: format!("fingerprint of {name} ended before its slice hashes"),
    }
}

/// One remote slice loaded from the fingerprint, split into its halves.
struct RemoteSlice {
    weak: u32,
    strong: [u8; 16],
    alike_offset: Option<u64>,
}

/// Shift-tolerant diff: find each remote slice anywhere in the alike.
///
/// The remote fingerprint's slice digests go into a weak-sum lookup table;
/// the alike bytes are then scanned one byte at a time with the rolling
/// hash, and windows whose weak sum hits the table are confirmed against
/// the MD5 half. A confirmed window serves every remote slice with that
/// digest. Remote slices never found in the alike are fetched. A short
/// final slice is always fetched; a window of a different width cannot
/// ride the same rolling scan.
pub fn shifted_diff<R: BufRead>(
    alike_bytes: &[u8],
    mut remote: FingerprintReader<R>,
    alike_name: &str,
    remote_name: &str,
    slice: u64,
    cancel: &CancelToken,
) -> Result<Plan> {
    let remote_len = remote.read_header(basename(remote_name), slice)?;
    let mut plan = Plan::new(remote_name, alike_name, slice, remote_len);

    let mut slices = Vec::new();
    while let Some(digest) = remote.read_slice_hash()? {
        let (weak, strong) = split_slice_digest(&digest).ok_or_else(|| SliceSyncError::Format {
            line: String::new(),
            reason: "slice digest is not rolling+md5 shaped".to_string(),
        })?;
        slices.push(RemoteSlice {
            weak,
            strong: strong.try_into().expect("split yields 16 strong bytes"),
            alike_offset: None,
        });
    }
    plan.hash = remote.read_total()?;
    if remote_len > 0 && plan.hash.is_none() {
        return Err(SliceSyncError::Format {
            line: String::new(),
            reason: format!("fingerprint of {remote_name} is missing its total"),
        });
    }

    if !alike_bytes.is_empty() {
        let mut whole = WholeHash::new();
        whole.write(alike_bytes);
        plan.alike_hash = Some(whole.hex_sum());
    }

    // Only full-width slices can match the rolling window; the final slice
    // is short whenever the length is not a slice multiple.
    #[allow(clippy::cast_possible_truncation)]
    let full_slices = (remote_len / slice) as usize;
    let scan_len = full_slices.min(slices.len());
    scan_alike(alike_bytes, &mut slices[..scan_len], slice, cancel)?;

    for (i, remote_slice) in slices.iter().enumerate() {
        let offset = i as u64 * slice;
        let size = slice.min(remote_len - offset);
        match remote_slice.alike_offset {
            Some(alike_offset) => plan.push(Segment::local_at(offset, size, alike_offset)),
            None => plan.push(Segment::remote(offset, size)),
        }
    }
    plan.differences = plan
        .segments
        .iter()
        .filter(|s| !s.is_local())
        .map(|s| s.size)
        .sum();

    debug!(
        remote = remote_name,
        segments = plan.segments.len(),
        differences = plan.differences,
        "shifted diff complete"
    );
    Ok(plan)
}

/// Roll a slice-wide window over the alike, assigning each table hit to
/// every still-unmatched remote slice with the same digest.
///
/// A window sitting at a slice's own aligned offset may overwrite an
/// earlier match for that slice, so duplicate content settles on aligned
/// offsets and identical files merge into one segment.
#[allow(clippy::cast_possible_truncation)] // slice sizes stay far below u32::MAX
fn scan_alike(
    alike: &[u8],
    slices: &mut [RemoteSlice],
    slice: u64,
    cancel: &CancelToken,
) -> Result<()> {
    let window = slice as usize;
    if window == 0 || alike.len() < window || slices.is_empty() {
        return Ok(());
    }

    let mut table: FxHashMap<u32, Vec<usize>> = FxHashMap::default();
    for (i, s) in slices.iter().enumerate() {
        table.entry(s.weak).or_default().push(i);
    }
    let mut unmatched = slices.len();
    let last_aligned = (slices.len() as u64 - 1) * slice;

    let mut rolling = RollingAdler32::new();
    rolling.write(&alike[..window]);
    let mut pos = 0usize;
    loop {
        if pos % (1 << 20) < window {
            cancel.check()?;
        }

        let mut matched_here = false;
        if let Some(candidates) = table.get(&rolling.sum32()) {
            let mut strong: Option<[u8; 16]> = None;
            for &idx in candidates {
                let aligned = idx as u64 * slice == pos as u64;
                if slices[idx].alike_offset.is_some() && !aligned {
                    continue;
                }
                let digest = strong.get_or_insert_with(|| {
                    let mut md5 = SliceHash::new();
                    md5.write(&alike[pos..pos + window]);
                    let sum = md5.sum();
                    sum[4..].try_into().expect("md5 half is 16 bytes")
                });
                if slices[idx].strong == *digest {
                    if slices[idx].alike_offset.is_none() {
                        unmatched -= 1;
                    }
                    slices[idx].alike_offset = Some(pos as u64);
                    matched_here = true;
                }
            }
        }
        if unmatched == 0 && pos as u64 >= last_aligned {
            return Ok(());
        }

        if matched_here {
            // A matched window cannot overlap the next match; jump past it
            // and reload, as the aligned generator would.
            if pos + 2 * window <= alike.len() {
                rolling.reset();
                rolling.write(&alike[pos + window..pos + 2 * window]);
                pos += window;
            } else {
                return Ok(());
            }
        } else if pos + window < alike.len() {
            rolling.roll32(window as u32, alike[pos], alike[pos + window]);
            pos += 1;
        } else {
            return Ok(());
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::io::{BufReader, Cursor};

    use crate::fingerprint::write_fingerprint;

    fn plan_for(local: &[u8], remote: &[u8], slice: u64) -> Plan {
        let write = |data: &[u8], name: &str| {
            let mut out = Vec::new();
            write_fingerprint(
                Cursor::new(data),
                data.len() as u64,
                name,
                slice,
                &mut out,
                &CancelToken::new(),
            )
            .unwrap();
            out
        };
        naive_diff(
            FingerprintReader::new(BufReader::new(Cursor::new(write(local, "a")))),
            FingerprintReader::new(BufReader::new(Cursor::new(write(remote, "r")))),
            "a",
            "r",
            slice,
            &CancelToken::new(),
        )
        .unwrap()
    }

    proptest! {
        /// Every naive plan satisfies the coverage invariants and its
        /// segment sizes sum to the remote length.
        #[test]
        fn plans_always_valid(
            local in prop::collection::vec(any::<u8>(), 0..2000),
            remote in prop::collection::vec(any::<u8>(), 0..2000),
            slice in 1u64..200
        ) {
            let plan = plan_for(&local, &remote, slice);
            prop_assert!(plan.validate().is_ok(), "{:?}", plan.validate());
            prop_assert_eq!(plan.total_size(), remote.len() as u64);
            prop_assert_eq!(
                plan.differences,
                plan.segments.iter().filter(|s| !s.is_local()).map(|s| s.size).sum::<u64>()
            );
        }

        /// Agreeing fingerprints produce the minimal plan.
        #[test]
        fn identical_prefix_plans(
            data in prop::collection::vec(any::<u8>(), 1..2000),
            cut in 0usize..2000,
            slice in 1u64..200
        ) {
            let cut = cut.min(data.len());
            let plan = plan_for(&data[..cut], &data, slice);
            // The alike is a prefix: everything compared matches, so the
            // plan is at most [Local(0, cut'), Remote(tail)].
            prop_assert!(plan.segments.len() <= 2);
            if cut == data.len() {
                prop_assert_eq!(plan.differences, 0);
            }
        }

        /// Shifted plans cover the remote exactly, too.
        #[test]
        fn shifted_plans_always_valid(
            local in prop::collection::vec(any::<u8>(), 0..1500),
            remote in prop::collection::vec(any::<u8>(), 0..1500),
            slice in 4u64..100
        ) {
            let mut out = Vec::new();
            write_fingerprint(
                Cursor::new(&remote),
                remote.len() as u64,
                "r",
                slice,
                &mut out,
                &CancelToken::new(),
            ).unwrap();
            let plan = shifted_diff(
                &local,
                FingerprintReader::new(BufReader::new(Cursor::new(out))),
                "a",
                "r",
                slice,
                &CancelToken::new(),
            ).unwrap();
            prop_assert!(plan.validate().is_ok(), "{:?}", plan.validate());
            prop_assert_eq!(plan.total_size(), remote.len() as u64);
        }
    }
}
