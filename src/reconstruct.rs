//! Reconstruction engine: executes a plan into the destination file.
//!
//! Segments are copied strictly in order, local ones from the alike file
//! and remote ones from the server, while a single whole-file hasher
//! digests everything written. The copy only succeeds when the digest
//! matches the hash the remote fingerprint advertised; on failure the
//! destination is left as-is for inspection, never unlinked.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::diff::{Plan, Source};
use crate::error::{Result, SliceSyncError};
use crate::hasher::{NamedHash, WholeHash};
use crate::range::RangeReader;

/// Rebuild `dest` from `plan`, pulling local segments from `local` (the
/// alike file, by `alike_name`) and remote segments from `remote` (by
/// `remote_name`).
///
/// Returns the hex digest of the written bytes after verifying it against
/// the plan's advertised hash. The destination always ends up exactly
/// `plan.length` bytes long, clipping whatever a previous file at that
/// path may have held beyond it.
pub fn reconstruct(
    dest: &Path,
    plan: &Plan,
    local: &dyn RangeReader,
    alike_name: &str,
    remote: &dyn RangeReader,
    remote_name: &str,
    cancel: &CancelToken,
) -> Result<String> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(dest)?;
    let mut whole = WholeHash::new();
    let mut buf = [0u8; 64 * 1024];

    for seg in &plan.segments {
        cancel.check()?;
        let (name, reader, read_offset): (&str, &dyn RangeReader, u64) = match seg.source {
            Source::Local { alike_offset } => (alike_name, local, alike_offset),
            Source::Remote => (remote_name, remote, seg.offset),
        };
        debug!(
            name,
            offset = seg.offset,
            size = seg.size,
            local = seg.is_local(),
            "copying segment"
        );

        let (mut stream, _) = reader.open(name, read_offset, seg.size)?;
        let mut copied = 0u64;
        while copied < seg.size {
            cancel.check()?;
            #[allow(clippy::cast_possible_truncation)] // bounded by buf.len()
            let want = buf.len().min((seg.size - copied) as usize);
            let n = stream.read(&mut buf[..want])?;
            if n == 0 {
                return Err(SliceSyncError::ShortRead {
                    offset: seg.offset,
                    expected: seg.size,
                    actual: copied,
                });
            }
            file.write_all(&buf[..n])?;
            whole.write(&buf[..n]);
            copied += n as u64;
        }
    }

    // Sequential writes end exactly at plan.length; clip any longer
    // leftovers from a previous file at this path.
    file.set_len(plan.length)?;
    file.flush()?;

    let computed = whole.hex_sum();
    if let Some(expected) = &plan.hash {
        if *expected != computed {
            return Err(SliceSyncError::HashMismatch {
                expected: expected.clone(),
                actual: computed,
            });
        }
    }
    info!(
        dest = %dest.display(),
        length = plan.length,
        fetched = plan.differences,
        "reconstruction complete"
    );
    Ok(computed)
}
