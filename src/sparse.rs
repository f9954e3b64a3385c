//! Run-length description of a sparse resource.
//!
//! A resource's payload is stored in the archive with its holes elided. The
//! map records the alternating data/hole structure so that actions can
//! reconstruct destination offsets and the true on-device length.

use crate::error::{FwForgeError, Result};

/// Byte-addressed mirror of the block layer's unit.
pub const BLOCK_SIZE: u64 = crate::block::BLOCK_SIZE as u64;

/// Minimum run of zero bytes treated as a hole when scanning input files.
const MIN_HOLE_SIZE: u64 = 4096;

/// Alternating run lengths, beginning with data. Even-indexed runs are data
/// bytes present in the archive; odd-indexed runs are holes (implicit zeros)
/// at the destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseMap {
    runs: Vec<u64>,
}

impl SparseMap {
    /// Build a map from the run list stored in a file-resource section.
    ///
    /// An empty list describes a zero-length resource. A single run is a
    /// fully dense resource.
    pub fn from_runs(runs: &[u64]) -> Result<Self> {
        // Interior zero-length runs would break offset accounting; only the
        // leading data run may legitimately be zero (file starts in a hole).
        for (i, &len) in runs.iter().enumerate() {
            if len == 0 && i != 0 {
                return Err(FwForgeError::config(format!(
                    "sparse run {i} has zero length"
                )));
            }
        }
        Ok(SparseMap {
            runs: runs.to_vec(),
        })
    }

    /// A dense map: one data run covering `len` bytes.
    pub fn dense(len: u64) -> Self {
        if len == 0 {
            SparseMap { runs: Vec::new() }
        } else {
            SparseMap { runs: vec![len] }
        }
    }

    pub fn runs(&self) -> &[u64] {
        &self.runs
    }

    /// Sum of the data runs: bytes actually present in the archive.
    pub fn data_size(&self) -> u64 {
        self.runs.iter().step_by(2).sum()
    }

    /// Total destination size including holes.
    pub fn total_size(&self) -> u64 {
        self.runs.iter().sum()
    }

    /// Length of the final hole, or 0 if the map ends on data.
    pub fn ending_hole(&self) -> u64 {
        if self.runs.len() % 2 == 0 {
            self.runs.last().copied().unwrap_or(0)
        } else {
            0
        }
    }

    /// Iterate `(dest_offset, data_len)` pairs for each data run.
    pub fn data_runs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let mut offset = 0u64;
        self.runs.iter().enumerate().filter_map(move |(i, &len)| {
            let start = offset;
            offset += len;
            if i % 2 == 0 && len > 0 {
                Some((start, len))
            } else {
                None
            }
        })
    }

    /// Scan a buffer of file contents into a sparse map.
    ///
    /// Zero regions are detected at block granularity and become holes only
    /// when at least `MIN_HOLE_SIZE` long (or at end of file), so that
    /// incidental zero blocks in dense data do not fragment the run list.
    pub fn scan(data: &[u8]) -> Self {
        let len = data.len() as u64;

        // First pass: strictly alternating (is_hole, len) runs.
        let mut raw: Vec<(bool, u64)> = Vec::new();
        let mut pos = 0u64;
        while pos < len {
            let zeros = zero_run_len(&data[pos as usize..]);
            if zeros > 0 {
                raw.push((true, zeros));
                pos += zeros;
            } else {
                let chunk = (len - pos).min(BLOCK_SIZE);
                match raw.last_mut() {
                    Some((false, l)) => *l += chunk,
                    _ => raw.push((false, chunk)),
                }
                pos += chunk;
            }
        }

        // Second pass: demote short interior holes to data and coalesce.
        let n = raw.len();
        let mut merged: Vec<(bool, u64)> = Vec::new();
        for (i, (is_hole, l)) in raw.into_iter().enumerate() {
            let kind = is_hole && (l >= MIN_HOLE_SIZE || i + 1 == n);
            match merged.last_mut() {
                Some((k, ml)) if *k == kind => *ml += l,
                _ => merged.push((kind, l)),
            }
        }

        let mut runs = Vec::new();
        for (is_hole, l) in merged {
            if runs.is_empty() && is_hole {
                // File starts in a hole: leading zero-length data run.
                runs.push(0);
            }
            runs.push(l);
        }
        SparseMap { runs }
    }
}

/// Length of the leading zero run in `data`, rounded to block boundaries.
fn zero_run_len(data: &[u8]) -> u64 {
    let mut len = 0u64;
    for chunk in data.chunks(BLOCK_SIZE as usize) {
        if chunk.iter().all(|&b| b == 0) {
            len += chunk.len() as u64;
        } else {
            break;
        }
    }
    len
}
