// SPDX-FileCopyrightText: 2025 The otapply Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Helpers for block extent lists attached to install operations.

use crate::protobuf::update_engine::{Extent, InstallOperation};

/// Pseudo start block marking a sparse hole. Reading a hole produces zeros
/// and writing to one drops the data.
pub const SPARSE_HOLE: u64 = u64::MAX;

pub fn is_sparse_hole(extent: &Extent) -> bool {
    extent.start_block() == SPARSE_HOLE
}

/// Total number of blocks covered by the extents, holes included.
pub fn block_count(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.num_blocks()).sum()
}

/// Canonical form of the non-hole blocks: sorted, coalesced (start, length)
/// runs. Two extent lists cover the same physical blocks iff their canonical
/// forms are equal.
fn canonical_runs(extents: &[Extent]) -> Vec<(u64, u64)> {
    let mut runs = extents
        .iter()
        .filter(|e| !is_sparse_hole(e) && e.num_blocks() > 0)
        .map(|e| (e.start_block(), e.num_blocks()))
        .collect::<Vec<_>>();
    runs.sort_unstable();

    let mut merged = Vec::<(u64, u64)>::with_capacity(runs.len());
    for (start, length) in runs {
        match merged.last_mut() {
            Some((last_start, last_length)) if *last_start + *last_length >= start => {
                let end = (start + length).max(*last_start + *last_length);
                *last_length = end - *last_start;
            }
            _ => merged.push((start, length)),
        }
    }
    merged
}

/// Whether applying the operation twice in a row is equivalent to applying it
/// once. That holds when the operation reads exactly the physical blocks it
/// writes, so a crash between the operation and its checkpoint is recoverable
/// by replaying it. Sparse holes are ignored since they carry no data.
pub fn is_idempotent_operation(op: &InstallOperation) -> bool {
    canonical_runs(&op.src_extents) == canonical_runs(&op.dst_extents)
}
