/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Block-wise top-1 reduction of distance rows.

use half::f16;
use tessera_utils::Matrix;

use crate::{actual::ValidityMask, metric::Extremum, num::BlockSize};

/// The extremal entry of one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Winner {
    pub value: f16,
    /// Offset of the winning code within its block.
    pub index: u16,
}

impl Winner {
    pub(crate) fn sentinel(extremum: Extremum) -> Self {
        Self {
            value: sentinel(extremum),
            index: 0,
        }
    }
}

/// The half precision "never wins" value for `extremum`.
#[inline]
pub fn sentinel(extremum: Extremum) -> f16 {
    match extremum {
        Extremum::Min => f16::INFINITY,
        Extremum::Max => f16::NEG_INFINITY,
    }
}

/// One [`Winner`] per (query, block).
///
/// A block with no eligible code keeps the sentinel and reports no winner.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockWinners {
    winners: Matrix<Winner>,
    block: BlockSize,
    extremum: Extremum,
}

impl BlockWinners {
    /// Allocate sentinel-filled winners for `nqueries` rows over `ncodes` codes.
    pub fn new(nqueries: usize, ncodes: usize, block: BlockSize, extremum: Extremum) -> Self {
        Self {
            winners: Matrix::new(Winner::sentinel(extremum), nqueries, block.blocks(ncodes)),
            block,
            extremum,
        }
    }

    pub fn nqueries(&self) -> usize {
        self.winners.nrows()
    }

    pub fn nblocks(&self) -> usize {
        self.winners.ncols()
    }

    pub fn block(&self) -> BlockSize {
        self.block
    }

    pub fn extremum(&self) -> Extremum {
        self.extremum
    }

    /// All block winners of `query`, sentinels included.
    pub fn row(&self, query: usize) -> &[Winner] {
        self.winners.row(query)
    }

    pub(crate) fn row_mut(&mut self, query: usize) -> &mut [Winner] {
        self.winners.row_mut(query)
    }

    /// Return the winning value of block `block` for `query` and the global index of its
    /// code, or `None` if the block had no eligible code.
    pub fn get(&self, query: usize, block: usize) -> Option<(f16, usize)> {
        let w = self.winners[(query, block)];
        if w.value == sentinel(self.extremum) {
            None
        } else {
            Some((w.value, block * self.block.get() + usize::from(w.index)))
        }
    }

    /// The best winner across all blocks of `query`, ties resolved to the lowest index.
    pub fn best(&self, query: usize) -> Option<(f16, usize)> {
        let mut best: Option<(f16, usize)> = None;
        for b in 0..self.nblocks() {
            if let Some((value, index)) = self.get(query, b) {
                match best {
                    Some((v, _)) if !self.extremum.beats(value.to_f32(), v.to_f32()) => {}
                    _ => best = Some((value, index)),
                }
            }
        }
        best
    }

    /// Render the interleaved `[nqueries, 2 * nblocks]` form: the winning value followed
    /// by its in-block index reinterpreted as the bits of an `f16`.
    pub fn to_interleaved(&self) -> Matrix<f16> {
        Matrix::from_fn(self.nqueries(), 2 * self.nblocks(), |q, j| {
            let w = self.winners[(q, j / 2)];
            if j % 2 == 0 {
                w.value
            } else {
                f16::from_bits(w.index)
            }
        })
    }
}

/// Overwrite the entries of `row` that `mask` rejects for `query` with the sentinel.
///
/// `row[i]` is the distance for code `first_code + i`.
pub(crate) fn apply_mask(
    row: &mut [f16],
    query: usize,
    first_code: usize,
    mask: &ValidityMask<'_>,
    extremum: Extremum,
) {
    let s = sentinel(extremum);
    for (i, v) in row.iter_mut().enumerate() {
        if !mask.is_valid(query, first_code + i) {
            *v = s;
        }
    }
}

/// Reduce `row` in blocks of `block` entries, writing one winner per block into `out`.
///
/// `row` must start on a block boundary. A trailing partial block is reduced over its own
/// length.
///
/// # Panics
///
/// Panics if `out` has fewer than `row.len().div_ceil(block)` entries.
pub(crate) fn reduce_row(row: &[f16], block: usize, extremum: Extremum, out: &mut [Winner]) {
    let nblocks = row.len().div_ceil(block);
    assert!(out.len() >= nblocks, "winner buffer is too short");
    for (chunk, slot) in row.chunks(block).zip(out.iter_mut()) {
        *slot = reduce_block(chunk, extremum);
    }
}

#[inline]
fn reduce_block(chunk: &[f16], extremum: Extremum) -> Winner {
    let mut best = Winner::sentinel(extremum);
    let mut best_value = extremum.sentinel();
    for (i, v) in chunk.iter().enumerate() {
        let x = v.to_f32();
        if extremum.beats(x, best_value) {
            best_value = x;
            best = Winner {
                value: *v,
                index: i as u16,
            };
        }
    }
    best
}
