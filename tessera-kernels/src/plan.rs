/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Splitting the code axis across workers and into scratch-sized sub-tiles.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    num::{check_nonzero, round_down},
};

/// Scratch memory available to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchCapacity {
    /// Bytes for the `f32` accumulator tile (queries x codes).
    pub accumulator_bytes: usize,
    /// Bytes for the two staged code tiles of the double buffer.
    pub staging_bytes: usize,
}

impl Default for ScratchCapacity {
    fn default() -> Self {
        Self {
            accumulator_bytes: 48 * 1024 * 4,
            staging_bytes: 1024 * 1024,
        }
    }
}

/// Tile dimensions chosen once per kernel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TilePlan {
    /// Query rows per tile.
    pub query_tile: usize,
    /// Code columns per sub-tile. Always a multiple of `align`.
    pub code_tile: usize,
    /// Alignment of worker ranges and sub-tiles on the code axis.
    pub align: usize,
}

impl TilePlan {
    /// Pick the widest code sub-tile that fits `capacity`.
    ///
    /// * `query_tile`: Query rows processed together.
    /// * `dim`: Code dimension.
    /// * `staged_width`: Bytes per staged code element.
    /// * `align`: Granule of the code axis, normally the block size.
    pub fn new(
        capacity: ScratchCapacity,
        query_tile: usize,
        dim: usize,
        staged_width: usize,
        align: usize,
    ) -> Result<Self, ConfigError> {
        check_nonzero("query tile", query_tile)?;
        check_nonzero("dimension", dim)?;
        check_nonzero("alignment", align)?;

        let by_accumulator = capacity.accumulator_bytes / (query_tile * std::mem::size_of::<f32>());
        if by_accumulator < align {
            return Err(ConfigError::Scratch {
                available: capacity.accumulator_bytes,
                required: query_tile * align * std::mem::size_of::<f32>(),
                block: align,
            });
        }

        let by_staging = capacity.staging_bytes / (2 * dim * staged_width);
        if by_staging < align {
            return Err(ConfigError::Scratch {
                available: capacity.staging_bytes,
                required: 2 * align * dim * staged_width,
                block: align,
            });
        }

        Ok(Self {
            query_tile,
            code_tile: round_down(by_accumulator.min(by_staging), align),
            align,
        })
    }

    /// Split `range` into sub-tiles of at most `code_tile` codes.
    pub fn sub_tiles(&self, range: Range<usize>) -> SubTiles {
        SubTiles {
            next: range.start,
            end: range.end,
            step: self.code_tile,
        }
    }

    /// Split `0..nqueries` into query tiles.
    pub fn query_tiles(&self, nqueries: usize) -> SubTiles {
        SubTiles {
            next: 0,
            end: nqueries,
            step: self.query_tile,
        }
    }
}

/// Iterator over consecutive ranges of a fixed step, with a shorter final range.
#[derive(Debug, Clone)]
pub struct SubTiles {
    next: usize,
    end: usize,
    step: usize,
}

impl Iterator for SubTiles {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        if self.next >= self.end {
            return None;
        }
        let start = self.next;
        let stop = (start + self.step).min(self.end);
        self.next = stop;
        Some(start..stop)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.end.saturating_sub(self.next)).div_ceil(self.step);
        (n, Some(n))
    }
}

impl ExactSizeIterator for SubTiles {}

/// The contiguous code range owned by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerPartition {
    pub worker: usize,
    pub codes: Range<usize>,
}

/// Split `0..total` across `workers` contiguous ranges.
///
/// Every worker but the last receives `⌊(total / workers) / align⌋ · align` codes, so
/// each range starts on an `align` boundary. The last worker absorbs the remainder.
/// Ranges may be empty when `total` is small.
pub fn partition(total: usize, workers: usize, align: usize) -> Vec<WorkerPartition> {
    debug_assert!(workers > 0 && align > 0);
    let each = round_down(total / workers, align);
    (0..workers)
        .map(|worker| {
            let start = worker * each;
            let end = if worker + 1 == workers {
                total
            } else {
                start + each
            };
            WorkerPartition {
                worker,
                codes: start..end,
            }
        })
        .collect()
}
