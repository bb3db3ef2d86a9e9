/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Product quantization distance tables for inverted lists.
//!
//! For query `q` probing list `l`, the residual `r = q - coarse[l]` is split into
//! `sub_quantizers` chunks of `sub_dim` values. Table entry `[q, p, m, k]` is the squared
//! distance between chunk `m` of the residual and entry `k` of sub-codebook `m`.

use std::sync::Arc;

use half::f16;
use rayon::{iter::IndexedParallelIterator, slice::ParallelSliceMut};
use serde::{Deserialize, Serialize};
use tessera_utils::{Matrix, MatrixView};
use wide::f32x8;

use crate::{
    arith,
    error::{ConfigError, InvocationError, KernelResult},
    num::{check_aligned, check_nonzero, LANES},
    pool::{create_worker_pool, ParallelIteratorInPool, WorkerPool},
};

/// Marks an unused probe slot in the assigned list ids.
pub const UNUSED_LIST: i32 = -1;

/// The probe count must be a multiple of this.
pub const NPROBE_ALIGNMENT: usize = 8;

/// The widest supported sub-vector.
pub const MAX_SUB_DIM: usize = 128;

fn default_workers() -> usize {
    crate::kernel::DEFAULT_WORKERS
}

/// Construction parameters of a [`PqTableBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PqTableConfig {
    pub dim: usize,
    pub sub_quantizers: usize,
    /// Entries per sub-codebook.
    pub centroids: usize,
    /// Probe slots per query.
    pub nprobe: usize,
    /// Number of coarse centroids (inverted lists).
    pub lists: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl PqTableConfig {
    pub fn sub_dim(&self) -> usize {
        self.dim / self.sub_quantizers
    }

    fn validate(&self) -> Result<Regime, ConfigError> {
        check_nonzero("dimension", self.dim)?;
        check_nonzero("sub-quantizers", self.sub_quantizers)?;
        if self.dim % self.sub_quantizers != 0 {
            return Err(ConfigError::SubQuantizers {
                dim: self.dim,
                sub_quantizers: self.sub_quantizers,
            });
        }
        check_nonzero("pq centroids", self.centroids)?;
        check_nonzero("nprobe", self.nprobe)?;
        check_aligned("nprobe", self.nprobe, NPROBE_ALIGNMENT)?;
        check_nonzero("lists", self.lists)?;

        let sub_dim = self.sub_dim();
        if sub_dim > MAX_SUB_DIM {
            return Err(ConfigError::TooLarge {
                what: "sub dimension",
                value: sub_dim,
                max: MAX_SUB_DIM,
            });
        }
        Regime::for_sub_dim(sub_dim).ok_or(ConfigError::SubDim(sub_dim))
    }
}

/// How the entries of one sub-codebook are scored.
///
/// Every regime scores eight entries per vector, one entry per lane, and accumulates each
/// entry's squared differences in dimension order starting from zero, so all of them
/// produce identical bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regime {
    /// Four values per entry, unrolled.
    Four,
    /// Eight values per entry, unrolled.
    Eight,
    /// Dimension-major accumulation over any multiple of 16.
    Wide,
}

/// Entries scored together.
const ENTRY_GROUP: usize = 8;

impl Regime {
    fn for_sub_dim(sub_dim: usize) -> Option<Self> {
        match sub_dim {
            4 => Some(Self::Four),
            8 => Some(Self::Eight),
            d if d % LANES == 0 => Some(Self::Wide),
            _ => None,
        }
    }

    /// Score `residual` against every `residual.len()`-wide entry of `codebook`.
    fn score(self, residual: &[f32], codebook: &[f32], out: &mut [f16]) {
        let sub_dim = residual.len();
        let mut groups = codebook.chunks_exact(ENTRY_GROUP * sub_dim);
        let mut outs = out.chunks_exact_mut(ENTRY_GROUP);
        for (entries, dst) in (&mut groups).zip(&mut outs) {
            let distances = match self {
                Self::Four => unrolled::<4>(residual, entries),
                Self::Eight => unrolled::<8>(residual, entries),
                Self::Wide => arith::squared_l2_x8(residual, entries),
            };
            dst.iter_mut()
                .zip(distances.to_array())
                .for_each(|(o, d)| *o = arith::narrow(d));
        }

        for (o, entry) in outs
            .into_remainder()
            .iter_mut()
            .zip(groups.remainder().chunks_exact(sub_dim))
        {
            *o = arith::narrow(arith::squared_l2_sequential(residual, entry));
        }
    }
}

#[inline]
fn unrolled<const N: usize>(residual: &[f32], entries: &[f32]) -> f32x8 {
    debug_assert_eq!(residual.len(), N);
    let mut acc = f32x8::ZERO;
    for d in 0..N {
        let column = f32x8::new(std::array::from_fn(|k| entries[k * N + d]));
        let diff = f32x8::splat(residual[d]) - column;
        acc += diff * diff;
    }
    acc
}

/// Builds [`PqTable`]s for batches of queries.
#[derive(Debug)]
pub struct PqTableBuilder {
    config: PqTableConfig,
    regime: Regime,
    pool: Arc<WorkerPool>,
}

impl PqTableBuilder {
    pub fn new(config: PqTableConfig) -> KernelResult<Self> {
        let regime = config.validate()?;
        let pool = create_worker_pool(config.workers)?;
        Ok(Self::assemble(config, regime, pool))
    }

    pub fn with_pool(mut config: PqTableConfig, pool: Arc<WorkerPool>) -> KernelResult<Self> {
        config.workers = pool.workers();
        let regime = config.validate()?;
        Ok(Self::assemble(config, regime, pool))
    }

    fn assemble(config: PqTableConfig, regime: Regime, pool: Arc<WorkerPool>) -> Self {
        tracing::info!(
            dim = config.dim,
            sub_quantizers = config.sub_quantizers,
            centroids = config.centroids,
            nprobe = config.nprobe,
            regime = ?regime,
            "pq table builder ready"
        );
        Self {
            config,
            regime,
            pool,
        }
    }

    pub fn config(&self) -> &PqTableConfig {
        &self.config
    }

    /// Build the distance tables of `queries`.
    ///
    /// * `codebook`: `[sub_quantizers, centroids * sub_dim]`.
    /// * `lists`: `[nqueries, nprobe]` assigned list ids. [`UNUSED_LIST`] marks slots that
    ///   must form a suffix of each row; their tables are zero-filled.
    /// * `coarse`: `[lists, dim]` coarse centroids.
    pub fn build(
        &self,
        queries: MatrixView<'_, f16>,
        codebook: MatrixView<'_, f16>,
        lists: MatrixView<'_, i32>,
        coarse: MatrixView<'_, f16>,
    ) -> KernelResult<PqTable> {
        self.build_with(self.regime, queries, codebook, lists, coarse)
    }

    fn build_with(
        &self,
        regime: Regime,
        queries: MatrixView<'_, f16>,
        codebook: MatrixView<'_, f16>,
        lists: MatrixView<'_, i32>,
        coarse: MatrixView<'_, f16>,
    ) -> KernelResult<PqTable> {
        let c = &self.config;
        let nqueries = queries.nrows();
        check_shape("queries", "columns", queries.ncols(), c.dim)?;
        check_shape("codebook", "rows", codebook.nrows(), c.sub_quantizers)?;
        check_shape("codebook", "columns", codebook.ncols(), c.centroids * c.sub_dim())?;
        check_shape("list ids", "rows", lists.nrows(), nqueries)?;
        check_shape("list ids", "columns", lists.ncols(), c.nprobe)?;
        check_shape("coarse centroids", "rows", coarse.nrows(), c.lists)?;
        check_shape("coarse centroids", "columns", coarse.ncols(), c.dim)?;
        check_list_ids(lists, c.lists)?;

        let codebook = codebook.map(|v| v.to_f32());
        let slot_len = c.sub_quantizers * c.centroids;
        let mut data = vec![f16::ZERO; nqueries * c.nprobe * slot_len];

        let sub_dim = c.sub_dim();
        let entry_len = c.centroids * sub_dim;
        data.par_chunks_mut(slot_len.max(1))
            .enumerate()
            .for_each_in_pool(&self.pool, |(slot, out)| {
                let (q, p) = (slot / c.nprobe, slot % c.nprobe);
                let Ok(list) = usize::try_from(lists[(q, p)]) else {
                    return;
                };
                let residual: Vec<f32> = queries
                    .row(q)
                    .iter()
                    .zip(coarse.row(list))
                    .map(|(x, y)| x.to_f32() - y.to_f32())
                    .collect();
                for (m, out) in out.chunks_exact_mut(c.centroids).enumerate() {
                    regime.score(
                        &residual[m * sub_dim..(m + 1) * sub_dim],
                        &codebook.row(m)[..entry_len],
                        out,
                    );
                }
            });

        Ok(PqTable {
            data,
            nqueries,
            nprobe: c.nprobe,
            sub_quantizers: c.sub_quantizers,
            centroids: c.centroids,
        })
    }
}

fn check_shape(
    what: &'static str,
    axis: &'static str,
    got: usize,
    expected: usize,
) -> Result<(), InvocationError> {
    if got == expected {
        Ok(())
    } else {
        Err(InvocationError::Shape {
            what,
            axis,
            got,
            expected,
        })
    }
}

fn check_list_ids(lists: MatrixView<'_, i32>, nlists: usize) -> Result<(), InvocationError> {
    for (query, row) in lists.row_iter().enumerate() {
        let mut unused = false;
        for (probe, &id) in row.iter().enumerate() {
            if id == UNUSED_LIST {
                unused = true;
            } else if unused {
                return Err(InvocationError::ListGap { query, probe });
            } else if usize::try_from(id).map_or(true, |id| id >= nlists) {
                return Err(InvocationError::ListId {
                    id,
                    query,
                    probe,
                    nlists,
                });
            }
        }
    }
    Ok(())
}

/// Distance tables `[nqueries, nprobe, sub_quantizers, centroids]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PqTable {
    data: Vec<f16>,
    nqueries: usize,
    nprobe: usize,
    sub_quantizers: usize,
    centroids: usize,
}

impl PqTable {
    pub fn shape(&self) -> [usize; 4] {
        [self.nqueries, self.nprobe, self.sub_quantizers, self.centroids]
    }

    pub fn as_slice(&self) -> &[f16] {
        &self.data
    }

    /// The `centroids` distances of sub-quantizer `m` for probe slot `p` of query `q`.
    pub fn get(&self, q: usize, p: usize, m: usize) -> &[f16] {
        let start = ((q * self.nprobe + p) * self.sub_quantizers + m) * self.centroids;
        &self.data[start..start + self.centroids]
    }

    /// Gather the table entries addressed by one PQ code into `out`, one per
    /// sub-quantizer. This is a row of the input to
    /// [`DistAccum`](crate::accum::DistAccum). Entries of `out` past `codes.len()` are
    /// zeroed so rows can be padded to a multiple of 16.
    ///
    /// # Panics
    ///
    /// Panics if `codes.len()` differs from the sub-quantizer count, if `out` is shorter
    /// than it, or if a code is not below the centroid count.
    pub fn lookups(&self, q: usize, p: usize, codes: &[u8], out: &mut [f16]) {
        assert_eq!(codes.len(), self.sub_quantizers, "one code per sub-quantizer");
        let (head, tail) = out.split_at_mut(codes.len());
        for (m, (o, &code)) in head.iter_mut().zip(codes).enumerate() {
            *o = self.get(q, p, m)[usize::from(code)];
        }
        tail.fill(f16::ZERO);
    }

    /// Unpack into a `[nqueries * nprobe * sub_quantizers, centroids]` matrix.
    pub fn to_matrix(&self) -> Matrix<f16> {
        Matrix::from_fn(
            self.nqueries * self.nprobe * self.sub_quantizers,
            self.centroids,
            |r, k| self.data[r * self.centroids + k],
        )
    }
}
