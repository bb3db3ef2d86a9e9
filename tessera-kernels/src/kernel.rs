/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The distance kernel: construction-time validation and planning, and the tile executor
//! that drives a strategy's operands over every worker partition.
//!
//! Within a worker, code sub-tiles form the outer loop. While the compute stage scores
//! sub-tile `i` against every query tile, the load stage fills the back staging buffer
//! with sub-tile `i + 1`. The two stages run under [`rayon::join`] and the buffers swap
//! when both finish.

use std::{ops::Range, sync::Arc};

use half::f16;
use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use tessera_utils::{Matrix, MatrixView};

use crate::{
    actual::ValidityMask,
    arith,
    error::{ConfigError, InvocationError, KernelResult},
    metric::{Encoding, Metric, Profile},
    num::{check_aligned, check_nonzero, BlockSize, LANES},
    plan::{partition, ScratchCapacity, TilePlan, WorkerPartition},
    pool::{create_worker_pool, ParallelIteratorInPool, WorkerPool},
    reduce::{apply_mask, reduce_row, sentinel, BlockWinners, Winner},
    scratch::Scratch,
    strategy::{Expected, FloatOperands, Inputs, Int8Operands, Operands, Sq8Operands, Strategy},
};

/// Query rows per tile unless overridden.
pub const DEFAULT_QUERY_TILE: usize = 48;

/// Worker count unless overridden.
pub const DEFAULT_WORKERS: usize = 2;

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

/// Construction parameters of a [`DistanceKernel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    pub metric: Metric,
    pub encoding: Encoding,
    #[serde(default)]
    pub profile: Profile,
    /// Vector dimension. A multiple of 16.
    pub dim: usize,
    /// Number of code slots in the code set.
    pub capacity: usize,
    /// Overrides the profile's block size.
    #[serde(default)]
    pub block: Option<BlockSize>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub query_tile: Option<usize>,
    #[serde(default)]
    pub scratch: ScratchCapacity,
}

impl KernelConfig {
    pub fn new(
        metric: Metric,
        encoding: Encoding,
        profile: Profile,
        dim: usize,
        capacity: usize,
    ) -> Self {
        Self {
            metric,
            encoding,
            profile,
            dim,
            capacity,
            block: None,
            workers: DEFAULT_WORKERS,
            query_tile: None,
            scratch: ScratchCapacity::default(),
        }
    }

    pub fn with_block(mut self, block: BlockSize) -> Self {
        self.block = Some(block);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_query_tile(mut self, query_tile: usize) -> Self {
        self.query_tile = Some(query_tile);
        self
    }

    pub fn with_scratch(mut self, scratch: ScratchCapacity) -> Self {
        self.scratch = scratch;
        self
    }

    /// The reduction block size, or `None` if the profile only produces distances.
    ///
    /// An override is ignored by [`Profile::IvfCoarse`].
    pub fn block_size(&self) -> Option<BlockSize> {
        match self.profile {
            Profile::IvfCoarse => None,
            Profile::Flat => Some(self.block.unwrap_or(BlockSize::B64)),
            Profile::IvfList => Some(self.block.unwrap_or(match self.encoding {
                Encoding::F16 => BlockSize::B64,
                Encoding::Int8 => BlockSize::B32,
                Encoding::Sq8 if self.dim < 256 => BlockSize::B32,
                Encoding::Sq8 => BlockSize::B16,
            })),
        }
    }

    /// The granule the code capacity must be a multiple of.
    pub fn code_alignment(&self) -> usize {
        match (self.profile, self.encoding) {
            (Profile::IvfCoarse, Encoding::Int8) => 2 * LANES,
            _ => LANES,
        }
    }
}

/// A configured distance kernel. Construction validates the configuration and plans the
/// tiles. [`DistanceKernel::run`] may then be called any number of times.
#[derive(Debug)]
pub struct DistanceKernel {
    config: KernelConfig,
    strategy: Strategy,
    block: Option<BlockSize>,
    plan: TilePlan,
    pool: Arc<WorkerPool>,
}

impl DistanceKernel {
    /// Validate `config` and create a kernel with its own worker pool.
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        let (strategy, block, plan) = Self::validate(&config)?;
        let pool = create_worker_pool(config.workers)?;
        Ok(Self::assemble(config, strategy, block, plan, pool))
    }

    /// Validate `config` and create a kernel that runs on `pool`. The pool's size
    /// replaces the configured worker count.
    pub fn with_pool(mut config: KernelConfig, pool: Arc<WorkerPool>) -> KernelResult<Self> {
        config.workers = pool.workers();
        let (strategy, block, plan) = Self::validate(&config)?;
        Ok(Self::assemble(config, strategy, block, plan, pool))
    }

    fn validate(
        config: &KernelConfig,
    ) -> Result<(Strategy, Option<BlockSize>, TilePlan), ConfigError> {
        let strategy = Strategy::select(config.metric, config.encoding)?;
        check_nonzero("dimension", config.dim)?;
        check_aligned("dimension", config.dim, LANES)?;
        check_nonzero("code capacity", config.capacity)?;
        check_aligned("code capacity", config.capacity, config.code_alignment())?;
        check_nonzero("workers", config.workers)?;

        if config.profile == Profile::IvfCoarse && config.block.is_some() {
            tracing::warn!("block size override has no effect on coarse scoring kernels");
        }
        let block = config.block_size();
        let align = block.map_or(config.code_alignment(), BlockSize::get);
        let plan = TilePlan::new(
            config.scratch,
            config.query_tile.unwrap_or(DEFAULT_QUERY_TILE),
            config.dim,
            strategy.staged_width(),
            align,
        )?;
        Ok((strategy, block, plan))
    }

    fn assemble(
        config: KernelConfig,
        strategy: Strategy,
        block: Option<BlockSize>,
        plan: TilePlan,
        pool: Arc<WorkerPool>,
    ) -> Self {
        tracing::info!(
            metric = %config.metric,
            encoding = %config.encoding,
            profile = %config.profile,
            dim = config.dim,
            capacity = config.capacity,
            block = block.map(BlockSize::get),
            workers = pool.workers(),
            query_tile = plan.query_tile,
            code_tile = plan.code_tile,
            "distance kernel ready"
        );
        Self {
            config,
            strategy,
            block,
            plan,
            pool,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn block(&self) -> Option<BlockSize> {
        self.block
    }

    pub fn plan(&self) -> &TilePlan {
        &self.plan
    }

    /// Score every query against the first `inputs.actual.count` codes.
    ///
    /// All operand checks run before any output is allocated. On success the returned
    /// [`KernelOutput`] is complete: there is no partially written state to observe.
    pub fn run(&self, inputs: &Inputs<'_>) -> KernelResult<KernelOutput> {
        let actual = inputs.actual.count();
        if actual > self.config.capacity {
            return Err(InvocationError::ActualCount {
                actual,
                capacity: self.config.capacity,
            }
            .into());
        }
        let mask = ValidityMask::bind(inputs.mask, &inputs.actual, inputs.queries.nqueries())?;

        let expected = Expected {
            strategy: self.strategy,
            dim: self.config.dim,
            capacity: self.config.capacity,
        };
        let output = match self.strategy {
            Strategy::FloatL2 | Strategy::FloatInnerProduct | Strategy::FloatCosine => {
                self.execute(&FloatOperands::bind(&expected, inputs)?, actual, mask)
            }
            Strategy::Sq8L2 | Strategy::Sq8InnerProduct => {
                self.execute(&Sq8Operands::bind(&expected, inputs)?, actual, mask)
            }
            Strategy::Int8L2 | Strategy::Int8Cosine => {
                self.execute(&Int8Operands::bind(&expected, inputs)?, actual, mask)
            }
        };
        Ok(output)
    }

    fn execute<O: Operands>(
        &self,
        ops: &O,
        actual: usize,
        mask: Option<ValidityMask<'_>>,
    ) -> KernelOutput {
        let nqueries = ops.nqueries();
        let extremum = self.strategy.extremum();
        let partitions = partition(actual, self.pool.workers(), self.plan.align);

        let results: Vec<PartitionOutput> = partitions
            .par_iter()
            .map(|part| self.run_partition(ops, part, mask.as_ref()))
            .collect_in_pool(&self.pool);

        let capacity = self.config.capacity;
        let mut distances = Matrix::new(sentinel(extremum), nqueries, capacity);
        let mut winners = self
            .block
            .map(|b| BlockWinners::new(nqueries, capacity, b, extremum));

        for (part, result) in partitions.iter().zip(&results) {
            for q in 0..nqueries {
                distances.row_mut(q)[part.codes.clone()].copy_from_slice(result.distances.row(q));
                if let (Some(all), Some(local)) = (winners.as_mut(), result.winners.as_ref()) {
                    let first = part.codes.start / all.block().get();
                    all.row_mut(q)[first..first + local.ncols()].copy_from_slice(local.row(q));
                }
            }
        }

        KernelOutput {
            distances,
            winners,
            partitions,
        }
    }

    fn run_partition<O: Operands>(
        &self,
        ops: &O,
        part: &WorkerPartition,
        mask: Option<&ValidityMask<'_>>,
    ) -> PartitionOutput {
        let _span = tracing::debug_span!("partition", worker = part.worker, codes = ?part.codes)
            .entered();

        let nqueries = ops.nqueries();
        let extremum = self.strategy.extremum();
        let mut out = PartitionOutput {
            distances: Matrix::new(sentinel(extremum), nqueries, part.codes.len()),
            winners: self.block.map(|b| {
                Matrix::new(Winner::sentinel(extremum), nqueries, b.blocks(part.codes.len()))
            }),
        };

        let mut tiles = self.plan.sub_tiles(part.codes.clone()).peekable();
        let Some(first) = tiles.peek().cloned() else {
            return out;
        };

        let mut scratch = Scratch::<O::Staged>::new(&self.plan, self.config.dim);
        ops.load(first, &mut scratch.staging.front_mut().as_mut_view());

        while let Some(tile) = tiles.next() {
            let next = tiles.peek().cloned();
            let (staged, back, accumulator) = scratch.stages(tile.len());
            let stage = Stage {
                tile,
                partition_start: part.codes.start,
                mask,
            };
            rayon::join(
                || self.compute(ops, &stage, staged, accumulator, &mut out),
                || {
                    if let Some(next) = next {
                        ops.load(next, &mut back.as_mut_view());
                    }
                },
            );
            scratch.staging.swap();
        }
        out
    }

    /// Score one staged sub-tile against all queries, then narrow, mask and reduce.
    fn compute<O: Operands>(
        &self,
        ops: &O,
        stage: &Stage<'_, '_>,
        staged: MatrixView<'_, O::Staged>,
        accumulator: &mut Matrix<f32>,
        out: &mut PartitionOutput,
    ) {
        let tile = &stage.tile;
        tracing::trace!(codes = ?tile, "computing sub-tile");

        let extremum = self.strategy.extremum();
        let local = tile.start - stage.partition_start;
        for queries in self.plan.query_tiles(ops.nqueries()) {
            let mut acc = accumulator.reshape_prefix_mut(queries.len(), tile.len());
            ops.distance(queries.clone(), tile.clone(), staged, &mut acc);

            for (i, q) in queries.enumerate() {
                let row = &mut out.distances.row_mut(q)[local..local + tile.len()];
                row.iter_mut()
                    .zip(acc.row(i))
                    .for_each(|(o, &v)| *o = arith::narrow(v));
                if let Some(mask) = stage.mask {
                    apply_mask(row, q, tile.start, mask, extremum);
                }
                if let (Some(block), Some(winners)) = (self.block, out.winners.as_mut()) {
                    let b = block.get();
                    reduce_row(row, b, extremum, &mut winners.row_mut(q)[local / b..]);
                }
            }
        }
    }
}

struct Stage<'a, 'b> {
    tile: Range<usize>,
    partition_start: usize,
    mask: Option<&'a ValidityMask<'b>>,
}

#[derive(Debug)]
struct PartitionOutput {
    distances: Matrix<f16>,
    winners: Option<Matrix<Winner>>,
}

/// The complete result of one [`DistanceKernel::run`].
#[derive(Debug, Clone)]
pub struct KernelOutput {
    distances: Matrix<f16>,
    winners: Option<BlockWinners>,
    partitions: Vec<WorkerPartition>,
}

impl KernelOutput {
    /// Distances `[nqueries, capacity]`. Entries that were masked or lie beyond the
    /// actual count hold the reduction sentinel.
    pub fn distances(&self) -> &Matrix<f16> {
        &self.distances
    }

    /// Per-block winners, or `None` for kernels without a reduction.
    pub fn winners(&self) -> Option<&BlockWinners> {
        self.winners.as_ref()
    }

    /// The code range each worker processed.
    pub fn partitions(&self) -> &[WorkerPartition] {
        &self.partitions
    }

    /// The legacy completion flag array: 16 `u16` per worker with a 1 at `16·w` for each
    /// finished worker `w`.
    pub fn completion_flags(&self) -> Vec<u16> {
        let mut flags = vec![0u16; LANES * self.partitions.len()];
        for part in &self.partitions {
            flags[LANES * part.worker] = 1;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};
    use rstest::rstest;

    use super::*;
    use crate::{
        actual::ActualNum,
        error::KernelError,
        layout::ZzCodes,
        metric::Extremum,
        norms::{self, Sq8Quantizer},
        strategy::{CodeNorms, CodeSet, QuerySet},
        test_util::{cosine, inner_product, random_f16, random_i8, squared_l2, widen_row},
    };

    struct FloatCase {
        queries: Matrix<f16>,
        codes: Matrix<f16>,
        packed: ZzCodes<f16>,
        norms: Vec<f32>,
        inverse: Vec<f16>,
    }

    fn float_case(nqueries: usize, capacity: usize, dim: usize, seed: u64) -> FloatCase {
        let mut rng = StdRng::seed_from_u64(seed);
        let queries = random_f16(nqueries, dim, &mut rng);
        let codes = random_f16(capacity, dim, &mut rng);
        let pool = create_worker_pool(1).unwrap();
        FloatCase {
            packed: ZzCodes::pack(codes.as_view()).unwrap(),
            norms: norms::square_norms_f16(&pool, codes.as_view()),
            inverse: norms::inverse_magnitudes_f16(&pool, codes.as_view()),
            queries,
            codes,
        }
    }

    impl FloatCase {
        fn inputs(&self, metric: Metric, actual: ActualNum) -> Inputs<'_> {
            let inputs = Inputs::new(
                QuerySet::F16(self.queries.as_view()),
                CodeSet::F16(self.packed.as_view()),
                actual,
            );
            match metric {
                Metric::L2 => inputs.with_code_norms(CodeNorms::Squared(&self.norms)),
                Metric::Cosine => inputs.with_code_norms(CodeNorms::Magnitudes(&self.inverse)),
                Metric::InnerProduct => inputs,
            }
        }
    }

    fn pick(extremum: Extremum, incumbent: (f16, usize), candidate: (f16, usize)) -> (f16, usize) {
        if extremum.beats(candidate.0.to_f32(), incumbent.0.to_f32()) {
            candidate
        } else {
            incumbent
        }
    }

    fn check_winners(output: &KernelOutput, actual: usize) {
        let winners = output.winners().unwrap();
        let b = winners.block().get();
        for q in 0..output.distances().nrows() {
            let row = output.distances().row(q);
            for block in 0..winners.nblocks() {
                let start = block * b;
                let end = ((block + 1) * b).min(row.len());
                let expected = (start..end)
                    .filter(|&c| c < actual && row[c] != sentinel(winners.extremum()))
                    .fold(None, |best: Option<(f16, usize)>, c| match best {
                        None => Some((row[c], c)),
                        Some(inc) => Some(pick(winners.extremum(), inc, (row[c], c))),
                    });
                assert_eq!(winners.get(q, block), expected, "query {q}, block {block}");
            }
        }
    }

    #[rstest]
    fn float_kernels_match_reference(
        #[values(Metric::L2, Metric::InnerProduct, Metric::Cosine)] metric: Metric,
        #[values(1, 3)] workers: usize,
    ) {
        let (nq, capacity, dim) = (5, 320, 32);
        let case = float_case(nq, capacity, dim, 0xf1a7);
        let config =
            KernelConfig::new(metric, Encoding::F16, Profile::Flat, dim, capacity).with_workers(workers);
        let kernel = DistanceKernel::new(config).unwrap();
        let output = kernel
            .run(&case.inputs(metric, ActualNum::unmasked(capacity as u32)))
            .unwrap();

        assert_eq!(output.distances().shape(), (nq, capacity));
        for q in 0..nq {
            let x = widen_row(case.queries.row(q));
            for c in 0..capacity {
                let y = widen_row(case.codes.row(c));
                let expected = match metric {
                    Metric::L2 => squared_l2(&x, &y),
                    Metric::InnerProduct => inner_product(&x, &y),
                    Metric::Cosine => cosine(&x, &y),
                };
                assert_relative_eq!(
                    output.distances()[(q, c)].to_f32(),
                    expected,
                    epsilon = 2e-2,
                    max_relative = 5e-3
                );
            }
        }
        check_winners(&output, capacity);
    }

    #[test]
    fn results_do_not_depend_on_tiling_or_workers() {
        let (nq, capacity, dim) = (50, 1024, 64);
        let case = float_case(nq, capacity, dim, 7);
        let inputs = case.inputs(Metric::L2, ActualNum::unmasked(1000));

        let wide = DistanceKernel::new(
            KernelConfig::new(Metric::L2, Encoding::F16, Profile::Flat, dim, capacity).with_workers(1),
        )
        .unwrap();
        let narrow = DistanceKernel::new(
            KernelConfig::new(Metric::L2, Encoding::F16, Profile::Flat, dim, capacity)
                .with_workers(3)
                .with_query_tile(7)
                .with_scratch(ScratchCapacity {
                    accumulator_bytes: 7 * 128 * 4,
                    staging_bytes: 1 << 20,
                }),
        )
        .unwrap();
        assert_eq!(narrow.plan().code_tile, 128);

        let a = wide.run(&inputs).unwrap();
        let b = narrow.run(&inputs).unwrap();
        assert_eq!(a.distances(), b.distances());
        assert_eq!(a.winners(), b.winners());
        assert_eq!(b.partitions().len(), 3);
    }

    #[test]
    fn tail_codes_are_sentinels() {
        let (nq, capacity, dim) = (2, 128, 16);
        let case = float_case(nq, capacity, dim, 11);
        let kernel = DistanceKernel::new(KernelConfig::new(
            Metric::InnerProduct,
            Encoding::F16,
            Profile::Flat,
            dim,
            capacity,
        ))
        .unwrap();
        let output = kernel
            .run(&case.inputs(Metric::InnerProduct, ActualNum::unmasked(100)))
            .unwrap();

        for q in 0..nq {
            assert!(output.distances().row(q)[100..]
                .iter()
                .all(|&v| v == f16::NEG_INFINITY));
            let (_, index) = output.winners().unwrap().get(q, 1).unwrap();
            assert!((64..100).contains(&index));
        }
        check_winners(&output, 100);
    }

    #[test]
    fn empty_actual_reports_no_winners() {
        let case = float_case(3, 64, 16, 12);
        let kernel = DistanceKernel::new(KernelConfig::new(
            Metric::L2,
            Encoding::F16,
            Profile::Flat,
            16,
            64,
        ))
        .unwrap();
        let output = kernel.run(&case.inputs(Metric::L2, ActualNum::unmasked(0))).unwrap();
        let winners = output.winners().unwrap();
        assert!((0..3).all(|q| winners.best(q).is_none()));
        assert_eq!(output.completion_flags(), {
            let mut f = vec![0u16; 32];
            f[0] = 1;
            f[16] = 1;
            f
        });
    }

    #[test]
    fn masked_codes_never_win() {
        let (nq, capacity, dim) = (3, 128, 16);
        let case = float_case(nq, capacity, dim, 13);
        let config = KernelConfig::new(Metric::L2, Encoding::F16, Profile::Flat, dim, capacity);
        let kernel = DistanceKernel::new(config).unwrap();

        // Find each query's unmasked winner, then mask it out.
        let plain = kernel
            .run(&case.inputs(Metric::L2, ActualNum::unmasked(capacity as u32)))
            .unwrap();
        let offset = 3;
        let mask_len = (offset + capacity).div_ceil(8);
        let mut bits = vec![0xffu8; nq * mask_len];
        let mut removed = Vec::new();
        for q in 0..nq {
            let (_, best) = plain.winners().unwrap().best(q).unwrap();
            let bit = offset + best;
            bits[q * mask_len + bit / 8] &= !(1 << (bit % 8));
            removed.push(best);
        }

        let actual = ActualNum::masked(capacity as u32, offset as u32, mask_len as u32);
        let masked = kernel
            .run(&case.inputs(Metric::L2, actual).with_mask(&bits))
            .unwrap();
        for (q, &r) in removed.iter().enumerate() {
            assert_eq!(masked.distances()[(q, r)], f16::INFINITY);
            let (_, best) = masked.winners().unwrap().best(q).unwrap();
            assert_ne!(best, r);
        }
        check_winners(&masked, capacity);

        // A mask buffer that cannot cover every query is rejected.
        let err = kernel
            .run(&case.inputs(Metric::L2, actual).with_mask(&bits[..mask_len]))
            .unwrap_err();
        assert!(matches!(err, KernelError::Invocation(InvocationError::Mask { .. })));
    }

    #[rstest]
    fn int8_kernels_match_reference(#[values(Metric::L2, Metric::Cosine)] metric: Metric) {
        let (nq, capacity, dim) = (4, 96, 64);
        let mut rng = StdRng::seed_from_u64(0x1a8);
        let queries = random_i8(nq, dim, &mut rng);
        let codes = random_i8(capacity, dim, &mut rng);
        let packed = ZzCodes::pack(codes.as_view()).unwrap();
        let pool = create_worker_pool(2).unwrap();
        let code_norms = norms::int8_square_norms(&pool, codes.as_view());
        let code_mags = norms::int8_magnitudes(&pool, codes.as_view());

        let config = KernelConfig::new(metric, Encoding::Int8, Profile::IvfList, dim, capacity);
        let kernel = DistanceKernel::with_pool(config, pool).unwrap();
        assert_eq!(kernel.block(), Some(BlockSize::B32));

        let inputs = Inputs::new(
            QuerySet::Int8(queries.as_view()),
            CodeSet::Int8(packed.as_view()),
            ActualNum::unmasked(capacity as u32),
        );
        let inputs = match metric {
            Metric::L2 => inputs.with_code_norms(CodeNorms::Int8Squared(&code_norms)),
            _ => inputs.with_code_norms(CodeNorms::Magnitudes(&code_mags)),
        };
        let output = kernel.run(&inputs).unwrap();

        let scale = crate::strategy::int8_l2_scale(dim);
        for q in 0..nq {
            let x: Vec<f32> = queries.row(q).iter().map(|&v| f32::from(v)).collect();
            for c in 0..capacity {
                let y: Vec<f32> = codes.row(c).iter().map(|&v| f32::from(v)).collect();
                let expected = match metric {
                    Metric::L2 => squared_l2(&x, &y) * scale,
                    _ => cosine(&x, &y),
                };
                assert_relative_eq!(
                    output.distances()[(q, c)].to_f32(),
                    expected,
                    epsilon = 1e-2,
                    max_relative = 5e-3
                );
            }
        }
        check_winners(&output, capacity);
    }

    #[test]
    fn int8_cosine_accepts_supplied_query_magnitudes() {
        let (nq, capacity, dim) = (3, 64, 32);
        let mut rng = StdRng::seed_from_u64(0x3a9);
        let queries = random_i8(nq, dim, &mut rng);
        let codes = random_i8(capacity, dim, &mut rng);
        let packed = ZzCodes::pack(codes.as_view()).unwrap();
        let pool = create_worker_pool(2).unwrap();
        let code_mags = norms::int8_magnitudes(&pool, codes.as_view());
        let query_mags = norms::int8_magnitudes(&pool, queries.as_view());

        let config = KernelConfig::new(Metric::Cosine, Encoding::Int8, Profile::IvfList, dim, capacity);
        let kernel = DistanceKernel::with_pool(config, pool).unwrap();
        let inputs = Inputs::new(
            QuerySet::Int8(queries.as_view()),
            CodeSet::Int8(packed.as_view()),
            ActualNum::unmasked(capacity as u32),
        )
        .with_code_norms(CodeNorms::Magnitudes(&code_mags));

        let computed = kernel.run(&inputs).unwrap();
        let supplied = kernel
            .run(&inputs.with_query_magnitudes(&query_mags))
            .unwrap();
        assert_eq!(supplied.distances(), computed.distances());
        assert_eq!(supplied.winners(), computed.winners());

        let err = kernel
            .run(&inputs.with_query_magnitudes(&query_mags[..2]))
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::Invocation(InvocationError::Shape {
                what: "query magnitudes",
                got: 2,
                expected: 3,
                ..
            })
        ));
    }

    #[rstest]
    fn sq8_kernels_match_dequantized_reference(
        #[values(Metric::L2, Metric::InnerProduct)] metric: Metric,
    ) {
        let (nq, capacity, dim) = (6, 80, 32);
        let mut rng = StdRng::seed_from_u64(0x5a8);
        let pool = create_worker_pool(2).unwrap();

        let diff: Vec<f16> = (0..dim).map(|d| f16::from_f32(1.0 + 0.05 * d as f32)).collect();
        let min: Vec<f16> = (0..dim).map(|d| f16::from_f32(-0.5 - 0.01 * d as f32)).collect();
        let quantizer = Sq8Quantizer::new(diff, min).unwrap();
        let raw = random_f16(capacity, dim, &mut rng).map(|v| v.to_f32() * 0.3);
        let codes = quantizer.quantize_all(&pool, raw.as_view());
        let packed = ZzCodes::pack(codes.as_view()).unwrap();
        let code_norms = quantizer.square_norms(&pool, codes.as_view());
        let queries = random_f16(nq, dim, &mut rng);

        let config = KernelConfig::new(metric, Encoding::Sq8, Profile::IvfList, dim, capacity);
        let kernel = DistanceKernel::with_pool(config, pool).unwrap();
        let mut inputs = Inputs::new(
            QuerySet::F16(queries.as_view()),
            CodeSet::Sq8(packed.as_view()),
            ActualNum::unmasked(capacity as u32),
        )
        .with_sq8(&quantizer);
        if metric == Metric::L2 {
            inputs = inputs.with_code_norms(CodeNorms::Squared(&code_norms));
        }
        let output = kernel.run(&inputs).unwrap();

        let mut y = vec![0.0f32; dim];
        for q in 0..nq {
            let x = widen_row(queries.row(q));
            for c in 0..capacity {
                quantizer.dequantize(codes.row(c), &mut y);
                let expected = match metric {
                    Metric::L2 => squared_l2(&x, &y),
                    _ => inner_product(&x, &y),
                };
                assert_relative_eq!(
                    output.distances()[(q, c)].to_f32(),
                    expected,
                    epsilon = 5e-2,
                    max_relative = 5e-3
                );
            }
        }
        check_winners(&output, capacity);
    }

    #[test]
    fn coarse_profile_only_produces_distances() {
        let (capacity, dim) = (64, 32);
        let mut rng = StdRng::seed_from_u64(21);
        let queries = random_i8(2, dim, &mut rng);
        let codes = random_i8(capacity, dim, &mut rng);
        let packed = ZzCodes::pack(codes.as_view()).unwrap();
        let pool = create_worker_pool(2).unwrap();
        let mags = norms::int8_magnitudes(&pool, codes.as_view());

        let config =
            KernelConfig::new(Metric::Cosine, Encoding::Int8, Profile::IvfCoarse, dim, capacity);
        let kernel = DistanceKernel::with_pool(config, pool).unwrap();
        let output = kernel
            .run(
                &Inputs::new(
                    QuerySet::Int8(queries.as_view()),
                    CodeSet::Int8(packed.as_view()),
                    ActualNum::unmasked(capacity as u32),
                )
                .with_code_norms(CodeNorms::Magnitudes(&mags)),
            )
            .unwrap();
        assert!(output.winners().is_none());
        assert!(output.distances().as_slice().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn single_query_l2_scenario() {
        let case = float_case(1, 32, 16, 0x5eed);
        let kernel = DistanceKernel::new(
            KernelConfig::new(Metric::L2, Encoding::F16, Profile::Flat, 16, 32).with_workers(1),
        )
        .unwrap();
        let output = kernel
            .run(&case.inputs(Metric::L2, ActualNum::unmasked(32)))
            .unwrap();

        let x = widen_row(case.queries.row(0));
        let mut expected = Vec::new();
        for c in 0..32 {
            let y = widen_row(case.codes.row(c));
            let mut sum = 0.0f32;
            for d in 0..16 {
                sum += (x[d] - y[d]) * (x[d] - y[d]);
            }
            expected.push(sum);
        }
        let row = output.distances().row(0);
        for (got, want) in row.iter().zip(&expected) {
            assert_relative_eq!(got.to_f32(), *want, epsilon = 1e-3, max_relative = 1e-3);
        }

        let (value, index) = output.winners().unwrap().best(0).unwrap();
        let min = row.iter().map(|v| v.to_f32()).fold(f32::INFINITY, f32::min);
        assert_eq!(value.to_f32(), min);
        assert_eq!(row[index].to_f32(), min);
    }

    #[test]
    fn permuting_codes_permutes_columns() {
        let (nq, capacity, dim) = (3, 96, 32);
        let case = float_case(nq, capacity, dim, 0xbeef);
        let kernel = DistanceKernel::new(KernelConfig::new(
            Metric::InnerProduct,
            Encoding::F16,
            Profile::Flat,
            dim,
            capacity,
        ))
        .unwrap();
        let plain = kernel
            .run(&case.inputs(Metric::InnerProduct, ActualNum::unmasked(capacity as u32)))
            .unwrap();

        // Reverse blocks of 16 and rotate within each block.
        let perm: Vec<usize> = (0..capacity)
            .map(|c| (capacity / 16 - 1 - c / 16) * 16 + (c + 5) % 16)
            .collect();
        let shuffled = Matrix::from_fn(capacity, dim, |c, d| case.codes[(perm[c], d)]);
        let packed = ZzCodes::pack(shuffled.as_view()).unwrap();
        let output = kernel
            .run(&Inputs::new(
                QuerySet::F16(case.queries.as_view()),
                CodeSet::F16(packed.as_view()),
                ActualNum::unmasked(capacity as u32),
            ))
            .unwrap();

        for q in 0..nq {
            for (c, &p) in perm.iter().enumerate() {
                assert_eq!(output.distances()[(q, c)], plain.distances()[(q, p)]);
            }
        }
    }

    #[test]
    fn worker_count_does_not_change_outputs() {
        let (nq, capacity, dim) = (4, 512, 48);
        let case = float_case(nq, capacity, dim, 0x3c);
        let inputs = case.inputs(Metric::Cosine, ActualNum::unmasked(500));
        let run = |workers| {
            let config = KernelConfig::new(Metric::Cosine, Encoding::F16, Profile::Flat, dim, capacity)
                .with_workers(workers);
            DistanceKernel::new(config).unwrap().run(&inputs).unwrap()
        };

        let reference = run(1);
        for workers in [2, 4] {
            let output = run(workers);
            assert_eq!(output.distances(), reference.distances());
            assert_eq!(output.winners(), reference.winners());
            assert_eq!(output.partitions().len(), workers);
        }
    }

    #[test]
    fn configuration_errors() {
        let base = KernelConfig::new(Metric::L2, Encoding::F16, Profile::Flat, 32, 64);

        let err = DistanceKernel::new(KernelConfig { dim: 24, ..base.clone() }).unwrap_err();
        assert!(matches!(
            err,
            KernelError::Config(ConfigError::Misaligned { what: "dimension", .. })
        ));

        let err = DistanceKernel::new(KernelConfig {
            encoding: Encoding::Int8,
            metric: Metric::InnerProduct,
            ..base.clone()
        })
        .unwrap_err();
        assert!(matches!(err, KernelError::Config(ConfigError::Unsupported { .. })));

        // Coarse int8 kernels need a capacity aligned to 32.
        let err = DistanceKernel::new(KernelConfig {
            encoding: Encoding::Int8,
            profile: Profile::IvfCoarse,
            capacity: 48,
            ..base.clone()
        })
        .unwrap_err();
        assert!(matches!(
            err,
            KernelError::Config(ConfigError::Misaligned { alignment: 32, .. })
        ));

        let err = DistanceKernel::new(base.clone().with_workers(0)).unwrap_err();
        assert!(matches!(err, KernelError::Config(ConfigError::Zero { what: "workers" })));
    }

    #[test]
    fn invocation_errors_precede_work() {
        let case = float_case(2, 64, 32, 17);
        let kernel = DistanceKernel::new(KernelConfig::new(
            Metric::L2,
            Encoding::F16,
            Profile::Flat,
            32,
            64,
        ))
        .unwrap();

        let err = kernel
            .run(&case.inputs(Metric::L2, ActualNum::unmasked(65)))
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::Invocation(InvocationError::ActualCount { actual: 65, capacity: 64 })
        ));

        let inputs = case.inputs(Metric::InnerProduct, ActualNum::unmasked(64));
        let err = kernel.run(&inputs).unwrap_err();
        assert!(matches!(err, KernelError::Invocation(InvocationError::Missing { .. })));

        let short = &case.norms[..10];
        let err = kernel
            .run(&inputs.with_code_norms(CodeNorms::Squared(short)))
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::Invocation(InvocationError::Shape { got: 10, expected: 64, .. })
        ));

        let narrow = case.queries.map(|_| 0i8);
        let err = kernel
            .run(&Inputs {
                queries: QuerySet::Int8(narrow.as_view()),
                ..inputs
            })
            .unwrap_err();
        assert!(matches!(err, KernelError::Invocation(InvocationError::Encoding { .. })));
    }

    #[test]
    fn block_size_selection() {
        let cfg = |encoding, profile, dim| KernelConfig::new(Metric::L2, encoding, profile, dim, 64);
        assert_eq!(cfg(Encoding::F16, Profile::Flat, 32).block_size(), Some(BlockSize::B64));
        assert_eq!(cfg(Encoding::F16, Profile::IvfList, 32).block_size(), Some(BlockSize::B64));
        assert_eq!(cfg(Encoding::Int8, Profile::IvfList, 32).block_size(), Some(BlockSize::B32));
        assert_eq!(cfg(Encoding::Sq8, Profile::IvfList, 128).block_size(), Some(BlockSize::B32));
        assert_eq!(cfg(Encoding::Sq8, Profile::IvfList, 256).block_size(), Some(BlockSize::B16));
        assert_eq!(cfg(Encoding::Sq8, Profile::IvfCoarse, 256).block_size(), None);
        assert_eq!(
            cfg(Encoding::F16, Profile::Flat, 32)
                .with_block(BlockSize::B16)
                .block_size(),
            Some(BlockSize::B16)
        );
    }

    #[test]
    fn config_from_json_uses_defaults() {
        let config: KernelConfig = serde_json::from_str(
            r#"{"metric": "cosine", "encoding": "int8", "dim": 128, "capacity": 4096}"#,
        )
        .unwrap();
        assert_eq!(config.profile, Profile::Flat);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.block, None);
        assert_eq!(config.scratch, ScratchCapacity::default());

        let json = serde_json::to_string(&config.clone().with_block(BlockSize::B32)).unwrap();
        let back: KernelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.block, Some(BlockSize::B32));
    }
}
