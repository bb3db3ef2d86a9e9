/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Affine projection of half precision vectors: `y = x·W + b`.

use std::sync::Arc;

use half::f16;
use rayon::{iter::IndexedParallelIterator, slice::ParallelSliceMut};
use serde::{Deserialize, Serialize};
use tessera_utils::{Matrix, MatrixView};

use crate::{
    arith,
    error::{ConfigError, InvocationError, KernelResult},
    layout::PackedWeights,
    linalg::{sgemm, Transpose},
    num::{check_aligned, check_nonzero, LANES},
    pool::{create_worker_pool, ParallelIteratorInPool, WorkerPool},
};

/// Queries projected together.
pub const TRANSFORM_QUERY_TILE: usize = 32;

fn default_workers() -> usize {
    crate::kernel::DEFAULT_WORKERS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearTransformConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl LinearTransformConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_nonzero("input dimension", self.input_dim)?;
        check_aligned("input dimension", self.input_dim, LANES)?;
        check_nonzero("output dimension", self.output_dim)?;
        check_aligned("output dimension", self.output_dim, LANES)?;
        Ok(())
    }
}

/// A configured projection with its weights unpacked to `f32`.
#[derive(Debug)]
pub struct LinearTransform {
    config: LinearTransformConfig,
    /// `[input_dim, output_dim]`
    weights: Matrix<f32>,
    bias: Vec<f32>,
    pool: Arc<WorkerPool>,
}

impl LinearTransform {
    pub fn new(
        config: LinearTransformConfig,
        weights: &PackedWeights<f16>,
        bias: Vec<f32>,
    ) -> KernelResult<Self> {
        Self::validate(&config, weights, &bias)?;
        let pool = create_worker_pool(config.workers)?;
        Ok(Self::assemble(config, weights, bias, pool))
    }

    pub fn with_pool(
        mut config: LinearTransformConfig,
        weights: &PackedWeights<f16>,
        bias: Vec<f32>,
        pool: Arc<WorkerPool>,
    ) -> KernelResult<Self> {
        config.workers = pool.workers();
        Self::validate(&config, weights, &bias)?;
        Ok(Self::assemble(config, weights, bias, pool))
    }

    fn validate(
        config: &LinearTransformConfig,
        weights: &PackedWeights<f16>,
        bias: &[f32],
    ) -> Result<(), ConfigError> {
        config.validate()?;
        let length = |what, got, expected| {
            if got == expected {
                Ok(())
            } else {
                Err(ConfigError::Length {
                    what,
                    got,
                    expected,
                })
            }
        };
        length("weight rows", weights.input_dim(), config.input_dim)?;
        length("weight columns", weights.output_dim(), config.output_dim)?;
        length("bias", bias.len(), config.output_dim)
    }

    fn assemble(
        config: LinearTransformConfig,
        weights: &PackedWeights<f16>,
        bias: Vec<f32>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        tracing::info!(
            input_dim = config.input_dim,
            output_dim = config.output_dim,
            "linear transform ready"
        );
        Self {
            weights: weights.unpack_with(f16::to_f32),
            config,
            bias,
            pool,
        }
    }

    pub fn config(&self) -> &LinearTransformConfig {
        &self.config
    }

    /// Project every row of `queries`.
    pub fn apply(&self, queries: MatrixView<'_, f16>) -> KernelResult<Matrix<f16>> {
        let (input_dim, output_dim) = (self.config.input_dim, self.config.output_dim);
        if queries.ncols() != input_dim {
            return Err(InvocationError::Shape {
                what: "queries",
                axis: "columns",
                got: queries.ncols(),
                expected: input_dim,
            }
            .into());
        }

        let mut out = Matrix::new(f16::ZERO, queries.nrows(), output_dim);
        out.as_mut_slice()
            .par_chunks_mut(TRANSFORM_QUERY_TILE * output_dim)
            .enumerate()
            .for_each_in_pool(&self.pool, |(tile, dst)| {
                let first = tile * TRANSFORM_QUERY_TILE;
                let rows = dst.len() / output_dim;
                let x = queries.subrows(first..first + rows).map(|v| v.to_f32());
                let mut acc = Matrix::from_fn(rows, output_dim, |_, n| self.bias[n]);
                sgemm(
                    Transpose::None,
                    Transpose::None,
                    1.0,
                    x.as_view(),
                    self.weights.as_view(),
                    Some(1.0),
                    &mut acc.as_mut_view(),
                );
                dst.iter_mut()
                    .zip(acc.as_slice())
                    .for_each(|(o, &v)| *o = arith::narrow(v));
            });
        Ok(out)
    }
}
