/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Row sums of PQ lookup matrices.

use std::sync::Arc;

use half::f16;
use rayon::iter::ParallelIterator;
use serde::{Deserialize, Serialize};
use tessera_utils::MatrixView;

use crate::{
    arith,
    error::{ConfigError, InvocationError, KernelResult},
    num::{check_aligned, check_nonzero, LANES},
    pool::{create_worker_pool, ParallelIteratorInPool, WorkerPool},
};

/// The widest supported lookup row.
pub const MAX_LOOKUP_WIDTH: usize = 128;

/// Rows per invocation in the legacy kernel descriptor.
pub const DEFAULT_ACCUM_ROWS: usize = 2048;

fn default_workers() -> usize {
    crate::kernel::DEFAULT_WORKERS
}

fn default_rows() -> usize {
    DEFAULT_ACCUM_ROWS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistAccumConfig {
    /// Lookups per row: the sub-quantizer count rounded up to a multiple of 16.
    pub width: usize,
    #[serde(default = "default_rows")]
    pub rows: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl DistAccumConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_nonzero("lookup width", self.width)?;
        check_aligned("lookup width", self.width, LANES)?;
        if self.width > MAX_LOOKUP_WIDTH {
            return Err(ConfigError::TooLarge {
                what: "lookup width",
                value: self.width,
                max: MAX_LOOKUP_WIDTH,
            });
        }
        Ok(())
    }
}

/// Sums each row of a `[n, width]` lookup matrix into one half precision distance.
#[derive(Debug)]
pub struct DistAccum {
    config: DistAccumConfig,
    pool: Arc<WorkerPool>,
}

impl DistAccum {
    pub fn new(config: DistAccumConfig) -> KernelResult<Self> {
        config.validate()?;
        let pool = create_worker_pool(config.workers)?;
        Ok(Self { config, pool })
    }

    pub fn with_pool(mut config: DistAccumConfig, pool: Arc<WorkerPool>) -> KernelResult<Self> {
        config.workers = pool.workers();
        config.validate()?;
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &DistAccumConfig {
        &self.config
    }

    pub fn accumulate(&self, lookups: MatrixView<'_, f16>) -> KernelResult<Vec<f16>> {
        if lookups.ncols() != self.config.width {
            return Err(InvocationError::Shape {
                what: "lookups",
                axis: "columns",
                got: lookups.ncols(),
                expected: self.config.width,
            }
            .into());
        }
        Ok(lookups
            .par_row_iter()
            .map(|row| arith::narrow(row.iter().map(|v| v.to_f32()).sum()))
            .collect_in_pool(&self.pool))
    }
}
