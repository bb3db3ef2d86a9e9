/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Batched distance kernels for approximate nearest neighbor search.
//!
//! A [`DistanceKernel`] scores a batch of queries against a code set stored in zZ layout,
//! splitting the code axis across a pool of workers and reducing each block of codes to
//! its best entry. [`PqTableBuilder`], [`DistAccum`] and [`LinearTransform`] cover the
//! product quantization and projection stages of the same search pipelines.

#![cfg_attr(
    not(test),
    warn(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::undocumented_unsafe_blocks
    )
)]

pub mod accum;
pub mod actual;
pub mod arith;
pub mod descriptor;
pub mod error;
pub mod kernel;
pub mod layout;
pub mod linalg;
pub mod metric;
pub mod norms;
pub mod num;
pub mod plan;
pub mod pool;
pub mod pq;
pub mod reduce;
pub mod strategy;
pub mod transform;

mod scratch;

#[cfg(test)]
mod test_util;

pub use accum::{DistAccum, DistAccumConfig};
pub use actual::{ActualNum, ValidityMask};
pub use descriptor::{OpDescriptor, TensorDesc};
pub use error::{ConfigError, InvocationError, KernelError, KernelResult};
pub use kernel::{DistanceKernel, KernelConfig, KernelOutput};
pub use layout::{PackedWeights, ZzCodes, ZzView};
pub use metric::{Encoding, Extremum, Metric, Profile};
pub use num::BlockSize;
pub use plan::{ScratchCapacity, TilePlan, WorkerPartition};
pub use pool::{create_worker_pool, WorkerPool};
pub use pq::{PqTable, PqTableBuilder, PqTableConfig};
pub use reduce::{BlockWinners, Winner};
pub use strategy::{CodeNorms, CodeSet, Inputs, QuerySet, Strategy};
pub use transform::{LinearTransform, LinearTransformConfig};
