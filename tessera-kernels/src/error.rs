/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use thiserror::Error;

use crate::metric::{Encoding, Metric};

/// Errors detected while constructing a kernel.
///
/// These describe a configuration that can never run, so they are reported before any
/// work is scheduled and are never retried.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{what} ({value}) must be a multiple of {alignment}")]
    Misaligned {
        what: &'static str,
        value: usize,
        alignment: usize,
    },
    #[error("{what} cannot be zero")]
    Zero { what: &'static str },
    #[error("{what} ({value}) must not exceed {max}")]
    TooLarge {
        what: &'static str,
        value: usize,
        max: usize,
    },
    #[error("block size {0} is not one of 16, 32 or 64")]
    BlockSize(usize),
    #[error("sub dimension {0} must be 4, 8 or a multiple of 16")]
    SubDim(usize),
    #[error("dimension {dim} is not divisible into {sub_quantizers} sub-quantizers")]
    SubQuantizers { dim: usize, sub_quantizers: usize },
    #[error("metric {metric} is not supported for {encoding} codes")]
    Unsupported { metric: Metric, encoding: Encoding },
    #[error("{what} has {got} entries while the kernel expects {expected}")]
    Length {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    #[error(
        "scratch capacity of {available} bytes cannot hold one {block}-wide tile \
         ({required} bytes required)"
    )]
    Scratch {
        available: usize,
        required: usize,
        block: usize,
    },
}

/// Errors detected when the operands of a call disagree with the constructed kernel.
///
/// All of these are checked before any output is allocated.
#[derive(Debug, Clone, Error, PartialEq)]
#[non_exhaustive]
pub enum InvocationError {
    #[error("{what} has {got} {axis} while the kernel expects {expected}")]
    Shape {
        what: &'static str,
        axis: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("{what} is required by the {metric} kernel over {encoding} codes")]
    Missing {
        what: &'static str,
        metric: Metric,
        encoding: Encoding,
    },
    #[error("{what} were supplied as {got} while the kernel expects {expected}")]
    Encoding {
        what: &'static str,
        got: &'static str,
        expected: &'static str,
    },
    #[error("actual count {actual} exceeds the code capacity {capacity}")]
    ActualCount { actual: usize, capacity: usize },
    #[error(
        "mask rows of {mask_len} bytes cannot address bit {last_bit} for {nqueries} \
         queries within {len} bytes"
    )]
    Mask {
        mask_len: usize,
        last_bit: usize,
        nqueries: usize,
        len: usize,
    },
    #[error("assigned list id {id} at query {query}, probe {probe} is out of range for {nlists} lists")]
    ListId {
        id: i32,
        query: usize,
        probe: usize,
        nlists: usize,
    },
    #[error("assigned list ids for query {query} are not a prefix: id at probe {probe} follows an unused slot")]
    ListGap { query: usize, probe: usize },
}

/// The umbrella error returned by kernel invocations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type KernelResult<T> = Result<T, KernelError>;
