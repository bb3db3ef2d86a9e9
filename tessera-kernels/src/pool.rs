/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Worker pools for the per-partition kernel loops.

use std::{num::NonZeroUsize, sync::Arc};

use rayon::prelude::ParallelIterator;

use crate::error::{ConfigError, KernelError};

/// A fixed-size pool of worker threads.
///
/// Kernels submit one task per worker partition. Tasks never communicate with each other.
#[derive(Debug)]
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl WorkerPool {
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `op` inside the pool.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

/// Create a pool with `workers` threads.
pub fn create_worker_pool(workers: usize) -> Result<Arc<WorkerPool>, KernelError> {
    let workers = NonZeroUsize::new(workers).ok_or(ConfigError::Zero { what: "workers" })?;
    let available = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    if workers.get() > available {
        tracing::warn!(
            workers = workers.get(),
            available,
            "worker count exceeds available parallelism"
        );
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.get())
        .thread_name(|i| format!("tessera-worker-{i}"))
        .build()?;
    Ok(Arc::new(WorkerPool {
        pool,
        workers: workers.get(),
    }))
}

/// Parallel iterator operations that run inside an explicit [`WorkerPool`] rather than
/// the global rayon pool.
pub trait ParallelIteratorInPool: ParallelIterator + Sized {
    fn for_each_in_pool<OP>(self, pool: &WorkerPool, op: OP)
    where
        OP: Fn(Self::Item) + Sync + Send,
    {
        pool.install(|| self.for_each(op));
    }

    fn collect_in_pool<C>(self, pool: &WorkerPool) -> C
    where
        C: rayon::iter::FromParallelIterator<Self::Item> + Send,
    {
        pool.install(|| self.collect())
    }
}

impl<T> ParallelIteratorInPool for T where T: ParallelIterator {}
