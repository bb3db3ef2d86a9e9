/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tessera_kernels::kernel::DEFAULT_WORKERS;
use tessera_tools::utils::{init_subscriber, write_variants, IndexKind, IndexParams};

/// Writes the kernel descriptors an index needs, one file per variant, plus a manifest.
#[derive(Parser, Debug)]
#[command(name = "generate_variants", about = "Generate kernel variant descriptors")]
struct Args {
    /// Index kind to generate variants for
    #[arg(value_enum)]
    kind: IndexKind,

    /// Output directory
    #[arg(short, long, default_value = "config")]
    output_dir: PathBuf,

    /// Vector dimension (the input dimension for pcar)
    #[arg(short, long, default_value_t = 512)]
    dim: usize,

    /// Projected dimension, pcar only
    #[arg(long, default_value_t = 128)]
    output_dim: usize,

    /// Number of coarse centroids
    #[arg(short, long, default_value_t = 16384)]
    coarse_centroids: usize,

    /// Number of PQ sub-quantizers
    #[arg(short, long, default_value_t = 64)]
    sub_quantizers: usize,

    /// Number of centroids per PQ sub-quantizer
    #[arg(short = 'q', long, default_value_t = 256)]
    pq_centroids: usize,

    /// Codes per invocation. Defaults to the legacy value of the index kind
    #[arg(short = 'n', long)]
    codes: Option<usize>,

    /// Comma separated query page sizes. Defaults to the legacy list of the index kind
    #[arg(short, long, value_delimiter = ',')]
    pages: Option<Vec<usize>>,

    /// Worker count of each kernel
    #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
}

fn main() -> Result<()> {
    init_subscriber();
    let args = Args::parse();

    let params = IndexParams {
        kind: args.kind,
        dim: args.dim,
        output_dim: args.output_dim,
        coarse_centroids: args.coarse_centroids,
        sub_quantizers: args.sub_quantizers,
        pq_centroids: args.pq_centroids,
        codes: args.codes.unwrap_or_else(|| args.kind.default_codes()),
        pages: args
            .pages
            .unwrap_or_else(|| args.kind.default_pages().to_vec()),
        workers: args.workers,
    };

    let written = write_variants(&args.output_dir, &params)?;
    tracing::info!(
        kind = ?params.kind,
        files = written.len(),
        dir = %args.output_dir.display(),
        "variants written"
    );
    Ok(())
}
