/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{ensure, Context, Result};
use bytemuck::Pod;
use clap::Parser;
use half::f16;
use serde::{Deserialize, Serialize};
use tessera_kernels::{
    create_worker_pool, norms, norms::Sq8Quantizer, ActualNum, CodeNorms, CodeSet,
    DistanceKernel, Encoding, Inputs, KernelConfig, KernelOutput, Metric, QuerySet, WorkerPool,
    ZzCodes,
};
use tessera_tools::utils::{init_subscriber, read_bin};
use tessera_utils::Matrix;

/// Scores a query file against a code file and writes the per-block winners as JSON.
#[derive(Parser, Debug)]
#[command(name = "run_kernel", about = "Run a distance kernel over vector files")]
struct Args {
    /// Kernel configuration (JSON)
    config: PathBuf,

    /// Query vectors: fp16 for fp16 and sq8 kernels, int8 for int8 kernels
    queries: PathBuf,

    /// Code vectors: fp16, int8 or uint8 codes, at most the configured capacity
    codes: PathBuf,

    /// Output JSON file
    output: PathBuf,

    /// SQ8 quantizer parameters (JSON with `diff` and `min` arrays), sq8 kernels only
    #[arg(long)]
    sq8: Option<PathBuf>,

    /// Also write the full distance matrix
    #[arg(long, default_value_t = false)]
    distances: bool,
}

#[derive(Deserialize)]
struct Sq8Params {
    diff: Vec<f32>,
    min: Vec<f32>,
}

/// Norm tables owned on behalf of a [`CodeNorms`] borrow.
enum PreparedNorms {
    None,
    Squared(Vec<f32>),
    Int8Squared(Vec<i32>),
    Magnitudes(Vec<f16>),
}

impl PreparedNorms {
    fn as_code_norms(&self) -> CodeNorms<'_> {
        match self {
            Self::None => CodeNorms::None,
            Self::Squared(v) => CodeNorms::Squared(v),
            Self::Int8Squared(v) => CodeNorms::Int8Squared(v),
            Self::Magnitudes(v) => CodeNorms::Magnitudes(v),
        }
    }
}

#[derive(Serialize)]
struct Hit {
    index: usize,
    distance: f32,
}

impl Hit {
    fn new((distance, index): (f16, usize)) -> Self {
        Self {
            index,
            distance: distance.to_f32(),
        }
    }
}

#[derive(Serialize)]
struct QueryReport {
    best: Option<Hit>,
    blocks: Vec<Option<Hit>>,
}

#[derive(Serialize)]
struct Report {
    strategy: String,
    codes: usize,
    block: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    winners: Option<Vec<QueryReport>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    distances: Option<Vec<Vec<f32>>>,
}

/// Load codes and pad them with zero rows up to the kernel capacity.
fn load_codes<T: Pod + Default>(
    args: &Args,
    config: &KernelConfig,
) -> Result<(Matrix<T>, ActualNum)> {
    let codes: Matrix<T> = read_bin(&args.codes)?;
    ensure!(
        codes.ncols() == config.dim,
        "codes have {} dimensions while the kernel expects {}",
        codes.ncols(),
        config.dim
    );
    ensure!(
        codes.nrows() <= config.capacity,
        "{} codes exceed the kernel capacity of {}",
        codes.nrows(),
        config.capacity
    );

    let mut padded = Matrix::new(T::default(), config.capacity, config.dim);
    padded
        .subrows_mut(0..codes.nrows())
        .as_mut_slice()
        .copy_from_slice(codes.as_slice());
    let count = u32::try_from(codes.nrows()).context("code count does not fit in u32")?;
    Ok((padded, ActualNum::unmasked(count)))
}

fn load_sq8(args: &Args) -> Result<Sq8Quantizer> {
    let path = args
        .sq8
        .as_ref()
        .context("sq8 kernels need --sq8 quantizer parameters")?;
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let params: Sq8Params = serde_json::from_str(&text)?;
    let to_f16 = |v: Vec<f32>| v.into_iter().map(f16::from_f32).collect();
    Ok(Sq8Quantizer::new(to_f16(params.diff), to_f16(params.min))?)
}

fn run(args: &Args, kernel: &DistanceKernel, pool: &WorkerPool) -> Result<(KernelOutput, usize)> {
    let config = kernel.config();
    match config.encoding {
        Encoding::F16 => {
            let queries: Matrix<f16> = read_bin(&args.queries)?;
            let (codes, actual) = load_codes::<f16>(args, config)?;
            let prepared = match config.metric {
                Metric::L2 => PreparedNorms::Squared(norms::square_norms_f16(pool, codes.as_view())),
                Metric::Cosine => {
                    PreparedNorms::Magnitudes(norms::inverse_magnitudes_f16(pool, codes.as_view()))
                }
                Metric::InnerProduct => PreparedNorms::None,
            };
            let packed = ZzCodes::pack(codes.as_view())?;
            let inputs = Inputs::new(
                QuerySet::F16(queries.as_view()),
                CodeSet::F16(packed.as_view()),
                actual,
            )
            .with_code_norms(prepared.as_code_norms());
            Ok((kernel.run(&inputs)?, actual.count()))
        }
        Encoding::Int8 => {
            let queries: Matrix<i8> = read_bin(&args.queries)?;
            let (codes, actual) = load_codes::<i8>(args, config)?;
            let prepared = match config.metric {
                Metric::Cosine => {
                    PreparedNorms::Magnitudes(norms::int8_magnitudes(pool, codes.as_view()))
                }
                _ => PreparedNorms::Int8Squared(norms::int8_square_norms(pool, codes.as_view())),
            };
            let packed = ZzCodes::pack(codes.as_view())?;
            let inputs = Inputs::new(
                QuerySet::Int8(queries.as_view()),
                CodeSet::Int8(packed.as_view()),
                actual,
            )
            .with_code_norms(prepared.as_code_norms());
            Ok((kernel.run(&inputs)?, actual.count()))
        }
        Encoding::Sq8 => {
            let quantizer = load_sq8(args)?;
            let queries: Matrix<f16> = read_bin(&args.queries)?;
            let (codes, actual) = load_codes::<u8>(args, config)?;
            let prepared = match config.metric {
                Metric::L2 => PreparedNorms::Squared(quantizer.square_norms(pool, codes.as_view())),
                _ => PreparedNorms::None,
            };
            let packed = ZzCodes::pack(codes.as_view())?;
            let inputs = Inputs::new(
                QuerySet::F16(queries.as_view()),
                CodeSet::Sq8(packed.as_view()),
                actual,
            )
            .with_code_norms(prepared.as_code_norms())
            .with_sq8(&quantizer);
            Ok((kernel.run(&inputs)?, actual.count()))
        }
    }
}

fn report(kernel: &DistanceKernel, output: &KernelOutput, count: usize, full: bool) -> Report {
    let winners = output.winners().map(|winners| {
        (0..winners.nqueries())
            .map(|q| QueryReport {
                best: winners.best(q).map(Hit::new),
                blocks: (0..winners.nblocks())
                    .map(|b| winners.get(q, b).map(Hit::new))
                    .collect(),
            })
            .collect()
    });
    let distances = (full || winners.is_none()).then(|| {
        output
            .distances()
            .row_iter()
            .map(|row| row[..count].iter().map(|v| v.to_f32()).collect())
            .collect()
    });
    Report {
        strategy: format!("{:?}", kernel.strategy()),
        codes: count,
        block: kernel.block().map(|b| b.get()),
        winners,
        distances,
    }
}

fn main() -> Result<()> {
    init_subscriber();
    let args = Args::parse();

    let text = fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: KernelConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", args.config.display()))?;

    let pool: Arc<WorkerPool> = create_worker_pool(config.workers)?;
    let kernel = DistanceKernel::with_pool(config, pool.clone())?;
    let (output, count) = run(&args, &kernel, &pool)?;
    tracing::info!(
        queries = output.distances().nrows(),
        codes = count,
        flags = ?output.completion_flags(),
        "kernel finished"
    );

    let report = report(&kernel, &output, count, args.distances);
    fs::write(&args.output, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("writing {}", args.output.display()))?;
    Ok(())
}
