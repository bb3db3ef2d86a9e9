/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Ahead-of-time kernel variants of each index kind.
//!
//! A host that compiles its kernels offline needs one descriptor per (kernel, query page
//! size) pair. The file names follow the legacy model names so existing loaders find them.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tessera_kernels::{
    accum::DEFAULT_ACCUM_ROWS,
    num::{round_up, LANES},
    pq::NPROBE_ALIGNMENT,
    DistAccumConfig, Encoding, KernelConfig, LinearTransformConfig, Metric, OpDescriptor,
    PqTableConfig, Profile,
};

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Exhaustive half precision search.
    Flat,

    /// Exhaustive int8 search.
    #[value(name = "int8flat")]
    Int8Flat,

    /// Inverted lists of half precision vectors.
    #[value(name = "ivfflat")]
    IvfFlat,

    /// Inverted lists of int8 vectors.
    #[value(name = "ivfint8flat")]
    IvfInt8Flat,

    /// Exhaustive search over 8-bit scalar quantized vectors.
    Sq8,

    /// Inverted lists of 8-bit scalar quantized vectors.
    #[value(name = "ivfsq8")]
    IvfSq8,

    /// Inverted lists of product quantized vectors.
    #[value(name = "ivfpq")]
    IvfPq,

    /// Linear projection applied before search.
    Pcar,
}

impl IndexKind {
    /// The query page sizes compiled when none are requested.
    pub fn default_pages(self) -> &'static [usize] {
        match self {
            Self::Flat => &[96, 64, 48, 42, 36, 32, 30, 24, 18, 16, 12, 8, 6, 4, 2, 1],
            Self::Int8Flat => &[48, 36, 32, 24, 18, 16, 12, 8, 6, 4, 2, 1],
            Self::IvfFlat | Self::IvfInt8Flat | Self::IvfSq8 => &[64, 32, 16, 8, 4, 2, 1],
            Self::Sq8 => &[96, 48, 36, 32, 24, 18, 16, 12, 8, 6, 4, 2, 1],
            Self::IvfPq => &[1, 2, 4, 8, 16, 32],
            Self::Pcar => &[256, 128, 64, 32, 16, 8, 4, 2, 1],
        }
    }

    /// Codes scored per invocation: a database slice for flat kinds, one list for IVF.
    pub fn default_codes(self) -> usize {
        match self {
            Self::Flat | Self::Int8Flat | Self::Sq8 => 16384 * 16,
            Self::IvfFlat => 2048,
            Self::IvfInt8Flat | Self::IvfSq8 => 65536,
            Self::IvfPq | Self::Pcar => 0,
        }
    }
}

/// Everything needed to enumerate the variants of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParams {
    pub kind: IndexKind,
    pub dim: usize,
    /// Projected dimension. Only used by [`IndexKind::Pcar`].
    pub output_dim: usize,
    pub coarse_centroids: usize,
    pub sub_quantizers: usize,
    pub pq_centroids: usize,
    pub codes: usize,
    pub pages: Vec<usize>,
    pub workers: usize,
}

/// One compiled kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variant {
    pub name: String,
    pub page: usize,
    #[serde(skip)]
    pub descriptor: OpDescriptor,
}

impl Variant {
    fn new(name: String, page: usize, descriptor: OpDescriptor) -> Self {
        Self {
            name,
            page,
            descriptor,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.name)
    }
}

/// The index file written next to the descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub params: IndexParams,
    pub variants: Vec<Variant>,
}

impl IndexParams {
    fn check(&self) -> Result<()> {
        ensure!(
            self.dim > 0 && self.dim % LANES == 0,
            "dimension {} is not a positive multiple of {LANES}",
            self.dim
        );
        ensure!(!self.pages.is_empty(), "no page sizes requested");
        ensure!(self.pages.iter().all(|&p| p > 0), "page sizes must be positive");
        match self.kind {
            IndexKind::Pcar => ensure!(
                self.output_dim > 0 && self.output_dim % LANES == 0,
                "output dimension {} is not a positive multiple of {LANES}",
                self.output_dim
            ),
            IndexKind::IvfPq => {
                ensure!(self.coarse_centroids > 0, "no coarse centroids");
                ensure!(
                    self.sub_quantizers > 0 && self.dim % self.sub_quantizers == 0,
                    "dimension {} is not divisible into {} sub-quantizers",
                    self.dim,
                    self.sub_quantizers
                );
                ensure!(self.pq_centroids > 0, "no PQ centroids");
            }
            IndexKind::IvfFlat | IndexKind::IvfInt8Flat | IndexKind::IvfSq8 => {
                ensure!(self.coarse_centroids > 0, "no coarse centroids");
                ensure!(self.codes > 0, "no codes per list");
            }
            IndexKind::Flat | IndexKind::Int8Flat | IndexKind::Sq8 => {
                ensure!(self.codes > 0, "no codes per invocation");
            }
        }
        Ok(())
    }

    fn kernel(&self, metric: Metric, encoding: Encoding, profile: Profile) -> KernelConfig {
        let capacity = match profile {
            Profile::IvfCoarse => self.coarse_centroids,
            Profile::Flat | Profile::IvfList => self.codes,
        };
        let config = KernelConfig::new(metric, encoding, profile, self.dim, capacity)
            .with_workers(self.workers);
        let capacity = round_up(capacity, config.code_alignment());
        KernelConfig { capacity, ..config }
    }
}

fn paged(params: &IndexParams, name: &str, config: KernelConfig) -> Result<Vec<Variant>> {
    params
        .pages
        .iter()
        .map(|&page| {
            let descriptor = OpDescriptor::distance(&config, page)
                .with_context(|| format!("describing {name} for page {page}"))?;
            Ok(Variant::new(format!("{name}_op{page}"), page, descriptor))
        })
        .collect()
}

/// Enumerate every variant the index needs.
pub fn variants(params: &IndexParams) -> Result<Vec<Variant>> {
    use Encoding::{Int8, Sq8, F16};
    use Metric::{Cosine, InnerProduct, L2};
    use Profile::{Flat, IvfCoarse, IvfList};

    params.check()?;
    let p = params;

    let mut out = Vec::new();
    let mut single = Vec::new();
    match params.kind {
        IndexKind::Flat => {
            out.extend(paged(p, "distance_flat_l2_maxs", p.kernel(L2, F16, Flat))?);
            out.extend(paged(p, "distance_flat_ip_maxs", p.kernel(InnerProduct, F16, Flat))?);
        }
        IndexKind::Int8Flat => {
            out.extend(paged(p, "int8_flat_l2_mins", p.kernel(L2, Int8, Flat))?);
            out.extend(paged(p, "int8_flat_cos_maxs", p.kernel(Cosine, Int8, Flat))?);
        }
        IndexKind::Sq8 => {
            let ip = p.kernel(InnerProduct, Sq8, Flat);
            out.extend(paged(p, "distance_compute_sq8_ip_maxs", ip)?);
            out.extend(paged(p, "distance_compute_sq8_l2_mins", p.kernel(L2, Sq8, Flat))?);
        }
        IndexKind::IvfFlat => {
            out.extend(paged(p, "distance_compute", p.kernel(L2, F16, IvfCoarse))?);
            single.push(("distance_compute_ivfflat_op", params.kernel(L2, F16, IvfList)));
        }
        IndexKind::IvfInt8Flat => {
            out.extend(paged(p, "int8flat_l2_distance", p.kernel(L2, Int8, IvfCoarse))?);
            out.extend(paged(p, "int8flat_cos_distance", p.kernel(Cosine, Int8, IvfCoarse))?);
            single.push(("ivf_int8flat_l2_distance_op1", params.kernel(L2, Int8, IvfList)));
            single.push(("ivf_int8flat_cos_distance_op1", params.kernel(Cosine, Int8, IvfList)));
        }
        IndexKind::IvfSq8 => {
            out.extend(paged(p, "distance_compute_flat_l2", p.kernel(L2, F16, IvfCoarse))?);
            single.push(("distance_ivf_sq8_ip_op", params.kernel(InnerProduct, Sq8, IvfList)));
            single.push(("distance_ivf_sq8_l2_op", params.kernel(L2, Sq8, IvfList)));
        }
        IndexKind::IvfPq => {
            out.extend(paged(p, "distance_compute", p.kernel(L2, F16, IvfCoarse))?);
            let table = PqTableConfig {
                dim: params.dim,
                sub_quantizers: params.sub_quantizers,
                centroids: params.pq_centroids,
                nprobe: NPROBE_ALIGNMENT,
                lists: round_up(params.coarse_centroids, LANES),
                workers: params.workers,
            };
            out.push(Variant::new(
                "distance_table_build_op".to_owned(),
                1,
                OpDescriptor::pq_table(&table, 1),
            ));
            let accum = DistAccumConfig {
                width: round_up(params.sub_quantizers, LANES),
                rows: DEFAULT_ACCUM_ROWS,
                workers: params.workers,
            };
            out.push(Variant::new(
                "distance_accumulate_op".to_owned(),
                accum.rows,
                OpDescriptor::dist_accum(&accum),
            ));
        }
        IndexKind::Pcar => {
            let transform = LinearTransformConfig {
                input_dim: params.dim,
                output_dim: params.output_dim,
                workers: params.workers,
            };
            for &page in &params.pages {
                out.push(Variant::new(
                    format!("linear_transform_op{page}"),
                    page,
                    OpDescriptor::linear_transform(&transform, page),
                ));
            }
        }
    }

    for (name, config) in single {
        let descriptor = OpDescriptor::distance(&config, 1)
            .with_context(|| format!("describing {name}"))?;
        out.push(Variant::new(name.to_owned(), 1, descriptor));
    }
    Ok(out)
}

/// Write one descriptor file per variant plus `manifest.json` into `dir`.
///
/// Each descriptor file holds a JSON array with a single entry, the form legacy model
/// compilers consume.
pub fn write_variants(dir: &Path, params: &IndexParams) -> Result<Vec<PathBuf>> {
    let variants = variants(params)?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut written = Vec::with_capacity(variants.len() + 1);
    for variant in &variants {
        let path = dir.join(variant.file_name());
        let json = serde_json::to_string_pretty(&[&variant.descriptor])?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        tracing::debug!(variant = %variant.name, path = %path.display(), "wrote descriptor");
        written.push(path);
    }

    let path = dir.join("manifest.json");
    let manifest = Manifest {
        params: params.clone(),
        variants,
    };
    std::fs::write(&path, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("writing {}", path.display()))?;
    written.push(path);
    Ok(written)
}
