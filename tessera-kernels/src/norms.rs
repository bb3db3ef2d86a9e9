/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Per-code scalars computed once per database partition and reused by every query
//! batch: squared norms, magnitudes, and the SQ8 dequantization constants.

use half::f16;
use rayon::prelude::{IndexedParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use tessera_utils::{Matrix, MatrixView};

use crate::{
    arith,
    error::ConfigError,
    num::{check_aligned, LANES},
    pool::{ParallelIteratorInPool, WorkerPool},
};

/// The fixed-point scale shared by the int8 kernels.
///
/// Int8 inner products are multiplied by this before narrowing, and magnitudes are
/// computed as `rsqrt(INT8_SCALE * ‖x‖²)` so that the two factors cancel in the cosine.
pub const INT8_SCALE: f32 = 0.01;

/// Squared L2 norm of each row.
pub fn square_norms_f16(pool: &WorkerPool, codes: MatrixView<'_, f16>) -> Vec<f32> {
    let dim = codes.ncols();
    codes
        .par_row_iter()
        .map_init(
            || vec![0.0f32; dim],
            |buf, row| {
                arith::widen(row, buf);
                arith::square_norm(buf)
            },
        )
        .collect_in_pool(pool)
}

/// `1 / ‖y‖` of each row, or 0 for a zero row.
pub fn inverse_magnitudes_f16(pool: &WorkerPool, codes: MatrixView<'_, f16>) -> Vec<f16> {
    square_norms_f16(pool, codes)
        .into_iter()
        .map(|n| arith::narrow(arith::rsqrt_refined(n)))
        .collect()
}

/// Squared L2 norm of each int8 row, accumulated in `i32`.
pub fn int8_square_norms(pool: &WorkerPool, codes: MatrixView<'_, i8>) -> Vec<i32> {
    codes
        .par_row_iter()
        .map(arith::square_norm_i8)
        .collect_in_pool(pool)
}

/// `rsqrt(INT8_SCALE * ‖y‖²)` of each int8 row, narrowed to half precision.
pub fn int8_magnitudes(pool: &WorkerPool, codes: MatrixView<'_, i8>) -> Vec<f16> {
    codes
        .par_row_iter()
        .map(|row| {
            let n = arith::square_norm_i8(row) as f32;
            arith::narrow(arith::rsqrt_refined(INT8_SCALE * n))
        })
        .collect_in_pool(pool)
}

/// The per-dimension affine constants of 8-bit scalar quantization.
///
/// A code `c` in dimension `d` stands for `(c + 0.5) · diff[d] / 255 + min[d]`, the center
/// of the `c`-th of 255 equal steps spanning `[min[d], min[d] + diff[d]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sq8Quantizer {
    diff: Vec<f16>,
    min: Vec<f16>,
}

impl Sq8Quantizer {
    /// Construct a quantizer from trained constants.
    pub fn new(diff: Vec<f16>, min: Vec<f16>) -> Result<Self, ConfigError> {
        if diff.len() != min.len() {
            return Err(ConfigError::Length {
                what: "sq8 min",
                got: min.len(),
                expected: diff.len(),
            });
        }
        check_aligned("dimension", diff.len(), LANES)?;
        Ok(Self { diff, min })
    }

    pub fn dim(&self) -> usize {
        self.diff.len()
    }

    pub fn diff(&self) -> &[f16] {
        &self.diff
    }

    pub fn min(&self) -> &[f16] {
        &self.min
    }

    /// Quantize `x` into `out`.
    ///
    /// Values outside the trained range clamp to the end codes. A zero-width dimension
    /// always encodes as 0.
    ///
    /// # Panics
    ///
    /// Panics if `x` or `out` does not have `self.dim()` elements.
    pub fn quantize(&self, x: &[f32], out: &mut [u8]) {
        assert_eq!(x.len(), self.dim());
        assert_eq!(out.len(), self.dim());
        for (((o, &v), diff), min) in out.iter_mut().zip(x).zip(&self.diff).zip(&self.min) {
            let diff = diff.to_f32();
            *o = if diff > 0.0 {
                ((v - min.to_f32()) * 255.0 / diff).floor().clamp(0.0, 255.0) as u8
            } else {
                0
            };
        }
    }

    /// Reconstruct the vector a code stands for.
    ///
    /// # Panics
    ///
    /// Panics if `codes` or `out` does not have `self.dim()` elements.
    pub fn dequantize(&self, codes: &[u8], out: &mut [f32]) {
        assert_eq!(codes.len(), self.dim());
        assert_eq!(out.len(), self.dim());
        for (((o, &c), diff), min) in out.iter_mut().zip(codes).zip(&self.diff).zip(&self.min) {
            *o = (f32::from(c) + 0.5) * diff.to_f32() / 255.0 + min.to_f32();
        }
    }

    /// Quantize every row of `data`.
    pub fn quantize_all(&self, pool: &WorkerPool, data: MatrixView<'_, f32>) -> Matrix<u8> {
        let mut out = Matrix::new(0u8, data.nrows(), data.ncols());
        pool.install(|| {
            out.par_row_iter_mut()
                .zip(data.par_row_iter())
                .for_each(|(o, x)| self.quantize(x, o))
        });
        out
    }

    /// Squared norm of the dequantized vector of each code row.
    pub fn square_norms(&self, pool: &WorkerPool, codes: MatrixView<'_, u8>) -> Vec<f32> {
        let dim = self.dim();
        codes
            .par_row_iter()
            .map_init(
                || vec![0.0f32; dim],
                |buf, row| {
                    self.dequantize(row, buf);
                    arith::square_norm(buf)
                },
            )
            .collect_in_pool(pool)
    }

    /// `0.5 · diff + 255 · min` per dimension.
    ///
    /// Substituting the dequantization into `⟨x, y⟩` gives
    /// `(1/255) · ⟨x, 0.5·diff + 255·min⟩ + (1/255) · ⟨x ∘ diff, code⟩`. The first term
    /// depends only on the query.
    pub fn cross_constants(&self) -> Vec<f32> {
        self.diff
            .iter()
            .zip(&self.min)
            .map(|(d, m)| 0.5 * d.to_f32() + 255.0 * m.to_f32())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::pool::create_worker_pool;

    fn random_f16(nrows: usize, ncols: usize, seed: u64) -> Matrix<f16> {
        let mut rng = StdRng::seed_from_u64(seed);
        Matrix::from_fn(nrows, ncols, |_, _| f16::from_f32(rng.random_range(-1.0..1.0)))
    }

    #[test]
    fn f16_norms() {
        let pool = create_worker_pool(2).unwrap();
        let m = random_f16(33, 32, 1);
        let norms = square_norms_f16(&pool, m.as_view());
        let inv = inverse_magnitudes_f16(&pool, m.as_view());
        for (i, row) in m.row_iter().enumerate() {
            let expected: f32 = row.iter().map(|v| v.to_f32() * v.to_f32()).sum();
            assert_relative_eq!(norms[i], expected, max_relative = 1e-5);
            assert_relative_eq!(inv[i].to_f32(), 1.0 / expected.sqrt(), max_relative = 1e-3);
        }
    }

    #[test]
    fn int8_norms_and_magnitudes() {
        let pool = create_worker_pool(2).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let m = Matrix::from_fn(20, 64, |_, _| rng.random_range(-128i32..128) as i8);
        let norms = int8_square_norms(&pool, m.as_view());
        let mags = int8_magnitudes(&pool, m.as_view());
        for (i, row) in m.row_iter().enumerate() {
            let n: i32 = row.iter().map(|&v| i32::from(v) * i32::from(v)).sum();
            assert_eq!(norms[i], n);
            let expected = 1.0 / (INT8_SCALE * n as f32).sqrt();
            assert_relative_eq!(mags[i].to_f32(), expected, max_relative = 1e-3);
        }

        // A zero vector has zero magnitude rather than an infinite one.
        let zero = Matrix::new(0i8, 1, 16);
        assert_eq!(int8_magnitudes(&pool, zero.as_view()), vec![f16::ZERO]);
    }

    #[test]
    fn sq8_round_trip_within_half_step() {
        let pool = create_worker_pool(2).unwrap();
        let dim = 32;
        let mut rng = StdRng::seed_from_u64(3);
        let diff: Vec<f16> = (0..dim).map(|_| f16::from_f32(rng.random_range(0.5..4.0))).collect();
        let min: Vec<f16> = (0..dim).map(|_| f16::from_f32(rng.random_range(-2.0..0.0))).collect();
        let q = Sq8Quantizer::new(diff.clone(), min.clone()).unwrap();

        // Sample strictly inside each dimension's range.
        let data = Matrix::from_fn(50, dim, |_, d| {
            let lo = min[d].to_f32();
            lo + rng.random_range(0.0..0.999) * diff[d].to_f32()
        });
        let codes = q.quantize_all(&pool, data.as_view());

        let mut back = vec![0.0f32; dim];
        for (x, c) in data.row_iter().zip(codes.row_iter()) {
            q.dequantize(c, &mut back);
            for d in 0..dim {
                let half_step = diff[d].to_f32() / 255.0 / 2.0;
                assert!(
                    (x[d] - back[d]).abs() <= half_step * 1.0001,
                    "dim {d}: {} vs {} (half step {half_step})",
                    x[d],
                    back[d]
                );
            }
        }

        let norms = q.square_norms(&pool, codes.as_view());
        q.dequantize(codes.row(7), &mut back);
        assert_relative_eq!(norms[7], back.iter().map(|v| v * v).sum::<f32>(), max_relative = 1e-5);
    }

    #[test]
    fn sq8_clamps_and_handles_zero_width() {
        let mut diff = vec![f16::from_f32(1.0); 16];
        diff[1] = f16::ZERO;
        let q = Sq8Quantizer::new(diff, vec![f16::ZERO; 16]).unwrap();
        let mut x = vec![0.5f32; 16];
        x[0] = 7.0;
        x[2] = -3.0;
        let mut codes = vec![0u8; 16];
        q.quantize(&x, &mut codes);
        assert_eq!(codes[0], 255);
        assert_eq!(codes[1], 0);
        assert_eq!(codes[2], 0);
        assert_eq!(codes[3], 127);
    }

    #[test]
    fn sq8_validation() {
        assert!(Sq8Quantizer::new(vec![f16::ONE; 16], vec![f16::ONE; 15]).is_err());
        assert!(Sq8Quantizer::new(vec![f16::ONE; 8], vec![f16::ONE; 8]).is_err());

        let q = Sq8Quantizer::new(vec![f16::from_f32(2.0); 16], vec![f16::from_f32(-1.0); 16])
            .unwrap();
        assert_eq!(q.cross_constants()[0], 0.5 * 2.0 - 255.0);
    }
}
