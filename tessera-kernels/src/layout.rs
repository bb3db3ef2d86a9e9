/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Blocked storage layouts consumed by the kernels.
//!
//! # zZ codes
//!
//! A code set with `M` codes of dimension `D` is stored as a `[M/16, D/16, 16, 16]`
//! tensor. Element `(c, d)` lives at `[c / 16, d / 16, c % 16, d % 16]`, so each 16x16
//! fractal holds 16 consecutive codes restricted to 16 consecutive dimensions:
//! ```text
//!             d0..d15        d16..d31
//! c0..c15   | fractal 0 |  | fractal 1 |  ...   block row 0
//! c16..c31  | fractal k |  | ...       |  ...   block row 1
//! ```
//! where `k = D / 16`. Each fractal is row-major by code.
//!
//! # Packed weights
//!
//! A `K x N` projection matrix is stored as `[K/16, N, 16]`: element `(k, n)` lives at
//! `[k / 16, n, k % 16]`.

use std::ops::Range;

use tessera_utils::{Matrix, MatrixView, MutMatrixView};

use crate::{
    error::ConfigError,
    num::{check_aligned, LANES},
};

const FRACTAL: usize = LANES * LANES;

/// A code set in zZ layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ZzCodes<T> {
    data: Box<[T]>,
    ncodes: usize,
    dim: usize,
}

/// A borrowed code set in zZ layout.
#[derive(Debug, Clone, Copy)]
pub struct ZzView<'a, T> {
    data: &'a [T],
    ncodes: usize,
    dim: usize,
}

impl<T: Copy + Default> ZzCodes<T> {
    /// Pack a row-major `M x D` matrix.
    ///
    /// Both `M` and `D` must be multiples of 16.
    pub fn pack(codes: MatrixView<'_, T>) -> Result<Self, ConfigError> {
        let (ncodes, dim) = codes.shape();
        check_aligned("code count", ncodes, LANES)?;
        check_aligned("dimension", dim, LANES)?;

        let mut data = vec![T::default(); ncodes * dim].into_boxed_slice();
        for (c, row) in codes.row_iter().enumerate() {
            for (d, &v) in row.iter().enumerate() {
                data[zz_offset(c, d, dim)] = v;
            }
        }
        Ok(Self { data, ncodes, dim })
    }

}

impl<T: Copy> ZzCodes<T> {
    pub fn as_view(&self) -> ZzView<'_, T> {
        ZzView {
            data: &self.data,
            ncodes: self.ncodes,
            dim: self.dim,
        }
    }

    pub fn ncodes(&self) -> usize {
        self.ncodes
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The raw zZ tensor.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl<'a, T: Copy> ZzView<'a, T> {
    pub fn ncodes(&self) -> usize {
        self.ncodes
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Return element `(code, dim)`.
    #[inline]
    pub fn get(&self, code: usize, d: usize) -> T {
        self.data[zz_offset(code, d, self.dim)]
    }

    /// Gather the codes in `codes` into the leading rows of `dst`, converting each element
    /// with `f`.
    ///
    /// Copies run fractal row by fractal row, 16 contiguous elements at a time.
    ///
    /// # Panics
    ///
    /// Panics if `codes` exceeds the code set, if `dst` has fewer than `codes.len()` rows,
    /// or if `dst.ncols() != self.dim()`.
    pub fn gather<U, F>(&self, codes: Range<usize>, dst: &mut MutMatrixView<'_, U>, f: F)
    where
        F: Fn(T) -> U,
    {
        assert!(codes.end <= self.ncodes, "gathering past the end of the code set");
        assert!(dst.nrows() >= codes.len(), "staging buffer is too short");
        assert_eq!(dst.ncols(), self.dim, "staging buffer has the wrong width");

        for (row, code) in codes.enumerate() {
            let out = dst.row_mut(row);
            let block_row = (code / LANES) * (self.dim / LANES) * FRACTAL;
            let within = (code % LANES) * LANES;
            for (j, chunk) in out.chunks_exact_mut(LANES).enumerate() {
                let start = block_row + j * FRACTAL + within;
                chunk
                    .iter_mut()
                    .zip(&self.data[start..start + LANES])
                    .for_each(|(o, &v)| *o = f(v));
            }
        }
    }

    /// Unpack into a row-major matrix.
    pub fn unpack(&self) -> Matrix<T> {
        Matrix::from_fn(self.ncodes, self.dim, |c, d| self.get(c, d))
    }
}

#[inline]
fn zz_offset(code: usize, d: usize, dim: usize) -> usize {
    let block_row = (code / LANES) * (dim / LANES) * FRACTAL;
    block_row + (d / LANES) * FRACTAL + (code % LANES) * LANES + d % LANES
}

/// A projection matrix in `[K/16, N, 16]` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedWeights<T> {
    data: Box<[T]>,
    k: usize,
    n: usize,
}

impl<T: Copy + Default> PackedWeights<T> {
    /// Pack a row-major `K x N` matrix. `K` must be a multiple of 16.
    pub fn pack(weights: MatrixView<'_, T>) -> Result<Self, ConfigError> {
        let (k, n) = weights.shape();
        check_aligned("input dimension", k, LANES)?;

        let mut data = vec![T::default(); k * n].into_boxed_slice();
        for (row, values) in weights.row_iter().enumerate() {
            for (col, &v) in values.iter().enumerate() {
                data[packed_offset(row, col, n)] = v;
            }
        }
        Ok(Self { data, k, n })
    }

    /// The input dimension `K`.
    pub fn input_dim(&self) -> usize {
        self.k
    }

    /// The output dimension `N`.
    pub fn output_dim(&self) -> usize {
        self.n
    }

    /// Unpack into a row-major `K x N` matrix, converting each element with `f`.
    pub fn unpack_with<U, F>(&self, f: F) -> Matrix<U>
    where
        F: Fn(T) -> U,
    {
        Matrix::from_fn(self.k, self.n, |row, col| {
            f(self.data[packed_offset(row, col, self.n)])
        })
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

#[inline]
fn packed_offset(row: usize, col: usize, n: usize) -> usize {
    (row / LANES) * n * LANES + col * LANES + row % LANES
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use rstest::rstest;

    use super::*;

    fn random(nrows: usize, ncols: usize, seed: u64) -> Matrix<i32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Matrix::from_fn(nrows, ncols, |_, _| rng.random_range(-1000..1000))
    }

    #[test]
    fn zz_offsets_follow_fractal_order() {
        let dim = 32;
        // First fractal row.
        assert_eq!(zz_offset(0, 0, dim), 0);
        assert_eq!(zz_offset(0, 15, dim), 15);
        assert_eq!(zz_offset(1, 0, dim), 16);
        // Second fractal of block row 0.
        assert_eq!(zz_offset(0, 16, dim), 256);
        // Block row 1.
        assert_eq!(zz_offset(16, 0, dim), 512);
        assert_eq!(zz_offset(17, 18, dim), 512 + 256 + 16 + 2);
    }

    #[rstest]
    fn pack_then_gather(#[values(16, 48)] ncodes: usize, #[values(16, 64)] dim: usize) {
        let m = random(ncodes, dim, 0x5eed);
        let zz = ZzCodes::pack(m.as_view()).unwrap();
        let view = zz.as_view();
        assert_eq!(view.unpack(), m);

        // Gather an unaligned range.
        let range = 3..ncodes - 2;
        let mut staging = Matrix::new(0i64, ncodes, dim);
        let mut dst = staging.as_mut_view();
        view.gather(range.clone(), &mut dst, i64::from);
        for (row, code) in range.enumerate() {
            let expected: Vec<i64> = m.row(code).iter().map(|&v| i64::from(v)).collect();
            assert_eq!(staging.row(row), &*expected);
        }
    }

    #[test]
    fn pack_rejects_misaligned() {
        let m = random(20, 16, 1);
        assert_eq!(
            ZzCodes::pack(m.as_view()).unwrap_err(),
            ConfigError::Misaligned {
                what: "code count",
                value: 20,
                alignment: 16
            }
        );
    }

    #[test]
    fn packed_weights() {
        let w = random(32, 5, 2);
        let packed = PackedWeights::pack(w.as_view()).unwrap();
        assert_eq!(packed.input_dim(), 32);
        assert_eq!(packed.output_dim(), 5);

        // (k = 17, n = 3) lives at [1, 3, 1].
        assert_eq!(packed.as_slice()[5 * 16 + 3 * 16 + 1], w[(17, 3)]);
        assert_eq!(packed.unpack_with(|x| x), w);

        assert!(PackedWeights::pack(random(8, 4, 3).as_view()).is_err());
    }
}
