/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Seeded data generators and scalar reference distances for tests.

use half::f16;
use rand::{rngs::StdRng, Rng};
use rand_distr::{Distribution, StandardNormal};
use tessera_utils::Matrix;

pub(crate) fn random_f16(nrows: usize, ncols: usize, rng: &mut StdRng) -> Matrix<f16> {
    Matrix::from_fn(nrows, ncols, |_, _| {
        let v: f32 = StandardNormal.sample(rng);
        f16::from_f32(v)
    })
}

pub(crate) fn random_i8(nrows: usize, ncols: usize, rng: &mut StdRng) -> Matrix<i8> {
    Matrix::from_fn(nrows, ncols, |_, _| rng.random_range(-127i32..=127) as i8)
}

pub(crate) fn widen_row(row: &[f16]) -> Vec<f32> {
    row.iter().map(|v| v.to_f32()).collect()
}

pub(crate) fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    inner_product(a, b) / (inner_product(a, a).sqrt() * inner_product(b, b).sqrt())
}
