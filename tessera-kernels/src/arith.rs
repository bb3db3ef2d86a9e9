/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Fixed-order arithmetic microkernels.
//!
//! Reductions accumulate into the lanes of a [`wide`] vector and combine them in a fixed
//! pairwise order. The result for a pair of slices therefore never depends on how
//! a caller tiles its loops, which keeps kernel outputs identical across worker counts
//! and tile plans.

use half::f16;
use wide::{f32x8, i32x8};

/// Convert `src` into `dst` element-wise.
///
/// # Panics
///
/// Panics if the lengths differ.
#[inline]
pub fn widen(src: &[f16], dst: &mut [f32]) {
    assert_eq!(src.len(), dst.len());
    dst.iter_mut().zip(src).for_each(|(d, s)| *d = s.to_f32());
}

/// Narrow an accumulator value into half precision.
///
/// Rounds to nearest-even. Finite values beyond the half precision range saturate to
/// `±f16::MAX` so that they stay ordered below the infinite sentinels.
#[inline]
pub fn narrow(x: f32) -> f16 {
    let h = f16::from_f32(x);
    if h.is_infinite() && x.is_finite() {
        if x > 0.0 {
            f16::MAX
        } else {
            f16::MIN
        }
    } else {
        h
    }
}

/// Lanes per vector register.
const SIMD_WIDTH: usize = 8;

#[inline]
fn load(x: &[f32]) -> f32x8 {
    f32x8::new(std::array::from_fn(|i| x[i]))
}

#[inline]
fn load_i8(x: &[i8]) -> i32x8 {
    i32x8::new(std::array::from_fn(|i| i32::from(x[i])))
}

/// Pairwise horizontal sum: lanes `i` and `i + 4`, then `i` and `i + 2`, then the last pair.
#[inline]
fn combine(acc: f32x8) -> f32 {
    let [a0, a1, a2, a3, a4, a5, a6, a7] = acc.to_array();
    ((a0 + a4) + (a2 + a6)) + ((a1 + a5) + (a3 + a7))
}

/// Inner product of two `f32` slices.
///
/// Element `i` accumulates into lane `i % 8`.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    let mut acc = f32x8::ZERO;
    let mut ca = a.chunks_exact(SIMD_WIDTH);
    let mut cb = b.chunks_exact(SIMD_WIDTH);
    for (x, y) in (&mut ca).zip(&mut cb) {
        acc += load(x) * load(y);
    }

    let (ra, rb) = (ca.remainder(), cb.remainder());
    if !ra.is_empty() {
        let tail = f32x8::new(std::array::from_fn(|i| {
            if i < ra.len() {
                ra[i] * rb[i]
            } else {
                0.0
            }
        }));
        acc += tail;
    }
    combine(acc)
}

/// Squared L2 norm of an `f32` slice.
#[inline]
pub fn square_norm(a: &[f32]) -> f32 {
    dot(a, a)
}

/// Inner product of two `i8` slices, accumulated in `i32`.
#[inline]
pub fn dot_i8(a: &[i8], b: &[i8]) -> i32 {
    assert_eq!(a.len(), b.len());
    let mut acc = i32x8::splat(0);
    let mut ca = a.chunks_exact(SIMD_WIDTH);
    let mut cb = b.chunks_exact(SIMD_WIDTH);
    for (x, y) in (&mut ca).zip(&mut cb) {
        acc = acc + load_i8(x) * load_i8(y);
    }
    let tail: i32 = ca
        .remainder()
        .iter()
        .zip(cb.remainder())
        .map(|(&x, &y)| i32::from(x) * i32::from(y))
        .sum();
    acc.to_array().iter().sum::<i32>() + tail
}

/// Squared Euclidean distances from `x` to eight `x.len()`-wide rows stored back to back
/// in `rows`, one row per lane.
///
/// Each lane accumulates its row in element order starting from zero, so lane `k` is bit
/// identical to [`squared_l2_sequential`] of `x` and row `k`.
#[inline]
pub fn squared_l2_x8(x: &[f32], rows: &[f32]) -> f32x8 {
    let dim = x.len();
    assert_eq!(rows.len(), SIMD_WIDTH * dim);
    let mut acc = f32x8::ZERO;
    for (d, &v) in x.iter().enumerate() {
        let column = f32x8::new(std::array::from_fn(|k| rows[k * dim + d]));
        let diff = f32x8::splat(v) - column;
        acc += diff * diff;
    }
    acc
}

/// Squared L2 norm of an `i8` slice, accumulated in `i32`.
#[inline]
pub fn square_norm_i8(a: &[i8]) -> i32 {
    dot_i8(a, a)
}

/// Squared Euclidean distance accumulated strictly in element order.
///
/// Used where several memory layouts must agree bit for bit.
#[inline]
pub fn squared_l2_sequential(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).fold(0.0f32, |acc, (x, y)| {
        let d = x - y;
        acc + d * d
    })
}

/// Reciprocal square root with one Newton-Raphson refinement step.
///
/// Returns 0 for a zero (or negative) input so that degenerate vectors contribute a zero
/// similarity rather than a non-finite one.
#[inline]
pub fn rsqrt_refined(x: f32) -> f32 {
    if x <= 0.0 || !x.is_finite() {
        return 0.0;
    }
    let y = 1.0 / x.sqrt();
    y * (1.5 - 0.5 * x * y * y)
}
