/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Dense matrix multiplication backed by `faer`.

use faer::Par;
use tessera_utils::{MatrixView, MutMatrixView};

/// Whether an operand is used as stored or through its transpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    None,
    Ordinary,
}

/// Compute `c = [beta * c] + alpha * op(a) * op(b)` for row-major operands.
///
/// `op(x)` is `x` or its transpose depending on the matching [`Transpose`] flag. If
/// `beta` is `None`, `c` is overwritten.
///
/// # Panics
///
/// Panics if the operand shapes are incompatible with `c`.
pub fn sgemm(
    atranspose: Transpose,
    btranspose: Transpose,
    alpha: f32,
    a: MatrixView<'_, f32>,
    b: MatrixView<'_, f32>,
    beta: Option<f32>,
    c: &mut MutMatrixView<'_, f32>,
) {
    let (m, n) = c.shape();
    let a = match atranspose {
        Transpose::None => faer::mat::MatRef::from_row_major_slice(a.as_slice(), a.nrows(), a.ncols()),
        Transpose::Ordinary => {
            faer::mat::MatRef::from_row_major_slice(a.as_slice(), a.nrows(), a.ncols()).transpose()
        }
    };
    let b = match btranspose {
        Transpose::None => faer::mat::MatRef::from_row_major_slice(b.as_slice(), b.nrows(), b.ncols()),
        Transpose::Ordinary => {
            faer::mat::MatRef::from_row_major_slice(b.as_slice(), b.nrows(), b.ncols()).transpose()
        }
    };

    assert_eq!(a.nrows(), m, "op(a) has {} rows but c has {m}", a.nrows());
    assert_eq!(b.ncols(), n, "op(b) has {} columns but c has {n}", b.ncols());
    assert_eq!(
        a.ncols(),
        b.nrows(),
        "inner dimensions disagree: {} vs {}",
        a.ncols(),
        b.nrows()
    );

    let mut out = faer::mat::MatMut::from_row_major_slice_mut(c.as_mut_slice(), m, n);
    let accum = match beta {
        Some(scale) => {
            if scale != 1.0 {
                out *= faer::Scale(scale);
            }
            faer::Accum::Add
        }
        None => faer::Accum::Replace,
    };
    faer::linalg::matmul::matmul(out, accum, a, b, alpha, Par::Seq);
}
