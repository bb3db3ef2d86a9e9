/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::ops::Range;

use tessera_utils::{Matrix, MatrixView, MutMatrixView};

use super::{CodeNorms, CodeSet, Expected, Inputs, Operands, QuerySet, Strategy};
use crate::{
    arith,
    error::InvocationError,
    layout::ZzView,
    linalg::{sgemm, Transpose},
};

/// Half precision queries against 8-bit scalar quantized codes.
///
/// Expanding the dequantization `y = (c + 0.5)·diff/255 + min` splits every product into
/// a query-only base term and `(x ∘ diff) · c`. The base is computed once per invocation,
/// so the per-tile work is a single inner product against the raw code values.
#[derive(Debug)]
pub(crate) struct Sq8Operands<'a> {
    /// `x ∘ diff` for every query.
    weighted: Matrix<f32>,
    /// The query-only part of each distance.
    base: Vec<f32>,
    /// Factor applied to `(x ∘ diff) · c`.
    scale: f32,
    /// Dequantized squared norms for L2.
    code_norms: Option<&'a [f32]>,
    codes: ZzView<'a, u8>,
}

impl<'a> Sq8Operands<'a> {
    pub(crate) fn bind(expected: &Expected, inputs: &Inputs<'a>) -> Result<Self, InvocationError> {
        let QuerySet::F16(queries) = inputs.queries else {
            return Err(expected.wrong_queries(&inputs.queries, "f16"));
        };
        let CodeSet::Sq8(codes) = inputs.codes else {
            return Err(expected.wrong_codes(&inputs.codes));
        };
        expected.query_dim(queries.ncols())?;
        expected.codes(&codes)?;

        let quantizer = inputs.sq8.ok_or_else(|| expected.missing("sq8 quantizer"))?;
        if quantizer.dim() != expected.dim {
            return Err(InvocationError::Shape {
                what: "sq8 quantizer",
                axis: "dimensions",
                got: quantizer.dim(),
                expected: expected.dim,
            });
        }

        let is_l2 = expected.strategy == Strategy::Sq8L2;
        let code_norms = if is_l2 {
            match inputs.code_norms {
                CodeNorms::Squared(norms) => {
                    expected.norms("code norms", norms.len())?;
                    Some(norms)
                }
                CodeNorms::None => return Err(expected.missing("code norms")),
                other => return Err(expected.wrong_norms(&other, "f32 squared norms")),
            }
        } else {
            None
        };

        let queries = queries.map(|v| v.to_f32());
        let diff: Vec<f32> = quantizer.diff().iter().map(|d| d.to_f32()).collect();
        let weighted = Matrix::from_fn(queries.nrows(), queries.ncols(), |q, d| {
            queries[(q, d)] * diff[d]
        });

        // cross[q] = x_q · (0.5·diff + 255·min)
        let constants = quantizer.cross_constants();
        let mut cross = Matrix::new(0.0f32, queries.nrows(), 1);
        sgemm(
            Transpose::None,
            Transpose::Ordinary,
            1.0,
            queries.as_view(),
            MatrixView::row_vector(constants.as_slice()),
            None,
            &mut cross.as_mut_view(),
        );

        let (base, scale) = if is_l2 {
            let base = queries
                .row_iter()
                .zip(cross.as_slice())
                .map(|(x, c)| arith::square_norm(x) - (2.0 / 255.0) * c)
                .collect();
            (base, -2.0 / 255.0)
        } else {
            let base = cross.as_slice().iter().map(|c| c / 255.0).collect();
            (base, 1.0 / 255.0)
        };

        Ok(Self {
            weighted,
            base,
            scale,
            code_norms,
            codes,
        })
    }
}

impl Operands for Sq8Operands<'_> {
    type Staged = f32;

    fn nqueries(&self) -> usize {
        self.weighted.nrows()
    }

    fn load(&self, codes: Range<usize>, dst: &mut MutMatrixView<'_, f32>) {
        self.codes.gather(codes, dst, f32::from);
    }

    fn distance(
        &self,
        queries: Range<usize>,
        codes: Range<usize>,
        staged: MatrixView<'_, f32>,
        out: &mut MutMatrixView<'_, f32>,
    ) {
        for (i, q) in queries.enumerate() {
            let w = self.weighted.row(q);
            let base = self.base[q];
            let row = out.row_mut(i);
            for ((o, y), c) in row.iter_mut().zip(staged.row_iter()).zip(codes.clone()) {
                let norm = self.code_norms.map_or(0.0, |n| n[c]);
                *o = base + norm + self.scale * arith::dot(w, y);
            }
        }
    }
}
