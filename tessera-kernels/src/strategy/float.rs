/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::ops::Range;

use half::f16;
use tessera_utils::{Matrix, MatrixView, MutMatrixView};

use super::{CodeNorms, Expected, Inputs, Operands, QuerySet, Strategy};
use crate::{arith, error::InvocationError, layout::ZzView};

#[derive(Debug, Clone, Copy)]
enum Combine<'a> {
    /// `‖x‖² + ‖y‖² − 2⟨x,y⟩`
    L2 { code_norms: &'a [f32] },
    InnerProduct,
    /// `⟨x,y⟩ · (1/‖x‖) · (1/‖y‖)`
    Cosine { code_inverse: &'a [f16] },
}

/// Half precision queries and codes, widened to `f32` for the products.
#[derive(Debug)]
pub(crate) struct FloatOperands<'a> {
    queries: Matrix<f32>,
    /// Squared norms for L2, inverse magnitudes for cosine, unused otherwise.
    query_scalars: Vec<f32>,
    codes: ZzView<'a, f16>,
    combine: Combine<'a>,
}

impl<'a> FloatOperands<'a> {
    pub(crate) fn bind(expected: &Expected, inputs: &Inputs<'a>) -> Result<Self, InvocationError> {
        let QuerySet::F16(queries) = inputs.queries else {
            return Err(expected.wrong_queries(&inputs.queries, "f16"));
        };
        let super::CodeSet::F16(codes) = inputs.codes else {
            return Err(expected.wrong_codes(&inputs.codes));
        };
        expected.query_dim(queries.ncols())?;
        expected.codes(&codes)?;

        let combine = match expected.strategy {
            Strategy::FloatL2 => match inputs.code_norms {
                CodeNorms::Squared(norms) => {
                    expected.norms("code norms", norms.len())?;
                    Combine::L2 { code_norms: norms }
                }
                CodeNorms::None => return Err(expected.missing("code norms")),
                other => return Err(expected.wrong_norms(&other, "f32 squared norms")),
            },
            Strategy::FloatCosine => match inputs.code_norms {
                CodeNorms::Magnitudes(inverse) => {
                    expected.norms("code magnitudes", inverse.len())?;
                    Combine::Cosine {
                        code_inverse: inverse,
                    }
                }
                CodeNorms::None => return Err(expected.missing("code magnitudes")),
                other => return Err(expected.wrong_norms(&other, "f16 magnitudes")),
            },
            _ => Combine::InnerProduct,
        };

        let queries = queries.map(|v| v.to_f32());
        let query_scalars = match combine {
            Combine::L2 { .. } => queries.row_iter().map(arith::square_norm).collect(),
            Combine::Cosine { .. } => queries
                .row_iter()
                .map(|row| arith::narrow(arith::rsqrt_refined(arith::square_norm(row))).to_f32())
                .collect(),
            Combine::InnerProduct => Vec::new(),
        };

        Ok(Self {
            queries,
            query_scalars,
            codes,
            combine,
        })
    }
}

impl Operands for FloatOperands<'_> {
    type Staged = f32;

    fn nqueries(&self) -> usize {
        self.queries.nrows()
    }

    fn load(&self, codes: Range<usize>, dst: &mut MutMatrixView<'_, f32>) {
        self.codes.gather(codes, dst, f16::to_f32);
    }

    fn distance(
        &self,
        queries: Range<usize>,
        codes: Range<usize>,
        staged: MatrixView<'_, f32>,
        out: &mut MutMatrixView<'_, f32>,
    ) {
        for (i, q) in queries.enumerate() {
            let x = self.queries.row(q);
            let row = out.row_mut(i);
            for ((o, y), c) in row.iter_mut().zip(staged.row_iter()).zip(codes.clone()) {
                let ip = arith::dot(x, y);
                *o = match self.combine {
                    Combine::L2 { code_norms } => self.query_scalars[q] + code_norms[c] - 2.0 * ip,
                    Combine::InnerProduct => ip,
                    Combine::Cosine { code_inverse } => {
                        ip * self.query_scalars[q] * code_inverse[c].to_f32()
                    }
                };
            }
        }
    }
}
