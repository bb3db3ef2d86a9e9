/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::ops::Range;

use half::f16;
use tessera_utils::{MatrixView, MutMatrixView};

use super::{CodeNorms, CodeSet, Expected, Inputs, Operands, QuerySet, Strategy};
use crate::{arith, error::InvocationError, layout::ZzView, norms::INT8_SCALE};

/// The factor applied to the integer squared distance of `dim`-dimensional int8 vectors.
///
/// The divisor grows with the dimension to keep the result inside the half precision
/// range.
pub fn int8_l2_scale(dim: usize) -> f32 {
    let divisor = (dim / 64).min((dim / 128 + 1).max(4)).max(1);
    INT8_SCALE / divisor as f32
}

#[derive(Debug, Clone)]
enum Combine<'a> {
    L2 {
        query_norms: Vec<i32>,
        code_norms: &'a [i32],
        scale: f32,
    },
    Cosine {
        query_magnitudes: Vec<f32>,
        code_magnitudes: &'a [f16],
    },
}

/// Int8 queries against int8 codes. Inner products accumulate in `i32`.
#[derive(Debug)]
pub(crate) struct Int8Operands<'a> {
    queries: MatrixView<'a, i8>,
    codes: ZzView<'a, i8>,
    combine: Combine<'a>,
}

impl<'a> Int8Operands<'a> {
    pub(crate) fn bind(expected: &Expected, inputs: &Inputs<'a>) -> Result<Self, InvocationError> {
        let QuerySet::Int8(queries) = inputs.queries else {
            return Err(expected.wrong_queries(&inputs.queries, "int8"));
        };
        let CodeSet::Int8(codes) = inputs.codes else {
            return Err(expected.wrong_codes(&inputs.codes));
        };
        expected.query_dim(queries.ncols())?;
        expected.codes(&codes)?;

        let combine = if expected.strategy == Strategy::Int8L2 {
            let code_norms = match inputs.code_norms {
                CodeNorms::Int8Squared(norms) => norms,
                CodeNorms::None => return Err(expected.missing("code norms")),
                other => return Err(expected.wrong_norms(&other, "i32 squared norms")),
            };
            expected.norms("code norms", code_norms.len())?;
            Combine::L2 {
                query_norms: queries.row_iter().map(arith::square_norm_i8).collect(),
                code_norms,
                scale: int8_l2_scale(expected.dim),
            }
        } else {
            let code_magnitudes = match inputs.code_norms {
                CodeNorms::Magnitudes(m) => m,
                CodeNorms::None => return Err(expected.missing("code magnitudes")),
                other => return Err(expected.wrong_norms(&other, "f16 magnitudes")),
            };
            expected.norms("code magnitudes", code_magnitudes.len())?;

            let query_magnitudes = match inputs.query_magnitudes {
                Some(m) if m.len() == queries.nrows() => m.iter().map(|v| v.to_f32()).collect(),
                Some(m) => {
                    return Err(InvocationError::Shape {
                        what: "query magnitudes",
                        axis: "entries",
                        got: m.len(),
                        expected: queries.nrows(),
                    })
                }
                None => queries
                    .row_iter()
                    .map(|row| {
                        let n = arith::square_norm_i8(row) as f32;
                        arith::narrow(arith::rsqrt_refined(INT8_SCALE * n)).to_f32()
                    })
                    .collect(),
            };
            Combine::Cosine {
                query_magnitudes,
                code_magnitudes,
            }
        };

        Ok(Self {
            queries,
            codes,
            combine,
        })
    }
}

impl Operands for Int8Operands<'_> {
    type Staged = i8;

    fn nqueries(&self) -> usize {
        self.queries.nrows()
    }

    fn load(&self, codes: Range<usize>, dst: &mut MutMatrixView<'_, i8>) {
        self.codes.gather(codes, dst, |v| v);
    }

    fn distance(
        &self,
        queries: Range<usize>,
        codes: Range<usize>,
        staged: MatrixView<'_, i8>,
        out: &mut MutMatrixView<'_, f32>,
    ) {
        for (i, q) in queries.enumerate() {
            let x = self.queries.row(q);
            let row = out.row_mut(i);
            for ((o, y), c) in row.iter_mut().zip(staged.row_iter()).zip(codes.clone()) {
                let ip = arith::dot_i8(x, y);
                *o = match &self.combine {
                    Combine::L2 {
                        query_norms,
                        code_norms,
                        scale,
                    } => (query_norms[q] + code_norms[c] - 2 * ip) as f32 * scale,
                    Combine::Cosine {
                        query_magnitudes,
                        code_magnitudes,
                    } => {
                        (ip as f32 * INT8_SCALE) * query_magnitudes[q] * code_magnitudes[c].to_f32()
                    }
                };
            }
        }
    }
}
