/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Selection of the distance decomposition for a (metric, encoding) pair.
//!
//! A [`Strategy`] is chosen once when a kernel is constructed. At invocation time it
//! binds the caller's buffers into an operand set implementing [`Operands`], whose two
//! methods are the pure per-tile functions driven by the executor:
//!
//! * [`Operands::load`] stages (and for quantized codes, expands) a range of codes.
//! * [`Operands::distance`] turns a query range and a staged code tile into an `f32`
//!   distance tile.
//!
//! The direction of the block reduction comes from [`Strategy::extremum`].

use std::ops::Range;

use half::f16;
use tessera_utils::{MatrixView, MutMatrixView};

use crate::{
    actual::ActualNum,
    error::{ConfigError, InvocationError},
    layout::ZzView,
    metric::{Encoding, Extremum, Metric},
    norms::Sq8Quantizer,
};

mod float;
mod int8;
mod sq8;

pub(crate) use float::FloatOperands;
pub use int8::int8_l2_scale;
pub(crate) use int8::Int8Operands;
pub(crate) use sq8::Sq8Operands;

/// A staged code tile and the query rows it is scored against.
pub(crate) trait Operands: Sync {
    /// Element type of a staged code tile.
    type Staged: Copy + Default + Send + Sync;

    fn nqueries(&self) -> usize;

    /// Copy the codes in `codes` into the leading rows of `dst`.
    fn load(&self, codes: Range<usize>, dst: &mut MutMatrixView<'_, Self::Staged>);

    /// Write the distance between each query in `queries` and each code in `codes` into
    /// `out`. `staged` holds the rows of `codes` as produced by [`Self::load`].
    fn distance(
        &self,
        queries: Range<usize>,
        codes: Range<usize>,
        staged: MatrixView<'_, Self::Staged>,
        out: &mut MutMatrixView<'_, f32>,
    );
}

/// Supported (metric, encoding) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `‖x‖² + ‖y‖² − 2⟨x,y⟩` over half precision codes.
    FloatL2,
    /// `⟨x,y⟩` over half precision codes.
    FloatInnerProduct,
    /// `⟨x,y⟩ / (‖x‖·‖y‖)` over half precision codes.
    FloatCosine,
    /// Squared L2 against the dequantized SQ8 codes.
    Sq8L2,
    /// Inner product against the dequantized SQ8 codes.
    Sq8InnerProduct,
    /// Scaled integer squared L2.
    Int8L2,
    /// Cosine from integer inner products and precomputed magnitudes.
    Int8Cosine,
}

impl Strategy {
    pub fn select(metric: Metric, encoding: Encoding) -> Result<Self, ConfigError> {
        match (metric, encoding) {
            (Metric::L2, Encoding::F16) => Ok(Self::FloatL2),
            (Metric::InnerProduct, Encoding::F16) => Ok(Self::FloatInnerProduct),
            (Metric::Cosine, Encoding::F16) => Ok(Self::FloatCosine),
            (Metric::L2, Encoding::Sq8) => Ok(Self::Sq8L2),
            (Metric::InnerProduct, Encoding::Sq8) => Ok(Self::Sq8InnerProduct),
            (Metric::L2, Encoding::Int8) => Ok(Self::Int8L2),
            (Metric::Cosine, Encoding::Int8) => Ok(Self::Int8Cosine),
            (metric, encoding) => Err(ConfigError::Unsupported { metric, encoding }),
        }
    }

    pub fn metric(self) -> Metric {
        match self {
            Self::FloatL2 | Self::Sq8L2 | Self::Int8L2 => Metric::L2,
            Self::FloatInnerProduct | Self::Sq8InnerProduct => Metric::InnerProduct,
            Self::FloatCosine | Self::Int8Cosine => Metric::Cosine,
        }
    }

    pub fn encoding(self) -> Encoding {
        match self {
            Self::FloatL2 | Self::FloatInnerProduct | Self::FloatCosine => Encoding::F16,
            Self::Sq8L2 | Self::Sq8InnerProduct => Encoding::Sq8,
            Self::Int8L2 | Self::Int8Cosine => Encoding::Int8,
        }
    }

    pub fn extremum(self) -> Extremum {
        self.metric().extremum()
    }

    /// Bytes per staged code element.
    pub fn staged_width(self) -> usize {
        match self.encoding() {
            Encoding::F16 | Encoding::Sq8 => std::mem::size_of::<f32>(),
            Encoding::Int8 => std::mem::size_of::<i8>(),
        }
    }
}

/// Query vectors for one invocation.
#[derive(Debug, Clone, Copy)]
pub enum QuerySet<'a> {
    F16(MatrixView<'a, f16>),
    Int8(MatrixView<'a, i8>),
}

impl QuerySet<'_> {
    pub fn nqueries(&self) -> usize {
        match self {
            Self::F16(q) => q.nrows(),
            Self::Int8(q) => q.nrows(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::F16(_) => "f16",
            Self::Int8(_) => "int8",
        }
    }
}

/// Database codes in zZ layout.
#[derive(Debug, Clone, Copy)]
pub enum CodeSet<'a> {
    F16(ZzView<'a, f16>),
    Int8(ZzView<'a, i8>),
    Sq8(ZzView<'a, u8>),
}

impl CodeSet<'_> {
    fn describe(&self) -> &'static str {
        match self {
            Self::F16(_) => "f16",
            Self::Int8(_) => "int8",
            Self::Sq8(_) => "sq8",
        }
    }
}

/// Precomputed per-code scalars.
#[derive(Debug, Clone, Copy, Default)]
pub enum CodeNorms<'a> {
    #[default]
    None,
    /// Squared L2 norms (of the dequantized vectors for SQ8 codes).
    Squared(&'a [f32]),
    /// Integer squared L2 norms of int8 codes.
    Int8Squared(&'a [i32]),
    /// `1/‖y‖` for half precision codes, `rsqrt(0.01·‖y‖²)` for int8 codes.
    Magnitudes(&'a [f16]),
}

impl CodeNorms<'_> {
    fn describe(&self) -> &'static str {
        match self {
            Self::None => "nothing",
            Self::Squared(_) => "f32 squared norms",
            Self::Int8Squared(_) => "i32 squared norms",
            Self::Magnitudes(_) => "f16 magnitudes",
        }
    }
}

/// Everything a distance kernel reads during one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Inputs<'a> {
    pub queries: QuerySet<'a>,
    pub codes: CodeSet<'a>,
    pub code_norms: CodeNorms<'a>,
    /// Query magnitudes for the int8 cosine kernel. Computed on the fly when absent.
    pub query_magnitudes: Option<&'a [f16]>,
    pub sq8: Option<&'a Sq8Quantizer>,
    pub actual: ActualNum,
    pub mask: Option<&'a [u8]>,
}

impl<'a> Inputs<'a> {
    pub fn new(queries: QuerySet<'a>, codes: CodeSet<'a>, actual: ActualNum) -> Self {
        Self {
            queries,
            codes,
            code_norms: CodeNorms::None,
            query_magnitudes: None,
            sq8: None,
            actual,
            mask: None,
        }
    }

    pub fn with_code_norms(mut self, norms: CodeNorms<'a>) -> Self {
        self.code_norms = norms;
        self
    }

    pub fn with_query_magnitudes(mut self, magnitudes: &'a [f16]) -> Self {
        self.query_magnitudes = Some(magnitudes);
        self
    }

    pub fn with_sq8(mut self, quantizer: &'a Sq8Quantizer) -> Self {
        self.sq8 = Some(quantizer);
        self
    }

    pub fn with_mask(mut self, mask: &'a [u8]) -> Self {
        self.mask = Some(mask);
        self
    }
}

/// The shape a strategy expects its inputs to have.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Expected {
    pub(crate) strategy: Strategy,
    pub(crate) dim: usize,
    pub(crate) capacity: usize,
}

impl Expected {
    pub(crate) fn query_dim(&self, got: usize) -> Result<(), InvocationError> {
        self.check("queries", "columns", got, self.dim)
    }

    pub(crate) fn codes<T: Copy>(&self, codes: &ZzView<'_, T>) -> Result<(), InvocationError> {
        self.check("codes", "dimensions", codes.dim(), self.dim)?;
        self.check("codes", "rows", codes.ncodes(), self.capacity)
    }

    pub(crate) fn norms(&self, what: &'static str, got: usize) -> Result<(), InvocationError> {
        self.check(what, "entries", got, self.capacity)
    }

    fn check(
        &self,
        what: &'static str,
        axis: &'static str,
        got: usize,
        expected: usize,
    ) -> Result<(), InvocationError> {
        if got == expected {
            Ok(())
        } else {
            Err(InvocationError::Shape {
                what,
                axis,
                got,
                expected,
            })
        }
    }

    pub(crate) fn missing(&self, what: &'static str) -> InvocationError {
        InvocationError::Missing {
            what,
            metric: self.strategy.metric(),
            encoding: self.strategy.encoding(),
        }
    }

    pub(crate) fn wrong_queries(&self, queries: &QuerySet<'_>, expected: &'static str) -> InvocationError {
        InvocationError::Encoding {
            what: "queries",
            got: queries.describe(),
            expected,
        }
    }

    pub(crate) fn wrong_codes(&self, codes: &CodeSet<'_>) -> InvocationError {
        InvocationError::Encoding {
            what: "codes",
            got: codes.describe(),
            expected: self.strategy.encoding().as_str(),
        }
    }

    pub(crate) fn wrong_norms(&self, norms: &CodeNorms<'_>, expected: &'static str) -> InvocationError {
        InvocationError::Encoding {
            what: "code norms",
            got: norms.describe(),
            expected,
        }
    }
}
