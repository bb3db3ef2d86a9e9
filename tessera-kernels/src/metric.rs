/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Tags that select a kernel variant.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distance metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Squared Euclidean distance. Lower is closer.
    L2,
    /// Raw inner product. Higher is closer.
    InnerProduct,
    /// Cosine similarity. Higher is closer.
    Cosine,
}

impl Metric {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::L2 => "l2",
            Self::InnerProduct => "innerproduct",
            Self::Cosine => "cosine",
        }
    }

    /// The direction in which this metric ranks candidates.
    pub const fn extremum(self) -> Extremum {
        match self {
            Self::L2 => Extremum::Min,
            Self::InnerProduct | Self::Cosine => Extremum::Max,
        }
    }
}

/// Storage encoding of the database codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Half precision floats.
    F16,
    /// Signed 8-bit integers.
    Int8,
    /// 8-bit scalar quantization with per-dimension affine constants.
    Sq8,
}

impl Encoding {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::F16 => "f16",
            Self::Int8 => "int8",
            Self::Sq8 => "sq8",
        }
    }

    /// The legacy tensor type name of a code element.
    pub const fn code_type(self) -> &'static str {
        match self {
            Self::F16 => "float16",
            Self::Int8 => "int8",
            Self::Sq8 => "uint8",
        }
    }
}

/// Which end of the metric a block reduction keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Extremum {
    Min,
    Max,
}

impl Extremum {
    /// A value that loses to every finite distance under this reduction.
    pub const fn sentinel(self) -> f32 {
        match self {
            Self::Min => f32::INFINITY,
            Self::Max => f32::NEG_INFINITY,
        }
    }

    /// Return `true` if `candidate` strictly beats `incumbent`.
    ///
    /// Strictness makes the earliest of several equal values win.
    #[inline]
    pub fn beats(self, candidate: f32, incumbent: f32) -> bool {
        match self {
            Self::Min => candidate < incumbent,
            Self::Max => candidate > incumbent,
        }
    }
}

/// The search structure a kernel serves. Selects the block size and code alignment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Exhaustive scan over the whole database.
    #[default]
    Flat,
    /// Scan of one inverted list.
    IvfList,
    /// Scoring of the coarse centroids. Produces distances only.
    IvfCoarse,
}

impl Profile {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::IvfList => "ivflist",
            Self::IvfCoarse => "ivfcoarse",
        }
    }
}

macro_rules! display_and_parse {
    ($T:ident, $what:literal, [$($variant:ident),+]) => {
        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $T {
            type Err = ParseTagError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let lower = s.to_lowercase();
                $(
                    if lower == $T::$variant.as_str() {
                        return Ok($T::$variant);
                    }
                )+
                Err(ParseTagError { what: $what, value: s.to_string() })
            }
        }
    };
}

display_and_parse!(Metric, "metric", [L2, InnerProduct, Cosine]);
display_and_parse!(Encoding, "encoding", [F16, Int8, Sq8]);
display_and_parse!(Profile, "profile", [Flat, IvfList, IvfCoarse]);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid format for {what}: {value}")]
pub struct ParseTagError {
    what: &'static str,
    value: String,
}
