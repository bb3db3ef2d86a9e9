/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Tensor-level descriptions of configured kernels, for hosts that compile one kernel
//! variant per query page size ahead of time.

use serde::{Deserialize, Serialize};

use crate::{
    accum::DistAccumConfig,
    error::ConfigError,
    kernel::KernelConfig,
    metric::{Encoding, Extremum, Metric},
    num::{round_up, LANES},
    pq::PqTableConfig,
    strategy::Strategy,
    transform::LinearTransformConfig,
};

/// Shape and element type of one kernel operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub format: String,
    pub shape: Vec<usize>,
    #[serde(rename = "type")]
    pub dtype: String,
}

impl TensorDesc {
    fn nd(shape: impl Into<Vec<usize>>, dtype: &str) -> Self {
        Self {
            format: "ND".to_owned(),
            shape: shape.into(),
            dtype: dtype.to_owned(),
        }
    }
}

/// A kernel's type name and its operand list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDescriptor {
    pub op: String,
    pub input_desc: Vec<TensorDesc>,
    pub output_desc: Vec<TensorDesc>,
}

fn flags(workers: usize) -> TensorDesc {
    TensorDesc::nd([LANES * workers], "uint16")
}

fn query_type(encoding: Encoding) -> &'static str {
    match encoding {
        Encoding::Int8 => "int8",
        Encoding::F16 | Encoding::Sq8 => "float16",
    }
}

impl OpDescriptor {
    /// Describe a distance kernel invoked with `page` queries.
    pub fn distance(config: &KernelConfig, page: usize) -> Result<Self, ConfigError> {
        let strategy = Strategy::select(config.metric, config.encoding)?;
        let (dim, capacity) = (config.dim, config.capacity);
        let block = config.block_size();

        let metric = match config.metric {
            Metric::L2 => "L2",
            Metric::InnerProduct => "IP",
            Metric::Cosine => "Cos",
        };
        let encoding = match config.encoding {
            Encoding::F16 => "Flat",
            Encoding::Int8 => "Int8",
            Encoding::Sq8 => "SQ8",
        };
        let reduction = match (block, strategy.extremum()) {
            (None, _) => "",
            (Some(_), Extremum::Min) => "Mins",
            (Some(_), Extremum::Max) => "Maxs",
        };

        let mut inputs = vec![TensorDesc::nd([page, dim], query_type(config.encoding))];
        if block.is_some() {
            inputs.push(TensorDesc::nd([page, capacity.div_ceil(8)], "uint8"));
        }
        inputs.push(TensorDesc::nd(
            [capacity / LANES, dim / LANES, LANES, LANES],
            config.encoding.code_type(),
        ));
        match strategy {
            Strategy::FloatL2 | Strategy::Sq8L2 => {
                inputs.push(TensorDesc::nd([capacity], "float32"));
            }
            Strategy::FloatCosine => inputs.push(TensorDesc::nd([capacity], "float16")),
            Strategy::Int8L2 => inputs.push(TensorDesc::nd([capacity], "int32")),
            Strategy::Int8Cosine => {
                inputs.push(TensorDesc::nd([round_up(page, LANES)], "float16"));
                inputs.push(TensorDesc::nd([capacity], "float16"));
            }
            Strategy::FloatInnerProduct | Strategy::Sq8InnerProduct => {}
        }
        if config.encoding == Encoding::Sq8 {
            inputs.push(TensorDesc::nd([dim], "float16"));
            inputs.push(TensorDesc::nd([dim], "float16"));
        }
        if block.is_some() {
            inputs.push(TensorDesc::nd([8], "uint32"));
        }

        let mut outputs = vec![TensorDesc::nd([page, capacity], "float16")];
        if let Some(block) = block {
            outputs.push(TensorDesc::nd([page, 2 * block.blocks(capacity)], "float16"));
        }
        outputs.push(flags(config.workers));

        Ok(Self {
            op: format!("Distance{encoding}{metric}{reduction}"),
            input_desc: inputs,
            output_desc: outputs,
        })
    }

    /// Describe a PQ distance table build over `page` queries.
    pub fn pq_table(config: &PqTableConfig, page: usize) -> Self {
        let sub_dim = config.sub_dim();
        Self {
            op: "DistanceTableBuild".to_owned(),
            input_desc: vec![
                TensorDesc::nd([page, config.dim], "float16"),
                TensorDesc::nd([config.sub_quantizers, config.centroids * sub_dim], "float16"),
                TensorDesc::nd([page, config.nprobe], "int32"),
                TensorDesc::nd([config.lists, config.dim], "float16"),
            ],
            output_desc: vec![
                TensorDesc::nd(
                    [page, config.nprobe, config.sub_quantizers, config.centroids],
                    "float16",
                ),
                flags(config.workers),
            ],
        }
    }

    pub fn dist_accum(config: &DistAccumConfig) -> Self {
        Self {
            op: "DistAccum".to_owned(),
            input_desc: vec![TensorDesc::nd([config.rows, config.width], "float16")],
            output_desc: vec![
                TensorDesc::nd([config.rows], "float16"),
                flags(config.workers),
            ],
        }
    }

    pub fn linear_transform(config: &LinearTransformConfig, page: usize) -> Self {
        let (k, n) = (config.input_dim, config.output_dim);
        Self {
            op: "LinearTransform".to_owned(),
            input_desc: vec![
                TensorDesc::nd([page, k], "float16"),
                TensorDesc::nd([k / LANES, n, LANES], "float16"),
                TensorDesc::nd([n], "float32"),
            ],
            output_desc: vec![TensorDesc::nd([page, n], "float16")],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Profile;

    fn shapes(descs: &[TensorDesc]) -> Vec<(Vec<usize>, &str)> {
        descs
            .iter()
            .map(|d| (d.shape.clone(), d.dtype.as_str()))
            .collect()
    }

    #[test]
    fn flat_l2() {
        let config = KernelConfig::new(Metric::L2, Encoding::F16, Profile::Flat, 128, 1024);
        let desc = OpDescriptor::distance(&config, 48).unwrap();
        assert_eq!(desc.op, "DistanceFlatL2Mins");
        assert_eq!(
            shapes(&desc.input_desc),
            vec![
                (vec![48, 128], "float16"),
                (vec![48, 128], "uint8"),
                (vec![64, 8, 16, 16], "float16"),
                (vec![1024], "float32"),
                (vec![8], "uint32"),
            ]
        );
        assert_eq!(
            shapes(&desc.output_desc),
            vec![
                (vec![48, 1024], "float16"),
                (vec![48, 32], "float16"),
                (vec![32], "uint16"),
            ]
        );
    }

    #[test]
    fn int8_cosine_and_coarse() {
        let config = KernelConfig::new(Metric::Cosine, Encoding::Int8, Profile::IvfList, 64, 256);
        let desc = OpDescriptor::distance(&config, 18).unwrap();
        assert_eq!(desc.op, "DistanceInt8CosMaxs");
        assert_eq!(desc.input_desc[3].shape, vec![32]);
        assert_eq!(desc.output_desc[1].shape, vec![18, 16]);

        let coarse = KernelConfig {
            profile: Profile::IvfCoarse,
            ..config
        };
        let desc = OpDescriptor::distance(&coarse, 4).unwrap();
        assert_eq!(desc.op, "DistanceInt8Cos");
        assert_eq!(desc.input_desc.len(), 4);
        assert_eq!(desc.output_desc.len(), 2);
    }

    #[test]
    fn legacy_json_form() {
        let config = DistAccumConfig {
            width: 16,
            rows: 2048,
            workers: 1,
        };
        let json = serde_json::to_value(OpDescriptor::dist_accum(&config)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "op": "DistAccum",
                "input_desc": [{"format": "ND", "shape": [2048, 16], "type": "float16"}],
                "output_desc": [
                    {"format": "ND", "shape": [2048], "type": "float16"},
                    {"format": "ND", "shape": [16], "type": "uint16"}
                ]
            })
        );
    }

    #[test]
    fn unsupported_pairs_have_no_descriptor() {
        let config = KernelConfig::new(Metric::Cosine, Encoding::Sq8, Profile::Flat, 64, 256);
        assert!(OpDescriptor::distance(&config, 1).is_err());
    }
}
