/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Alignment arithmetic and number types with a restricted range.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The native granularity of codes and dimensions.
pub const LANES: usize = 16;

/// The number of codes summarized by one block winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct BlockSize(usize);

impl BlockSize {
    pub const B16: Self = Self(16);
    pub const B32: Self = Self(32);
    pub const B64: Self = Self(64);

    pub const fn new(value: usize) -> Result<Self, ConfigError> {
        match value {
            16 | 32 | 64 => Ok(Self(value)),
            _ => Err(ConfigError::BlockSize(value)),
        }
    }

    pub const fn get(self) -> usize {
        self.0
    }

    /// Number of blocks, including a trailing partial one, covering `len` codes.
    pub const fn blocks(self, len: usize) -> usize {
        len.div_ceil(self.0)
    }
}

impl TryFrom<usize> for BlockSize {
    type Error = ConfigError;
    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlockSize> for usize {
    fn from(value: BlockSize) -> usize {
        value.0
    }
}

/// Round `value` down to a multiple of `alignment`.
#[inline]
pub const fn round_down(value: usize, alignment: usize) -> usize {
    value / alignment * alignment
}

/// Round `value` up to a multiple of `alignment`.
#[inline]
pub const fn round_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Return `Ok(())` if `value` is a multiple of `alignment`.
pub(crate) fn check_aligned(
    what: &'static str,
    value: usize,
    alignment: usize,
) -> Result<(), ConfigError> {
    if value % alignment == 0 {
        Ok(())
    } else {
        Err(ConfigError::Misaligned {
            what,
            value,
            alignment,
        })
    }
}

/// Return `Ok(())` if `value` is non-zero.
pub(crate) fn check_nonzero(what: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { what })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn block_sizes(#[values(16, 32, 64)] b: usize) {
        let block = BlockSize::new(b).unwrap();
        assert_eq!(block.get(), b);
        assert_eq!(block.blocks(0), 0);
        assert_eq!(block.blocks(b), 1);
        assert_eq!(block.blocks(b + 1), 2);
    }

    #[rstest]
    fn bad_block_sizes(#[values(0, 8, 48, 128)] b: usize) {
        assert_eq!(BlockSize::new(b).unwrap_err(), ConfigError::BlockSize(b));
    }

    #[test]
    fn block_size_serde() {
        let b: BlockSize = serde_json::from_str("32").unwrap();
        assert_eq!(b, BlockSize::B32);
        assert!(serde_json::from_str::<BlockSize>("24").is_err());
        assert_eq!(serde_json::to_string(&BlockSize::B64).unwrap(), "64");
    }

    #[test]
    fn rounding() {
        assert_eq!(round_down(100, 16), 96);
        assert_eq!(round_up(100, 16), 112);
        assert_eq!(round_up(96, 16), 96);
        assert_eq!(round_down(15, 16), 0);
    }

    #[test]
    fn checks() {
        assert!(check_aligned("dim", 128, 16).is_ok());
        assert_eq!(
            check_aligned("dim", 100, 16).unwrap_err().to_string(),
            "dim (100) must be a multiple of 16"
        );
        assert_eq!(
            check_nonzero("workers", 0).unwrap_err().to_string(),
            "workers cannot be zero"
        );
    }
}
