/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The actual-count record and the per-query validity mask it describes.

use serde::{Deserialize, Serialize};

use crate::error::InvocationError;

/// The auxiliary record read once at the start of an invocation.
///
/// Packed as eight `u32` words:
/// ```text
/// [0] number of valid codes (a prefix of the code set)
/// [1] bit offset of code 0 of this batch within each mask row
/// [2] length in bytes of one mask row
/// [3] non-zero if the mask should be applied
/// [4..8] reserved, zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActualNum {
    pub count: u32,
    pub mask_offset: u32,
    pub mask_len: u32,
    pub use_mask: bool,
}

impl ActualNum {
    /// A record that declares `count` valid codes and no mask.
    pub const fn unmasked(count: u32) -> Self {
        Self {
            count,
            mask_offset: 0,
            mask_len: 0,
            use_mask: false,
        }
    }

    /// A record that declares `count` valid codes filtered by mask rows of `mask_len`
    /// bytes, where code 0 of this batch lives at bit `mask_offset`.
    pub const fn masked(count: u32, mask_offset: u32, mask_len: u32) -> Self {
        Self {
            count,
            mask_offset,
            mask_len,
            use_mask: true,
        }
    }

    /// Decode the packed form. Reserved words are ignored.
    pub fn from_words(words: [u32; 8]) -> Self {
        Self {
            count: words[0],
            mask_offset: words[1],
            mask_len: words[2],
            use_mask: words[3] != 0,
        }
    }

    /// Encode into the packed form.
    pub fn to_words(self) -> [u32; 8] {
        [
            self.count,
            self.mask_offset,
            self.mask_len,
            u32::from(self.use_mask),
            0,
            0,
            0,
            0,
        ]
    }

    pub fn count(&self) -> usize {
        self.count as usize
    }
}

/// A bitmap over (query, code) pairs.
///
/// Bits are LSB-first within each byte. A set bit keeps the code, a clear bit removes it.
#[derive(Debug, Clone, Copy)]
pub struct ValidityMask<'a> {
    bits: &'a [u8],
    offset: usize,
    row_len: usize,
}

impl<'a> ValidityMask<'a> {
    /// Bind `bits` to the layout described by `actual`.
    ///
    /// Returns `Ok(None)` if `actual` does not enable masking. Otherwise checks that every
    /// bit that `nqueries` queries over `actual.count` codes may touch lies within `bits`.
    pub fn bind(
        bits: Option<&'a [u8]>,
        actual: &ActualNum,
        nqueries: usize,
    ) -> Result<Option<Self>, InvocationError> {
        if !actual.use_mask {
            return Ok(None);
        }

        let offset = actual.mask_offset as usize;
        let row_len = actual.mask_len as usize;
        let count = actual.count();
        let len = bits.map_or(0, <[u8]>::len);

        if nqueries == 0 || count == 0 {
            return Ok(Some(Self {
                bits: bits.unwrap_or(&[]),
                offset,
                row_len,
            }));
        }

        let last_bit = offset + count - 1;
        let fits_row = last_bit / 8 < row_len;
        let fits_buffer = (nqueries - 1) * row_len + last_bit / 8 < len;
        match bits {
            Some(bits) if fits_row && fits_buffer => Ok(Some(Self {
                bits,
                offset,
                row_len,
            })),
            _ => Err(InvocationError::Mask {
                mask_len: row_len,
                last_bit,
                nqueries,
                len,
            }),
        }
    }

    /// Return whether `code` (relative to the start of this batch) is valid for `query`.
    #[inline]
    pub fn is_valid(&self, query: usize, code: usize) -> bool {
        let bit = self.offset + code;
        let byte = self.bits[query * self.row_len + bit / 8];
        (byte >> (bit % 8)) & 1 == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_round_trip() {
        let a = ActualNum::masked(100, 24, 16);
        assert_eq!(a.to_words(), [100, 24, 16, 1, 0, 0, 0, 0]);
        assert_eq!(ActualNum::from_words(a.to_words()), a);

        let b = ActualNum::from_words([7, 0, 0, 0, 9, 9, 9, 9]);
        assert_eq!(b, ActualNum::unmasked(7));
    }

    #[test]
    fn unmasked_binds_to_none() {
        let mask = ValidityMask::bind(None, &ActualNum::unmasked(64), 3).unwrap();
        assert!(mask.is_none());
    }

    #[test]
    fn lsb_first_with_offset() {
        // Two queries, rows of 2 bytes.
        let bits = [0b0000_0101u8, 0b1000_0000, 0xff, 0x00];
        let actual = ActualNum::masked(8, 3, 2);
        let mask = ValidityMask::bind(Some(&bits), &actual, 2).unwrap().unwrap();

        // Query 0: bits 3..11 are 0,0,0,0,0 | 0,0,0.
        for code in 0..8 {
            assert!(!mask.is_valid(0, code), "code {code}");
        }

        // Query 1: bits 3..8 set, 8..11 clear.
        for code in 0..5 {
            assert!(mask.is_valid(1, code), "code {code}");
        }
        for code in 5..8 {
            assert!(!mask.is_valid(1, code), "code {code}");
        }

        // Bit 2 of query 0 is set, bit 15 is set.
        let shifted = ValidityMask::bind(Some(&bits), &ActualNum::masked(14, 2, 2), 1)
            .unwrap()
            .unwrap();
        assert!(shifted.is_valid(0, 0));
        assert!(shifted.is_valid(0, 13));
        assert!(!shifted.is_valid(0, 12));
    }

    #[test]
    fn short_masks_are_rejected() {
        let bits = [0u8; 3];

        // The last row needs byte 2 * 2 + 1.
        let err = ValidityMask::bind(Some(&bits), &ActualNum::masked(16, 0, 2), 3).unwrap_err();
        assert_eq!(
            err,
            InvocationError::Mask {
                mask_len: 2,
                last_bit: 15,
                nqueries: 3,
                len: 3
            }
        );

        // The row itself is too short for the offset.
        assert!(ValidityMask::bind(Some(&bits), &ActualNum::masked(8, 4, 1), 1).is_err());

        // Masking requested without bits.
        assert!(ValidityMask::bind(None, &ActualNum::masked(1, 0, 1), 1).is_err());
    }
}
