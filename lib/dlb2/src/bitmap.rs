// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-size bit pool used to track history-list entries.
//!
//! A set bit marks an entry as available to the owner of the bitmap.

use bitvec::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitmapError {
    #[error("range {base}..{} exceeds bitmap of {size} bits", base + len)]
    OutOfRange { base: usize, len: usize, size: usize },

    #[error("bitmap lengths differ ({0} vs {1})")]
    LengthMismatch(usize, usize),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    bits: BitVec<u64, Lsb0>,
}

impl Bitmap {
    /// Create a bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self { bits: bitvec![u64, Lsb0; 0; len] }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn zero(&mut self) {
        self.bits.fill(false);
    }

    pub fn fill(&mut self) {
        self.bits.fill(true);
    }

    pub fn is_set(&self, bit: usize) -> bool {
        self.bits.get(bit).map(|b| *b).unwrap_or(false)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    fn check_range(&self, base: usize, len: usize) -> Result<(), BitmapError> {
        match base.checked_add(len) {
            Some(end) if end <= self.bits.len() => Ok(()),
            _ => Err(BitmapError::OutOfRange {
                base,
                len,
                size: self.bits.len(),
            }),
        }
    }

    pub fn set_range(
        &mut self,
        base: usize,
        len: usize,
    ) -> Result<(), BitmapError> {
        self.check_range(base, len)?;
        self.bits[base..base + len].fill(true);
        Ok(())
    }

    pub fn clear_range(
        &mut self,
        base: usize,
        len: usize,
    ) -> Result<(), BitmapError> {
        self.check_range(base, len)?;
        self.bits[base..base + len].fill(false);
        Ok(())
    }

    /// Find the lowest run of `len` consecutive set bits, returning its base.
    ///
    /// A zero-length request is satisfied at bit 0.
    pub fn find_set_range(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return Some(0);
        }
        if len > self.bits.len() {
            return None;
        }

        let mut run = 0;
        for (i, bit) in self.bits.iter().by_vals().enumerate() {
            if !bit {
                run = 0;
                continue;
            }
            run += 1;
            if run == len {
                return Some(i + 1 - len);
            }
        }
        None
    }

    /// Length of the longest run of consecutive set bits.
    pub fn longest_set_range(&self) -> usize {
        let mut longest = 0;
        let mut run = 0;
        for bit in self.bits.iter().by_vals() {
            if bit {
                run += 1;
                longest = longest.max(run);
            } else {
                run = 0;
            }
        }
        longest
    }

    /// OR `other` into this bitmap, returning the resulting population count.
    pub fn or_assign(&mut self, other: &Bitmap) -> Result<usize, BitmapError> {
        if self.bits.len() != other.bits.len() {
            return Err(BitmapError::LengthMismatch(
                self.bits.len(),
                other.bits.len(),
            ));
        }
        self.bits |= other.bits.as_bitslice();
        Ok(self.count())
    }

    /// Base and length of each run of set bits, in ascending order.
    pub fn set_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        let mut start = None;
        for (i, bit) in self.bits.iter().by_vals().enumerate() {
            match (bit, start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    ranges.push((s, i - s));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            ranges.push((s, self.bits.len() - s));
        }
        ranges
    }
}
