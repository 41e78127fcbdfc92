// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-capacity bitset of examined candidate indices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenSet {
    words: Vec<u64>,
    capacity: usize,
    count: usize,
}

impl SeenSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(WORD_BITS)],
            capacity,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn contains(&self, index: usize) -> bool {
        index < self.capacity && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Marks `index`; returns false when it was already marked.
    pub fn insert(&mut self, index: usize) -> bool {
        debug_assert!(index < self.capacity, "seen index {index} out of range");
        let word = &mut self.words[index / WORD_BITS];
        let mask = 1 << (index % WORD_BITS);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        self.count += 1;
        true
    }

    /// Recounts set bits; used after deserializing untrusted words.
    pub(crate) fn is_consistent(&self) -> bool {
        let expected_words = self.capacity.div_ceil(WORD_BITS);
        if self.words.len() != expected_words {
            return false;
        }
        let tail_bits = self.capacity % WORD_BITS;
        if tail_bits != 0
            && let Some(last) = self.words.last()
            && last >> tail_bits != 0
        {
            return false;
        }
        let ones: usize = self.words.iter().map(|w| w.count_ones() as usize).sum();
        ones == self.count
    }
}
