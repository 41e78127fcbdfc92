// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use enn_core::{Dataset, Sequence};
use enn_search::{IterationStrategy, KnnConfig, PayloadCodec, SymmetryStrategy};

pub const MAX_SEQUENCES: usize = 12;
pub const MAX_LENGTH: usize = 16;

pub struct ByteCursor<'a> {
    data: &'a [u8],
    idx: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, idx: 0 }
    }

    pub fn next_u8(&mut self) -> u8 {
        let value = self.data.get(self.idx).copied().unwrap_or(0);
        self.idx = self.idx.saturating_add(1);
        value
    }

    pub fn next_i16(&mut self) -> i16 {
        let bytes = [self.next_u8(), self.next_u8()];
        i16::from_le_bytes(bytes)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut bytes = [0_u8; 8];
        for byte in &mut bytes {
            *byte = self.next_u8();
        }
        u64::from_le_bytes(bytes)
    }

    pub fn take_padded(&mut self, len: usize) -> Vec<u8> {
        let mut out = vec![0_u8; len];
        let available = self.data.len().saturating_sub(self.idx);
        let copy_len = available.min(len);
        if copy_len > 0 {
            let start = self.idx;
            let end = start + copy_len;
            out[..copy_len].copy_from_slice(&self.data[start..end]);
            self.idx = end;
        }
        out
    }
}

pub fn bounded(seed: u8, min: usize, max_inclusive: usize) -> usize {
    if max_inclusive <= min {
        min
    } else {
        min + (usize::from(seed) % (max_inclusive - min + 1))
    }
}

pub fn payload_codec_from_seed(seed: u8) -> PayloadCodec {
    if seed & 1 == 0 {
        PayloadCodec::Json
    } else {
        PayloadCodec::Bincode
    }
}

/// Small equal-length univariate dataset with labels in `0..3`.
pub fn dataset(cursor: &mut ByteCursor<'_>) -> Option<Dataset> {
    let n = bounded(cursor.next_u8(), 1, MAX_SEQUENCES);
    let length = bounded(cursor.next_u8(), 1, MAX_LENGTH);
    let sequences = (0..n)
        .map(|_| {
            let values = (0..length)
                .map(|_| (f64::from(cursor.next_i16()) / 64.0).clamp(-512.0, 512.0))
                .collect();
            let label = usize::from(cursor.next_u8() % 3);
            Sequence::univariate(values, label).ok()
        })
        .collect::<Option<Vec<_>>>()?;
    Dataset::from_sequences(sequences).ok()
}

pub fn knn_config(cursor: &mut ByteCursor<'_>) -> KnnConfig {
    let flags = cursor.next_u8();
    KnnConfig {
        k: bounded(cursor.next_u8(), 1, 4),
        early_abandon: flags & 1 == 0,
        lower_bound_pruning: flags & 2 == 0,
        iteration: if flags & 4 == 0 {
            IterationStrategy::Random
        } else {
            IterationStrategy::Linear
        },
        symmetry: if flags & 8 == 0 {
            SymmetryStrategy::Mirror
        } else {
            SymmetryStrategy::Cache
        },
        seed: cursor.next_u64(),
        ..KnnConfig::default()
    }
}

/// Applies byte flips and one structural edit to `base`.
pub fn mutate_input(base: &[u8], cursor: &mut ByteCursor<'_>) -> Vec<u8> {
    let mut out = base.to_vec();
    let flips = bounded(cursor.next_u8(), 0, 24);
    for _ in 0..flips {
        if out.is_empty() {
            break;
        }
        let idx = usize::from(cursor.next_u8()) % out.len();
        out[idx] ^= cursor.next_u8();
    }

    match cursor.next_u8() % 4 {
        0 => {}
        1 => {
            let new_len = bounded(cursor.next_u8(), 0, out.len());
            out.truncate(new_len);
        }
        2 => {
            let append_len = bounded(cursor.next_u8(), 0, 128);
            let append = cursor.take_padded(append_len);
            out.extend_from_slice(&append);
        }
        _ => {
            if out.len() >= 2 {
                let i = usize::from(cursor.next_u8()) % out.len();
                let j = usize::from(cursor.next_u8()) % out.len();
                out.swap(i, j);
            }
        }
    }

    out
}
