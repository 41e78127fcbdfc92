// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::model::{ABANDONED, DistanceMeasure};
use enn_core::{Dataset, EnnError, Sequence};

/// Lock-step squared Euclidean distance.
///
/// The square root is skipped: it is monotone, so neighbour ranking is
/// unchanged. Sequences must have equal length and dimensionality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Euclidean;

impl Euclidean {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn check_equal_shape(a: &Sequence, b: &Sequence, name: &str) -> Result<(), EnnError> {
    if a.len() != b.len() || a.dims() != b.dims() {
        return Err(EnnError::invalid_input(format!(
            "{name} requires equal-shape sequences; got len={}x{} vs len={}x{}",
            a.len(),
            a.dims(),
            b.len(),
            b.dims()
        )));
    }
    Ok(())
}

impl DistanceMeasure for Euclidean {
    type Stats = ();

    fn name(&self) -> &'static str {
        "euclidean"
    }

    fn validate(&self, data: &Dataset) -> Result<(), EnnError> {
        let Some(first) = data.get(0) else {
            return Ok(());
        };
        for (idx, seq) in data.iter().enumerate().skip(1) {
            if seq.len() != first.len() {
                return Err(EnnError::invalid_input(format!(
                    "euclidean requires equal-length sequences; sequence {idx} has len={}, expected {}",
                    seq.len(),
                    first.len()
                )));
            }
        }
        Ok(())
    }

    fn validate_pair(&self, a: &Sequence, b: &Sequence) -> Result<(), EnnError> {
        check_equal_shape(a, b, self.name())
    }

    fn is_symmetric(&self) -> bool {
        true
    }

    fn precompute(&self, _seq: &Sequence) -> Result<(), EnnError> {
        Ok(())
    }

    fn distance(&self, a: &Sequence, b: &Sequence, cutoff: f64) -> Result<f64, EnnError> {
        check_equal_shape(a, b, self.name())?;
        let dims = a.dims();
        let mut sum = 0.0;
        for (t, (xa, xb)) in a
            .values()
            .chunks_exact(dims)
            .zip(b.values().chunks_exact(dims))
            .enumerate()
        {
            for (va, vb) in xa.iter().zip(xb) {
                let diff = va - vb;
                sum += diff * diff;
            }
            if sum > cutoff && t + 1 < a.len() {
                return Ok(ABANDONED);
            }
        }
        Ok(sum)
    }
}
