// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

//! Shared fixtures for the criterion benches.

use enn_core::{Dataset, EnnError, Sequence};
use enn_eval::{ClassShapesConfig, class_shapes};

/// Deterministic univariate wave; `phase` shifts it along the time axis.
pub fn wave(length: usize, phase: f64) -> Result<Sequence, EnnError> {
    let values = (0..length)
        .map(|t| {
            let x = t as f64 * 0.05 + phase;
            x.sin() + 0.1 * (3.0 * x).cos()
        })
        .collect();
    Sequence::univariate(values, 0)
}

/// Four-class shifted-shape dataset with `4 * per_class` sequences.
pub fn shapes_dataset(per_class: usize, length: usize) -> Result<Dataset, EnnError> {
    class_shapes(&ClassShapesConfig {
        n_classes: 4,
        per_class,
        length,
        dims: 1,
        max_shift: length / 8,
        noise_std: 0.25,
        seed: 42,
    })
}
