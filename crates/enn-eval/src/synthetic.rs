// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use enn_core::{Dataset, EnnError, Sequence};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

/// Phase-shifted class prototypes with Gaussian noise.
///
/// Class `c` follows `sin(2 * pi * (c + 1) * t / length)` in every
/// dimension, offset by `0.5 * d` per dimension `d`. Each instance is
/// circularly shifted by up to `max_shift` steps, which lock-step measures
/// penalise and elastic measures absorb.
#[derive(Clone, Debug)]
pub struct ClassShapesConfig {
    pub n_classes: usize,
    pub per_class: usize,
    pub length: usize,
    pub dims: usize,
    pub max_shift: usize,
    pub noise_std: f64,
    pub seed: u64,
}

/// Gaussian random walks whose drift depends on the class.
#[derive(Clone, Debug)]
pub struct RandomWalkConfig {
    pub n_classes: usize,
    pub per_class: usize,
    pub length: usize,
    pub drift_step: f64,
    pub step_std: f64,
    pub seed: u64,
}

fn validate_shape(n_classes: usize, per_class: usize, length: usize) -> Result<(), EnnError> {
    if n_classes == 0 {
        return Err(EnnError::invalid_input("n_classes must be >= 1; got 0"));
    }
    if per_class == 0 {
        return Err(EnnError::invalid_input("per_class must be >= 1; got 0"));
    }
    if length == 0 {
        return Err(EnnError::invalid_input("length must be >= 1; got 0"));
    }
    n_classes.checked_mul(per_class).ok_or_else(|| {
        EnnError::invalid_input(format!(
            "n_classes*per_class overflows usize; got n_classes={n_classes}, per_class={per_class}"
        ))
    })?;
    Ok(())
}

fn validate_non_negative(value: f64, label: &str) -> Result<(), EnnError> {
    if !value.is_finite() || value < 0.0 {
        return Err(EnnError::invalid_input(format!(
            "{label} must be finite and >= 0.0; got {value}"
        )));
    }
    Ok(())
}

fn normal(std: f64, label: &str) -> Result<Normal<f64>, EnnError> {
    Normal::new(0.0, std)
        .map_err(|err| EnnError::invalid_input(format!("{label} is not a valid std: {err}")))
}

/// Generates [`ClassShapesConfig::per_class`] instances per class, ordered by class.
pub fn class_shapes(cfg: &ClassShapesConfig) -> Result<Dataset, EnnError> {
    validate_shape(cfg.n_classes, cfg.per_class, cfg.length)?;
    if cfg.dims == 0 {
        return Err(EnnError::invalid_input("dims must be >= 1; got 0"));
    }
    if cfg.max_shift >= cfg.length {
        return Err(EnnError::invalid_input(format!(
            "max_shift must be < length; got max_shift={}, length={}",
            cfg.max_shift, cfg.length
        )));
    }
    validate_non_negative(cfg.noise_std, "noise_std")?;

    let noise = normal(cfg.noise_std, "noise_std")?;
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut sequences = Vec::with_capacity(cfg.n_classes * cfg.per_class);
    for class in 0..cfg.n_classes {
        let frequency = (class + 1) as f64;
        for _ in 0..cfg.per_class {
            let shift = rng.gen_range(0..=cfg.max_shift);
            let mut values = Vec::with_capacity(cfg.length * cfg.dims);
            for t in 0..cfg.length {
                let source = (t + shift) % cfg.length;
                let base = (2.0 * PI * frequency * source as f64 / cfg.length as f64).sin();
                for d in 0..cfg.dims {
                    values.push(base + 0.5 * d as f64 + noise.sample(&mut rng));
                }
            }
            sequences.push(Sequence::new(values, cfg.dims, class)?);
        }
    }
    Dataset::new(sequences, cfg.n_classes)
}

/// Generates univariate random walks; class `c` drifts by `c * drift_step` per step.
pub fn random_walks(cfg: &RandomWalkConfig) -> Result<Dataset, EnnError> {
    validate_shape(cfg.n_classes, cfg.per_class, cfg.length)?;
    validate_non_negative(cfg.step_std, "step_std")?;
    if !cfg.drift_step.is_finite() {
        return Err(EnnError::invalid_input(format!(
            "drift_step must be finite; got {}",
            cfg.drift_step
        )));
    }

    let steps = normal(cfg.step_std, "step_std")?;
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut sequences = Vec::with_capacity(cfg.n_classes * cfg.per_class);
    for class in 0..cfg.n_classes {
        let drift = class as f64 * cfg.drift_step;
        for _ in 0..cfg.per_class {
            let mut level = 0.0;
            let values = (0..cfg.length)
                .map(|_| {
                    level += drift + steps.sample(&mut rng);
                    level
                })
                .collect();
            sequences.push(Sequence::univariate(values, class)?);
        }
    }
    Dataset::new(sequences, cfg.n_classes)
}

/// Shuffles `data` with `seed` and moves `test_fraction` of it into a test set.
///
/// Both parts keep the class count of `data`. The test set holds
/// `round(len * test_fraction)` sequences, at least one and leaving at least
/// one for training.
pub fn train_test_split(
    data: &Dataset,
    test_fraction: f64,
    seed: u64,
) -> Result<(Dataset, Dataset), EnnError> {
    if !test_fraction.is_finite() || test_fraction <= 0.0 || test_fraction >= 1.0 {
        return Err(EnnError::invalid_input(format!(
            "test_fraction must be in (0, 1); got {test_fraction}"
        )));
    }
    if data.len() < 2 {
        return Err(EnnError::invalid_input(format!(
            "train_test_split requires at least 2 sequences; got {}",
            data.len()
        )));
    }
    let mut order: Vec<usize> = (0..data.len()).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let n_test = ((data.len() as f64 * test_fraction).round() as usize).clamp(1, data.len() - 1);
    let pick = |indices: &[usize]| -> Vec<Sequence> {
        indices
            .iter()
            .filter_map(|&index| data.get(index).cloned())
            .collect()
    };
    let test = Dataset::new(pick(&order[..n_test]), data.n_classes())?;
    let train = Dataset::new(pick(&order[n_test..]), data.n_classes())?;
    Ok((train, test))
}
