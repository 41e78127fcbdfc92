// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::EnnError;
use rand::Rng;

/// Scores within this absolute distance of the maximum count as tied.
pub const TIE_EPSILON: f64 = 1e-12;

/// Computes a compensated sum using Neumaier's variant of Kahan summation.
///
/// The correction term is kept even when a later addend is larger than the
/// running sum, so `[1e16, 1.0, -1e16]` sums to `1.0`. Empty input returns
/// `0.0`.
pub fn kahan_sum(values: &[f64]) -> f64 {
    let mut sum = 0.0_f64;
    let mut c = 0.0_f64;
    for &value in values {
        let t = sum + value;
        if sum.abs() >= value.abs() {
            c += (sum - t) + value;
        } else {
            c += (value - t) + sum;
        }
        sum = t;
    }
    sum + c
}

/// Uniform distribution over `n_classes` classes.
pub fn uniform_distribution(n_classes: usize) -> Vec<f64> {
    if n_classes == 0 {
        return vec![];
    }
    vec![1.0 / n_classes as f64; n_classes]
}

/// Normalizes non-negative weights onto the probability simplex in place.
///
/// An all-zero vector becomes uniform. Negative or non-finite weights are rejected.
pub fn normalize_distribution(weights: &mut [f64]) -> Result<(), EnnError> {
    if let Some(idx) = weights.iter().position(|w| !w.is_finite() || *w < 0.0) {
        return Err(EnnError::numerical_issue(format!(
            "class weights must be finite and >= 0; got {} at class {idx}",
            weights[idx]
        )));
    }
    let total = kahan_sum(weights);
    if total <= 0.0 {
        let uniform = 1.0 / weights.len().max(1) as f64;
        weights.iter_mut().for_each(|w| *w = uniform);
        return Ok(());
    }
    weights.iter_mut().for_each(|w| *w /= total);
    Ok(())
}

/// Indices whose score ties the maximum within [`TIE_EPSILON`], ascending.
pub fn arg_max_candidates(scores: &[f64]) -> Vec<usize> {
    let max = scores
        .iter()
        .copied()
        .filter(|s| !s.is_nan())
        .fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return (0..scores.len()).collect();
    }
    scores
        .iter()
        .enumerate()
        .filter(|(_, s)| max - **s <= TIE_EPSILON)
        .map(|(idx, _)| idx)
        .collect()
}

/// Index of the largest score.
///
/// Ties are broken uniformly at random with `rng` when provided, otherwise
/// the lowest index wins. Returns `None` for empty input.
pub fn arg_max<R: Rng + ?Sized>(scores: &[f64], rng: Option<&mut R>) -> Option<usize> {
    let candidates = arg_max_candidates(scores);
    match (candidates.len(), rng) {
        (0, _) => None,
        (1, _) | (_, None) => candidates.first().copied(),
        (len, Some(rng)) => Some(candidates[rng.gen_range(0..len)]),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        arg_max, arg_max_candidates, kahan_sum, normalize_distribution, uniform_distribution,
    };
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-12,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn kahan_sum_handles_cancellation() {
        let values = [1e16, 1.0, -1e16];
        assert_close(kahan_sum(&values), 1.0);
        assert_eq!(kahan_sum(&[]), 0.0);
    }

    #[test]
    fn kahan_sum_keeps_small_terms_around_a_larger_addend() {
        assert_eq!(kahan_sum(&[1.0, 1e100, 1.0, -1e100]), 2.0);
    }

    #[test]
    fn normalize_scales_to_unit_sum() {
        let mut weights = vec![1.0, 3.0, 0.0];
        normalize_distribution(&mut weights).expect("weights should normalize");
        assert_close(weights[0], 0.25);
        assert_close(weights[1], 0.75);
        assert_close(weights[2], 0.0);
    }

    #[test]
    fn normalize_zero_weights_become_uniform() {
        let mut weights = vec![0.0; 4];
        normalize_distribution(&mut weights).expect("zeros should normalize");
        assert_eq!(weights, uniform_distribution(4));
    }

    #[test]
    fn normalize_rejects_negative_and_nan() {
        let err = normalize_distribution(&mut [1.0, -0.5]).expect_err("negative should fail");
        assert!(err.to_string().contains("at class 1"));
        normalize_distribution(&mut [f64::NAN]).expect_err("nan should fail");
    }

    #[test]
    fn arg_max_without_rng_prefers_lowest_index() {
        let scores = [0.25, 0.375, 0.375];
        assert_eq!(arg_max_candidates(&scores), vec![1, 2]);
        assert_eq!(arg_max::<StdRng>(&scores, None), Some(1));
        assert_eq!(arg_max::<StdRng>(&[], None), None);
    }

    #[test]
    fn seeded_tie_break_is_reproducible_and_covers_all_ties() {
        let scores = [0.5, 0.5];
        let picks = |seed: u64| -> Vec<usize> {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..64)
                .map(|_| arg_max(&scores, Some(&mut rng)).expect("non-empty"))
                .collect()
        };
        assert_eq!(picks(7), picks(7));
        let seen = picks(7);
        assert!(seen.contains(&0) && seen.contains(&1));
    }
}
