// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::{EnnError, StopReason};

/// Distributions must sum to one within this tolerance.
const DISTRIBUTION_SUM_TOLERANCE: f64 = 1e-9;

/// Leave-one-out prediction for one training instance.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct InstancePrediction {
    pub index: usize,
    pub true_label: usize,
    pub predicted_label: usize,
    pub distribution: Vec<f64>,
    /// Time spent computing distances and predictions for this instance.
    pub eval_time_ns: u64,
}

impl InstancePrediction {
    pub fn is_correct(&self) -> bool {
        self.true_label == self.predicted_label
    }
}

/// Counters collected while building a LOOCV estimate.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildDiagnostics {
    pub ticks: usize,
    pub distance_evaluations: usize,
    pub lower_bound_prunes: usize,
    pub early_abandons: usize,
    pub mirrored_adds: usize,
    pub cache_hits: usize,
    pub stop_reason: Option<StopReason>,
    pub notes: Vec<String>,
}

/// Per-instance LOOCV predictions plus aggregate accuracy and timings.
///
/// `provisional` is true whenever the build was stopped by a budget before
/// every search was exhausted; such results are best-effort only.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct LoocvResult {
    pub measure: String,
    pub k: usize,
    pub predictions: Vec<InstancePrediction>,
    pub accuracy: f64,
    pub provisional: bool,
    pub build_time_ns: u64,
    pub estimate_time_ns: u64,
    pub neighbourhood_size: usize,
    pub max_neighbourhood_size: usize,
    pub diagnostics: BuildDiagnostics,
}

fn validate_distribution(distribution: &[f64], context: &str) -> Result<(), EnnError> {
    if distribution.is_empty() {
        return Err(EnnError::invalid_input(format!(
            "{context} distribution must be non-empty"
        )));
    }
    if let Some(idx) = distribution
        .iter()
        .position(|p| !p.is_finite() || *p < 0.0)
    {
        return Err(EnnError::invalid_input(format!(
            "{context} distribution[{idx}] must be finite and >= 0; got {}",
            distribution[idx]
        )));
    }
    let total: f64 = distribution.iter().sum();
    if (total - 1.0).abs() > DISTRIBUTION_SUM_TOLERANCE {
        return Err(EnnError::invalid_input(format!(
            "{context} distribution must sum to 1; got {total}"
        )));
    }
    Ok(())
}

/// Fraction of predictions whose predicted label equals the true label.
///
/// Empty input returns `0.0`.
pub fn prediction_accuracy(predictions: &[InstancePrediction]) -> f64 {
    if predictions.is_empty() {
        return 0.0;
    }
    let correct = predictions.iter().filter(|p| p.is_correct()).count();
    correct as f64 / predictions.len() as f64
}

impl LoocvResult {
    /// Constructs a result and derives `accuracy` from the predictions.
    pub fn new(
        measure: impl Into<String>,
        k: usize,
        predictions: Vec<InstancePrediction>,
        provisional: bool,
    ) -> Result<Self, EnnError> {
        let result = Self {
            measure: measure.into(),
            k,
            accuracy: prediction_accuracy(&predictions),
            predictions,
            provisional,
            build_time_ns: 0,
            estimate_time_ns: 0,
            neighbourhood_size: 0,
            max_neighbourhood_size: 0,
            diagnostics: BuildDiagnostics::default(),
        };
        result.validate()?;
        Ok(result)
    }

    pub fn with_timings(mut self, build_time_ns: u64, estimate_time_ns: u64) -> Self {
        self.build_time_ns = build_time_ns;
        self.estimate_time_ns = estimate_time_ns;
        self
    }

    pub fn with_neighbourhood(mut self, size: usize, max: usize) -> Self {
        self.neighbourhood_size = size;
        self.max_neighbourhood_size = max;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: BuildDiagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Checks prediction indices, label ranges and distribution shape.
    pub fn validate(&self) -> Result<(), EnnError> {
        if self.k == 0 {
            return Err(EnnError::invalid_input("LoocvResult.k must be >= 1; got 0"));
        }
        for (pos, prediction) in self.predictions.iter().enumerate() {
            if prediction.index != pos {
                return Err(EnnError::invalid_input(format!(
                    "predictions must be ordered by index: position {pos} holds index {}",
                    prediction.index
                )));
            }
            let context = format!("prediction {pos}");
            validate_distribution(&prediction.distribution, &context)?;
            let n_classes = prediction.distribution.len();
            if prediction.predicted_label >= n_classes || prediction.true_label >= n_classes {
                return Err(EnnError::invalid_input(format!(
                    "prediction {pos} labels must be < {n_classes}; got true={}, predicted={}",
                    prediction.true_label, prediction.predicted_label
                )));
            }
        }
        if self.neighbourhood_size > self.max_neighbourhood_size && self.max_neighbourhood_size > 0
        {
            return Err(EnnError::invalid_input(format!(
                "neighbourhood_size must be <= max_neighbourhood_size; got {} > {}",
                self.neighbourhood_size, self.max_neighbourhood_size
            )));
        }
        Ok(())
    }

    pub fn predicted_labels(&self) -> Vec<usize> {
        self.predictions.iter().map(|p| p.predicted_label).collect()
    }

    pub fn true_labels(&self) -> Vec<usize> {
        self.predictions.iter().map(|p| p.true_label).collect()
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }
}

/// Prediction for a single live query.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct QueryPrediction {
    pub predicted_label: usize,
    pub distribution: Vec<f64>,
    /// `(training index, distance)` pairs in the final frontier, nearest first.
    pub neighbours: Vec<(usize, f64)>,
    /// Number of training candidates examined (evaluated or pruned).
    pub examined: usize,
    /// True when the test-time budget stopped the search early.
    pub provisional: bool,
    pub eval_time_ns: u64,
}
