// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

//! Classification metrics and synthetic labelled sequence datasets.

pub mod synthetic;

pub use synthetic::{
    ClassShapesConfig, RandomWalkConfig, class_shapes, random_walks, train_test_split,
};

use enn_core::{EnnError, LoocvResult};

/// Probabilities are clamped to `[LOG_LOSS_EPSILON, 1]` before taking logs.
pub const LOG_LOSS_EPSILON: f64 = 1e-15;

/// Row-major `actual x predicted` label counts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfusionMatrix {
    n_classes: usize,
    counts: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Instances of class `actual` predicted as `predicted`.
    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual >= self.n_classes || predicted >= self.n_classes {
            return 0;
        }
        self.counts[actual * self.n_classes + predicted]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.n_classes).map(|class| self.get(class, class)).sum()
    }

    /// Recall per class; classes without instances report `None`.
    pub fn recall_per_class(&self) -> Vec<Option<f64>> {
        (0..self.n_classes)
            .map(|actual| {
                let support: usize = (0..self.n_classes).map(|p| self.get(actual, p)).sum();
                (support > 0).then(|| self.get(actual, actual) as f64 / support as f64)
            })
            .collect()
    }
}

/// Aggregated classification metrics for one set of predictions.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub log_loss: f64,
    pub confusion: ConfusionMatrix,
}

fn validate_labels(
    true_labels: &[usize],
    predicted: &[usize],
    n_classes: usize,
) -> Result<(), EnnError> {
    if n_classes == 0 {
        return Err(EnnError::invalid_input("n_classes must be >= 1; got 0"));
    }
    if true_labels.len() != predicted.len() {
        return Err(EnnError::invalid_input(format!(
            "true and predicted labels must have equal length; got true={}, predicted={}",
            true_labels.len(),
            predicted.len()
        )));
    }
    if true_labels.is_empty() {
        return Err(EnnError::invalid_input(
            "classification metrics require at least one prediction",
        ));
    }
    if let Some(label) = true_labels
        .iter()
        .chain(predicted)
        .copied()
        .find(|&label| label >= n_classes)
    {
        return Err(EnnError::invalid_input(format!(
            "label {label} is outside 0..{n_classes}"
        )));
    }
    Ok(())
}

/// Counts `(actual, predicted)` label pairs.
pub fn confusion_matrix(
    true_labels: &[usize],
    predicted: &[usize],
    n_classes: usize,
) -> Result<ConfusionMatrix, EnnError> {
    validate_labels(true_labels, predicted, n_classes)?;
    let cells = n_classes.checked_mul(n_classes).ok_or_else(|| {
        EnnError::invalid_input(format!(
            "n_classes*n_classes overflows usize; got n_classes={n_classes}"
        ))
    })?;
    let mut counts = vec![0usize; cells];
    for (&actual, &guess) in true_labels.iter().zip(predicted) {
        counts[actual * n_classes + guess] += 1;
    }
    Ok(ConfusionMatrix { n_classes, counts })
}

/// Fraction of matching labels.
pub fn accuracy(true_labels: &[usize], predicted: &[usize]) -> Result<f64, EnnError> {
    let n_classes = true_labels
        .iter()
        .chain(predicted)
        .max()
        .map_or(1, |max| max + 1);
    let confusion = confusion_matrix(true_labels, predicted, n_classes)?;
    Ok(confusion.correct() as f64 / confusion.total() as f64)
}

/// Mean per-class recall over the classes present in `true_labels`.
pub fn balanced_accuracy(
    true_labels: &[usize],
    predicted: &[usize],
    n_classes: usize,
) -> Result<f64, EnnError> {
    let confusion = confusion_matrix(true_labels, predicted, n_classes)?;
    let recalls: Vec<f64> = confusion.recall_per_class().into_iter().flatten().collect();
    Ok(recalls.iter().sum::<f64>() / recalls.len() as f64)
}

/// Mean negative log probability assigned to the true class.
pub fn log_loss(true_labels: &[usize], distributions: &[Vec<f64>]) -> Result<f64, EnnError> {
    if true_labels.len() != distributions.len() {
        return Err(EnnError::invalid_input(format!(
            "true labels and distributions must have equal length; got labels={}, distributions={}",
            true_labels.len(),
            distributions.len()
        )));
    }
    if true_labels.is_empty() {
        return Err(EnnError::invalid_input("log loss requires at least one prediction"));
    }
    let mut total = 0.0;
    for (idx, (&label, distribution)) in true_labels.iter().zip(distributions).enumerate() {
        let Some(&probability) = distribution.get(label) else {
            return Err(EnnError::invalid_input(format!(
                "distribution {idx} has {} classes; true label is {label}",
                distribution.len()
            )));
        };
        if !probability.is_finite() || probability < 0.0 {
            return Err(EnnError::invalid_input(format!(
                "distribution {idx} probability must be finite and >= 0; got {probability}"
            )));
        }
        total -= probability.clamp(LOG_LOSS_EPSILON, 1.0).ln();
    }
    Ok(total / true_labels.len() as f64)
}

/// All metrics for a LOOCV (or ensemble) result over `n_classes` classes.
pub fn classification_metrics(
    result: &LoocvResult,
    n_classes: usize,
) -> Result<ClassificationMetrics, EnnError> {
    let true_labels = result.true_labels();
    let predicted = result.predicted_labels();
    let distributions: Vec<Vec<f64>> = result
        .predictions
        .iter()
        .map(|prediction| prediction.distribution.clone())
        .collect();
    let confusion = confusion_matrix(&true_labels, &predicted, n_classes)?;
    Ok(ClassificationMetrics {
        accuracy: confusion.correct() as f64 / confusion.total() as f64,
        balanced_accuracy: balanced_accuracy(&true_labels, &predicted, n_classes)?,
        log_loss: log_loss(&true_labels, &distributions)?,
        confusion,
    })
}
