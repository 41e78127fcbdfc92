// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::EnnError;

/// A labelled, possibly multi-dimensional sequence.
///
/// Values are stored time-major: the `dims` values of time step `t` live at
/// `values[t * dims .. (t + 1) * dims]`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Sequence {
    values: Vec<f64>,
    dims: usize,
    label: usize,
}

impl Sequence {
    /// Builds a sequence from time-major values.
    pub fn new(values: Vec<f64>, dims: usize, label: usize) -> Result<Self, EnnError> {
        if dims == 0 {
            return Err(EnnError::invalid_input("sequence dims must be >= 1; got 0"));
        }
        if values.is_empty() {
            return Err(EnnError::invalid_input(
                "sequence must contain at least one time step; got 0 values",
            ));
        }
        if !values.len().is_multiple_of(dims) {
            return Err(EnnError::invalid_input(format!(
                "sequence value count must be a multiple of dims; got values={}, dims={dims}",
                values.len()
            )));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(EnnError::invalid_input(format!(
                "sequence values must be finite; got {} at flat index {idx}",
                values[idx]
            )));
        }
        Ok(Self {
            values,
            dims,
            label,
        })
    }

    /// Builds a one-dimensional sequence.
    pub fn univariate(values: Vec<f64>, label: usize) -> Result<Self, EnnError> {
        Self::new(values, 1, label)
    }

    /// Number of time steps.
    pub fn len(&self) -> usize {
        self.values.len() / self.dims
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn label(&self) -> usize {
        self.label
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value of dimension `d` at time step `t`.
    #[inline]
    pub fn value(&self, t: usize, d: usize) -> f64 {
        self.values[t * self.dims + d]
    }

    /// All dimensions at time step `t`.
    #[inline]
    pub fn step(&self, t: usize) -> &[f64] {
        &self.values[t * self.dims..(t + 1) * self.dims]
    }
}

/// An ordered, indexable collection of labelled sequences.
///
/// The position of a sequence in the dataset is its stable identity: caches,
/// frontiers and checkpoints all refer to sequences by this index.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    sequences: Vec<Sequence>,
    n_classes: usize,
}

impl Dataset {
    /// Validates that every label is in `0..n_classes` and that all
    /// sequences share the same dimensionality.
    pub fn new(sequences: Vec<Sequence>, n_classes: usize) -> Result<Self, EnnError> {
        if n_classes == 0 {
            return Err(EnnError::invalid_input("dataset n_classes must be >= 1; got 0"));
        }
        if let Some(first) = sequences.first() {
            let dims = first.dims();
            for (idx, seq) in sequences.iter().enumerate() {
                if seq.dims() != dims {
                    return Err(EnnError::invalid_input(format!(
                        "dataset sequences must share dimensionality; sequence {idx} has dims={}, expected {dims}",
                        seq.dims()
                    )));
                }
                if seq.label() >= n_classes {
                    return Err(EnnError::invalid_input(format!(
                        "sequence {idx} label {} is outside 0..{n_classes}",
                        seq.label()
                    )));
                }
            }
        }
        Ok(Self {
            sequences,
            n_classes,
        })
    }

    /// Infers `n_classes` as `max(label) + 1`.
    pub fn from_sequences(sequences: Vec<Sequence>) -> Result<Self, EnnError> {
        let n_classes = sequences
            .iter()
            .map(Sequence::label)
            .max()
            .map_or(1, |max| max + 1);
        Self::new(sequences, n_classes)
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn get(&self, index: usize) -> Option<&Sequence> {
        self.sequences.get(index)
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter()
    }

    pub fn label(&self, index: usize) -> usize {
        self.sequences[index].label()
    }

    /// Number of sequences per class label.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_classes];
        for seq in &self.sequences {
            counts[seq.label()] += 1;
        }
        counts
    }

    /// Stable FNV-1a fingerprint over shapes, labels and value bits.
    ///
    /// Checkpoints record this so a snapshot is never resumed against
    /// different training data.
    pub fn fingerprint(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        fn mix(hash: &mut u64, word: u64) {
            for byte in word.to_le_bytes() {
                *hash ^= u64::from(byte);
                *hash = hash.wrapping_mul(PRIME);
            }
        }

        let mut hash = OFFSET;
        mix(&mut hash, self.sequences.len() as u64);
        mix(&mut hash, self.n_classes as u64);
        for seq in &self.sequences {
            mix(&mut hash, seq.dims() as u64);
            mix(&mut hash, seq.len() as u64);
            mix(&mut hash, seq.label() as u64);
            for value in seq.values() {
                mix(&mut hash, value.to_bits());
            }
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::{Dataset, Sequence};

    fn seq(values: &[f64], label: usize) -> Sequence {
        Sequence::univariate(values.to_vec(), label).expect("sequence should be valid")
    }

    #[test]
    fn multivariate_sequence_indexes_time_major() {
        let s = Sequence::new(vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0], 2, 0)
            .expect("sequence should be valid");
        assert_eq!(s.len(), 3);
        assert_eq!(s.dims(), 2);
        assert_eq!(s.value(1, 1), 20.0);
        assert_eq!(s.step(2), &[3.0, 30.0]);
    }

    #[test]
    fn sequence_rejects_bad_shapes_and_non_finite_values() {
        let err = Sequence::new(vec![1.0, 2.0, 3.0], 2, 0).expect_err("ragged should fail");
        assert!(err.to_string().contains("multiple of dims"));

        let err = Sequence::univariate(vec![], 0).expect_err("empty should fail");
        assert!(err.to_string().contains("at least one time step"));

        let err = Sequence::univariate(vec![1.0, f64::NAN], 0).expect_err("nan should fail");
        assert!(err.to_string().contains("flat index 1"));

        let err = Sequence::new(vec![1.0], 0, 0).expect_err("zero dims should fail");
        assert!(err.to_string().contains("dims must be >= 1"));
    }

    #[test]
    fn dataset_validates_labels_and_dimensionality() {
        let err = Dataset::new(vec![seq(&[1.0], 0), seq(&[2.0], 2)], 2)
            .expect_err("label outside range should fail");
        assert!(err.to_string().contains("label 2 is outside 0..2"));

        let mixed = vec![
            seq(&[1.0, 2.0], 0),
            Sequence::new(vec![1.0, 2.0], 2, 0).expect("valid"),
        ];
        let err = Dataset::new(mixed, 1).expect_err("mixed dims should fail");
        assert!(err.to_string().contains("share dimensionality"));
    }

    #[test]
    fn from_sequences_infers_classes_and_counts() {
        let data = Dataset::from_sequences(vec![
            seq(&[0.0], 0),
            seq(&[1.0], 2),
            seq(&[2.0], 2),
        ])
        .expect("dataset should be valid");
        assert_eq!(data.n_classes(), 3);
        assert_eq!(data.class_counts(), vec![1, 0, 2]);
    }

    #[test]
    fn fingerprint_tracks_values_and_labels() {
        let a = Dataset::from_sequences(vec![seq(&[0.0, 1.0], 0), seq(&[1.0, 2.0], 1)])
            .expect("valid");
        let same = a.clone();
        let relabelled = Dataset::new(vec![seq(&[0.0, 1.0], 1), seq(&[1.0, 2.0], 1)], 2)
            .expect("valid");
        let shifted = Dataset::from_sequences(vec![seq(&[0.0, 1.5], 0), seq(&[1.0, 2.0], 1)])
            .expect("valid");

        assert_eq!(a.fingerprint(), same.fingerprint());
        assert_ne!(a.fingerprint(), relabelled.fingerprint());
        assert_ne!(a.fingerprint(), shifted.fingerprint());
    }
}
