// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use enn_core::{Dataset, EnnError, Sequence};

/// Conventional sentinel returned by an abandoned distance computation.
pub const ABANDONED: f64 = f64::INFINITY;

/// Shared contract for distance measures plugged into nearest-neighbour searches.
///
/// # Early abandon
/// `distance(a, b, cutoff)` must return the exact distance whenever the true
/// distance is `<= cutoff`. When the true distance is strictly greater than
/// `cutoff` it may return any value `> cutoff`, conventionally [`ABANDONED`].
/// A distance equal to the cutoff is therefore never abandoned, which keeps
/// boundary ties visible to the caller.
///
/// # Lower bounds
/// `lower_bound` must never exceed the true distance. Callers skip the full
/// computation only when the bound is strictly greater than their limit.
///
/// Neither obligation can be checked at runtime; violating them silently
/// corrupts neighbour sets.
pub trait DistanceMeasure {
    /// Per-sequence statistics precomputed once per build.
    type Stats: Clone + Send + Sync;

    fn name(&self) -> &'static str;

    /// Rejects datasets this measure cannot compare (e.g. ragged lengths).
    fn validate(&self, _data: &Dataset) -> Result<(), EnnError> {
        Ok(())
    }

    /// Rejects a single pair, used for live queries against bound training data.
    fn validate_pair(&self, _a: &Sequence, _b: &Sequence) -> Result<(), EnnError> {
        Ok(())
    }

    /// True iff `distance(a, b, c) == distance(b, a, c)` for all inputs.
    fn is_symmetric(&self) -> bool;

    fn precompute(&self, seq: &Sequence) -> Result<Self::Stats, EnnError>;

    /// Returns the distance, or a value `> cutoff` once it provably exceeds `cutoff`.
    fn distance(&self, a: &Sequence, b: &Sequence, cutoff: f64) -> Result<f64, EnnError>;

    fn supports_lower_bound(&self) -> bool {
        false
    }

    /// Admissible lower bound on `distance(query, candidate)`.
    ///
    /// `cutoff` lets implementations stop accumulating once the bound already
    /// exceeds it. `None` means no bound is available for this pair.
    fn lower_bound(
        &self,
        _query: &Sequence,
        _query_stats: &Self::Stats,
        _candidate: &Sequence,
        _candidate_stats: &Self::Stats,
        _cutoff: f64,
    ) -> Option<f64> {
        None
    }
}

/// Per-sequence statistics for every sequence of a dataset.
///
/// Built once per training build and indexed by dataset position.
#[derive(Clone, Debug)]
pub struct StatsCache<S> {
    stats: Vec<S>,
}

impl<S: Clone + Send + Sync> StatsCache<S> {
    /// Validates the dataset against `measure` and precomputes all statistics.
    pub fn build<M>(measure: &M, data: &Dataset) -> Result<Self, EnnError>
    where
        M: DistanceMeasure<Stats = S>,
    {
        measure.validate(data)?;
        let stats = data
            .iter()
            .map(|seq| measure.precompute(seq))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stats })
    }

    /// Creates a cache from already-computed statistics.
    pub fn from_parts(stats: Vec<S>) -> Self {
        Self { stats }
    }

    pub fn get(&self, index: usize) -> &S {
        &self.stats[index]
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn into_inner(self) -> Vec<S> {
        self.stats
    }
}
