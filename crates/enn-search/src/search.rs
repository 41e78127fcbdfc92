// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::frontier::Frontier;
use crate::seen::SeenSet;
use enn_core::{EnnError, Sequence, normalize_distribution, uniform_distribution};
use enn_measures::DistanceMeasure;
use std::time::Instant;

/// The query side and candidate side of one distance evaluation.
pub struct Probe<'a, M: DistanceMeasure> {
    pub measure: &'a M,
    pub query: &'a Sequence,
    pub query_stats: &'a M::Stats,
    pub candidate: &'a Sequence,
    pub candidate_stats: &'a M::Stats,
}

/// How [`NeighbourSearch::add`] may shortcut an evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvalPolicy {
    pub early_abandon: bool,
    pub lower_bound_pruning: bool,
    /// Extra cutoff the distance must remain exact up to, e.g. the limit of
    /// the mirrored search that will reuse the value.
    pub shared_cutoff: f64,
}

impl EvalPolicy {
    pub fn exhaustive() -> Self {
        Self {
            early_abandon: false,
            lower_bound_pruning: false,
            shared_cutoff: f64::NEG_INFINITY,
        }
    }
}

/// Result of offering one candidate to a search.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AddOutcome {
    /// Skipped because the lower bound already exceeds the limit.
    Pruned { lower_bound: f64 },
    /// Distance computed. `abandoned` marks a value cut short by the cutoff.
    Evaluated {
        distance: f64,
        retained: bool,
        abandoned: bool,
    },
    /// Candidate was examined before; carries its distance if still retained.
    AlreadyExamined { distance: Option<f64> },
}

/// Nearest-neighbour state for one query sequence.
///
/// `target` is the training index of the query for leave-one-out searches
/// and `None` for live queries. The query itself is never offered.
#[derive(Clone, Debug)]
pub struct NeighbourSearch {
    target: Option<usize>,
    frontier: Frontier,
    limit: f64,
    seen: SeenSet,
    n_classes: usize,
    distribution: Vec<f64>,
    stale: bool,
    eval_time_ns: u64,
}

fn elapsed_ns(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

impl NeighbourSearch {
    /// Search for training instance `target` over `n_candidates` sequences.
    pub fn for_train(target: usize, k: usize, n_candidates: usize, n_classes: usize) -> Self {
        let mut search = Self::for_query(k, n_candidates, n_classes);
        search.target = Some(target);
        search
    }

    /// Search for a live query over `n_candidates` training sequences.
    pub fn for_query(k: usize, n_candidates: usize, n_classes: usize) -> Self {
        Self {
            target: None,
            frontier: Frontier::new(k),
            limit: f64::INFINITY,
            seen: SeenSet::with_capacity(n_candidates),
            n_classes,
            distribution: uniform_distribution(n_classes),
            stale: false,
            eval_time_ns: 0,
        }
    }

    pub(crate) fn from_parts(
        target: Option<usize>,
        frontier: Frontier,
        seen: SeenSet,
        n_classes: usize,
        eval_time_ns: u64,
    ) -> Self {
        Self {
            target,
            limit: frontier.limit(),
            frontier,
            seen,
            n_classes,
            distribution: uniform_distribution(n_classes),
            stale: true,
            eval_time_ns,
        }
    }

    pub fn target(&self) -> Option<usize> {
        self.target
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    /// Worst accepted distance once `k` neighbours are held, `+inf` before.
    pub fn limit(&self) -> f64 {
        self.limit
    }

    pub fn has_seen(&self, candidate: usize) -> bool {
        self.seen.contains(candidate)
    }

    pub fn examined(&self) -> usize {
        self.seen.count()
    }

    pub(crate) fn seen(&self) -> &SeenSet {
        &self.seen
    }

    pub fn eval_time_ns(&self) -> u64 {
        self.eval_time_ns
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Class all retained neighbours share, if any.
    pub fn homogeneous_label(&self) -> Option<usize> {
        self.frontier.homogeneous_label()
    }

    fn check_candidate(&self, candidate: usize) -> Result<(), EnnError> {
        if self.target == Some(candidate) {
            return Err(EnnError::invalid_state(format!(
                "search {candidate} cannot be compared against itself"
            )));
        }
        if candidate >= self.seen.capacity() {
            return Err(EnnError::invalid_input(format!(
                "candidate {candidate} out of range for {} candidates",
                self.seen.capacity()
            )));
        }
        Ok(())
    }

    fn record(&mut self, candidate: usize, label: usize, distance: f64) -> Result<bool, EnnError> {
        if distance.is_nan() || distance < 0.0 {
            return Err(EnnError::numerical_issue(format!(
                "distance to candidate {candidate} must be >= 0; got {distance}"
            )));
        }
        if label >= self.n_classes {
            return Err(EnnError::invalid_input(format!(
                "candidate {candidate} label {label} is outside 0..{}",
                self.n_classes
            )));
        }
        self.seen.insert(candidate);
        let retained = self.frontier.add(distance, candidate, label);
        if retained {
            self.limit = self.frontier.limit();
            self.stale = true;
        }
        Ok(retained)
    }

    /// Evaluates `candidate` unless it was already examined or the lower
    /// bound shows it cannot enter the frontier.
    pub fn add<M: DistanceMeasure>(
        &mut self,
        candidate: usize,
        label: usize,
        probe: &Probe<'_, M>,
        policy: EvalPolicy,
    ) -> Result<AddOutcome, EnnError> {
        if self.seen.contains(candidate) {
            return Ok(AddOutcome::AlreadyExamined {
                distance: self.frontier.distance_of(candidate),
            });
        }
        self.check_candidate(candidate)?;
        let started = Instant::now();

        if policy.lower_bound_pruning
            && self.limit.is_finite()
            && probe.measure.supports_lower_bound()
            && let Some(lower_bound) = probe.measure.lower_bound(
                probe.query,
                probe.query_stats,
                probe.candidate,
                probe.candidate_stats,
                self.limit,
            )
            && lower_bound > self.limit
        {
            self.seen.insert(candidate);
            self.eval_time_ns = self.eval_time_ns.saturating_add(elapsed_ns(started));
            return Ok(AddOutcome::Pruned { lower_bound });
        }

        let cutoff = if policy.early_abandon {
            self.limit.max(policy.shared_cutoff)
        } else {
            f64::INFINITY
        };
        let distance = probe
            .measure
            .distance(probe.query, probe.candidate, cutoff)
            .map_err(|err| match err {
                EnnError::NumericalIssue(_) => err,
                other => EnnError::numerical_issue(format!(
                    "{} failed on candidate {candidate}: {other}",
                    probe.measure.name()
                )),
            })?;
        let abandoned = distance > cutoff;
        let retained = self.record(candidate, label, distance)?;
        self.eval_time_ns = self.eval_time_ns.saturating_add(elapsed_ns(started));
        Ok(AddOutcome::Evaluated {
            distance,
            retained,
            abandoned,
        })
    }

    /// Adds a distance computed elsewhere, e.g. by the mirrored search.
    ///
    /// Single-visit: offering an examined candidate is an error.
    pub fn add_precomputed(
        &mut self,
        candidate: usize,
        label: usize,
        distance: f64,
    ) -> Result<bool, EnnError> {
        if self.seen.contains(candidate) {
            return Err(EnnError::invalid_state(format!(
                "candidate {candidate} already examined by search {}",
                self.target
                    .map_or_else(|| "query".to_string(), |t| t.to_string())
            )));
        }
        self.check_candidate(candidate)?;
        self.record(candidate, label, distance)
    }

    /// Class distribution over the frontier, cached until the next change.
    ///
    /// An empty frontier yields the uniform distribution.
    pub fn predict(&mut self) -> Result<&[f64], EnnError> {
        if self.stale {
            let started = Instant::now();
            self.distribution = self.distribution_for(&self.frontier)?;
            self.stale = false;
            self.eval_time_ns = self.eval_time_ns.saturating_add(elapsed_ns(started));
        }
        Ok(&self.distribution)
    }

    /// Distribution this search would predict with a smaller `k`.
    pub fn predict_with_k(&self, k: usize) -> Result<Vec<f64>, EnnError> {
        if k >= self.frontier.k() {
            return self.distribution_for(&self.frontier);
        }
        self.distribution_for(&self.frontier.with_k(k))
    }

    fn distribution_for(&self, frontier: &Frontier) -> Result<Vec<f64>, EnnError> {
        if frontier.is_empty() {
            return Ok(uniform_distribution(self.n_classes));
        }
        let mut votes = frontier.votes(self.n_classes);
        normalize_distribution(&mut votes)?;
        Ok(votes)
    }
}
