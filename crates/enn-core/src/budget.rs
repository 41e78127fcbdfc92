// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::EnnError;
use std::collections::VecDeque;
use std::time::Duration;

/// Number of recent tick durations retained by [`TickEstimate`].
pub const TICK_ESTIMATE_WINDOW: usize = 32;

/// Resource contract for a build (train) or a live query (test).
///
/// Every limit is optional; an all-`None` budget runs to exhaustion.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Budget {
    /// Maximum number of ticks (examined neighbour pairs) per build.
    pub neighbour_limit: Option<usize>,
    /// Stop once `neighbourhood_size / max_neighbourhood_size` reaches this fraction.
    pub neighbourhood_fraction: Option<f64>,
    /// Wall-clock budget for the whole build, cumulative across resumes.
    pub train_time_ms: Option<u64>,
    /// Wall-clock budget for a single live query.
    pub test_time_ms: Option<u64>,
}

/// Why a build or query stopped before exhausting its work.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    NeighbourLimit,
    NeighbourhoodFraction,
    TrainTime,
    TestTime,
}

/// Outcome of a pre-tick budget check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetStatus {
    WithinBudget,
    Exhausted(StopReason),
}

/// Progress counters consulted by [`Budget::check_train`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BuildProgress {
    pub ticks: usize,
    pub neighbourhood_size: usize,
    pub max_neighbourhood_size: usize,
    pub elapsed: Duration,
}

/// Validates budget limits; zero and non-finite limits are rejected.
pub fn validate_budget(budget: &Budget) -> Result<(), EnnError> {
    if let Some(limit) = budget.neighbour_limit
        && limit == 0
    {
        return Err(EnnError::invalid_input(
            "budget.neighbour_limit must be > 0 when provided; got 0",
        ));
    }
    if let Some(fraction) = budget.neighbourhood_fraction
        && (!fraction.is_finite() || fraction <= 0.0 || fraction > 1.0)
    {
        return Err(EnnError::invalid_input(format!(
            "budget.neighbourhood_fraction must be in (0, 1]; got {fraction}"
        )));
    }
    if let Some(train_time_ms) = budget.train_time_ms
        && train_time_ms == 0
    {
        return Err(EnnError::invalid_input(
            "budget.train_time_ms must be > 0 when provided; got 0",
        ));
    }
    if let Some(test_time_ms) = budget.test_time_ms
        && test_time_ms == 0
    {
        return Err(EnnError::invalid_input(
            "budget.test_time_ms must be > 0 when provided; got 0",
        ));
    }
    Ok(())
}

impl Budget {
    /// True when no training-side limit is configured.
    pub fn is_unbounded_train(&self) -> bool {
        self.neighbour_limit.is_none()
            && self.neighbourhood_fraction.is_none()
            && self.train_time_ms.is_none()
    }

    /// Decides whether another build tick may start.
    ///
    /// Time is checked against `elapsed + estimate.predicted()` so the next
    /// tick is not started when it would likely overshoot the contract.
    pub fn check_train(&self, progress: BuildProgress, estimate: &TickEstimate) -> BudgetStatus {
        if let Some(limit) = self.neighbour_limit
            && progress.ticks >= limit
        {
            return BudgetStatus::Exhausted(StopReason::NeighbourLimit);
        }
        if let Some(fraction) = self.neighbourhood_fraction
            && progress.max_neighbourhood_size > 0
        {
            let reached =
                progress.neighbourhood_size as f64 / progress.max_neighbourhood_size as f64;
            if reached >= fraction {
                return BudgetStatus::Exhausted(StopReason::NeighbourhoodFraction);
            }
        }
        if let Some(train_time_ms) = self.train_time_ms
            && exceeds_time(progress.elapsed, estimate, train_time_ms)
        {
            return BudgetStatus::Exhausted(StopReason::TrainTime);
        }
        BudgetStatus::WithinBudget
    }

    /// Decides whether a live query may examine another candidate.
    pub fn check_test(&self, elapsed: Duration, estimate: &TickEstimate) -> BudgetStatus {
        match self.test_time_ms {
            Some(test_time_ms) if exceeds_time(elapsed, estimate, test_time_ms) => {
                BudgetStatus::Exhausted(StopReason::TestTime)
            }
            _ => BudgetStatus::WithinBudget,
        }
    }
}

fn exceeds_time(elapsed: Duration, estimate: &TickEstimate, limit_ms: u64) -> bool {
    let projected = elapsed.saturating_add(estimate.predicted());
    projected > Duration::from_millis(limit_ms)
}

/// Rolling worst-case estimate of how long the next tick will take.
///
/// Holds the last [`TICK_ESTIMATE_WINDOW`] tick durations and predicts their
/// maximum, which tracks slow ticks quickly without being pinned forever by a
/// single outlier from early in the build.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickEstimate {
    recent_ns: VecDeque<u64>,
}

impl TickEstimate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, duration: Duration) {
        if self.recent_ns.len() == TICK_ESTIMATE_WINDOW {
            self.recent_ns.pop_front();
        }
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.recent_ns.push_back(ns);
    }

    pub fn predicted(&self) -> Duration {
        Duration::from_nanos(self.recent_ns.iter().copied().max().unwrap_or(0))
    }

    pub fn samples(&self) -> usize {
        self.recent_ns.len()
    }
}
