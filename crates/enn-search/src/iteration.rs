// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use enn_core::{Dataset, EnnError};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Order in which (left-out, candidate) pairs are examined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationStrategy {
    /// Left-out searches in index order; each exhausts its candidates in
    /// index order before the next one starts.
    Linear,
    /// Random unfinished search, random class, random unseen candidate.
    #[default]
    Random,
}

/// Pending candidates of every search, bucketed by candidate class.
///
/// Only classes that occur in the dataset get a bucket, so sparse labels do
/// not cost `n * n_classes` empty vectors. Buckets are stored in descending
/// index order so `pop` yields the smallest remaining index for linear
/// iteration. Pairs already examined via a mirrored add stay queued and are
/// skipped by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueue {
    strategy: IterationStrategy,
    /// Labels present in the dataset, ascending; bucket `b` holds `classes[b]`.
    classes: Vec<usize>,
    buckets: Vec<Vec<Vec<usize>>>,
    active: Vec<usize>,
    in_active: Vec<bool>,
    remaining: usize,
}

impl WorkQueue {
    /// Queues every `(i, j)` with `i != j`.
    pub fn new(data: &Dataset, strategy: IterationStrategy) -> Self {
        let n = data.len();
        let classes = present_classes(data);
        let slot_of = |label: usize| classes.partition_point(|&class| class < label);
        let mut buckets = vec![vec![Vec::new(); classes.len()]; n];
        for (search, search_buckets) in buckets.iter_mut().enumerate() {
            for candidate in (0..n).rev() {
                if candidate != search {
                    search_buckets[slot_of(data.label(candidate))].push(candidate);
                }
            }
        }
        let active: Vec<usize> = (0..n).filter(|_| n > 1).collect();
        let in_active = vec![n > 1; n];
        Self {
            strategy,
            classes,
            buckets,
            active,
            in_active,
            remaining: n * n.saturating_sub(1),
        }
    }

    pub fn strategy(&self) -> IterationStrategy {
        self.strategy
    }

    /// Queued pairs, including ones already examined through mirroring.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_drained(&self) -> bool {
        self.active.is_empty()
    }

    pub fn n_searches(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket slots of `search` that hold work outside the `deferred` class.
    fn eligible_buckets(&self, search: usize, deferred: Option<usize>) -> impl Iterator<Item = usize> {
        self.buckets[search]
            .iter()
            .enumerate()
            .filter(move |(slot, bucket)| {
                !bucket.is_empty() && Some(self.classes[*slot]) != deferred
            })
            .map(|(slot, _)| slot)
    }

    /// True if some active search still has a non-deferred candidate that
    /// `examined(search, candidate)` does not report as done.
    ///
    /// Consumes no randomness, so the iteration order is unaffected.
    pub fn has_pending<F, E>(&self, deferred_class: F, examined: E) -> bool
    where
        F: Fn(usize) -> Option<usize>,
        E: Fn(usize, usize) -> bool,
    {
        self.active.iter().any(|&search| {
            self.eligible_buckets(search, deferred_class(search))
                .any(|slot| {
                    self.buckets[search][slot]
                        .iter()
                        .any(|&candidate| !examined(search, candidate))
                })
        })
    }

    /// Next pair to examine, or `None` when every search is finished.
    ///
    /// `deferred_class(search)` names a class whose candidates that search
    /// may skip for now; a search with only deferred work is parked until
    /// [`WorkQueue::reactivate`] is called for it.
    pub fn next_pair<R, F>(&mut self, rng: &mut R, deferred_class: F) -> Option<(usize, usize)>
    where
        R: Rng + ?Sized,
        F: Fn(usize) -> Option<usize>,
    {
        while !self.active.is_empty() {
            let slot = match self.strategy {
                IterationStrategy::Linear => 0,
                IterationStrategy::Random => rng.gen_range(0..self.active.len()),
            };
            let search = self.active[slot];
            let deferred = deferred_class(search);

            let bucket_slot = match self.strategy {
                IterationStrategy::Linear => self
                    .eligible_buckets(search, deferred)
                    .min_by_key(|&b| self.buckets[search][b].last().copied()),
                IterationStrategy::Random => {
                    let eligible: Vec<usize> = self.eligible_buckets(search, deferred).collect();
                    (!eligible.is_empty()).then(|| eligible[rng.gen_range(0..eligible.len())])
                }
            };

            let Some(bucket_slot) = bucket_slot else {
                self.deactivate_slot(slot);
                continue;
            };

            let bucket = &mut self.buckets[search][bucket_slot];
            let candidate = match self.strategy {
                IterationStrategy::Linear => bucket.pop(),
                IterationStrategy::Random => {
                    let pick = rng.gen_range(0..bucket.len());
                    Some(bucket.swap_remove(pick))
                }
            };
            if let Some(candidate) = candidate {
                self.remaining -= 1;
                return Some((search, candidate));
            }
        }
        None
    }

    fn deactivate_slot(&mut self, slot: usize) {
        let search = match self.strategy {
            IterationStrategy::Linear => self.active.remove(slot),
            IterationStrategy::Random => self.active.swap_remove(slot),
        };
        self.in_active[search] = false;
    }

    /// Returns a parked search to the active set if it still has work.
    pub fn reactivate(&mut self, search: usize) {
        if self.in_active[search] || self.buckets[search].iter().all(Vec::is_empty) {
            return;
        }
        self.in_active[search] = true;
        match self.strategy {
            IterationStrategy::Linear => {
                let pos = self.active.partition_point(|&s| s < search);
                self.active.insert(pos, search);
            }
            IterationStrategy::Random => self.active.push(search),
        }
    }

    /// Checks internal counts against `data` after deserialization.
    pub(crate) fn validate(&self, data: &Dataset) -> Result<(), EnnError> {
        let n = data.len();
        if self.classes != present_classes(data) {
            return Err(EnnError::checkpoint(
                "work queue classes do not match the dataset labels",
            ));
        }
        if self.buckets.len() != n || self.in_active.len() != n {
            return Err(EnnError::checkpoint(format!(
                "work queue covers {} searches; dataset has {n}",
                self.buckets.len()
            )));
        }
        let mut queued = 0usize;
        for (search, buckets) in self.buckets.iter().enumerate() {
            if buckets.len() != self.classes.len() {
                return Err(EnnError::checkpoint(format!(
                    "work queue search {search} has {} class buckets; expected {}",
                    buckets.len(),
                    self.classes.len()
                )));
            }
            for (bucket, &class) in buckets.iter().zip(&self.classes) {
                if bucket
                    .iter()
                    .any(|&c| c >= n || c == search || data.label(c) != class)
                {
                    return Err(EnnError::checkpoint(format!(
                        "work queue search {search} holds an invalid candidate"
                    )));
                }
                queued += bucket.len();
            }
        }
        if queued != self.remaining {
            return Err(EnnError::checkpoint(format!(
                "work queue remaining={} disagrees with {queued} queued pairs",
                self.remaining
            )));
        }
        for &search in &self.active {
            if search >= n || !self.in_active[search] {
                return Err(EnnError::checkpoint(format!(
                    "work queue active search {search} is inconsistent"
                )));
            }
        }
        if self.in_active.iter().filter(|&&a| a).count() != self.active.len() {
            return Err(EnnError::checkpoint(
                "work queue active flags disagree with active list",
            ));
        }
        Ok(())
    }
}

fn present_classes(data: &Dataset) -> Vec<usize> {
    data.class_counts()
        .iter()
        .enumerate()
        .filter(|&(_, &count)| count > 0)
        .map(|(class, _)| class)
        .collect()
}
