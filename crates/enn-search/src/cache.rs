// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use enn_core::EnnError;
use enn_measures::DistanceMeasure;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Retention policy for [`PairwiseDistanceCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    /// An entry is removed by the first lookup from the second side.
    #[default]
    SingleUse,
    /// Entries survive lookups; the oldest is evicted beyond `max_entries`.
    Bounded { max_entries: usize },
}

pub(crate) fn validate_cache_policy(policy: &CachePolicy) -> Result<(), EnnError> {
    if let CachePolicy::Bounded { max_entries } = policy
        && *max_entries == 0
    {
        return Err(EnnError::invalid_input(
            "cache_policy.Bounded.max_entries must be > 0; got 0",
        ));
    }
    Ok(())
}

/// Distances keyed by unordered index pair, shared between the two searches
/// of a symmetric measure.
///
/// Only constructible for symmetric measures, so `(a, b)` and `(b, a)` can
/// never be confused under an asymmetric one.
#[derive(Clone, Debug)]
pub struct PairwiseDistanceCache {
    policy: CachePolicy,
    entries: HashMap<(usize, usize), f64>,
    order: VecDeque<(usize, usize)>,
    hits: usize,
    misses: usize,
    evictions: usize,
}

#[inline]
fn canonical(a: usize, b: usize) -> (usize, usize) {
    if a <= b { (a, b) } else { (b, a) }
}

impl PairwiseDistanceCache {
    /// Creates a cache for `measure`, rejecting asymmetric measures.
    pub fn for_measure<M: DistanceMeasure>(
        measure: &M,
        policy: CachePolicy,
    ) -> Result<Self, EnnError> {
        if !measure.is_symmetric() {
            return Err(EnnError::not_supported(format!(
                "pairwise distance cache requires a symmetric measure; {} is asymmetric",
                measure.name()
            )));
        }
        validate_cache_policy(&policy)?;
        Ok(Self {
            policy,
            entries: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        })
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn put(&mut self, a: usize, b: usize, distance: f64) {
        let key = canonical(a, b);
        if self.entries.insert(key, distance).is_some() {
            return;
        }
        if let CachePolicy::Bounded { max_entries } = self.policy {
            self.order.push_back(key);
            while self.entries.len() > max_entries {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                if self.entries.remove(&oldest).is_some() {
                    self.evictions += 1;
                }
            }
        }
    }

    pub fn get(&self, a: usize, b: usize) -> Option<f64> {
        self.entries.get(&canonical(a, b)).copied()
    }

    pub fn remove(&mut self, a: usize, b: usize) -> Option<f64> {
        let key = canonical(a, b);
        let removed = self.entries.remove(&key);
        if removed.is_some() && matches!(self.policy, CachePolicy::Bounded { .. }) {
            self.order.retain(|k| *k != key);
        }
        removed
    }

    /// Lookup by the side that did not compute the value.
    ///
    /// Removes the entry under [`CachePolicy::SingleUse`], keeps it otherwise.
    pub fn consume(&mut self, a: usize, b: usize) -> Option<f64> {
        let value = match self.policy {
            CachePolicy::SingleUse => self.entries.remove(&canonical(a, b)),
            CachePolicy::Bounded { .. } => self.get(a, b),
        };
        if value.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        value
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn evictions(&self) -> usize {
        self.evictions
    }

    /// Entries in insertion order for bounded caches, key order otherwise.
    pub fn entries(&self) -> Vec<(usize, usize, f64)> {
        match self.policy {
            CachePolicy::Bounded { .. } => self
                .order
                .iter()
                .filter_map(|key| self.entries.get(key).map(|d| (key.0, key.1, *d)))
                .collect(),
            CachePolicy::SingleUse => {
                let mut out: Vec<_> = self
                    .entries
                    .iter()
                    .map(|(key, d)| (key.0, key.1, *d))
                    .collect();
                out.sort_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)));
                out
            }
        }
    }
}
