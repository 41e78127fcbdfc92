// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use std::cmp::Ordering;

/// A retained neighbour candidate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbour {
    pub distance: f64,
    pub index: usize,
    pub label: usize,
}

fn neighbour_order(a: &Neighbour, b: &Neighbour) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.index.cmp(&b.index))
}

/// Bounded top-k accumulator that keeps every tie at the k-th distance.
///
/// Entries are sorted by `(distance, index)`. After every insertion the
/// trailing group of equal distances is dropped while the entries in front
/// of it alone still number at least `k`, so the frontier holds the `k`
/// smallest distances plus all ties with the k-th.
#[derive(Clone, Debug, PartialEq)]
pub struct Frontier {
    k: usize,
    entries: Vec<Neighbour>,
}

impl Frontier {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            entries: Vec::with_capacity(k + 1),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Neighbour] {
        &self.entries
    }

    /// True once at least `k` neighbours are held.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.k
    }

    /// Largest retained distance.
    pub fn worst(&self) -> Option<f64> {
        self.entries.last().map(|n| n.distance)
    }

    /// Distance a new candidate must not exceed to be retained.
    ///
    /// `+inf` until the frontier is full.
    pub fn limit(&self) -> f64 {
        if self.is_full() {
            self.worst().unwrap_or(f64::INFINITY)
        } else {
            f64::INFINITY
        }
    }

    /// True when `distance` would be retained.
    pub fn admits(&self, distance: f64) -> bool {
        distance <= self.limit()
    }

    /// Offers a candidate; returns whether it was retained.
    pub fn add(&mut self, distance: f64, index: usize, label: usize) -> bool {
        if !self.admits(distance) {
            return false;
        }
        let neighbour = Neighbour {
            distance,
            index,
            label,
        };
        let pos = self
            .entries
            .partition_point(|e| neighbour_order(e, &neighbour) == Ordering::Less);
        self.entries.insert(pos, neighbour);
        self.prune();
        true
    }

    fn prune(&mut self) {
        while let Some(last) = self.entries.last() {
            let worst = last.distance;
            let group = self
                .entries
                .iter()
                .rev()
                .take_while(|e| e.distance == worst)
                .count();
            if self.entries.len() - group >= self.k {
                self.entries.truncate(self.entries.len() - group);
            } else {
                break;
            }
        }
    }

    /// Same contents re-pruned to a smaller `k`.
    ///
    /// Because every tie at the k-th distance is retained, the result equals
    /// what a `k`-sized frontier would have accumulated directly.
    pub fn with_k(&self, k: usize) -> Self {
        debug_assert!(k <= self.k, "with_k may only shrink the frontier");
        let mut frontier = Self {
            k,
            entries: self.entries.clone(),
        };
        frontier.prune();
        frontier
    }

    /// Groups of neighbours sharing one distance, nearest first.
    pub fn groups(&self) -> impl Iterator<Item = &[Neighbour]> {
        self.entries.chunk_by(|a, b| a.distance == b.distance)
    }

    pub fn distance_of(&self, index: usize) -> Option<f64> {
        self.entries
            .iter()
            .find(|n| n.index == index)
            .map(|n| n.distance)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.entries.iter().any(|n| n.index == index)
    }

    /// Retained indices in ascending index order.
    pub fn sorted_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.entries.iter().map(|n| n.index).collect();
        indices.sort_unstable();
        indices
    }

    /// Single label shared by every retained neighbour, if any.
    pub fn homogeneous_label(&self) -> Option<usize> {
        let first = self.entries.first()?.label;
        self.entries
            .iter()
            .all(|n| n.label == first)
            .then_some(first)
    }

    /// Class votes: the last distance group shares one vote equally, every
    /// nearer neighbour casts a full vote.
    pub fn votes(&self, n_classes: usize) -> Vec<f64> {
        let mut votes = vec![0.0; n_classes];
        let last = self.worst();
        for group in self.groups() {
            let weight = if Some(group[0].distance) == last {
                1.0 / group.len() as f64
            } else {
                1.0
            };
            for neighbour in group {
                votes[neighbour.label] += weight;
            }
        }
        votes
    }

    /// Rebuilds a frontier from entries in any order.
    pub(crate) fn from_entries(k: usize, mut entries: Vec<Neighbour>) -> Self {
        entries.sort_by(neighbour_order);
        let mut frontier = Self { k, entries };
        frontier.prune();
        frontier
    }
}
