// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::model::{ABANDONED, DistanceMeasure};
use enn_core::{EnnError, Sequence};

/// Upper and lower running envelopes of a sequence under a warping band.
///
/// Stored time-major like [`Sequence`]: `upper[t * dims + d]`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
    pub band: usize,
}

/// Dependent multi-dimensional dynamic time warping.
///
/// Point cost is the squared Euclidean distance between time steps; the
/// warping path is restricted to a Sakoe-Chiba band whose half-width is
/// `window * max(len_a, len_b)` rounded up, or unrestricted when `window` is
/// `None`. The band always widens to at least `|len_a - len_b|` so that a
/// path exists.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Dtw {
    window: Option<f64>,
}

impl Dtw {
    /// Unconstrained DTW.
    pub fn full() -> Self {
        Self { window: None }
    }

    /// DTW with a band expressed as a fraction of the longer sequence.
    pub fn with_window(window: f64) -> Result<Self, EnnError> {
        if !window.is_finite() || !(0.0..=1.0).contains(&window) {
            return Err(EnnError::invalid_input(format!(
                "dtw window must be within [0, 1]; got {window}"
            )));
        }
        Ok(Self {
            window: Some(window),
        })
    }

    pub fn window(&self) -> Option<f64> {
        self.window
    }

    fn band_for(&self, len: usize) -> usize {
        match self.window {
            None => len,
            Some(window) => (window * len as f64).ceil() as usize,
        }
    }
}

#[inline]
fn point_cost(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

impl DistanceMeasure for Dtw {
    type Stats = Envelope;

    fn name(&self) -> &'static str {
        "dtw"
    }

    fn validate_pair(&self, a: &Sequence, b: &Sequence) -> Result<(), EnnError> {
        if a.dims() != b.dims() {
            return Err(EnnError::invalid_input(format!(
                "dtw requires equal dimensionality; got {} vs {}",
                a.dims(),
                b.dims()
            )));
        }
        Ok(())
    }

    fn is_symmetric(&self) -> bool {
        true
    }

    fn precompute(&self, seq: &Sequence) -> Result<Envelope, EnnError> {
        let len = seq.len();
        let dims = seq.dims();
        let band = self.band_for(len);
        let mut upper = vec![f64::NEG_INFINITY; len * dims];
        let mut lower = vec![f64::INFINITY; len * dims];
        for t in 0..len {
            let from = t.saturating_sub(band);
            let to = (t + band).min(len - 1);
            for s in from..=to {
                for d in 0..dims {
                    let v = seq.value(s, d);
                    let slot = t * dims + d;
                    upper[slot] = upper[slot].max(v);
                    lower[slot] = lower[slot].min(v);
                }
            }
        }
        Ok(Envelope { upper, lower, band })
    }

    fn distance(&self, a: &Sequence, b: &Sequence, cutoff: f64) -> Result<f64, EnnError> {
        self.validate_pair(a, b)?;
        let n = a.len();
        let m = b.len();
        let band = self.band_for(n.max(m)).max(n.abs_diff(m));

        let mut prev = vec![f64::INFINITY; m + 1];
        let mut curr = vec![f64::INFINITY; m + 1];
        prev[0] = 0.0;

        for i in 1..=n {
            curr.iter_mut().for_each(|c| *c = f64::INFINITY);
            let from = i.saturating_sub(band).max(1);
            let to = (i + band).min(m);
            let mut row_min = f64::INFINITY;
            for j in from..=to {
                let best = prev[j - 1].min(prev[j]).min(curr[j - 1]);
                let value = point_cost(a.step(i - 1), b.step(j - 1)) + best;
                curr[j] = value;
                row_min = row_min.min(value);
            }
            if row_min > cutoff {
                return Ok(ABANDONED);
            }
            std::mem::swap(&mut prev, &mut curr);
        }

        let total = prev[m];
        if total.is_nan() {
            return Err(EnnError::numerical_issue("dtw accumulated a NaN cost"));
        }
        Ok(total)
    }

    fn supports_lower_bound(&self) -> bool {
        true
    }

    /// LB_Keogh of `candidate` against the envelope of `query`.
    ///
    /// Only defined for equal lengths with matching bands.
    fn lower_bound(
        &self,
        query: &Sequence,
        query_stats: &Envelope,
        candidate: &Sequence,
        _candidate_stats: &Envelope,
        cutoff: f64,
    ) -> Option<f64> {
        if query.len() != candidate.len() || query.dims() != candidate.dims() {
            return None;
        }
        let dims = query.dims();
        let mut sum = 0.0;
        for (slot, &c) in candidate.values().iter().enumerate() {
            let upper = query_stats.upper[slot];
            let lower = query_stats.lower[slot];
            if c > upper {
                sum += (c - upper) * (c - upper);
            } else if c < lower {
                sum += (lower - c) * (lower - c);
            }
            if sum > cutoff && (slot + 1).is_multiple_of(dims) {
                return Some(sum);
            }
        }
        Some(sum)
    }
}
