// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

//! Distance-measure plugin contract plus reference measures.

pub mod dtw;
pub mod euclidean;
pub mod model;

pub use dtw::{Dtw, Envelope};
pub use euclidean::Euclidean;
pub use model::{ABANDONED, DistanceMeasure, StatsCache};
