// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::cache::{CachePolicy, validate_cache_policy};
use crate::checkpoint::PayloadCodec;
use crate::iteration::IterationStrategy;
use enn_core::{Budget, EnnError, validate_budget};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_PROGRESS_EVERY: usize = 1024;

/// How a distance computed for one search reaches the mirrored search of a
/// symmetric measure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymmetryStrategy {
    /// Add the value to the mirrored search immediately.
    #[default]
    Mirror,
    /// Park the value in the pairwise cache until the mirrored search asks for it.
    Cache,
}

/// Periodic checkpointing of an in-progress build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    pub interval_ms: u64,
    pub codec: PayloadCodec,
    /// Resume from `path` on bind when a readable checkpoint exists.
    pub resume: bool,
}

/// Configuration for [`crate::LoocvEngine`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnnConfig {
    pub k: usize,
    pub early_abandon: bool,
    pub lower_bound_pruning: bool,
    pub iteration: IterationStrategy,
    pub symmetry: SymmetryStrategy,
    pub cache_policy: CachePolicy,
    pub seed: u64,
    pub random_tie_break: bool,
    /// Skip candidates of the class a 1-NN frontier already agrees on.
    pub early_predict: bool,
    /// After completion, pick the best `k' <= k` by LOOCV accuracy.
    pub auto_k: bool,
    pub budget: Budget,
    pub checkpoint: Option<CheckpointConfig>,
    pub progress_every: usize,
}

impl Default for KnnConfig {
    fn default() -> Self {
        Self {
            k: 1,
            early_abandon: true,
            lower_bound_pruning: true,
            iteration: IterationStrategy::Random,
            symmetry: SymmetryStrategy::Mirror,
            cache_policy: CachePolicy::SingleUse,
            seed: 0,
            random_tie_break: true,
            early_predict: false,
            auto_k: false,
            budget: Budget::default(),
            checkpoint: None,
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

pub(crate) fn validate_checkpoint_config(config: &CheckpointConfig) -> Result<(), EnnError> {
    if config.path.as_os_str().is_empty() {
        return Err(EnnError::invalid_input(
            "KnnConfig.checkpoint.path must be non-empty",
        ));
    }
    if config.interval_ms == 0 {
        return Err(EnnError::invalid_input(
            "KnnConfig.checkpoint.interval_ms must be > 0; got 0",
        ));
    }
    Ok(())
}

impl KnnConfig {
    pub fn validate(&self) -> Result<(), EnnError> {
        if self.k == 0 {
            return Err(EnnError::invalid_input("KnnConfig.k must be >= 1; got 0"));
        }
        if self.early_predict && self.k != 1 {
            return Err(EnnError::invalid_input(format!(
                "KnnConfig.early_predict requires k == 1; got k={}",
                self.k
            )));
        }
        validate_budget(&self.budget)?;
        validate_cache_policy(&self.cache_policy)?;
        if let Some(checkpoint) = &self.checkpoint {
            validate_checkpoint_config(checkpoint)?;
        }
        Ok(())
    }

    pub(crate) fn normalized_progress_every(&self) -> usize {
        self.progress_every.max(1)
    }
}
