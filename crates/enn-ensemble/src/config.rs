// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use enn_core::EnnError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for [`crate::ElasticEnsemble`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Seed for tie breaking between equally weighted classes.
    pub seed: u64,
    /// Break vote ties at random; otherwise the lowest class wins.
    pub random_tie_break: bool,
    /// Wall-clock contract shared by all constituents' LOOCV builds.
    pub train_time_ms: Option<u64>,
    /// Directory holding `<constituent>.json` train results.
    pub results_dir: Option<PathBuf>,
    /// Reuse stored results instead of building the constituent.
    pub load_results: bool,
    /// Write every constituent's train result after training.
    pub save_results: bool,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            random_tie_break: true,
            train_time_ms: None,
            results_dir: None,
            load_results: false,
            save_results: false,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<(), EnnError> {
        if let Some(train_time_ms) = self.train_time_ms
            && train_time_ms == 0
        {
            return Err(EnnError::invalid_input(
                "EnsembleConfig.train_time_ms must be > 0 when provided; got 0",
            ));
        }
        if (self.load_results || self.save_results) && self.results_dir.is_none() {
            return Err(EnnError::invalid_input(
                "EnsembleConfig.results_dir is required when load_results or save_results is set",
            ));
        }
        if let Some(dir) = &self.results_dir
            && dir.as_os_str().is_empty()
        {
            return Err(EnnError::invalid_input(
                "EnsembleConfig.results_dir must be non-empty",
            ));
        }
        Ok(())
    }
}
