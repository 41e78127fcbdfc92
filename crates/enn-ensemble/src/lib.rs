// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

//! Elastic ensemble: accuracy-weighted voting over LOOCV nearest-neighbour
//! constituents built with [`enn_search::LoocvEngine`].

pub mod config;
pub mod constituent;
pub mod ensemble;
pub mod store;

pub use config::EnsembleConfig;
pub use constituent::Constituent;
pub use ensemble::{
    ConstituentVote, ENSEMBLE_MEASURE_NAME, ElasticEnsemble, EnsemblePrediction, ResultSource,
    TrainSummary,
};
pub use store::{
    StoredTrainResult, load_train_result, save_train_result, train_result_path,
    validate_constituent_name,
};
