// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

//! Persisted per-constituent LOOCV results.
//!
//! A stored result lets an ensemble skip a constituent's LOOCV build and use
//! the stored accuracy as that constituent's vote weight.

use enn_core::{CURRENT_SCHEMA_VERSION, Dataset, EnnError, LoocvResult, validate_schema_version};
use enn_search::write_checkpoint_file;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk form of one constituent's train result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredTrainResult {
    pub schema_version: u32,
    pub constituent: String,
    pub dataset_fingerprint: u64,
    pub result: LoocvResult,
}

/// Rejects names that would escape the results directory.
pub fn validate_constituent_name(name: &str) -> Result<(), EnnError> {
    if name.is_empty() {
        return Err(EnnError::invalid_input("constituent name must be non-empty"));
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(EnnError::invalid_input(format!(
            "constituent name must be a plain file stem; got '{name}'"
        )));
    }
    Ok(())
}

/// `<dir>/<name>.json`
pub fn train_result_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

pub fn save_train_result(
    dir: &Path,
    name: &str,
    data: &Dataset,
    result: &LoocvResult,
) -> Result<PathBuf, EnnError> {
    validate_constituent_name(name)?;
    let stored = StoredTrainResult {
        schema_version: CURRENT_SCHEMA_VERSION,
        constituent: name.to_string(),
        dataset_fingerprint: data.fingerprint(),
        result: result.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&stored).map_err(|err| {
        EnnError::invalid_input(format!("failed to serialize train result '{name}': {err}"))
    })?;
    let path = train_result_path(dir, name);
    write_checkpoint_file(&path, &bytes)?;
    Ok(path)
}

/// Loads a stored result and checks it belongs to `name` and `data`.
pub fn load_train_result(dir: &Path, name: &str, data: &Dataset) -> Result<LoocvResult, EnnError> {
    validate_constituent_name(name)?;
    let path = train_result_path(dir, name);
    let bytes = fs::read(&path).map_err(|err| {
        EnnError::checkpoint(format!(
            "failed to read train result {}: {err}",
            path.display()
        ))
    })?;
    let stored: StoredTrainResult = serde_json::from_slice(&bytes).map_err(|err| {
        EnnError::checkpoint(format!(
            "failed to decode train result {}: {err}",
            path.display()
        ))
    })?;
    validate_schema_version(stored.schema_version, "StoredTrainResult")
        .map_err(|err| EnnError::checkpoint(err.to_string()))?;
    if stored.constituent != name {
        return Err(EnnError::checkpoint(format!(
            "train result {} belongs to constituent '{}', expected '{name}'",
            path.display(),
            stored.constituent
        )));
    }
    if stored.dataset_fingerprint != data.fingerprint() {
        return Err(EnnError::checkpoint(format!(
            "train result {} was computed on a different dataset",
            path.display()
        )));
    }
    let result = stored.result;
    result
        .validate()
        .map_err(|err| EnnError::checkpoint(format!("train result {}: {err}", path.display())))?;
    if result.len() != data.len() {
        return Err(EnnError::checkpoint(format!(
            "train result {} holds {} predictions; dataset has {}",
            path.display(),
            result.len(),
            data.len()
        )));
    }
    if result
        .predictions
        .iter()
        .any(|prediction| prediction.distribution.len() != data.n_classes())
    {
        return Err(EnnError::checkpoint(format!(
            "train result {} distributions do not span {} classes",
            path.display(),
            data.n_classes()
        )));
    }
    Ok(result)
}
