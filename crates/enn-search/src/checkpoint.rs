// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::cache::CachePolicy;
use crate::iteration::WorkQueue;
use crate::seen::SeenSet;
use bincode::Options;
use enn_core::{
    BuildDiagnostics, CURRENT_SCHEMA_VERSION, EnnError, TickEstimate, validate_schema_version,
};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Engine kind recorded in every envelope written by [`crate::LoocvEngine`].
pub const LOOCV_ENGINE_KIND: &str = "loocv_engine";

/// Serialization used for the snapshot payload inside an envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadCodec {
    Json,
    #[default]
    Bincode,
}

/// Self-describing wrapper around an encoded [`EngineSnapshot`].
///
/// The envelope itself is always JSON; `payload` is encoded with `payload_codec`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    pub schema_version: u32,
    pub engine: String,
    pub measure: String,
    pub dataset_fingerprint: u64,
    pub payload_codec: PayloadCodec,
    pub payload: Vec<u8>,
}

/// Lifecycle phase a snapshot was taken in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPhase {
    Paused,
    Complete,
}

/// One frontier entry; `distance: None` encodes `+inf`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NeighbourSnapshot {
    pub index: usize,
    pub label: usize,
    pub distance: Option<f64>,
}

/// Frontier and examined set of one leave-one-out search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchSnapshot {
    pub neighbours: Vec<NeighbourSnapshot>,
    pub seen: SeenSet,
    pub eval_time_ns: u64,
}

/// One parked pairwise distance; `distance: None` encodes `+inf`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedPair {
    pub a: usize,
    pub b: usize,
    pub distance: Option<f64>,
}

/// Pairwise cache contents at snapshot time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub policy: CachePolicy,
    pub entries: Vec<CachedPair>,
}

/// Everything needed to resume a build exactly where it paused.
///
/// Frontiers refer to training sequences by dataset index only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub schema_version: u32,
    pub k: usize,
    pub n: usize,
    pub n_classes: usize,
    pub phase: SnapshotPhase,
    pub searches: Vec<SearchSnapshot>,
    pub queue: WorkQueue,
    pub cache: Option<CacheSnapshot>,
    pub rng: ChaCha8Rng,
    pub neighbourhood_size: usize,
    pub max_neighbourhood_size: usize,
    pub diagnostics: BuildDiagnostics,
    pub tick_estimate: TickEstimate,
    pub build_time_ns: u64,
    pub estimate_time_ns: u64,
    /// Wall-clock time spent inside `run`/`tick` across every resume.
    #[serde(default)]
    pub run_time_ns: u64,
    pub selected_k: Option<usize>,
}

pub(crate) fn finite_or_none(distance: f64) -> Option<f64> {
    distance.is_finite().then_some(distance)
}

pub(crate) fn none_as_infinity(distance: Option<f64>) -> f64 {
    distance.unwrap_or(f64::INFINITY)
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
}

/// Encodes a snapshot payload.
pub fn encode_snapshot(snapshot: &EngineSnapshot, codec: PayloadCodec) -> Result<Vec<u8>, EnnError> {
    match codec {
        PayloadCodec::Json => serde_json::to_vec(snapshot)
            .map_err(|err| EnnError::checkpoint(format!("failed to encode JSON snapshot: {err}"))),
        PayloadCodec::Bincode => bincode_options().serialize(snapshot).map_err(|err| {
            EnnError::checkpoint(format!("failed to encode bincode snapshot: {err}"))
        }),
    }
}

/// Decodes a snapshot payload and checks its schema version.
pub fn decode_snapshot(payload: &[u8], codec: PayloadCodec) -> Result<EngineSnapshot, EnnError> {
    let snapshot: EngineSnapshot = match codec {
        PayloadCodec::Json => serde_json::from_slice(payload)
            .map_err(|err| EnnError::checkpoint(format!("failed to decode JSON snapshot: {err}")))?,
        PayloadCodec::Bincode => bincode_options()
            .with_limit(payload.len() as u64)
            .deserialize(payload)
            .map_err(|err| {
                EnnError::checkpoint(format!("failed to decode bincode snapshot: {err}"))
            })?,
    };
    validate_schema_version(snapshot.schema_version, "EngineSnapshot")?;
    Ok(snapshot)
}

/// Wraps an encoded snapshot with identity metadata.
pub fn build_envelope(
    snapshot: &EngineSnapshot,
    measure: &str,
    dataset_fingerprint: u64,
    codec: PayloadCodec,
) -> Result<CheckpointEnvelope, EnnError> {
    Ok(CheckpointEnvelope {
        schema_version: CURRENT_SCHEMA_VERSION,
        engine: LOOCV_ENGINE_KIND.to_string(),
        measure: measure.to_string(),
        dataset_fingerprint,
        payload_codec: codec,
        payload: encode_snapshot(snapshot, codec)?,
    })
}

/// Serializes an envelope to bytes.
pub fn encode_checkpoint_envelope(envelope: &CheckpointEnvelope) -> Result<Vec<u8>, EnnError> {
    serde_json::to_vec(envelope)
        .map_err(|err| EnnError::checkpoint(format!("failed to encode checkpoint envelope: {err}")))
}

/// Parses an envelope and checks its schema version.
pub fn decode_checkpoint_envelope(bytes: &[u8]) -> Result<CheckpointEnvelope, EnnError> {
    let envelope: CheckpointEnvelope = serde_json::from_slice(bytes)
        .map_err(|err| EnnError::checkpoint(format!("failed to decode checkpoint envelope: {err}")))?;
    validate_schema_version(envelope.schema_version, "CheckpointEnvelope")
        .map_err(|err| EnnError::checkpoint(err.to_string()))?;
    Ok(envelope)
}

/// Checks that an envelope belongs to this engine, measure and dataset.
pub fn check_envelope_identity(
    envelope: &CheckpointEnvelope,
    measure: &str,
    dataset_fingerprint: u64,
) -> Result<(), EnnError> {
    if envelope.engine != LOOCV_ENGINE_KIND {
        return Err(EnnError::checkpoint(format!(
            "checkpoint engine '{}' does not match '{LOOCV_ENGINE_KIND}'",
            envelope.engine
        )));
    }
    if envelope.measure != measure {
        return Err(EnnError::checkpoint(format!(
            "checkpoint measure '{}' does not match '{measure}'",
            envelope.measure
        )));
    }
    if envelope.dataset_fingerprint != dataset_fingerprint {
        return Err(EnnError::checkpoint(format!(
            "checkpoint dataset fingerprint {:#018x} does not match {dataset_fingerprint:#018x}",
            envelope.dataset_fingerprint
        )));
    }
    Ok(())
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Writes `bytes` to `<path>.tmp`, syncs, then renames over `path`.
pub fn write_checkpoint_file(path: &Path, bytes: &[u8]) -> Result<(), EnnError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| {
            EnnError::resource_limit(format!(
                "failed to create checkpoint directory {}: {err}",
                parent.display()
            ))
        })?;
    }
    let tmp = temporary_path(path);
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|err| {
        let _ = fs::remove_file(&tmp);
        EnnError::resource_limit(format!(
            "failed to write checkpoint {}: {err}",
            path.display()
        ))
    })
}

/// Reads and decodes the envelope stored at `path`.
pub fn read_checkpoint_file(path: &Path) -> Result<CheckpointEnvelope, EnnError> {
    let bytes = fs::read(path).map_err(|err| {
        EnnError::checkpoint(format!("failed to read checkpoint {}: {err}", path.display()))
    })?;
    decode_checkpoint_envelope(&bytes)
}
