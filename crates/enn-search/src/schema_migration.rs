// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::cache::CachePolicy;
use crate::config::{CheckpointConfig, KnnConfig, SymmetryStrategy};
use crate::iteration::IterationStrategy;
use enn_core::{Budget, CURRENT_SCHEMA_VERSION, EnnError, validate_schema_version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type UnknownFields = Map<String, Value>;

/// Wire format for versioned [`KnnConfig`] payloads.
///
/// Only `schema_version` and `k` are required; omitted fields take the
/// runtime defaults and fields from newer schemas are kept in
/// `unknown_fields` so they survive a read-modify-write cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnnConfigWire {
    pub schema_version: u32,
    pub k: usize,
    #[serde(default = "default_true")]
    pub early_abandon: bool,
    #[serde(default = "default_true")]
    pub lower_bound_pruning: bool,
    #[serde(default)]
    pub iteration: IterationStrategy,
    #[serde(default)]
    pub symmetry: SymmetryStrategy,
    #[serde(default)]
    pub cache_policy: CachePolicy,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub random_tie_break: bool,
    #[serde(default)]
    pub early_predict: bool,
    #[serde(default)]
    pub auto_k: bool,
    #[serde(default)]
    pub budget: Budget,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    #[serde(default, flatten)]
    pub unknown_fields: UnknownFields,
}

impl KnnConfigWire {
    pub fn from_runtime(config: KnnConfig) -> Self {
        Self::from_runtime_with_unknown(config, CURRENT_SCHEMA_VERSION, UnknownFields::new())
    }

    pub fn from_runtime_with_unknown(
        config: KnnConfig,
        schema_version: u32,
        unknown_fields: UnknownFields,
    ) -> Self {
        Self {
            schema_version,
            k: config.k,
            early_abandon: config.early_abandon,
            lower_bound_pruning: config.lower_bound_pruning,
            iteration: config.iteration,
            symmetry: config.symmetry,
            cache_policy: config.cache_policy,
            seed: config.seed,
            random_tie_break: config.random_tie_break,
            early_predict: config.early_predict,
            auto_k: config.auto_k,
            budget: config.budget,
            checkpoint: config.checkpoint,
            progress_every: config.progress_every,
            unknown_fields,
        }
    }

    pub fn into_runtime_parts(self) -> Result<(KnnConfig, UnknownFields), EnnError> {
        validate_schema_version(self.schema_version, "KnnConfig")?;
        let config = KnnConfig {
            k: self.k,
            early_abandon: self.early_abandon,
            lower_bound_pruning: self.lower_bound_pruning,
            iteration: self.iteration,
            symmetry: self.symmetry,
            cache_policy: self.cache_policy,
            seed: self.seed,
            random_tie_break: self.random_tie_break,
            early_predict: self.early_predict,
            auto_k: self.auto_k,
            budget: self.budget,
            checkpoint: self.checkpoint,
            progress_every: self.progress_every,
        };
        config.validate()?;
        Ok((config, self.unknown_fields))
    }

    pub fn to_runtime(self) -> Result<KnnConfig, EnnError> {
        let (config, _) = self.into_runtime_parts()?;
        Ok(config)
    }
}

fn default_true() -> bool {
    true
}

fn default_progress_every() -> usize {
    KnnConfig::default().progress_every
}

#[cfg(test)]
mod tests {
    use super::KnnConfigWire;
    use crate::cache::CachePolicy;
    use crate::checkpoint::PayloadCodec;
    use crate::config::KnnConfig;
    use crate::iteration::IterationStrategy;
    use enn_core::{MAX_FORWARD_COMPAT_SCHEMA_VERSION, MIGRATION_GUIDANCE_PATH};
    use serde_json::{Value, json};

    const KNN_V1_FIXTURE: &str =
        include_str!("../../../tests/fixtures/migrations/config/knn.v1.json");
    const KNN_V2_FIXTURE: &str =
        include_str!("../../../tests/fixtures/migrations/config/knn.v2.additive.json");

    fn parse_json(raw: &str) -> Value {
        serde_json::from_str(raw).expect("fixture should parse")
    }

    #[test]
    fn knn_v1_roundtrip_matches_fixture() {
        let wire: KnnConfigWire =
            serde_json::from_str(KNN_V1_FIXTURE).expect("v1 knn config should deserialize");
        let encoded = serde_json::to_value(&wire).expect("wire should serialize");
        assert_eq!(encoded, parse_json(KNN_V1_FIXTURE));

        let runtime = wire.to_runtime().expect("v1 fixture should convert");
        assert_eq!(runtime.k, 3);
        assert!(runtime.auto_k);
        assert_eq!(runtime.budget.test_time_ms, Some(250));
    }

    #[test]
    fn v1_reader_accepts_v2_additive_fixture() {
        let wire: KnnConfigWire =
            serde_json::from_str(KNN_V2_FIXTURE).expect("v2 knn config should deserialize");
        assert_eq!(wire.schema_version, MAX_FORWARD_COMPAT_SCHEMA_VERSION);
        let runtime = wire.to_runtime().expect("v2 should convert to runtime");
        let checkpoint = runtime.checkpoint.expect("fixture configures checkpointing");
        assert_eq!(checkpoint.codec, PayloadCodec::Bincode);
        assert_eq!(runtime.cache_policy, CachePolicy::Bounded { max_entries: 4096 });
    }

    #[test]
    fn minimal_payload_fills_runtime_defaults() {
        let wire: KnnConfigWire = serde_json::from_value(json!({
            "schema_version": 1,
            "k": 1
        }))
        .expect("minimal config should deserialize");
        let runtime = wire.to_runtime().expect("minimal config should convert");
        assert_eq!(runtime, KnnConfig::default());
        assert_eq!(runtime.iteration, IterationStrategy::Random);
    }

    #[test]
    fn unsupported_schema_version_returns_migration_guidance() {
        let mut wire = KnnConfigWire::from_runtime(KnnConfig::default());
        wire.schema_version = 99;
        let err = wire
            .to_runtime()
            .expect_err("unsupported schema version should fail");
        let message = err.to_string();
        assert!(message.contains("schema_version=99"));
        assert!(message.contains(MIGRATION_GUIDANCE_PATH));
    }

    #[test]
    fn unknown_fields_roundtrip() {
        let wire: KnnConfigWire =
            serde_json::from_str(KNN_V2_FIXTURE).expect("v2 knn config should deserialize");
        assert!(wire.unknown_fields.contains_key("future_candidate_order"));
        let (runtime, unknown) = wire
            .into_runtime_parts()
            .expect("wire should convert to runtime");
        let rebuilt =
            KnnConfigWire::from_runtime_with_unknown(runtime, MAX_FORWARD_COMPAT_SCHEMA_VERSION, unknown);
        let rebuilt_value = serde_json::to_value(&rebuilt).expect("rebuilt wire should serialize");
        let source_value = parse_json(KNN_V2_FIXTURE);
        assert_eq!(
            rebuilt_value.get("future_candidate_order"),
            source_value.get("future_candidate_order")
        );
    }

    #[test]
    fn to_runtime_rejects_invalid_values() {
        let wire: KnnConfigWire = serde_json::from_value(json!({
            "schema_version": 1,
            "k": 0
        }))
        .expect("wire should deserialize");
        let err = wire.to_runtime().expect_err("k=0 must fail");
        assert!(err.to_string().contains("KnnConfig.k"));

        let wire: KnnConfigWire = serde_json::from_value(json!({
            "schema_version": 1,
            "k": 2,
            "early_predict": true
        }))
        .expect("wire should deserialize");
        let err = wire.to_runtime().expect_err("early predict with k=2 must fail");
        assert!(err.to_string().contains("early_predict"));
    }
}
