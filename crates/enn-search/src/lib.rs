// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

//! Progressive leave-one-out nearest-neighbour engine.

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod frontier;
pub mod iteration;
pub mod schema_migration;
pub mod search;
pub mod seen;

pub use cache::{CachePolicy, PairwiseDistanceCache};
pub use checkpoint::{
    CacheSnapshot, CachedPair, CheckpointEnvelope, EngineSnapshot, LOOCV_ENGINE_KIND,
    NeighbourSnapshot, PayloadCodec, SearchSnapshot, SnapshotPhase, build_envelope,
    check_envelope_identity, decode_checkpoint_envelope, decode_snapshot,
    encode_checkpoint_envelope, encode_snapshot, read_checkpoint_file, write_checkpoint_file,
};
pub use config::{CheckpointConfig, KnnConfig, SymmetryStrategy};
pub use engine::{BindOutcome, EnginePhase, LoocvEngine};
pub use frontier::{Frontier, Neighbour};
pub use iteration::{IterationStrategy, WorkQueue};
pub use schema_migration::{KnnConfigWire, UnknownFields};
pub use search::{AddOutcome, EvalPolicy, NeighbourSearch, Probe};
pub use seen::SeenSet;
