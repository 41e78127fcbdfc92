// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

//! Core shared types for progressive elastic nearest-neighbour evaluation.

pub mod budget;
pub mod error;
pub mod numerics;
pub mod observability;
pub mod results;
pub mod schema;
pub mod sequence;

pub use budget::{
    Budget, BudgetStatus, BuildProgress, StopReason, TICK_ESTIMATE_WINDOW, TickEstimate,
    validate_budget,
};
pub use error::EnnError;
pub use numerics::{
    TIE_EPSILON, arg_max, arg_max_candidates, kahan_sum, normalize_distribution,
    uniform_distribution,
};
pub use observability::{
    NoopProgressSink, NoopTelemetrySink, ProgressSink, TelemetrySink, TracingTelemetrySink,
};
pub use results::{
    BuildDiagnostics, InstancePrediction, LoocvResult, QueryPrediction, prediction_accuracy,
};
pub use schema::{
    CURRENT_SCHEMA_VERSION, MAX_FORWARD_COMPAT_SCHEMA_VERSION, MIGRATION_GUIDANCE_PATH,
    validate_schema_version,
};
pub use sequence::{Dataset, Sequence};
