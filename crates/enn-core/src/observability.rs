// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

/// Optional callback for reporting build progress in `[0.0, 1.0]`.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, fraction: f32);
}

/// Optional sink for low-overhead scalar telemetry.
pub trait TelemetrySink: Send + Sync {
    fn record_scalar(&self, key: &'static str, value: f64);
}

/// No-op progress sink for call sites that want an explicit sink object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_progress(&self, _fraction: f32) {}
}

/// No-op telemetry sink for call sites that want an explicit sink object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoopTelemetrySink;

impl TelemetrySink for NoopTelemetrySink {
    fn record_scalar(&self, _key: &'static str, _value: f64) {}
}

/// Forwards telemetry scalars as `tracing` debug events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn record_scalar(&self, key: &'static str, value: f64) {
        tracing::debug!(target: "enn::telemetry", key, value, "telemetry scalar");
    }
}

impl ProgressSink for TracingTelemetrySink {
    fn on_progress(&self, fraction: f32) {
        tracing::trace!(target: "enn::progress", fraction, "build progress");
    }
}
