// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]

#[path = "common.rs"]
mod common;

use enn_core::{Budget, Dataset};
use enn_measures::{DistanceMeasure, Dtw, Euclidean};
use enn_search::{
    CheckpointEnvelope, KnnConfig, LoocvEngine, build_envelope, check_envelope_identity,
    decode_checkpoint_envelope, decode_snapshot, encode_checkpoint_envelope, encode_snapshot,
};
use libfuzzer_sys::fuzz_target;

fn budgeted(config: &KnnConfig, limit: usize) -> KnnConfig {
    KnnConfig {
        budget: Budget {
            neighbour_limit: Some(limit),
            ..Budget::default()
        },
        ..config.clone()
    }
}

fn build_encoded_checkpoint<M: DistanceMeasure + Clone>(
    measure: &M,
    config: &KnnConfig,
    data: &Dataset,
    cursor: &mut common::ByteCursor<'_>,
) -> Option<Vec<u8>> {
    let limit = common::bounded(cursor.next_u8(), 1, 64);
    let mut engine = LoocvEngine::new(measure.clone(), budgeted(config, limit)).ok()?;
    engine.bind(data).ok()?;
    engine.run().ok()?;
    let codec = common::payload_codec_from_seed(cursor.next_u8());
    let snapshot = engine.snapshot().ok()?;
    let envelope = build_envelope(&snapshot, measure.name(), data.fingerprint(), codec).ok()?;
    encode_checkpoint_envelope(&envelope).ok()
}

fn restore_and_finish<M: DistanceMeasure + Clone>(
    measure: &M,
    config: &KnnConfig,
    data: &Dataset,
    envelope: &CheckpointEnvelope,
) {
    if check_envelope_identity(envelope, measure.name(), data.fingerprint()).is_err() {
        return;
    }
    let Ok(snapshot) = decode_snapshot(&envelope.payload, envelope.payload_codec) else {
        return;
    };
    let Ok(mut engine) = LoocvEngine::new(measure.clone(), config.clone()) else {
        return;
    };
    if engine.restore(data, snapshot).is_ok() && engine.run().is_ok() {
        let _ = engine.provisional_result();
        let _ = engine.snapshot();
    }
}

fn try_decode_and_restore<M: DistanceMeasure + Clone>(
    measure: &M,
    config: &KnnConfig,
    data: &Dataset,
    candidate: &[u8],
) {
    if let Ok(envelope) = decode_checkpoint_envelope(candidate) {
        let _ = encode_checkpoint_envelope(&envelope);
        restore_and_finish(measure, config, data, &envelope);
    }
}

fn exercise<M: DistanceMeasure + Clone>(
    measure: M,
    config: &KnnConfig,
    data: &Dataset,
    cursor: &mut common::ByteCursor<'_>,
) {
    if let Some(encoded) = build_encoded_checkpoint(&measure, config, data, cursor) {
        try_decode_and_restore(&measure, config, data, &encoded);

        let variants = common::bounded(cursor.next_u8(), 1, 8);
        for _ in 0..variants {
            let mutated = common::mutate_input(&encoded, cursor);
            try_decode_and_restore(&measure, config, data, &mutated);
        }
    }
}

fuzz_target!(|data: &[u8]| {
    let mut cursor = common::ByteCursor::new(data);
    let Some(dataset) = common::dataset(&mut cursor) else {
        return;
    };
    let config = common::knn_config(&mut cursor);

    try_decode_and_restore(&Euclidean, &config, &dataset, data);

    if cursor.next_u8() % 2 == 0 {
        exercise(Euclidean, &config, &dataset, &mut cursor);
    } else {
        let window = f64::from(cursor.next_u8() % 101) / 100.0;
        if let Ok(dtw) = Dtw::with_window(window) {
            exercise(dtw, &config, &dataset, &mut cursor);
        }
    }

    let tail_len = common::bounded(cursor.next_u8(), 0, 256);
    let tail = cursor.take_padded(tail_len);
    try_decode_and_restore(&Euclidean, &config, &dataset, &tail);
});
