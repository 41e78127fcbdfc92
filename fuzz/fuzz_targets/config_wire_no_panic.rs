// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_main]

#[path = "common.rs"]
mod common;

use enn_measures::Euclidean;
use enn_search::{KnnConfigWire, LoocvEngine};
use libfuzzer_sys::fuzz_target;

const KNN_V1_FIXTURE: &str = include_str!("../../tests/fixtures/migrations/config/knn.v1.json");
const KNN_V2_FIXTURE: &str =
    include_str!("../../tests/fixtures/migrations/config/knn.v2.additive.json");

fn try_wire(bytes: &[u8]) {
    let Ok(wire) = serde_json::from_slice::<KnnConfigWire>(bytes) else {
        return;
    };
    let _ = serde_json::to_vec(&wire);
    if let Ok((config, unknown)) = wire.into_runtime_parts() {
        let _ = LoocvEngine::new(Euclidean, config.clone());
        let rebuilt = KnnConfigWire::from_runtime_with_unknown(config, 1, unknown);
        let _ = serde_json::to_vec(&rebuilt);
    }
}

fuzz_target!(|data: &[u8]| {
    let mut cursor = common::ByteCursor::new(data);

    try_wire(data);
    for fixture in [KNN_V1_FIXTURE, KNN_V2_FIXTURE] {
        let mutated = common::mutate_input(fixture.as_bytes(), &mut cursor);
        try_wire(&mutated);
    }
});
