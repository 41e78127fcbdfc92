// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use enn_core::{Budget, Dataset, Sequence};
use enn_measures::{DistanceMeasure, Dtw, Euclidean};
use enn_search::{
    EnginePhase, Frontier, IterationStrategy, KnnConfig, LoocvEngine, PayloadCodec,
    SymmetryStrategy, decode_snapshot, encode_snapshot,
};
use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, FileFailurePersistence};

fn dataset_strategy() -> impl Strategy<Value = Dataset> {
    (2usize..9, 3usize..8).prop_flat_map(|(n, len)| {
        prop::collection::vec(
            (prop::collection::vec(-10.0f64..10.0, len), 0usize..3),
            n,
        )
        .prop_map(|rows| {
            Dataset::from_sequences(
                rows.into_iter()
                    .map(|(values, label)| {
                        Sequence::univariate(values, label)
                            .expect("generated values always form a valid sequence")
                    })
                    .collect(),
            )
            .expect("generated sequences always form a valid dataset")
        })
    })
}

fn config_strategy() -> impl Strategy<Value = KnnConfig> {
    (
        1usize..4,
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<u64>(),
    )
        .prop_map(
            |(k, early_abandon, lower_bound_pruning, linear, cache, seed)| KnnConfig {
                k,
                early_abandon,
                lower_bound_pruning,
                iteration: if linear {
                    IterationStrategy::Linear
                } else {
                    IterationStrategy::Random
                },
                symmetry: if cache {
                    SymmetryStrategy::Cache
                } else {
                    SymmetryStrategy::Mirror
                },
                seed,
                ..KnnConfig::default()
            },
        )
}

fn brute_force_frontier<M: DistanceMeasure>(
    measure: &M,
    data: &Dataset,
    target: usize,
    k: usize,
) -> Frontier {
    let query = data.get(target).expect("target in range");
    let mut frontier = Frontier::new(k);
    for (index, candidate) in data.iter().enumerate() {
        if index != target {
            let distance = measure
                .distance(query, candidate, f64::INFINITY)
                .expect("exhaustive distance");
            frontier.add(distance, index, candidate.label());
        }
    }
    frontier
}

fn check_against_brute_force<M: DistanceMeasure>(
    engine: &LoocvEngine<'_, M>,
    data: &Dataset,
    k: usize,
) -> Result<(), TestCaseError> {
    for i in 0..data.len() {
        let expected = brute_force_frontier(engine.measure(), data, i, k);
        prop_assert_eq!(engine.frontier(i).expect("bound"), &expected);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        max_shrink_iters: 1024,
        failure_persistence: Some(Box::new(FileFailurePersistence::Direct("proptest-regressions/tests/proptest_invariants.txt"))),
        .. ProptestConfig::default()
    })]

    #[test]
    fn completed_build_equals_brute_force(
        data in dataset_strategy(),
        config in config_strategy(),
        window in 0.0f64..0.6,
    ) {
        let k = config.k;
        let dtw = Dtw::with_window(window).expect("window in range");
        let mut engine = LoocvEngine::new(dtw, config.clone()).expect("valid config");
        engine.bind(&data).expect("bind");
        prop_assert_eq!(engine.run().expect("run"), EnginePhase::Complete);
        prop_assert_eq!(engine.neighbourhood_size(), engine.max_neighbourhood_size());
        check_against_brute_force(&engine, &data, k)?;

        let mut euclidean = LoocvEngine::new(Euclidean, config).expect("valid config");
        euclidean.bind(&data).expect("bind");
        euclidean.run().expect("run");
        check_against_brute_force(&euclidean, &data, k)?;

        let result = engine.finalize().expect("finalize");
        for prediction in &result.predictions {
            let total: f64 = prediction.distribution.iter().sum();
            prop_assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn tick_budget_is_exact_and_resumable(
        data in dataset_strategy(),
        config in config_strategy(),
        limit in 1usize..40,
    ) {
        let k = config.k;
        let budgeted = KnnConfig {
            budget: Budget { neighbour_limit: Some(limit), ..Budget::default() },
            ..config
        };
        let mut engine = LoocvEngine::new(Euclidean, budgeted).expect("valid config");
        engine.bind(&data).expect("bind");
        let phase = engine.run().expect("run");
        let ticks = engine.diagnostics().expect("bound").ticks;
        match phase {
            EnginePhase::Paused => prop_assert_eq!(ticks, limit),
            EnginePhase::Complete => prop_assert!(ticks <= limit),
            other => prop_assert!(false, "unexpected phase {:?}", other),
        }
        prop_assert!(engine.neighbourhood_size() <= engine.max_neighbourhood_size());

        engine.set_budget(Budget::default()).expect("unbounded budget");
        prop_assert_eq!(engine.run().expect("resume"), EnginePhase::Complete);
        check_against_brute_force(&engine, &data, k)?;
    }

    #[test]
    fn snapshot_restore_mid_build_preserves_final_state(
        data in dataset_strategy(),
        config in config_strategy(),
        limit in 1usize..20,
        json in any::<bool>(),
    ) {
        let k = config.k;
        let codec = if json { PayloadCodec::Json } else { PayloadCodec::Bincode };
        let budgeted = KnnConfig {
            budget: Budget { neighbour_limit: Some(limit), ..Budget::default() },
            ..config.clone()
        };
        let mut first = LoocvEngine::new(Euclidean, budgeted).expect("valid config");
        first.bind(&data).expect("bind");
        first.run().expect("run");

        let payload = encode_snapshot(&first.snapshot().expect("snapshot"), codec)
            .expect("encode snapshot");
        let snapshot = decode_snapshot(&payload, codec).expect("decode snapshot");

        let mut second = LoocvEngine::new(Euclidean, config).expect("valid config");
        second.restore(&data, snapshot).expect("restore");
        prop_assert_eq!(
            second.neighbourhood_size(),
            first.neighbourhood_size()
        );
        prop_assert_eq!(second.run().expect("run"), EnginePhase::Complete);
        check_against_brute_force(&second, &data, k)?;
    }
}
