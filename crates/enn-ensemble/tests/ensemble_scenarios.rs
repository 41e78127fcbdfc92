// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use enn_core::{
    Budget, Dataset, EnnError, InstancePrediction, LoocvResult, QueryPrediction, Sequence,
};
use enn_ensemble::{
    Constituent, ElasticEnsemble, EnsembleConfig, ResultSource, train_result_path,
};
use enn_eval::{ClassShapesConfig, class_shapes, train_test_split};
use enn_measures::{Dtw, Euclidean};
use enn_search::{BindOutcome, EnginePhase, KnnConfig, LoocvEngine};
use std::path::Path;

fn shapes() -> Dataset {
    class_shapes(&ClassShapesConfig {
        n_classes: 3,
        per_class: 6,
        length: 32,
        dims: 1,
        max_shift: 6,
        noise_std: 0.2,
        seed: 21,
    })
    .expect("synthetic dataset")
}

fn knn(seed: u64) -> KnnConfig {
    KnnConfig {
        seed,
        ..KnnConfig::default()
    }
}

fn two_member_ensemble<'a>(config: EnsembleConfig) -> ElasticEnsemble<'a> {
    ElasticEnsemble::new(config)
        .expect("ensemble config")
        .with_constituent(
            "ed",
            Box::new(LoocvEngine::new(Euclidean, knn(1)).expect("valid config")),
        )
        .expect("ed constituent")
        .with_constituent(
            "dtw_w10",
            Box::new(
                LoocvEngine::new(Dtw::with_window(0.1).expect("window"), knn(2))
                    .expect("valid config"),
            ),
        )
        .expect("dtw constituent")
}

fn stored_config(dir: &Path, load: bool, save: bool) -> EnsembleConfig {
    EnsembleConfig {
        seed: 9,
        results_dir: Some(dir.to_path_buf()),
        load_results: load,
        save_results: save,
        ..EnsembleConfig::default()
    }
}

#[test]
fn weights_are_constituent_loocv_accuracies() {
    let data = shapes();
    let (train, test) = train_test_split(&data, 0.2, 4).expect("split");
    let mut ensemble = two_member_ensemble(EnsembleConfig::default());
    let summary = ensemble.train(&train).expect("train");
    assert_eq!(summary.built, 2);
    assert_eq!(summary.loaded, 0);
    assert!(summary.provisional.is_empty());
    assert!(ensemble.is_trained());

    let mut ed = LoocvEngine::new(Euclidean, knn(1)).expect("valid config");
    ed.bind(&train).expect("bind");
    ed.run().expect("run");
    let ed_result = ed.finalize().expect("finalize");
    let weights = ensemble.weights();
    assert_eq!(weights[0], ("ed", ed_result.accuracy));
    assert_eq!(
        ensemble.constituent_result("ed").map(|result| result.accuracy),
        Some(ed_result.accuracy)
    );

    for query in test.iter() {
        let prediction = ensemble.predict(query).expect("predict");
        assert_eq!(prediction.votes.len(), 2);
        let ed_vote = ed.predict(query).expect("standalone predict");
        assert_eq!(prediction.votes[0].predicted_label, ed_vote.predicted_label);

        let mut expected = vec![0.0; train.n_classes()];
        for vote in &prediction.votes {
            expected[vote.predicted_label] += vote.weight;
        }
        let total: f64 = expected.iter().sum();
        if total > 0.0 {
            expected.iter_mut().for_each(|score| *score /= total);
        }
        for (actual, expected) in prediction.distribution.iter().zip(&expected) {
            assert!((actual - expected).abs() < 1e-12);
        }
        assert!(!prediction.provisional);
    }
}

#[test]
fn train_estimate_combines_constituent_votes() {
    let data = shapes();
    let mut ensemble = two_member_ensemble(EnsembleConfig::default());
    ensemble.train(&data).expect("train");
    let estimate = ensemble.train_estimate().expect("estimate");
    assert_eq!(estimate.len(), data.len());
    assert!(!estimate.provisional);
    assert_eq!(estimate.true_labels(), data.iter().map(Sequence::label).collect::<Vec<_>>());

    let ed = ensemble.constituent_result("ed").expect("ed trained");
    let dtw = ensemble.constituent_result("dtw_w10").expect("dtw trained");
    for (index, prediction) in estimate.predictions.iter().enumerate() {
        let ed_label = ed.predictions[index].predicted_label;
        let dtw_label = dtw.predictions[index].predicted_label;
        if ed_label == dtw_label && (ed.accuracy > 0.0 || dtw.accuracy > 0.0) {
            assert_eq!(prediction.predicted_label, ed_label);
        }
        let sum: f64 = prediction.distribution.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}

#[test]
fn stored_results_skip_constituent_builds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data = shapes();

    let mut first = two_member_ensemble(stored_config(dir.path(), false, true));
    first.train(&data).expect("train");
    assert!(train_result_path(dir.path(), "ed").exists());
    assert!(train_result_path(dir.path(), "dtw_w10").exists());

    let mut second = two_member_ensemble(stored_config(dir.path(), true, false));
    let summary = second.train(&data).expect("train from stored results");
    assert_eq!(summary.loaded, 2);
    assert_eq!(summary.built, 0);
    assert_eq!(summary.rounds, 0);
    assert_eq!(second.result_source("ed"), Some(ResultSource::Loaded));
    assert_eq!(first.weights(), second.weights());

    let first_estimate = first.train_estimate().expect("estimate");
    let second_estimate = second.train_estimate().expect("estimate");
    assert_eq!(first_estimate.predictions, second_estimate.predictions);

    let query = data.get(0).expect("query");
    let a = first.predict(query).expect("predict");
    let b = second.predict(query).expect("predict");
    assert_eq!(a.predicted_label, b.predicted_label);
    assert_eq!(a.distribution, b.distribution);
}

#[test]
fn unusable_stored_result_falls_back_to_building() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data = shapes();
    let mut first = two_member_ensemble(stored_config(dir.path(), false, true));
    first.train(&data).expect("train");
    std::fs::write(train_result_path(dir.path(), "dtw_w10"), b"not json").expect("corrupt");

    let mut second = two_member_ensemble(stored_config(dir.path(), true, true));
    let summary = second.train(&data).expect("train");
    assert_eq!(summary.loaded, 1);
    assert_eq!(summary.built, 1);
    assert_eq!(second.result_source("ed"), Some(ResultSource::Loaded));
    assert_eq!(second.result_source("dtw_w10"), Some(ResultSource::Built));
    assert_eq!(first.weights(), second.weights());

    // the rebuilt result was saved again
    let reloaded = enn_ensemble::load_train_result(dir.path(), "dtw_w10", &data).expect("reload");
    assert_eq!(Some(&reloaded), second.constituent_result("dtw_w10"));
}

#[test]
fn neighbour_limited_constituent_stays_provisional() {
    let data = shapes();
    let limited = KnnConfig {
        budget: Budget {
            neighbour_limit: Some(5),
            ..Budget::default()
        },
        ..knn(3)
    };
    let mut ensemble = ElasticEnsemble::new(EnsembleConfig::default())
        .expect("ensemble config")
        .with_constituent(
            "ed",
            Box::new(LoocvEngine::new(Euclidean, limited).expect("valid config")),
        )
        .expect("ed constituent")
        .with_constituent(
            "dtw",
            Box::new(LoocvEngine::new(Dtw::full(), knn(4)).expect("valid config")),
        )
        .expect("dtw constituent");
    let summary = ensemble.train(&data).expect("train");
    assert_eq!(summary.provisional, vec!["ed".to_string()]);
    assert_eq!(summary.rounds, 2);
    let ed = ensemble.constituent_result("ed").expect("ed result");
    assert!(ed.provisional);
    assert_eq!(ed.neighbourhood_size, 10);
    assert!(!ensemble.constituent_result("dtw").expect("dtw result").provisional);
    assert!(ensemble.train_estimate().expect("estimate").provisional);
}

#[test]
fn generous_train_budget_completes_in_one_round() {
    let data = shapes();
    let mut ensemble = two_member_ensemble(EnsembleConfig {
        train_time_ms: Some(600_000),
        ..EnsembleConfig::default()
    });
    let summary = ensemble.train(&data).expect("train");
    assert_eq!(summary.rounds, 1);
    assert!(summary.provisional.is_empty());
    assert!(summary.train_time_ns > 0);
}

/// Constituent that always predicts `label`.
struct FixedVote<'a> {
    label: usize,
    data: Option<&'a Dataset>,
}

impl<'a> FixedVote<'a> {
    fn boxed(label: usize) -> Box<dyn Constituent<'a> + 'a> {
        Box::new(Self { label, data: None })
    }

    fn one_hot(&self, n_classes: usize) -> Vec<f64> {
        let mut distribution = vec![0.0; n_classes];
        distribution[self.label] = 1.0;
        distribution
    }
}

impl<'a> Constituent<'a> for FixedVote<'a> {
    fn measure_name(&self) -> &str {
        "fixed"
    }

    fn bind(&mut self, data: &'a Dataset) -> Result<BindOutcome, EnnError> {
        self.data = Some(data);
        Ok(BindOutcome::Fresh)
    }

    fn phase(&self) -> EnginePhase {
        if self.data.is_some() {
            EnginePhase::Complete
        } else {
            EnginePhase::Uninitialized
        }
    }

    fn neighbourhood_size(&self) -> usize {
        0
    }

    fn spent_time_ns(&self) -> u64 {
        0
    }

    fn set_train_time_ms(&mut self, _train_time_ms: Option<u64>) -> Result<(), EnnError> {
        Ok(())
    }

    fn run(&mut self) -> Result<EnginePhase, EnnError> {
        Ok(self.phase())
    }

    fn train_result(&mut self) -> Result<LoocvResult, EnnError> {
        let data = self
            .data
            .ok_or_else(|| EnnError::invalid_state("FixedVote is not bound"))?;
        let predictions = data
            .iter()
            .enumerate()
            .map(|(index, sequence)| InstancePrediction {
                index,
                true_label: sequence.label(),
                predicted_label: self.label,
                distribution: self.one_hot(data.n_classes()),
                eval_time_ns: 0,
            })
            .collect();
        LoocvResult::new("fixed", 1, predictions, false)
    }

    fn predict_with_k(&self, _query: &Sequence, _k: usize) -> Result<QueryPrediction, EnnError> {
        let data = self
            .data
            .ok_or_else(|| EnnError::invalid_state("FixedVote is not bound"))?;
        Ok(QueryPrediction {
            predicted_label: self.label,
            distribution: self.one_hot(data.n_classes()),
            neighbours: vec![],
            examined: 0,
            provisional: false,
            eval_time_ns: 0,
        })
    }
}

fn two_class_data() -> Dataset {
    Dataset::from_sequences(vec![
        Sequence::univariate(vec![0.0], 0).expect("valid"),
        Sequence::univariate(vec![1.0], 1).expect("valid"),
    ])
    .expect("valid dataset")
}

fn tied_ensemble<'a>(seed: u64, random_tie_break: bool) -> ElasticEnsemble<'a> {
    ElasticEnsemble::new(EnsembleConfig {
        seed,
        random_tie_break,
        ..EnsembleConfig::default()
    })
    .expect("ensemble config")
    .with_constituent("zero", FixedVote::boxed(0))
    .expect("zero")
    .with_constituent("one", FixedVote::boxed(1))
    .expect("one")
}

#[test]
fn equal_weights_split_votes_and_seeded_tie_break_is_reproducible() {
    let data = two_class_data();
    let query = Sequence::univariate(vec![0.5], 0).expect("valid");

    let mut ensemble = tied_ensemble(17, true);
    ensemble.train(&data).expect("train");
    assert_eq!(ensemble.weights(), vec![("zero", 0.5), ("one", 0.5)]);
    let first = ensemble.predict(&query).expect("predict");
    assert_eq!(first.distribution, vec![0.5, 0.5]);
    let second = ensemble.predict(&query).expect("predict");
    assert_eq!(first.predicted_label, second.predicted_label);

    let mut labels = std::collections::BTreeSet::new();
    for seed in 0..64 {
        let mut seeded = tied_ensemble(seed, true);
        seeded.train(&data).expect("train");
        labels.insert(seeded.predict(&query).expect("predict").predicted_label);
    }
    assert_eq!(labels.len(), 2, "seeded tie break should reach both classes");

    let mut lowest = tied_ensemble(17, false);
    lowest.train(&data).expect("train");
    assert_eq!(lowest.predict(&query).expect("predict").predicted_label, 0);
}

#[test]
fn zero_accuracy_constituents_yield_uniform_distribution() {
    let data = Dataset::new(
        vec![
            Sequence::univariate(vec![0.0], 0).expect("valid"),
            Sequence::univariate(vec![1.0], 0).expect("valid"),
        ],
        2,
    )
    .expect("valid dataset");
    let mut ensemble = ElasticEnsemble::new(EnsembleConfig::default())
        .expect("ensemble config")
        .with_constituent("wrong", FixedVote::boxed(1))
        .expect("constituent");
    ensemble.train(&data).expect("train");
    assert_eq!(ensemble.weights(), vec![("wrong", 0.0)]);
    let query = Sequence::univariate(vec![0.2], 0).expect("valid");
    let prediction = ensemble.predict(&query).expect("predict");
    assert_eq!(prediction.distribution, vec![0.5, 0.5]);
}

#[test]
fn failing_query_does_not_affect_other_queries() {
    let data = shapes();
    let mut ensemble = two_member_ensemble(EnsembleConfig::default());
    ensemble.train(&data).expect("train");
    let good = data.get(1).expect("query").clone();
    let short = Sequence::univariate(vec![0.0; 4], 0).expect("valid");
    let outcomes = ensemble.predict_all(&[good, short]);
    assert!(outcomes[0].is_ok());
    assert!(outcomes[1].is_err());
}
