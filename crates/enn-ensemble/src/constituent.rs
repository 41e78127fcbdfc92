// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use enn_core::{Dataset, EnnError, LoocvResult, QueryPrediction, Sequence};
use enn_measures::DistanceMeasure;
use enn_search::{BindOutcome, EnginePhase, LoocvEngine};

/// One ensemble member: a resumable LOOCV build plus a live classifier.
///
/// Object safe so members with different distance measures can share one
/// ensemble behind `Box<dyn Constituent<'a> + 'a>`.
pub trait Constituent<'a> {
    /// Name of the underlying distance measure.
    fn measure_name(&self) -> &str;

    fn bind(&mut self, data: &'a Dataset) -> Result<BindOutcome, EnnError>;

    fn phase(&self) -> EnginePhase;

    /// Examined (search, candidate) pairs; used to detect stalled rounds.
    fn neighbourhood_size(&self) -> usize;

    /// Wall-clock build time already charged against the train budget.
    fn spent_time_ns(&self) -> u64;

    /// Sets the cumulative wall-clock allowance for later runs.
    fn set_train_time_ms(&mut self, train_time_ms: Option<u64>) -> Result<(), EnnError>;

    fn run(&mut self) -> Result<EnginePhase, EnnError>;

    /// Final result when complete, otherwise the provisional one.
    fn train_result(&mut self) -> Result<LoocvResult, EnnError>;

    fn predict_with_k(&self, query: &Sequence, k: usize) -> Result<QueryPrediction, EnnError>;
}

impl<'a, M: DistanceMeasure> Constituent<'a> for LoocvEngine<'a, M> {
    fn measure_name(&self) -> &str {
        self.measure().name()
    }

    fn bind(&mut self, data: &'a Dataset) -> Result<BindOutcome, EnnError> {
        LoocvEngine::bind(self, data)
    }

    fn phase(&self) -> EnginePhase {
        LoocvEngine::phase(self)
    }

    fn neighbourhood_size(&self) -> usize {
        LoocvEngine::neighbourhood_size(self)
    }

    fn spent_time_ns(&self) -> u64 {
        self.run_time_ns()
    }

    fn set_train_time_ms(&mut self, train_time_ms: Option<u64>) -> Result<(), EnnError> {
        let mut budget = self.config().budget.clone();
        budget.train_time_ms = train_time_ms;
        self.set_budget(budget)
    }

    fn run(&mut self) -> Result<EnginePhase, EnnError> {
        LoocvEngine::run(self)
    }

    fn train_result(&mut self) -> Result<LoocvResult, EnnError> {
        if LoocvEngine::phase(self) == EnginePhase::Complete {
            self.finalize()
        } else {
            self.provisional_result()
        }
    }

    fn predict_with_k(&self, query: &Sequence, k: usize) -> Result<QueryPrediction, EnnError> {
        LoocvEngine::predict_with_k(self, query, k)
    }
}

#[cfg(test)]
mod tests {
    use super::Constituent;
    use enn_core::{Budget, Dataset, Sequence};
    use enn_measures::Euclidean;
    use enn_search::{EnginePhase, KnnConfig, LoocvEngine};

    fn tiny() -> Dataset {
        Dataset::from_sequences(vec![
            Sequence::univariate(vec![0.0, 0.0], 0).expect("valid"),
            Sequence::univariate(vec![0.1, 0.0], 0).expect("valid"),
            Sequence::univariate(vec![5.0, 5.0], 1).expect("valid"),
            Sequence::univariate(vec![5.1, 5.0], 1).expect("valid"),
        ])
        .expect("valid dataset")
    }

    #[test]
    fn engine_behind_trait_object_trains_and_predicts() {
        let data = tiny();
        let engine = LoocvEngine::new(Euclidean, KnnConfig::default()).expect("valid config");
        let mut member: Box<dyn Constituent<'_> + '_> = Box::new(engine);
        member.bind(&data).expect("bind");
        assert_eq!(member.phase(), EnginePhase::Paused);
        assert_eq!(member.run().expect("run"), EnginePhase::Complete);
        let result = member.train_result().expect("result");
        assert!(!result.provisional);
        assert_eq!(result.accuracy, 1.0);

        let query = Sequence::univariate(vec![4.9, 5.2], 1).expect("valid");
        let prediction = member.predict_with_k(&query, 1).expect("predict");
        assert_eq!(prediction.predicted_label, 1);
    }

    #[test]
    fn train_time_keeps_other_budget_limits() {
        let config = KnnConfig {
            budget: Budget {
                neighbour_limit: Some(3),
                ..Budget::default()
            },
            ..KnnConfig::default()
        };
        let mut engine = LoocvEngine::new(Euclidean, config).expect("valid config");
        Constituent::set_train_time_ms(&mut engine, Some(10_000)).expect("budget");
        assert_eq!(engine.config().budget.neighbour_limit, Some(3));
        assert_eq!(engine.config().budget.train_time_ms, Some(10_000));
        let err = Constituent::set_train_time_ms(&mut engine, Some(0)).expect_err("zero budget");
        assert!(err.to_string().contains("train_time_ms"));
    }
}
