// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::config::EnsembleConfig;
use crate::constituent::Constituent;
use crate::store::{load_train_result, save_train_result, validate_constituent_name};
use enn_core::{
    Dataset, EnnError, InstancePrediction, LoocvResult, Sequence, arg_max, normalize_distribution,
};
use enn_search::EnginePhase;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Name recorded as the measure of [`ElasticEnsemble::train_estimate`].
pub const ENSEMBLE_MEASURE_NAME: &str = "elastic_ensemble";

/// Where a constituent's train result came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultSource {
    /// Built by the constituent's engine during [`ElasticEnsemble::train`].
    Built,
    /// Read from `<results_dir>/<name>.json`.
    Loaded,
}

/// Vote cast by one constituent for a live query.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstituentVote {
    pub name: String,
    pub predicted_label: usize,
    pub weight: f64,
    pub provisional: bool,
}

/// Ensemble classification of one live query.
#[derive(Clone, Debug, PartialEq)]
pub struct EnsemblePrediction {
    pub predicted_label: usize,
    /// Accuracy-weighted votes normalised onto the simplex.
    pub distribution: Vec<f64>,
    pub votes: Vec<ConstituentVote>,
    /// True when any constituent's query search was cut short.
    pub provisional: bool,
    pub eval_time_ns: u64,
}

/// Outcome of [`ElasticEnsemble::train`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainSummary {
    pub rounds: usize,
    pub built: usize,
    pub loaded: usize,
    /// Constituents left with a provisional result by the train budget.
    pub provisional: Vec<String>,
    pub train_time_ns: u64,
}

struct Member<'a> {
    name: String,
    constituent: Box<dyn Constituent<'a> + 'a>,
    result: Option<LoocvResult>,
    source: Option<ResultSource>,
}

/// Accuracy-weighted ensemble of LOOCV nearest-neighbour constituents.
///
/// Each constituent is trained to completion (or until its share of the
/// train budget runs out) and weighted by its leave-one-out accuracy. A live
/// query is classified by every constituent; each casts its predicted class
/// with its weight and the heaviest class wins, ties broken by a seeded RNG.
pub struct ElasticEnsemble<'a> {
    config: EnsembleConfig,
    members: Vec<Member<'a>>,
    data: Option<&'a Dataset>,
    train_time_ns: u64,
}

fn elapsed_ns(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

fn ceil_ms(ns: u64) -> u64 {
    ns.div_ceil(1_000_000)
}

impl<'a> ElasticEnsemble<'a> {
    pub fn new(config: EnsembleConfig) -> Result<Self, EnnError> {
        config.validate()?;
        Ok(Self {
            config,
            members: Vec::new(),
            data: None,
            train_time_ns: 0,
        })
    }

    /// Registers a constituent under `name`, which also names its stored result.
    pub fn add_constituent(
        &mut self,
        name: impl Into<String>,
        constituent: Box<dyn Constituent<'a> + 'a>,
    ) -> Result<(), EnnError> {
        let name = name.into();
        validate_constituent_name(&name)?;
        if self.members.iter().any(|member| member.name == name) {
            return Err(EnnError::invalid_input(format!(
                "constituent '{name}' is already registered"
            )));
        }
        if self.data.is_some() {
            return Err(EnnError::invalid_state(
                "constituents cannot be added after training started",
            ));
        }
        self.members.push(Member {
            name,
            constituent,
            result: None,
            source: None,
        });
        Ok(())
    }

    pub fn with_constituent(
        mut self,
        name: impl Into<String>,
        constituent: Box<dyn Constituent<'a> + 'a>,
    ) -> Result<Self, EnnError> {
        self.add_constituent(name, constituent)?;
        Ok(self)
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.members.iter().map(|member| member.name.as_str()).collect()
    }

    pub fn is_trained(&self) -> bool {
        !self.members.is_empty() && self.members.iter().all(|member| member.result.is_some())
    }

    /// Train result of the named constituent, once trained.
    pub fn constituent_result(&self, name: &str) -> Option<&LoocvResult> {
        self.members
            .iter()
            .find(|member| member.name == name)?
            .result
            .as_ref()
    }

    pub fn result_source(&self, name: &str) -> Option<ResultSource> {
        self.members.iter().find(|member| member.name == name)?.source
    }

    /// `(name, weight)` per constituent; the weight is its LOOCV accuracy.
    pub fn weights(&self) -> Vec<(&str, f64)> {
        self.members
            .iter()
            .filter_map(|member| {
                member
                    .result
                    .as_ref()
                    .map(|result| (member.name.as_str(), result.accuracy))
            })
            .collect()
    }

    /// Trains every constituent on `data`.
    ///
    /// Stored results are reused when `load_results` is set and the stored
    /// file matches `data`; unusable files are logged and the constituent is
    /// built instead. With a train budget, building proceeds in rounds and
    /// every unfinished constituent receives `remaining / unfinished` of the
    /// remaining time per round.
    pub fn train(&mut self, data: &'a Dataset) -> Result<TrainSummary, EnnError> {
        if self.members.is_empty() {
            return Err(EnnError::invalid_input(
                "ElasticEnsemble.train requires at least one constituent",
            ));
        }
        let started = Instant::now();
        self.data = Some(data);
        let mut summary = TrainSummary::default();

        for member in &mut self.members {
            member.result = None;
            member.source = None;
            member.constituent.bind(data)?;
            if self.config.load_results
                && let Some(dir) = &self.config.results_dir
            {
                match load_train_result(dir, &member.name, data) {
                    Ok(result) => {
                        info!(
                            constituent = %member.name,
                            accuracy = result.accuracy,
                            "loaded stored train result"
                        );
                        member.result = Some(result);
                        member.source = Some(ResultSource::Loaded);
                        summary.loaded += 1;
                    }
                    Err(err) => {
                        warn!(
                            constituent = %member.name,
                            error = %err,
                            "stored train result unusable; building constituent"
                        );
                    }
                }
            }
        }

        let budget = self.config.train_time_ms.map(Duration::from_millis);
        loop {
            let unfinished: Vec<usize> = self
                .members
                .iter()
                .enumerate()
                .filter(|(_, member)| {
                    member.result.is_none() && member.constituent.phase() != EnginePhase::Complete
                })
                .map(|(index, _)| index)
                .collect();
            if unfinished.is_empty() {
                break;
            }
            let share_ms = match budget {
                Some(budget) => {
                    let remaining = budget.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        debug!(unfinished = unfinished.len(), "ensemble train budget spent");
                        break;
                    }
                    let share = remaining / u32::try_from(unfinished.len()).unwrap_or(u32::MAX);
                    Some((share.as_millis() as u64).max(1))
                }
                None => None,
            };
            summary.rounds += 1;
            let mut progressed = false;
            for &index in &unfinished {
                let member = &mut self.members[index];
                let before = member.constituent.neighbourhood_size();
                let allowance = share_ms
                    .map(|share| ceil_ms(member.constituent.spent_time_ns()).saturating_add(share));
                if allowance.is_some() {
                    member.constituent.set_train_time_ms(allowance)?;
                }
                let phase = member.constituent.run()?;
                debug!(
                    constituent = %member.name,
                    round = summary.rounds,
                    ?phase,
                    allowance_ms = ?allowance,
                    "constituent round finished"
                );
                progressed |= phase == EnginePhase::Complete
                    || member.constituent.neighbourhood_size() > before;
            }
            if !progressed {
                debug!(
                    round = summary.rounds,
                    "no constituent made progress; ending training rounds"
                );
                break;
            }
        }

        for member in &mut self.members {
            if member.result.is_some() {
                continue;
            }
            let result = member.constituent.train_result()?;
            if result.provisional {
                warn!(
                    constituent = %member.name,
                    neighbourhood_size = result.neighbourhood_size,
                    max_neighbourhood_size = result.max_neighbourhood_size,
                    "constituent did not complete; using provisional train result"
                );
                summary.provisional.push(member.name.clone());
            }
            if self.config.save_results
                && let Some(dir) = &self.config.results_dir
            {
                let path = save_train_result(dir, &member.name, data, &result)?;
                debug!(constituent = %member.name, path = %path.display(), "saved train result");
            }
            member.result = Some(result);
            member.source = Some(ResultSource::Built);
            summary.built += 1;
        }

        self.train_time_ns = elapsed_ns(started);
        summary.train_time_ns = self.train_time_ns;
        info!(
            constituents = self.members.len(),
            built = summary.built,
            loaded = summary.loaded,
            rounds = summary.rounds,
            provisional = summary.provisional.len(),
            "ensemble trained"
        );
        Ok(summary)
    }

    fn trained_data(&self, operation: &str) -> Result<&'a Dataset, EnnError> {
        match self.data {
            Some(data) if self.is_trained() => Ok(data),
            _ => Err(EnnError::invalid_state(format!(
                "ElasticEnsemble.{operation} requires a trained ensemble; call train first"
            ))),
        }
    }

    fn tie_break_rng(&self) -> Option<ChaCha8Rng> {
        self.config
            .random_tie_break
            .then(|| ChaCha8Rng::seed_from_u64(self.config.seed))
    }

    /// Classifies one sequence that is not part of the training data.
    pub fn predict(&self, query: &Sequence) -> Result<EnsemblePrediction, EnnError> {
        let data = self.trained_data("predict")?;
        let started = Instant::now();
        let mut scores = vec![0.0; data.n_classes()];
        let mut votes = Vec::with_capacity(self.members.len());
        let mut provisional = false;
        for member in &self.members {
            let Some(result) = &member.result else {
                continue;
            };
            let prediction = member.constituent.predict_with_k(query, result.k)?;
            let weight = result.accuracy;
            if let Some(score) = scores.get_mut(prediction.predicted_label) {
                *score += weight;
            }
            provisional |= prediction.provisional;
            votes.push(ConstituentVote {
                name: member.name.clone(),
                predicted_label: prediction.predicted_label,
                weight,
                provisional: prediction.provisional,
            });
        }
        normalize_distribution(&mut scores)?;
        let mut rng = self.tie_break_rng();
        let predicted_label = arg_max(&scores, rng.as_mut()).unwrap_or(0);
        Ok(EnsemblePrediction {
            predicted_label,
            distribution: scores,
            votes,
            provisional,
            eval_time_ns: elapsed_ns(started),
        })
    }

    /// Classifies several queries; a failing query does not affect the others.
    pub fn predict_all(&self, queries: &[Sequence]) -> Vec<Result<EnsemblePrediction, EnnError>> {
        queries.iter().map(|query| self.predict(query)).collect()
    }

    /// Leave-one-out estimate of the ensemble itself.
    ///
    /// Combines the constituents' stored LOOCV predictions per training
    /// instance with the same weighted vote used by [`Self::predict`]. The
    /// result is provisional when any constituent result is.
    pub fn train_estimate(&self) -> Result<LoocvResult, EnnError> {
        let data = self.trained_data("train_estimate")?;
        let results: Vec<&LoocvResult> = self
            .members
            .iter()
            .filter_map(|member| member.result.as_ref())
            .collect();
        let mut rng = self.tie_break_rng();
        let mut predictions = Vec::with_capacity(data.len());
        for index in 0..data.len() {
            let mut scores = vec![0.0; data.n_classes()];
            let mut eval_time_ns = 0u64;
            for result in &results {
                let Some(prediction) = result.predictions.get(index) else {
                    return Err(EnnError::invalid_state(format!(
                        "constituent result for '{}' has no prediction for instance {index}",
                        result.measure
                    )));
                };
                if let Some(score) = scores.get_mut(prediction.predicted_label) {
                    *score += result.accuracy;
                }
                eval_time_ns = eval_time_ns.saturating_add(prediction.eval_time_ns);
            }
            normalize_distribution(&mut scores)?;
            let predicted_label = arg_max(&scores, rng.as_mut()).unwrap_or(0);
            predictions.push(InstancePrediction {
                index,
                true_label: data.label(index),
                predicted_label,
                distribution: scores,
                eval_time_ns,
            });
        }
        let provisional = results.iter().any(|result| result.provisional);
        let estimate_time_ns = results
            .iter()
            .fold(0u64, |total, result| total.saturating_add(result.estimate_time_ns));
        Ok(LoocvResult::new(ENSEMBLE_MEASURE_NAME, 1, predictions, provisional)?
            .with_timings(self.train_time_ns, estimate_time_ns))
    }
}

#[cfg(test)]
mod tests {
    use super::ElasticEnsemble;
    use crate::config::EnsembleConfig;
    use enn_core::{Dataset, Sequence};
    use enn_measures::Euclidean;
    use enn_search::{KnnConfig, LoocvEngine};

    fn data() -> Dataset {
        Dataset::from_sequences(vec![
            Sequence::univariate(vec![0.0, 0.0], 0).expect("valid"),
            Sequence::univariate(vec![0.2, 0.0], 0).expect("valid"),
            Sequence::univariate(vec![4.0, 4.0], 1).expect("valid"),
            Sequence::univariate(vec![4.2, 4.0], 1).expect("valid"),
        ])
        .expect("valid dataset")
    }

    #[test]
    fn empty_ensemble_cannot_train() {
        let data = data();
        let mut ensemble = ElasticEnsemble::new(EnsembleConfig::default()).expect("config");
        let err = ensemble.train(&data).expect_err("no constituents");
        assert!(err.to_string().contains("at least one constituent"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut ensemble = ElasticEnsemble::new(EnsembleConfig::default()).expect("config");
        let engine = || {
            Box::new(LoocvEngine::new(Euclidean, KnnConfig::default()).expect("valid config"))
        };
        ensemble.add_constituent("ed", engine()).expect("first");
        let err = ensemble
            .add_constituent("ed", engine())
            .expect_err("duplicate");
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn predict_before_train_is_invalid_state() {
        let ensemble = ElasticEnsemble::new(EnsembleConfig::default()).expect("config");
        let query = Sequence::univariate(vec![0.0, 0.0], 0).expect("valid");
        let err = ensemble.predict(&query).expect_err("untrained");
        assert!(err.to_string().contains("requires a trained ensemble"));
        assert!(ensemble.train_estimate().is_err());
    }

    #[test]
    fn single_constituent_matches_its_engine() {
        let data = data();
        let mut ensemble = ElasticEnsemble::new(EnsembleConfig::default())
            .expect("config")
            .with_constituent(
                "ed",
                Box::new(LoocvEngine::new(Euclidean, KnnConfig::default()).expect("valid config")),
            )
            .expect("constituent");
        let summary = ensemble.train(&data).expect("train");
        assert_eq!(summary.built, 1);
        assert!(summary.provisional.is_empty());
        assert_eq!(ensemble.weights(), vec![("ed", 1.0)]);

        let estimate = ensemble.train_estimate().expect("estimate");
        assert_eq!(estimate.accuracy, 1.0);
        assert_eq!(estimate.predicted_labels(), vec![0, 0, 1, 1]);

        let query = Sequence::univariate(vec![3.9, 4.1], 1).expect("valid");
        let prediction = ensemble.predict(&query).expect("predict");
        assert_eq!(prediction.predicted_label, 1);
        assert_eq!(prediction.distribution, vec![0.0, 1.0]);
        assert_eq!(prediction.votes.len(), 1);
    }
}
