// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use crate::cache::PairwiseDistanceCache;
use crate::checkpoint::{
    CacheSnapshot, CachedPair, EngineSnapshot, NeighbourSnapshot, PayloadCodec, SearchSnapshot,
    SnapshotPhase, build_envelope, check_envelope_identity, decode_snapshot,
    encode_checkpoint_envelope, finite_or_none, none_as_infinity, read_checkpoint_file,
    write_checkpoint_file,
};
use crate::config::{KnnConfig, SymmetryStrategy};
use crate::frontier::{Frontier, Neighbour};
use crate::iteration::{IterationStrategy, WorkQueue};
use crate::search::{AddOutcome, EvalPolicy, NeighbourSearch, Probe};
use enn_core::{
    Budget, BudgetStatus, BuildDiagnostics, BuildProgress, CURRENT_SCHEMA_VERSION, Dataset,
    EnnError, InstancePrediction, LoocvResult, NoopProgressSink, NoopTelemetrySink, ProgressSink,
    QueryPrediction, Sequence, StopReason, TelemetrySink, TickEstimate, arg_max,
    prediction_accuracy, validate_budget, validate_schema_version,
};
use enn_measures::{DistanceMeasure, StatsCache};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`LoocvEngine`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnginePhase {
    /// No training data bound.
    Uninitialized,
    /// Inside [`LoocvEngine::run`].
    Building,
    /// Bound and resumable; results are provisional.
    Paused,
    /// Every search exhausted; results are final.
    Complete,
}

/// How [`LoocvEngine::bind`] obtained its build state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindOutcome {
    Fresh,
    Resumed,
    /// A configured checkpoint existed but was unusable; a fresh build started.
    CheckpointRejected,
}

struct BuildState<'a, S> {
    data: &'a Dataset,
    stats: StatsCache<S>,
    searches: Vec<NeighbourSearch>,
    queue: WorkQueue,
    cache: Option<PairwiseDistanceCache>,
    rng: ChaCha8Rng,
    neighbourhood_size: usize,
    max_neighbourhood_size: usize,
    diagnostics: BuildDiagnostics,
    tick_estimate: TickEstimate,
    build_time_ns: u64,
    estimate_time_ns: u64,
    run_time_ns: u64,
    selected_k: Option<usize>,
}

/// Progressive leave-one-out nearest-neighbour evaluator.
///
/// Every training instance owns a [`NeighbourSearch`] over all other
/// instances. Each tick examines one (left-out, candidate) pair; for a
/// symmetric measure the computed distance is also handed to the mirrored
/// search so no pair is computed twice. The build can stop at any tick
/// boundary under a [`enn_core::Budget`] and be resumed, in process or from
/// a checkpoint, without changing the final frontiers.
pub struct LoocvEngine<'a, M: DistanceMeasure> {
    measure: M,
    config: KnnConfig,
    phase: EnginePhase,
    state: Option<BuildState<'a, M::Stats>>,
    progress: Arc<dyn ProgressSink>,
    telemetry: Arc<dyn TelemetrySink>,
}

fn elapsed_ns(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

fn checked_counter_increment(counter: &mut usize, name: &str) -> Result<(), EnnError> {
    *counter = counter
        .checked_add(1)
        .ok_or_else(|| EnnError::resource_limit(format!("{name} counter overflow")))?;
    Ok(())
}

fn max_neighbourhood(n: usize) -> Result<usize, EnnError> {
    n.checked_mul(n.saturating_sub(1)).ok_or_else(|| {
        EnnError::resource_limit(format!("max_neighbourhood_size overflows for n={n}"))
    })
}

fn tie_break_rng(config: &KnnConfig) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(config.seed)
}

fn pick_label(distribution: &[f64], random_tie_break: bool, rng: &mut ChaCha8Rng) -> usize {
    let rng = if random_tie_break { Some(rng) } else { None };
    arg_max(distribution, rng).unwrap_or(0)
}

fn progress_fraction<S>(state: &BuildState<'_, S>) -> f32 {
    if state.max_neighbourhood_size == 0 {
        1.0
    } else {
        (state.neighbourhood_size as f64 / state.max_neighbourhood_size as f64) as f32
    }
}

/// Examines one `(search, candidate)` pair and propagates the value to the
/// mirrored search when the measure allows it.
fn examine_pair<M: DistanceMeasure>(
    measure: &M,
    config: &KnnConfig,
    state: &mut BuildState<'_, M::Stats>,
    search: usize,
    candidate: usize,
) -> Result<(), EnnError> {
    let data = state.data;
    let candidate_label = data.label(candidate);
    checked_counter_increment(&mut state.neighbourhood_size, "neighbourhood_size")?;

    if let Some(cache) = state.cache.as_mut()
        && let Some(distance) = cache.consume(search, candidate)
    {
        state.searches[search].add_precomputed(candidate, candidate_label, distance)?;
        checked_counter_increment(&mut state.diagnostics.cache_hits, "cache_hits")?;
        return Ok(());
    }

    let mirror_open = measure.is_symmetric() && !state.searches[candidate].has_seen(search);
    let shared_cutoff = if mirror_open {
        state.searches[candidate].limit()
    } else {
        f64::NEG_INFINITY
    };
    let probe = Probe {
        measure,
        query: &data.sequences()[search],
        query_stats: state.stats.get(search),
        candidate: &data.sequences()[candidate],
        candidate_stats: state.stats.get(candidate),
    };
    let policy = EvalPolicy {
        early_abandon: config.early_abandon,
        lower_bound_pruning: config.lower_bound_pruning,
        shared_cutoff,
    };

    match state.searches[search].add(candidate, candidate_label, &probe, policy)? {
        AddOutcome::Pruned { .. } => {
            checked_counter_increment(
                &mut state.diagnostics.lower_bound_prunes,
                "lower_bound_prunes",
            )?;
        }
        AddOutcome::Evaluated {
            distance,
            abandoned,
            ..
        } => {
            checked_counter_increment(
                &mut state.diagnostics.distance_evaluations,
                "distance_evaluations",
            )?;
            if abandoned {
                checked_counter_increment(&mut state.diagnostics.early_abandons, "early_abandons")?;
            }
            if mirror_open {
                match (config.symmetry, state.cache.as_mut()) {
                    (SymmetryStrategy::Cache, Some(cache)) => cache.put(search, candidate, distance),
                    _ => {
                        state.searches[candidate].add_precomputed(
                            search,
                            data.label(search),
                            distance,
                        )?;
                        checked_counter_increment(
                            &mut state.neighbourhood_size,
                            "neighbourhood_size",
                        )?;
                        checked_counter_increment(
                            &mut state.diagnostics.mirrored_adds,
                            "mirrored_adds",
                        )?;
                        state.queue.reactivate(candidate);
                    }
                }
            }
        }
        AddOutcome::AlreadyExamined { .. } => {
            return Err(EnnError::invalid_state(format!(
                "search {search} was offered examined candidate {candidate}"
            )));
        }
    }
    Ok(())
}

/// Runs one tick. Returns `Ok(false)` when no pair is left to examine.
fn tick_state<M: DistanceMeasure>(
    measure: &M,
    config: &KnnConfig,
    state: &mut BuildState<'_, M::Stats>,
) -> Result<bool, EnnError> {
    let started = Instant::now();
    let early_predict = config.early_predict;
    loop {
        let next = {
            let searches = &state.searches;
            state.queue.next_pair(&mut state.rng, |search| {
                if early_predict {
                    searches[search].homogeneous_label()
                } else {
                    None
                }
            })
        };
        let Some((search, candidate)) = next else {
            return Ok(false);
        };
        if state.searches[search].has_seen(candidate) {
            continue;
        }
        examine_pair(measure, config, state, search, candidate)?;
        break;
    }
    checked_counter_increment(&mut state.diagnostics.ticks, "ticks")?;
    let tick_time = started.elapsed();
    state.tick_estimate.record(tick_time);
    state.estimate_time_ns = state
        .estimate_time_ns
        .saturating_add(u64::try_from(tick_time.as_nanos()).unwrap_or(u64::MAX));
    Ok(true)
}

fn collect_predictions(
    config: &KnnConfig,
    searches: &mut [NeighbourSearch],
    data: &Dataset,
    k: usize,
) -> Result<Vec<InstancePrediction>, EnnError> {
    let mut rng = tie_break_rng(config);
    searches
        .iter_mut()
        .enumerate()
        .map(|(index, search)| {
            let started = Instant::now();
            let distribution = if k >= search.frontier().k() {
                search.predict()?.to_vec()
            } else {
                search.predict_with_k(k)?
            };
            let predicted_label = pick_label(&distribution, config.random_tie_break, &mut rng);
            Ok(InstancePrediction {
                index,
                true_label: data.label(index),
                predicted_label,
                distribution,
                eval_time_ns: search.eval_time_ns().saturating_add(elapsed_ns(started)),
            })
        })
        .collect()
}

/// Largest-accuracy `k' <= k`; ties go to the smaller `k'`.
fn select_k<S>(config: &KnnConfig, state: &mut BuildState<'_, S>) -> Result<usize, EnnError> {
    if !config.auto_k || config.k == 1 {
        return Ok(config.k);
    }
    let mut best_k = config.k;
    let mut best_accuracy = f64::NEG_INFINITY;
    for k in (1..=config.k).rev() {
        let predictions = collect_predictions(config, &mut state.searches, state.data, k)?;
        let accuracy = prediction_accuracy(&predictions);
        debug!(k, accuracy, "auto-k candidate");
        if accuracy >= best_accuracy {
            best_accuracy = accuracy;
            best_k = k;
        }
    }
    Ok(best_k)
}

fn finish_build<S>(config: &KnnConfig, state: &mut BuildState<'_, S>) -> Result<(), EnnError> {
    if state.neighbourhood_size > state.max_neighbourhood_size
        || (!config.early_predict && state.neighbourhood_size != state.max_neighbourhood_size)
    {
        return Err(EnnError::invalid_state(format!(
            "work queue drained with neighbourhood_size={} and max_neighbourhood_size={}",
            state.neighbourhood_size, state.max_neighbourhood_size
        )));
    }
    if state.neighbourhood_size < state.max_neighbourhood_size {
        state.diagnostics.notes.push(format!(
            "early predict skipped {} of {} neighbour pairs",
            state.max_neighbourhood_size - state.neighbourhood_size,
            state.max_neighbourhood_size
        ));
    }
    let selected = select_k(config, state)?;
    if config.auto_k {
        state
            .diagnostics
            .notes
            .push(format!("auto-k selected k={selected} of {}", config.k));
    }
    state.selected_k = Some(selected);
    state.diagnostics.stop_reason = None;
    Ok(())
}

fn snapshot_state<S>(k: usize, phase: SnapshotPhase, state: &BuildState<'_, S>) -> EngineSnapshot {
    EngineSnapshot {
        schema_version: CURRENT_SCHEMA_VERSION,
        k,
        n: state.data.len(),
        n_classes: state.data.n_classes(),
        phase,
        searches: state
            .searches
            .iter()
            .map(|search| SearchSnapshot {
                neighbours: search
                    .frontier()
                    .entries()
                    .iter()
                    .map(|neighbour| NeighbourSnapshot {
                        index: neighbour.index,
                        label: neighbour.label,
                        distance: finite_or_none(neighbour.distance),
                    })
                    .collect(),
                seen: search.seen().clone(),
                eval_time_ns: search.eval_time_ns(),
            })
            .collect(),
        queue: state.queue.clone(),
        cache: state.cache.as_ref().map(|cache| CacheSnapshot {
            policy: cache.policy(),
            entries: cache
                .entries()
                .into_iter()
                .map(|(a, b, distance)| CachedPair {
                    a,
                    b,
                    distance: finite_or_none(distance),
                })
                .collect(),
        }),
        rng: state.rng.clone(),
        neighbourhood_size: state.neighbourhood_size,
        max_neighbourhood_size: state.max_neighbourhood_size,
        diagnostics: state.diagnostics.clone(),
        tick_estimate: state.tick_estimate.clone(),
        build_time_ns: state.build_time_ns,
        estimate_time_ns: state.estimate_time_ns,
        run_time_ns: state.run_time_ns,
        selected_k: state.selected_k,
    }
}

fn write_state_checkpoint<S>(
    measure: &str,
    k: usize,
    phase: SnapshotPhase,
    state: &BuildState<'_, S>,
    path: &Path,
    codec: PayloadCodec,
) -> Result<usize, EnnError> {
    let snapshot = snapshot_state(k, phase, state);
    let envelope = build_envelope(&snapshot, measure, state.data.fingerprint(), codec)?;
    let bytes = encode_checkpoint_envelope(&envelope)?;
    write_checkpoint_file(path, &bytes)?;
    Ok(bytes.len())
}

/// Wall-clock time of the current `run`/`tick` call on top of earlier ones.
#[derive(Clone, Copy, Debug)]
struct RunClock {
    carried_ns: u64,
    started: Instant,
}

impl RunClock {
    fn start(carried_ns: u64) -> Self {
        Self {
            carried_ns,
            started: Instant::now(),
        }
    }

    fn total(&self) -> Duration {
        Duration::from_nanos(self.carried_ns).saturating_add(self.started.elapsed())
    }

    fn total_ns(&self) -> u64 {
        self.carried_ns.saturating_add(elapsed_ns(self.started))
    }
}

/// True when no queued pair can still be examined.
///
/// Entries already covered by a mirrored add and candidates of a class that
/// early predict defers do not count as work.
fn work_exhausted<S>(config: &KnnConfig, state: &BuildState<'_, S>) -> bool {
    if state.neighbourhood_size >= state.max_neighbourhood_size {
        return true;
    }
    let searches = &state.searches;
    !state.queue.has_pending(
        |search| {
            if config.early_predict {
                searches[search].homogeneous_label()
            } else {
                None
            }
        },
        |search, candidate| searches[search].has_seen(candidate),
    )
}

/// Ticks until the queue drains or the budget stops the build.
///
/// Returns `Ok(true)` when no work is left, including when the budget runs
/// out exactly as the last pair is examined.
fn drive<M: DistanceMeasure>(
    measure: &M,
    config: &KnnConfig,
    progress: &dyn ProgressSink,
    state: &mut BuildState<'_, M::Stats>,
    clock: RunClock,
) -> Result<bool, EnnError> {
    let progress_every = config.normalized_progress_every();
    let mut last_checkpoint = Instant::now();
    let mut ticks_this_run = 0usize;
    state.diagnostics.stop_reason = None;

    loop {
        let status = config.budget.check_train(
            BuildProgress {
                ticks: state.diagnostics.ticks,
                neighbourhood_size: state.neighbourhood_size,
                max_neighbourhood_size: state.max_neighbourhood_size,
                elapsed: clock.total(),
            },
            &state.tick_estimate,
        );
        if let BudgetStatus::Exhausted(reason) = status {
            if work_exhausted(config, state) {
                debug!(?reason, "budget reached with no work left");
                progress.on_progress(1.0);
                return Ok(true);
            }
            debug!(?reason, ticks = state.diagnostics.ticks, "build budget exhausted");
            state.diagnostics.stop_reason = Some(reason);
            return Ok(false);
        }

        if !tick_state(measure, config, state)? {
            progress.on_progress(1.0);
            return Ok(true);
        }

        ticks_this_run += 1;
        if ticks_this_run.is_multiple_of(progress_every) {
            let fraction = progress_fraction(state);
            progress.on_progress(fraction);
            debug!(
                ticks = state.diagnostics.ticks,
                neighbourhood_size = state.neighbourhood_size,
                fraction,
                "build progress"
            );
        }

        if let Some(checkpoint) = &config.checkpoint
            && last_checkpoint.elapsed() >= Duration::from_millis(checkpoint.interval_ms)
        {
            state.run_time_ns = clock.total_ns();
            match write_state_checkpoint(
                measure.name(),
                config.k,
                SnapshotPhase::Paused,
                state,
                &checkpoint.path,
                checkpoint.codec,
            ) {
                Ok(bytes) => debug!(path = %checkpoint.path.display(), bytes, "interval checkpoint written"),
                Err(err) => warn!(path = %checkpoint.path.display(), error = %err, "interval checkpoint failed"),
            }
            last_checkpoint = Instant::now();
        }
    }
}

fn restore_search(
    target: usize,
    k: usize,
    data: &Dataset,
    snapshot: SearchSnapshot,
) -> Result<NeighbourSearch, EnnError> {
    let n = data.len();
    let seen = snapshot.seen;
    if seen.capacity() != n || !seen.is_consistent() {
        return Err(EnnError::checkpoint(format!(
            "search {target} seen set is inconsistent with n={n}"
        )));
    }
    if seen.contains(target) {
        return Err(EnnError::checkpoint(format!(
            "search {target} lists itself as examined"
        )));
    }
    let mut neighbours = Vec::with_capacity(snapshot.neighbours.len());
    for entry in &snapshot.neighbours {
        let distance = none_as_infinity(entry.distance);
        if entry.index >= n
            || entry.index == target
            || entry.label != data.label(entry.index)
            || !seen.contains(entry.index)
            || distance.is_nan()
            || distance < 0.0
        {
            return Err(EnnError::checkpoint(format!(
                "search {target} holds an invalid neighbour (index={}, label={})",
                entry.index, entry.label
            )));
        }
        neighbours.push(Neighbour {
            distance,
            index: entry.index,
            label: entry.label,
        });
    }
    let frontier = Frontier::from_entries(k, neighbours);
    if frontier.len() != snapshot.neighbours.len() {
        return Err(EnnError::checkpoint(format!(
            "search {target} frontier holds {} neighbours; only {} survive k={k}",
            snapshot.neighbours.len(),
            frontier.len()
        )));
    }
    Ok(NeighbourSearch::from_parts(
        Some(target),
        frontier,
        seen,
        data.n_classes(),
        snapshot.eval_time_ns,
    ))
}

impl<'a, M: DistanceMeasure> LoocvEngine<'a, M> {
    pub fn new(measure: M, config: KnnConfig) -> Result<Self, EnnError> {
        config.validate()?;
        if config.symmetry == SymmetryStrategy::Cache {
            PairwiseDistanceCache::for_measure(&measure, config.cache_policy)?;
        }
        Ok(Self {
            measure,
            config,
            phase: EnginePhase::Uninitialized,
            state: None,
            progress: Arc::new(NoopProgressSink),
            telemetry: Arc::new(NoopTelemetrySink),
        })
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn with_telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn measure(&self) -> &M {
        &self.measure
    }

    pub fn config(&self) -> &KnnConfig {
        &self.config
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn dataset(&self) -> Option<&'a Dataset> {
        self.state.as_ref().map(|state| state.data)
    }

    pub fn search(&self, index: usize) -> Option<&NeighbourSearch> {
        self.state.as_ref()?.searches.get(index)
    }

    pub fn frontier(&self, index: usize) -> Option<&Frontier> {
        self.search(index).map(NeighbourSearch::frontier)
    }

    /// Examined (search, candidate) pairs so far.
    pub fn neighbourhood_size(&self) -> usize {
        self.state.as_ref().map_or(0, |state| state.neighbourhood_size)
    }

    pub fn max_neighbourhood_size(&self) -> usize {
        self.state
            .as_ref()
            .map_or(0, |state| state.max_neighbourhood_size)
    }

    pub fn diagnostics(&self) -> Option<&BuildDiagnostics> {
        self.state.as_ref().map(|state| &state.diagnostics)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.state.as_ref()?.diagnostics.stop_reason
    }

    /// `k` chosen by auto-k, or the configured `k`, once complete.
    pub fn selected_k(&self) -> Option<usize> {
        self.state.as_ref()?.selected_k
    }

    /// Replaces the budget for later runs. Tick and time counters carry over.
    pub fn set_budget(&mut self, budget: Budget) -> Result<(), EnnError> {
        validate_budget(&budget)?;
        self.config.budget = budget;
        Ok(())
    }

    /// Tick time accumulated by this build, including resumed runs.
    pub fn estimate_time_ns(&self) -> u64 {
        self.state.as_ref().map_or(0, |state| state.estimate_time_ns)
    }

    /// Wall-clock time charged against `budget.train_time_ms` so far.
    pub fn run_time_ns(&self) -> u64 {
        self.state.as_ref().map_or(0, |state| state.run_time_ns)
    }

    pub fn cached_pairs(&self) -> usize {
        self.state
            .as_ref()
            .and_then(|state| state.cache.as_ref())
            .map_or(0, PairwiseDistanceCache::len)
    }

    /// Binds training data, resuming from the configured checkpoint when
    /// one exists and matches this measure and dataset.
    pub fn bind(&mut self, data: &'a Dataset) -> Result<BindOutcome, EnnError> {
        if data.is_empty() {
            return Err(EnnError::invalid_input(
                "LoocvEngine.bind requires at least one training sequence; got 0",
            ));
        }
        self.measure.validate(data)?;

        if let Some(checkpoint) = self.config.checkpoint.clone()
            && checkpoint.resume
            && checkpoint.path.exists()
        {
            match self.load_checkpoint(data, &checkpoint.path) {
                Ok(()) => {
                    info!(
                        path = %checkpoint.path.display(),
                        measure = self.measure.name(),
                        neighbourhood_size = self.neighbourhood_size(),
                        "resumed build from checkpoint"
                    );
                    return Ok(BindOutcome::Resumed);
                }
                Err(err) => {
                    warn!(
                        path = %checkpoint.path.display(),
                        error = %err,
                        "checkpoint rejected; starting a fresh build"
                    );
                    self.bind_fresh(data)?;
                    if let Some(state) = self.state.as_mut() {
                        state.diagnostics.notes.push(format!("checkpoint rejected: {err}"));
                    }
                    return Ok(BindOutcome::CheckpointRejected);
                }
            }
        }

        self.bind_fresh(data)?;
        Ok(BindOutcome::Fresh)
    }

    fn new_cache(&self) -> Result<Option<PairwiseDistanceCache>, EnnError> {
        if self.config.symmetry == SymmetryStrategy::Cache && self.measure.is_symmetric() {
            PairwiseDistanceCache::for_measure(&self.measure, self.config.cache_policy).map(Some)
        } else {
            Ok(None)
        }
    }

    fn bind_fresh(&mut self, data: &'a Dataset) -> Result<(), EnnError> {
        let started = Instant::now();
        let n = data.len();
        let n_classes = data.n_classes();
        let stats = StatsCache::build(&self.measure, data)?;
        let searches = (0..n)
            .map(|target| NeighbourSearch::for_train(target, self.config.k, n, n_classes))
            .collect();
        let state = BuildState {
            data,
            stats,
            searches,
            queue: WorkQueue::new(data, self.config.iteration),
            cache: self.new_cache()?,
            rng: ChaCha8Rng::seed_from_u64(self.config.seed),
            neighbourhood_size: 0,
            max_neighbourhood_size: max_neighbourhood(n)?,
            diagnostics: BuildDiagnostics::default(),
            tick_estimate: TickEstimate::new(),
            build_time_ns: elapsed_ns(started),
            estimate_time_ns: 0,
            run_time_ns: 0,
            selected_k: None,
        };
        info!(
            measure = self.measure.name(),
            n,
            n_classes,
            k = self.config.k,
            max_neighbourhood_size = state.max_neighbourhood_size,
            "bound training data"
        );
        self.state = Some(state);
        self.phase = EnginePhase::Paused;
        Ok(())
    }

    fn abort_build(&mut self, err: EnnError) -> EnnError {
        if err.is_fatal_to_build() {
            error!(error = %err, measure = self.measure.name(), "build aborted; state discarded");
            self.state = None;
            self.phase = EnginePhase::Uninitialized;
        } else {
            self.phase = EnginePhase::Paused;
        }
        err
    }

    fn completion_outcome(&mut self, drained: Result<bool, EnnError>) -> Result<EnginePhase, EnnError> {
        let Some(state) = self.state.as_mut() else {
            return Err(EnnError::invalid_state("build state vanished mid-run"));
        };
        let finished = match drained {
            Ok(true) => finish_build(&self.config, state).map(|()| EnginePhase::Complete),
            Ok(false) => Ok(EnginePhase::Paused),
            Err(err) => Err(err),
        };
        match finished {
            Ok(phase) => {
                self.phase = phase;
                if phase == EnginePhase::Complete {
                    info!(
                        measure = self.measure.name(),
                        ticks = state.diagnostics.ticks,
                        distance_evaluations = state.diagnostics.distance_evaluations,
                        selected_k = ?state.selected_k,
                        "build complete"
                    );
                }
                Ok(phase)
            }
            Err(err) => Err(self.abort_build(err)),
        }
    }

    /// Runs ticks until the queue drains or the budget is exhausted.
    ///
    /// `budget.train_time_ms` is checked against wall-clock time spent in
    /// `run` and `tick`, summed over every resume.
    pub fn run(&mut self) -> Result<EnginePhase, EnnError> {
        if self.phase == EnginePhase::Complete {
            return Ok(EnginePhase::Complete);
        }
        let Some(state) = self.state.as_mut() else {
            return Err(EnnError::invalid_state(
                "LoocvEngine.run requires bound training data; call bind first",
            ));
        };
        let clock = RunClock::start(state.run_time_ns);
        self.phase = EnginePhase::Building;
        let drained = drive(&self.measure, &self.config, self.progress.as_ref(), state, clock);
        let phase = self.completion_outcome(drained)?;
        self.checkpoint_after_run();
        self.emit_telemetry();
        self.record_run_time(clock);
        Ok(phase)
    }

    /// Runs exactly one tick, ignoring the budget.
    ///
    /// Returns `Ok(false)` once no pair is left; the engine is then complete.
    pub fn tick(&mut self) -> Result<bool, EnnError> {
        if self.phase == EnginePhase::Complete {
            return Ok(false);
        }
        let Some(state) = self.state.as_mut() else {
            return Err(EnnError::invalid_state(
                "LoocvEngine.tick requires bound training data; call bind first",
            ));
        };
        let clock = RunClock::start(state.run_time_ns);
        let ticked = tick_state(&self.measure, &self.config, state);
        let outcome = match ticked {
            Ok(true) => {
                self.phase = EnginePhase::Paused;
                Ok(true)
            }
            other => self
                .completion_outcome(other.map(|_| true))
                .map(|_| false),
        };
        self.record_run_time(clock);
        outcome
    }

    fn record_run_time(&mut self, clock: RunClock) {
        if let Some(state) = self.state.as_mut() {
            state.run_time_ns = clock.total_ns();
        }
    }

    fn checkpoint_after_run(&self) {
        let Some(checkpoint) = &self.config.checkpoint else {
            return;
        };
        if let Err(err) = self.save_checkpoint(&checkpoint.path, checkpoint.codec) {
            warn!(path = %checkpoint.path.display(), error = %err, "checkpoint after run failed");
        }
    }

    fn emit_telemetry(&self) {
        let Some(state) = &self.state else {
            return;
        };
        let diagnostics = &state.diagnostics;
        self.telemetry.record_scalar("ticks", diagnostics.ticks as f64);
        self.telemetry
            .record_scalar("distance_evaluations", diagnostics.distance_evaluations as f64);
        self.telemetry
            .record_scalar("lower_bound_prunes", diagnostics.lower_bound_prunes as f64);
        self.telemetry
            .record_scalar("early_abandons", diagnostics.early_abandons as f64);
        self.telemetry
            .record_scalar("mirrored_adds", diagnostics.mirrored_adds as f64);
        self.telemetry
            .record_scalar("cache_hits", diagnostics.cache_hits as f64);
        self.telemetry
            .record_scalar("neighbourhood_fraction", f64::from(progress_fraction(state)));
    }

    /// Current LOOCV predictions; `provisional` unless the build is complete.
    pub fn provisional_result(&mut self) -> Result<LoocvResult, EnnError> {
        let complete = self.phase == EnginePhase::Complete;
        let Some(state) = self.state.as_mut() else {
            return Err(EnnError::invalid_state(
                "LoocvEngine results require bound training data; call bind first",
            ));
        };
        let k = state.selected_k.unwrap_or(self.config.k);
        let predictions = collect_predictions(&self.config, &mut state.searches, state.data, k)?;
        Ok(LoocvResult::new(self.measure.name(), k, predictions, !complete)?
            .with_timings(state.build_time_ns, state.estimate_time_ns)
            .with_neighbourhood(state.neighbourhood_size, state.max_neighbourhood_size)
            .with_diagnostics(state.diagnostics.clone()))
    }

    /// Final LOOCV result. Fails unless the build is complete.
    pub fn finalize(&mut self) -> Result<LoocvResult, EnnError> {
        if self.phase != EnginePhase::Complete {
            return Err(EnnError::invalid_state(format!(
                "LoocvEngine.finalize requires a complete build; phase is {:?}",
                self.phase
            )));
        }
        self.provisional_result()
    }

    /// Classifies a sequence that is not part of the training data.
    ///
    /// Honours `budget.test_time_ms`; a query stopped by the budget returns
    /// a provisional prediction over the candidates examined so far.
    pub fn predict(&self, query: &Sequence) -> Result<QueryPrediction, EnnError> {
        let k = self
            .state
            .as_ref()
            .and_then(|state| state.selected_k)
            .unwrap_or(self.config.k);
        self.predict_with_k(query, k)
    }

    /// [`Self::predict`] with an explicit neighbour count.
    pub fn predict_with_k(&self, query: &Sequence, k: usize) -> Result<QueryPrediction, EnnError> {
        if k == 0 {
            return Err(EnnError::invalid_input("predict k must be >= 1; got 0"));
        }
        let Some(state) = &self.state else {
            return Err(EnnError::invalid_state(
                "LoocvEngine.predict requires bound training data; call bind first",
            ));
        };
        let started = Instant::now();
        let data = state.data;
        for candidate in data.iter() {
            self.measure.validate_pair(query, candidate)?;
        }
        let query_stats = self.measure.precompute(query)?;
        let n = data.len();
        let mut search = NeighbourSearch::for_query(k, n, data.n_classes());
        let mut rng = tie_break_rng(&self.config);
        let mut order: Vec<usize> = (0..n).collect();
        if self.config.iteration == IterationStrategy::Random {
            order.shuffle(&mut rng);
        }
        let policy = EvalPolicy {
            early_abandon: self.config.early_abandon,
            lower_bound_pruning: self.config.lower_bound_pruning,
            shared_cutoff: f64::NEG_INFINITY,
        };

        let mut estimate = TickEstimate::new();
        let mut deferred = Vec::new();
        let mut stopped = false;
        for pass in 0..2 {
            let candidates = if pass == 0 {
                std::mem::take(&mut order)
            } else {
                std::mem::take(&mut deferred)
            };
            for candidate in candidates {
                if let BudgetStatus::Exhausted(_) =
                    self.config.budget.check_test(started.elapsed(), &estimate)
                {
                    stopped = true;
                    break;
                }
                let label = data.label(candidate);
                if self.config.early_predict
                    && k == 1
                    && search.homogeneous_label() == Some(label)
                {
                    if pass == 0 {
                        deferred.push(candidate);
                    }
                    continue;
                }
                let tick = Instant::now();
                let probe = Probe {
                    measure: &self.measure,
                    query,
                    query_stats: &query_stats,
                    candidate: &data.sequences()[candidate],
                    candidate_stats: state.stats.get(candidate),
                };
                search.add(candidate, label, &probe, policy)?;
                estimate.record(tick.elapsed());
            }
            if stopped {
                break;
            }
        }

        let distribution = search.predict()?.to_vec();
        let predicted_label = pick_label(&distribution, self.config.random_tie_break, &mut rng);
        let neighbours = search
            .frontier()
            .entries()
            .iter()
            .map(|neighbour| (neighbour.index, neighbour.distance))
            .collect();
        Ok(QueryPrediction {
            predicted_label,
            distribution,
            neighbours,
            examined: search.examined(),
            provisional: stopped,
            eval_time_ns: elapsed_ns(started),
        })
    }

    /// Captures the bound build state.
    pub fn snapshot(&self) -> Result<EngineSnapshot, EnnError> {
        let Some(state) = &self.state else {
            return Err(EnnError::invalid_state(
                "LoocvEngine.snapshot requires bound training data; call bind first",
            ));
        };
        let phase = match self.phase {
            EnginePhase::Complete => SnapshotPhase::Complete,
            EnginePhase::Paused => SnapshotPhase::Paused,
            other => {
                return Err(EnnError::invalid_state(format!(
                    "LoocvEngine.snapshot cannot run while {other:?}"
                )));
            }
        };
        Ok(snapshot_state(self.config.k, phase, state))
    }

    /// Replaces the build state with `snapshot` after validating it against
    /// `data` and this engine's configuration. On error nothing changes.
    pub fn restore(&mut self, data: &'a Dataset, snapshot: EngineSnapshot) -> Result<(), EnnError> {
        validate_schema_version(snapshot.schema_version, "EngineSnapshot")?;
        let n = data.len();
        let n_classes = data.n_classes();
        if snapshot.n != n || snapshot.n_classes != n_classes {
            return Err(EnnError::checkpoint(format!(
                "snapshot covers n={}, n_classes={}; dataset has n={n}, n_classes={n_classes}",
                snapshot.n, snapshot.n_classes
            )));
        }
        if snapshot.k != self.config.k {
            return Err(EnnError::checkpoint(format!(
                "snapshot k={} does not match KnnConfig.k={}",
                snapshot.k, self.config.k
            )));
        }
        let max = max_neighbourhood(n)?;
        if snapshot.max_neighbourhood_size != max || snapshot.neighbourhood_size > max {
            return Err(EnnError::checkpoint(format!(
                "snapshot neighbourhood {}/{} is inconsistent with n={n}",
                snapshot.neighbourhood_size, snapshot.max_neighbourhood_size
            )));
        }
        if snapshot.searches.len() != n {
            return Err(EnnError::checkpoint(format!(
                "snapshot holds {} searches; dataset has {n}",
                snapshot.searches.len()
            )));
        }
        if snapshot.queue.strategy() != self.config.iteration {
            return Err(EnnError::checkpoint(format!(
                "snapshot iteration {:?} does not match KnnConfig.iteration {:?}",
                snapshot.queue.strategy(),
                self.config.iteration
            )));
        }
        snapshot.queue.validate(data)?;
        if let Some(selected) = snapshot.selected_k
            && (selected == 0 || selected > snapshot.k)
        {
            return Err(EnnError::checkpoint(format!(
                "snapshot selected_k={selected} is outside 1..={}",
                snapshot.k
            )));
        }
        if snapshot.phase == SnapshotPhase::Complete && snapshot.selected_k.is_none() {
            return Err(EnnError::checkpoint(
                "complete snapshot is missing selected_k",
            ));
        }

        let mut cache = self.new_cache()?;
        match (cache.as_mut(), snapshot.cache) {
            (None, None) => {}
            (Some(cache), Some(parked)) => {
                if parked.policy != cache.policy() {
                    return Err(EnnError::checkpoint(format!(
                        "snapshot cache policy {:?} does not match {:?}",
                        parked.policy,
                        cache.policy()
                    )));
                }
                for pair in parked.entries {
                    if pair.a >= n || pair.b >= n || pair.a == pair.b {
                        return Err(EnnError::checkpoint(format!(
                            "snapshot cache holds invalid pair ({}, {})",
                            pair.a, pair.b
                        )));
                    }
                    cache.put(pair.a, pair.b, none_as_infinity(pair.distance));
                }
            }
            _ => {
                return Err(EnnError::checkpoint(format!(
                    "snapshot cache presence does not match symmetry strategy {:?}",
                    self.config.symmetry
                )));
            }
        }

        let mut searches = Vec::with_capacity(n);
        let mut examined = 0usize;
        for (target, search) in snapshot.searches.into_iter().enumerate() {
            let search = restore_search(target, snapshot.k, data, search)?;
            examined = examined.saturating_add(search.examined());
            searches.push(search);
        }
        if examined != snapshot.neighbourhood_size {
            return Err(EnnError::checkpoint(format!(
                "snapshot neighbourhood_size={} disagrees with {examined} examined pairs",
                snapshot.neighbourhood_size
            )));
        }

        let stats = StatsCache::build(&self.measure, data)?;
        self.state = Some(BuildState {
            data,
            stats,
            searches,
            queue: snapshot.queue,
            cache,
            rng: snapshot.rng,
            neighbourhood_size: snapshot.neighbourhood_size,
            max_neighbourhood_size: snapshot.max_neighbourhood_size,
            diagnostics: snapshot.diagnostics,
            tick_estimate: snapshot.tick_estimate,
            build_time_ns: snapshot.build_time_ns,
            estimate_time_ns: snapshot.estimate_time_ns,
            run_time_ns: snapshot.run_time_ns,
            selected_k: snapshot.selected_k,
        });
        self.phase = match snapshot.phase {
            SnapshotPhase::Paused => EnginePhase::Paused,
            SnapshotPhase::Complete => EnginePhase::Complete,
        };
        Ok(())
    }

    /// Writes the current state to `path` atomically.
    pub fn save_checkpoint(&self, path: &Path, codec: PayloadCodec) -> Result<(), EnnError> {
        let snapshot = self.snapshot()?;
        let Some(state) = &self.state else {
            return Err(EnnError::invalid_state("checkpoint requires bound training data"));
        };
        let envelope = build_envelope(&snapshot, self.measure.name(), state.data.fingerprint(), codec)?;
        let bytes = encode_checkpoint_envelope(&envelope)?;
        write_checkpoint_file(path, &bytes)?;
        info!(path = %path.display(), bytes = bytes.len(), ?codec, "checkpoint written");
        Ok(())
    }

    /// Restores from the checkpoint at `path`, which must match this
    /// measure and `data`.
    pub fn load_checkpoint(&mut self, data: &'a Dataset, path: &Path) -> Result<(), EnnError> {
        let envelope = read_checkpoint_file(path)?;
        check_envelope_identity(&envelope, self.measure.name(), data.fingerprint())?;
        let snapshot = decode_snapshot(&envelope.payload, envelope.payload_codec)?;
        self.restore(data, snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::{BindOutcome, EnginePhase, LoocvEngine, checked_counter_increment};
    use crate::config::KnnConfig;
    use enn_core::{Budget, Dataset, EnnError, Sequence, StopReason};
    use enn_measures::{DistanceMeasure, Euclidean};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dataset(rows: &[(f64, usize)]) -> Dataset {
        Dataset::from_sequences(
            rows.iter()
                .map(|&(value, label)| Sequence::univariate(vec![value], label).expect("valid"))
                .collect(),
        )
        .expect("valid dataset")
    }

    #[test]
    fn counter_overflow_is_resource_limit() {
        let mut counter = usize::MAX;
        let err = checked_counter_increment(&mut counter, "ticks").expect_err("overflow");
        assert!(matches!(err, EnnError::ResourceLimit(_)));
        assert!(err.to_string().contains("ticks counter overflow"));
    }

    #[test]
    fn lifecycle_moves_from_uninitialized_to_complete() {
        let data = dataset(&[(0.0, 0), (0.1, 0), (5.0, 1), (5.2, 1)]);
        let mut engine = LoocvEngine::new(Euclidean, KnnConfig::default()).expect("engine");
        assert_eq!(engine.phase(), EnginePhase::Uninitialized);
        let err = engine.run().expect_err("run before bind");
        assert!(err.to_string().contains("call bind first"));

        assert_eq!(engine.bind(&data).expect("bind"), BindOutcome::Fresh);
        assert_eq!(engine.phase(), EnginePhase::Paused);
        assert_eq!(engine.max_neighbourhood_size(), 12);

        assert_eq!(engine.run().expect("run"), EnginePhase::Complete);
        assert_eq!(engine.neighbourhood_size(), 12);
        let result = engine.finalize().expect("finalize");
        assert!(!result.provisional);
        assert_eq!(result.accuracy, 1.0);
        assert_eq!(result.predicted_labels(), vec![0, 0, 1, 1]);
    }

    #[test]
    fn finalize_before_completion_is_invalid_state() {
        let data = dataset(&[(0.0, 0), (1.0, 1), (2.0, 0)]);
        let config = KnnConfig {
            budget: Budget {
                neighbour_limit: Some(1),
                ..Budget::default()
            },
            ..KnnConfig::default()
        };
        let mut engine = LoocvEngine::new(Euclidean, config).expect("engine");
        engine.bind(&data).expect("bind");
        assert_eq!(engine.run().expect("run"), EnginePhase::Paused);
        assert_eq!(engine.stop_reason(), Some(StopReason::NeighbourLimit));

        let err = engine.finalize().expect_err("not complete");
        assert!(matches!(err, EnnError::InvalidState(_)));
        assert!(engine.provisional_result().expect("provisional").provisional);
    }

    #[test]
    fn empty_training_set_is_rejected() {
        let data = Dataset::new(vec![], 1).expect("empty dataset");
        let mut engine = LoocvEngine::new(Euclidean, KnnConfig::default()).expect("engine");
        let err = engine.bind(&data).expect_err("empty data");
        assert!(err.to_string().contains("at least one training sequence"));
    }

    #[test]
    fn single_instance_completes_with_uniform_prediction() {
        let data = dataset(&[(3.0, 0)]);
        let mut engine = LoocvEngine::new(Euclidean, KnnConfig::default()).expect("engine");
        engine.bind(&data).expect("bind");
        assert!(!engine.tick().expect("tick"));
        assert_eq!(engine.phase(), EnginePhase::Complete);
        let result = engine.finalize().expect("finalize");
        assert_eq!(result.predictions[0].distribution, vec![1.0]);
    }

    struct Exploding {
        calls: AtomicUsize,
    }

    impl DistanceMeasure for Exploding {
        type Stats = ();

        fn name(&self) -> &'static str {
            "exploding"
        }

        fn is_symmetric(&self) -> bool {
            true
        }

        fn precompute(&self, _seq: &Sequence) -> Result<(), EnnError> {
            Ok(())
        }

        fn distance(&self, _a: &Sequence, _b: &Sequence, _cutoff: f64) -> Result<f64, EnnError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= 1 {
                Ok(f64::NAN)
            } else {
                Ok(1.0)
            }
        }
    }

    #[test]
    fn numerical_failure_discards_build_state() {
        let data = dataset(&[(0.0, 0), (1.0, 1), (2.0, 0)]);
        let measure = Exploding {
            calls: AtomicUsize::new(0),
        };
        let mut engine = LoocvEngine::new(measure, KnnConfig::default()).expect("engine");
        engine.bind(&data).expect("bind");
        let err = engine.run().expect_err("nan distance");
        assert!(matches!(err, EnnError::NumericalIssue(_)));
        assert_eq!(engine.phase(), EnginePhase::Uninitialized);
        assert!(engine.search(0).is_none());
    }
}
