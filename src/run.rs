//! Phase orchestration for a single run and for chains of runs.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::{KvStore, ResultCache};
use crate::error::{OptimizerError, Result};
use crate::oracle::RateLimitedOracle;
use crate::params::{Configuration, ParameterSpace};
use crate::scoring::Metrics;
use crate::search::{
    BestState, RunStats, SearchContext, TestRecord, annealing, baseline, correlated, deep_dive, genetic, lhs,
    sweep,
};
use crate::settings::RunSettings;
use crate::stop::{Deadline, StopFlag};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    TargetReached,
    BudgetExhausted,
    Cancelled,
    /// A non-recoverable error after the run had a best; see [`RunReport::error`].
    Aborted,
}

impl StopReason {
    fn from_error(e: &OptimizerError) -> Self {
        if !e.is_interrupt() {
            return Self::Aborted;
        }
        match e {
            OptimizerError::Cancelled => Self::Cancelled,
            OptimizerError::TargetReached => Self::TargetReached,
            _ => Self::BudgetExhausted,
        }
    }
}

/// Where a run starts.
#[derive(Clone, Debug)]
pub enum RunStart {
    /// Score this configuration, or the space's conservative default.
    Baseline(Option<Configuration>),
    /// Continue from a best found by an earlier run, without re-scoring it.
    Carried(BestState),
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub index: usize,
    pub best: BestState,
    /// Score the run started from: its own baseline, or the carried best.
    pub baseline_score: Option<f64>,
    pub test_count: usize,
    pub parameter_effectiveness: BTreeMap<String, f64>,
    pub stats: RunStats,
    pub stop_reason: StopReason,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub history: Vec<TestRecord>,
}

impl RunReport {
    pub fn best_config(&self) -> &Configuration {
        &self.best.configuration
    }

    pub fn best_score(&self) -> f64 {
        self.best.score
    }

    pub fn best_metrics(&self) -> &Metrics {
        &self.best.metrics
    }
}

/// One optimization run: baseline, sweep, then each enabled optional phase
/// while the time budget allows.
pub struct OptimizationRun<'a> {
    space: &'a ParameterSpace,
    settings: &'a RunSettings,
    cache: &'a mut ResultCache,
    oracle: &'a mut RateLimitedOracle,
    stop: StopFlag,
}

impl<'a> OptimizationRun<'a> {
    pub fn new(
        space: &'a ParameterSpace,
        settings: &'a RunSettings,
        cache: &'a mut ResultCache,
        oracle: &'a mut RateLimitedOracle,
        stop: StopFlag,
    ) -> Self {
        Self {
            space,
            settings,
            cache,
            oracle,
            stop,
        }
    }

    /// Once the run has a best, any error ends it early and the best is still
    /// reported: interrupts (cancellation, budget, target) by their reason,
    /// anything else as [`StopReason::Aborted`]. An error before a best
    /// exists fails the run.
    pub async fn execute(
        self,
        index: usize,
        start: RunStart,
        deadline: Deadline,
        rng_seed: u64,
    ) -> Result<RunReport> {
        let started = tokio::time::Instant::now();
        let mut ctx =
            SearchContext::new(self.space, self.settings, self.cache, self.oracle, self.stop, deadline).with_seed(rng_seed);
        let carried_score = match &start {
            RunStart::Carried(b) => Some(b.score),
            RunStart::Baseline(_) => None,
        };

        let (stop_reason, error) = match run_phases(&mut ctx, start).await {
            Ok(()) => (StopReason::Completed, None),
            Err(e) if ctx.best().is_none() => return Err(e),
            Err(e) => {
                let reason = StopReason::from_error(&e);
                if reason == StopReason::Aborted {
                    error!(run = index, error = %e, "run aborted, keeping its best");
                    (reason, Some(e.to_string()))
                } else {
                    (reason, None)
                }
            }
        };
        let Some(best) = ctx.best().cloned() else {
            return Err(OptimizerError::BaselineFailed("run produced no baseline".to_string()));
        };

        let baseline_score = carried_score.or_else(|| {
            ctx.history()
                .iter()
                .find(|r| r.phase == baseline::LABEL)
                .and_then(|r| r.score)
        });
        let stats = ctx.stats();
        info!(
            run = index,
            best = format!("{:.2}", best.score),
            source = %best.source,
            tests = stats.tests,
            reason = ?stop_reason,
            "run finished"
        );

        Ok(RunReport {
            index,
            best,
            baseline_score,
            test_count: stats.tests,
            parameter_effectiveness: ctx.effectiveness().clone(),
            stats,
            stop_reason,
            elapsed_secs: started.elapsed().as_secs_f64(),
            error,
            history: ctx.history().to_vec(),
        })
    }
}

async fn run_phases(ctx: &mut SearchContext<'_>, start: RunStart) -> Result<()> {
    let phases = &ctx.settings.phases;
    let (use_lhs, use_correlated, use_annealing, use_genetic, use_deep_dive) =
        (phases.lhs, phases.correlated, phases.annealing, phases.genetic, phases.deep_dive);

    match start {
        RunStart::Baseline(seed) => baseline::run(ctx, seed).await?,
        RunStart::Carried(best) => baseline::carry(ctx, best),
    }
    sweep::run(ctx).await?;
    if ready(ctx, use_lhs, "LHS") {
        lhs::run(ctx).await?;
    }
    if ready(ctx, use_correlated, "Correlated") {
        correlated::run(ctx).await?;
    }
    if ready(ctx, use_annealing, annealing::LABEL) {
        annealing::run(ctx).await?;
    }
    if ready(ctx, use_genetic, "Genetic") {
        genetic::run(ctx).await?;
    }
    if ready(ctx, use_deep_dive, "Deep Dive") {
        deep_dive::run(ctx).await?;
    }
    Ok(())
}

/// Whether an optional phase should start now.
fn ready(ctx: &SearchContext<'_>, enabled: bool, phase: &str) -> bool {
    if !enabled {
        debug!(phase, "phase disabled");
        return false;
    }
    let min = Duration::from_secs(ctx.settings.phases.min_phase_secs);
    let left = ctx.deadline().remaining();
    if left < min {
        info!(phase, left_secs = left.as_secs(), "skipping phase, not enough time left");
        return false;
    }
    info!(phase, best = format!("{:.2}", ctx.best_score()), "starting phase");
    true
}

#[derive(Clone, Debug, Serialize)]
pub struct RunFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ChainReport {
    pub runs: Vec<RunReport>,
    pub failures: Vec<RunFailure>,
    /// Best across every run; never decreases as runs complete.
    pub best: Option<BestState>,
    pub best_run: Option<usize>,
    /// Global best score after each completed run.
    pub best_trace: Vec<f64>,
    pub target_reached: bool,
    pub cancelled: bool,
    /// Error that stopped the chain early.
    pub fatal: Option<String>,
}

impl ChainReport {
    pub fn total_tests(&self) -> usize {
        self.runs.iter().map(|r| r.test_count).sum()
    }

    pub fn history(&self) -> impl Iterator<Item = (usize, &TestRecord)> {
        self.runs.iter().flat_map(|r| r.history.iter().map(move |t| (r.index, t)))
    }

    fn absorb(&mut self, report: &RunReport) -> bool {
        let candidate = &report.best;
        let better = match &self.best {
            None => true,
            Some(b) if !b.validated => candidate.validated || candidate.score > b.score,
            Some(b) => candidate.validated && candidate.score > b.score,
        };
        if better {
            self.best = Some(candidate.clone());
            self.best_run = Some(report.index);
        }
        better
    }
}

/// N runs sharing one cache and oracle. Every run after the first continues
/// from the best any earlier run found, score and metrics included.
pub struct ChainedRun<'a> {
    space: &'a ParameterSpace,
    settings: &'a RunSettings,
    cache: &'a mut ResultCache,
    oracle: &'a mut RateLimitedOracle,
    stop: StopFlag,
    store: Option<&'a dyn KvStore>,
}

impl<'a> ChainedRun<'a> {
    pub fn new(
        space: &'a ParameterSpace,
        settings: &'a RunSettings,
        cache: &'a mut ResultCache,
        oracle: &'a mut RateLimitedOracle,
        stop: StopFlag,
    ) -> Self {
        Self {
            space,
            settings,
            cache,
            oracle,
            stop,
            store: None,
        }
    }

    /// Persists the cache after every run.
    pub fn with_store(mut self, store: &'a dyn KvStore) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn execute(self, seed: Option<Configuration>) -> ChainReport {
        let Self {
            space,
            settings,
            cache,
            oracle,
            stop,
            store,
        } = self;
        let runs = settings.chain.runs.max(1);
        let overall = Deadline::after(settings.runtime());
        let mut report = ChainReport::default();

        for index in 1..=runs {
            if stop.is_stopped() {
                report.cancelled = true;
                break;
            }
            if overall.expired() {
                info!(run = index, "chain time budget exhausted");
                break;
            }
            let slice = match settings.chain.run_secs {
                Some(secs) => Duration::from_secs(secs),
                None => overall.remaining() / (runs - index + 1) as u32,
            };
            let deadline = overall.capped(slice);
            let start = match &report.best {
                Some(b) => RunStart::Carried(b.clone()),
                None => RunStart::Baseline(seed.clone()),
            };
            info!(
                run = index,
                of = runs,
                seeded_from = report.best.as_ref().map(|b| format!("{:.2}", b.score)).unwrap_or_default(),
                "starting run"
            );

            let outcome = OptimizationRun::new(space, settings, &mut *cache, &mut *oracle, stop.clone())
                .execute(index, start, deadline, settings.seed.wrapping_add(index as u64 - 1))
                .await;

            if let Some(store) = store {
                if let Err(e) = cache.persist(store) {
                    warn!(error = %e, "could not persist result cache");
                }
            }

            match outcome {
                Ok(run) => {
                    if report.absorb(&run) {
                        info!(run = index, score = format!("{:.2}", run.best.score), "new global best");
                    }
                    if let Some(b) = &report.best {
                        report.best_trace.push(b.score);
                    }
                    let reason = run.stop_reason;
                    let run_error = run.error.clone();
                    report.runs.push(run);
                    match reason {
                        StopReason::Aborted => {
                            error!(run = index, "stopping chain");
                            report.fatal = run_error;
                            break;
                        }
                        StopReason::Cancelled => {
                            report.cancelled = true;
                            break;
                        }
                        StopReason::TargetReached => {
                            report.target_reached = true;
                            break;
                        }
                        _ => {}
                    }
                }
                Err(e) if e.is_fatal_to_chain() => {
                    report.cancelled = matches!(e, OptimizerError::Cancelled);
                    if !report.cancelled {
                        error!(run = index, error = %e, "stopping chain");
                        report.fatal = Some(e.to_string());
                    }
                    report.failures.push(RunFailure {
                        index,
                        error: e.to_string(),
                    });
                    break;
                }
                Err(e) => {
                    warn!(run = index, error = %e, "run failed, continuing chain");
                    report.failures.push(RunFailure {
                        index,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleReply;
    use crate::params::ParameterRule;
    use crate::search::testing::*;
    use serde_json::json;

    fn space() -> ParameterSpace {
        ParameterSpace::new(
            vec![ParameterRule::integer("Wallets", "Min Holders", 0, 10, 1).with_default(5)],
            Vec::new(),
        )
        .unwrap()
    }

    fn holders(c: &Configuration) -> f64 {
        c.get("Wallets", "Min Holders").and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    #[tokio::test]
    async fn single_run_reports_best_and_effectiveness() {
        let oracle = FnOracle::new(|c: &Configuration| success(400, 20.0 + 4.0 * holders(c), 50.0));
        let mut h = Harness::new(space(), quick_settings(), oracle);
        let run = OptimizationRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let report = run
            .execute(1, RunStart::Baseline(None), Deadline::after(Duration::from_secs(600)), 1)
            .await
            .unwrap();

        assert_eq!(report.baseline_score, Some(20.0));
        assert_eq!(report.best_score(), 30.0);
        assert_eq!(report.best_config().get("Wallets", "Min Holders"), Some(&json!(10)));
        assert_eq!(report.stop_reason, StopReason::Completed);
        assert!(report.parameter_effectiveness["Min Holders"] > 0.0);
        assert_eq!(report.test_count, report.history.len());
    }

    #[tokio::test]
    async fn target_score_ends_run_early() {
        let oracle = FnOracle::new(|c: &Configuration| success(400, 20.0 + 4.0 * holders(c), 50.0));
        let mut settings = quick_settings();
        settings.target_score = Some(25.0);
        let mut h = Harness::new(space(), settings, oracle);
        let run = OptimizationRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let report = run
            .execute(1, RunStart::Baseline(None), Deadline::after(Duration::from_secs(600)), 1)
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::TargetReached);
        assert!(report.best_score() >= 25.0);
    }

    #[tokio::test]
    async fn baseline_failure_fails_the_run() {
        let oracle = FnOracle::new(|_: &Configuration| success(1, 20.0, 50.0));
        let mut h = Harness::new(space(), quick_settings(), oracle);
        let run = OptimizationRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let err = run
            .execute(1, RunStart::Baseline(None), Deadline::after(Duration::from_secs(600)), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, OptimizerError::BaselineRejected(_)));
    }

    #[tokio::test]
    async fn failed_runs_do_not_stop_the_chain() {
        let oracle = FnOracle::new(|_: &Configuration| success(1, 20.0, 50.0));
        let mut settings = quick_settings();
        settings.chain.runs = 3;
        let mut h = Harness::new(space(), settings, oracle);
        let chain = ChainedRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let report = chain.execute(None).await;
        assert_eq!(report.failures.len(), 3);
        assert!(report.best.is_none());
        assert!(report.fatal.is_none());
    }

    fn rising(c: &Configuration) -> OracleReply {
        success(400, 20.0 + 4.0 * holders(c), 50.0)
    }

    /// One call every ten seconds, no cache.
    fn paced_settings() -> RunSettings {
        let mut s = quick_settings();
        s.use_cache = false;
        s.rate_limit.delay_between_requests_ms = 10_000;
        s
    }

    #[tokio::test]
    async fn carried_best_starts_the_run_without_rescoring() {
        let oracle = FnOracle::new(rising);
        let mut settings = quick_settings();
        settings.use_cache = false;
        let mut h = Harness::new(space(), settings, oracle.clone());
        let mut carried_cfg = Configuration::new();
        carried_cfg.set("Wallets", "Min Holders", json!(7));
        let carried = BestState {
            configuration: carried_cfg,
            score: 40.0,
            metrics: Metrics::new(400, 80.0, 50.0),
            source: "Parameter: Min Holders".to_string(),
            validated: true,
        };
        let run = OptimizationRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let report = run
            .execute(2, RunStart::Carried(carried), Deadline::after(Duration::from_secs(600)), 1)
            .await
            .unwrap();

        // no candidate reaches 40 on this landscape
        assert_eq!(report.baseline_score, Some(40.0));
        assert_eq!(report.best_score(), 40.0);
        assert!(report.history.iter().all(|r| r.phase != baseline::LABEL));
        assert_eq!(oracle.calls(), report.test_count);
    }

    #[tokio::test(start_paused = true)]
    async fn optional_phases_skip_without_enough_time() {
        let mut settings = quick_settings();
        settings.phases.min_phase_secs = 120;
        let mut h = Harness::new(space(), settings, FnOracle::new(rising));
        let run = OptimizationRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let report = run
            .execute(1, RunStart::Baseline(None), Deadline::after(Duration::from_secs(60)), 1)
            .await
            .unwrap();

        assert_eq!(report.stop_reason, StopReason::Completed);
        assert!(
            report
                .history
                .iter()
                .all(|r| r.phase == baseline::LABEL || r.phase.starts_with("Parameter:"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_mid_phase_keeps_the_best() {
        let mut h = Harness::new(space(), paced_settings(), FnOracle::new(rising));
        let run = OptimizationRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let report = run
            .execute(1, RunStart::Baseline(None), Deadline::after(Duration::from_secs(35)), 1)
            .await
            .unwrap();

        // calls at 0, 10, 20, 30 and 40s; the check before a sixth sees the deadline
        assert_eq!(report.stop_reason, StopReason::BudgetExhausted);
        assert_eq!(report.test_count, 5);
        assert_eq!(report.baseline_score, Some(20.0));
        assert_eq!(report.best_score(), 30.0);
        assert_eq!(report.best_metrics().token_count, 400);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_mid_run_keep_the_partial_best() {
        let oracle = scripted(vec![
            success(400, 40.0, 50.0),
            success(400, 80.0, 50.0),
            OracleReply::RateLimited { reset_epoch: None },
            OracleReply::RateLimited { reset_epoch: None },
        ]);
        let mut settings = quick_settings();
        settings.use_cache = false;
        settings.rate_limit.max_retries = 1;
        let mut h = Harness::new(space(), settings, oracle);
        let chain = ChainedRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let report = chain.execute(None).await;

        assert_eq!(report.runs.len(), 1);
        let run = &report.runs[0];
        assert_eq!(run.stop_reason, StopReason::Aborted);
        assert!(run.error.is_some());
        assert_eq!(run.best_score(), 40.0);
        assert_eq!(report.best.as_ref().map(|b| b.score), Some(40.0));
        assert_eq!(report.best_trace, vec![40.0]);
        assert!(report.fatal.is_some());
        assert!(report.failures.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn chain_stops_once_target_is_reached() {
        let mut settings = quick_settings();
        settings.chain.runs = 3;
        settings.target_score = Some(25.0);
        let mut h = Harness::new(space(), settings, FnOracle::new(rising));
        let chain = ChainedRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let report = chain.execute(None).await;

        assert!(report.target_reached);
        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].stop_reason, StopReason::TargetReached);
    }

    #[tokio::test(start_paused = true)]
    async fn chain_budget_splits_evenly_over_remaining_runs() {
        let mut settings = paced_settings();
        settings.runtime_secs = 120;
        settings.chain.runs = 2;
        let mut h = Harness::new(space(), settings, FnOracle::new(rising));
        let chain = ChainedRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let report = chain.execute(None).await;

        assert_eq!(report.runs.len(), 2);
        let first = &report.runs[0];
        assert_eq!(first.stop_reason, StopReason::BudgetExhausted);
        assert!((50.0..=70.0).contains(&first.elapsed_secs), "{}", first.elapsed_secs);
        assert!(report.runs[1].elapsed_secs <= 70.0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_secs_caps_each_run() {
        let mut settings = paced_settings();
        settings.chain.runs = 2;
        settings.chain.run_secs = Some(30);
        let mut h = Harness::new(space(), settings, FnOracle::new(rising));
        let chain = ChainedRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let report = chain.execute(None).await;

        assert_eq!(report.runs.len(), 2);
        for run in &report.runs {
            assert_eq!(run.stop_reason, StopReason::BudgetExhausted);
            assert!((30.0..=40.0).contains(&run.elapsed_secs), "{}", run.elapsed_secs);
        }
    }

    #[tokio::test]
    async fn stopped_chain_runs_nothing() {
        let oracle = FnOracle::new(|_: &Configuration| success(400, 20.0, 50.0));
        let mut settings = quick_settings();
        settings.chain.runs = 2;
        let mut h = Harness::new(space(), settings, oracle.clone());
        h.stop.stop();
        let chain = ChainedRun::new(&h.space, &h.settings, &mut h.cache, &mut h.oracle, h.stop.clone());
        let report = chain.execute(None).await;
        assert!(report.cancelled);
        assert!(report.runs.is_empty());
        assert_eq!(oracle.calls(), 0);
    }
}
