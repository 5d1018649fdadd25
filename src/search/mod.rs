//! Search phases and the evaluation pipeline they share.
//!
//! Every candidate a phase proposes goes through [`SearchContext::evaluate`]:
//! validation, then the result cache, then (on a miss) the rate-limited
//! oracle, then the scorer. The context folds strict improvements into the
//! running [`BestState`] and checks cancellation and the time budget before
//! each candidate.

pub mod annealing;
pub mod baseline;
pub mod correlated;
pub mod deep_dive;
pub mod genetic;
pub mod lhs;
pub mod sweep;

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{ResultCache, cache_key};
use crate::error::{OptimizerError, Result};
use crate::oracle::RateLimitedOracle;
use crate::params::{Configuration, ParameterSpace};
use crate::scoring::{Metrics, ScoredResult, Scorer};
use crate::settings::RunSettings;
use crate::stop::{Deadline, StopFlag};

/// The running best of an optimization run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BestState {
    pub configuration: Configuration,
    pub score: f64,
    pub metrics: Metrics,
    pub source: String,
    /// False while the best is a baseline that failed the win-rate floor.
    pub validated: bool,
}

#[derive(Clone, Debug)]
pub enum Evaluation {
    Scored {
        result: ScoredResult,
        improved: bool,
        cached: bool,
    },
    /// Violates the parameter space; never sent to the oracle.
    Invalid,
    Failed(String),
}

impl Evaluation {
    pub fn fitness(&self) -> Option<f64> {
        match self {
            Self::Scored { result, .. } => result.fitness(),
            _ => None,
        }
    }

    pub fn improved(&self) -> bool {
        matches!(self, Self::Scored { improved: true, .. })
    }
}

/// One row of the run history.
#[derive(Clone, Debug, Serialize)]
pub struct TestRecord {
    pub index: usize,
    pub phase: String,
    pub key: String,
    pub score: Option<f64>,
    pub token_count: Option<u64>,
    pub win_rate: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub rejected: bool,
    pub reason: Option<String>,
    pub cached: bool,
    pub improved: bool,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub tests: usize,
    pub oracle_calls: usize,
    pub cache_hits: usize,
    pub failed: usize,
    pub rejected: usize,
    pub invalid_skipped: usize,
    pub improvements: usize,
}

pub struct SearchContext<'a> {
    pub space: &'a ParameterSpace,
    pub settings: &'a RunSettings,
    pub scorer: Scorer,
    pub rng: StdRng,
    cache: &'a mut ResultCache,
    oracle: &'a mut RateLimitedOracle,
    stop: StopFlag,
    deadline: Deadline,
    best: Option<BestState>,
    effectiveness: BTreeMap<String, f64>,
    history: Vec<TestRecord>,
    stats: RunStats,
}

impl<'a> SearchContext<'a> {
    pub fn new(
        space: &'a ParameterSpace,
        settings: &'a RunSettings,
        cache: &'a mut ResultCache,
        oracle: &'a mut RateLimitedOracle,
        stop: StopFlag,
        deadline: Deadline,
    ) -> Self {
        Self {
            space,
            settings,
            scorer: Scorer::from_settings(settings),
            rng: StdRng::seed_from_u64(settings.seed),
            cache,
            oracle,
            stop,
            deadline,
            best: None,
            effectiveness: BTreeMap::new(),
            history: Vec::new(),
            stats: RunStats::default(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn best(&self) -> Option<&BestState> {
        self.best.as_ref()
    }

    pub fn best_config(&self) -> Configuration {
        self.best
            .as_ref()
            .map(|b| b.configuration.clone())
            .unwrap_or_default()
    }

    pub fn best_score(&self) -> f64 {
        self.best.as_ref().map(|b| b.score).unwrap_or(f64::NEG_INFINITY)
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    pub fn history(&self) -> &[TestRecord] {
        &self.history
    }

    pub fn effectiveness(&self) -> &BTreeMap<String, f64> {
        &self.effectiveness
    }

    pub fn record_effectiveness(&mut self, name: &str, gain: f64) {
        *self.effectiveness.entry(name.to_string()).or_insert(0.0) += gain.max(0.0);
    }

    /// Parameters with a positive realized improvement, largest first.
    pub fn ranked_parameters(&self) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .effectiveness
            .iter()
            .filter(|(_, g)| **g > 0.0)
            .map(|(k, g)| (k.clone(), *g))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    pub fn target_reached(&self) -> bool {
        match (self.settings.target_score, &self.best) {
            (Some(target), Some(b)) => b.validated && b.score >= target,
            _ => false,
        }
    }

    /// Fails with an interrupt once the run must not evaluate another candidate.
    pub fn checkpoint(&self) -> Result<()> {
        if self.stop.is_stopped() {
            return Err(OptimizerError::Cancelled);
        }
        if self.target_reached() {
            return Err(OptimizerError::TargetReached);
        }
        if self.deadline.expired() {
            return Err(OptimizerError::BudgetExhausted);
        }
        if let Some(max) = self.settings.max_tests {
            if self.stats.tests >= max {
                return Err(OptimizerError::BudgetExhausted);
            }
        }
        Ok(())
    }

    /// Installs the run's anchor, validated or not.
    pub(crate) fn anchor(&mut self, result: &ScoredResult, source: &str) {
        self.best = Some(BestState {
            configuration: result.configuration.clone(),
            score: result.score,
            metrics: result.metrics.clone(),
            source: source.to_string(),
            validated: !result.rejected,
        });
    }

    /// Starts from a best found earlier, without scoring it again.
    pub(crate) fn adopt(&mut self, best: BestState) {
        self.best = Some(best);
    }

    pub async fn evaluate(&mut self, cfg: Configuration, label: &str) -> Result<Evaluation> {
        self.checkpoint()?;

        if let Err(v) = self.space.validate(&cfg) {
            self.stats.invalid_skipped += 1;
            debug!(phase = label, violation = %v, "skipping invalid candidate");
            return Ok(Evaluation::Invalid);
        }

        let key = cache_key(self.space, &cfg);
        if self.settings.use_cache {
            if let Some(hit) = self.cache.get(&key) {
                let metrics = hit.metrics.clone();
                self.cache.record_hit();
                let result = self.scorer.score(cfg, metrics);
                return Ok(self.finish(label, key, result, true));
            }
        }
        self.cache.record_miss();

        match self.oracle.call(&cfg, &self.stop).await {
            Ok(metrics) => {
                let result = self.scorer.score(cfg, metrics);
                if self.settings.use_cache {
                    self.cache.put(key.clone(), result.clone());
                }
                Ok(self.finish(label, key, result, false))
            }
            Err(OptimizerError::Oracle(msg)) => {
                self.stats.tests += 1;
                self.stats.failed += 1;
                warn!(phase = label, error = %msg, "oracle failed, skipping candidate");
                self.history.push(TestRecord {
                    index: self.stats.tests,
                    phase: label.to_string(),
                    key,
                    score: None,
                    token_count: None,
                    win_rate: None,
                    pnl_percent: None,
                    rejected: false,
                    reason: None,
                    cached: false,
                    improved: false,
                    error: Some(msg.clone()),
                });
                Ok(Evaluation::Failed(msg))
            }
            Err(e) => Err(e),
        }
    }

    fn finish(&mut self, label: &str, key: String, result: ScoredResult, cached: bool) -> Evaluation {
        self.stats.tests += 1;
        if cached {
            self.stats.cache_hits += 1;
        } else {
            self.stats.oracle_calls += 1;
        }
        if result.rejected {
            self.stats.rejected += 1;
        }

        let improved = self.consider(&result, label);
        let m = &result.metrics;
        info!(
            test = self.stats.tests,
            phase = label,
            score = format!("{:.2}", result.score),
            tokens = m.token_count,
            win_rate = format!("{:.1}", m.realized_win_rate()),
            rejected = result.rejected,
            cached,
            best = format!("{:.2}", self.best_score()),
            "evaluated candidate"
        );

        self.history.push(TestRecord {
            index: self.stats.tests,
            phase: label.to_string(),
            key,
            score: Some(result.score),
            token_count: Some(m.token_count),
            win_rate: Some(m.realized_win_rate()),
            pnl_percent: Some(m.pnl_percent),
            rejected: result.rejected,
            reason: result.rejection.as_ref().map(|r| r.to_string()),
            cached,
            improved,
            error: None,
        });

        Evaluation::Scored {
            result,
            improved,
            cached,
        }
    }

    /// Replaces the best when `result` validates and strictly beats it.
    fn consider(&mut self, result: &ScoredResult, label: &str) -> bool {
        let Some(score) = result.fitness() else {
            return false;
        };
        let better = match &self.best {
            None => true,
            Some(b) => !b.validated || score > b.score,
        };
        if !better {
            return false;
        }
        let previous = self.best_score();
        if score < previous {
            // only reachable while the best is an unvalidated baseline
            warn!(
                source = label,
                score = format!("{score:.2}"),
                previous = format!("{previous:.2}"),
                "validated candidate replaces a higher-scoring unvalidated baseline"
            );
        }
        self.anchor(result, label);
        self.stats.improvements += 1;
        info!(
            source = label,
            score = format!("{score:.2}"),
            previous = format!("{previous:.2}"),
            "new best"
        );
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::oracle::{Oracle, OracleReply};

    /// Deterministic oracle computing a reply from the configuration.
    pub struct FnOracle<F> {
        f: F,
        pub calls: AtomicUsize,
    }

    impl<F> FnOracle<F>
    where
        F: Fn(&Configuration) -> OracleReply + Send + Sync,
    {
        pub fn new(f: F) -> Arc<Self> {
            Arc::new(Self {
                f,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<F> Oracle for FnOracle<F>
    where
        F: Fn(&Configuration) -> OracleReply + Send + Sync,
    {
        async fn evaluate(&self, config: &Configuration) -> OracleReply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.f)(config)
        }
    }

    pub fn success(tokens: u64, pnl: f64, win_rate: f64) -> OracleReply {
        OracleReply::Success {
            metrics: Metrics::new(tokens, pnl, win_rate),
            quota: None,
        }
    }

    /// Replies from `replies` in call order, then fails.
    pub fn scripted(replies: Vec<OracleReply>) -> Arc<dyn Oracle> {
        let next = AtomicUsize::new(0);
        FnOracle::new(move |_: &Configuration| {
            let i = next.fetch_add(1, Ordering::SeqCst);
            replies
                .get(i)
                .cloned()
                .unwrap_or_else(|| OracleReply::Failed("script exhausted".into()))
        })
    }

    pub fn quick_settings() -> RunSettings {
        let mut s = RunSettings::default();
        s.rate_limit.delay_between_requests_ms = 0;
        s.runtime_secs = 600;
        s
    }

    /// Owns everything a [`SearchContext`] borrows.
    pub struct Harness {
        pub space: ParameterSpace,
        pub settings: RunSettings,
        pub cache: ResultCache,
        pub oracle: RateLimitedOracle,
        pub stop: StopFlag,
    }

    impl Harness {
        pub fn new(space: ParameterSpace, settings: RunSettings, oracle: Arc<dyn Oracle>) -> Self {
            let cache = ResultCache::new(settings.cache.capacity);
            let oracle = RateLimitedOracle::new(oracle, settings.rate_limit.clone());
            Self {
                space,
                settings,
                cache,
                oracle,
                stop: StopFlag::new(),
            }
        }

        pub fn ctx(&mut self) -> SearchContext<'_> {
            SearchContext::new(
                &self.space,
                &self.settings,
                &mut self.cache,
                &mut self.oracle,
                self.stop.clone(),
                Deadline::after(Duration::from_secs(self.settings.runtime_secs)),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::params::ParameterRule;
    use crate::oracle::OracleReply;
    use serde_json::json;

    fn space() -> ParameterSpace {
        ParameterSpace::new(
            vec![
                ParameterRule::integer("Wallets", "Min Holders", 0, 10, 1),
                ParameterRule::integer("Wallets", "Max Holders", 0, 10, 1),
            ],
            Vec::new(),
        )
        .unwrap()
    }

    fn holders(cfg: &Configuration) -> f64 {
        cfg.get("Wallets", "Min Holders").and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    #[tokio::test]
    async fn cache_hit_skips_the_oracle() {
        let oracle = FnOracle::new(|c: &Configuration| success(100, holders(c) * 10.0, 50.0));
        let mut h = Harness::new(space(), quick_settings(), oracle.clone());
        let mut ctx = h.ctx();
        let mut cfg = Configuration::new();
        cfg.set("Wallets", "Min Holders", json!(2));

        ctx.evaluate(cfg.clone(), "a").await.unwrap();
        let again = ctx.evaluate(cfg, "b").await.unwrap();
        assert!(matches!(again, Evaluation::Scored { cached: true, .. }));
        assert_eq!(ctx.stats().cache_hits, 1);
        drop(ctx);
        assert_eq!(oracle.calls(), 1);
        assert_eq!(h.cache.stats().hits, 1);
        assert_eq!(h.cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn disabled_cache_always_misses() {
        let oracle = FnOracle::new(|c: &Configuration| success(100, holders(c), 50.0));
        let mut settings = quick_settings();
        settings.use_cache = false;
        let mut h = Harness::new(space(), settings, oracle.clone());
        let mut ctx = h.ctx();
        let cfg = Configuration::new();
        ctx.evaluate(cfg.clone(), "a").await.unwrap();
        ctx.evaluate(cfg, "b").await.unwrap();
        drop(ctx);
        assert_eq!(oracle.calls(), 2);
        assert_eq!(h.cache.stats().misses, 2);
        assert_eq!(h.cache.stats().hits, 0);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn invalid_candidates_never_reach_the_oracle() {
        let oracle = FnOracle::new(|_: &Configuration| success(100, 1.0, 50.0));
        let mut h = Harness::new(space(), quick_settings(), oracle.clone());
        let mut ctx = h.ctx();
        let mut cfg = Configuration::new();
        cfg.set("Wallets", "Min Holders", json!(8));
        cfg.set("Wallets", "Max Holders", json!(3));
        let e = ctx.evaluate(cfg, "x").await.unwrap();
        assert!(matches!(e, Evaluation::Invalid));
        assert_eq!(ctx.stats().tests, 0);
        assert_eq!(ctx.stats().invalid_skipped, 1);
        drop(ctx);
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn oracle_failure_is_recorded_and_skipped() {
        let oracle = FnOracle::new(|_: &Configuration| OracleReply::Failed("HTTP 500".into()));
        let mut h = Harness::new(space(), quick_settings(), oracle);
        let mut ctx = h.ctx();
        let e = ctx.evaluate(Configuration::new(), "x").await.unwrap();
        assert!(matches!(e, Evaluation::Failed(_)));
        assert_eq!(ctx.stats().failed, 1);
        assert_eq!(ctx.history()[0].error.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn rejected_results_never_become_best() {
        let oracle = FnOracle::new(|c: &Configuration| {
            if holders(c) > 5.0 {
                success(10, 999.0, 90.0)
            } else {
                success(100, holders(c), 50.0)
            }
        });
        let mut h = Harness::new(space(), quick_settings(), oracle);
        let mut ctx = h.ctx();
        let mut cfg = Configuration::new();
        cfg.set("Wallets", "Min Holders", json!(3));
        assert!(ctx.evaluate(cfg.clone(), "a").await.unwrap().improved());
        cfg.set("Wallets", "Min Holders", json!(9));
        assert!(!ctx.evaluate(cfg, "b").await.unwrap().improved());
        assert_eq!(ctx.best_score(), 1.5);
    }

    #[tokio::test]
    async fn validated_result_supersedes_unvalidated_anchor_even_when_lower() {
        let oracle = FnOracle::new(|c: &Configuration| success(100, holders(c), 50.0));
        let mut h = Harness::new(space(), quick_settings(), oracle);
        let mut ctx = h.ctx();
        let mut anchor_cfg = Configuration::new();
        anchor_cfg.set("Wallets", "Min Holders", json!(9));
        let anchor = ctx.scorer.score(anchor_cfg, Metrics::new(100, 100.0, 10.0));
        assert!(anchor.rejected);
        ctx.anchor(&anchor, "Baseline");

        let mut cfg = Configuration::new();
        cfg.set("Wallets", "Min Holders", json!(2));
        assert!(ctx.evaluate(cfg, "a").await.unwrap().improved());
        let best = ctx.best().unwrap();
        assert!(best.validated);
        assert_eq!(best.score, 1.0);
    }

    #[tokio::test]
    async fn stop_flag_interrupts_before_evaluation() {
        let oracle = FnOracle::new(|_: &Configuration| success(100, 1.0, 50.0));
        let mut h = Harness::new(space(), quick_settings(), oracle);
        h.stop.stop();
        let mut ctx = h.ctx();
        let err = ctx.evaluate(Configuration::new(), "x").await.unwrap_err();
        assert!(matches!(err, OptimizerError::Cancelled));
    }

    #[tokio::test]
    async fn max_tests_caps_the_run() {
        let oracle = FnOracle::new(|c: &Configuration| success(100, holders(c), 50.0));
        let mut settings = quick_settings();
        settings.max_tests = Some(1);
        let mut h = Harness::new(space(), settings, oracle);
        let mut ctx = h.ctx();
        ctx.evaluate(Configuration::new(), "a").await.unwrap();
        let err = ctx.evaluate(Configuration::new(), "b").await.unwrap_err();
        assert!(matches!(err, OptimizerError::BudgetExhausted));
    }
}
