//! Tunable run parameters.
//!
//! Every field has a default so a settings file only needs to name what it
//! overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OptimizerError, Result};
use crate::scoring::{MinTokenPolicy, ScoringMode, WinRateTiers};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Stop as soon as the best score reaches this value.
    pub target_score: Option<f64>,
    /// Wall-clock budget of the whole chain; a single run gets all of it.
    pub runtime_secs: u64,
    /// Upper bound on evaluations per run, cache hits included.
    pub max_tests: Option<usize>,
    pub seed: u64,
    pub use_cache: bool,
    pub scoring: ScoringSettings,
    pub phases: PhaseToggles,
    pub rate_limit: RateLimitSettings,
    pub cache: CacheSettings,
    pub chain: ChainSettings,
    pub lhs: LhsSettings,
    pub annealing: AnnealingSettings,
    pub genetic: GeneticSettings,
    pub deep_dive: DeepDiveSettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            target_score: None,
            runtime_secs: 30 * 60,
            max_tests: None,
            seed: 20260226,
            use_cache: true,
            scoring: ScoringSettings::default(),
            phases: PhaseToggles::default(),
            rate_limit: RateLimitSettings::default(),
            cache: CacheSettings::default(),
            chain: ChainSettings::default(),
            lhs: LhsSettings::default(),
            annealing: AnnealingSettings::default(),
            genetic: GeneticSettings::default(),
            deep_dive: DeepDiveSettings::default(),
        }
    }
}

impl RunSettings {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(s).map_err(|e| OptimizerError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn runtime(&self) -> Duration {
        Duration::from_secs(self.runtime_secs)
    }

    /// Minimum sample count for the configured date range.
    pub fn min_tokens(&self) -> u64 {
        self.scoring.min_tokens.for_days(self.scoring.date_range_days)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(OptimizerError::InvalidSettings(msg.to_string()));

        if self.runtime_secs == 0 {
            return bad("runtime_secs must be > 0");
        }
        if self.cache.capacity == 0 {
            return bad("cache.capacity must be > 0");
        }
        if self.chain.runs == 0 {
            return bad("chain.runs must be >= 1");
        }
        if self.lhs.samples == 0 {
            return bad("lhs.samples must be >= 1");
        }
        let a = &self.annealing;
        if !(a.cooling > 0.0 && a.cooling < 1.0) {
            return bad("annealing.cooling must be in (0, 1)");
        }
        if !(a.initial_temperature > a.min_temperature && a.min_temperature > 0.0) {
            return bad("annealing temperatures must satisfy 0 < min < initial");
        }
        let g = &self.genetic;
        if g.population < 2 {
            return bad("genetic.population must be >= 2");
        }
        if g.elite >= g.population {
            return bad("genetic.elite must be smaller than the population");
        }
        if g.tournament == 0 {
            return bad("genetic.tournament must be >= 1");
        }
        if !(0.0..=1.0).contains(&g.mutation_rate) {
            return bad("genetic.mutation_rate must be in [0, 1]");
        }
        if self.rate_limit.max_retries == 0 {
            return bad("rate_limit.max_retries must be >= 1");
        }
        let w = &self.scoring.win_rate;
        if w.medium_from > w.large_from {
            return bad("scoring.win_rate tier boundaries are inverted");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    pub mode: ScoringMode,
    pub min_tokens: MinTokenPolicy,
    /// Length of the backtest window the oracle evaluates.
    pub date_range_days: u32,
    pub win_rate: WinRateTiers,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            mode: ScoringMode::Composite,
            min_tokens: MinTokenPolicy::default(),
            date_range_days: 7,
            win_rate: WinRateTiers::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseToggles {
    pub lhs: bool,
    pub correlated: bool,
    pub annealing: bool,
    pub genetic: bool,
    pub deep_dive: bool,
    /// Optional phases are skipped when less than this much time remains.
    pub min_phase_secs: u64,
}

impl Default for PhaseToggles {
    fn default() -> Self {
        Self {
            lhs: true,
            correlated: true,
            annealing: true,
            genetic: true,
            deep_dive: true,
            min_phase_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub delay_between_requests_ms: u64,
    /// Proactively wait for the reset once `remaining` drops to this.
    pub low_quota_threshold: u32,
    /// Resets further away than this are not waited for proactively.
    pub max_proactive_wait_secs: u64,
    pub reset_margin_secs: u64,
    /// Floor for the wait after a hard rate-limit response.
    pub fixed_backoff_secs: u64,
    pub max_retries: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            delay_between_requests_ms: 1_500,
            low_quota_threshold: 5,
            max_proactive_wait_secs: 300,
            reset_margin_secs: 2,
            fixed_backoff_secs: 300,
            max_retries: 5,
        }
    }
}

impl RateLimitSettings {
    pub fn delay_between_requests(&self) -> Duration {
        Duration::from_millis(self.delay_between_requests_ms)
    }

    pub fn fixed_backoff(&self) -> Duration {
        Duration::from_secs(self.fixed_backoff_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub capacity: usize,
    /// SQLite file the cache is persisted to between sessions.
    pub path: Option<PathBuf>,
    pub max_age_hours: i64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            path: None,
            max_age_hours: 24,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    pub runs: usize,
    /// Time slice of each chained run. When unset, each run gets the remaining
    /// chain budget divided by the number of runs still to go.
    pub run_secs: Option<u64>,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            runs: 1,
            run_secs: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LhsSettings {
    pub samples: usize,
    /// Parameters stratified per sample, most effective first.
    pub max_params: usize,
}

impl Default for LhsSettings {
    fn default() -> Self {
        Self {
            samples: 10,
            max_params: 6,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnealingSettings {
    pub initial_temperature: f64,
    pub cooling: f64,
    pub min_temperature: f64,
    pub max_iterations: usize,
    /// Largest perturbation as a fraction of a parameter's range, at full temperature.
    pub step_scale: f64,
}

impl Default for AnnealingSettings {
    fn default() -> Self {
        Self {
            initial_temperature: 10.0,
            cooling: 0.85,
            min_temperature: 0.5,
            max_iterations: 30,
            step_scale: 0.2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneticSettings {
    pub population: usize,
    pub generations: usize,
    pub elite: usize,
    pub tournament: usize,
    pub mutation_rate: f64,
}

impl Default for GeneticSettings {
    fn default() -> Self {
        Self {
            population: 8,
            generations: 4,
            elite: 2,
            tournament: 3,
            mutation_rate: 0.15,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepDiveSettings {
    pub top_k: usize,
    /// Fine values tried on each side of the current value.
    pub points: usize,
}

impl Default for DeepDiveSettings {
    fn default() -> Self {
        Self { top_k: 3, points: 2 }
    }
}
