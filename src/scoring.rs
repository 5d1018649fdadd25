//! Turning raw oracle metrics into a comparable fitness value.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{OptimizerError, Result};
use crate::params::Configuration;
use crate::settings::RunSettings;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub token_count: u64,
    pub pnl_percent: f64,
    pub win_rate: f64,
    /// Win rate net of tokens that never produced a tradable entry, when the backend reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_win_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

const TOKEN_KEYS: &[&str] = &["tokenCount", "token_count", "totalTokens", "tokens"];
const PNL_KEYS: &[&str] = &["pnlPercent", "pnl_percent", "tpPnlPercent", "pnl"];
const WIN_RATE_KEYS: &[&str] = &["winRate", "win_rate"];
const REAL_WIN_RATE_KEYS: &[&str] = &["realWinRate", "real_win_rate"];

impl Metrics {
    pub fn new(token_count: u64, pnl_percent: f64, win_rate: f64) -> Self {
        Self {
            token_count,
            pnl_percent,
            win_rate,
            real_win_rate: None,
            extra: Map::new(),
        }
    }

    pub fn with_real_win_rate(mut self, v: f64) -> Self {
        self.real_win_rate = Some(v);
        self
    }

    pub fn realized_win_rate(&self) -> f64 {
        self.real_win_rate.unwrap_or(self.win_rate)
    }

    /// Validates a backend response body. Field names may be camelCase or
    /// snake_case; percentages may arrive as strings like `"41.5%"`.
    pub fn from_oracle_json(v: &Value) -> Result<Self> {
        let Some(obj) = v.as_object() else {
            return Err(OptimizerError::InvalidMetrics("response is not an object".to_string()));
        };

        let tokens = lookup(obj, TOKEN_KEYS)
            .ok_or_else(|| OptimizerError::InvalidMetrics("missing token count".to_string()))?;
        if tokens < 0.0 || tokens.fract() != 0.0 {
            return Err(OptimizerError::InvalidMetrics(format!("bad token count {tokens}")));
        }
        let pnl = lookup(obj, PNL_KEYS)
            .ok_or_else(|| OptimizerError::InvalidMetrics("missing pnl percent".to_string()))?;
        let win_rate = lookup(obj, WIN_RATE_KEYS)
            .ok_or_else(|| OptimizerError::InvalidMetrics("missing win rate".to_string()))?;
        let real_win_rate = lookup(obj, REAL_WIN_RATE_KEYS);

        for wr in std::iter::once(win_rate).chain(real_win_rate) {
            if !(0.0..=100.0).contains(&wr) {
                return Err(OptimizerError::InvalidMetrics(format!("win rate {wr} outside 0..=100")));
            }
        }

        let known: Vec<&str> = [TOKEN_KEYS, PNL_KEYS, WIN_RATE_KEYS, REAL_WIN_RATE_KEYS].concat();
        let extra = obj
            .iter()
            .filter(|(k, _)| !known.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            token_count: tokens as u64,
            pnl_percent: pnl,
            win_rate,
            real_win_rate,
            extra,
        })
    }
}

fn lookup(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(|v| match v {
        Value::Number(n) => n.as_f64().filter(|x| x.is_finite()),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok().filter(|x| x.is_finite()),
        _ => None,
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    PnlOnly,
    WinRateOnly,
    /// PnL percent weighted by the realized win rate.
    #[default]
    Composite,
}

impl ScoringMode {
    pub fn fitness(self, m: &Metrics) -> f64 {
        match self {
            Self::PnlOnly => m.pnl_percent,
            Self::WinRateOnly => m.realized_win_rate(),
            Self::Composite => m.pnl_percent * (m.realized_win_rate() / 100.0),
        }
    }
}

/// Minimum sample count, scaled by the length of the backtest window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinTokenPolicy {
    pub floor: u64,
    pub per_day: f64,
}

impl Default for MinTokenPolicy {
    fn default() -> Self {
        Self {
            floor: 50,
            per_day: 10.0,
        }
    }
}

impl MinTokenPolicy {
    pub fn for_days(&self, days: u32) -> u64 {
        let scaled = (days as f64 * self.per_day).ceil().max(0.0) as u64;
        scaled.max(self.floor)
    }
}

/// Win-rate floors by sample size: small samples must clear the highest bar.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WinRateTiers {
    pub small: f64,
    pub medium: f64,
    pub large: f64,
    pub medium_from: u64,
    pub large_from: u64,
}

impl Default for WinRateTiers {
    fn default() -> Self {
        Self {
            small: 35.0,
            medium: 33.0,
            large: 30.0,
            medium_from: 500,
            large_from: 1_000,
        }
    }
}

impl WinRateTiers {
    pub fn floor_for(&self, token_count: u64) -> f64 {
        if token_count >= self.large_from {
            self.large
        } else if token_count >= self.medium_from {
            self.medium
        } else {
            self.small
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    InsufficientTokens { got: u64, required: u64 },
    LowWinRate { got: f64, required: f64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientTokens { got, required } => {
                write!(f, "{got} tokens, need at least {required}")
            }
            Self::LowWinRate { got, required } => {
                write!(f, "win rate {got:.1}% below {required:.1}%")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredResult {
    pub configuration: Configuration,
    pub metrics: Metrics,
    pub score: f64,
    pub rejected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

impl ScoredResult {
    /// The score, if this result may compete for best.
    pub fn fitness(&self) -> Option<f64> {
        if self.rejected { None } else { Some(self.score) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scorer {
    pub mode: ScoringMode,
    pub min_tokens: u64,
    pub win_rate: WinRateTiers,
}

impl Scorer {
    pub fn new(mode: ScoringMode, min_tokens: u64, win_rate: WinRateTiers) -> Self {
        Self {
            mode,
            min_tokens,
            win_rate,
        }
    }

    pub fn from_settings(s: &RunSettings) -> Self {
        Self::new(s.scoring.mode, s.min_tokens(), s.scoring.win_rate)
    }

    pub fn check(&self, m: &Metrics) -> Option<Rejection> {
        if m.token_count < self.min_tokens {
            return Some(Rejection::InsufficientTokens {
                got: m.token_count,
                required: self.min_tokens,
            });
        }
        let required = self.win_rate.floor_for(m.token_count);
        let got = m.realized_win_rate();
        if got < required {
            return Some(Rejection::LowWinRate { got, required });
        }
        None
    }

    pub fn score(&self, configuration: Configuration, metrics: Metrics) -> ScoredResult {
        let rejection = self.check(&metrics);
        let score = self.mode.fitness(&metrics);
        if let Some(r) = &rejection {
            debug!(reason = %r, score, "candidate rejected");
        }
        ScoredResult {
            configuration,
            score,
            rejected: rejection.is_some(),
            rejection,
            metrics,
        }
    }
}
