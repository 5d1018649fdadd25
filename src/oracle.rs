//! Oracle invocation.
//!
//! [`RateLimitedOracle`] serializes calls to a scoring backend: it paces
//! consecutive calls, waits out a nearly exhausted quota before the hard limit
//! is hit, and transparently retries calls rejected with a rate-limit response.
//! Every wait observes the shared [`StopFlag`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{OptimizerError, Result};
use crate::params::Configuration;
use crate::scoring::Metrics;
use crate::settings::RateLimitSettings;
use crate::stop::StopFlag;

/// Quota advertised by the backend alongside a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OracleReply {
    Success { metrics: Metrics, quota: Option<Quota> },
    RateLimited { reset_epoch: Option<i64> },
    Failed(String),
}

/// A scoring backend. Implementations perform exactly one attempt per call.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn evaluate(&self, config: &Configuration) -> OracleReply;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum OracleState {
    Idle,
    ThrottleWait,
    Calling,
    Success,
    RateLimited,
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OracleStats {
    pub calls: u64,
    pub rate_limit_hits: u64,
    pub proactive_waits: u64,
    pub errors: u64,
}

pub struct RateLimitedOracle {
    inner: Arc<dyn Oracle>,
    settings: RateLimitSettings,
    last_call: Option<Instant>,
    state: OracleState,
    stats: OracleStats,
}

impl RateLimitedOracle {
    pub fn new(inner: Arc<dyn Oracle>, settings: RateLimitSettings) -> Self {
        Self {
            inner,
            settings,
            last_call: None,
            state: OracleState::Idle,
            stats: OracleStats::default(),
        }
    }

    pub fn state(&self) -> OracleState {
        self.state
    }

    pub fn stats(&self) -> OracleStats {
        self.stats
    }

    /// Scores `config`, retrying rate-limited attempts until the retry budget
    /// runs out. Other backend failures are returned without retry.
    pub async fn call(&mut self, config: &Configuration, stop: &StopFlag) -> Result<Metrics> {
        let mut limited = 0_u32;
        loop {
            self.transition(OracleState::Idle);
            if stop.is_stopped() {
                return Err(OptimizerError::Cancelled);
            }
            self.throttle(stop).await?;

            self.transition(OracleState::Calling);
            let reply = self.inner.evaluate(config).await;
            self.last_call = Some(Instant::now());
            self.stats.calls += 1;

            match reply {
                OracleReply::Success { metrics, quota } => {
                    self.transition(OracleState::Success);
                    if let Some(q) = quota {
                        self.respect_quota(q, stop).await?;
                    }
                    return Ok(metrics);
                }
                OracleReply::RateLimited { reset_epoch } => {
                    self.transition(OracleState::RateLimited);
                    self.stats.rate_limit_hits += 1;
                    limited += 1;
                    if limited > self.settings.max_retries {
                        return Err(OptimizerError::RateLimitExhausted { attempts: limited });
                    }
                    let wait = self.backoff_for(reset_epoch);
                    warn!(
                        attempt = limited,
                        wait_secs = wait.as_secs(),
                        "oracle rate limited, backing off"
                    );
                    if !stop.sleep(wait).await {
                        return Err(OptimizerError::Cancelled);
                    }
                }
                OracleReply::Failed(msg) => {
                    self.transition(OracleState::Error);
                    self.stats.errors += 1;
                    return Err(OptimizerError::Oracle(msg));
                }
            }
        }
    }

    async fn throttle(&mut self, stop: &StopFlag) -> Result<()> {
        let Some(last) = self.last_call else {
            return Ok(());
        };
        let delay = self.settings.delay_between_requests();
        let elapsed = last.elapsed();
        if elapsed >= delay {
            return Ok(());
        }
        self.transition(OracleState::ThrottleWait);
        if !stop.sleep(delay - elapsed).await {
            return Err(OptimizerError::Cancelled);
        }
        Ok(())
    }

    async fn respect_quota(&mut self, q: Quota, stop: &StopFlag) -> Result<()> {
        if q.remaining > self.settings.low_quota_threshold {
            return Ok(());
        }
        let until_reset = q.reset_epoch - Utc::now().timestamp();
        if until_reset < 0 || until_reset as u64 > self.settings.max_proactive_wait_secs {
            return Ok(());
        }
        let wait = Duration::from_secs(until_reset as u64 + self.settings.reset_margin_secs);
        info!(
            remaining = q.remaining,
            limit = q.limit,
            wait_secs = wait.as_secs(),
            "quota nearly exhausted, waiting for reset"
        );
        self.stats.proactive_waits += 1;
        self.transition(OracleState::ThrottleWait);
        if !stop.sleep(wait).await {
            return Err(OptimizerError::Cancelled);
        }
        Ok(())
    }

    fn backoff_for(&self, reset_epoch: Option<i64>) -> Duration {
        let fixed = self.settings.fixed_backoff();
        let Some(reset) = reset_epoch else {
            return fixed;
        };
        let until_reset = (reset - Utc::now().timestamp()).max(0) as u64;
        Duration::from_secs(until_reset + self.settings.reset_margin_secs).max(fixed)
    }

    fn transition(&mut self, next: OracleState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "oracle state");
            self.state = next;
        }
    }
}

/// Scores configurations by posting them to a remote backtest endpoint.
pub struct HttpOracle {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOracle {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OptimizerError::Oracle(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn evaluate(&self, config: &Configuration) -> OracleReply {
        let mut req = self.client.post(&self.endpoint).json(&json!({ "config": config }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => return OracleReply::Failed(format!("request failed: {e}")),
        };

        let quota = parse_quota(resp.headers());
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let reset_epoch = quota
                .map(|q| q.reset_epoch)
                .or_else(|| header_num(resp.headers(), "retry-after").map(|s| Utc::now().timestamp() + s));
            return OracleReply::RateLimited { reset_epoch };
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return OracleReply::Failed(format!("HTTP {status}: {text}"));
        }

        let body: Value = match resp.json().await {
            Ok(b) => b,
            Err(e) => return OracleReply::Failed(format!("unreadable response body: {e}")),
        };
        match Metrics::from_oracle_json(&body) {
            Ok(metrics) => OracleReply::Success { metrics, quota },
            Err(e) => OracleReply::Failed(e.to_string()),
        }
    }
}

/// Reads `x-ratelimit-*` headers. Small reset values are taken as seconds from now.
pub fn parse_quota(headers: &HeaderMap) -> Option<Quota> {
    let limit = header_num(headers, "x-ratelimit-limit")?;
    let remaining = header_num(headers, "x-ratelimit-remaining")?;
    let reset = header_num(headers, "x-ratelimit-reset")?;
    let reset_epoch = if reset < 1_000_000_000 {
        Utc::now().timestamp() + reset
    } else {
        reset
    };
    Some(Quota {
        limit: u32::try_from(limit).ok()?,
        remaining: u32::try_from(remaining).ok()?,
        reset_epoch,
    })
}

fn header_num(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .map(|v| v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<OracleReply>>,
    }

    impl Scripted {
        fn new(replies: Vec<OracleReply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
            })
        }
    }

    #[async_trait]
    impl Oracle for Scripted {
        async fn evaluate(&self, _config: &Configuration) -> OracleReply {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| OracleReply::Failed("script exhausted".into()))
        }
    }

    fn ok(quota: Option<Quota>) -> OracleReply {
        OracleReply::Success {
            metrics: Metrics::new(120, 25.0, 40.0),
            quota,
        }
    }

    fn settings() -> RateLimitSettings {
        RateLimitSettings {
            fixed_backoff_secs: 10,
            ..RateLimitSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_after_rate_limit_until_reset() {
        let reset = Utc::now().timestamp() + 30;
        let mut oracle = RateLimitedOracle::new(
            Scripted::new(vec![OracleReply::RateLimited { reset_epoch: Some(reset) }, ok(None)]),
            settings(),
        );
        let start = Instant::now();
        let m = oracle.call(&Configuration::new(), &StopFlag::new()).await.unwrap();
        assert_eq!(m.token_count, 120);
        assert!(start.elapsed() >= Duration::from_secs(30 + settings().reset_margin_secs - 1));
        assert_eq!(oracle.stats().rate_limit_hits, 1);
        assert_eq!(oracle.stats().calls, 2);
        assert_eq!(oracle.state(), OracleState::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_backoff_is_the_floor() {
        let mut oracle = RateLimitedOracle::new(
            Scripted::new(vec![OracleReply::RateLimited { reset_epoch: None }, ok(None)]),
            RateLimitSettings::default(),
        );
        let start = Instant::now();
        oracle.call(&Configuration::new(), &StopFlag::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_budget() {
        let replies = (0..10).map(|_| OracleReply::RateLimited { reset_epoch: None }).collect();
        let mut oracle = RateLimitedOracle::new(Scripted::new(replies), settings());
        let err = oracle.call(&Configuration::new(), &StopFlag::new()).await.unwrap_err();
        assert!(matches!(err, OptimizerError::RateLimitExhausted { attempts: 6 }));
        assert_eq!(oracle.stats().calls, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn paces_consecutive_calls() {
        let mut oracle = RateLimitedOracle::new(Scripted::new(vec![ok(None), ok(None)]), settings());
        let stop = StopFlag::new();
        oracle.call(&Configuration::new(), &stop).await.unwrap();
        let start = Instant::now();
        oracle.call(&Configuration::new(), &stop).await.unwrap();
        assert!(start.elapsed() >= settings().delay_between_requests());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_proactively_on_low_quota() {
        let quota = Quota {
            limit: 100,
            remaining: 3,
            reset_epoch: Utc::now().timestamp() + 60,
        };
        let mut oracle = RateLimitedOracle::new(Scripted::new(vec![ok(Some(quota))]), settings());
        let start = Instant::now();
        oracle.call(&Configuration::new(), &StopFlag::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(59));
        assert_eq!(oracle.stats().proactive_waits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_distant_reset() {
        let quota = Quota {
            limit: 100,
            remaining: 1,
            reset_epoch: Utc::now().timestamp() + 3_600,
        };
        let mut oracle = RateLimitedOracle::new(Scripted::new(vec![ok(Some(quota))]), settings());
        let start = Instant::now();
        oracle.call(&Configuration::new(), &StopFlag::new()).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(oracle.stats().proactive_waits, 0);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let mut oracle = RateLimitedOracle::new(
            Scripted::new(vec![OracleReply::Failed("HTTP 500".into()), ok(None)]),
            settings(),
        );
        let err = oracle.call(&Configuration::new(), &StopFlag::new()).await.unwrap_err();
        assert!(matches!(err, OptimizerError::Oracle(_)));
        assert_eq!(oracle.stats().calls, 1);
        assert_eq!(oracle.state(), OracleState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_backoff() {
        let mut oracle = RateLimitedOracle::new(
            Scripted::new(vec![OracleReply::RateLimited { reset_epoch: None }, ok(None)]),
            RateLimitSettings::default(),
        );
        let stop = StopFlag::new();
        let remote = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            remote.stop();
        });
        let start = Instant::now();
        let err = oracle.call(&Configuration::new(), &stop).await.unwrap_err();
        assert!(matches!(err, OptimizerError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn parses_quota_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("100"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1900000000"));
        assert_eq!(
            parse_quota(&headers),
            Some(Quota {
                limit: 100,
                remaining: 4,
                reset_epoch: 1_900_000_000,
            })
        );
        headers.remove("x-ratelimit-remaining");
        assert_eq!(parse_quota(&headers), None);
    }
}
