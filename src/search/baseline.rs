use tracing::{info, warn};

use super::{BestState, Evaluation, SearchContext};
use crate::error::{OptimizerError, Result};
use crate::params::Configuration;
use crate::scoring::Rejection;

pub const LABEL: &str = "Baseline";

/// Scores the starting configuration and anchors the run to it. A baseline
/// that cannot be scored, or that lacks enough samples, leaves nothing to
/// optimize against and fails the run.
pub async fn run(ctx: &mut SearchContext<'_>, seed: Option<Configuration>) -> Result<()> {
    let cfg = seed.unwrap_or_else(|| ctx.space.default_configuration());
    if let Err(v) = ctx.space.validate(&cfg) {
        return Err(OptimizerError::InvalidBaseline(v.to_string()));
    }

    let result = match ctx.evaluate(cfg, LABEL).await? {
        Evaluation::Scored { result, .. } => result,
        Evaluation::Failed(msg) => return Err(OptimizerError::BaselineFailed(msg)),
        Evaluation::Invalid => {
            return Err(OptimizerError::InvalidBaseline("rejected by the parameter space".to_string()));
        }
    };

    if let Some(r @ Rejection::InsufficientTokens { .. }) = &result.rejection {
        return Err(OptimizerError::BaselineRejected(r.to_string()));
    }
    if let Some(r) = &result.rejection {
        warn!(reason = %r, "baseline misses the win-rate floor; any validated candidate will replace it");
    }

    ctx.anchor(&result, LABEL);
    info!(
        score = format!("{:.2}", result.score),
        tokens = result.metrics.token_count,
        "baseline established"
    );
    Ok(())
}

/// Anchors the run to a best found earlier in the chain. The configuration
/// is not scored again, so backend noise cannot lower or reject the anchor.
pub fn carry(ctx: &mut SearchContext<'_>, best: BestState) {
    info!(
        score = format!("{:.2}", best.score),
        source = %best.source,
        "continuing from carried best"
    );
    ctx.adopt(best);
}
