use tracing::info;

use super::SearchContext;
use crate::error::Result;

pub fn label(name: &str) -> String {
    format!("Parameter: {name}")
}

/// Tries each parameter's test values one at a time against the current
/// best, keeping strict improvements, and records how much each parameter
/// improved the score for the phases that follow.
pub async fn run(ctx: &mut SearchContext<'_>) -> Result<()> {
    let space = ctx.space;
    for rule in space.rules() {
        let before = ctx.best_score();
        let current = rule.read(&ctx.best_config()).cloned();
        let values = rule.test_values(current.as_ref());
        let tag = label(&rule.name);

        for v in values {
            let mut cand = ctx.best_config();
            rule.write(&mut cand, Some(v));
            ctx.evaluate(cand, &tag).await?;
        }

        let gain = ctx.best_score() - before;
        ctx.record_effectiveness(&rule.name, gain);
        if gain > 0.0 {
            info!(parameter = %rule.name, gain = format!("{gain:.2}"), "parameter improved score");
        }
    }
    Ok(())
}
