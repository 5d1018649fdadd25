use tracing::info;

use super::SearchContext;
use crate::error::Result;

pub fn label(name: &str) -> String {
    format!("Deep Dive: {name}")
}

/// Fine-grained refinement of the parameters that have paid off so far.
/// Parameters without a positive recorded gain are left alone.
pub async fn run(ctx: &mut SearchContext<'_>) -> Result<()> {
    let top_k = ctx.settings.deep_dive.top_k;
    let points = ctx.settings.deep_dive.points.max(1);
    let space = ctx.space;

    let ranked = ctx.ranked_parameters();
    for (name, _) in ranked.into_iter().take(top_k) {
        let Some(rule) = space.rule(&name) else {
            continue;
        };
        let before = ctx.best_score();
        let current = rule.read(&ctx.best_config()).cloned();
        let tag = label(&name);
        for v in rule.fine_values(current.as_ref(), points) {
            let mut cand = ctx.best_config();
            rule.write(&mut cand, Some(v));
            ctx.evaluate(cand, &tag).await?;
        }
        let gain = ctx.best_score() - before;
        ctx.record_effectiveness(&name, gain);
        if gain > 0.0 {
            info!(parameter = %name, gain = format!("{gain:.2}"), "deep dive refined parameter");
        }
    }
    Ok(())
}
