use tracing::info;

use super::SearchContext;
use crate::error::Result;

pub fn label(group: &str) -> String {
    format!("Correlated: {group}")
}

/// Varies each correlated group jointly through its presets. Presets are
/// rebuilt from the best at the start of every group, so a gain found in
/// one group carries into the next.
pub async fn run(ctx: &mut SearchContext<'_>) -> Result<()> {
    let space = ctx.space;
    for group in space.groups() {
        let before = ctx.best_score();
        let tag = label(&group.name);
        for cand in space.group_presets(group, &ctx.best_config()) {
            ctx.evaluate(cand, &tag).await?;
        }
        let gain = ctx.best_score() - before;
        if gain > 0.0 {
            info!(group = %group.name, gain = format!("{gain:.2}"), "correlated group improved score");
            for member in &group.members {
                ctx.record_effectiveness(member, gain / group.members.len() as f64);
            }
        }
    }
    Ok(())
}
