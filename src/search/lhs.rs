use rand::Rng;
use rand::seq::SliceRandom;

use super::SearchContext;
use crate::error::Result;
use crate::params::ParameterRule;

/// `samples` points in the unit cube of `dims` dimensions. Each dimension is
/// cut into `samples` equal strata, every stratum holds exactly one point at
/// a random offset, and the strata are shuffled independently per dimension.
/// Indexed as `[sample][dim]`.
pub fn latin_hypercube<R: Rng + ?Sized>(samples: usize, dims: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut out = vec![vec![0.0; dims]; samples];
    if samples == 0 {
        return out;
    }
    for d in 0..dims {
        let mut column: Vec<f64> = (0..samples)
            .map(|k| (k as f64 + rng.random::<f64>()) / samples as f64)
            .collect();
        column.shuffle(rng);
        for (row, v) in out.iter_mut().zip(column) {
            row[d] = v;
        }
    }
    out
}

/// Most effective parameters first, then the rest in table order.
fn select_parameters<'s>(ctx: &SearchContext<'s>, max: usize) -> Vec<&'s ParameterRule> {
    let space = ctx.space;
    let mut chosen: Vec<&ParameterRule> = ctx
        .ranked_parameters()
        .iter()
        .filter_map(|(name, _)| space.rule(name))
        .collect();
    for r in space.rules() {
        if chosen.len() >= max {
            break;
        }
        if !chosen.iter().any(|c| c.name == r.name) {
            chosen.push(r);
        }
    }
    chosen.truncate(max);
    chosen
}

/// Stratified exploration of the most promising parameters around the current best.
pub async fn run(ctx: &mut SearchContext<'_>) -> Result<()> {
    let n = ctx.settings.lhs.samples;
    let params = select_parameters(ctx, ctx.settings.lhs.max_params.max(1));
    if params.is_empty() {
        return Ok(());
    }

    let points = latin_hypercube(n, params.len(), &mut ctx.rng);
    let base = ctx.best_config();
    for (i, point) in points.iter().enumerate() {
        let mut cand = base.clone();
        for (rule, frac) in params.iter().zip(point) {
            rule.write(&mut cand, rule.value_at_fraction(*frac));
        }
        ctx.evaluate(cand, &format!("LHS {}/{}", i + 1, n)).await?;
    }
    Ok(())
}
