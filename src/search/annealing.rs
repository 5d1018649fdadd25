use rand::Rng;
use rand::seq::IndexedRandom;
use tracing::debug;

use super::SearchContext;
use crate::error::Result;

pub const LABEL: &str = "Simulated Annealing";

/// Metropolis criterion: non-worsening moves are always taken, worse ones
/// with probability `exp(delta / temperature)`.
pub fn acceptance_probability(delta: f64, temperature: f64) -> f64 {
    if delta >= 0.0 {
        1.0
    } else if temperature <= 0.0 {
        0.0
    } else {
        (delta / temperature).exp()
    }
}

/// Random single-parameter walk from the current best. The working point may
/// move to a worse configuration; only strict improvements reach the best.
pub async fn run(ctx: &mut SearchContext<'_>) -> Result<()> {
    let s = ctx.settings.annealing.clone();
    let space = ctx.space;
    let rules = space.rules();
    if rules.is_empty() {
        return Ok(());
    }

    let mut working = ctx.best_config();
    let mut working_score = ctx.best_score();
    let mut temperature = s.initial_temperature;

    for _ in 0..s.max_iterations {
        if temperature < s.min_temperature {
            break;
        }
        let Some(rule) = rules.choose(&mut ctx.rng) else {
            break;
        };
        let scale = s.step_scale * (temperature / s.initial_temperature);
        let next = rule.perturb(rule.read(&working), scale, &mut ctx.rng);

        if let Some(v) = next {
            let mut cand = working.clone();
            rule.write(&mut cand, Some(v));
            let eval = ctx.evaluate(cand.clone(), LABEL).await?;
            if let Some(score) = eval.fitness() {
                let p = acceptance_probability(score - working_score, temperature);
                if p >= 1.0 || ctx.rng.random::<f64>() < p {
                    working = cand;
                    working_score = score;
                }
            }
        }

        temperature *= s.cooling;
    }

    debug!(temperature, working_score, "annealing finished");
    Ok(())
}
