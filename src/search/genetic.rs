use std::cmp::Ordering;
use std::collections::BTreeSet;

use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use tracing::debug;

use super::SearchContext;
use crate::error::Result;
use crate::params::{Configuration, ParameterSpace};

/// Mutation moves span this fraction of a parameter's range.
const MUTATION_SCALE: f64 = 0.2;

pub fn label(generation: usize) -> String {
    format!("Genetic gen {generation}")
}

#[derive(Clone, Debug)]
struct Individual {
    config: Configuration,
    /// `None` for rejected, failed or invalid candidates.
    fitness: Option<f64>,
    evaluated: bool,
}

impl Individual {
    fn fresh(config: Configuration) -> Self {
        Self {
            config,
            fitness: None,
            evaluated: false,
        }
    }
}

fn by_fitness_desc(a: &Individual, b: &Individual) -> Ordering {
    match (a.fitness, b.fitness) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Child taking each section wholesale from one parent or the other, so
/// fields that only make sense together stay together.
pub fn crossover(a: &Configuration, b: &Configuration, rng: &mut StdRng) -> Configuration {
    let sections: BTreeSet<&String> = a.section_names().chain(b.section_names()).collect();
    let mut child = Configuration::new();
    for name in sections {
        let parent = if rng.random_bool(0.5) { a } else { b };
        child.set_section(name, parent.section(name).cloned());
    }
    child
}

/// Perturbs each parameter with probability `rate`; when nothing was picked
/// and `force` is set, one random parameter is perturbed instead. Returns
/// whether the configuration changed.
pub fn mutate(space: &ParameterSpace, cfg: &mut Configuration, rate: f64, force: bool, rng: &mut StdRng) -> bool {
    let rate = rate.clamp(0.0, 1.0);
    let mut changed = false;
    for rule in space.rules() {
        if !rng.random_bool(rate) {
            continue;
        }
        if let Some(v) = rule.perturb(rule.read(cfg), MUTATION_SCALE, rng) {
            rule.write(cfg, Some(v));
            changed = true;
        }
    }
    if !changed && force {
        if let Some(rule) = space.rules().choose(rng) {
            if let Some(v) = rule.perturb(rule.read(cfg), MUTATION_SCALE, rng) {
                rule.write(cfg, Some(v));
                changed = true;
            }
        }
    }
    changed
}

fn tournament<'p>(pop: &'p [Individual], size: usize, rng: &mut StdRng) -> &'p Individual {
    let mut winner = &pop[rng.random_range(0..pop.len())];
    for _ in 1..size.max(1) {
        let c = &pop[rng.random_range(0..pop.len())];
        if by_fitness_desc(c, winner) == Ordering::Less {
            winner = c;
        }
    }
    winner
}

/// Evolves a population seeded from the current best. Survivors carry their
/// fitness forward, so each generation only evaluates new children.
pub async fn run(ctx: &mut SearchContext<'_>) -> Result<()> {
    let s = ctx.settings.genetic.clone();
    let space = ctx.space;
    let size = s.population.max(2);
    let elite = s.elite.min(size - 1);

    let best = ctx.best_config();
    let mut pop = vec![Individual {
        config: best.clone(),
        fitness: ctx.best().filter(|b| b.validated).map(|b| b.score),
        evaluated: ctx.best().is_some(),
    }];
    while pop.len() < size {
        let mut cfg = best.clone();
        mutate(space, &mut cfg, s.mutation_rate, true, &mut ctx.rng);
        pop.push(Individual::fresh(cfg));
    }

    for generation in 1..=s.generations {
        let tag = label(generation);
        for ind in pop.iter_mut().filter(|i| !i.evaluated) {
            let eval = ctx.evaluate(ind.config.clone(), &tag).await?;
            ind.fitness = eval.fitness();
            ind.evaluated = true;
        }
        pop.sort_by(by_fitness_desc);
        debug!(
            generation,
            leader = pop[0].fitness.map(|f| format!("{f:.2}")).unwrap_or_default(),
            "generation evaluated"
        );
        if generation == s.generations {
            break;
        }

        let mut next: Vec<Individual> = pop.iter().take(elite).cloned().collect();
        while next.len() < size {
            let a = tournament(&pop, s.tournament, &mut ctx.rng);
            let b = tournament(&pop, s.tournament, &mut ctx.rng);
            let mut child = crossover(&a.config, &b.config, &mut ctx.rng);
            mutate(space, &mut child, s.mutation_rate, false, &mut ctx.rng);
            next.push(Individual::fresh(child));
        }
        pop = next;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParameterRule;
    use crate::search::{baseline, testing::*};
    use rand::SeedableRng;
    use serde_json::json;

    fn space() -> ParameterSpace {
        ParameterSpace::new(
            vec![
                ParameterRule::integer("Wallets", "Min Holders", 0, 50, 1).with_default(10),
                ParameterRule::number("Risk", "Max Vol MCAP %", 0.0, 300.0, 10.0).with_default(100.0),
                ParameterRule::integer("Advanced", "Min TTC (sec)", 0, 3_600, 10).with_default(60),
            ],
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn crossover_keeps_sections_whole() {
        let mut a = Configuration::new();
        a.set("Wallets", "Min Holders", json!(1));
        a.set("Wallets", "Max Holders", json!(2));
        a.set("Risk", "Max Vol MCAP %", json!(10.0));
        let mut b = Configuration::new();
        b.set("Wallets", "Min Holders", json!(30));
        b.set("Wallets", "Max Holders", json!(40));
        b.set("Advanced", "Min TTC (sec)", json!(120));

        let mut rng = StdRng::seed_from_u64(11);
        let mut saw_mix = false;
        for _ in 0..32 {
            let child = crossover(&a, &b, &mut rng);
            for name in ["Wallets", "Risk", "Advanced"] {
                let got = child.section(name);
                assert!(got == a.section(name) || got == b.section(name), "section {name} was split");
            }
            if child != a && child != b {
                saw_mix = true;
            }
        }
        assert!(saw_mix);
    }

    #[test]
    fn full_rate_mutation_moves_every_parameter() {
        let space = space();
        let base = space.default_configuration();
        let mut cfg = base.clone();
        let mut rng = StdRng::seed_from_u64(5);
        assert!(mutate(&space, &mut cfg, 1.0, false, &mut rng));
        for rule in space.rules() {
            let v = rule.read(&cfg).unwrap();
            assert!(rule.in_domain(v));
            assert_ne!(Some(v), rule.read(&base), "{} unchanged", rule.name);
        }
    }

    #[test]
    fn forced_mutation_changes_something() {
        let space = space();
        let base = space.default_configuration();
        let mut cfg = base.clone();
        let mut rng = StdRng::seed_from_u64(5);
        assert!(mutate(&space, &mut cfg, 0.0, true, &mut rng));
        assert_ne!(cfg, base);
    }

    #[tokio::test]
    async fn survivors_are_not_reevaluated() {
        let oracle = FnOracle::new(|c: &Configuration| {
            let h = c.get("Wallets", "Min Holders").and_then(|v| v.as_f64()).unwrap_or(0.0);
            success(400, 20.0 + h, 50.0)
        });
        let mut settings = quick_settings();
        settings.genetic.population = 4;
        settings.genetic.generations = 2;
        settings.genetic.elite = 2;
        let mut h = Harness::new(space(), settings, oracle);
        let mut ctx = h.ctx();
        baseline::run(&mut ctx, None).await.unwrap();
        let start = ctx.best_score();

        run(&mut ctx).await.unwrap();
        let gen1 = ctx.history().iter().filter(|r| r.phase == label(1)).count();
        let gen2 = ctx.history().iter().filter(|r| r.phase == label(2)).count();
        assert_eq!(gen1, 3);
        assert_eq!(gen2, 2);
        assert!(ctx.best_score() >= start);
    }
}
