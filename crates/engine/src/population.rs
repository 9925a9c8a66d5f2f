//! Population management: dynamic elimination threshold, elite selection and
//! reproduction planning.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::fitness::FitnessEvaluator;
use crate::types::{
    EvolutionEvent, EvolutionEventType, LifecycleStage, StatsSnapshot, StrategyRecord,
};

/// Strategies older than this many rounds are held to a higher bar
const AGE_LIMIT_ROUNDS: u32 = 30;
const AGE_MIN_FITNESS: f64 = 45.0;

#[derive(Debug, Clone)]
pub struct PopulationPolicy {
    pub min_population: usize,
    pub max_population: usize,
    /// Share of new children that are random spawns
    pub exploration_ratio: f64,
    /// A parent is not reused within this window
    pub parent_cooldown: chrono::Duration,
}

impl Default for PopulationPolicy {
    fn default() -> Self {
        Self {
            min_population: 6,
            max_population: 30,
            exploration_ratio: 0.2,
            parent_cooldown: chrono::Duration::hours(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub threshold: f64,
    /// Surviving evaluated strategies, best first
    pub survivors: Vec<StrategyRecord>,
    /// Ids of the top survivors eligible as parents
    pub elites: Vec<String>,
    pub eliminated: Vec<StrategyRecord>,
    /// Candidates not yet evaluated, passed through untouched
    pub pending: Vec<StrategyRecord>,
    pub events: Vec<EvolutionEvent>,
}

/// How many children to create this cycle and from whom
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReproductionPlan {
    pub mutations: Vec<String>,
    pub crossovers: Vec<(String, String)>,
    /// Random spawns, backfill included
    pub spawns: usize,
    /// Spawns forced by the population falling under its minimum
    pub backfill: usize,
}

impl ReproductionPlan {
    pub fn total(&self) -> usize {
        self.mutations.len() + self.crossovers.len() + self.spawns
    }
}

pub struct PopulationManager {
    evaluator: FitnessEvaluator,
    policy: PopulationPolicy,
    /// Last scored stats per strategy id
    memo: HashMap<String, (StatsSnapshot, f64)>,
}

impl PopulationManager {
    pub fn new(evaluator: FitnessEvaluator, policy: PopulationPolicy) -> Self {
        Self {
            evaluator,
            policy,
            memo: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &PopulationPolicy {
        &self.policy
    }

    pub fn evaluator(&self) -> &FitnessEvaluator {
        &self.evaluator
    }

    /// Fitness for `stats`, reusing the memo when the stats have not changed
    pub fn fitness_for(&mut self, id: &str, stats: &StatsSnapshot) -> f64 {
        if let Some((cached, fitness)) = self.memo.get(id) {
            if cached == stats {
                return *fitness;
            }
        }
        let fitness = self.evaluator.score(stats);
        self.memo.insert(id.to_string(), (*stats, fitness));
        fitness
    }

    pub fn cached_fitness(&self, id: &str) -> Option<f64> {
        self.memo.get(id).map(|(_, f)| *f)
    }

    /// Score, threshold and split the population. Survivors advance one round.
    ///
    /// Candidates have no stats yet: they pass through in `pending`, are
    /// never eliminated and do not count toward the survivor floor. The floor
    /// guarantees `min(min_population, evaluated)` survivors, where
    /// `evaluated` is the number of non-candidate live strategies.
    pub fn run_elimination_and_selection(
        &mut self,
        population: Vec<StrategyRecord>,
        now: DateTime<Utc>,
    ) -> SelectionOutcome {
        let (pending, mut evaluated): (Vec<_>, Vec<_>) = population
            .into_iter()
            .filter(|r| !r.is_eliminated())
            .partition(|r| r.stage == LifecycleStage::Candidate);

        for record in evaluated.iter_mut() {
            record.fitness = self.fitness_for(&record.id, &record.stats);
        }
        sort_by_fitness(&mut evaluated);

        let fitnesses: Vec<f64> = evaluated.iter().map(|r| r.fitness).collect();
        let threshold = elimination_threshold(&fitnesses);

        let mut survivors = Vec::new();
        let mut doomed: Vec<(StrategyRecord, String)> = Vec::new();
        for record in evaluated {
            match elimination_reason(&record, threshold) {
                Some(reason) => doomed.push((record, reason)),
                None => survivors.push(record),
            }
        }

        // Hard floor: rescue the best of the doomed (already sorted best first)
        let floor = self.policy.min_population.min(survivors.len() + doomed.len());
        let mut rescued = Vec::new();
        while survivors.len() + rescued.len() < floor && !doomed.is_empty() {
            let (record, reason) = doomed.remove(0);
            rescued.push((record, reason));
        }

        let mut events = Vec::new();

        let mut eliminated = Vec::with_capacity(doomed.len());
        for (mut record, reason) in doomed {
            debug!(strategy = %record.id, fitness = record.fitness, %reason, "Eliminating strategy");
            record.transition(LifecycleStage::Eliminated, now);
            self.memo.remove(&record.id);
            events.push(
                EvolutionEvent::new(&record.id, EvolutionEventType::Eliminate, reason)
                    .with_fitness(Some(record.fitness), Some(record.fitness)),
            );
            eliminated.push(record);
        }

        for record in survivors.iter() {
            events.push(
                EvolutionEvent::new(
                    &record.id,
                    EvolutionEventType::Survive,
                    format!("Fitness {:.1} passed threshold {:.0}", record.fitness, threshold),
                )
                .with_fitness(Some(record.fitness), Some(record.fitness)),
            );
        }
        for (record, reason) in rescued {
            events.push(
                EvolutionEvent::new(
                    &record.id,
                    EvolutionEventType::Survive,
                    format!("Kept by survivor floor of {floor} ({reason})"),
                )
                .with_fitness(Some(record.fitness), Some(record.fitness)),
            );
            survivors.push(record);
        }
        sort_by_fitness(&mut survivors);

        for record in survivors.iter_mut() {
            record.round += 1;
            record.updated_at = now;
        }

        let elite_count = survivors.len().div_ceil(3).max(3).min(survivors.len());
        let elites: Vec<String> = survivors.iter().take(elite_count).map(|r| r.id.clone()).collect();

        info!(
            threshold,
            survivors = survivors.len(),
            eliminated = eliminated.len(),
            elites = elites.len(),
            pending = pending.len(),
            "Selection complete"
        );

        SelectionOutcome {
            threshold,
            survivors,
            elites,
            eliminated,
            pending,
            events,
        }
    }

    /// Decide how many children to create and which elites parent them.
    /// `occupied` is the number of live records that will remain (survivors
    /// plus pending candidates).
    pub fn plan_reproduction(
        &self,
        survivors: &[StrategyRecord],
        elites: &[String],
        occupied: usize,
        now: DateTime<Utc>,
        rng: &mut impl Rng,
    ) -> ReproductionPlan {
        let capacity = self.policy.max_population.saturating_sub(occupied);
        let backfill = self.policy.min_population.saturating_sub(occupied);
        if capacity == 0 && backfill == 0 {
            return ReproductionPlan::default();
        }
        let children = capacity.max(backfill);

        let parents: Vec<&StrategyRecord> = elites
            .iter()
            .filter_map(|id| survivors.iter().find(|r| &r.id == id))
            .filter(|r| match r.last_evolved_at {
                Some(at) => now - at >= self.policy.parent_cooldown,
                None => true,
            })
            .collect();

        let exploration = (children as f64 * self.policy.exploration_ratio).round() as usize;
        let mut spawns = exploration.max(backfill).min(children);
        let mut bred = children - spawns;

        let mut plan = ReproductionPlan::default();
        match parents.len() {
            0 => {
                spawns += bred;
                bred = 0;
            }
            1 => {
                for _ in 0..bred {
                    plan.mutations.push(parents[0].id.clone());
                }
            }
            n => {
                let crossovers = bred / 2;
                let mutations = bred - crossovers;
                for i in 0..mutations {
                    plan.mutations.push(parents[i % n].id.clone());
                }
                for _ in 0..crossovers {
                    let a = rng.gen_range(0..n);
                    let mut b = rng.gen_range(0..n - 1);
                    if b >= a {
                        b += 1;
                    }
                    plan.crossovers.push((parents[a].id.clone(), parents[b].id.clone()));
                }
            }
        }
        plan.spawns = spawns;
        plan.backfill = backfill;

        debug!(
            capacity,
            backfill,
            parents = parents.len(),
            bred,
            spawns,
            "Reproduction planned"
        );
        plan
    }
}

/// Dynamic threshold that ratchets up as the population improves
pub fn elimination_threshold(fitnesses: &[f64]) -> f64 {
    let strong = fitnesses.iter().filter(|f| **f >= 80.0).count();
    let qualified = fitnesses.iter().filter(|f| **f >= 60.0).count();
    if strong >= 5 {
        75.0
    } else if qualified >= 10 {
        65.0
    } else if qualified >= 3 {
        50.0
    } else {
        40.0
    }
}

/// Why a strategy should be eliminated, if it should
pub fn elimination_reason(record: &StrategyRecord, threshold: f64) -> Option<String> {
    let fitness = record.fitness;
    let stats = &record.stats;
    if fitness < threshold {
        Some(format!("Fitness {fitness:.1} below threshold {threshold:.0}"))
    } else if fitness < 60.0 && stats.win_rate < 0.60 {
        Some(format!(
            "Fitness {fitness:.1} below 60 with win rate {:.1}%",
            stats.win_rate * 100.0
        ))
    } else if fitness < 70.0 && stats.total_return < -0.03 {
        Some(format!(
            "Fitness {fitness:.1} below 70 with return {:.1}%",
            stats.total_return * 100.0
        ))
    } else if record.round > AGE_LIMIT_ROUNDS && fitness < AGE_MIN_FITNESS {
        Some(format!(
            "Aged out after {} rounds with fitness {fitness:.1}",
            record.round
        ))
    } else {
        None
    }
}

fn sort_by_fitness(records: &mut [StrategyRecord]) {
    records.sort_by(|a, b| {
        b.fitness
            .total_cmp(&a.fitness)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}
