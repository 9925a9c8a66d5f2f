//! Reproduction operators: mutation, crossover and random spawn
//!
//! Every child is a fresh `Candidate` record carrying id snapshots of its
//! parents. Children that fail range validation are rejected here and never
//! reach the population.

use rand::seq::SliceRandom;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::archetypes::{ArchetypeRegistry, ParamSpec, ParameterError};
use crate::types::{
    ArchetypeKind, EvolutionEvent, EvolutionEventType, Parameters, StrategyRecord,
};

/// Chance that a weak parent's child switches to another archetype
const ARCHETYPE_REROLL_PROBABILITY: f64 = 0.3;
/// Parents below this fitness may have their archetype re-rolled
const ARCHETYPE_REROLL_BELOW: f64 = 70.0;
/// Fitness gap under which continuous parameters are averaged in crossover
const AVERAGING_GAP: f64 = 10.0;

#[derive(Debug, Error, PartialEq)]
pub enum ReproductionError {
    #[error("Unknown archetype: {0}")]
    UnknownArchetype(String),

    #[error("Parameter {name} = {value} outside [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Unexpected parameter: {0}")]
    UnexpectedParameter(String),

    #[error("No spawn templates available")]
    NoTemplates,
}

impl From<ParameterError> for ReproductionError {
    fn from(err: ParameterError) -> Self {
        match err {
            ParameterError::UnknownArchetype(kind) => ReproductionError::UnknownArchetype(kind),
            ParameterError::Missing(name) => ReproductionError::MissingParameter(name),
            ParameterError::Unexpected(name) => ReproductionError::UnexpectedParameter(name),
            ParameterError::OutOfRange {
                name,
                value,
                min,
                max,
            } => ReproductionError::OutOfRange {
                name,
                value,
                min,
                max,
            },
        }
    }
}

/// A new candidate and the audit event describing how it was made
#[derive(Debug, Clone)]
pub struct Offspring {
    pub record: StrategyRecord,
    pub event: EvolutionEvent,
}

/// What random spawns may be built from
#[derive(Debug, Clone)]
pub struct SpawnTemplates {
    pub archetypes: Vec<ArchetypeKind>,
    pub symbols: Vec<String>,
}

pub struct ReproductionOperators {
    registry: Arc<ArchetypeRegistry>,
}

impl ReproductionOperators {
    pub fn new(registry: Arc<ArchetypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ArchetypeRegistry {
        &self.registry
    }

    /// Jittered copy of `parent`. The jitter narrows as fitness rises; weak
    /// parents may switch archetype entirely.
    pub fn mutate(
        &self,
        parent: &StrategyRecord,
        rng: &mut impl Rng,
    ) -> Result<Offspring, ReproductionError> {
        let kinds = self.registry.kinds();
        let reroll = parent.fitness < ARCHETYPE_REROLL_BELOW
            && kinds.len() > 1
            && rng.gen_bool(ARCHETYPE_REROLL_PROBABILITY);

        let (kind, parameters, reason) = if reroll {
            let others: Vec<ArchetypeKind> =
                kinds.into_iter().filter(|k| *k != parent.archetype).collect();
            let kind = *others
                .choose(rng)
                .ok_or_else(|| ReproductionError::UnknownArchetype(parent.archetype.as_str().to_string()))?;
            let parameters = self
                .registry
                .sample_parameters(kind, rng)
                .ok_or_else(|| ReproductionError::UnknownArchetype(kind.as_str().to_string()))?;
            let reason = format!(
                "Mutated from {} with archetype re-roll {} -> {}",
                parent.id,
                parent.archetype.as_str(),
                kind.as_str()
            );
            (kind, parameters, reason)
        } else {
            let specs = self.specs(parent.archetype)?;
            let scale = jitter_scale(parent.fitness);
            let mut parameters = Parameters::new();
            for spec in specs {
                let value = parent
                    .parameters
                    .get(spec.name)
                    .copied()
                    .ok_or_else(|| ReproductionError::MissingParameter(spec.name.to_string()))?;
                parameters.insert(spec.name.to_string(), jitter(spec, value, scale, rng));
            }
            let reason = format!(
                "Mutated from {} (fitness {:.1}, jitter {})",
                parent.id,
                parent.fitness,
                scale.describe()
            );
            (parent.archetype, parameters, reason)
        };

        let generation = parent.generation + 1;
        self.accept(
            kind,
            parent.symbol.clone(),
            parameters,
            generation,
            vec![parent.id.clone()],
            EvolutionEventType::Mutate,
            Some(parent),
            reason,
            rng,
        )
    }

    /// Blend two parents. Parents of different archetypes cannot be blended,
    /// so the dominant one is mutated instead.
    pub fn crossover(
        &self,
        a: &StrategyRecord,
        b: &StrategyRecord,
        rng: &mut impl Rng,
    ) -> Result<Offspring, ReproductionError> {
        let (dominant, recessive) = if b.fitness > a.fitness { (b, a) } else { (a, b) };

        if dominant.archetype != recessive.archetype {
            debug!(
                dominant = %dominant.id,
                recessive = %recessive.id,
                "Archetypes differ, mutating dominant parent instead"
            );
            return self.mutate(dominant, rng);
        }

        let specs = self.specs(dominant.archetype)?;
        let inherit_p = if dominant.fitness >= 90.0 { 0.7 } else { 0.5 };
        let average = (dominant.fitness - recessive.fitness) < AVERAGING_GAP;

        let mut parameters = Parameters::new();
        for spec in specs {
            let dom = dominant
                .parameters
                .get(spec.name)
                .copied()
                .ok_or_else(|| ReproductionError::MissingParameter(spec.name.to_string()))?;
            let value = match recessive.parameters.get(spec.name).copied() {
                Some(rec) if average && !spec.integer => (dom + rec) / 2.0,
                Some(rec) => {
                    if rng.gen_bool(inherit_p) {
                        dom
                    } else {
                        rec
                    }
                }
                None => dom,
            };
            parameters.insert(spec.name.to_string(), spec.normalize(value));
        }

        let generation = dominant.generation.max(recessive.generation) + 1;
        let reason = format!(
            "Crossover of {} ({:.1}) x {} ({:.1}){}",
            dominant.id,
            dominant.fitness,
            recessive.id,
            recessive.fitness,
            if average { ", continuous parameters averaged" } else { "" }
        );
        self.accept(
            dominant.archetype,
            dominant.symbol.clone(),
            parameters,
            generation,
            vec![dominant.id.clone(), recessive.id.clone()],
            EvolutionEventType::Crossover,
            Some(dominant),
            reason,
            rng,
        )
    }

    /// Fresh generation-0 candidate from a random template
    pub fn spawn_random(
        &self,
        templates: &SpawnTemplates,
        rng: &mut impl Rng,
    ) -> Result<Offspring, ReproductionError> {
        let kind = *templates.archetypes.choose(rng).ok_or(ReproductionError::NoTemplates)?;
        let symbol = templates
            .symbols
            .choose(rng)
            .ok_or(ReproductionError::NoTemplates)?
            .clone();
        let parameters = self
            .registry
            .sample_parameters(kind, rng)
            .ok_or_else(|| ReproductionError::UnknownArchetype(kind.as_str().to_string()))?;

        let reason = format!("Random spawn of {} on {}", kind.as_str(), symbol);
        self.accept(
            kind,
            symbol,
            parameters,
            0,
            Vec::new(),
            EvolutionEventType::Spawn,
            None,
            reason,
            rng,
        )
    }

    pub fn validate(&self, kind: ArchetypeKind, parameters: &Parameters) -> Result<(), ReproductionError> {
        self.registry
            .validate_parameters(kind, parameters)
            .map_err(ReproductionError::from)
    }

    fn specs(&self, kind: ArchetypeKind) -> Result<&'static [ParamSpec], ReproductionError> {
        self.registry
            .get(kind)
            .map(|a| a.parameter_ranges())
            .ok_or_else(|| ReproductionError::UnknownArchetype(kind.as_str().to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    fn accept(
        &self,
        kind: ArchetypeKind,
        symbol: String,
        parameters: Parameters,
        generation: u32,
        parent_ids: Vec<String>,
        event_type: EvolutionEventType,
        parent: Option<&StrategyRecord>,
        reason: String,
        rng: &mut impl Rng,
    ) -> Result<Offspring, ReproductionError> {
        if let Err(err) = self.validate(kind, &parameters) {
            warn!(
                archetype = kind.as_str(),
                parents = ?parent_ids,
                error = %err,
                "Discarding malformed offspring"
            );
            return Err(err);
        }

        let id = strategy_id(kind, &parameters, generation, &parent_ids, rng.gen());
        let record = StrategyRecord::candidate(
            id.clone(),
            kind,
            symbol,
            parameters.clone(),
            generation,
            parent_ids,
        );
        let event = EvolutionEvent::new(id, event_type, reason)
            .with_parameters(parent.map(|p| p.parameters.clone()), Some(parameters))
            .with_fitness(parent.map(|p| p.fitness), None);

        Ok(Offspring { record, event })
    }
}

// ============================================================================
// Jitter
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum JitterScale {
    /// Symmetric uniform jitter within ± this fraction
    Within(f64),
    /// Random sign, magnitude uniform in [lo, hi]
    Between(f64, f64),
}

impl JitterScale {
    fn describe(&self) -> String {
        match self {
            JitterScale::Within(f) => format!("±{:.0}%", f * 100.0),
            JitterScale::Between(lo, hi) => format!("±{:.0}-{:.0}%", lo * 100.0, hi * 100.0),
        }
    }
}

fn jitter_scale(fitness: f64) -> JitterScale {
    if fitness >= 90.0 {
        JitterScale::Within(0.05)
    } else if fitness >= 80.0 {
        JitterScale::Within(0.10)
    } else {
        JitterScale::Between(0.20, 0.50)
    }
}

fn jitter(spec: &ParamSpec, value: f64, scale: JitterScale, rng: &mut impl Rng) -> f64 {
    let factor = match scale {
        JitterScale::Within(f) => rng.gen_range(-f..=f),
        JitterScale::Between(lo, hi) => {
            let magnitude = rng.gen_range(lo..=hi);
            if rng.gen_bool(0.5) {
                magnitude
            } else {
                -magnitude
            }
        }
    };
    // Zero has no relative scale, so jitter by the range width
    let base = if value.abs() > 1e-9 { value } else { spec.width() };
    spec.normalize(value + base * factor)
}

/// `STRAT_<ARCHETYPE>_<12 hex>`
pub fn strategy_id(
    kind: ArchetypeKind,
    parameters: &Parameters,
    generation: u32,
    parent_ids: &[String],
    nonce: u64,
) -> String {
    let json = serde_json::to_string(parameters).unwrap_or_default();
    let input = format!("{}:{}:{}:{}:{}", kind.as_str(), json, generation, parent_ids.join(","), nonce);
    let hash = format!("{:x}", Sha256::digest(input.as_bytes()));
    format!("STRAT_{}_{}", kind.as_str().to_uppercase(), &hash[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn operators() -> ReproductionOperators {
        ReproductionOperators::new(Arc::new(ArchetypeRegistry::with_defaults()))
    }

    fn parent(ops: &ReproductionOperators, kind: ArchetypeKind, fitness: f64, seed: u64) -> StrategyRecord {
        let mut rng = StdRng::seed_from_u64(seed);
        let params = ops.registry().sample_parameters(kind, &mut rng).unwrap();
        let mut record = StrategyRecord::candidate(
            format!("P{seed}"),
            kind,
            "BTCUSDT".to_string(),
            params,
            3,
            vec![],
        );
        record.fitness = fitness;
        record
    }

    #[test]
    fn test_mutate_never_leaves_declared_ranges() {
        let ops = operators();
        let mut rng = StdRng::seed_from_u64(99);
        for trial in 0..1000u64 {
            let kind = ArchetypeKind::ALL[(trial % 6) as usize];
            let fitness = [30.0, 65.0, 85.0, 95.0][(trial % 4) as usize];
            let p = parent(&ops, kind, fitness, trial);
            let child = ops.mutate(&p, &mut rng).unwrap();

            let specs = ops.registry().get(child.record.archetype).unwrap().parameter_ranges();
            for spec in specs {
                let v = child.record.parameters[spec.name];
                assert!(spec.contains(v), "{} = {v} out of range", spec.name);
                if spec.integer {
                    assert_eq!(v, v.round());
                }
            }
            assert_eq!(child.record.generation, 4);
            assert_eq!(child.record.parent_ids, vec![p.id.clone()]);
            assert_eq!(child.event.event_type, EvolutionEventType::Mutate);
        }
    }

    #[test]
    fn test_only_weak_parents_reroll_archetype() {
        let ops = operators();
        let mut rng = StdRng::seed_from_u64(5);

        let strong = parent(&ops, ArchetypeKind::Breakout, 95.0, 1);
        for _ in 0..200 {
            let child = ops.mutate(&strong, &mut rng).unwrap();
            assert_eq!(child.record.archetype, ArchetypeKind::Breakout);
        }

        let weak = parent(&ops, ArchetypeKind::Breakout, 40.0, 2);
        let rerolled = (0..500)
            .filter(|_| ops.mutate(&weak, &mut rng).unwrap().record.archetype != ArchetypeKind::Breakout)
            .count();
        assert!((100..=200).contains(&rerolled), "rerolled {rerolled} of 500");
    }

    #[test]
    fn test_nan_parameter_is_rejected() {
        let ops = operators();
        let mut rng = StdRng::seed_from_u64(3);
        let mut p = parent(&ops, ArchetypeKind::MeanReversion, 95.0, 3);
        p.parameters.insert("multiplier".to_string(), f64::NAN);
        let err = ops.mutate(&p, &mut rng).unwrap_err();
        assert!(matches!(err, ReproductionError::OutOfRange { ref name, .. } if name == "multiplier"));
    }

    #[test]
    fn test_missing_parameter_is_rejected() {
        let ops = operators();
        let mut rng = StdRng::seed_from_u64(4);
        let mut p = parent(&ops, ArchetypeKind::Momentum, 95.0, 4);
        p.parameters.remove("lookback");
        assert_eq!(
            ops.mutate(&p, &mut rng).unwrap_err(),
            ReproductionError::MissingParameter("lookback".to_string())
        );
    }

    #[test]
    fn test_crossover_inherits_from_parents_when_gap_is_large() {
        let ops = operators();
        let mut rng = StdRng::seed_from_u64(11);
        let a = parent(&ops, ArchetypeKind::RsiReversal, 92.0, 20);
        let b = parent(&ops, ArchetypeKind::RsiReversal, 65.0, 21);

        let mut from_dominant = 0;
        let mut total = 0;
        for _ in 0..300 {
            let child = ops.crossover(&b, &a, &mut rng).unwrap();
            assert_eq!(child.record.parent_ids, vec![a.id.clone(), b.id.clone()]);
            assert_eq!(child.record.generation, 4);
            assert_eq!(child.event.event_type, EvolutionEventType::Crossover);
            for (name, v) in &child.record.parameters {
                assert!(*v == a.parameters[name] || *v == b.parameters[name]);
                if a.parameters[name] != b.parameters[name] {
                    total += 1;
                    if *v == a.parameters[name] {
                        from_dominant += 1;
                    }
                }
            }
        }
        let share = from_dominant as f64 / total as f64;
        assert!((0.62..=0.78).contains(&share), "dominant share {share}");
    }

    #[test]
    fn test_crossover_averages_continuous_parameters_when_close() {
        let ops = operators();
        let mut rng = StdRng::seed_from_u64(12);
        let a = parent(&ops, ArchetypeKind::MeanReversion, 72.0, 30);
        let b = parent(&ops, ArchetypeKind::MeanReversion, 68.0, 31);
        let child = ops.crossover(&a, &b, &mut rng).unwrap();

        let expected = (a.parameters["multiplier"] + b.parameters["multiplier"]) / 2.0;
        assert!((child.record.parameters["multiplier"] - expected).abs() < 1e-9);
        let period = child.record.parameters["period"];
        assert!(period == a.parameters["period"] || period == b.parameters["period"]);
    }

    #[test]
    fn test_crossover_across_archetypes_mutates_dominant() {
        let ops = operators();
        let mut rng = StdRng::seed_from_u64(13);
        let a = parent(&ops, ArchetypeKind::Momentum, 95.0, 40);
        let b = parent(&ops, ArchetypeKind::GridTrading, 70.0, 41);
        let child = ops.crossover(&a, &b, &mut rng).unwrap();
        assert_eq!(child.event.event_type, EvolutionEventType::Mutate);
        assert_eq!(child.record.archetype, ArchetypeKind::Momentum);
        assert_eq!(child.record.parent_ids, vec![a.id.clone()]);
    }

    #[test]
    fn test_spawn_random() {
        let ops = operators();
        let mut rng = StdRng::seed_from_u64(14);
        let templates = SpawnTemplates {
            archetypes: vec![ArchetypeKind::TrendFollowing],
            symbols: vec!["ETHUSDT".to_string()],
        };
        let child = ops.spawn_random(&templates, &mut rng).unwrap();
        assert_eq!(child.record.archetype, ArchetypeKind::TrendFollowing);
        assert_eq!(child.record.symbol, "ETHUSDT");
        assert_eq!(child.record.generation, 0);
        assert!(child.record.parent_ids.is_empty());
        assert!(child.record.id.starts_with("STRAT_TREND_FOLLOWING_"));
        assert_eq!(child.record.id.len(), "STRAT_TREND_FOLLOWING_".len() + 12);
        assert_eq!(child.event.event_type, EvolutionEventType::Spawn);

        let empty = SpawnTemplates {
            archetypes: vec![],
            symbols: vec!["ETHUSDT".to_string()],
        };
        assert_eq!(ops.spawn_random(&empty, &mut rng).unwrap_err(), ReproductionError::NoTemplates);
    }
}
