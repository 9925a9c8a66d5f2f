//! Capital allocation across qualified strategies

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::types::{
    AllocationTier, CapitalAllocation, EvolutionEvent, EvolutionEventType, LifecycleStage,
    StrategyRecord,
};

#[derive(Debug, Clone)]
pub struct AllocationPolicy {
    /// Share of available capital never deployed
    pub reserve_ratio: f64,
    pub qualification_threshold: f64,
    pub default_min_trade_amount: Decimal,
    pub min_trade_amounts: HashMap<String, Decimal>,
}

impl AllocationPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            reserve_ratio: config.reserve_balance_ratio,
            qualification_threshold: config.qualification_threshold,
            default_min_trade_amount: config.default_min_trade_amount,
            min_trade_amounts: config.min_trade_amounts.clone(),
        }
    }

    fn min_trade_amount(&self, symbol: &str) -> Decimal {
        self.min_trade_amounts
            .get(symbol)
            .copied()
            .unwrap_or(self.default_min_trade_amount)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllocationPlan {
    pub allocations: Vec<CapitalAllocation>,
    /// Qualified strategies left unfunded this cycle
    pub observed: Vec<String>,
    pub deployable: Decimal,
    pub total_allocated: Decimal,
}

impl AllocationPlan {
    pub fn allocation_for(&self, id: &str) -> Option<&CapitalAllocation> {
        self.allocations.iter().find(|a| a.strategy_id == id)
    }
}

struct Funded<'a> {
    record: &'a StrategyRecord,
    tier: AllocationTier,
    amount: Decimal,
}

pub struct CapitalAllocator {
    policy: AllocationPolicy,
}

impl CapitalAllocator {
    pub fn new(policy: AllocationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    /// Split `available` capital across qualified strategies by fitness tier
    pub fn allocate(
        &self,
        ranked: &[StrategyRecord],
        available: Decimal,
        now: DateTime<Utc>,
    ) -> AllocationPlan {
        let mut plan = AllocationPlan::default();

        let mut candidates: Vec<Funded> = Vec::new();
        for record in ranked {
            if !matches!(record.stage, LifecycleStage::Qualified | LifecycleStage::Active) {
                continue;
            }
            let tier = AllocationTier::from_fitness(record.fitness);
            if record.fitness < self.policy.qualification_threshold || tier.ratio() <= 0.0 {
                plan.observed.push(record.id.clone());
                continue;
            }
            candidates.push(Funded {
                record,
                tier,
                amount: Decimal::ZERO,
            });
        }
        // Best first; the tail is what gets cut
        candidates.sort_by(|a, b| {
            b.tier
                .cmp(&a.tier)
                .then(b.record.fitness.total_cmp(&a.record.fitness))
                .then(a.record.id.cmp(&b.record.id))
        });

        let reserve = to_decimal(self.policy.reserve_ratio.clamp(0.0, 1.0));
        plan.deployable = if available > Decimal::ZERO {
            (available * (Decimal::ONE - reserve)).round_dp_with_strategy(2, RoundingStrategy::ToZero)
        } else {
            Decimal::ZERO
        };

        // Drop the weakest sub-minimum allocation and renormalize until stable
        loop {
            self.size(&mut candidates, plan.deployable);
            let failing = candidates
                .iter()
                .rposition(|c| c.amount < self.policy.min_trade_amount(&c.record.symbol));
            match failing {
                Some(idx) => {
                    let dropped = candidates.remove(idx);
                    debug!(
                        strategy = %dropped.record.id,
                        amount = %dropped.amount,
                        "Allocation below minimum trade amount, observing only"
                    );
                    plan.observed.push(dropped.record.id.clone());
                }
                None => break,
            }
        }

        let trimmed = self.trim_overcommit(&mut candidates, plan.deployable);
        plan.observed.extend(trimmed);

        plan.total_allocated = candidates.iter().map(|c| c.amount).sum();
        plan.allocations = candidates
            .into_iter()
            .map(|c| CapitalAllocation {
                strategy_id: c.record.id.clone(),
                tier: c.tier,
                ratio: c.tier.ratio(),
                amount: c.amount,
                computed_at: now,
            })
            .collect();

        info!(
            available = %available,
            deployable = %plan.deployable,
            allocated = %plan.total_allocated,
            funded = plan.allocations.len(),
            observed = plan.observed.len(),
            "Capital allocated"
        );
        plan
    }

    fn size(&self, candidates: &mut [Funded], deployable: Decimal) {
        let ratio_sum: Decimal = candidates.iter().map(|c| to_decimal(c.tier.ratio())).sum();
        let denominator = ratio_sum.max(Decimal::ONE);
        for c in candidates.iter_mut() {
            c.amount = (deployable * to_decimal(c.tier.ratio()) / denominator)
                .round_dp_with_strategy(2, RoundingStrategy::ToZero);
        }
    }

    /// Overcommit guard over sized allocations ordered best first: take the
    /// excess from the tail, dropping an allocation outright when the cut
    /// would leave it under its minimum. Returns the ids dropped.
    fn trim_overcommit(&self, funded: &mut Vec<Funded>, deployable: Decimal) -> Vec<String> {
        let mut dropped_ids = Vec::new();
        let mut total: Decimal = funded.iter().map(|c| c.amount).sum();
        while total > deployable {
            let excess = total - deployable;
            let Some(last) = funded.last_mut() else { break };
            warn!(strategy = %last.record.id, excess = %excess, "Allocation overcommitted, truncating");
            if last.amount > excess
                && last.amount - excess >= self.policy.min_trade_amount(&last.record.symbol)
            {
                last.amount -= excess;
            } else if let Some(dropped) = funded.pop() {
                dropped_ids.push(dropped.record.id.clone());
            }
            total = funded.iter().map(|c| c.amount).sum();
        }
        dropped_ids
    }

    /// Write the plan onto the population: funded strategies become Active,
    /// previously Active strategies left unfunded fall back to Qualified.
    pub fn apply(
        &self,
        plan: &AllocationPlan,
        population: &mut [StrategyRecord],
        now: DateTime<Utc>,
    ) -> Vec<EvolutionEvent> {
        let mut events = Vec::new();
        for record in population.iter_mut() {
            match plan.allocation_for(&record.id) {
                Some(allocation) => {
                    let was_active = record.stage == LifecycleStage::Active;
                    record.transition(LifecycleStage::Active, now);
                    record.allocation = Some(allocation.clone());
                    if !was_active {
                        events.push(
                            EvolutionEvent::new(
                                &record.id,
                                EvolutionEventType::Promote,
                                format!("Funded {} as {}", allocation.amount, allocation.tier),
                            )
                            .with_fitness(Some(record.fitness), Some(record.fitness)),
                        );
                    }
                }
                None if record.stage == LifecycleStage::Active => {
                    record.transition(LifecycleStage::Qualified, now);
                    events.push(
                        EvolutionEvent::new(
                            &record.id,
                            EvolutionEventType::Demote,
                            format!("No allocation this cycle at fitness {:.1}", record.fitness),
                        )
                        .with_fitness(Some(record.fitness), Some(record.fitness)),
                    );
                }
                None => {}
            }
        }
        events
    }
}

/// Ratios are short decimals; drop the binary noise of the f64
fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(6))
        .unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArchetypeKind, Parameters};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal_macros::dec;

    fn policy() -> AllocationPolicy {
        AllocationPolicy {
            reserve_ratio: 0.05,
            qualification_threshold: 60.0,
            default_min_trade_amount: dec!(10),
            min_trade_amounts: HashMap::new(),
        }
    }

    fn qualified(id: &str, fitness: f64) -> StrategyRecord {
        let mut r = StrategyRecord::candidate(
            id.to_string(),
            ArchetypeKind::TrendFollowing,
            "BTCUSDT".to_string(),
            Parameters::new(),
            1,
            vec![],
        );
        r.stage = LifecycleStage::Qualified;
        r.fitness = fitness;
        r
    }

    #[test]
    fn test_single_legendary_gets_all_deployable() {
        let allocator = CapitalAllocator::new(policy());
        let mut population = vec![qualified("S1", 95.0)];
        let now = Utc::now();
        let plan = allocator.allocate(&population, dec!(1000), now);

        assert_eq!(plan.deployable, dec!(950));
        assert_eq!(plan.allocations.len(), 1);
        assert_eq!(plan.allocations[0].amount, dec!(950));
        assert_eq!(plan.allocations[0].tier, AllocationTier::Legendary);

        let events = allocator.apply(&plan, &mut population, now);
        assert_eq!(population[0].stage, LifecycleStage::Active);
        assert_eq!(population[0].allocation.as_ref().map(|a| a.amount), Some(dec!(950)));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EvolutionEventType::Promote);
    }

    #[test]
    fn test_ratios_are_normalized_when_they_exceed_one() {
        let allocator = CapitalAllocator::new(policy());
        let population = vec![qualified("A", 95.0), qualified("B", 85.0), qualified("C", 65.0)];
        let plan = allocator.allocate(&population, dec!(1000), Utc::now());

        // ratios 1.0 + 0.8 + 0.3 = 2.1
        let a = plan.allocation_for("A").unwrap().amount;
        let b = plan.allocation_for("B").unwrap().amount;
        let c = plan.allocation_for("C").unwrap().amount;
        assert_eq!(a, dec!(452.38));
        assert_eq!(b, dec!(361.90));
        assert_eq!(c, dec!(135.71));
        assert!(plan.total_allocated <= plan.deployable);
    }

    #[test]
    fn test_below_threshold_and_sub_minimum_are_observed() {
        let mut p = policy();
        p.min_trade_amounts.insert("ETHUSDT".to_string(), dec!(500));
        let allocator = CapitalAllocator::new(p);

        let mut eth = qualified("ETH", 65.0);
        eth.symbol = "ETHUSDT".to_string();
        let population = vec![qualified("A", 95.0), eth, qualified("LOW", 55.0)];
        let plan = allocator.allocate(&population, dec!(1000), Utc::now());

        assert!(plan.allocation_for("ETH").is_none());
        assert!(plan.allocation_for("LOW").is_none());
        assert!(plan.observed.contains(&"ETH".to_string()));
        assert!(plan.observed.contains(&"LOW".to_string()));
        // With ETH dropped the legendary strategy takes everything
        assert_eq!(plan.allocation_for("A").unwrap().amount, dec!(950));
    }

    #[test]
    fn test_unfunded_active_is_demoted() {
        let allocator = CapitalAllocator::new(policy());
        let now = Utc::now();
        let mut active = qualified("OLD", 75.0);
        active.stage = LifecycleStage::Active;
        active.allocation = Some(CapitalAllocation {
            strategy_id: "OLD".to_string(),
            tier: AllocationTier::Quality,
            ratio: 0.6,
            amount: dec!(100),
            computed_at: now,
        });
        let mut population = vec![active];

        let plan = allocator.allocate(&population, Decimal::ZERO, now);
        assert!(plan.allocations.is_empty());

        let events = allocator.apply(&plan, &mut population, now);
        assert_eq!(population[0].stage, LifecycleStage::Qualified);
        assert!(population[0].allocation.is_none());
        assert_eq!(events[0].event_type, EvolutionEventType::Demote);
    }

    fn sized<'a>(record: &'a StrategyRecord, amount: Decimal) -> Funded<'a> {
        Funded {
            record,
            tier: AllocationTier::from_fitness(record.fitness),
            amount,
        }
    }

    #[test]
    fn test_overcommit_trims_lowest_tier_first() {
        let allocator = CapitalAllocator::new(policy());
        let records = vec![qualified("A", 95.0), qualified("B", 85.0), qualified("C", 65.0)];

        // 500 + 300 + 250 = 1050 against 1000: C absorbs the 50
        let mut funded: Vec<Funded> = records
            .iter()
            .zip([dec!(500), dec!(300), dec!(250)])
            .map(|(r, amount)| sized(r, amount))
            .collect();
        let dropped = allocator.trim_overcommit(&mut funded, dec!(1000));
        assert!(dropped.is_empty());
        let amounts: Vec<Decimal> = funded.iter().map(|f| f.amount).collect();
        assert_eq!(amounts, vec![dec!(500), dec!(300), dec!(200)]);

        // 500 + 300 + 15 = 815 against 790: cutting C leaves it under 10, so it goes,
        // then B gives up the remaining 10
        let mut funded: Vec<Funded> = records
            .iter()
            .zip([dec!(500), dec!(300), dec!(15)])
            .map(|(r, amount)| sized(r, amount))
            .collect();
        let dropped = allocator.trim_overcommit(&mut funded, dec!(790));
        assert_eq!(dropped, vec!["C".to_string()]);
        let amounts: Vec<Decimal> = funded.iter().map(|f| f.amount).collect();
        assert_eq!(amounts, vec![dec!(500), dec!(290)]);
        let total: Decimal = funded.iter().map(|f| f.amount).sum();
        assert!(total <= dec!(790));
    }

    #[test]
    fn test_overcommit_within_budget_is_untouched() {
        let allocator = CapitalAllocator::new(policy());
        let records = vec![qualified("A", 95.0)];
        let mut funded = vec![sized(&records[0], dec!(100))];
        assert!(allocator.trim_overcommit(&mut funded, dec!(100)).is_empty());
        assert_eq!(funded[0].amount, dec!(100));

        let mut funded = vec![sized(&records[0], dec!(100))];
        let dropped = allocator.trim_overcommit(&mut funded, Decimal::ZERO);
        assert_eq!(dropped, vec!["A".to_string()]);
        assert!(funded.is_empty());
    }

    #[test]
    fn test_total_never_exceeds_available() {
        let allocator = CapitalAllocator::new(policy());
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..200 {
            let n = rng.gen_range(1..40);
            let population: Vec<_> = (0..n)
                .map(|i| qualified(&format!("S{i}"), rng.gen_range(50.0..100.0)))
                .collect();
            let available = Decimal::from(rng.gen_range(0..100_000));
            let plan = allocator.allocate(&population, available, Utc::now());
            let total: Decimal = plan.allocations.iter().map(|a| a.amount).sum();
            assert!(total <= available);
            assert!(total <= plan.deployable);
            assert!(plan.allocations.iter().all(|a| a.amount >= dec!(10)));
        }
    }
}
