//! Engine configuration
//!
//! Defaults match the recommended operating values; every field can be
//! overridden through an `EVOLVER_*` environment variable (see `from_env`).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Period of the evolution loop
    pub evolution_interval_minutes: u64,
    /// Minimum gap between two evolution cycles (manual triggers included)
    pub evolution_loop_cooldown_minutes: u64,
    /// A strategy used as a parent is not used again within this window
    pub evolution_cooldown_hours: f64,
    pub signal_interval_seconds: u64,
    pub health_interval_seconds: u64,
    /// Upper bound for every external call (market data, account, store)
    pub fetch_timeout_seconds: u64,

    pub qualification_threshold: f64,
    pub min_sample_size: u32,
    /// Above this many trades per evaluation window a light penalty applies
    pub max_trades_per_window: u32,
    pub max_population: usize,
    pub min_population: usize,
    /// Share of new offspring that are random spawns rather than bred
    pub exploration_ratio: f64,

    pub cache_ttl_seconds: u64,
    pub reserve_balance_ratio: f64,
    pub default_min_trade_amount: Decimal,
    pub min_trade_amounts: HashMap<String, Decimal>,

    pub symbols: Vec<String>,
    pub kline_interval: String,
    /// Bars used for the bootstrap simulation of new candidates
    pub simulation_bars: u32,
    /// Bars fed to an archetype when generating a live signal
    pub signal_window_bars: u32,
    /// Starting capital of the paper account
    pub paper_capital: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evolution_interval_minutes: 60,
            evolution_loop_cooldown_minutes: 30,
            evolution_cooldown_hours: 2.0,
            signal_interval_seconds: 60,
            health_interval_seconds: 30,
            fetch_timeout_seconds: 10,
            qualification_threshold: 60.0,
            min_sample_size: 10,
            max_trades_per_window: 200,
            max_population: 30,
            min_population: 6,
            exploration_ratio: 0.2,
            cache_ttl_seconds: 300,
            reserve_balance_ratio: 0.05,
            default_min_trade_amount: dec!(10),
            min_trade_amounts: HashMap::new(),
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ],
            kline_interval: "15m".to_string(),
            simulation_bars: 500,
            signal_window_bars: 200,
            paper_capital: dec!(10000),
        }
    }
}

impl EngineConfig {
    /// Build a config from `EVOLVER_*` environment variables on top of the defaults.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let d = Self::default();
        let mut config = Self {
            evolution_interval_minutes: env_or("EVOLVER_EVOLUTION_INTERVAL_MINUTES", d.evolution_interval_minutes),
            evolution_loop_cooldown_minutes: env_or("EVOLVER_EVOLUTION_LOOP_COOLDOWN_MINUTES", d.evolution_loop_cooldown_minutes),
            evolution_cooldown_hours: env_or("EVOLVER_EVOLUTION_COOLDOWN_HOURS", d.evolution_cooldown_hours),
            signal_interval_seconds: env_or("EVOLVER_SIGNAL_INTERVAL_SECONDS", d.signal_interval_seconds),
            health_interval_seconds: env_or("EVOLVER_HEALTH_INTERVAL_SECONDS", d.health_interval_seconds),
            fetch_timeout_seconds: env_or("EVOLVER_FETCH_TIMEOUT_SECONDS", d.fetch_timeout_seconds),
            qualification_threshold: env_or("EVOLVER_QUALIFICATION_THRESHOLD", d.qualification_threshold),
            min_sample_size: env_or("EVOLVER_MIN_SAMPLE_SIZE", d.min_sample_size),
            max_trades_per_window: env_or("EVOLVER_MAX_TRADES_PER_WINDOW", d.max_trades_per_window),
            max_population: env_or("EVOLVER_MAX_POPULATION", d.max_population),
            min_population: env_or("EVOLVER_MIN_POPULATION", d.min_population),
            exploration_ratio: env_or("EVOLVER_EXPLORATION_RATIO", d.exploration_ratio),
            cache_ttl_seconds: env_or("EVOLVER_CACHE_TTL_SECONDS", d.cache_ttl_seconds),
            reserve_balance_ratio: env_or("EVOLVER_RESERVE_BALANCE_RATIO", d.reserve_balance_ratio),
            default_min_trade_amount: env_or("EVOLVER_DEFAULT_MIN_TRADE_AMOUNT", d.default_min_trade_amount),
            min_trade_amounts: d.min_trade_amounts,
            symbols: d.symbols,
            kline_interval: env_or("EVOLVER_KLINE_INTERVAL", d.kline_interval),
            simulation_bars: env_or("EVOLVER_SIMULATION_BARS", d.simulation_bars),
            signal_window_bars: env_or("EVOLVER_SIGNAL_WINDOW_BARS", d.signal_window_bars),
            paper_capital: env_or("EVOLVER_PAPER_CAPITAL", d.paper_capital),
        };

        if let Ok(raw) = std::env::var("EVOLVER_SYMBOLS") {
            let symbols = parse_symbols(&raw);
            if symbols.is_empty() {
                warn!(value = %raw, "EVOLVER_SYMBOLS is empty, keeping defaults");
            } else {
                config.symbols = symbols;
            }
        }
        if let Ok(raw) = std::env::var("EVOLVER_MIN_TRADE_AMOUNTS") {
            config.min_trade_amounts = parse_min_trade_amounts(&raw);
        }

        config.sanitize();
        config
    }

    /// Clamp values the engine cannot run with
    pub fn sanitize(&mut self) {
        if self.min_population == 0 {
            self.min_population = 1;
        }
        if self.max_population < self.min_population {
            warn!(
                max = self.max_population,
                min = self.min_population,
                "max_population below min_population, raising it"
            );
            self.max_population = self.min_population;
        }
        self.exploration_ratio = self.exploration_ratio.clamp(0.0, 1.0);
        if !(0.0..1.0).contains(&self.reserve_balance_ratio) {
            warn!(
                value = self.reserve_balance_ratio,
                "reserve_balance_ratio outside [0, 1), using 0.05"
            );
            self.reserve_balance_ratio = 0.05;
        }
        self.evolution_interval_minutes = self.evolution_interval_minutes.max(1);
        self.signal_interval_seconds = self.signal_interval_seconds.max(1);
        self.health_interval_seconds = self.health_interval_seconds.max(1);
        self.fetch_timeout_seconds = self.fetch_timeout_seconds.max(1);
    }

    pub fn evolution_interval(&self) -> Duration {
        Duration::from_secs(self.evolution_interval_minutes * 60)
    }

    pub fn evolution_loop_cooldown(&self) -> Duration {
        Duration::from_secs(self.evolution_loop_cooldown_minutes * 60)
    }

    pub fn parent_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.evolution_cooldown_hours.max(0.0) * 3600.0) as i64)
    }

    pub fn signal_interval(&self) -> Duration {
        Duration::from_secs(self.signal_interval_seconds)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "Invalid config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `BTCUSDT:10,ETHUSDT:5` into a per-symbol minimum map
fn parse_min_trade_amounts(raw: &str) -> HashMap<String, Decimal> {
    let mut map = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once(':') {
            Some((symbol, amount)) => match Decimal::from_str(amount.trim()) {
                Ok(v) if v >= Decimal::ZERO => {
                    map.insert(symbol.trim().to_uppercase(), v);
                }
                _ => warn!(entry, "Invalid minimum trade amount, skipping"),
            },
            None => warn!(entry, "Expected SYMBOL:AMOUNT, skipping"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let c = EngineConfig::default();
        assert_eq!(c.qualification_threshold, 60.0);
        assert_eq!(c.min_sample_size, 10);
        assert_eq!(c.min_population, 6);
        assert_eq!(c.cache_ttl_seconds, 300);
        assert!(c.evolution_interval_minutes >= 30);
    }

    #[test]
    fn test_min_trade_amounts_skip_malformed_entries() {
        let amounts = parse_min_trade_amounts("btcusdt:25, ETHUSDT:5,bad,SOLUSDT:-1");
        assert_eq!(amounts.get("BTCUSDT"), Some(&dec!(25)));
        assert_eq!(amounts.get("ETHUSDT"), Some(&dec!(5)));
        assert!(!amounts.contains_key("SOLUSDT"));
        assert_eq!(amounts.len(), 2);
    }

    #[test]
    fn test_sanitize_repairs_inconsistent_population_bounds() {
        let mut c = EngineConfig {
            max_population: 2,
            min_population: 6,
            reserve_balance_ratio: 1.5,
            exploration_ratio: 3.0,
            ..Default::default()
        };
        c.sanitize();
        assert_eq!(c.max_population, 6);
        assert_eq!(c.reserve_balance_ratio, 0.05);
        assert_eq!(c.exploration_ratio, 1.0);
    }

    #[test]
    fn test_parse_symbols() {
        assert_eq!(parse_symbols(" btcusdt, ,ethusdt"), vec!["BTCUSDT", "ETHUSDT"]);
    }
}
