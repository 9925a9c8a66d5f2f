//! Time-boxed cache for account state
//!
//! Each key has its own async lock so a miss issues exactly one upstream
//! fetch while concurrent readers wait on it. Invalidation bumps an epoch
//! counter and never blocks. A failed refresh serves the last known value
//! flagged `stale`; with no value ever fetched the read fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::account::AccountSource;
use crate::types::{BalanceSnapshot, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKey {
    Balance,
    Positions,
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::Balance => write!(f, "balance"),
            CacheKey::Positions => write!(f, "positions"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    TradeExecuted,
    DepositWithdrawal,
    ManualRefresh,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    #[error("{key} unavailable: {reason}")]
    Unavailable { key: CacheKey, reason: String },
}

/// A cached value and how fresh it is
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    pub value: T,
    /// Served past its freshness window because the refresh failed
    pub stale: bool,
    pub captured_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub key: CacheKey,
    pub has_value: bool,
    pub fresh: bool,
    pub captured_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub fetches: u64,
}

struct CacheEntry<T> {
    value: T,
    captured_at: DateTime<Utc>,
    valid_until: Instant,
}

struct SlotState<T> {
    entry: Option<CacheEntry<T>>,
    /// Invalidation epoch the entry was fetched under
    epoch: u64,
    last_error: Option<String>,
}

struct CacheSlot<T> {
    key: CacheKey,
    state: Mutex<SlotState<T>>,
    epoch: AtomicU64,
    fetches: AtomicU64,
}

impl<T: Clone> CacheSlot<T> {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            state: Mutex::new(SlotState {
                entry: None,
                epoch: 0,
                last_error: None,
            }),
            epoch: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    async fn get<F, Fut>(
        &self,
        ttl: Duration,
        fetch_timeout: Duration,
        fetch: F,
    ) -> Result<CacheRead<T>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut state = self.state.lock().await;
        let epoch = self.epoch.load(Ordering::Acquire);

        if let Some(entry) = &state.entry {
            if state.epoch == epoch && Instant::now() < entry.valid_until {
                return Ok(CacheRead {
                    value: entry.value.clone(),
                    stale: false,
                    captured_at: entry.captured_at,
                    error: None,
                });
            }
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let error = match tokio::time::timeout(fetch_timeout, fetch()).await {
            Ok(Ok(value)) => {
                let captured_at = Utc::now();
                state.entry = Some(CacheEntry {
                    value: value.clone(),
                    captured_at,
                    valid_until: Instant::now() + ttl,
                });
                state.epoch = epoch;
                state.last_error = None;
                debug!(key = %self.key, "Cache refreshed");
                return Ok(CacheRead {
                    value,
                    stale: false,
                    captured_at,
                    error: None,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("fetch timed out after {}s", fetch_timeout.as_secs_f64()),
        };

        warn!(key = %self.key, error = %error, "Cache refresh failed");
        state.last_error = Some(error.clone());
        match &state.entry {
            Some(entry) => Ok(CacheRead {
                value: entry.value.clone(),
                stale: true,
                captured_at: entry.captured_at,
                error: Some(error),
            }),
            None => Err(CacheError::Unavailable {
                key: self.key,
                reason: error,
            }),
        }
    }

    fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    async fn status(&self) -> CacheStatus {
        let state = self.state.lock().await;
        let epoch = self.epoch.load(Ordering::Acquire);
        CacheStatus {
            key: self.key,
            has_value: state.entry.is_some(),
            fresh: state
                .entry
                .as_ref()
                .map(|e| state.epoch == epoch && Instant::now() < e.valid_until)
                .unwrap_or(false),
            captured_at: state.entry.as_ref().map(|e| e.captured_at),
            last_error: state.last_error.clone(),
            fetches: self.fetches.load(Ordering::Relaxed),
        }
    }
}

/// Balance and position cache in front of an `AccountSource`
pub struct CacheLayer {
    source: Arc<dyn AccountSource>,
    ttl: Duration,
    fetch_timeout: Duration,
    balance: CacheSlot<BalanceSnapshot>,
    positions: CacheSlot<Vec<Position>>,
}

impl CacheLayer {
    pub fn new(source: Arc<dyn AccountSource>, ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            source,
            ttl,
            fetch_timeout,
            balance: CacheSlot::new(CacheKey::Balance),
            positions: CacheSlot::new(CacheKey::Positions),
        }
    }

    pub async fn balance(&self) -> Result<CacheRead<BalanceSnapshot>, CacheError> {
        self.balance
            .get(self.ttl, self.fetch_timeout, || self.source.fetch_balance())
            .await
    }

    pub async fn positions(&self) -> Result<CacheRead<Vec<Position>>, CacheError> {
        self.positions
            .get(self.ttl, self.fetch_timeout, || self.source.fetch_positions())
            .await
    }

    /// Mark a key for refetch on its next read
    pub fn invalidate(&self, key: CacheKey, reason: InvalidationReason) {
        match key {
            CacheKey::Balance => self.balance.invalidate(),
            CacheKey::Positions => self.positions.invalidate(),
        }
        info!(%key, ?reason, "Cache invalidated");
    }

    pub fn invalidate_all(&self, reason: InvalidationReason) {
        self.invalidate(CacheKey::Balance, reason);
        self.invalidate(CacheKey::Positions, reason);
    }

    pub async fn status(&self) -> Vec<CacheStatus> {
        vec![self.balance.status().await, self.positions.status().await]
    }

    pub fn fetch_count(&self, key: CacheKey) -> u64 {
        match key {
            CacheKey::Balance => self.balance.fetches.load(Ordering::Relaxed),
            CacheKey::Positions => self.positions.fetches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::AtomicBool;

    struct FlakySource {
        calls: AtomicU64,
        fail: AtomicBool,
        delay: Duration,
    }

    impl FlakySource {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                fail: AtomicBool::new(false),
                delay,
            })
        }
    }

    #[async_trait]
    impl AccountSource for FlakySource {
        async fn fetch_balance(&self) -> anyhow::Result<BalanceSnapshot> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("exchange unreachable");
            }
            Ok(BalanceSnapshot {
                total: Decimal::from(n * 100),
                available: Decimal::from(n * 100),
            })
        }

        async fn fetch_positions(&self) -> anyhow::Result<Vec<Position>> {
            Ok(Vec::new())
        }
    }

    fn layer(source: Arc<FlakySource>, ttl: Duration) -> CacheLayer {
        CacheLayer::new(source, ttl, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_hit_within_ttl_does_not_refetch() {
        let source = FlakySource::new(Duration::ZERO);
        let cache = layer(source.clone(), Duration::from_secs(300));

        let first = cache.balance().await.unwrap();
        let second = cache.balance().await.unwrap();
        assert_eq!(first.value, second.value);
        assert!(!second.stale);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expiry_refetches() {
        let source = FlakySource::new(Duration::ZERO);
        let cache = layer(source.clone(), Duration::from_millis(20));

        cache.balance().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let read = cache.balance().await.unwrap();
        assert_eq!(read.value.available, Decimal::from(200));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_issues_exactly_one_fetch_for_concurrent_readers() {
        let source = FlakySource::new(Duration::from_millis(30));
        let cache = Arc::new(layer(source.clone(), Duration::from_secs(300)));
        cache.balance().await.unwrap();

        cache.invalidate(CacheKey::Balance, InvalidationReason::TradeExecuted);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.balance().await }));
        }
        for handle in handles {
            let read = handle.await.unwrap().unwrap();
            assert_eq!(read.value.available, Decimal::from(200));
            assert!(!read.stale);
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.fetch_count(CacheKey::Balance), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_serves_stale_value() {
        let source = FlakySource::new(Duration::ZERO);
        let cache = layer(source.clone(), Duration::from_secs(300));
        cache.balance().await.unwrap();

        source.fail.store(true, Ordering::SeqCst);
        cache.invalidate(CacheKey::Balance, InvalidationReason::ManualRefresh);

        let read = cache.balance().await.unwrap();
        assert!(read.stale);
        assert_eq!(read.value.available, Decimal::from(100));
        assert!(read.error.unwrap().contains("exchange unreachable"));

        let status = cache.status().await;
        assert!(status[0].has_value);
        assert!(!status[0].fresh);
        assert!(status[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_no_value_ever_is_unavailable() {
        let source = FlakySource::new(Duration::ZERO);
        source.fail.store(true, Ordering::SeqCst);
        let cache = layer(source, Duration::from_secs(300));
        let err = cache.balance().await.unwrap_err();
        assert!(matches!(err, CacheError::Unavailable { key: CacheKey::Balance, .. }));
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let source = FlakySource::new(Duration::from_secs(5));
        let cache = layer(source, Duration::from_secs(300));
        let err = cache.balance().await.unwrap_err();
        match err {
            CacheError::Unavailable { reason, .. } => assert!(reason.contains("timed out")),
        }
    }
}
