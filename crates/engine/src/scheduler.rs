//! Recurring loops: evolution, signal generation and health
//!
//! Each loop runs on its own task, ticks on an interval and stops when the
//! shutdown channel flips. Triggers are single-flight: one that arrives
//! while the same loop is running is skipped, never queued.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::CacheStatus;
use crate::engine::{shutdown_requested, CycleReport, Engine, SignalReport};

/// A loop that has not finished within this many periods is reported stalled
const STALL_PERIODS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Evolution,
    Signal,
    Health,
}

impl std::fmt::Display for LoopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopKind::Evolution => write!(f, "evolution"),
            LoopKind::Signal => write!(f, "signal"),
            LoopKind::Health => write!(f, "health"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    CoolingDown { remaining_secs: u64 },
}

#[derive(Debug, Clone)]
pub enum TriggerOutcome<T> {
    Completed(T),
    Failed(String),
    Skipped(SkipReason),
}

impl<T> TriggerOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TriggerOutcome::Skipped(_))
    }
}

#[derive(Default)]
struct LastRun {
    outcome: Option<LoopState>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    finished: Option<Instant>,
    last_success: Option<Instant>,
    error: Option<String>,
}

struct LoopTracker {
    kind: LoopKind,
    period: Duration,
    /// Minimum gap after a successful run
    cooldown: Duration,
    running: AtomicBool,
    runs: AtomicU64,
    failures: AtomicU64,
    last: RwLock<LastRun>,
    created: Instant,
}

/// Releases the loop on drop; a run that never reported is a failure
struct RunGuard<'a> {
    tracker: &'a LoopTracker,
    reported: bool,
}

impl LoopTracker {
    fn new(kind: LoopKind, period: Duration, cooldown: Duration) -> Self {
        Self {
            kind,
            period,
            cooldown,
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last: RwLock::new(LastRun::default()),
            created: Instant::now(),
        }
    }

    async fn begin(&self) -> Result<RunGuard<'_>, SkipReason> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SkipReason::AlreadyRunning);
        }
        let guard = RunGuard {
            tracker: self,
            reported: false,
        };

        let mut last = self.last.write().await;
        if let Some(success) = last.last_success {
            let elapsed = success.elapsed();
            if elapsed < self.cooldown {
                let remaining = self.cooldown - elapsed;
                drop(last);
                guard.release();
                return Err(SkipReason::CoolingDown {
                    remaining_secs: remaining.as_secs(),
                });
            }
        }
        last.started_at = Some(Utc::now());
        debug!(loop_kind = %self.kind, "Idle -> Running");
        Ok(guard)
    }

    async fn status(&self) -> LoopStatus {
        let last = self.last.read().await;
        let running = self.running.load(Ordering::Acquire);
        let stall_after = self.period * STALL_PERIODS;
        let stalled = last.finished.unwrap_or(self.created).elapsed() > stall_after;
        LoopStatus {
            kind: self.kind,
            state: if running { LoopState::Running } else { LoopState::Idle },
            last_outcome: last.outcome,
            last_started_at: last.started_at,
            last_finished_at: last.finished_at,
            last_error: last.error.clone(),
            runs: self.runs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            period_secs: self.period.as_secs(),
            stalled,
        }
    }
}

impl RunGuard<'_> {
    /// Give the loop back without recording a run
    fn release(mut self) {
        self.reported = true;
        self.tracker.running.store(false, Ordering::Release);
    }

    async fn finish(mut self, result: Result<(), String>) {
        let tracker = self.tracker;
        {
            let mut last = tracker.last.write().await;
            let now = Instant::now();
            last.finished = Some(now);
            last.finished_at = Some(Utc::now());
            match result {
                Ok(()) => {
                    last.outcome = Some(LoopState::Succeeded);
                    last.last_success = Some(now);
                    last.error = None;
                }
                Err(e) => {
                    last.outcome = Some(LoopState::Failed);
                    last.error = Some(e);
                    tracker.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        tracker.runs.fetch_add(1, Ordering::Relaxed);
        self.reported = true;
        tracker.running.store(false, Ordering::Release);
        debug!(loop_kind = %tracker.kind, "Running -> Idle");
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        self.tracker.failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.tracker.last.try_write() {
            last.outcome = Some(LoopState::Failed);
            last.error = Some("run cancelled".to_string());
        }
        self.tracker.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub kind: LoopKind,
    pub state: LoopState,
    pub last_outcome: Option<LoopState>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub runs: u64,
    pub failures: u64,
    pub period_secs: u64,
    pub stalled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub loops: Vec<LoopStatus>,
    pub cache: Vec<CacheStatus>,
    pub cycles_run: u64,
}

pub struct Scheduler {
    engine: Arc<Engine>,
    evolution: LoopTracker,
    signal: LoopTracker,
    health: LoopTracker,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        let config = engine.config();
        let evolution = LoopTracker::new(
            LoopKind::Evolution,
            config.evolution_interval(),
            config.evolution_loop_cooldown(),
        );
        let signal = LoopTracker::new(LoopKind::Signal, config.signal_interval(), Duration::ZERO);
        let health = LoopTracker::new(LoopKind::Health, config.health_interval(), Duration::ZERO);
        let (shutdown, _) = watch::channel(false);

        Self {
            engine,
            evolution,
            signal,
            health,
            shutdown,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn tracker(&self, kind: LoopKind) -> &LoopTracker {
        match kind {
            LoopKind::Evolution => &self.evolution,
            LoopKind::Signal => &self.signal,
            LoopKind::Health => &self.health,
        }
    }

    async fn run_tracked<T, F>(&self, kind: LoopKind, job: F) -> TriggerOutcome<T>
    where
        F: Future<Output = Result<T, String>>,
    {
        let guard = match self.tracker(kind).begin().await {
            Ok(guard) => guard,
            Err(reason) => {
                debug!(loop_kind = %kind, ?reason, "Trigger skipped");
                return TriggerOutcome::Skipped(reason);
            }
        };

        match job.await {
            Ok(value) => {
                guard.finish(Ok(())).await;
                TriggerOutcome::Completed(value)
            }
            Err(e) => {
                guard.finish(Err(e.clone())).await;
                TriggerOutcome::Failed(e)
            }
        }
    }

    /// Run one evolution cycle. A shutdown during the cycle abandons it
    /// before anything is written.
    pub async fn trigger_evolution(&self) -> TriggerOutcome<CycleReport> {
        let shutdown = self.shutdown.subscribe();
        self.run_tracked(LoopKind::Evolution, async {
            self.engine
                .run_evolution_cycle_until(shutdown)
                .await
                .map_err(|e| e.to_string())
        })
        .await
    }

    pub async fn trigger_signals(&self) -> TriggerOutcome<SignalReport> {
        self.run_tracked(LoopKind::Signal, async {
            self.engine
                .run_signal_cycle()
                .await
                .map_err(|e| e.to_string())
        })
        .await
    }

    /// Warm the account cache and flag stalled loops
    pub async fn trigger_health(&self) -> TriggerOutcome<HealthReport> {
        self.run_tracked(LoopKind::Health, async {
            self.engine.refresh_account_cache().await;
            let report = self.health().await;
            for status in report.loops.iter().filter(|l| l.stalled) {
                warn!(
                    loop_kind = %status.kind,
                    last_finished = ?status.last_finished_at,
                    "Loop stalled"
                );
            }
            Ok(report)
        })
        .await
    }

    pub async fn health(&self) -> HealthReport {
        let loops = vec![
            self.evolution.status().await,
            self.signal.status().await,
            self.health.status().await,
        ];
        let cache = self.engine.cache().status().await;
        let healthy = loops.iter().all(|l| !l.stalled && l.last_outcome != Some(LoopState::Failed))
            && cache.iter().all(|c| c.last_error.is_none());
        HealthReport {
            healthy,
            loops,
            cache,
            cycles_run: self.engine.cycles_run(),
        }
    }

    /// Spawn the three loops. They run until `shutdown` is called.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        [LoopKind::Evolution, LoopKind::Signal, LoopKind::Health]
            .into_iter()
            .map(|kind| {
                let scheduler = Arc::clone(self);
                let shutdown = self.shutdown.subscribe();
                tokio::spawn(async move { scheduler.run_loop(kind, shutdown).await })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        info!("Scheduler shutting down");
        self.shutdown.send_replace(true);
    }

    async fn run_loop(&self, kind: LoopKind, mut shutdown: watch::Receiver<bool>) {
        let period = self.tracker(kind).period;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(loop_kind = %kind, period_secs = period.as_secs(), "Loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            // Evolution watches shutdown itself so it can stop short of the
            // commit; signal and health iterations are dropped mid-flight.
            let failure = match kind {
                LoopKind::Evolution => failure_of(self.trigger_evolution().await),
                LoopKind::Signal => tokio::select! {
                    outcome = self.trigger_signals() => failure_of(outcome),
                    _ = shutdown_requested(&mut shutdown) => break,
                },
                LoopKind::Health => tokio::select! {
                    outcome = self.trigger_health() => failure_of(outcome),
                    _ = shutdown_requested(&mut shutdown) => break,
                },
            };
            match failure {
                Some(e) if *shutdown.borrow() => {
                    debug!(loop_kind = %kind, error = %e, "Iteration ended by shutdown");
                    break;
                }
                Some(e) => error!(loop_kind = %kind, error = %e, "Loop iteration failed"),
                None => {}
            }
        }

        info!(loop_kind = %kind, "Loop stopped");
    }
}

fn failure_of<T>(outcome: TriggerOutcome<T>) -> Option<String> {
    match outcome {
        TriggerOutcome::Failed(e) => Some(e),
        _ => None,
    }
}
