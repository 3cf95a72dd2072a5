//! Cycle scheduler: Idle -> Running -> Settling -> Idle
//!
//! ## Running
//!
//! One task per (adapter kind x exchange:pair), each doing
//! `latest_ts -> fetch -> normalize -> upsert` in order. At most
//! `max_in_flight` tasks run at once (semaphore permits are taken before a
//! task is spawned). Task failures, panics included, are folded into the
//! `CycleReport` and never reach sibling tasks.
//!
//! Cancellation is checked between submissions only: once cancelled no new
//! task starts, running tasks finish their writes, and the cycle goes
//! straight to Settling.
//!
//! After the per-pair tasks settle, the market-wide headline feed (if the
//! registry has one) is fetched and upserted once. Its failure is reported
//! but is not a task failure.
//!
//! ## Settling
//!
//! Starts after every submitted task has settled. Scores each configured
//! pair, ranks the signals, hands the top-N to the alert dispatcher, and
//! publishes the health snapshot.

use super::adapters::{system_clock, Adapter, AdapterRegistry, HeadlineSource, NowFn};
use super::alerts::AlertDispatcher;
use super::backoff::{with_retry, ExponentialBackoff};
use super::config::PipelineConfig;
use super::db::TimeSeriesStore;
use super::engine::{rank, SignalEngine};
use super::error::{AdapterError, TaskError};
use super::health::{HealthHandle, HEALTH_KEY};
use super::normalizer::normalize;
use super::types::{Observation, ObservationKind, PairId, Signal};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinError, JoinSet};

const FETCH_RETRY_BASE_MS: u64 = 250;
const FETCH_RETRY_MAX_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Settling,
}

/// Knobs the scheduler needs from `PipelineConfig`
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub pairs: Vec<PairId>,
    pub cycle_interval: Duration,
    pub max_in_flight: usize,
    pub fetch_timeout: Duration,
    pub fetch_attempts: u32,
    pub alert_top_n: usize,
}

impl SchedulerSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            pairs: config.pairs.clone(),
            cycle_interval: config.cycle_interval,
            max_in_flight: config.max_in_flight,
            fetch_timeout: config.fetch_timeout,
            fetch_attempts: config.fetch_attempts,
            alert_top_n: config.alert_top_n,
        }
    }
}

/// One failed ingestion task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub kind: ObservationKind,
    pub exchange: String,
    pub pair: String,
    pub error: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.pair, self.error)
    }
}

/// Outcome of one cycle; logged and dispatched, never persisted
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub as_of: DateTime<Utc>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<TaskFailure>,
    /// Observation rows upserted across all tasks
    pub rows_written: usize,
    pub signals_written: usize,
    pub headlines_written: usize,
    /// Headline feed failure, if any
    pub headline_error: Option<String>,
    /// Ranked, truncated to `alert_top_n`
    pub top_signals: Vec<Signal>,
    /// Submission stopped early
    pub cancelled: bool,
}

impl CycleReport {
    fn new(as_of: DateTime<Utc>) -> Self {
        Self {
            as_of,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            failures: Vec::new(),
            rows_written: 0,
            signals_written: 0,
            headlines_written: 0,
            headline_error: None,
            top_signals: Vec::new(),
            cancelled: false,
        }
    }
}

/// Receivers consumed by `Scheduler::run`
pub struct SchedulerSignals {
    cancel: watch::Receiver<bool>,
    triggers: mpsc::Receiver<()>,
}

/// Control surface for a running scheduler loop
#[derive(Clone)]
pub struct SchedulerHandle {
    trigger_tx: mpsc::Sender<()>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl SchedulerHandle {
    pub fn new() -> (SchedulerHandle, SchedulerSignals) {
        // capacity 1: triggers arriving during a cycle coalesce
        let (trigger_tx, triggers) = mpsc::channel(1);
        let (cancel_tx, cancel) = watch::channel(false);
        (
            SchedulerHandle {
                trigger_tx,
                cancel_tx: Arc::new(cancel_tx),
            },
            SchedulerSignals { cancel, triggers },
        )
    }

    /// Request an on-demand cycle; false if one is already queued
    pub fn trigger(&self) -> bool {
        self.trigger_tx.try_send(()).is_ok()
    }

    /// Stop submitting tasks, settle the in-flight cycle, then exit `run`
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }
}

pub struct Scheduler {
    registry: AdapterRegistry,
    store: Arc<dyn TimeSeriesStore>,
    engine: Arc<SignalEngine>,
    dispatcher: Arc<dyn AlertDispatcher>,
    settings: SchedulerSettings,
    health: HealthHandle,
    state_tx: watch::Sender<SchedulerState>,
    now_fn: NowFn,
}

impl Scheduler {
    pub fn new(
        registry: AdapterRegistry,
        store: Arc<dyn TimeSeriesStore>,
        engine: Arc<SignalEngine>,
        dispatcher: Arc<dyn AlertDispatcher>,
        settings: SchedulerSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        Self {
            registry,
            store,
            engine,
            dispatcher,
            settings,
            health: HealthHandle::new(),
            state_tx,
            now_fn: system_clock(),
        }
    }

    /// Replace the clock used to stamp cycles
    pub fn with_clock(mut self, now_fn: NowFn) -> Self {
        self.now_fn = now_fn;
        self
    }

    pub fn state(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    pub fn health(&self) -> HealthHandle {
        self.health.clone()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state_tx.send_replace(state);
    }

    /// Tick loop; returns after `SchedulerHandle::cancel` or once every
    /// handle has been dropped
    pub async fn run(&self, signals: SchedulerSignals) {
        let SchedulerSignals {
            mut cancel,
            mut triggers,
        } = signals;

        let mut ticker = tokio::time::interval(self.settings.cycle_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        log::info!(
            "⏰ Scheduler started (interval: {}s, max in flight: {})",
            self.settings.cycle_interval.as_secs(),
            self.settings.max_in_flight
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = triggers.recv() => {
                    log::info!("▶️  On-demand cycle requested");
                }
                result = cancel.changed() => {
                    if result.is_err() || *cancel.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if *cancel.borrow() {
                break;
            }

            let report = self.run_cycle((self.now_fn)(), cancel.clone()).await;
            log_report(&report);
            if report.cancelled {
                break;
            }
        }

        log::info!("🛑 Scheduler stopped");
    }

    /// Run one full ingestion + scoring cycle stamped `as_of`
    pub async fn run_cycle(&self, as_of: DateTime<Utc>, mut cancel: watch::Receiver<bool>) -> CycleReport {
        let mut report = CycleReport::new(as_of);

        self.set_state(SchedulerState::Running);
        log::info!("🔄 Cycle {} started", as_of.format("%Y-%m-%d %H:%M:%S"));

        let semaphore = Arc::new(Semaphore::new(self.settings.max_in_flight.max(1)));
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();

        'submit: for kind in self.registry.kinds() {
            let Some(adapter) = self.registry.get(kind) else {
                continue;
            };
            for pair in &self.settings.pairs {
                if *cancel.borrow() {
                    report.cancelled = true;
                    break 'submit;
                }

                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'submit,
                    },
                    _ = cancelled(&mut cancel) => {
                        report.cancelled = true;
                        break 'submit;
                    }
                };

                let job = IngestJob {
                    kind,
                    pair: pair.clone(),
                    adapter: adapter.clone(),
                    store: self.store.clone(),
                    fetch_timeout: self.settings.fetch_timeout,
                    fetch_attempts: self.settings.fetch_attempts,
                };
                report.attempted += 1;
                tasks.spawn(async move {
                    let _permit = permit;
                    job.run_isolated().await
                });
            }
        }

        if report.cancelled {
            log::warn!(
                "⚠️  Cycle cancelled after {} submissions, settling with completed work",
                report.attempted
            );
        }

        // barrier: scoring starts only once every submitted task has settled
        while let Some(joined) = tasks.join_next().await {
            fold_joined(&mut report, joined);
        }

        if !report.cancelled {
            if let Some(source) = self.registry.headlines() {
                self.ingest_headlines(source, &mut report).await;
            }
        }

        self.set_state(SchedulerState::Settling);
        self.settle(&mut report).await;
        self.set_state(SchedulerState::Idle);

        report
    }

    async fn ingest_headlines(&self, source: Arc<dyn HeadlineSource>, report: &mut CycleReport) {
        let backoff = ExponentialBackoff::new(
            FETCH_RETRY_BASE_MS,
            FETCH_RETRY_MAX_MS,
            self.settings.fetch_attempts.saturating_sub(1),
        );
        let timeout = self.settings.fetch_timeout;
        let fetched = with_retry(backoff, AdapterError::is_retryable, || {
            let source = source.clone();
            async move {
                match tokio::time::timeout(timeout, source.fetch_headlines()).await {
                    Ok(result) => result,
                    Err(_) => Err(AdapterError::Unavailable(format!(
                        "fetch timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
        })
        .await
        .map_err(|(e, _)| TaskError::from(e));

        let result = match fetched {
            Ok(headlines) => self.store.upsert_headlines(headlines).await.map_err(TaskError::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(written) => {
                log::debug!("   headlines {}: {} rows", source.source(), written);
                report.headlines_written = written;
            }
            Err(e) => {
                log::error!("❌ headlines {} failed: {}", source.source(), e);
                report.headline_error = Some(e.to_string());
            }
        }
    }

    async fn settle(&self, report: &mut CycleReport) {
        let mut signals = Vec::new();
        for pair in &self.settings.pairs {
            let qualified = pair.qualified();
            match self.engine.record(&qualified, report.as_of).await {
                Ok(Some(signal)) => signals.push(signal),
                Ok(None) => {}
                Err(e) => log::error!("❌ Scoring {} failed: {}", qualified, e),
            }
        }
        report.signals_written = signals.len();
        report.top_signals = rank(signals, self.settings.alert_top_n);

        if !report.top_signals.is_empty() && !self.dispatcher.notify(&report.top_signals) {
            log::debug!("🔕 Top signals not queued for delivery");
        }

        let mut errors: Vec<String> = report.failures.iter().map(|f| f.to_string()).collect();
        if let Some(e) = &report.headline_error {
            errors.push(format!("headlines: {}", e));
        }
        let snapshot = self
            .health
            .record(report.as_of, report.succeeded, report.failed, errors)
            .await;
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(e) = self.store.put_kv(HEALTH_KEY, json).await {
                    log::warn!("⚠️  Health snapshot not published: {}", e);
                }
            }
            Err(e) => log::warn!("⚠️  Health snapshot not serialized: {}", e),
        }
    }
}

/// Count one settled task into the report
fn fold_joined(report: &mut CycleReport, joined: Result<TaskOutcome, JoinError>) {
    match joined {
        Ok(outcome) => match outcome.result {
            Ok(rows) => {
                report.succeeded += 1;
                report.rows_written += rows;
            }
            Err(e) => {
                log::error!("❌ {} {} failed: {}", outcome.kind, outcome.pair.qualified(), e);
                report.failed += 1;
                report.failures.push(TaskFailure {
                    kind: outcome.kind,
                    exchange: outcome.pair.exchange.clone(),
                    pair: outcome.pair.qualified(),
                    error: e.to_string(),
                });
            }
        },
        // kind and pair are lost with the task; counted only
        Err(e) => {
            log::error!("❌ Ingestion task aborted: {}", e);
            report.failed += 1;
        }
    }
}

/// Resolves once the cancel flag is set; never if the sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct TaskOutcome {
    kind: ObservationKind,
    pair: PairId,
    result: Result<usize, TaskError>,
}

struct IngestJob {
    kind: ObservationKind,
    pair: PairId,
    adapter: Arc<dyn Adapter>,
    store: Arc<dyn TimeSeriesStore>,
    fetch_timeout: Duration,
    fetch_attempts: u32,
}

impl IngestJob {
    /// Run on its own task so a panic becomes a recorded failure
    async fn run_isolated(self) -> TaskOutcome {
        let kind = self.kind;
        let pair = self.pair.clone();
        let result = match tokio::spawn(self.run()).await {
            Ok(result) => result,
            Err(e) => Err(TaskError::Panicked {
                kind,
                reason: e.to_string(),
            }),
        };
        TaskOutcome { kind, pair, result }
    }

    async fn run(self) -> Result<usize, TaskError> {
        let qualified = self.pair.qualified();
        let since = self.store.latest_ts(self.kind, &qualified).await?;

        let backoff = ExponentialBackoff::new(
            FETCH_RETRY_BASE_MS,
            FETCH_RETRY_MAX_MS,
            self.fetch_attempts.saturating_sub(1),
        );
        let raw = with_retry(backoff, AdapterError::is_retryable, || self.fetch_once(since))
            .await
            .map_err(|(e, _)| e)?;

        let batch = normalize(self.kind, &qualified, since, raw);
        if batch.is_empty() {
            log::debug!("   {} {}: nothing new ({} dropped)", self.kind, qualified, batch.dropped);
            return Ok(0);
        }

        let written = self.store.upsert(self.kind, batch.observations).await?;
        log::debug!("   {} {}: {} rows", self.kind, qualified, written);
        Ok(written)
    }

    async fn fetch_once(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Observation>, AdapterError> {
        let fetch = self.adapter.fetch(&self.pair.exchange, &self.pair.symbol, since);
        match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Unavailable(format!(
                "fetch timed out after {}ms",
                self.fetch_timeout.as_millis()
            ))),
        }
    }
}

fn log_report(report: &CycleReport) {
    let glyph = if report.failed == 0 && report.headline_error.is_none() { "✅" } else { "⚠️ " };
    log::info!(
        "{} Cycle {}: {}/{} tasks ok, {} failed, {} rows, {} headlines, {} signals",
        glyph,
        report.as_of.format("%H:%M:%S"),
        report.succeeded,
        report.attempted,
        report.failed,
        report.rows_written,
        report.headlines_written,
        report.signals_written
    );
    for (i, signal) in report.top_signals.iter().enumerate() {
        let branch = if i + 1 == report.top_signals.len() { "└─" } else { "├─" };
        log::info!(
            "   {} #{} {} score {:+.3} ({}, {})",
            branch,
            i + 1,
            signal.pair,
            signal.score,
            signal.regime.as_str(),
            signal.bias.as_str()
        );
    }
}
