//! # Market-risk ingestion and scoring pipeline
//!
//! Ingests market-risk indicators (candles, funding, open interest,
//! volatility, sentiment) for a configured set of exchange-qualified pairs,
//! stores them as time-series rows, scores every pair once per cycle and
//! pushes the top signals to an alert channel.
//!
//! ## Data flow per cycle
//!
//! ```text
//! Scheduler (Idle -> Running)
//!     ↓ bounded fan-out: kind x exchange:pair
//! Adapter::fetch -> normalizer::normalize -> TimeSeriesStore::upsert
//!     ↓ barrier (Running -> Settling)
//! SignalEngine::record per pair -> signals table
//!     ↓
//! engine::rank -> AlertDispatcher::notify -> health snapshot (-> Idle)
//! ```
//!
//! ## Ownership
//!
//! - Ingestion tasks are the only writers of observation tables
//! - `SignalEngine` is the only writer of `signals`
//! - `candles_1h` is a read-only rollup maintained by SQLite
//!
//! ## Module Organization
//!
//! - `types` - Observations, pairs, signals
//! - `error` - Error taxonomy per boundary
//! - `config` - Environment-driven configuration
//! - `adapters` - Adapter trait, registry, synthetic and live sources
//! - `normalizer` - Validation, dedup and `since` cutoff
//! - `backoff` - Exponential backoff and bounded retry
//! - `db` - SQLite store, migrations
//! - `engine` - Normalisation, composite score, regime, ranking
//! - `alerts` - Alert dispatchers
//! - `health` - Liveness snapshot
//! - `scheduler` - Cycle state machine

pub mod adapters;
pub mod alerts;
pub mod backoff;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod health;
pub mod normalizer;
pub mod scheduler;
pub mod types;

pub use adapters::{Adapter, AdapterRegistry};
pub use alerts::{dispatcher_from_config, AlertDispatcher, NullDispatcher, TelegramDispatcher};
pub use config::PipelineConfig;
pub use db::{run_schema_migrations, SqliteStore, StoreOptions, TimeSeriesStore};
pub use engine::SignalEngine;
pub use error::{AdapterError, ConfigError, NotificationError, StoreError, TaskError};
pub use health::{HealthHandle, HealthSnapshot};
pub use scheduler::{CycleReport, Scheduler, SchedulerHandle, SchedulerSettings, SchedulerState};
pub use types::{Observation, ObservationKind, ObservationValues, PairId, Signal};
