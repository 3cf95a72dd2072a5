//! Data adapters, one per observation kind
//!
//! Every adapter implements the same capability:
//! `fetch(exchange, symbol, since) -> observations, newest last`.
//!
//! - `since = None`: backfill bounded by an adapter-defined lookback
//! - `since = Some(t)`: incremental, only observations with `ts > t`
//!
//! Implementations are selected through `AdapterRegistry`, a mapping from
//! kind to implementation, plus an optional market-wide `HeadlineSource`.
//! Synthetic variants exist for every kind so the pipeline runs without
//! credentials or network access.

pub mod exchanges;
pub mod headlines;
pub mod sentiment;
pub mod synthetic;
pub mod volatility;

use super::config::{AdapterMode, PipelineConfig};
use super::error::AdapterError;
use super::types::{Observation, ObservationKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use exchanges::ExchangeAdapter;
pub use headlines::HeadlineSource;
pub use sentiment::CryptoPanicAdapter;
pub use synthetic::{SyntheticAdapter, SyntheticHeadlines};
pub use volatility::AtrAdapter;

/// Clock used by adapters that generate or bucket timestamps
pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> NowFn {
    Arc::new(Utc::now)
}

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Kind of observation this adapter produces
    fn kind(&self) -> ObservationKind;

    /// Fetch observations for one (exchange, symbol)
    ///
    /// Returned observations carry the exchange-qualified pair
    /// (`exchange:symbol`) and are ordered oldest first.
    ///
    /// Errors:
    /// - `AdapterError::Unavailable` on transport/auth/rate-limit failures
    /// - `AdapterError::Data` on malformed payloads
    async fn fetch(
        &self,
        exchange: &str,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, AdapterError>;
}

/// Kind -> adapter mapping driving the scheduler's fan-out
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<ObservationKind, Arc<dyn Adapter>>,
    headlines: Option<Arc<dyn HeadlineSource>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind (replaces any previous one)
    pub fn insert(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn with_headlines(mut self, source: Arc<dyn HeadlineSource>) -> Self {
        self.headlines = Some(source);
        self
    }

    pub fn headlines(&self) -> Option<Arc<dyn HeadlineSource>> {
        self.headlines.clone()
    }

    pub fn get(&self, kind: ObservationKind) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ObservationKind> {
        self.adapters.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Synthetic adapters for every kind
    pub fn synthetic(now_fn: NowFn) -> Self {
        let candles: Arc<dyn Adapter> = Arc::new(SyntheticAdapter::candles(now_fn.clone()));
        Self::new()
            .with(candles.clone())
            .with(Arc::new(SyntheticAdapter::funding(now_fn.clone())))
            .with(Arc::new(SyntheticAdapter::open_interest(now_fn.clone())))
            .with(Arc::new(AtrAdapter::new(candles)))
            .with(Arc::new(SyntheticAdapter::sentiment(now_fn.clone())))
            .with_headlines(Arc::new(SyntheticHeadlines::new(now_fn)))
    }

    /// Exchange REST adapters; sentiment falls back to synthetic without a key
    pub fn live(config: &PipelineConfig) -> Self {
        let timeout = config.fetch_timeout;
        let candles: Arc<dyn Adapter> = Arc::new(ExchangeAdapter::new(ObservationKind::Candle, timeout));

        let (sentiment, headlines): (Arc<dyn Adapter>, Arc<dyn HeadlineSource>) =
            match &config.cryptopanic_api_key {
                Some(key) => {
                    let cryptopanic = Arc::new(CryptoPanicAdapter::new(key.clone(), timeout, system_clock()));
                    let sentiment: Arc<dyn Adapter> = cryptopanic.clone();
                    let headlines: Arc<dyn HeadlineSource> = cryptopanic;
                    (sentiment, headlines)
                }
                None => {
                    log::warn!("⚠️  CRYPTOPANIC_API_KEY not set, using synthetic sentiment and headlines");
                    let sentiment: Arc<dyn Adapter> = Arc::new(SyntheticAdapter::sentiment(system_clock()));
                    let headlines: Arc<dyn HeadlineSource> = Arc::new(SyntheticHeadlines::new(system_clock()));
                    (sentiment, headlines)
                }
            };

        Self::new()
            .with(candles.clone())
            .with(Arc::new(ExchangeAdapter::new(ObservationKind::Funding, timeout)))
            .with(Arc::new(ExchangeAdapter::new(ObservationKind::OpenInterest, timeout)))
            .with(Arc::new(AtrAdapter::new(candles)))
            .with(sentiment)
            .with_headlines(headlines)
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        match config.adapter_mode {
            AdapterMode::Mock => Self::synthetic(system_clock()),
            AdapterMode::Live => Self::live(config),
        }
    }
}

/// Floor a timestamp to a multiple of `step_secs`
pub(crate) fn floor_ts(ts: DateTime<Utc>, step_secs: i64) -> i64 {
    ts.timestamp().div_euclid(step_secs) * step_secs
}
