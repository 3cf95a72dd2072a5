//! ATR-like volatility derived from hourly candles
//!
//! TR_i = max(high_i - low_i, |high_i - close_{i-1}|, |low_i - close_{i-1}|)
//! ATR_i = mean(TR over the last `window` bars)
//!
//! A bar gets an ATR only once `window` true ranges (each needing a prior
//! close) are available, so the source is queried `window + 1` bars
//! earlier than `since`.

use super::Adapter;
use crate::pipeline::error::AdapterError;
use crate::pipeline::types::{Observation, ObservationKind, ObservationValues};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_ATR_WINDOW: usize = 14;
const BAR_SECS: i64 = 3600;

pub struct AtrAdapter {
    source: Arc<dyn Adapter>,
    window: usize,
}

impl AtrAdapter {
    pub fn new(source: Arc<dyn Adapter>) -> Self {
        Self::with_window(source, DEFAULT_ATR_WINDOW)
    }

    pub fn with_window(source: Arc<dyn Adapter>, window: usize) -> Self {
        Self {
            source,
            window: window.max(1),
        }
    }
}

/// Rolling ATR over a candle series (oldest first)
///
/// Non-candle observations are ignored.
pub fn compute_atr(candles: &[Observation], window: usize) -> Vec<Observation> {
    let mut out = Vec::new();
    let mut ranges: VecDeque<f64> = VecDeque::with_capacity(window);
    let mut prev_close: Option<f64> = None;

    for obs in candles {
        let (high, low, close) = match obs.values {
            ObservationValues::Candle { high, low, close, .. } => (high, low, close),
            _ => continue,
        };

        if let Some(pc) = prev_close {
            let tr = (high - low).max((high - pc).abs()).max((low - pc).abs());
            if ranges.len() == window {
                ranges.pop_front();
            }
            ranges.push_back(tr);

            if ranges.len() == window {
                let atr = ranges.iter().sum::<f64>() / window as f64;
                out.push(Observation::new(obs.pair.clone(), obs.ts, ObservationValues::Volatility { atr }));
            }
        }
        prev_close = Some(close);
    }
    out
}

#[async_trait]
impl Adapter for AtrAdapter {
    fn kind(&self) -> ObservationKind {
        ObservationKind::Volatility
    }

    async fn fetch(
        &self,
        exchange: &str,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, AdapterError> {
        let warmup = since.map(|s| s - Duration::seconds((self.window as i64 + 1) * BAR_SECS));
        let candles = self.source.fetch(exchange, symbol, warmup).await?;

        Ok(compute_atr(&candles, self.window)
            .into_iter()
            .filter(|o| since.map_or(true, |s| o.ts > s))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::adapters::{NowFn, SyntheticAdapter};
    use crate::pipeline::types::ts_from_secs;

    fn bar(i: i64, high: f64, low: f64, close: f64) -> Observation {
        Observation::new(
            "binance:BTC/USDT",
            ts_from_secs(i * BAR_SECS).unwrap(),
            ObservationValues::Candle {
                open: close,
                high,
                low,
                close,
                volume: 1.0,
            },
        )
    }

    fn atr_of(o: &Observation) -> f64 {
        match o.values {
            ObservationValues::Volatility { atr } => atr,
            _ => panic!("expected volatility"),
        }
    }

    #[test]
    fn test_true_range_uses_previous_close() {
        // gap up: prev close 10, bar 12..13 -> TR = 3
        let candles = vec![bar(0, 11.0, 9.0, 10.0), bar(1, 13.0, 12.0, 12.5), bar(2, 13.0, 12.0, 12.5)];
        let atr = compute_atr(&candles, 2);

        assert_eq!(atr.len(), 1);
        assert_eq!(atr[0].ts, candles[2].ts);
        // (3 + 1) / 2
        assert!((atr_of(&atr[0]) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_needs_full_window() {
        let candles: Vec<Observation> = (0..14).map(|i| bar(i, 2.0, 1.0, 1.5)).collect();
        assert!(compute_atr(&candles, 14).is_empty());

        let candles: Vec<Observation> = (0..15).map(|i| bar(i, 2.0, 1.0, 1.5)).collect();
        let atr = compute_atr(&candles, 14);
        assert_eq!(atr.len(), 1);
        assert!((atr_of(&atr[0]) - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_incremental_fetch_has_warmup() {
        let now = ts_from_secs(1_700_000_000).unwrap();
        let clock: NowFn = Arc::new(move || now);
        let adapter = AtrAdapter::new(Arc::new(SyntheticAdapter::candles(clock)));

        let all = adapter.fetch("binance", "ETH/USDT", None).await.unwrap();
        // 200 bars of backfill, first 14 spent on warmup
        assert_eq!(all.len(), 200 - DEFAULT_ATR_WINDOW);
        assert!(all.iter().all(|o| atr_of(o) > 0.0));

        let since = all[all.len() - 3].ts;
        let newer = adapter.fetch("binance", "ETH/USDT", Some(since)).await.unwrap();
        assert_eq!(newer.len(), 2);
        assert_eq!(newer, all[all.len() - 2..].to_vec());
    }
}
