//! Synthetic adapters for running the pipeline without live credentials
//!
//! Values are a deterministic function of (kind, pair, bar timestamp), so
//! re-fetching a bar always yields the same numbers. Bars are aligned to
//! the adapter's step and only completed bars (ts <= now - step) are emitted.
//! Volatility has no synthetic series of its own: `AtrAdapter` derives it
//! from synthetic candles.

use super::headlines::{tracked_keywords, HeadlineSource};
use super::sentiment::KEYWORDS;
use super::{floor_ts, Adapter, NowFn};
use crate::pipeline::error::AdapterError;
use crate::pipeline::types::{ts_from_secs, Headline, Observation, ObservationKind, ObservationValues};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

const HOUR: i64 = 3600;

/// Hourly headlines returned per fetch
const HEADLINE_BACKFILL: i64 = 6;

const HEADLINE_TITLES: [&str; 6] = [
    "Market wobbles as OI surges; funding flips negative",
    "Bitcoin rally extends as shorts get rekt",
    "Liquidation cascade hits altcoins after sharp drop",
    "Open interest climbs into the weekly close",
    "Funding cools as traders de-risk ahead of CPI",
    "Margin call wave follows overnight crash",
];

/// Series a synthetic adapter can generate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Series {
    Candle,
    Funding,
    OpenInterest,
    Sentiment,
}

impl Series {
    fn kind(self) -> ObservationKind {
        match self {
            Series::Candle => ObservationKind::Candle,
            Series::Funding => ObservationKind::Funding,
            Series::OpenInterest => ObservationKind::OpenInterest,
            Series::Sentiment => ObservationKind::Sentiment,
        }
    }
}

pub struct SyntheticAdapter {
    series: Series,
    now_fn: NowFn,
    step_secs: i64,
    backfill_bars: i64,
}

impl SyntheticAdapter {
    /// Hourly OHLCV, 200 bars of backfill
    pub fn candles(now_fn: NowFn) -> Self {
        Self::new(Series::Candle, now_fn, HOUR, 200)
    }

    /// 8h funding prints, two weeks of backfill
    pub fn funding(now_fn: NowFn) -> Self {
        Self::new(Series::Funding, now_fn, 8 * HOUR, 42)
    }

    /// Hourly open interest, two weeks of backfill
    pub fn open_interest(now_fn: NowFn) -> Self {
        Self::new(Series::OpenInterest, now_fn, HOUR, 336)
    }

    /// Hourly sentiment buckets, two days of backfill
    pub fn sentiment(now_fn: NowFn) -> Self {
        Self::new(Series::Sentiment, now_fn, HOUR, 48)
    }

    fn new(series: Series, now_fn: NowFn, step_secs: i64, backfill_bars: i64) -> Self {
        Self {
            series,
            now_fn,
            step_secs,
            backfill_bars,
        }
    }

    /// Bar timestamps to emit, oldest first
    fn bar_times(&self, since: Option<DateTime<Utc>>) -> Vec<i64> {
        let last = floor_ts((self.now_fn)(), self.step_secs) - self.step_secs;
        let earliest = last - (self.backfill_bars - 1) * self.step_secs;
        let first = match since {
            // first aligned bar strictly after `since`
            Some(since) => (floor_ts(since, self.step_secs) + self.step_secs).max(earliest),
            None => earliest,
        };

        let mut times = Vec::new();
        let mut t = first;
        while t <= last {
            times.push(t);
            t += self.step_secs;
        }
        times
    }

    fn values_at(&self, pair: &str, t: i64) -> ObservationValues {
        let base = pair_base(pair);
        let kind = self.series.kind();
        match self.series {
            Series::Candle => self.candle_at(pair, base, t),
            Series::Funding => {
                let mut rng = rng_for(pair, kind, t);
                let cycle = ((t / self.step_secs) as f64 / 9.0 + phase(pair)).sin();
                ObservationValues::Funding {
                    rate: 0.0001 * cycle + rng.gen_range(-0.00005..0.00005),
                }
            }
            Series::OpenInterest => {
                let mut rng = rng_for(pair, kind, t);
                let cycle = ((t / HOUR) as f64 / 40.0 + phase(pair)).sin();
                ObservationValues::OpenInterest {
                    value_usd: base * 20_000.0 * (1.0 + 0.1 * cycle + rng.gen_range(-0.02..0.02)),
                }
            }
            Series::Sentiment => {
                let mut rng = rng_for(pair, kind, t);
                let mentions: i64 = rng.gen_range(5..50);
                let keywords: BTreeMap<String, i64> = KEYWORDS
                    .iter()
                    .map(|k| (k.to_string(), rng.gen_range(0..=mentions / 2)))
                    .collect();
                ObservationValues::Sentiment {
                    mentions,
                    score_norm: rng.gen_range(-1.0..1.0),
                    keywords,
                }
            }
        }
    }

    fn candle_at(&self, pair: &str, base: f64, t: i64) -> ObservationValues {
        let open = synthetic_close(pair, base, t - self.step_secs);
        let close = synthetic_close(pair, base, t);
        let mut rng = rng_for(pair, ObservationKind::Candle, t);
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.006));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.006));
        let volume = (base.sqrt() * 1_000.0) * rng.gen_range(0.5..1.5);
        ObservationValues::Candle {
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

#[async_trait]
impl Adapter for SyntheticAdapter {
    fn kind(&self) -> ObservationKind {
        self.series.kind()
    }

    async fn fetch(
        &self,
        exchange: &str,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, AdapterError> {
        let pair = format!("{}:{}", exchange, symbol);

        self.bar_times(since)
            .into_iter()
            .map(|t| {
                let ts = ts_from_secs(t)
                    .ok_or_else(|| AdapterError::Data(format!("timestamp out of range: {}", t)))?;
                Ok(Observation::new(pair.clone(), ts, self.values_at(&pair, t)))
            })
            .collect()
    }
}

/// One deterministic headline per completed hour
pub struct SyntheticHeadlines {
    now_fn: NowFn,
}

impl SyntheticHeadlines {
    pub fn new(now_fn: NowFn) -> Self {
        Self { now_fn }
    }
}

#[async_trait]
impl HeadlineSource for SyntheticHeadlines {
    fn source(&self) -> &'static str {
        "synthetic"
    }

    async fn fetch_headlines(&self) -> Result<Vec<Headline>, AdapterError> {
        let last = floor_ts((self.now_fn)(), HOUR) - HOUR;
        (0..HEADLINE_BACKFILL)
            .rev()
            .map(|back| {
                let t = last - back * HOUR;
                let ts = ts_from_secs(t)
                    .ok_or_else(|| AdapterError::Data(format!("timestamp out of range: {}", t)))?;
                let pick = fnv1a(format!("headline|{}", t).as_bytes()) as usize % HEADLINE_TITLES.len();
                let title = HEADLINE_TITLES[pick];
                Ok(Headline {
                    ts,
                    source: self.source().to_string(),
                    title: title.to_string(),
                    url: format!("https://example.com/synthetic/{}", t),
                    keywords: tracked_keywords(title),
                })
            })
            .collect()
    }
}

/// FNV-1a, stable across runs and platforms
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn rng_for(pair: &str, kind: ObservationKind, t: i64) -> StdRng {
    let key = format!("{}|{}|{}", pair, kind.as_str(), t);
    StdRng::seed_from_u64(fnv1a(key.as_bytes()))
}

fn pair_base(pair: &str) -> f64 {
    1.0 + (fnv1a(pair.as_bytes()) % 50_000) as f64
}

fn phase(pair: &str) -> f64 {
    (fnv1a(pair.as_bytes()) % 628) as f64 / 100.0
}

fn synthetic_close(pair: &str, base: f64, t: i64) -> f64 {
    let swing = ((t / HOUR) as f64 / 17.0 + phase(pair)).sin();
    let mut rng = rng_for(pair, ObservationKind::Candle, t ^ 0x5eed);
    base * (1.0 + 0.05 * swing + rng.gen_range(-0.01..0.01))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn clock(secs: i64) -> NowFn {
        let now = ts_from_secs(secs).unwrap();
        Arc::new(move || now)
    }

    const NOW: i64 = 1_700_000_000; // 22:13:20 UTC

    #[tokio::test]
    async fn test_backfill_is_bounded_and_ordered() {
        let adapter = SyntheticAdapter::candles(clock(NOW));
        let bars = adapter.fetch("binance", "BTC/USDT", None).await.unwrap();

        assert_eq!(bars.len(), 200);
        assert!(bars.windows(2).all(|w| w[0].ts < w[1].ts));
        assert!(bars.iter().all(|b| b.pair == "binance:BTC/USDT"));
        // last completed bar opened one hour before the current bucket
        assert_eq!(bars.last().unwrap().ts.timestamp(), floor_ts(ts_from_secs(NOW).unwrap(), HOUR) - HOUR);
    }

    #[tokio::test]
    async fn test_incremental_fetch_is_strictly_after_since() {
        let adapter = SyntheticAdapter::candles(clock(NOW));
        let all = adapter.fetch("binance", "BTC/USDT", None).await.unwrap();
        let since = all[all.len() - 4].ts;

        let newer = adapter.fetch("binance", "BTC/USDT", Some(since)).await.unwrap();
        assert_eq!(newer.len(), 3);
        assert!(newer.iter().all(|o| o.ts > since));

        let none = adapter
            .fetch("binance", "BTC/USDT", Some(all.last().unwrap().ts))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_values_are_deterministic_per_bar() {
        let a = SyntheticAdapter::open_interest(clock(NOW));
        let b = SyntheticAdapter::open_interest(clock(NOW + 7 * HOUR));

        let first = a.fetch("bybit", "ETH/USDT", None).await.unwrap();
        let later = b.fetch("bybit", "ETH/USDT", None).await.unwrap();

        let shared = first.last().unwrap();
        let same_bar = later.iter().find(|o| o.ts == shared.ts).unwrap();
        assert_eq!(shared, same_bar);
    }

    #[tokio::test]
    async fn test_candles_are_well_formed() {
        let adapter = SyntheticAdapter::candles(clock(NOW));
        for bar in adapter.fetch("binance", "SOL/USDT", None).await.unwrap() {
            match bar.values {
                ObservationValues::Candle { open, high, low, close, volume } => {
                    assert!(high >= open.max(close));
                    assert!(low <= open.min(close));
                    assert!(low > 0.0 && volume > 0.0);
                }
                other => panic!("unexpected values {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_synthetic_headlines_are_stable_per_hour() {
        let a = SyntheticHeadlines::new(clock(NOW));
        let b = SyntheticHeadlines::new(clock(NOW + HOUR));

        let first = a.fetch_headlines().await.unwrap();
        let later = b.fetch_headlines().await.unwrap();

        assert_eq!(first.len(), HEADLINE_BACKFILL as usize);
        assert!(first.windows(2).all(|w| w[0].ts < w[1].ts));
        assert!(first.iter().all(|h| h.source == "synthetic"));
        // one hour later the window slides by one; overlapping items match
        assert_eq!(first[1..], later[..later.len() - 1]);
    }

    #[tokio::test]
    async fn test_sentiment_fields_in_range() {
        let adapter = SyntheticAdapter::sentiment(clock(NOW));
        let obs = adapter.fetch("binance", "BTC/USDT", None).await.unwrap();
        assert_eq!(obs.len(), 48);
        for o in obs {
            if let ObservationValues::Sentiment { mentions, score_norm, keywords } = o.values {
                assert!((5..50).contains(&mentions));
                assert!((-1.0..1.0).contains(&score_norm));
                assert_eq!(keywords.len(), KEYWORDS.len());
            } else {
                panic!("expected sentiment");
            }
        }
    }
}
