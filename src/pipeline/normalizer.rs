//! Raw adapter output -> store-ready batch
//!
//! Rules, applied in order:
//! 1. drop rows for another pair or another kind
//! 2. drop rows at or before `since` (already stored)
//! 3. drop rows with non-finite or out-of-range values
//! 4. de-duplicate on `(kind, pair, ts)`, last occurrence wins
//! 5. sort ascending by `ts`
//!
//! Every drop is logged; nothing here fails the task.

use super::types::{Observation, ObservationKind, ObservationValues};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Funding prints beyond +/-100% per interval are treated as garbage
const MAX_ABS_FUNDING: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    /// Unique by ts, ascending
    pub observations: Vec<Observation>,
    /// Rows rejected by validation or the `since` cutoff
    pub dropped: usize,
}

impl NormalizedBatch {
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }
}

pub fn normalize(
    kind: ObservationKind,
    pair: &str,
    since: Option<DateTime<Utc>>,
    raw: Vec<Observation>,
) -> NormalizedBatch {
    let mut dropped = 0;
    let mut by_ts: BTreeMap<DateTime<Utc>, Observation> = BTreeMap::new();

    for obs in raw {
        if obs.pair != pair {
            log::warn!("⚠️  Dropping {} row for {}: expected pair {}", kind, obs.pair, pair);
            dropped += 1;
            continue;
        }
        if obs.kind() != kind {
            log::warn!("⚠️  Dropping {} row in {} batch for {}", obs.kind(), kind, pair);
            dropped += 1;
            continue;
        }
        if since.map_or(false, |s| obs.ts <= s) {
            dropped += 1;
            continue;
        }
        if let Err(reason) = validate(&obs) {
            log::warn!("⚠️  Dropping {} {} @ {}: {}", kind, pair, obs.ts, reason);
            dropped += 1;
            continue;
        }
        // later duplicates replace earlier ones
        by_ts.insert(obs.ts, obs);
    }

    NormalizedBatch {
        observations: by_ts.into_values().collect(),
        dropped,
    }
}

/// Range checks per kind
pub fn validate(obs: &Observation) -> Result<(), String> {
    if let Some((field, _)) = obs.numeric_fields().into_iter().find(|(_, v)| !v.is_finite()) {
        return Err(format!("{} is not finite", field));
    }

    match &obs.values {
        ObservationValues::Candle {
            open,
            high,
            low,
            close,
            volume,
        } => {
            if [*open, *high, *low, *close].iter().any(|p| *p <= 0.0) {
                return Err("prices must be positive".to_string());
            }
            if high < low {
                return Err(format!("high {} below low {}", high, low));
            }
            if *volume < 0.0 {
                return Err("negative volume".to_string());
            }
        }
        ObservationValues::Funding { rate } => {
            if rate.abs() >= MAX_ABS_FUNDING {
                return Err(format!("funding rate {} out of range", rate));
            }
        }
        ObservationValues::OpenInterest { value_usd } => {
            if *value_usd < 0.0 {
                return Err("negative open interest".to_string());
            }
        }
        ObservationValues::Volatility { atr } => {
            if *atr < 0.0 {
                return Err("negative ATR".to_string());
            }
        }
        ObservationValues::Sentiment {
            mentions,
            score_norm,
            keywords,
        } => {
            if *mentions < 0 {
                return Err("negative mention count".to_string());
            }
            if !(-1.0..=1.0).contains(score_norm) {
                return Err(format!("score_norm {} outside [-1, 1]", score_norm));
            }
            if keywords.values().any(|c| *c < 0) {
                return Err("negative keyword count".to_string());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ts_from_secs;

    const PAIR: &str = "binance:BTC/USDT";

    fn funding(secs: i64, rate: f64) -> Observation {
        Observation::new(PAIR, ts_from_secs(secs).unwrap(), ObservationValues::Funding { rate })
    }

    #[test]
    fn test_sorts_and_dedups_last_wins() {
        let raw = vec![funding(300, 0.3), funding(100, 0.1), funding(200, 0.2), funding(100, 0.15)];
        let batch = normalize(ObservationKind::Funding, PAIR, None, raw);

        let got: Vec<(i64, f64)> = batch
            .observations
            .iter()
            .map(|o| (o.ts.timestamp(), o.primary_value()))
            .collect();
        assert_eq!(got, vec![(100, 0.15), (200, 0.2), (300, 0.3)]);
        assert_eq!(batch.dropped, 0);
    }

    #[test]
    fn test_drops_at_or_before_since() {
        let raw = vec![funding(100, 0.1), funding(200, 0.2), funding(300, 0.3)];
        let batch = normalize(ObservationKind::Funding, PAIR, ts_from_secs(200), raw);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.observations[0].ts.timestamp(), 300);
        assert_eq!(batch.dropped, 2);
    }

    #[test]
    fn test_drops_invalid_values() {
        let raw = vec![
            funding(100, f64::NAN),
            funding(200, 2.5),
            funding(300, 0.0001),
            Observation::new(
                PAIR,
                ts_from_secs(400).unwrap(),
                ObservationValues::Candle { open: 1.0, high: 0.5, low: 1.0, close: 1.0, volume: 1.0 },
            ),
            Observation::new("bybit:BTC/USDT", ts_from_secs(500).unwrap(), ObservationValues::Funding { rate: 0.0 }),
        ];
        let batch = normalize(ObservationKind::Funding, PAIR, None, raw);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.observations[0].ts.timestamp(), 300);
        assert_eq!(batch.dropped, 4);
    }

    #[test]
    fn test_candle_and_sentiment_validation() {
        let bad_candle = Observation::new(
            PAIR,
            ts_from_secs(0).unwrap(),
            ObservationValues::Candle { open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: -1.0 },
        );
        assert!(validate(&bad_candle).is_err());

        let sentiment = |score_norm: f64| {
            Observation::new(
                PAIR,
                ts_from_secs(0).unwrap(),
                ObservationValues::Sentiment { mentions: 3, score_norm, keywords: BTreeMap::new() },
            )
        };
        assert!(validate(&sentiment(1.0)).is_ok());
        assert!(validate(&sentiment(1.2)).is_err());
    }

    #[test]
    fn test_empty_input() {
        let batch = normalize(ObservationKind::Candle, PAIR, None, Vec::new());
        assert!(batch.is_empty());
        assert_eq!(batch.dropped, 0);
    }
}
