//! Binance / Bybit USDT-perpetual REST adapters
//!
//! One `ExchangeAdapter` per observation kind (candle, funding, open
//! interest); the exchange is picked per call from the qualified pair.
//!
//! ## Endpoints
//!
//! Binance (fapi.binance.com):
//! - `/fapi/v1/klines` 1h bars, unfinished bar dropped via `closeTime`
//! - `/fapi/v1/fundingRate` 8h funding prints
//! - `/futures/data/openInterestHist` 1h, `sumOpenInterestValue` is USD
//!
//! Bybit (api.bybit.com, `category=linear`):
//! - `/v5/market/kline` interval 60, returned newest first
//! - `/v5/market/funding/history`
//! - `/v5/market/open-interest` intervalTime 1h, valued at the last price
//!
//! ## Error mapping
//!
//! - 401/403/429/5xx and transport failures: `AdapterError::Unavailable`
//! - other 4xx, malformed payloads, Bybit `retCode != 0`: `AdapterError::Data`
//!   (Bybit rate limit `10006` stays `Unavailable`)

use super::Adapter;
use crate::pipeline::error::AdapterError;
use crate::pipeline::types::{ts_from_secs, Observation, ObservationKind, ObservationValues};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const BINANCE_FAPI: &str = "https://fapi.binance.com";
const BYBIT_API: &str = "https://api.bybit.com";

const CANDLE_LIMIT: usize = 200;
const BAR_MS: i64 = 3_600_000;
const BYBIT_RATE_LIMITED: i64 = 10006;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceFunding {
    funding_time: i64,
    funding_rate: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOpenInterest {
    timestamp: i64,
    sum_open_interest_value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitEnvelope<T> {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<BybitList<T>>,
}

#[derive(Debug, Deserialize)]
struct BybitList<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitFunding {
    funding_rate: String,
    funding_rate_timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOpenInterest {
    open_interest: String,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    last_price: String,
}

pub struct ExchangeAdapter {
    kind: ObservationKind,
    http: reqwest::Client,
}

impl ExchangeAdapter {
    pub fn new(kind: ObservationKind, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { kind, http }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let response = self.http.get(url).query(query).send().await?;
        check_status(response.status(), url)?;
        Ok(response.json::<T>().await?)
    }

    async fn get_bybit<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, AdapterError> {
        let url = format!("{}{}", BYBIT_API, path);
        let envelope: BybitEnvelope<T> = self.get_json(&url, query).await?;
        match envelope.ret_code {
            0 => Ok(envelope.result.map(|r| r.list).unwrap_or_default()),
            BYBIT_RATE_LIMITED => Err(AdapterError::Unavailable(format!(
                "bybit rate limited: {}",
                envelope.ret_msg
            ))),
            code => Err(AdapterError::Data(format!("bybit retCode {}: {}", code, envelope.ret_msg))),
        }
    }

    async fn binance_candles(&self, symbol: &str, since_ms: Option<i64>) -> Result<Vec<(i64, ObservationValues)>, AdapterError> {
        let mut query = vec![
            ("symbol", symbol.to_string()),
            ("interval", "1h".to_string()),
            ("limit", CANDLE_LIMIT.to_string()),
        ];
        if let Some(ms) = since_ms {
            query.push(("startTime", (ms + 1).to_string()));
        }
        let rows: Vec<Vec<Value>> = self
            .get_json(&format!("{}/fapi/v1/klines", BINANCE_FAPI), &query)
            .await?;

        let now_ms = Utc::now().timestamp_millis();
        let mut bars = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(bar) = parse_binance_kline(row, now_ms)? {
                bars.push(bar);
            }
        }
        Ok(bars)
    }

    async fn binance_funding(&self, symbol: &str, since_ms: Option<i64>) -> Result<Vec<(i64, ObservationValues)>, AdapterError> {
        let mut query = vec![("symbol", symbol.to_string()), ("limit", "1000".to_string())];
        if let Some(ms) = since_ms {
            query.push(("startTime", (ms + 1).to_string()));
        }
        let rows: Vec<BinanceFunding> = self
            .get_json(&format!("{}/fapi/v1/fundingRate", BINANCE_FAPI), &query)
            .await?;

        rows.into_iter()
            .map(|r| -> Result<_, AdapterError> {
                Ok((r.funding_time, ObservationValues::Funding { rate: parse_num(&r.funding_rate)? }))
            })
            .collect()
    }

    async fn binance_open_interest(&self, symbol: &str, since_ms: Option<i64>) -> Result<Vec<(i64, ObservationValues)>, AdapterError> {
        let mut query = vec![
            ("symbol", symbol.to_string()),
            ("period", "1h".to_string()),
            ("limit", "500".to_string()),
        ];
        if let Some(ms) = since_ms {
            query.push(("startTime", (ms + 1).to_string()));
        }
        let rows: Vec<BinanceOpenInterest> = self
            .get_json(&format!("{}/futures/data/openInterestHist", BINANCE_FAPI), &query)
            .await?;

        rows.into_iter()
            .map(|r| -> Result<_, AdapterError> {
                Ok((
                    r.timestamp,
                    ObservationValues::OpenInterest {
                        value_usd: parse_num(&r.sum_open_interest_value)?,
                    },
                ))
            })
            .collect()
    }

    async fn bybit_candles(&self, symbol: &str, since_ms: Option<i64>) -> Result<Vec<(i64, ObservationValues)>, AdapterError> {
        let mut query = vec![
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
            ("interval", "60".to_string()),
            ("limit", CANDLE_LIMIT.to_string()),
        ];
        if let Some(ms) = since_ms {
            query.push(("start", (ms + 1).to_string()));
        }
        let rows: Vec<Vec<String>> = self.get_bybit("/v5/market/kline", &query).await?;

        let now_ms = Utc::now().timestamp_millis();
        let mut bars = Vec::with_capacity(rows.len());
        for row in &rows {
            let (start, values) = parse_bybit_kline(row)?;
            if start + BAR_MS <= now_ms {
                bars.push((start, values));
            }
        }
        bars.reverse();
        Ok(bars)
    }

    async fn bybit_funding(&self, symbol: &str) -> Result<Vec<(i64, ObservationValues)>, AdapterError> {
        let query = vec![
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
            ("limit", "200".to_string()),
        ];
        let rows: Vec<BybitFunding> = self.get_bybit("/v5/market/funding/history", &query).await?;

        let mut prints = rows
            .into_iter()
            .map(|r| -> Result<_, AdapterError> {
                Ok((
                    parse_ms(&r.funding_rate_timestamp)?,
                    ObservationValues::Funding {
                        rate: parse_num(&r.funding_rate)?,
                    },
                ))
            })
            .collect::<Result<Vec<_>, AdapterError>>()?;
        prints.reverse();
        Ok(prints)
    }

    async fn bybit_open_interest(&self, symbol: &str) -> Result<Vec<(i64, ObservationValues)>, AdapterError> {
        let query = vec![
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
            ("intervalTime", "1h".to_string()),
            ("limit", "200".to_string()),
        ];
        let rows: Vec<BybitOpenInterest> = self.get_bybit("/v5/market/open-interest", &query).await?;

        let tickers: Vec<BybitTicker> = self
            .get_bybit(
                "/v5/market/tickers",
                &[("category", "linear".to_string()), ("symbol", symbol.to_string())],
            )
            .await?;
        let price = tickers
            .first()
            .ok_or_else(|| AdapterError::Data(format!("no ticker for {}", symbol)))
            .and_then(|t| parse_num(&t.last_price))?;

        let mut points = rows
            .into_iter()
            .map(|r| -> Result<_, AdapterError> {
                Ok((
                    parse_ms(&r.timestamp)?,
                    ObservationValues::OpenInterest {
                        value_usd: parse_num(&r.open_interest)? * price,
                    },
                ))
            })
            .collect::<Result<Vec<_>, AdapterError>>()?;
        points.reverse();
        Ok(points)
    }
}

#[async_trait]
impl Adapter for ExchangeAdapter {
    fn kind(&self) -> ObservationKind {
        self.kind
    }

    async fn fetch(
        &self,
        exchange: &str,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, AdapterError> {
        let venue_symbol = venue_symbol(symbol);
        let since_ms = since.map(|s| s.timestamp_millis());

        let points = match (exchange, self.kind) {
            ("binance", ObservationKind::Candle) => self.binance_candles(&venue_symbol, since_ms).await?,
            ("binance", ObservationKind::Funding) => self.binance_funding(&venue_symbol, since_ms).await?,
            ("binance", ObservationKind::OpenInterest) => {
                self.binance_open_interest(&venue_symbol, since_ms).await?
            }
            ("bybit", ObservationKind::Candle) => self.bybit_candles(&venue_symbol, since_ms).await?,
            ("bybit", ObservationKind::Funding) => self.bybit_funding(&venue_symbol).await?,
            ("bybit", ObservationKind::OpenInterest) => self.bybit_open_interest(&venue_symbol).await?,
            (exchange, kind) => {
                return Err(AdapterError::Data(format!(
                    "{} not supported on exchange '{}'",
                    kind, exchange
                )))
            }
        };

        let pair = format!("{}:{}", exchange, symbol);
        let mut observations = Vec::with_capacity(points.len());
        for (ms, values) in points {
            let ts = ts_from_secs(ms.div_euclid(1000))
                .ok_or_else(|| AdapterError::Data(format!("timestamp out of range: {}", ms)))?;
            if since.map_or(true, |s| ts > s) {
                observations.push(Observation::new(pair.clone(), ts, values));
            }
        }
        Ok(observations)
    }
}

/// `BTC/USDT` -> `BTCUSDT`
pub fn venue_symbol(symbol: &str) -> String {
    symbol.replace('/', "").to_uppercase()
}

fn check_status(status: StatusCode, url: &str) -> Result<(), AdapterError> {
    if status.is_success() {
        return Ok(());
    }
    let msg = format!("{} returned {}", url, status);
    match status.as_u16() {
        401 | 403 | 429 => Err(AdapterError::Unavailable(msg)),
        s if s >= 500 => Err(AdapterError::Unavailable(msg)),
        _ => Err(AdapterError::Data(msg)),
    }
}

fn parse_num(raw: &str) -> Result<f64, AdapterError> {
    raw.parse::<f64>()
        .map_err(|_| AdapterError::Data(format!("not a number: '{}'", raw)))
}

fn parse_ms(raw: &str) -> Result<i64, AdapterError> {
    raw.parse::<i64>()
        .map_err(|_| AdapterError::Data(format!("not a timestamp: '{}'", raw)))
}

fn value_num(v: &Value) -> Result<f64, AdapterError> {
    match v {
        Value::String(s) => parse_num(s),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| AdapterError::Data(format!("not a number: {}", n))),
        other => Err(AdapterError::Data(format!("not a number: {}", other))),
    }
}

fn value_ms(v: &Value) -> Result<i64, AdapterError> {
    v.as_i64()
        .ok_or_else(|| AdapterError::Data(format!("not a timestamp: {}", v)))
}

/// `[openTime, open, high, low, close, volume, closeTime, ...]`
///
/// Returns `None` for the bar still in progress.
fn parse_binance_kline(row: &[Value], now_ms: i64) -> Result<Option<(i64, ObservationValues)>, AdapterError> {
    if row.len() < 7 {
        return Err(AdapterError::Data(format!("short kline row ({} fields)", row.len())));
    }
    let close_time = value_ms(&row[6])?;
    if close_time >= now_ms {
        return Ok(None);
    }
    Ok(Some((
        value_ms(&row[0])?,
        ObservationValues::Candle {
            open: value_num(&row[1])?,
            high: value_num(&row[2])?,
            low: value_num(&row[3])?,
            close: value_num(&row[4])?,
            volume: value_num(&row[5])?,
        },
    )))
}

/// `[startTime, open, high, low, close, volume, turnover]`, all strings
fn parse_bybit_kline(row: &[String]) -> Result<(i64, ObservationValues), AdapterError> {
    if row.len() < 6 {
        return Err(AdapterError::Data(format!("short kline row ({} fields)", row.len())));
    }
    Ok((
        parse_ms(&row[0])?,
        ObservationValues::Candle {
            open: parse_num(&row[1])?,
            high: parse_num(&row[2])?,
            low: parse_num(&row[3])?,
            close: parse_num(&row[4])?,
            volume: parse_num(&row[5])?,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_venue_symbol() {
        assert_eq!(venue_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(venue_symbol("1000pepe/usdt"), "1000PEPEUSDT");
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(StatusCode::OK, "u").is_ok());
        for retryable in [401, 403, 429, 500, 503] {
            let status = StatusCode::from_u16(retryable).unwrap();
            assert!(check_status(status, "u").unwrap_err().is_retryable(), "{}", retryable);
        }
        let err = check_status(StatusCode::BAD_REQUEST, "u").unwrap_err();
        assert!(matches!(err, AdapterError::Data(_)));
    }

    #[test]
    fn test_parse_binance_kline_drops_open_bar() {
        let row: Vec<Value> = json!([
            1_700_000_000_000i64, "100.0", "110.5", "95.0", "105.0", "1234.5", 1_700_003_599_999i64,
            "0", 10, "0", "0", "0"
        ])
        .as_array()
        .unwrap()
        .clone();

        let (ts, values) = parse_binance_kline(&row, 1_700_003_600_000).unwrap().unwrap();
        assert_eq!(ts, 1_700_000_000_000);
        assert_eq!(
            values,
            ObservationValues::Candle { open: 100.0, high: 110.5, low: 95.0, close: 105.0, volume: 1234.5 }
        );

        assert!(parse_binance_kline(&row, 1_700_001_000_000).unwrap().is_none());
    }

    #[test]
    fn test_parse_binance_kline_rejects_garbage() {
        let row: Vec<Value> = json!([1, "x", "1", "1", "1", "1", 2]).as_array().unwrap().clone();
        assert!(matches!(parse_binance_kline(&row, 10), Err(AdapterError::Data(_))));

        let short: Vec<Value> = json!([1, "1"]).as_array().unwrap().clone();
        assert!(parse_binance_kline(&short, 10).is_err());
    }

    #[test]
    fn test_parse_bybit_kline() {
        let row: Vec<String> = ["1700000000000", "1", "2", "0.5", "1.5", "99", "150"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (ts, values) = parse_bybit_kline(&row).unwrap();
        assert_eq!(ts, 1_700_000_000_000);
        assert_eq!(
            values,
            ObservationValues::Candle { open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 99.0 }
        );
    }

    #[test]
    fn test_bybit_envelope_decodes() {
        let raw = r#"{"retCode":0,"retMsg":"OK","result":{"category":"linear","list":[
            {"symbol":"BTCUSDT","fundingRate":"0.0001","fundingRateTimestamp":"1700006400000"}]}}"#;
        let envelope: BybitEnvelope<BybitFunding> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.ret_code, 0);
        let list = envelope.result.unwrap().list;
        assert_eq!(list[0].funding_rate, "0.0001");
        assert_eq!(parse_ms(&list[0].funding_rate_timestamp).unwrap(), 1_700_006_400_000);
    }

    #[tokio::test]
    async fn test_unsupported_exchange_is_data_error() {
        let adapter = ExchangeAdapter::new(ObservationKind::Funding, Duration::from_secs(1));
        let err = adapter.fetch("kraken", "BTC/USDT", None).await.unwrap_err();
        assert!(matches!(err, AdapterError::Data(_)));
    }

    #[tokio::test]
    #[ignore] // network
    async fn test_live_binance_candles() {
        let adapter = ExchangeAdapter::new(ObservationKind::Candle, Duration::from_secs(10));
        let bars = adapter.fetch("binance", "BTC/USDT", None).await.unwrap();
        assert!(!bars.is_empty());
        assert!(bars.windows(2).all(|w| w[0].ts < w[1].ts));
    }

    #[tokio::test]
    #[ignore] // network
    async fn test_live_bybit_funding() {
        let adapter = ExchangeAdapter::new(ObservationKind::Funding, Duration::from_secs(10));
        let prints = adapter.fetch("bybit", "ETH/USDT", None).await.unwrap();
        assert!(!prints.is_empty());
    }
}
