//! Pipeline configuration from environment variables

use super::error::ConfigError;
use super::types::{ObservationKind, PairId};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

const DEFAULT_SYMBOLS: &str = "binance:BTC/USDT,binance:ETH/USDT,binance:SOL/USDT,binance:BNB/USDT,\
binance:XRP/USDT,binance:DOGE/USDT,binance:ADA/USDT,binance:AVAX/USDT,binance:LINK/USDT,\
binance:DOT/USDT,bybit:BTC/USDT,bybit:ETH/USDT,bybit:SOL/USDT,bybit:XRP/USDT,bybit:DOGE/USDT";

/// Upper bound for the lookback and baseline windows
const MAX_WINDOW_DAYS: u64 = 365;

const DEFAULT_WEIGHTS: &str = "candle=0.3,funding=0.25,open_interest=0.2,volatility=0.1,sentiment=0.15";

/// Where adapters get their data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterMode {
    /// Synthetic data, no credentials or network needed
    Mock,
    /// Exchange REST + CryptoPanic
    Live,
}

/// Per-indicator mapping from raw value to a bounded contribution
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    /// (latest - mean) / stddev over the trailing `baseline` values,
    /// clipped to +-`clip`, then scaled into [-1, 1]
    ZScore { baseline: usize, clip: f64 },
    /// Share of the trailing `baseline` values below latest, mapped to [-1, 1]
    Percentile { baseline: usize },
}

impl Normalization {
    /// Documented defaults per indicator
    pub fn default_for(kind: ObservationKind) -> Normalization {
        match kind {
            // hourly returns, two days of history
            ObservationKind::Candle => Normalization::ZScore { baseline: 48, clip: 3.0 },
            // 8h funding prints, two weeks of history
            ObservationKind::Funding => Normalization::ZScore { baseline: 42, clip: 3.0 },
            ObservationKind::OpenInterest => Normalization::Percentile { baseline: 336 },
            ObservationKind::Volatility => Normalization::ZScore { baseline: 48, clip: 3.0 },
            ObservationKind::Sentiment => Normalization::ZScore { baseline: 48, clip: 2.5 },
        }
    }

    pub fn baseline(&self) -> usize {
        match self {
            Normalization::ZScore { baseline, .. } => *baseline,
            Normalization::Percentile { baseline } => *baseline,
        }
    }
}

/// Optional Telegram credentials; absent means alerts are a no-op
#[derive(Debug, Clone, PartialEq)]
pub struct TelegramCredentials {
    pub bot_token: String,
    pub chat_id: String,
}

/// Configuration for pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `.sql` migrations
    pub schema_dir: String,

    /// Configured trading pairs
    pub pairs: Vec<PairId>,

    /// Time between cycles
    pub cycle_interval: Duration,

    /// Max ingestion tasks in flight
    pub max_in_flight: usize,

    pub fetch_timeout: Duration,
    pub fetch_attempts: u32,

    pub store_timeout: Duration,
    pub store_retry_attempts: u32,
    pub store_retry_base: Duration,

    /// Indicator -> weight in the composite score
    pub weights: BTreeMap<ObservationKind, f64>,
    pub normalization: BTreeMap<ObservationKind, Normalization>,

    /// Latest observation must be this fresh to count
    pub signal_lookback: Duration,
    /// History used as the normalisation baseline
    pub signal_baseline: Duration,
    pub signal_profile: String,

    /// How many signals go to the alert channel
    pub alert_top_n: usize,

    pub adapter_mode: AdapterMode,
    pub cryptopanic_api_key: Option<String>,
    pub telegram: Option<TelegramCredentials>,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `RISKFLOW_DB_PATH` (default: data/riskflow.db)
    /// - `RISKFLOW_SCHEMA_DIR` (default: sql)
    /// - `SYMBOLS` (default: Binance/Bybit majors)
    /// - `CYCLE_INTERVAL_SECS` (default: 300)
    /// - `MAX_IN_FLIGHT` (default: 10)
    /// - `FETCH_TIMEOUT_MS` (default: 10000), `FETCH_ATTEMPTS` (default: 2)
    /// - `STORE_TIMEOUT_MS` (default: 5000), `STORE_RETRY_ATTEMPTS` (default: 3),
    ///   `STORE_RETRY_BASE_MS` (default: 200)
    /// - `SIGNAL_WEIGHTS` (default: candle=0.3,funding=0.25,open_interest=0.2,volatility=0.1,sentiment=0.15)
    /// - `SIGNAL_LOOKBACK_HOURS` (default: 24), `SIGNAL_BASELINE_DAYS` (default: 14)
    /// - `SIGNAL_PROFILE` (default: balanced)
    /// - `ALERT_TOP_N` (default: 3)
    /// - `ADAPTER_MODE` (default: mock)
    /// - `CRYPTOPANIC_API_KEY`, `TELEGRAM_BOT_TOKEN`, `TELEGRAM_CHAT_ID` (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same parser as `from_env` over an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let pairs = parse_pairs(&get("SYMBOLS").unwrap_or_else(|| DEFAULT_SYMBOLS.to_string()))?;

        let cycle_secs: u64 = parse_num(get("CYCLE_INTERVAL_SECS"), "CYCLE_INTERVAL_SECS", 300)?;
        if cycle_secs == 0 {
            return Err(invalid("CYCLE_INTERVAL_SECS", "must be greater than zero"));
        }

        let max_in_flight: usize = parse_num(get("MAX_IN_FLIGHT"), "MAX_IN_FLIGHT", 10)?;
        if max_in_flight == 0 {
            return Err(invalid("MAX_IN_FLIGHT", "must be greater than zero"));
        }

        let fetch_attempts: u32 = parse_num(get("FETCH_ATTEMPTS"), "FETCH_ATTEMPTS", 2)?;
        let store_retry_attempts: u32 =
            parse_num(get("STORE_RETRY_ATTEMPTS"), "STORE_RETRY_ATTEMPTS", 3)?;
        if fetch_attempts == 0 {
            return Err(invalid("FETCH_ATTEMPTS", "must be at least 1"));
        }
        if store_retry_attempts == 0 {
            return Err(invalid("STORE_RETRY_ATTEMPTS", "must be at least 1"));
        }

        let lookback_hours: u64 = parse_num(get("SIGNAL_LOOKBACK_HOURS"), "SIGNAL_LOOKBACK_HOURS", 24)?;
        let signal_lookback = window(lookback_hours, 3600, "SIGNAL_LOOKBACK_HOURS")?;
        let baseline_days: u64 = parse_num(get("SIGNAL_BASELINE_DAYS"), "SIGNAL_BASELINE_DAYS", 14)?;
        let signal_baseline = window(baseline_days, 86_400, "SIGNAL_BASELINE_DAYS")?;

        let weights = parse_weights(&get("SIGNAL_WEIGHTS").unwrap_or_else(|| DEFAULT_WEIGHTS.to_string()))?;
        let normalization = ObservationKind::all()
            .into_iter()
            .map(|kind| (kind, Normalization::default_for(kind)))
            .collect();

        let telegram = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramCredentials { bot_token, chat_id }),
            _ => None,
        };

        let adapter_mode = match get("ADAPTER_MODE").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("mock") => AdapterMode::Mock,
            Some("live") => AdapterMode::Live,
            Some(other) => {
                return Err(invalid("ADAPTER_MODE", &format!("expected mock or live, got '{}'", other)))
            }
        };

        let signal_profile = get("SIGNAL_PROFILE")
            .unwrap_or_else(|| "balanced".to_string())
            .to_lowercase();

        Ok(Self {
            db_path: get("RISKFLOW_DB_PATH").unwrap_or_else(|| "data/riskflow.db".to_string()),
            schema_dir: get("RISKFLOW_SCHEMA_DIR").unwrap_or_else(|| "sql".to_string()),
            pairs,
            cycle_interval: Duration::from_secs(cycle_secs),
            max_in_flight,
            fetch_timeout: Duration::from_millis(parse_num(get("FETCH_TIMEOUT_MS"), "FETCH_TIMEOUT_MS", 10_000)?),
            fetch_attempts,
            store_timeout: Duration::from_millis(parse_num(get("STORE_TIMEOUT_MS"), "STORE_TIMEOUT_MS", 5_000)?),
            store_retry_attempts,
            store_retry_base: Duration::from_millis(parse_num(
                get("STORE_RETRY_BASE_MS"),
                "STORE_RETRY_BASE_MS",
                200,
            )?),
            weights,
            normalization,
            signal_lookback,
            signal_baseline,
            signal_profile,
            alert_top_n: parse_num(get("ALERT_TOP_N"), "ALERT_TOP_N", 3)?,
            adapter_mode,
            cryptopanic_api_key: get("CRYPTOPANIC_API_KEY"),
            telegram,
        })
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.to_string(),
    }
}

/// `count * unit_secs` as a window of at most `MAX_WINDOW_DAYS`
fn window(count: u64, unit_secs: u64, key: &'static str) -> Result<Duration, ConfigError> {
    match count.checked_mul(unit_secs) {
        Some(secs) if secs > 0 && secs <= MAX_WINDOW_DAYS * 86_400 => Ok(Duration::from_secs(secs)),
        _ => Err(invalid(
            key,
            &format!("must be between 1 and {} days worth, got {}", MAX_WINDOW_DAYS, count),
        )),
    }
}

fn parse_num<T: std::str::FromStr>(
    raw: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(s) => s
            .parse()
            .map_err(|_| invalid(key, &format!("'{}' is not a valid number", s))),
    }
}

fn parse_pairs(raw: &str) -> Result<Vec<PairId>, ConfigError> {
    let mut pairs = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let pair = PairId::parse(entry)
            .ok_or_else(|| invalid("SYMBOLS", &format!("'{}' is not exchange:BASE/QUOTE", entry)))?;
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }
    }
    if pairs.is_empty() {
        return Err(invalid("SYMBOLS", "at least one pair is required"));
    }
    Ok(pairs)
}

/// Parse `name=weight,name=weight`
pub fn parse_weights(raw: &str) -> Result<BTreeMap<ObservationKind, f64>, ConfigError> {
    let mut weights = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| invalid("SIGNAL_WEIGHTS", &format!("'{}' is not name=weight", entry)))?;
        let kind = ObservationKind::parse(name)
            .ok_or_else(|| invalid("SIGNAL_WEIGHTS", &format!("unknown indicator '{}'", name.trim())))?;
        let weight: f64 = value
            .trim()
            .parse()
            .map_err(|_| invalid("SIGNAL_WEIGHTS", &format!("'{}' is not a number", value.trim())))?;
        if !weight.is_finite() {
            return Err(invalid("SIGNAL_WEIGHTS", "weights must be finite"));
        }
        weights.insert(kind, weight);
    }
    if weights.is_empty() {
        return Err(invalid("SIGNAL_WEIGHTS", "at least one weight is required"));
    }
    Ok(weights)
}
