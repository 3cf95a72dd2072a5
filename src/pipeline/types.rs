//! Core data types for the ingestion pipeline
//!
//! Every observation kind maps 1:1 to a time-series table keyed by
//! `(pair, ts)`. Pairs are exchange-qualified (`binance:BTC/USDT`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Indicator kinds ingested by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    Candle,
    Funding,
    OpenInterest,
    Volatility,
    Sentiment,
}

impl ObservationKind {
    pub fn all() -> [ObservationKind; 5] {
        [
            ObservationKind::Candle,
            ObservationKind::Funding,
            ObservationKind::OpenInterest,
            ObservationKind::Volatility,
            ObservationKind::Sentiment,
        ]
    }

    /// Indicator name used in config and signal components
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationKind::Candle => "candle",
            ObservationKind::Funding => "funding",
            ObservationKind::OpenInterest => "open_interest",
            ObservationKind::Volatility => "volatility",
            ObservationKind::Sentiment => "sentiment",
        }
    }

    /// Backing table name (see `sql/01_observations.sql`)
    pub fn table(&self) -> &'static str {
        match self {
            ObservationKind::Candle => "candles",
            ObservationKind::Funding => "funding_rates",
            ObservationKind::OpenInterest => "open_interest",
            ObservationKind::Volatility => "volatility",
            ObservationKind::Sentiment => "sentiment",
        }
    }

    pub fn parse(name: &str) -> Option<ObservationKind> {
        match name.trim().to_lowercase().as_str() {
            "candle" | "candles" => Some(ObservationKind::Candle),
            "funding" | "funding_rate" | "funding_rates" => Some(ObservationKind::Funding),
            "open_interest" | "oi" => Some(ObservationKind::OpenInterest),
            "volatility" | "atr" => Some(ObservationKind::Volatility),
            "sentiment" => Some(ObservationKind::Sentiment),
            _ => None,
        }
    }
}

impl fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange-qualified trading pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairId {
    pub exchange: String,
    pub symbol: String,
}

impl PairId {
    /// Parse `exchange:BASE/QUOTE`
    pub fn parse(raw: &str) -> Option<PairId> {
        let (exchange, symbol) = raw.trim().split_once(':')?;
        let exchange = exchange.trim().to_lowercase();
        let symbol = symbol.trim().to_uppercase();
        if exchange.is_empty() || symbol.is_empty() {
            return None;
        }
        Some(PairId { exchange, symbol })
    }

    pub fn qualified(&self) -> String {
        format!("{}:{}", self.exchange, self.symbol)
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// Kind-specific numeric payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObservationValues {
    Candle {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    },
    Funding {
        rate: f64,
    },
    OpenInterest {
        value_usd: f64,
    },
    Volatility {
        atr: f64,
    },
    Sentiment {
        mentions: i64,
        score_norm: f64,
        keywords: BTreeMap<String, i64>,
    },
}

/// One time-series fact for a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub pair: String,
    pub ts: DateTime<Utc>,
    pub values: ObservationValues,
}

impl Observation {
    pub fn new(pair: impl Into<String>, ts: DateTime<Utc>, values: ObservationValues) -> Self {
        Self {
            pair: pair.into(),
            ts,
            values,
        }
    }

    pub fn kind(&self) -> ObservationKind {
        match self.values {
            ObservationValues::Candle { .. } => ObservationKind::Candle,
            ObservationValues::Funding { .. } => ObservationKind::Funding,
            ObservationValues::OpenInterest { .. } => ObservationKind::OpenInterest,
            ObservationValues::Volatility { .. } => ObservationKind::Volatility,
            ObservationValues::Sentiment { .. } => ObservationKind::Sentiment,
        }
    }

    /// All numeric columns, used for finiteness/range validation
    pub fn numeric_fields(&self) -> Vec<(&'static str, f64)> {
        match &self.values {
            ObservationValues::Candle {
                open,
                high,
                low,
                close,
                volume,
            } => vec![
                ("open", *open),
                ("high", *high),
                ("low", *low),
                ("close", *close),
                ("volume", *volume),
            ],
            ObservationValues::Funding { rate } => vec![("rate", *rate)],
            ObservationValues::OpenInterest { value_usd } => vec![("value_usd", *value_usd)],
            ObservationValues::Volatility { atr } => vec![("atr", *atr)],
            ObservationValues::Sentiment {
                mentions,
                score_norm,
                ..
            } => vec![("mentions", *mentions as f64), ("score_norm", *score_norm)],
        }
    }

    /// The single value the signal engine tracks for this kind
    pub fn primary_value(&self) -> f64 {
        match &self.values {
            ObservationValues::Candle { close, .. } => *close,
            ObservationValues::Funding { rate } => *rate,
            ObservationValues::OpenInterest { value_usd } => *value_usd,
            ObservationValues::Volatility { atr } => *atr,
            ObservationValues::Sentiment { score_norm, .. } => *score_norm,
        }
    }
}

/// Regime label derived from raw indicators under a signal profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    HighLiquidationRisk,
    Constructive,
    Weak,
    CrossCurrents,
    Balanced,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::HighLiquidationRisk => "High Liquidation Risk",
            Regime::Constructive => "Constructive",
            Regime::Weak => "Weak",
            Regime::CrossCurrents => "Cross Currents",
            Regime::Balanced => "Balanced",
        }
    }

    pub fn parse(raw: &str) -> Option<Regime> {
        match raw {
            "High Liquidation Risk" => Some(Regime::HighLiquidationRisk),
            "Constructive" => Some(Regime::Constructive),
            "Weak" => Some(Regime::Weak),
            "Cross Currents" => Some(Regime::CrossCurrents),
            "Balanced" => Some(Regime::Balanced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bias {
    Long,
    Short,
    Flat,
}

impl Bias {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bias::Long => "Long",
            Bias::Short => "Short",
            Bias::Flat => "Flat",
        }
    }

    pub fn parse(raw: &str) -> Option<Bias> {
        match raw {
            "Long" => Some(Bias::Long),
            "Short" => Some(Bias::Short),
            "Flat" => Some(Bias::Flat),
            _ => None,
        }
    }
}

/// Composite score for one pair at one cycle time
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub pair: String,
    pub ts: DateTime<Utc>,
    pub score: f64,
    /// Indicator name -> weighted contribution
    pub components: BTreeMap<String, f64>,
    pub regime: Regime,
    pub bias: Bias,
    /// Regime-implied odds of a long vs short move; they sum to 1
    pub long_prob: f64,
    pub short_prob: f64,
    /// Profile-tagged one-line explanation of the regime call
    pub summary: String,
}

impl Signal {
    /// Stronger side and its probability; ties lean long
    pub fn lean(&self) -> (Bias, f64) {
        if self.long_prob >= self.short_prob {
            (Bias::Long, self.long_prob)
        } else {
            (Bias::Short, self.short_prob)
        }
    }

    /// Components sorted by absolute contribution, largest first
    pub fn top_components(&self, n: usize) -> Vec<(&str, f64)> {
        let mut parts: Vec<(&str, f64)> = self
            .components
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
            .collect();
        parts.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()).then_with(|| a.0.cmp(b.0)));
        parts.truncate(n);
        parts
    }
}

/// Market-wide news item; not tied to a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headline {
    pub ts: DateTime<Utc>,
    pub source: String,
    pub title: String,
    /// Unique per source; re-ingesting the same url updates the row
    pub url: String,
    /// Tracked keywords found in the title
    pub keywords: Vec<String>,
}

/// Convert unix seconds to a UTC timestamp
pub fn ts_from_secs(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}
