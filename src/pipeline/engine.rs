//! Signal engine: composite per-pair score from stored observations
//!
//! ## Scoring
//!
//! For every weighted indicator kind:
//! 1. read the trailing baseline window for `pair` with `ts <= as_of`
//! 2. the indicator is present only if its newest row is inside the
//!    lookback window (default 24h); stale or absent data contributes nothing
//! 3. map the newest value into [-1, 1] with the kind's `Normalization`
//!    against the baseline window (candles are scored on close-to-close returns)
//! 4. `component = weight * normalized`, `score = sum(components)`
//!
//! A pair with no present indicator yields no signal at all.
//!
//! ## Regime
//!
//! Regime and bias are labels derived from the raw indicators under a
//! signal profile (open-interest percentile, latest funding, 12-bar momentum
//! slope, liquidation-chatter spike). Each regime carries long/short odds and
//! a profile-tagged summary for the alert. None of this affects `score`.

use super::config::{Normalization, PipelineConfig};
use super::db::TimeSeriesStore;
use super::error::{ConfigError, StoreError};
use super::types::{Bias, Observation, ObservationKind, ObservationValues, Regime, Signal};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Closes used for the momentum slope
const SLOPE_BARS: usize = 12;

/// Thresholds for regime labelling
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileRules {
    pub name: &'static str,
    /// Open-interest percentile (0-100) considered crowded
    pub oi_high: f64,
    pub oi_low: f64,
    pub funding_neg: f64,
    pub funding_pos: f64,
    pub slope_long: f64,
    pub slope_short: f64,
    /// Liquidation chatter ratio, recent half vs earlier half
    pub sent_spike: f64,
}

pub const AGGRESSIVE: ProfileRules = ProfileRules {
    name: "aggressive",
    oi_high: 65.0,
    oi_low: 30.0,
    funding_neg: -0.00002,
    funding_pos: 0.00002,
    slope_long: 0.00008,
    slope_short: -0.00008,
    sent_spike: 1.2,
};

pub const BALANCED: ProfileRules = ProfileRules {
    name: "balanced",
    oi_high: 80.0,
    oi_low: 40.0,
    funding_neg: -0.0001,
    funding_pos: 0.00005,
    slope_long: 0.00015,
    slope_short: -0.00015,
    sent_spike: 1.5,
};

pub const CONSERVATIVE: ProfileRules = ProfileRules {
    name: "conservative",
    oi_high: 90.0,
    oi_low: 45.0,
    funding_neg: -0.0002,
    funding_pos: 0.00012,
    slope_long: 0.00025,
    slope_short: -0.00025,
    sent_spike: 1.8,
};

impl ProfileRules {
    pub fn named(name: &str) -> Option<ProfileRules> {
        match name.trim().to_lowercase().as_str() {
            "aggressive" => Some(AGGRESSIVE),
            "balanced" => Some(BALANCED),
            "conservative" => Some(CONSERVATIVE),
            _ => None,
        }
    }

    /// Capitalized name used to tag summaries
    pub fn label(&self) -> String {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

/// Odds and explanation attached to a regime call
#[derive(Debug, Clone, PartialEq)]
pub struct Outlook {
    pub long_prob: f64,
    pub short_prob: f64,
    pub summary: String,
}

/// Raw inputs to regime classification; `None` means no fresh data
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegimeInputs {
    pub oi_pct: Option<f64>,
    pub funding: Option<f64>,
    pub slope: Option<f64>,
    pub sent_spike: Option<f64>,
}

pub struct SignalEngine {
    store: Arc<dyn TimeSeriesStore>,
    weights: BTreeMap<ObservationKind, f64>,
    normalization: BTreeMap<ObservationKind, Normalization>,
    lookback: chrono::Duration,
    baseline: chrono::Duration,
    profile: ProfileRules,
}

impl SignalEngine {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        weights: BTreeMap<ObservationKind, f64>,
        normalization: BTreeMap<ObservationKind, Normalization>,
        lookback: Duration,
        baseline: Duration,
        profile: ProfileRules,
    ) -> Self {
        Self {
            store,
            weights,
            normalization,
            lookback: to_chrono(lookback),
            baseline: to_chrono(baseline),
            profile,
        }
    }

    pub fn from_config(store: Arc<dyn TimeSeriesStore>, config: &PipelineConfig) -> Result<Self, ConfigError> {
        let profile = ProfileRules::named(&config.signal_profile).ok_or_else(|| ConfigError::InvalidValue {
            key: "SIGNAL_PROFILE",
            reason: format!(
                "unknown profile '{}' (aggressive, balanced, conservative)",
                config.signal_profile
            ),
        })?;
        Ok(Self::new(
            store,
            config.weights.clone(),
            config.normalization.clone(),
            config.signal_lookback,
            config.signal_baseline,
            profile,
        ))
    }

    fn normalization_for(&self, kind: ObservationKind) -> Normalization {
        self.normalization
            .get(&kind)
            .copied()
            .unwrap_or_else(|| Normalization::default_for(kind))
    }

    /// Score one pair at `as_of`
    ///
    /// Returns `Ok(None)` when none of the weighted indicators has data
    /// inside the lookback window.
    pub async fn score(&self, pair: &str, as_of: DateTime<Utc>) -> Result<Option<Signal>, StoreError> {
        let fresh_after = window_start(as_of, self.lookback);
        let baseline_from = window_start(as_of, self.baseline);
        let mut history: BTreeMap<ObservationKind, Vec<Observation>> = BTreeMap::new();

        for kind in ObservationKind::all() {
            let method = self.normalization_for(kind);
            // one extra candle so the window holds `baseline` returns
            let limit = match kind {
                ObservationKind::Candle => method.baseline() + 1,
                _ => method.baseline(),
            }
            .max(SLOPE_BARS + 1);

            let rows = self
                .store
                .recent(kind, pair, baseline_from, as_of, limit)
                .await?;

            let fresh = rows.last().map_or(false, |o| o.ts > fresh_after);
            if fresh {
                history.insert(kind, rows);
            }
        }

        let mut normalized = BTreeMap::new();
        for kind in self.weights.keys() {
            if let Some(rows) = history.get(kind) {
                let method = self.normalization_for(*kind);
                normalized.insert(*kind, indicator_value(*kind, &method, rows));
            }
        }

        let Some((score, components)) = compose(&self.weights, &normalized) else {
            log::debug!("   {} has no fresh indicators, skipping", pair);
            return Ok(None);
        };

        let inputs = regime_inputs(&history);
        let (regime, bias) = classify(&inputs, &self.profile);
        let outlook = outlook(regime, &inputs, &self.profile);

        Ok(Some(Signal {
            pair: pair.to_string(),
            ts: as_of,
            score,
            components,
            regime,
            bias,
            long_prob: outlook.long_prob,
            short_prob: outlook.short_prob,
            summary: outlook.summary,
        }))
    }

    /// Score and persist; the signals table is written only from here
    pub async fn record(&self, pair: &str, as_of: DateTime<Utc>) -> Result<Option<Signal>, StoreError> {
        let Some(signal) = self.score(pair, as_of).await? else {
            return Ok(None);
        };
        self.store.upsert_signal(signal.clone()).await?;
        Ok(Some(signal))
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `as_of - window`; a window reaching past the representable range means
/// no lower bound
fn window_start(as_of: DateTime<Utc>, window: chrono::Duration) -> DateTime<Utc> {
    as_of.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Normalized value of the newest row in `rows` (oldest first)
fn indicator_value(kind: ObservationKind, method: &Normalization, rows: &[Observation]) -> f64 {
    let series: Vec<f64> = match kind {
        ObservationKind::Candle => returns(&closes(rows)),
        _ => rows.iter().map(Observation::primary_value).collect(),
    };
    let window = &series[series.len().saturating_sub(method.baseline())..];
    match window.last() {
        Some(current) => normalize_indicator(method, *current, window),
        None => 0.0,
    }
}

/// Map `current` into [-1, 1] against a trailing baseline
///
/// - `ZScore`: population z-score clipped to `±clip`, then divided by `clip`;
///   0 with fewer than two points or a flat baseline
/// - `Percentile`: mid-rank of `current` in the baseline (values below plus
///   half the ties), rescaled from [0, 1] to [-1, 1]; 0 with fewer than two
///   points or a baseline without spread
pub fn normalize_indicator(method: &Normalization, current: f64, baseline: &[f64]) -> f64 {
    match method {
        Normalization::ZScore { clip, .. } => {
            if baseline.len() < 2 || *clip <= 0.0 {
                return 0.0;
            }
            let n = baseline.len() as f64;
            let mean = baseline.iter().sum::<f64>() / n;
            let var = baseline.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let std = var.sqrt();
            if !std.is_finite() || std <= f64::EPSILON * mean.abs().max(1.0) {
                return 0.0;
            }
            ((current - mean) / std).clamp(-clip, *clip) / clip
        }
        Normalization::Percentile { .. } => {
            if baseline.len() < 2 {
                return 0.0;
            }
            let min = baseline.iter().copied().fold(f64::INFINITY, f64::min);
            let max = baseline.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if max <= min {
                return 0.0;
            }
            let below = baseline.iter().filter(|v| **v < current).count() as f64;
            let ties = baseline.iter().filter(|v| **v == current).count() as f64;
            let share = (below + 0.5 * ties) / baseline.len() as f64;
            (share * 2.0 - 1.0).clamp(-1.0, 1.0)
        }
    }
}

/// Percentile (0-100) of `value` within `series`, strictly-below count
///
/// Used for the open-interest regime threshold, where a flat series reads
/// as the bottom of its range.
pub fn percentile_rank(series: &[f64], value: f64) -> Option<f64> {
    if series.is_empty() {
        return None;
    }
    let below = series.iter().filter(|v| **v < value).count();
    Some(below as f64 / series.len() as f64 * 100.0)
}

/// Weighted sum of normalized indicators
///
/// Returns `None` when no weighted indicator is present. Components are
/// keyed by indicator name and hold `weight * normalized`.
pub fn compose(
    weights: &BTreeMap<ObservationKind, f64>,
    normalized: &BTreeMap<ObservationKind, f64>,
) -> Option<(f64, BTreeMap<String, f64>)> {
    let mut components = BTreeMap::new();
    let mut score = 0.0;
    for (kind, value) in normalized {
        if let Some(weight) = weights.get(kind) {
            let contribution = weight * value;
            score += contribution;
            components.insert(kind.as_str().to_string(), contribution);
        }
    }
    if components.is_empty() {
        None
    } else {
        Some((score, components))
    }
}

fn closes(rows: &[Observation]) -> Vec<f64> {
    rows.iter()
        .filter_map(|o| match o.values {
            ObservationValues::Candle { close, .. } => Some(close),
            _ => None,
        })
        .collect()
}

/// Close-to-close percentage changes
fn returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

/// Ratio of liquidation chatter in the recent half vs the earlier half
pub fn liquidation_spike(rows: &[Observation]) -> Option<f64> {
    let counts: Vec<i64> = rows
        .iter()
        .filter_map(|o| match &o.values {
            ObservationValues::Sentiment { keywords, .. } => Some(
                keywords.get("liquidation").copied().unwrap_or(0)
                    + keywords.get("margin call").copied().unwrap_or(0),
            ),
            _ => None,
        })
        .collect();
    if counts.is_empty() {
        return None;
    }

    let recent_len = (counts.len() / 2).max(1);
    let (earlier, recent) = counts.split_at(counts.len() - recent_len);
    let earlier = if earlier.is_empty() { &counts[..1] } else { earlier };

    let base = earlier.iter().sum::<i64>().max(1) as f64;
    Some(recent.iter().sum::<i64>() as f64 / base)
}

fn regime_inputs(history: &BTreeMap<ObservationKind, Vec<Observation>>) -> RegimeInputs {
    let oi_pct = history.get(&ObservationKind::OpenInterest).and_then(|rows| {
        let values: Vec<f64> = rows.iter().map(Observation::primary_value).collect();
        values.last().and_then(|latest| percentile_rank(&values, *latest))
    });

    let funding = history
        .get(&ObservationKind::Funding)
        .and_then(|rows| rows.last())
        .map(Observation::primary_value);

    let slope = history.get(&ObservationKind::Candle).map(|rows| {
        let r = returns(&closes(rows));
        let tail = &r[r.len().saturating_sub(SLOPE_BARS)..];
        if tail.is_empty() {
            0.0
        } else {
            tail.iter().sum::<f64>() / tail.len() as f64
        }
    });

    let sent_spike = history
        .get(&ObservationKind::Sentiment)
        .and_then(|rows| liquidation_spike(rows));

    RegimeInputs {
        oi_pct,
        funding,
        slope,
        sent_spike,
    }
}

/// Regime and bias under `rules`
///
/// High liquidation risk needs crowded OI, funding at or below the negative
/// bound, and (if sentiment is present) a chatter spike. Otherwise momentum,
/// funding and OI each vote for a long tailwind or a short headwind.
pub fn classify(inputs: &RegimeInputs, rules: &ProfileRules) -> (Regime, Bias) {
    if inputs.oi_pct.is_none() && inputs.funding.is_none() && inputs.slope.is_none() {
        return (Regime::Balanced, Bias::Flat);
    }

    if let (Some(oi_pct), Some(funding)) = (inputs.oi_pct, inputs.funding) {
        let chatter = inputs.sent_spike.map_or(true, |s| s >= rules.sent_spike);
        if oi_pct >= rules.oi_high && funding <= rules.funding_neg && chatter {
            return (Regime::HighLiquidationRisk, Bias::Short);
        }
    }

    let mut long_tailwind = false;
    let mut short_headwind = false;

    let slope = inputs.slope.unwrap_or(0.0);
    long_tailwind |= slope > rules.slope_long;
    short_headwind |= slope < rules.slope_short;

    if let Some(funding) = inputs.funding {
        long_tailwind |= funding > rules.funding_pos;
        short_headwind |= funding < rules.funding_neg;
    }
    if let Some(oi_pct) = inputs.oi_pct {
        short_headwind |= oi_pct >= rules.oi_high;
        long_tailwind |= oi_pct <= rules.oi_low;
    }

    match (long_tailwind, short_headwind) {
        (true, false) => (Regime::Constructive, Bias::Long),
        (false, true) => (Regime::Weak, Bias::Short),
        (true, true) => (Regime::CrossCurrents, Bias::Flat),
        (false, false) => (Regime::Balanced, Bias::Flat),
    }
}

/// Long/short odds and summary for a regime call under `rules`
///
/// Without OI, funding or momentum the call is not informative: even odds
/// and an "insufficient data" summary.
pub fn outlook(regime: Regime, inputs: &RegimeInputs, rules: &ProfileRules) -> Outlook {
    if inputs.oi_pct.is_none() && inputs.funding.is_none() && inputs.slope.is_none() {
        return Outlook {
            long_prob: 0.5,
            short_prob: 0.5,
            summary: "Insufficient data.".to_string(),
        };
    }

    let tag = rules.label();
    let (long_prob, short_prob, summary) = match regime {
        Regime::HighLiquidationRisk => (
            0.2,
            0.8,
            format!(
                "[{}] OI in {}th pct+, funding ≤ {:.1} bps, and stress chatter elevated.",
                tag,
                rules.oi_high,
                rules.funding_neg * 10_000.0
            ),
        ),
        Regime::Constructive => (
            0.7,
            0.3,
            format!("[{}] Momentum/funding tailwinds favour longs; monitor for follow-through.", tag),
        ),
        Regime::Weak => (
            0.3,
            0.7,
            format!("[{}] Elevated OI or negative funding tilts short; watch for squeeze risk.", tag),
        ),
        Regime::CrossCurrents => (
            0.5,
            0.5,
            format!("[{}] Drivers conflict (momentum vs positioning); stay nimble.", tag),
        ),
        Regime::Balanced => (
            0.5,
            0.5,
            format!("[{}] No clear edge from funding, momentum, or OI; favour range setups.", tag),
        ),
    };

    Outlook {
        long_prob,
        short_prob,
        summary,
    }
}

/// Strictly descending by score, ties by pair name; keeps the first `top_n`
pub fn rank(mut signals: Vec<Signal>, top_n: usize) -> Vec<Signal> {
    signals.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.pair.cmp(&b.pair)));
    signals.truncate(top_n);
    signals
}
