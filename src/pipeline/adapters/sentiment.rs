//! CryptoPanic headline sentiment
//!
//! Endpoint: https://cryptopanic.com/api/v1/posts/
//!
//! Headlines for the pair's base currency are scored with a keyword
//! lexicon and bucketed into one observation per hour. A headline counts
//! +1 if it contains any positive word and -1 if it contains any negative
//! word, so `score_norm = score / mentions` stays within [-1, 1].
//!
//! The same endpoint without a currency filter feeds the market-wide
//! `headlines` table.

use super::headlines::{tracked_keywords, HeadlineSource};
use super::{floor_ts, Adapter, NowFn};
use crate::pipeline::error::AdapterError;
use crate::pipeline::types::{ts_from_secs, Headline, Observation, ObservationKind, ObservationValues};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

const API_URL: &str = "https://cryptopanic.com/api/v1/posts/";
const BUCKET_SECS: i64 = 3600;

/// Keywords tracked per sentiment observation
pub const KEYWORDS: [&str; 7] = [
    "liquidation",
    "margin call",
    "rekt",
    "funding",
    "open interest",
    "crash",
    "rally",
];

pub const POSITIVE_WORDS: [&str; 6] = ["rally", "surge", "bull", "up", "green", "gain"];
pub const NEGATIVE_WORDS: [&str; 7] = ["crash", "drop", "bear", "down", "red", "loss", "liquidat"];

#[derive(Debug, Deserialize)]
struct PostsResponse {
    #[serde(default)]
    results: Vec<Post>,
}

#[derive(Debug, Deserialize)]
struct Post {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    published_at: Option<String>,
}

impl Post {
    /// `None` for posts without a url to key them by
    fn into_headline(self, fallback_ts: DateTime<Utc>) -> Option<Headline> {
        if self.url.is_empty() {
            return None;
        }
        let ts = self
            .published_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(fallback_ts);
        Some(Headline {
            ts,
            source: "cryptopanic".to_string(),
            keywords: tracked_keywords(&self.title),
            title: self.title,
            url: self.url,
        })
    }
}

/// Headline aggregate for one bucket
#[derive(Debug, Clone, PartialEq)]
pub struct HeadlineScore {
    pub mentions: i64,
    pub score_norm: f64,
    pub keywords: BTreeMap<String, i64>,
}

/// Score a batch of headlines against the keyword lexicon
pub fn score_headlines<S: AsRef<str>>(titles: &[S]) -> HeadlineScore {
    let mut keywords: BTreeMap<String, i64> = KEYWORDS.iter().map(|k| (k.to_string(), 0)).collect();
    let mut score: i64 = 0;

    for title in titles {
        let title = title.as_ref().to_lowercase();
        for keyword in KEYWORDS {
            if title.contains(keyword) {
                *keywords.entry(keyword.to_string()).or_insert(0) += 1;
            }
        }
        if POSITIVE_WORDS.iter().any(|w| title.contains(w)) {
            score += 1;
        }
        if NEGATIVE_WORDS.iter().any(|w| title.contains(w)) {
            score -= 1;
        }
    }

    let mentions = titles.len() as i64;
    HeadlineScore {
        mentions,
        score_norm: score as f64 / mentions.max(1) as f64,
        keywords,
    }
}

pub struct CryptoPanicAdapter {
    api_key: String,
    http: reqwest::Client,
    now_fn: NowFn,
}

impl CryptoPanicAdapter {
    pub fn new(api_key: String, timeout: Duration, now_fn: NowFn) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_key,
            http,
            now_fn,
        }
    }

    async fn fetch_posts(&self, currency: Option<&str>) -> Result<Vec<Post>, AdapterError> {
        let mut query = vec![
            ("auth_token", self.api_key.as_str()),
            ("public", "true"),
            ("kind", "news"),
            ("filter", "important"),
        ];
        if let Some(currency) = currency {
            query.push(("currencies", currency));
        }
        let response = self.http.get(API_URL).query(&query).send().await?;

        let status = response.status();
        if status.is_client_error() && !matches!(status.as_u16(), 401 | 403 | 429) {
            return Err(AdapterError::Data(format!("CryptoPanic API error: {}", status)));
        }
        if !status.is_success() {
            return Err(AdapterError::Unavailable(format!("CryptoPanic API error: {}", status)));
        }

        let body: PostsResponse = response.json().await?;
        Ok(body.results)
    }
}

#[async_trait]
impl HeadlineSource for CryptoPanicAdapter {
    fn source(&self) -> &'static str {
        "cryptopanic"
    }

    async fn fetch_headlines(&self) -> Result<Vec<Headline>, AdapterError> {
        let now = (self.now_fn)();
        let mut headlines: Vec<Headline> = self
            .fetch_posts(None)
            .await?
            .into_iter()
            .filter_map(|post| post.into_headline(now))
            .collect();
        headlines.sort_by_key(|h| h.ts);
        Ok(headlines)
    }
}

#[async_trait]
impl Adapter for CryptoPanicAdapter {
    fn kind(&self) -> ObservationKind {
        ObservationKind::Sentiment
    }

    async fn fetch(
        &self,
        exchange: &str,
        symbol: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, AdapterError> {
        let bucket = floor_ts((self.now_fn)(), BUCKET_SECS);
        if since.map_or(false, |s| s.timestamp() >= bucket) {
            return Ok(Vec::new());
        }

        let currency = symbol.split('/').next().unwrap_or(symbol);
        let titles: Vec<String> = self
            .fetch_posts(Some(currency))
            .await?
            .into_iter()
            .map(|p| p.title)
            .collect();
        let scored = score_headlines(&titles);

        let ts = ts_from_secs(bucket)
            .ok_or_else(|| AdapterError::Data(format!("timestamp out of range: {}", bucket)))?;
        Ok(vec![Observation::new(
            format!("{}:{}", exchange, symbol),
            ts,
            ObservationValues::Sentiment {
                mentions: scored.mentions,
                score_norm: scored.score_norm,
                keywords: scored.keywords,
            },
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_score_headlines_counts_keywords_and_polarity() {
        let titles = [
            "Bitcoin rally extends as shorts get rekt",
            "Massive liquidation cascade after ETH crash",
            "Funding flips negative, open interest climbs",
        ];
        let scored = score_headlines(&titles);

        assert_eq!(scored.mentions, 3);
        assert_eq!(scored.keywords["rally"], 1);
        assert_eq!(scored.keywords["rekt"], 1);
        assert_eq!(scored.keywords["liquidation"], 1);
        assert_eq!(scored.keywords["crash"], 1);
        assert_eq!(scored.keywords["funding"], 1);
        assert_eq!(scored.keywords["open interest"], 1);
        assert_eq!(scored.keywords["margin call"], 0);
        // +1 (rally), -1 (liquidat/crash), 0 ("climbs" matches nothing)
        assert!((scored.score_norm - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_score_headlines_empty() {
        let scored = score_headlines::<&str>(&[]);
        assert_eq!(scored.mentions, 0);
        assert_eq!(scored.score_norm, 0.0);
        assert_eq!(scored.keywords.len(), KEYWORDS.len());
    }

    #[test]
    fn test_score_headlines_is_bounded() {
        let scored = score_headlines(&["crash crash drop", "bear market loss"]);
        assert_eq!(scored.score_norm, -1.0);
    }

    #[test]
    fn test_post_to_headline() {
        let fallback = ts_from_secs(1_700_000_000).unwrap();
        let body = r#"{"results":[
            {"title":"Liquidation wave as BTC drops","url":"https://cryptopanic.com/news/1","published_at":"2023-11-14T20:00:00Z"},
            {"title":"No link here"},
            {"title":"Funding resets","url":"https://cryptopanic.com/news/2","published_at":"not a date"}
        ]}"#;
        let parsed: PostsResponse = serde_json::from_str(body).unwrap();
        let headlines: Vec<Headline> = parsed
            .results
            .into_iter()
            .filter_map(|p| p.into_headline(fallback))
            .collect();

        assert_eq!(headlines.len(), 2);
        assert_eq!(headlines[0].ts, ts_from_secs(1_699_992_000).unwrap());
        assert_eq!(headlines[0].keywords, vec!["liquidation".to_string()]);
        assert_eq!(headlines[0].source, "cryptopanic");
        assert_eq!(headlines[1].ts, fallback);
    }

    #[tokio::test]
    async fn test_current_bucket_not_refetched() {
        let now = ts_from_secs(1_700_000_000).unwrap();
        let adapter = CryptoPanicAdapter::new("unused".into(), Duration::from_secs(1), Arc::new(move || now));
        let since = ts_from_secs(floor_ts(now, BUCKET_SECS)).unwrap();

        // short-circuits before any request is made
        let obs = adapter.fetch("binance", "BTC/USDT", Some(since)).await.unwrap();
        assert!(obs.is_empty());
    }

    #[tokio::test]
    #[ignore] // requires CRYPTOPANIC_API_KEY and network access
    async fn test_live_cryptopanic() {
        let key = std::env::var("CRYPTOPANIC_API_KEY").unwrap();
        let adapter = CryptoPanicAdapter::new(key, Duration::from_secs(10), super::super::system_clock());
        let obs = adapter.fetch("binance", "BTC/USDT", None).await.unwrap();
        assert_eq!(obs.len(), 1);
    }
}
