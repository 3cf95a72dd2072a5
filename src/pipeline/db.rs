//! Time-series store: schema migrations, idempotent upserts, latest-row reads
//!
//! Tables written (see `/sql/` directory):
//! - `candles`, `funding_rates`, `open_interest`, `volatility`, `sentiment`
//!   UPSERT on (pair, ts), last write wins
//! - `signals` - UPSERT on (pair, ts), one row per pair per cycle
//! - `headlines` - UPSERT on (source, url), market-wide news
//! - `kv_store` - pipeline health published for collaborators
//!
//! Read-only: `candles_1h` hourly rollup view.

use super::backoff::{with_retry, ExponentialBackoff};
use super::error::StoreError;
use super::types::{
    ts_from_secs, Bias, Headline, Observation, ObservationKind, ObservationValues, Regime, Signal,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Storage boundary used by ingestion tasks and the signal engine
///
/// Implementations must be safe for concurrent use; tasks share one store
/// and rely on upsert semantics for conflict resolution.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Bulk upsert one task's observations in a single transaction
    ///
    /// Operation: INSERT ... ON CONFLICT(pair, ts) DO UPDATE
    /// Returns the number of rows written.
    async fn upsert(
        &self,
        kind: ObservationKind,
        observations: Vec<Observation>,
    ) -> Result<usize, StoreError>;

    /// Write one signal row (replaces an existing row for the same pair and ts)
    async fn upsert_signal(&self, signal: Signal) -> Result<(), StoreError>;

    /// Upsert market-wide headlines in one transaction; returns rows written
    async fn upsert_headlines(&self, headlines: Vec<Headline>) -> Result<usize, StoreError>;

    /// Newest stored timestamp for (kind, pair)
    async fn latest_ts(
        &self,
        kind: ObservationKind,
        pair: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Up to `limit` newest observations with `from < ts <= to`, oldest first
    async fn recent(
        &self,
        kind: ObservationKind,
        pair: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Observation>, StoreError>;

    /// Publish a JSON value under `key` in kv_store
    async fn put_kv(&self, key: &str, value: String) -> Result<(), StoreError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from the specified directory and executes them in
/// lexical order (00_, 01_, 02_, ...). All files must use "IF NOT EXISTS".
pub fn run_schema_migrations(
    conn: &mut Connection,
    schema_dir: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(format!("Schema directory not found: {}", schema_dir).into());
    }

    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().to_string();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// Retry and timeout knobs for store calls
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub op_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(5),
            retry_attempts: 3,
            retry_base: Duration::from_millis(200),
        }
    }
}

/// One hourly OHLC bar from the `candles_1h` rollup
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyBar {
    pub pair: String,
    pub bucket: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// SQLite implementation of TimeSeriesStore
///
/// All calls run on the blocking pool; each is bounded by `op_timeout`.
/// A call that times out is not aborted, so an in-progress write always
/// completes or rolls back as a whole.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    options: StoreOptions,
}

impl SqliteStore {
    /// Open an existing database (schema must already be migrated)
    pub fn open(db_path: &str, options: StoreOptions) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn, options)
    }

    pub fn from_connection(conn: Connection, options: StoreOptions) -> Result<Self, StoreError> {
        conn.busy_timeout(options.op_timeout)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            options,
        })
    }

    fn backoff(&self) -> ExponentialBackoff {
        let base = self.options.retry_base.as_millis() as u64;
        ExponentialBackoff::new(
            base,
            base.saturating_mul(8),
            self.options.retry_attempts.saturating_sub(1),
        )
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        });

        let timeout_ms = self.options.op_timeout.as_millis() as u64;
        match tokio::time::timeout(self.options.op_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Join(join_err.to_string())),
            Err(_) => Err(StoreError::Timeout(timeout_ms)),
        }
    }

    /// Write with bounded retries; every failure surfaces as WriteFailed
    async fn write_with_retry<T, F>(&self, write: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let write = Arc::new(write);
        with_retry(self.backoff(), StoreError::is_transient, || {
            let write = write.clone();
            self.run_blocking(move |conn| write(conn))
        })
        .await
        .map_err(|(err, attempts)| StoreError::WriteFailed {
            attempts,
            reason: err.to_string(),
        })
    }

    /// Signals written for one cycle timestamp, highest score first
    pub async fn signals_at(&self, ts: DateTime<Utc>) -> Result<Vec<Signal>, StoreError> {
        let secs = ts.timestamp();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT pair, ts, score, components, regime, bias, long_prob, short_prob, summary
                 FROM signals WHERE ts = ? ORDER BY score DESC, pair ASC",
            )?;
            let rows = stmt.query_map([secs], signal_from_row)?;
            let mut signals = Vec::new();
            for row in rows {
                signals.push(row??);
            }
            Ok(signals)
        })
        .await
    }

    /// Signal history for a pair, newest first
    pub async fn signal_history(&self, pair: &str, limit: usize) -> Result<Vec<Signal>, StoreError> {
        let pair = pair.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT pair, ts, score, components, regime, bias, long_prob, short_prob, summary
                 FROM signals WHERE pair = ? ORDER BY ts DESC LIMIT ?",
            )?;
            let rows = stmt.query_map(params![pair, limit as i64], signal_from_row)?;
            let mut signals = Vec::new();
            for row in rows {
                signals.push(row??);
            }
            Ok(signals)
        })
        .await
    }

    /// Hourly OHLC bars from the rollup view, oldest first
    pub async fn hourly_ohlc(
        &self,
        pair: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HourlyBar>, StoreError> {
        let pair = pair.to_string();
        let since = since.timestamp();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT pair, bucket, open, high, low, close, volume FROM candles_1h
                 WHERE pair = ? AND bucket >= ? ORDER BY bucket ASC",
            )?;
            let rows = stmt.query_map(params![pair, since], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                ))
            })?;
            let mut bars = Vec::new();
            for row in rows {
                let (pair, bucket, open, high, low, close, volume) = row?;
                let bucket = ts_from_secs(bucket)
                    .ok_or_else(|| StoreError::InvalidRow(format!("bad bucket {}", bucket)))?;
                bars.push(HourlyBar {
                    pair,
                    bucket,
                    open,
                    high,
                    low,
                    close,
                    volume,
                });
            }
            Ok(bars)
        })
        .await
    }

    /// Newest headlines first
    pub async fn recent_headlines(&self, limit: usize) -> Result<Vec<Headline>, StoreError> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT ts, source, title, url, keywords FROM headlines
                 ORDER BY ts DESC, id DESC LIMIT ?",
            )?;
            let rows = stmt.query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            let mut headlines = Vec::new();
            for row in rows {
                let (secs, source, title, url, keywords) = row?;
                headlines.push(Headline {
                    ts: ts_from_secs(secs).ok_or_else(|| StoreError::InvalidRow(format!("bad ts {}", secs)))?,
                    source,
                    title,
                    url,
                    keywords: serde_json::from_str(&keywords)?,
                });
            }
            Ok(headlines)
        })
        .await
    }

    pub async fn get_kv(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.run_blocking(move |conn| {
            Ok(conn
                .query_row("SELECT v FROM kv_store WHERE k = ?", [key], |row| row.get(0))
                .optional()?)
        })
        .await
    }
}

#[async_trait]
impl TimeSeriesStore for SqliteStore {
    async fn upsert(
        &self,
        kind: ObservationKind,
        observations: Vec<Observation>,
    ) -> Result<usize, StoreError> {
        if observations.is_empty() {
            return Ok(0);
        }
        let batch = Arc::new(observations);
        let written = self
            .write_with_retry(move |conn| write_batch(conn, kind, &batch))
            .await?;

        log::debug!("✅ Upserted {} rows into {}", written, kind.table());
        Ok(written)
    }

    async fn upsert_signal(&self, signal: Signal) -> Result<(), StoreError> {
        let components = serde_json::to_string(&signal.components)?;
        let signal = Arc::new(signal);
        self.write_with_retry(move |conn| {
            conn.execute(
                r#"
                INSERT INTO signals (
                    pair, ts, score, components, regime, bias,
                    long_prob, short_prob, summary, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(pair, ts) DO UPDATE SET
                    score = excluded.score,
                    components = excluded.components,
                    regime = excluded.regime,
                    bias = excluded.bias,
                    long_prob = excluded.long_prob,
                    short_prob = excluded.short_prob,
                    summary = excluded.summary,
                    created_at = excluded.created_at
                "#,
                params![
                    signal.pair,
                    signal.ts.timestamp(),
                    signal.score,
                    components,
                    signal.regime.as_str(),
                    signal.bias.as_str(),
                    signal.long_prob,
                    signal.short_prob,
                    signal.summary,
                    Utc::now().timestamp(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_headlines(&self, headlines: Vec<Headline>) -> Result<usize, StoreError> {
        if headlines.is_empty() {
            return Ok(0);
        }
        let batch = Arc::new(headlines);
        let written = self
            .write_with_retry(move |conn| write_headlines(conn, &batch))
            .await?;

        log::debug!("✅ Upserted {} headlines", written);
        Ok(written)
    }

    async fn latest_ts(
        &self,
        kind: ObservationKind,
        pair: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let pair = pair.to_string();
        self.run_blocking(move |conn| {
            let sql = format!("SELECT MAX(ts) FROM {} WHERE pair = ?", kind.table());
            let max: Option<i64> = conn.query_row(&sql, [pair], |row| row.get(0))?;
            Ok(max.and_then(ts_from_secs))
        })
        .await
    }

    async fn recent(
        &self,
        kind: ObservationKind,
        pair: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Observation>, StoreError> {
        let pair = pair.to_string();
        let (from, to) = (from.timestamp(), to.timestamp());
        self.run_blocking(move |conn| {
            let columns = match kind {
                ObservationKind::Candle => "pair, ts, open, high, low, close, volume",
                ObservationKind::Funding => "pair, ts, rate",
                ObservationKind::OpenInterest => "pair, ts, value_usd",
                ObservationKind::Volatility => "pair, ts, atr",
                ObservationKind::Sentiment => "pair, ts, mentions, score_norm, keywords",
            };
            let sql = format!(
                "SELECT {} FROM {} WHERE pair = ? AND ts > ? AND ts <= ? ORDER BY ts DESC LIMIT ?",
                columns,
                kind.table()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![pair, from, to, limit as i64], |row| {
                Ok(observation_from_row(kind, row))
            })?;

            let mut observations = Vec::new();
            for row in rows {
                observations.push(row??);
            }
            observations.reverse();
            Ok(observations)
        })
        .await
    }

    async fn put_kv(&self, key: &str, value: String) -> Result<(), StoreError> {
        serde_json::from_str::<serde_json::Value>(&value)?;
        let key = key.to_string();
        self.write_with_retry(move |conn| {
            conn.execute(
                "INSERT INTO kv_store (k, v, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(k) DO UPDATE SET v = excluded.v, updated_at = excluded.updated_at",
                params![key, value, Utc::now().timestamp()],
            )?;
            Ok(())
        })
        .await
    }
}

fn write_batch(
    conn: &mut Connection,
    kind: ObservationKind,
    observations: &[Observation],
) -> Result<usize, StoreError> {
    let tx = conn.transaction()?;
    let mut written = 0;

    for obs in observations {
        if obs.kind() != kind {
            return Err(StoreError::InvalidRow(format!(
                "{} observation in {} batch",
                obs.kind(),
                kind
            )));
        }
        let ts = obs.ts.timestamp();

        written += match &obs.values {
            ObservationValues::Candle {
                open,
                high,
                low,
                close,
                volume,
            } => tx.prepare_cached(
                r#"
                INSERT INTO candles (pair, ts, open, high, low, close, volume)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(pair, ts) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume
                "#,
            )?
            .execute(params![obs.pair, ts, open, high, low, close, volume])?,
            ObservationValues::Funding { rate } => tx
                .prepare_cached(
                    "INSERT INTO funding_rates (pair, ts, rate) VALUES (?, ?, ?)
                     ON CONFLICT(pair, ts) DO UPDATE SET rate = excluded.rate",
                )?
                .execute(params![obs.pair, ts, rate])?,
            ObservationValues::OpenInterest { value_usd } => tx
                .prepare_cached(
                    "INSERT INTO open_interest (pair, ts, value_usd) VALUES (?, ?, ?)
                     ON CONFLICT(pair, ts) DO UPDATE SET value_usd = excluded.value_usd",
                )?
                .execute(params![obs.pair, ts, value_usd])?,
            ObservationValues::Volatility { atr } => tx
                .prepare_cached(
                    "INSERT INTO volatility (pair, ts, atr) VALUES (?, ?, ?)
                     ON CONFLICT(pair, ts) DO UPDATE SET atr = excluded.atr",
                )?
                .execute(params![obs.pair, ts, atr])?,
            ObservationValues::Sentiment {
                mentions,
                score_norm,
                keywords,
            } => {
                let keywords = serde_json::to_string(keywords)?;
                tx.prepare_cached(
                    r#"
                    INSERT INTO sentiment (pair, ts, mentions, score_norm, keywords)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(pair, ts) DO UPDATE SET
                        mentions = excluded.mentions,
                        score_norm = excluded.score_norm,
                        keywords = excluded.keywords
                    "#,
                )?
                .execute(params![obs.pair, ts, mentions, score_norm, keywords])?
            }
        };
    }

    tx.commit()?;
    Ok(written)
}

fn write_headlines(conn: &mut Connection, headlines: &[Headline]) -> Result<usize, StoreError> {
    let tx = conn.transaction()?;
    let mut written = 0;
    for headline in headlines {
        let keywords = serde_json::to_string(&headline.keywords)?;
        written += tx
            .prepare_cached(
                r#"
                INSERT INTO headlines (ts, source, title, url, keywords)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(source, url) DO UPDATE SET
                    ts = excluded.ts,
                    title = excluded.title,
                    keywords = excluded.keywords
                "#,
            )?
            .execute(params![
                headline.ts.timestamp(),
                headline.source,
                headline.title,
                headline.url,
                keywords
            ])?;
    }
    tx.commit()?;
    Ok(written)
}

fn observation_from_row(kind: ObservationKind, row: &Row<'_>) -> Result<Observation, StoreError> {
    let pair: String = row.get(0)?;
    let secs: i64 = row.get(1)?;
    let ts = ts_from_secs(secs).ok_or_else(|| StoreError::InvalidRow(format!("bad ts {}", secs)))?;

    let values = match kind {
        ObservationKind::Candle => ObservationValues::Candle {
            open: row.get(2)?,
            high: row.get(3)?,
            low: row.get(4)?,
            close: row.get(5)?,
            volume: row.get(6)?,
        },
        ObservationKind::Funding => ObservationValues::Funding { rate: row.get(2)? },
        ObservationKind::OpenInterest => ObservationValues::OpenInterest {
            value_usd: row.get(2)?,
        },
        ObservationKind::Volatility => ObservationValues::Volatility { atr: row.get(2)? },
        ObservationKind::Sentiment => {
            let raw: String = row.get(4)?;
            let keywords: BTreeMap<String, i64> = serde_json::from_str(&raw)?;
            ObservationValues::Sentiment {
                mentions: row.get(2)?,
                score_norm: row.get(3)?,
                keywords,
            }
        }
    };

    Ok(Observation { pair, ts, values })
}

fn signal_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Signal, StoreError>> {
    let secs: i64 = row.get(1)?;
    let components: String = row.get(3)?;
    let regime: String = row.get(4)?;
    let bias: String = row.get(5)?;
    let pair: String = row.get(0)?;
    let score: f64 = row.get(2)?;
    let long_prob: f64 = row.get(6)?;
    let short_prob: f64 = row.get(7)?;
    let summary: String = row.get(8)?;

    let build = || -> Result<Signal, StoreError> {
        Ok(Signal {
            pair,
            ts: ts_from_secs(secs).ok_or_else(|| StoreError::InvalidRow(format!("bad ts {}", secs)))?,
            score,
            components: serde_json::from_str(&components)?,
            regime: Regime::parse(&regime)
                .ok_or_else(|| StoreError::InvalidRow(format!("unknown regime {}", regime)))?,
            bias: Bias::parse(&bias).ok_or_else(|| StoreError::InvalidRow(format!("unknown bias {}", bias)))?,
            long_prob,
            short_prob,
            summary,
        })
    };
    Ok(build())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    pub(crate) fn schema_dir() -> String {
        concat!(env!("CARGO_MANIFEST_DIR"), "/sql").to_string()
    }

    /// Helper to create a migrated test database
    pub(crate) fn create_test_store() -> (NamedTempFile, SqliteStore) {
        create_test_store_with(StoreOptions {
            op_timeout: Duration::from_secs(5),
            retry_attempts: 3,
            retry_base: Duration::from_millis(1),
        })
    }

    pub(crate) fn create_test_store_with(options: StoreOptions) -> (NamedTempFile, SqliteStore) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();

        let mut conn = Connection::open(&db_path).unwrap();
        run_schema_migrations(&mut conn, &schema_dir()).unwrap();
        drop(conn);

        let store = SqliteStore::open(&db_path, options).unwrap();
        (temp_file, store)
    }

    /// Second connection holding the database write lock
    fn lock_writes(temp: &NamedTempFile) -> Connection {
        let conn = Connection::open(temp.path()).unwrap();
        conn.execute_batch("BEGIN EXCLUSIVE;").unwrap();
        conn
    }

    fn at(secs: i64) -> DateTime<Utc> {
        ts_from_secs(secs).unwrap()
    }

    fn candle(pair: &str, secs: i64, close: f64) -> Observation {
        Observation::new(
            pair,
            at(secs),
            ObservationValues::Candle {
                open: close - 1.0,
                high: close + 2.0,
                low: close - 2.0,
                close,
                volume: 10.0,
            },
        )
    }

    #[tokio::test]
    async fn test_upsert_is_last_write_wins() {
        let (_temp, store) = create_test_store();
        let pair = "binance:BTC/USDT";

        store
            .upsert(ObservationKind::Candle, vec![candle(pair, 3600, 100.0)])
            .await
            .unwrap();
        store
            .upsert(ObservationKind::Candle, vec![candle(pair, 3600, 105.0)])
            .await
            .unwrap();

        let rows = store
            .recent(ObservationKind::Candle, pair, at(0), at(7200), 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].primary_value(), 105.0);
    }

    #[tokio::test]
    async fn test_batch_upsert_and_latest_ts() {
        let (_temp, store) = create_test_store();
        let pair = "bybit:ETH/USDT";

        let written = store
            .upsert(
                ObservationKind::Candle,
                vec![candle(pair, 3600, 1.0), candle(pair, 7200, 2.0), candle(pair, 10800, 3.0)],
            )
            .await
            .unwrap();
        assert_eq!(written, 3);

        let latest = store.latest_ts(ObservationKind::Candle, pair).await.unwrap();
        assert_eq!(latest, Some(at(10800)));
        assert_eq!(store.latest_ts(ObservationKind::Funding, pair).await.unwrap(), None);

        let window = store
            .recent(ObservationKind::Candle, pair, at(3600), at(10800), 10)
            .await
            .unwrap();
        assert_eq!(window.iter().map(|o| o.primary_value()).collect::<Vec<_>>(), vec![2.0, 3.0]);

        let limited = store
            .recent(ObservationKind::Candle, pair, at(0), at(10800), 1)
            .await
            .unwrap();
        assert_eq!(limited[0].ts, at(10800));
    }

    #[tokio::test]
    async fn test_mixed_kind_batch_rolls_back() {
        let (_temp, store) = create_test_store();
        let pair = "binance:BTC/USDT";

        let batch = vec![
            candle(pair, 3600, 1.0),
            Observation::new(pair, at(7200), ObservationValues::Funding { rate: 0.0001 }),
        ];
        let result = store.upsert(ObservationKind::Candle, batch).await;
        assert!(matches!(result, Err(StoreError::WriteFailed { attempts: 1, .. })));

        let latest = store.latest_ts(ObservationKind::Candle, pair).await.unwrap();
        assert_eq!(latest, None);
    }

    #[tokio::test]
    async fn test_sentiment_keywords_round_trip() {
        let (_temp, store) = create_test_store();
        let pair = "binance:SOL/USDT";
        let mut keywords = BTreeMap::new();
        keywords.insert("liquidation".to_string(), 3);

        store
            .upsert(
                ObservationKind::Sentiment,
                vec![Observation::new(
                    pair,
                    at(3600),
                    ObservationValues::Sentiment {
                        mentions: 12,
                        score_norm: -0.25,
                        keywords: keywords.clone(),
                    },
                )],
            )
            .await
            .unwrap();

        let rows = store
            .recent(ObservationKind::Sentiment, pair, at(0), at(3600), 5)
            .await
            .unwrap();
        assert_eq!(
            rows[0].values,
            ObservationValues::Sentiment {
                mentions: 12,
                score_norm: -0.25,
                keywords
            }
        );
    }

    #[tokio::test]
    async fn test_signal_upsert_one_row_per_cycle() {
        let (_temp, store) = create_test_store();
        let mut components = BTreeMap::new();
        components.insert("candle".to_string(), 0.3);

        let mut signal = Signal {
            pair: "binance:BTC/USDT".to_string(),
            ts: at(1_700_000_000),
            score: 0.3,
            components,
            regime: Regime::Constructive,
            bias: Bias::Long,
            long_prob: 0.7,
            short_prob: 0.3,
            summary: "[Balanced] Momentum/funding tailwinds favour longs; monitor for follow-through.".to_string(),
        };
        store.upsert_signal(signal.clone()).await.unwrap();

        signal.score = 0.5;
        signal.regime = Regime::Weak;
        signal.bias = Bias::Short;
        signal.long_prob = 0.3;
        signal.short_prob = 0.7;
        store.upsert_signal(signal.clone()).await.unwrap();

        let mut next = signal.clone();
        next.ts = at(1_700_000_300);
        store.upsert_signal(next).await.unwrap();

        let at_cycle = store.signals_at(at(1_700_000_000)).await.unwrap();
        assert_eq!(at_cycle, vec![signal]);

        let history = store.signal_history("binance:BTC/USDT", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].ts, at(1_700_000_300));
    }

    #[tokio::test]
    async fn test_locked_database_exhausts_write_retries() {
        let (temp, store) = create_test_store_with(StoreOptions {
            op_timeout: Duration::from_millis(100),
            retry_attempts: 3,
            retry_base: Duration::from_millis(20),
        });
        let locker = lock_writes(&temp);
        let pair = "binance:BTC/USDT";

        let started = std::time::Instant::now();
        let result = store.upsert(ObservationKind::Candle, vec![candle(pair, 3600, 1.0)]).await;

        match result {
            Err(StoreError::WriteFailed { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(
                    reason.contains("locked") || reason.contains("busy") || reason.contains("timed out"),
                    "unexpected reason: {}",
                    reason
                );
            }
            other => panic!("expected WriteFailed, got {:?}", other),
        }
        // 20ms then 40ms of backoff between the three attempts
        assert!(started.elapsed() >= Duration::from_millis(60));
        locker.execute_batch("ROLLBACK;").unwrap();
    }

    #[tokio::test]
    async fn test_write_retried_after_lock_released() {
        let (temp, store) = create_test_store_with(StoreOptions {
            op_timeout: Duration::from_millis(100),
            retry_attempts: 3,
            retry_base: Duration::from_millis(150),
        });
        let locker = lock_writes(&temp);
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            locker.execute_batch("COMMIT;").unwrap();
        });

        let pair = "bybit:ETH/USDT";
        let written = store
            .upsert(ObservationKind::Candle, vec![candle(pair, 3600, 1.0), candle(pair, 7200, 2.0)])
            .await
            .unwrap();
        releaser.join().unwrap();

        assert_eq!(written, 2);
        assert_eq!(store.latest_ts(ObservationKind::Candle, pair).await.unwrap(), Some(at(7200)));
    }

    #[tokio::test]
    async fn test_headlines_upsert_by_source_and_url() {
        let (_temp, store) = create_test_store();
        let headline = |secs: i64, url: &str, title: &str| Headline {
            ts: at(secs),
            source: "cryptopanic".to_string(),
            title: title.to_string(),
            url: url.to_string(),
            keywords: vec!["funding".to_string()],
        };

        let written = store
            .upsert_headlines(vec![
                headline(3600, "https://news.example/a", "Funding flips negative"),
                headline(7200, "https://news.example/b", "Open interest at record"),
            ])
            .await
            .unwrap();
        assert_eq!(written, 2);

        // same url, corrected title
        store
            .upsert_headlines(vec![headline(3600, "https://news.example/a", "Funding flips deeply negative")])
            .await
            .unwrap();
        assert_eq!(store.upsert_headlines(vec![]).await.unwrap(), 0);

        let stored = store.recent_headlines(10).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].url, "https://news.example/b");
        assert_eq!(stored[1].title, "Funding flips deeply negative");
        assert_eq!(stored[1].keywords, vec!["funding".to_string()]);
    }

    #[tokio::test]
    async fn test_hourly_rollup_view() {
        let (_temp, store) = create_test_store();
        let pair = "binance:BTC/USDT";

        let bars = vec![
            Observation::new(
                pair,
                at(3600),
                ObservationValues::Candle { open: 10.0, high: 12.0, low: 9.0, close: 11.0, volume: 1.0 },
            ),
            Observation::new(
                pair,
                at(3600 + 1800),
                ObservationValues::Candle { open: 11.0, high: 15.0, low: 10.0, close: 14.0, volume: 2.0 },
            ),
            Observation::new(
                pair,
                at(7200),
                ObservationValues::Candle { open: 14.0, high: 14.5, low: 13.0, close: 13.5, volume: 4.0 },
            ),
        ];
        store.upsert(ObservationKind::Candle, bars).await.unwrap();

        let hourly = store.hourly_ohlc(pair, at(0)).await.unwrap();
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].bucket, at(3600));
        assert_eq!(hourly[0].open, 10.0);
        assert_eq!(hourly[0].high, 15.0);
        assert_eq!(hourly[0].low, 9.0);
        assert_eq!(hourly[0].close, 14.0);
        assert_eq!(hourly[0].volume, 3.0);
        assert_eq!(hourly[1].close, 13.5);
    }

    #[tokio::test]
    async fn test_kv_store_rejects_invalid_json() {
        let (_temp, store) = create_test_store();

        store.put_kv("pipeline_health", r#"{"failed_tasks":0}"#.to_string()).await.unwrap();
        store.put_kv("pipeline_health", r#"{"failed_tasks":2}"#.to_string()).await.unwrap();
        assert_eq!(
            store.get_kv("pipeline_health").await.unwrap().as_deref(),
            Some(r#"{"failed_tasks":2}"#)
        );

        assert!(store.put_kv("broken", r#"{"incomplete": "#.to_string()).await.is_err());
        assert_eq!(store.get_kv("broken").await.unwrap(), None);
    }

    #[test]
    fn test_missing_schema_dir() {
        let mut conn = Connection::open_in_memory().unwrap();
        let result = run_schema_migrations(&mut conn, "/nonexistent/schema");
        assert!(result.is_err());
    }
}
