//! Candlestick history: DB-first reads with a freshness policy, upstream
//! REST fallback, and the startup seeder.
//!
//! The read path never blocks on cache warming: upstream rows are returned
//! to the caller immediately and the bulk upsert happens on a spawned task.

use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SEED_INTERVALS, SEED_SYMBOLS};
use crate::models::{Interval, Kline};
use crate::store::DocStore;

pub const DEFAULT_LIMIT: usize = 500;
pub const MAX_LIMIT: usize = 1000;

/// Inter-request pacing for the seeder, doubled-ish after a failure to back
/// off upstream rate limits.
const SEED_PACE: Duration = Duration::from_millis(200);
const SEED_PACE_AFTER_FAILURE: Duration = Duration::from_millis(500);
/// Skip seeding a key that already holds this fraction of the target rows.
const SEED_SKIP_RATIO: f64 = 0.9;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("unknown symbol")]
    SymbolNotFound,
    #[error("upstream rate limit exceeded")]
    TooManyRequests,
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Should the read path fall through to upstream?
///
/// Yes when the store returned fewer rows than asked for, or when the query
/// had no explicit range and the newest stored candle is older than
/// `multiplier * duration(interval)`.
pub fn needs_upstream(
    row_count: usize,
    limit: usize,
    ranged: bool,
    latest_open_time: Option<i64>,
    interval: Interval,
    now_ms: i64,
    multiplier: i64,
) -> bool {
    if row_count < limit {
        return true;
    }
    !ranged && is_stale(latest_open_time, interval, now_ms, multiplier)
}

pub fn is_stale(
    latest_open_time: Option<i64>,
    interval: Interval,
    now_ms: i64,
    multiplier: i64,
) -> bool {
    match latest_open_time {
        Some(open_time) => now_ms - open_time > multiplier * interval.duration_ms(),
        None => true,
    }
}

pub struct HistoryService {
    store: Arc<DocStore>,
    http: reqwest::Client,
    rest_base: String,
    stale_multiplier: i64,
}

impl HistoryService {
    pub fn new(
        store: Arc<DocStore>,
        http: reqwest::Client,
        rest_base: String,
        stale_multiplier: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            http,
            rest_base,
            stale_multiplier,
        })
    }

    /// DB-first ranged read. Falls through to the upstream REST endpoint on
    /// a short or stale result, returning upstream rows immediately while a
    /// background task warms the store for the next call.
    pub async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Kline>, HistoryError> {
        let limit = limit.clamp(1, MAX_LIMIT);
        let ranged = start_time.is_some() || end_time.is_some();

        let rows = self
            .store
            .find_klines(symbol, interval, start_time, end_time, limit as i64)
            .await
            .map_err(HistoryError::Internal)?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let latest = rows.last().map(|row| row.open_time);
        if !needs_upstream(
            rows.len(),
            limit,
            ranged,
            latest,
            interval,
            now_ms,
            self.stale_multiplier,
        ) {
            return Ok(rows);
        }

        debug!(
            symbol,
            interval = %interval,
            db_rows = rows.len(),
            limit,
            "history cache miss, fetching upstream"
        );
        let fetched = self
            .fetch_upstream(symbol, interval, start_time, end_time, limit)
            .await?;

        // Warm the cache for next time; the caller does not wait for it.
        if !fetched.is_empty() {
            let store = self.store.clone();
            let warm = fetched.clone();
            tokio::spawn(async move {
                if let Err(e) = store.bulk_upsert(&warm).await {
                    warn!(error = %e, "history cache warm failed");
                }
            });
        }

        Ok(fetched)
    }

    /// Stream-path upsert for candle events coming off the feed.
    pub async fn upsert_stream_kline(&self, row: &Kline) -> anyhow::Result<()> {
        self.store.upsert_kline(row).await
    }

    async fn fetch_upstream(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Kline>, HistoryError> {
        let url = format!("{}/api/v3/klines", self.rest_base);
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(start) = start_time {
            query.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_time {
            query.push(("endTime", end.to_string()));
        }

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| HistoryError::UpstreamUnavailable(e.to_string()))?;

        map_upstream_status(response.status().as_u16())?;

        let body: Vec<Vec<Value>> = response
            .json()
            .await
            .map_err(|e| HistoryError::UpstreamUnavailable(e.to_string()))?;

        let rows = body
            .iter()
            .filter_map(|row| decode_rest_row(symbol, interval, row))
            .collect();
        Ok(rows)
    }

    /// Background seeder: warms a fixed symbol x interval grid without ever
    /// blocking startup. Failures are logged and skipped.
    pub fn spawn_seeder(self: Arc<Self>, seed_limit: u32) -> JoinHandle<()> {
        let service = self;
        tokio::spawn(async move {
            info!(
                symbols = SEED_SYMBOLS.len(),
                intervals = SEED_INTERVALS.len(),
                limit = seed_limit,
                "🌱 history seeder starting"
            );
            let mut seeded = 0usize;
            for symbol in SEED_SYMBOLS {
                for interval in SEED_INTERVALS {
                    match service.seed_one(symbol, interval, seed_limit).await {
                        Ok(written) => {
                            if written > 0 {
                                seeded += written;
                            }
                            tokio::time::sleep(SEED_PACE).await;
                        }
                        Err(e) => {
                            warn!(symbol, interval = %interval, error = %e, "seed failed");
                            tokio::time::sleep(SEED_PACE_AFTER_FAILURE).await;
                        }
                    }
                }
            }
            info!(rows = seeded, "🌱 history seeder done");
        })
    }

    async fn seed_one(
        &self,
        symbol: &str,
        interval: Interval,
        seed_limit: u32,
    ) -> anyhow::Result<usize> {
        let existing = self.store.count_klines(symbol, interval).await?;
        if existing as f64 >= SEED_SKIP_RATIO * seed_limit as f64 {
            debug!(symbol, interval = %interval, existing, "seed target already met");
            return Ok(0);
        }

        let start_time = self
            .store
            .latest_open_time(symbol, interval)
            .await?
            .map(|open_time| open_time + 1);

        let rows = self
            .fetch_upstream(symbol, interval, start_time, None, seed_limit as usize)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        if rows.is_empty() {
            return Ok(0);
        }
        self.store
            .bulk_upsert(&rows)
            .await
            .context("seed bulk upsert failed")
    }
}

fn map_upstream_status(status: u16) -> Result<(), HistoryError> {
    match status {
        200..=299 => Ok(()),
        429 => Err(HistoryError::TooManyRequests),
        // The exchange rejects unknown symbols with a 4xx.
        400 | 404 => Err(HistoryError::SymbolNotFound),
        other => Err(HistoryError::UpstreamUnavailable(format!(
            "upstream returned {other}"
        ))),
    }
}

/// Decode one positional REST row:
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume,
///   trades, takerBuyBaseVolume, takerBuyQuoteVolume, _ignored]`.
/// Rows fetched over REST are finished candles and stored closed.
fn decode_rest_row(symbol: &str, interval: Interval, row: &[Value]) -> Option<Kline> {
    fn as_i64(value: &Value) -> Option<i64> {
        value.as_i64()
    }
    fn as_string(value: &Value) -> Option<String> {
        value.as_str().map(str::to_string)
    }

    Some(Kline {
        symbol: symbol.to_string(),
        interval,
        open_time: as_i64(row.first()?)?,
        open: as_string(row.get(1)?)?,
        high: as_string(row.get(2)?)?,
        low: as_string(row.get(3)?)?,
        close: as_string(row.get(4)?)?,
        volume: as_string(row.get(5)?)?,
        close_time: as_i64(row.get(6)?)?,
        quote_volume: as_string(row.get(7)?)?,
        trades: as_i64(row.get(8)?)?,
        taker_buy_base_volume: as_string(row.get(9)?)?,
        taker_buy_quote_volume: as_string(row.get(10)?)?,
        is_closed: true,
    })
}
