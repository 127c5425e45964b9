//! Document store for OHLCV history and persisted price events.
//!
//! All writes are idempotent upserts. The `klines` collection is keyed by
//! the unique `(symbol, interval, openTime)` index; closed candles are
//! immutable: the upsert filter excludes rows already marked closed, and
//! the duplicate-key insert that results from racing an existing closed row
//! is swallowed.

use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{doc, Document},
    error::{ErrorKind, WriteFailure},
    options::IndexOptions,
    Client, Collection, IndexModel,
};
use tracing::info;

use crate::models::{Interval, Kline};

const KLINES_COLLECTION: &str = "klines";
const PRICE_EVENTS_COLLECTION: &str = "price_events";

pub struct DocStore {
    klines: Collection<Kline>,
    price_events: Collection<Document>,
}

impl DocStore {
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .context("failed to connect to document store")?;
        let db = client.database(db_name);

        let store = Self {
            klines: db.collection(KLINES_COLLECTION),
            price_events: db.collection(PRICE_EVENTS_COLLECTION),
        };
        store.ensure_indexes().await?;
        info!(db = db_name, "📦 document store ready");
        Ok(store)
    }

    /// Unique key index plus the descending read index used by history
    /// queries; `price_events` gets its idempotency key.
    async fn ensure_indexes(&self) -> Result<()> {
        self.klines
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "symbol": 1, "interval": 1, "openTime": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await
            .context("failed to create unique kline index")?;

        self.klines
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "symbol": 1, "interval": 1, "openTime": -1 })
                    .build(),
            )
            .await
            .context("failed to create kline query index")?;

        self.price_events
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "symbol": 1, "ts": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await
            .context("failed to create price event index")?;

        Ok(())
    }

    /// Upsert one candle. A row that is already closed is never reopened or
    /// rewritten; stream updates racing a closed row are ignored.
    pub async fn upsert_kline(&self, row: &Kline) -> Result<()> {
        let filter = doc! {
            "symbol": &row.symbol,
            "interval": row.interval.as_str(),
            "openTime": row.open_time,
            "isClosed": { "$ne": true },
        };
        let update = doc! {
            "$set": {
                "symbol": &row.symbol,
                "interval": row.interval.as_str(),
                "openTime": row.open_time,
                "closeTime": row.close_time,
                "open": &row.open,
                "high": &row.high,
                "low": &row.low,
                "close": &row.close,
                "volume": &row.volume,
                "quoteVolume": &row.quote_volume,
                "trades": row.trades,
                "takerBuyBaseVolume": &row.taker_buy_base_volume,
                "takerBuyQuoteVolume": &row.taker_buy_quote_volume,
                "isClosed": row.is_closed,
            },
        };

        match self.klines.update_one(filter, update).upsert(true).await {
            Ok(_) => Ok(()),
            // The key exists but is closed: the upsert tried to insert a
            // duplicate. Closed candles are immutable, so this is a no-op.
            Err(e) if is_duplicate_key(&e) => Ok(()),
            Err(e) => Err(e).context("kline upsert failed"),
        }
    }

    pub async fn bulk_upsert(&self, rows: &[Kline]) -> Result<usize> {
        let mut written = 0usize;
        for row in rows {
            self.upsert_kline(row).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Range query for the history read path. With a time range the result
    /// is oldest-first within the range; without one it is the most recent
    /// `limit` rows, still returned ascending.
    pub async fn find_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Kline>> {
        let mut filter = doc! { "symbol": symbol, "interval": interval.as_str() };
        let mut open_time = Document::new();
        if let Some(start) = start_time {
            open_time.insert("$gte", start);
        }
        if let Some(end) = end_time {
            open_time.insert("$lte", end);
        }
        let ranged = !open_time.is_empty();
        if ranged {
            filter.insert("openTime", open_time);
        }

        let sort = if ranged {
            doc! { "openTime": 1 }
        } else {
            doc! { "openTime": -1 }
        };

        let mut cursor = self
            .klines
            .find(filter)
            .sort(sort)
            .limit(limit)
            .await
            .context("kline range query failed")?;

        let mut rows = Vec::new();
        while let Some(row) = cursor.try_next().await? {
            rows.push(row);
        }
        if !ranged {
            rows.reverse();
        }
        Ok(rows)
    }

    pub async fn count_klines(&self, symbol: &str, interval: Interval) -> Result<u64> {
        self.klines
            .count_documents(doc! { "symbol": symbol, "interval": interval.as_str() })
            .await
            .context("kline count failed")
    }

    pub async fn latest_open_time(&self, symbol: &str, interval: Interval) -> Result<Option<i64>> {
        let row = self
            .klines
            .find_one(doc! { "symbol": symbol, "interval": interval.as_str() })
            .sort(doc! { "openTime": -1 })
            .await
            .context("latest open time lookup failed")?;
        Ok(row.map(|r| r.open_time))
    }

    /// Idempotent sink for the persistence worker: at most one record per
    /// `(symbol, ts)`, safe under queue redelivery.
    pub async fn record_price_event(
        &self,
        symbol: &str,
        price: &str,
        ts: i64,
        source: &str,
    ) -> Result<()> {
        let filter = doc! { "symbol": symbol, "ts": ts };
        let update = doc! {
            "$set": {
                "symbol": symbol,
                "ts": ts,
                "price": price,
                "source": source,
            },
            "$setOnInsert": {
                "recordedAt": chrono::Utc::now().timestamp_millis(),
            },
        };
        match self
            .price_events
            .update_one(filter, update)
            .upsert(true)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Ok(()),
            Err(e) => Err(e).context("price event upsert failed"),
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        _ => false,
    }
}
