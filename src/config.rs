//! Service configuration from environment variables.
//!
//! Every knob has a default that works against a local Redis + Mongo and the
//! public exchange endpoints, so `cargo run` with no .env is a working dev
//! setup.

use crate::models::Interval;
use std::env;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WS listen port.
    pub port: u16,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    /// Upstream combined-stream WS base, e.g. `wss://stream.binance.com:9443`.
    pub ws_base: String,
    /// Upstream REST base, e.g. `https://api.binance.com`.
    pub rest_base: String,
    /// Combined-stream names joined into the connection URL.
    pub streams: Vec<String>,
    pub queue_name: String,
    pub mongodb_uri: String,
    /// CORS origin; `*` allows all.
    pub frontend_url: String,
    /// Freshness multiplier: a series is stale when the newest candle is
    /// older than `stale_multiplier * duration(interval)`.
    pub stale_multiplier: i64,
    /// Candles fetched per (symbol, interval) by the startup seeder.
    pub seed_limit: u32,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3000);

        let redis_host = env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());
        let redis_port = env::var("REDIS_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(6379);
        let redis_password = env::var("REDIS_PASSWORD")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let ws_base = env::var("BINANCE_SPOT_WS_BASE")
            .unwrap_or_else(|_| "wss://stream.binance.com:9443".to_string());
        let rest_base = env::var("BINANCE_SPOT_REST_BASE")
            .unwrap_or_else(|_| "https://api.binance.com".to_string());

        let streams = env::var("BINANCE_STREAMS")
            .unwrap_or_else(|_| "btcusdt@miniTicker".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let queue_name = env::var("PRICE_QUEUE_NAME").unwrap_or_else(|_| "price".to_string());

        let mongodb_uri = env::var("MONGODB_URI")
            .unwrap_or_else(|_| "mongodb://localhost:27017/chart_db".to_string());

        let frontend_url = env::var("FRONTEND_URL").unwrap_or_else(|_| "*".to_string());

        let stale_multiplier = env::var("STALE_MULTIPLIER")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0)
            .unwrap_or(3);

        let seed_limit = env::var("SEED_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v| v > 0 && v <= 1000)
            .unwrap_or(1000);

        Self {
            port,
            redis_host,
            redis_port,
            redis_password,
            ws_base,
            rest_base,
            streams,
            queue_name,
            mongodb_uri,
            frontend_url,
            stale_multiplier,
            seed_limit,
        }
    }

    /// Redis connection URL for both the broker and the job queue.
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => {
                format!("redis://:{}@{}:{}/", password, self.redis_host, self.redis_port)
            }
            None => format!("redis://{}:{}/", self.redis_host, self.redis_port),
        }
    }

    /// Upstream combined-stream URL for the configured stream names.
    pub fn stream_url(&self) -> String {
        format!("{}/stream?streams={}", self.ws_base, self.streams.join("/"))
    }

    /// Database name from the Mongo URI path, falling back to `chart_db`.
    pub fn mongo_db_name(&self) -> String {
        self.mongodb_uri
            .rsplit('/')
            .next()
            .map(|tail| tail.split('?').next().unwrap_or(tail))
            .filter(|name| !name.is_empty() && !name.contains(':'))
            .unwrap_or("chart_db")
            .to_string()
    }
}

/// Seed plan for the startup history warmer: symbol x interval combinations
/// backfilled in the background.
pub const SEED_SYMBOLS: [&str; 7] = [
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT", "ADAUSDT", "DOGEUSDT",
];

pub const SEED_INTERVALS: [Interval; 6] = [
    Interval::M1,
    Interval::M5,
    Interval::M15,
    Interval::H1,
    Interval::H4,
    Interval::D1,
];

pub fn load_env() {
    // Standard dotenv search (cwd + parents), then the manifest dir for runs
    // started with --manifest-path from elsewhere.
    let _ = dotenv::dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
