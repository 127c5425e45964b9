//! Chartfeed - real-time market-data fan-out service.
//!
//! Composition root: wires the component graph in dependency order
//! (broker, store, queue -> feed, throttler, gateway, history -> worker),
//! starts the HTTP/WS server, and runs the ordered shutdown sequence.

use anyhow::{Context, Result};
use axum::{
    http::HeaderValue,
    middleware as axum_mw,
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use chartfeed_backend::{
    api::{routes, AppState},
    broker::RedisBroker,
    config::{load_env, Config},
    feed::UpstreamFeed,
    gateway::{ws::prices_handler, FanOut, WsGateway},
    history::HistoryService,
    models::{Interval, Kline, PriceEvent, PriceUpdate},
    queue::{JobQueue, PersistenceWorker, PersistPricePayload, KIND_PERSIST_PRICE},
    store::DocStore,
    throttle::{EmitFn, ThrottledBroadcaster},
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = Config::from_env();
    info!(port = config.port, streams = ?config.streams, "🚀 chartfeed starting");

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    // External services first.
    let store = Arc::new(
        DocStore::connect(&config.mongodb_uri, &config.mongo_db_name())
            .await
            .context("document store connection failed")?,
    );
    let queue = JobQueue::connect(&config.redis_url(), &config.queue_name)
        .await
        .context("job queue connection failed")?;

    let origin = Uuid::new_v4().to_string();
    let broker = RedisBroker::connect(&config.redis_url(), origin)
        .await
        .context("broker connection failed")?;

    // Core streaming components.
    let gateway = Arc::new(WsGateway::new());
    let history = HistoryService::new(
        store.clone(),
        http_client,
        config.rest_base.clone(),
        config.stale_multiplier,
    );

    let throttler = Arc::new(build_throttler(
        gateway.clone(),
        broker.clone(),
        queue.clone(),
        history.clone(),
    ));

    let feed = UpstreamFeed::new(config.stream_url(), throttler.clone());
    let feed_task = feed.clone().spawn();

    // Remote replicas fan into the same gateway as the local feed.
    let fanout: Arc<dyn FanOut> = gateway.clone();
    let subscriber_task = broker.clone().spawn_subscriber(fanout);

    let worker = PersistenceWorker::new(queue.clone(), store.clone());
    let worker_shutdown = worker.shutdown_handle();
    let worker_task = worker.spawn();

    let seeder_task = history.clone().spawn_seeder(config.seed_limit);

    // HTTP/WS surface.
    let state = AppState {
        gateway,
        history,
        feed: feed.clone(),
        broker,
        queue,
    };

    let app = Router::new()
        .route("/health", get(routes::health_check))
        .route("/history", get(routes::get_history))
        .route("/prices", get(prices_handler))
        .with_state(state)
        .layer(cors_layer(&config.frontend_url))
        .layer(axum_mw::from_fn(
            chartfeed_backend::middleware::request_logging,
        ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Ordered shutdown: stop the feed, flush coalesced tails, stop the
    // broker subscriber, then give the worker a bounded drain window.
    info!("🛑 shutting down");
    feed.close();
    throttler.flush();
    subscriber_task.abort();
    seeder_task.abort();
    feed_task.abort();

    worker_shutdown.store(true, std::sync::atomic::Ordering::Release);
    if tokio::time::timeout(Duration::from_secs(5), worker_task)
        .await
        .is_err()
    {
        warn!("persistence worker did not drain in time");
    }

    info!("👋 chartfeed stopped");
    Ok(())
}

/// Wire the four throttled channels to their sinks. Every callback here is
/// called under a per-key slot lock: the gateway writes are volatile and
/// synchronous, everything that can suspend is spawned.
fn build_throttler(
    gateway: Arc<WsGateway>,
    broker: Arc<RedisBroker>,
    queue: JobQueue,
    history: Arc<HistoryService>,
) -> ThrottledBroadcaster {
    let price_gateway = gateway.clone();
    let on_price: EmitFn<String, PriceEvent> = Arc::new(move |symbol, event| {
        price_gateway.broadcast_price(symbol, &PriceUpdate::from(&event));
        broker.publish_price(&event);
    });

    let on_kline: EmitFn<(String, Interval), Kline> = Arc::new(move |key, row| {
        gateway.broadcast_kline(&key.0, &row);
    });

    let on_price_persist: EmitFn<String, PriceEvent> = Arc::new(move |_symbol, event| {
        let queue = queue.clone();
        let payload = PersistPricePayload {
            symbol: event.symbol,
            price: event.price,
            ts: event.ts,
            source: format!("{:?}", event.source),
        };
        tokio::spawn(async move {
            let payload = match serde_json::to_value(&payload) {
                Ok(payload) => payload,
                Err(_) => return,
            };
            if let Err(e) = queue.enqueue(KIND_PERSIST_PRICE, payload).await {
                warn!(error = %e, "price persistence enqueue failed");
            }
        });
    });

    let on_kline_persist: EmitFn<(String, Interval), Kline> = Arc::new(move |_key, row| {
        let history = history.clone();
        tokio::spawn(async move {
            if let Err(e) = history.upsert_stream_kline(&row).await {
                warn!(error = %e, symbol = %row.symbol, "kline upsert failed");
            }
        });
    });

    ThrottledBroadcaster::new(on_price, on_kline, on_price_persist, on_kline_persist)
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    if frontend_url == "*" {
        return CorsLayer::permissive();
    }
    match HeaderValue::from_str(frontend_url) {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(_) => {
            warn!(frontend_url, "invalid FRONTEND_URL, allowing all origins");
            CorsLayer::permissive()
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chartfeed_backend=debug,chartfeed=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
