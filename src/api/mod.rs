//! HTTP surface: health and history endpoints, plus the shared state the
//! axum router carries.

pub mod routes;

use std::sync::Arc;

use crate::broker::RedisBroker;
use crate::feed::UpstreamFeed;
use crate::gateway::WsGateway;
use crate::history::HistoryService;
use crate::queue::JobQueue;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<WsGateway>,
    pub history: Arc<HistoryService>,
    pub feed: Arc<UpstreamFeed>,
    pub broker: Arc<RedisBroker>,
    pub queue: JobQueue,
}
