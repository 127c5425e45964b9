//! Upstream exchange market-data ingestion.

mod upstream;

pub use upstream::UpstreamFeed;
