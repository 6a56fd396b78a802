//! # Arena Indexer
//!
//! Day-partitioned indexer for finished-game events emitted by an on-chain
//! arena game across two successive contract deployments.
//!
//! The chain RPC only supports block-range log queries, so arbitrary
//! time-range queries are answered by mapping timestamps to block numbers
//! with a binary search, partitioning history into UTC-day buckets, and
//! caching each bucket once resolved. Only the bucket for the current day is
//! re-fetched incrementally.

pub mod blocktime;
pub mod cache;
pub mod config;
pub mod decode;
pub mod engine;
pub mod event_schema;
pub mod logs;
pub mod metrics;
pub mod rpc;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use engine::Engine;
pub use event_schema::{GameRow, Generation, QueryInput, QueryOutput};
