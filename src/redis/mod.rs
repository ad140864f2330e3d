//! Redis-backed storage providers.
//!
//! [`RedisStore`] keeps counters and flush bookkeeping in Redis so that any number of processes
//! share them. Every operation that must be atomic (batch apply, bucket claim, bucket completion,
//! bookkeeping purge) runs as a single Lua script.
//!
//! [`RedisAnalyticsStore`] is a simple analytics sink writing one hash per series.
//!
//! # Requirements
//!
//! - **Redis:** >= 6.2.0 (`ZRANGE .. BYSCORE`, `SET .. GET`)
//! - **Runtime:** Tokio (`redis-tokio` feature)
//! - **Topology:** standalone Redis; scripts touch keys of several services at once

mod common;
pub use common::*;

mod redis_store;
pub use redis_store::*;

mod redis_analytics;
pub use redis_analytics::*;
