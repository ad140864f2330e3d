#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod error;
pub use error::*;

mod common;
pub use common::*;

mod background;

mod clock;
pub use clock::*;

mod period;
pub use period::*;

mod scope;
pub use scope::*;

mod usage;
pub use usage::{MetricHierarchy, Usage, UsageValue};

/// Primary store key scheme and bookkeeping key names.
pub mod keys;
pub use keys::{BucketId, StatsKey};

mod store;
pub use store::*;

mod counters;
pub use counters::*;

mod config;
pub use config::*;

mod validators;

mod limits;
pub use limits::*;

mod flush;
pub use flush::*;

mod cache;
pub use cache::*;

mod meter;
pub use meter::*;

mod local;
pub use local::*;

#[cfg(feature = "redis-tokio")]
mod redis;
#[cfg(feature = "redis-tokio")]
pub use redis::*;

#[cfg(test)]
mod tests;
