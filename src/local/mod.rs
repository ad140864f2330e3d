//! In-process storage providers.
//!
//! [`LocalStore`] implements [`PrimaryStore`](crate::PrimaryStore) within the current process and
//! [`MemoryAnalyticsStore`] implements [`AnalyticsStore`](crate::AnalyticsStore) on a
//! [`DashMap`](dashmap::DashMap).
//!
//! # Key Characteristics
//!
//! - **Thread-safe:** Safe for concurrent use across tasks and threads
//! - **Zero external dependencies:** No network or database required
//! - **Process-scoped:** Counters and bookkeeping are not shared across processes and do not
//!   survive restarts
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tallymark::{
//!     InMemoryConfig, LocalStore, MemoryAnalyticsStore, Meter, MeterOptions, MetricHierarchy,
//!     Scope, ServiceConfig, Transaction, Usage, UsageValue,
//! };
//!
//! # async fn run() -> Result<(), tallymark::MeteringError> {
//! let config = Arc::new(InMemoryConfig::new());
//! config.put_service(ServiceConfig::new("42", MetricHierarchy::new().with_metric("hits")));
//!
//! let meter = Meter::new(
//!     Arc::new(LocalStore::new()),
//!     Arc::new(MemoryAnalyticsStore::new()),
//!     config,
//!     MeterOptions::default(),
//! );
//!
//! let usage = Usage::new().with("hits", UsageValue::Increment(1));
//! meter.report(&Transaction::new(Scope::service("42"), usage)).await?;
//! # Ok(())
//! # }
//! ```

mod local_store;
pub use local_store::*;

mod memory_analytics;
pub use memory_analytics::*;
