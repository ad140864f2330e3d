use std::future::Future;

use crate::{AnalyticsMode, BucketId, MeteringError};

/// One counter mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterWrite {
    /// Add `delta`, creating the counter if absent.
    Add {
        /// Counter key.
        key: String,
        /// Amount to add.
        delta: i64,
        /// Expiry in seconds, refreshed on every write.
        ttl_seconds: Option<u64>,
    },
    /// Overwrite with `value`.
    Set {
        /// Counter key.
        key: String,
        /// New value.
        value: i64,
        /// Expiry in seconds.
        ttl_seconds: Option<u64>,
    },
    /// Remove the counter.
    Delete {
        /// Counter key.
        key: String,
    },
}

impl CounterWrite {
    /// Key touched by this write.
    pub fn key(&self) -> &str {
        match self {
            CounterWrite::Add { key, .. }
            | CounterWrite::Set { key, .. }
            | CounterWrite::Delete { key } => key,
        }
    }
}

/// Everything one logical event changes in the primary store.
///
/// A backend applies a batch all-or-nothing. Unless the analytics mode is
/// [`AnalyticsMode::Disabled`] at apply time, it also records every written key in the change
/// bucket `bucket` and marks that bucket pending, inside the same atomic step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    /// Counter mutations, applied in order.
    pub writes: Vec<CounterWrite>,
    /// `(set key, member)` inventory additions.
    pub memberships: Vec<(String, String)>,
    /// Change bucket the written keys are recorded in.
    pub bucket: BucketId,
}

impl WriteBatch {
    /// Whether applying the batch would change nothing.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.memberships.is_empty()
    }
}

/// The primary key-value store holding counters and flush bookkeeping.
///
/// Implementations must be safe to share between many concurrent request workers and flush
/// schedulers, including across processes for shared backends.
pub trait PrimaryStore: Send + Sync + 'static {
    /// Apply `batch` atomically. On error nothing from the batch is visible.
    fn apply(&self, batch: &WriteBatch) -> impl Future<Output = Result<(), MeteringError>> + Send;

    /// Current values of `keys`, `None` where absent or expired.
    fn values(
        &self,
        keys: &[String],
    ) -> impl Future<Output = Result<Vec<Option<i64>>, MeteringError>> + Send;

    /// Delete `keys`, returning how many existed.
    fn delete(&self, keys: &[String]) -> impl Future<Output = Result<usize, MeteringError>> + Send;

    /// Members of an inventory set.
    fn members(
        &self,
        set_key: &str,
    ) -> impl Future<Output = Result<Vec<String>, MeteringError>> + Send;

    /// Shared analytics mode; [`AnalyticsMode::Active`] when never set.
    fn analytics_mode(&self) -> impl Future<Output = Result<AnalyticsMode, MeteringError>> + Send;

    /// Replace the shared analytics mode, returning the previous one.
    fn set_analytics_mode(
        &self,
        mode: AnalyticsMode,
    ) -> impl Future<Output = Result<AnalyticsMode, MeteringError>> + Send;

    /// Pending buckets, oldest first.
    fn pending_buckets(&self) -> impl Future<Output = Result<Vec<BucketId>, MeteringError>> + Send;

    /// Atomically remove and return up to `limit` pending buckets strictly older than `before`.
    ///
    /// A bucket is handed to exactly one caller no matter how many claim concurrently.
    fn claim_buckets(
        &self,
        before: BucketId,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<BucketId>, MeteringError>> + Send;

    /// Counter keys recorded in `bucket`.
    fn bucket_keys(
        &self,
        bucket: BucketId,
    ) -> impl Future<Output = Result<Vec<String>, MeteringError>> + Send;

    /// Forget `keys` from `bucket` after a successful flush and drop it from the failed set.
    ///
    /// Keys recorded into the bucket after it was read stay behind for the next flush.
    fn complete_bucket(
        &self,
        bucket: BucketId,
        keys: &[String],
    ) -> impl Future<Output = Result<(), MeteringError>> + Send;

    /// Mark `bucket` failed (and failed at least once). Its keys are kept for a retry.
    fn fail_bucket(&self, bucket: BucketId)
    -> impl Future<Output = Result<(), MeteringError>> + Send;

    /// Buckets currently failed.
    fn failed_buckets(&self) -> impl Future<Output = Result<Vec<BucketId>, MeteringError>> + Send;

    /// Buckets that failed at least once since the last purge.
    fn failed_at_least_once(
        &self,
    ) -> impl Future<Output = Result<Vec<BucketId>, MeteringError>> + Send;

    /// Drop all pending and failed bookkeeping. Counters are untouched.
    fn purge_buckets(&self) -> impl Future<Output = Result<(), MeteringError>> + Send;

    /// Put `bucket` back into the pending set, keeping its keys.
    ///
    /// Used when a claimed bucket can be neither completed nor marked failed.
    fn requeue_bucket(
        &self,
        bucket: BucketId,
    ) -> impl Future<Output = Result<(), MeteringError>> + Send;

    /// Drop counters whose TTL has passed, returning how many were removed.
    ///
    /// Backends that expire keys on their own keep the default, which does nothing.
    fn evict_expired(&self) -> impl Future<Output = Result<usize, MeteringError>> + Send {
        async { Ok(0) }
    }
}
