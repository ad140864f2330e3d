use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use chrono::{DateTime, Utc};

use crate::{
    AnalyticsMode, AnalyticsRecord, AnalyticsStore, ApplicationConfig, BucketId, Clock,
    Granularity, InMemoryConfig, LocalStore, MemoryAnalyticsStore, MeteringError,
    MetricHierarchy, PrimaryStore, ServiceConfig, UsageLimit, UserConfig, WriteBatch,
};


mod test_common_validation;
mod test_counters;
mod test_meter;

pub(super) fn ts(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub(super) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(super) fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub(super) fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub(super) fn advance_secs(&self, seconds: i64) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::seconds(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// [`LocalStore`] whose batch writes, reads and bucket bookkeeping can be switched to fail.
#[derive(Debug, Default)]
pub(super) struct FailingStore {
    pub(super) inner: LocalStore,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    fail_bookkeeping: AtomicBool,
}

impl FailingStore {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(super) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(super) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fail marking buckets failed and completing them.
    pub(super) fn fail_bookkeeping(&self, fail: bool) {
        self.fail_bookkeeping.store(fail, Ordering::SeqCst);
    }

    fn unavailable() -> MeteringError {
        MeteringError::Store("primary store unavailable".to_string())
    }
}

impl PrimaryStore for FailingStore {
    async fn apply(&self, batch: &WriteBatch) -> Result<(), MeteringError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.apply(batch).await
    }

    async fn values(&self, keys: &[String]) -> Result<Vec<Option<i64>>, MeteringError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.values(keys).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, MeteringError> {
        self.inner.delete(keys).await
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>, MeteringError> {
        self.inner.members(set_key).await
    }

    async fn analytics_mode(&self) -> Result<AnalyticsMode, MeteringError> {
        self.inner.analytics_mode().await
    }

    async fn set_analytics_mode(&self, mode: AnalyticsMode) -> Result<AnalyticsMode, MeteringError> {
        self.inner.set_analytics_mode(mode).await
    }

    async fn pending_buckets(&self) -> Result<Vec<BucketId>, MeteringError> {
        self.inner.pending_buckets().await
    }

    async fn claim_buckets(
        &self,
        before: BucketId,
        limit: usize,
    ) -> Result<Vec<BucketId>, MeteringError> {
        self.inner.claim_buckets(before, limit).await
    }

    async fn bucket_keys(&self, bucket: BucketId) -> Result<Vec<String>, MeteringError> {
        self.inner.bucket_keys(bucket).await
    }

    async fn complete_bucket(&self, bucket: BucketId, keys: &[String]) -> Result<(), MeteringError> {
        if self.fail_bookkeeping.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.complete_bucket(bucket, keys).await
    }

    async fn fail_bucket(&self, bucket: BucketId) -> Result<(), MeteringError> {
        if self.fail_bookkeeping.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.fail_bucket(bucket).await
    }

    async fn failed_buckets(&self) -> Result<Vec<BucketId>, MeteringError> {
        self.inner.failed_buckets().await
    }

    async fn failed_at_least_once(&self) -> Result<Vec<BucketId>, MeteringError> {
        self.inner.failed_at_least_once().await
    }

    async fn purge_buckets(&self) -> Result<(), MeteringError> {
        self.inner.purge_buckets().await
    }

    async fn requeue_bucket(&self, bucket: BucketId) -> Result<(), MeteringError> {
        self.inner.requeue_bucket(bucket).await
    }

    async fn evict_expired(&self) -> Result<usize, MeteringError> {
        self.inner.evict_expired().await
    }
}

/// [`MemoryAnalyticsStore`] that can be switched to reject every upsert.
#[derive(Debug, Default)]
pub(super) struct FlakyAnalytics {
    pub(super) inner: MemoryAnalyticsStore,
    failing: AtomicBool,
    pub(super) attempts: AtomicUsize,
}

impl FlakyAnalytics {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(super) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl AnalyticsStore for FlakyAnalytics {
    async fn upsert(&self, records: &[AnalyticsRecord]) -> Result<(), MeteringError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(MeteringError::Analytics("analytics store unavailable".to_string()));
        }

        self.inner.upsert(records).await
    }
}

/// Service `42` with `hits > searches > {web_searches}` and a standalone `storage` metric.
pub(super) fn hierarchy() -> MetricHierarchy {
    MetricHierarchy::new()
        .with_metric("hits")
        .with_child("searches", "hits")
        .with_child("web_searches", "searches")
        .with_metric("storage")
}

/// Config with service `42`, application `app` and user `alice`, both on plan `basic`.
pub(super) fn config() -> Arc<InMemoryConfig> {
    let config = Arc::new(InMemoryConfig::new());

    config.put_service(ServiceConfig::new("42", hierarchy()));
    config.put_application(ApplicationConfig::new("42", "app", "basic"));
    config.put_user(UserConfig::new("42", "alice", "basic"));

    config
}

pub(super) fn limit(metric_id: &str, granularity: Granularity, max_value: i64) -> UsageLimit {
    UsageLimit {
        service_id: "42".to_string(),
        plan_id: "basic".to_string(),
        metric_id: metric_id.to_string(),
        granularity,
        max_value,
    }
}
