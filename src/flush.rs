//! Bucketed flush of counter changes into the analytics store.
//!
//! Every counter write records its key in the change bucket of the current scheduling
//! interval. Once an interval has passed, its bucket is claimed (exactly once across all
//! schedulers), the *current absolute* value of every recorded key is read and upserted into the
//! [`AnalyticsStore`]. Upserts are idempotent, so a bucket can be flushed again at any time
//! without double counting.
//!
//! A failed upsert moves the bucket to the failed set, from which it can be retried one by one
//! or in bulk.

use std::{
    fmt,
    future::Future,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::StreamExt;

use crate::{
    BucketId, ClaimBatchSize, Clock, FlushBucketSizeSeconds, FlushConcurrency, Granularity,
    MeteringError, PrimaryStore, ScopeKind, StatsKey, SystemClock, background::BackgroundLoop,
};

/// Shared switch controlling change tracking and flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AnalyticsMode {
    /// Changes are not tracked. Whatever happens while disabled never reaches analytics.
    Disabled,
    /// Changes are tracked but not flushed.
    Deactivated,
    /// Changes are tracked and flushed.
    #[default]
    Active,
}

impl AnalyticsMode {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsMode::Disabled => "disabled",
            AnalyticsMode::Deactivated => "deactivated",
            AnalyticsMode::Active => "active",
        }
    }

    /// Whether writes record their keys in change buckets.
    pub fn tracks_changes(&self) -> bool {
        !matches!(self, AnalyticsMode::Disabled)
    }

    /// Whether pending buckets are flushed.
    pub fn flushes(&self) -> bool {
        matches!(self, AnalyticsMode::Active)
    }
}

impl fmt::Display for AnalyticsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalyticsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(AnalyticsMode::Disabled),
            "deactivated" => Ok(AnalyticsMode::Deactivated),
            "active" => Ok(AnalyticsMode::Active),
            other => Err(format!("unknown analytics mode: {other}")),
        }
    }
}

/// Effect of switching from one [`AnalyticsMode`] to another.
///
/// | from \ to    | disabled       | deactivated      | active             |
/// |--------------|----------------|------------------|--------------------|
/// | disabled     | unchanged      | resumes tracking | resumes tracking   |
/// | deactivated  | stops tracking | unchanged        | resumes flushing   |
/// | active       | stops tracking | pauses flushing  | unchanged          |
///
/// Leaving `disabled` loses every change made while disabled. Leaving `deactivated` for
/// `active` loses nothing: the backlog of tracked buckets is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeTransition {
    /// Same mode as before.
    Unchanged,
    /// Tracking restarts after a disabled period; changes made meanwhile are lost.
    ResumesTracking,
    /// Flushing restarts with the full backlog of tracked buckets.
    ResumesFlushing,
    /// Tracking continues, flushing stops.
    PausesFlushing,
    /// Tracking stops; already pending buckets are kept.
    StopsTracking,
}

impl ModeTransition {
    /// Transition from `from` to `to`.
    pub fn between(from: AnalyticsMode, to: AnalyticsMode) -> Self {
        use AnalyticsMode::*;

        match (from, to) {
            (a, b) if a == b => ModeTransition::Unchanged,
            (Disabled, _) => ModeTransition::ResumesTracking,
            (Deactivated, Active) => ModeTransition::ResumesFlushing,
            (Active, Deactivated) => ModeTransition::PausesFlushing,
            (_, Disabled) => ModeTransition::StopsTracking,
            (from, to) => unreachable!("unhandled analytics mode transition {from} -> {to}"),
        }
    }

    /// Whether some counter changes will never reach the analytics store.
    pub fn loses_history(&self) -> bool {
        matches!(
            self,
            ModeTransition::ResumesTracking | ModeTransition::StopsTracking
        )
    }
}

/// Absolute counter value as stored in the analytics store.
///
/// The dimensional tags plus `granularity` and `timestamp` identify the record; `value` is
/// overwritten on every flush.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnalyticsRecord {
    /// Owning service.
    pub service_id: String,
    /// Scope dimension.
    pub scope_kind: ScopeKind,
    /// Application or user id; absent for the service scope.
    pub instance_id: Option<String>,
    /// Metric.
    pub metric_id: String,
    /// Period width.
    pub granularity: Granularity,
    /// Period start; absent for eternity.
    pub timestamp: Option<DateTime<Utc>>,
    /// Absolute counter value.
    pub value: i64,
}

impl AnalyticsRecord {
    /// Record for counter `key` holding `value`.
    pub fn new(key: &StatsKey, value: i64) -> Self {
        Self {
            service_id: key.scope.service_id().to_string(),
            scope_kind: key.scope.kind(),
            instance_id: key.scope.instance_id().map(str::to_string),
            metric_id: key.metric_id.clone(),
            granularity: key.period.granularity,
            timestamp: key.period.bounds().map(|(start, _)| start),
            value,
        }
    }

    /// Series the record belongs to, e.g. `service:42/application:7/metric:hits/day`.
    pub fn series(&self) -> String {
        let mut series = format!("service:{}/", self.service_id);

        if let Some(instance_id) = &self.instance_id {
            series.push_str(&format!("{}:{instance_id}/", self.scope_kind));
        }

        series.push_str(&format!("metric:{}/{}", self.metric_id, self.granularity));
        series
    }

    /// Point within the series: the period start as `YYYYMMDDHHMMSS`, or `eternity`.
    pub fn point(&self) -> String {
        match self.timestamp {
            Some(timestamp) => timestamp.format("%Y%m%d%H%M%S").to_string(),
            None => "eternity".to_string(),
        }
    }

    /// `series:point`, unique per record.
    pub fn series_id(&self) -> String {
        format!("{}:{}", self.series(), self.point())
    }
}

/// Secondary store receiving flushed counter values.
pub trait AnalyticsStore: Send + Sync + 'static {
    /// Insert or overwrite `records`. Must be idempotent.
    fn upsert(
        &self,
        records: &[AnalyticsRecord],
    ) -> impl Future<Output = Result<(), MeteringError>> + Send;
}

/// Configuration for [`FlushPipeline`].
#[derive(Clone, Debug, Default)]
pub struct FlushOptions {
    /// Width of the change buckets. Must match the counter store's.
    pub flush_bucket_size: FlushBucketSizeSeconds,
    /// Buckets flushed in parallel.
    pub concurrency: FlushConcurrency,
    /// Buckets claimed per round trip.
    pub claim_batch_size: ClaimBatchSize,
}

/// Result of flushing one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Upserted `records` values; the bucket is done.
    Flushed {
        /// Records written.
        records: usize,
    },
    /// The analytics store failed; the bucket is in the failed set.
    Failed,
    /// Not attempted because the analytics mode does not flush.
    Skipped,
}

/// Totals of one flush round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushSummary {
    /// Mode the round ran under.
    pub mode: AnalyticsMode,
    /// Buckets claimed or selected for retry.
    pub buckets: usize,
    /// Buckets flushed.
    pub flushed: usize,
    /// Buckets that failed.
    pub failed: usize,
    /// Records written.
    pub records: usize,
}

impl FlushSummary {
    fn add(&mut self, outcome: FlushOutcome) {
        match outcome {
            FlushOutcome::Flushed { records } => {
                self.flushed += 1;
                self.records += records;
            }
            FlushOutcome::Failed => self.failed += 1,
            FlushOutcome::Skipped => {}
        }
    }
}

/// Moves tracked counter changes from the primary store into the analytics store.
///
/// Several pipelines, in one or many processes, may share a primary store: claiming is atomic,
/// so every bucket is flushed by exactly one of them.
pub struct FlushPipeline<S, A> {
    store: Arc<S>,
    analytics: Arc<A>,
    clock: Arc<dyn Clock>,
    flush_bucket_size: FlushBucketSizeSeconds,
    concurrency: FlushConcurrency,
    claim_batch_size: ClaimBatchSize,
    flush_loop: Mutex<Option<BackgroundLoop>>,
}

impl<S: PrimaryStore, A: AnalyticsStore> FlushPipeline<S, A> {
    /// Create a pipeline using the system clock.
    pub fn new(store: Arc<S>, analytics: Arc<A>, options: FlushOptions) -> Self {
        Self::with_clock(store, analytics, options, Arc::new(SystemClock))
    }

    /// Create a pipeline with an explicit clock.
    pub fn with_clock(
        store: Arc<S>,
        analytics: Arc<A>,
        options: FlushOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            analytics,
            clock,
            flush_bucket_size: options.flush_bucket_size,
            concurrency: options.concurrency,
            claim_batch_size: options.claim_batch_size,
            flush_loop: Mutex::new(None),
        }
    }

    /// Bucket writes are currently recorded in.
    pub fn current_bucket(&self) -> BucketId {
        BucketId::for_instant(self.clock.now(), self.flush_bucket_size)
    }

    /// Shared analytics mode.
    pub async fn mode(&self) -> Result<AnalyticsMode, MeteringError> {
        self.store.analytics_mode().await
    }

    /// Switch the shared analytics mode.
    pub async fn set_mode(&self, mode: AnalyticsMode) -> Result<ModeTransition, MeteringError> {
        let previous = self.store.set_analytics_mode(mode).await?;
        let transition = ModeTransition::between(previous, mode);

        if transition.loses_history() {
            tracing::warn!(
                from = %previous,
                to = %mode,
                ?transition,
                "Analytics mode change loses counter history"
            );
        } else {
            tracing::info!(from = %previous, to = %mode, ?transition, "analytics.mode");
        }

        Ok(transition)
    }

    /// Pending buckets, oldest first.
    pub async fn pending(&self) -> Result<Vec<BucketId>, MeteringError> {
        self.store.pending_buckets().await
    }

    /// Claim every pending bucket older than the bucket containing `now`.
    ///
    /// Claimed buckets are no longer pending; the caller owns flushing them.
    pub async fn claim(&self, now: DateTime<Utc>) -> Result<Vec<BucketId>, MeteringError> {
        let before = BucketId::for_instant(now, self.flush_bucket_size);
        let limit = *self.claim_batch_size;
        let mut claimed = Vec::new();

        loop {
            let batch = self.store.claim_buckets(before, limit).await?;
            let done = batch.len() < limit;
            claimed.extend(batch);

            if done {
                break;
            }
        }

        if !claimed.is_empty() {
            tracing::debug!(buckets = claimed.len(), before = %before, "flush.claimed");
        }

        Ok(claimed)
    }

    /// Flush one bucket regardless of mode.
    ///
    /// Values are read at flush time, so the analytics store receives the latest absolute value
    /// of every counter, not the value at write time. Calendar counters that no longer exist are
    /// written as `0`; expired minute and second counters are skipped.
    pub async fn flush_bucket(&self, bucket: BucketId) -> Result<FlushOutcome, MeteringError> {
        let (keys, records) = match self.collect(bucket).await {
            Ok(collected) => collected,
            Err(err) => {
                if let Err(mark_err) = self.store.fail_bucket(bucket).await {
                    self.requeue(bucket, &mark_err).await;
                }
                return Err(err);
            }
        };

        if !records.is_empty()
            && let Err(err) = self.analytics.upsert(&records).await
        {
            tracing::warn!(bucket = %bucket, error = ?err, "Failed to flush bucket");
            if let Err(mark_err) = self.store.fail_bucket(bucket).await {
                self.requeue(bucket, &mark_err).await;
                return Err(mark_err);
            }
            return Ok(FlushOutcome::Failed);
        }

        if let Err(err) = self.store.complete_bucket(bucket, &keys).await {
            self.requeue(bucket, &err).await;
            return Err(err);
        }

        tracing::debug!(bucket = %bucket, records = records.len(), "flush.bucket");

        Ok(FlushOutcome::Flushed {
            records: records.len(),
        })
    } // end method flush_bucket

    // A claimed bucket is in no set until completed or failed; hand it back so its keys are
    // flushed by a later round.
    async fn requeue(&self, bucket: BucketId, cause: &MeteringError) {
        tracing::warn!(bucket = %bucket, error = ?cause, "Requeueing claimed bucket");

        if let Err(err) = self.store.requeue_bucket(bucket).await {
            tracing::error!(bucket = %bucket, error = ?err, "Failed to requeue bucket");
        }
    }

    async fn collect(
        &self,
        bucket: BucketId,
    ) -> Result<(Vec<String>, Vec<AnalyticsRecord>), MeteringError> {
        let keys = self.store.bucket_keys(bucket).await?;
        if keys.is_empty() {
            return Ok((keys, Vec::new()));
        }

        let values = self.store.values(&keys).await?;
        let mut records = Vec::with_capacity(keys.len());

        for (raw, value) in keys.iter().zip(values) {
            let Some(key) = StatsKey::parse(raw) else {
                tracing::warn!(bucket = %bucket, key = %raw, "Skipping unparseable counter key");
                continue;
            };

            match value {
                Some(value) => records.push(AnalyticsRecord::new(&key, value)),
                None if key.period.granularity.ttl_seconds().is_some() => {}
                None => records.push(AnalyticsRecord::new(&key, 0)),
            }
        }

        Ok((keys, records))
    }

    /// Claim and flush everything older than the bucket containing `now`.
    ///
    /// The mode is read once; nothing is claimed unless it is [`AnalyticsMode::Active`].
    /// Primary store errors are returned after every claimed bucket has been attempted.
    pub async fn flush_pending(&self, now: DateTime<Utc>) -> Result<FlushSummary, MeteringError> {
        let mode = self.store.analytics_mode().await?;
        let mut summary = FlushSummary {
            mode,
            ..FlushSummary::default()
        };

        if !mode.flushes() {
            tracing::debug!(%mode, "flush.skipped");
            return Ok(summary);
        }

        let buckets = self.claim(now).await?;
        summary.buckets = buckets.len();

        self.flush_all(buckets, &mut summary).await?;

        Ok(summary)
    }

    async fn flush_all(
        &self,
        buckets: Vec<BucketId>,
        summary: &mut FlushSummary,
    ) -> Result<(), MeteringError> {
        let flushes: Vec<_> = buckets
            .into_iter()
            .map(|bucket| self.flush_bucket(bucket))
            .collect();

        let results: Vec<Result<FlushOutcome, MeteringError>> = futures::stream::iter(flushes)
            .buffer_unordered(*self.concurrency)
            .collect()
            .await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(outcome) => summary.add(outcome),
                Err(err) => {
                    summary.failed += 1;
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Retry one failed bucket. Skipped unless the mode is [`AnalyticsMode::Active`].
    pub async fn retry_failed(&self, bucket: BucketId) -> Result<FlushOutcome, MeteringError> {
        if !self.store.analytics_mode().await?.flushes() {
            return Ok(FlushOutcome::Skipped);
        }

        self.flush_bucket(bucket).await
    }

    /// Retry every failed bucket.
    pub async fn retry_all_failed(&self) -> Result<FlushSummary, MeteringError> {
        let mode = self.store.analytics_mode().await?;
        let mut summary = FlushSummary {
            mode,
            ..FlushSummary::default()
        };

        if !mode.flushes() {
            return Ok(summary);
        }

        let buckets = self.store.failed_buckets().await?;
        summary.buckets = buckets.len();

        self.flush_all(buckets, &mut summary).await?;

        Ok(summary)
    }

    /// Buckets whose last flush failed.
    pub async fn failed(&self) -> Result<Vec<BucketId>, MeteringError> {
        self.store.failed_buckets().await
    }

    /// Buckets that failed at least once since the last purge.
    pub async fn failed_at_least_once(&self) -> Result<Vec<BucketId>, MeteringError> {
        self.store.failed_at_least_once().await
    }

    /// Drop all pending and failed bookkeeping. Counters are untouched.
    pub async fn purge(&self) -> Result<(), MeteringError> {
        self.store.purge_buckets().await?;
        tracing::info!("flush.purged");
        Ok(())
    }

    /// Flush pending buckets every `interval` on the current Tokio runtime.
    ///
    /// Calling this while a loop is already running does nothing. The loop holds only a weak
    /// reference and ends once the pipeline is dropped.
    pub fn run_flush_loop(self: &Arc<Self>, interval: Duration) -> Result<(), MeteringError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| MeteringError::NoRuntime(err.to_string()))?;

        let mut flush_loop = self
            .flush_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if flush_loop.as_ref().is_some_and(BackgroundLoop::is_running) {
            return Ok(());
        }

        *flush_loop = Some(BackgroundLoop::spawn(
            &runtime,
            interval,
            Arc::downgrade(self),
            |pipeline: Arc<Self>| async move {
                let now = pipeline.clock.now();
                if let Err(err) = pipeline.flush_pending(now).await {
                    tracing::error!(error = ?err, "Failed to flush pending buckets");
                }
            },
        ));

        Ok(())
    } // end method run_flush_loop

    /// Stop the background flush loop, if running.
    ///
    /// A round already in progress runs to completion, so no claimed bucket is abandoned.
    pub fn stop_flush_loop(&self) {
        let running = self
            .flush_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(running) = running {
            running.stop();
        }
    }

    /// Whether the background flush loop is running.
    pub fn is_flush_loop_running(&self) -> bool {
        self.flush_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(BackgroundLoop::is_running)
    }
}

impl<S, A> Drop for FlushPipeline<S, A> {
    fn drop(&mut self) {
        if let Some(running) = self
            .flush_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            running.stop();
        }
    }
}
