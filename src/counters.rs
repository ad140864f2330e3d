use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    BucketId, Clock, CounterWrite, FlushBucketSizeSeconds, Granularity, MeteringError,
    MetricHierarchy, Period, PeriodCache, PrimaryStore, Scope, ScopeKind, StatsKey, SystemClock,
    Usage, UsageValue, WriteBatch,
    keys::instance_set_key,
    usage::{CounterOp, expand},
};

const DELETE_CHUNK_SIZE: usize = 1000;

/// Configuration for [`CounterStore`].
#[derive(Clone, Debug)]
pub struct CounterStoreOptions {
    /// Granularities a counter is kept for on every write.
    pub granularities: Vec<Granularity>,
    /// Also record application and user usage against the owning service scope.
    pub rollup_to_service: bool,
    /// Width of the change buckets written keys are recorded in.
    pub flush_bucket_size: FlushBucketSizeSeconds,
}

impl Default for CounterStoreOptions {
    fn default() -> Self {
        Self {
            granularities: Granularity::REPORTING.to_vec(),
            rollup_to_service: true,
            flush_bucket_size: FlushBucketSizeSeconds::default(),
        }
    }
}

/// Hierarchy-aware usage counters over every configured granularity.
///
/// Every mutation of one logical event becomes a single [`WriteBatch`] that the
/// [`PrimaryStore`] applies atomically, together with the inventory updates and the
/// change-bucket bookkeeping consumed by the flush pipeline.
///
/// # Zero values
///
/// - A net delta of `0` writes nothing, so no-op reports never create keys.
/// - An explicit set to `0` deletes the counter, so "never reported" and "reported zero" stay
///   distinguishable by key presence.
///
/// # Set propagation
///
/// Sets propagate to ancestors like increments do, but overwrite. When one request sets both
/// a child and its parent, the parent ends up with whichever entry was processed last.
pub struct CounterStore<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    granularities: Vec<Granularity>,
    rollup_to_service: bool,
    flush_bucket_size: FlushBucketSizeSeconds,
    periods: PeriodCache,
}

impl<S: PrimaryStore> CounterStore<S> {
    /// Create a counter store over `store` using the system clock.
    pub fn new(store: Arc<S>, options: CounterStoreOptions) -> Self {
        Self::with_clock(store, options, Arc::new(SystemClock))
    }

    /// Create a counter store with an explicit clock for change-bucket allocation.
    pub fn with_clock(store: Arc<S>, options: CounterStoreOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            granularities: options.granularities,
            rollup_to_service: options.rollup_to_service,
            flush_bucket_size: options.flush_bucket_size,
            periods: PeriodCache::new(),
        }
    }

    /// The underlying primary store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Granularities counters are kept for.
    pub fn granularities(&self) -> &[Granularity] {
        &self.granularities
    }

    /// Add `delta` to `metric_id` and all its ancestors.
    pub async fn increment(
        &self,
        scope: &Scope,
        hierarchy: &MetricHierarchy,
        metric_id: &str,
        delta: i64,
        instant: DateTime<Utc>,
    ) -> Result<(), MeteringError> {
        let usage = Usage::new().with(metric_id, UsageValue::Increment(delta));
        self.apply_usage(scope, hierarchy, &usage, instant).await
    }

    /// Overwrite `metric_id` and all its ancestors with `value`.
    pub async fn set(
        &self,
        scope: &Scope,
        hierarchy: &MetricHierarchy,
        metric_id: &str,
        value: i64,
        instant: DateTime<Utc>,
    ) -> Result<(), MeteringError> {
        let usage = Usage::new().with(metric_id, UsageValue::Set(value));
        self.apply_usage(scope, hierarchy, &usage, instant).await
    }

    /// Record all of `usage` as one atomic batch.
    ///
    /// On error nothing was applied and the caller may retry the whole event.
    pub async fn apply_usage(
        &self,
        scope: &Scope,
        hierarchy: &MetricHierarchy,
        usage: &Usage,
        instant: DateTime<Utc>,
    ) -> Result<(), MeteringError> {
        let ops = expand(scope.service_id(), usage, hierarchy, false)?;
        let batch = self.build_batch(scope, &ops, instant);

        if batch.is_empty() {
            return Ok(());
        }

        self.store.apply(&batch).await?;

        tracing::trace!(
            scope = %scope,
            writes = batch.writes.len(),
            bucket = %batch.bucket,
            "counters.apply"
        );

        Ok(())
    }

    pub(crate) fn build_batch(
        &self,
        scope: &Scope,
        ops: &[(String, CounterOp)],
        instant: DateTime<Utc>,
    ) -> WriteBatch {
        let mut scopes = vec![scope.clone()];
        if self.rollup_to_service && scope.kind() != ScopeKind::Service {
            scopes.push(scope.service_scope());
        }

        let mut writes = Vec::new();

        for target in &scopes {
            for (metric_id, op) in ops {
                for granularity in &self.granularities {
                    let period = self.periods.period(*granularity, instant);
                    let key = StatsKey::new(target, metric_id, period).to_string();
                    let ttl_seconds = granularity.ttl_seconds();

                    match *op {
                        CounterOp::Add(0) => {}
                        CounterOp::Add(delta) => writes.push(CounterWrite::Add {
                            key,
                            delta,
                            ttl_seconds,
                        }),
                        CounterOp::Set(0) => writes.push(CounterWrite::Delete { key }),
                        CounterOp::Set(value) => writes.push(CounterWrite::Set {
                            key,
                            value,
                            ttl_seconds,
                        }),
                    }
                }
            }
        }

        let mut memberships = Vec::new();
        if !writes.is_empty()
            && let (Some(set_key), Some(instance_id)) = (
                instance_set_key(scope.service_id(), scope.kind()),
                scope.instance_id(),
            )
        {
            memberships.push((set_key, instance_id.to_string()));
        }

        WriteBatch {
            writes,
            memberships,
            bucket: BucketId::for_instant(self.clock.now(), self.flush_bucket_size),
        }
    }

    /// Value of one counter, `0` when absent.
    pub async fn read(
        &self,
        scope: &Scope,
        metric_id: &str,
        granularity: Granularity,
        instant: DateTime<Utc>,
    ) -> Result<i64, MeteringError> {
        let values = self
            .read_many(scope, &[(metric_id, granularity)], instant)
            .await?;

        Ok(values.first().copied().unwrap_or(0))
    }

    /// Values of several counters in one round trip, `0` where absent.
    pub async fn read_many(
        &self,
        scope: &Scope,
        counters: &[(&str, Granularity)],
        instant: DateTime<Utc>,
    ) -> Result<Vec<i64>, MeteringError> {
        if counters.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = counters
            .iter()
            .map(|(metric_id, granularity)| {
                let period = self.periods.period(*granularity, instant);
                StatsKey::new(scope, metric_id, period).to_string()
            })
            .collect();

        let values = self.store.values(&keys).await?;

        Ok(values.into_iter().map(|v| v.unwrap_or(0)).collect())
    }

    /// Application or user ids that ever recorded usage under `service_id`.
    pub async fn instances(
        &self,
        service_id: &str,
        kind: ScopeKind,
    ) -> Result<Vec<String>, MeteringError> {
        match instance_set_key(service_id, kind) {
            Some(set_key) => self.store.members(&set_key).await,
            None => Ok(Vec::new()),
        }
    }

    /// Delete every non-eternity counter of `service_id` whose period starts in `[from, to]`.
    ///
    /// Covers the service scope and every application and user found in the inventories.
    /// Returns the number of counters that existed and were removed.
    pub async fn delete_stats(
        &self,
        service_id: &str,
        hierarchy: &MetricHierarchy,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize, MeteringError> {
        if from > to {
            return Ok(0);
        }

        let mut scopes = vec![Scope::service(service_id)];
        for id in self.instances(service_id, ScopeKind::Application).await? {
            scopes.push(Scope::application(service_id, id));
        }
        for id in self.instances(service_id, ScopeKind::User).await? {
            scopes.push(Scope::user(service_id, id));
        }

        let mut deleted = 0;
        let mut chunk = Vec::with_capacity(DELETE_CHUNK_SIZE);

        for granularity in &self.granularities {
            if *granularity == Granularity::Eternity {
                continue;
            }

            for scope in &scopes {
                for metric_id in hierarchy.metrics() {
                    for period in periods_between(*granularity, from, to) {
                        chunk.push(StatsKey::new(scope, metric_id, period).to_string());

                        if chunk.len() == DELETE_CHUNK_SIZE {
                            deleted += self.store.delete(&chunk).await?;
                            chunk.clear();
                        }
                    }
                }
            }
        }

        if !chunk.is_empty() {
            deleted += self.store.delete(&chunk).await?;
        }

        tracing::info!(
            service_id,
            scopes = scopes.len(),
            deleted,
            "counters.delete_stats"
        );

        Ok(deleted)
    }
}

/// Periods of `granularity` starting inside `[from, to]`, oldest first.
fn periods_between(
    granularity: Granularity,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> impl Iterator<Item = Period> {
    let mut first = Period::containing(granularity, from);
    if first.start < from {
        first = Period::containing(granularity, first.end);
    }

    std::iter::successors(Some(first), move |cursor| {
        let next = Period::containing(granularity, cursor.end);
        (next.start > cursor.start).then_some(next)
    })
    .take_while(move |period| period.start <= to)
}
