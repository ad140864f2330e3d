use std::{
    collections::{BTreeSet, HashMap},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{Duration, Instant},
};

use crate::{AnalyticsMode, BucketId, CounterWrite, MeteringError, PrimaryStore, WriteBatch};

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: i64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

#[derive(Debug, Default)]
struct LocalState {
    counters: HashMap<String, Counter>,
    sets: HashMap<String, BTreeSet<String>>,
    pending: BTreeSet<BucketId>,
    bucket_keys: HashMap<BucketId, BTreeSet<String>>,
    failed: BTreeSet<BucketId>,
    failed_at_least_once: BTreeSet<BucketId>,
    mode: Option<AnalyticsMode>,
}

impl LocalState {
    fn live_value(&self, key: &str, now: Instant) -> Option<i64> {
        self.counters
            .get(key)
            .filter(|counter| counter.is_live(now))
            .map(|counter| counter.value)
    }

    fn apply_write(&mut self, write: &CounterWrite, now: Instant) {
        let expiry = |ttl_seconds: Option<u64>| ttl_seconds.map(|s| now + Duration::from_secs(s));

        match write {
            CounterWrite::Add {
                key,
                delta,
                ttl_seconds,
            } => {
                let current = self.live_value(key, now).unwrap_or(0);
                self.counters.insert(
                    key.clone(),
                    Counter {
                        value: current.saturating_add(*delta),
                        expires_at: expiry(*ttl_seconds),
                    },
                );
            }
            CounterWrite::Set {
                key,
                value,
                ttl_seconds,
            } => {
                self.counters.insert(
                    key.clone(),
                    Counter {
                        value: *value,
                        expires_at: expiry(*ttl_seconds),
                    },
                );
            }
            CounterWrite::Delete { key } => {
                self.counters.remove(key);
            }
        }
    }
}

/// [`PrimaryStore`] kept in process memory.
///
/// All state sits behind one lock, which makes every [`WriteBatch`] atomic with respect to
/// readers and to bucket claiming. Expired counters are dropped lazily on access and by
/// [`PrimaryStore::evict_expired`].
#[derive(Debug, Default)]
pub struct LocalStore {
    state: RwLock<LocalState>,
}

impl LocalStore {
    /// Empty store; analytics mode defaults to active.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, LocalState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LocalState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `key` holds a live counter.
    pub fn contains_key(&self, key: &str) -> bool {
        self.read().live_value(key, Instant::now()).is_some()
    }

    /// Remaining lifetime of `key`; `None` if absent or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();

        self.read()
            .counters
            .get(key)
            .filter(|counter| counter.is_live(now))
            .and_then(|counter| counter.expires_at)
            .map(|expires_at| expires_at.saturating_duration_since(now))
    }

    /// Number of counters held, including expired ones not yet evicted.
    pub fn counter_count(&self) -> usize {
        self.read().counters.len()
    }
}

impl PrimaryStore for LocalStore {
    async fn apply(&self, batch: &WriteBatch) -> Result<(), MeteringError> {
        let now = Instant::now();
        let mut state = self.write();

        for write in &batch.writes {
            state.apply_write(write, now);
        }

        for (set_key, member) in &batch.memberships {
            state
                .sets
                .entry(set_key.clone())
                .or_default()
                .insert(member.clone());
        }

        if state.mode.unwrap_or_default().tracks_changes() && !batch.writes.is_empty() {
            state.pending.insert(batch.bucket);
            state
                .bucket_keys
                .entry(batch.bucket)
                .or_default()
                .extend(batch.writes.iter().map(|w| w.key().to_string()));
        }

        Ok(())
    }

    async fn values(&self, keys: &[String]) -> Result<Vec<Option<i64>>, MeteringError> {
        let now = Instant::now();
        let state = self.read();

        Ok(keys.iter().map(|key| state.live_value(key, now)).collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, MeteringError> {
        let now = Instant::now();
        let mut state = self.write();

        let deleted = keys
            .iter()
            .filter_map(|key| state.counters.remove(key))
            .filter(|counter| counter.is_live(now))
            .count();

        Ok(deleted)
    }

    async fn members(&self, set_key: &str) -> Result<Vec<String>, MeteringError> {
        Ok(self
            .read()
            .sets
            .get(set_key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn analytics_mode(&self) -> Result<AnalyticsMode, MeteringError> {
        Ok(self.read().mode.unwrap_or_default())
    }

    async fn set_analytics_mode(&self, mode: AnalyticsMode) -> Result<AnalyticsMode, MeteringError> {
        let previous = self.write().mode.replace(mode);
        Ok(previous.unwrap_or_default())
    }

    async fn pending_buckets(&self) -> Result<Vec<BucketId>, MeteringError> {
        Ok(self.read().pending.iter().copied().collect())
    }

    async fn claim_buckets(
        &self,
        before: BucketId,
        limit: usize,
    ) -> Result<Vec<BucketId>, MeteringError> {
        let mut state = self.write();

        let claimed: Vec<BucketId> = state
            .pending
            .range(..before)
            .take(limit)
            .copied()
            .collect();

        for bucket in &claimed {
            state.pending.remove(bucket);
        }

        Ok(claimed)
    }

    async fn bucket_keys(&self, bucket: BucketId) -> Result<Vec<String>, MeteringError> {
        Ok(self
            .read()
            .bucket_keys
            .get(&bucket)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn complete_bucket(&self, bucket: BucketId, keys: &[String]) -> Result<(), MeteringError> {
        let mut state = self.write();

        let leftover = match state.bucket_keys.get_mut(&bucket) {
            Some(recorded) => {
                for key in keys {
                    recorded.remove(key);
                }
                !recorded.is_empty()
            }
            None => false,
        };

        if leftover {
            state.pending.insert(bucket);
        } else {
            state.bucket_keys.remove(&bucket);
        }

        state.failed.remove(&bucket);

        Ok(())
    }

    async fn fail_bucket(&self, bucket: BucketId) -> Result<(), MeteringError> {
        let mut state = self.write();

        state.failed.insert(bucket);
        state.failed_at_least_once.insert(bucket);

        Ok(())
    }

    async fn failed_buckets(&self) -> Result<Vec<BucketId>, MeteringError> {
        Ok(self.read().failed.iter().copied().collect())
    }

    async fn failed_at_least_once(&self) -> Result<Vec<BucketId>, MeteringError> {
        Ok(self.read().failed_at_least_once.iter().copied().collect())
    }

    async fn purge_buckets(&self) -> Result<(), MeteringError> {
        let mut state = self.write();

        state.pending.clear();
        state.bucket_keys.clear();
        state.failed.clear();
        state.failed_at_least_once.clear();

        Ok(())
    }

    async fn requeue_bucket(&self, bucket: BucketId) -> Result<(), MeteringError> {
        self.write().pending.insert(bucket);
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize, MeteringError> {
        let now = Instant::now();
        let mut state = self.write();
        let before = state.counters.len();

        state.counters.retain(|_, counter| counter.is_live(now));

        Ok(before - state.counters.len())
    }
}
