//! Primary store key scheme.
//!
//! Counters live under
//! `stats/{service:<service_id>}/<kind>:<instance_id>/metric:<metric_id>/<granularity>:<token>`
//! (the instance segment is absent for the service scope). The `{service:..}` hash tag keeps all
//! keys of one service on the same Redis slot.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{FlushBucketSizeSeconds, Granularity, MeteringError, Period, Scope, ScopeKind};

/// Sorted set of pending change buckets, scored by bucket start.
pub const CHANGED_BUCKETS_KEY: &str = "stats:changed_buckets";
/// Set of buckets whose last flush failed.
pub const FAILED_BUCKETS_KEY: &str = "stats:failed_buckets";
/// Set of buckets that failed at least once, kept for observability.
pub const FAILED_AT_LEAST_ONCE_KEY: &str = "stats:failed_buckets_at_least_once";
/// Shared analytics mode flag.
pub const ANALYTICS_MODE_KEY: &str = "stats:analytics_mode";

pub(crate) const CHANGED_KEYS_PREFIX: &str = "stats:changed_keys:";

/// `{service:<id>}` hash tag.
pub fn service_tag(service_id: &str) -> String {
    format!("{{service:{service_id}}}")
}

/// Inventory set of application or user ids seen under a service.
///
/// Returns `None` for [`ScopeKind::Service`], which has no instances.
pub fn instance_set_key(service_id: &str, kind: ScopeKind) -> Option<String> {
    kind.key_prefix()
        .map(|prefix| format!("stats/{}/{prefix}s", service_tag(service_id)))
}

/// Set of counter keys recorded in `bucket`.
pub fn changed_keys_key(bucket: &BucketId) -> String {
    format!("{CHANGED_KEYS_PREFIX}{bucket}")
}

/// Address of one counter: a scope, a metric and a period.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatsKey {
    /// Scope the counter belongs to.
    pub scope: Scope,
    /// Metric name.
    pub metric_id: String,
    /// Period the counter covers.
    pub period: Period,
}

impl StatsKey {
    /// Key for `metric_id` in `scope` during `period`.
    pub fn new(scope: &Scope, metric_id: &str, period: Period) -> Self {
        Self {
            scope: scope.clone(),
            metric_id: metric_id.to_string(),
            period,
        }
    }

    /// Parse a key produced by the [`fmt::Display`] impl.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix("stats/{service:")?;
        let (service_id, rest) = rest.split_once("}/")?;

        let segments: Vec<&str> = rest.split('/').collect();
        let (instance, metric, period) = match segments.as_slice() {
            [metric, period] => (None, *metric, *period),
            [instance, metric, period] => (Some(*instance), *metric, *period),
            _ => return None,
        };

        let scope = match instance {
            None => Scope::service(service_id),
            Some(instance) => {
                let (prefix, id) = instance.split_once(':')?;
                match ScopeKind::from_key_prefix(prefix)? {
                    ScopeKind::Application => Scope::application(service_id, id),
                    ScopeKind::User => Scope::user(service_id, id),
                    ScopeKind::Service => return None,
                }
            }
        };

        let metric_id = metric.strip_prefix("metric:")?;
        let (granularity, token) = period.split_once(':')?;
        let granularity = Granularity::from_str(granularity).ok()?;
        let period = Period::from_token(granularity, token)?;

        Some(Self {
            scope,
            metric_id: metric_id.to_string(),
            period,
        })
    }
}

impl fmt::Display for StatsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stats/{}/", service_tag(self.scope.service_id()))?;

        if let (Some(prefix), Some(id)) = (self.scope.kind().key_prefix(), self.scope.instance_id())
        {
            write!(f, "{prefix}:{id}/")?;
        }

        write!(
            f,
            "metric:{}/{}:{}",
            self.metric_id,
            self.period.granularity,
            self.period.token()
        )
    }
}

/// Identifier of a change bucket: the start of its scheduling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketId(DateTime<Utc>);

impl BucketId {
    /// The bucket of width `size` containing `instant`.
    pub fn for_instant(instant: DateTime<Utc>, size: FlushBucketSizeSeconds) -> Self {
        let width = *size as i64;
        let ts = instant.timestamp();
        let start = ts - ts.rem_euclid(width);

        Self(DateTime::<Utc>::from_timestamp(start, 0).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    /// Start of the bucket's interval.
    pub fn start(&self) -> DateTime<Utc> {
        self.0
    }

    /// Sort score in the pending set (unix seconds).
    pub fn score(&self) -> i64 {
        self.0.timestamp()
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y%m%d%H%M%S"))
    }
}

impl FromStr for BucketId {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 14 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MeteringError::InvalidBucketId(s.to_string()));
        }

        NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%S")
            .map(|start| Self(start.and_utc()))
            .map_err(|_| MeteringError::InvalidBucketId(s.to_string()))
    }
}
