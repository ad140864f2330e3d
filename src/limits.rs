use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{
    ConfigSource, CounterStore, Granularity, MeteringError, Period, PrimaryStore, Scope,
    UsageLimit, Usage, usage::expand,
};

/// Why a call was rejected.
///
/// Variants are declared in priority order: when several apply, the smallest one is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RejectionReason {
    /// The service, application or user is not active.
    Inactive,
    /// The key or token does not match.
    InvalidCredential,
    /// The referrer is not in the application's filters.
    ReferrerNotAllowed,
    /// At least one usage limit would be exceeded.
    LimitsExceeded,
}

impl RejectionReason {
    /// Stable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::Inactive => "inactive",
            RejectionReason::InvalidCredential => "invalid_credential",
            RejectionReason::ReferrerNotAllowed => "referrer_not_allowed",
            RejectionReason::LimitsExceeded => "limits_exceeded",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Usage of one limited metric over one period.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageReport {
    /// Limited metric.
    pub metric_id: String,
    /// Period width.
    pub granularity: Granularity,
    /// Committed counter value, excluding the current request.
    pub current_value: i64,
    /// Configured limit.
    pub max_value: i64,
    /// `current_value > max_value`.
    pub exceeded: bool,
    /// Period start; absent for eternity.
    pub period_start: Option<DateTime<Utc>>,
    /// Period end; absent for eternity.
    pub period_end: Option<DateTime<Utc>>,
}

/// Outcome of an authorization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Decision {
    /// Whether the call may proceed.
    pub authorized: bool,
    /// Usage reports for the limited metrics the request touched.
    pub reports: Vec<UsageReport>,
    /// The single, highest priority reason when not authorized.
    pub rejection_reason: Option<RejectionReason>,
}

impl Decision {
    /// An authorized decision carrying `reports`.
    pub fn authorized(reports: Vec<UsageReport>) -> Self {
        Self {
            authorized: true,
            reports,
            rejection_reason: None,
        }
    }

    /// Reject with `reason`, keeping an already recorded reason if it has higher priority.
    pub fn reject(&mut self, reason: RejectionReason) {
        self.authorized = false;
        self.rejection_reason = Some(match self.rejection_reason {
            Some(current) => current.min(reason),
            None => reason,
        });
    }
}

/// Checks requested usage against plan limits.
///
/// # Algorithm
///
/// 1. Expand the requested usage through the metric hierarchy (skipped for flat usage).
/// 2. Load the plan's limits for every expanded metric.
/// 3. Reject when `committed + delta` (or the set value) exceeds any limit.
///
/// Only metrics touched by the request take part: a metric that is already over its limit
/// does not block requests that do not report it.
pub struct LimitEvaluator<S, C> {
    counters: Arc<CounterStore<S>>,
    config: Arc<C>,
}

impl<S: PrimaryStore, C: ConfigSource> LimitEvaluator<S, C> {
    /// Create an evaluator reading counters from `counters` and limits from `config`.
    pub fn new(counters: Arc<CounterStore<S>>, config: Arc<C>) -> Self {
        Self { counters, config }
    }

    /// Evaluate `usage` for `scope` on `plan_id` at `instant`. Performs no writes.
    pub async fn evaluate(
        &self,
        scope: &Scope,
        plan_id: &str,
        usage: &Usage,
        instant: DateTime<Utc>,
        flat_usage: bool,
    ) -> Result<Decision, MeteringError> {
        let service_id = scope.service_id();
        let service = self
            .config
            .service(service_id)
            .ok_or_else(|| MeteringError::ServiceNotFound(service_id.to_string()))?;

        let ops = expand(service_id, usage, &service.metrics, flat_usage)?;

        let mut checks = Vec::new();
        for (metric_id, op) in &ops {
            for limit in self.config.usage_limits(service_id, plan_id, metric_id) {
                checks.push((*op, limit));
            }
        }

        let counters: Vec<(&str, Granularity)> = checks
            .iter()
            .map(|(_, limit)| (limit.metric_id.as_str(), limit.granularity))
            .collect();
        let values = self.counters.read_many(scope, &counters, instant).await?;

        let mut over_limit = false;
        let mut reports = Vec::with_capacity(checks.len());

        for ((op, limit), current_value) in checks.into_iter().zip(values) {
            if op.projected(current_value) > limit.max_value {
                over_limit = true;
            }

            reports.push(report(limit, current_value, instant));
        }

        let mut decision = Decision::authorized(reports);
        if over_limit {
            tracing::debug!(scope = %scope, plan_id, "limits.exceeded");
            decision.reject(RejectionReason::LimitsExceeded);
        }

        Ok(decision)
    }
}

fn report(limit: UsageLimit, current_value: i64, instant: DateTime<Utc>) -> UsageReport {
    let bounds = Period::containing(limit.granularity, instant).bounds();

    UsageReport {
        metric_id: limit.metric_id,
        granularity: limit.granularity,
        current_value,
        max_value: limit.max_value,
        exceeded: current_value > limit.max_value,
        period_start: bounds.map(|(start, _)| start),
        period_end: bounds.map(|(_, end)| end),
    }
}
