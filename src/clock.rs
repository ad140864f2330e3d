use chrono::{DateTime, Utc};

/// Source of the current time.
///
/// The flush pipeline allocates change buckets from `now()` and the meter uses it as the
/// default timestamp for transactions, so tests can drive both deterministically.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
