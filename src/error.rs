/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum MeteringError {
    /// Redis error.
    #[cfg(feature = "redis-tokio")]
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// The primary store could not apply or serve a request.
    #[error("primary store error: {0}")]
    Store(String),

    /// The secondary (analytics) store rejected a write.
    #[error("analytics store error: {0}")]
    Analytics(String),

    /// A usage value is not of the form `N` or `#N`.
    #[error("invalid usage value for metric `{metric}`: {value:?}")]
    InvalidUsageValue {
        /// Metric the value was reported for.
        metric: String,
        /// The raw value.
        value: String,
    },

    /// The metric is not part of the service's metric hierarchy.
    #[error("metric `{metric}` is not defined for service `{service_id}`")]
    InvalidMetric {
        /// Service that was looked up.
        service_id: String,
        /// Offending metric name.
        metric: String,
    },

    /// No configuration exists for the service.
    #[error("service `{0}` not found")]
    ServiceNotFound(String),

    /// No configuration exists for the application.
    #[error("application `{application_id}` not found for service `{service_id}`")]
    ApplicationNotFound {
        /// Owning service.
        service_id: String,
        /// Missing application.
        application_id: String,
    },

    /// No configuration exists for the user.
    #[error("user `{user_id}` not found for service `{service_id}`")]
    UserNotFound {
        /// Owning service.
        service_id: String,
        /// Missing user.
        user_id: String,
    },

    /// A bookkeeping entry could not be parsed.
    #[error("invalid change bucket id: {0}")]
    InvalidBucketId(String),

    /// Invalid flush bucket size.
    #[error("invalid flush bucket size: {0}")]
    InvalidFlushBucketSize(String),

    /// Invalid decision cache ttl.
    #[error("invalid decision cache ttl: {0}")]
    InvalidDecisionCacheTtl(String),

    /// Invalid flush concurrency.
    #[error("invalid flush concurrency: {0}")]
    InvalidFlushConcurrency(String),

    /// Invalid claim batch size.
    #[error("invalid claim batch size: {0}")]
    InvalidClaimBatchSize(String),

    /// Invalid Redis connection count.
    #[error("invalid redis client connection count: {0}")]
    InvalidRedisClientConnectionCount(String),

    /// Invalid Redis key prefix.
    #[error("invalid redis prefix: {0}")]
    InvalidRedisPrefix(String),

    /// Background work was requested outside of a Tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}
