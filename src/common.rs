use std::ops::Deref;

use crate::MeteringError;

/// Width of one change bucket used by the flush pipeline, in seconds.
///
/// Every counter mutation records its key into the bucket covering the current instant. The
/// width is unrelated to reporting granularities and is usually a handful of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlushBucketSizeSeconds(u64);

impl Default for FlushBucketSizeSeconds {
    /// Returns a bucket size of 5 seconds.
    fn default() -> Self {
        Self(5)
    }
}

impl Deref for FlushBucketSizeSeconds {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for FlushBucketSizeSeconds {
    type Error = MeteringError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(MeteringError::InvalidFlushBucketSize(
                "Flush bucket size must be at least 1 second".to_string(),
            ))
        } else if value > 3600 {
            Err(MeteringError::InvalidFlushBucketSize(
                "Flush bucket size must not exceed 3600 seconds".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Lifetime of a cached decision, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DecisionCacheTtlMs(u64);

impl Default for DecisionCacheTtlMs {
    /// Returns a ttl of 1000 ms.
    fn default() -> Self {
        Self(1000)
    }
}

impl Deref for DecisionCacheTtlMs {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for DecisionCacheTtlMs {
    type Error = MeteringError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(MeteringError::InvalidDecisionCacheTtl(
                "Decision cache ttl must be greater than 0".to_string(),
            ))
        } else if value > 60_000 {
            Err(MeteringError::InvalidDecisionCacheTtl(
                "Decision cache ttl must not exceed 60000 ms".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Maximum number of claimed buckets flushed at the same time by one flush call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlushConcurrency(usize);

impl Default for FlushConcurrency {
    /// Returns a concurrency of 4.
    fn default() -> Self {
        Self(4)
    }
}

impl Deref for FlushConcurrency {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<usize> for FlushConcurrency {
    type Error = MeteringError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(MeteringError::InvalidFlushConcurrency(
                "Flush concurrency must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Upper bound on the number of buckets handed out by a single claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClaimBatchSize(usize);

impl Default for ClaimBatchSize {
    /// Returns a batch size of 1000.
    fn default() -> Self {
        Self(1000)
    }
}

impl Deref for ClaimBatchSize {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<usize> for ClaimBatchSize {
    type Error = MeteringError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(MeteringError::InvalidClaimBatchSize(
                "Claim batch size must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}
