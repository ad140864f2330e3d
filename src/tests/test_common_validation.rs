use crate::{
    ClaimBatchSize, DecisionCacheTtlMs, FlushBucketSizeSeconds, FlushConcurrency, MeteringError,
};

#[test]
fn flush_bucket_size_try_from_validates_range() {
    let d = FlushBucketSizeSeconds::default();
    assert_eq!(*d, 5u64);

    let s = FlushBucketSizeSeconds::try_from(1u64).unwrap();
    assert_eq!(*s, 1u64);

    let s = FlushBucketSizeSeconds::try_from(3600u64).unwrap();
    assert_eq!(*s, 3600u64);

    assert!(matches!(
        FlushBucketSizeSeconds::try_from(0u64).unwrap_err(),
        MeteringError::InvalidFlushBucketSize(m) if m == "Flush bucket size must be at least 1 second"
    ));
    assert!(matches!(
        FlushBucketSizeSeconds::try_from(3601u64).unwrap_err(),
        MeteringError::InvalidFlushBucketSize(m) if m == "Flush bucket size must not exceed 3600 seconds"
    ));
}

#[test]
fn decision_cache_ttl_try_from_validates_range() {
    let d = DecisionCacheTtlMs::default();
    assert_eq!(*d, 1000u64);

    let t = DecisionCacheTtlMs::try_from(60_000u64).unwrap();
    assert_eq!(*t, 60_000u64);

    assert!(matches!(
        DecisionCacheTtlMs::try_from(0u64).unwrap_err(),
        MeteringError::InvalidDecisionCacheTtl(m) if m == "Decision cache ttl must be greater than 0"
    ));
    assert!(matches!(
        DecisionCacheTtlMs::try_from(60_001u64).unwrap_err(),
        MeteringError::InvalidDecisionCacheTtl(m) if m == "Decision cache ttl must not exceed 60000 ms"
    ));
}

#[test]
fn flush_concurrency_try_from_validates_nonzero() {
    let d = FlushConcurrency::default();
    assert_eq!(*d, 4usize);

    let c = FlushConcurrency::try_from(16usize).unwrap();
    assert_eq!(*c, 16usize);

    assert!(matches!(
        FlushConcurrency::try_from(0usize).unwrap_err(),
        MeteringError::InvalidFlushConcurrency(m) if m == "Flush concurrency must be greater than 0"
    ));
}

#[test]
fn claim_batch_size_try_from_validates_nonzero() {
    let d = ClaimBatchSize::default();
    assert_eq!(*d, 1000usize);

    let b = ClaimBatchSize::try_from(1usize).unwrap();
    assert_eq!(*b, 1usize);

    assert!(matches!(
        ClaimBatchSize::try_from(0usize).unwrap_err(),
        MeteringError::InvalidClaimBatchSize(m) if m == "Claim batch size must be greater than 0"
    ));
}

#[test]
fn error_messages_name_the_offending_input() {
    let err = MeteringError::InvalidMetric {
        service_id: "42".to_string(),
        metric: "bogus".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "metric `bogus` is not defined for service `42`"
    );

    let err = MeteringError::ApplicationNotFound {
        service_id: "42".to_string(),
        application_id: "nope".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "application `nope` not found for service `42`"
    );
}
