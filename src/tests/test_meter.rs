use std::sync::Arc;

use crate::{
    Clock, ConfigState, Extensions, Granularity, InMemoryConfig, LocalStore,
    MemoryAnalyticsStore, Meter, MeterOptions, MeteringError, RejectionReason, RequestContext,
    Scope, Transaction, Usage, UsageValue,
};

use super::{ManualClock, config, limit, runtime, ts};

const T: &str = "2010-05-07T13:23:33Z";

type TestMeter = Meter<LocalStore, MemoryAnalyticsStore, InMemoryConfig>;

struct Fixture {
    clock: Arc<ManualClock>,
    store: Arc<LocalStore>,
    analytics: Arc<MemoryAnalyticsStore>,
    config: Arc<InMemoryConfig>,
    meter: TestMeter,
}

fn fixture() -> Fixture {
    let clock = ManualClock::new(ts(T));
    let store = Arc::new(LocalStore::new());
    let analytics = Arc::new(MemoryAnalyticsStore::new());
    let config = config();

    let meter = Meter::with_clock(
        Arc::clone(&store),
        Arc::clone(&analytics),
        Arc::clone(&config),
        MeterOptions::default(),
        clock.clone(),
    );

    Fixture {
        clock,
        store,
        analytics,
        config,
        meter,
    }
}

fn app() -> Scope {
    Scope::application("42", "app")
}

fn hits(n: i64) -> Usage {
    Usage::new().with("hits", UsageValue::Increment(n))
}

impl Fixture {
    async fn day(&self, scope: &Scope, metric_id: &str) -> i64 {
        self.meter
            .counters()
            .read(scope, metric_id, Granularity::Day, self.clock.now())
            .await
            .unwrap()
    }
}

#[test]
fn authorize_is_cached_and_writes_nothing() {
    runtime::block_on(async {
        let f = fixture();
        f.config.set_usage_limit(limit("hits", Granularity::Day, 5));

        let tx = Transaction::new(app(), hits(1));

        let decision = f.meter.authorize(&tx).await.unwrap();
        assert!(decision.authorized);
        assert_eq!(decision.reports.len(), 1);
        assert_eq!(decision.reports[0].current_value, 0);
        assert_eq!(f.store.counter_count(), 0);
        assert_eq!(f.meter.cache().misses(), 1);

        let again = f.meter.authorize(&tx).await.unwrap();
        assert_eq!(again, decision);
        assert_eq!(f.meter.cache().hits(), 1);
        assert_eq!(f.store.counter_count(), 0);
    });
}

#[test]
fn authrep_records_only_authorized_usage() {
    runtime::block_on(async {
        let f = fixture();
        f.config.set_usage_limit(limit("hits", Granularity::Day, 2));

        let tx = Transaction::new(app(), hits(1));

        assert!(f.meter.authrep(&tx).await.unwrap().authorized);
        assert!(f.meter.authrep(&tx).await.unwrap().authorized);
        assert!(f.meter.cache().is_empty());

        let rejected = f.meter.authrep(&tx).await.unwrap();
        assert!(!rejected.authorized);
        assert_eq!(
            rejected.rejection_reason,
            Some(RejectionReason::LimitsExceeded)
        );
        assert_eq!(rejected.reports[0].current_value, 2);
        assert_eq!(f.day(&app(), "hits").await, 2);
        assert_eq!(f.day(&Scope::service("42"), "hits").await, 2);

        // the rejection is served from the cache
        assert_eq!(f.meter.cache().len(), 1);
        let hits_before = f.meter.cache().hits();
        assert_eq!(f.meter.authrep(&tx).await.unwrap(), rejected);
        assert_eq!(f.meter.cache().hits(), hits_before + 1);
        assert_eq!(f.day(&app(), "hits").await, 2);
    });
}

#[test]
fn limit_change_invalidates_cached_decisions() {
    runtime::block_on(async {
        let f = fixture();
        f.config.set_usage_limit(limit("hits", Granularity::Day, 0));

        let tx = Transaction::new(app(), hits(1));
        assert!(!f.meter.authrep(&tx).await.unwrap().authorized);
        assert!(!f.meter.authorize(&tx).await.unwrap().authorized);

        f.config.set_usage_limit(limit("hits", Granularity::Day, 10));

        assert!(f.meter.authorize(&tx).await.unwrap().authorized);
        assert!(f.meter.authrep(&tx).await.unwrap().authorized);
        assert_eq!(f.day(&app(), "hits").await, 1);
    });
}

#[test]
fn application_change_invalidates_cached_decisions() {
    runtime::block_on(async {
        let f = fixture();
        let tx = Transaction::new(app(), hits(1));

        assert!(f.meter.authorize(&tx).await.unwrap().authorized);

        assert!(f.config.update_application("42", "app", |application| {
            application.state = ConfigState::Suspended;
        }));

        let decision = f.meter.authorize(&tx).await.unwrap();
        assert!(!decision.authorized);
        assert_eq!(decision.rejection_reason, Some(RejectionReason::Inactive));
    });
}

#[test]
fn state_failures_outrank_limits() {
    runtime::block_on(async {
        let f = fixture();
        f.config.set_usage_limit(limit("hits", Granularity::Day, 0));
        f.config.update_application("42", "app", |application| {
            application.keys = vec!["k1".to_string()];
        });

        let tx = Transaction::new(app(), hits(1));
        let decision = f.meter.authrep(&tx).await.unwrap();

        assert!(!decision.authorized);
        assert_eq!(
            decision.rejection_reason,
            Some(RejectionReason::InvalidCredential)
        );
        assert_eq!(decision.reports.len(), 1);
        assert_eq!(decision.reports[0].max_value, 0);

        let keyed = tx.with_context(RequestContext::default().with_credential("k1"));
        let decision = f.meter.authrep(&keyed).await.unwrap();
        assert_eq!(
            decision.rejection_reason,
            Some(RejectionReason::LimitsExceeded)
        );
    });
}

#[test]
fn no_body_drops_reports() {
    runtime::block_on(async {
        let f = fixture();
        f.config.set_usage_limit(limit("hits", Granularity::Day, 0));

        let tx = Transaction::new(app(), hits(1)).with_context(
            RequestContext::default().with_extensions(Extensions {
                no_body: true,
                ..Extensions::default()
            }),
        );

        let decision = f.meter.authorize(&tx).await.unwrap();
        assert!(!decision.authorized);
        assert!(decision.reports.is_empty());
    });
}

#[test]
fn flat_usage_skips_parent_limits_but_records_ancestors() {
    runtime::block_on(async {
        let f = fixture();
        f.config.set_usage_limit(limit("hits", Granularity::Day, 0));

        let usage = Usage::new().with("web_searches", UsageValue::Increment(1));
        let flat = RequestContext::default().with_extensions(Extensions {
            flat_usage: true,
            ..Extensions::default()
        });

        let decision = f
            .meter
            .authrep(&Transaction::new(app(), usage.clone()).with_context(flat.clone()))
            .await
            .unwrap();
        assert!(decision.authorized);

        assert_eq!(f.day(&app(), "web_searches").await, 1);
        assert_eq!(f.day(&app(), "searches").await, 1);
        assert_eq!(f.day(&app(), "hits").await, 1);

        assert_eq!(
            f.meter
                .report(&Transaction::new(app(), usage.clone()).with_context(flat))
                .await
                .unwrap(),
            None
        );
        assert_eq!(f.day(&app(), "hits").await, 2);

        let expanded = f
            .meter
            .authrep(&Transaction::new(app(), usage))
            .await
            .unwrap();
        assert!(!expanded.authorized);
        assert_eq!(expanded.rejection_reason, Some(RejectionReason::LimitsExceeded));
        assert_eq!(f.day(&app(), "hits").await, 2);
    });
}

#[test]
fn report_skips_limits_but_checks_state() {
    runtime::block_on(async {
        let f = fixture();
        f.config.set_usage_limit(limit("hits", Granularity::Day, 0));
        f.config.update_application("42", "app", |application| {
            application.keys = vec!["k1".to_string()];
        });

        let tx = Transaction::new(app(), hits(5));
        assert_eq!(
            f.meter.report(&tx).await.unwrap(),
            Some(RejectionReason::InvalidCredential)
        );
        assert_eq!(f.store.counter_count(), 0);

        let keyed = tx.with_context(RequestContext::default().with_credential("k1"));
        assert_eq!(f.meter.report(&keyed).await.unwrap(), None);
        assert_eq!(f.day(&app(), "hits").await, 5);
    });
}

#[test]
fn unknown_entities_are_errors() {
    runtime::block_on(async {
        let f = fixture();

        let err = f
            .meter
            .authorize(&Transaction::new(Scope::application("42", "ghost"), hits(1)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeteringError::ApplicationNotFound { application_id, .. } if application_id == "ghost"
        ));

        let err = f
            .meter
            .authrep(&Transaction::new(Scope::user("42", "bob"), hits(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::UserNotFound { user_id, .. } if user_id == "bob"));

        let err = f
            .meter
            .report(&Transaction::new(Scope::service("7"), hits(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::ServiceNotFound(id) if id == "7"));

        let err = f
            .meter
            .authrep(&Transaction::new(
                app(),
                Usage::new().with("bogus", UsageValue::Increment(1)),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::InvalidMetric { .. }));
        assert_eq!(f.store.counter_count(), 0);
    });
}

#[test]
fn service_scope_calls_have_no_limits() {
    runtime::block_on(async {
        let f = fixture();
        f.config.set_usage_limit(limit("hits", Granularity::Day, 0));
        f.config.update_service("42", |service| {
            service.tokens = vec!["token".to_string()];
        });

        let tx = Transaction::new(Scope::service("42"), hits(3));
        let decision = f.meter.authrep(&tx).await.unwrap();
        assert_eq!(
            decision.rejection_reason,
            Some(RejectionReason::InvalidCredential)
        );

        let tx = tx.with_context(RequestContext::default().with_credential("token"));
        let decision = f.meter.authrep(&tx).await.unwrap();
        assert!(decision.authorized);
        assert!(decision.reports.is_empty());
        assert_eq!(f.day(&Scope::service("42"), "hits").await, 3);

        let bad = Transaction::new(
            Scope::service("42"),
            Usage::new().with("bogus", UsageValue::Increment(1)),
        )
        .with_context(RequestContext::default().with_credential("token"));
        assert!(f.meter.authorize(&bad).await.is_err());
    });
}

#[test]
fn user_scope_uses_the_user_plan() {
    runtime::block_on(async {
        let f = fixture();
        f.config.set_usage_limit(limit("hits", Granularity::Day, 1));

        let alice = Scope::user("42", "alice");
        let tx = Transaction::new(alice.clone(), hits(1));

        assert!(f.meter.authrep(&tx).await.unwrap().authorized);
        assert!(!f.meter.authrep(&tx).await.unwrap().authorized);

        // application counters are separate
        assert!(
            f.meter
                .authrep(&Transaction::new(app(), hits(1)))
                .await
                .unwrap()
                .authorized
        );
        assert_eq!(f.day(&alice, "hits").await, 1);
        assert_eq!(f.day(&Scope::service("42"), "hits").await, 2);
    });
}

#[test]
fn explicit_timestamps_bypass_the_cache() {
    runtime::block_on(async {
        let f = fixture();
        let yesterday = ts("2010-05-06T09:00:00Z");
        let tx = Transaction::new(app(), hits(2)).at(yesterday);

        assert!(f.meter.authorize(&tx).await.unwrap().authorized);
        assert!(f.meter.authrep(&tx).await.unwrap().authorized);
        assert!(f.meter.cache().is_empty());
        assert_eq!(f.meter.cache().hits() + f.meter.cache().misses(), 0);

        let recorded = f
            .meter
            .counters()
            .read(&app(), "hits", Granularity::Day, yesterday)
            .await
            .unwrap();
        assert_eq!(recorded, 2);
        assert_eq!(f.day(&app(), "hits").await, 0);
    });
}

#[test]
fn recorded_usage_reaches_analytics() {
    runtime::block_on(async {
        let f = fixture();

        f.meter
            .authrep(&Transaction::new(app(), hits(3)))
            .await
            .unwrap();

        f.clock.advance_secs(5);
        let summary = f.meter.flush().flush_pending(f.clock.now()).await.unwrap();

        assert_eq!(summary.flushed, 1);
        assert_eq!(
            f.analytics
                .get("service:42/application:app/metric:hits/day:20100507000000")
                .unwrap()
                .value,
            3
        );
        assert_eq!(
            f.analytics
                .get("service:42/metric:hits/eternity:eternity")
                .unwrap()
                .value,
            3
        );
    });
}
