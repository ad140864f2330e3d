use std::{sync::Arc, time::Duration};

use crate::{
    BucketId, CounterStore, CounterStoreOptions, FlushBucketSizeSeconds, Granularity, LocalStore,
    MeteringError, Period, PrimaryStore, Scope, ScopeKind, StatsKey, Usage,
};

use super::{FailingStore, ManualClock, hierarchy, runtime, ts};

const T: &str = "2010-05-07T13:23:33Z";

fn counters(store: &Arc<LocalStore>, options: CounterStoreOptions) -> CounterStore<LocalStore> {
    CounterStore::with_clock(Arc::clone(store), options, ManualClock::new(ts(T)))
}

fn key(scope: &Scope, metric_id: &str, granularity: Granularity) -> String {
    StatsKey::new(scope, metric_id, Period::containing(granularity, ts(T))).to_string()
}

#[test]
fn increment_then_set_zero_removes_the_counter() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(&store, CounterStoreOptions::default());
        let app = Scope::application("42", "app");
        let h = hierarchy();

        counters.increment(&app, &h, "hits", 3, ts(T)).await.unwrap();
        assert_eq!(
            counters.read(&app, "hits", Granularity::Day, ts(T)).await.unwrap(),
            3
        );

        let usage = Usage::parse([("hits", "#0")]).unwrap();
        counters.apply_usage(&app, &h, &usage, ts(T)).await.unwrap();

        assert_eq!(
            counters.read(&app, "hits", Granularity::Day, ts(T)).await.unwrap(),
            0
        );
        assert!(!store.contains_key(&key(&app, "hits", Granularity::Day)));
        assert!(!store.contains_key(&key(&app, "hits", Granularity::Eternity)));
    });
}

#[test]
fn zero_increment_writes_nothing() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(&store, CounterStoreOptions::default());
        let app = Scope::application("42", "app");

        counters
            .increment(&app, &hierarchy(), "searches", 0, ts(T))
            .await
            .unwrap();

        assert_eq!(store.counter_count(), 0);
        assert!(store.pending_buckets().await.unwrap().is_empty());
        assert!(counters.instances("42", ScopeKind::Application).await.unwrap().is_empty());
    });
}

#[test]
fn increments_propagate_to_ancestors_and_service() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(&store, CounterStoreOptions::default());
        let app = Scope::application("42", "app");
        let service = Scope::service("42");

        counters
            .increment(&app, &hierarchy(), "web_searches", 2, ts(T))
            .await
            .unwrap();

        for granularity in Granularity::REPORTING {
            for metric_id in ["web_searches", "searches", "hits"] {
                assert_eq!(
                    counters.read(&app, metric_id, granularity, ts(T)).await.unwrap(),
                    2,
                    "{metric_id}/{granularity}"
                );
                assert_eq!(
                    counters.read(&service, metric_id, granularity, ts(T)).await.unwrap(),
                    2,
                    "service {metric_id}/{granularity}"
                );
            }

            assert_eq!(
                counters.read(&app, "storage", granularity, ts(T)).await.unwrap(),
                0
            );
        }

        // 2 scopes * 3 metrics * 7 granularities
        assert_eq!(store.counter_count(), 42);
    });
}

#[test]
fn rollup_can_be_disabled() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(
            &store,
            CounterStoreOptions {
                rollup_to_service: false,
                ..CounterStoreOptions::default()
            },
        );
        let user = Scope::user("42", "alice");

        counters.increment(&user, &hierarchy(), "hits", 1, ts(T)).await.unwrap();

        assert_eq!(
            counters.read(&user, "hits", Granularity::Day, ts(T)).await.unwrap(),
            1
        );
        assert_eq!(
            counters
                .read(&Scope::service("42"), "hits", Granularity::Day, ts(T))
                .await
                .unwrap(),
            0
        );
    });
}

#[test]
fn only_configured_granularities_are_kept() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(
            &store,
            CounterStoreOptions {
                granularities: vec![Granularity::Day, Granularity::Second],
                rollup_to_service: false,
                ..CounterStoreOptions::default()
            },
        );
        let app = Scope::application("42", "app");

        counters.increment(&app, &hierarchy(), "hits", 1, ts(T)).await.unwrap();

        assert_eq!(store.counter_count(), 2);
        assert!(store.contains_key(&key(&app, "hits", Granularity::Second)));
        assert!(!store.contains_key(&key(&app, "hits", Granularity::Hour)));
    });
}

#[test]
fn set_overwrites_and_propagates() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(&store, CounterStoreOptions::default());
        let app = Scope::application("42", "app");
        let h = hierarchy();

        counters.increment(&app, &h, "hits", 10, ts(T)).await.unwrap();
        counters.set(&app, &h, "searches", 5, ts(T)).await.unwrap();

        assert_eq!(
            counters.read(&app, "searches", Granularity::Month, ts(T)).await.unwrap(),
            5
        );
        assert_eq!(
            counters.read(&app, "hits", Granularity::Month, ts(T)).await.unwrap(),
            5
        );
    });
}

#[test]
fn only_minute_counters_expire() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(&store, CounterStoreOptions::default());
        let app = Scope::application("42", "app");

        counters.increment(&app, &hierarchy(), "hits", 1, ts(T)).await.unwrap();

        let ttl = store.ttl(&key(&app, "hits", Granularity::Minute)).unwrap();
        assert!(ttl <= Duration::from_secs(180));
        assert!(ttl > Duration::from_secs(170));

        assert_eq!(store.ttl(&key(&app, "hits", Granularity::Hour)), None);
        assert_eq!(store.ttl(&key(&app, "hits", Granularity::Eternity)), None);
    });
}

#[test]
fn writes_are_tracked_in_the_current_bucket() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(&store, CounterStoreOptions::default());
        let app = Scope::application("42", "app");

        counters.increment(&app, &hierarchy(), "hits", 1, ts(T)).await.unwrap();

        let bucket = BucketId::for_instant(ts(T), FlushBucketSizeSeconds::default());
        assert_eq!(store.pending_buckets().await.unwrap(), vec![bucket]);

        let keys = store.bucket_keys(bucket).await.unwrap();
        assert_eq!(keys.len(), 14);
        assert!(keys.contains(&key(&app, "hits", Granularity::Day)));
        assert!(keys.contains(&key(&Scope::service("42"), "hits", Granularity::Day)));
    });
}

#[test]
fn failed_write_applies_nothing() {
    runtime::block_on(async {
        let store = FailingStore::new();
        let counters = CounterStore::with_clock(
            Arc::clone(&store),
            CounterStoreOptions::default(),
            ManualClock::new(ts(T)),
        );
        let app = Scope::application("42", "app");

        store.fail_writes(true);

        let err = counters
            .increment(&app, &hierarchy(), "web_searches", 1, ts(T))
            .await
            .unwrap_err();
        assert!(matches!(err, MeteringError::Store(_)));

        assert_eq!(store.inner.counter_count(), 0);
        assert!(store.pending_buckets().await.unwrap().is_empty());

        store.fail_writes(false);
        counters
            .increment(&app, &hierarchy(), "web_searches", 1, ts(T))
            .await
            .unwrap();

        assert_eq!(
            counters.read(&app, "hits", Granularity::Day, ts(T)).await.unwrap(),
            1
        );
    });
}

#[test]
fn unknown_metric_is_rejected_before_writing() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(&store, CounterStoreOptions::default());
        let usage = Usage::parse([("hits", "1"), ("bogus", "1")]).unwrap();

        let err = counters
            .apply_usage(&Scope::service("42"), &hierarchy(), &usage, ts(T))
            .await
            .unwrap_err();

        assert!(matches!(err, MeteringError::InvalidMetric { .. }));
        assert_eq!(store.counter_count(), 0);
    });
}

#[test]
fn instances_are_recorded_per_kind() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(&store, CounterStoreOptions::default());
        let h = hierarchy();

        counters
            .increment(&Scope::application("42", "b"), &h, "hits", 1, ts(T))
            .await
            .unwrap();
        counters
            .increment(&Scope::application("42", "a"), &h, "hits", 1, ts(T))
            .await
            .unwrap();
        counters
            .increment(&Scope::user("42", "alice"), &h, "hits", 1, ts(T))
            .await
            .unwrap();
        counters
            .increment(&Scope::service("42"), &h, "hits", 1, ts(T))
            .await
            .unwrap();

        assert_eq!(
            counters.instances("42", ScopeKind::Application).await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(
            counters.instances("42", ScopeKind::User).await.unwrap(),
            vec!["alice".to_string()]
        );
        assert!(counters.instances("42", ScopeKind::Service).await.unwrap().is_empty());
        assert!(counters.instances("7", ScopeKind::Application).await.unwrap().is_empty());
    });
}

#[test]
fn delete_stats_removes_periods_inside_range() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(&store, CounterStoreOptions::default());
        let app = Scope::application("42", "app");
        let h = hierarchy();
        let saturday = ts("2010-05-08T10:00:00Z");

        counters.increment(&app, &h, "hits", 1, ts(T)).await.unwrap();
        counters.increment(&app, &h, "hits", 1, saturday).await.unwrap();

        let deleted = counters
            .delete_stats("42", &h, ts("2010-05-08T00:00:00Z"), ts("2010-05-08T23:59:59Z"))
            .await
            .unwrap();

        // day, hour and minute of saturday, for the application and the service
        assert_eq!(deleted, 6);

        assert_eq!(
            counters.read(&app, "hits", Granularity::Day, saturday).await.unwrap(),
            0
        );
        assert_eq!(
            counters.read(&app, "hits", Granularity::Day, ts(T)).await.unwrap(),
            1
        );
        assert_eq!(
            counters.read(&app, "hits", Granularity::Week, saturday).await.unwrap(),
            2
        );
        assert_eq!(
            counters.read(&app, "hits", Granularity::Eternity, saturday).await.unwrap(),
            2
        );

        let none = counters
            .delete_stats("42", &h, saturday, ts(T))
            .await
            .unwrap();
        assert_eq!(none, 0);
    });
}

#[test]
fn delete_stats_spans_many_delete_rounds() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(
            &store,
            CounterStoreOptions {
                granularities: vec![Granularity::Minute],
                ..CounterStoreOptions::default()
            },
        );
        let app = Scope::application("42", "app");
        let h = hierarchy();

        for step in 0..30 {
            let instant = ts(T) + chrono::Duration::minutes(41 * step);
            counters.increment(&app, &h, "hits", 1, instant).await.unwrap();
        }

        let outside = ts("2010-05-09T01:00:00Z");
        counters.increment(&app, &h, "hits", 1, outside).await.unwrap();
        assert_eq!(store.counter_count(), 62);

        // two days of minutes for four metrics and two scopes
        let deleted = counters
            .delete_stats("42", &h, ts("2010-05-07T00:00:00Z"), ts("2010-05-08T23:59:59Z"))
            .await
            .unwrap();

        assert_eq!(deleted, 60);
        assert_eq!(store.counter_count(), 2);
        assert_eq!(
            counters.read(&app, "hits", Granularity::Minute, outside).await.unwrap(),
            1
        );
    });
}

#[test]
fn read_many_preserves_order() {
    runtime::block_on(async {
        let store = Arc::new(LocalStore::new());
        let counters = counters(&store, CounterStoreOptions::default());
        let app = Scope::application("42", "app");
        let h = hierarchy();

        counters.increment(&app, &h, "searches", 4, ts(T)).await.unwrap();
        counters.increment(&app, &h, "storage", 9, ts(T)).await.unwrap();

        let values = counters
            .read_many(
                &app,
                &[
                    ("storage", Granularity::Day),
                    ("hits", Granularity::Year),
                    ("web_searches", Granularity::Day),
                ],
                ts(T),
            )
            .await
            .unwrap();

        assert_eq!(values, vec![9, 4, 0]);
        assert!(counters.read_many(&app, &[], ts(T)).await.unwrap().is_empty());
    });
}
