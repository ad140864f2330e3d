use std::{hint::black_box, sync::Arc};

use criterion::{Criterion, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use tallymark::{
    ApplicationConfig, Granularity, InMemoryConfig, LocalStore, MemoryAnalyticsStore, Meter,
    MeterOptions, MetricHierarchy, Scope, ServiceConfig, Transaction, Usage, UsageLimit,
    UsageValue, start_of,
};

type LocalMeter = Meter<LocalStore, MemoryAnalyticsStore, InMemoryConfig>;

fn meter(apps: usize, max_value: i64) -> LocalMeter {
    let config = Arc::new(InMemoryConfig::new());
    config.put_service(ServiceConfig::new(
        "42",
        MetricHierarchy::new()
            .with_metric("hits")
            .with_child("searches", "hits")
            .with_child("web_searches", "searches"),
    ));

    for i in 0..apps {
        config.put_application(ApplicationConfig::new("42", format!("app_{i}"), "basic"));
    }

    config.set_usage_limit(UsageLimit {
        service_id: "42".to_string(),
        plan_id: "basic".to_string(),
        metric_id: "hits".to_string(),
        granularity: Granularity::Day,
        max_value,
    });

    Meter::new(
        Arc::new(LocalStore::new()),
        Arc::new(MemoryAnalyticsStore::new()),
        config,
        MeterOptions::default(),
    )
}

fn web_search(app: &str) -> Transaction {
    Transaction::new(
        Scope::application("42", app),
        Usage::new().with("web_searches", UsageValue::Increment(1)),
    )
}

fn bench_authrep_allowed(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("local_authrep/allowed");
    group.sample_size(100);

    for apps in [1_usize, 1_000] {
        group.bench_function(format!("authrep/apps={apps}"), |b| {
            let meter = meter(apps, i64::MAX);
            let txs: Vec<Transaction> = (0..apps).map(|i| web_search(&format!("app_{i}"))).collect();
            let mut idx = 0_usize;

            b.iter(|| {
                idx = idx.wrapping_add(1);
                let tx = &txs[idx % txs.len()];
                black_box(rt.block_on(meter.authrep(black_box(tx))).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_cached_paths(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("local_authrep/cached");
    group.sample_size(200);

    group.bench_function("authorize/hit", |b| {
        let meter = meter(1, i64::MAX);
        let tx = web_search("app_0");
        rt.block_on(meter.authorize(&tx)).unwrap();

        b.iter(|| {
            black_box(rt.block_on(meter.authorize(black_box(&tx))).unwrap());
        });
    });

    group.bench_function("authrep/rejected", |b| {
        let meter = meter(1, 0);
        let tx = web_search("app_0");
        rt.block_on(meter.authrep(&tx)).unwrap();

        b.iter(|| {
            black_box(rt.block_on(meter.authrep(black_box(&tx))).unwrap());
        });
    });

    group.finish();
}

fn bench_periods(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_authrep/periods");
    let now = chrono::Utc::now();

    for granularity in [Granularity::Minute, Granularity::Week, Granularity::Month] {
        group.bench_function(format!("start_of/{granularity}"), |b| {
            b.iter(|| black_box(start_of(black_box(granularity), black_box(now))));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_authrep_allowed,
    bench_cached_paths,
    bench_periods
);
criterion_main!(benches);
