use criterion::{black_box, criterion_group, criterion_main, Criterion};
use crawl_gateway::{
    normalize_link, validate_url, ConcurrencyGate, Config, SlidingWindowLimiter, UrlFilter,
};
use std::time::Duration;
use tokio::runtime::Runtime;

#[cfg(feature = "chrome-integration")]
use crawl_gateway::{CrawlOptions, CrawlService, Metrics};
#[cfg(feature = "chrome-integration")]
use std::sync::Arc;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

// === UNIT BENCHMARKS ===

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| {
            let config = Config::default();
            black_box(config);
        });
    });

    group.bench_function("validate", |b| {
        let config = Config::default();
        b.iter(|| black_box(config.validate().is_ok()));
    });

    group.finish();
}

fn benchmark_rate_limiter(c: &mut Criterion) {
    // The limiter reads tokio's clock
    let rt = Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut group = c.benchmark_group("rate_limiter");
    configure_fast_group(&mut group);

    group.bench_function("check_single_client", |b| {
        let limiter = SlidingWindowLimiter::new(usize::MAX, Duration::from_secs(60), true);
        b.iter(|| {
            let decision = limiter.check(black_box("key:bench-client"));
            let _ = black_box(decision);
        });
    });

    group.bench_function("check_many_clients", |b| {
        let limiter = SlidingWindowLimiter::new(100, Duration::from_secs(60), true);
        let clients: Vec<String> = (0..1000).map(|i| format!("ip:10.0.{}.{}", i / 256, i % 256)).collect();
        let mut next = 0;
        b.iter(|| {
            let decision = limiter.check(&clients[next % clients.len()]);
            next += 1;
            let _ = black_box(decision);
        });
    });

    group.finish();
}

fn benchmark_gate(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("concurrency_gate");
    configure_fast_group(&mut group);

    let gate = ConcurrencyGate::new(8);
    group.bench_function("acquire_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let permit = gate.acquire(None).await;
                black_box(permit.is_ok());
            })
        });
    });

    group.finish();
}

fn benchmark_url_handling(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_handling");
    configure_fast_group(&mut group);

    let test_urls = vec![
        "https://example.com",
        "http://example.com/path",
        "invalid-url",
    ];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &test_urls {
                let result = validate_url(url);
                let _ = black_box(result);
            }
        });
    });

    let base = url::Url::parse("https://example.com/docs/index.html").unwrap();
    let hrefs = vec!["../about", "/blog/post#comments", "mailto:team@example.com"];

    group.bench_function("normalize_link", |b| {
        b.iter(|| {
            for href in &hrefs {
                black_box(normalize_link(&base, href));
            }
        });
    });

    let filter = UrlFilter::new(
        &["https://example.com/docs/*".to_string()],
        &["*.pdf".to_string()],
    )
    .unwrap();

    group.bench_function("filter", |b| {
        b.iter(|| black_box(filter.allows("https://example.com/docs/guide/intro")));
    });

    group.finish();
}

// === INTEGRATION BENCHMARKS (require Chrome) ===

#[cfg(feature = "chrome-integration")]
fn benchmark_real_world_crawl(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("real_world_crawl");
    configure_fast_group(&mut group);

    let service = rt.block_on(async {
        let config = Config {
            worker_pool_size: 2,
            max_concurrent_jobs: 3,
            job_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        CrawlService::with_chrome(config, Arc::new(Metrics::new())).unwrap()
    });

    group.bench_function("single_url", |b| {
        b.iter(|| {
            rt.block_on(async {
                let result = service
                    .crawl("https://example.com", CrawlOptions::default())
                    .await;
                black_box(result.map(|r| r.is_success()).unwrap_or(false));
            })
        });
    });

    group.bench_function("batch_3_urls", |b| {
        b.iter(|| {
            rt.block_on(async {
                let urls = vec![
                    "https://example.com".to_string(),
                    "https://httpbin.org/html".to_string(),
                    "https://www.rust-lang.org".to_string(),
                ];
                let results = service.crawl_batch(urls, CrawlOptions::default()).await;
                let successful = results
                    .map(|results| results.iter().filter(|r| r.is_success()).count())
                    .unwrap_or(0);
                black_box(successful);
            })
        });
    });

    rt.block_on(service.shutdown());
    group.finish();
}

// === BENCHMARK GROUPS ===

criterion_group!(
    unit_benches,
    benchmark_config_creation,
    benchmark_rate_limiter,
    benchmark_gate,
    benchmark_url_handling,
);

#[cfg(feature = "chrome-integration")]
criterion_group!(integration_benches, benchmark_real_world_crawl);

#[cfg(feature = "chrome-integration")]
criterion_main!(unit_benches, integration_benches);

#[cfg(not(feature = "chrome-integration"))]
criterion_main!(unit_benches);
