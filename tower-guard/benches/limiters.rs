use std::hint::black_box;
use std::num::NonZeroU32;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

use criterion::BenchmarkGroup;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::measurement::WallTime;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use governor::Quota;
use governor::RateLimiter;
use http::Request;
use http::Response;
use shot_guard::CircuitBreaker;
use shot_guard::LeakyBucket;
use shot_guard::Semaphore;
use shot_guard::SlidingWindow;
use shot_guard::TokenBucket;
use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tower::limit::RateLimitLayer as TowerNativeRateLimit;
use tower::service_fn;
use tower::util::BoxCloneSyncService;
use tower_guard::CircuitBreakerLayer;
use tower_guard::RateLimitLayer;

type BenchService = BoxCloneSyncService<Request<String>, Response<String>, BoxError>;

async fn noop_handler(_req: Request<String>) -> Result<Response<String>, BoxError> {
    Ok(Response::new("ok".to_string()))
}

/// Single-call overhead
fn bench_overhead(
    group: &mut BenchmarkGroup<WallTime>,
    rt: &tokio::runtime::Runtime,
    id: &str,
    svc: BenchService,
) {
    group.bench_function(id, |b| {
        b.to_async(rt).iter(|| {
            let mut s = svc.clone();
            async move {
                let req = Request::builder().body("test".to_string()).unwrap();
                let res = s.ready().await.unwrap().call(req).await;
                black_box(res)
            }
        });
    });
}

/// Burst of concurrent callers sharing one limiter
fn bench_burst(
    group: &mut BenchmarkGroup<WallTime>,
    rt: &tokio::runtime::Runtime,
    id: &str,
    svc: BenchService,
    burst_size: usize,
) {
    group.bench_function(id, |b| {
        b.to_async(rt).iter(|| {
            let s = svc.clone();
            async move {
                let mut futures = FuturesUnordered::new();
                for _ in 0..burst_size {
                    let mut local_svc = s.clone();
                    futures.push(async move {
                        let req = Request::builder().body("test".to_string()).unwrap();
                        local_svc.ready().await.unwrap().call(req).await
                    });
                }
                while let Some(res) = futures.next().await {
                    let _ = black_box(res);
                }
            }
        });
    });
}

fn guarded<L>(limiter: Arc<L>) -> BenchService
where
    L: shot_guard::Admission + 'static,
{
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(RateLimitLayer::new(limiter))
            .service(service_fn(noop_handler)),
    )
}

fn bench_all_scenarios(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(8)
        .enable_all()
        .build()
        .unwrap();
    // Tower's RateLimit needs the runtime context to find the reactor
    let _guard = rt.enter();

    let limit_u = 100_000u64;
    let limit = NonZeroU64::new(limit_u).unwrap();
    let period = Duration::from_millis(1);
    let burst_size = 1000;

    // Huge capacities, so the benches measure the bookkeeping rather than sleeping
    let huge = NonZeroU64::new(100_000_000).unwrap();
    let bucket = Arc::new(TokenBucket::new(limit_u as f64 * 1_000.0, huge).unwrap());
    let leaky = Arc::new(LeakyBucket::new(limit_u as f64 * 1_000.0, huge).unwrap());
    let sliding = Arc::new(SlidingWindow::new(limit, period).unwrap());
    let semaphore = Arc::new(Semaphore::new(u64::MAX / 2));
    let breaker = Arc::new(CircuitBreaker::default());
    let governor = Arc::new(RateLimiter::direct(Quota::per_second(
        NonZeroU32::new((limit_u * 1_000) as u32).unwrap(),
    )));

    let scenarios: Vec<(&str, BenchService)> = vec![
        (
            "tower_native",
            BoxCloneSyncService::new(
                ServiceBuilder::new()
                    .buffer(1_024)
                    .layer(TowerNativeRateLimit::new(limit_u, period))
                    .service(service_fn(noop_handler)),
            ),
        ),
        ("guard_bucket", guarded(bucket)),
        ("guard_leaky", guarded(leaky)),
        ("guard_sliding", guarded(sliding)),
        (
            "guard_semaphore_in_flight",
            BoxCloneSyncService::new(
                ServiceBuilder::new()
                    .layer(RateLimitLayer::new(semaphore).with_release_on_completion(true))
                    .service(service_fn(noop_handler)),
            ),
        ),
        (
            "guard_breaker",
            BoxCloneSyncService::new(
                ServiceBuilder::new()
                    .layer(CircuitBreakerLayer::new(breaker))
                    .service(service_fn(noop_handler)),
            ),
        ),
        (
            "governor",
            BoxCloneSyncService::new(service_fn(move |req| {
                let limiter = governor.clone();
                async move {
                    if limiter.check().is_ok() {
                        noop_handler(req).await
                    } else {
                        Err("Rate limited".into())
                    }
                }
            })),
        ),
    ];

    let mut overhead_group = c.benchmark_group("Middleware Overhead");
    for (id, svc) in &scenarios {
        bench_overhead(&mut overhead_group, &rt, id, svc.clone());
    }
    overhead_group.finish();

    let mut contention_group = c.benchmark_group("High Contention (1000 Tasks)");
    for (id, svc) in &scenarios {
        bench_burst(&mut contention_group, &rt, id, svc.clone(), burst_size);
    }
    contention_group.finish();
}

criterion_group!(benches, bench_all_scenarios);
criterion_main!(benches);
