mod utils;
#[allow(unused)]
use utils::*;

use serde_json::json;
use std::num::NonZeroU32;
use std::time::Duration;
use surge::prelude::*;

#[tokio::test]
async fn ten_iterations_in_one_second() {
    init().await;

    let summary = Scenario::new("ten-per-second", |ctx: VuContext| async move {
        let res = ctx
            .http()
            .post("/transform")
            .json(&json!({
                "country": "US",
                "data": [{"question_id": 301, "answer_id": 501}],
            }))
            .send()
            .await;

        let ok = ctx.check(
            &res,
            &[
                ("status is 200", &|r: &HttpResponse| r.status == 200),
                ("response has data", &|r: &HttpResponse| {
                    r.json::<serde_json::Value>()
                        .map(|body| body["data"].is_array())
                        .unwrap_or(false)
                }),
            ],
        );
        ctx.metrics().rate("errors").add(!ok);
    })
    .base_url(BASE_URL)
    .rate(NonZeroU32::new(10).unwrap())
    .duration(Duration::from_secs(1))
    .pre_allocated_vus(2)
    .max_vus(10)
    .threshold("errors", "rate<0.01")
    .run()
    .await
    .unwrap();

    let iterations = summary.iterations();
    assert!(
        (9..=11).contains(&iterations),
        "expected ~10 iterations, got {iterations}"
    );
    assert_eq!(summary.dropped_iterations(), 0);

    let Some(surge::core::MetricValue::Rate { trues, total }) = summary.snapshot.get("errors")
    else {
        panic!("missing errors rate");
    };
    assert_eq!(*trues, 0);
    assert_eq!(*total, iterations);

    let Some(surge::core::MetricValue::Trend(duration)) =
        summary.snapshot.get("http_req_duration")
    else {
        panic!("missing http_req_duration");
    };
    assert_eq!(duration.count(), iterations);
    assert!(duration.quantile(0.95) > 0.);

    assert!(summary.passed(), "run should pass:\n{summary}");
}

#[tokio::test]
async fn scheduled_count_tracks_rate_times_duration() {
    init().await;

    let summary = Scenario::new("rate-times-duration", |ctx: VuContext| async move {
        ctx.http()
            .post("/transform")
            .json(&json!({"country": "US", "data": []}))
            .send()
            .await;
    })
    .base_url(BASE_URL)
    .rate(NonZeroU32::new(200).unwrap())
    .duration(Duration::from_secs(2))
    .pre_allocated_vus(10)
    .max_vus(50)
    .run()
    .await
    .unwrap();

    // Every scheduled iteration must be accounted for: completed or dropped.
    assert_eq!(summary.iterations() + summary.dropped_iterations(), 400);
    assert_eq!(summary.dropped_iterations(), 0);
    assert!(summary.passed());
}

#[tokio::test]
async fn pool_grows_beyond_pre_allocation_under_latency() {
    init().await;

    let summary = Scenario::new("pool-growth", |ctx: VuContext| async move {
        ctx.http().get("/delay/ms/50").send().await;
    })
    .base_url(BASE_URL)
    .rate(NonZeroU32::new(100).unwrap())
    .duration(Duration::from_secs(1))
    .pre_allocated_vus(2)
    .max_vus(20)
    .run()
    .await
    .unwrap();

    // ~100/s at ~50ms per request needs ~5 concurrent VUs.
    assert!(
        summary.vus_spawned > 2,
        "pool should have grown, spawned {}",
        summary.vus_spawned
    );
    assert!(summary.vus_spawned <= 20);
    assert_eq!(summary.dropped_iterations(), 0);
}

#[tokio::test]
async fn pacing_limits_per_vu_throughput() {
    init().await;

    // One VU with 100ms pacing can serve at most ~10 iterations/s; at a
    // 50/s arrival rate the rest must be dropped, not queued.
    let summary = Scenario::new("pacing", |ctx: VuContext| async move {
        ctx.http()
            .post("/transform")
            .json(&json!({"country": "US", "data": []}))
            .send()
            .await;
    })
    .base_url(BASE_URL)
    .rate(NonZeroU32::new(50).unwrap())
    .duration(Duration::from_secs(1))
    .pre_allocated_vus(1)
    .max_vus(1)
    .pacing(Duration::from_millis(100))
    .graceful_stop(Duration::from_secs(2))
    .run()
    .await
    .unwrap();

    assert!(summary.iterations() <= 12, "pacing should cap throughput");
    assert!(summary.dropped_iterations() > 0);
}
