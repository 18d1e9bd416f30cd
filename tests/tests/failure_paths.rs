mod utils;
#[allow(unused)]
use utils::*;

use serde_json::json;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use surge::prelude::*;

#[tokio::test]
async fn saturated_pool_drops_instead_of_blocking() {
    init().await;

    let started = Instant::now();
    let summary = Scenario::new("saturated", |ctx: VuContext| async move {
        ctx.http().get("/delay/ms/500").send().await;
    })
    .base_url(BASE_URL)
    .rate(NonZeroU32::new(500).unwrap())
    .duration(Duration::from_secs(1))
    .pre_allocated_vus(1)
    .max_vus(1)
    .graceful_stop(Duration::from_secs(2))
    .run()
    .await
    .unwrap();

    // The single VU is busy for 500ms at a time; nearly every arrival in
    // between must be dropped and the schedule must never stall behind it.
    assert!(summary.dropped_iterations() > 400);
    assert!(summary.iterations() <= 3);
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "scheduler blocked past the run duration"
    );
}

#[tokio::test]
async fn malformed_response_fails_checks_not_the_run() {
    init().await;

    let summary = Scenario::new("malformed", |ctx: VuContext| async move {
        let res = ctx.http().post("/malformed").body(Vec::new()).send().await;

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
    .rate(NonZeroU32::new(20).unwrap())
    .duration(Duration::from_millis(500))
    .max_vus(5)
    .threshold("errors", "rate<0.01")
    .run()
    .await
    .unwrap();

    assert!(summary.iterations() > 0, "run should survive parse failures");

    let Some(surge::core::MetricValue::Rate { trues, total }) = summary.snapshot.get("errors")
    else {
        panic!("missing errors rate");
    };
    assert_eq!(*trues, *total, "every iteration should fail its checks");
    assert!(!summary.passed(), "errors threshold should fail the run");
}

#[tokio::test]
async fn transport_errors_are_absorbed() {
    init().await;

    // Nothing listens on this port.
    let summary = Scenario::new("transport-errors", |ctx: VuContext| async move {
        let res = ctx
            .http()
            .post("/transform")
            .json(&json!({"country": "US", "data": []}))
            .send()
            .await;
        ctx.metrics().rate("errors").add(res.failed());
    })
    .base_url("http://127.0.0.1:9")
    .rate(NonZeroU32::new(20).unwrap())
    .duration(Duration::from_millis(500))
    .max_vus(5)
    .run()
    .await
    .unwrap();

    assert!(summary.iterations() > 0, "run should survive transport errors");

    let Some(surge::core::MetricValue::Rate { trues, total }) =
        summary.snapshot.get("http_req_failed")
    else {
        panic!("missing http_req_failed rate");
    };
    assert!(*total > 0);
    assert_eq!(*trues, *total, "every request should be a transport failure");
}

#[tokio::test]
async fn abort_on_fail_stops_the_run_early() {
    init().await;

    let started = Instant::now();
    let summary = Scenario::new("abort-on-fail", |ctx: VuContext| async move {
        let res = ctx.http().post("/error").body(Vec::new()).send().await;
        ctx.metrics().rate("errors").add(res.failed());
    })
    .base_url(BASE_URL)
    .rate(NonZeroU32::new(50).unwrap())
    .duration(Duration::from_secs(30))
    .max_vus(10)
    .threshold_abort("errors", "rate<0.5")
    .run()
    .await
    .unwrap();

    assert!(
        started.elapsed() < Duration::from_secs(10),
        "abort-on-fail should cut the 30s schedule short"
    );
    assert!(!summary.passed());
    assert!(summary.iterations() > 0);
}

#[tokio::test]
async fn unrecorded_threshold_metrics_pass_vacuously() {
    init().await;

    let summary = Scenario::new("vacuous", |ctx: VuContext| async move {
        ctx.http()
            .post("/transform")
            .json(&json!({"country": "US", "data": []}))
            .send()
            .await;
    })
    .base_url(BASE_URL)
    .rate(NonZeroU32::new(10).unwrap())
    .duration(Duration::from_millis(300))
    .max_vus(5)
    // Declared but never recorded: the body never touches `errors`.
    .threshold("errors", "rate<0.01")
    .run()
    .await
    .unwrap();

    assert!(summary.passed(), "no data must mean no violation:\n{summary}");
}
