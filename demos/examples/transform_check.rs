//! Requirement check for the transform service: 5000 req/s for 30s must
//! stay under 3ms at p95 with fewer than 1% failed iterations.
//!
//! Expects the service at `BASE_URL` (default `http://localhost:8080`).

use rand::Rng;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::time::Duration;
use surge::prelude::*;

fn generate_test_data(question_count: usize) -> Value {
    let mut rng = rand::thread_rng();
    let data: Vec<Value> = (0..question_count)
        .map(|_| {
            json!({
                "question_id": rng.gen_range(300..400),
                "answer_id": rng.gen_range(500..600),
            })
        })
        .collect();
    Value::Array(data)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("surge=info")
        .init();

    let base_url =
        std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());

    let summary = Scenario::new("requirement_check", |ctx: VuContext| async move {
        let question_count = rand::thread_rng().gen_range(1..=10);
        let payload = json!({
            "country": "US",
            "data": generate_test_data(question_count),
        });

        let response = ctx.http().post("/transform").json(&payload).send().await;

        let success = ctx.check(
            &response,
            &[
                ("status is 200", &|r: &HttpResponse| r.status == 200),
                ("response has data", &|r: &HttpResponse| {
                    r.json::<Value>()
                        .map(|body| body["data"].is_array())
                        .unwrap_or(false)
                }),
                ("response time < 3ms", &|r: &HttpResponse| {
                    r.duration_ms() < 3.
                }),
            ],
        );
        ctx.metrics().rate("errors").add(!success);
    })
    .base_url(base_url)
    .rate(NonZeroU32::new(5000).unwrap())
    .time_unit(Duration::from_secs(1))
    .duration(Duration::from_secs(30))
    .pre_allocated_vus(100)
    .max_vus(1000)
    .pacing(Duration::from_millis(100))
    .threshold("http_req_duration", "p(95)<3")
    .threshold("errors", "rate<0.01")
    .summary_trend_stats(&[
        TrendStat::Avg,
        TrendStat::Min,
        TrendStat::Med,
        TrendStat::Max,
        TrendStat::Percentile(0.90),
        TrendStat::Percentile(0.95),
    ])
    .run()
    .await
    .expect("scenario configuration is invalid");

    println!("{summary}");

    if !summary.passed() {
        std::process::exit(1);
    }
}
