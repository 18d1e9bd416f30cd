//! Self-contained demo: starts the mock transform service in-process and
//! drives it at a modest constant arrival rate.

use serde_json::json;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;
use surge::prelude::*;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("surge=info,mock_service=info")
        .init();

    let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    tokio::spawn(async move { mock_service::run(addr).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let summary = Scenario::new("constant_rate_demo", |ctx: VuContext| async move {
        let response = ctx
            .http()
            .post("/transform")
            .json(&json!({
                "country": "US",
                "data": [{"question_id": 301, "answer_id": 501}],
            }))
            .send()
            .await;

        let success = ctx.check(
            &response,
            &[("status is 200", &|r: &HttpResponse| r.status == 200)],
        );
        ctx.metrics().rate("errors").add(!success);
    })
    .base_url("http://127.0.0.1:8080")
    .rate(NonZeroU32::new(50).unwrap())
    .duration(Duration::from_secs(5))
    .pre_allocated_vus(5)
    .max_vus(25)
    .threshold("http_req_duration", "p(95)<100")
    .threshold("errors", "rate<0.01")
    .run()
    .await
    .expect("scenario configuration is invalid");

    println!("{summary}");

    if !summary.passed() {
        std::process::exit(1);
    }
}
