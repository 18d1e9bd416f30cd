//! Mock target service for surge tests and demos.
//!
//! Serves the `/transform` workload plus delay, malformed, error and
//! rate-limited endpoints for exercising the engine's failure paths.

use axum::{
    debug_handler,
    extract::Path,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::{
    num::NonZeroU32,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};
use tracing::debug;

pub async fn run(addr: SocketAddr) {
    let app = router();
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

pub fn router() -> Router {
    Router::new()
        .route("/transform", post(transform))
        .route("/transform/delay/ms/:delay_ms", post(transform_delayed))
        .route("/limited/:max_tps/transform", post(transform_limited))
        .route("/delay/ms/:delay_ms", get(delay))
        .route("/malformed", post(malformed))
        .route("/error", post(server_error))
}

#[derive(Debug, Deserialize)]
pub struct TransformRequest {
    #[allow(dead_code)]
    pub country: String,
    pub data: Vec<QaEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaEntry {
    pub question_id: i64,
    pub answer_id: i64,
}

#[derive(Debug, Serialize)]
pub struct TransformResponse {
    pub data: Vec<QaEntry>,
}

#[debug_handler]
async fn transform(Json(req): Json<TransformRequest>) -> Json<TransformResponse> {
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);
    Json(TransformResponse { data: req.data })
}

#[debug_handler]
async fn transform_delayed(
    Path(delay_ms): Path<u64>,
    Json(req): Json<TransformRequest>,
) -> Json<TransformResponse> {
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    Json(TransformResponse { data: req.data })
}

lazy_static! {
    static ref LIMITER_MAP: Arc<RwLock<HashMap<u32, Arc<DefaultDirectRateLimiter>>>> =
        Arc::new(RwLock::new(HashMap::new()));
}

#[debug_handler]
async fn transform_limited(
    Path(max_tps): Path<u32>,
    Json(req): Json<TransformRequest>,
) -> Result<Json<TransformResponse>, StatusCode> {
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);

    let limiter = LIMITER_MAP.read().unwrap().get(&max_tps).cloned();
    let limiter = match limiter {
        Some(limiter) => limiter,
        None => {
            let limiter = Arc::new(rate_limiter(max_tps));
            LIMITER_MAP
                .write()
                .unwrap()
                .insert(max_tps, limiter.clone());
            limiter
        }
    };

    match limiter.check() {
        Ok(_) => Ok(Json(TransformResponse { data: req.data })),
        Err(_) => {
            debug!("rate limit exceeded");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[debug_handler]
async fn delay(Path(delay_ms): Path<u64>) {
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
}

/// 200 with a body that is not valid JSON.
#[debug_handler]
async fn malformed() -> impl IntoResponse {
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        "data: not json {",
    )
}

#[debug_handler]
async fn server_error() -> StatusCode {
    TPS_MEASURE.fetch_add(1, Ordering::Relaxed);
    StatusCode::INTERNAL_SERVER_ERROR
}

/** Utils **/

pub fn rate_limiter(tps: u32) -> DefaultDirectRateLimiter {
    RateLimiter::direct(Quota::per_second(NonZeroU32::new(tps.max(1)).unwrap()))
}

/** TPS Printer **/

static TPS_MEASURE: AtomicU64 = AtomicU64::new(0);

pub async fn tps_measure_task() {
    loop {
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let transactions = TPS_MEASURE.fetch_min(0, Ordering::Relaxed);
        println!("{transactions} TPS");
    }
}
