//! Control endpoints mounted by every rate-limited service.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::TokenBucket;

#[derive(Debug, Deserialize)]
struct RefreshRate {
    rate: f64,
}

/// A router exposing the shared bucket: liveness plus runtime rate updates.
pub fn control_router(bucket: Arc<TokenBucket>) -> Router {
    Router::new()
        .route("/heart-beat", get(heart_beat))
        .route("/token-bucket-refresh-rate", post(refresh_rate))
        .with_state(bucket)
}

async fn heart_beat() -> &'static str {
    "OK"
}

async fn refresh_rate(
    State(bucket): State<Arc<TokenBucket>>,
    Json(body): Json<RefreshRate>,
) -> StatusCode {
    if !body.rate.is_finite() || body.rate < 0.0 {
        return StatusCode::UNPROCESSABLE_ENTITY;
    }
    bucket.set_rate(body.rate);
    StatusCode::OK
}
