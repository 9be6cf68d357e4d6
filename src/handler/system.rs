use axum::{Json, Router, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::manager;

pub fn system_router() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
}

#[derive(Serialize)]
struct SystemStatus {
    active_sessions: usize,
    timestamp: DateTime<Utc>,
}

async fn index() -> &'static str {
    "system route!"
}

/// Liveness surface: the active session count and a timestamp are the only
/// externally observable aggregate state.
async fn status() -> Json<SystemStatus> {
    Json(SystemStatus {
        active_sessions: manager::active_count().await,
        timestamp: Utc::now(),
    })
}
