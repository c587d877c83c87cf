use crate::server::ApiState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/guardian/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<ApiState>>) -> Json<serde_json::Value> {
    let snapshot = state.ctx.latest_snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "monitored_host": state.host,
        "last_collected_at": snapshot.map(|s| s.collected_at),
        "approval_pending": state.ctx.broker().outstanding().is_some(),
    }))
}
