use crate::metrics::MetricsSnapshot;
use crate::server::ApiState;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/guardian/status", get(get_status))
        .route("/api/v1/guardian/check", post(post_check))
}

/// Latest snapshot, or `null` before the first cycle.
#[tracing::instrument(level = "debug", skip_all)]
async fn get_status(Extension(state): Extension<Arc<ApiState>>) -> Json<Option<MetricsSnapshot>> {
    Json(state.ctx.latest_snapshot())
}

#[tracing::instrument(level = "info", skip_all)]
async fn post_check(
    Extension(state): Extension<Arc<ApiState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    state.ctx.request_manual_check();
    tracing::info!("manual check requested over http");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": true })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalBroker;
    use crate::context::GuardianContext;

    fn state() -> Arc<ApiState> {
        Arc::new(ApiState {
            ctx: Arc::new(GuardianContext::new(Arc::new(ApprovalBroker::new()))),
            started_at: std::time::Instant::now(),
            host: "local".to_string(),
        })
    }

    #[tokio::test]
    async fn status_is_null_before_first_cycle() {
        let Json(body) = get_status(Extension(state())).await;
        assert!(body.is_none());
    }

    #[tokio::test]
    async fn check_is_accepted_and_sets_trigger() {
        let state = state();
        let (status, _) = post_check(Extension(state.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(state.ctx.take_manual_trigger());
    }
}
