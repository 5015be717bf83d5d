//! Read-only failover query API.
//!
//! Three GET endpoints over [`FailoverService`]: active failovers, per-tunnel
//! history, and a per-group summary. Mutation happens only through event
//! ingestion on the node uplink, never through HTTP.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use serde::Deserialize;

use crate::failover::FailoverService;

#[derive(Clone)]
struct ApiState {
    failover: Arc<FailoverService>,
}

/// Query parameters for the history endpoint.
#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// Build the failover query router.
pub fn failover_routes(failover: Arc<FailoverService>) -> Router {
    let state = ApiState { failover };
    Router::new()
        .route("/failover/active", get(handle_active))
        .route("/failover/history/:tunnel_id", get(handle_history))
        .route("/failover/groups/:group_id/summary", get(handle_summary))
        .with_state(state)
}

async fn handle_active(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.failover.active_failovers())
}

async fn handle_history(
    State(state): State<ApiState>,
    Path(tunnel_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    match state.failover.history(&tunnel_id, q.limit).await {
        Ok(events) => (StatusCode::OK, Json(serde_json::json!(events))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn handle_summary(
    State(state): State<ApiState>,
    Path(group_id): Path<String>,
) -> impl IntoResponse {
    match state.failover.group_summary(&group_id).await {
        Ok(summary) => (StatusCode::OK, Json(serde_json::json!(summary))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::MemoryEventStore;
    use crate::protocol::{FailoverEventReport, FailoverEventType};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn service_with_one_failover() -> Arc<FailoverService> {
        let svc = FailoverService::new(Arc::new(MemoryEventStore::new()))
            .await
            .unwrap();
        svc.handle_event(FailoverEventReport {
            node_id: "n1".into(),
            tunnel_id: "t1".into(),
            event_type: FailoverEventType::Failover,
            from_group_id: Some("g-primary".into()),
            to_group_id: Some("g-backup".into()),
            reason: "all targets unhealthy".into(),
            failure_duration_secs: 31,
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
        })
        .await
        .unwrap();
        Arc::new(svc)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn active_endpoint_lists_failovers() {
        let router = failover_routes(service_with_one_failover().await);
        let (status, body) = get_json(router, "/failover/active").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["tunnel_id"], "t1");
    }

    #[tokio::test]
    async fn history_endpoint_honors_limit() {
        let router = failover_routes(service_with_one_failover().await);
        let (status, body) = get_json(router, "/failover/history/t1?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let router = failover_routes(service_with_one_failover().await);
        let (_, empty) = get_json(router, "/failover/history/unknown").await;
        assert_eq!(empty.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn summary_endpoint_reports_group_state() {
        let router = failover_routes(service_with_one_failover().await);
        let (status, body) = get_json(router, "/failover/groups/g-backup/summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_failovers"], 1);
        assert_eq!(body["events_24h"], 1);
    }
}
