//! services/api/src/web/sync.rs
//!
//! Admin handlers exposing the mirror's pending-write queue.

use crate::web::rest::{failure, ErrorResponse, HandlerError};
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use classroom_core::ports::record_path;
use classroom_core::PendingWrite;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PendingWritesResponse {
    #[schema(value_type = Vec<Object>)]
    pub writes: Vec<PendingWrite>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub acknowledged: bool,
    /// Writes still queued after the retry.
    pub pending: usize,
}

/// List remote writes that have not been acknowledged yet.
#[utoipa::path(
    get,
    path = "/admin/sync/pending",
    params(
        ("x-reviewer-id" = String, Header, description = "The reviewing admin.")
    ),
    responses(
        (status = 200, description = "Queued writes", body = PendingWritesResponse)
    )
)]
pub async fn pending_writes_handler(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(PendingWritesResponse {
        writes: app_state.mirror.pending(),
    })
}

/// Retry one queued write immediately, ignoring its backoff.
#[utoipa::path(
    post,
    path = "/admin/sync/retry/{collection}/{id}",
    params(
        ("collection" = String, Path, description = "The mirrored collection, e.g. applications."),
        ("id" = String, Path, description = "The record id."),
        ("x-reviewer-id" = String, Header, description = "The reviewing admin.")
    ),
    responses(
        (status = 200, description = "Retry attempted", body = RetryResponse),
        (status = 404, description = "Nothing queued for that record", body = ErrorResponse)
    )
)]
pub async fn retry_write_handler(
    State(app_state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, HandlerError> {
    let path = record_path(&collection, &id);
    let acknowledged = app_state
        .mirror
        .retry(&path)
        .await
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, format!("No pending write for {}", path)))?;
    info!(path = %path, acknowledged, "Manual sync retry");
    Ok(Json(RetryResponse {
        acknowledged,
        pending: app_state.mirror.pending().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::rest::tests::body_json;
    use crate::web::state::test_support::{state_with, test_config};
    use classroom_core::domain::APPLICATIONS;
    use serde_json::json;

    #[tokio::test]
    async fn test_failed_write_can_be_retried_by_hand() {
        let (state, remote) = state_with(test_config());
        remote.set_offline(true);
        state
            .mirror
            .put_record(APPLICATIONS, json!({"id": "app-1", "status": "pending"}))
            .unwrap();
        assert_eq!(state.mirror.flush().await, 0);

        let listed = pending_writes_handler(State(state.clone())).await.into_response();
        let body = body_json(listed).await;
        assert_eq!(body["writes"][0]["collection"], "applications");
        assert_eq!(body["writes"][0]["attempts"], 1);

        remote.set_offline(false);
        let retried = retry_write_handler(
            State(state.clone()),
            Path(("applications".to_string(), "app-1".to_string())),
        )
        .await
        .unwrap()
        .into_response();
        let body = body_json(retried).await;
        assert_eq!(body["acknowledged"], true);
        assert_eq!(body["pending"], 0);

        let missing = retry_write_handler(
            State(state),
            Path(("applications".to_string(), "app-1".to_string())),
        )
        .await;
        assert!(matches!(missing, Err((status, _)) if status == StatusCode::NOT_FOUND));
    }
}
