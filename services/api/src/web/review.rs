//! services/api/src/web/review.rs
//!
//! Admin handlers for reviewing registration applications. Every route here
//! sits behind `require_reviewer`, which supplies the `ReviewerId`.

use crate::web::rest::{failure, lifecycle_failure, not_found, ErrorResponse, HandlerError};
use crate::web::state::{AppState, ReviewerId};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use classroom_core::{ApplicationStatus, FieldIssue, RegistrationApplication};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListQuery {
    /// One of pending, verifying, approved or rejected.
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyFieldRequest {
    pub field: String,
    pub verified: bool,
    /// Why the field needs correction; only meaningful when `verified` is false.
    pub issue: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionsRequest {
    #[schema(value_type = Vec<Object>)]
    pub issues: Vec<FieldIssue>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetStatusRequest {
    pub status: String,
    pub notes: Option<String>,
    pub rejection_reason: Option<String>,
}

/// A full application as reviewers see it. The password hash is blanked.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationEnvelope {
    #[schema(value_type = Object)]
    pub application: RegistrationApplication,
}

impl ApplicationEnvelope {
    pub fn new(application: RegistrationApplication) -> Self {
        Self {
            application: redacted(application),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDetail {
    #[schema(value_type = Object)]
    pub application: RegistrationApplication,
    #[schema(value_type = Vec<Object>)]
    pub unresolved_issues: Vec<FieldIssue>,
    pub all_required_fields_verified: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationListResponse {
    pub total: usize,
    #[schema(value_type = Vec<Object>)]
    pub applications: Vec<RegistrationApplication>,
}

fn redacted(mut app: RegistrationApplication) -> RegistrationApplication {
    app.payload.password_hash.clear();
    app
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// List applications, newest first, optionally filtered by status.
#[utoipa::path(
    get,
    path = "/admin/applications",
    params(
        ListQuery,
        ("x-reviewer-id" = String, Header, description = "The reviewing admin.")
    ),
    responses(
        (status = 200, description = "Applications", body = ApplicationListResponse),
        (status = 400, description = "Unknown status", body = ErrorResponse),
        (status = 401, description = "Missing reviewer identity")
    )
)]
pub async fn list_applications_handler(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, HandlerError> {
    let applications = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => {
            let status: ApplicationStatus = raw
                .parse()
                .map_err(|e: String| failure(StatusCode::BAD_REQUEST, e))?;
            app_state.manager.by_status(status)
        }
        None => app_state.manager.list(),
    };
    let applications: Vec<RegistrationApplication> = applications.into_iter().map(redacted).collect();
    Ok(Json(ApplicationListResponse {
        total: applications.len(),
        applications,
    }))
}

/// Get one application with its open issues and verification progress.
#[utoipa::path(
    get,
    path = "/admin/applications/{id}",
    params(
        ("id" = String, Path, description = "The application id."),
        ("x-reviewer-id" = String, Header, description = "The reviewing admin.")
    ),
    responses(
        (status = 200, description = "The application", body = ApplicationDetail),
        (status = 404, description = "Unknown application", body = ErrorResponse)
    )
)]
pub async fn get_application_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let application = app_state.manager.find(&id).ok_or_else(|| not_found(&id))?;
    Ok(Json(ApplicationDetail {
        application: redacted(application),
        unresolved_issues: app_state.manager.unresolved_issues(&id),
        all_required_fields_verified: app_state.manager.all_required_fields_verified(&id),
    }))
}

/// Record a judgment on one field.
#[utoipa::path(
    post,
    path = "/admin/applications/{id}/verifications",
    request_body = VerifyFieldRequest,
    params(
        ("id" = String, Path, description = "The application id."),
        ("x-reviewer-id" = String, Header, description = "The reviewing admin.")
    ),
    responses(
        (status = 200, description = "Verification recorded", body = ApplicationEnvelope),
        (status = 400, description = "Unknown field", body = ErrorResponse),
        (status = 404, description = "Unknown application", body = ErrorResponse),
        (status = 409, description = "Application already approved", body = ErrorResponse)
    )
)]
pub async fn verify_field_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(ReviewerId(reviewer)): Extension<ReviewerId>,
    Path(id): Path<String>,
    Json(req): Json<VerifyFieldRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let app = app_state
        .manager
        .verify_field(&id, &req.field, req.verified, &reviewer, req.issue)
        .map_err(lifecycle_failure)?;
    Ok(Json(ApplicationEnvelope::new(app)))
}

/// Flag several fields for correction and move the application to verifying.
#[utoipa::path(
    post,
    path = "/admin/applications/{id}/corrections",
    request_body = CorrectionsRequest,
    params(
        ("id" = String, Path, description = "The application id."),
        ("x-reviewer-id" = String, Header, description = "The reviewing admin.")
    ),
    responses(
        (status = 200, description = "Corrections requested", body = ApplicationEnvelope),
        (status = 400, description = "No issues, or an unknown field", body = ErrorResponse),
        (status = 404, description = "Unknown application", body = ErrorResponse),
        (status = 409, description = "Application already decided", body = ErrorResponse)
    )
)]
pub async fn request_corrections_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(ReviewerId(reviewer)): Extension<ReviewerId>,
    Path(id): Path<String>,
    Json(req): Json<CorrectionsRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let app = app_state
        .manager
        .request_corrections(&id, req.issues, &reviewer)
        .map_err(lifecycle_failure)?;
    Ok(Json(ApplicationEnvelope::new(app)))
}

/// Decide an application. Approval registers the student's account.
#[utoipa::path(
    post,
    path = "/admin/applications/{id}/status",
    request_body = SetStatusRequest,
    params(
        ("id" = String, Path, description = "The application id."),
        ("x-reviewer-id" = String, Header, description = "The reviewing admin.")
    ),
    responses(
        (status = 200, description = "Status changed", body = ApplicationEnvelope),
        (status = 400, description = "Unknown status", body = ErrorResponse),
        (status = 404, description = "Unknown application", body = ErrorResponse)
    )
)]
pub async fn set_status_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(ReviewerId(reviewer)): Extension<ReviewerId>,
    Path(id): Path<String>,
    Json(req): Json<SetStatusRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let status: ApplicationStatus = req
        .status
        .parse()
        .map_err(|e: String| failure(StatusCode::BAD_REQUEST, e))?;
    let notes = req.notes.filter(|n| !n.trim().is_empty());
    let reason = req.rejection_reason.filter(|r| !r.trim().is_empty());
    let app = app_state
        .manager
        .set_status(&id, status, &reviewer, notes, reason)
        .map_err(lifecycle_failure)?;
    Ok(Json(ApplicationEnvelope::new(app)))
}

/// Delete an application locally and remotely.
#[utoipa::path(
    delete,
    path = "/admin/applications/{id}",
    params(
        ("id" = String, Path, description = "The application id."),
        ("x-reviewer-id" = String, Header, description = "The reviewing admin.")
    ),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Unknown application", body = ErrorResponse)
    )
)]
pub async fn delete_application_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(ReviewerId(reviewer)): Extension<ReviewerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let existed = app_state.manager.delete(&id, &reviewer).map_err(lifecycle_failure)?;
    if !existed {
        return Err(not_found(&id));
    }
    Ok(StatusCode::NO_CONTENT)
}
