//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the applicant-facing REST endpoints, the
//! shared error body, and the master definition for the OpenAPI specification.

use crate::web::auth::hash_password;
use crate::web::review;
use crate::web::state::AppState;
use crate::web::sync;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use classroom_core::validation::find_duplicates;
use classroom_core::{
    ApplicationEvent, ApplicationPayload, ApplicationStatus, FieldIssue, LifecycleError,
    LookupCriteria, RegistrationApplication, TrackingView, ValidationErrors,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        submit_application_handler,
        tracking_handler,
        update_fields_handler,
        resubmit_handler,
        lookup_handler,
        review::list_applications_handler,
        review::get_application_handler,
        review::verify_field_handler,
        review::request_corrections_handler,
        review::set_status_handler,
        review::delete_application_handler,
        sync::pending_writes_handler,
        sync::retry_write_handler,
    ),
    components(
        schemas(
            ErrorResponse,
            SubmitApplicationRequest,
            UpdateFieldsRequest,
            LookupRequest,
            ApplicationReceipt,
            TrackingResponse,
            ApplicationSummary,
            review::VerifyFieldRequest,
            review::CorrectionsRequest,
            review::SetStatusRequest,
            review::ApplicationEnvelope,
            review::ApplicationDetail,
            review::ApplicationListResponse,
            sync::PendingWritesResponse,
            sync::RetryResponse,
        )
    ),
    tags(
        (name = "Class Portal API", description = "Student registration, review and tracking endpoints.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// Shared Error Body
//=========================================================================================

/// The body of every failed request. `fields` is present for validation failures.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, String>>,
}

pub type HandlerError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn failure(status: StatusCode, message: impl Into<String>) -> HandlerError {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
            fields: None,
        }),
    )
}

pub(crate) fn validation_failure(errors: ValidationErrors) -> HandlerError {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(ErrorResponse {
            message: errors.to_string(),
            fields: Some(errors.0),
        }),
    )
}

pub(crate) fn lifecycle_failure(e: LifecycleError) -> HandlerError {
    match e {
        LifecycleError::NotFound(_) => failure(StatusCode::NOT_FOUND, e.to_string()),
        LifecycleError::IllegalTransition { .. } => failure(StatusCode::CONFLICT, e.to_string()),
        LifecycleError::InvalidPayload(_) => failure(StatusCode::BAD_REQUEST, e.to_string()),
        LifecycleError::Port(port) => {
            error!("Application store failure: {:?}", port);
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store the application")
        }
    }
}

pub(crate) fn not_found(id: &str) -> HandlerError {
    lifecycle_failure(LifecycleError::NotFound(id.to_string()))
}

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

/// A registration form plus the applicant's chosen password.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitApplicationRequest {
    /// Form fields named as in stored applications (camelCase).
    #[schema(value_type = Object)]
    pub application: Map<String, Value>,
    pub password: String,
}

/// A narrow correction to an application under review.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFieldsRequest {
    #[schema(value_type = Object)]
    pub changes: Map<String, Value>,
    /// Replaces the stored password when present.
    pub password: Option<String>,
}

/// What an applicant gets back after submitting or editing.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationReceipt {
    pub id: String,
    #[schema(value_type = String)]
    pub status: ApplicationStatus,
    pub attempt_number: u32,
    pub submitted_at: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub tracking: TrackingView,
}

impl From<&RegistrationApplication> for ApplicationReceipt {
    fn from(app: &RegistrationApplication) -> Self {
        Self {
            id: app.id.clone(),
            status: app.status,
            attempt_number: app.attempt_number,
            submitted_at: app.submitted_at,
            tracking: classroom_core::tracking_view(app),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackingResponse {
    #[schema(value_type = Object)]
    pub tracking: TrackingView,
    /// Fields a reviewer flagged, with the reason.
    #[schema(value_type = Vec<Object>)]
    pub issues: Vec<FieldIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub can_resubmit: bool,
}

/// Lookup criteria; every field is optional and matched case-insensitively.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LookupRequest {
    pub student_id: Option<String>,
    pub section: Option<String>,
    pub school: Option<String>,
    pub college: Option<String>,
    pub program: Option<String>,
    pub major: Option<String>,
}

impl From<LookupRequest> for LookupCriteria {
    fn from(req: LookupRequest) -> Self {
        Self {
            student_id: req.student_id,
            section: req.section,
            school: req.school,
            college: req.college,
            program: req.program,
            major: req.major,
        }
    }
}

/// A public lookup hit. Carries no contact details.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSummary {
    pub id: String,
    pub full_name: String,
    pub student_id: String,
    pub section: String,
    pub submitted_at: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub tracking: TrackingView,
}

//=========================================================================================
// Request Helpers
//=========================================================================================

/// Validates a form and its password, then checks for open duplicates.
/// Returns the payload still lacking its password hash.
async fn checked_payload(
    state: &AppState,
    form: Map<String, Value>,
    password: &str,
    exclude_id: Option<&str>,
) -> Result<ApplicationPayload, HandlerError> {
    let mut fields = form;
    fields.insert("passwordHash".to_string(), Value::String(String::new()));
    let payload: ApplicationPayload = serde_json::from_value(Value::Object(fields))
        .map_err(|e| failure(StatusCode::BAD_REQUEST, format!("Malformed application: {}", e)))?;

    let mut errors = ValidationErrors::default();
    if let Err(e) = state.validator.validate(&payload) {
        errors.merge(e);
    }
    if let Err(e) = state.validator.validate_password(password) {
        errors.merge(e);
    }
    if errors.is_empty() {
        errors.merge(
            find_duplicates(
                state.mirror.remote().as_ref(),
                state.mirror.local(),
                &payload.student_id,
                &payload.university_email,
                exclude_id,
            )
            .await,
        );
    }
    errors.into_result().map_err(validation_failure)?;
    Ok(payload)
}

fn hashed(password: &str) -> Result<String, HandlerError> {
    hash_password(password).map_err(|e| {
        error!("Failed to hash password: {:?}", e);
        failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to hash password")
    })
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Submit a new registration application.
#[utoipa::path(
    post,
    path = "/applications",
    request_body = SubmitApplicationRequest,
    responses(
        (status = 201, description = "Application recorded as pending", body = ApplicationReceipt),
        (status = 400, description = "Malformed form", body = ErrorResponse),
        (status = 422, description = "Validation failed or an open application already exists", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn submit_application_handler(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<SubmitApplicationRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let mut payload = checked_payload(&app_state, req.application, &req.password, None).await?;
    payload.password_hash = hashed(&req.password)?;

    let app = app_state.manager.submit(payload).map_err(lifecycle_failure)?;
    Ok((StatusCode::CREATED, Json(ApplicationReceipt::from(&app))))
}

/// Get the tracking view of an application.
#[utoipa::path(
    get,
    path = "/applications/{id}/tracking",
    responses(
        (status = 200, description = "Current progress", body = TrackingResponse),
        (status = 404, description = "Unknown application", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "The application id.")
    )
)]
pub async fn tracking_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let app = app_state.manager.find(&id).ok_or_else(|| not_found(&id))?;
    let max_attempts = app_state.max_attempts();
    let response = TrackingResponse {
        tracking: classroom_core::tracking_view(&app),
        issues: app_state.manager.unresolved_issues(&id),
        rejection_reason: app.rejection_reason.clone(),
        attempt_number: app.attempt_number,
        max_attempts,
        can_resubmit: app.status == ApplicationStatus::Rejected && app.attempt_number < max_attempts,
    };
    Ok(Json(response))
}

/// Correct individual fields of an application under review.
///
/// Every corrected field loses its verification and the application returns
/// to `pending`.
#[utoipa::path(
    patch,
    path = "/applications/{id}/fields",
    request_body = UpdateFieldsRequest,
    responses(
        (status = 200, description = "Fields updated", body = ApplicationReceipt),
        (status = 404, description = "Unknown application", body = ErrorResponse),
        (status = 409, description = "Application is no longer under review", body = ErrorResponse),
        (status = 422, description = "Validation failed", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "The application id.")
    )
)]
pub async fn update_fields_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateFieldsRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let mut changes = req.changes;
    let mut errors = ValidationErrors::default();
    if changes.contains_key("passwordHash") {
        errors.add("passwordHash", "Send a new password instead");
    }
    if let Err(e) = app_state.validator.validate_changes(&changes) {
        errors.merge(e);
    }
    if let Some(password) = req.password.as_deref() {
        if let Err(e) = app_state.validator.validate_password(password) {
            errors.merge(e);
        }
    }
    errors.into_result().map_err(validation_failure)?;

    let current = app_state.manager.find(&id).ok_or_else(|| not_found(&id))?;
    let student_id = changes.get("studentId").and_then(Value::as_str);
    let email = changes.get("universityEmail").and_then(Value::as_str);
    if student_id.is_some() || email.is_some() {
        find_duplicates(
            app_state.mirror.remote().as_ref(),
            app_state.mirror.local(),
            student_id.unwrap_or(""),
            email.unwrap_or(""),
            Some(&id),
        )
        .await
        .into_result()
        .map_err(validation_failure)?;
    }

    if let Some(password) = req.password.as_deref() {
        changes.insert("passwordHash".to_string(), Value::String(hashed(password)?));
    }

    let app = app_state
        .manager
        .update_fields(&current.id, changes)
        .map_err(lifecycle_failure)?;
    Ok(Json(ApplicationReceipt::from(&app)))
}

/// Resubmit a rejected application with fresh data.
#[utoipa::path(
    post,
    path = "/applications/{id}/resubmit",
    request_body = SubmitApplicationRequest,
    responses(
        (status = 200, description = "Application back in the review queue", body = ApplicationReceipt),
        (status = 404, description = "Unknown application", body = ErrorResponse),
        (status = 409, description = "Not rejected, or the attempt limit is reached", body = ErrorResponse),
        (status = 422, description = "Validation failed", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "The application id.")
    )
)]
pub async fn resubmit_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SubmitApplicationRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let current = app_state.manager.find(&id).ok_or_else(|| not_found(&id))?;
    if current.status.apply(ApplicationEvent::Resubmit).is_none() {
        return Err(lifecycle_failure(LifecycleError::IllegalTransition {
            from: current.status,
            event: ApplicationEvent::Resubmit,
        }));
    }

    let max_attempts = app_state.max_attempts();
    if current.attempt_number >= max_attempts {
        info!(application_id = %id, attempts = current.attempt_number, "Resubmission refused at attempt limit");
        return Err(failure(
            StatusCode::CONFLICT,
            format!("Maximum of {} attempts reached", max_attempts),
        ));
    }

    let mut payload = checked_payload(&app_state, req.application, &req.password, Some(&id)).await?;
    payload.password_hash = hashed(&req.password)?;

    let app = app_state
        .manager
        .resubmit(&id, payload, current.attempt_number + 1)
        .map_err(lifecycle_failure)?;
    Ok(Json(ApplicationReceipt::from(&app)))
}

/// Find applications by student id and academic placement.
///
/// Criteria match case-insensitively; at least one must be given.
#[utoipa::path(
    post,
    path = "/applications/lookup",
    request_body = LookupRequest,
    responses(
        (status = 200, description = "Matching applications", body = Vec<ApplicationSummary>),
        (status = 422, description = "No criteria given", body = ErrorResponse)
    )
)]
pub async fn lookup_handler(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<LookupRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let criteria = LookupCriteria::from(req);
    let given = [
        &criteria.student_id,
        &criteria.section,
        &criteria.school,
        &criteria.college,
        &criteria.program,
        &criteria.major,
    ]
    .iter()
    .any(|c| c.as_deref().is_some_and(|v| !v.trim().is_empty()));
    if !given {
        let mut errors = ValidationErrors::default();
        errors.add("studentId", "Enter at least one search criterion");
        return Err(validation_failure(errors));
    }

    let hits: Vec<ApplicationSummary> = app_state
        .manager
        .lookup(&criteria)
        .iter()
        .map(|app| ApplicationSummary {
            id: app.id.clone(),
            full_name: app.payload.full_name(),
            student_id: app.payload.student_id.clone(),
            section: app.payload.section.clone(),
            submitted_at: app.submitted_at,
            tracking: classroom_core::tracking_view(app),
        })
        .collect();
    Ok(Json(hits))
}
