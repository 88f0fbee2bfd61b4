//! services/api/src/web/middleware.rs
//!
//! Reviewer authentication middleware for the admin routes.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::web::state::{AppState, ReviewerId};

pub const REVIEWER_HEADER: &str = "x-reviewer-id";

/// Middleware that requires a reviewer identity on admin routes.
///
/// The `x-reviewer-id` header names the reviewer stamped into review fields.
/// When a reviewer token is configured, a matching `Authorization: Bearer`
/// header is required as well. On success the identity is inserted into the
/// request extensions as a `ReviewerId`.
pub async fn require_reviewer(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // 1. Extract the reviewer identity
    let reviewer = req
        .headers()
        .get(REVIEWER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // 2. Check the bearer token when one is configured
    if let Some(expected) = state.config.reviewer_token.as_deref() {
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        if presented != Some(expected) {
            warn!(reviewer = %reviewer, "Rejected admin request with a bad reviewer token");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    // 3. Insert the identity and continue to the handler
    req.extensions_mut().insert(ReviewerId(reviewer));
    Ok(next.run(req).await)
}
