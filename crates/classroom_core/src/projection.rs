//! crates/classroom_core/src/projection.rs
//!
//! Derives the public tracker view from an application's status.

use serde::Serialize;

use crate::domain::{ApplicationStatus, RegistrationApplication};

pub const TRACKING_STEPS: [&str; 3] = ["Submitted", "Under Verification", "Final"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingView {
    pub application_id: String,
    pub status: ApplicationStatus,
    pub step_index: usize,
    pub steps: [&'static str; 3],
    pub completed: [bool; 3],
    pub percent: u8,
}

pub fn step_index(status: ApplicationStatus) -> usize {
    match status {
        ApplicationStatus::Pending => 0,
        ApplicationStatus::Verifying => 1,
        ApplicationStatus::Approved | ApplicationStatus::Rejected => 2,
    }
}

/// Recomputed from the application on every call; never cached.
pub fn tracking_view(app: &RegistrationApplication) -> TrackingView {
    let step_index = step_index(app.status);
    let total = TRACKING_STEPS.len();
    let percent = ((step_index + 1) as f64 / total as f64 * 100.0).round() as u8;
    let mut completed = [false; 3];
    for done in completed.iter_mut().take(step_index + 1) {
        *done = true;
    }
    TrackingView {
        application_id: app.id.clone(),
        status: app.status,
        step_index,
        steps: TRACKING_STEPS,
        completed,
        percent,
    }
}
