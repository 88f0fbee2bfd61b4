//! crates/classroom_core/src/lifecycle.rs
//!
//! The registration application state machine.
//!
//! Every status change is checked against a single transition table before
//! any field is touched, so an illegal action leaves the stored record as it
//! was. Mutations write through the mirror (local first, remote queued) and
//! append an access-log entry.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{
    AccessLogEntry, ApplicationPayload, ApplicationStatus, FieldIssue, FieldVerification,
    LookupCriteria, RegistrationApplication, User, APPLICATIONS, PAYLOAD_FIELDS, REQUIRED_FIELDS,
};
use crate::mirror::MirrorSynchronizer;
use crate::ports::{AccessLogService, PortError, UserRegistrationService};

//=========================================================================================
// Transition Table
//=========================================================================================

/// An action applied to an existing application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationEvent {
    VerifyField,
    RequestCorrections,
    UpdateFields,
    Resubmit,
    /// Administrative decision to move to the given status.
    Decide(ApplicationStatus),
}

impl fmt::Display for ApplicationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerifyField => f.write_str("verify-field"),
            Self::RequestCorrections => f.write_str("request-corrections"),
            Self::UpdateFields => f.write_str("update-fields"),
            Self::Resubmit => f.write_str("resubmit"),
            Self::Decide(status) => write!(f, "set-status({})", status),
        }
    }
}

impl ApplicationStatus {
    /// The status after applying `event`, or `None` when the table forbids it.
    pub fn apply(self, event: ApplicationEvent) -> Option<ApplicationStatus> {
        use ApplicationEvent as E;
        use ApplicationStatus as S;

        match (self, event) {
            (S::Approved, E::Decide(S::Approved)) => Some(S::Approved),
            (S::Approved, E::Decide(_)) => None,
            (_, E::Decide(target)) => Some(target),
            (S::Pending | S::Verifying | S::Rejected, E::VerifyField) => Some(self),
            (S::Pending | S::Verifying, E::RequestCorrections) => Some(S::Verifying),
            (S::Pending | S::Verifying, E::UpdateFields) => Some(S::Pending),
            (S::Rejected, E::Resubmit) => Some(S::Pending),
            _ => None,
        }
    }
}

//=========================================================================================
// Errors
//=========================================================================================

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Application not found: {0}")]
    NotFound(String),
    #[error("Cannot {event} an application that is {from}")]
    IllegalTransition {
        from: ApplicationStatus,
        event: ApplicationEvent,
    },
    #[error("Invalid application data: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Port(#[from] PortError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

//=========================================================================================
// Manager
//=========================================================================================

pub struct ApplicationLifecycleManager {
    mirror: Arc<MirrorSynchronizer>,
    users: Arc<dyn UserRegistrationService>,
    audit: Arc<dyn AccessLogService>,
}

impl ApplicationLifecycleManager {
    pub fn new(
        mirror: Arc<MirrorSynchronizer>,
        users: Arc<dyn UserRegistrationService>,
        audit: Arc<dyn AccessLogService>,
    ) -> Self {
        Self { mirror, users, audit }
    }

    //-------------------------------------------------------------------------------------
    // Mutations
    //-------------------------------------------------------------------------------------

    /// Records a new application in `pending` on its first attempt. Duplicate
    /// checks are the caller's job.
    pub fn submit(&self, payload: ApplicationPayload) -> LifecycleResult<RegistrationApplication> {
        let app = RegistrationApplication {
            id: Uuid::new_v4().to_string(),
            status: ApplicationStatus::Pending,
            payload,
            submitted_at: Utc::now(),
            reviewed_at: None,
            reviewed_by: None,
            review_notes: None,
            rejection_reason: None,
            resubmitted_at: None,
            attempt_number: 1,
            field_verifications: None,
            fields_needing_correction: None,
            version: 0,
        };
        let saved = self.save(app)?;
        info!(application_id = %saved.id, student_id = %saved.payload.student_id, "Application submitted");
        self.log(&saved.payload.student_id, "application_submitted", &saved.id);
        Ok(saved)
    }

    /// Records a reviewer's judgment on one field. The status is unchanged.
    pub fn verify_field(
        &self,
        id: &str,
        field: &str,
        verified: bool,
        verified_by: &str,
        issue: Option<String>,
    ) -> LifecycleResult<RegistrationApplication> {
        ensure_known_field(field)?;
        let entry = FieldVerification {
            verified,
            verified_at: Utc::now(),
            verified_by: verified_by.to_string(),
            issue: issue.filter(|i| !i.trim().is_empty()),
        };

        let saved = self.modify(id, |app| {
            let next = transition(app, ApplicationEvent::VerifyField)?;
            app.field_verifications
                .get_or_insert_with(BTreeMap::new)
                .insert(field.to_string(), entry);
            app.refresh_corrections();
            app.status = next;
            Ok(())
        })?;
        self.log(verified_by, "field_verified", &format!("{} {} verified={}", saved.id, field, verified));
        Ok(saved)
    }

    /// Flags several fields at once and moves the application to `verifying`.
    pub fn request_corrections(
        &self,
        id: &str,
        issues: Vec<FieldIssue>,
        reviewed_by: &str,
    ) -> LifecycleResult<RegistrationApplication> {
        if issues.is_empty() {
            return Err(LifecycleError::InvalidPayload("no fields flagged for correction".to_string()));
        }
        for issue in &issues {
            ensure_known_field(&issue.field)?;
            if issue.issue.trim().is_empty() {
                return Err(LifecycleError::InvalidPayload(format!(
                    "correction for '{}' needs a reason",
                    issue.field
                )));
            }
        }

        let saved = self.modify(id, |app| {
            let next = transition(app, ApplicationEvent::RequestCorrections)?;

            let now = Utc::now();
            let entries = app.field_verifications.get_or_insert_with(BTreeMap::new);
            for FieldIssue { field, issue } in issues {
                entries.insert(
                    field,
                    FieldVerification {
                        verified: false,
                        verified_at: now,
                        verified_by: reviewed_by.to_string(),
                        issue: Some(issue),
                    },
                );
            }
            app.refresh_corrections();
            app.status = next;
            app.reviewed_by = Some(reviewed_by.to_string());
            Ok(())
        })?;
        info!(
            application_id = %saved.id,
            fields = ?saved.fields_needing_correction,
            "Corrections requested"
        );
        self.log(reviewed_by, "corrections_requested", &saved.id);
        Ok(saved)
    }

    /// Applies the applicant's narrow corrections. Every updated field loses
    /// its verification entry, and the application re-enters the queue at
    /// `pending` even if other flagged fields remain.
    pub fn update_fields(
        &self,
        id: &str,
        changes: Map<String, Value>,
    ) -> LifecycleResult<RegistrationApplication> {
        if changes.is_empty() {
            return Err(LifecycleError::InvalidPayload("no fields to update".to_string()));
        }
        for field in changes.keys() {
            ensure_known_field(field)?;
        }

        let updated: Vec<String> = changes.keys().cloned().collect();
        let saved = self.modify(id, |app| {
            let next = transition(app, ApplicationEvent::UpdateFields)?;

            let mut payload = match serde_json::to_value(&app.payload).map_err(PortError::from)? {
                Value::Object(fields) => fields,
                _ => Map::new(),
            };
            payload.extend(changes);
            app.payload = serde_json::from_value(Value::Object(payload))
                .map_err(|e| LifecycleError::InvalidPayload(e.to_string()))?;

            if let Some(entries) = app.field_verifications.as_mut() {
                for field in &updated {
                    entries.remove(field);
                }
            }
            app.refresh_corrections();
            app.status = next;
            app.resubmitted_at = Some(Utc::now());
            app.rejection_reason = None;
            Ok(())
        })?;
        info!(application_id = %saved.id, fields = ?updated, "Application fields corrected");
        self.log(&saved.payload.student_id, "application_corrected", &saved.id);
        Ok(saved)
    }

    /// Replaces a rejected application's data and restarts its review.
    /// The attempt ceiling is enforced by callers.
    pub fn resubmit(
        &self,
        id: &str,
        payload: ApplicationPayload,
        attempt_number: u32,
    ) -> LifecycleResult<RegistrationApplication> {
        let saved = self.modify(id, |app| {
            let next = transition(app, ApplicationEvent::Resubmit)?;
            app.payload = payload;
            app.status = next;
            app.attempt_number = attempt_number;
            app.clear_review();
            app.resubmitted_at = Some(Utc::now());
            Ok(())
        })?;
        info!(application_id = %saved.id, attempt = saved.attempt_number, "Application resubmitted");
        self.log(&saved.payload.student_id, "application_resubmitted", &saved.id);
        Ok(saved)
    }

    /// Administrative status decision. Approval registers one user derived
    /// from the application; approving twice registers twice. Approved is
    /// terminal apart from a repeated approval.
    pub fn set_status(
        &self,
        id: &str,
        status: ApplicationStatus,
        reviewed_by: &str,
        notes: Option<String>,
        rejection_reason: Option<String>,
    ) -> LifecycleResult<RegistrationApplication> {
        let now = Utc::now();
        let mut from = status;
        let saved = self.modify(id, |app| {
            let next = transition(app, ApplicationEvent::Decide(status))?;
            from = app.status;
            app.status = next;
            app.reviewed_at = Some(now);
            app.reviewed_by = Some(reviewed_by.to_string());
            app.review_notes = notes;
            app.rejection_reason = match next {
                ApplicationStatus::Rejected => rejection_reason,
                _ => None,
            };
            Ok(())
        })?;
        let next = saved.status;
        info!(application_id = %saved.id, from = %from, to = %next, "Application status changed");

        if next == ApplicationStatus::Approved {
            let user = User::from_application(&saved, now);
            info!(application_id = %saved.id, user_id = %user.id, "Registering approved applicant");
            self.users.register_user(user)?;
        }
        self.log(reviewed_by, &format!("application_{}", next), &saved.id);
        Ok(saved)
    }

    /// Removes the application locally and remotely. Returns `false` for an
    /// unknown id.
    pub fn delete(&self, id: &str, deleted_by: &str) -> LifecycleResult<bool> {
        let existed = self.mirror.remove_record(APPLICATIONS, id)?;
        if existed {
            info!(application_id = %id, "Application deleted");
            self.log(deleted_by, "application_deleted", id);
        }
        Ok(existed)
    }

    //-------------------------------------------------------------------------------------
    // Queries
    //-------------------------------------------------------------------------------------

    /// All applications, newest submission first.
    pub fn list(&self) -> Vec<RegistrationApplication> {
        let mut apps: Vec<RegistrationApplication> = self
            .mirror
            .records(APPLICATIONS)
            .into_iter()
            .filter_map(|record| match serde_json::from_value(record) {
                Ok(app) => Some(app),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed application record");
                    None
                }
            })
            .collect();
        apps.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        apps
    }

    pub fn by_status(&self, status: ApplicationStatus) -> Vec<RegistrationApplication> {
        self.list().into_iter().filter(|a| a.status == status).collect()
    }

    pub fn find(&self, id: &str) -> Option<RegistrationApplication> {
        self.list().into_iter().find(|a| a.id == id)
    }

    pub fn lookup(&self, criteria: &LookupCriteria) -> Vec<RegistrationApplication> {
        self.list().into_iter().filter(|a| criteria.matches(a)).collect()
    }

    /// Open reviewer issues; empty for an unknown id.
    pub fn unresolved_issues(&self, id: &str) -> Vec<FieldIssue> {
        let Some(app) = self.find(id) else {
            return Vec::new();
        };
        app.field_verifications
            .iter()
            .flatten()
            .filter(|(_, v)| v.needs_correction())
            .map(|(field, v)| FieldIssue {
                field: field.clone(),
                issue: v.issue.clone().unwrap_or_default(),
            })
            .collect()
    }

    /// Whether every required field carries a positive verification.
    pub fn all_required_fields_verified(&self, id: &str) -> bool {
        self.find(id).is_some_and(|app| {
            REQUIRED_FIELDS
                .iter()
                .all(|field| app.verification(field).is_some_and(|v| v.verified))
        })
    }

    //-------------------------------------------------------------------------------------
    // Helpers
    //-------------------------------------------------------------------------------------

    /// Runs `change` on the stored application under the mirror's local guard
    /// and saves the result. An error from `change` leaves the record as it was.
    fn modify(
        &self,
        id: &str,
        change: impl FnOnce(&mut RegistrationApplication) -> LifecycleResult<()>,
    ) -> LifecycleResult<RegistrationApplication> {
        let stored = self
            .mirror
            .update_record(APPLICATIONS, id, |record| -> LifecycleResult<Value> {
                let mut app: RegistrationApplication =
                    serde_json::from_value(record).map_err(PortError::from)?;
                change(&mut app)?;
                Ok(serde_json::to_value(&app).map_err(PortError::from)?)
            })?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        Ok(serde_json::from_value(stored).map_err(PortError::from)?)
    }

    fn save(&self, app: RegistrationApplication) -> LifecycleResult<RegistrationApplication> {
        let record = serde_json::to_value(&app).map_err(PortError::from)?;
        let stored = self.mirror.put_record(APPLICATIONS, record)?;
        Ok(serde_json::from_value(stored).map_err(PortError::from)?)
    }

    fn log(&self, user_id: &str, action: &str, details: &str) {
        let entry = AccessLogEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            action: action.to_string(),
            details: details.to_string(),
        };
        if let Err(e) = self.audit.append(entry) {
            warn!(action, error = %e, "Failed to append access log entry");
        }
    }
}

fn transition(app: &RegistrationApplication, event: ApplicationEvent) -> LifecycleResult<ApplicationStatus> {
    app.status.apply(event).ok_or_else(|| {
        warn!(application_id = %app.id, from = %app.status, %event, "Rejected illegal transition");
        LifecycleError::IllegalTransition {
            from: app.status,
            event,
        }
    })
}

fn ensure_known_field(field: &str) -> LifecycleResult<()> {
    if PAYLOAD_FIELDS.contains(&field) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidPayload(format!("unknown field '{}'", field)))
    }
}
