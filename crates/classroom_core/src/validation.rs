//! crates/classroom_core/src/validation.rs
//!
//! Pre-submission checks. Failures come back as field-keyed messages and never
//! reach the lifecycle manager's mutations.

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::domain::{ApplicationPayload, RegistrationApplication, APPLICATIONS};
use crate::ports::{LocalCacheStore, RemoteDocumentStore};

pub const MIN_PASSWORD_LEN: usize = 8;

/// Field name → message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{} field(s) failed validation", .0.len())]
pub struct ValidationErrors(pub BTreeMap<String, String>);

impl ValidationErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        for (field, message) in other.0 {
            self.0.entry(field).or_insert(message);
        }
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationPolicy {
    /// When set, university emails must belong to this domain.
    pub email_domain: Option<String>,
}

pub struct SubmissionValidator {
    student_id: Regex,
    email: Regex,
    phone: Regex,
    url: Regex,
    policy: ValidationPolicy,
}

impl SubmissionValidator {
    pub fn new(policy: ValidationPolicy) -> Result<Self, regex::Error> {
        Ok(Self {
            student_id: Regex::new(r"^\d{4}-\d{5}$")?,
            email: Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")?,
            phone: Regex::new(r"^\+?\d{10,13}$")?,
            url: Regex::new(r"^https?://\S+$")?,
            policy,
        })
    }

    pub fn validate(&self, payload: &ApplicationPayload) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();

        let required = [
            ("studentId", &payload.student_id),
            ("universityEmail", &payload.university_email),
            ("firstName", &payload.first_name),
            ("lastName", &payload.last_name),
            ("username", &payload.username),
            ("contactNumber", &payload.contact_number),
            ("school", &payload.school),
            ("college", &payload.college),
            ("program", &payload.program),
            ("yearLevel", &payload.year_level),
            ("section", &payload.section),
            ("emergencyContactName", &payload.emergency_contact_name),
            ("emergencyContactNumber", &payload.emergency_contact_number),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                errors.add(field, "This field is required");
            } else {
                self.check_format(field, value, &mut errors);
            }
        }

        if let Some(email) = payload.personal_email.as_deref().filter(|e| !e.is_empty()) {
            self.check_format("personalEmail", email, &mut errors);
        }
        for link in &payload.social_links {
            if !self.url.is_match(&link.url) {
                errors.add("socialLinks", format!("'{}' is not a valid link", link.url));
            }
        }

        errors.into_result()
    }

    /// Checks the string values of a partial correction.
    pub fn validate_changes(&self, changes: &Map<String, Value>) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        for (field, value) in changes {
            if let Some(text) = value.as_str() {
                self.check_format(field, text, &mut errors);
            }
        }
        errors.into_result()
    }

    pub fn validate_password(&self, password: &str) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if password.chars().count() < MIN_PASSWORD_LEN {
            errors.add(
                "password",
                format!("Password must be at least {} characters", MIN_PASSWORD_LEN),
            );
        }
        errors.into_result()
    }

    fn check_format(&self, field: &str, value: &str, errors: &mut ValidationErrors) {
        let value = value.trim();
        match field {
            "studentId" if !self.student_id.is_match(value) => {
                errors.add(field, "Student ID must look like 2025-00046");
            }
            "universityEmail" => {
                if !self.email.is_match(value) {
                    errors.add(field, "Enter a valid email address");
                } else if let Some(domain) = &self.policy.email_domain {
                    let suffix = format!("@{}", domain.to_ascii_lowercase());
                    if !value.to_ascii_lowercase().ends_with(&suffix) {
                        errors.add(field, format!("Use your {} email address", domain));
                    }
                }
            }
            "personalEmail" if !self.email.is_match(value) => {
                errors.add(field, "Enter a valid email address");
            }
            "contactNumber" | "emergencyContactNumber" if !self.phone.is_match(value) => {
                errors.add(field, "Enter 10 to 13 digits, optionally starting with +");
            }
            "avatarUrl" if !self.url.is_match(value) => {
                errors.add(field, "Enter a valid link");
            }
            _ => {}
        }
    }
}

/// Finds open applications that already use this student id or email.
/// Advisory only: two concurrent submissions can both pass. Remote records
/// are checked together with the local cache, which also holds writes the
/// remote has not acknowledged yet; an unreachable remote leaves only the
/// local cache. Blank inputs match nothing.
pub async fn find_duplicates(
    remote: &dyn RemoteDocumentStore,
    local: &dyn LocalCacheStore,
    student_id: &str,
    email: &str,
    exclude_id: Option<&str>,
) -> ValidationErrors {
    let mut records = match remote.get_all(APPLICATIONS).await {
        Ok(records) => records,
        Err(e) => {
            warn!(error = %e, "Duplicate check using the local cache only");
            Vec::new()
        }
    };
    records.extend(local.get_collection(APPLICATIONS));

    let (student_id, email) = (student_id.trim(), email.trim());
    let mut errors = ValidationErrors::default();
    let open = records
        .into_iter()
        .filter_map(|r| serde_json::from_value::<RegistrationApplication>(r).ok())
        .filter(|a| a.status.is_open() && Some(a.id.as_str()) != exclude_id);
    for app in open {
        if !student_id.is_empty() && app.payload.student_id.trim().eq_ignore_ascii_case(student_id) {
            errors.add("studentId", "An application with this student ID is already under review");
        }
        if !email.is_empty() && app.payload.university_email.trim().eq_ignore_ascii_case(email) {
            errors.add("universityEmail", "An application with this email is already under review");
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fixtures::payload;
    use crate::domain::SocialLink;
    use crate::memory::{InMemoryCache, InMemoryRemote};
    use serde_json::json;

    fn validator(domain: Option<&str>) -> SubmissionValidator {
        SubmissionValidator::new(ValidationPolicy {
            email_domain: domain.map(str::to_string),
        })
        .unwrap()
    }

    #[test]
    fn test_valid_payload_passes() {
        assert!(validator(Some("school.edu.ph"))
            .validate(&payload("2025-00046", "a@school.edu.ph"))
            .is_ok());
    }

    #[test]
    fn test_errors_are_keyed_by_field() {
        let mut bad = payload("25-46", "not-an-email");
        bad.contact_number = "12-34".to_string();
        bad.section = " ".to_string();
        bad.social_links.push(SocialLink {
            id: "1".to_string(),
            url: "ftp://x".to_string(),
            platform: "other".to_string(),
        });

        let errors = validator(None).validate(&bad).unwrap_err();
        let fields: Vec<&str> = errors.0.keys().map(String::as_str).collect();
        assert_eq!(
            fields,
            vec!["contactNumber", "section", "socialLinks", "studentId", "universityEmail"]
        );
    }

    #[test]
    fn test_email_domain_policy() {
        let errors = validator(Some("school.edu.ph"))
            .validate(&payload("2025-00046", "a@gmail.com"))
            .unwrap_err();
        assert!(errors.0.contains_key("universityEmail"));
    }

    #[test]
    fn test_changes_and_password() {
        let v = validator(None);
        let mut changes = Map::new();
        changes.insert("contactNumber".to_string(), json!("abc"));
        changes.insert("city".to_string(), json!("Manila"));
        let errors = v.validate_changes(&changes).unwrap_err();
        assert_eq!(errors.0.len(), 1);
        assert!(v.validate_password("short").is_err());
        assert!(v.validate_password("long enough").is_ok());
    }

    #[tokio::test]
    async fn test_duplicates_only_count_open_applications() {
        let remote = InMemoryRemote::new();
        let cache = InMemoryCache::new();
        let mut open = serde_json::to_value(payload("2025-00046", "a@school.edu.ph")).unwrap();
        open["status"] = json!("verifying");
        open["submittedAt"] = json!("2025-01-01T00:00:00Z");
        let mut closed = serde_json::to_value(payload("2025-00047", "b@school.edu.ph")).unwrap();
        closed["status"] = json!("rejected");
        closed["submittedAt"] = json!("2025-01-01T00:00:00Z");
        remote.set_data("applications/open", open).await.unwrap();
        remote.set_data("applications/closed", closed).await.unwrap();

        let dup = find_duplicates(&remote, &cache, "2025-00046", "A@School.edu.ph", None).await;
        assert_eq!(dup.0.len(), 2);

        let none = find_duplicates(&remote, &cache, "2025-00047", "b@school.edu.ph", None).await;
        assert!(none.is_empty());

        let excluded = find_duplicates(&remote, &cache, "2025-00046", "x@school.edu.ph", Some("open")).await;
        assert!(excluded.is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_fall_back_to_local_cache() {
        let remote = InMemoryRemote::new();
        remote.set_offline(true);
        let cache = InMemoryCache::new();
        let mut local = serde_json::to_value(payload("2025-00046", "a@school.edu.ph")).unwrap();
        local["id"] = json!("offline");
        local["status"] = json!("pending");
        local["submittedAt"] = json!("2025-01-01T00:00:00Z");
        cache.set_collection(APPLICATIONS, vec![local]).unwrap();

        let dup = find_duplicates(&remote, &cache, "2025-00046", "other@school.edu.ph", None).await;
        assert!(dup.0.contains_key("studentId"));
    }
}
