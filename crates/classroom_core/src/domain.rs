//! crates/classroom_core/src/domain.rs
//!
//! Defines the core data structures for the registration workflow.
//! Records are stored as JSON documents in both the local cache and the remote
//! mirror, so every struct here round-trips through `serde_json` with the
//! camelCase field names the stored documents use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

//=========================================================================================
// Collection Keys
//=========================================================================================

pub const APPLICATIONS: &str = "applications";
pub const USERS: &str = "users";
pub const ANNOUNCEMENTS: &str = "announcements";
pub const SCHEDULE: &str = "schedule";
pub const SETTINGS: &str = "settings";
pub const ALBUM: &str = "album";
pub const ACHIEVEMENTS: &str = "achievements";
pub const CAMPAIGNS: &str = "campaigns";
pub const ACCESS_LOGS: &str = "accessLogs";

/// Fields that must carry a positive verification before an application
/// counts as fully verified.
pub const REQUIRED_FIELDS: &[&str] = &[
    "studentId",
    "universityEmail",
    "firstName",
    "lastName",
    "username",
    "contactNumber",
    "school",
    "college",
    "program",
    "yearLevel",
    "section",
    "emergencyContactName",
    "emergencyContactNumber",
];

/// Every applicant-editable field, as named in stored records.
pub const PAYLOAD_FIELDS: &[&str] = &[
    "studentId",
    "universityEmail",
    "firstName",
    "middleName",
    "lastName",
    "username",
    "passwordHash",
    "personalEmail",
    "contactNumber",
    "street",
    "city",
    "province",
    "zipCode",
    "school",
    "schoolId",
    "college",
    "collegeId",
    "program",
    "programId",
    "major",
    "majorId",
    "yearLevel",
    "section",
    "sectionId",
    "emergencyContactName",
    "emergencyContactRelationship",
    "emergencyContactNumber",
    "socialLinks",
    "avatarUrl",
    "avatarFileId",
];

//=========================================================================================
// Application Status
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Pending,
    Verifying,
    Approved,
    Rejected,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verifying => "verifying",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// An application that can still receive a duplicate-blocking
    /// submission check.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Verifying)
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "verifying" => Ok(Self::Verifying),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown application status '{}'", other)),
        }
    }
}

//=========================================================================================
// Application Payload
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialLink {
    pub id: String,
    pub url: String,
    pub platform: String,
}

/// Everything the applicant fills in on the registration form.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationPayload {
    // --- Identity ---
    pub student_id: String,
    pub university_email: String,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    pub last_name: String,
    pub username: String,
    /// Argon2 hash; the plaintext never reaches the stores.
    pub password_hash: String,

    // --- Contact ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal_email: Option<String>,
    pub contact_number: String,

    // --- Address ---
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub zip_code: String,

    // --- Academic structure ---
    pub school: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school_id: Option<String>,
    pub college: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub college_id: Option<String>,
    pub program: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major_id: Option<String>,
    pub year_level: String,
    pub section: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,

    // --- Emergency contact ---
    pub emergency_contact_name: String,
    #[serde(default)]
    pub emergency_contact_relationship: String,
    pub emergency_contact_number: String,

    // --- Optional extras ---
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub social_links: Vec<SocialLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_file_id: Option<String>,
}

impl ApplicationPayload {
    pub fn full_name(&self) -> String {
        match self.middle_name.as_deref().filter(|m| !m.trim().is_empty()) {
            Some(middle) => format!("{} {} {}", self.first_name, middle, self.last_name),
            None => format!("{} {}", self.first_name, self.last_name),
        }
    }
}

//=========================================================================================
// Registration Application
//=========================================================================================

/// A per-field admin judgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldVerification {
    pub verified: bool,
    pub verified_at: DateTime<Utc>,
    pub verified_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
}

impl FieldVerification {
    pub fn needs_correction(&self) -> bool {
        !self.verified && self.issue.as_deref().is_some_and(|i| !i.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationApplication {
    pub id: String,
    pub status: ApplicationStatus,
    #[serde(flatten)]
    pub payload: ApplicationPayload,

    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resubmitted_at: Option<DateTime<Utc>>,
    #[serde(default = "first_attempt")]
    pub attempt_number: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_verifications: Option<BTreeMap<String, FieldVerification>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields_needing_correction: Option<Vec<String>>,

    /// Write counter stamped by the mirror on every local write.
    #[serde(default)]
    pub version: u64,
}

fn first_attempt() -> u32 {
    1
}

impl RegistrationApplication {
    /// Recomputes `fields_needing_correction` from the verification entries.
    /// This is the only place that field is assigned outside of clearing.
    pub fn refresh_corrections(&mut self) {
        self.fields_needing_correction = self.field_verifications.as_ref().map(|entries| {
            entries
                .iter()
                .filter(|(_, v)| v.needs_correction())
                .map(|(field, _)| field.clone())
                .collect()
        });
    }

    pub fn clear_review(&mut self) {
        self.field_verifications = None;
        self.fields_needing_correction = None;
        self.reviewed_at = None;
        self.reviewed_by = None;
        self.review_notes = None;
        self.rejection_reason = None;
    }

    pub fn verification(&self, field: &str) -> Option<&FieldVerification> {
        self.field_verifications.as_ref().and_then(|m| m.get(field))
    }
}

/// An open field issue raised by a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldIssue {
    pub field: String,
    pub issue: String,
}

//=========================================================================================
// Lookup Criteria
//=========================================================================================

/// Multi-field lookup used by the public tracker. Absent criteria match
/// everything; present criteria must all match case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupCriteria {
    pub student_id: Option<String>,
    pub section: Option<String>,
    pub school: Option<String>,
    pub college: Option<String>,
    pub program: Option<String>,
    pub major: Option<String>,
}

impl LookupCriteria {
    pub fn matches(&self, app: &RegistrationApplication) -> bool {
        let p = &app.payload;
        criterion_matches(&self.student_id, Some(&p.student_id))
            && criterion_matches(&self.section, Some(&p.section))
            && criterion_matches(&self.school, Some(&p.school))
            && criterion_matches(&self.college, Some(&p.college))
            && criterion_matches(&self.program, Some(&p.program))
            && criterion_matches(&self.major, p.major.as_ref())
    }
}

fn criterion_matches(wanted: &Option<String>, actual: Option<&String>) -> bool {
    match wanted.as_deref().map(str::trim).filter(|w| !w.is_empty()) {
        None => true,
        Some(w) => actual.is_some_and(|a| a.trim().eq_ignore_ascii_case(w)),
    }
}

//=========================================================================================
// Users & Access Log
//=========================================================================================

/// The account created when an application is approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub student_id: String,
    pub username: String,
    pub password_hash: String,
    pub full_name: String,
    pub university_email: String,
    pub contact_number: String,
    pub school: String,
    pub college: String,
    pub program: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub major: Option<String>,
    pub year_level: String,
    pub section: String,
    pub role: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub application_id: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn id_for(section: &str, student_id: &str) -> String {
        format!("{}-{}", section, student_id)
    }

    pub fn from_application(app: &RegistrationApplication, now: DateTime<Utc>) -> Self {
        let p = &app.payload;
        Self {
            id: Self::id_for(&p.section, &p.student_id),
            student_id: p.student_id.clone(),
            username: p.username.clone(),
            password_hash: p.password_hash.clone(),
            full_name: p.full_name(),
            university_email: p.university_email.clone(),
            contact_number: p.contact_number.clone(),
            school: p.school.clone(),
            college: p.college.clone(),
            program: p.program.clone(),
            major: p.major.clone(),
            year_level: p.year_level.clone(),
            section: p.section.clone(),
            role: "student".to_string(),
            active: true,
            avatar_url: p.avatar_url.clone(),
            application_id: app.id.clone(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub action: String,
    pub details: String,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn payload(student_id: &str, email: &str) -> ApplicationPayload {
        ApplicationPayload {
            student_id: student_id.to_string(),
            university_email: email.to_string(),
            first_name: "Ana".to_string(),
            middle_name: None,
            last_name: "Reyes".to_string(),
            username: "areyes".to_string(),
            password_hash: "$argon2id$v=19$stub".to_string(),
            contact_number: "09171234567".to_string(),
            street: "12 Mabini St".to_string(),
            city: "Quezon City".to_string(),
            province: "Metro Manila".to_string(),
            zip_code: "1100".to_string(),
            school: "Main Campus".to_string(),
            college: "Engineering".to_string(),
            program: "BSCS".to_string(),
            major: Some("Data Science".to_string()),
            year_level: "2".to_string(),
            section: "CS2A".to_string(),
            emergency_contact_name: "Luz Reyes".to_string(),
            emergency_contact_relationship: "Mother".to_string(),
            emergency_contact_number: "09181234567".to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn application() -> RegistrationApplication {
        RegistrationApplication {
            id: "app-1".to_string(),
            status: ApplicationStatus::Pending,
            payload: fixtures::payload("2025-00046", "a@school.edu.ph"),
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
        }
    }

    #[test]
    fn test_record_uses_flat_camel_case_fields() {
        let value = serde_json::to_value(application()).unwrap();
        assert_eq!(value["studentId"], "2025-00046");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["attemptNumber"], 1);
        assert!(value.get("fieldVerifications").is_none());
    }

    #[test]
    fn test_corrections_only_include_unverified_fields_with_issue() {
        let mut app = application();
        let now = Utc::now();
        let mut entries = BTreeMap::new();
        let entry = |verified: bool, issue: Option<&str>| FieldVerification {
            verified,
            verified_at: now,
            verified_by: "admin".to_string(),
            issue: issue.map(str::to_string),
        };
        entries.insert("contactNumber".to_string(), entry(false, Some("invalid format")));
        entries.insert("section".to_string(), entry(false, Some("")));
        entries.insert("city".to_string(), entry(false, None));
        entries.insert("studentId".to_string(), entry(true, Some("ignored")));
        app.field_verifications = Some(entries);

        app.refresh_corrections();

        assert_eq!(app.fields_needing_correction, Some(vec!["contactNumber".to_string()]));
    }

    #[test]
    fn test_lookup_is_case_insensitive_exact_match() {
        let app = application();
        let by_section = LookupCriteria {
            section: Some("cs2a".to_string()),
            ..Default::default()
        };
        let substring = LookupCriteria {
            section: Some("CS2".to_string()),
            ..Default::default()
        };
        assert!(by_section.matches(&app));
        assert!(!substring.matches(&app));
        assert!(LookupCriteria::default().matches(&app));
    }

    #[test]
    fn test_user_id_embeds_section_and_student_id() {
        let user = User::from_application(&application(), Utc::now());
        assert_eq!(user.id, "CS2A-2025-00046");
        assert_eq!(user.full_name, "Ana Reyes");
        assert!(user.active);
    }
}
