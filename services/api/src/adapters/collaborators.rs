//! services/api/src/adapters/collaborators.rs
//!
//! Implementations of the user registration and access log ports that write
//! through the mirror, so approved users and audit entries land in the local
//! cache first and reach the remote store through the pending-write queue.

use classroom_core::domain::{AccessLogEntry, User, ACCESS_LOGS, USERS};
use classroom_core::mirror::MirrorSynchronizer;
use classroom_core::ports::{AccessLogService, PortResult, UserRegistrationService};
use std::sync::Arc;
use tracing::info;

pub struct MirroredUserRegistry {
    mirror: Arc<MirrorSynchronizer>,
}

impl MirroredUserRegistry {
    pub fn new(mirror: Arc<MirrorSynchronizer>) -> Self {
        Self { mirror }
    }
}

impl UserRegistrationService for MirroredUserRegistry {
    fn register_user(&self, user: User) -> PortResult<()> {
        let id = user.id.clone();
        self.mirror.put_record(USERS, serde_json::to_value(user)?)?;
        info!(user_id = %id, "User registered");
        Ok(())
    }
}

pub struct MirroredAccessLog {
    mirror: Arc<MirrorSynchronizer>,
}

impl MirroredAccessLog {
    pub fn new(mirror: Arc<MirrorSynchronizer>) -> Self {
        Self { mirror }
    }
}

impl AccessLogService for MirroredAccessLog {
    fn append(&self, entry: AccessLogEntry) -> PortResult<()> {
        self.mirror.put_record(ACCESS_LOGS, serde_json::to_value(entry)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use classroom_core::memory::{InMemoryCache, InMemoryRemote};
    use classroom_core::ports::LocalCacheStore;
    use classroom_core::RetryPolicy;

    fn mirror() -> (Arc<MirrorSynchronizer>, Arc<InMemoryCache>) {
        let cache = Arc::new(InMemoryCache::new());
        let remote = Arc::new(InMemoryRemote::new());
        let mirror = Arc::new(MirrorSynchronizer::new(cache.clone(), remote, RetryPolicy::default()));
        (mirror, cache)
    }

    #[test]
    fn test_registered_user_is_cached_and_queued() {
        let (mirror, cache) = mirror();
        let registry = MirroredUserRegistry::new(mirror.clone());
        let user = User {
            id: User::id_for("CS2A", "2025-00046"),
            student_id: "2025-00046".to_string(),
            username: "ana".to_string(),
            password_hash: "$argon2id$stub".to_string(),
            full_name: "Ana Cruz".to_string(),
            university_email: "ana@school.edu.ph".to_string(),
            contact_number: "09171234567".to_string(),
            school: "School".to_string(),
            college: "College".to_string(),
            program: "BSCS".to_string(),
            major: None,
            year_level: "2".to_string(),
            section: "CS2A".to_string(),
            role: "student".to_string(),
            active: true,
            avatar_url: None,
            application_id: "app".to_string(),
            created_at: Utc::now(),
        };
        registry.register_user(user).unwrap();

        let users = cache.get_collection(USERS);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["id"], "CS2A-2025-00046");
        assert_eq!(mirror.pending()[0].path(), "users/CS2A-2025-00046");
    }

    #[test]
    fn test_access_log_appends() {
        let (mirror, cache) = mirror();
        let log = MirroredAccessLog::new(mirror);
        for n in 0..2 {
            log.append(AccessLogEntry {
                id: format!("log-{}", n),
                timestamp: Utc::now(),
                user_id: "reviewer".to_string(),
                action: "field_verified".to_string(),
                details: "app".to_string(),
            })
            .unwrap();
        }
        assert_eq!(cache.get_collection(ACCESS_LOGS).len(), 2);
    }
}
