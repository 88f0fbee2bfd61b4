//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use classroom_core::domain::SETTINGS;
use classroom_core::{ApplicationLifecycleManager, MirrorSynchronizer, SubmissionValidator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ApplicationLifecycleManager>,
    pub mirror: Arc<MirrorSynchronizer>,
    pub validator: Arc<SubmissionValidator>,
    pub config: Arc<Config>,
    /// Cancelled on shutdown; long-lived connections derive child tokens from it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// The resubmission ceiling. A `maxResubmissionAttempts` value in the
    /// mirrored settings document overrides the configured default.
    pub fn max_attempts(&self) -> u32 {
        self.mirror
            .local()
            .get_singleton(SETTINGS)
            .and_then(|s| s.get("maxResubmissionAttempts").and_then(|v| v.as_u64()))
            .filter(|n| *n > 0)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(self.config.max_resubmission_attempts)
    }
}

/// The reviewer identity attached to admin requests by `require_reviewer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewerId(pub String);


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use classroom_core::domain::SETTINGS;
    use serde_json::json;

    #[test]
    fn test_max_attempts_prefers_settings() {
        let (state, _) = state_with(test_config());
        assert_eq!(state.max_attempts(), 5);

        state
            .mirror
            .put_singleton(SETTINGS, json!({"maxResubmissionAttempts": 2}))
            .unwrap();
        assert_eq!(state.max_attempts(), 2);

        state
            .mirror
            .put_singleton(SETTINGS, json!({"maxResubmissionAttempts": 0}))
            .unwrap();
        assert_eq!(state.max_attempts(), 5);
    }
}
