pub mod domain;
pub mod lifecycle;
pub mod memory;
pub mod mirror;
pub mod ports;
pub mod projection;
pub mod validation;

pub use domain::{
    AccessLogEntry, ApplicationPayload, ApplicationStatus, FieldIssue, FieldVerification,
    LookupCriteria, RegistrationApplication, SocialLink, User,
};
pub use lifecycle::{ApplicationEvent, ApplicationLifecycleManager, LifecycleError, LifecycleResult};
pub use mirror::{BootstrapReport, MirrorSynchronizer, PendingWrite, RetryPolicy, SyncEvent};
pub use ports::{
    AccessLogService, LocalCacheStore, PortError, PortResult, RemoteDocumentStore,
    SnapshotStream, UserRegistrationService,
};
pub use projection::{tracking_view, TrackingView};
pub use validation::{SubmissionValidator, ValidationErrors, ValidationPolicy};
