pub mod auth;
pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod review;
pub mod state;
pub mod sync;
pub mod ws_handler;

// Re-export the handlers to make them easily accessible
// to the binary that will build the web server router.
pub use middleware::require_reviewer;
pub use rest::{
    lookup_handler, resubmit_handler, submit_application_handler, tracking_handler,
    update_fields_handler,
};
pub use review::{
    delete_application_handler, get_application_handler, list_applications_handler,
    request_corrections_handler, set_status_handler, verify_field_handler,
};
pub use sync::{pending_writes_handler, retry_write_handler};
pub use ws_handler::track_handler;
