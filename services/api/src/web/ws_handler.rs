//! services/api/src/web/ws_handler.rs
//!
//! The live application tracker. Each connection sends the current view, then
//! a poller re-reads the application every `TRACKING_POLL_SECS` and pushes a
//! message only when its status changed. The poller and the receive loop share
//! one cancellation token, derived from the server's shutdown token.

use crate::web::protocol::{ClientMessage, ServerMessage};
use crate::web::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use classroom_core::domain::APPLICATIONS;
use classroom_core::ports::{record_path, record_version};
use classroom_core::{tracking_view, ApplicationStatus, RegistrationApplication};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// The handler for upgrading tracker requests to WebSocket connections.
pub async fn track_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Path(application_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, application_id))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, application_id: String) {
    info!(application_id = %application_id, "Tracker connected");

    // The sender is wrapped in an Arc<Mutex<>> so the poller can push updates.
    let (sender, mut receiver) = socket.split();
    let ws_sender: WsSender = Arc::new(Mutex::new(sender));
    let cancel = app_state.shutdown.child_token();

    // --- 1. Initial View ---
    let Some(app) = current_application(&app_state, &application_id).await else {
        let msg = ServerMessage::Error {
            message: format!("Application {} not found", application_id),
        };
        send(&ws_sender, &msg).await;
        return;
    };
    if !send(&ws_sender, &ServerMessage::Tracking { view: tracking_view(&app) }).await {
        return;
    }

    // --- 2. Status Poller ---
    let poller = tokio::spawn(poll_status(
        app_state.clone(),
        application_id.clone(),
        app.status,
        ws_sender.clone(),
        cancel.clone(),
    ));

    // --- 3. Main Message Loop ---
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Refresh) => {
                        if let Some(app) = current_application(&app_state, &application_id).await {
                            if !send(&ws_sender, &ServerMessage::Tracking { view: tracking_view(&app) }).await {
                                break;
                            }
                        }
                    }
                    Err(e) => warn!(application_id = %application_id, error = %e, "Ignoring malformed tracker message"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(application_id = %application_id, error = %e, "Tracker socket error");
                    break;
                }
            }
        }
    }

    cancel.cancel();
    if let Err(e) = poller.await {
        warn!(application_id = %application_id, error = %e, "Tracker poller panicked");
    }
    let _ = ws_sender.lock().await.send(Message::Close(None)).await;
    info!(application_id = %application_id, "Tracker disconnected");
}

async fn poll_status(
    app_state: Arc<AppState>,
    application_id: String,
    mut last: ApplicationStatus,
    ws_sender: WsSender,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(app_state.config.tracking_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial view is already sent.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let message = match current_application(&app_state, &application_id).await {
            None => ServerMessage::Removed {
                application_id: application_id.clone(),
            },
            Some(app) if app.status != last => {
                let message = ServerMessage::StatusChanged {
                    from: last,
                    view: tracking_view(&app),
                };
                last = app.status;
                message
            }
            Some(_) => continue,
        };

        let removed = matches!(message, ServerMessage::Removed { .. });
        debug!(application_id = %application_id, removed, "Pushing tracker update");
        if !send(&ws_sender, &message).await || removed {
            cancel.cancel();
            return;
        }
    }
}

/// Reads the application from the remote store, falling back to the local
/// cache when the remote is unreachable or lacks it. When both hold a copy
/// the one with the higher write version wins.
async fn current_application(app_state: &AppState, id: &str) -> Option<RegistrationApplication> {
    let local = app_state.manager.find(id);
    let remote = match app_state.mirror.remote().get_one(&record_path(APPLICATIONS, id)).await {
        Ok(Some(mut value)) => {
            if let serde_json::Value::Object(fields) = &mut value {
                fields.insert("id".to_string(), serde_json::Value::String(id.to_string()));
            }
            let version = record_version(&value);
            match serde_json::from_value::<RegistrationApplication>(value) {
                Ok(app) => Some((version, app)),
                Err(e) => {
                    warn!(application_id = %id, error = %e, "Malformed remote application");
                    None
                }
            }
        }
        Ok(None) => None,
        Err(e) => {
            debug!(application_id = %id, error = %e, "Tracker falling back to local cache");
            None
        }
    };

    match (remote, local) {
        (Some((version, _)), Some(local)) if local.version > version => Some(local),
        (Some((_, remote)), _) => Some(remote),
        (None, local) => local,
    }
}

/// Sends one protocol message. Returns `false` once the client is gone.
async fn send(ws_sender: &WsSender, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to encode tracker message");
            return false;
        }
    };
    ws_sender.lock().await.send(Message::Text(json.into())).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::state::test_support::{state_with, test_config};
    use classroom_core::ports::RemoteDocumentStore;
    use classroom_core::ApplicationPayload;
    use serde_json::json;

    fn payload() -> ApplicationPayload {
        ApplicationPayload {
            student_id: "2025-00046".to_string(),
            university_email: "ana@school.edu.ph".to_string(),
            section: "CS2A".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_local_until_remote_has_it() {
        let (state, remote) = state_with(test_config());
        let app = state.manager.submit(payload()).unwrap();

        // Not flushed yet: only the local cache knows the application.
        let seen = current_application(&state, &app.id).await.unwrap();
        assert_eq!(seen.status, ApplicationStatus::Pending);

        remote.set_offline(true);
        assert!(current_application(&state, &app.id).await.is_some());
        assert!(current_application(&state, "missing").await.is_none());
    }

    #[tokio::test]
    async fn test_newer_copy_wins() {
        let (state, remote) = state_with(test_config());
        let app = state.manager.submit(payload()).unwrap();
        state.mirror.flush().await;

        // Another device decided the application remotely.
        let mut decided = serde_json::to_value(&app).unwrap();
        decided["status"] = json!("approved");
        decided["version"] = json!(app.version + 5);
        remote
            .set_data(&record_path(APPLICATIONS, &app.id), decided)
            .await
            .unwrap();
        let seen = current_application(&state, &app.id).await.unwrap();
        assert_eq!(seen.status, ApplicationStatus::Approved);

        // A newer local write that has not reached the remote yet.
        for _ in 0..10 {
            state
                .manager
                .verify_field(&app.id, "section", true, "admin-1", None)
                .unwrap();
        }
        let seen = current_application(&state, &app.id).await.unwrap();
        assert_eq!(seen.status, ApplicationStatus::Pending);
    }
}
