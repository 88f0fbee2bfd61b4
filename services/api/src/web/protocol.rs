//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the application tracker in
//! the browser and the API server.

use classroom_core::{ApplicationStatus, TrackingView};
use serde::{Deserialize, Serialize};

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Asks for the current view right away instead of waiting for the next poll.
    Refresh,
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The current progress; sent on connect and on request.
    Tracking { view: TrackingView },

    /// The application moved to a new status since the last message.
    StatusChanged {
        from: ApplicationStatus,
        view: TrackingView,
    },

    /// The application no longer exists. The server closes the socket after this.
    Removed { application_id: String },

    /// Reports a fatal error to the client, which should display an error message.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let refresh: ClientMessage = serde_json::from_str(r#"{"type":"refresh"}"#).unwrap();
        assert_eq!(refresh, ClientMessage::Refresh);

        let removed = ServerMessage::Removed {
            application_id: "app-1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(removed).unwrap(),
            json!({"type": "removed", "application_id": "app-1"})
        );
    }
}
