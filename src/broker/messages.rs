//! Wire protocol: a single bidirectional JSON message channel, one tagged
//! variant per `type`. Dynamically-typed wire payloads become tagged variants
//! with strict decoders and a single reject-on-unknown path -- these enums
//! never accept a message whose `type` field doesn't match a known variant;
//! the broker decides separately (via `serde_json::Value`) whether an
//! unknown `type` is logged-and-dropped or is malformed JSON.

use serde::{Deserialize, Serialize};

use crate::model::Session;

/// Client → server messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    TerminalAttach {
        session_id: String,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    TerminalDetach {
        session_id: String,
    },
    TerminalInput {
        session_id: String,
        data: String,
    },
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    SessionCreate {
        project_path: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        command: Option<String>,
    },
    SessionKill {
        session_id: String,
    },
    SessionRename {
        session_id: String,
        new_name: String,
    },
    SessionPin {
        session_id: String,
        is_pinned: bool,
    },
    SessionRefresh,
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Sessions {
        sessions: Vec<Session>,
    },
    SessionUpdate {
        session: Session,
    },
    SessionCreated {
        session: Session,
    },
    SessionRemoved {
        session_id: String,
    },
    TerminalReady {
        session_id: String,
    },
    TerminalOutput {
        session_id: String,
        data: String,
    },
    SessionPinResult {
        session_id: String,
        ok: bool,
    },
    Error {
        message: String,
    },
}

/// The known `type` tags, used to tell "unknown message type" (logged and
/// dropped) apart from "malformed JSON" (logged once per connection).
pub const KNOWN_CLIENT_TYPES: &[&str] = &[
    "terminal-attach",
    "terminal-detach",
    "terminal-input",
    "terminal-resize",
    "session-create",
    "session-kill",
    "session-rename",
    "session-pin",
    "session-refresh",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_terminal_attach_with_optional_dimensions() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"terminal-attach","sessionId":"agentboard:@1"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::TerminalAttach { session_id, cols: None, rows: None } if session_id == "agentboard:@1"
        ));
    }

    #[test]
    fn decodes_session_pin() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"session-pin","sessionId":"s1","isPinned":true}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::SessionPin { session_id, is_pinned: true } if session_id == "s1"
        ));
    }

    #[test]
    fn decodes_session_refresh_with_no_fields() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"session-refresh"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SessionRefresh));
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        let result: Result<ClientMessage, _> = serde_json::from_str(r#"{"type":"not-a-real-type"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn server_message_uses_camel_case_fields() {
        let msg = ServerMessage::TerminalReady { session_id: "agentboard:@1".to_string() };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"terminal-ready","sessionId":"agentboard:@1"}"#);
    }

    #[test]
    fn error_message_serializes_flat() {
        let msg = ServerMessage::Error { message: "boom".to_string() };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"boom"}"#);
    }
}
