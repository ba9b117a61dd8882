//! WebSocket wire protocol — §6.2.
//!
//! Tagged/discriminated-union structs parsed at the boundary, never
//! propagated inward as unparsed JSON (§9). Grounded on the pack's
//! coding-agent-sandbox reference `MuxClientMessage`/`MuxServerMessage`
//! enums: `#[serde(tag = "type", rename_all = "snake_case")]` over a flat
//! enum of struct-like variants, one per frame kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames a client (web UI / chat bot / browser extension) sends.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    Subscribe {
        token: String,
        client_id: String,
        /// A `ws_id` tag the client remembers from a prior `subscribed` frame.
        /// Presenting it asks the hub to recover the `ws_client_mapping` row
        /// left behind by that earlier connection instead of minting a fresh
        /// one, so identity survives the runtime being discarded and
        /// recreated in between (§4.4's hibernation-recovery lookup).
        #[serde(default)]
        resume_ws_id: Option<String>,
    },
    Prompt {
        content: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        attachments: Option<Vec<Value>>,
    },
    Stop,
    Typing,
    Presence {
        status: String,
        #[serde(default)]
        cursor: Option<Value>,
    },
}

/// Frames the coordinator sends to clients.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Pong { timestamp: i64 },
    Subscribed {
        session_id: String,
        state: String,
        participant_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        participant: Option<Value>,
    },
    PromptQueued { message_id: String, position: usize },
    SandboxEvent { event: Value },
    PresenceSync { presence: Vec<Value> },
    PresenceUpdate { presence: Value },
    PresenceLeave { client_id: String },
    SandboxWarming,
    SandboxSpawning,
    SandboxStatus { status: String },
    SandboxReady,
    SandboxError { message: String },
    SandboxWarning { message: String },
    SandboxRestored,
    SnapshotSaved { image_id: String, reason: String },
    ArtifactCreated { artifact: Value },
    SessionStatus { status: String },
    ProcessingStatus { is_processing: bool },
    Error { code: String, message: String },
}

/// Event payloads a sandbox sends over its one socket (§6.2, sandbox→server).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    Heartbeat,
    Token { content: String, message_id: String },
    ToolCall { tool: String, args: Value, call_id: String, message_id: String },
    ToolResult {
        call_id: String,
        result: Value,
        #[serde(default)]
        error: Option<String>,
        message_id: String,
    },
    GitSync {
        status: String,
        #[serde(default)]
        sha: Option<String>,
    },
    ExecutionComplete { message_id: String, success: bool },
    Artifact {
        artifact_type: String,
        url: String,
        #[serde(default)]
        metadata: Option<Value>,
    },
    PushComplete { branch_name: String },
    PushError { branch_name: String, error: String },
}

/// Frames the coordinator sends to a sandbox.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxCommand {
    Prompt {
        message_id: String,
        content: String,
        model: String,
        author: String,
        #[serde(default)]
        attachments: Option<Vec<Value>>,
    },
    Push {
        branch_name: String,
        repo_owner: String,
        repo_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        github_token: Option<String>,
    },
    Stop,
}

/// WS close codes — §6.2.
pub mod close_code {
    pub const INVALID_AUTH: u16 = 4001;
    pub const STATE_LOST_AFTER_HIBERNATION: u16 = 4002;
    pub const AUTH_TIMEOUT: u16 = 4008;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_subscribe_round_trips() {
        let json = r#"{"type":"subscribe","token":"abc","client_id":"c1"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Subscribe { token, client_id, resume_ws_id } => {
                assert_eq!(token, "abc");
                assert_eq!(client_id, "c1");
                assert!(resume_ws_id.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn client_frame_subscribe_with_resume_ws_id_round_trips() {
        let json = r#"{"type":"subscribe","token":"abc","client_id":"c1","resume_ws_id":"ws-9"}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Subscribe { resume_ws_id, .. } => assert_eq!(resume_ws_id, Some("ws-9".into())),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn sandbox_event_push_complete_round_trips() {
        let json = r#"{"type":"push_complete","branch_name":"agent/abc123"}"#;
        let event: SandboxEvent = serde_json::from_str(json).unwrap();
        match event {
            SandboxEvent::PushComplete { branch_name } => assert_eq!(branch_name, "agent/abc123"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_frame_error_serializes_with_discriminant() {
        let frame = ServerFrame::Error { code: "bad_token".into(), message: "nope".into() };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "bad_token");
    }

    #[test]
    fn sandbox_command_push_omits_absent_token() {
        let cmd = SandboxCommand::Push {
            branch_name: "b".into(),
            repo_owner: "o".into(),
            repo_name: "r".into(),
            github_token: None,
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert!(value.get("github_token").is_none());
    }
}
