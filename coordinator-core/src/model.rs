//! Persisted data model — §3.
//!
//! Every id is a 128-bit value rendered as a lowercase hex string; every
//! timestamp is milliseconds since the Unix epoch. These structs are the
//! coordinator's own; nothing outside the coordinator is permitted to write
//! the tables they back (§3, "Coordinator exclusively owns all tables").

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn new_id() -> String {
    hex::encode(Uuid::new_v4().as_bytes())
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Completed,
    Archived,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub session_name: String,
    pub title: Option<String>,
    pub repo_owner: String,
    pub repo_name: String,
    pub repo_default_branch: String,
    pub branch_name: Option<String>,
    pub base_sha: Option<String>,
    pub current_sha: Option<String>,
    pub agent_session_id: Option<String>,
    pub model: Option<String>,
    pub status: SessionStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    pub fn new(session_name: String, repo_owner: String, repo_name: String, repo_default_branch: String) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            session_name,
            title: None,
            repo_owner: repo_owner.to_lowercase(),
            repo_name: repo_name.to_lowercase(),
            repo_default_branch,
            branch_name: None,
            base_sha: None,
            current_sha: None,
            agent_session_id: None,
            model: None,
            status: SessionStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    Member,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub github_user_id: Option<String>,
    pub github_login: Option<String>,
    pub github_name: Option<String>,
    pub github_email: Option<String>,
    pub role: ParticipantRole,
    /// ChaCha20-Poly1305-encrypted VCS access token; plaintext never persisted.
    pub encrypted_access_token: Vec<u8>,
    pub token_expires_at: Option<i64>,
    /// SHA-256 hash of the current client WS auth token. Only ever the hash.
    pub ws_auth_token_hash: String,
    pub ws_token_created_at: i64,
    pub joined_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    Web,
    Slack,
    Extension,
    Github,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub author_id: String,
    pub content: String,
    pub source: MessageSource,
    pub model: Option<String>,
    /// JSON-serialized attachment list.
    pub attachments: String,
    /// Opaque JSON context handed back unparsed on completion (e.g. Slack thread ref).
    pub callback_context: Option<String>,
    pub status: MessageStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Message {
    /// Monotonic status transition check — pending < processing < {completed, failed}.
    /// Back-transitions are rejected; same-state re-application is allowed (idempotent).
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self.status, next) {
            (a, b) if a == b => true,
            (Pending, Processing) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ToolCall,
    ToolResult,
    Token,
    Error,
    GitSync,
    Heartbeat,
    ExecutionComplete,
    PushComplete,
    PushError,
    Artifact,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// JSON-serialized payload, shape determined by `event_type`.
    pub payload: String,
    /// Has strict priority over any ambient "currently processing" message
    /// when correlating this event to a Message (§3).
    pub message_id: Option<String>,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Spawning,
    Connecting,
    Warming,
    Syncing,
    Ready,
    Running,
    Stale,
    Snapshotting,
    Stopped,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitSyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub session_id: String,
    pub provider_object_id: Option<String>,
    pub status: SandboxStatus,
    pub git_sync_status: GitSyncStatus,
    /// Plaintext bearer token for this sandbox instance, ≥128 bits entropy, reissued per spawn.
    pub auth_token: String,
    pub last_heartbeat: Option<i64>,
    pub last_activity: i64,
    pub snapshot_image_id: Option<String>,
    pub circuit_breaker_failures: u32,
    pub circuit_breaker_opened_at: Option<i64>,
    pub created_at: i64,
}

impl Sandbox {
    pub fn new(session_id: String, auth_token: String) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            session_id,
            provider_object_id: None,
            status: SandboxStatus::Pending,
            git_sync_status: GitSyncStatus::Pending,
            auth_token,
            last_heartbeat: None,
            last_activity: now,
            snapshot_image_id: None,
            circuit_breaker_failures: 0,
            circuit_breaker_opened_at: None,
            created_at: now,
        }
    }

    /// `warm()` short-circuits whenever the sandbox is already moving toward ready.
    pub fn is_warm_in_progress_or_ready(&self) -> bool {
        matches!(
            self.status,
            SandboxStatus::Pending
                | SandboxStatus::Spawning
                | SandboxStatus::Connecting
                | SandboxStatus::Warming
                | SandboxStatus::Ready
                | SandboxStatus::Running
        )
    }

    pub fn is_usable_for_prompt(&self) -> bool {
        matches!(self.status, SandboxStatus::Ready | SandboxStatus::Running)
    }

    pub fn refused_at_socket_upgrade(&self) -> bool {
        matches!(self.status, SandboxStatus::Stopped | SandboxStatus::Stale)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub url: String,
    /// JSON-serialized metadata.
    pub metadata: Option<String>,
    pub created_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WsClientMapping {
    pub ws_id: String,
    pub session_id: String,
    pub participant_id: String,
    pub client_id: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_status_transitions_are_monotonic() {
        let mut msg_status = MessageStatus::Pending;
        let msg = |s| Message {
            id: "m".into(),
            session_id: "s".into(),
            author_id: "a".into(),
            content: String::new(),
            source: MessageSource::Web,
            model: None,
            attachments: "[]".into(),
            callback_context: None,
            status: s,
            created_at: 0,
            started_at: None,
            completed_at: None,
        };

        assert!(msg(msg_status).can_transition_to(MessageStatus::Processing));
        msg_status = MessageStatus::Processing;
        assert!(msg(msg_status).can_transition_to(MessageStatus::Completed));
        assert!(msg(msg_status).can_transition_to(MessageStatus::Failed));
        assert!(!msg(MessageStatus::Completed).can_transition_to(MessageStatus::Pending));
        assert!(!msg(MessageStatus::Completed).can_transition_to(MessageStatus::Processing));
        assert!(msg(MessageStatus::Completed).can_transition_to(MessageStatus::Completed));
    }

    #[test]
    fn sandbox_stopped_or_stale_refuses_socket_upgrade() {
        let mut sb = Sandbox::new("s".into(), "tok".into());
        sb.status = SandboxStatus::Stopped;
        assert!(sb.refused_at_socket_upgrade());
        sb.status = SandboxStatus::Stale;
        assert!(sb.refused_at_socket_upgrade());
        sb.status = SandboxStatus::Ready;
        assert!(!sb.refused_at_socket_upgrade());
    }
}
