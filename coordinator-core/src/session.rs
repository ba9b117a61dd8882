//! Session actor — wires the Persistent Store, Lifecycle Manager, Message
//! Queue Engine, WebSocket Hub, and PR/Push Orchestrator into the single
//! object the Façade dispatches to (§2, §9 "actor-per-session_id").
//!
//! Tables are shared `PersistentStore<V>`s (one JSON file per table, per
//! §6.5) rather than one file per session; every operation here filters by
//! `session_id`, matching the shape already established by `queue.rs` and
//! `lifecycle.rs`. Per-session runtime-only state (the WS hub, the pending-push
//! map, the alarm handle) lives in a `SessionRuntime`, created lazily and held
//! in a `DashMap` — this is the part hibernation discards (§5); everything
//! else survives in the stores.

use crate::auth;
use crate::config::Config;
use crate::error::{CoordinatorError, Result};
use crate::frames::{SandboxEvent, ServerFrame};
use crate::lifecycle::LifecycleManager;
use crate::model::{
    Artifact, Event, EventType, Message, MessageSource, MessageStatus, Participant, ParticipantRole, Sandbox,
    Session, SessionStatus, WsClientMapping, new_id, now_ms,
};
use crate::provider::{CreateSandboxConfig, SandboxProviderClient};
use crate::push::PushOrchestrator;
use crate::queue::MessageQueue;
use crate::store::PersistentStore;
use crate::vcs::VcsClient;
use crate::ws_hub::WsHub;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Runtime-only state for one session, discarded on hibernation.
pub struct SessionRuntime {
    pub hub: WsHub,
    pub push: PushOrchestrator,
    /// Per-§5: "each coordinator instance executes strictly one request at a
    /// time... while one handler is awaiting, another incoming message for
    /// the same session queues behind it." Every session-scoped mutating
    /// entry point holds this for its full duration, including any awaited
    /// I/O, so e.g. two concurrent `enqueue_prompt` calls can't both observe
    /// `MessageQueue::process_next`'s peek as empty before either commits
    /// (§8 invariant 1). Different sessions hold different locks and so
    /// still run fully concurrently.
    session_lock: tokio::sync::Mutex<()>,
}

impl SessionRuntime {
    fn new(vcs_api_base_url: String, vcs_app_id: String, vcs_app_private_key_pem: Option<String>) -> Self {
        Self {
            hub: WsHub::new(),
            push: PushOrchestrator::new(VcsClient::new(vcs_api_base_url, vcs_app_id, vcs_app_private_key_pem)),
            session_lock: tokio::sync::Mutex::new(()),
        }
    }
}

/// The coordinator's full persisted state plus the lazily-created per-session
/// runtimes. One `Coordinator` per process; the Façade holds it as shared state.
pub struct Coordinator {
    pub sessions: Arc<PersistentStore<Session>>,
    pub participants: Arc<PersistentStore<Participant>>,
    pub messages: Arc<PersistentStore<Message>>,
    pub events: Arc<PersistentStore<Event>>,
    pub artifacts: Arc<PersistentStore<Artifact>>,
    pub sandboxes: Arc<PersistentStore<Sandbox>>,
    pub ws_client_mapping: Arc<PersistentStore<WsClientMapping>>,
    pub lifecycle: Arc<LifecycleManager>,
    runtimes: DashMap<String, Arc<SessionRuntime>>,
}

impl Coordinator {
    pub fn open() -> Result<Self> {
        let sandboxes = Arc::new(PersistentStore::open("sandbox")?);
        let provider = Arc::new(SandboxProviderClient::new());
        Ok(Self {
            sessions: Arc::new(PersistentStore::open("session")?),
            participants: Arc::new(PersistentStore::open("participants")?),
            messages: Arc::new(PersistentStore::open("messages")?),
            events: Arc::new(PersistentStore::open("events")?),
            artifacts: Arc::new(PersistentStore::open("artifacts")?),
            ws_client_mapping: Arc::new(PersistentStore::open("ws_client_mapping")?),
            lifecycle: Arc::new(LifecycleManager::new(sandboxes.clone(), provider)),
            sandboxes,
            runtimes: DashMap::new(),
        })
    }

    /// Recover or create the in-memory runtime for a session — the actor
    /// "reactivation" step of §9.
    pub fn runtime_for(&self, session_id: &str) -> Arc<SessionRuntime> {
        if let Some(existing) = self.runtimes.get(session_id) {
            return existing.clone();
        }
        let config = Config::load();
        let runtime = Arc::new(SessionRuntime::new(
            config.vcs_api_base_url.clone(),
            config.vcs_app_id.clone(),
            config.vcs_app_private_key_pem.clone(),
        ));
        self.runtimes.insert(session_id.to_string(), runtime.clone());
        runtime
    }

    /// Whether a session currently has any connected client socket. Used by
    /// the inactivity-alarm sweep (§4.2) to decide snapshot-then-stop vs.
    /// re-arm. Sessions with no in-memory runtime (never activated since the
    /// last hibernation) count as having no connected client.
    pub fn has_connected_client(&self, session_id: &str) -> bool {
        self.runtimes.get(session_id).map(|r| r.hub.client_count() > 0).unwrap_or(false)
    }

    fn queue_for<'a>(&'a self, session_id: &str) -> MessageQueue<'a> {
        MessageQueue::new(&self.messages, session_id)
    }

    // -- Session lifecycle -------------------------------------------------

    /// Create a session, keyed externally by `session_name` (§3: "the
    /// routing key" a caller outside the coordinator uses to address this
    /// session). Idempotent on that key so a caller that retries a create
    /// (e.g. a webhook redelivery) gets back the same session rather than a
    /// duplicate.
    pub fn create_session(
        &self,
        session_name: String,
        repo_owner: String,
        repo_name: String,
        repo_default_branch: String,
    ) -> Result<Session> {
        if let Some(existing) = self.get_session_by_name(&session_name)? {
            return Ok(existing);
        }
        let session = Session::new(session_name, repo_owner.to_lowercase(), repo_name.to_lowercase(), repo_default_branch);
        self.sessions.insert(session.id.clone(), session.clone())?;
        crate::metrics::metrics().sessions_created.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(session)
    }

    pub fn get_session_by_name(&self, session_name: &str) -> Result<Option<Session>> {
        self.sessions.find(|s| s.session_name == session_name)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .get(session_id)?
            .ok_or_else(|| CoordinatorError::NotFound(format!("no session {session_id}")))
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = self.sessions.values()?;
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.remove(session_id)
    }

    pub fn archive_session(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .update(session_id, |s| {
                s.status = SessionStatus::Archived;
                s.updated_at = now_ms();
            })?
            .ok_or_else(|| CoordinatorError::NotFound(format!("no session {session_id}")))
    }

    pub fn unarchive_session(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .update(session_id, |s| {
                s.status = SessionStatus::Active;
                s.updated_at = now_ms();
            })?
            .ok_or_else(|| CoordinatorError::NotFound(format!("no session {session_id}")))
    }

    // -- Participants --------------------------------------------------------

    pub fn add_participant(&self, session_id: &str, user_id: String, role: ParticipantRole) -> Result<Participant> {
        let existing = self
            .participants
            .filter(|p| p.session_id == session_id && p.user_id == user_id)?;
        if let Some(existing) = existing.into_iter().next() {
            return Ok(existing);
        }
        let participant = Participant {
            id: new_id(),
            session_id: session_id.to_string(),
            user_id,
            github_user_id: None,
            github_login: None,
            github_name: None,
            github_email: None,
            role,
            encrypted_access_token: Vec::new(),
            token_expires_at: None,
            ws_auth_token_hash: String::new(),
            ws_token_created_at: 0,
            joined_at: now_ms(),
        };
        self.participants.insert(participant.id.clone(), participant.clone())?;
        Ok(participant)
    }

    pub fn list_participants(&self, session_id: &str) -> Result<Vec<Participant>> {
        self.participants.filter(|p| p.session_id == session_id)
    }

    /// Mint and persist a fresh client WS token for a participant. Overwrites
    /// any previously issued hash, invalidating the old token (§8 invariant 5).
    pub fn mint_ws_token(&self, participant_id: &str) -> Result<String> {
        let token = auth::generate_ws_token();
        let hash = auth::sha256_hex(&token);
        self.participants
            .update(participant_id, |p| {
                p.ws_auth_token_hash = hash.clone();
                p.ws_token_created_at = now_ms();
            })?
            .ok_or_else(|| CoordinatorError::NotFound(format!("no participant {participant_id}")))?;
        Ok(token)
    }

    pub fn participant_by_ws_token(&self, session_id: &str, token: &str) -> Result<Option<Participant>> {
        let candidates = self.participants.filter(|p| p.session_id == session_id)?;
        Ok(candidates.into_iter().find(|p| auth::ws_token_matches(token, &p.ws_auth_token_hash)))
    }

    // -- Prompts / Message Queue ---------------------------------------------

    /// Enqueue a prompt, returning the created message and its 1-based queue
    /// position. Kicks queue processing (spawns the sandbox if needed) but
    /// does not block the response on it completing (§4.6).
    pub async fn enqueue_prompt(
        &self,
        session: &Session,
        author_id: String,
        content: String,
        model: Option<String>,
        source: MessageSource,
    ) -> Result<(Message, usize)> {
        let message = Message {
            id: new_id(),
            session_id: session.id.clone(),
            author_id,
            content,
            source,
            model,
            attachments: "[]".into(),
            callback_context: None,
            status: MessageStatus::Pending,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
        };
        let runtime = self.runtime_for(&session.id);
        let _guard = runtime.session_lock.lock().await;

        let queue = self.queue_for(&session.id);
        let position = queue.enqueue(message.clone())?;
        crate::metrics::metrics().messages_enqueued.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        runtime.hub.broadcast(&ServerFrame::PromptQueued { message_id: message.id.clone(), position });

        self.try_advance_queue_locked(session, &runtime).await?;
        Ok((message, position))
    }

    /// Attempt to promote the next pending message. If no sandbox is usable,
    /// triggers a mandatory spawn instead, per §4.3. Acquires the session's
    /// serialization lock itself; callers that already hold it (because
    /// they're mid-handler, e.g. `enqueue_prompt`/`handle_sandbox_event`)
    /// must call `try_advance_queue_locked` directly instead, or this would
    /// deadlock against its own lock.
    pub async fn try_advance_queue(&self, session: &Session) -> Result<()> {
        let runtime = self.runtime_for(&session.id);
        let _guard = runtime.session_lock.lock().await;
        self.try_advance_queue_locked(session, &runtime).await
    }

    async fn try_advance_queue_locked(&self, session: &Session, runtime: &SessionRuntime) -> Result<()> {
        let sandbox = self.sandboxes.find(|s| s.session_id == session.id)?;
        let usable = sandbox.as_ref().map(Sandbox::is_usable_for_prompt).unwrap_or(false);
        let queue = self.queue_for(&session.id);

        if let Some(message) = queue.process_next(usable)? {
            let sandbox = sandbox.expect("process_next only returns Some when a usable sandbox exists");
            self.lifecycle.mark_running(&sandbox.id)?;
            let command = crate::frames::SandboxCommand::Prompt {
                message_id: message.id.clone(),
                content: message.content.clone(),
                model: message.model.clone().unwrap_or_else(|| session.model.clone().unwrap_or_default()),
                author: message.author_id.clone(),
                attachments: None,
            };
            let payload = serde_json::to_value(&command).map_err(CoordinatorError::from)?;
            runtime.hub.send_to_sandbox(&payload);
            runtime.hub.broadcast(&ServerFrame::ProcessingStatus { is_processing: true });
            return Ok(());
        }

        if queue.peek_processing()?.is_none() && queue.pending_or_processing_count()? > 0 && !usable {
            let params = CreateSandboxConfig {
                session_id: session.id.clone(),
                repo_owner: session.repo_owner.clone(),
                repo_name: session.repo_name.clone(),
                base_sha: session.base_sha.clone(),
                cpu_cores: 2,
                memory_mb: 2048,
            };
            match self.lifecycle.spawn(&session.id, &params).await {
                Ok(_) => {}
                Err(err) => {
                    runtime.hub.broadcast(&ServerFrame::SandboxError { message: err.to_string() });
                    warn!(session_id = %session.id, error = %err, "spawn failed while advancing queue");
                }
            }
        }
        Ok(())
    }

    pub fn list_messages(&self, session_id: &str, status: Option<MessageStatus>) -> Result<Vec<Message>> {
        let mut messages = self.messages.filter(|m| {
            m.session_id == session_id && status.is_none_or(|want| m.status == want)
        })?;
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    /// `stop` forwards a stop frame; status updates only on the resulting
    /// `execution_complete(success=false)` (§5 "cancellation").
    pub async fn stop(&self, session: &Session) -> Result<()> {
        let runtime = self.runtime_for(&session.id);
        let _guard = runtime.session_lock.lock().await;

        let queue = self.queue_for(&session.id);
        if queue.peek_processing()?.is_none() {
            return Ok(());
        }
        let payload = serde_json::to_value(crate::frames::SandboxCommand::Stop).map_err(CoordinatorError::from)?;
        runtime.hub.send_to_sandbox(&payload);
        Ok(())
    }

    // -- Events ---------------------------------------------------------------

    pub fn list_artifacts(&self, session_id: &str) -> Result<Vec<Artifact>> {
        let mut artifacts = self.artifacts.filter(|a| a.session_id == session_id)?;
        artifacts.sort_by_key(|a| a.created_at);
        Ok(artifacts)
    }

    /// Cursor-paginated events, oldest-first cursor semantics per §8: at most
    /// `limit` rows, cursor is the `created_at` of the last returned row,
    /// `hasMore` true iff a peek of `limit+1` succeeds.
    pub fn list_events(
        &self,
        session_id: &str,
        cursor: Option<i64>,
        limit: usize,
        event_type: Option<EventType>,
        message_id: Option<&str>,
    ) -> Result<(Vec<Event>, Option<i64>, bool)> {
        let mut events = self.events.filter(|e| {
            e.session_id == session_id
                && cursor.is_none_or(|c| e.created_at > c)
                && event_type.is_none_or(|t| e.event_type == t)
                && message_id.is_none_or(|mid| e.message_id.as_deref() == Some(mid))
        })?;
        events.sort_by_key(|e| e.created_at);
        let has_more = events.len() > limit;
        events.truncate(limit);
        let next_cursor = events.last().map(|e| e.created_at);
        Ok((events, next_cursor, has_more))
    }

    /// Persist and broadcast an inbound sandbox event, dispatching side
    /// effects per event type (§4.2, §4.3, §4.5). The event's own
    /// `message_id` wins over the ambient processing message (§5 ordering).
    pub async fn handle_sandbox_event(&self, session: &Session, sandbox_id: &str, event: SandboxEvent) -> Result<()> {
        let runtime = self.runtime_for(&session.id);
        let _guard = runtime.session_lock.lock().await;

        if runtime.push.resolve_from_event(&event) {
            self.lifecycle.note_sandbox_activity(sandbox_id)?;
        }

        let (event_type, payload, message_id): (EventType, serde_json::Value, Option<String>) = match &event {
            SandboxEvent::Heartbeat => {
                self.lifecycle.record_heartbeat(sandbox_id)?;
                (EventType::Heartbeat, serde_json::Value::Null, None)
            }
            SandboxEvent::Token { content, message_id } => {
                self.lifecycle.note_sandbox_activity(sandbox_id)?;
                (EventType::Token, serde_json::json!({ "content": content }), Some(message_id.clone()))
            }
            SandboxEvent::ToolCall { tool, args, call_id, message_id } => (
                EventType::ToolCall,
                serde_json::json!({ "tool": tool, "args": args, "call_id": call_id }),
                Some(message_id.clone()),
            ),
            SandboxEvent::ToolResult { call_id, result, error, message_id } => (
                EventType::ToolResult,
                serde_json::json!({ "call_id": call_id, "result": result, "error": error }),
                Some(message_id.clone()),
            ),
            SandboxEvent::GitSync { status, sha } => {
                self.sandboxes.update(sandbox_id, |s| {
                    s.git_sync_status = match status.as_str() {
                        "in_progress" => crate::model::GitSyncStatus::InProgress,
                        "completed" => crate::model::GitSyncStatus::Completed,
                        "failed" => crate::model::GitSyncStatus::Failed,
                        _ => crate::model::GitSyncStatus::Pending,
                    };
                })?;
                (EventType::GitSync, serde_json::json!({ "status": status, "sha": sha }), None)
            }
            SandboxEvent::ExecutionComplete { message_id, success } => {
                let queue = self.queue_for(&session.id);
                queue.complete(message_id, *success)?;
                let counter = if *success {
                    &crate::metrics::metrics().messages_completed
                } else {
                    &crate::metrics::metrics().messages_failed
                };
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.lifecycle.on_execution_complete(sandbox_id).await?;
                runtime.hub.broadcast(&ServerFrame::ProcessingStatus { is_processing: false });
                self.try_advance_queue_locked(session, &runtime).await?;
                (
                    EventType::ExecutionComplete,
                    serde_json::json!({ "success": success }),
                    Some(message_id.clone()),
                )
            }
            SandboxEvent::Artifact { artifact_type, url, metadata } => {
                let artifact = Artifact {
                    id: new_id(),
                    session_id: session.id.clone(),
                    artifact_type: artifact_type.clone(),
                    url: url.clone(),
                    metadata: metadata.as_ref().map(|m| m.to_string()),
                    created_at: now_ms(),
                };
                self.artifacts.insert(artifact.id.clone(), artifact.clone())?;
                runtime
                    .hub
                    .broadcast(&ServerFrame::ArtifactCreated { artifact: serde_json::to_value(&artifact).map_err(CoordinatorError::from)? });
                (
                    EventType::Artifact,
                    serde_json::json!({ "artifact_type": artifact_type, "url": url }),
                    None,
                )
            }
            SandboxEvent::PushComplete { branch_name } => {
                (EventType::PushComplete, serde_json::json!({ "branch_name": branch_name }), None)
            }
            SandboxEvent::PushError { branch_name, error } => (
                EventType::PushError,
                serde_json::json!({ "branch_name": branch_name, "error": error }),
                None,
            ),
        };

        let record = Event {
            id: new_id(),
            session_id: session.id.clone(),
            event_type,
            payload: payload.to_string(),
            message_id,
            created_at: now_ms(),
        };
        self.events.insert(record.id.clone(), record.clone())?;
        crate::metrics::metrics().events_persisted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        runtime
            .hub
            .broadcast(&ServerFrame::SandboxEvent { event: serde_json::to_value(&event).map_err(CoordinatorError::from)? });
        Ok(())
    }

    // -- PR / Push ------------------------------------------------------------

    pub async fn create_pull_request(&self, session: &Session, installation_id: &str) -> Result<Artifact> {
        let runtime = self.runtime_for(&session.id);
        let _guard = runtime.session_lock.lock().await;

        let queue = self.queue_for(&session.id);
        let processing = queue.peek_processing()?;
        let message = crate::push::require_processing_author(processing.as_ref())?;

        let author = self
            .participants
            .get(&message.author_id)?
            .ok_or_else(|| CoordinatorError::Unauthenticated("authentication-required".into()))?;

        let config = Config::load();
        let encryption_key = config
            .encryption_root_key
            .as_deref()
            .ok_or_else(|| CoordinatorError::Permanent("token encryption key not configured".into()))?;

        info!(session_id = %session.id, "starting PR creation");
        runtime
            .push
            .create_pull_request(
                &runtime.hub,
                &self.sessions,
                &self.artifacts,
                session,
                &author,
                encryption_key,
                installation_id,
                config.push_timeout,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SandboxStatus;
    use serial_test::serial;

    /// Seed scenario 1 ("happy prompt"), minus the real provider round trip:
    /// a message dispatches to an already-`ready` sandbox, and
    /// `execution_complete` flips it to `completed` and re-opens the queue.
    #[tokio::test]
    #[serial]
    async fn happy_prompt_dispatches_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("COORDINATOR_STATE_DIR", dir.path());
        }

        let coordinator = Coordinator::open().unwrap();
        let session = coordinator.create_session("acme-happy-path".into(), "Acme".into(), "Widgets".into(), "main".into()).unwrap();

        let mut sandbox = Sandbox::new(session.id.clone(), "tok".into());
        sandbox.status = SandboxStatus::Ready;
        sandbox.provider_object_id = Some("obj-1".into());
        coordinator.sandboxes.insert(sandbox.id.clone(), sandbox.clone()).unwrap();

        let runtime = coordinator.runtime_for(&session.id);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        runtime.hub.set_sandbox("obj-1".into(), tx);

        let (message, position) = coordinator
            .enqueue_prompt(&session, "user-1".into(), "rename foo".into(), None, MessageSource::Web)
            .await
            .unwrap();
        assert_eq!(position, 1);

        let dispatched = rx.try_recv().expect("prompt command should have been dispatched to the sandbox");
        let dispatched: serde_json::Value = serde_json::from_str(
            &match dispatched {
                axum::extract::ws::Message::Text(t) => t.to_string(),
                other => panic!("unexpected ws message {other:?}"),
            },
        )
        .unwrap();
        assert_eq!(dispatched["type"], "prompt");
        assert_eq!(dispatched["message_id"], message.id);

        let processing = coordinator.messages.get(&message.id).unwrap().unwrap();
        assert_eq!(processing.status, MessageStatus::Processing);

        coordinator
            .handle_sandbox_event(
                &session,
                &sandbox.id,
                SandboxEvent::ExecutionComplete { message_id: message.id.clone(), success: true },
            )
            .await
            .unwrap();

        let completed = coordinator.messages.get(&message.id).unwrap().unwrap();
        assert_eq!(completed.status, MessageStatus::Completed);
        assert!(completed.completed_at.is_some());

        unsafe {
            std::env::remove_var("COORDINATOR_STATE_DIR");
        }
    }

    /// Seed scenario 2 ("queue ordering"): three prompts enqueued in quick
    /// succession report positions 1, 2, 3 and only one is ever processing.
    #[tokio::test]
    #[serial]
    async fn queue_ordering_reports_sequential_positions() {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("COORDINATOR_STATE_DIR", dir.path());
        }

        let coordinator = Coordinator::open().unwrap();
        let session = coordinator.create_session("acme-session-1".into(), "acme".into(), "widgets".into(), "main".into()).unwrap();

        // No sandbox exists yet, so every enqueue attempts (and fails fast on)
        // a spawn rather than marking anything processing.
        let (_m1, p1) = coordinator
            .enqueue_prompt(&session, "u1".into(), "one".into(), None, MessageSource::Web)
            .await
            .unwrap();
        let (_m2, p2) = coordinator
            .enqueue_prompt(&session, "u1".into(), "two".into(), None, MessageSource::Web)
            .await
            .unwrap();
        let (_m3, p3) = coordinator
            .enqueue_prompt(&session, "u1".into(), "three".into(), None, MessageSource::Web)
            .await
            .unwrap();

        assert_eq!((p1, p2, p3), (1, 2, 3));
        assert!(coordinator.list_messages(&session.id, None).unwrap().iter().all(|m| m.status == MessageStatus::Pending));

        unsafe {
            std::env::remove_var("COORDINATOR_STATE_DIR");
        }
    }

    /// Seed scenario 6 precondition: a PR request with nothing `processing`
    /// is rejected as a logical error, never silently retried.
    #[tokio::test]
    #[serial]
    async fn pr_request_without_processing_message_is_logical_error() {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("COORDINATOR_STATE_DIR", dir.path());
        }

        let coordinator = Coordinator::open().unwrap();
        let session = coordinator.create_session("acme-session-2".into(), "acme".into(), "widgets".into(), "main".into()).unwrap();

        let err = coordinator.create_pull_request(&session, "install-1").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Logical(_)));

        unsafe {
            std::env::remove_var("COORDINATOR_STATE_DIR");
        }
    }

    /// §8 invariant 5: minting a new WS token invalidates the previous one.
    #[tokio::test]
    #[serial]
    async fn minting_ws_token_invalidates_the_previous_one() {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("COORDINATOR_STATE_DIR", dir.path());
        }

        let coordinator = Coordinator::open().unwrap();
        let session = coordinator.create_session("acme-session-3".into(), "acme".into(), "widgets".into(), "main".into()).unwrap();
        let participant = coordinator.add_participant(&session.id, "u1".into(), ParticipantRole::Owner).unwrap();

        let first = coordinator.mint_ws_token(&participant.id).unwrap();
        assert!(coordinator.participant_by_ws_token(&session.id, &first).unwrap().is_some());

        let second = coordinator.mint_ws_token(&participant.id).unwrap();
        assert!(coordinator.participant_by_ws_token(&session.id, &first).unwrap().is_none());
        assert!(coordinator.participant_by_ws_token(&session.id, &second).unwrap().is_some());

        unsafe {
            std::env::remove_var("COORDINATOR_STATE_DIR");
        }
    }
}
