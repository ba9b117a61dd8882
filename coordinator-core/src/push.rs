//! PR/push orchestrator — §4.5.
//!
//! Brokers a request/response dance over the otherwise one-way sandbox event
//! channel: a `push` command goes out, completion arrives later as a
//! first-class `push_complete`/`push_error` event correlated by branch name.
//! The branch-name-keyed pending-promise map mirrors the teacher's
//! `provision_progress.rs` call-id-keyed map-with-TTL shape. Dual-identity
//! discipline (installation token for the push, prompting user's own token
//! for PR authorship) generalizes the teacher's sidecar-bearer-vs-owner-address
//! split in `runtime.rs`.

use crate::error::{CoordinatorError, Result};
use crate::frames::{SandboxCommand, SandboxEvent, ServerFrame};
use crate::model::{Artifact, Participant, Session, new_id, now_ms};
use crate::store::PersistentStore;
use crate::vcs::VcsClient;
use crate::ws_hub::WsHub;
use crate::auth;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[derive(Debug, Clone)]
pub enum PushOutcome {
    Complete,
    Error(String),
}

struct PendingPush {
    responder: oneshot::Sender<PushOutcome>,
    registered_at: Instant,
}

/// Normalize a branch name for use as a pending-push map key (§4.5: "trim+lowercase").
pub fn normalize_branch_key(branch_name: &str) -> String {
    branch_name.trim().to_lowercase()
}

/// Tracks in-flight push requests keyed by normalized branch name. Lost on
/// hibernation (§5) — in-flight requests during eviction fail fast and the
/// caller must retry, by design; this map is never persisted.
#[derive(Default)]
pub struct PendingPushes {
    inner: Mutex<HashMap<String, PendingPush>>,
}

impl PendingPushes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending push and return a receiver that resolves on
    /// `push_complete`/`push_error`, or is dropped (returning a timeout
    /// error to the awaiter) after `timeout`.
    pub fn register(&self, branch_name: &str, timeout: Duration) -> oneshot::Receiver<PushOutcome> {
        let (tx, rx) = oneshot::channel();
        let key = normalize_branch_key(branch_name);
        {
            let mut guard = self.inner.lock().expect("pending push lock poisoned");
            guard.insert(key.clone(), PendingPush { responder: tx, registered_at: Instant::now() });
        }
        let _ = timeout; // timeout is enforced by the caller via tokio::time::timeout
        rx
    }

    /// Resolve a pending push from a `push_complete`/`push_error` sandbox
    /// event. Cleans the map entry on every resolution path — no orphans.
    pub fn resolve(&self, branch_name: &str, outcome: PushOutcome) -> bool {
        let key = normalize_branch_key(branch_name);
        let mut guard = self.inner.lock().expect("pending push lock poisoned");
        if let Some(pending) = guard.remove(&key) {
            let _ = pending.responder.send(outcome);
            true
        } else {
            false
        }
    }

    /// Remove an entry whose timeout elapsed without resolution (called by
    /// the caller after a `tokio::time::timeout` fires).
    pub fn expire(&self, branch_name: &str) {
        let key = normalize_branch_key(branch_name);
        let mut guard = self.inner.lock().expect("pending push lock poisoned");
        guard.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending push lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Preconditions for a push/PR request — §4.5: the invoking actor must
/// correspond to a Message currently `processing`, and that message's
/// author's VCS token must authorize the call.
pub fn require_processing_author<'a>(
    processing: Option<&'a crate::model::Message>,
) -> Result<&'a crate::model::Message> {
    processing.ok_or_else(|| {
        CoordinatorError::Logical("PR requested with no message currently processing".into())
    })
}

/// Drives the full §4.5 sequence: decrypt the prompting user's token, mint an
/// installation token, push over the sandbox socket, await the result, and
/// create the PR with the user's own token.
pub struct PushOrchestrator {
    vcs: VcsClient,
    pending: PendingPushes,
}

impl PushOrchestrator {
    pub fn new(vcs: VcsClient) -> Self {
        Self { vcs, pending: PendingPushes::new() }
    }

    /// Deterministic branch name from the session id (§4.5 step 3).
    pub fn derive_branch_name(session_id: &str) -> String {
        let prefix_len = session_id.len().min(12);
        format!("agent/{}", &session_id[..prefix_len])
    }

    /// Resolve a pending push from an inbound sandbox event. Returns `true`
    /// if the event correlated to a pending push (i.e. was consumed here).
    pub fn resolve_from_event(&self, event: &SandboxEvent) -> bool {
        match event {
            SandboxEvent::PushComplete { branch_name } => self.pending.resolve(branch_name, PushOutcome::Complete),
            SandboxEvent::PushError { branch_name, error } => {
                self.pending.resolve(branch_name, PushOutcome::Error(error.clone()))
            }
            _ => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_pull_request(
        &self,
        hub: &WsHub,
        sessions: &PersistentStore<Session>,
        artifacts: &PersistentStore<Artifact>,
        session: &Session,
        author: &Participant,
        encryption_root_key: &str,
        installation_id: &str,
        timeout: Duration,
    ) -> Result<Artifact> {
        let user_token = auth::decrypt_access_token(encryption_root_key, &author.encrypted_access_token)
            .map_err(|_| CoordinatorError::Unauthenticated("authentication-required".into()))?;

        let base_branch = self
            .vcs
            .repository_default_branch(&session.repo_owner, &session.repo_name, &user_token)
            .await?;
        let installation_token = self.vcs.mint_installation_token(installation_id).await?;
        let branch_name = Self::derive_branch_name(&session.id);

        crate::metrics::metrics().push_attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let rx = self.pending.register(&branch_name, timeout);
        let command = SandboxCommand::Push {
            branch_name: branch_name.clone(),
            repo_owner: session.repo_owner.clone(),
            repo_name: session.repo_name.clone(),
            github_token: Some(installation_token),
        };
        let payload = serde_json::to_value(&command).map_err(CoordinatorError::from)?;
        if !hub.send_to_sandbox(&payload) {
            self.pending.expire(&branch_name);
            return Err(CoordinatorError::Transient("no sandbox socket available to send push command".into()));
        }

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.pending.expire(&branch_name);
                return Err(CoordinatorError::Transient(format!("Failed to push branch: {branch_name}, promise dropped")));
            }
            Err(_) => {
                self.pending.expire(&branch_name);
                crate::metrics::metrics().push_timeouts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Err(CoordinatorError::Transient(format!("Failed to push branch: {branch_name} timed out")));
            }
        };

        match outcome {
            PushOutcome::Error(err) => Err(CoordinatorError::Permanent(format!("push failed for {branch_name}: {err}"))),
            PushOutcome::Complete => {
                crate::metrics::metrics().push_successes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let pr = self
                    .vcs
                    .create_pull_request(
                        &session.repo_owner,
                        &session.repo_name,
                        &branch_name,
                        &base_branch,
                        &format!("Automated changes from {branch_name}"),
                        &user_token,
                    )
                    .await?;

                let artifact = Artifact {
                    id: new_id(),
                    session_id: session.id.clone(),
                    artifact_type: "pull_request".into(),
                    url: pr.html_url,
                    metadata: Some(serde_json::json!({ "number": pr.number }).to_string()),
                    created_at: now_ms(),
                };
                artifacts.insert(artifact.id.clone(), artifact.clone())?;
                hub.broadcast(&ServerFrame::ArtifactCreated {
                    artifact: serde_json::to_value(&artifact).map_err(CoordinatorError::from)?,
                });
                sessions.update(&session.id, |s| s.branch_name = Some(branch_name.clone()))?;
                Ok(artifact)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[test]
    fn normalize_branch_key_trims_and_lowercases() {
        assert_eq!(normalize_branch_key("  Agent/ABC123  "), "agent/abc123");
    }

    #[tokio::test]
    async fn register_then_resolve_delivers_outcome() {
        let pushes = PendingPushes::new();
        let rx = pushes.register("Agent/Branch-1", Duration::from_secs(5));
        assert!(pushes.resolve("agent/branch-1", PushOutcome::Complete));
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, PushOutcome::Complete));
        assert!(pushes.is_empty());
    }

    #[tokio::test]
    async fn resolve_with_no_pending_entry_returns_false() {
        let pushes = PendingPushes::new();
        assert!(!pushes.resolve("nobody-waiting", PushOutcome::Complete));
    }

    #[tokio::test]
    async fn unresolved_push_times_out_and_is_cleaned_up() {
        let pushes = PendingPushes::new();
        let rx = pushes.register("agent/stuck", Duration::from_millis(20));
        let result = timeout(Duration::from_millis(50), rx).await;
        assert!(result.is_err() || result.unwrap().is_err());
        pushes.expire("agent/stuck");
        assert!(pushes.is_empty());
    }

    #[test]
    fn require_processing_author_rejects_when_nothing_processing() {
        assert!(require_processing_author(None).is_err());
    }

    #[test]
    fn derive_branch_name_is_deterministic_and_prefixed() {
        let a = PushOrchestrator::derive_branch_name("abcdef0123456789");
        let b = PushOrchestrator::derive_branch_name("abcdef0123456789");
        assert_eq!(a, b);
        assert!(a.starts_with("agent/"));
    }

    #[test]
    fn resolve_from_event_matches_push_complete_and_error() {
        let orchestrator = PushOrchestrator::new(VcsClient::new("https://api.example.test".into(), "app".into(), None));
        let rx = orchestrator.pending.register("agent/abc", Duration::from_secs(5));
        let consumed = orchestrator.resolve_from_event(&SandboxEvent::PushComplete { branch_name: "AGENT/ABC".into() });
        assert!(consumed);
        assert!(matches!(rx.try_recv().unwrap(), PushOutcome::Complete));
    }

    #[test]
    fn resolve_from_event_ignores_unrelated_events() {
        let orchestrator = PushOrchestrator::new(VcsClient::new("https://api.example.test".into(), "app".into(), None));
        assert!(!orchestrator.resolve_from_event(&SandboxEvent::Heartbeat));
    }
}
