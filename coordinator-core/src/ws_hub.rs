//! WebSocket hub — §4.4.
//!
//! Two socket kinds share one hub: client sockets (fan-out broadcast) and
//! exactly one sandbox socket per session. Holds only the in-memory parts
//! that do NOT survive hibernation (§5) — socket handles themselves are
//! runtime state; identity (`ws_id` tags, `ws_client_mapping` rows,
//! `sandbox.auth_token`) is persisted and is what recovery keys off of.
//!
//! No direct teacher precedent (the teacher is pure REST with no WS
//! routes); the registry shape — concurrent maps rather than manually
//! locked `HashMap`s — follows the teacher's general preference for
//! `dashmap` over `Mutex<HashMap>` for runtime registries.

use crate::frames::ServerFrame;
use axum::extract::ws::Message as WsMessage;
use dashmap::DashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

pub type ClientSink = UnboundedSender<WsMessage>;

struct SandboxSocket {
    object_id: String,
    sink: ClientSink,
}

/// Runtime socket registry for one session actor. Rebuilt empty on every
/// reactivation; never itself persisted.
pub struct WsHub {
    /// ws_id -> outbound sink, for every currently-connected client socket.
    clients: DashMap<String, ClientSink>,
    /// At most one sandbox socket at a time; a new connection supersedes the old.
    sandbox: Mutex<Option<SandboxSocket>>,
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}

impl WsHub {
    pub fn new() -> Self {
        Self { clients: DashMap::new(), sandbox: Mutex::new(None) }
    }

    pub fn register_client(&self, ws_id: String, sink: ClientSink) {
        self.clients.insert(ws_id, sink);
    }

    pub fn remove_client(&self, ws_id: &str) {
        self.clients.remove(ws_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Install a new sandbox socket, closing the prior one (1000, "superseded") if any.
    pub fn set_sandbox(&self, object_id: String, sink: ClientSink) {
        let mut guard = self.sandbox.lock().expect("sandbox socket lock poisoned");
        if let Some(prior) = guard.take() {
            let _ = prior.sink.send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                code: 1000,
                reason: "superseded by new sandbox connection".into(),
            })));
        }
        *guard = Some(SandboxSocket { object_id, sink });
    }

    pub fn clear_sandbox(&self) {
        let mut guard = self.sandbox.lock().expect("sandbox socket lock poisoned");
        *guard = None;
    }

    pub fn has_sandbox_socket_for(&self, object_id: &str) -> bool {
        let guard = self.sandbox.lock().expect("sandbox socket lock poisoned");
        guard.as_ref().map(|s| s.object_id == object_id).unwrap_or(false)
    }

    /// Fan out a server frame to every connected client socket. Write
    /// failures close the offending socket and are otherwise swallowed —
    /// WS writes are best-effort and non-blocking (§5).
    pub fn broadcast(&self, frame: &ServerFrame) {
        let payload = match serde_json::to_string(frame) {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "failed to serialize server frame for broadcast");
                return;
            }
        };
        let mut dead = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().send(WsMessage::Text(payload.clone().into())).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for ws_id in dead {
            debug!(ws_id, "dropping client socket with closed sink after broadcast failure");
            self.clients.remove(&ws_id);
        }
    }

    /// Send a command to the resolved sandbox socket. Returns `false` if no
    /// sandbox socket is currently registered (e.g. lost to hibernation and
    /// not yet reconnected) — callers must not treat this as fatal.
    pub fn send_to_sandbox(&self, payload: &serde_json::Value) -> bool {
        let guard = self.sandbox.lock().expect("sandbox socket lock poisoned");
        let Some(sandbox) = guard.as_ref() else {
            return false;
        };
        let text = match serde_json::to_string(payload) {
            Ok(t) => t,
            Err(_) => return false,
        };
        sandbox.sink.send(WsMessage::Text(text.into())).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn broadcast_reaches_all_registered_clients() {
        let hub = WsHub::new();
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        hub.register_client("ws1".into(), tx1);
        hub.register_client("ws2".into(), tx2);

        hub.broadcast(&ServerFrame::SandboxReady);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn broadcast_drops_sockets_whose_sink_is_closed() {
        let hub = WsHub::new();
        let (tx, rx) = unbounded_channel();
        drop(rx); // close the receiver so sends fail
        hub.register_client("ws1".into(), tx);
        assert_eq!(hub.client_count(), 1);

        hub.broadcast(&ServerFrame::SandboxReady);
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn new_sandbox_connection_supersedes_old() {
        let hub = WsHub::new();
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();
        hub.set_sandbox("obj-1".into(), tx1);
        hub.set_sandbox("obj-1".into(), tx2);

        // the old socket should have received a close frame
        let msg = rx1.try_recv().unwrap();
        assert!(matches!(msg, WsMessage::Close(_)));
    }

    #[test]
    fn send_to_sandbox_false_when_unregistered() {
        let hub = WsHub::new();
        assert!(!hub.send_to_sandbox(&serde_json::json!({"type": "stop"})));
    }
}
