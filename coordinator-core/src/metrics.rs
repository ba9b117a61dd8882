//! Process-wide atomic counters rendered as Prometheus text — ambient
//! observability carried forward from the teacher's `metrics.rs` (referenced
//! by `operator_api.rs`/`reaper.rs` but filtered out of the retrieval pack;
//! rebuilt here with the same shape: a `OnceCell`-held struct of
//! `AtomicU64`/`AtomicI64` counters, a `snapshot()` for programmatic callers,
//! and a `render_prometheus()` for the `/metrics` route).
//!
//! Not named by the distilled spec, but §9's Non-goals never exclude
//! observability — only multi-tenant isolation and sharding — so this stays
//! part of the ambient stack (SPEC_FULL.md, "Supplemented features").

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

static METRICS: OnceCell<Metrics> = OnceCell::new();
static START: OnceCell<Instant> = OnceCell::new();

pub struct Metrics {
    pub sessions_created: AtomicU64,
    pub sandboxes_spawned: AtomicU64,
    pub sandbox_spawn_failures: AtomicU64,
    pub circuit_breaker_trips: AtomicU64,
    pub snapshots_taken: AtomicU64,
    pub messages_enqueued: AtomicU64,
    pub messages_completed: AtomicU64,
    pub messages_failed: AtomicU64,
    pub events_persisted: AtomicU64,
    pub push_attempts: AtomicU64,
    pub push_successes: AtomicU64,
    pub push_timeouts: AtomicU64,
    pub active_client_sockets: AtomicI64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            sessions_created: AtomicU64::new(0),
            sandboxes_spawned: AtomicU64::new(0),
            sandbox_spawn_failures: AtomicU64::new(0),
            circuit_breaker_trips: AtomicU64::new(0),
            snapshots_taken: AtomicU64::new(0),
            messages_enqueued: AtomicU64::new(0),
            messages_completed: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            events_persisted: AtomicU64::new(0),
            push_attempts: AtomicU64::new(0),
            push_successes: AtomicU64::new(0),
            push_timeouts: AtomicU64::new(0),
            active_client_sockets: AtomicI64::new(0),
        }
    }

    pub fn snapshot(&self) -> Vec<(&'static str, i64)> {
        vec![
            ("sessions_created", self.sessions_created.load(Ordering::Relaxed) as i64),
            ("sandboxes_spawned", self.sandboxes_spawned.load(Ordering::Relaxed) as i64),
            ("sandbox_spawn_failures", self.sandbox_spawn_failures.load(Ordering::Relaxed) as i64),
            ("circuit_breaker_trips", self.circuit_breaker_trips.load(Ordering::Relaxed) as i64),
            ("snapshots_taken", self.snapshots_taken.load(Ordering::Relaxed) as i64),
            ("messages_enqueued", self.messages_enqueued.load(Ordering::Relaxed) as i64),
            ("messages_completed", self.messages_completed.load(Ordering::Relaxed) as i64),
            ("messages_failed", self.messages_failed.load(Ordering::Relaxed) as i64),
            ("events_persisted", self.events_persisted.load(Ordering::Relaxed) as i64),
            ("push_attempts", self.push_attempts.load(Ordering::Relaxed) as i64),
            ("push_successes", self.push_successes.load(Ordering::Relaxed) as i64),
            ("push_timeouts", self.push_timeouts.load(Ordering::Relaxed) as i64),
            ("active_client_sockets", self.active_client_sockets.load(Ordering::Relaxed)),
        ]
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.snapshot() {
            out.push_str(&format!("coordinator_{name} {value}\n"));
        }
        out
    }
}

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub fn uptime_secs() -> u64 {
    START.get_or_init(Instant::now).elapsed().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_prometheus_includes_all_counters() {
        let m = metrics();
        m.sessions_created.fetch_add(1, Ordering::Relaxed);
        let body = m.render_prometheus();
        assert!(body.contains("coordinator_sessions_created"));
        assert!(body.contains("coordinator_active_client_sockets"));
    }
}
