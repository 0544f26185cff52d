//! Atomic operation counters for hub internals.
//!
//! Counters are logged at state transitions, not exported; observability
//! surfaces beyond structured logs stay out of the core.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// A thread-safe u64 counter backed by an atomic.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Operation counters for the hub core. Shared via `Arc`.
#[derive(Debug, Default)]
pub struct HubMetrics {
    /// Sessions that completed the auth handshake.
    pub sessions_opened: Counter,
    /// Sessions closed for any reason.
    pub sessions_closed: Counter,
    /// Sessions preempted by a newer handshake for the same agent.
    pub sessions_preempted: Counter,
    /// Handshakes rejected (bad key, expiry, timeout).
    pub auth_rejected: Counter,
    /// Heartbeats persisted.
    pub heartbeats_ingested: Counter,
    /// Heartbeats dropped at validation.
    pub heartbeats_rejected: Counter,
    /// Task/task_remove frames pushed by the dispatcher.
    pub tasks_pushed: Counter,
    /// Incidents opened.
    pub incidents_opened: Counter,
    /// Incidents resolved.
    pub incidents_resolved: Counter,
    /// Notifier calls that returned an error or timed out.
    pub notify_failures: Counter,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.inc();
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed.inc();
    }

    pub fn record_session_preempted(&self) {
        self.sessions_preempted.inc();
        info!(
            counter = "sessions_preempted",
            value = self.sessions_preempted.get(),
            "session preempted"
        );
    }

    pub fn record_auth_rejected(&self) {
        self.auth_rejected.inc();
    }

    pub fn record_heartbeat_ingested(&self) {
        self.heartbeats_ingested.inc();
    }

    pub fn record_heartbeat_rejected(&self) {
        self.heartbeats_rejected.inc();
    }

    pub fn record_task_pushed(&self) {
        self.tasks_pushed.inc();
    }

    pub fn record_incident_opened(&self) {
        self.incidents_opened.inc();
        info!(
            counter = "incidents_opened",
            value = self.incidents_opened.get(),
            "incident opened"
        );
    }

    pub fn record_incident_resolved(&self) {
        self.incidents_resolved.inc();
        info!(
            counter = "incidents_resolved",
            value = self.incidents_resolved.get(),
            "incident resolved"
        );
    }

    pub fn record_notify_failure(&self) {
        self.notify_failures.inc();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
