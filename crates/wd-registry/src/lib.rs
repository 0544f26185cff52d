//! In-memory index of live agent sessions.
//!
//! The registry holds weak send-handles only: the gateway task owns each
//! session's transport and pumps, and publishing a handle here does not
//! extend the session's lifetime. Non-durable by design; after a restart the
//! map is empty until agents reconnect.
//!
//! Process-local singleton; not replicated across hub processes.

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;
use wd_proto::{Frame, TaskPayload};
use wd_tenant::TenantId;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent {0} has no live session")]
    Offline(Uuid),
    #[error("session send queue is full")]
    QueueFull,
    #[error("session is closing")]
    Closed,
}

// ─── Session handle ──────────────────────────────────────────────────────────

/// A weak handle to one live session: identity, send queue endpoint,
/// cancellation, and the schedule snapshot the dispatcher diffs against.
#[derive(Clone)]
pub struct SessionHandle {
    agent_id: Uuid,
    tenant: TenantId,
    /// Distinguishes a session from its preempting successor.
    session_id: Uuid,
    sender: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    last_pushed: std::sync::Arc<Mutex<HashMap<Uuid, TaskPayload>>>,
}

impl SessionHandle {
    pub fn new(
        agent_id: Uuid,
        tenant: TenantId,
        sender: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent_id,
            tenant,
            session_id: Uuid::new_v4(),
            sender,
            cancel,
            last_pushed: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Non-blocking enqueue. A full queue is an error to the caller; the
    /// session stays up.
    pub fn try_send(&self, frame: Frame) -> Result<(), RegistryError> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RegistryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RegistryError::Closed,
        })
    }

    /// Enqueue a frame the session cannot miss. If the queue is full the
    /// session is beyond saving and gets cancelled instead.
    pub fn send_or_close(&self, frame: Frame) {
        if let Err(err) = self.try_send(frame) {
            debug!(agent_id = %self.agent_id, error = %err, "critical send failed, closing session");
            self.cancel.cancel();
        }
    }

    /// Ask the owning gateway task to tear the session down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Snapshot of the tasks last pushed to this session. The dispatcher
    /// diffs configuration against this; recording full payloads lets it
    /// spot interval/timeout edits, not only additions and removals.
    pub fn pushed_snapshot(&self) -> HashMap<Uuid, TaskPayload> {
        self.last_pushed.lock().clone()
    }

    /// Record a successful `task` enqueue.
    pub fn mark_pushed(&self, task: TaskPayload) {
        self.last_pushed.lock().insert(task.monitor_id, task);
    }

    /// Record a successful `task_remove` enqueue.
    pub fn mark_removed(&self, monitor_id: Uuid) {
        self.last_pushed.lock().remove(&monitor_id);
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// Connect/disconnect fan-out consumed by the dispatcher and the live bus
/// bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { agent_id: Uuid, tenant: TenantId },
    Disconnected { agent_id: Uuid, tenant: TenantId },
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Process-wide mapping from agent id to its live session handle.
///
/// Register/unregister serialize under one lock so the on-connect fan-out
/// observes a consistent view. Callers persist status changes *before*
/// registering; no storage I/O happens under the lock.
pub struct AgentRegistry {
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Insert a session and publish the connect event. When the agent
    /// already has a live session, the older handle is returned so the
    /// caller can close it with a `superseded` goodbye.
    pub fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock();
        let displaced = sessions.insert(handle.agent_id(), handle.clone());
        let _ = self.events.send(SessionEvent::Connected {
            agent_id: handle.agent_id(),
            tenant: handle.tenant().clone(),
        });
        drop(sessions);

        match &displaced {
            Some(old) => info!(
                agent_id = %handle.agent_id(),
                old_session = %old.session_id(),
                new_session = %handle.session_id(),
                "session preempted"
            ),
            None => info!(agent_id = %handle.agent_id(), "agent online"),
        }
        displaced
    }

    /// Remove a session and publish the disconnect event. `session_id`
    /// guards against a preempted session's cleanup removing its successor.
    /// Returns false when the entry was already gone or belongs to a newer
    /// session.
    pub fn unregister(&self, agent_id: Uuid, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.lock();
        let matches = sessions
            .get(&agent_id)
            .is_some_and(|s| s.session_id() == session_id);
        if !matches {
            return false;
        }
        let removed = sessions
            .remove(&agent_id)
            .unwrap_or_else(|| unreachable!("presence checked under the same lock"));
        let _ = self.events.send(SessionEvent::Disconnected {
            agent_id,
            tenant: removed.tenant().clone(),
        });
        drop(sessions);

        info!(agent_id = %agent_id, "agent offline");
        true
    }

    /// Enqueue a frame on an agent's session. Does not take the registry
    /// lock for longer than the lookup; the queue itself is independently
    /// safe.
    pub fn send(&self, agent_id: Uuid, frame: Frame) -> Result<(), RegistryError> {
        let handle = self
            .get(agent_id)
            .ok_or(RegistryError::Offline(agent_id))?;
        handle.try_send(frame)
    }

    pub fn get(&self, agent_id: Uuid) -> Option<SessionHandle> {
        self.sessions.lock().get(&agent_id).cloned()
    }

    pub fn is_online(&self, agent_id: Uuid) -> bool {
        self.sessions.lock().contains_key(&agent_id)
    }

    pub fn online_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// All live handles, for shutdown fan-out.
    pub fn all_sessions(&self) -> Vec<SessionHandle> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Subscribe to connect/disconnect events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
