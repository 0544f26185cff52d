//! Check schedule dispatcher.
//!
//! Keeps every connected agent running exactly its enabled monitor set, with
//! no polling: agent connects and monitor mutations are the only triggers.
//! Each trigger reloads the configured set, diffs it against the session's
//! last-pushed tasks, and enqueues `task`/`task_remove` frames for the
//! difference. The last-pushed record is updated only after a successful
//! enqueue, so a full queue retries on the next trigger.
//!
//! For a single monitor the last enqueued fact wins; ordering across
//! monitors is not guaranteed.

#![forbid(unsafe_code)]

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wd_observe::HubMetrics;
use wd_proto::{Frame, TaskPayload};
use wd_registry::{AgentRegistry, RegistryError, SessionEvent};
use wd_storage::Storage;
use wd_tenant::TenantCtx;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Storage(#[from] wd_storage::StorageError),
}

/// A monitor mutation from the CRUD surface. The dispatcher only needs to
/// know which agent's schedule is dirty; it reloads the full set itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorChange {
    pub agent_id: Uuid,
}

/// What one convergence pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Enqueues refused by a full send queue; retried on the next trigger.
    pub deferred: usize,
}

impl SyncReport {
    pub fn converged(&self) -> bool {
        self.deferred == 0
    }
}

/// The schedule dispatcher. One instance serves all sessions.
pub struct ScheduleDispatcher {
    storage: Arc<dyn Storage>,
    registry: Arc<AgentRegistry>,
    metrics: Arc<HubMetrics>,
}

impl ScheduleDispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<AgentRegistry>,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        Self {
            storage,
            registry,
            metrics,
        }
    }

    /// Converge one agent's session with its configured enabled set. A
    /// disconnected agent is a quiet no-op; it gets a fresh sync on its next
    /// connect event.
    pub async fn sync_agent(&self, agent_id: Uuid) -> Result<SyncReport, DispatchError> {
        let Some(handle) = self.registry.get(agent_id) else {
            debug!(agent_id = %agent_id, "sync skipped, agent offline");
            return Ok(SyncReport::default());
        };

        let ctx = TenantCtx::for_agent(handle.tenant().clone());
        let desired = self
            .storage
            .monitors()
            .list_enabled_by_agent(&ctx, agent_id)
            .await?;
        let pushed = handle.pushed_snapshot();

        let mut report = SyncReport::default();

        // Removals first so an agent never runs a deleted check longer than
        // necessary.
        for monitor_id in pushed.keys() {
            if !desired.iter().any(|m| m.id == *monitor_id) {
                match handle.try_send(Frame::task_remove(*monitor_id)) {
                    Ok(()) => {
                        handle.mark_removed(*monitor_id);
                        self.metrics.record_task_pushed();
                        report.removed += 1;
                    }
                    Err(err) => {
                        warn!(agent_id = %agent_id, monitor_id = %monitor_id, error = %err, "task_remove deferred");
                        report.deferred += 1;
                    }
                }
            }
        }

        for monitor in &desired {
            let task = TaskPayload {
                monitor_id: monitor.id,
                kind: monitor.kind,
                target: monitor.target.clone(),
                interval_secs: monitor.interval_secs,
                timeout_secs: monitor.timeout_secs,
            };
            let is_update = match pushed.get(&monitor.id) {
                Some(previous) if *previous == task => continue,
                Some(_) => true,
                None => false,
            };
            // An edit re-sends one task frame with the new fields; the agent
            // applies it idempotently.
            match handle.try_send(Frame::new(wd_proto::FrameBody::Task(task.clone()))) {
                Ok(()) => {
                    handle.mark_pushed(task);
                    self.metrics.record_task_pushed();
                    if is_update {
                        report.updated += 1;
                    } else {
                        report.added += 1;
                    }
                }
                Err(RegistryError::QueueFull) => {
                    warn!(agent_id = %agent_id, monitor_id = %monitor.id, "task deferred, queue full");
                    report.deferred += 1;
                }
                Err(err) => {
                    debug!(agent_id = %agent_id, error = %err, "session gone mid-sync");
                    report.deferred += 1;
                    break;
                }
            }
        }

        info!(
            agent_id = %agent_id,
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            deferred = report.deferred,
            "schedule synced"
        );
        Ok(report)
    }

    /// Event loop: reacts to agent connects and monitor mutations until
    /// cancelled. No periodic polling. The caller subscribes `sessions`
    /// before any agent can register, so no connect event is missed between
    /// construction and the first poll of this future.
    pub async fn run(
        self: Arc<Self>,
        mut sessions: tokio::sync::broadcast::Receiver<SessionEvent>,
        mut changes: mpsc::Receiver<MonitorChange>,
        cancel: CancellationToken,
    ) {
        info!("schedule dispatcher running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = sessions.recv() => match event {
                    Ok(SessionEvent::Connected { agent_id, .. }) => {
                        if let Err(err) = self.sync_agent(agent_id).await {
                            warn!(agent_id = %agent_id, error = %err, "connect sync failed");
                        }
                    }
                    Ok(SessionEvent::Disconnected { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dispatcher lagged on session events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },

                change = changes.recv() => match change {
                    Some(change) => {
                        if let Err(err) = self.sync_agent(change.agent_id).await {
                            warn!(agent_id = %change.agent_id, error = %err, "mutation sync failed");
                        }
                    }
                    None => break,
                },
            }
        }
        info!("schedule dispatcher stopped");
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
