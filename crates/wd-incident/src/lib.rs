//! Incident lifecycle engine.
//!
//! One state machine per monitor, with at most one non-resolved incident at
//! any instant:
//!
//! ```text
//!     (none) ──open──► open ──ack──► acknowledged ──resolve──► resolved
//!                        └──────────resolve──────────────────► resolved
//! ```
//!
//! Monitor-status writes and incident transitions share one storage
//! transaction, so "monitor is down" and "an incident is open" cannot
//! diverge on a crash. Live-bus publishes happen strictly after commit, and
//! notification fan-out runs on detached tasks that never block a
//! transition.

#![forbid(unsafe_code)]

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use wd_bus::{IncidentSummary, LiveBus, LiveEvent};
use wd_notify::{fan_out, IncidentEventKind, Notifier, NotifierProvider};
use wd_observe::HubMetrics;
use wd_proto::{Incident, Monitor, MonitorStatus};
use wd_storage::{Storage, StorageError};
use wd_tenant::TenantCtx;

#[derive(Debug, Error)]
pub enum IncidentError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("incident {0} cannot be acknowledged from its current state")]
    NotAcknowledgeable(Uuid),
    #[error("incident {0} is already resolved")]
    AlreadyResolved(Uuid),
}

/// Result of [`IncidentEngine::open_if_needed`].
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    /// A fresh incident was opened and the monitor flipped down.
    Opened(Incident),
    /// An open or acknowledged incident already covered this monitor.
    AlreadyActive(Incident),
}

impl OpenOutcome {
    pub fn incident(&self) -> &Incident {
        match self {
            Self::Opened(i) | Self::AlreadyActive(i) => i,
        }
    }
}

/// The incident engine. Cheap to clone behind [`Arc`]s; one instance serves
/// the whole hub.
pub struct IncidentEngine {
    storage: Arc<dyn Storage>,
    bus: Arc<LiveBus>,
    notifiers: Arc<dyn NotifierProvider>,
    /// Process-wide admin channel, invoked for every event.
    admin: Option<Arc<dyn Notifier>>,
    notifier_deadline: Duration,
    metrics: Arc<HubMetrics>,
}

impl IncidentEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        bus: Arc<LiveBus>,
        notifiers: Arc<dyn NotifierProvider>,
        admin: Option<Arc<dyn Notifier>>,
        notifier_deadline: Duration,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        Self {
            storage,
            bus,
            notifiers,
            admin,
            notifier_deadline,
            metrics,
        }
    }

    /// Open an incident for `monitor` unless one is already active.
    ///
    /// Idempotent under at-least-once invocation: a concurrent or repeated
    /// call observes the existing incident and returns it without error.
    pub async fn open_if_needed(
        &self,
        ctx: &TenantCtx,
        monitor: &Monitor,
    ) -> Result<OpenOutcome, IncidentError> {
        let tx = self.storage.begin().await?;
        if let Some(existing) = tx.incidents().active_for_monitor(ctx, monitor.id).await? {
            // The read is the integrity guard; nothing to write.
            return Ok(OpenOutcome::AlreadyActive(existing));
        }

        let now = Utc::now();
        let incident = tx.incidents().create(ctx, monitor.id, now).await?;
        tx.monitors()
            .update_status(ctx, monitor.id, MonitorStatus::Down)
            .await?;
        tx.commit().await?;

        info!(
            incident_id = %incident.id,
            monitor_id = %monitor.id,
            monitor_name = %monitor.name,
            "incident opened"
        );
        self.metrics.record_incident_opened();
        self.publish_transition(
            ctx,
            LiveEvent::IncidentOpened(IncidentSummary::from(&incident)),
            monitor.id,
            MonitorStatus::Down,
        )
        .await;
        self.dispatch_notifications(ctx, IncidentEventKind::Opened, &incident, monitor);

        Ok(OpenOutcome::Opened(incident))
    }

    /// `open → acknowledged`. Records the acknowledging user and instant; no
    /// notification is sent.
    pub async fn acknowledge(
        &self,
        ctx: &TenantCtx,
        incident_id: Uuid,
        user_id: Uuid,
    ) -> Result<Incident, IncidentError> {
        let acked = self
            .storage
            .incidents()
            .acknowledge(ctx, incident_id, user_id, Utc::now())
            .await
            .map_err(|err| match err {
                StorageError::Conflict(_) => IncidentError::NotAcknowledgeable(incident_id),
                other => IncidentError::Storage(other),
            })?;
        info!(incident_id = %incident_id, user_id = %user_id, "incident acknowledged");
        Ok(acked)
    }

    /// `open|acknowledged → resolved`. Computes time-to-resolve and flips
    /// the monitor up in the same transaction.
    pub async fn resolve(
        &self,
        ctx: &TenantCtx,
        incident_id: Uuid,
        monitor: &Monitor,
    ) -> Result<Incident, IncidentError> {
        let tx = self.storage.begin().await?;
        let resolved = tx
            .incidents()
            .resolve(ctx, incident_id, Utc::now())
            .await
            .map_err(|err| match err {
                StorageError::Conflict(_) => IncidentError::AlreadyResolved(incident_id),
                other => IncidentError::Storage(other),
            })?;
        tx.monitors()
            .update_status(ctx, monitor.id, MonitorStatus::Up)
            .await?;
        tx.commit().await?;

        info!(
            incident_id = %incident_id,
            monitor_id = %monitor.id,
            ttr_seconds = resolved.ttr_seconds.unwrap_or(0),
            "incident resolved"
        );
        self.metrics.record_incident_resolved();
        self.publish_transition(
            ctx,
            LiveEvent::IncidentResolved(IncidentSummary::from(&resolved)),
            monitor.id,
            MonitorStatus::Up,
        )
        .await;
        self.dispatch_notifications(ctx, IncidentEventKind::Resolved, &resolved, monitor);

        Ok(resolved)
    }

    /// Publish the post-commit event triple: the incident edge, the monitor
    /// status, and the refreshed active-incident count.
    async fn publish_transition(
        &self,
        ctx: &TenantCtx,
        incident_event: LiveEvent,
        monitor_id: Uuid,
        status: MonitorStatus,
    ) {
        let tenant = ctx.tenant();
        self.bus.publish(tenant, incident_event);
        self.bus
            .publish(tenant, LiveEvent::MonitorStatus { monitor_id, status });
        match self.storage.incidents().count_active(ctx).await {
            Ok(count) => self
                .bus
                .publish(tenant, LiveEvent::IncidentCount { count }),
            Err(err) => warn!(error = %err, "active incident count unavailable"),
        }
    }

    /// Hand the event to the notifier fan-out on a detached task. The
    /// owning user's enabled channels plus the admin channel each get one
    /// bounded-deadline call; failures are logged and counted, never
    /// propagated.
    fn dispatch_notifications(
        &self,
        ctx: &TenantCtx,
        kind: IncidentEventKind,
        incident: &Incident,
        monitor: &Monitor,
    ) {
        let storage = Arc::clone(&self.storage);
        let provider = Arc::clone(&self.notifiers);
        let admin = self.admin.clone();
        let metrics = Arc::clone(&self.metrics);
        let deadline = self.notifier_deadline;
        let ctx = ctx.clone();
        let incident = incident.clone();
        let monitor = monitor.clone();

        tokio::spawn(async move {
            let owner = match storage.agents().get(&ctx, monitor.agent_id).await {
                Ok(agent) => agent.user_id,
                Err(err) => {
                    warn!(error = %err, monitor_id = %monitor.id, "owner lookup failed, skipping notifications");
                    return;
                }
            };

            let mut notifiers = provider.notifiers_for_user(&ctx, owner).await;
            if let Some(admin) = admin {
                notifiers.push(admin);
            }
            if notifiers.is_empty() {
                return;
            }

            let report = fan_out(&notifiers, kind, &incident, &monitor, deadline).await;
            for failure in &report.failures {
                metrics.record_notify_failure();
                warn!(
                    channel = failure.channel,
                    incident_id = %incident.id,
                    error = %failure.error,
                    "notification delivery failed"
                );
            }
        });
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
