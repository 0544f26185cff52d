//! Heartbeat ingest pipeline.
//!
//! Every check result a session reports passes through here: validate
//! against the monitor row, persist append-only, then reduce through the
//! consecutive-failure rule into a monitor-status decision. Incident
//! transitions are delegated to the incident engine, which keeps the status
//! write and the incident row in one transaction.
//!
//! Per-monitor ordering comes from the session itself: a monitor is reported
//! by exactly one agent, and that session's reader processes frames in
//! arrival order.

#![forbid(unsafe_code)]

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;
use wd_bus::{LiveBus, LiveEvent};
use wd_incident::{IncidentEngine, OpenOutcome};
use wd_observe::HubMetrics;
use wd_proto::{error_code, Frame, Heartbeat, HeartbeatPayload, Incident, MonitorStatus};
use wd_storage::{Storage, StorageError};
use wd_tenant::TenantCtx;

/// Bounded in-memory retry for heartbeat persistence.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(100);

/// Why a heartbeat was dropped at validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownMonitor,
    TenantMismatch,
    /// The reporting agent does not own the monitor.
    WrongReporter,
}

impl RejectReason {
    /// The protocol `error` frame sent back on the session.
    pub fn error_frame(self, monitor_id: Uuid) -> Frame {
        match self {
            Self::UnknownMonitor => Frame::error(
                error_code::UNKNOWN_MONITOR,
                format!("monitor {monitor_id} does not exist"),
            ),
            Self::TenantMismatch => Frame::error(
                error_code::TENANT_MISMATCH,
                format!("monitor {monitor_id} is outside this session's tenant"),
            ),
            Self::WrongReporter => Frame::error(
                error_code::WRONG_REPORTER,
                format!("monitor {monitor_id} is assigned to a different agent"),
            ),
        }
    }
}

/// State change produced by one heartbeat, if any.
#[derive(Debug, Clone)]
pub enum Transition {
    IncidentOpened(Incident),
    IncidentResolved(Incident),
    /// Status moved without touching the incident table (first `up` on a
    /// pending monitor, for example).
    StatusChanged(MonitorStatus),
}

/// Outcome handed back to the session task.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Dropped at validation; reply with the error frame, keep the session.
    Rejected(RejectReason),
    /// Ingested. `transition` is `None` for steady-state results.
    Processed { transition: Option<Transition> },
}

/// The heartbeat pipeline. One instance serves every session.
pub struct HeartbeatPipeline {
    storage: Arc<dyn Storage>,
    engine: Arc<IncidentEngine>,
    bus: Arc<LiveBus>,
    metrics: Arc<HubMetrics>,
}

impl HeartbeatPipeline {
    pub fn new(
        storage: Arc<dyn Storage>,
        engine: Arc<IncidentEngine>,
        bus: Arc<LiveBus>,
        metrics: Arc<HubMetrics>,
    ) -> Self {
        Self {
            storage,
            engine,
            bus,
            metrics,
        }
    }

    /// Process one heartbeat from the session authenticated as `reporter`
    /// under `ctx`.
    pub async fn process(
        &self,
        ctx: &TenantCtx,
        reporter: Uuid,
        payload: HeartbeatPayload,
    ) -> PipelineOutcome {
        // 1. Validate against the monitor row.
        let monitor = match self.storage.monitors().get(ctx, payload.monitor_id).await {
            Ok(monitor) => monitor,
            Err(StorageError::NotFound { .. }) => {
                self.metrics.record_heartbeat_rejected();
                warn!(monitor_id = %payload.monitor_id, reporter = %reporter, "heartbeat for unknown monitor");
                return PipelineOutcome::Rejected(RejectReason::UnknownMonitor);
            }
            Err(StorageError::TenantMismatch { .. }) => {
                self.metrics.record_heartbeat_rejected();
                warn!(monitor_id = %payload.monitor_id, reporter = %reporter, "heartbeat crossed a tenant boundary");
                return PipelineOutcome::Rejected(RejectReason::TenantMismatch);
            }
            Err(err) => {
                warn!(monitor_id = %payload.monitor_id, error = %err, "monitor lookup failed, dropping heartbeat");
                return PipelineOutcome::Processed { transition: None };
            }
        };
        if monitor.agent_id != reporter {
            self.metrics.record_heartbeat_rejected();
            warn!(
                monitor_id = %monitor.id,
                reporter = %reporter,
                owner = %monitor.agent_id,
                "heartbeat from wrong reporter"
            );
            return PipelineOutcome::Rejected(RejectReason::WrongReporter);
        }

        // 2. Persist append-only, with a bounded retry that never blocks
        //    ingest for long.
        let heartbeat = Heartbeat {
            time: Utc::now(),
            monitor_id: monitor.id,
            agent_id: reporter,
            tenant: ctx.tenant().clone(),
            status: payload.status,
            latency_ms: payload.latency_ms,
            message: payload.message.clone(),
            cert: payload.cert.clone(),
        };
        if !self.persist_with_retry(ctx, &heartbeat).await {
            return PipelineOutcome::Processed { transition: None };
        }
        self.metrics.record_heartbeat_ingested();

        // 3. Reduce to a monitor-status decision.
        let transition = self.reduce(ctx, &monitor, &heartbeat).await;

        // 4. Any frame refreshes the agent's last-seen stamp.
        if let Err(err) = self
            .storage
            .agents()
            .touch_last_seen(ctx, reporter, heartbeat.time)
            .await
        {
            debug!(agent_id = %reporter, error = %err, "last-seen update failed");
        }

        PipelineOutcome::Processed { transition }
    }

    async fn persist_with_retry(&self, ctx: &TenantCtx, heartbeat: &Heartbeat) -> bool {
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.storage.heartbeats().append(ctx, heartbeat.clone()).await {
                Ok(()) => return true,
                Err(err) if err.is_transient() && attempt < PERSIST_ATTEMPTS => {
                    debug!(
                        monitor_id = %heartbeat.monitor_id,
                        attempt,
                        error = %err,
                        "heartbeat append retrying"
                    );
                    tokio::time::sleep(PERSIST_BACKOFF).await;
                }
                Err(err) => {
                    warn!(
                        monitor_id = %heartbeat.monitor_id,
                        error = %err,
                        "heartbeat dropped after {attempt} attempt(s)"
                    );
                    return false;
                }
            }
        }
        false
    }

    /// The consecutive-failure rule.
    ///
    /// An `up` result flips the monitor up and resolves any active incident.
    /// A failure opens an incident only once the most recent `N` results are
    /// all failures, `N` being the monitor's own threshold.
    async fn reduce(
        &self,
        ctx: &TenantCtx,
        monitor: &wd_proto::Monitor,
        heartbeat: &Heartbeat,
    ) -> Option<Transition> {
        if !heartbeat.status.is_failure() {
            return self.reduce_up(ctx, monitor).await;
        }

        let threshold = usize::from(monitor.failure_threshold.clamp(1, 10));
        let recent = match self
            .storage
            .heartbeats()
            .last_n(ctx, monitor.id, threshold)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                warn!(monitor_id = %monitor.id, error = %err, "recent heartbeats unavailable");
                return None;
            }
        };

        let run_complete =
            recent.len() >= threshold && recent.iter().all(|h| h.status.is_failure());
        if !run_complete {
            // Transient failure; tolerated without a state change.
            return None;
        }

        match self.engine.open_if_needed(ctx, monitor).await {
            Ok(OpenOutcome::Opened(incident)) => Some(Transition::IncidentOpened(incident)),
            Ok(OpenOutcome::AlreadyActive(_)) => None,
            Err(err) => {
                // The transaction rolled back; the failure run still holds,
                // so the next heartbeat retries the transition.
                warn!(monitor_id = %monitor.id, error = %err, "incident open failed");
                None
            }
        }
    }

    async fn reduce_up(
        &self,
        ctx: &TenantCtx,
        monitor: &wd_proto::Monitor,
    ) -> Option<Transition> {
        let active = match self
            .storage
            .incidents()
            .active_for_monitor(ctx, monitor.id)
            .await
        {
            Ok(active) => active,
            Err(err) => {
                warn!(monitor_id = %monitor.id, error = %err, "active incident lookup failed");
                None
            }
        };

        if let Some(incident) = active {
            return match self.engine.resolve(ctx, incident.id, monitor).await {
                Ok(resolved) => Some(Transition::IncidentResolved(resolved)),
                Err(err) => {
                    warn!(incident_id = %incident.id, error = %err, "incident resolve failed");
                    None
                }
            };
        }

        // No incident to close; make the status write idempotent and only
        // announce real changes.
        if monitor.status == MonitorStatus::Up {
            return None;
        }
        match self
            .storage
            .monitors()
            .update_status(ctx, monitor.id, MonitorStatus::Up)
            .await
        {
            Ok(()) => {
                self.bus.publish(
                    ctx.tenant(),
                    LiveEvent::MonitorStatus {
                        monitor_id: monitor.id,
                        status: MonitorStatus::Up,
                    },
                );
                Some(Transition::StatusChanged(MonitorStatus::Up))
            }
            Err(err) => {
                warn!(monitor_id = %monitor.id, error = %err, "status update failed");
                None
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use wd_notify::{Notifier, NotifierProvider};
    use wd_proto::{
        AgentRecord, AgentStatus, EncryptedSecret, HeartbeatStatus, IncidentStatus, Monitor,
        MonitorKind,
    };
    use wd_storage::{MemoryStore, Store};
    use wd_tenant::TenantId;

    struct NoNotifiers;

    #[async_trait]
    impl NotifierProvider for NoNotifiers {
        async fn notifiers_for_user(
            &self,
            _ctx: &TenantCtx,
            _user_id: Uuid,
        ) -> Vec<Arc<dyn Notifier>> {
            Vec::new()
        }
    }

    struct Fixture {
        pipeline: HeartbeatPipeline,
        store: Arc<MemoryStore>,
        agent_id: Uuid,
        monitor: Monitor,
        ctx: TenantCtx,
    }

    fn fixture_with_threshold(threshold: u8) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(LiveBus::new());
        let metrics = Arc::new(HubMetrics::new());

        let agent = AgentRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            tenant: TenantId::from("t1"),
            name: "probe-1".to_string(),
            secret: EncryptedSecret {
                ciphertext: "YQ==".to_string(),
                nonce: "YQ==".to_string(),
                key_version: 1,
            },
            expires_at: None,
            last_seen_at: None,
            status: AgentStatus::Online,
            fingerprint: HashMap::new(),
        };
        let monitor = Monitor {
            id: Uuid::new_v4(),
            agent_id: agent.id,
            tenant: TenantId::from("t1"),
            name: "api".to_string(),
            kind: MonitorKind::Http,
            target: "https://api.example.com".to_string(),
            enabled: true,
            interval_secs: 30,
            timeout_secs: 10,
            failure_threshold: threshold,
            status: MonitorStatus::Pending,
        };
        let agent_id = agent.id;
        store.insert_agent(agent);
        store.insert_monitor(monitor.clone()).expect("monitor");

        let engine = Arc::new(IncidentEngine::new(
            store.clone(),
            bus.clone(),
            Arc::new(NoNotifiers),
            None,
            Duration::from_millis(200),
            metrics.clone(),
        ));
        let pipeline = HeartbeatPipeline::new(store.clone(), engine, bus, metrics);

        Fixture {
            pipeline,
            store,
            agent_id,
            monitor,
            ctx: TenantCtx::for_agent(TenantId::from("t1")),
        }
    }

    fn fixture() -> Fixture {
        fixture_with_threshold(3)
    }

    fn payload(monitor_id: Uuid, status: HeartbeatStatus) -> HeartbeatPayload {
        HeartbeatPayload {
            monitor_id,
            status,
            latency_ms: Some(40),
            message: None,
            cert: None,
        }
    }

    async fn feed(f: &Fixture, status: HeartbeatStatus) -> PipelineOutcome {
        f.pipeline
            .process(&f.ctx, f.agent_id, payload(f.monitor.id, status))
            .await
    }

    #[tokio::test]
    async fn test_incident_opens_exactly_at_threshold() {
        let f = fixture();

        for expect_open in [false, false, true] {
            let outcome = feed(&f, HeartbeatStatus::Down).await;
            let opened = matches!(
                outcome,
                PipelineOutcome::Processed {
                    transition: Some(Transition::IncidentOpened(_))
                }
            );
            assert_eq!(opened, expect_open, "outcome: {outcome:?}");
        }

        let incidents = f.store.incidents_for_monitor(f.monitor.id);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].status, IncidentStatus::Open);
        let monitor = f
            .store
            .monitors()
            .get(&f.ctx, f.monitor.id)
            .await
            .expect("monitor");
        assert_eq!(monitor.status, MonitorStatus::Down);
    }

    #[tokio::test]
    async fn test_no_incident_below_threshold() {
        let f = fixture();
        feed(&f, HeartbeatStatus::Down).await;
        feed(&f, HeartbeatStatus::Down).await;
        assert!(f.store.incidents_for_monitor(f.monitor.id).is_empty());
    }

    #[tokio::test]
    async fn test_flapping_below_threshold_never_opens() {
        let f = fixture();
        for status in [
            HeartbeatStatus::Down,
            HeartbeatStatus::Up,
            HeartbeatStatus::Down,
            HeartbeatStatus::Down,
        ] {
            feed(&f, status).await;
        }
        assert!(
            f.store.incidents_for_monitor(f.monitor.id).is_empty(),
            "an up inside the window must reset the run"
        );
        // The up flipped it; the two trailing failures are tolerated.
        let monitor = f
            .store
            .monitors()
            .get(&f.ctx, f.monitor.id)
            .await
            .expect("monitor");
        assert_eq!(monitor.status, MonitorStatus::Up);
    }

    #[tokio::test]
    async fn test_mixed_failure_kinds_count_toward_run() {
        let f = fixture();
        feed(&f, HeartbeatStatus::Down).await;
        feed(&f, HeartbeatStatus::Timeout).await;
        let outcome = feed(&f, HeartbeatStatus::Error).await;
        assert!(matches!(
            outcome,
            PipelineOutcome::Processed {
                transition: Some(Transition::IncidentOpened(_))
            }
        ));
    }

    #[tokio::test]
    async fn test_threshold_one_opens_immediately() {
        let f = fixture_with_threshold(1);
        let outcome = feed(&f, HeartbeatStatus::Down).await;
        assert!(matches!(
            outcome,
            PipelineOutcome::Processed {
                transition: Some(Transition::IncidentOpened(_))
            }
        ));
    }

    #[tokio::test]
    async fn test_up_resolves_active_incident() {
        let f = fixture();
        for _ in 0..3 {
            feed(&f, HeartbeatStatus::Down).await;
        }
        let outcome = feed(&f, HeartbeatStatus::Up).await;
        let resolved = match outcome {
            PipelineOutcome::Processed {
                transition: Some(Transition::IncidentResolved(incident)),
            } => incident,
            other => panic!("expected resolve, got {other:?}"),
        };
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert!(resolved.ttr_seconds.is_some());

        let monitor = f
            .store
            .monitors()
            .get(&f.ctx, f.monitor.id)
            .await
            .expect("monitor");
        assert_eq!(monitor.status, MonitorStatus::Up);
    }

    #[tokio::test]
    async fn test_continued_failures_do_not_stack_incidents() {
        let f = fixture();
        for _ in 0..6 {
            feed(&f, HeartbeatStatus::Down).await;
        }
        assert_eq!(f.store.incidents_for_monitor(f.monitor.id).len(), 1);
    }

    #[tokio::test]
    async fn test_first_up_on_pending_monitor_announces_status() {
        let f = fixture();
        let outcome = feed(&f, HeartbeatStatus::Up).await;
        assert!(matches!(
            outcome,
            PipelineOutcome::Processed {
                transition: Some(Transition::StatusChanged(MonitorStatus::Up))
            }
        ));
        // Second up is idempotent and quiet.
        let outcome = feed(&f, HeartbeatStatus::Up).await;
        assert!(matches!(
            outcome,
            PipelineOutcome::Processed { transition: None }
        ));
    }

    #[tokio::test]
    async fn test_unknown_monitor_rejected_without_row() {
        let f = fixture();
        let ghost = Uuid::new_v4();
        let outcome = f
            .pipeline
            .process(&f.ctx, f.agent_id, payload(ghost, HeartbeatStatus::Down))
            .await;
        assert!(matches!(
            outcome,
            PipelineOutcome::Rejected(RejectReason::UnknownMonitor)
        ));
        assert_eq!(f.store.heartbeat_count(ghost), 0);
    }

    #[tokio::test]
    async fn test_cross_tenant_heartbeat_rejected() {
        let f = fixture();
        let foreign = TenantCtx::for_agent(TenantId::from("t2"));
        let outcome = f
            .pipeline
            .process(
                &foreign,
                f.agent_id,
                payload(f.monitor.id, HeartbeatStatus::Down),
            )
            .await;
        assert!(matches!(
            outcome,
            PipelineOutcome::Rejected(RejectReason::TenantMismatch)
        ));
        assert_eq!(f.store.heartbeat_count(f.monitor.id), 0);
        assert!(f.store.incidents_for_monitor(f.monitor.id).is_empty());
    }

    #[tokio::test]
    async fn test_wrong_reporter_rejected() {
        let f = fixture();
        let other_agent = Uuid::new_v4();
        let outcome = f
            .pipeline
            .process(
                &f.ctx,
                other_agent,
                payload(f.monitor.id, HeartbeatStatus::Down),
            )
            .await;
        assert!(matches!(
            outcome,
            PipelineOutcome::Rejected(RejectReason::WrongReporter)
        ));
        assert_eq!(f.store.heartbeat_count(f.monitor.id), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_last_seen() {
        let f = fixture();
        feed(&f, HeartbeatStatus::Up).await;
        let agent = f
            .store
            .agents()
            .get(&f.ctx, f.agent_id)
            .await
            .expect("agent");
        assert!(agent.last_seen_at.is_some());
    }

    #[test]
    fn test_reject_frames_carry_codes() {
        let id = Uuid::new_v4();
        let frame = RejectReason::TenantMismatch.error_frame(id);
        let encoded = frame.encode().expect("encode");
        assert!(encoded.contains(error_code::TENANT_MISMATCH));
        let frame = RejectReason::WrongReporter.error_frame(id);
        assert!(frame.encode().expect("encode").contains(error_code::WRONG_REPORTER));
    }
}
