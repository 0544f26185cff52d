//! Per-tenant publish/subscribe for dashboard live streams.
//!
//! No persistence: subscribers that fall behind lose the oldest events and
//! are told to resynchronize by refetching state. Publishers never block.
//!
//! The bus is a process-local singleton. In a multi-process deployment it is
//! not replicated; that is the design's horizontal-scaling boundary.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;
use wd_proto::{AgentStatus, Incident, MonitorStatus};
use wd_tenant::TenantId;

/// Per-subscriber buffer depth. Small on purpose: the stream carries deltas,
/// not history.
pub const SUBSCRIBER_BUFFER: usize = 16;

// ─── Events ──────────────────────────────────────────────────────────────────

/// Minimal incident view pushed to dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentSummary {
    pub incident_id: Uuid,
    pub monitor_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttr_seconds: Option<i64>,
}

impl From<&Incident> for IncidentSummary {
    fn from(incident: &Incident) -> Self {
        Self {
            incident_id: incident.id,
            monitor_id: incident.monitor_id,
            started_at: incident.started_at,
            resolved_at: incident.resolved_at,
            ttr_seconds: incident.ttr_seconds,
        }
    }
}

/// One live event as shipped to SSE consumers. Serialize-only: the event
/// name travels out-of-band as the SSE event field, so the payload shapes
/// are free to overlap.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LiveEvent {
    AgentStatus {
        agent_id: Uuid,
        status: AgentStatus,
    },
    MonitorStatus {
        monitor_id: Uuid,
        status: MonitorStatus,
    },
    IncidentCount {
        count: usize,
    },
    IncidentOpened(IncidentSummary),
    IncidentResolved(IncidentSummary),
}

impl LiveEvent {
    /// The SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentStatus { .. } => "agent-status",
            Self::MonitorStatus { .. } => "monitor-status",
            Self::IncidentCount { .. } => "incident-count",
            Self::IncidentOpened(_) => "incident.opened",
            Self::IncidentResolved(_) => "incident.resolved",
        }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Event(LiveEvent),
    /// The subscriber fell behind and `skipped` events were dropped; it
    /// should refetch state before trusting further deltas.
    Lagged { skipped: u64 },
}

// ─── Bus ─────────────────────────────────────────────────────────────────────

/// The per-tenant live event bus.
#[derive(Default)]
pub struct LiveBus {
    topics: RwLock<HashMap<TenantId, broadcast::Sender<LiveEvent>>>,
}

impl LiveBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish to a tenant's topic. Never blocks; events for tenants without
    /// subscribers are dropped and the idle topic is pruned.
    pub fn publish(&self, tenant: &TenantId, event: LiveEvent) {
        let delivered = {
            let topics = self.topics.read();
            match topics.get(tenant) {
                Some(tx) => tx.send(event).unwrap_or(0),
                None => 0,
            }
        };
        if delivered == 0 {
            let mut topics = self.topics.write();
            if topics
                .get(tenant)
                .is_some_and(|tx| tx.receiver_count() == 0)
            {
                debug!(tenant = %tenant, "pruning idle bus topic");
                topics.remove(tenant);
            }
        } else {
            trace!(tenant = %tenant, subscribers = delivered, "published live event");
        }
    }

    /// Subscribe to a tenant's topic, creating it on first use.
    pub fn subscribe(&self, tenant: &TenantId) -> BusSubscriber {
        let mut topics = self.topics.write();
        let tx = topics
            .entry(tenant.clone())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0);
        BusSubscriber {
            rx: tx.subscribe(),
        }
    }

    /// Live subscriber count for a tenant.
    pub fn subscriber_count(&self, tenant: &TenantId) -> usize {
        self.topics
            .read()
            .get(tenant)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// One dashboard subscription, scoped to a single tenant.
pub struct BusSubscriber {
    rx: broadcast::Receiver<LiveEvent>,
}

impl BusSubscriber {
    /// The next message, or `None` once the topic is closed.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        match self.rx.recv().await {
            Ok(event) => Some(BusMessage::Event(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Some(BusMessage::Lagged { skipped })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
