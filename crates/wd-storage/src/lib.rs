//! Persistence contract consumed by the hub core.
//!
//! Repository traits for agents, monitors, heartbeats, and incidents, all
//! tenant-scoped: every method takes a [`TenantCtx`] as its first parameter,
//! so a query without a tenant value cannot be expressed. Transactions use a
//! begin/commit guard ([`Transactor::begin`]); every repository call made
//! through the guard belongs to one atomic scope.
//!
//! [`MemoryStore`] is the reference implementation used by the hub's tests
//! and single-node deployments without an external database. It serializes
//! transactions (and auto-commit writes) behind one async gate, which is
//! strictly stronger than the per-monitor row locking the contract requires.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;
use wd_proto::{
    AgentRecord, AgentStatus, Heartbeat, Incident, IncidentStatus, Monitor, MonitorStatus,
};
use wd_tenant::TenantCtx;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("{entity} {id} belongs to another tenant")]
    TenantMismatch { entity: &'static str, id: Uuid },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    fn tenant_mismatch(entity: &'static str, id: Uuid) -> Self {
        Self::TenantMismatch { entity, id }
    }

    /// Transient errors are worth an in-memory retry; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

// ─── Repository contracts ────────────────────────────────────────────────────

#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Pre-tenant lookup used only by the auth handshake. The returned row
    /// carries the tenant the session will run under; everything after this
    /// call is tenant-scoped.
    async fn find_for_auth(&self, agent_id: Uuid) -> StorageResult<AgentRecord>;

    async fn get(&self, ctx: &TenantCtx, agent_id: Uuid) -> StorageResult<AgentRecord>;

    /// Persist a connection-state flip together with the last-seen stamp.
    async fn set_status(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
        status: AgentStatus,
        last_seen_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Refresh `last_seen_at` only (any inbound frame counts).
    async fn touch_last_seen(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Record the host fingerprint on first verified connect. A later
    /// connect with an already-recorded fingerprint is a no-op.
    async fn record_fingerprint(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
        fingerprint: HashMap<String, String>,
    ) -> StorageResult<()>;

    async fn count_by_user(&self, ctx: &TenantCtx, user_id: Uuid) -> StorageResult<usize>;
}

#[async_trait]
pub trait MonitorRepository: Send + Sync {
    async fn get(&self, ctx: &TenantCtx, monitor_id: Uuid) -> StorageResult<Monitor>;

    async fn list_enabled_by_agent(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
    ) -> StorageResult<Vec<Monitor>>;

    async fn update_status(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        status: MonitorStatus,
    ) -> StorageResult<()>;
}

#[async_trait]
pub trait HeartbeatRepository: Send + Sync {
    /// Append one check result. Append-only; rows are never mutated.
    async fn append(&self, ctx: &TenantCtx, heartbeat: Heartbeat) -> StorageResult<()>;

    /// The most recent `n` heartbeats for a monitor, newest first.
    async fn last_n(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        n: usize,
    ) -> StorageResult<Vec<Heartbeat>>;

    /// Heartbeats for a monitor within `[from, to)`, oldest first.
    async fn range(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Heartbeat>>;
}

#[async_trait]
pub trait IncidentRepository: Send + Sync {
    /// The open-or-acknowledged incident for a monitor, if one exists.
    async fn active_for_monitor(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
    ) -> StorageResult<Option<Incident>>;

    async fn get(&self, ctx: &TenantCtx, incident_id: Uuid) -> StorageResult<Incident>;

    /// Create a fresh `open` incident row.
    async fn create(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StorageResult<Incident>;

    /// `open → acknowledged`; records the acknowledging user and instant.
    async fn acknowledge(
        &self,
        ctx: &TenantCtx,
        incident_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StorageResult<Incident>;

    /// `open|acknowledged → resolved`; computes `ttr_seconds` from
    /// `at - started_at` in the same statement.
    async fn resolve(
        &self,
        ctx: &TenantCtx,
        incident_id: Uuid,
        at: DateTime<Utc>,
    ) -> StorageResult<Incident>;

    /// Count of non-resolved incidents for the tenant.
    async fn count_active(&self, ctx: &TenantCtx) -> StorageResult<usize>;
}

// ─── Store + transactions ────────────────────────────────────────────────────

/// Access point for the four repositories.
pub trait Store: Send + Sync {
    fn agents(&self) -> &dyn AgentRepository;
    fn monitors(&self) -> &dyn MonitorRepository;
    fn heartbeats(&self) -> &dyn HeartbeatRepository;
    fn incidents(&self) -> &dyn IncidentRepository;
}

/// A transaction scope. Repository calls made through this handle see and
/// produce one atomic unit; dropping the handle without [`StoreTx::commit`]
/// rolls everything back.
#[async_trait]
pub trait StoreTx: Store {
    async fn commit(self: Box<Self>) -> StorageResult<()>;
}

#[async_trait]
pub trait Transactor: Send + Sync {
    async fn begin(&self) -> StorageResult<Box<dyn StoreTx + '_>>;
}

/// The full persistence surface the hub wires in.
pub trait Storage: Store + Transactor + 'static {}

// ─── In-memory reference implementation ──────────────────────────────────────

#[derive(Default, Clone)]
struct MemoryState {
    agents: HashMap<Uuid, AgentRecord>,
    monitors: HashMap<Uuid, Monitor>,
    /// Append-ordered per monitor.
    heartbeats: HashMap<Uuid, Vec<Heartbeat>>,
    incidents: HashMap<Uuid, Incident>,
}

impl MemoryState {
    fn agent(&self, ctx: &TenantCtx, id: Uuid) -> StorageResult<&AgentRecord> {
        let row = self
            .agents
            .get(&id)
            .ok_or_else(|| StorageError::not_found("agent", id))?;
        if !ctx.owns(&row.tenant) {
            return Err(StorageError::tenant_mismatch("agent", id));
        }
        Ok(row)
    }

    fn agent_mut(&mut self, ctx: &TenantCtx, id: Uuid) -> StorageResult<&mut AgentRecord> {
        let row = self
            .agents
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("agent", id))?;
        if !ctx.owns(&row.tenant) {
            return Err(StorageError::tenant_mismatch("agent", id));
        }
        Ok(row)
    }

    fn monitor(&self, ctx: &TenantCtx, id: Uuid) -> StorageResult<&Monitor> {
        let row = self
            .monitors
            .get(&id)
            .ok_or_else(|| StorageError::not_found("monitor", id))?;
        if !ctx.owns(&row.tenant) {
            return Err(StorageError::tenant_mismatch("monitor", id));
        }
        Ok(row)
    }

    fn monitor_mut(&mut self, ctx: &TenantCtx, id: Uuid) -> StorageResult<&mut Monitor> {
        let row = self
            .monitors
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("monitor", id))?;
        if !ctx.owns(&row.tenant) {
            return Err(StorageError::tenant_mismatch("monitor", id));
        }
        Ok(row)
    }

    fn incident_mut(&mut self, ctx: &TenantCtx, id: Uuid) -> StorageResult<&mut Incident> {
        let row = self
            .incidents
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("incident", id))?;
        if !ctx.owns(&row.tenant) {
            return Err(StorageError::tenant_mismatch("incident", id));
        }
        Ok(row)
    }

    fn last_n_heartbeats(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        n: usize,
    ) -> StorageResult<Vec<Heartbeat>> {
        // The monitor lookup enforces tenancy; rows under it share the tenant.
        self.monitor(ctx, monitor_id)?;
        let rows = self.heartbeats.get(&monitor_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(rows.iter().rev().take(n).cloned().collect())
    }

    fn active_incident(&self, ctx: &TenantCtx, monitor_id: Uuid) -> Option<Incident> {
        self.incidents
            .values()
            .find(|i| i.monitor_id == monitor_id && ctx.owns(&i.tenant) && i.is_active())
            .cloned()
    }
}

/// Shared handle over the memory state; both the store and its transactions
/// operate through it.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    /// Serializes transactions and auto-commit writes.
    gate: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // The methods below model the CRUD surface, which is an external
    // collaborator of the core. Tests and the hub binary use them to seed
    // and mutate configuration.

    pub fn insert_agent(&self, agent: AgentRecord) {
        self.state.write().agents.insert(agent.id, agent);
    }

    pub fn insert_monitor(&self, monitor: Monitor) -> Result<(), wd_proto::MonitorConfigError> {
        monitor.validate()?;
        self.state.write().monitors.insert(monitor.id, monitor);
        Ok(())
    }

    pub fn set_monitor_enabled(&self, monitor_id: Uuid, enabled: bool) {
        if let Some(m) = self.state.write().monitors.get_mut(&monitor_id) {
            m.enabled = enabled;
        }
    }

    pub fn remove_monitor(&self, monitor_id: Uuid) {
        let mut state = self.state.write();
        state.monitors.remove(&monitor_id);
        state.heartbeats.remove(&monitor_id);
    }

    pub fn heartbeat_count(&self, monitor_id: Uuid) -> usize {
        self.state
            .read()
            .heartbeats
            .get(&monitor_id)
            .map_or(0, Vec::len)
    }

    pub fn incidents_for_monitor(&self, monitor_id: Uuid) -> Vec<Incident> {
        self.state
            .read()
            .incidents
            .values()
            .filter(|i| i.monitor_id == monitor_id)
            .cloned()
            .collect()
    }
}

impl Store for MemoryStore {
    fn agents(&self) -> &dyn AgentRepository {
        self
    }
    fn monitors(&self) -> &dyn MonitorRepository {
        self
    }
    fn heartbeats(&self) -> &dyn HeartbeatRepository {
        self
    }
    fn incidents(&self) -> &dyn IncidentRepository {
        self
    }
}

#[async_trait]
impl Transactor for MemoryStore {
    async fn begin(&self) -> StorageResult<Box<dyn StoreTx + '_>> {
        let guard = self.gate.clone().lock_owned().await;
        let snapshot = self.state.read().clone();
        Ok(Box::new(MemoryTx {
            state: self.state.clone(),
            snapshot: Some(snapshot),
            _guard: guard,
        }))
    }
}

impl Storage for MemoryStore {}

// ─── MemoryStore repositories (auto-commit) ──────────────────────────────────

#[async_trait]
impl AgentRepository for MemoryStore {
    async fn find_for_auth(&self, agent_id: Uuid) -> StorageResult<AgentRecord> {
        self.state
            .read()
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("agent", agent_id))
    }

    async fn get(&self, ctx: &TenantCtx, agent_id: Uuid) -> StorageResult<AgentRecord> {
        self.state.read().agent(ctx, agent_id).cloned()
    }

    async fn set_status(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
        status: AgentStatus,
        last_seen_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write();
        let row = state.agent_mut(ctx, agent_id)?;
        row.status = status;
        row.last_seen_at = Some(last_seen_at);
        Ok(())
    }

    async fn touch_last_seen(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write();
        state.agent_mut(ctx, agent_id)?.last_seen_at = Some(at);
        Ok(())
    }

    async fn record_fingerprint(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
        fingerprint: HashMap<String, String>,
    ) -> StorageResult<()> {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write();
        let row = state.agent_mut(ctx, agent_id)?;
        if row.fingerprint.is_empty() && !fingerprint.is_empty() {
            debug!(agent_id = %agent_id, "recording first-connect fingerprint");
            row.fingerprint = fingerprint;
        }
        Ok(())
    }

    async fn count_by_user(&self, ctx: &TenantCtx, user_id: Uuid) -> StorageResult<usize> {
        Ok(self
            .state
            .read()
            .agents
            .values()
            .filter(|a| a.user_id == user_id && ctx.owns(&a.tenant))
            .count())
    }
}

#[async_trait]
impl MonitorRepository for MemoryStore {
    async fn get(&self, ctx: &TenantCtx, monitor_id: Uuid) -> StorageResult<Monitor> {
        self.state.read().monitor(ctx, monitor_id).cloned()
    }

    async fn list_enabled_by_agent(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
    ) -> StorageResult<Vec<Monitor>> {
        Ok(self
            .state
            .read()
            .monitors
            .values()
            .filter(|m| m.agent_id == agent_id && m.enabled && ctx.owns(&m.tenant))
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        status: MonitorStatus,
    ) -> StorageResult<()> {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write();
        state.monitor_mut(ctx, monitor_id)?.status = status;
        Ok(())
    }
}

#[async_trait]
impl HeartbeatRepository for MemoryStore {
    async fn append(&self, ctx: &TenantCtx, heartbeat: Heartbeat) -> StorageResult<()> {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write();
        state.monitor(ctx, heartbeat.monitor_id)?;
        if !ctx.owns(&heartbeat.tenant) {
            return Err(StorageError::tenant_mismatch("heartbeat", heartbeat.monitor_id));
        }
        state
            .heartbeats
            .entry(heartbeat.monitor_id)
            .or_default()
            .push(heartbeat);
        Ok(())
    }

    async fn last_n(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        n: usize,
    ) -> StorageResult<Vec<Heartbeat>> {
        self.state.read().last_n_heartbeats(ctx, monitor_id, n)
    }

    async fn range(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Heartbeat>> {
        let state = self.state.read();
        state.monitor(ctx, monitor_id)?;
        Ok(state
            .heartbeats
            .get(&monitor_id)
            .map(Vec::as_slice).unwrap_or(&[])
            .iter()
            .filter(|h| h.time >= from && h.time < to)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IncidentRepository for MemoryStore {
    async fn active_for_monitor(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
    ) -> StorageResult<Option<Incident>> {
        Ok(self.state.read().active_incident(ctx, monitor_id))
    }

    async fn get(&self, ctx: &TenantCtx, incident_id: Uuid) -> StorageResult<Incident> {
        let state = self.state.read();
        let row = state
            .incidents
            .get(&incident_id)
            .ok_or_else(|| StorageError::not_found("incident", incident_id))?;
        if !ctx.owns(&row.tenant) {
            return Err(StorageError::tenant_mismatch("incident", incident_id));
        }
        Ok(row.clone())
    }

    async fn create(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StorageResult<Incident> {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write();
        create_incident(&mut state, ctx, monitor_id, started_at)
    }

    async fn acknowledge(
        &self,
        ctx: &TenantCtx,
        incident_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StorageResult<Incident> {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write();
        acknowledge_incident(&mut state, ctx, incident_id, user_id, at)
    }

    async fn resolve(
        &self,
        ctx: &TenantCtx,
        incident_id: Uuid,
        at: DateTime<Utc>,
    ) -> StorageResult<Incident> {
        let _gate = self.gate.lock().await;
        let mut state = self.state.write();
        resolve_incident(&mut state, ctx, incident_id, at)
    }

    async fn count_active(&self, ctx: &TenantCtx) -> StorageResult<usize> {
        Ok(self
            .state
            .read()
            .incidents
            .values()
            .filter(|i| ctx.owns(&i.tenant) && i.is_active())
            .count())
    }
}

// Shared mutation helpers so the transactional and auto-commit paths cannot
// drift apart.

fn create_incident(
    state: &mut MemoryState,
    ctx: &TenantCtx,
    monitor_id: Uuid,
    started_at: DateTime<Utc>,
) -> StorageResult<Incident> {
    state.monitor(ctx, monitor_id)?;
    if let Some(existing) = state.active_incident(ctx, monitor_id) {
        return Err(StorageError::Conflict(format!(
            "monitor {monitor_id} already has active incident {}",
            existing.id
        )));
    }
    let incident = Incident {
        id: Uuid::new_v4(),
        monitor_id,
        tenant: ctx.tenant().clone(),
        status: IncidentStatus::Open,
        started_at,
        resolved_at: None,
        ttr_seconds: None,
        acknowledged_by: None,
        acknowledged_at: None,
    };
    state.incidents.insert(incident.id, incident.clone());
    Ok(incident)
}

fn acknowledge_incident(
    state: &mut MemoryState,
    ctx: &TenantCtx,
    incident_id: Uuid,
    user_id: Uuid,
    at: DateTime<Utc>,
) -> StorageResult<Incident> {
    let row = state.incident_mut(ctx, incident_id)?;
    if row.status != IncidentStatus::Open {
        return Err(StorageError::Conflict(format!(
            "incident {incident_id} is {}, not open",
            row.status
        )));
    }
    row.status = IncidentStatus::Acknowledged;
    row.acknowledged_by = Some(user_id);
    row.acknowledged_at = Some(at);
    Ok(row.clone())
}

fn resolve_incident(
    state: &mut MemoryState,
    ctx: &TenantCtx,
    incident_id: Uuid,
    at: DateTime<Utc>,
) -> StorageResult<Incident> {
    let row = state.incident_mut(ctx, incident_id)?;
    if row.status == IncidentStatus::Resolved {
        return Err(StorageError::Conflict(format!(
            "incident {incident_id} is already resolved"
        )));
    }
    row.status = IncidentStatus::Resolved;
    row.resolved_at = Some(at);
    row.ttr_seconds = Some((at - row.started_at).num_seconds());
    Ok(row.clone())
}

// ─── MemoryTx ────────────────────────────────────────────────────────────────

/// A transaction over [`MemoryStore`].
///
/// Holds the store-wide gate for its lifetime; the pre-image snapshot is
/// restored if the guard is dropped without committing.
pub struct MemoryTx {
    state: Arc<RwLock<MemoryState>>,
    snapshot: Option<MemoryState>,
    _guard: OwnedMutexGuard<()>,
}

impl Store for MemoryTx {
    fn agents(&self) -> &dyn AgentRepository {
        self
    }
    fn monitors(&self) -> &dyn MonitorRepository {
        self
    }
    fn heartbeats(&self) -> &dyn HeartbeatRepository {
        self
    }
    fn incidents(&self) -> &dyn IncidentRepository {
        self
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(mut self: Box<Self>) -> StorageResult<()> {
        self.snapshot = None;
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            debug!("rolling back uncommitted transaction");
            *self.state.write() = snapshot;
        }
    }
}

#[async_trait]
impl AgentRepository for MemoryTx {
    async fn find_for_auth(&self, agent_id: Uuid) -> StorageResult<AgentRecord> {
        self.state
            .read()
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("agent", agent_id))
    }

    async fn get(&self, ctx: &TenantCtx, agent_id: Uuid) -> StorageResult<AgentRecord> {
        self.state.read().agent(ctx, agent_id).cloned()
    }

    async fn set_status(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
        status: AgentStatus,
        last_seen_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut state = self.state.write();
        let row = state.agent_mut(ctx, agent_id)?;
        row.status = status;
        row.last_seen_at = Some(last_seen_at);
        Ok(())
    }

    async fn touch_last_seen(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.state.write().agent_mut(ctx, agent_id)?.last_seen_at = Some(at);
        Ok(())
    }

    async fn record_fingerprint(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
        fingerprint: HashMap<String, String>,
    ) -> StorageResult<()> {
        let mut state = self.state.write();
        let row = state.agent_mut(ctx, agent_id)?;
        if row.fingerprint.is_empty() && !fingerprint.is_empty() {
            row.fingerprint = fingerprint;
        }
        Ok(())
    }

    async fn count_by_user(&self, ctx: &TenantCtx, user_id: Uuid) -> StorageResult<usize> {
        Ok(self
            .state
            .read()
            .agents
            .values()
            .filter(|a| a.user_id == user_id && ctx.owns(&a.tenant))
            .count())
    }
}

#[async_trait]
impl MonitorRepository for MemoryTx {
    async fn get(&self, ctx: &TenantCtx, monitor_id: Uuid) -> StorageResult<Monitor> {
        self.state.read().monitor(ctx, monitor_id).cloned()
    }

    async fn list_enabled_by_agent(
        &self,
        ctx: &TenantCtx,
        agent_id: Uuid,
    ) -> StorageResult<Vec<Monitor>> {
        Ok(self
            .state
            .read()
            .monitors
            .values()
            .filter(|m| m.agent_id == agent_id && m.enabled && ctx.owns(&m.tenant))
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        status: MonitorStatus,
    ) -> StorageResult<()> {
        self.state.write().monitor_mut(ctx, monitor_id)?.status = status;
        Ok(())
    }
}

#[async_trait]
impl HeartbeatRepository for MemoryTx {
    async fn append(&self, ctx: &TenantCtx, heartbeat: Heartbeat) -> StorageResult<()> {
        let mut state = self.state.write();
        state.monitor(ctx, heartbeat.monitor_id)?;
        if !ctx.owns(&heartbeat.tenant) {
            return Err(StorageError::tenant_mismatch("heartbeat", heartbeat.monitor_id));
        }
        state
            .heartbeats
            .entry(heartbeat.monitor_id)
            .or_default()
            .push(heartbeat);
        Ok(())
    }

    async fn last_n(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        n: usize,
    ) -> StorageResult<Vec<Heartbeat>> {
        self.state.read().last_n_heartbeats(ctx, monitor_id, n)
    }

    async fn range(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Heartbeat>> {
        let state = self.state.read();
        state.monitor(ctx, monitor_id)?;
        Ok(state
            .heartbeats
            .get(&monitor_id)
            .map(Vec::as_slice).unwrap_or(&[])
            .iter()
            .filter(|h| h.time >= from && h.time < to)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IncidentRepository for MemoryTx {
    async fn active_for_monitor(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
    ) -> StorageResult<Option<Incident>> {
        Ok(self.state.read().active_incident(ctx, monitor_id))
    }

    async fn get(&self, ctx: &TenantCtx, incident_id: Uuid) -> StorageResult<Incident> {
        let state = self.state.read();
        let row = state
            .incidents
            .get(&incident_id)
            .ok_or_else(|| StorageError::not_found("incident", incident_id))?;
        if !ctx.owns(&row.tenant) {
            return Err(StorageError::tenant_mismatch("incident", incident_id));
        }
        Ok(row.clone())
    }

    async fn create(
        &self,
        ctx: &TenantCtx,
        monitor_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> StorageResult<Incident> {
        let mut state = self.state.write();
        create_incident(&mut state, ctx, monitor_id, started_at)
    }

    async fn acknowledge(
        &self,
        ctx: &TenantCtx,
        incident_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> StorageResult<Incident> {
        let mut state = self.state.write();
        acknowledge_incident(&mut state, ctx, incident_id, user_id, at)
    }

    async fn resolve(
        &self,
        ctx: &TenantCtx,
        incident_id: Uuid,
        at: DateTime<Utc>,
    ) -> StorageResult<Incident> {
        let mut state = self.state.write();
        resolve_incident(&mut state, ctx, incident_id, at)
    }

    async fn count_active(&self, ctx: &TenantCtx) -> StorageResult<usize> {
        Ok(self
            .state
            .read()
            .incidents
            .values()
            .filter(|i| ctx.owns(&i.tenant) && i.is_active())
            .count())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
