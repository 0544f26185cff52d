//! Tenant identity and the per-request context carrier.
//!
//! Every persisted row and every storage query in the hub is scoped by a
//! [`TenantId`]. The carrier travels by value through the call graph; storage
//! methods take it as their first parameter, so an untenanted query cannot be
//! written.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The tenant literal used by single-tenant deployments.
pub const DEFAULT_TENANT: &str = "default";

// ─── TenantId ────────────────────────────────────────────────────────────────

/// An opaque tenant identifier.
///
/// Compared byte-for-byte; the hub never interprets its contents beyond
/// equality and map keying.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The `"default"` tenant for single-tenant deployments.
    pub fn default_tenant() -> Self {
        Self(DEFAULT_TENANT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ─── TenantCtx ───────────────────────────────────────────────────────────────

/// How the tenant value was established, in resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantSource {
    /// Read from the authenticated user's row.
    UserRow,
    /// Mapped from a configured request header or host name.
    HeaderMapping,
    /// Read from the authenticated agent's row.
    AgentRow,
    /// Single-tenant fallback.
    Default,
}

/// The per-request tenant context.
///
/// Cheap to clone; passed into every storage and bus call. Optionally carries
/// the acting user for operations that record an actor (incident
/// acknowledgment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantCtx {
    tenant: TenantId,
    source: TenantSource,
    user_id: Option<Uuid>,
}

impl TenantCtx {
    pub fn new(tenant: TenantId, source: TenantSource) -> Self {
        Self {
            tenant,
            source,
            user_id: None,
        }
    }

    /// Context for an authenticated agent session.
    pub fn for_agent(tenant: TenantId) -> Self {
        Self::new(tenant, TenantSource::AgentRow)
    }

    /// Context for an authenticated dashboard user.
    pub fn for_user(tenant: TenantId, user_id: Uuid) -> Self {
        Self {
            tenant,
            source: TenantSource::UserRow,
            user_id: Some(user_id),
        }
    }

    /// Single-tenant fallback context.
    pub fn single_tenant() -> Self {
        Self::new(TenantId::default_tenant(), TenantSource::Default)
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn source(&self) -> TenantSource {
        self.source
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user_id
    }

    /// True when `other` belongs to this context's tenant.
    pub fn owns(&self, other: &TenantId) -> bool {
        &self.tenant == other
    }
}

// ─── Resolution ──────────────────────────────────────────────────────────────

/// Resolve a tenant for an authenticated flow.
///
/// Order: the user row's tenant, then a configured header/host mapping, then
/// the `"default"` literal.
pub fn resolve_tenant(
    user_row_tenant: Option<&TenantId>,
    header_mapping: Option<&TenantId>,
) -> (TenantId, TenantSource) {
    if let Some(t) = user_row_tenant {
        return (t.clone(), TenantSource::UserRow);
    }
    if let Some(t) = header_mapping {
        return (t.clone(), TenantSource::HeaderMapping);
    }
    (TenantId::default_tenant(), TenantSource::Default)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
