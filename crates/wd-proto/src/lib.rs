//! Protocol types for the WatchDog agent link.
//!
//! Defines the framed messages exchanged between the hub and probe agents
//! over the persistent WebSocket session, plus the domain entities the hub
//! persists: agents, monitors, heartbeats, and incidents.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;
use wd_tenant::TenantId;

/// Protocol version carried in the `auth` frame.
pub const PROTOCOL_VERSION: u32 = 1;

// ─── Status enums ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Offline,
    Online,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Online => write!(f, "online"),
        }
    }
}

/// Probe types an agent can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    Ping,
    Http,
    Tcp,
    Dns,
    Tls,
    Docker,
    Database,
    System,
}

impl std::fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ping => write!(f, "ping"),
            Self::Http => write!(f, "http"),
            Self::Tcp => write!(f, "tcp"),
            Self::Dns => write!(f, "dns"),
            Self::Tls => write!(f, "tls"),
            Self::Docker => write!(f, "docker"),
            Self::Database => write!(f, "database"),
            Self::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    #[default]
    Pending,
    Up,
    Down,
    Degraded,
}

impl std::fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Outcome of a single check execution as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Up,
    Down,
    Timeout,
    Error,
}

impl HeartbeatStatus {
    /// Everything that is not `up` counts as a failure for the
    /// consecutive-failure rule.
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Up)
    }
}

impl std::fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

// ─── Agent ───────────────────────────────────────────────────────────────────

/// The stored form of an agent's shared secret: AES-256-GCM ciphertext under
/// the hub's process key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// Base64-encoded ciphertext.
    pub ciphertext: String,
    /// Base64-encoded nonce.
    pub nonce: String,
    /// Process-key version used for encryption.
    pub key_version: u32,
}

/// A probe installation as persisted by the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant: TenantId,
    pub name: String,
    pub secret: EncryptedSecret,
    /// Key expiry; a connect attempt after this instant is rejected.
    pub expires_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub status: AgentStatus,
    /// Opaque key→value map recorded on first verified connect.
    #[serde(default)]
    pub fingerprint: HashMap<String, String>,
}

impl AgentRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

/// Default consecutive-failure threshold.
pub const DEFAULT_FAILURE_THRESHOLD: u8 = 3;
/// Valid range for the per-monitor failure threshold.
pub const FAILURE_THRESHOLD_RANGE: std::ops::RangeInclusive<u8> = 1..=10;
/// Minimum check interval in seconds.
pub const MIN_INTERVAL_SECS: u32 = 5;
/// Minimum check timeout in seconds.
pub const MIN_TIMEOUT_SECS: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorConfigError {
    #[error("interval {0}s is below the {MIN_INTERVAL_SECS}s minimum")]
    IntervalTooShort(u32),
    #[error("timeout {timeout}s must be at least {MIN_TIMEOUT_SECS}s and below the interval ({interval}s)")]
    TimeoutOutOfRange { timeout: u32, interval: u32 },
    #[error("failure threshold {0} is outside 1..=10")]
    ThresholdOutOfRange(u8),
}

/// A check definition bound to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub tenant: TenantId,
    pub name: String,
    pub kind: MonitorKind,
    /// Opaque probe target (URL, host:port, container name, ...).
    pub target: String,
    pub enabled: bool,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    /// Consecutive failures required to open an incident (1..=10).
    #[serde(default = "default_threshold")]
    pub failure_threshold: u8,
    pub status: MonitorStatus,
}

fn default_threshold() -> u8 {
    DEFAULT_FAILURE_THRESHOLD
}

impl Monitor {
    /// Check the interval/timeout/threshold invariants.
    pub fn validate(&self) -> Result<(), MonitorConfigError> {
        if self.interval_secs < MIN_INTERVAL_SECS {
            return Err(MonitorConfigError::IntervalTooShort(self.interval_secs));
        }
        if self.timeout_secs < MIN_TIMEOUT_SECS || self.timeout_secs >= self.interval_secs {
            return Err(MonitorConfigError::TimeoutOutOfRange {
                timeout: self.timeout_secs,
                interval: self.interval_secs,
            });
        }
        if !FAILURE_THRESHOLD_RANGE.contains(&self.failure_threshold) {
            return Err(MonitorConfigError::ThresholdOutOfRange(
                self.failure_threshold,
            ));
        }
        Ok(())
    }
}

// ─── Heartbeat ───────────────────────────────────────────────────────────────

/// TLS certificate metadata attached to `tls`-kind check results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertInfo {
    pub not_after: DateTime<Utc>,
    pub issuer: String,
    pub subject: String,
}

/// One persisted check result. Append-only, time-ordered per monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub time: DateTime<Utc>,
    pub monitor_id: Uuid,
    /// The reporting agent.
    pub agent_id: Uuid,
    pub tenant: TenantId,
    pub status: HeartbeatStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<CertInfo>,
}

// ─── Incident ────────────────────────────────────────────────────────────────

/// One failure episode for a monitor.
///
/// At most one non-resolved incident exists per monitor at any instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub monitor_id: Uuid,
    pub tenant: TenantId,
    pub status: IncidentStatus,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// `resolved_at - started_at` in whole seconds, set on resolve.
    pub ttr_seconds: Option<i64>,
    pub acknowledged_by: Option<Uuid>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// True while the episode is still open or acknowledged.
    pub fn is_active(&self) -> bool {
        self.status != IncidentStatus::Resolved
    }
}

// ─── Frames ──────────────────────────────────────────────────────────────────

/// Session close reasons carried in `goodbye` frames.
pub mod close_reason {
    /// A newer session for the same agent preempted this one.
    pub const SUPERSEDED: &str = "superseded";
    /// The hub is shutting down.
    pub const SHUTDOWN: &str = "shutdown";
    /// The session exceeded the read deadline.
    pub const READ_TIMEOUT: &str = "read_timeout";
}

/// Error codes carried in `error` frames.
pub mod error_code {
    pub const MALFORMED: &str = "malformed";
    pub const UNKNOWN_MONITOR: &str = "unknown_monitor";
    pub const TENANT_MISMATCH: &str = "tenant_mismatch";
    pub const WRONG_REPORTER: &str = "wrong_reporter";
    pub const QUEUE_FULL: &str = "queue_full";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// `<agent-uuid>:<64-hex-secret>`.
    pub api_key: String,
    /// Agent protocol version.
    pub version: u32,
    /// Opaque host fingerprint, recorded on first verified connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthAckPayload {
    pub agent_id: Uuid,
    pub agent_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthErrorPayload {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub monitor_id: Uuid,
    pub kind: MonitorKind,
    pub target: String,
    pub interval_secs: u32,
    pub timeout_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRemovePayload {
    pub monitor_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub monitor_id: Uuid,
    pub status: HeartbeatStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<CertInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoodbyePayload {
    pub reason: String,
}

/// Frame body, adjacently tagged as `{type, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FrameBody {
    Auth(AuthPayload),
    AuthAck(AuthAckPayload),
    AuthError(AuthErrorPayload),
    Task(TaskPayload),
    TaskRemove(TaskRemovePayload),
    Heartbeat(HeartbeatPayload),
    Ping,
    Pong,
    Error(ErrorPayload),
    Goodbye(GoodbyePayload),
}

/// The wire envelope: `{type, payload, timestamp}`.
///
/// `timestamp` is the sender's local clock in RFC3339; the hub never trusts
/// it for ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(flatten)]
    pub body: FrameBody,
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    pub fn new(body: FrameBody) -> Self {
        Self {
            body,
            timestamp: Utc::now(),
        }
    }

    pub fn ping() -> Self {
        Self::new(FrameBody::Ping)
    }

    pub fn pong() -> Self {
        Self::new(FrameBody::Pong)
    }

    pub fn task(m: &Monitor) -> Self {
        Self::new(FrameBody::Task(TaskPayload {
            monitor_id: m.id,
            kind: m.kind,
            target: m.target.clone(),
            interval_secs: m.interval_secs,
            timeout_secs: m.timeout_secs,
        }))
    }

    pub fn task_remove(monitor_id: Uuid) -> Self {
        Self::new(FrameBody::TaskRemove(TaskRemovePayload { monitor_id }))
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(FrameBody::Error(ErrorPayload {
            code: code.to_string(),
            message: message.into(),
        }))
    }

    pub fn goodbye(reason: &str) -> Self {
        Self::new(FrameBody::Goodbye(GoodbyePayload {
            reason: reason.to_string(),
        }))
    }

    /// Parse a frame from wire text.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode to wire text.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(interval: u32, timeout: u32, threshold: u8) -> Monitor {
        Monitor {
            id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            tenant: TenantId::from("t1"),
            name: "api".to_string(),
            kind: MonitorKind::Http,
            target: "https://api.example.com/health".to_string(),
            enabled: true,
            interval_secs: interval,
            timeout_secs: timeout,
            failure_threshold: threshold,
            status: MonitorStatus::Pending,
        }
    }

    #[test]
    fn test_monitor_validate_ok() {
        assert!(monitor(30, 10, 3).validate().is_ok());
        assert!(monitor(5, 1, 1).validate().is_ok());
        assert!(monitor(60, 59, 10).validate().is_ok());
    }

    #[test]
    fn test_monitor_validate_interval_floor() {
        assert_eq!(
            monitor(4, 1, 3).validate(),
            Err(MonitorConfigError::IntervalTooShort(4))
        );
    }

    #[test]
    fn test_monitor_validate_timeout_bounds() {
        assert!(matches!(
            monitor(30, 30, 3).validate(),
            Err(MonitorConfigError::TimeoutOutOfRange { .. })
        ));
        assert!(matches!(
            monitor(30, 0, 3).validate(),
            Err(MonitorConfigError::TimeoutOutOfRange { .. })
        ));
    }

    #[test]
    fn test_monitor_validate_threshold_range() {
        assert_eq!(
            monitor(30, 10, 0).validate(),
            Err(MonitorConfigError::ThresholdOutOfRange(0))
        );
        assert_eq!(
            monitor(30, 10, 11).validate(),
            Err(MonitorConfigError::ThresholdOutOfRange(11))
        );
    }

    #[test]
    fn test_heartbeat_status_failure_classification() {
        assert!(!HeartbeatStatus::Up.is_failure());
        assert!(HeartbeatStatus::Down.is_failure());
        assert!(HeartbeatStatus::Timeout.is_failure());
        assert!(HeartbeatStatus::Error.is_failure());
    }

    #[test]
    fn test_frame_envelope_shape() {
        let frame = Frame::task(&monitor(30, 10, 3));
        let s = frame.encode().expect("encode");
        assert!(s.contains(r#""type":"task""#), "missing type tag: {s}");
        assert!(s.contains(r#""payload""#), "missing payload: {s}");
        assert!(s.contains(r#""timestamp""#), "missing timestamp: {s}");
        assert!(s.contains("interval_secs"));
    }

    #[test]
    fn test_ping_frame_has_no_payload() {
        let s = Frame::ping().encode().expect("encode");
        assert!(s.contains(r#""type":"ping""#));
        assert!(!s.contains("payload"), "ping must omit payload: {s}");
    }

    #[test]
    fn test_frame_roundtrip_heartbeat() {
        let frame = Frame::new(FrameBody::Heartbeat(HeartbeatPayload {
            monitor_id: Uuid::new_v4(),
            status: HeartbeatStatus::Timeout,
            latency_ms: Some(5000),
            message: Some("read timed out".to_string()),
            cert: None,
        }));
        let back = Frame::parse(&frame.encode().expect("encode")).expect("parse");
        assert_eq!(back, frame);
    }

    #[test]
    fn test_auth_frame_parses_from_agent_wire_form() {
        let raw = r#"{
            "type": "auth",
            "payload": {"api_key": "0000-abc:deadbeef", "version": 1},
            "timestamp": "2026-03-01T12:00:00Z"
        }"#;
        let frame = Frame::parse(raw).expect("parse");
        match frame.body {
            FrameBody::Auth(ref p) => {
                assert_eq!(p.version, 1);
                assert!(p.fingerprint.is_none());
            }
            ref other => panic!("expected auth, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        let raw = r#"{"type":"exec","payload":{},"timestamp":"2026-03-01T12:00:00Z"}"#;
        assert!(Frame::parse(raw).is_err());
    }

    #[test]
    fn test_goodbye_reason() {
        let s = Frame::goodbye(close_reason::SUPERSEDED)
            .encode()
            .expect("encode");
        assert!(s.contains("superseded"));
    }

    #[test]
    fn test_agent_expiry() {
        let mut agent = AgentRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            tenant: TenantId::from("t1"),
            name: "probe-1".to_string(),
            secret: EncryptedSecret {
                ciphertext: "Y2lwaGVydGV4dA==".to_string(),
                nonce: "bm9uY2U=".to_string(),
                key_version: 1,
            },
            expires_at: None,
            last_seen_at: None,
            status: AgentStatus::Offline,
            fingerprint: HashMap::new(),
        };
        let now = Utc::now();
        assert!(!agent.is_expired(now));
        agent.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(agent.is_expired(now));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(MonitorStatus::Degraded.to_string(), "degraded");
        assert_eq!(HeartbeatStatus::Timeout.to_string(), "timeout");
        assert_eq!(IncidentStatus::Acknowledged.to_string(), "acknowledged");
        assert_eq!(MonitorKind::Database.to_string(), "database");
    }

    #[test]
    fn test_incident_activity() {
        let mut inc = Incident {
            id: Uuid::new_v4(),
            monitor_id: Uuid::new_v4(),
            tenant: TenantId::from("t1"),
            status: IncidentStatus::Open,
            started_at: Utc::now(),
            resolved_at: None,
            ttr_seconds: None,
            acknowledged_by: None,
            acknowledged_at: None,
        };
        assert!(inc.is_active());
        inc.status = IncidentStatus::Acknowledged;
        assert!(inc.is_active());
        inc.status = IncidentStatus::Resolved;
        assert!(!inc.is_active());
    }
}
