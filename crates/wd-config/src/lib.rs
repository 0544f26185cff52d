//! Hub configuration.
//!
//! A JSON config file with documented defaults, overrideable field-by-field
//! through `WATCHDOG_*` environment variables. The core components read this
//! struct only; they never touch the environment themselves.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration for the WatchDog hub.
///
/// Every timing field is in seconds; accessor methods return [`Duration`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Listen address for the agent WebSocket gateway.
    #[serde(default = "default_gateway_addr")]
    pub gateway_addr: String,

    /// Listen address for the dashboard HTTP surface (SSE).
    #[serde(default = "default_dashboard_addr")]
    pub dashboard_addr: String,

    /// Origins accepted on the WebSocket upgrade. Empty list accepts any
    /// origin (agents typically send none).
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Default consecutive-failure threshold for monitors that do not set
    /// their own.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold_default: u8,

    /// Wall-clock budget for the auth handshake, from upgrade to verified
    /// `auth` frame.
    #[serde(default = "default_auth_deadline")]
    pub auth_deadline_secs: u64,

    /// A session that produces no frame for this long is closed.
    #[serde(default = "default_read_deadline")]
    pub read_deadline_secs: u64,

    /// Per-frame write budget on the session sink.
    #[serde(default = "default_write_deadline")]
    pub write_deadline_secs: u64,

    /// Liveness probe cadence on the writer pump.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Per-session send queue capacity.
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,

    /// Maximum concurrent sessions per source IP. `None` disables the cap.
    #[serde(default)]
    pub per_ip_session_cap: Option<usize>,

    /// Per-call deadline for notifier transports.
    #[serde(default = "default_notifier_deadline")]
    pub notifier_deadline_secs: u64,

    /// Grace window for draining sessions on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_gateway_addr() -> String {
    "0.0.0.0:8721".to_string()
}
fn default_dashboard_addr() -> String {
    "127.0.0.1:8722".to_string()
}
fn default_failure_threshold() -> u8 {
    3
}
fn default_auth_deadline() -> u64 {
    10
}
fn default_read_deadline() -> u64 {
    90
}
fn default_write_deadline() -> u64 {
    10
}
fn default_ping_interval() -> u64 {
    30
}
fn default_send_queue_depth() -> usize {
    256
}
fn default_notifier_deadline() -> u64 {
    10
}
fn default_shutdown_grace() -> u64 {
    10
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            gateway_addr: default_gateway_addr(),
            dashboard_addr: default_dashboard_addr(),
            allowed_origins: Vec::new(),
            failure_threshold_default: default_failure_threshold(),
            auth_deadline_secs: default_auth_deadline(),
            read_deadline_secs: default_read_deadline(),
            write_deadline_secs: default_write_deadline(),
            ping_interval_secs: default_ping_interval(),
            send_queue_depth: default_send_queue_depth(),
            per_ip_session_cap: None,
            notifier_deadline_secs: default_notifier_deadline(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Apply `WATCHDOG_*` environment overrides on top of file values.
    ///
    /// Unparseable values are skipped with a warning rather than aborting
    /// startup.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("WATCHDOG_GATEWAY_ADDR") {
            self.gateway_addr = v;
        }
        if let Ok(v) = std::env::var("WATCHDOG_DASHBOARD_ADDR") {
            self.dashboard_addr = v;
        }
        if let Ok(v) = std::env::var("WATCHDOG_ALLOWED_ORIGINS") {
            self.allowed_origins = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        env_override_u8(
            "WATCHDOG_FAILURE_THRESHOLD",
            &mut self.failure_threshold_default,
        );
        env_override_u64("WATCHDOG_AUTH_DEADLINE_SECS", &mut self.auth_deadline_secs);
        env_override_u64("WATCHDOG_READ_DEADLINE_SECS", &mut self.read_deadline_secs);
        env_override_u64(
            "WATCHDOG_WRITE_DEADLINE_SECS",
            &mut self.write_deadline_secs,
        );
        env_override_u64("WATCHDOG_PING_INTERVAL_SECS", &mut self.ping_interval_secs);
        env_override_usize("WATCHDOG_SEND_QUEUE_DEPTH", &mut self.send_queue_depth);
        if let Ok(v) = std::env::var("WATCHDOG_PER_IP_CAP") {
            match v.parse::<usize>() {
                Ok(0) => self.per_ip_session_cap = None,
                Ok(n) => self.per_ip_session_cap = Some(n),
                Err(e) => warn!(var = "WATCHDOG_PER_IP_CAP", error = %e, "ignoring override"),
            }
        }
        env_override_u64(
            "WATCHDOG_NOTIFIER_DEADLINE_SECS",
            &mut self.notifier_deadline_secs,
        );
        env_override_u64(
            "WATCHDOG_SHUTDOWN_GRACE_SECS",
            &mut self.shutdown_grace_secs,
        );
    }

    pub fn auth_deadline(&self) -> Duration {
        Duration::from_secs(self.auth_deadline_secs)
    }
    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }
    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
    pub fn notifier_deadline(&self) -> Duration {
        Duration::from_secs(self.notifier_deadline_secs)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// True when `origin` passes the allow-list.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(o) => self.allowed_origins.iter().any(|allowed| allowed == o),
            // Agents dial without an Origin header; only browsers send one.
            None => true,
        }
    }
}

fn env_override_u64(var: &str, slot: &mut u64) {
    if let Ok(v) = std::env::var(var) {
        match v.parse() {
            Ok(n) => *slot = n,
            Err(e) => warn!(var, error = %e, "ignoring override"),
        }
    }
}

fn env_override_u8(var: &str, slot: &mut u8) {
    if let Ok(v) = std::env::var(var) {
        match v.parse() {
            Ok(n) => *slot = n,
            Err(e) => warn!(var, error = %e, "ignoring override"),
        }
    }
}

fn env_override_usize(var: &str, slot: &mut usize) {
    if let Ok(v) = std::env::var(var) {
        match v.parse() {
            Ok(n) => *slot = n,
            Err(e) => warn!(var, error = %e, "ignoring override"),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
