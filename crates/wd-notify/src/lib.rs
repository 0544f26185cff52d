//! Alert channel contract and transports.
//!
//! Six channel kinds share one open/resolve contract. Notifiers are built
//! from persisted channel descriptors; delivery is best-effort with a
//! bounded per-call deadline, and failures never block an incident
//! transition. The incident id rides along as the dedup key so at-least-once
//! event delivery stays idempotent downstream.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use wd_proto::{Incident, Monitor};
use wd_tenant::TenantCtx;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(String),
    #[error("receiver answered {0}")]
    Status(u16),
    #[error("call exceeded its deadline")]
    Deadline,
}

/// Which lifecycle edge a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentEventKind {
    Opened,
    Resolved,
}

// ─── Contract ────────────────────────────────────────────────────────────────

/// One delivery channel. Implementations are external transports; the core
/// consumes this interface only.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel label for logs and failure reports.
    fn channel(&self) -> &'static str;

    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError>;

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError>;
}

/// Source of the per-user enabled channel descriptors (persisted by the CRUD
/// surface, which is an external collaborator).
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn channels_for_user(&self, ctx: &TenantCtx, user_id: Uuid) -> Vec<ChannelConfig>;
}

/// In-memory directory for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryChannelDirectory {
    channels: parking_lot::RwLock<std::collections::HashMap<Uuid, Vec<ChannelConfig>>>,
}

impl MemoryChannelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_channels(&self, user_id: Uuid, channels: Vec<ChannelConfig>) {
        self.channels.write().insert(user_id, channels);
    }
}

#[async_trait]
impl ChannelDirectory for MemoryChannelDirectory {
    async fn channels_for_user(&self, _ctx: &TenantCtx, user_id: Uuid) -> Vec<ChannelConfig> {
        self.channels.read().get(&user_id).cloned().unwrap_or_default()
    }
}

/// Resolves the set of live notifiers for a user. The incident engine
/// consumes this seam; the default implementation builds transports from the
/// persisted channel descriptors.
#[async_trait]
pub trait NotifierProvider: Send + Sync {
    async fn notifiers_for_user(&self, ctx: &TenantCtx, user_id: Uuid) -> Vec<Arc<dyn Notifier>>;
}

/// [`NotifierProvider`] backed by a [`ChannelDirectory`] and a shared HTTP
/// client.
pub struct ChannelNotifierProvider {
    directory: Arc<dyn ChannelDirectory>,
    client: reqwest::Client,
}

impl ChannelNotifierProvider {
    pub fn new(directory: Arc<dyn ChannelDirectory>, client: reqwest::Client) -> Self {
        Self { directory, client }
    }
}

#[async_trait]
impl NotifierProvider for ChannelNotifierProvider {
    async fn notifiers_for_user(&self, ctx: &TenantCtx, user_id: Uuid) -> Vec<Arc<dyn Notifier>> {
        self.directory
            .channels_for_user(ctx, user_id)
            .await
            .into_iter()
            .map(|config| build_notifier(config, self.client.clone()))
            .collect()
    }
}

// ─── Channel descriptors ─────────────────────────────────────────────────────

/// Persisted per-user channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelConfig {
    Discord { webhook_url: String },
    Slack { webhook_url: String },
    /// Posts to an HTTP mail relay rather than speaking SMTP itself.
    Email { relay_url: String, to: String },
    Telegram { bot_token: String, chat_id: String },
    Pagerduty { routing_key: String },
    Webhook { url: String },
}

impl ChannelConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discord { .. } => "discord",
            Self::Slack { .. } => "slack",
            Self::Email { .. } => "email",
            Self::Telegram { .. } => "telegram",
            Self::Pagerduty { .. } => "pagerduty",
            Self::Webhook { .. } => "webhook",
        }
    }
}

/// Build a notifier from a persisted descriptor.
pub fn build_notifier(config: ChannelConfig, client: reqwest::Client) -> Arc<dyn Notifier> {
    match config {
        ChannelConfig::Discord { webhook_url } => Arc::new(DiscordNotifier {
            client,
            webhook_url,
        }),
        ChannelConfig::Slack { webhook_url } => Arc::new(SlackNotifier {
            client,
            webhook_url,
        }),
        ChannelConfig::Email { relay_url, to } => Arc::new(EmailNotifier {
            client,
            relay_url,
            to,
        }),
        ChannelConfig::Telegram { bot_token, chat_id } => Arc::new(TelegramNotifier {
            client,
            bot_token,
            chat_id,
        }),
        ChannelConfig::Pagerduty { routing_key } => Arc::new(PagerdutyNotifier {
            client,
            routing_key,
        }),
        ChannelConfig::Webhook { url } => Arc::new(WebhookNotifier { client, url }),
    }
}

/// The process-wide admin notifier, configured via `WATCHDOG_ADMIN_WEBHOOK`.
/// Invoked for every incident event in addition to per-user channels.
pub fn admin_notifier_from_env(client: reqwest::Client) -> Option<Arc<dyn Notifier>> {
    let url = std::env::var("WATCHDOG_ADMIN_WEBHOOK").ok()?;
    if url.is_empty() {
        return None;
    }
    Some(Arc::new(WebhookNotifier { client, url }))
}

// ─── Message bodies ──────────────────────────────────────────────────────────

fn summary_line(kind: IncidentEventKind, incident: &Incident, monitor: &Monitor) -> String {
    match kind {
        IncidentEventKind::Opened => format!(
            "[WatchDog] {} ({}) is DOWN — incident {} opened at {}",
            monitor.name,
            monitor.kind,
            incident.id,
            incident.started_at.to_rfc3339()
        ),
        IncidentEventKind::Resolved => format!(
            "[WatchDog] {} ({}) recovered — incident {} resolved after {}s",
            monitor.name,
            monitor.kind,
            incident.id,
            incident.ttr_seconds.unwrap_or(0)
        ),
    }
}

fn webhook_body(
    kind: IncidentEventKind,
    incident: &Incident,
    monitor: &Monitor,
) -> serde_json::Value {
    json!({
        "event": match kind {
            IncidentEventKind::Opened => "incident.opened",
            IncidentEventKind::Resolved => "incident.resolved",
        },
        "dedup_key": incident.id,
        "incident": incident,
        "monitor": {
            "id": monitor.id,
            "name": monitor.name,
            "kind": monitor.kind,
            "target": monitor.target,
        },
    })
}

fn pagerduty_body(
    kind: IncidentEventKind,
    incident: &Incident,
    monitor: &Monitor,
    routing_key: &str,
) -> serde_json::Value {
    match kind {
        IncidentEventKind::Opened => json!({
            "routing_key": routing_key,
            "event_action": "trigger",
            "dedup_key": incident.id,
            "payload": {
                "summary": summary_line(kind, incident, monitor),
                "source": monitor.target,
                "severity": "critical",
                "timestamp": incident.started_at.to_rfc3339(),
            },
        }),
        IncidentEventKind::Resolved => json!({
            "routing_key": routing_key,
            "event_action": "resolve",
            "dedup_key": incident.id,
        }),
    }
}

// ─── Transports ──────────────────────────────────────────────────────────────

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
) -> Result<(), NotifyError> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| NotifyError::Http(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(NotifyError::Status(status.as_u16()));
    }
    Ok(())
}

struct DiscordNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn channel(&self) -> &'static str {
        "discord"
    }

    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body = json!({ "content": summary_line(IncidentEventKind::Opened, incident, monitor) });
        post_json(&self.client, &self.webhook_url, &body).await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body =
            json!({ "content": summary_line(IncidentEventKind::Resolved, incident, monitor) });
        post_json(&self.client, &self.webhook_url, &body).await
    }
}

struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn channel(&self) -> &'static str {
        "slack"
    }

    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body = json!({ "text": summary_line(IncidentEventKind::Opened, incident, monitor) });
        post_json(&self.client, &self.webhook_url, &body).await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body = json!({ "text": summary_line(IncidentEventKind::Resolved, incident, monitor) });
        post_json(&self.client, &self.webhook_url, &body).await
    }
}

struct EmailNotifier {
    client: reqwest::Client,
    relay_url: String,
    to: String,
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn channel(&self) -> &'static str {
        "email"
    }

    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body = json!({
            "to": self.to,
            "subject": format!("[WatchDog] {} is down", monitor.name),
            "body": summary_line(IncidentEventKind::Opened, incident, monitor),
        });
        post_json(&self.client, &self.relay_url, &body).await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body = json!({
            "to": self.to,
            "subject": format!("[WatchDog] {} recovered", monitor.name),
            "body": summary_line(IncidentEventKind::Resolved, incident, monitor),
        });
        post_json(&self.client, &self.relay_url, &body).await
    }
}

struct TelegramNotifier {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn channel(&self) -> &'static str {
        "telegram"
    }

    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": summary_line(IncidentEventKind::Opened, incident, monitor),
        });
        post_json(&self.client, &url, &body).await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": summary_line(IncidentEventKind::Resolved, incident, monitor),
        });
        post_json(&self.client, &url, &body).await
    }
}

struct PagerdutyNotifier {
    client: reqwest::Client,
    routing_key: String,
}

const PAGERDUTY_EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";

#[async_trait]
impl Notifier for PagerdutyNotifier {
    fn channel(&self) -> &'static str {
        "pagerduty"
    }

    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body = pagerduty_body(
            IncidentEventKind::Opened,
            incident,
            monitor,
            &self.routing_key,
        );
        post_json(&self.client, PAGERDUTY_EVENTS_URL, &body).await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body = pagerduty_body(
            IncidentEventKind::Resolved,
            incident,
            monitor,
            &self.routing_key,
        );
        post_json(&self.client, PAGERDUTY_EVENTS_URL, &body).await
    }
}

struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> &'static str {
        "webhook"
    }

    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body = webhook_body(IncidentEventKind::Opened, incident, monitor);
        post_json(&self.client, &self.url, &body).await
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        let body = webhook_body(IncidentEventKind::Resolved, incident, monitor);
        post_json(&self.client, &self.url, &body).await
    }
}

// ─── Fan-out ─────────────────────────────────────────────────────────────────

/// One channel's delivery failure, collected rather than propagated.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub channel: &'static str,
    pub error: NotifyError,
}

/// What a fan-out round did.
#[derive(Debug, Default)]
pub struct FanoutReport {
    pub attempted: usize,
    pub failures: Vec<DeliveryFailure>,
}

impl FanoutReport {
    pub fn delivered(&self) -> usize {
        self.attempted - self.failures.len()
    }
}

/// Invoke every notifier concurrently, each behind `deadline`. Errors are
/// collected and logged; they never propagate to the incident transition.
pub async fn fan_out(
    notifiers: &[Arc<dyn Notifier>],
    kind: IncidentEventKind,
    incident: &Incident,
    monitor: &Monitor,
    deadline: Duration,
) -> FanoutReport {
    let mut report = FanoutReport {
        attempted: notifiers.len(),
        ..FanoutReport::default()
    };

    let calls = notifiers.iter().map(|notifier| {
        let notifier = Arc::clone(notifier);
        let incident = incident.clone();
        let monitor = monitor.clone();
        tokio::spawn(async move {
            let call = async {
                match kind {
                    IncidentEventKind::Opened => {
                        notifier.notify_incident_opened(&incident, &monitor).await
                    }
                    IncidentEventKind::Resolved => {
                        notifier.notify_incident_resolved(&incident, &monitor).await
                    }
                }
            };
            let outcome = match tokio::time::timeout(deadline, call).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Deadline),
            };
            (notifier.channel(), outcome)
        })
    });

    for handle in calls.collect::<Vec<_>>() {
        match handle.await {
            Ok((channel, Ok(()))) => {
                debug!(channel, incident_kind = ?kind, "notification delivered");
            }
            Ok((channel, Err(error))) => {
                warn!(channel, error = %error, "notification failed");
                report.failures.push(DeliveryFailure { channel, error });
            }
            Err(join_err) => {
                warn!(error = %join_err, "notifier task panicked");
                report.failures.push(DeliveryFailure {
                    channel: "unknown",
                    error: NotifyError::Http(join_err.to_string()),
                });
            }
        }
    }

    report
}

// ─── Tests ────────────────────────────────────────────────────────────────────
