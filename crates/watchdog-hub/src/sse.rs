//! Dashboard live stream: `/sse/events`.
//!
//! One subscriber per connection, scoped to the caller's tenant. The cookie
//! session itself is an external collaborator; this module consumes a
//! [`ViewerAuth`] resolver and nothing more. Clients reconnect with
//! exponential backoff and refetch state whenever they see a `resync` event.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use wd_bus::{BusMessage, LiveBus};
use wd_tenant::{resolve_tenant, TenantCtx, TenantId};

/// Resolves the viewer's tenant context from request headers. The default
/// implementation maps a configured header, falling back to the
/// single-tenant literal; a production deployment plugs its cookie-session
/// resolver in here.
pub trait ViewerAuth: Send + Sync + 'static {
    fn resolve(&self, headers: &HeaderMap) -> Option<TenantCtx>;
}

/// Header-mapped tenant resolution for single-node deployments.
pub struct HeaderTenantAuth {
    pub header: &'static str,
}

impl Default for HeaderTenantAuth {
    fn default() -> Self {
        Self {
            header: "x-watchdog-tenant",
        }
    }
}

impl ViewerAuth for HeaderTenantAuth {
    fn resolve(&self, headers: &HeaderMap) -> Option<TenantCtx> {
        let mapped = headers
            .get(self.header)
            .and_then(|v| v.to_str().ok())
            .map(TenantId::from);
        let (tenant, source) = resolve_tenant(None, mapped.as_ref());
        Some(TenantCtx::new(tenant, source))
    }
}

#[derive(Clone)]
pub struct SseState {
    pub bus: Arc<LiveBus>,
    pub auth: Arc<dyn ViewerAuth>,
}

pub fn router(state: SseState) -> Router {
    Router::new()
        .route("/sse/events", get(events))
        .with_state(state)
}

async fn events(State(state): State<SseState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(ctx) = state.auth.resolve(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    info!(tenant = %ctx.tenant(), "dashboard stream opened");

    let subscriber = state.bus.subscribe(ctx.tenant());
    Sse::new(event_stream(subscriber))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}

fn event_stream(
    subscriber: wd_bus::BusSubscriber,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(subscriber, |mut subscriber| async move {
        let message = subscriber.recv().await?;
        Some((Ok(to_sse_event(message)), subscriber))
    })
}

/// Map a bus message onto the named-event wire shape.
pub fn to_sse_event(message: BusMessage) -> Event {
    match message {
        BusMessage::Event(event) => {
            let payload = serde_json::to_string(&event).unwrap_or_else(|err| {
                debug!(error = %err, "event payload unserializable");
                "{}".to_string()
            });
            Event::default().event(event.name()).data(payload)
        }
        BusMessage::Lagged { skipped } => Event::default()
            .event("resync")
            .data(format!("{{\"skipped\":{skipped}}}")),
    }
}
