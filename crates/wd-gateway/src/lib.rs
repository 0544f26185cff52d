//! Agent WebSocket session gateway.
//!
//! Accepts outbound connections from probe agents at `/ws/agent`, runs the
//! auth handshake, and owns every live session's reader and writer pumps.
//! The registry, dispatcher, and heartbeat pipeline only ever see weak
//! session handles; the transport never leaves this crate.

#![forbid(unsafe_code)]

mod session;

pub use session::SessionEnd;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wd_bus::LiveBus;
use wd_config::HubConfig;
use wd_observe::HubMetrics;
use wd_pipeline::HeartbeatPipeline;
use wd_proto::{close_reason, Frame};
use wd_registry::AgentRegistry;
use wd_secrets::ProcessKey;
use wd_storage::Storage;

/// Everything a session needs, shared across all of them.
pub struct GatewayDeps {
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<AgentRegistry>,
    pub pipeline: Arc<HeartbeatPipeline>,
    pub bus: Arc<LiveBus>,
    pub process_key: Arc<ProcessKey>,
    pub metrics: Arc<HubMetrics>,
    pub config: Arc<HubConfig>,
}

/// The session gateway. One per hub process.
pub struct SessionGateway {
    deps: Arc<GatewayDeps>,
    /// Live connection count per source IP, for the optional cap.
    per_ip: Arc<Mutex<HashMap<IpAddr, usize>>>,
}

impl SessionGateway {
    pub fn new(deps: GatewayDeps) -> Self {
        Self {
            deps: Arc::new(deps),
            per_ip: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Accept loop. Runs until `cancel` fires, then says goodbye to every
    /// session and drains within the configured grace window.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(addr = %local, "agent gateway listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    // Sessions get their own tokens: shutdown must deliver
                    // the goodbye before anything cancels them.
                    Ok((stream, peer)) => self.clone().spawn_connection(stream, peer, CancellationToken::new()),
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }

        self.shutdown().await;
    }

    fn spawn_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        if let Some(cap) = self.deps.config.per_ip_session_cap {
            let mut per_ip = self.per_ip.lock();
            let count = per_ip.entry(peer.ip()).or_insert(0);
            if *count >= cap {
                warn!(peer = %peer, cap, "per-ip session cap reached, dropping connection");
                return;
            }
            *count += 1;
        }

        let gateway = Arc::clone(&self);
        tokio::spawn(async move {
            let end = session::serve_connection(Arc::clone(&gateway.deps), stream, peer, cancel).await;
            debug!(peer = %peer, end = ?end, "connection finished");

            if gateway.deps.config.per_ip_session_cap.is_some() {
                let mut per_ip = gateway.per_ip.lock();
                if let Some(count) = per_ip.get_mut(&peer.ip()) {
                    *count -= 1;
                    if *count == 0 {
                        per_ip.remove(&peer.ip());
                    }
                }
            }
        });
    }

    /// Send `goodbye` to every live session, give them the grace window to
    /// drain, then force-close the stragglers.
    async fn shutdown(&self) {
        let sessions = self.deps.registry.all_sessions();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "gateway shutting down, draining sessions");

        for session in &sessions {
            session.send_or_close(Frame::goodbye(close_reason::SHUTDOWN));
        }

        let grace = self.deps.config.shutdown_grace();
        let deadline = tokio::time::Instant::now() + grace;
        while self.deps.registry.online_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        for session in self.deps.registry.all_sessions() {
            session.close();
        }
    }
}
