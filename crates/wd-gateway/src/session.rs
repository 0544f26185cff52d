//! One agent session: upgrade checks, auth handshake, reader/writer pumps.

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wd_bus::LiveEvent;
use wd_proto::{
    close_reason, error_code, AgentRecord, AgentStatus, AuthAckPayload, AuthErrorPayload,
    AuthPayload, Frame, FrameBody, PROTOCOL_VERSION,
};
use wd_registry::SessionHandle;
use wd_secrets::{parse_api_key, verify_secret};
use wd_tenant::TenantCtx;

use crate::GatewayDeps;

/// The only path agents may upgrade on.
pub const AGENT_PATH: &str = "/ws/agent";

/// Malformed frames tolerated before the session is closed.
const MAX_STRIKES: u32 = 5;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Why a session ended. Transport-level ends are normal operation; the
/// agent reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    UpgradeRejected,
    AuthTimeout,
    AuthRejected,
    ReadTimeout,
    PeerClosed,
    Transport,
    /// Repeated malformed frames.
    ProtocolAbuse,
    Cancelled,
}

/// Serve one TCP connection from upgrade to close.
pub(crate) async fn serve_connection(
    deps: Arc<GatewayDeps>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> SessionEnd {
    // Upgrade: path and Origin are checked before the WebSocket exists.
    let config = Arc::clone(&deps.config);
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != AGENT_PATH {
            return Err(error_response(StatusCode::NOT_FOUND));
        }
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok());
        if !config.origin_allowed(origin) {
            return Err(error_response(StatusCode::FORBIDDEN));
        }
        Ok(resp)
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(err) => {
            debug!(peer = %peer, error = %err, "upgrade rejected");
            return SessionEnd::UpgradeRejected;
        }
    };
    let (mut sink, mut rx_stream) = ws.split();

    // Handshake: the first frame must be `auth`, within the deadline.
    let auth = match timeout(deps.config.auth_deadline(), read_auth(&mut rx_stream)).await {
        Err(_) => {
            deps.metrics.record_auth_rejected();
            warn!(peer = %peer, "auth deadline exceeded");
            let _ = send_now(&mut sink, &auth_error("authentication timed out")).await;
            let _ = sink.send(Message::Close(None)).await;
            return SessionEnd::AuthTimeout;
        }
        Ok(Err(end)) => {
            if end == SessionEnd::AuthRejected {
                deps.metrics.record_auth_rejected();
                let _ = send_now(&mut sink, &auth_error("first frame must be auth")).await;
            }
            let _ = sink.send(Message::Close(None)).await;
            return end;
        }
        Ok(Ok(payload)) => payload,
    };

    let (agent, ctx) = match verify_auth(&deps, &auth).await {
        Ok(verified) => verified,
        Err(reason) => {
            deps.metrics.record_auth_rejected();
            warn!(peer = %peer, reason, "auth rejected");
            let _ = send_now(&mut sink, &auth_error(reason)).await;
            let _ = sink.send(Message::Close(None)).await;
            return SessionEnd::AuthRejected;
        }
    };

    if auth.version != PROTOCOL_VERSION {
        debug!(peer = %peer, agent_version = auth.version, "protocol version differs, continuing");
    }

    let ack = Frame::new(FrameBody::AuthAck(AuthAckPayload {
        agent_id: agent.id,
        agent_name: agent.name.clone(),
    }));
    if send_now(&mut sink, &ack).await.is_err() {
        return SessionEnd::Transport;
    }

    info!(peer = %peer, agent_id = %agent.id, agent_name = %agent.name, "agent authenticated");
    run_session(deps, agent, ctx, auth, sink, rx_stream, cancel, peer).await
}

/// Post-auth session lifecycle: register, pump, clean up.
#[allow(clippy::too_many_arguments)]
async fn run_session(
    deps: Arc<GatewayDeps>,
    agent: AgentRecord,
    ctx: TenantCtx,
    auth: AuthPayload,
    sink: WsSink,
    mut rx_stream: WsStream,
    cancel: CancellationToken,
    peer: SocketAddr,
) -> SessionEnd {
    let now = Utc::now();
    if let Some(fingerprint) = auth.fingerprint.clone() {
        if let Err(err) = deps
            .storage
            .agents()
            .record_fingerprint(&ctx, agent.id, fingerprint)
            .await
        {
            warn!(agent_id = %agent.id, error = %err, "fingerprint not recorded");
        }
    }
    // Persist the flip before the registry announces it, so the dispatcher's
    // connect-triggered read sees a consistent row.
    if let Err(err) = deps
        .storage
        .agents()
        .set_status(&ctx, agent.id, AgentStatus::Online, now)
        .await
    {
        warn!(agent_id = %agent.id, error = %err, "online status not persisted");
    }

    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(deps.config.send_queue_depth);
    let handle = SessionHandle::new(agent.id, ctx.tenant().clone(), frame_tx, cancel.clone());
    let session_id = handle.session_id();

    if let Some(displaced) = deps.registry.register(handle.clone()) {
        deps.metrics.record_session_preempted();
        displaced.send_or_close(Frame::goodbye(close_reason::SUPERSEDED));
        displaced.close();
    }
    deps.metrics.record_session_opened();
    deps.bus.publish(
        ctx.tenant(),
        LiveEvent::AgentStatus {
            agent_id: agent.id,
            status: AgentStatus::Online,
        },
    );

    let writer = tokio::spawn(writer_pump(
        sink,
        frame_rx,
        Arc::clone(&deps.config),
        cancel.clone(),
    ));

    let mut strikes = 0u32;
    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break SessionEnd::Cancelled,

            msg = timeout(deps.config.read_deadline(), rx_stream.next()) => match msg {
                Err(_) => {
                    warn!(agent_id = %agent.id, "read deadline exceeded");
                    break SessionEnd::ReadTimeout;
                }
                Ok(None) => break SessionEnd::PeerClosed,
                Ok(Some(Err(err))) => {
                    debug!(agent_id = %agent.id, error = %err, "transport error");
                    break SessionEnd::Transport;
                }
                Ok(Some(Ok(Message::Close(_)))) => break SessionEnd::PeerClosed,
                Ok(Some(Ok(Message::Text(text)))) => {
                    match Frame::parse(&text) {
                        Ok(frame) => {
                            if let Some(end) = handle_frame(&deps, &handle, &ctx, agent.id, frame).await {
                                break end;
                            }
                        }
                        Err(err) => {
                            strikes += 1;
                            debug!(agent_id = %agent.id, strikes, error = %err, "malformed frame");
                            let _ = handle.try_send(Frame::error(
                                error_code::MALFORMED,
                                "frame could not be parsed",
                            ));
                            if strikes >= MAX_STRIKES {
                                break SessionEnd::ProtocolAbuse;
                            }
                        }
                    }
                }
                // Transport-level ping/pong is answered by the WS layer.
                Ok(Some(Ok(_))) => {}
            },
        }
    };

    cancel.cancel();
    let _ = writer.await;

    // A preempted session's cleanup must not flip its successor offline.
    if deps.registry.unregister(agent.id, session_id) {
        if let Err(err) = deps
            .storage
            .agents()
            .set_status(&ctx, agent.id, AgentStatus::Offline, Utc::now())
            .await
        {
            warn!(agent_id = %agent.id, error = %err, "offline status not persisted");
        }
        deps.bus.publish(
            ctx.tenant(),
            LiveEvent::AgentStatus {
                agent_id: agent.id,
                status: AgentStatus::Offline,
            },
        );
    }
    deps.metrics.record_session_closed();
    info!(peer = %peer, agent_id = %agent.id, end = ?end, "session closed");
    end
}

/// Dispatch one inbound frame. Returns the session end when the frame is
/// terminal.
async fn handle_frame(
    deps: &GatewayDeps,
    handle: &SessionHandle,
    ctx: &TenantCtx,
    agent_id: Uuid,
    frame: Frame,
) -> Option<SessionEnd> {
    match frame.body {
        FrameBody::Heartbeat(payload) => {
            let monitor_id = payload.monitor_id;
            if let wd_pipeline::PipelineOutcome::Rejected(reason) =
                deps.pipeline.process(ctx, agent_id, payload).await
            {
                let _ = handle.try_send(reason.error_frame(monitor_id));
            }
            None
        }
        FrameBody::Ping => {
            let _ = handle.try_send(Frame::pong());
            None
        }
        FrameBody::Pong => {
            if let Err(err) = deps
                .storage
                .agents()
                .touch_last_seen(ctx, agent_id, Utc::now())
                .await
            {
                debug!(agent_id = %agent_id, error = %err, "last-seen update failed");
            }
            None
        }
        FrameBody::Error(payload) => {
            // Non-fatal by contract; surfaced in logs only.
            warn!(agent_id = %agent_id, code = %payload.code, message = %payload.message, "agent reported error");
            None
        }
        FrameBody::Goodbye(payload) => {
            info!(agent_id = %agent_id, reason = %payload.reason, "agent said goodbye");
            Some(SessionEnd::PeerClosed)
        }
        other => {
            warn!(agent_id = %agent_id, frame = ?other, "unexpected frame direction");
            let _ = handle.try_send(Frame::error(
                error_code::MALFORMED,
                "frame type not valid from agents",
            ));
            None
        }
    }
}

/// Writer pump: owns the sink, drains the bounded queue, emits liveness
/// pings, enforces the per-frame write deadline. On cancellation it flushes
/// whatever is already queued (the goodbye lives there) before closing.
async fn writer_pump(
    mut sink: WsSink,
    mut frame_rx: mpsc::Receiver<Frame>,
    config: Arc<wd_config::HubConfig>,
    cancel: CancellationToken,
) {
    // First tick a full period out; an immediate ping would race the ack.
    let period = config.ping_interval();
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(frame) = frame_rx.try_recv() {
                    if write_frame(&mut sink, &frame, config.write_deadline()).await.is_err() {
                        break;
                    }
                }
                break;
            }
            maybe = frame_rx.recv() => match maybe {
                Some(frame) => {
                    if write_frame(&mut sink, &frame, config.write_deadline()).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if write_frame(&mut sink, &Frame::ping(), config.write_deadline()).await.is_err() {
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

async fn write_frame(
    sink: &mut WsSink,
    frame: &Frame,
    deadline: std::time::Duration,
) -> Result<(), ()> {
    let text = frame.encode().map_err(|_| ())?;
    match timeout(deadline, sink.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!(error = %err, "write failed");
            Err(())
        }
        Err(_) => {
            debug!("write deadline exceeded");
            Err(())
        }
    }
}

/// Read frames until the `auth` frame arrives. Anything else first is a
/// protocol violation.
async fn read_auth(rx_stream: &mut WsStream) -> Result<AuthPayload, SessionEnd> {
    loop {
        match rx_stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return match Frame::parse(&text) {
                    Ok(Frame {
                        body: FrameBody::Auth(payload),
                        ..
                    }) => Ok(payload),
                    Ok(_) | Err(_) => Err(SessionEnd::AuthRejected),
                };
            }
            Some(Ok(Message::Close(_))) | None => return Err(SessionEnd::PeerClosed),
            Some(Ok(_)) => {}
            Some(Err(_)) => return Err(SessionEnd::Transport),
        }
    }
}

/// Look the agent up by the api key's uuid prefix, decrypt the stored
/// secret, and compare in constant time. Unknown agents and wrong secrets
/// share one reason string.
async fn verify_auth(
    deps: &GatewayDeps,
    auth: &AuthPayload,
) -> Result<(AgentRecord, TenantCtx), &'static str> {
    const INVALID: &str = "invalid credentials";

    let key = parse_api_key(&auth.api_key).map_err(|_| "malformed api key")?;
    let agent = deps
        .storage
        .agents()
        .find_for_auth(key.agent_id)
        .await
        .map_err(|_| INVALID)?;
    if agent.is_expired(Utc::now()) {
        return Err("api key expired");
    }
    let stored = deps.process_key.decrypt(&agent.secret).map_err(|err| {
        warn!(agent_id = %agent.id, error = %err, "stored secret undecryptable");
        INVALID
    })?;
    if !verify_secret(&key.secret, &stored) {
        return Err(INVALID);
    }
    let ctx = TenantCtx::for_agent(agent.tenant.clone());
    Ok((agent, ctx))
}

fn auth_error(reason: &str) -> Frame {
    Frame::new(FrameBody::AuthError(AuthErrorPayload {
        reason: reason.to_string(),
    }))
}

async fn send_now(sink: &mut WsSink, frame: &Frame) -> Result<(), ()> {
    let text = frame.encode().map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

fn error_response(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

// ─── Tests ────────────────────────────────────────────────────────────────────
