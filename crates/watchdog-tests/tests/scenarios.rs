//! End-to-end scenarios over a live hub: a real TCP listener, real
//! WebSocket sessions acting as agents, the dispatcher reacting to connect
//! and mutation events, heartbeats flowing through the pipeline into the
//! incident engine and out onto the live bus.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wd_bus::{BusMessage, LiveBus, LiveEvent};
use wd_config::HubConfig;
use wd_dispatch::{MonitorChange, ScheduleDispatcher};
use wd_gateway::{GatewayDeps, SessionGateway};
use wd_incident::IncidentEngine;
use wd_notify::{IncidentEventKind, Notifier, NotifierProvider, NotifyError};
use wd_observe::HubMetrics;
use wd_pipeline::HeartbeatPipeline;
use wd_proto::{
    close_reason, error_code, AgentRecord, AgentStatus, AuthPayload, Frame, FrameBody,
    HeartbeatPayload, HeartbeatStatus, Incident, IncidentStatus, Monitor, MonitorKind,
    MonitorStatus, PROTOCOL_VERSION,
};
use wd_registry::AgentRegistry;
use wd_secrets::{generate_agent_secret, ProcessKey};
use wd_storage::{MemoryStore, Store};
use wd_tenant::{TenantCtx, TenantId};

// ─── Harness ──────────────────────────────────────────────────────────────────

struct RecordingNotifier {
    label: &'static str,
    fail: bool,
    calls: parking_lot::Mutex<Vec<(IncidentEventKind, Uuid)>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    fn channel(&self) -> &'static str {
        self.label
    }

    async fn notify_incident_opened(
        &self,
        incident: &Incident,
        _monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        self.calls
            .lock()
            .push((IncidentEventKind::Opened, incident.id));
        if self.fail {
            Err(NotifyError::Status(500))
        } else {
            Ok(())
        }
    }

    async fn notify_incident_resolved(
        &self,
        incident: &Incident,
        _monitor: &Monitor,
    ) -> Result<(), NotifyError> {
        self.calls
            .lock()
            .push((IncidentEventKind::Resolved, incident.id));
        if self.fail {
            Err(NotifyError::Status(500))
        } else {
            Ok(())
        }
    }
}

struct FixedProvider {
    notifiers: Vec<Arc<RecordingNotifier>>,
}

#[async_trait::async_trait]
impl NotifierProvider for FixedProvider {
    async fn notifiers_for_user(
        &self,
        _ctx: &TenantCtx,
        _user_id: Uuid,
    ) -> Vec<Arc<dyn Notifier>> {
        self.notifiers
            .iter()
            .map(|n| Arc::clone(n) as Arc<dyn Notifier>)
            .collect()
    }
}

struct Hub {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    registry: Arc<AgentRegistry>,
    bus: Arc<LiveBus>,
    process_key: Arc<ProcessKey>,
    changes_tx: tokio::sync::mpsc::Sender<MonitorChange>,
    notifiers: Vec<Arc<RecordingNotifier>>,
    cancel: CancellationToken,
}

impl Hub {
    async fn start() -> Self {
        Self::start_with(HubConfig::default(), &[], &["webhook"]).await
    }

    async fn start_with(
        mut config: HubConfig,
        failing: &[&'static str],
        succeeding: &[&'static str],
    ) -> Self {
        // No liveness pings during tests; frames under test stay exact.
        config.ping_interval_secs = 3600;
        let config = Arc::new(config);

        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(AgentRegistry::new());
        let bus = Arc::new(LiveBus::new());
        let metrics = Arc::new(HubMetrics::new());
        let (process_key, _) = ProcessKey::generate(1);
        let process_key = Arc::new(process_key);

        let notifiers: Vec<Arc<RecordingNotifier>> = failing
            .iter()
            .map(|&label| {
                Arc::new(RecordingNotifier {
                    label,
                    fail: true,
                    calls: parking_lot::Mutex::new(Vec::new()),
                })
            })
            .chain(succeeding.iter().map(|&label| {
                Arc::new(RecordingNotifier {
                    label,
                    fail: false,
                    calls: parking_lot::Mutex::new(Vec::new()),
                })
            }))
            .collect();

        let engine = Arc::new(IncidentEngine::new(
            store.clone(),
            bus.clone(),
            Arc::new(FixedProvider {
                notifiers: notifiers.clone(),
            }),
            None,
            Duration::from_millis(500),
            metrics.clone(),
        ));
        let pipeline = Arc::new(HeartbeatPipeline::new(
            store.clone(),
            engine,
            bus.clone(),
            metrics.clone(),
        ));

        let cancel = CancellationToken::new();

        let (changes_tx, changes_rx) = tokio::sync::mpsc::channel(32);
        let dispatcher = Arc::new(ScheduleDispatcher::new(
            store.clone(),
            registry.clone(),
            metrics.clone(),
        ));
        tokio::spawn(dispatcher.run(registry.subscribe(), changes_rx, cancel.clone()));

        let gateway = Arc::new(SessionGateway::new(GatewayDeps {
            storage: store.clone(),
            registry: registry.clone(),
            pipeline,
            bus: bus.clone(),
            process_key: Arc::clone(&process_key),
            metrics,
            config,
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(gateway.run(listener, cancel.clone()));

        Self {
            addr,
            store,
            registry,
            bus,
            process_key,
            changes_tx,
            notifiers,
            cancel,
        }
    }

    fn seed_agent(&self, tenant: &str) -> (Uuid, String) {
        let secret = generate_agent_secret();
        let id = Uuid::new_v4();
        self.store.insert_agent(AgentRecord {
            id,
            user_id: Uuid::new_v4(),
            tenant: TenantId::from(tenant),
            name: format!("probe-{}", &id.to_string()[..8]),
            secret: self.process_key.encrypt(&secret).expect("encrypt"),
            expires_at: None,
            last_seen_at: None,
            status: AgentStatus::Offline,
            fingerprint: HashMap::new(),
        });
        (id, format!("{id}:{secret}"))
    }

    fn seed_monitor(&self, tenant: &str, agent_id: Uuid, name: &str, threshold: u8) -> Monitor {
        let monitor = Monitor {
            id: Uuid::new_v4(),
            agent_id,
            tenant: TenantId::from(tenant),
            name: name.to_string(),
            kind: MonitorKind::Http,
            target: format!("https://{name}.example.com/health"),
            enabled: true,
            interval_secs: 30,
            timeout_secs: 10,
            failure_threshold: threshold,
            status: MonitorStatus::Pending,
        };
        self.store.insert_monitor(monitor.clone()).expect("monitor");
        monitor
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect_agent(hub: &Hub, api_key: &str) -> Client {
    let (mut client, _) = connect_async(format!("ws://{}/ws/agent", hub.addr))
        .await
        .expect("connect");
    let auth = Frame::new(FrameBody::Auth(AuthPayload {
        api_key: api_key.to_string(),
        version: PROTOCOL_VERSION,
        fingerprint: None,
    }));
    client
        .send(Message::Text(auth.encode().expect("encode")))
        .await
        .expect("send auth");
    let ack = next_frame(&mut client).await;
    assert!(matches!(ack.body, FrameBody::AuthAck(_)), "got {ack:?}");
    client
}

async fn next_frame(client: &mut Client) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timely frame")
            .expect("open stream")
            .expect("message");
        match msg {
            Message::Text(text) => return Frame::parse(&text).expect("frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

async fn send_heartbeat(client: &mut Client, monitor_id: Uuid, status: HeartbeatStatus) {
    let frame = Frame::new(FrameBody::Heartbeat(HeartbeatPayload {
        monitor_id,
        status,
        latency_ms: Some(42),
        message: None,
        cert: None,
    }));
    client
        .send(Message::Text(frame.encode().expect("encode")))
        .await
        .expect("send heartbeat");
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..300 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

fn ctx(tenant: &str) -> TenantCtx {
    TenantCtx::for_agent(TenantId::from(tenant))
}

// ─── S1: three consecutive failures open one incident ─────────────────────────

#[tokio::test]
async fn s1_first_failure_run_opens_incident_at_threshold() {
    let hub = Hub::start().await;
    let (agent_id, api_key) = hub.seed_agent("t1");
    let monitor = hub.seed_monitor("t1", agent_id, "m1", 3);
    let mut events = hub.bus.subscribe(&TenantId::from("t1"));

    let mut client = connect_agent(&hub, &api_key).await;

    // The dispatcher pushes the schedule on connect.
    let task = next_frame(&mut client).await;
    match task.body {
        FrameBody::Task(payload) => {
            assert_eq!(payload.monitor_id, monitor.id);
            assert_eq!(payload.interval_secs, 30);
            assert_eq!(payload.timeout_secs, 10);
        }
        other => panic!("expected task, got {other:?}"),
    }

    for _ in 0..3 {
        send_heartbeat(&mut client, monitor.id, HeartbeatStatus::Down).await;
    }

    wait_until(|| !hub.store.incidents_for_monitor(monitor.id).is_empty()).await;
    let incidents = hub.store.incidents_for_monitor(monitor.id);
    assert_eq!(incidents.len(), 1, "exactly one incident");
    assert_eq!(incidents[0].status, IncidentStatus::Open);

    let row = hub
        .store
        .monitors()
        .get(&ctx("t1"), monitor.id)
        .await
        .expect("monitor");
    assert_eq!(row.status, MonitorStatus::Down);

    // The live bus announced it (agent-status online arrives first).
    let mut saw_opened = false;
    for _ in 0..8 {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(BusMessage::Event(LiveEvent::IncidentOpened(summary)))) => {
                assert_eq!(summary.incident_id, incidents[0].id);
                saw_opened = true;
                break;
            }
            Ok(Some(_)) => continue,
            other => panic!("bus went quiet: {other:?}"),
        }
    }
    assert!(saw_opened, "incident.opened never observed");
}

// ─── S2: recovery resolves with a TTR ────────────────────────────────────────

#[tokio::test]
async fn s2_recovery_resolves_incident() {
    let hub = Hub::start().await;
    let (agent_id, api_key) = hub.seed_agent("t1");
    let monitor = hub.seed_monitor("t1", agent_id, "m1", 3);
    let mut events = hub.bus.subscribe(&TenantId::from("t1"));

    let mut client = connect_agent(&hub, &api_key).await;
    let _task = next_frame(&mut client).await;

    for _ in 0..3 {
        send_heartbeat(&mut client, monitor.id, HeartbeatStatus::Down).await;
    }
    wait_until(|| !hub.store.incidents_for_monitor(monitor.id).is_empty()).await;

    send_heartbeat(&mut client, monitor.id, HeartbeatStatus::Up).await;
    wait_until(|| {
        hub.store
            .incidents_for_monitor(monitor.id)
            .iter()
            .all(|i| i.status == IncidentStatus::Resolved)
    })
    .await;

    let incident = hub.store.incidents_for_monitor(monitor.id).remove(0);
    let resolved_at = incident.resolved_at.expect("resolved_at");
    let ttr = incident.ttr_seconds.expect("ttr");
    assert_eq!(ttr, (resolved_at - incident.started_at).num_seconds());

    let row = hub
        .store
        .monitors()
        .get(&ctx("t1"), monitor.id)
        .await
        .expect("monitor");
    assert_eq!(row.status, MonitorStatus::Up);

    let mut saw_resolved = false;
    for _ in 0..12 {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(BusMessage::Event(LiveEvent::IncidentResolved(summary)))) => {
                assert_eq!(summary.incident_id, incident.id);
                assert!(summary.ttr_seconds.is_some());
                saw_resolved = true;
                break;
            }
            Ok(Some(_)) => continue,
            other => panic!("bus went quiet: {other:?}"),
        }
    }
    assert!(saw_resolved, "incident.resolved never observed");
}

// ─── S3: flapping below the threshold never opens ────────────────────────────

#[tokio::test]
async fn s3_flapping_below_threshold_never_opens() {
    let hub = Hub::start().await;
    let (agent_id, api_key) = hub.seed_agent("t1");
    let monitor = hub.seed_monitor("t1", agent_id, "m1", 3);

    let mut client = connect_agent(&hub, &api_key).await;
    let _task = next_frame(&mut client).await;

    for status in [
        HeartbeatStatus::Down,
        HeartbeatStatus::Up,
        HeartbeatStatus::Down,
        HeartbeatStatus::Down,
    ] {
        send_heartbeat(&mut client, monitor.id, status).await;
    }
    wait_until(|| hub.store.heartbeat_count(monitor.id) == 4).await;

    assert!(
        hub.store.incidents_for_monitor(monitor.id).is_empty(),
        "no incident may exist"
    );
    let row = hub
        .store
        .monitors()
        .get(&ctx("t1"), monitor.id)
        .await
        .expect("monitor");
    assert_eq!(row.status, MonitorStatus::Up);
}

// ─── S4: a second handshake preempts the first session ───────────────────────

#[tokio::test]
async fn s4_preempted_session_hands_over_task_pushes() {
    let hub = Hub::start().await;
    let (agent_id, api_key) = hub.seed_agent("t1");
    let monitor = hub.seed_monitor("t1", agent_id, "m1", 3);

    let mut first = connect_agent(&hub, &api_key).await;
    let task = next_frame(&mut first).await;
    assert!(matches!(task.body, FrameBody::Task(_)));

    let mut second = connect_agent(&hub, &api_key).await;
    // The displaced session hears why.
    let goodbye = next_frame(&mut first).await;
    match goodbye.body {
        FrameBody::Goodbye(payload) => assert_eq!(payload.reason, close_reason::SUPERSEDED),
        other => panic!("expected goodbye, got {other:?}"),
    }
    assert_eq!(hub.registry.online_count(), 1);

    // The new session got the schedule on its own connect.
    let replay = next_frame(&mut second).await;
    match replay.body {
        FrameBody::Task(ref payload) => assert_eq!(payload.monitor_id, monitor.id),
        ref other => panic!("expected task, got {other:?}"),
    }

    // Subsequent pushes go to the new session only.
    let m2 = hub.seed_monitor("t1", agent_id, "m2", 3);
    hub.changes_tx
        .send(MonitorChange { agent_id })
        .await
        .expect("change event");
    let pushed = next_frame(&mut second).await;
    match pushed.body {
        FrameBody::Task(ref payload) => assert_eq!(payload.monitor_id, m2.id),
        ref other => panic!("expected task for m2, got {other:?}"),
    }
}

// ─── S5: tenant isolation on the hot path ────────────────────────────────────

#[tokio::test]
async fn s5_cross_tenant_heartbeat_is_dropped() {
    let hub = Hub::start().await;
    let (a1, key1) = hub.seed_agent("t1");
    hub.seed_monitor("t1", a1, "m1", 3);
    let (a2, _) = hub.seed_agent("t2");
    let m2 = hub.seed_monitor("t2", a2, "m2", 3);

    let mut t1_client = connect_agent(&hub, &key1).await;
    let _task = next_frame(&mut t1_client).await;

    // T1's session reports T2's monitor.
    send_heartbeat(&mut t1_client, m2.id, HeartbeatStatus::Down).await;

    let reply = next_frame(&mut t1_client).await;
    match reply.body {
        FrameBody::Error(payload) => assert_eq!(payload.code, error_code::TENANT_MISMATCH),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert_eq!(hub.store.heartbeat_count(m2.id), 0, "no row written");
    assert!(
        hub.store.incidents_for_monitor(m2.id).is_empty(),
        "no incident touched"
    );
}

// ─── S6: notifier partial failure ────────────────────────────────────────────

#[tokio::test]
async fn s6_notifier_partial_failure_is_contained() {
    let hub = Hub::start_with(HubConfig::default(), &["discord"], &["webhook"]).await;
    let (agent_id, api_key) = hub.seed_agent("t1");
    let monitor = hub.seed_monitor("t1", agent_id, "m1", 3);

    let mut client = connect_agent(&hub, &api_key).await;
    let _task = next_frame(&mut client).await;
    for _ in 0..3 {
        send_heartbeat(&mut client, monitor.id, HeartbeatStatus::Down).await;
    }

    wait_until(|| !hub.store.incidents_for_monitor(monitor.id).is_empty()).await;
    let incident = hub.store.incidents_for_monitor(monitor.id).remove(0);
    assert_eq!(incident.status, IncidentStatus::Open);

    // Every channel was invoked exactly once, the failure stayed local.
    for notifier in &hub.notifiers {
        wait_until(|| !notifier.calls.lock().is_empty()).await;
        let calls = notifier.calls.lock().clone();
        assert_eq!(calls, vec![(IncidentEventKind::Opened, incident.id)]);
    }
}

// ─── Liveness: silence past the read deadline flips the agent offline ─────────

#[tokio::test]
async fn silent_agent_is_closed_and_marked_offline() {
    let mut config = HubConfig::default();
    config.read_deadline_secs = 1;
    let hub = Hub::start_with(config, &[], &[]).await;
    let (agent_id, api_key) = hub.seed_agent("t1");
    let mut events = hub.bus.subscribe(&TenantId::from("t1"));

    let _client = connect_agent(&hub, &api_key).await;
    wait_until(|| hub.registry.is_online(agent_id)).await;

    // online, then offline once the deadline lapses with no frames.
    let mut statuses = Vec::new();
    for _ in 0..2 {
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(BusMessage::Event(LiveEvent::AgentStatus { status, .. }))) => {
                statuses.push(status);
            }
            other => panic!("expected agent-status, got {other:?}"),
        }
    }
    assert_eq!(statuses, vec![AgentStatus::Online, AgentStatus::Offline]);
    assert!(!hub.registry.is_online(agent_id));

    let row = hub
        .store
        .agents()
        .get(&ctx("t1"), agent_id)
        .await
        .expect("agent");
    assert_eq!(row.status, AgentStatus::Offline);
}
