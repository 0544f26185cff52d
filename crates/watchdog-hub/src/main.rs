//! watchdog-hub — the WatchDog central hub.
//!
//! Accepts outbound agent sessions over WebSocket, converges their check
//! schedules, ingests heartbeats through the consecutive-failure rule,
//! drives the incident lifecycle with notification fan-out, and streams
//! live events to dashboard viewers over SSE.

mod sse;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wd_bus::LiveBus;
use wd_config::HubConfig;
use wd_dispatch::{MonitorChange, ScheduleDispatcher};
use wd_gateway::{GatewayDeps, SessionGateway};
use wd_incident::IncidentEngine;
use wd_notify::{
    admin_notifier_from_env, ChannelNotifierProvider, MemoryChannelDirectory,
};
use wd_observe::HubMetrics;
use wd_pipeline::HeartbeatPipeline;
use wd_registry::AgentRegistry;
use wd_secrets::ProcessKey;
use wd_storage::MemoryStore;

#[derive(Parser)]
#[command(name = "watchdog-hub")]
#[command(about = "WatchDog central hub")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub (agent gateway + dashboard stream)
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/watchdog/hub.json")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/watchdog/hub.json")]
        output: PathBuf,
    },

    /// Generate a fresh 32-byte process key (hex) for WATCHDOG_PROCESS_KEY
    GenKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("watchdog_hub=info".parse()?))
        .init();

    match cli.command {
        Commands::Run { config } => run_hub(config).await,
        Commands::InitConfig { output } => init_config(output),
        Commands::GenKey => gen_key(),
    }
}

// ─── Run ─────────────────────────────────────────────────────────────────────

async fn run_hub(config_path: PathBuf) -> anyhow::Result<()> {
    let config = if config_path.exists() {
        HubConfig::load(&config_path)?
    } else {
        warn!(path = %config_path.display(), "no config file, using defaults");
        let mut config = HubConfig::default();
        config.apply_env();
        config
    };
    let config = Arc::new(config);
    info!(
        gateway = %config.gateway_addr,
        dashboard = %config.dashboard_addr,
        failure_threshold = config.failure_threshold_default,
        "loaded config"
    );

    let key_hex = std::env::var("WATCHDOG_PROCESS_KEY").map_err(|_| {
        anyhow::anyhow!("WATCHDOG_PROCESS_KEY is not set; create one with `watchdog-hub gen-key`")
    })?;
    let process_key = Arc::new(ProcessKey::from_hex(&key_hex, 1)?);
    info!(key_fingerprint = %process_key.fingerprint(), "process key loaded");

    // Reference wiring: in-memory storage and channel directory. A database
    // deployment swaps these for its own `Storage`/`ChannelDirectory`.
    let storage = Arc::new(MemoryStore::new());
    let bus = Arc::new(LiveBus::new());
    let registry = Arc::new(AgentRegistry::new());
    let metrics = Arc::new(HubMetrics::new());
    let http = reqwest::Client::new();
    let channels = Arc::new(MemoryChannelDirectory::new());
    let notifiers = Arc::new(ChannelNotifierProvider::new(channels.clone(), http.clone()));
    let admin = admin_notifier_from_env(http);
    if admin.is_some() {
        info!("admin notifier configured");
    }

    let engine = Arc::new(IncidentEngine::new(
        storage.clone(),
        bus.clone(),
        notifiers,
        admin,
        config.notifier_deadline(),
        metrics.clone(),
    ));
    let pipeline = Arc::new(HeartbeatPipeline::new(
        storage.clone(),
        engine,
        bus.clone(),
        metrics.clone(),
    ));

    let cancel = CancellationToken::new();

    // Schedule dispatcher: agent connects + monitor mutations, no polling.
    // The mutation sender is handed to whatever CRUD surface this process
    // embeds.
    let (changes_tx, changes_rx) = tokio::sync::mpsc::channel::<MonitorChange>(64);
    let _changes_tx = changes_tx;
    let dispatcher = Arc::new(ScheduleDispatcher::new(
        storage.clone(),
        registry.clone(),
        metrics.clone(),
    ));
    let dispatcher_task = tokio::spawn(dispatcher.run(
        registry.subscribe(),
        changes_rx,
        cancel.clone(),
    ));

    // Agent gateway.
    let gateway = Arc::new(SessionGateway::new(GatewayDeps {
        storage: storage.clone(),
        registry: registry.clone(),
        pipeline,
        bus: bus.clone(),
        process_key,
        metrics,
        config: config.clone(),
    }));
    let gateway_listener = TcpListener::bind(&config.gateway_addr).await?;
    let gateway_task = tokio::spawn(gateway.run(gateway_listener, cancel.clone()));

    // Dashboard SSE.
    let sse_router = sse::router(sse::SseState {
        bus,
        auth: Arc::new(sse::HeaderTenantAuth::default()),
    });
    let dashboard_listener = TcpListener::bind(&config.dashboard_addr).await?;
    let sse_cancel = cancel.clone();
    let sse_task = tokio::spawn(async move {
        let shutdown = async move { sse_cancel.cancelled().await };
        if let Err(err) = axum::serve(dashboard_listener, sse_router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(error = %err, "dashboard server failed");
        }
    });

    info!("hub running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();

    let _ = gateway_task.await;
    let _ = dispatcher_task.await;
    let _ = sse_task.await;
    info!("hub stopped");
    Ok(())
}

// ─── InitConfig ──────────────────────────────────────────────────────────────

fn init_config(output: PathBuf) -> anyhow::Result<()> {
    let config = HubConfig::default();
    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Generate a process key and export it, then run:");
    println!("  export WATCHDOG_PROCESS_KEY=$(watchdog-hub gen-key)");
    println!("  watchdog-hub run --config {}", output.display());
    Ok(())
}

// ─── GenKey ──────────────────────────────────────────────────────────────────

fn gen_key() -> anyhow::Result<()> {
    let (_, hex_key) = ProcessKey::generate(1);
    println!("{hex_key}");
    Ok(())
}
