//! vigil-agent: edge sync agent.
//!
//! Usage:
//!     vigil-agent --config /etc/vigil/agent.toml run
//!     vigil-agent status
//!     vigil-agent retry <upload_id>

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};
use vigil_agent::{
    factory, Aggregator, BackoffPolicy, CancellationToken, ControlChannel, ControlSettings,
    ControlTransport, DirectoryClipSource, HealthSnapshot, HttpKnowledgeBackend,
    HttpUploadBackend, KbSyncWorker, Liveness, MqttTransport, Supervisor, SyncSettings,
    UploadBackend, UploadWorker, UploaderSettings, Watchdog, WatchdogSettings,
};
use vigil_db::VigilDb;
use vigil_ids::UploadId;
use vigil_logging::{init_logging, LogConfig};
use vigil_protocol::{paths, AgentConfig, Topics};

const SHUTDOWN_TIMEOUT_SECS: u64 = 10;
const STATUS_SYNC_HISTORY: u32 = 5;

#[derive(Parser, Debug)]
#[command(name = "vigil-agent", about = "Edge sync agent", version)]
struct Cli {
    /// Agent configuration file
    #[arg(short, long, global = true, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run all workers until SIGINT/SIGTERM
    Run,

    /// Print queue counts, knowledge-base version and last health snapshot
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Move a FAILED upload back to PENDING
    Retry {
        /// Upload job id
        upload_id: String,
    },

    /// Parse and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => {
            init_logging(LogConfig {
                app_name: "vigil-agent",
                log_dir: &config.paths.logs_dir(),
                verbose: cli.verbose,
            })?;
            run_agent(config).await
        }
        Commands::Status { json } => status(&config, json).await,
        Commands::Retry { upload_id } => retry(&config, &upload_id).await,
        Commands::CheckConfig => {
            config.validate()?;
            println!("Configuration OK (device {})", config.device.device_id);
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<AgentConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = paths::vigil_home().join("agent.toml");
            if !default.exists() {
                return Ok(AgentConfig::default());
            }
            default
        }
    };
    AgentConfig::load(&path).with_context(|| format!("Failed to load config: {}", path.display()))
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    info!(
        device_id = %config.device.device_id,
        state_dir = %config.paths.state_dir.display(),
        "Starting vigil agent"
    );

    let db = VigilDb::open(config.paths.store_path())
        .await
        .context("Failed to open store")?;

    let liveness = Arc::new(Liveness::new());
    let supervisor = Arc::new(Supervisor::new(liveness.clone()));
    let watchdog = Watchdog::new(
        db.clone(),
        liveness,
        supervisor.clone(),
        WatchdogSettings {
            interval: config.watchdog.interval(),
            stall_threshold: config.watchdog.stall_threshold(),
            startup_grace: config.watchdog.startup_grace(),
            health_file: Some(config.paths.health_file()),
        },
    );
    let health = watchdog.subscribe();

    let aggregator = Aggregator::new(
        db.clone(),
        config.device.device_id.clone(),
        config.device.tenant_id.clone(),
    );

    let tls = config.tls.load().context("Failed to read TLS material")?;
    let backend_tls = tls.as_ref().filter(|_| config.tls.backend);
    let broker_tls = tls.as_ref().filter(|_| config.tls.broker);

    let upload_backend: Arc<dyn UploadBackend> =
        Arc::new(HttpUploadBackend::new(&config.backend, backend_tls)?);
    let uploader = UploadWorker::new(
        db.clone(),
        upload_backend,
        BackoffPolicy::from_config(&config.upload),
        UploaderSettings::from_config(&config),
    );

    let sync_trigger = Arc::new(Notify::new());
    let syncer = KbSyncWorker::new(
        db.clone(),
        Arc::new(HttpKnowledgeBackend::new(
            &config.backend,
            &config.device.device_id,
            backend_tls,
        )?),
        SyncSettings::from_config(&config),
        sync_trigger.clone(),
    );

    let topics = Topics::for_device(&config.control.topic_prefix, &config.device.device_id);
    let transport: Arc<dyn ControlTransport> = Arc::new(
        MqttTransport::connect(&config, broker_tls, vec![topics.control.clone()])
            .context("Failed to set up broker connection")?,
    );
    let control = ControlChannel::new(
        db.clone(),
        aggregator.clone(),
        transport,
        Arc::new(DirectoryClipSource::new(config.paths.clip_dir.clone())),
        topics,
        ControlSettings::from_config(&config),
        sync_trigger,
        health,
    );

    let inbox = config.paths.inbox_dir.clone();
    supervisor.spawn(
        "aggregator",
        factory(move |beat, cancel| aggregator.clone().run(inbox.clone(), beat, cancel)),
    );
    supervisor.spawn(
        "uploader",
        factory(move |beat, cancel| uploader.clone().run(beat, cancel)),
    );
    supervisor.spawn(
        "sync",
        factory(move |beat, cancel| syncer.clone().run(beat, cancel)),
    );
    supervisor.spawn(
        "control",
        factory(move |beat, cancel| control.clone().run(beat, cancel)),
    );

    let watchdog_cancel = CancellationToken::new();
    let watchdog_task = tokio::spawn(watchdog.run(watchdog_cancel.clone()));

    shutdown_signal().await;
    info!("Shutdown requested");

    // Stop the watchdog first so it does not restart components on their way down.
    watchdog_cancel.cancel();
    if let Err(e) = watchdog_task.await {
        error!(error = %e, "Watchdog task failed");
    }
    supervisor
        .shutdown(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS))
        .await;
    db.close().await;
    info!("Vigil agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn status(config: &AgentConfig, json: bool) -> Result<()> {
    let db = VigilDb::open(config.paths.store_path())
        .await
        .context("Failed to open store")?;
    let stats = db.queue_stats().await?;
    let kb = db.kb_current(&config.sync.slot).await?;
    let device = db.device_state(&config.device.device_id).await?;
    let syncs = db.recent_sync_attempts(STATUS_SYNC_HISTORY).await?;
    let health = HealthSnapshot::read_from(&config.paths.health_file())
        .context("Failed to read health snapshot")?;
    db.close().await;

    if json {
        let body = serde_json::json!({
            "queue": stats,
            "kb": kb,
            "device": device,
            "recent_syncs": syncs,
            "health": health,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("Events:  {} pending, {} uploaded, {} failed",
        stats.events_pending, stats.events_uploaded, stats.events_failed);
    println!(
        "Uploads: {} pending, {} processing, {} complete, {} failed",
        stats.uploads_pending, stats.uploads_processing, stats.uploads_complete, stats.uploads_failed
    );
    match &kb {
        Some(kb) => println!(
            "KB:      {} (applied {})",
            kb.kb_version,
            VigilDb::millis_to_datetime(kb.applied_at).to_rfc3339()
        ),
        None => println!("KB:      none applied"),
    }
    for attempt in &syncs {
        println!(
            "  sync {} -> {}: {}{}",
            attempt.from_version.as_deref().unwrap_or("-"),
            attempt.to_version.as_deref().unwrap_or("-"),
            attempt.outcome.as_str(),
            attempt
                .detail
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        );
    }
    if let Some(device) = &device {
        println!(
            "Last heartbeat: {}",
            VigilDb::millis_to_datetime(device.last_heartbeat_at).to_rfc3339()
        );
    }
    match &health {
        Some(health) => {
            println!("Health:  {} (checked {})", health.status, health.checked_at.to_rfc3339());
            for component in &health.components {
                println!(
                    "  {:<12} {:?} restarts={}",
                    component.name, component.status, component.restarts
                );
            }
        }
        None => println!("Health:  no snapshot (agent not running?)"),
    }
    Ok(())
}

async fn retry(config: &AgentConfig, upload_id: &str) -> Result<()> {
    let id = UploadId::parse(upload_id).context("Invalid upload id")?;
    let db = VigilDb::open(config.paths.store_path())
        .await
        .context("Failed to open store")?;
    db.retry_upload(&id, VigilDb::now_millis())
        .await
        .with_context(|| format!("Cannot retry upload {}", id))?;
    db.close().await;
    println!("Upload {} re-queued", id);
    Ok(())
}
