// ABOUTME: Entry point for the office-hours server process and its admin CLI
// ABOUTME: Initializes logging and config, restores stored servers, and inspects stored state

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use officehours::{
    clock::SystemClock, snapshot::ServerSnapshot, AttendanceExtension, AuditLogExtension, Config,
    Server, ServerRegistry, SqliteSnapshotStore,
};
use officehours_core::ServerId;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "officehours", version, about = "Office-hours queue server")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Restore every stored server and keep them running until Ctrl-C
    Run {
        /// Also start these servers if nothing is stored for them yet
        #[arg(long = "server")]
        servers: Vec<String>,
    },
    /// List stored servers
    Servers,
    /// Print a stored server's queues
    Show {
        #[arg(long)]
        server: String,
    },
    /// Print recent help sessions and helper sessions for a server
    Attendance {
        #[arg(long)]
        server: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Load a JSON server snapshot into the store
    Import {
        #[arg(long)]
        server: String,
        file: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    dotenvy::dotenv().ok();
    let config = Config::load()?;

    tracing::debug!(
        db_path = %config.storage.db_path,
        allow_multi_queue = config.engine.allow_multi_queue,
        periodic_update_secs = config.engine.periodic_update_secs,
        "Configuration loaded"
    );

    match cli.command {
        Command::Run { servers } => run(config, servers).await,
        Command::Servers => list_servers(&config),
        Command::Show { server } => show_server(&config, &ServerId::new(server)),
        Command::Attendance { server, limit } => show_attendance(&config, &server, limit),
        Command::Import { server, file } => import(&config, ServerId::new(server), &file).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn build_server(
    id: ServerId,
    config: &Config,
    store: &SqliteSnapshotStore,
    attendance: &Arc<AttendanceExtension>,
    audit: &Arc<AuditLogExtension>,
) -> Server {
    let server = Server::new(id, config.engine.clone(), Arc::new(SystemClock))
        .with_snapshot_sink(Arc::new(store.clone()));
    server.register_extension(attendance.clone());
    server.register_extension(audit.clone());
    server
}

async fn run(config: Config, extra_servers: Vec<String>) -> Result<()> {
    if let Some(addr) = &config.metrics.listen_addr {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {}", addr))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus metrics exporter")?;
        tracing::info!(addr = %addr, "Prometheus exporter listening");
    }

    let store = SqliteSnapshotStore::open(&config.storage.db_path)?;
    let attendance = Arc::new(AttendanceExtension::new(store.db_connection())?);
    let audit = Arc::new(AuditLogExtension::new());
    let registry = ServerRegistry::new();

    for stored in store.list_servers()? {
        let server = build_server(stored.server_id.clone(), &config, &store, &attendance, &audit);
        if let Some(snapshot) = store.load_server(&stored.server_id)? {
            server.restore(snapshot).await;
        }
        server.start_periodic_updates();
        registry.register(server);
    }
    for id in extra_servers.into_iter().map(ServerId::new) {
        if registry.get(&id).is_some() {
            continue;
        }
        let server = build_server(id, &config, &store, &attendance, &audit);
        server.start_periodic_updates();
        registry.register(server);
    }

    tracing::info!(servers = registry.len(), "Office hours running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    registry.shutdown_all().await;
    Ok(())
}

fn list_servers(config: &Config) -> Result<()> {
    let store = SqliteSnapshotStore::open(&config.storage.db_path)?;
    let servers = store.list_servers()?;
    if servers.is_empty() {
        println!("No stored servers in {}", config.storage.db_path);
        return Ok(());
    }
    for server in servers {
        println!(
            "{}\t{} queue(s)\tsaved {}",
            server.server_id,
            server.queue_count,
            server.saved_at.to_rfc3339()
        );
    }
    Ok(())
}

fn show_server(config: &Config, id: &ServerId) -> Result<()> {
    let store = SqliteSnapshotStore::open(&config.storage.db_path)?;
    let snapshot = store
        .load_server(id)?
        .with_context(|| format!("No stored server named {}", id))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn show_attendance(config: &Config, server: &str, limit: usize) -> Result<()> {
    let store = SqliteSnapshotStore::open(&config.storage.db_path)?;
    let attendance = AttendanceExtension::new(store.db_connection())?;
    let report = serde_json::json!({
        "help_sessions": attendance.help_sessions(server, limit)?,
        "helper_sessions": attendance.helper_sessions(server, limit)?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn import(config: &Config, id: ServerId, file: &std::path::Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let snapshot: ServerSnapshot = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse snapshot {}", file.display()))?;

    let store = SqliteSnapshotStore::open(&config.storage.db_path)?;
    let server = Server::new(id.clone(), config.engine.clone(), Arc::new(SystemClock))
        .with_snapshot_sink(Arc::new(store.clone()));
    if let Some(existing) = store.load_server(&id)? {
        server.restore(existing).await;
    }
    let restored = server.restore(snapshot).await;
    println!("Imported {} queue(s) into {}", restored, id);
    Ok(())
}
