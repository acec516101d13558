//! claimq CLI: run workers and inspect the queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use claimq::config::Config;
use claimq::handler::{HandlerRegistry, handler_fn};
use claimq::monitor::{LeaseMonitor, MonitorConfig};
use claimq::pool::WorkerPool;
use claimq::store::{PgStore, QueueStore};
use claimq::telemetry::{TelemetryConfig, init_telemetry};
use claimq::{State, UnitId};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "claimq", about = "Exactly-once work queue over Postgres")]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker pool until interrupted
    Serve {
        /// Override the configured pool size
        #[arg(long)]
        workers: Option<usize>,
        /// Seconds between lease monitor scans (0 disables the monitor)
        #[arg(long, default_value_t = 60)]
        monitor_interval: u64,
    },
    /// Enqueue a work unit
    Enqueue {
        /// Unit kind (selects the handler)
        kind: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// Show a work unit
    Show {
        /// Work unit ID
        id: UnitId,
    },
    /// Queue depth by state
    Stats,
    /// List owned units past their lease
    Stuck {
        /// Maximum units to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let store = PgStore::connect(
        config.database_url.expose_secret(),
        config.database_max_connections,
    )
    .await
    .context("connecting to database")?;
    store.migrate().await?;

    match cli.command {
        Command::Serve {
            workers,
            monitor_interval,
        } => cmd_serve(config, store, workers, monitor_interval).await,
        Command::Enqueue { kind, payload } => cmd_enqueue(&store, kind, payload).await,
        Command::Show { id } => cmd_show(&store, id).await,
        Command::Stats => cmd_stats(&store).await,
        Command::Stuck { limit } => cmd_stuck(&store, limit).await,
    }
}

/// Handlers built into the binary. Deployments embedding claimq register their own.
fn builtin_handlers() -> HandlerRegistry {
    HandlerRegistry::new().register(
        "echo",
        handler_fn(|unit| async move {
            tracing::info!(unit_id = %unit.id, payload = %unit.payload, "echo");
            Ok(())
        }),
    )
}

async fn cmd_serve(
    mut config: Config,
    store: PgStore,
    workers: Option<usize>,
    monitor_interval: u64,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "claimq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    if let Some(n) = workers {
        config.pool.size = n;
    }

    let store: Arc<dyn QueueStore> = Arc::new(store);
    let pool = WorkerPool::new(Arc::clone(&store), builtin_handlers(), config.pool);
    pool.start()?;

    let (monitor_tx, monitor_rx) = tokio::sync::watch::channel(false);
    let monitor = (monitor_interval > 0).then(|| {
        let monitor = LeaseMonitor::new(
            Arc::clone(&store),
            MonitorConfig {
                interval: std::time::Duration::from_secs(monitor_interval),
                ..MonitorConfig::default()
            },
        );
        tokio::spawn(monitor.run(monitor_rx))
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    let _ = monitor_tx.send(true);
    pool.stop().await?;
    if let Some(handle) = monitor {
        let _ = handle.await;
    }

    let stats = pool.stats();
    tracing::info!(
        processed = stats.processed,
        failed = stats.failed,
        "final pool stats"
    );
    Ok(())
}

async fn cmd_enqueue(store: &PgStore, kind: String, payload: Option<String>) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json).context("payload is not valid JSON")?,
        None => serde_json::json!({}),
    };

    let id = store.enqueue(&kind, payload).await?;
    println!("Enqueued: {id} (kind: {kind})");
    Ok(())
}

async fn cmd_show(store: &PgStore, id: UnitId) -> anyhow::Result<()> {
    let unit = store.get(id).await?;

    println!("ID:         {}", unit.id);
    println!("Kind:       {}", unit.kind);
    println!("State:      {}", unit.state);
    println!("Attempts:   {}", unit.attempt_count);
    println!("Owner:      {}", unit.owner.as_deref().unwrap_or("-"));
    if let Some(expires) = unit.lease_expires_at {
        println!("Lease:      {expires}");
    }
    if let Some(not_before) = unit.not_before {
        println!("Not Before: {not_before}");
    }
    println!(
        "Payload:    {}",
        serde_json::to_string_pretty(&unit.payload)?
    );
    println!("Created:    {}", unit.created_at);
    if let Some(settled) = unit.settled_at {
        println!("Settled:    {settled}");
    }
    if let Some(ref err) = unit.last_error {
        println!("Last Error: {err}");
    }

    Ok(())
}

async fn cmd_stats(store: &PgStore) -> anyhow::Result<()> {
    let stats = store.stats().await?;
    for state in State::ALL {
        println!("{:<10}  {}", state.to_string(), stats.get(state));
    }
    println!("{:<10}  {}", "expired", stats.expired_leases);
    Ok(())
}

async fn cmd_stuck(store: &PgStore, limit: usize) -> anyhow::Result<()> {
    let units = store.expired_leases(limit).await?;
    if units.is_empty() {
        println!("No units past lease expiry.");
        return Ok(());
    }

    println!(
        "{:<10}  {:<16}  {:<20}  {:<4}  LEASE EXPIRED",
        "ID", "KIND", "OWNER", "TRY"
    );
    println!("{}", "-".repeat(80));
    for unit in &units {
        println!(
            "{:<10}  {:<16}  {:<20}  {:<4}  {}",
            unit.id,
            unit.kind,
            unit.owner.as_deref().unwrap_or("-"),
            unit.attempt_count,
            unit.lease_expires_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default()
        );
    }
    println!("\n{} unit(s)", units.len());
    Ok(())
}
