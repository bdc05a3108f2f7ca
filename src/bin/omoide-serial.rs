//! omoide-serial CLI: run the serial worker and inspect or steer the queue.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use omoide_serial::catalog::PgCatalog;
use omoide_serial::config::Config;
use omoide_serial::config::secrets::ExposeSecret;
use omoide_serial::db::postgres::PgStore;
use omoide_serial::db::{self, SerialStore};
use omoide_serial::engine::{Worker, WorkerConfig};
use omoide_serial::model::{NewOperation, Status};
use omoide_serial::operations::VariantRegistry;
use omoide_serial::telemetry::{SERVICE_NAME, TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "omoide-serial", about = "Serial operation worker for Omoide")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker loop until Ctrl-C or SIGTERM
    Serve,
    /// Apply the database schema
    Migrate,
    /// Queue operations
    Op {
        #[command(subcommand)]
        action: OpAction,
    },
    /// Registered worker names
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// The serial lock row
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Subcommand)]
enum OpAction {
    /// Enqueue a new operation
    Enqueue {
        /// Variant name, e.g. rebuild_known_tags_for_all
        name: String,
        /// JSON object with variant parameters
        #[arg(long)]
        extras: Option<String>,
        /// UUID of the user on whose behalf the work runs
        #[arg(long)]
        requested_by: Option<uuid::Uuid>,
    },
    /// List operations, newest first
    List {
        /// Filter by status (created, processing, done, failed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one operation
    Show { id: i64 },
    /// Enqueue a finished operation again under a new id
    Retry { id: i64 },
}

#[derive(Subcommand)]
enum WorkerAction {
    /// Allow a worker name to run
    Add { name: String },
    List,
}

#[derive(Subcommand)]
enum LockAction {
    Show,
    /// Force the lock free. Only safe when the holder is known to be dead.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Migrate => {
            open_store(&config).await?;
            println!("Schema is up to date.");
            Ok(())
        }
        Command::Op { action } => cmd_op(&*open_store(&config).await?, action).await,
        Command::Worker { action } => cmd_worker(&*open_store(&config).await?, action).await,
        Command::Lock { action } => cmd_lock(&*open_store(&config).await?, action).await,
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn SerialStore>> {
    let store = db::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;
    Ok(store)
}

async fn cmd_op(store: &dyn SerialStore, action: OpAction) -> anyhow::Result<()> {
    match action {
        OpAction::Enqueue {
            name,
            extras,
            requested_by,
        } => cmd_op_enqueue(store, name, extras, requested_by).await,
        OpAction::List { status, limit } => cmd_op_list(store, status, limit).await,
        OpAction::Show { id } => cmd_op_show(store, id).await,
        OpAction::Retry { id } => {
            let new_id = db::retry(store, id).await?;
            println!("Retried {id} as {new_id}");
            Ok(())
        }
    }
}

async fn cmd_worker(store: &dyn SerialStore, action: WorkerAction) -> anyhow::Result<()> {
    match action {
        WorkerAction::Add { name } => {
            let worker = store.provision_worker(&name).await?;
            println!("Registered: {} (id {})", worker.worker_name, worker.id);
        }
        WorkerAction::List => {
            let workers = store.list_workers().await?;
            if workers.is_empty() {
                println!("No registered workers.");
            }
            for worker in &workers {
                println!(
                    "{:<4}  {:<24}  last restart {}",
                    worker.id, worker.worker_name, worker.last_restart
                );
            }
        }
    }
    Ok(())
}

async fn cmd_lock(store: &dyn SerialStore, action: LockAction) -> anyhow::Result<()> {
    match action {
        LockAction::Show => {
            let state = store.lock_state().await?;
            match state.worker_name {
                Some(holder) => println!("Held by {holder} since {}", state.last_update),
                None => println!("Free (last update {})", state.last_update),
            }
        }
        LockAction::Clear => match store.clear_lock().await? {
            Some(holder) => println!("Cleared lock held by {holder}"),
            None => println!("Lock was already free"),
        },
    }
    Ok(())
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: SERVICE_NAME.to_string(),
        log_level: config.log_level.clone(),
    })?;

    let url = config.database_url.expose_secret();
    if url.starts_with("sqlite:") {
        anyhow::bail!("serve needs a Postgres database: the item catalog lives there");
    }

    let worker_config: WorkerConfig = config.worker()?;
    let store = PgStore::connect(url).await?;
    store.migrate().await?;
    let catalog = PgCatalog::new(store.pool().clone());

    let worker = Worker::new(
        Arc::new(store),
        Arc::new(catalog),
        Arc::new(VariantRegistry::standard()?),
        worker_config,
    );

    let signalled = worker.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown requested");
        signalled.shutdown();
    });

    worker.run().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}

async fn cmd_op_enqueue(
    store: &dyn SerialStore,
    name: String,
    extras: Option<String>,
    requested_by: Option<uuid::Uuid>,
) -> anyhow::Result<()> {
    let registry = VariantRegistry::standard()?;
    if !registry.contains(&name) {
        let known: Vec<_> = registry.names().collect();
        anyhow::bail!("unknown operation {name:?}, expected one of: {}", known.join(", "));
    }

    let extras: serde_json::Value = match extras {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };
    if !extras.is_object() {
        anyhow::bail!("--extras must be a JSON object");
    }

    let mut new = NewOperation::new(name).extras(extras);
    if let Some(user) = requested_by {
        new = new.requested_by(user);
    }

    let id = store.enqueue(new).await?;
    println!("Created: {id}");
    Ok(())
}

async fn cmd_op_list(
    store: &dyn SerialStore,
    status: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let status = status.map(|s| s.parse::<Status>()).transpose()?;
    let operations = store.list(status, limit).await?;

    if operations.is_empty() {
        println!("No operations found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<32}  {:<10}  {:<16}  {:<8}  CREATED",
        "ID", "NAME", "STATUS", "WORKER", "AFFECTED"
    );
    println!("{}", "-".repeat(100));

    for op in &operations {
        println!(
            "{:<8}  {:<32}  {:<10}  {:<16}  {:<8}  {}",
            op.id,
            op.name,
            op.status,
            op.worker_name.as_deref().unwrap_or("-"),
            op.affected,
            op.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} operation(s)", operations.len());
    Ok(())
}

async fn cmd_op_show(store: &dyn SerialStore, id: i64) -> anyhow::Result<()> {
    let op = store.get(id).await?;

    println!("ID:         {}", op.id);
    println!("Name:       {}", op.name);
    println!("Status:     {}", op.status);
    println!("Worker:     {}", op.worker_name.as_deref().unwrap_or("-"));
    println!("Extras:     {}", serde_json::to_string_pretty(&op.extras)?);
    println!("Expected:   {}", op.expected);
    println!("Affected:   {}", op.affected);
    println!("Created:    {}", op.created_at);
    println!("Updated:    {}", op.updated_at);
    if let Some(started) = op.started_at {
        println!("Started:    {started}");
    }
    if let Some(ended) = op.ended_at {
        println!("Ended:      {ended}");
    }
    println!("Duration:   {}", op.hr_duration());
    if let Some(ref log) = op.log {
        println!("---");
        println!("{log}");
    }
    Ok(())
}
