//! taskcast CLI: run workers and the live gateway, and poke at tasks.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use taskcast::broadcast::{EventBus, EventSink, PgNotifySink, spawn_pg_relay};
use taskcast::broker::Broker;
use taskcast::config::Config;
use taskcast::db::Db;
use taskcast::gateway::{Gateway, GatewayConfig};
use taskcast::handlers::{HttpCallback, http_client};
use taskcast::model::{Lane, TaskId};
use taskcast::queue::TaskQueue;
use taskcast::store::{PgResultStore, ResultStore, spawn_janitor};
use taskcast::telemetry::{TelemetryConfig, init_telemetry};
use taskcast::worker::{HandlerRegistry, PoolExit, WorkerConfig, WorkerPool};
use tokio::sync::watch;
use tracing::info;

const JANITOR_INTERVAL: Duration = Duration::from_secs(300);
const CALLBACK_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "taskcast", about = "Lane-routed task orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker pool, recycling it after WORKER_MAX_ITEMS claims
    Worker {
        /// Serve only these lanes (default: every lane in LANE_CONCURRENCY)
        #[arg(long, value_delimiter = ',')]
        lanes: Vec<Lane>,
        /// Fail fatal callback errors immediately instead of retrying them
        #[arg(long)]
        no_retry_fatal: bool,
    },
    /// Run the WebSocket gateway, event relay and result janitor
    Gateway,
    /// Enqueue a task
    Enqueue {
        /// Task kind (determines lane routing)
        kind: String,
        /// JSON arguments
        #[arg(long)]
        args: Option<String>,
    },
    /// Show a task's latest result
    Status { task_id: TaskId },
    /// Cancel a task that no worker has claimed yet
    Cancel { task_id: TaskId },
    /// Print the routing table
    Routes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Worker {
            lanes,
            no_retry_fatal,
        } => cmd_worker(config, lanes, !no_retry_fatal).await,
        Command::Gateway => cmd_gateway(config).await,
        Command::Routes => cmd_routes(&config),
        Command::Enqueue { kind, args } => {
            let queue = connect_queue(&config).await?;
            let args: serde_json::Value = match args {
                Some(json) => serde_json::from_str(&json).context("--args is not valid JSON")?,
                None => serde_json::json!({}),
            };
            let task_id = queue.enqueue(&kind, args).await?;
            println!("Enqueued: {task_id} (lane: {})", queue.routes().route(&kind)?);
            Ok(())
        }
        Command::Status { task_id } => {
            let queue = connect_queue(&config).await?;
            let result = queue.status(task_id).await?;
            println!("ID:       {}", result.task_id);
            println!("Kind:     {}", result.kind);
            println!("Status:   {}", result.status);
            println!("Attempt:  {}", result.attempt);
            println!("Updated:  {}", result.updated_at);
            if let Some(ref payload) = result.payload {
                println!("Result:   {}", serde_json::to_string_pretty(payload)?);
            }
            if let Some(ref err) = result.error {
                println!("Error:    {err}");
            }
            Ok(())
        }
        Command::Cancel { task_id } => {
            let queue = connect_queue(&config).await?;
            if queue.cancel(task_id).await? {
                println!("Cancelled: {task_id}");
            } else {
                println!("Not cancelled: {task_id} is already running or finished");
            }
            Ok(())
        }
    }
}

/// Broker and result-store handles. The store shares the broker's pool
/// unless RESULT_STORE_URL points elsewhere.
async fn connect(config: &Config) -> anyhow::Result<(Arc<Db>, Arc<Db>)> {
    let broker = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    broker.migrate().await?;
    broker.health_check().await?;
    broker.create_lane_queues().await?;

    let store_url = config.result_store_url.expose_secret();
    if store_url == config.database_url.expose_secret() {
        return Ok((Arc::clone(&broker), broker));
    }
    let store = Arc::new(Db::connect(store_url).await?);
    store.migrate().await?;
    Ok((broker, store))
}

async fn connect_queue(config: &Config) -> anyhow::Result<TaskQueue> {
    let (broker, store_db) = connect(config).await?;
    let events: Arc<dyn EventSink> = Arc::new(PgNotifySink::new(store_db.pool().clone()));
    let store: Arc<dyn ResultStore> = Arc::new(PgResultStore::new(store_db, config.result_ttl));
    Ok(TaskQueue::new(
        broker,
        store,
        events,
        Arc::new(config.routing_table()?),
    ))
}

fn on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tx.send_replace(true);
    });
    rx
}

async fn cmd_worker(config: Config, lanes: Vec<Lane>, retry_fatal: bool) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "taskcast-worker"))?;

    let callback_url = config
        .callback_url
        .clone()
        .context("CALLBACK_URL must be set to run a worker")?;

    let (broker_db, store_db) = connect(&config).await?;
    let broker: Arc<dyn Broker> = broker_db;
    let events: Arc<dyn EventSink> = Arc::new(PgNotifySink::new(store_db.pool().clone()));
    let store: Arc<dyn ResultStore> = Arc::new(PgResultStore::new(store_db, config.result_ttl));
    let routes = Arc::new(config.routing_table()?);

    let mut worker_config = WorkerConfig::from_config(&config);
    worker_config.retry_fatal = retry_fatal;
    if !lanes.is_empty() {
        worker_config.lanes.retain(|(lane, _)| lanes.contains(lane));
    }

    let mut stop = on_ctrl_c();
    loop {
        // Shared client and handlers are rebuilt with every pool so a
        // recycle releases whatever the previous generation held on to.
        let client = Arc::new(http_client(CALLBACK_CONNECT_TIMEOUT)?);
        let mut handlers = HandlerRegistry::new();
        handlers.set_fallback(HttpCallback::new(callback_url.as_str()));

        let pool = WorkerPool::new(
            Arc::clone(&broker),
            Arc::clone(&store),
            Arc::clone(&events),
            Arc::clone(&routes),
            Arc::new(handlers),
            client,
            worker_config.clone(),
        );

        let ctrl = pool.clone();
        let mut pool_stop = stop.clone();
        let watcher = tokio::spawn(async move {
            while !*pool_stop.borrow_and_update() {
                if pool_stop.changed().await.is_err() {
                    return;
                }
            }
            ctrl.shutdown();
        });

        let exit = pool.run().await?;
        watcher.abort();

        match exit {
            PoolExit::Recycle if !*stop.borrow_and_update() => {
                info!("worker pool reached its item limit, recycling");
            }
            _ => break,
        }
    }

    info!("worker stopped");
    Ok(())
}

async fn cmd_gateway(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "taskcast-gateway"))?;

    let (_, store_db) = connect(&config).await?;
    let bus = Arc::new(EventBus::new());
    let relay = spawn_pg_relay(store_db.pool(), Arc::clone(&bus)).await?;
    let store: Arc<dyn ResultStore> = Arc::new(PgResultStore::new(store_db, config.result_ttl));
    let janitor = spawn_janitor(store, JANITOR_INTERVAL);

    let gateway = Gateway::new(
        bus,
        GatewayConfig {
            idle_timeout: config.gateway_idle_timeout,
            ..GatewayConfig::default()
        },
    );

    let listener = tokio::net::TcpListener::bind(&config.gateway_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.gateway_addr))?;

    let ctrl = gateway.clone();
    let mut stop = on_ctrl_c();
    tokio::spawn(async move {
        while !*stop.borrow_and_update() {
            if stop.changed().await.is_err() {
                return;
            }
        }
        ctrl.shutdown();
    });

    gateway.serve(listener).await?;
    relay.abort();
    janitor.abort();
    Ok(())
}

fn cmd_routes(config: &Config) -> anyhow::Result<()> {
    let table = config.routing_table()?;

    println!(
        "{:<24}  {:<14}  {:<8}  {:<10}  {:<8}  SOFT",
        "KIND", "LANE", "ATTEMPTS", "BASE_DELAY", "TIMEOUT"
    );
    println!("{}", "-".repeat(80));
    for policy in table.policies() {
        println!(
            "{:<24}  {:<14}  {:<8}  {:<10}  {:<8}  {}",
            policy.kind,
            policy.lane.to_string(),
            policy.max_attempts,
            format!("{}s", policy.base_delay.as_secs()),
            format!("{}s", policy.timeout.as_secs()),
            format!("{}s", policy.soft_timeout.as_secs()),
        );
    }
    Ok(())
}
