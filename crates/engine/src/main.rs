use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use notiflow_engine::{
    config::Config,
    dispatcher::{
        HttpNotificationSender, HttpWebhookSender, LogNotificationSender, NotificationSender,
        StepDispatcher,
    },
    engine::WorkflowEngine,
    events::TracingPublisher,
    model::WorkflowDefinition,
    pool::WorkerPool,
    scheduler::Scheduler,
    server::Server,
    store::{create_store, TenantStores},
};

#[derive(Parser)]
#[command(author, version, about = "Multi-tenant notification workflow engine", long_about = None)]
struct Cli {
    /// Log level (debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP ingress, worker pool and scheduler (default)
    Serve,

    /// Check a workflow definition file (YAML or JSON) without storing it
    Validate {
        /// Path to the definition
        file: PathBuf,

        /// Tenant to validate against when the file does not name one
        #[arg(short, long, default_value = "default")]
        tenant: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("notiflow_engine={},notiflow={},info", cli.log_level, cli.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Validate { file, tenant } => validate(&file, &tenant),
    }
}

fn validate(file: &Path, tenant: &str) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let is_json = file.extension().and_then(|e| e.to_str()) == Some("json");
    let definition: WorkflowDefinition = if is_json {
        serde_json::from_str(&raw).with_context(|| format!("{} is not a valid definition", file.display()))?
    } else {
        serde_yaml::from_str(&raw).with_context(|| format!("{} is not a valid definition", file.display()))?
    };

    let tenant = definition.tenant_id.clone().unwrap_or_else(|| tenant.to_string());
    let mut workflow = definition.into_workflow(&tenant);
    workflow.activate()?;

    println!(
        "{}: workflow '{}' is valid ({} steps, {} mode, trigger '{}')",
        file.display(),
        workflow.name,
        workflow.steps.len(),
        if workflow.is_graph() { "graph" } else { "sequential" },
        workflow.trigger.identifier
    );
    Ok(())
}

async fn serve() -> Result<()> {
    let config = Config::load()?;
    info!("Loaded configuration: {:?}", config);

    let default_store = create_store(&config.database).await?;
    let stores = TenantStores::connect(
        default_store,
        &config.tenant_databases,
        config.database.max_connections,
    )
    .await?;
    stores.init().await?;

    let notifications: Arc<dyn NotificationSender> = match &config.notifications.service_url {
        Some(url) => Arc::new(HttpNotificationSender::new(url, config.engine.step_timeout)?),
        None => {
            warn!("NOTIFICATION_SERVICE_URL is not set, notifications will only be logged");
            Arc::new(LogNotificationSender)
        }
    };
    let webhooks = Arc::new(HttpWebhookSender::new(config.engine.step_timeout)?);
    let dispatcher = StepDispatcher::new(notifications, webhooks);

    let pool = Arc::new(WorkerPool::start(&config.pool));
    let engine = WorkflowEngine::new(
        stores.clone(),
        dispatcher,
        Arc::new(TracingPublisher),
        pool.clone(),
        &config.engine,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(engine.clone(), &config.engine);
    let sweeps = scheduler.spawn(shutdown_rx);

    let app = Server::new(engine).build_router();
    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.addr))?;
    info!("Starting server on {}", config.server.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    futures::future::join_all(sweeps).await;
    pool.shutdown().await;
    stores.close().await;
    info!("Shutdown complete");
    Ok(())
}
