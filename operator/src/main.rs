//! Preview operator: per-branch and per-pull-request preview environments.
//!
//! `run` starts both controllers, the webhook and status API, and
//! optionally a local build job runner. `apply` writes an environment
//! definition to the store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;

use preview_operator::config::{ConfigError, OperatorConfig};
use preview_operator::controller::environment::EnvironmentReconciler;
use preview_operator::controller::instance::InstanceReconciler;
use preview_operator::controller::Controller;
use preview_operator::routes::{self, RouterState};
use preview_operator::services::build_service::BuildService;
use preview_operator::services::comment_service::CommentService;
use preview_operator::services::deploy_service::DeployService;
use preview_operator::services::github_service::{GithubClient, RepositoryProvider};
use preview_operator::services::identity_service::{IdentityProvider, KeycloakClient};
use preview_operator::services::job_runner::JobRunner;
use preview_operator::store::{Api, MemoryStore, ObjectStore, PgStore};
use preview_operator::{metrics, seeder};

#[derive(Parser)]
#[command(name = "preview-operator", about = "Preview environments for branches and pull requests")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controllers and the HTTP server
    Run(RunArgs),
    /// Create or update an environment from a JSON definition
    Apply(ApplyArgs),
}

#[derive(Args)]
struct RunArgs {
    /// HTTP port for webhooks and the status API
    #[arg(short, long, env = "PREVIEW_HTTP_PORT", default_value = "8080")]
    port: u16,

    /// Prometheus exporter port
    #[arg(long, env = "PREVIEW_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Keep all records in memory instead of PostgreSQL
    #[arg(long)]
    memory_store: bool,

    /// Execute build jobs locally with git and docker
    #[arg(long)]
    run_jobs: bool,

    /// Scratch directory for locally executed builds
    #[arg(long, env = "PREVIEW_WORKSPACE_DIR", default_value = "/tmp/preview-builds")]
    workspace_dir: PathBuf,
}

#[derive(Args)]
struct ApplyArgs {
    /// Environment definition (JSON)
    #[arg(short, long)]
    file: PathBuf,

    /// Identity-provider id of the environment owner
    #[arg(long)]
    owner: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    let config = match OperatorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            return Err(e.into());
        }
    };

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Apply(args) => apply(config, args).await,
    }
}

async fn connect_store(
    config: &OperatorConfig,
    memory: bool,
) -> anyhow::Result<Arc<dyn ObjectStore>> {
    if memory {
        tracing::warn!("Using in-memory store -- records are lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let Some(url) = &config.database_url else {
        tracing::error!("{}", ConfigError::MissingDatabase);
        return Err(ConfigError::MissingDatabase.into());
    };
    let store = PgStore::connect(url, config.workers * 2 + 2).await?;
    Ok(Arc::new(store))
}

async fn apply(config: OperatorConfig, args: ApplyArgs) -> anyhow::Result<()> {
    let store = connect_store(&config, false).await?;
    let environments = Api::namespaced(store, &config.namespace);
    let spec = seeder::load(&args.file).await?;
    let env = seeder::apply(&environments, spec, &args.owner).await?;
    println!("{}", env.metadata.name);
    Ok(())
}

async fn run(config: OperatorConfig, args: RunArgs) -> anyhow::Result<()> {
    tracing::info!(namespace = %config.namespace, "Starting preview operator...");

    let store = connect_store(&config, args.memory_store).await?;
    let ns = config.namespace.as_str();

    let environments = Api::namespaced(store.clone(), ns);
    let instances = Api::namespaced(store.clone(), ns);
    let jobs = Api::namespaced(store.clone(), ns);
    let pods = Api::namespaced(store.clone(), ns);

    let provider: Arc<dyn RepositoryProvider> =
        Arc::new(GithubClient::new(&config.github.api_url, &config.github.token));
    let identity: Option<Arc<dyn IdentityProvider>> = config
        .keycloak
        .clone()
        .map(|settings| Arc::new(KeycloakClient::new(settings)) as Arc<dyn IdentityProvider>);
    if identity.is_none() {
        tracing::warn!("Keycloak not configured -- access groups are not synchronised");
    }

    let builds = BuildService::new(
        jobs.clone(),
        pods.clone(),
        instances.clone(),
        config.build.clone(),
    );
    let deployer = DeployService::new(
        Api::namespaced(store.clone(), ns),
        Api::namespaced(store.clone(), ns),
        Api::namespaced(store.clone(), ns),
        instances.clone(),
        config.auth_proxy.clone(),
        identity.clone(),
    );
    let comments = CommentService::new(provider.clone());

    let environment_controller = Controller::new(
        Arc::new(EnvironmentReconciler::new(
            environments.clone(),
            instances.clone(),
            provider.clone(),
        )),
        store.clone(),
        ns,
        config.workers,
        config.environment_resync,
    );
    let instance_controller = Controller::new(
        Arc::new(InstanceReconciler::new(
            instances.clone(),
            environments.clone(),
            provider,
            builds,
            deployer,
            comments,
        )),
        store.clone(),
        ns,
        config.workers,
        config.instance_resync,
    );

    let state = RouterState {
        environments,
        instances,
        identity,
        environment_queue: environment_controller.handle(),
        instance_queue: instance_controller.handle(),
        webhook_secret: config.github.webhook_secret.clone(),
    };

    metrics::init_metrics(SocketAddr::from(([0, 0, 0, 0], args.metrics_port)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![
        tokio::spawn(environment_controller.run(shutdown_rx.clone())),
        tokio::spawn(instance_controller.run(shutdown_rx.clone())),
    ];
    if args.run_jobs {
        let runner = JobRunner::new(jobs, pods, args.workspace_dir);
        tasks.push(tokio::spawn(runner.run(shutdown_rx.clone())));
    }

    let app = routes::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!("Preview operator listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("Background task panicked: {e}");
        }
    }
    tracing::info!("Preview operator stopped");

    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {e}");
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
                tracing::error!("Failed to listen for SIGTERM: {e}");
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
    tracing::info!("Shutdown signal received");
}
