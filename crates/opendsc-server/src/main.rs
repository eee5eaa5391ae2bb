use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use opendsc_server::config::ServerConfig;
use opendsc_server::handlers;
use opendsc_server::shutdown;
use opendsc_server::state::AppState;
use opendsc_storage::{ContentStore, Repositories};

#[derive(Debug, Parser)]
#[command(name = "opendsc-server", about = "OpenDSC Pull Server")]
struct Cli {
    /// Path to a configuration file
    #[arg(long, env = "OPENDSC_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = ServerConfig::load(cli.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            tracing::error!(%error, "invalid configuration");
        }
        anyhow::bail!("configuration validation failed");
    }
    config.log_summary();

    tracing::info!("connecting to PostgreSQL");
    let repos = Repositories::connect(&config.database.url, config.database.pool_max).await?;
    tracing::info!("migrations applied");

    let content = ContentStore::open(config.content.root.clone()).await?;

    opendsc_server::auth::bootstrap::bootstrap_admin(&repos).await?;

    let addr: SocketAddr = format!("{}:{}", config.server.listen_address, config.server.http_port)
        .parse()?;

    let coordinator = shutdown::install(config.server.shutdown_timeout_seconds);
    let handle = coordinator.subscribe();

    let state = AppState::new(repos, content, config);
    let router = handlers::router(state);

    tracing::info!(%addr, "pull server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { handle.wait().await })
        .await?;

    tracing::info!("pull server stopped");
    Ok(())
}
