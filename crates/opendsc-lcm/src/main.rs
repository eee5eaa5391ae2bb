use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use opendsc_core::types::ConfigurationSource;
use opendsc_lcm::executor::DscExecutor;
use opendsc_lcm::pull::PullClient;
use opendsc_lcm::settings::{self, CliOverrides, SettingsLoader, SettingsStore};
use opendsc_lcm::worker::Worker;
use opendsc_lcm::paths;

#[derive(Debug, Parser)]
#[command(name = "opendsc-lcm", about = "OpenDSC Local Configuration Manager")]
struct Cli {
    /// Enforcement mode (Monitor or Remediate)
    #[arg(long)]
    mode: Option<String>,

    /// Configuration source (Local or Pull)
    #[arg(long)]
    source: Option<String>,

    /// Path of the local configuration file
    #[arg(long)]
    configuration_path: Option<std::path::PathBuf>,

    /// Cycle interval as HH:MM:SS
    #[arg(long)]
    interval: Option<String>,

    /// Pull server URL
    #[arg(long)]
    server_url: Option<String>,

    /// Environment name for the appsettings overlay
    #[arg(long, env = "LCM_ENVIRONMENT")]
    environment: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        configuration_mode: cli.mode,
        configuration_source: cli.source,
        configuration_path: cli.configuration_path,
        configuration_mode_interval: cli.interval,
        server_url: cli.server_url,
    };
    let loader = SettingsLoader::standard(cli.environment.as_deref(), overrides);

    let initial = match loader.load() {
        Ok(settings) => settings,
        Err(errors) => {
            // Logging is not up yet; configuration failures go to stderr.
            for error in &errors {
                eprintln!("configuration error: {}", error);
            }
            return ExitCode::from(2);
        }
    };

    let default_filter = format!("info,opendsc_lcm={}", initial.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!(
        mode = %initial.configuration_mode,
        source = %initial.configuration_source,
        interval_seconds = initial.configuration_mode_interval.as_secs(),
        "local configuration manager starting"
    );

    let executable = settings::resolve_executable(&initial);
    let enforcer = Arc::new(DscExecutor::new(executable, &initial.log_level));

    let source: Option<Arc<dyn opendsc_lcm::pull::BundleSource>> =
        if initial.configuration_source == ConfigurationSource::Pull {
            let pull_settings = initial
                .pull_server
                .clone()
                .expect("validated: Pull requires PullServer");
            let fqdn = hostname();
            match PullClient::new(pull_settings, paths::data_dir(), fqdn) {
                Ok(client) => Some(Arc::new(client)),
                Err(error) => {
                    tracing::error!(%error, "cannot initialize pull client");
                    return ExitCode::from(3);
                }
            }
        } else {
            None
        };

    let store = Arc::new(SettingsStore::new(initial));

    // Keep the watcher alive for the whole run; dropping it stops reloads.
    let _watcher = match settings::watch(Arc::clone(&store), loader) {
        Ok(watcher) => Some(watcher),
        Err(error) => {
            tracing::warn!(%error, "configuration watcher unavailable; reload disabled");
            None
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let worker = Worker::new(store, enforcer, source, cancel);
    match worker.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "worker failed");
            ExitCode::from(3)
        }
    }
}

fn hostname() -> String {
    std::env::var("LCM_FQDN").unwrap_or_else(|_| {
        std::process::Command::new("hostname")
            .arg("-f")
            .output()
            .ok()
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    })
}
