//! CLI entry point - the composition root.
//!
//! Wires together config loading, the process manager and the HTTP
//! surface. Shutdown is signal-driven: ctrl-c cancels the server, then
//! every subprocess is terminated before exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clara_core::Config;
use clara_proxy::AppState;
use clara_runtime::{LogMux, Manager};

/// On-demand model multiplexer: an OpenAI-compatible proxy that starts,
/// swaps and evicts inference subprocesses per request.
#[derive(Debug, Parser)]
#[command(name = "claracore", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml", env = "CLARACORE_CONFIG")]
    config: PathBuf,

    /// Address the proxy listens on.
    #[arg(short, long, default_value = "127.0.0.1:8080", env = "CLARACORE_LISTEN")]
    listen: String,

    /// Tracing filter override (takes precedence over the config's
    /// logLevel).
    #[arg(long, env = "CLARACORE_LOG_LEVEL")]
    log_level: Option<String>,
}

fn init_tracing(cli: &Cli, config: &Config) {
    let directive = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&cli, &config);

    let model_count = config.models.len();
    info!(
        config = %cli.config.display(),
        models = model_count,
        "configuration loaded"
    );

    let logs = Arc::new(LogMux::new());
    let manager = Manager::new(config, Arc::clone(&logs));

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;

    let state = AppState {
        manager: Arc::clone(&manager),
        client: reqwest::Client::new(),
        config_path: cli.config.clone(),
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let result = clara_proxy::serve(listener, state, cancel).await;
    if let Err(e) = &result {
        error!(error = %e, "server exited with error");
    }

    // Subprocesses must not outlive the proxy.
    manager.shutdown_all().await;
    info!("all subprocesses stopped");

    result
}
