//! llmgate - cold-start aware gateway for LLM inference backends
//!
//! Routes inference traffic to a local, remote or auxiliary backend, starts
//! the remote worker on demand and stops it again once it has been idle.

use anyhow::{Context, Result};
use clap::Parser;
use llmgate::Config;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llmgate")]
#[command(about = "Cold-start aware gateway for LLM inference backends")]
struct Args {
    /// Path to a JSON configuration file (defaults apply when omitted)
    #[arg(short, long, env = "LLMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long, env = "LLMGATE_PORT")]
    port: Option<u16>,

    /// Metrics port, 0 disables (overrides config)
    #[arg(long, env = "LLMGATE_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Local backend base URL
    #[arg(long, env = "LLMGATE_LOCAL_URL")]
    local_url: Option<String>,

    /// Remote backend base URL
    #[arg(long, env = "LLMGATE_REMOTE_URL")]
    remote_url: Option<String>,

    /// Auxiliary backend base URL
    #[arg(long, env = "LLMGATE_AUXILIARY_URL")]
    auxiliary_url: Option<String>,

    /// Worker-control command, invoked as `<command> warm|stop`
    #[arg(long, env = "LLMGATE_WORKER_COMMAND")]
    worker_command: Option<String>,

    /// Idle time before the worker is stopped, e.g. "40m" (clamped to 5m..24h)
    #[arg(long, env = "LLMGATE_IDLE_TIMEOUT", value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if let Some(url) = self.local_url {
            config.local_url = url;
        }
        if let Some(url) = self.remote_url {
            config.remote_url = Some(url);
        }
        if let Some(url) = self.auxiliary_url {
            config.auxiliary_url = Some(url);
        }
        if let Some(command) = self.worker_command {
            config.worker_command = command;
        }
        if let Some(timeout) = self.idle_timeout {
            config.idle_timeout_secs = timeout.as_secs();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Worker-control output is logged under the "worker" target at debug
    // level, so it can be enabled with e.g. RUST_LOG=info,worker=debug.
    let filter = if args.verbose {
        EnvFilter::new("llmgate=debug,worker=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting llmgate");

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        port = config.port,
        metrics_port = config.metrics_port,
        worker_command = %config.worker_command,
        idle_timeout = %humantime::format_duration(config.idle_timeout()),
        "Configuration loaded"
    );

    let (app, metrics_router, gateway) = llmgate::build_app(config.clone())
        .await
        .context("Failed to build application")?;

    let _watcher = llmgate::watcher::spawn(gateway.clone());
    let _fleet_refresh = gateway.fleet().map(|fleet| fleet.spawn_refresh_loop());

    // Spawn metrics server if enabled
    if let Some(metrics_router) = metrics_router {
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics to {}", metrics_addr))?;
        info!(addr = %metrics_addr, "Serving metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Listening for requests");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
