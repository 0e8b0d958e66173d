use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use conduit_gateway::hash_api_key;
use conduit_server::api::{self, AppState};
use conduit_server::config::ConduitConfig;
use conduit_server::runtime::Runtime;

/// Conduit gateway HTTP server.
#[derive(Parser, Debug)]
#[command(name = "conduit-server", about = "Standalone HTTP server for Conduit")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "conduit.toml")]
    config: PathBuf,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the lookup hash of an API key for `[auth.api_keys]`. Reads the
    /// raw key from stdin.
    HashKey,
    /// Load the configuration, assemble the runtime, and exit.
    Check,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Commands::HashKey) = cli.command {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        println!("{}", hash_api_key(raw.trim()));
        return Ok(());
    }

    let (mut config, found) = ConduitConfig::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let telemetry_guard = conduit_server::telemetry::init(&config.telemetry);
    if !found {
        info!(path = %cli.config.display(), "config file not found, using defaults");
    }

    let runtime = Arc::new(Runtime::build(&config)?);
    if let Some(Commands::Check) = cli.command {
        info!(path = %cli.config.display(), "configuration is valid");
        telemetry_guard.shutdown();
        return Ok(());
    }

    let tasks = runtime.start();
    let app = api::router(AppState {
        runtime: Arc::clone(&runtime),
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "conduit server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("listener closed, draining workflows and background tasks");
    runtime
        .shutdown(tasks, Duration::from_secs(config.server.shutdown_timeout_seconds))
        .await;

    telemetry_guard.shutdown();
    info!("conduit server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received SIGINT"); }
        () = terminate => { info!("received SIGTERM"); }
    }
}
