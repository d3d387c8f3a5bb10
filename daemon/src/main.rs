/// Gantry daemon - main entry point
/// Starts the HTTP server exposing workflows and pipelines
use clap::Parser;
use gantry_daemon::{DaemonConfig, GantryServer};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "gantry-daemon",
    about = "Control plane server for AI coding agent workflows and pipelines",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long, value_name = "ADDR", help = "Bind address (default: 127.0.0.1)")]
    host: Option<String>,

    /// HTTP server port
    #[arg(
        short,
        long,
        value_name = "PORT",
        help = "HTTP server port (default: 7777)"
    )]
    port: Option<u16>,

    /// SQLite database path
    #[arg(long, value_name = "PATH", help = "State database file")]
    db_path: Option<PathBuf>,

    /// Public URL for approval links
    #[arg(long, value_name = "URL", help = "Base URL used in approve/reject links")]
    base_url: Option<String>,

    /// Log level
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long, help = "Log as JSON")]
    json_logs: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(level.parse()?);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(true)
            .init();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration before logging so its [logging] section applies
    let mut config = DaemonConfig::load_or_default(args.config.as_deref())?;
    config.load_from_env();

    // Apply CLI overrides
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(path) = args.db_path {
        config.core.storage.database_path = path;
    }
    if let Some(url) = args.base_url {
        config.core.pipelines.base_url = url;
    }
    if let Some(level) = args.log_level {
        config.core.logging.level = level;
    }
    if args.verbose {
        config.core.logging.level = "debug".to_string();
    }
    if args.json_logs {
        config.core.logging.format = "json".to_string();
    }

    config.validate()?;
    init_logging(
        &config.core.logging.level,
        config.core.logging.format == "json",
    )?;

    info!("Starting Gantry daemon v{}", gantry_daemon::VERSION);
    info!(
        "Server configuration: http://{}, database {}",
        config.bind_addr(),
        config.core.storage.database_path.display()
    );

    let server = GantryServer::new(config).await?;
    server.run_until(shutdown_signal()).await?;

    info!("Gantry daemon stopped");
    Ok(())
}
