//! termbridge server
//!
//! Serves interactive shells over WebSocket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use termbridge::auth::TokenAuthenticator;
use termbridge::config::Config;
use termbridge::server::{self, AppState};
use termbridge::session::{ManagerSettings, NativeLauncher, SessionManager};
use tokio::net::TcpListener;

/// termbridge - interactive shells over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "termbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start accepting shell connections
    Serve {
        /// Address to listen on (overrides config)
        #[arg(long, short, value_name = "ADDR", conflicts_with = "port")]
        listen: Option<String>,

        /// Port to listen on, on all interfaces (overrides config)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Print built-in defaults instead of the loaded configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.server.log_level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { listen, port } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            } else if let Some(port) = port {
                config.server.listen = format!("0.0.0.0:{port}");
            }
            config.validate()?;
            run_server(config).await
        }
        Commands::Config { default } => {
            let config = if default { Config::default() } else { config };
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let auth = TokenAuthenticator::from_config(&config.auth);
    if auth.is_empty() {
        tracing::warn!("No credentials configured; every connection will be refused");
    }
    if config.auth.allow_any_token {
        tracing::warn!(
            user = %config.auth.default_user,
            "allow_any_token is enabled; any non-empty credential opens a shell"
        );
    }

    let launcher = Arc::new(NativeLauncher::from_config(&config.session));
    let manager = Arc::new(SessionManager::new(
        launcher,
        ManagerSettings::from_config(&config.session),
    ));
    let state = AppState::new(manager, Arc::new(auth), config.session.outbound_capacity);
    let shutdown = state.shutdown.clone();

    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!(
        shell = %config.session.shell,
        max_sessions = config.session.max_sessions,
        "termbridge starting"
    );

    let server = tokio::spawn(server::serve(listener, state));

    wait_for_shutdown_signal().await?;
    tracing::info!("Shutting down");
    shutdown.cancel();

    server.await.context("Server task panicked")??;
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
