//! tcptunnel - reverse TCP tunnel server and client

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tcptunnel_cli::config::{ClientFile, ServerFile};
use tcptunnel_cli::exit_code;
use tcptunnel_client::{ReconnectConfig, Supervisor};
use tcptunnel_server::ControlServer;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "tcptunnel")]
#[command(about = "Expose private TCP services through a public tunnel server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public tunnel server
    Server {
        /// Server configuration file (YAML)
        #[arg(short, long, env = "TCPTUNNEL_SERVER_CONFIG")]
        config: PathBuf,
    },
    /// Connect to a tunnel server and serve its sessions
    Client {
        /// Client configuration file (YAML)
        #[arg(short, long, env = "TCPTUNNEL_CLIENT_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Server { config } => run_server(&config).await,
        Commands::Client { config } => {
            let code = run_client(&config).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

async fn run_server(path: &Path) -> Result<()> {
    let file = ServerFile::load(path)?;
    let config = file.to_server_config()?;

    let server = Arc::new(
        ControlServer::bind(config)
            .await
            .context("Failed to start tunnel server")?,
    );
    info!(
        "Tunnel server listening on {} (relay port {})",
        server.local_addr(),
        server.relay_port()
    );

    let runner = tokio::spawn(server.clone().run());
    let mut reload = ReloadSignal::new()?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Error listening for shutdown signal: {}", e);
                }
                info!("Shutdown signal received, stopping server...");
                break;
            }
            _ = reload.recv() => reload_server(&server, path).await,
        }
    }

    server.shutdown();
    runner.await.context("Server task failed")??;
    Ok(())
}

/// Re-read the config file and swap in its credentials and rules
///
/// A file that fails to load leaves the running tables untouched.
async fn reload_server(server: &ControlServer, path: &Path) {
    info!("Reloading configuration from {}", path.display());
    let file = match ServerFile::load(path) {
        Ok(file) => file,
        Err(e) => {
            error!("Keeping current configuration: {:#}", e);
            return;
        }
    };

    server.set_clients_password(file.credentials()).await;
    if let Err(e) = server.set_listen_ports(file.port_rules()).await {
        error!("Failed to apply forwarding rules: {}", e);
        return;
    }
    info!(
        "Configuration reloaded ({} client(s), {} rule(s))",
        file.clients.len(),
        file.rules.len()
    );
}

async fn run_client(path: &Path) -> Result<i32> {
    let config = ClientFile::load(path)?.to_client_config()?;
    info!(
        "Connecting to tunnel server {} as {}",
        config.server_addr(),
        config.name
    );

    let supervisor = Supervisor::new(config, ReconnectConfig::default());
    let shutdown = supervisor.shutdown_token();
    let mut run = tokio::spawn(supervisor.run());

    let exit = tokio::select! {
        exit = &mut run => exit.context("Client task failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, disconnecting...");
            shutdown.cancel();
            run.await.context("Client task failed")?
        }
    };

    match exit_code(&exit) {
        0 => info!("Client stopped"),
        code => error!("Client stopped: {:?} (exit code {})", exit, code),
    }
    Ok(exit_code(&exit))
}

/// SIGHUP on unix; never fires elsewhere
struct ReloadSignal {
    #[cfg(unix)]
    inner: tokio::signal::unix::Signal,
}

impl ReloadSignal {
    fn new() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            inner: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .context("Failed to install SIGHUP handler")?,
        })
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            self.inner.recv().await;
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    }
}
