//! l4proxy CLI
//!
//! Expose a TCP service that sits behind NAT through a public broker.

mod config;
mod table;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{ClientArgs, FileConfig, ServerArgs, ServerSettings};
use l4proxy_agent::{Agent, ControlClient};
use l4proxy_control::{ControlPlane, ControlServer};
use l4proxy_relay::{ForwarderConfig, TcpForwarder};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// l4proxy - reverse TCP tunnel broker and agent
#[derive(Parser, Debug)]
#[command(name = "l4proxy")]
#[command(about = "Reverse TCP proxy: publish a service behind NAT through a broker")]
#[command(version)]
#[command(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    "\nCommit: ",
    env!("L4PROXY_COMMIT"),
    "\nBuilt: ",
    env!("L4PROXY_BUILT")
))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// YAML config file with `server` and `client` sections
    #[arg(short, long, global = true, env = "L4PROXY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the broker
    Server(ServerArgs),

    /// Register with a broker and expose a local service
    Client(ClientArgs),

    /// List registered clients
    List {
        /// Control server address [default: 127.0.0.1:2222]
        #[arg(long, env = "L4PROXY_SVR_ADDR")]
        svr_addr: Option<String>,
    },

    /// List users connected through one client
    Users {
        /// Control server address [default: 127.0.0.1:2222]
        #[arg(long, env = "L4PROXY_SVR_ADDR")]
        svr_addr: Option<String>,

        /// Unique client name as shown by `list`
        #[arg(long)]
        client_name: String,
    },

    /// Forward a local port straight to a remote address, no broker involved
    Lan {
        /// Listen address
        #[arg(long, default_value = config::DEFAULT_LAN_LISTEN)]
        listen: String,

        /// Remote host
        #[arg(default_value = "127.0.0.1")]
        host: String,

        /// Remote port
        #[arg(default_value_t = 22)]
        port: u16,
    },
}

/// Setup logging with the specified log level. `RUST_LOG` takes precedence.
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down...");
                token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });
}

async fn run_server(settings: ServerSettings) -> Result<()> {
    let plane = Arc::new(ControlPlane::new(settings.plane));
    let server = ControlServer::bind(settings.ctl_addr, plane)
        .await
        .with_context(|| format!("Failed to listen on {}", settings.ctl_addr))?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    server.run(shutdown).await.context("Control server failed")?;
    info!("l4proxy server stopped");
    Ok(())
}

async fn run_client(config: l4proxy_agent::AgentConfig) -> Result<()> {
    let server_addr = config.server_addr.clone();
    let agent = Agent::connect(config)
        .await
        .with_context(|| format!("Failed to register with {}", server_addr))?;

    println!("PUBLIC ADDRESS: {}", agent.public_address());

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    agent.run(shutdown).await.context("Agent stopped with an error")?;
    info!("l4proxy client stopped");
    Ok(())
}

async fn run_lan(listen: &str, remote_addr: String) -> Result<()> {
    let forwarder = TcpForwarder::bind(ForwarderConfig {
        listen_addr: config::parse_listen_addr(listen)?,
        remote_addr,
    })
    .await
    .context("Failed to start forwarder")?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    forwarder.run(shutdown).await.context("Forwarder failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let file = FileConfig::load_optional(cli.config.as_deref())?;

    match cli.command {
        Commands::Server(args) => {
            let settings = ServerSettings::resolve(&args, &file.server)?;
            info!(
                ctl_addr = %settings.ctl_addr,
                host = %settings.plane.host,
                "l4proxy server starting"
            );
            run_server(settings).await
        }
        Commands::Client(args) => {
            let agent_config = config::resolve_agent(&args, &file.client);
            info!(
                server = %agent_config.server_addr,
                target = %agent_config.target_address,
                "l4proxy client starting"
            );
            run_client(agent_config).await
        }
        Commands::List { svr_addr } => {
            let server_addr = config::resolve_svr_addr(svr_addr.as_deref(), &file.client);
            let client = ControlClient::new(server_addr);
            let clients = client
                .list_clients()
                .await
                .context("List clients failed")?;
            print!("{}", table::clients(&clients));
            Ok(())
        }
        Commands::Users {
            svr_addr,
            client_name,
        } => {
            let server_addr = config::resolve_svr_addr(svr_addr.as_deref(), &file.client);
            let client = ControlClient::new(server_addr);
            let users = client
                .list_users(&client_name)
                .await
                .with_context(|| format!("List users of {} failed", client_name))?;
            print!("{}", table::users(&users));
            Ok(())
        }
        Commands::Lan { listen, host, port } => {
            run_lan(&listen, config::join_host_port(&host, port)).await
        }
    }
}
