//! Command-line arguments and the optional YAML config file
//!
//! Precedence for every setting: command-line flag, then environment
//! variable (handled by clap), then the `--config` file, then the built-in
//! default.

use anyhow::{Context, Result};
use clap::Args;
use l4proxy_agent::AgentConfig;
use l4proxy_control::ControlPlaneConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CTL_ADDR: &str = ":2222";
pub const DEFAULT_SVR_ADDR: &str = "127.0.0.1:2222";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_CLIENT_NAME: &str = "unknown";
pub const DEFAULT_LAN_LISTEN: &str = ":222";

/// Config file format
///
/// ```yaml
/// server:
///   ctl_addr: ":2222"
///   host: relay.example.com
///   pending_timeout_secs: 30
/// client:
///   svr_addr: relay.example.com:2222
///   client_name: build-box
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub client: ClientSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub ctl_addr: Option<String>,
    pub host: Option<String>,
    pub bind_ip: Option<IpAddr>,
    /// 0 disables the timeout
    pub pending_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub event_buffer: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    pub svr_addr: Option<String>,
    pub client_name: Option<String>,
    pub pub_port: Option<u16>,
    pub int_port: Option<u16>,
    /// 0 disables heartbeats
    pub heartbeat_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load `path` if given, otherwise use an empty config
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ServerArgs {
    /// Control server listen address [default: :2222]
    #[arg(long, env = "L4PROXY_CTL_ADDR")]
    pub ctl_addr: Option<String>,

    /// Public host or IP advertised to agents and users [default: 127.0.0.1]
    #[arg(long, env = "L4PROXY_HOST")]
    pub host: Option<String>,

    /// IP the per-client listeners bind to [default: 0.0.0.0]
    #[arg(long, env = "L4PROXY_BIND_IP")]
    pub bind_ip: Option<IpAddr>,

    /// Seconds a user waits for the agent to call back, 0 to wait forever [default: 30]
    #[arg(long, env = "L4PROXY_PENDING_TIMEOUT_SECS")]
    pub pending_timeout_secs: Option<u64>,

    /// Seconds a callback connection may take to send its token [default: 10]
    #[arg(long, env = "L4PROXY_HANDSHAKE_TIMEOUT_SECS")]
    pub handshake_timeout_secs: Option<u64>,

    /// Events queued per agent before accepting stalls [default: 64]
    #[arg(long, env = "L4PROXY_EVENT_BUFFER")]
    pub event_buffer: Option<usize>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ClientArgs {
    /// Control server address [default: 127.0.0.1:2222]
    #[arg(long, env = "L4PROXY_SVR_ADDR")]
    pub svr_addr: Option<String>,

    /// Public port to request, 0 for any
    #[arg(long, env = "L4PROXY_PUB_PORT")]
    pub pub_port: Option<u16>,

    /// Internal port to request, 0 for any
    #[arg(long, env = "L4PROXY_INT_PORT")]
    pub int_port: Option<u16>,

    /// Display name shown in listings [default: unknown]
    #[arg(long, env = "L4PROXY_CLIENT_NAME")]
    pub client_name: Option<String>,

    /// Seconds between heartbeats, 0 to disable [default: 30]
    #[arg(long, env = "L4PROXY_HEARTBEAT_SECS")]
    pub heartbeat_secs: Option<u64>,

    /// Host of the local service to expose
    #[arg(default_value = "127.0.0.1")]
    pub host: String,

    /// Port of the local service to expose
    #[arg(default_value_t = 22)]
    pub port: u16,
}

/// Fully resolved server settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub ctl_addr: SocketAddr,
    pub plane: ControlPlaneConfig,
}

impl ServerSettings {
    pub fn resolve(args: &ServerArgs, file: &ServerSection) -> Result<Self> {
        let defaults = ControlPlaneConfig::default();

        let ctl_addr = args
            .ctl_addr
            .clone()
            .or_else(|| file.ctl_addr.clone())
            .unwrap_or_else(|| DEFAULT_CTL_ADDR.to_string());
        let ctl_addr = parse_listen_addr(&ctl_addr)?;

        let pending_timeout = match args.pending_timeout_secs.or(file.pending_timeout_secs) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.pending_timeout,
        };

        let handshake_timeout = args
            .handshake_timeout_secs
            .or(file.handshake_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.handshake_timeout);

        let event_buffer = args
            .event_buffer
            .or(file.event_buffer)
            .unwrap_or(defaults.event_buffer);
        if event_buffer == 0 {
            anyhow::bail!("event_buffer must be at least 1");
        }

        Ok(Self {
            ctl_addr,
            plane: ControlPlaneConfig {
                host: args
                    .host
                    .clone()
                    .or_else(|| file.host.clone())
                    .unwrap_or_else(|| DEFAULT_HOST.to_string()),
                bind_ip: args.bind_ip.or(file.bind_ip).unwrap_or(defaults.bind_ip),
                pending_timeout,
                handshake_timeout,
                event_buffer,
            },
        })
    }
}

/// Resolve the agent configuration
pub fn resolve_agent(args: &ClientArgs, file: &ClientSection) -> AgentConfig {
    let defaults = AgentConfig::default();

    let heartbeat_interval = match args.heartbeat_secs.or(file.heartbeat_secs) {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => defaults.heartbeat_interval,
    };

    AgentConfig {
        server_addr: resolve_svr_addr(args.svr_addr.as_deref(), file),
        display_name: args
            .client_name
            .clone()
            .or_else(|| file.client_name.clone())
            .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string()),
        public_port: args.pub_port.or(file.pub_port).unwrap_or(0),
        internal_port: args.int_port.or(file.int_port).unwrap_or(0),
        target_address: join_host_port(&args.host, args.port),
        heartbeat_interval,
    }
}

pub fn resolve_svr_addr(flag: Option<&str>, file: &ClientSection) -> String {
    flag.map(str::to_string)
        .or_else(|| file.svr_addr.clone())
        .unwrap_or_else(|| DEFAULT_SVR_ADDR.to_string())
}

/// Parse a listen address, accepting `:port` as shorthand for all interfaces
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("Invalid listen address '{}'", addr))
}

pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
