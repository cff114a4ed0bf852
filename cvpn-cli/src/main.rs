//! cvpn CLI
//!
//! Command-line front end for the cvpn encrypted IP tunnel.

mod device;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cvpn_engine::{Client, ClientConfig, Config, ScriptHook, Server, ServerConfig};
use cvpn_protocol::{BufferPool, DEFAULT_BUFFER_CAPACITY};

/// cvpn - encrypted IPv4 tunnel over TCP
#[derive(Parser)]
#[command(name = "cvpn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "cvpn.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as tunnel server
    Server {
        /// Address to accept clients on
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Server tunnel address with prefix, e.g. 10.0.200.1/24
        #[arg(long)]
        cidr: Option<String>,

        /// Shared secret
        #[arg(long)]
        secret: Option<String>,

        /// First port of the leased port range
        #[arg(long)]
        port_base: Option<u16>,
    },

    /// Run as tunnel client
    Client {
        /// Server address as host:port
        #[arg(long)]
        server: Option<String>,

        /// Shared secret
        #[arg(long)]
        secret: Option<String>,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "cvpn.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            listen,
            cidr,
            secret,
            port_base,
        } => {
            let mut config = load_config(&cli.config)?;
            let server = config.server.get_or_insert_with(ServerConfig::default);
            if let Some(listen) = listen {
                server.listen = listen;
            }
            if let Some(cidr) = cidr {
                server.tunnel_cidr = cidr;
            }
            if let Some(port_base) = port_base {
                server.port_base = port_base;
            }
            if let Some(secret) = secret {
                config.common.secret = secret;
            }

            init_logging(cli.log_level.as_deref().unwrap_or(&config.common.log_level));
            log_failure(run_server(config).await)
        }
        Commands::Client { server, secret } => {
            let mut config = load_config(&cli.config)?;
            let client = config.client.get_or_insert_with(ClientConfig::default);
            if let Some(server) = server {
                client.server = server;
            }
            if let Some(secret) = secret {
                config.common.secret = secret;
            }

            init_logging(cli.log_level.as_deref().unwrap_or(&config.common.log_level));
            log_failure(run_client(config).await)
        }
        Commands::GenConfig { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            generate_config(output)
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn log_failure(result: Result<()>) -> Result<()> {
    if let Err(ref e) = result {
        error!("{:#}", e);
    }
    result
}

/// Load the config file, or start from defaults when it does not exist
///
/// Not validated here: command line flags are applied first.
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration from {:?}", path))?;
    Config::from_toml_unchecked(&content)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn buffer_pool(config: &Config) -> BufferPool {
    let pool = BufferPool::new(config.common.buffer_pool_size, DEFAULT_BUFFER_CAPACITY);
    pool.prewarm(config.common.buffer_pool_size / 2);
    pool
}

async fn run_server(mut config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let device_name = config
        .common
        .tun_device
        .get_or_insert_with(|| device::DEFAULT_DEVICE_NAME.to_string())
        .clone();

    let server_config = config.server_config()?.clone();
    let net = server_config.tunnel_net()?;

    info!("Starting cvpn server...");
    let server = Server::bind(&config, buffer_pool(&config))
        .await
        .context("Failed to start server")?;

    let tun = device::create(&device_name, config.common.mtu, Some((net.addr(), net.netmask())))?;
    let hook = Arc::new(ScriptHook::new(server_config.on_up, server_config.on_down));

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let mut task = tokio::spawn(async move { server.run(tun, hook, token).await });

    tokio::select! {
        result = &mut task => {
            return result.context("Server task panicked")?.context("Server failed");
        }
        signal = wait_for_shutdown() => signal?,
    }

    info!("Shutting down server...");
    shutdown.cancel();
    finish(task).await
}

async fn run_client(mut config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let device_name = config
        .common
        .tun_device
        .get_or_insert_with(|| device::DEFAULT_DEVICE_NAME.to_string())
        .clone();

    let client_config = config.client_config()?.clone();
    if client_config.on_up.is_none() {
        warn!("No on_up script configured; {} will carry no address", device_name);
    }

    info!("Starting cvpn client for {}...", client_config.server);
    let client = Client::new(&config, buffer_pool(&config)).context("Failed to create client")?;

    let tun = device::create(&device_name, config.common.mtu, None)?;
    let hook = Arc::new(ScriptHook::new(client_config.on_up, client_config.on_down));

    let mut states = client.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow();
            info!("Tunnel {}", state);
        }
    });

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let mut task = tokio::spawn(async move { client.run(tun, hook, token).await });

    tokio::select! {
        result = &mut task => {
            return result.context("Client task panicked")?.context("Client failed");
        }
        signal = wait_for_shutdown() => signal?,
    }

    info!("Shutting down client...");
    shutdown.cancel();
    finish(task).await
}

/// Wait for the engine to wind down after a shutdown request
async fn finish(task: tokio::task::JoinHandle<cvpn_engine::Result<()>>) -> Result<()> {
    match tokio::time::timeout(Duration::from_secs(5), task).await {
        Ok(joined) => joined.context("Engine task panicked")?.context("Engine failed"),
        Err(_) => {
            warn!("Engine did not stop within 5s");
            Ok(())
        }
    }
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the configuration file and set your shared secret before running.");

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_server_flags() {
        let cli = Cli::try_parse_from([
            "cvpn",
            "-l",
            "debug",
            "server",
            "--listen",
            "0.0.0.0:9000",
            "--cidr",
            "10.1.0.1/16",
            "--secret",
            "milk",
            "--port-base",
            "50000",
        ])
        .unwrap();

        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Server {
                listen,
                cidr,
                secret,
                port_base,
            } => {
                assert_eq!(listen, Some("0.0.0.0:9000".parse().unwrap()));
                assert_eq!(cidr.as_deref(), Some("10.1.0.1/16"));
                assert_eq!(secret.as_deref(), Some("milk"));
                assert_eq!(port_base, Some(50000));
            }
            _ => panic!("expected server command"),
        }
    }

    #[test]
    fn test_client_flags_default_config_path() {
        let cli = Cli::try_parse_from(["cvpn", "client", "--server", "vpn:9222"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("cvpn.toml"));
        assert!(matches!(cli.command, Commands::Client { server: Some(_), secret: None }));
    }

    #[test]
    fn test_missing_config_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/cvpn.toml")).unwrap();
        assert!(config.common.secret.is_empty());
        assert!(config.server.is_none());
    }
}
