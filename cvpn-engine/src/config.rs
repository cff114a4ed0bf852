//! Configuration types for the tunnel engine

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
///
/// The configuration file uses TOML format and contains sections
/// for both server and client modes. Only the relevant section
/// is used based on the mode the application is running in.
///
/// # Example Configuration
///
/// ```toml
/// [common]
/// secret = "milk"
/// mtu = 1400
///
/// [server]
/// listen = "0.0.0.0:9222"
/// tunnel_cidr = "10.0.200.1/24"
/// port_base = 40000
///
/// [client]
/// server = "vpn.example.com:9222"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Common settings shared between server and client
    #[serde(default)]
    pub common: CommonConfig,

    /// Server-specific configuration
    pub server: Option<ServerConfig>,

    /// Client-specific configuration
    pub client: Option<ClientConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating, for callers that patch values in afterwards
    pub fn from_toml_unchecked(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.common.secret.is_empty() {
            return Err(Error::Config("secret is required".into()));
        }

        if self.common.mtu < 576 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 576)",
                self.common.mtu
            )));
        }

        if self.common.queue_depth == 0 {
            return Err(Error::Config("queue_depth must be at least 1".into()));
        }

        if let Some(ref server) = self.server {
            server.validate()?;
        }

        if let Some(ref client) = self.client {
            client.validate()?;
        }

        Ok(())
    }

    /// Get the server configuration, or error if not present
    pub fn server_config(&self) -> Result<&ServerConfig> {
        self.server
            .as_ref()
            .ok_or_else(|| Error::Config("server configuration is required".into()))
    }

    /// Get the client configuration, or error if not present
    pub fn client_config(&self) -> Result<&ClientConfig> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Config("client configuration is required".into()))
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# cvpn Configuration

# Shared settings used by both server and client
[common]
# Shared secret (required). Used both to authenticate clients and to
# encrypt the handshake.
secret = "your-secret-here"

# MTU for the tunnel interface (default: 1400)
mtu = 1400

# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

# Depth of the per-connection packet queues (default: 64)
queue_depth = 64

# Idle packet buffers kept for reuse (default: 64)
buffer_pool_size = 64

# TUN device name (optional, the OS picks one if not set)
# tun_device = "cvpn0"

# Server configuration (used when running as server)
[server]
# Address and port to accept client connections on
listen = "0.0.0.0:9222"

# Server tunnel address in CIDR notation. Clients are leased the other
# host addresses of this subnet.
tunnel_cidr = "10.0.200.1/24"

# Port pool base. Each client is also leased port base + host offset,
# reported to it in the handshake.
port_base = 40000

# Size of the port pool (0 = one port per host address). The range above
# port_base must end at or below 65535.
port_pool_size = 0

# When the address pool is exhausted, disconnect the least recently active
# client to make room for a new one (default: true)
evict_lru = true

# Seconds to wait for an evicted client to release its address
evict_timeout = 5

# Seconds a client has to complete the handshake
handshake_timeout = 10

# Disconnect clients silent for this many seconds (0 = never)
idle_timeout = 0

# Scripts run when the tunnel interface comes up / goes down.
# Arguments: <address> <prefix_len> <device> <peer> <port>
# on_up = "/etc/cvpn/if-up.sh"
# on_down = "/etc/cvpn/if-down.sh"

# Client configuration (used when running as client)
[client]
# Server address as host:port (required)
server = "vpn.example.com:9222"

# Seconds to wait before reconnecting after a transport failure
retry_delay = 5

# Maximum reconnect attempts (0 = unlimited)
max_retries = 0

# Seconds to wait for the handshake to complete
handshake_timeout = 10

# Reconnect when the server has been silent for this many seconds (0 = never)
idle_timeout = 0

# Scripts run with the leased address once connected / on teardown.
# Arguments: <address> <prefix_len> <device> <peer> <port>
# on_up = "/etc/cvpn/if-up.sh"
# on_down = "/etc/cvpn/if-down.sh"
"#
        .to_string()
    }
}

/// Common configuration shared between server and client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Shared secret
    #[serde(default)]
    pub secret: String,

    /// MTU for the tunnel interface
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Depth of the bounded packet queues
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Idle buffers kept by the buffer pool
    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,

    /// TUN device name
    #[serde(default)]
    pub tun_device: Option<String>,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            mtu: default_mtu(),
            log_level: default_log_level(),
            queue_depth: default_queue_depth(),
            buffer_pool_size: default_buffer_pool_size(),
            tun_device: None,
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to accept client connections on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Server tunnel address with prefix (e.g., "10.0.200.1/24")
    #[serde(default = "default_tunnel_cidr")]
    pub tunnel_cidr: String,

    /// Port pool base
    #[serde(default = "default_port_base")]
    pub port_base: u16,

    /// Port pool size (0 = one port per host offset)
    #[serde(default)]
    pub port_pool_size: u16,

    /// Evict the least recently active client when the address pool is empty
    #[serde(default = "default_true")]
    pub evict_lru: bool,

    /// Seconds to wait for an evicted session to release its lease
    #[serde(default = "default_evict_timeout")]
    pub evict_timeout: u64,

    /// Seconds allowed for the handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Seconds of silence before a client is disconnected (0 = never)
    #[serde(default)]
    pub idle_timeout: u64,

    /// Script run when the interface comes up
    #[serde(default)]
    pub on_up: Option<String>,

    /// Script run when the interface goes down
    #[serde(default)]
    pub on_down: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tunnel_cidr: default_tunnel_cidr(),
            port_base: default_port_base(),
            port_pool_size: 0,
            evict_lru: true,
            evict_timeout: default_evict_timeout(),
            handshake_timeout: default_handshake_timeout(),
            idle_timeout: 0,
            on_up: None,
            on_down: None,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Result<()> {
        let net = self.tunnel_net()?;
        if net.addr() == net.network() || net.addr() == net.broadcast() {
            return Err(Error::Config(format!(
                "tunnel_cidr {} must name a host address, not the network or broadcast",
                self.tunnel_cidr
            )));
        }
        if self.handshake_timeout == 0 {
            return Err(Error::Config("handshake_timeout must be positive".into()));
        }
        self.port_count()?;
        Ok(())
    }

    /// Number of ports leased above `port_base`
    ///
    /// `port_pool_size = 0` means one port per host offset of the tunnel
    /// subnet. The range must fit in the port space.
    pub fn port_count(&self) -> Result<u16> {
        let count = if self.port_pool_size == 0 {
            let host_bits = 32 - u32::from(self.tunnel_net()?.prefix_len());
            (1u64 << host_bits).saturating_sub(2)
        } else {
            u64::from(self.port_pool_size)
        };

        if u64::from(self.port_base) + count > u64::from(u16::MAX) {
            return Err(Error::Config(format!(
                "{} ports above port_base {} overflow the port space",
                count, self.port_base
            )));
        }
        // Bounded by u16::MAX above
        Ok(count as u16)
    }

    /// Parse the tunnel subnet
    pub fn tunnel_net(&self) -> Result<Ipv4Net> {
        self.tunnel_cidr
            .parse()
            .map_err(|_| Error::Config(format!("invalid tunnel_cidr: {}", self.tunnel_cidr)))
    }

    pub fn evict_timeout(&self) -> Duration {
        Duration::from_secs(self.evict_timeout)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Idle timeout, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address as host:port
    #[serde(default)]
    pub server: String,

    /// Seconds between reconnect attempts
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    /// Maximum reconnect attempts (0 = unlimited)
    #[serde(default)]
    pub max_retries: u32,

    /// Seconds allowed for the handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Seconds of server silence before reconnecting (0 = never)
    #[serde(default)]
    pub idle_timeout: u64,

    /// Script run once the session is established
    #[serde(default)]
    pub on_up: Option<String>,

    /// Script run on teardown
    #[serde(default)]
    pub on_down: Option<String>,
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::Config("client.server is required".into()));
        }
        match self.server.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => {
                return Err(Error::Config(format!(
                    "client.server must be host:port, got {}",
                    self.server
                )))
            }
        }
        if self.handshake_timeout == 0 {
            return Err(Error::Config("handshake_timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Idle timeout, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }
}

fn default_mtu() -> u16 {
    cvpn_protocol::DEFAULT_MTU as u16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_depth() -> usize {
    64
}

fn default_buffer_pool_size() -> usize {
    cvpn_protocol::DEFAULT_MAX_BUFFERS
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], cvpn_protocol::DEFAULT_PORT))
}

fn default_tunnel_cidr() -> String {
    "10.0.200.1/24".to_string()
}

fn default_port_base() -> u16 {
    40000
}

fn default_true() -> bool {
    true
}

fn default_evict_timeout() -> u64 {
    5
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_retry_delay() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_config() {
        let toml = r#"
[common]
secret = "milk"

[server]
listen = "127.0.0.1:9333"
tunnel_cidr = "10.1.0.1/16"
port_base = 30000
port_pool_size = 1024
evict_lru = false
idle_timeout = 120
"#;

        let config = Config::from_toml(toml).unwrap();
        let server = config.server_config().unwrap();
        assert_eq!(server.listen, "127.0.0.1:9333".parse().unwrap());
        assert_eq!(server.tunnel_net().unwrap().prefix_len(), 16);
        assert_eq!(server.port_base, 30000);
        assert!(!server.evict_lru);
        assert_eq!(server.idle_timeout(), Some(Duration::from_secs(120)));
        assert!(config.client_config().is_err());
    }

    #[test]
    fn test_server_defaults() {
        let toml = r#"
[common]
secret = "milk"

[server]
"#;

        let config = Config::from_toml(toml).unwrap();
        let server = config.server.unwrap();
        assert_eq!(server.listen, SocketAddr::from(([0, 0, 0, 0], 9222)));
        assert_eq!(server.tunnel_cidr, "10.0.200.1/24");
        assert!(server.evict_lru);
        assert_eq!(server.idle_timeout(), None);
        assert_eq!(config.common.mtu, 1400);
        assert_eq!(config.common.queue_depth, 64);
    }

    #[test]
    fn test_parse_client_config() {
        let toml = r#"
[common]
secret = "milk"

[client]
server = "vpn.example.com:9222"
retry_delay = 2
on_up = "/etc/cvpn/up.sh"
"#;

        let config = Config::from_toml(toml).unwrap();
        let client = config.client_config().unwrap();
        assert_eq!(client.server, "vpn.example.com:9222");
        assert_eq!(client.retry_delay(), Duration::from_secs(2));
        assert_eq!(client.max_retries, 0);
        assert_eq!(client.on_up.as_deref(), Some("/etc/cvpn/up.sh"));
    }

    #[test]
    fn test_missing_secret_fails() {
        let toml = r#"
[server]
listen = "0.0.0.0:9222"
"#;

        assert!(matches!(Config::from_toml(toml), Err(Error::Config(_))));
    }

    #[test]
    fn test_client_server_needs_port() {
        let toml = r#"
[common]
secret = "milk"

[client]
server = "vpn.example.com"
"#;

        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_tunnel_cidr_must_be_host() {
        let toml = r#"
[common]
secret = "milk"

[server]
tunnel_cidr = "10.0.200.0/24"
"#;

        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_port_count_follows_subnet() {
        let config = Config::from_toml("[common]\nsecret = \"milk\"\n[server]\n").unwrap();
        assert_eq!(config.server_config().unwrap().port_count().unwrap(), 254);

        let toml = r#"
[common]
secret = "milk"

[server]
tunnel_cidr = "10.0.200.1/28"
port_pool_size = 100
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server_config().unwrap().port_count().unwrap(), 100);
    }

    #[test]
    fn test_port_range_must_fit_port_space() {
        for port_base in [65535, 65500] {
            let toml = format!(
                "[common]\nsecret = \"milk\"\n[server]\ntunnel_cidr = \"10.0.200.1/24\"\nport_base = {}\n",
                port_base
            );
            assert!(matches!(Config::from_toml(&toml), Err(Error::Config(_))));
        }

        let toml = r#"
[common]
secret = "milk"

[server]
port_base = 65000
port_pool_size = 600
"#;
        assert!(matches!(Config::from_toml(toml), Err(Error::Config(_))));

        // Exactly reaching 65535 is fine
        let toml = r#"
[common]
secret = "milk"

[server]
port_base = 65281
"#;
        assert_eq!(
            Config::from_toml(toml).unwrap().server_config().unwrap().port_count().unwrap(),
            254
        );
    }

    #[test]
    fn test_small_mtu_fails() {
        let toml = r#"
[common]
secret = "milk"
mtu = 100
"#;

        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_sample_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert!(config.server.is_some());
        assert!(config.client.is_some());
    }

    #[test]
    fn test_unchecked_parse_allows_patching() {
        let mut config = Config::from_toml_unchecked("[server]\n").unwrap();
        assert!(config.validate().is_err());
        config.common.secret = "milk".into();
        config.validate().unwrap();
    }
}
