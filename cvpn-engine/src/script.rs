//! Interface configuration hooks
//!
//! The engine never configures the OS interface itself. Once an address is
//! known it calls an [`InterfaceHook`]; the stock implementation runs
//! user-supplied shell scripts.

use std::net::Ipv4Addr;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Parameters passed to interface hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookParams {
    /// Local tunnel address
    pub address: Ipv4Addr,
    /// Network prefix length
    pub prefix_len: u8,
    /// TUN device name (may be empty when unknown)
    pub device: String,
    /// Peer address (the server's public address on the client side; the tunnel address itself on the server side)
    pub peer: Ipv4Addr,
    /// Port leased alongside the address (0 on the server side)
    pub port: u16,
}

impl HookParams {
    /// Create new hook parameters
    pub fn new(address: Ipv4Addr, prefix_len: u8, device: impl Into<String>) -> Self {
        Self {
            address,
            prefix_len,
            device: device.into(),
            peer: address,
            port: 0,
        }
    }

    pub fn with_peer(mut self, peer: Ipv4Addr) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn args(&self) -> [String; 5] {
        [
            self.address.to_string(),
            self.prefix_len.to_string(),
            self.device.clone(),
            self.peer.to_string(),
            self.port.to_string(),
        ]
    }
}

/// Configures the local interface when a tunnel comes up or goes down
#[async_trait]
pub trait InterfaceHook: Send + Sync {
    /// Called once the local address is known
    async fn up(&self, params: &HookParams) -> Result<()>;

    /// Called on teardown; failures are logged by the caller, never fatal
    async fn down(&self, params: &HookParams) -> Result<()>;
}

/// Hook that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

#[async_trait]
impl InterfaceHook for NoopHook {
    async fn up(&self, _params: &HookParams) -> Result<()> {
        Ok(())
    }

    async fn down(&self, _params: &HookParams) -> Result<()> {
        Ok(())
    }
}

/// Hook running optional shell scripts
#[derive(Debug, Clone, Default)]
pub struct ScriptHook {
    on_up: Option<String>,
    on_down: Option<String>,
}

impl ScriptHook {
    pub fn new(on_up: Option<String>, on_down: Option<String>) -> Self {
        Self { on_up, on_down }
    }
}

#[async_trait]
impl InterfaceHook for ScriptHook {
    async fn up(&self, params: &HookParams) -> Result<()> {
        if let Some(ref script) = self.on_up {
            log::info!("Running on_up script");
            run_script(script, params).await?;
            log::info!("on_up script completed successfully");
        }
        Ok(())
    }

    async fn down(&self, params: &HookParams) -> Result<()> {
        if let Some(ref script) = self.on_down {
            log::info!("Running on_down script");
            run_script(script, params).await?;
            log::info!("on_down script completed successfully");
        }
        Ok(())
    }
}

/// Run a hook script with the given parameters
///
/// The script receives arguments in the following order:
/// 1. Local tunnel address
/// 2. Prefix length
/// 3. TUN device name
/// 4. Peer address
/// 5. Leased port
///
/// Returns `Ok(())` if the script exits with code 0, otherwise an error.
pub async fn run_script(script: &str, params: &HookParams) -> Result<()> {
    let args = params.args();
    log::info!("Running script: {} {}", script, args.join(" "));

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(format!(
            "{} {} {} '{}' {} {}",
            script, args[0], args[1], args[2], args[3], args[4]
        ))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Script(format!("failed to execute script: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        log::error!(
            "Script failed with exit code {}: stderr={}",
            exit_code,
            stderr.trim()
        );

        return Err(Error::Script(format!(
            "script exited with code {}: {}",
            exit_code,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.is_empty() {
        log::debug!("Script output: {}", stdout.trim());
    }

    Ok(())
}
