//! TUN device creation

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use tun::AsyncDevice;

/// Default interface name when the config leaves it unset
pub const DEFAULT_DEVICE_NAME: &str = "cvpn0";

/// Open a TUN device and bring it up
///
/// `address` assigns the interface address directly; the client passes
/// `None` and leaves addressing to its `on_up` script, since its address is
/// only known after the handshake.
pub fn create(name: &str, mtu: u16, address: Option<(Ipv4Addr, Ipv4Addr)>) -> Result<AsyncDevice> {
    let mut config = tun::configure();
    config.name(name).mtu(i32::from(mtu)).up();

    if let Some((ip, netmask)) = address {
        config.address(ip).netmask(netmask);
    }

    #[cfg(target_os = "linux")]
    config.platform(|platform| {
        platform.packet_information(false);
    });

    let device = tun::create_as_async(&config)
        .with_context(|| format!("Failed to create TUN device {}", name))?;

    match address {
        Some((ip, netmask)) => tracing::info!("Created TUN device {} ({}/{})", name, ip, netmask),
        None => tracing::info!("Created TUN device {}", name),
    }
    Ok(device)
}
