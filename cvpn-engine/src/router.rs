//! Packet routing between clients and the local interface
//!
//! ```text
//!   interface ──► from_interface ──► registered client? ──► client queue
//!                                         └── no ──► drop
//!
//!   client ──► from_client ──► dst == server ──► interface
//!                              dst live client ──► client queue
//!                              anything else ──► interface
//! ```
//!
//! Client queues are fed with `try_send`: a stuck client loses its own
//! packets instead of stalling the router.

use std::net::Ipv4Addr;
use std::sync::Arc;

use cvpn_protocol::{ipv4_destination, ipv4_source, PooledBuffer};
use ipnet::Ipv4Net;
use tokio::sync::mpsc;

use crate::registry::{Delivery, Registry};
use crate::stats::TrafficCounters;

/// Where a packet goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Local interface
    Interface,
    /// Client holding this address
    Client(Ipv4Addr),
    /// Nowhere
    Drop,
}

/// Routing decision for a packet received from a client
pub fn route(dst: Ipv4Addr, server_ip: Ipv4Addr, network: Ipv4Net, registry: &Registry) -> Route {
    if dst == server_ip {
        return Route::Interface;
    }
    if network.contains(&dst) && registry.contains(dst) {
        return Route::Client(dst);
    }
    Route::Interface
}

/// Routing decision for a packet read from the local interface
pub fn route_inbound(dst: Ipv4Addr, registry: &Registry) -> Route {
    if registry.contains(dst) {
        Route::Client(dst)
    } else {
        Route::Drop
    }
}

/// Forwards packets according to [`route`] and [`route_inbound`]
pub struct Router {
    registry: Arc<Registry>,
    server_ip: Ipv4Addr,
    network: Ipv4Net,
    interface: mpsc::Sender<PooledBuffer>,
    counters: Arc<TrafficCounters>,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        network: Ipv4Net,
        interface: mpsc::Sender<PooledBuffer>,
        counters: Arc<TrafficCounters>,
    ) -> Self {
        Self {
            registry,
            server_ip: network.addr(),
            network,
            interface,
            counters,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    /// Forward a complete packet read from the local interface
    pub fn from_interface(&self, packet: PooledBuffer) -> Route {
        let Some(dst) = ipv4_destination(&packet) else {
            log::debug!("Dropping non-IPv4 packet from interface");
            self.counters.record_drop();
            return Route::Drop;
        };

        match route_inbound(dst, &self.registry) {
            Route::Client(ip) => self.to_client(ip, packet),
            _ => {
                let src = ipv4_source(&packet).unwrap_or(Ipv4Addr::UNSPECIFIED);
                log::debug!("No client for {}, dropping packet from {}", dst, src);
                self.counters.record_drop();
                Route::Drop
            }
        }
    }

    /// Forward a packet received from the client leased `from`
    pub async fn from_client(&self, from: Ipv4Addr, packet: PooledBuffer) -> Route {
        self.counters.record_rx(packet.len());

        let Some(dst) = ipv4_destination(&packet) else {
            log::debug!("Dropping non-IPv4 packet from {}", from);
            self.counters.record_drop();
            return Route::Drop;
        };

        match route(dst, self.server_ip, self.network, &self.registry) {
            Route::Client(ip) => self.to_client(ip, packet),
            _ => self.to_interface(packet).await,
        }
    }

    fn to_client(&self, ip: Ipv4Addr, packet: PooledBuffer) -> Route {
        let Some(session) = self.registry.get(ip) else {
            log::debug!("Client {} went away, dropping packet", ip);
            self.counters.record_drop();
            return Route::Drop;
        };

        let len = packet.len();
        match session.try_send(packet) {
            Delivery::Queued => {
                self.counters.record_tx(len);
                Route::Client(ip)
            }
            Delivery::Full => {
                log::debug!("Queue for {} full, dropping packet", ip);
                self.counters.record_drop();
                Route::Drop
            }
            Delivery::Closed => {
                log::debug!("Client {} closing, dropping packet", ip);
                self.counters.record_drop();
                Route::Drop
            }
        }
    }

    async fn to_interface(&self, packet: PooledBuffer) -> Route {
        if self.interface.send(packet).await.is_err() {
            log::warn!("Interface writer stopped, dropping packet");
            self.counters.record_drop();
            return Route::Drop;
        }
        Route::Interface
    }
}
