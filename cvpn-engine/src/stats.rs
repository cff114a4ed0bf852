//! Tunnel state and traffic statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Client tunnel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Not running
    Disconnected,
    /// Dialing the server
    Connecting,
    /// Exchanging the session handshake
    Handshaking,
    /// Pumping packets
    Connected,
    /// Waiting to dial again after a connection loss
    Reconnecting,
    /// Stopped on a fatal error
    Error,
}

impl TunnelState {
    /// Check if the tunnel is in an active state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TunnelState::Connecting
                | TunnelState::Handshaking
                | TunnelState::Connected
                | TunnelState::Reconnecting
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected)
    }

    pub fn description(&self) -> &'static str {
        match self {
            TunnelState::Disconnected => "Disconnected",
            TunnelState::Connecting => "Connecting...",
            TunnelState::Handshaking => "Handshaking...",
            TunnelState::Connected => "Connected",
            TunnelState::Reconnecting => "Reconnecting...",
            TunnelState::Error => "Error",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Counters shared by the tasks moving packets
///
/// `rx` counts packets arriving from the tunnel, `tx` packets sent into it.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    packets_rx: AtomicU64,
    bytes_rx: AtomicU64,
    packets_tx: AtomicU64,
    bytes_tx: AtomicU64,
    dropped: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rx(&self, bytes: usize) {
        self.packets_rx.fetch_add(1, Ordering::Relaxed);
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.packets_tx.fetch_add(1, Ordering::Relaxed);
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficStats {
        TrafficStats {
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`TrafficCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub packets_rx: u64,
    pub bytes_rx: u64,
    pub packets_tx: u64,
    pub bytes_tx: u64,
    /// Packets discarded by routing or full queues
    pub dropped: u64,
}

impl TrafficStats {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_rx + self.bytes_tx
    }
}

/// Server status snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Registered client sessions
    pub clients: usize,
    /// Unleased tunnel addresses
    pub ips_available: usize,
    /// Unleased ports
    pub ports_available: usize,
    pub traffic: TrafficStats,
}
