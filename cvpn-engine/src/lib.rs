//! cvpn Engine
//!
//! Server router and client pump for the cvpn tunnel, driven by any
//! `AsyncRead + AsyncWrite` stream standing in for the local interface.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │  cvpn-cli: flags, logging, TUN device, signals      │    │
//! │  └──────────────────────────┬──────────────────────────┘    │
//! │                             ▼                               │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                   cvpn-engine                       │    │
//! │  │  - Server (accept, admit, Router, Registry)         │    │
//! │  │  - Client (dial, handshake, retry)                  │    │
//! │  │  - Duplex (supervised read/write pumps)             │    │
//! │  │  - Config (TOML), InterfaceHook (scripts)           │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Library Layer                            │
//! │  ┌───────────────────────────────────────────────────┐      │
//! │  │  cvpn-protocol                                    │      │
//! │  │  - Cipher, handshake, encrypted frames            │      │
//! │  │  - BufferPool, IpPool / PortPool, reassembly      │      │
//! │  └───────────────────────────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod duplex;
pub mod error;
pub mod registry;
pub mod router;
pub mod script;
pub mod server;
pub mod stats;

pub use client::Client;
pub use config::{ClientConfig, CommonConfig, Config, ServerConfig};
pub use duplex::{Duplex, DuplexHandle, DuplexOptions, DuplexState, Pumps};
pub use error::{Error, Result};
pub use registry::{Delivery, Registry, SessionHandle};
pub use router::{route, Route, Router};
pub use script::{HookParams, InterfaceHook, NoopHook, ScriptHook};
pub use server::{Lease, Leases, Server};
pub use stats::{ServerStats, TrafficCounters, TrafficStats, TunnelState};
