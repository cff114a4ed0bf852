//! cvpn protocol implementation
//!
//! Wire protocol for an encrypted IPv4 tunnel over TCP: AES-256-CFB cipher
//! engine, session handshake, encrypted framing, IPv4 reassembly, and the
//! address/port leasing pools the server hands out to clients.
//!
//! # Session Lifecycle
//!
//! ```text
//! client                                         server
//!   |  [IV][enc(sha256(secret) | session key)]     |
//!   | -------------------------------------------> |  verify, lease ip/port
//!   |  [IV][enc(status | ip | mask | port)]        |
//!   | <------------------------------------------- |
//!   |                                              |
//!   |  [IV][enc(len)][enc(ip packet)]  (session key)
//!   | <------------------------------------------> |
//! ```
//!
//! # Memory Pool
//!
//! Packets travel in [`PooledBuffer`]s borrowed from an explicitly
//! constructed [`BufferPool`]:
//!
//! ```rust
//! use cvpn_protocol::{BufferPool, PacketAssembler, Ipv4PacketBuilder};
//!
//! let pool = BufferPool::new(16, 65536);
//! let mut assembler = PacketAssembler::new(pool.clone());
//!
//! let packet = Ipv4PacketBuilder::new().total_len(1500).build();
//! let mut out = Vec::new();
//! assembler.push(&packet[..700], &mut out).unwrap();
//! assembler.push(&packet[700..], &mut out).unwrap();
//! assert_eq!(out.len(), 1);
//! ```

mod buffer_pool;
mod crypto;
mod error;
pub mod frame;
pub mod handshake;
mod packet;
mod pool;

pub use buffer_pool::{BufferPool, PooledBuffer, DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_BUFFERS};
pub use crypto::{
    derive_key, new_iv, new_session_key, Cipher, FrameDecryptor, FrameEncryptor, IV_SIZE, KEY_SIZE,
};
pub use error::{Error, Result};
pub use frame::{
    CipherFrameReader, CipherFrameWriter, FrameReader, FrameWriter, RawFrameReader, RawFrameWriter,
};
pub use handshake::{client_handshake, Request, Response, Session, Status};
pub use packet::{
    ipv4_destination, ipv4_source, ipv4_total_length, is_ipv4, Ipv4PacketBuilder, PacketAssembler,
    IPV4_HEADER_LEN,
};
pub use pool::{IpPool, PortPool, ResourcePool};

/// Default tunnel MTU
pub const DEFAULT_MTU: usize = 1400;

/// Default TCP port the server listens on
pub const DEFAULT_PORT: u16 = 9222;
