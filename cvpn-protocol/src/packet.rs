//! IPv4 header helpers and packet reassembly
//!
//! The dataplane only ever looks at three IPv4 header fields:
//!
//! ```text
//!  0      4      8             16                             32
//! +------+------+--------------+------------------------------+
//! |Ver=4 | IHL  |   DSCP/ECN   |        Total Length          |  bytes 2..4
//! +------+------+--------------+------------------------------+
//! |            ...             |            ...               |
//! +----------------------------+------------------------------+
//! |                      Source Address                       |  bytes 12..16
//! +-----------------------------------------------------------+
//! |                   Destination Address                     |  bytes 16..20
//! +-----------------------------------------------------------+
//! ```
//!
//! Readers may hand over packets in arbitrary pieces. [`PacketAssembler`]
//! accumulates bytes until a full header is present, reads the declared
//! total length and keeps accumulating until the packet is complete.

use std::net::Ipv4Addr;

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::{Error, Result};

/// Length of an IPv4 header without options
pub const IPV4_HEADER_LEN: usize = 20;

/// Check whether `packet` starts with an IPv4 version nibble
pub fn is_ipv4(packet: &[u8]) -> bool {
    packet.first().is_some_and(|b| b >> 4 == 4)
}

/// Declared total length (header bytes 2..4, big-endian)
pub fn ipv4_total_length(packet: &[u8]) -> Option<usize> {
    if packet.len() < IPV4_HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([packet[2], packet[3]]) as usize)
}

/// Source address (header bytes 12..16)
pub fn ipv4_source(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_HEADER_LEN {
        return None;
    }
    Some(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]))
}

/// Destination address (header bytes 16..20)
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_HEADER_LEN {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

/// Reassembles IPv4 packets from an arbitrarily chunked byte stream
pub struct PacketAssembler {
    pool: BufferPool,
    pending: PooledBuffer,
    /// Declared length of the packet being assembled, once the header is in
    expected: Option<usize>,
}

impl PacketAssembler {
    /// Create an assembler drawing its buffers from `pool`
    pub fn new(pool: BufferPool) -> Self {
        let pending = pool.get();
        Self {
            pool,
            pending,
            expected: None,
        }
    }

    /// Number of bytes held for an incomplete packet
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partially assembled packet
    pub fn reset(&mut self) {
        self.pending.clear();
        self.expected = None;
    }

    /// Feed one chunk, pushing every packet it completes onto `out`
    ///
    /// A chunk may complete several packets and may leave the start of the
    /// next one pending. On a malformed header the pending bytes and the
    /// rest of the chunk are discarded and [`Error::InvalidPacket`] is
    /// returned; packets completed earlier in the chunk are still in `out`.
    pub fn push(&mut self, mut chunk: &[u8], out: &mut Vec<PooledBuffer>) -> Result<()> {
        while !chunk.is_empty() {
            let target = self.expected.unwrap_or(IPV4_HEADER_LEN);
            let take = (target - self.pending.len()).min(chunk.len());
            self.pending.extend_from_slice(&chunk[..take])?;
            chunk = &chunk[take..];

            if self.expected.is_none() && self.pending.len() == IPV4_HEADER_LEN {
                match self.check_header() {
                    Ok(total) => self.expected = Some(total),
                    Err(e) => {
                        self.reset();
                        return Err(e);
                    }
                }
            }

            if self.expected == Some(self.pending.len()) {
                let packet = std::mem::replace(&mut self.pending, self.pool.get());
                self.expected = None;
                out.push(packet);
            }
        }
        Ok(())
    }

    fn check_header(&self) -> Result<usize> {
        if !is_ipv4(&self.pending) {
            return Err(Error::InvalidPacket(format!(
                "not an IPv4 header (version {})",
                self.pending[0] >> 4
            )));
        }
        let total = ipv4_total_length(&self.pending).unwrap_or(0);
        if total < IPV4_HEADER_LEN || total > self.pending.capacity() {
            return Err(Error::InvalidPacket(format!(
                "declared total length {} out of range",
                total
            )));
        }
        Ok(total)
    }
}

impl std::fmt::Debug for PacketAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketAssembler")
            .field("pending", &self.pending.len())
            .field("expected", &self.expected)
            .finish()
    }
}

/// Builder for IPv4 packets
///
/// ```rust
/// use cvpn_protocol::Ipv4PacketBuilder;
///
/// let packet = Ipv4PacketBuilder::new()
///     .src_v4(10, 0, 200, 2)
///     .dst_v4(10, 0, 200, 3)
///     .with_udp(5000, 53, b"query")
///     .build();
/// assert_eq!(packet.len(), 20 + 8 + 5);
/// ```
#[derive(Debug, Clone)]
pub struct Ipv4PacketBuilder {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    ttl: u8,
    payload: Vec<u8>,
}

impl Default for Ipv4PacketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Ipv4PacketBuilder {
    /// Create a builder for an empty ICMP packet between two tunnel addresses
    pub fn new() -> Self {
        Self {
            src: Ipv4Addr::new(10, 0, 200, 2),
            dst: Ipv4Addr::new(10, 0, 200, 1),
            protocol: 1,
            ttl: 64,
            payload: Vec::new(),
        }
    }

    /// Set the source address
    pub fn src(mut self, addr: Ipv4Addr) -> Self {
        self.src = addr;
        self
    }

    /// Set the source address from octets
    pub fn src_v4(self, a: u8, b: u8, c: u8, d: u8) -> Self {
        self.src(Ipv4Addr::new(a, b, c, d))
    }

    /// Set the destination address
    pub fn dst(mut self, addr: Ipv4Addr) -> Self {
        self.dst = addr;
        self
    }

    /// Set the destination address from octets
    pub fn dst_v4(self, a: u8, b: u8, c: u8, d: u8) -> Self {
        self.dst(Ipv4Addr::new(a, b, c, d))
    }

    /// Set the TTL
    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the protocol number (1=ICMP, 6=TCP, 17=UDP)
    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    /// Set the raw payload
    pub fn payload(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.payload = data.into();
        self
    }

    /// Pad the payload so the whole packet is `total` bytes long
    pub fn total_len(mut self, total: usize) -> Self {
        let payload_len = total.saturating_sub(IPV4_HEADER_LEN);
        self.payload.resize(payload_len, 0xAB);
        self
    }

    /// Add a UDP header (checksum zero) followed by `data`
    pub fn with_udp(self, src_port: u16, dst_port: u16, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(8 + data.len());
        payload.extend_from_slice(&src_port.to_be_bytes());
        payload.extend_from_slice(&dst_port.to_be_bytes());
        let udp_len = u16::try_from(8 + data.len()).unwrap_or(u16::MAX);
        payload.extend_from_slice(&udp_len.to_be_bytes());
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(data);
        self.protocol(17).payload(payload)
    }

    /// Build the packet with a valid header checksum
    ///
    /// Payload beyond the largest IPv4 packet (65535 bytes) is cut off.
    pub fn build(mut self) -> Vec<u8> {
        self.payload.truncate(usize::from(u16::MAX) - IPV4_HEADER_LEN);
        let total = IPV4_HEADER_LEN + self.payload.len();
        let total_len = u16::try_from(total).unwrap_or(u16::MAX);
        let mut packet = Vec::with_capacity(total);

        packet.push(0x45);
        packet.push(0x00);
        packet.extend_from_slice(&total_len.to_be_bytes());
        packet.extend_from_slice(&[0x00, 0x00]);
        packet.extend_from_slice(&[0x40, 0x00]);
        packet.push(self.ttl);
        packet.push(self.protocol);
        packet.extend_from_slice(&[0x00, 0x00]);
        packet.extend_from_slice(&self.src.octets());
        packet.extend_from_slice(&self.dst.octets());

        let checksum = header_checksum(&packet);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());

        packet.extend_from_slice(&self.payload);
        packet
    }
}

fn header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)])))
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
