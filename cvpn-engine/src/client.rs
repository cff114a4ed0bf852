//! Tunnel client
//!
//! Mirror of one server connection: dial, handshake, then pump packets
//! between the local interface and the encrypted stream until something
//! fails. Transport failures are retried after `retry_delay`; a rejected or
//! garbled handshake stops the client.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use cvpn_protocol::{
    client_handshake, BufferPool, Cipher, CipherFrameReader, CipherFrameWriter, PacketAssembler,
    RawFrameReader, RawFrameWriter, Session,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, Config};
use crate::duplex::{Duplex, DuplexHandle, DuplexOptions};
use crate::error::{Error, Result};
use crate::script::{HookParams, InterfaceHook};
use crate::stats::{TrafficCounters, TrafficStats, TunnelState};

/// Tunnel client for one server
pub struct Client {
    config: ClientConfig,
    secret: Vec<u8>,
    cipher: Cipher,
    pool: BufferPool,
    queue_depth: usize,
    device: String,
    state: watch::Sender<TunnelState>,
    counters: Arc<TrafficCounters>,
}

impl Client {
    pub fn new(config: &Config, pool: BufferPool) -> Result<Self> {
        let client = config.client_config()?.clone();
        let secret = config.common.secret.as_bytes().to_vec();
        let (state, _) = watch::channel(TunnelState::Disconnected);

        Ok(Self {
            cipher: Cipher::new(&secret),
            secret,
            config: client,
            pool,
            queue_depth: config.common.queue_depth,
            device: config.common.tun_device.clone().unwrap_or_default(),
            state,
            counters: Arc::new(TrafficCounters::new()),
        })
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> TrafficStats {
        self.counters.snapshot()
    }

    fn set_state(&self, new: TunnelState) {
        let old = self.state.send_replace(new);
        if old != new {
            log::debug!("Tunnel state: {} -> {}", old, new);
        }
    }

    /// Dial the server and run the handshake once
    pub async fn connect_once(&self) -> Result<(TcpStream, Session)> {
        self.set_state(TunnelState::Connecting);
        let mut stream = self.dial().await?;

        self.set_state(TunnelState::Handshaking);
        let handshake = client_handshake(&mut stream, &self.cipher, &self.secret);
        let session = tokio::time::timeout(self.config.handshake_timeout(), handshake)
            .await
            .map_err(|_| Error::Timeout(format!("handshake with {}", self.config.server)))??;

        log::info!(
            "Connected to {}: address {}/{}, port {}",
            self.config.server,
            session.ip,
            session.prefix_len(),
            session.port
        );
        Ok((stream, session))
    }

    async fn dial(&self) -> Result<TcpStream> {
        let addrs = tokio::net::lookup_host(&self.config.server)
            .await
            .map_err(|e| Error::Connection(format!("failed to resolve {}: {}", self.config.server, e)))?;

        let mut last_error = None;
        for addr in addrs {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(true)?;

            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => {
                    log::debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(Error::Connection(match last_error {
            Some(e) => format!("failed to connect to {}: {}", self.config.server, e),
            None => format!("{} resolved to no addresses", self.config.server),
        }))
    }

    /// Run until `shutdown` fires or a fatal error occurs
    ///
    /// `interface` carries raw IPv4 packets to and from the local network.
    pub async fn run<I>(
        &self,
        interface: I,
        hook: Arc<dyn InterfaceHook>,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (tun_r, tun_w) = tokio::io::split(interface);
        let mut iface = Duplex::new(
            RawFrameReader::new(tun_r),
            RawFrameWriter::new(tun_w),
            self.pool.clone(),
            DuplexOptions::new("interface").queue_depth(self.queue_depth),
        )
        .start(shutdown.child_token());

        let mut failures = 0u32;
        let result = loop {
            let err = match self.session(&mut iface, hook.as_ref(), &shutdown, &mut failures).await {
                Ok(()) => break Ok(()),
                Err(e) => e,
            };

            if !err.is_recoverable() {
                log::error!("Giving up: {}", err);
                break Err(err);
            }

            failures += 1;
            let max = self.config.max_retries;
            if max > 0 && failures > max {
                log::error!("Giving up after {} attempts: {}", max, err);
                break Err(err);
            }

            let delay = self.config.retry_delay();
            log::warn!("Connection lost: {}; retrying in {:?}", err, delay);
            self.set_state(TunnelState::Reconnecting);

            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        iface.close().await;
        self.set_state(if result.is_ok() {
            TunnelState::Disconnected
        } else {
            TunnelState::Error
        });
        result
    }

    /// One connection from dial to teardown; `Ok` only on shutdown
    async fn session(
        &self,
        iface: &mut DuplexHandle,
        hook: &dyn InterfaceHook,
        shutdown: &CancellationToken,
        failures: &mut u32,
    ) -> Result<()> {
        let (stream, session) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            connected = self.connect_once() => connected?,
        };
        *failures = 0;

        let peer = match stream.peer_addr()?.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let params = HookParams::new(session.ip, session.prefix_len(), self.device.clone())
            .with_peer(peer)
            .with_port(session.port);
        hook.up(&params).await?;
        self.set_state(TunnelState::Connected);

        let result = self.pump(stream, session, iface, shutdown).await;

        if let Err(e) = hook.down(&params).await {
            log::warn!("Interface down hook failed: {}", e);
        }
        result
    }

    async fn pump(
        &self,
        stream: TcpStream,
        session: Session,
        iface: &mut DuplexHandle,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let (r, w) = stream.into_split();
        let mut conn = Duplex::new(
            CipherFrameReader::new(r, session.cipher.copy()),
            CipherFrameWriter::new(w, session.cipher),
            self.pool.clone(),
            DuplexOptions::new(self.config.server.clone())
                .queue_depth(self.queue_depth)
                .idle_timeout(self.config.idle_timeout()),
        )
        .start(shutdown.child_token());

        let mut assembler = PacketAssembler::new(self.pool.clone());
        let mut packets = Vec::new();

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                Some(chunk) = iface.output.recv() => {
                    if let Err(e) = assembler.push(&chunk, &mut packets) {
                        log::debug!("Discarding malformed interface data: {}", e);
                    }
                    for packet in packets.drain(..) {
                        self.counters.record_tx(packet.len());
                        if conn.input.send(packet).await.is_err() {
                            // Write pump gone; its error surfaces below
                            break;
                        }
                    }
                }
                Some(packet) = conn.output.recv() => {
                    self.counters.record_rx(packet.len());
                    if iface.input.send(packet).await.is_err() {
                        self.counters.record_drop();
                    }
                }
                err = conn.pumps.next_error() => {
                    break Err(err.unwrap_or(Error::Protocol(cvpn_protocol::Error::Closed)));
                }
                err = iface.pumps.next_error() => {
                    let reason = err.map_or_else(|| "closed".to_string(), |e| e.to_string());
                    break Err(Error::InvalidState(format!("interface failed: {}", reason)));
                }
            }
        };

        conn.close().await;
        result
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.config.server)
            .field("state", &self.state())
            .finish()
    }
}
