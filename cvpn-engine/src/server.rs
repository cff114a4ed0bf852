//! Tunnel server
//!
//! One listener, one task per accepted connection, one interface loop:
//!
//! ```text
//!                  accept ──► handle_connection (per client)
//!                                 handshake ─► admit ─► register
//!                                 duplex output ─► Router::from_client
//!
//!  interface duplex output ─► PacketAssembler ─► Router::from_interface
//! ```
//!
//! Address and port leases are held by a [`Lease`] guard owned by the
//! connection task, so every exit path returns them exactly once.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use cvpn_protocol::handshake::{read_request, secret_hash, write_response, SECRET_HASH_SIZE};
use cvpn_protocol::{
    BufferPool, Cipher, CipherFrameReader, CipherFrameWriter, IpPool, PacketAssembler, PortPool,
    RawFrameReader, RawFrameWriter, Response, Status,
};
use ipnet::Ipv4Net;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::duplex::{Duplex, DuplexHandle, DuplexOptions};
use crate::error::{Error, Result};
use crate::registry::{Registry, SessionHandle};
use crate::router::Router;
use crate::script::{HookParams, InterfaceHook};
use crate::stats::{ServerStats, TrafficCounters};

/// Address and port accounting plus admission control
pub struct Leases {
    ips: IpPool,
    ports: PortPool,
    registry: Arc<Registry>,
    /// Serializes the exhaustion check, eviction and acquisition
    admission: Mutex<()>,
    released: Notify,
    evict_lru: bool,
    evict_timeout: Duration,
}

impl Leases {
    pub fn new(
        ips: IpPool,
        ports: PortPool,
        registry: Arc<Registry>,
        evict_lru: bool,
        evict_timeout: Duration,
    ) -> Self {
        Self {
            ips,
            ports,
            registry,
            admission: Mutex::new(()),
            released: Notify::new(),
            evict_lru,
            evict_timeout,
        }
    }

    pub fn ips(&self) -> &IpPool {
        &self.ips
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    /// Lease an address and a port for a new client
    ///
    /// When the address pool is empty and eviction is enabled, the least
    /// recently active session is cancelled and admission waits for its
    /// lease to come back. Fails with the status to report to the client.
    pub async fn admit(self: &Arc<Self>) -> std::result::Result<Lease, Status> {
        let _admission = self.admission.lock().await;

        if self.ips.is_exhausted() {
            self.reclaim().await?;
        }

        if self.ports.available() == 0 {
            log::warn!("Port pool exhausted");
            return Err(Status::NoPortAvailable);
        }

        let ip = self.ips.acquire().map_err(|_| Status::NoIpAvailable)?;
        let port = match self.port_for(ip) {
            Some(port) => port,
            None => {
                self.release_ip(ip);
                return Err(Status::NoPortAvailable);
            }
        };

        Ok(Lease {
            ip,
            port,
            leases: Arc::clone(self),
        })
    }

    /// Port paired with `ip`, falling back to any free port
    fn port_for(&self, ip: Ipv4Addr) -> Option<u16> {
        let preferred = self
            .ips
            .offset_of(ip)
            .and_then(|offset| self.ports.port_for_offset(offset))
            .filter(|port| self.ports.acquire_specific(*port).is_ok());
        preferred.or_else(|| self.ports.acquire().ok())
    }

    async fn reclaim(&self) -> std::result::Result<(), Status> {
        if !self.evict_lru {
            log::warn!("Address pool exhausted");
            return Err(Status::NoIpAvailable);
        }

        let Some(victim) = self.registry.least_recently_active() else {
            log::warn!("Address pool exhausted and no session to evict");
            return Err(Status::NoIpAvailable);
        };

        log::info!(
            "Address pool exhausted, evicting {} (idle {:?})",
            victim.ip(),
            victim.idle_for()
        );
        victim.evict();

        let deadline = tokio::time::Instant::now() + self.evict_timeout;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if !self.ips.is_exhausted() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                log::warn!("Evicted session {} did not release its lease in time", victim.ip());
                return Err(Status::NoIpAvailable);
            }
        }
    }

    fn release_ip(&self, ip: Ipv4Addr) {
        if let Err(e) = self.ips.release(ip) {
            log::error!("Failed to release {}: {}", ip, e);
        }
        self.released.notify_waiters();
    }

    fn release(&self, ip: Ipv4Addr, port: u16) {
        if let Err(e) = self.ports.release(port) {
            log::error!("Failed to release port {}: {}", port, e);
        }
        self.release_ip(ip);
    }
}

/// An address and port held by one client
pub struct Lease {
    ip: Ipv4Addr,
    port: u16,
    leases: Arc<Leases>,
}

impl Lease {
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        log::debug!("Releasing lease {} / port {}", self.ip, self.port);
        self.leases.release(self.ip, self.port);
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .finish()
    }
}

/// State shared by the connection tasks
struct Context {
    cipher: Cipher,
    secret_hash: [u8; SECRET_HASH_SIZE],
    pool: BufferPool,
    leases: Arc<Leases>,
    registry: Arc<Registry>,
    netmask: Ipv4Addr,
    queue_depth: usize,
    handshake_timeout: Duration,
    idle_timeout: Option<Duration>,
}

/// Tunnel server bound to its listening socket
pub struct Server {
    listener: TcpListener,
    ctx: Arc<Context>,
    net: Ipv4Net,
    device: String,
    counters: Arc<TrafficCounters>,
}

impl Server {
    /// Bind the listener and set up the address pools
    pub async fn bind(config: &Config, pool: BufferPool) -> Result<Self> {
        let server = config.server_config()?;
        let net = server.tunnel_net()?;
        let ips = IpPool::new(net)?;

        let ports = PortPool::new(server.port_base, server.port_count()?)?;

        let registry = Arc::new(Registry::new());
        let leases = Arc::new(Leases::new(
            ips,
            ports,
            Arc::clone(&registry),
            server.evict_lru,
            server.evict_timeout(),
        ));

        let listener = TcpListener::bind(server.listen).await?;
        log::info!(
            "Listening on {} for tunnel {} ({} client addresses)",
            listener.local_addr()?,
            net,
            leases.ips().capacity()
        );

        let secret = config.common.secret.as_bytes();
        let ctx = Context {
            cipher: Cipher::new(secret),
            secret_hash: secret_hash(secret),
            pool,
            netmask: net.netmask(),
            leases,
            registry,
            queue_depth: config.common.queue_depth,
            handshake_timeout: server.handshake_timeout(),
            idle_timeout: server.idle_timeout(),
        };

        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
            net,
            device: config.common.tun_device.clone().unwrap_or_default(),
            counters: Arc::new(TrafficCounters::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The server's own tunnel address
    pub fn server_ip(&self) -> Ipv4Addr {
        self.net.addr()
    }

    pub fn network(&self) -> Ipv4Net {
        self.net
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.ctx.registry
    }

    pub fn leases(&self) -> &Arc<Leases> {
        &self.ctx.leases
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            clients: self.ctx.registry.len(),
            ips_available: self.ctx.leases.ips().available(),
            ports_available: self.ctx.leases.ports().available(),
            traffic: self.counters.snapshot(),
        }
    }

    /// Serve clients until `shutdown` fires or the interface fails
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
        let DuplexHandle {
            input: iface_tx,
            output: mut iface_rx,
            pumps: mut iface_pumps,
        } = Duplex::new(
            RawFrameReader::new(tun_r),
            RawFrameWriter::new(tun_w),
            self.ctx.pool.clone(),
            DuplexOptions::new("interface").queue_depth(self.ctx.queue_depth),
        )
        .start(shutdown.child_token());

        let router = Arc::new(Router::new(
            Arc::clone(&self.ctx.registry),
            self.net,
            iface_tx,
            Arc::clone(&self.counters),
        ));

        let params = HookParams::new(self.server_ip(), self.net.prefix_len(), self.device.clone());
        if let Err(e) = hook.up(&params).await {
            iface_pumps.close().await;
            return Err(e);
        }

        let connections = shutdown.child_token();
        let mut tasks = JoinSet::new();
        let mut assembler = PacketAssembler::new(self.ctx.pool.clone());
        let mut packets = Vec::new();
        let mut backoff = AcceptBackoff::default();

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Server shutdown requested");
                    break Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff.reset();
                        log::debug!("Accepted connection from {}", peer);
                        tasks.spawn(handle_connection(
                            Arc::clone(&self.ctx),
                            Arc::clone(&router),
                            stream,
                            peer,
                            connections.child_token(),
                        ));
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        log::warn!("Accept failed: {}; retrying in {:?}", e, delay);
                        tokio::select! {
                            _ = shutdown.cancelled() => break Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
                Some(chunk) = iface_rx.recv() => {
                    if let Err(e) = assembler.push(&chunk, &mut packets) {
                        log::debug!("Discarding malformed interface data: {}", e);
                    }
                    for packet in packets.drain(..) {
                        router.from_interface(packet);
                    }
                }
                err = iface_pumps.next_error() => {
                    let err = err.unwrap_or_else(|| Error::Connection("interface closed".into()));
                    log::error!("Interface failed: {}", err);
                    break Err(err);
                }
                Some(done) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = done {
                        log::warn!("Connection task failed: {}", e);
                    }
                }
            }
        };

        connections.cancel();
        while tasks.join_next().await.is_some() {}
        iface_pumps.close().await;

        if let Err(e) = hook.down(&params).await {
            log::warn!("Interface down hook failed: {}", e);
        }
        log::info!("Server stopped");
        result
    }
}

/// Delay between accept attempts while the listener keeps failing
#[derive(Debug, Default)]
struct AcceptBackoff {
    failures: u32,
}

impl AcceptBackoff {
    const INITIAL: Duration = Duration::from_millis(10);
    const MAX: Duration = Duration::from_secs(1);

    /// Doubles from `INITIAL` up to `MAX` with every consecutive failure
    fn next_delay(&mut self) -> Duration {
        let delay = Self::INITIAL * (1u32 << self.failures.min(7));
        self.failures = self.failures.saturating_add(1);
        delay.min(Self::MAX)
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Handshake, admission and packet pumping for one client
async fn handle_connection(
    ctx: Arc<Context>,
    router: Arc<Router>,
    mut stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let handshake = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio::time::timeout(ctx.handshake_timeout, accept_session(&ctx, &mut stream)) => result,
    };
    let (cipher, lease) = match handshake {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            log::warn!("Handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            log::warn!("Handshake with {} timed out", peer);
            return;
        }
    };

    let ip = lease.ip();
    let (r, w) = stream.into_split();
    let DuplexHandle {
        input,
        mut output,
        mut pumps,
    } = Duplex::new(
        CipherFrameReader::new(r, cipher.copy()),
        CipherFrameWriter::new(w, cipher),
        ctx.pool.clone(),
        DuplexOptions::new(format!("{}/{}", peer, ip))
            .queue_depth(ctx.queue_depth)
            .idle_timeout(ctx.idle_timeout),
    )
    .start(cancel.clone());

    let session = Arc::new(SessionHandle::new(ip, lease.port(), peer, input, cancel.clone()));
    if let Some(stale) = ctx.registry.insert(Arc::clone(&session)) {
        log::warn!("Replacing stale session for {}", stale.ip());
        stale.evict();
    }
    log::info!("Client {} connected as {} (port {})", peer, ip, lease.port());

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break if session.is_evicted() { Error::Evicted } else { Error::Shutdown };
            }
            Some(packet) = output.recv() => {
                session.touch();
                router.from_client(ip, packet).await;
            }
            err = pumps.next_error() => {
                break err.unwrap_or(Error::Protocol(cvpn_protocol::Error::Closed));
            }
        }
    };

    ctx.registry.remove(&session);
    pumps.close().await;
    drop(lease);
    log::info!("Client {} ({}) disconnected: {}", peer, ip, reason);
}

/// Server side of the handshake
///
/// Writes a response on every path that reads a well-formed request.
async fn accept_session(ctx: &Arc<Context>, stream: &mut TcpStream) -> Result<(Cipher, Lease)> {
    let request = read_request(stream, &ctx.cipher).await?;

    if !request.verify(&ctx.secret_hash) {
        write_response(stream, &ctx.cipher, &Response::reject(Status::InvalidSecret)).await?;
        return Err(cvpn_protocol::Error::Rejected(Status::InvalidSecret).into());
    }

    let session_cipher = request.session_cipher()?;
    let lease = match ctx.leases.admit().await {
        Ok(lease) => lease,
        Err(status) => {
            write_response(stream, &ctx.cipher, &Response::reject(status)).await?;
            return Err(cvpn_protocol::Error::Rejected(status).into());
        }
    };

    // A failed write drops the lease on the way out
    let response = Response::ok(lease.ip(), ctx.netmask, lease.port());
    write_response(stream, &ctx.cipher, &response).await?;
    Ok((session_cipher, lease))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn leases(cidr: &str, evict_lru: bool, evict_timeout: Duration) -> Arc<Leases> {
        let ips = IpPool::from_cidr(cidr).unwrap();
        let ports = PortPool::new(40000, (ips.capacity() + 1) as u16).unwrap();
        Arc::new(Leases::new(
            ips,
            ports,
            Arc::new(Registry::new()),
            evict_lru,
            evict_timeout,
        ))
    }

    /// Register `lease` like a connection task would, releasing it on eviction
    fn hold(leases: &Arc<Leases>, lease: Lease) -> Arc<SessionHandle> {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let session = Arc::new(SessionHandle::new(
            lease.ip(),
            lease.port(),
            "127.0.0.1:1".parse().unwrap(),
            tx,
            cancel.clone(),
        ));
        leases.registry.insert(Arc::clone(&session));

        let registry = Arc::clone(&leases.registry);
        let held = Arc::clone(&session);
        tokio::spawn(async move {
            cancel.cancelled().await;
            registry.remove(&held);
            drop(lease);
        });
        session
    }

    #[tokio::test]
    async fn test_admit_pairs_port_with_address() {
        let leases = leases("10.0.200.1/24", true, Duration::from_secs(1));
        let lease = leases.admit().await.unwrap();
        assert_eq!(lease.ip(), Ipv4Addr::new(10, 0, 200, 2));
        assert_eq!(lease.port(), 40002);
        assert!(leases.ips().is_leased(lease.ip()));
        assert!(leases.ports().is_leased(40002));

        drop(lease);
        assert!(!leases.ips().is_leased(Ipv4Addr::new(10, 0, 200, 2)));
        assert!(!leases.ports().is_leased(40002));
    }

    #[tokio::test]
    async fn test_exhausted_without_eviction() {
        let leases = leases("10.0.200.1/30", false, Duration::from_secs(1));
        let first = leases.admit().await.unwrap();
        let _session = hold(&leases, first);

        assert_eq!(leases.admit().await.unwrap_err(), Status::NoIpAvailable);
        assert_eq!(leases.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_reclaims_least_recent() {
        let leases = leases("10.0.200.1/30", true, Duration::from_secs(5));
        let first = leases.admit().await.unwrap();
        let ip = first.ip();
        let victim = hold(&leases, first);

        let second = leases.admit().await.unwrap();
        assert!(victim.is_evicted());
        assert_eq!(second.ip(), ip);
        assert!(leases.registry.is_empty());
    }

    #[tokio::test]
    async fn test_eviction_times_out() {
        let leases = leases("10.0.200.1/30", true, Duration::from_millis(100));
        let first = leases.admit().await.unwrap();

        // Registered, but nothing releases the lease when cancelled
        let (tx, _rx) = mpsc::channel(1);
        leases.registry.insert(Arc::new(SessionHandle::new(
            first.ip(),
            first.port(),
            "127.0.0.1:1".parse().unwrap(),
            tx,
            CancellationToken::new(),
        )));

        assert_eq!(leases.admit().await.unwrap_err(), Status::NoIpAvailable);
        assert!(leases.ips().is_leased(first.ip()));
    }

    #[test]
    fn test_accept_backoff_grows_and_resets() {
        let mut backoff = AcceptBackoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        for _ in 0..20 {
            assert!(backoff.next_delay() <= AcceptBackoff::MAX);
        }
        assert_eq!(backoff.next_delay(), AcceptBackoff::MAX);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_port_exhaustion_checked_first() {
        let ips = IpPool::from_cidr("10.0.200.1/24").unwrap();
        let ports = PortPool::new(40000, 1).unwrap();
        let leases = Arc::new(Leases::new(
            ips,
            ports,
            Arc::new(Registry::new()),
            false,
            Duration::from_secs(1),
        ));

        let _first = leases.admit().await.unwrap();
        let available = leases.ips().available();
        assert_eq!(leases.admit().await.unwrap_err(), Status::NoPortAvailable);
        assert_eq!(leases.ips().available(), available);
    }
}
