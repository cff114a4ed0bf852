//! Live client sessions keyed by leased address

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use cvpn_protocol::PooledBuffer;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Outcome of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Peer queue full, packet dropped
    Full,
    /// Peer is shutting down, packet dropped
    Closed,
}

/// Router-side view of one connected client
pub struct SessionHandle {
    ip: Ipv4Addr,
    port: u16,
    peer: SocketAddr,
    input: mpsc::Sender<PooledBuffer>,
    last_active: Mutex<Instant>,
    cancel: CancellationToken,
    evicted: AtomicBool,
}

impl SessionHandle {
    pub fn new(
        ip: Ipv4Addr,
        port: u16,
        peer: SocketAddr,
        input: mpsc::Sender<PooledBuffer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ip,
            port,
            peer,
            input,
            last_active: Mutex::new(Instant::now()),
            cancel,
            evicted: AtomicBool::new(false),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a packet for this client without waiting
    pub fn try_send(&self, packet: PooledBuffer) -> Delivery {
        match self.input.try_send(packet) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Record activity from the client
    pub fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active().elapsed()
    }

    /// Ask the owning connection task to shut down
    pub fn evict(&self) {
        self.evicted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("peer", &self.peer)
            .field("idle_for", &self.idle_for())
            .field("evicted", &self.is_evicted())
            .finish()
    }
}

/// Leased address (as integer) to live session
#[derive(Debug, Default)]
pub struct Registry {
    sessions: RwLock<HashMap<u32, Arc<SessionHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning any session it displaced
    pub fn insert(&self, session: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        self.write().insert(u32::from(session.ip), session)
    }

    /// Remove `session` if it is still the one registered for its address
    ///
    /// A newer session leased the same address must not be torn down by the
    /// cleanup of an older one.
    pub fn remove(&self, session: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.write();
        let key = u32::from(session.ip);
        match sessions.get(&key) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<Arc<SessionHandle>> {
        self.read().get(&u32::from(ip)).cloned()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.read().contains_key(&u32::from(ip))
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Session with the oldest activity that is not already being evicted
    pub fn least_recently_active(&self) -> Option<Arc<SessionHandle>> {
        self.read()
            .values()
            .filter(|s| !s.is_evicted())
            .min_by_key(|s| s.last_active())
            .cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u32, Arc<SessionHandle>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u32, Arc<SessionHandle>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}
