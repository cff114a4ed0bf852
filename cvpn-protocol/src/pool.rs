//! Leasable resource pools for tunnel addresses and ports
//!
//! A pool hands out exclusive leases on a fixed set of resources. Both
//! [`ResourcePool::acquire`] and [`ResourcePool::release`] take a short
//! internal lock and never wait for a resource to become free: an empty pool
//! fails with [`Error::PoolEmpty`] and releasing something that was never
//! leased fails with [`Error::PoolFull`].
//!
//! The IPv4 pool is built from the server's own address in CIDR notation.
//! Every host in the subnet except the network address, the broadcast
//! address and the server itself is leasable. For `10.0.200.1/24`:
//!
//! ```text
//! offset  1    -> 10.0.200.1   (server, reserved)
//! offset  2    -> 10.0.200.2
//! ...
//! offset  254  -> 10.0.200.254
//! ```
//!
//! Host offsets map one to one onto ports in a parallel [`PortPool`] via
//! [`PortPool::port_for_offset`].

use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use ipnet::Ipv4Net;

use crate::{Error, Result};

/// Shortest prefix accepted for a tunnel subnet
const MIN_PREFIX_LEN: u8 = 16;

struct Slots<T> {
    free: VecDeque<T>,
    leased: HashSet<T>,
}

/// A bounded set of leasable resources
pub struct ResourcePool<T> {
    slots: Mutex<Slots<T>>,
    capacity: usize,
}

impl<T> ResourcePool<T>
where
    T: Copy + Eq + Hash + Display,
{
    /// Create a pool whose free list holds `items`, in order
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        let free: VecDeque<T> = items.into_iter().collect();
        let capacity = free.len();
        Self {
            slots: Mutex::new(Slots {
                free,
                leased: HashSet::with_capacity(capacity),
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lease the next free resource
    pub fn acquire(&self) -> Result<T> {
        let mut slots = self.lock();
        let item = slots.free.pop_front().ok_or(Error::PoolEmpty)?;
        slots.leased.insert(item);
        Ok(item)
    }

    /// Lease one particular resource
    ///
    /// Fails with [`Error::PoolEmpty`] if it is already leased or not part of
    /// the pool.
    pub fn acquire_specific(&self, item: T) -> Result<()> {
        let mut slots = self.lock();
        let pos = slots
            .free
            .iter()
            .position(|free| *free == item)
            .ok_or(Error::PoolEmpty)?;
        slots.free.remove(pos);
        slots.leased.insert(item);
        Ok(())
    }

    /// Give a leased resource back
    pub fn release(&self, item: T) -> Result<()> {
        let mut slots = self.lock();
        if !slots.leased.remove(&item) {
            return Err(Error::PoolFull(item.to_string()));
        }
        slots.free.push_back(item);
        Ok(())
    }

    /// Whether `item` is currently leased
    pub fn is_leased(&self, item: T) -> bool {
        self.lock().leased.contains(&item)
    }

    /// Number of resources that can still be acquired
    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    /// Number of outstanding leases
    pub fn leased(&self) -> usize {
        self.lock().leased.len()
    }

    /// Total number of resources
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if no resource can be acquired
    pub fn is_exhausted(&self) -> bool {
        self.lock().free.is_empty()
    }
}

impl<T> std::fmt::Debug for ResourcePool<T>
where
    T: Copy + Eq + Hash + Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// IPv4 address pool for tunnel clients
#[derive(Debug)]
pub struct IpPool {
    /// Subnet with the server's own address as host part
    net: Ipv4Net,
    /// Number of host offsets (`2^host_bits - 2`)
    hosts: u32,
    pool: ResourcePool<Ipv4Addr>,
}

impl IpPool {
    /// Create from the server address in CIDR notation (e.g., "10.0.200.1/24")
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|_| Error::InvalidCidr(cidr.to_string()))?;
        Self::new(net)
    }

    /// Create from a parsed subnet whose address is the server's own
    pub fn new(net: Ipv4Net) -> Result<Self> {
        if net.prefix_len() > 30 {
            return Err(Error::InvalidCidr(format!(
                "{} leaves no room for clients (need at least /30)",
                net
            )));
        }
        if net.prefix_len() < MIN_PREFIX_LEN {
            return Err(Error::InvalidCidr(format!(
                "{} is too large (at most /{})",
                net, MIN_PREFIX_LEN
            )));
        }

        let hosts = (1u32 << (32 - net.prefix_len())) - 2;
        let base = u32::from(net.network());
        let server = net.addr();

        let addrs = (1..=hosts)
            .map(|offset| Ipv4Addr::from(base + offset))
            .filter(|ip| *ip != server);

        Ok(Self {
            net,
            hosts,
            pool: ResourcePool::new(addrs),
        })
    }

    /// Lease a client address
    pub fn acquire(&self) -> Result<Ipv4Addr> {
        self.pool.acquire()
    }

    /// Return a client address
    pub fn release(&self, ip: Ipv4Addr) -> Result<()> {
        self.pool.release(ip)
    }

    /// Host offset of `ip` inside the subnet (`1..=2^host_bits-2`)
    pub fn offset_of(&self, ip: Ipv4Addr) -> Option<u32> {
        if !self.net.contains(&ip) {
            return None;
        }
        let offset = u32::from(ip) - u32::from(self.net.network());
        (1..=self.hosts).contains(&offset).then_some(offset)
    }

    /// Address at host offset `offset`
    pub fn ip_at(&self, offset: u32) -> Option<Ipv4Addr> {
        (1..=self.hosts)
            .contains(&offset)
            .then(|| Ipv4Addr::from(u32::from(self.net.network()) + offset))
    }

    /// The server's own tunnel address
    pub fn server_ip(&self) -> Ipv4Addr {
        self.net.addr()
    }

    /// Network address of the subnet
    pub fn network(&self) -> Ipv4Addr {
        self.net.network()
    }

    /// Prefix length of the subnet
    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    /// Dotted netmask of the subnet
    pub fn netmask(&self) -> Ipv4Addr {
        self.net.netmask()
    }

    /// Whether `ip` lies inside the managed subnet
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.net.contains(&ip)
    }

    /// Whether `ip` is currently leased
    pub fn is_leased(&self, ip: Ipv4Addr) -> bool {
        self.pool.is_leased(ip)
    }

    /// Number of addresses still available
    pub fn available(&self) -> usize {
        self.pool.available()
    }

    /// Number of addresses leased
    pub fn leased(&self) -> usize {
        self.pool.leased()
    }

    /// Total number of leasable addresses
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Check if the pool is exhausted
    pub fn is_exhausted(&self) -> bool {
        self.pool.is_exhausted()
    }
}

/// Port pool covering `base+1 ..= base+size`
#[derive(Debug)]
pub struct PortPool {
    base: u16,
    size: u16,
    pool: ResourcePool<u16>,
}

impl PortPool {
    /// Create a pool of `size` ports above `base`
    pub fn new(base: u16, size: u16) -> Result<Self> {
        if u32::from(base) + u32::from(size) > u32::from(u16::MAX) {
            return Err(Error::InvalidRange(format!(
                "{} ports above {} overflow the port space",
                size, base
            )));
        }
        Ok(Self {
            base,
            size,
            pool: ResourcePool::new((1..=size).map(|offset| base + offset)),
        })
    }

    /// Lease the next free port
    pub fn acquire(&self) -> Result<u16> {
        self.pool.acquire()
    }

    /// Lease one particular port
    pub fn acquire_specific(&self, port: u16) -> Result<()> {
        self.pool.acquire_specific(port)
    }

    /// Return a port
    pub fn release(&self, port: u16) -> Result<()> {
        self.pool.release(port)
    }

    /// Port mapped to a host offset (`base + offset`)
    pub fn port_for_offset(&self, offset: u32) -> Option<u16> {
        let offset = u16::try_from(offset).ok()?;
        (1..=self.size).contains(&offset).then(|| self.base + offset)
    }

    /// First port below the range
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Whether `port` is currently leased
    pub fn is_leased(&self, port: u16) -> bool {
        self.pool.is_leased(port)
    }

    /// Number of ports still available
    pub fn available(&self) -> usize {
        self.pool.available()
    }

    /// Total number of ports
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ip_pool_from_cidr() {
        let pool = IpPool::from_cidr("10.0.200.1/24").unwrap();
        assert_eq!(pool.server_ip(), Ipv4Addr::new(10, 0, 200, 1));
        assert_eq!(pool.network(), Ipv4Addr::new(10, 0, 200, 0));
        assert_eq!(pool.prefix_len(), 24);
        assert_eq!(pool.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        // 254 hosts minus the server
        assert_eq!(pool.capacity(), 253);
        assert_eq!(pool.available(), 253);
    }

    #[test]
    fn test_ip_pool_invalid_cidr() {
        assert!(matches!(
            IpPool::from_cidr("10.0.200.1"),
            Err(Error::InvalidCidr(_))
        ));
        assert!(matches!(
            IpPool::from_cidr("not-an-ip/24"),
            Err(Error::InvalidCidr(_))
        ));
        assert!(matches!(
            IpPool::from_cidr("10.0.0.1/31"),
            Err(Error::InvalidCidr(_))
        ));
        assert!(matches!(
            IpPool::from_cidr("10.0.0.1/8"),
            Err(Error::InvalidCidr(_))
        ));
    }

    #[test]
    fn test_ip_pool_never_hands_out_reserved() {
        let pool = IpPool::from_cidr("10.0.200.1/24").unwrap();
        let mut seen = HashSet::new();
        while let Ok(ip) = pool.acquire() {
            assert_ne!(ip, Ipv4Addr::new(10, 0, 200, 0));
            assert_ne!(ip, Ipv4Addr::new(10, 0, 200, 1));
            assert_ne!(ip, Ipv4Addr::new(10, 0, 200, 255));
            assert!(pool.contains(ip));
            assert!(seen.insert(ip));
        }
        assert_eq!(seen.len(), 253);
    }

    #[test]
    fn test_ip_pool_first_lease() {
        let pool = IpPool::from_cidr("10.0.200.1/24").unwrap();
        assert_eq!(pool.acquire().unwrap(), Ipv4Addr::new(10, 0, 200, 2));
        assert_eq!(pool.acquire().unwrap(), Ipv4Addr::new(10, 0, 200, 3));
    }

    #[test]
    fn test_ip_pool_server_in_middle() {
        let pool = IpPool::from_cidr("192.168.7.100/29").unwrap();
        // 6 hosts, .100 is offset 4 of 192.168.7.96/29
        assert_eq!(pool.capacity(), 5);
        let leased: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();
        assert!(!leased.contains(&Ipv4Addr::new(192, 168, 7, 100)));
    }

    #[test]
    fn test_capacity_then_empty() {
        let pool = IpPool::from_cidr("10.0.0.1/28").unwrap();
        let capacity = pool.capacity();
        assert_eq!(capacity, 13);

        let mut leased = Vec::new();
        for _ in 0..capacity {
            leased.push(pool.acquire().unwrap());
        }
        assert!(matches!(pool.acquire(), Err(Error::PoolEmpty)));
        assert!(pool.is_exhausted());

        pool.release(leased[3]).unwrap();
        assert_eq!(pool.acquire().unwrap(), leased[3]);
        assert!(matches!(pool.acquire(), Err(Error::PoolEmpty)));
    }

    #[test]
    fn test_release_without_acquire() {
        let pool = IpPool::from_cidr("10.0.200.1/24").unwrap();
        assert!(matches!(
            pool.release(Ipv4Addr::new(10, 0, 200, 9)),
            Err(Error::PoolFull(_))
        ));

        let ip = pool.acquire().unwrap();
        pool.release(ip).unwrap();
        assert!(matches!(pool.release(ip), Err(Error::PoolFull(_))));
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_offset_mapping() {
        let pool = IpPool::from_cidr("10.0.200.1/24").unwrap();
        assert_eq!(pool.offset_of(Ipv4Addr::new(10, 0, 200, 2)), Some(2));
        assert_eq!(pool.offset_of(Ipv4Addr::new(10, 0, 200, 254)), Some(254));
        assert_eq!(pool.offset_of(Ipv4Addr::new(10, 0, 200, 0)), None);
        assert_eq!(pool.offset_of(Ipv4Addr::new(10, 0, 200, 255)), None);
        assert_eq!(pool.offset_of(Ipv4Addr::new(10, 0, 201, 2)), None);

        for offset in 1..=254 {
            let ip = pool.ip_at(offset).unwrap();
            assert_eq!(pool.offset_of(ip), Some(offset));
        }
        assert_eq!(pool.ip_at(0), None);
        assert_eq!(pool.ip_at(255), None);
    }

    #[test]
    fn test_concurrent_acquire_never_double_leases() {
        let pool = Arc::new(IpPool::from_cidr("10.8.0.1/22").unwrap());
        let holders = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let holders = Arc::clone(&holders);
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Ok(ip) = pool.acquire() {
                            assert!(holders.lock().unwrap().insert(ip), "{} leased twice", ip);
                            assert!(holders.lock().unwrap().remove(&ip));
                            pool.release(ip).unwrap();
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(pool.leased(), 0);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_port_pool_range() {
        let pool = PortPool::new(40000, 3).unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.acquire().unwrap(), 40001);
        assert_eq!(pool.acquire().unwrap(), 40002);
        assert_eq!(pool.acquire().unwrap(), 40003);
        assert!(matches!(pool.acquire(), Err(Error::PoolEmpty)));
        pool.release(40002).unwrap();
        assert!(matches!(pool.release(40002), Err(Error::PoolFull(_))));
        assert_eq!(pool.acquire().unwrap(), 40002);
    }

    #[test]
    fn test_port_pool_overflow() {
        assert!(matches!(
            PortPool::new(65500, 100),
            Err(Error::InvalidRange(_))
        ));
        assert!(PortPool::new(65435, 100).is_ok());
    }

    #[test]
    fn test_port_for_offset() {
        let ips = IpPool::from_cidr("10.0.200.1/24").unwrap();
        let ports = PortPool::new(40000, 254).unwrap();
        let ip = ips.acquire().unwrap();
        let port = ports.port_for_offset(ips.offset_of(ip).unwrap()).unwrap();
        assert_eq!(port, 40002);
        assert_eq!(ports.port_for_offset(0), None);
        assert_eq!(ports.port_for_offset(255), None);
    }

    #[test]
    fn test_port_acquire_specific() {
        let pool = PortPool::new(1000, 10).unwrap();
        pool.acquire_specific(1005).unwrap();
        assert!(pool.is_leased(1005));
        assert!(matches!(pool.acquire_specific(1005), Err(Error::PoolEmpty)));
        assert!(matches!(pool.acquire_specific(2000), Err(Error::PoolEmpty)));
        assert_eq!(pool.available(), 9);
        pool.release(1005).unwrap();
        assert_eq!(pool.available(), 10);
    }
}
