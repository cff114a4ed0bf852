//! Fixed-capacity buffer pool for packet processing
//!
//! Every packet that crosses the tunnel lives in a [`PooledBuffer`] taken
//! from a [`BufferPool`]. A pooled buffer owns a fixed-size backing array
//! plus a valid-length marker, and goes back to the pool's free list when it
//! is dropped. Ownership moves with the buffer through the pump queues, so a
//! buffer never has two owners.
//!
//! The pool is a plain object: the server and the client each construct
//! one and hand clones of the handle to the components they spawn.
//!
//! # Usage
//!
//! ```rust
//! use cvpn_protocol::BufferPool;
//!
//! let pool = BufferPool::new(8, 2048);
//!
//! let mut buf = pool.get();
//! assert_eq!(buf.len(), 0);
//! buf.extend_from_slice(b"hello").unwrap();
//!
//! // Dropping the buffer returns it to the free list
//! drop(buf);
//! assert_eq!(pool.available(), 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Error, Result};

/// Default capacity of one buffer (largest possible IPv4 packet)
pub const DEFAULT_BUFFER_CAPACITY: usize = 65536;

/// Default number of idle buffers kept on the free list
pub const DEFAULT_MAX_BUFFERS: usize = 64;

struct Shared {
    free: Mutex<Vec<Box<[u8]>>>,
    max_buffers: usize,
    buffer_capacity: usize,
}

impl Shared {
    fn free_list(&self) -> MutexGuard<'_, Vec<Box<[u8]>>> {
        // Free list holds plain byte arrays; a panic mid-push leaves it valid.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A bounded free list of fixed-capacity byte buffers
///
/// Cloning produces another handle to the same free list.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    /// Create a pool keeping at most `max_buffers` idle buffers of
    /// `buffer_capacity` bytes each
    pub fn new(max_buffers: usize, buffer_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::with_capacity(max_buffers)),
                max_buffers,
                buffer_capacity,
            }),
        }
    }

    /// Take a buffer from the free list, allocating when it is empty
    ///
    /// Never blocks. The buffer has length 0 and full capacity.
    pub fn get(&self) -> PooledBuffer {
        let data = self
            .shared
            .free_list()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.shared.buffer_capacity].into_boxed_slice());

        PooledBuffer {
            data: Some(data),
            len: 0,
            pool: Arc::clone(&self.shared),
        }
    }

    /// Allocate up to `count` idle buffers ahead of time
    pub fn prewarm(&self, count: usize) {
        let mut free = self.shared.free_list();
        let to_add = count.min(self.shared.max_buffers.saturating_sub(free.len()));
        for _ in 0..to_add {
            free.push(vec![0u8; self.shared.buffer_capacity].into_boxed_slice());
        }
    }

    /// Number of idle buffers on the free list
    pub fn available(&self) -> usize {
        self.shared.free_list().len()
    }

    /// Capacity of every buffer handed out by this pool
    pub fn buffer_capacity(&self) -> usize {
        self.shared.buffer_capacity
    }

    /// Maximum number of idle buffers retained
    pub fn max_buffers(&self) -> usize {
        self.shared.max_buffers
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERS, DEFAULT_BUFFER_CAPACITY)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("max_buffers", &self.shared.max_buffers)
            .field("buffer_capacity", &self.shared.buffer_capacity)
            .finish()
    }
}

/// A checked-out buffer that goes back to its pool when dropped
///
/// Dereferences to the valid bytes (`[..len]`). Use [`spare_mut`] to read
/// into the whole backing array and [`set_len`] to record how much arrived.
///
/// [`spare_mut`]: PooledBuffer::spare_mut
/// [`set_len`]: PooledBuffer::set_len
pub struct PooledBuffer {
    data: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<Shared>,
}

impl PooledBuffer {
    fn storage(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    fn storage_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }

    /// Number of valid bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no valid bytes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing array
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage().len()
    }

    /// Set the valid length, clamped to the capacity
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// Reset the valid length to zero
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// The whole backing array, regardless of the valid length
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        self.storage_mut()
    }

    /// Append bytes after the valid region
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.len + bytes.len();
        if end > self.capacity() {
            return Err(Error::FrameTooLarge(end));
        }
        let start = self.len;
        self.storage_mut()[start..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.storage()[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.storage_mut()[..len]
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.len = 0;
        if let Some(data) = self.data.take() {
            let mut free = self.pool.free_list();
            if free.len() < self.pool.max_buffers {
                free.push(data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_get_is_empty_with_full_capacity() {
        let pool = BufferPool::new(4, 1024);
        let buf = pool.get();
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 1024);
    }

    #[test]
    fn test_default_pool() {
        let pool = BufferPool::default();
        assert_eq!(pool.buffer_capacity(), DEFAULT_BUFFER_CAPACITY);
        assert_eq!(pool.max_buffers(), DEFAULT_MAX_BUFFERS);
        assert_eq!(pool.get().capacity(), DEFAULT_BUFFER_CAPACITY);
    }

    #[test]
    fn test_drop_returns_to_pool() {
        let pool = BufferPool::new(4, 64);
        assert_eq!(pool.available(), 0);
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"data").unwrap();
        }
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_returned_buffer_has_zero_length() {
        let pool = BufferPool::new(1, 64);
        let mut buf = pool.get();
        buf.extend_from_slice(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(buf.len(), 5);
        drop(buf);

        let reused = pool.get();
        assert_eq!(pool.available(), 0);
        assert_eq!(reused.len(), 0);
        assert_eq!(reused.capacity(), 64);
    }

    #[test]
    fn test_full_free_list_drops_buffers() {
        let pool = BufferPool::new(2, 64);
        let bufs: Vec<_> = (0..5).map(|_| pool.get()).collect();
        drop(bufs);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_get_allocates_when_empty() {
        let pool = BufferPool::new(0, 32);
        let a = pool.get();
        let b = pool.get();
        assert_eq!(a.capacity(), 32);
        assert_eq!(b.capacity(), 32);
        drop(a);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_prewarm() {
        let pool = BufferPool::new(8, 64);
        pool.prewarm(5);
        assert_eq!(pool.available(), 5);
        pool.prewarm(100);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_extend_overflow() {
        let pool = BufferPool::new(1, 4);
        let mut buf = pool.get();
        buf.extend_from_slice(&[0; 3]).unwrap();
        assert!(matches!(
            buf.extend_from_slice(&[0; 2]),
            Err(Error::FrameTooLarge(5))
        ));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_set_len_and_spare() {
        let pool = BufferPool::new(1, 16);
        let mut buf = pool.get();
        buf.spare_mut()[..3].copy_from_slice(b"abc");
        buf.set_len(3);
        assert_eq!(&buf[..], b"abc");
        buf.set_len(1000);
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn test_pool_shared_across_threads() {
        let pool = BufferPool::new(16, 128);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.get();
                        assert_eq!(buf.len(), 0);
                        buf.extend_from_slice(&[i as u8; 10]).unwrap();
                        assert!(buf.iter().all(|&b| b == i as u8));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert!(pool.available() <= 16);
        assert!(pool.available() >= 1);
    }
}
