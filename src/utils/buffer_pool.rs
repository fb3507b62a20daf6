//! # Buffer Pool
//!
//! Object pool for the byte buffers that carry frames in and out of a session.
//!
//! Inbound buffers are handed to the session by the transport as [`PooledBuffer`]s.
//! A decoded envelope keeps the buffer alive; when the last envelope referencing
//! it is dropped the buffer is cleared and goes back to the pool it came from.
//!
//! ## Usage
//! ```rust
//! use peer_session::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(8);
//! let mut buffer = pool.acquire();
//! buffer.extend_from_slice(b"frame");
//! assert_eq!(pool.available(), 7);
//! drop(buffer);
//! assert_eq!(pool.available(), 8);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

/// Largest buffer capacity that is recycled with the default settings (4KB)
const MAX_POOLED_BUFFER_SIZE: usize = 4096;

/// Default buffer capacity
const DEFAULT_BUFFER_CAPACITY: usize = 1024;

type FreeList = Arc<Mutex<Vec<Vec<u8>>>>;

/// A pooled buffer that returns itself to the pool when dropped
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: FreeList,
    max_pooled: usize,
}

impl PooledBuffer {
    /// Get the underlying buffer, consuming this wrapper. The storage leaves the pool.
    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let capacity = self.buffer.capacity();
        if capacity == 0 || capacity > self.max_pooled {
            return;
        }
        self.buffer.clear();
        if let Ok(mut pool) = self.pool.lock() {
            pool.push(std::mem::take(&mut self.buffer));
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buffer.len())
            .field("capacity", &self.buffer.capacity())
            .finish()
    }
}

/// Thread-safe buffer pool for frame buffers
#[derive(Clone)]
pub struct BufferPool {
    pool: FreeList,
    buffer_capacity: usize,
    max_pooled: usize,
}

impl BufferPool {
    /// Create a new buffer pool with `pool_size` pre-allocated buffers
    pub fn new(pool_size: usize) -> Self {
        Self::with_settings(pool_size, DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a pool whose buffers start with `buffer_capacity` bytes
    pub fn with_settings(pool_size: usize, buffer_capacity: usize) -> Self {
        let pool = (0..pool_size)
            .map(|_| Vec::with_capacity(buffer_capacity))
            .collect();

        Self {
            pool: Arc::new(Mutex::new(pool)),
            buffer_capacity,
            max_pooled: MAX_POOLED_BUFFER_SIZE.max(buffer_capacity),
        }
    }

    /// Acquire a buffer from the pool (or allocate a new one if pool is empty)
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self
            .pool
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity));

        PooledBuffer {
            buffer,
            pool: Arc::clone(&self.pool),
            max_pooled: self.max_pooled,
        }
    }

    /// Acquire a buffer and fill it with a copy of `bytes`
    pub fn acquire_from(&self, bytes: &[u8]) -> PooledBuffer {
        let mut buffer = self.acquire();
        buffer.extend_from_slice(bytes);
        buffer
    }

    /// Get the current number of available buffers in the pool
    pub fn available(&self) -> usize {
        self.pool.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(50)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("buffer_capacity", &self.buffer_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic() {
        let pool = BufferPool::new(10);
        assert_eq!(pool.available(), 10);

        let mut buf = pool.acquire();
        assert_eq!(pool.available(), 9);

        buf.push(42);
        assert_eq!(buf[0], 42);

        drop(buf);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn test_buffer_returned_cleared() {
        let pool = BufferPool::new(1);
        drop(pool.acquire_from(b"test"));

        let buf = pool.acquire();
        assert_eq!(buf.len(), 0);
        assert!(buf.capacity() >= 4);
    }

    #[test]
    fn test_empty_pool_allocates() {
        let pool = BufferPool::new(0);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.available(), 0);

        drop(a);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_oversized_buffer_not_recycled() {
        let pool = BufferPool::new(1);
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(&vec![0u8; MAX_POOLED_BUFFER_SIZE + 1]);
        }
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_into_inner_leaves_pool() {
        let pool = BufferPool::new(1);
        let bytes = pool.acquire_from(&[1, 2, 3]).into_inner();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(pool.available(), 0);
    }
}
