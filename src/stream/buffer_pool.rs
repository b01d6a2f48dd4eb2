//! Reusable relay buffers

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::protocol::constants::DEFAULT_BUFFER_SIZE;

/// Bounded free list of fixed-size buffers.
///
/// `get` never blocks: when the free list is empty a fresh buffer is
/// allocated, and buffers returned to a full list are simply dropped.
pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_BUFFER_SIZE, 1024)
    }

    pub fn with_config(buffer_size: usize, max_buffers: usize) -> Self {
        Self {
            free: ArrayQueue::new(max_buffers.max(1)),
            buffer_size,
        }
    }

    /// Take a zero-length buffer with at least `buffer_size` capacity.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.buffer_size {
            return;
        }
        buf.clear();
        let _ = self.free.push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffer on loan from a [`BufferPool`]; returned on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_returned_on_drop() {
        let pool = Arc::new(BufferPool::with_config(1024, 4));
        assert_eq!(pool.available(), 0);
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"data");
            assert!(buf.capacity() >= 1024);
        }
        assert_eq!(pool.available(), 1);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_bounded() {
        let pool = Arc::new(BufferPool::with_config(64, 2));
        let bufs: Vec<_> = (0..5).map(|_| pool.get()).collect();
        drop(bufs);
        assert_eq!(pool.available(), 2);
    }
}
