//! Buffer pool implementation for efficient buffer reuse
//!
//! Relay loops borrow their read buffers from a shared pool instead of
//! allocating per connection. The pool is thread-safe and bounds the number
//! of outstanding buffers with a semaphore.

use bytes::BytesMut;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A pool of reusable byte buffers
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    /// Limits the number of buffers that can be borrowed at once
    semaphore: Arc<Semaphore>,
    /// Capacity of each buffer handed out
    buffer_capacity: usize,
}

/// A buffer borrowed from the pool
///
/// Dropping the buffer releases its slot back to the pool.
pub struct PooledBuffer {
    pub buffer: BytesMut,
    _permit: OwnedSemaphorePermit,
}

impl BufferPool {
    /// Create a new buffer pool
    ///
    /// # Parameters
    ///
    /// * `max_buffers` - Maximum number of buffers that can be borrowed at once
    /// * `buffer_capacity` - Capacity of each buffer
    pub fn new(max_buffers: usize, buffer_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                semaphore: Arc::new(Semaphore::new(max_buffers)),
                buffer_capacity,
            }),
        }
    }

    /// Borrow a buffer, waiting if the pool is at capacity.
    pub async fn get_buffer(&self) -> PooledBuffer {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .expect("buffer pool semaphore closed");

        PooledBuffer {
            buffer: BytesMut::zeroed(self.inner.buffer_capacity),
            _permit: permit,
        }
    }

    /// Try to borrow a buffer without waiting.
    pub fn try_get_buffer(&self) -> Option<PooledBuffer> {
        let permit = Arc::clone(&self.inner.semaphore).try_acquire_owned().ok()?;

        Some(PooledBuffer {
            buffer: BytesMut::zeroed(self.inner.buffer_capacity),
            _permit: permit,
        })
    }
}
