//! Buffer pool for staging large request payloads.
//!
//! Encoding an image-sized request into a fresh allocation on every call
//! churns the allocator under sustained traffic. The pool keeps a few
//! large `BytesMut` buffers on a free list and hands them back out.
//!
//! # Design
//!
//! - `get_buffer()` pops a free buffer or allocates a new one of
//!   `buffer_size` capacity
//! - `release_buffer()` zeroes the used region and returns the buffer to the
//!   free list when there is room, otherwise drops it
//! - Buffers smaller than `buffer_size`, or grown far past it, are dropped
//!   instead of pooled
//!
//! # Usage
//!
//! ```
//! use worker_bridge::protocol::BufferPool;
//!
//! let pool = BufferPool::new(2, 1024);
//! let mut buf = pool.get_buffer();
//! buf.extend_from_slice(b"payload");
//! pool.release_buffer(buf);
//! assert_eq!(pool.available(), 1);
//! ```

use std::sync::{Mutex, PoisonError};

use bytes::BytesMut;

/// Default capacity of each pooled buffer (5 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// Default number of buffers kept on the free list.
pub const DEFAULT_MAX_BUFFERS: usize = 3;

/// Buffers that grew past this multiple of `buffer_size` are not pooled.
const MAX_GROWTH_FACTOR: usize = 4;

/// A small pool of reusable byte buffers.
///
/// Safe to share between tasks; the free list sits behind a mutex that is
/// only held for a push or pop.
#[derive(Debug)]
pub struct BufferPool {
    /// Free buffers.
    free: Mutex<Vec<BytesMut>>,
    /// Free list capacity.
    max_buffers: usize,
    /// Capacity of freshly allocated buffers.
    buffer_size: usize,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new(max_buffers: usize, buffer_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_buffers)),
            max_buffers,
            buffer_size,
        }
    }

    /// Take a buffer from the free list, or allocate one.
    ///
    /// The returned buffer is empty and zeroed.
    pub fn get_buffer(&self) -> BytesMut {
        let pooled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        pooled.unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    /// Return a buffer to the pool.
    ///
    /// The contents are zeroed before the buffer is pooled. If the pool is
    /// full, or the buffer is not pool-sized, it is dropped.
    pub fn release_buffer(&self, mut buf: BytesMut) {
        let capacity = buf.capacity();
        if capacity < self.buffer_size
            || capacity > self.buffer_size.saturating_mul(MAX_GROWTH_FACTOR)
        {
            return;
        }

        scrub(&mut buf);
        buf.clear();

        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_buffers {
            free.push(buf);
        }
    }

    /// Drop every pooled buffer. Used as a memory reclamation hint.
    pub fn shrink(&self) -> usize {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = free.len();
        free.clear();
        free.shrink_to_fit();
        dropped
    }

    /// Number of buffers currently on the free list.
    pub fn available(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Free list capacity.
    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    /// Capacity of freshly allocated buffers.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Overwrite the written region so a pooled buffer never carries old payload
/// bytes. Length is left unchanged.
fn scrub(buf: &mut BytesMut) {
    buf[..].fill(0);
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERS, DEFAULT_BUFFER_SIZE)
    }
}
