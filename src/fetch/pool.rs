//! Download buffer pool
//!
//! A small stack of reusable byte buffers shared by all requests. A
//! buffer leaves the pool for the lifetime of one request and comes
//! back cleared; buffers grown past the retention threshold are dropped
//! instead of pooled to cap resident memory.

use parking_lot::Mutex;

/// Buffers larger than this are not returned to the pool.
const RETAIN_THRESHOLD: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    /// Maximum number of idle buffers kept around.
    capacity: usize,
    /// Initial allocation for fresh buffers when no hint is available.
    default_size: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, default_size: usize) -> Self {
        BufferPool {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            default_size,
        }
    }

    /// Returns an empty buffer with at least `hint` bytes of capacity
    /// (falling back to the pool default when the hint is zero).
    pub fn get(&self, hint: usize) -> Vec<u8> {
        let want = if hint > 0 { hint } else { self.default_size };

        let mut buffers = self.buffers.lock();
        // Prefer a pooled buffer that already fits the hint.
        if let Some(pos) = buffers.iter().position(|b| b.capacity() >= want) {
            return buffers.swap_remove(pos);
        }
        if let Some(mut buf) = buffers.pop() {
            drop(buffers);
            buf.reserve(want);
            return buf;
        }
        drop(buffers);

        Vec::with_capacity(want)
    }

    /// Returns a buffer to the pool, dropping it when the pool is full
    /// or the buffer outgrew the retention threshold.
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > RETAIN_THRESHOLD {
            return;
        }
        buf.clear();

        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.buffers.lock().len()
    }
}
