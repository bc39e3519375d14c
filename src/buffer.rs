//! Bounded buffer pool (C1). Fixed-size slab buffers for socket I/O plus a
//! growable read buffer abstraction capped at `MAX_REQUEST_BYTES` (10 MiB,
//! §3). Buffers are cleared, not reallocated, on reuse -- the same policy
//! `epheo-kiss::handle_connection_inner` uses for its per-request scratch
//! buffers. Returned buffers are zeroed only when their carrier object
//! (the connection) is recycled, never eagerly.

pub const DEFAULT_BUF_SIZE: usize = 8 * 1024;
pub const MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug)]
pub struct GrowableBuffer {
    data: Vec<u8>,
    cap: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum GrowError {
    TooLarge,
}

impl GrowableBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(DEFAULT_BUF_SIZE.min(cap)),
            cap,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append bytes, growing storage by doubling; refuses to exceed `cap`.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), GrowError> {
        if self.data.len() + bytes.len() > self.cap {
            return Err(GrowError::TooLarge);
        }
        if self.data.len() + bytes.len() > self.data.capacity() {
            let target = (self.data.capacity().max(DEFAULT_BUF_SIZE) * 2).min(self.cap);
            self.data.reserve(target.saturating_sub(self.data.len()));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Drop the first `n` bytes already consumed by the parser.
    pub fn consume(&mut self, n: usize) {
        self.data.drain(..n.min(self.data.len()));
    }
}

/// A simple slab pool of reusable fixed-size scratch buffers. No cross-worker
/// sharing (§4.1) -- one pool instance lives per worker process.
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    buf_size: usize,
}

impl BufferPool {
    pub fn new(buf_size: usize) -> Self {
        Self { free: Vec::new(), buf_size }
    }

    pub fn acquire(&mut self) -> Vec<u8> {
        self.free.pop().unwrap_or_else(|| Vec::with_capacity(self.buf_size))
    }

    pub fn release(&mut self, mut buf: Vec<u8>) {
        buf.clear();
        if buf.capacity() <= self.buf_size * 4 {
            self.free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_past_cap() {
        let mut b = GrowableBuffer::new(16);
        assert!(b.extend(&[0u8; 10]).is_ok());
        assert_eq!(b.extend(&[0u8; 10]), Err(GrowError::TooLarge));
    }

    #[test]
    fn consume_shifts_data() {
        let mut b = GrowableBuffer::new(64);
        b.extend(b"hello world").unwrap();
        b.consume(6);
        assert_eq!(b.as_slice(), b"world");
    }

    #[test]
    fn pool_reuses_released_buffers() {
        let mut pool = BufferPool::new(64);
        let buf = pool.acquire();
        let cap = buf.capacity();
        pool.release(buf);
        let buf2 = pool.acquire();
        assert_eq!(buf2.capacity(), cap);
    }
}
