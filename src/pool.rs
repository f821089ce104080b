use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

/// Buffers larger than this are dropped instead of pooled so one huge
/// payload does not pin its allocation forever.
const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

/// Pool of payload buffers shared between all readers of a log.
///
/// Every record handed to a consumer owns one rented buffer; dropping
/// the record returns the buffer here for the next read.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
        })
    }

    /// Rents an empty buffer, reusing a returned one when available.
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_default();
        PooledBuf {
            buf,
            pool: Arc::downgrade(self),
        }
    }

    fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();
        let mut free = self.free.lock().expect("buffer pool lock poisoned");
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.free.lock().expect("buffer pool lock poisoned").len()
    }
}

/// A byte buffer rented from a [`BufferPool`].
///
/// Uniquely owns its allocation; returns it to the pool on drop. The
/// pool is held weakly so buffers outliving the log simply free.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Weak<BufferPool>,
}

impl PooledBuf {
    pub(crate) fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Detaches the bytes from the pool.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.pool = Weak::new();
        std::mem::take(&mut self.buf)
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PooledBuf({} bytes)", self.buf.len())
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(std::mem::take(&mut self.buf));
        }
    }
}
