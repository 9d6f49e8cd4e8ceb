use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tracing::{debug, trace};

/// A bounded stack of reclaimed serialization buffers. Serialization and
///  framing are synchronous and short-lived, so contention-free reuse matters
///  more than a strict cap: when the pool is empty, [BufferPool::acquire]
///  allocates a fresh buffer instead of blocking.
pub struct BufferPool {
    chunk_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(chunk_size: usize, max_pool_size: usize) -> BufferPool {
        BufferPool {
            chunk_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let recycled = self.buffers.lock().unwrap().pop();

        let buf = match recycled {
            Some(buf) => {
                trace!("returning buffer from pool");
                buf
            }
            None => {
                debug!("no buffer in pool: creating new buffer");
                BytesMut::with_capacity(self.chunk_size)
            }
        };

        PooledBuf {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    fn release(&self, mut buffer: BytesMut) {
        if buffer.capacity() != self.chunk_size {
            debug!("returned buffer no longer has the regular capacity of {} bytes - discarding", self.chunk_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < buffers.capacity() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

/// Scoped checkout of a pool buffer: the buffer travels back to its pool when
///  the guard is dropped, on every exit path including unwind. This makes a
///  double return unrepresentable.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("pooled buffer is present until drop")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("pooled buffer is present until drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
