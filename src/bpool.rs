use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_POOL_SIZE: usize = 2048;

/// The maximum duration an acquire waits while outstanding buffer memory
/// exceeds the pool target.
const MAX_QUEUE_DURATION: Duration = Duration::from_secs(1);

/// A growable byte buffer checked out of a [`BufferPool`].
///
/// Buffers are shared only serially: checked out, filled by one owner, then
/// checked back in. `release` resets the contents but keeps the allocation.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
}

impl Buffer {
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn reset(&mut self) {
        self.data.clear();
    }

    /// Truncate to `len` bytes, discarding the tail.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

/// Thread-safe pool of reusable buffers with target-size backpressure.
///
/// `acquire` sleeps up to [`MAX_QUEUE_DURATION`] when the bytes held by
/// outstanding buffers exceed the target, giving the sync engine time to
/// drain before more memory is committed.
#[derive(Debug)]
pub struct BufferPool {
    target_size: usize,
    outstanding: AtomicUsize,
    free: Mutex<Vec<Buffer>>,
}

impl BufferPool {
    pub fn new(target_size: usize) -> Arc<Self> {
        Arc::new(Self {
            target_size,
            outstanding: AtomicUsize::new(0),
            free: Mutex::new(Vec::new()),
        })
    }

    /// Returns a pooled buffer, or a fresh one if the free list is empty.
    pub fn acquire(&self) -> Buffer {
        if self.outstanding.load(Ordering::Relaxed) > self.target_size {
            std::thread::sleep(MAX_QUEUE_DURATION);
        }
        let buf = self
            .free
            .lock()
            .map(|mut free| free.pop())
            .ok()
            .flatten()
            .unwrap_or_default();
        self.outstanding
            .fetch_add(buf.data.capacity(), Ordering::Relaxed);
        buf
    }

    /// Resets the buffer and returns it to the free list.
    pub fn release(&self, mut buf: Buffer) {
        let cap = buf.data.capacity();
        // A buffer may grow while checked out, so clamp at zero rather than
        // assume the released capacity matches what acquire recorded.
        let _ = self
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(cap))
            });
        buf.reset();
        if let Ok(mut free) = self.free.lock() {
            if free.len() < MAX_POOL_SIZE {
                free.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_roundtrip() {
        let pool = BufferPool::new(1 << 20);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"ember");
        assert_eq!(buf.bytes(), b"ember");
        pool.release(buf);

        // The recycled buffer comes back empty.
        let buf = pool.acquire();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncate() {
        let pool = BufferPool::new(1 << 20);
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"0123456789");
        buf.truncate(4);
        assert_eq!(buf.bytes(), b"0123");
        pool.release(buf);
    }
}
