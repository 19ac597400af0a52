//! Fixed-capacity ring of latency samples.

use std::time::Duration;

use parking_lot::RwLock;

/// Last-N latency samples with a circular write index.
///
/// Writers take the lock briefly per push; readers copy the logical
/// contents out under a shared lock, so individual samples are never torn
/// and percentile queries observe a consistent snapshot.
#[derive(Debug)]
pub struct RingBuffer {
    inner: RwLock<Inner>,
    capacity: usize,
}

#[derive(Debug)]
struct Inner {
    buffer: Vec<Duration>,
    index: usize,
    full: bool,
}

impl RingBuffer {
    /// Create a ring holding up to `capacity` samples. Capacity is at least 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(Inner {
                buffer: vec![Duration::ZERO; capacity],
                index: 0,
                full: false,
            }),
            capacity,
        }
    }

    /// Append a sample, overwriting the oldest once full.
    pub fn push(&self, sample: Duration) {
        let mut inner = self.inner.write();
        let index = inner.index;
        inner.buffer[index] = sample;
        inner.index = (index + 1) % self.capacity;
        if inner.index == 0 {
            inner.full = true;
        }
    }

    /// Logical contents, oldest first. When not yet full, only the written
    /// prefix is returned.
    pub fn ordered(&self) -> Vec<Duration> {
        let inner = self.inner.read();
        if !inner.full {
            return inner.buffer[..inner.index].to_vec();
        }
        let mut out = Vec::with_capacity(self.capacity);
        out.extend_from_slice(&inner.buffer[inner.index..]);
        out.extend_from_slice(&inner.buffer[..inner.index]);
        out
    }

    /// Number of samples currently stored.
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        if inner.full { self.capacity } else { inner.index }
    }

    /// True if no sample has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of samples retained.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
