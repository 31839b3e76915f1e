//! Bounded ring buffer that keeps only the newest frames

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, RingBuffer};
use ringbuf::HeapRb;

/// Ring buffer between a device's producer thread and its consumer.
///
/// When full, pushing evicts the oldest entry, so a capacity of one gives
/// "latest frame only" semantics: a slow consumer never builds a backlog.
pub struct LatestFrameBuffer<T> {
    ring: Mutex<HeapRb<T>>,
    ready: Condvar,

    /// Entries evicted before anyone read them
    dropped: CachePadded<AtomicU64>,
}

impl<T> LatestFrameBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            ready: Condvar::new(),
            dropped: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Producer: push, evicting the oldest entry when full.
    pub fn push(&self, item: T) {
        let evicted = self.ring.lock().push_overwrite(item);
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
    }

    /// Consumer: wait up to `timeout` for an entry.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.ring.lock();
        loop {
            if let Some(item) = ring.try_pop() {
                return Some(item);
            }
            if self.ready.wait_until(&mut ring, deadline).timed_out() {
                return ring.try_pop();
            }
        }
    }

    /// Discards everything buffered, e.g. frames from before a reconfigure.
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        while ring.try_pop().is_some() {}
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
