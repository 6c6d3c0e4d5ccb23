//! Bounded drop-oldest frame buffer shared by the receiver and stream readers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::trace;

use crate::Frame;

/// Fixed-capacity FIFO of frames.
///
/// A push into a full buffer evicts the oldest frame first, so the producer
/// never blocks and never fails. Every operation takes the lock only for the
/// duration of the ring update.
pub struct FrameBuffer {
    ring: Mutex<HeapRb<Frame>>,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Snapshot of buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub frames_written: u64,
    pub frames_read: u64,
    pub frames_dropped: u64,
}

impl FrameBuffer {
    /// Capacity is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(HeapRb::new(capacity)),
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    // Ring updates cannot panic halfway, so a poisoned lock still guards a
    // consistent ring.
    fn ring(&self) -> MutexGuard<'_, HeapRb<Frame>> {
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Producer: append a frame, evicting the oldest one when full
    pub fn push(&self, frame: Frame) {
        let evicted = self.ring().push_overwrite(frame);

        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("framerelay_frames_buffered_total").increment(1);

        if let Some(old) = evicted {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("framerelay_frames_dropped_total").increment(1);
            trace!(sequence = old.sequence, "evicted oldest frame");
        }
    }

    /// Consumer: take the oldest frame, if any
    pub fn try_pop(&self) -> Option<Frame> {
        let frame = self.ring().try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Current occupancy
    pub fn depth(&self) -> usize {
        self.ring().occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }

    /// Drop every buffered frame, returning how many were discarded
    pub fn clear(&self) -> usize {
        let mut ring = self.ring();
        let mut cleared = 0;
        while ring.try_pop().is_some() {
            cleared += 1;
        }
        cleared
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_read: self.stats.frames_read.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
