//! Bounded frame ring buffer decoupling capture from consumption
//!
//! Slots are allocated once at construction and overwritten in place. A
//! single producer calls [`RingBuffer::put`]; the logger drains frames in FIFO
//! order through [`RingBuffer::get`], while the stream server observes the
//! most recently committed frame through [`RingBuffer::peek_blocking`] without
//! moving any cursor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capture::frame::{FrameHeader, HEADER_LEN};
use crate::capture::Frame;

#[derive(Error, Debug)]
pub enum RingError {
    #[error("failed to allocate {slots} frame slots of {slot_len} bytes")]
    Allocation { slots: usize, slot_len: usize },

    #[error("frame dimensions must be non-zero, got {width}x{height}")]
    ZeroSized { width: u32, height: u32 },
}

/// One pre-allocated frame slot
struct FrameSlot {
    header: FrameHeader,
    data: Box<[u8]>,
}

/// Fixed set of frame slots, each sized for the largest frame the sensor can deliver
struct FrameSlotStore {
    slots: Vec<FrameSlot>,
    slot_len: usize,
}

impl FrameSlotStore {
    fn allocate(capacity: usize, slot_len: usize) -> Result<Self, RingError> {
        let alloc_err = || RingError::Allocation {
            slots: capacity,
            slot_len,
        };

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|_| alloc_err())?;

        for _ in 0..capacity {
            let mut data = Vec::new();
            data.try_reserve_exact(slot_len).map_err(|_| alloc_err())?;
            data.resize(slot_len, 0u8);
            slots.push(FrameSlot {
                header: FrameHeader::default(),
                data: data.into_boxed_slice(),
            });
        }

        Ok(Self { slots, slot_len })
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    /// Copy a frame into slot `idx`, truncating payloads larger than the slot.
    /// Returns the number of pixel bytes stored.
    fn write(&mut self, idx: usize, header: &FrameHeader, data: &[u8]) -> usize {
        let slot = &mut self.slots[idx];
        let n = data.len().min(self.slot_len);
        slot.data[..n].copy_from_slice(&data[..n]);

        slot.header = *header;
        slot.header.image_size = n as u64;
        slot.header.buffer_size = slot.header.buffer_size.min(self.slot_len as u64);
        n
    }

    fn read(&self, idx: usize) -> Frame {
        let slot = &self.slots[idx];
        let len = (slot.header.buffer_size as usize).min(self.slot_len);
        Frame {
            header: slot.header,
            data: Bytes::copy_from_slice(&slot.data[..len]),
        }
    }

    fn zero(&mut self) {
        for slot in &mut self.slots {
            slot.data.fill(0);
            slot.header = FrameHeader::default();
        }
    }
}

/// Cursor state, protected by the ring's lock
struct RingState {
    store: FrameSlotStore,
    head: usize,
    tail: usize,
    full: bool,
    /// A frame has been committed since construction or the last reset
    has_latest: bool,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.store.len()
    }

    fn is_empty(&self) -> bool {
        !self.full && self.head == self.tail
    }

    fn size(&self) -> usize {
        if self.full {
            self.capacity()
        } else if self.head >= self.tail {
            self.head - self.tail
        } else {
            self.capacity() + self.head - self.tail
        }
    }

    fn take_tail(&mut self) -> Frame {
        let frame = self.store.read(self.tail);
        self.tail = (self.tail + 1) % self.capacity();
        self.full = false;
        frame
    }

    fn latest(&self) -> Frame {
        let idx = (self.head + self.capacity() - 1) % self.capacity();
        self.store.read(idx)
    }
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Snapshot of ring buffer counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub frames_written: usize,
    pub frames_read: usize,
    pub frames_dropped: usize,
}

/// Frame ring buffer with a destructive FIFO cursor and a non-destructive latest-frame view
pub struct RingBuffer {
    state: Mutex<RingState>,
    data_ready: Condvar,
    width_max: u32,
    height_max: u32,

    /// Statistics
    stats: CachePadded<Stats>,
}

impl RingBuffer {
    /// Allocate `capacity` slots (at least one) for frames up to `width_max` x `height_max` bytes.
    pub fn new(capacity: usize, width_max: u32, height_max: u32) -> Result<Self, RingError> {
        if width_max == 0 || height_max == 0 {
            return Err(RingError::ZeroSized {
                width: width_max,
                height: height_max,
            });
        }

        let capacity = capacity.max(1);
        let slot_len = width_max as usize * height_max as usize;
        let store = FrameSlotStore::allocate(capacity, slot_len)?;

        info!(
            "Ring buffer created: {} slots of {}x{} ({} MiB)",
            capacity,
            width_max,
            height_max,
            (capacity * (slot_len + HEADER_LEN)) >> 20
        );

        Ok(Self {
            state: Mutex::new(RingState {
                store,
                head: 0,
                tail: 0,
                full: false,
                has_latest: false,
            }),
            data_ready: Condvar::new(),
            width_max,
            height_max,
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Allocate a ring whose capacity is capped by a fraction of currently free memory.
    pub fn with_memory_cap(
        requested: usize,
        width_max: u32,
        height_max: u32,
        memory_fraction: f64,
    ) -> Result<Self, RingError> {
        let slot_bytes = width_max as u64 * height_max as u64 + HEADER_LEN as u64;
        let free = crate::utils::free_memory_bytes();
        let capacity = capacity_for_memory(requested, slot_bytes, free, memory_fraction);

        if capacity < requested {
            warn!(
                "Requested {} ring slots but only {} fit in {:.0}% of free memory",
                requested,
                capacity,
                memory_fraction * 100.0
            );
        }

        Self::new(capacity, width_max, height_max)
    }

    /// Producer: copy a frame into the slot at `head`, evicting the oldest unread frame when full
    pub fn put(&self, header: &FrameHeader, data: &[u8]) {
        let mut state = self.state.lock();

        let head = state.head;
        let stored = state.store.write(head, header, data);
        if stored < data.len() {
            warn!(
                "Frame {} truncated from {} to {} bytes",
                header.frame_id,
                data.len(),
                stored
            );
        }

        if state.full {
            // Oldest unread frame was just overwritten
            state.tail = (state.tail + 1) % state.capacity();
            let dropped = self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::counter!("camserver_ring_overflow_total").increment(1);
            if dropped % 100 == 1 {
                warn!("Ring buffer full, dropped oldest frame ({} total)", dropped);
            }
        }

        state.head = (head + 1) % state.capacity();
        state.full = state.head == state.tail;
        state.has_latest = true;
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);

        drop(state);
        self.data_ready.notify_all();
    }

    /// Consumer: pop the oldest frame, if any
    pub fn get(&self) -> Option<Frame> {
        let mut state = self.state.lock();
        if state.is_empty() {
            return None;
        }

        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(state.take_tail())
    }

    /// Consumer: pop the oldest frame, waiting up to `timeout` for one to arrive
    pub fn get_blocking(&self, timeout: Duration) -> Option<Frame> {
        let mut state = self.state.lock();
        if !self.wait_while(&mut state, timeout, |s| s.is_empty()) {
            return None;
        }

        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(state.take_tail())
    }

    /// Most recently committed frame, without touching either cursor
    pub fn peek_latest(&self) -> Option<Frame> {
        let state = self.state.lock();
        state.has_latest.then(|| state.latest())
    }

    /// Like [`peek_latest`](Self::peek_latest), waiting up to `timeout` if nothing was committed yet
    pub fn peek_blocking(&self, timeout: Duration) -> Option<Frame> {
        let mut state = self.state.lock();
        if !self.wait_while(&mut state, timeout, |s| !s.has_latest) {
            return None;
        }

        Some(state.latest())
    }

    /// Wait on the data condition while `blocked` holds. Returns false on timeout.
    fn wait_while(
        &self,
        state: &mut MutexGuard<'_, RingState>,
        timeout: Duration,
        blocked: impl Fn(&RingState) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while blocked(&**state) {
            if self.data_ready.wait_until(state, deadline).timed_out() {
                return !blocked(&**state);
            }
        }
        true
    }

    /// Logically empty the ring; payloads are left in place
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.tail = state.head;
        state.full = false;
        state.has_latest = false;
        debug!("Ring buffer reset");
    }

    /// Empty the ring and zero every slot
    pub fn hard_reset(&self) {
        let mut state = self.state.lock();
        state.store.zero();
        state.tail = state.head;
        state.full = false;
        state.has_latest = false;
        debug!("Ring buffer hard reset");
    }

    pub fn size(&self) -> usize {
        self.state.lock().size()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().full
    }

    /// Largest frame dimensions a slot can hold
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width_max, self.height_max)
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_read: self.stats.frames_read.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Ring capacity after capping `requested` at `fraction` of `free_bytes`.
///
/// Unknown free memory leaves the request untouched. Never returns less than one slot.
pub fn capacity_for_memory(
    requested: usize,
    slot_bytes: u64,
    free_bytes: Option<u64>,
    fraction: f64,
) -> usize {
    let requested = requested.max(1);
    let Some(free) = free_bytes else {
        return requested;
    };

    let budget = (free as f64 * fraction) as u64;
    let fit = (budget / slot_bytes.max(1)) as usize;
    requested.min(fit).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn put_seq(ring: &RingBuffer, seq: u64) {
        let (w, h) = ring.dimensions();
        let header = FrameHeader::new(w, h, seq, seq * 1000);
        let data = vec![seq as u8; (w * h) as usize];
        ring.put(&header, &data);
    }

    fn slots_zeroed(ring: &RingBuffer) -> bool {
        let state = ring.state.lock();
        state.store.slots.iter().all(|slot| {
            slot.header == FrameHeader::default() && slot.data.iter().all(|b| *b == 0)
        })
    }

    #[test]
    fn test_empty_ring() {
        let ring = RingBuffer::new(4, 8, 8).unwrap();
        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.size(), 0);
        assert!(ring.get().is_none());
        assert!(ring.peek_latest().is_none());
    }

    #[test]
    fn test_fifo_order_without_gaps() {
        let ring = RingBuffer::new(8, 4, 4).unwrap();
        for seq in 10..16 {
            put_seq(&ring, seq);
        }
        assert_eq!(ring.size(), 6);

        let ids: Vec<u64> = std::iter::from_fn(|| ring.get()).map(|f| f.sequence()).collect();
        assert_eq!(ids, vec![10, 11, 12, 13, 14, 15]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let ring = RingBuffer::new(4, 4, 4).unwrap();
        for seq in 0..10 {
            put_seq(&ring, seq);
            assert!(ring.size() <= ring.capacity());
        }

        assert!(ring.is_full());
        assert_eq!(ring.size(), ring.capacity());
        assert_eq!(ring.stats().frames_dropped, 6);

        let ids: Vec<u64> = std::iter::from_fn(|| ring.get()).map(|f| f.sequence()).collect();
        assert_eq!(ids, vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_is_full_iff_next_put_evicts() {
        let ring = RingBuffer::new(2, 2, 2).unwrap();
        put_seq(&ring, 1);
        assert!(!ring.is_full());
        put_seq(&ring, 2);
        assert!(ring.is_full());

        ring.get();
        assert!(!ring.is_full());
        put_seq(&ring, 3);
        assert_eq!(ring.stats().frames_dropped, 0);
        put_seq(&ring, 4);
        assert_eq!(ring.stats().frames_dropped, 1);
    }

    #[test]
    fn test_peek_is_idempotent() {
        let ring = RingBuffer::new(4, 4, 4).unwrap();
        put_seq(&ring, 1);
        put_seq(&ring, 2);

        let a = ring.peek_blocking(Duration::from_millis(10)).unwrap();
        let b = ring.peek_blocking(Duration::from_millis(10)).unwrap();
        assert_eq!(a.sequence(), 2);
        assert_eq!(a.header, b.header);
        assert_eq!(a.data, b.data);

        // Peeking leaves the FIFO cursor alone
        assert_eq!(ring.size(), 2);
        assert_eq!(ring.get().unwrap().sequence(), 1);
    }

    #[test]
    fn test_peek_survives_drain() {
        let ring = RingBuffer::new(4, 4, 4).unwrap();
        put_seq(&ring, 5);
        assert_eq!(ring.get().unwrap().sequence(), 5);

        assert!(ring.is_empty());
        assert_eq!(ring.peek_latest().unwrap().sequence(), 5);
    }

    #[test]
    fn test_blocking_reads_time_out() {
        let ring = RingBuffer::new(2, 4, 4).unwrap();
        let start = Instant::now();
        assert!(ring.get_blocking(Duration::from_millis(30)).is_none());
        assert!(ring.peek_blocking(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_get_blocking_wakes_on_put() {
        let ring = Arc::new(RingBuffer::new(4, 4, 4).unwrap());
        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                put_seq(&ring, 42);
            })
        };

        let frame = ring.get_blocking(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.sequence(), 42);
        producer.join().unwrap();
    }

    #[test]
    fn test_reset_and_hard_reset() {
        let ring = RingBuffer::new(4, 2, 2).unwrap();
        put_seq(&ring, 1);
        put_seq(&ring, 2);

        ring.reset();
        assert!(ring.is_empty());
        assert!(ring.peek_latest().is_none());

        put_seq(&ring, 3);
        // Soft reset only moves cursors, payloads stay
        assert!(!slots_zeroed(&ring));

        ring.hard_reset();
        assert!(ring.is_empty());
        assert!(ring.peek_latest().is_none());
        assert!(slots_zeroed(&ring));

        put_seq(&ring, 4);
        let frame = ring.get().unwrap();
        assert_eq!(frame.sequence(), 4);
        assert!(frame.data.iter().all(|b| *b == 4));
    }

    #[test]
    fn test_oversized_frame_is_truncated() {
        let ring = RingBuffer::new(2, 2, 2).unwrap();
        let mut header = FrameHeader::new(4, 4, 1, 0);
        header.buffer_size = 16;
        ring.put(&header, &[7u8; 16]);

        let frame = ring.get().unwrap();
        assert_eq!(frame.header.image_size, 4);
        assert_eq!(frame.data.len(), 4);
    }

    #[test]
    fn test_capacity_for_memory() {
        // No information about free memory
        assert_eq!(capacity_for_memory(1000, 100, None, 0.1), 1000);
        // 10% of 1 MB = 100_000 bytes -> 1000 slots of 100 bytes
        assert_eq!(capacity_for_memory(5000, 100, Some(1_000_000), 0.1), 1000);
        assert_eq!(capacity_for_memory(10, 100, Some(1_000_000), 0.1), 10);
        // Never below one slot
        assert_eq!(capacity_for_memory(10, 1 << 30, Some(1 << 20), 0.1), 1);
        assert_eq!(capacity_for_memory(0, 100, None, 0.1), 1);
    }

    #[test]
    fn test_zero_sized_ring_rejected() {
        assert!(matches!(
            RingBuffer::new(4, 0, 8),
            Err(RingError::ZeroSized { .. })
        ));
    }
}
