//! Lock-free ring buffer between the engine worker and the output callback.
//!
//! Single producer (the worker, writing interleaved stereo samples) and
//! single consumer (the device callback or the null output thread).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free single-producer, single-consumer ring buffer of `f32` samples.
///
/// Positions grow monotonically and wrap through `mask`, so the difference
/// `write - read` is always the number of occupied slots. `read_pos` is only
/// stored by the consumer; `write_pos` and `clear_pos` only by the producer.
pub struct RingBuffer {
    buffer: Box<[UnsafeCell<f32>]>,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
    /// Samples before this position were discarded by `clear`.
    clear_pos: AtomicUsize,
    capacity: usize,
    mask: usize,
}

impl RingBuffer {
    /// Create a new ring buffer.
    ///
    /// The capacity is rounded up to the next power of 2 (minimum 2, so a
    /// stereo frame always fits).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();

        Self {
            buffer: (0..capacity).map(|_| UnsafeCell::new(0.0)).collect(),
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            clear_pos: AtomicUsize::new(0),
            capacity,
            mask: capacity - 1,
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of samples available for reading.
    pub fn available(&self) -> usize {
        let clear = self.clear_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(clear).min(write.wrapping_sub(read))
    }

    /// Number of free slots for writing.
    ///
    /// Slots discarded by `clear` are only freed once the consumer has
    /// moved past them.
    pub fn free(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        self.capacity - write.wrapping_sub(read)
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    fn slots(&self) -> *mut f32 {
        UnsafeCell::raw_get(self.buffer.as_ptr())
    }

    /// Where the consumer resumes and how many samples it may take.
    fn readable(&self) -> (usize, usize) {
        // `clear_pos` first: seeing a clear implies seeing the writes before it.
        let clear = self.clear_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Relaxed);

        let from = if write.wrapping_sub(clear) < write.wrapping_sub(read) {
            clear
        } else {
            read
        };
        (from, write.wrapping_sub(from))
    }

    /// Write as many samples as fit. Producer side only.
    ///
    /// Returns the number of samples written.
    pub fn write(&self, samples: &[f32]) -> usize {
        let write_pos = self.write_pos.load(Ordering::Relaxed);
        let read_pos = self.read_pos.load(Ordering::Acquire);

        let space = self.capacity - write_pos.wrapping_sub(read_pos);
        let count = samples.len().min(space);
        if count == 0 {
            return 0;
        }

        let start = write_pos & self.mask;
        let first = count.min(self.capacity - start);
        let dst = self.slots();

        // SAFETY: only the producer touches the free region [write_pos, read_pos + capacity),
        // and `first` / `count - first` stay inside the allocation.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::copy_nonoverlapping(samples.as_ptr(), dst.add(start), first);
            std::ptr::copy_nonoverlapping(samples.as_ptr().add(first), dst, count - first);
        }

        self.write_pos
            .store(write_pos.wrapping_add(count), Ordering::Release);
        count
    }

    /// Copy `output.len()` samples starting at position `from`.
    ///
    /// # Safety
    /// `[from, from + output.len())` must be published by the producer and
    /// not yet released by the consumer.
    #[allow(unsafe_code)]
    unsafe fn copy_out(&self, from: usize, output: &mut [f32]) {
        let count = output.len();
        let start = from & self.mask;
        let first = count.min(self.capacity - start);
        let src = self.slots().cast_const();

        // SAFETY: in bounds as above; the region is owned by the consumer per the contract.
        unsafe {
            std::ptr::copy_nonoverlapping(src.add(start), output.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(src, output.as_mut_ptr().add(first), count - first);
        }
    }

    /// Read up to `output.len()` samples. Consumer side only.
    ///
    /// Returns the number of samples read.
    pub fn read(&self, output: &mut [f32]) -> usize {
        let (from, available) = self.readable();
        let count = output.len().min(available);

        // SAFETY: [from, from + count) lies within what `readable` saw published.
        #[allow(unsafe_code)]
        unsafe {
            self.copy_out(from, &mut output[..count]);
        }

        self.read_pos
            .store(from.wrapping_add(count), Ordering::Release);
        count
    }

    /// Copy up to `output.len()` samples without consuming them. Consumer side only.
    pub fn peek(&self, output: &mut [f32]) -> usize {
        let (from, available) = self.readable();
        let count = output.len().min(available);

        // SAFETY: as in `read`; nothing is released.
        #[allow(unsafe_code)]
        unsafe {
            self.copy_out(from, &mut output[..count]);
        }
        count
    }

    /// Drop up to `count` samples without copying them. Consumer side only.
    pub fn skip(&self, count: usize) -> usize {
        let (from, available) = self.readable();
        let skipped = count.min(available);
        self.read_pos
            .store(from.wrapping_add(skipped), Ordering::Release);
        skipped
    }

    /// Release slots discarded by `clear`. Consumer side only.
    ///
    /// Outputs call this while idle so a cleared buffer frees up for the producer.
    pub fn catch_up(&self) {
        self.skip(0);
    }

    /// Discard everything currently buffered. Producer side only.
    ///
    /// Readers stop seeing the discarded samples at once; their slots return
    /// to the producer when the consumer next reads, skips or catches up.
    pub fn clear(&self) {
        let write_pos = self.write_pos.load(Ordering::Relaxed);
        self.clear_pos.store(write_pos, Ordering::Release);
    }
}

// SAFETY: producer and consumer work on disjoint regions delimited by the
// atomic positions; see `write` and `readable`.
#[allow(unsafe_code)]
unsafe impl Sync for RingBuffer {}

/// Thread-safe reference to a ring buffer.
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer.
pub fn shared_ring_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}
