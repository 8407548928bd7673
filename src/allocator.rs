//! Size-classed buffer pool for frame payloads.
//!
//! Buffers are kept in 17 classes, one per power of two from 1 byte to 64KB.
//! A request is served from the smallest class that fits, so at most half of
//! a handed-out buffer is ever wasted.

use crate::error::{Result, SmuxError};
use crossbeam_queue::ArrayQueue;
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Arc;

/// Number of size classes (2^0 ..= 2^16).
pub const NUM_CLASSES: usize = 17;

/// Largest buffer the allocator hands out.
pub const MAX_ALLOC_SIZE: usize = 1 << (NUM_CLASSES - 1);

/// Default number of idle buffers retained per size class.
pub const DEFAULT_MAX_PER_CLASS: usize = 256;

const DE_BRUIJN_MAGIC: u32 = 0x07C4_ACDD;

const DE_BRUIJN_POS: [u8; 32] = [
    0, 9, 1, 10, 13, 21, 2, 29, 11, 14, 16, 18, 22, 25, 3, 30, 8, 12, 20, 28, 15, 17, 24, 7, 19,
    27, 23, 6, 26, 5, 4, 31,
];

/// Index of the most significant set bit of `v` (`floor(log2(v))`).
///
/// Smears the top bit rightwards so `v` becomes `2^(k+1) - 1`, then maps that
/// value through a De Bruijn multiply and a 32-entry table.
#[inline]
fn msb(v: u32) -> u8 {
    let mut v = v;
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    DE_BRUIJN_POS[(v.wrapping_mul(DE_BRUIJN_MAGIC) >> 27) as usize]
}

/// Size class serving a request of `size` bytes (`ceil(log2(size))`).
#[inline]
fn class_index(size: usize) -> usize {
    let bits = msb(size as u32) as usize;
    if size == 1 << bits { bits } else { bits + 1 }
}

/// A source of frame payload buffers.
///
/// Implementations must be safe to share between every task of every
/// session.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Returns a buffer of length `size`, `1 <= size <= 65536`.
    fn get(&self, size: usize) -> Result<Vec<u8>>;

    /// Returns a buffer obtained from [`Allocator::get`] to the pool. The
    /// capacity must be exactly one size class.
    fn put(&self, buf: Vec<u8>) -> Result<()>;
}

/// The stock allocator: one bounded lock-free queue per size class.
pub struct DefaultAllocator {
    classes: Vec<ArrayQueue<Vec<u8>>>,
}

impl DefaultAllocator {
    pub fn new() -> Self {
        Self::with_max_per_class(DEFAULT_MAX_PER_CLASS)
    }

    /// Creates an allocator retaining at most `max_per_class` idle buffers
    /// in each class. Buffers returned to a full class are freed.
    pub fn with_max_per_class(max_per_class: usize) -> Self {
        let max_per_class = max_per_class.max(1);
        Self {
            classes: (0..NUM_CLASSES)
                .map(|_| ArrayQueue::new(max_per_class))
                .collect(),
        }
    }

    /// Number of idle buffers currently pooled in the class of `size`.
    pub fn idle(&self, size: usize) -> usize {
        if size == 0 || size > MAX_ALLOC_SIZE {
            return 0;
        }
        self.classes[class_index(size)].len()
    }
}

impl Default for DefaultAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DefaultAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultAllocator")
            .field("classes", &self.classes.len())
            .finish()
    }
}

impl Allocator for DefaultAllocator {
    fn get(&self, size: usize) -> Result<Vec<u8>> {
        if size == 0 || size > MAX_ALLOC_SIZE {
            return Err(SmuxError::InvalidAllocSize(size));
        }

        let class = class_index(size);
        let mut buf = self.classes[class]
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(1 << class));
        buf.resize(size, 0);
        Ok(buf)
    }

    fn put(&self, mut buf: Vec<u8>) -> Result<()> {
        let cap = buf.capacity();
        if cap == 0 || cap > MAX_ALLOC_SIZE || !cap.is_power_of_two() {
            return Err(SmuxError::IncorrectBufferSize(cap));
        }

        buf.clear();
        // A full class simply frees the buffer.
        let _ = self.classes[msb(cap as u32) as usize].push(buf);
        Ok(())
    }
}

static DEFAULT_ALLOCATOR: Lazy<Arc<DefaultAllocator>> =
    Lazy::new(|| Arc::new(DefaultAllocator::new()));

/// The process-wide allocator used by sessions unless `Config` names another.
pub fn default_allocator() -> Arc<dyn Allocator> {
    DEFAULT_ALLOCATOR.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_msb_matches_leading_zeros() {
        for v in 1..=(MAX_ALLOC_SIZE as u32) {
            assert_eq!(msb(v) as u32, 31 - v.leading_zeros(), "msb({v})");
        }
        assert_eq!(msb(u32::MAX), 31);
    }

    #[test]
    fn test_class_index() {
        assert_eq!(class_index(1), 0);
        assert_eq!(class_index(2), 1);
        assert_eq!(class_index(3), 2);
        assert_eq!(class_index(4), 2);
        assert_eq!(class_index(5), 3);
        assert_eq!(class_index(1025), 11);
        assert_eq!(class_index(65535), 16);
        assert_eq!(class_index(65536), 16);
    }

    #[test]
    fn test_get_sizes_across_classes() {
        let alloc = DefaultAllocator::new();
        let boundaries = (0..NUM_CLASSES).flat_map(|k| {
            let p = 1usize << k;
            [p - 1, p, p + 1]
        });
        let sizes = (1..=MAX_ALLOC_SIZE)
            .step_by(97)
            .chain(boundaries)
            .filter(|&s| (1..=MAX_ALLOC_SIZE).contains(&s));
        for size in sizes {
            let buf = alloc.get(size).unwrap();
            assert_eq!(buf.len(), size);
            assert!(buf.capacity().is_power_of_two());
            assert!(buf.capacity() >= size);
            // Waste never exceeds half the buffer.
            assert!(buf.capacity() < size * 2);
            alloc.put(buf).unwrap();
        }
    }

    #[test]
    fn test_get_out_of_range() {
        let alloc = DefaultAllocator::new();
        assert!(matches!(alloc.get(0), Err(SmuxError::InvalidAllocSize(0))));
        assert!(matches!(
            alloc.get(MAX_ALLOC_SIZE + 1),
            Err(SmuxError::InvalidAllocSize(65537))
        ));
    }

    #[test]
    fn test_put_rejects_wrong_capacity() {
        let alloc = DefaultAllocator::new();
        assert!(alloc.put(Vec::new()).is_err());
        assert!(alloc.put(Vec::with_capacity(3)).is_err());
        assert!(alloc.put(Vec::with_capacity(1000)).is_err());
        assert!(alloc.put(Vec::with_capacity(MAX_ALLOC_SIZE * 2)).is_err());

        // Rejected puts leave the pool untouched.
        assert_eq!(alloc.idle(4), 0);
        assert!(alloc.put(Vec::with_capacity(4)).is_ok());
        assert_eq!(alloc.idle(4), 1);
    }

    #[test]
    fn test_reuse_stays_within_class() {
        let alloc = DefaultAllocator::new();
        let buf = alloc.get(1000).unwrap();
        assert_eq!(buf.capacity(), 1024);
        alloc.put(buf).unwrap();
        assert_eq!(alloc.idle(1000), 1);

        let again = alloc.get(600).unwrap();
        assert_eq!(again.len(), 600);
        assert_eq!(again.capacity(), 1024);
        assert!(again.iter().all(|&b| b == 0));
        assert_eq!(alloc.idle(600), 0);
    }

    #[test]
    fn test_full_class_drops_buffer() {
        let alloc = DefaultAllocator::with_max_per_class(1);
        alloc.put(Vec::with_capacity(8)).unwrap();
        alloc.put(Vec::with_capacity(8)).unwrap();
        assert_eq!(alloc.idle(8), 1);
    }

    #[test]
    fn test_concurrent_get_put_never_shares_buffers() {
        let alloc = Arc::new(DefaultAllocator::with_max_per_class(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    for round in 0..500 {
                        let held: Vec<Vec<u8>> =
                            (0..4).map(|_| alloc.get(64).unwrap()).collect();
                        let ptrs: HashSet<usize> =
                            held.iter().map(|b| b.as_ptr() as usize).collect();
                        assert_eq!(ptrs.len(), held.len(), "round {round}");
                        for buf in held {
                            alloc.put(buf).unwrap();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(alloc.idle(64) <= 8);
    }

    #[test]
    fn test_default_allocator_is_shared() {
        let a = default_allocator();
        let b = default_allocator();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
