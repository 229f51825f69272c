//! Concurrent bitmap with lock-free reads.
//!
//! The delete path sets bits; the search path tests them on every candidate
//! hit, so `test` must not take a lock. Chunks of atomic words materialize
//! on first set; the fixed directory spans the full u32 doc-id space.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

const CHUNK_BITS: u64 = 1 << 20;
const CHUNK_WORDS: usize = (CHUNK_BITS / 64) as usize;
const DIRECTORY_SIZE: usize = ((u32::MAX as u64 + 1) / CHUNK_BITS) as usize;

pub struct ConcurrentBitmap {
    chunks: Vec<OnceLock<Box<[AtomicU64; CHUNK_WORDS]>>>,
}

impl ConcurrentBitmap {
    pub fn new() -> Self {
        let mut chunks = Vec::with_capacity(DIRECTORY_SIZE);
        chunks.resize_with(DIRECTORY_SIZE, OnceLock::new);
        Self { chunks }
    }

    /// Largest bit index the directory can hold.
    pub fn max_bit() -> u64 {
        u32::MAX as u64
    }

    /// Tests a bit without locking; a racing `set` may or may not be seen,
    /// which is fine for a monotone add-only set.
    pub fn test(&self, bit: u64) -> bool {
        if bit > Self::max_bit() {
            return false;
        }
        let chunk = match self.chunks[(bit / CHUNK_BITS) as usize].get() {
            Some(chunk) => chunk,
            None => return false,
        };
        let word = (bit % CHUNK_BITS) / 64;
        chunk[word as usize].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0
    }

    /// Sets a bit, materializing its chunk on first touch. Returns false
    /// when the bit lies outside the addressable range.
    pub fn set(&self, bit: u64) -> bool {
        if bit > Self::max_bit() {
            return false;
        }
        let chunk = self.chunks[(bit / CHUNK_BITS) as usize].get_or_init(|| {
            let words: Vec<AtomicU64> = (0..CHUNK_WORDS).map(|_| AtomicU64::new(0)).collect();
            words.into_boxed_slice().try_into().unwrap()
        });
        let word = (bit % CHUNK_BITS) / 64;
        chunk[word as usize].fetch_or(1 << (bit % 64), Ordering::AcqRel);
        true
    }
}

impl Default for ConcurrentBitmap {
    fn default() -> Self {
        Self::new()
    }
}
