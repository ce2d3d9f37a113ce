//! Memory allocator trait and allocation tracking
//!
//! Each backend implements [`Allocator`] for its raw memory primitives and
//! wraps it in a [`TrackingAllocator`] so devices can report their footprint.

use crate::error::Result;
use crate::tensor::Storage;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Memory allocator trait for runtime backends
pub trait Allocator: Send + Sync {
    /// Allocate memory of given size in the given (already resolved) storage
    ///
    /// Returns an address that the owning engine understands. Returns
    /// `Err(OutOfMemory)` if the allocation fails.
    fn allocate(&self, byte_size: usize, storage: Storage) -> Result<u64>;

    /// Deallocate memory
    fn deallocate(&self, ptr: u64, byte_size: usize, storage: Storage);

    /// Get the total allocated bytes
    fn allocated_bytes(&self) -> usize {
        0 // Default: tracking not supported
    }
}

/// Allocator wrapper that counts live and peak bytes
#[derive(Debug, Default)]
pub struct TrackingAllocator<A> {
    inner: A,
    allocated: AtomicUsize,
    peak: AtomicUsize,
}

impl<A: Allocator> TrackingAllocator<A> {
    /// Wrap an allocator
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Highest number of bytes live at once
    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Wrapped allocator
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A: Allocator> Allocator for TrackingAllocator<A> {
    fn allocate(&self, byte_size: usize, storage: Storage) -> Result<u64> {
        let ptr = self.inner.allocate(byte_size, storage)?;
        let now = self.allocated.fetch_add(byte_size, Ordering::Relaxed) + byte_size;
        self.peak.fetch_max(now, Ordering::Relaxed);
        Ok(ptr)
    }

    fn deallocate(&self, ptr: u64, byte_size: usize, storage: Storage) {
        self.inner.deallocate(ptr, byte_size, storage);
        self.allocated.fetch_sub(byte_size, Ordering::Relaxed);
    }

    fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}
