//! Device memory accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub(crate) struct MemoryTracker {
    allocated: AtomicUsize,
}

impl MemoryTracker {
    fn reserve(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    fn free(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// A device-resident array.
///
/// Not `Clone`: device arrays are never implicitly copied. The owner frees the
/// allocation with [`release`](Self::release); dropping the buffer frees it as
/// well so that early returns during construction cannot leak.
#[derive(Debug)]
pub struct DeviceBuffer<T> {
    data: Box<[T]>,
    tracker: Arc<MemoryTracker>,
}

impl<T> DeviceBuffer<T> {
    pub(crate) fn new(data: Vec<T>, tracker: Arc<MemoryTracker>) -> Self {
        let data = data.into_boxed_slice();
        tracker.reserve(std::mem::size_of_val(&*data));
        Self { data, tracker }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the allocation in bytes.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of_val(&*self.data)
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Free the allocation, returning the number of bytes released.
    pub fn release(self) -> usize {
        self.size_bytes()
    }
}

impl<T> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.tracker.free(self.size_bytes());
    }
}
