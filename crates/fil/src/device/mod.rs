//! Emulated SIMT device.
//!
//! Kernels are written against a GPU-shaped execution model: a grid of thread
//! blocks, each block running a fixed number of logical threads and owning a
//! byte-budgeted shared-memory scratch area. The [`Device`] executes blocks on
//! the rayon pool and reports the same limits a physical accelerator would, so
//! the plan builder's shared-memory arithmetic is exercised for real.
//!
//! - [`DeviceProperties`]: platform limits consumed by the plan builder
//! - [`DeviceBuffer`]: accounted device allocation with explicit release
//! - [`Stream`]: FIFO work queue with an explicit synchronization point

mod memory;
mod stream;

pub use memory::DeviceBuffer;
pub use stream::{PendingPrediction, Stream};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use memory::MemoryTracker;

use crate::Parallelism;

/// Lanes per warp on the emulated device.
pub const WARP_SIZE: usize = 32;

/// Default opt-in shared memory per block (48 KiB).
pub const DEFAULT_SHARED_MEM_OPTIN: usize = 48 * 1024;

/// Hardware limits reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Maximum shared memory a block may opt into, in bytes.
    pub max_shared_mem_per_block_optin: usize,
    /// Number of streaming multiprocessors.
    pub sm_count: usize,
    /// Lanes per warp.
    pub warp_size: usize,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            max_shared_mem_per_block_optin: DEFAULT_SHARED_MEM_OPTIN,
            sm_count: 8,
            warp_size: WARP_SIZE,
        }
    }
}

impl DeviceProperties {
    /// Properties for the host: one SM per rayon worker.
    pub fn host() -> Self {
        Self {
            sm_count: rayon::current_num_threads().max(1),
            ..Self::default()
        }
    }

    /// Override the shared memory limit.
    pub fn with_shared_mem_optin(mut self, bytes: usize) -> Self {
        self.max_shared_mem_per_block_optin = bytes;
        self
    }

    /// Override the SM count.
    pub fn with_sm_count(mut self, sm_count: usize) -> Self {
        self.sm_count = sm_count.max(1);
        self
    }
}

#[derive(Debug)]
struct DeviceInner {
    properties: DeviceProperties,
    parallelism: Parallelism,
    memory: Arc<MemoryTracker>,
    launches: AtomicU64,
}

/// Handle to an emulated device.
///
/// Cheap to clone; clones share memory accounting and launch counters.
#[derive(Debug, Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Create a device with the given properties, running blocks in parallel.
    pub fn new(properties: DeviceProperties) -> Self {
        Self::with_parallelism(properties, Parallelism::Parallel)
    }

    /// Create a device with an explicit block scheduling mode.
    pub fn with_parallelism(properties: DeviceProperties, parallelism: Parallelism) -> Self {
        tracing::debug!(?properties, ?parallelism, "creating device");
        Self {
            inner: Arc::new(DeviceInner {
                properties,
                parallelism,
                memory: Arc::new(MemoryTracker::default()),
                launches: AtomicU64::new(0),
            }),
        }
    }

    /// Device backed by the host rayon pool.
    pub fn host() -> Self {
        Self::new(DeviceProperties::host())
    }

    #[inline]
    pub fn properties(&self) -> &DeviceProperties {
        &self.inner.properties
    }

    #[inline]
    pub fn parallelism(&self) -> Parallelism {
        self.inner.parallelism
    }

    /// Copy host data into a new device allocation.
    pub fn alloc<T: Copy + Send + Sync>(&self, data: Vec<T>) -> DeviceBuffer<T> {
        DeviceBuffer::new(data, Arc::clone(&self.inner.memory))
    }

    /// Bytes currently held by live device buffers.
    pub fn allocated_bytes(&self) -> usize {
        self.inner.memory.allocated()
    }

    /// Number of kernel launches issued on this device.
    pub fn launch_count(&self) -> u64 {
        self.inner.launches.load(Ordering::Relaxed)
    }

    /// Whether both handles refer to the same device.
    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn record_launch(&self) {
        self.inner.launches.fetch_add(1, Ordering::Relaxed);
    }

    /// Create a new stream bound to this device.
    pub fn create_stream(&self) -> crate::Result<Stream> {
        Stream::new(self.clone())
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new(DeviceProperties::default())
    }
}
