//! Memory regions backing buffer pools
//!
//! A pool asks a [`RegionAllocator`] for one contiguous region at
//! construction time and carves its packet data rooms out of it.

use crate::error::{DataplaneError, DataplaneResult};
use crate::CACHE_LINE;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Source of large, long-lived memory regions (hugepages, NUMA-local memory)
pub trait RegionAllocator: Send + Sync {
    /// Reserve `size` bytes, preferably on `numa_node`
    fn reserve_region(&self, size: usize, numa_node: Option<u32>) -> DataplaneResult<MemoryRegion>;
}

/// Owned, cache-line aligned memory region
pub struct MemoryRegion {
    ptr: NonNull<u8>,
    layout: Layout,
    numa_node: Option<u32>,
}

// Region is a plain byte allocation; access is coordinated by its owner.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Region size in bytes
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// NUMA node the region was requested on
    pub fn numa_node(&self) -> Option<u32> {
        self.numa_node
    }

    /// Base pointer
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Allocator backed by the global heap
///
/// The NUMA node is recorded but not enforced.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl RegionAllocator for HeapAllocator {
    fn reserve_region(&self, size: usize, numa_node: Option<u32>) -> DataplaneResult<MemoryRegion> {
        if size == 0 {
            return Err(DataplaneError::Config("cannot reserve an empty region".into()));
        }
        let layout = Layout::from_size_align(size, CACHE_LINE)
            .map_err(|e| DataplaneError::Config(format!("bad region layout: {}", e)))?;

        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(DataplaneError::PoolExhausted)?;

        tracing::debug!(size, ?numa_node, "reserved memory region");
        Ok(MemoryRegion { ptr, layout, numa_node })
    }
}
