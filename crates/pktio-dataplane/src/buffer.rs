//! Zero-Copy Buffer Pool
//!
//! Pre-allocated, reference-counted packet buffers.
//!
//! # Design
//!
//! - One memory region per pool, carved into fixed data rooms
//! - Free list is a lock-free [`Ring`] of slot indices
//! - Bulk allocation is one all-or-nothing reservation on that ring
//! - [`Mbuf`] is a move-only owning handle; dropping the last handle
//!   returns the storage to the pool
//! - Mutation needs an exclusive handle (reference count of one)

use crate::config::PoolConfig;
use crate::error::{DataplaneError, DataplaneResult};
use crate::memory::{HeapAllocator, MemoryRegion, RegionAllocator};
use crate::ring::Ring;
use crate::CACHE_LINE;
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default data room per buffer
pub const DEFAULT_DATA_ROOM: usize = 2048;

/// Default headroom reserved for encapsulation
pub const DEFAULT_HEADROOM: usize = 128;

/// Port value of a buffer that did not come from a device
pub const NO_PORT: u16 = u16::MAX;

/// Per-packet metadata
#[derive(Debug, Clone, Copy)]
struct PacketMeta {
    data_off: u16,
    data_len: u16,
    port: u16,
    timestamp: u64,
}

#[repr(C, align(64))]
struct Slot {
    refcount: AtomicU32,
    generation: AtomicU32,
    meta: UnsafeCell<PacketMeta>,
}

struct PoolInner {
    name: String,
    region: MemoryRegion,
    slots: Box<[Slot]>,
    free: Ring<u32>,
    stride: usize,
    data_room: u16,
    headroom: u16,
    in_use: CachePadded<AtomicUsize>,
}

// Slot metadata is written only through an exclusive handle or while the
// slot sits on the free list.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl PoolInner {
    #[inline]
    fn slot(&self, index: u32) -> &Slot {
        &self.slots[index as usize]
    }

    /// Hand out a slot taken off the free list
    #[inline]
    fn claim(self: &Arc<Self>, index: u32) -> Mbuf {
        let slot = self.slot(index);
        slot.refcount.store(1, Ordering::Release);
        unsafe {
            *slot.meta.get() = PacketMeta {
                data_off: self.headroom,
                data_len: 0,
                port: NO_PORT,
                timestamp: 0,
            };
        }
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Mbuf { pool: Arc::clone(self), index }
    }

    /// Drop one reference; true when it was the last one
    #[inline]
    fn unref(&self, index: u32) -> bool {
        let prev = self.slot(index).refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "refcount underflow on buffer {}", index);
        prev == 1
    }

    /// Invalidate outstanding raw handles and account the slot as free
    #[inline]
    fn retire(&self, index: u32) {
        self.slot(index).generation.fetch_add(1, Ordering::Release);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    fn release(&self, index: u32) {
        if self.unref(index) {
            self.retire(index);
            if self.free.enqueue(index).is_err() {
                // free ring holds every slot, so this is a pool bug
                tracing::error!(pool = %self.name, index, "free list overflow");
            }
        }
    }

    #[inline]
    fn data_ptr(&self, index: u32) -> *mut u8 {
        unsafe { self.region.as_ptr().add(index as usize * self.stride) }
    }
}

/// Raw buffer handle for foreign-function layers
///
/// Carries one reference. Obtained from [`Mbuf::into_raw`], given back with
/// [`BufferPool::from_raw`] or [`BufferPool::free_raw`].
#[repr(C)]
#[derive(Debug, PartialEq, Eq)]
pub struct RawMbuf {
    /// Slot index in the pool
    pub index: u32,
    /// Slot generation when the handle was made
    pub generation: u32,
}

/// Owned handle to one packet buffer
pub struct Mbuf {
    pool: Arc<PoolInner>,
    index: u32,
}

impl Mbuf {
    #[inline(always)]
    fn slot(&self) -> &Slot {
        self.pool.slot(self.index)
    }

    #[inline(always)]
    fn meta(&self) -> PacketMeta {
        unsafe { *self.slot().meta.get() }
    }

    #[inline(always)]
    fn meta_mut(&mut self) -> Option<&mut PacketMeta> {
        if !self.is_exclusive() {
            return None;
        }
        Some(unsafe { &mut *self.slot().meta.get() })
    }

    /// Index in pool
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Get reference count
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.slot().refcount.load(Ordering::Acquire)
    }

    /// Whether this is the only handle to the buffer
    #[inline]
    pub fn is_exclusive(&self) -> bool {
        self.refcount() == 1
    }

    /// Get packet data slice
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        let meta = self.meta();
        unsafe {
            std::slice::from_raw_parts(
                self.pool.data_ptr(self.index).add(meta.data_off as usize),
                meta.data_len as usize,
            )
        }
    }

    /// Get mutable packet data, `None` while shared
    #[inline(always)]
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let meta = *self.meta_mut()?;
        Some(unsafe { self.bytes_mut(meta.data_off as usize, meta.data_len as usize) })
    }

    /// Caller must hold the buffer exclusively and stay inside the data room.
    #[inline(always)]
    unsafe fn bytes_mut(&mut self, start: usize, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.pool.data_ptr(self.index).add(start), len)
    }

    /// Get data length
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.meta().data_len as usize
    }

    /// Check if empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.meta().data_len == 0
    }

    /// Get headroom
    #[inline(always)]
    pub fn headroom(&self) -> usize {
        self.meta().data_off as usize
    }

    /// Get tailroom
    #[inline(always)]
    pub fn tailroom(&self) -> usize {
        let meta = self.meta();
        self.pool.data_room as usize - meta.data_off as usize - meta.data_len as usize
    }

    /// Total data room of the buffer
    #[inline]
    pub fn data_room(&self) -> usize {
        self.pool.data_room as usize
    }

    /// Prepend data (adjust headroom)
    #[inline]
    pub fn prepend(&mut self, len: usize) -> Option<&mut [u8]> {
        let meta = self.meta_mut()?;
        let len16 = u16::try_from(len).ok()?;
        if meta.data_off < len16 {
            return None;
        }
        meta.data_off -= len16;
        meta.data_len += len16;
        let start = meta.data_off as usize;
        Some(unsafe { self.bytes_mut(start, len) })
    }

    /// Append data (use tailroom)
    #[inline]
    pub fn append(&mut self, len: usize) -> Option<&mut [u8]> {
        if self.tailroom() < len {
            return None;
        }
        let meta = self.meta_mut()?;
        let start = meta.data_off as usize + meta.data_len as usize;
        meta.data_len += len as u16;
        Some(unsafe { self.bytes_mut(start, len) })
    }

    /// Pull data (remove from head)
    #[inline]
    pub fn pull(&mut self, len: usize) -> Option<&[u8]> {
        let meta = self.meta_mut()?;
        let len16 = u16::try_from(len).ok()?;
        if meta.data_len < len16 {
            return None;
        }
        let start = meta.data_off as usize;
        meta.data_off += len16;
        meta.data_len -= len16;
        Some(unsafe { self.bytes_mut(start, len) })
    }

    /// Trim data (remove from tail)
    #[inline]
    pub fn trim(&mut self, len: usize) -> bool {
        match self.meta_mut() {
            Some(meta) if meta.data_len as usize >= len => {
                meta.data_len -= len as u16;
                true
            }
            _ => false,
        }
    }

    /// Reset length, headroom and port
    #[inline]
    pub fn reset(&mut self) -> bool {
        let headroom = self.pool.headroom;
        match self.meta_mut() {
            Some(meta) => {
                meta.data_off = headroom;
                meta.data_len = 0;
                meta.port = NO_PORT;
                meta.timestamp = 0;
                true
            }
            None => false,
        }
    }

    /// Replace the packet contents with `bytes`
    pub fn copy_from_slice(&mut self, bytes: &[u8]) -> bool {
        if !self.reset() {
            return false;
        }
        match self.append(bytes.len()) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Input port, [`NO_PORT`] when not received from a device
    #[inline]
    pub fn port(&self) -> u16 {
        self.meta().port
    }

    /// Set input port
    #[inline]
    pub fn set_port(&mut self, port: u16) -> bool {
        match self.meta_mut() {
            Some(meta) => {
                meta.port = port;
                true
            }
            None => false,
        }
    }

    /// Receive timestamp in clock cycles
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.meta().timestamp
    }

    /// Set receive timestamp
    #[inline]
    pub fn set_timestamp(&mut self, cycles: u64) -> bool {
        match self.meta_mut() {
            Some(meta) => {
                meta.timestamp = cycles;
                true
            }
            None => false,
        }
    }

    /// Clone buffer (shallow - shares storage and refcount)
    pub fn clone_ref(&self) -> Mbuf {
        self.slot().refcount.fetch_add(1, Ordering::Relaxed);
        Mbuf { pool: Arc::clone(&self.pool), index: self.index }
    }

    /// Give up the handle, keeping its reference alive
    pub fn into_raw(self) -> RawMbuf {
        let generation = self.slot().generation.load(Ordering::Acquire);
        let (_, index) = self.into_parts();
        RawMbuf { index, generation }
    }

    fn into_parts(self) -> (Arc<PoolInner>, u32) {
        let this = ManuallyDrop::new(self);
        let pool = unsafe { std::ptr::read(&this.pool) };
        (pool, this.index)
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("index", &self.index)
            .field("len", &self.len())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Buffer pool (pre-allocated, lock-free)
///
/// Cheap to clone; clones share the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool backed by the heap
    pub fn new(name: impl Into<String>, config: &PoolConfig) -> DataplaneResult<Self> {
        Self::with_allocator(name, config, &HeapAllocator)
    }

    /// Create a pool whose buffers live in a region from `allocator`
    pub fn with_allocator(
        name: impl Into<String>,
        config: &PoolConfig,
        allocator: &dyn RegionAllocator,
    ) -> DataplaneResult<Self> {
        let name = name.into();
        config.validate()?;

        let capacity = config.capacity;
        let stride = (config.data_room + CACHE_LINE - 1) & !(CACHE_LINE - 1);
        let region = allocator.reserve_region(capacity * stride, config.numa_node)?;

        let slots = (0..capacity)
            .map(|_| Slot {
                refcount: AtomicU32::new(0),
                generation: AtomicU32::new(0),
                meta: UnsafeCell::new(PacketMeta {
                    data_off: config.headroom as u16,
                    data_len: 0,
                    port: NO_PORT,
                    timestamp: 0,
                }),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let free = Ring::new(format!("{}-free", name), capacity.next_power_of_two())?;
        let mut indices: Vec<u32> = (0..capacity as u32).collect();
        free.enqueue_exact(&mut indices)?;

        tracing::info!(
            pool = %name,
            capacity,
            data_room = config.data_room,
            numa_node = ?config.numa_node,
            "buffer pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                region,
                slots,
                free,
                stride,
                data_room: config.data_room as u16,
                headroom: config.headroom as u16,
                in_use: CachePadded::new(AtomicUsize::new(0)),
            }),
        })
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Allocate buffer from pool
    #[inline]
    pub fn alloc(&self) -> DataplaneResult<Mbuf> {
        let index = self.inner.free.dequeue().ok_or(DataplaneError::PoolExhausted)?;
        Ok(self.inner.claim(index))
    }

    /// Allocate exactly `n` buffers, or none with `PoolExhausted`
    pub fn alloc_bulk(&self, n: usize) -> DataplaneResult<Vec<Mbuf>> {
        if n > self.capacity() {
            return Err(DataplaneError::PoolExhausted);
        }
        let mut indices = Vec::with_capacity(n);
        self.inner
            .free
            .dequeue_exact(&mut indices, n)
            .map_err(|_| DataplaneError::PoolExhausted)?;
        Ok(indices.into_iter().map(|i| self.inner.claim(i)).collect())
    }

    /// Release one reference to `mbuf`
    ///
    /// A buffer from another pool is still released to its own pool, but
    /// reported as `InvalidHandle`.
    pub fn free(&self, mbuf: Mbuf) -> DataplaneResult<()> {
        if !Arc::ptr_eq(&mbuf.pool, &self.inner) {
            let index = mbuf.index;
            drop(mbuf);
            return Err(DataplaneError::invalid(index, "buffer belongs to another pool"));
        }
        drop(mbuf);
        Ok(())
    }

    /// Release a batch of buffers with one free-list enqueue
    pub fn free_bulk(&self, mbufs: Vec<Mbuf>) -> DataplaneResult<()> {
        let mut recycled = Vec::with_capacity(mbufs.len());
        let mut foreign = None;

        for mbuf in mbufs {
            if !Arc::ptr_eq(&mbuf.pool, &self.inner) {
                foreign.get_or_insert(mbuf.index);
                drop(mbuf);
                continue;
            }
            let (_, index) = mbuf.into_parts();
            if self.inner.unref(index) {
                self.inner.retire(index);
                recycled.push(index);
            }
        }

        if let Err(e) = self.inner.free.enqueue_exact(&mut recycled) {
            tracing::error!(pool = %self.inner.name, error = %e, "free list overflow");
        }

        match foreign {
            Some(index) => Err(DataplaneError::invalid(index, "buffer belongs to another pool")),
            None => Ok(()),
        }
    }

    /// Turn a raw handle back into an owned buffer
    ///
    /// # Safety
    ///
    /// `raw` must come from [`Mbuf::into_raw`] on this pool and must not
    /// have been reclaimed or freed already. Stale generations and freed
    /// slots are detected; a duplicated handle to a live buffer is not.
    pub unsafe fn from_raw(&self, raw: RawMbuf) -> DataplaneResult<Mbuf> {
        self.check_raw(&raw)?;
        Ok(Mbuf { pool: Arc::clone(&self.inner), index: raw.index })
    }

    /// Release the reference carried by a raw handle
    ///
    /// Freeing a slot that is already free, or whose generation moved on,
    /// fails with `InvalidHandle` and leaves the free list untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`from_raw`](Self::from_raw).
    pub unsafe fn free_raw(&self, raw: RawMbuf) -> DataplaneResult<()> {
        self.check_raw(&raw)?;
        let slot = self.inner.slot(raw.index);

        let mut current = slot.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(DataplaneError::invalid(raw.index, "double free"));
            }
            match slot.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current == 1 {
            self.inner.retire(raw.index);
            if self.inner.free.enqueue(raw.index).is_err() {
                tracing::error!(pool = %self.inner.name, index = raw.index, "free list overflow");
            }
        }
        Ok(())
    }

    fn check_raw(&self, raw: &RawMbuf) -> DataplaneResult<()> {
        if raw.index as usize >= self.inner.slots.len() {
            return Err(DataplaneError::invalid(raw.index, "index out of range"));
        }
        let slot = self.inner.slot(raw.index);
        if slot.generation.load(Ordering::Acquire) != raw.generation {
            return Err(DataplaneError::invalid(raw.index, "stale handle"));
        }
        if slot.refcount.load(Ordering::Acquire) == 0 {
            return Err(DataplaneError::invalid(raw.index, "double free"));
        }
        Ok(())
    }

    /// Free buffers (snapshot)
    pub fn available(&self) -> usize {
        self.inner.free.count()
    }

    /// Buffers held outside the pool (snapshot)
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Relaxed)
    }

    /// Get pool size
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Data room of each buffer
    pub fn data_room(&self) -> usize {
        self.inner.data_room as usize
    }

    /// Whether `mbuf` was allocated from this pool
    pub fn owns(&self, mbuf: &Mbuf) -> bool {
        Arc::ptr_eq(&mbuf.pool, &self.inner)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("name", &self.inner.name)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("in_use", &self.in_use())
            .finish()
    }
}
