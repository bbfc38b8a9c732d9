//! Lock-Free MPMC Ring
//!
//! Bounded circular queue of owned objects, the transport between pipeline
//! stages (RX -> worker, worker -> TX) and the backing store of the buffer
//! pool's free list.
//!
//! # Design
//!
//! - Power-of-two capacity, slot index is `cursor & mask`
//! - Producers and consumers each own a cache-padded head/tail cursor pair
//! - A caller reserves slots by moving its head with compare-and-swap, then
//!   publishes them by moving its tail once every earlier reservation has
//!   been published
//! - Bulk calls reserve all of their slots in one step
//!
//! # Ordering
//!
//! Objects enqueued by the same producer are dequeued in the order that
//! producer enqueued them. Concurrent enqueues from different producers are
//! ordered by whichever reservation wins the head, which is timing
//! dependent: there is no global FIFO across producers.

use crate::error::{DataplaneError, DataplaneResult, Full};
use crossbeam::utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Largest capacity a ring can be created with
pub const MAX_RING_CAPACITY: usize = 1 << 28;

/// Head/tail pair for one side of the ring
struct Cursor {
    /// Next position to reserve
    head: AtomicUsize,
    /// Everything before this position is published
    tail: AtomicUsize,
}

impl Cursor {
    fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    /// All requested slots or none
    Fixed,
    /// As many as possible
    Variable,
}

/// A successful reservation
struct Reservation {
    start: usize,
    count: usize,
    /// Entries left on the other side after this reservation
    left: usize,
}

/// Result of a bulk dequeue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    /// Objects moved into the output vector
    pub count: usize,
    /// Objects still in the ring when the reservation was made (a hint)
    pub remaining: usize,
}

/// Bounded multi-producer/multi-consumer ring
pub struct Ring<T> {
    prod: CachePadded<Cursor>,
    cons: CachePadded<Cursor>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    capacity: usize,
    name: String,
}

// Slots are only touched by the caller holding their reservation.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// Create a ring holding up to `capacity` objects
    ///
    /// `capacity` must be a power of two no larger than [`MAX_RING_CAPACITY`].
    pub fn new(name: impl Into<String>, capacity: usize) -> DataplaneResult<Self> {
        let name = name.into();
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(DataplaneError::Config(format!(
                "ring {} capacity {} is not a power of two",
                name, capacity
            )));
        }
        if capacity > MAX_RING_CAPACITY {
            return Err(DataplaneError::Config(format!(
                "ring {} capacity {} exceeds {}",
                name, capacity, MAX_RING_CAPACITY
            )));
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            prod: CachePadded::new(Cursor::new()),
            cons: CachePadded::new(Cursor::new()),
            slots,
            mask: capacity - 1,
            capacity,
            name,
        })
    }

    /// Ring name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed capacity
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of occupied slots
    ///
    /// Racy under concurrent use; meant for diagnostics and backpressure
    /// heuristics. Never exceeds [`capacity`](Self::capacity).
    #[inline]
    pub fn count(&self) -> usize {
        // consumer tail first: it can only move towards the producer tail
        let cons_tail = self.cons.tail.load(Ordering::Acquire);
        let prod_tail = self.prod.tail.load(Ordering::Acquire);
        prod_tail.wrapping_sub(cons_tail).min(self.capacity)
    }

    /// Snapshot of free slots
    #[inline]
    pub fn free_count(&self) -> usize {
        self.capacity - self.count()
    }

    /// Check if empty (snapshot)
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Check if full (snapshot)
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() == self.capacity
    }

    /// Enqueue one object without blocking
    ///
    /// Hands the object back inside [`Full`] when no slot is free.
    #[inline]
    pub fn enqueue(&self, obj: T) -> Result<(), Full<T>> {
        let Some(res) = self.reserve_prod(1, Behavior::Fixed) else {
            return Err(Full(obj));
        };
        unsafe { self.write(res.start, obj) };
        Self::publish(&self.prod.tail, res.start, res.start.wrapping_add(1));
        Ok(())
    }

    /// Enqueue as many objects as fit, taken from the front of `objs`
    ///
    /// Returns the number enqueued; objects that did not fit stay in `objs`
    /// in their original order. Every enqueued object is visible to
    /// consumers before this returns.
    pub fn enqueue_bulk(&self, objs: &mut Vec<T>) -> usize {
        if objs.is_empty() {
            return 0;
        }
        match self.reserve_prod(objs.len(), Behavior::Variable) {
            Some(res) => {
                self.fill(&res, objs);
                res.count
            }
            None => 0,
        }
    }

    /// Enqueue every object in `objs` or none of them
    ///
    /// On success `objs` is left empty. On `Full` it is untouched.
    pub fn enqueue_exact(&self, objs: &mut Vec<T>) -> DataplaneResult<()> {
        if objs.is_empty() {
            return Ok(());
        }
        let res = self
            .reserve_prod(objs.len(), Behavior::Fixed)
            .ok_or(DataplaneError::Full)?;
        self.fill(&res, objs);
        Ok(())
    }

    /// Dequeue one object, `None` when empty
    #[inline]
    pub fn dequeue(&self) -> Option<T> {
        let res = self.reserve_cons(1, Behavior::Fixed)?;
        let obj = unsafe { self.read(res.start) };
        Self::publish(&self.cons.tail, res.start, res.start.wrapping_add(1));
        Some(obj)
    }

    /// Dequeue up to `max_n` objects, appending them to `out`
    pub fn dequeue_bulk(&self, out: &mut Vec<T>, max_n: usize) -> Dequeued {
        if max_n == 0 {
            return Dequeued { count: 0, remaining: self.count() };
        }
        match self.reserve_cons(max_n, Behavior::Variable) {
            Some(res) => {
                self.drain_into(&res, out);
                Dequeued { count: res.count, remaining: res.left }
            }
            None => Dequeued { count: 0, remaining: 0 },
        }
    }

    /// Dequeue exactly `n` objects into `out`, or nothing with `Empty`
    pub fn dequeue_exact(&self, out: &mut Vec<T>, n: usize) -> DataplaneResult<()> {
        if n == 0 {
            return Ok(());
        }
        let res = self
            .reserve_cons(n, Behavior::Fixed)
            .ok_or(DataplaneError::Empty)?;
        self.drain_into(&res, out);
        Ok(())
    }

    fn fill(&self, res: &Reservation, objs: &mut Vec<T>) {
        for (i, obj) in objs.drain(..res.count).enumerate() {
            unsafe { self.write(res.start.wrapping_add(i), obj) };
        }
        Self::publish(&self.prod.tail, res.start, res.start.wrapping_add(res.count));
    }

    fn drain_into(&self, res: &Reservation, out: &mut Vec<T>) {
        out.reserve(res.count);
        for i in 0..res.count {
            out.push(unsafe { self.read(res.start.wrapping_add(i)) });
        }
        Self::publish(&self.cons.tail, res.start, res.start.wrapping_add(res.count));
    }

    /// Reserve producer slots. `None` when nothing could be reserved.
    fn reserve_prod(&self, n: usize, behavior: Behavior) -> Option<Reservation> {
        let mut old_head = self.prod.head.load(Ordering::Acquire);
        loop {
            let cons_tail = self.cons.tail.load(Ordering::Acquire);
            let used = old_head.wrapping_sub(cons_tail);
            if used > self.capacity {
                // stale head, consumers moved past it
                old_head = self.prod.head.load(Ordering::Acquire);
                continue;
            }
            let free = self.capacity - used;
            let count = match behavior {
                Behavior::Fixed if n > free => return None,
                Behavior::Fixed => n,
                Behavior::Variable => n.min(free),
            };
            if count == 0 {
                return None;
            }

            match self.prod.head.compare_exchange_weak(
                old_head,
                old_head.wrapping_add(count),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Reservation {
                        start: old_head,
                        count,
                        left: free - count,
                    })
                }
                Err(current) => old_head = current,
            }
        }
    }

    /// Reserve consumer slots. `None` when nothing could be reserved.
    fn reserve_cons(&self, n: usize, behavior: Behavior) -> Option<Reservation> {
        let mut old_head = self.cons.head.load(Ordering::Acquire);
        loop {
            let prod_tail = self.prod.tail.load(Ordering::Acquire);
            let entries = prod_tail.wrapping_sub(old_head);
            if entries > self.capacity {
                old_head = self.cons.head.load(Ordering::Acquire);
                continue;
            }
            let count = match behavior {
                Behavior::Fixed if n > entries => return None,
                Behavior::Fixed => n,
                Behavior::Variable => n.min(entries),
            };
            if count == 0 {
                return None;
            }

            match self.cons.head.compare_exchange_weak(
                old_head,
                old_head.wrapping_add(count),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Reservation {
                        start: old_head,
                        count,
                        left: entries - count,
                    })
                }
                Err(current) => old_head = current,
            }
        }
    }

    /// Move `tail` from `old` to `new` once earlier reservations are published
    #[inline]
    fn publish(tail: &AtomicUsize, old: usize, new: usize) {
        let backoff = Backoff::new();
        while tail.load(Ordering::Acquire) != old {
            backoff.snooze();
        }
        tail.store(new, Ordering::Release);
    }

    /// Caller must hold a producer reservation covering `pos`.
    #[inline(always)]
    unsafe fn write(&self, pos: usize, obj: T) {
        (*self.slots[pos & self.mask].get()).write(obj);
    }

    /// Caller must hold a consumer reservation covering `pos`.
    #[inline(always)]
    unsafe fn read(&self, pos: usize) -> T {
        (*self.slots[pos & self.mask].get()).assume_init_read()
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let mut pos = *self.cons.tail.get_mut();
        let end = *self.prod.tail.get_mut();
        while pos != end {
            unsafe { self.slots[pos & self.mask].get_mut().assume_init_drop() };
            pos = pos.wrapping_add(1);
        }
    }
}

impl<T> fmt::Debug for Ring<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_capacity_must_be_power_of_two() {
        assert!(Ring::<u32>::new("r", 0).is_err());
        assert!(Ring::<u32>::new("r", 6).is_err());
        assert!(Ring::<u32>::new("r", MAX_RING_CAPACITY * 2).is_err());
        assert_eq!(Ring::<u32>::new("r", 8).unwrap().capacity(), 8);
    }

    #[test]
    fn test_fifth_enqueue_is_full() {
        let ring = Ring::new("cap4", 4).unwrap();
        for i in 1..=4u32 {
            assert!(ring.enqueue(i).is_ok());
        }
        let rejected = ring.enqueue(5).unwrap_err();
        assert_eq!(rejected.into_inner(), 5);
        assert!(ring.is_full());

        let drained: Vec<u32> = std::iter::from_fn(|| ring.dequeue()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert!(ring.dequeue().is_none());
    }

    #[test]
    fn test_enqueue_bulk_best_effort() {
        let ring = Ring::new("bulk", 8).unwrap();
        ring.enqueue(0u32).unwrap();
        ring.enqueue(1u32).unwrap();

        let mut objs: Vec<u32> = (10..20).collect();
        let n = ring.enqueue_bulk(&mut objs);
        assert_eq!(n, 6);
        assert_eq!(objs, vec![16, 17, 18, 19]);
        assert_eq!(ring.count(), 8);
        assert_eq!(ring.enqueue_bulk(&mut objs), 0);
        assert_eq!(objs.len(), 4);
    }

    #[test]
    fn test_enqueue_exact_all_or_nothing() {
        let ring = Ring::new("exact", 4).unwrap();
        let mut objs = vec![1u32, 2, 3];
        ring.enqueue_exact(&mut objs).unwrap();
        assert!(objs.is_empty());

        let mut more = vec![4u32, 5];
        assert!(matches!(ring.enqueue_exact(&mut more), Err(DataplaneError::Full)));
        assert_eq!(more, vec![4, 5]);
        assert_eq!(ring.count(), 3);
    }

    #[test]
    fn test_dequeue_bulk_reports_remaining() {
        let ring = Ring::new("deq", 16).unwrap();
        let mut objs: Vec<u32> = (0..10).collect();
        ring.enqueue_bulk(&mut objs);

        let mut out = Vec::new();
        let d = ring.dequeue_bulk(&mut out, 4);
        assert_eq!(d, Dequeued { count: 4, remaining: 6 });
        assert_eq!(out, vec![0, 1, 2, 3]);

        let d = ring.dequeue_bulk(&mut out, 32);
        assert_eq!(d, Dequeued { count: 6, remaining: 0 });
        assert_eq!(out.len(), 10);

        let d = ring.dequeue_bulk(&mut out, 32);
        assert_eq!(d.count, 0);
    }

    #[test]
    fn test_dequeue_exact() {
        let ring = Ring::new("deq-exact", 8).unwrap();
        let mut objs = vec![1u32, 2, 3];
        ring.enqueue_bulk(&mut objs);

        let mut out = Vec::new();
        assert!(matches!(ring.dequeue_exact(&mut out, 4), Err(DataplaneError::Empty)));
        assert!(out.is_empty());
        assert_eq!(ring.count(), 3);

        ring.dequeue_exact(&mut out, 3).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn test_wraparound() {
        let ring = Ring::new("wrap", 4).unwrap();
        let mut out = Vec::new();
        for round in 0..1000u32 {
            let mut objs = vec![round * 3, round * 3 + 1, round * 3 + 2];
            assert_eq!(ring.enqueue_bulk(&mut objs), 3);
            out.clear();
            ring.dequeue_bulk(&mut out, 3);
            assert_eq!(out, vec![round * 3, round * 3 + 1, round * 3 + 2]);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_drop_releases_remaining() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        {
            let ring = Ring::new("drop", 8).unwrap();
            for _ in 0..5 {
                assert!(ring.enqueue(Tracked(dropped.clone())).is_ok());
            }
            drop(ring.dequeue());
            assert_eq!(dropped.load(Ordering::Relaxed), 1);
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 5);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(u32),
        EnqueueBulk(u8),
        Dequeue,
        DequeueBulk(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u32>().prop_map(Op::Enqueue),
            (0u8..12).prop_map(Op::EnqueueBulk),
            Just(Op::Dequeue),
            (0u8..12).prop_map(Op::DequeueBulk),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_bounded_queue_model(
            cap_shift in 0u32..5,
            ops in proptest::collection::vec(op_strategy(), 0..200),
        ) {
            let capacity = 1usize << cap_shift;
            let ring = Ring::new("model", capacity).unwrap();
            let mut model: VecDeque<u32> = VecDeque::new();
            let mut next = 0u32;
            let mut enqueued = 0usize;
            let mut dequeued = 0usize;

            for op in ops {
                match op {
                    Op::Enqueue(v) => {
                        let fits = model.len() < capacity;
                        prop_assert_eq!(ring.enqueue(v).is_ok(), fits);
                        if fits {
                            model.push_back(v);
                            enqueued += 1;
                        }
                    }
                    Op::EnqueueBulk(n) => {
                        let mut objs: Vec<u32> = (0..n as u32).map(|i| next + i).collect();
                        next += n as u32;
                        let expected = (n as usize).min(capacity - model.len());
                        let before = objs.clone();
                        prop_assert_eq!(ring.enqueue_bulk(&mut objs), expected);
                        model.extend(before[..expected].iter().copied());
                        prop_assert_eq!(&objs[..], &before[expected..]);
                        enqueued += expected;
                    }
                    Op::Dequeue => {
                        let got = ring.dequeue();
                        prop_assert_eq!(got, model.pop_front());
                        if got.is_some() {
                            dequeued += 1;
                        }
                    }
                    Op::DequeueBulk(n) => {
                        let mut out = Vec::new();
                        let d = ring.dequeue_bulk(&mut out, n as usize);
                        let expected: Vec<u32> = (0..d.count).filter_map(|_| model.pop_front()).collect();
                        prop_assert_eq!(out, expected);
                        prop_assert_eq!(d.count, (n as usize).min(d.count + d.remaining));
                        dequeued += d.count;
                    }
                }
                prop_assert!(ring.count() <= capacity);
                prop_assert_eq!(ring.count(), model.len());
                prop_assert_eq!(enqueued - dequeued, ring.count());
            }
        }
    }
}
