//! Bounded MPMC work queue of reusable batch slots.
//!
//! # Design
//!
//! A fixed ring of slots, each owning a preallocated `NodeId` array. Flushers
//! (producers) copy `(src, count, dst[count])` groups into the slot at the
//! producer cursor; workers (consumers) lease the slot at the consumer cursor
//! and hand it back when done. Slots are reused for the lifetime of the
//! queue: the steady state moves no memory except the destination copies.
//!
//! A slot may pack several groups (`batches_per_slot`), amortizing wakeups
//! when leaf gutters are small. The slot is published to consumers once the
//! group quota is reached, or eagerly via [`WorkQueue::flush_open_slot`]
//! during a terminal flush.
//!
//! # Slot states and locking discipline
//!
//! Each slot carries an atomic state that is the source of truth for
//! ownership:
//!
//! - `CLEAN`: belongs to producers. The payload is only touched while
//!   holding the producer mutex.
//! - `PUBLISHED`: frozen, waiting for a consumer. Slots in this state form
//!   the contiguous ring segment between the consumer and producer cursors.
//! - `LEASED`: owned by exactly one unreleased [`WorkBatch`]. The leased
//!   state (rather than a single dirty bit) is what keeps a consumer cursor
//!   that laps the ring from handing the same slot to two workers when more
//!   worker threads than slots are in flight.
//!
//! Two mutex/condvar pairs: the producer cursor with `not_full`, and the
//! consumer cursor with `not_empty`. A transition that can wake a waiter is
//! performed while holding that waiter's mutex: `CLEAN -> PUBLISHED` under
//! the consumer mutex, `LEASED -> CLEAN` under the producer mutex. A
//! waiter's predicate check therefore cannot interleave with the transition
//! it waits for, which is what makes the condvar handoff lossless. Lock
//! order is producer mutex, then consumer mutex; never the reverse.
//!
//! # Cancellation
//!
//! [`WorkQueue::set_non_block`] flips a flag checked by every wait predicate
//! and wakes all waiters on both condvars. Blocked `push` callers return
//! [`Backpressured`]; blocked `peek` callers return `None`. Spurious wakeups
//! are tolerated by re-checking predicates in a loop.

#[cfg(not(loom))]
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Condvar, Mutex, MutexGuard,
};

#[cfg(loom)]
use loom::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Condvar, Mutex, MutexGuard,
};

use std::cell::UnsafeCell;
use std::fmt;

use crossbeam_utils::CachePadded;

use crate::NodeId;

/// A queue operation could not proceed because non-blocking mode is on and
/// the queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backpressured;

impl fmt::Display for Backpressured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work queue full in non-blocking mode")
    }
}

impl std::error::Error for Backpressured {}

// ============================================================================
// Slots
// ============================================================================

/// Slot owned by producers; payload mutable under the producer mutex.
const CLEAN: u8 = 0;
/// Slot frozen and visible to consumers.
const PUBLISHED: u8 = 1;
/// Slot owned by one unreleased [`WorkBatch`].
const LEASED: u8 = 2;

/// Payload of one slot: a used-word counter plus the group storage.
///
/// Layout of `data[..len]`: repeated `src, count, dst[count]` as raw
/// `NodeId` words. The layout is in-memory only and never persisted.
struct SlotBody {
    len: usize,
    data: Box<[NodeId]>,
}

/// One reusable slot.
///
/// # Invariants
///
/// - `state == CLEAN`: the body is read and written only under the producer
///   mutex.
/// - `state == PUBLISHED`: the body is frozen; nobody touches it until a
///   consumer leases the slot.
/// - `state == LEASED`: the body is read only through the one lease that
///   exists for this slot.
/// - State transitions store `Release` and checks load `Acquire`, so
///   whichever side observes a transition also observes the body accesses
///   that preceded it.
struct Slot {
    state: AtomicU8,
    body: UnsafeCell<SlotBody>,
}

// SAFETY: the state protocol above ensures the body is never accessed
// concurrently: producers touch it only while CLEAN (serialized by the
// producer mutex) and consumers only through the single lease that exists
// while LEASED. The Acquire/Release pairing on `state` orders those
// accesses.
unsafe impl Sync for Slot {}

struct ProducerCursor {
    /// Slot currently being packed (or next to claim).
    head: usize,
    /// Groups packed into the head slot but not yet published.
    open_groups: usize,
}

// ============================================================================
// WorkQueue
// ============================================================================

/// Bounded ring of reusable batch slots shared by flushers and workers.
pub struct WorkQueue {
    slots: Box<[CachePadded<Slot>]>,
    producer: Mutex<ProducerCursor>,
    consumer: Mutex<usize>,
    not_full: Condvar,
    not_empty: Condvar,
    non_block: AtomicBool,
    batches_per_slot: usize,
}

// SAFETY: all shared state is either internally synchronized (mutexes,
// atomics) or covered by the Slot protocol.
unsafe impl Send for WorkQueue {}
unsafe impl Sync for WorkQueue {}

impl WorkQueue {
    /// Creates a queue of `num_slots` slots, each holding `slot_capacity`
    /// `NodeId` words and packing up to `batches_per_slot` groups.
    ///
    /// All slot storage is allocated here; `push`/`peek` never allocate.
    pub fn new(num_slots: usize, slot_capacity: usize, batches_per_slot: usize) -> Self {
        assert!(num_slots > 0, "work queue needs at least one slot");
        assert!(batches_per_slot >= 1);
        assert!(
            slot_capacity >= batches_per_slot * 2,
            "slot too small for its group headers"
        );

        let slots = (0..num_slots)
            .map(|_| {
                CachePadded::new(Slot {
                    state: AtomicU8::new(CLEAN),
                    body: UnsafeCell::new(SlotBody {
                        len: 0,
                        data: vec![0; slot_capacity].into_boxed_slice(),
                    }),
                })
            })
            .collect();

        Self {
            slots,
            producer: Mutex::new(ProducerCursor {
                head: 0,
                open_groups: 0,
            }),
            consumer: Mutex::new(0),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            non_block: AtomicBool::new(false),
            batches_per_slot,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Appends one `(src, dsts)` group, blocking while the queue is full.
    ///
    /// The slot is published to consumers once `batches_per_slot` groups are
    /// packed. Fails only when non-blocking mode is on and no slot can be
    /// claimed.
    ///
    /// # Panics
    /// If the group does not fit the slot; capacities are sized at
    /// construction for the largest legal group, so an overflow means the
    /// caller handed destinations beyond the leaf bound.
    pub fn push(&self, src: NodeId, dsts: &[NodeId]) -> Result<(), Backpressured> {
        let mut cur = lock(&self.producer);

        if cur.open_groups == 0 {
            // Claiming a fresh slot: wait until the ring position has been
            // released by its last lease.
            while self.slots[cur.head].state.load(Ordering::Acquire) != CLEAN {
                if self.non_block.load(Ordering::Relaxed) {
                    return Err(Backpressured);
                }
                cur = wait(&self.not_full, cur);
            }
            // SAFETY: slot is CLEAN and we hold the producer mutex.
            unsafe { (*self.slots[cur.head].body.get()).len = 0 };
        }

        // SAFETY: slot is CLEAN (claimed above or mid-pack) and we hold the
        // producer mutex; no lease can exist.
        let body = unsafe { &mut *self.slots[cur.head].body.get() };
        let need = 2 + dsts.len();
        assert!(
            body.len + need <= body.data.len(),
            "work queue slot overflow: group of {} dsts at offset {}",
            dsts.len(),
            body.len
        );
        body.data[body.len] = src;
        body.data[body.len + 1] = dsts.len() as NodeId;
        body.data[body.len + 2..body.len + need].copy_from_slice(dsts);
        body.len += need;

        cur.open_groups += 1;
        if cur.open_groups >= self.batches_per_slot {
            self.publish(&mut cur);
        }
        Ok(())
    }

    /// Publishes a partially packed slot so no group is stranded.
    ///
    /// No-op when nothing is packed. Called at the end of a terminal flush;
    /// never blocks.
    pub fn flush_open_slot(&self) {
        let mut cur = lock(&self.producer);
        if cur.open_groups > 0 {
            self.publish(&mut cur);
        }
    }

    fn publish(&self, cur: &mut MutexGuard<'_, ProducerCursor>) {
        let idx = cur.head;
        {
            // Holding the consumer mutex across the store closes the window
            // between a consumer's predicate check and its wait.
            let _consumers = lock(&self.consumer);
            self.slots[idx].state.store(PUBLISHED, Ordering::Release);
        }
        self.not_empty.notify_one();
        cur.head = (cur.head + 1) % self.slots.len();
        cur.open_groups = 0;
    }

    /// Leases the next published slot, blocking while the queue is empty.
    ///
    /// Returns `None` only in non-blocking mode with no published slot.
    /// Dropping the returned [`WorkBatch`] releases the slot back to
    /// producers.
    pub fn peek(&self) -> Option<WorkBatch<'_>> {
        let mut tail = lock(&self.consumer);
        loop {
            let idx = *tail;
            if self.slots[idx].state.load(Ordering::Acquire) == PUBLISHED {
                // Mark the lease while still holding the consumer mutex so
                // no other consumer can observe the slot as available.
                self.slots[idx].state.store(LEASED, Ordering::Release);
                *tail = (idx + 1) % self.slots.len();
                return Some(WorkBatch { queue: self, idx });
            }
            if self.non_block.load(Ordering::Relaxed) {
                return None;
            }
            tail = wait(&self.not_empty, tail);
        }
    }

    /// Flips non-blocking mode and wakes every waiter so it observes the
    /// flag.
    ///
    /// Waiters re-check their predicate on wakeup: currently blocked `push`
    /// and `peek` callers return `Backpressured`/`None` rather than
    /// re-sleeping. Turning the flag back off restores fully blocking
    /// behavior with no lost wakeups.
    pub fn set_non_block(&self, on: bool) {
        self.non_block.store(on, Ordering::Relaxed);
        // Lock/unlock both sides: any waiter is now either asleep (and gets
        // the notify below) or will lock after us and observe the flag.
        drop(lock(&self.producer));
        drop(lock(&self.consumer));
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().expect("work queue mutex poisoned")
}

fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).expect("work queue mutex poisoned")
}

// ============================================================================
// WorkBatch
// ============================================================================

/// Exclusive lease on one published slot.
///
/// Exposes the packed groups; dropping the lease marks the slot clean and
/// wakes one blocked producer (the RAII-return pattern used for pooled
/// buffers elsewhere, instead of an explicit release callback).
pub struct WorkBatch<'a> {
    queue: &'a WorkQueue,
    idx: usize,
}

impl WorkBatch<'_> {
    /// Iterates the `(src, destinations)` groups packed into this slot.
    pub fn groups(&self) -> Groups<'_> {
        // SAFETY: the slot is LEASED and this is its only lease; the body
        // was frozen by the publishing producer.
        let body = unsafe { &*self.queue.slots[self.idx].body.get() };
        Groups {
            words: &body.data[..body.len],
            pos: 0,
        }
    }
}

impl Drop for WorkBatch<'_> {
    fn drop(&mut self) {
        {
            let _producers = lock(&self.queue.producer);
            self.queue.slots[self.idx].state.store(CLEAN, Ordering::Release);
        }
        self.queue.not_full.notify_one();
    }
}

/// Iterator over the `(src, count, dst[count])` groups in a slot.
pub struct Groups<'a> {
    words: &'a [NodeId],
    pos: usize,
}

impl<'a> Iterator for Groups<'a> {
    type Item = (NodeId, &'a [NodeId]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.words.len() {
            return None;
        }
        let src = self.words[self.pos];
        let count = self.words[self.pos + 1] as usize;
        let dsts = &self.words[self.pos + 2..self.pos + 2 + count];
        self.pos += 2 + count;
        Some((src, dsts))
    }
}

// ============================================================================
// Tests
// ============================================================================
