//! The guttering system: shared tiers, flush orchestration, public API.
//!
//! # Ownership
//!
//! Every mutex owns exactly the data it protects:
//!
//! - The shared L3 tier is an array of *shards*, one per L2 bucket. A shard
//!   holds the child L3 gutters for that bucket's source range and, when the
//!   RAM tier is absent, the leaf gutters for that range. The producer
//!   draining an L2 bucket takes its shard lock; different shards drain
//!   concurrently, the same shard never does.
//! - Each RAM-tier bucket is a shard of its own: a pending `(src, dst)`
//!   buffer plus the leaf gutters for its (strictly smaller) source range.
//!   Lock order is always L3 shard, then RAM shard; a RAM bucket's range
//!   lies inside a single L3 shard's range, so its mutex is uncontended in
//!   steady state.
//! - Thread-local L1/L2 state sits behind one mutex per inserter index. Each
//!   index is used by exactly one producer thread, so the lock is
//!   uncontended; it exists so `force_flush` helpers can drain all locals.
//!
//! Leaf gutters living *inside* the lock that routes to them turns the
//! "leaves are protected transitively" rule into a structural property
//! instead of a convention.
//!
//! All buffers are allocated at construction; the steady-state insert path
//! performs no heap allocation.

use std::sync::{Mutex, MutexGuard};
use std::thread;

use crossbeam_utils::CachePadded;

use crate::config::GutterConfig;
use crate::gutter::{CacheGutter, LeafGutter, L3_GUTTER_ELMS, NUM_L3_BUFS, RAM_BYTES_PER_CHILD};
use crate::inserter::InserterState;
use crate::router::Router;
use crate::work_queue::{Backpressured, WorkBatch, WorkQueue};
use crate::{NodeId, Update};

// ============================================================================
// Leaf storage
// ============================================================================

/// Leaf gutters for one contiguous source range, owned by the shard whose
/// lock routes to them.
pub(crate) struct LeafSlab {
    base: NodeId,
    leaves: Box<[LeafGutter]>,
}

impl LeafSlab {
    fn new(base: NodeId, count: usize, leaf_capacity: usize) -> Self {
        Self {
            base,
            leaves: (0..count)
                .map(|_| LeafGutter::with_capacity(leaf_capacity))
                .collect(),
        }
    }

    #[inline]
    fn leaf_mut(&mut self, src: NodeId) -> &mut LeafGutter {
        debug_assert!(src >= self.base);
        &mut self.leaves[(src - self.base) as usize]
    }
}

// ============================================================================
// Shared tiers
// ============================================================================

/// One L2 bucket's slice of the shared L3 tier.
pub(crate) struct L3Shard {
    gutters: Box<[CacheGutter]>,
    /// Present iff the system runs without a RAM tier.
    leaves: Option<LeafSlab>,
}

impl L3Shard {
    #[inline]
    pub(crate) fn gutter_mut(&mut self, child: usize) -> &mut CacheGutter {
        &mut self.gutters[child]
    }
}

/// One RAM-tier bucket: buffered updates plus the leaves they fan out to.
struct RamShard {
    pending: Vec<Update>,
    capacity: usize,
    leaves: LeafSlab,
}

struct RamTier {
    shards: Box<[CachePadded<Mutex<RamShard>>]>,
}

/// Everything shared between inserter threads: routing, the L3/RAM tiers,
/// the leaves, and the work queue. Borrowed by [`InserterState`] for the
/// duration of each drain.
pub(crate) struct SharedTier {
    router: Router,
    num_nodes: NodeId,
    leaf_capacity: usize,
    shards: Box<[CachePadded<Mutex<L3Shard>>]>,
    ram: Option<RamTier>,
    wq: WorkQueue,
}

impl SharedTier {
    #[inline]
    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    pub(crate) fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub(crate) fn lock_shard(&self, idx: usize) -> MutexGuard<'_, L3Shard> {
        self.shards[idx].lock().expect("L3 shard mutex poisoned")
    }

    /// Drains one full (or terminal) L3 gutter into the leaves, or into the
    /// RAM tier when present. Called with the owning shard lock held.
    ///
    /// On backpressure the consumed prefix is discarded from the gutter and
    /// the remainder retained, so a retry replays nothing.
    pub(crate) fn drain_l3_gutter(
        &self,
        shard: &mut L3Shard,
        child: usize,
    ) -> Result<(), Backpressured> {
        let n = shard.gutters[child].len();

        if let Some(ram) = &self.ram {
            for i in 0..n {
                let upd = shard.gutters[child].get(i);
                let ridx = self.router.ram_bucket(upd.src);
                let mut rs = ram.shards[ridx].lock().expect("RAM shard mutex poisoned");
                rs.pending.push(upd);
                if rs.pending.len() >= rs.capacity {
                    if let Err(err) = self.drain_ram_shard(&mut rs) {
                        drop(rs);
                        shard.gutters[child].drop_front(i + 1);
                        return Err(err);
                    }
                }
            }
        } else {
            for i in 0..n {
                let upd = shard.gutters[child].get(i);
                let slab = shard
                    .leaves
                    .as_mut()
                    .expect("leaf slab present without RAM tier");
                let leaf = slab.leaf_mut(upd.src);
                leaf.push(upd.dst);
                if leaf.len() >= self.leaf_capacity {
                    if let Err(err) = self.wq.push(upd.src, leaf.as_slice()) {
                        shard.gutters[child].drop_front(i + 1);
                        return Err(err);
                    }
                    leaf.clear();
                }
            }
        }

        shard.gutters[child].clear();
        Ok(())
    }

    /// Drains one RAM bucket's pending updates into its leaves. Called with
    /// the RAM shard lock held.
    fn drain_ram_shard(&self, shard: &mut RamShard) -> Result<(), Backpressured> {
        let n = shard.pending.len();
        for i in 0..n {
            let upd = shard.pending[i];
            let leaf = shard.leaves.leaf_mut(upd.src);
            leaf.push(upd.dst);
            if leaf.len() >= self.leaf_capacity {
                if let Err(err) = self.wq.push(upd.src, leaf.as_slice()) {
                    shard.pending.drain(..=i);
                    return Err(err);
                }
                leaf.clear();
            }
        }
        shard.pending.clear();
        Ok(())
    }

    /// Drains every gutter of one shard. Terminal-flush helper.
    pub(crate) fn flush_shard(&self, idx: usize) -> Result<(), Backpressured> {
        let mut shard = self.lock_shard(idx);
        for child in 0..shard.gutters.len() {
            if !shard.gutters[child].is_empty() {
                self.drain_l3_gutter(&mut shard, child)?;
            }
        }
        Ok(())
    }

    /// Drains every RAM bucket. No-op without a RAM tier.
    fn flush_ram_tier(&self) -> Result<(), Backpressured> {
        if let Some(ram) = &self.ram {
            for shard in ram.shards.iter() {
                let mut rs = shard.lock().expect("RAM shard mutex poisoned");
                if !rs.pending.is_empty() {
                    self.drain_ram_shard(&mut rs)?;
                }
            }
        }
        Ok(())
    }

    /// Ships every non-empty leaf as one work-queue group.
    fn flush_leaves(&self) -> Result<(), Backpressured> {
        if let Some(ram) = &self.ram {
            for shard in ram.shards.iter() {
                let mut rs = shard.lock().expect("RAM shard mutex poisoned");
                self.sweep_slab(&mut rs.leaves)?;
            }
        } else {
            for idx in 0..self.shards.len() {
                let mut shard = self.lock_shard(idx);
                let slab = shard
                    .leaves
                    .as_mut()
                    .expect("leaf slab present without RAM tier");
                self.sweep_slab(slab)?;
            }
        }
        Ok(())
    }

    fn sweep_slab(&self, slab: &mut LeafSlab) -> Result<(), Backpressured> {
        for (i, leaf) in slab.leaves.iter_mut().enumerate() {
            if !leaf.is_empty() {
                assert!(leaf.len() <= self.leaf_capacity);
                self.wq.push(slab.base + i as NodeId, leaf.as_slice())?;
                leaf.clear();
            }
        }
        Ok(())
    }
}

// ============================================================================
// GutteringSystem
// ============================================================================

/// Buffers a stream of edge updates into per-source batches on a bounded
/// work queue.
///
/// Producers call [`insert_from`](Self::insert_from) with a stable thread
/// index; workers loop on [`get_data`](Self::get_data). Shutdown sequence:
/// quiesce producers, [`force_flush`](Self::force_flush),
/// [`set_non_block`](Self::set_non_block)`(true)`, join workers.
pub struct GutteringSystem {
    shared: SharedTier,
    inserters: Box<[Mutex<InserterState>]>,
    slot_capacity: usize,
}

impl GutteringSystem {
    /// Builds a system for `num_nodes` vertices, `workers` consumer threads
    /// and `inserters` producer threads.
    ///
    /// Allocates every buffer the system will ever use: thread-local
    /// gutters, the shared tiers, one leaf gutter per vertex (each reserving
    /// `gutter_bytes`), and `workers * queue_factor` work-queue slots.
    pub fn new(num_nodes: NodeId, workers: usize, inserters: usize, conf: GutterConfig) -> Self {
        assert!(num_nodes >= 1, "need at least one vertex");
        assert!(workers >= 1, "need at least one worker");
        assert!(inserters >= 1, "need at least one inserter");

        let leaf_capacity = (conf.gutter_bytes / std::mem::size_of::<NodeId>()).max(1);
        let max_ram_buckets = NUM_L3_BUFS as u64 * u64::from(conf.fanout);
        let router = Router::new(num_nodes, max_ram_buckets);
        let ram_active = u64::from(num_nodes) > max_ram_buckets;

        // Shared L3 tier: one shard per reachable L2 bucket, each owning the
        // child gutters (and the leaves, when no RAM tier) of its range.
        let children_per_shard = 1usize << router.shard_child_bits();
        let shards: Box<[_]> = (0..router.l2_buckets())
            .map(|idx| {
                let gutters = (0..children_per_shard)
                    .map(|_| CacheGutter::with_capacity(L3_GUTTER_ELMS))
                    .collect();
                let leaves = if ram_active {
                    None
                } else {
                    let (base, count) = slab_range(idx, router.l2_pos(), num_nodes);
                    Some(LeafSlab::new(base, count, leaf_capacity))
                };
                CachePadded::new(Mutex::new(L3Shard { gutters, leaves }))
            })
            .collect();

        let ram = ram_active.then(|| {
            let span = 1usize << router.ram_pos();
            let capacity = (span * RAM_BYTES_PER_CHILD / std::mem::size_of::<Update>()).max(1);
            let shards = (0..router.ram_buckets())
                .map(|idx| {
                    let (base, count) = slab_range(idx, router.ram_pos(), num_nodes);
                    CachePadded::new(Mutex::new(RamShard {
                        pending: Vec::with_capacity(capacity),
                        capacity,
                        leaves: LeafSlab::new(base, count, leaf_capacity),
                    }))
                })
                .collect();
            RamTier { shards }
        });

        // One slot fits the configured group quota at worst-case leaf size,
        // plus one page of write headroom.
        let slot_capacity = conf.wq_batch_per_elm * (2 + leaf_capacity)
            + conf.page_size as usize / std::mem::size_of::<NodeId>();
        let wq = WorkQueue::new(
            workers * conf.queue_factor as usize,
            slot_capacity,
            conf.wq_batch_per_elm,
        );

        let shared = SharedTier {
            router,
            num_nodes,
            leaf_capacity,
            shards,
            ram,
            wq,
        };

        let inserters = (0..inserters)
            .map(|_| Mutex::new(InserterState::new(&shared)))
            .collect();

        Self {
            shared,
            inserters,
            slot_capacity,
        }
    }

    /// Inserts one update from producer thread 0.
    #[inline]
    pub fn insert(&self, upd: Update) -> Result<(), Backpressured> {
        self.insert_from(upd, 0)
    }

    /// Inserts one update from the producer thread with the given stable
    /// index.
    ///
    /// `Err(Backpressured)` is only possible when non-blocking mode was
    /// switched on mid-stream; the update is retained in the buffers it
    /// reached and drains on a later flush.
    #[inline]
    pub fn insert_from(&self, upd: Update, thread_index: usize) -> Result<(), Backpressured> {
        assert!(upd.src < self.shared.num_nodes, "src out of range");
        assert!(upd.dst < self.shared.num_nodes, "dst out of range");
        let mut state = self.inserters[thread_index]
            .lock()
            .expect("inserter state poisoned");
        state.insert(&self.shared, upd)
    }

    /// Drains every buffer at every level into work-queue batches.
    ///
    /// Requires non-blocking mode to be off; with it on, the drain stops at
    /// the first full-queue condition and the remaining updates stay
    /// buffered for a retry. Workers must keep draining the queue while the
    /// flush runs (the number of produced batches may exceed the slot
    /// count). Post-condition on success: every buffer is empty and each
    /// inserted update has become exactly one destination entry in exactly
    /// one batch.
    pub fn force_flush(&self) -> Result<(), Backpressured> {
        let shared = &self.shared;
        let stride = self.inserters.len();

        // Phase 1a, parallel: drain every inserter's L1/L2 into the shared
        // tier. Joined before any shard drains, so no helper empties a shard
        // that another helper's locals are still feeding.
        let results: Vec<Result<(), Backpressured>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..stride)
                .map(|t| {
                    scope.spawn(move || {
                        let mut state = self.inserters[t]
                            .lock()
                            .expect("inserter state poisoned");
                        state.flush_locals(shared)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("flush helper panicked"))
                .collect()
        });
        results.into_iter().collect::<Result<(), Backpressured>>()?;

        // Phase 1b, parallel: drain the L3 shards, strided across helpers.
        let results: Vec<Result<(), Backpressured>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..stride)
                .map(|t| {
                    scope.spawn(move || -> Result<(), Backpressured> {
                        let mut idx = t;
                        while idx < shared.num_shards() {
                            shared.flush_shard(idx)?;
                            idx += stride;
                        }
                        Ok(())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("flush helper panicked"))
                .collect()
        });
        results.into_iter().collect::<Result<(), Backpressured>>()?;

        // Phases 2-4: RAM tier, leaf sweep, then publish any partial slot.
        shared.flush_ram_tier()?;
        shared.flush_leaves()?;
        shared.wq.flush_open_slot();
        Ok(())
    }

    /// Leases the next batch of per-source groups, blocking until one is
    /// published. Returns `None` only in non-blocking mode with no data.
    ///
    /// Dropping the returned [`WorkBatch`] releases its slot.
    pub fn get_data(&self) -> Option<WorkBatch<'_>> {
        self.shared.wq.peek()
    }

    /// Converts blocked and future queue waits into immediate
    /// `Backpressured`/`None` returns (or restores blocking behavior).
    pub fn set_non_block(&self, on: bool) {
        self.shared.wq.set_non_block(on);
    }

    /// Destinations a leaf gutter holds before it ships as a batch.
    pub fn leaf_capacity(&self) -> usize {
        self.shared.leaf_capacity
    }

    /// Payload size of one work-queue slot in bytes.
    pub fn batch_bytes(&self) -> usize {
        self.slot_capacity * std::mem::size_of::<NodeId>()
    }

    /// Whether the vertex space was large enough to interpose the RAM tier
    /// between L3 and the leaves.
    pub fn uses_ram_tier(&self) -> bool {
        self.shared.ram.is_some()
    }

    #[cfg(test)]
    pub(crate) fn buffered_in_inserters(&self) -> usize {
        self.inserters
            .iter()
            .map(|m| m.lock().unwrap().buffered())
            .sum()
    }
}

/// Source range `[base, base + count)` covered by bucket `idx` at shift
/// `pos`, clamped to the vertex universe.
fn slab_range(idx: usize, pos: u32, num_nodes: NodeId) -> (NodeId, usize) {
    let base = (idx as u64) << pos;
    let end = ((idx as u64 + 1) << pos).min(u64::from(num_nodes));
    assert!(base < u64::from(num_nodes));
    (base as NodeId, (end - base) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_conf() -> GutterConfig {
        GutterConfig::default().gutter_bytes(64).queue_factor(2)
    }

    /// Runs `produce` while a querier thread drains the queue, then flushes
    /// and collects everything delivered. The querier starts before the
    /// first insert so `force_flush` can never wedge on a full queue.
    fn run_and_collect(
        gts: &GutteringSystem,
        produce: impl FnOnce(),
    ) -> Vec<(NodeId, Vec<NodeId>)> {
        thread::scope(|scope| {
            let querier = scope.spawn(|| {
                let mut out = Vec::new();
                while let Some(batch) = gts.get_data() {
                    for (src, dsts) in batch.groups() {
                        out.push((src, dsts.to_vec()));
                    }
                }
                out
            });

            produce();
            gts.force_flush().unwrap();
            gts.set_non_block(true);
            let out = querier.join().unwrap();
            gts.set_non_block(false);
            out
        })
    }

    #[test]
    fn flush_delivers_every_update() {
        let gts = GutteringSystem::new(10, 1, 1, tiny_conf());
        let batches = run_and_collect(&gts, || {
            for i in 0..100u32 {
                gts.insert(Update::new(i % 10, 9 - (i % 10))).unwrap();
            }
        });
        assert_eq!(gts.buffered_in_inserters(), 0);

        let mut per_src = vec![0usize; 10];
        for (src, dsts) in batches {
            for dst in dsts {
                assert_eq!(dst, 9 - src);
                per_src[src as usize] += 1;
            }
        }
        assert!(per_src.iter().all(|&n| n == 10));
    }

    #[test]
    fn full_leaf_ships_exactly_at_capacity() {
        let gts = GutteringSystem::new(4, 1, 1, tiny_conf());
        let cap = gts.leaf_capacity();
        assert_eq!(cap, 16);

        // Fill source 0's leaf exactly three times over.
        let batches = run_and_collect(&gts, || {
            for _ in 0..3 * cap {
                gts.insert(Update::new(0, 1)).unwrap();
            }
        });
        assert_eq!(batches.len(), 3);
        for (src, dsts) in batches {
            assert_eq!(src, 0);
            assert_eq!(dsts.len(), cap);
        }
    }

    #[test]
    fn second_flush_produces_nothing() {
        let gts = GutteringSystem::new(16, 1, 1, tiny_conf());
        let first = run_and_collect(&gts, || {
            for i in 0..50u32 {
                gts.insert(Update::new(i % 16, i % 16)).unwrap();
            }
        });
        assert_eq!(first.iter().map(|(_, d)| d.len()).sum::<usize>(), 50);

        // Nothing buffered anywhere: a second flush publishes no batches.
        gts.force_flush().unwrap();
        gts.set_non_block(true);
        assert!(gts.get_data().is_none());
    }

    #[test]
    fn ram_tier_activates_past_fanout_boundary() {
        // fanout 2 keeps the boundary (2048 * 2 = 4096) small enough to test.
        let conf = || GutterConfig::default().fanout(2).gutter_bytes(64);

        let at_boundary = GutteringSystem::new(4096, 1, 1, conf());
        assert!(!at_boundary.uses_ram_tier());

        let over_boundary = GutteringSystem::new(4097, 1, 1, conf());
        assert!(over_boundary.uses_ram_tier());
    }

    #[test]
    fn ram_tier_delivers_every_update() {
        let conf = GutterConfig::default()
            .fanout(2)
            .gutter_bytes(64)
            .queue_factor(4);
        let gts = GutteringSystem::new(4097, 1, 1, conf);
        assert!(gts.uses_ram_tier());

        // Sweep the whole universe, including the one spillover vertex.
        let n = 4097u32;
        let batches = run_and_collect(&gts, || {
            for i in 0..3 * n {
                gts.insert(Update::new(i % n, (i * 7) % n)).unwrap();
            }
        });

        let mut per_src = vec![0usize; n as usize];
        for (src, dsts) in batches {
            per_src[src as usize] += dsts.len();
        }
        assert!(per_src.iter().all(|&count| count == 3));
    }

    #[test]
    fn batched_slots_pack_multiple_groups() {
        let conf = GutterConfig::default()
            .gutter_bytes(64)
            .wq_batch_per_elm(4)
            .queue_factor(2);
        let gts = GutteringSystem::new(8, 1, 1, conf);

        let batches = run_and_collect(&gts, || {
            for src in 0..8u32 {
                for _ in 0..5 {
                    gts.insert(Update::new(src, src)).unwrap();
                }
            }
        });
        let total: usize = batches.iter().map(|(_, dsts)| dsts.len()).sum();
        assert_eq!(total, 40);
    }

    #[test]
    fn leaf_capacity_has_a_floor_of_one() {
        let gts = GutteringSystem::new(2, 1, 1, GutterConfig::default().gutter_bytes(1));
        assert_eq!(gts.leaf_capacity(), 1);
        let batches = run_and_collect(&gts, || {
            gts.insert(Update::new(0, 1)).unwrap();
        });
        assert_eq!(batches, vec![(0, vec![1])]);
    }

    #[test]
    fn slab_ranges_tile_the_universe() {
        for (num_nodes, pos) in [(10u32, 0u32), (1000, 4), (4097, 1)] {
            let buckets = ((num_nodes - 1) >> pos) as usize + 1;
            let mut next = 0u64;
            for idx in 0..buckets {
                let (base, count) = slab_range(idx, pos, num_nodes);
                assert_eq!(u64::from(base), next);
                assert!(count >= 1);
                next += count as u64;
            }
            assert_eq!(next, u64::from(num_nodes));
        }
    }
}
