//! Thread-local buffering state for one producer thread.
//!
//! Each inserter owns private L1 and L2 gutter arrays sized to sit in its
//! core's caches; appending and draining them involves no synchronization.
//! Only the final L2 drain crosses into shared territory, taking the L3
//! shard lock for the bucket being drained. State holds no reference to the
//! system: every drain borrows the shared tier for its duration.

use crate::gutter::{CacheGutter, L1L2_GUTTER_ELMS};
use crate::system::SharedTier;
use crate::work_queue::Backpressured;
use crate::Update;

pub(crate) struct InserterState {
    l1: Box<[CacheGutter]>,
    l2: Box<[CacheGutter]>,
}

impl InserterState {
    pub(crate) fn new(shared: &SharedTier) -> Self {
        let router = shared.router();
        let gutters = |count: usize| {
            (0..count)
                .map(|_| CacheGutter::with_capacity(L1L2_GUTTER_ELMS))
                .collect::<Box<[_]>>()
        };
        Self {
            l1: gutters(router.l1_buckets()),
            l2: gutters(router.l2_buckets()),
        }
    }

    /// Appends one update, draining through L2 into the shared tier whenever
    /// a gutter fills.
    ///
    /// Steady state is a single bounds-checked store; the drain chain runs
    /// once per `L1L2_GUTTER_ELMS` appends to a bucket.
    #[inline]
    pub(crate) fn insert(&mut self, shared: &SharedTier, upd: Update) -> Result<(), Backpressured> {
        let idx = shared.router().l1_bucket(upd.src);
        self.l1[idx].push(upd);
        if self.l1[idx].is_full() {
            self.flush_l1(shared, idx)?;
        }
        Ok(())
    }

    /// Drains one L1 gutter into the L2 tier.
    fn flush_l1(&mut self, shared: &SharedTier, idx: usize) -> Result<(), Backpressured> {
        let n = self.l1[idx].len();
        for i in 0..n {
            let upd = self.l1[idx].get(i);
            let idx2 = shared.router().l2_bucket(upd.src);
            self.l2[idx2].push(upd);
            if self.l2[idx2].is_full() {
                if let Err(err) = self.flush_l2(shared, idx2) {
                    // The prefix (including `upd`) reached L2; keep only the
                    // tail so a retry does not replay it.
                    self.l1[idx].drop_front(i + 1);
                    return Err(err);
                }
            }
        }
        self.l1[idx].clear();
        Ok(())
    }

    /// Drains one L2 gutter into the shared L3 tier, under that bucket's
    /// shard lock.
    fn flush_l2(&mut self, shared: &SharedTier, idx2: usize) -> Result<(), Backpressured> {
        let mut shard = shared.lock_shard(idx2);
        let n = self.l2[idx2].len();
        for i in 0..n {
            let upd = self.l2[idx2].get(i);
            let idx3 = shared.router().l3_bucket(upd.src);
            assert!(
                idx3 >> shared.router().shard_child_bits() == idx2,
                "routing violation: L3 bucket {idx3} outside shard {idx2}"
            );
            let child = idx3 & ((1 << shared.router().shard_child_bits()) - 1);
            shard.gutter_mut(child).push(upd);
            if shard.gutter_mut(child).is_full() {
                if let Err(err) = shared.drain_l3_gutter(&mut shard, child) {
                    drop(shard);
                    self.l2[idx2].drop_front(i + 1);
                    return Err(err);
                }
            }
        }
        drop(shard);
        self.l2[idx2].clear();
        Ok(())
    }

    /// Drains every local gutter: all of L1 into L2, then all of L2 into the
    /// shared tier. Part of the terminal flush protocol.
    pub(crate) fn flush_locals(&mut self, shared: &SharedTier) -> Result<(), Backpressured> {
        for idx in 0..self.l1.len() {
            if !self.l1[idx].is_empty() {
                self.flush_l1(shared, idx)?;
            }
        }
        for idx2 in 0..self.l2.len() {
            if !self.l2[idx2].is_empty() {
                self.flush_l2(shared, idx2)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        let l1: usize = self.l1.iter().map(|g| g.len()).sum();
        let l2: usize = self.l2.iter().map(|g| g.len()).sum();
        l1 + l2
    }
}
