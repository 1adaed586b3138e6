//! Cache-aware buffering of graph edge updates into per-vertex batches.
//!
//! A stream of point updates `(src, dst)` arrives in arbitrary order at high
//! rate. Downstream workers want coarse batches of destinations grouped by
//! source vertex, so that per-batch overhead (e.g. a sketch update) is paid
//! once per thousands of updates instead of once per update. This crate sits
//! in between:
//!
//! - Each producer thread owns small L1/L2 gutters sized to stay resident in
//!   its private caches. Updates land there with no synchronization.
//! - Full L2 gutters drain into a shared L3 tier under a per-shard mutex, and
//!   from there into per-vertex leaf gutters (via an intermediate RAM tier
//!   when the vertex space is too large for direct fan-out).
//! - A leaf gutter that fills becomes one batch on a bounded work queue of
//!   reusable slots, where any number of worker threads pick it up.
//!
//! High-level flow (one update):
//! 1) Append to the inserting thread's L1 gutter for `src`'s bucket.
//! 2) Full L1 bucket drains into L2; full L2 bucket drains into shared L3
//!    under that bucket's lock.
//! 3) Full L3 gutters drain into leaf gutters (or the RAM tier, then leaves).
//! 4) A leaf reaching capacity ships to the [`WorkQueue`] as one
//!    `(src, [dst...])` group and resets.
//!
//! [`GutteringSystem::force_flush`] drains every level so the consumer
//! observes exactly the inserted multiset of updates. There is no durability:
//! buffered updates are lost on crash, and updates to one source may be split
//! across batches.

pub mod config;
pub mod system;
pub mod work_queue;

mod gutter;
mod inserter;
mod router;

#[cfg(test)]
pub mod test_utils;

pub use config::GutterConfig;
pub use system::GutteringSystem;
pub use work_queue::{Backpressured, WorkBatch, WorkQueue};

/// Identifier of a graph vertex.
///
/// Bounded by the `num_nodes` the system was built with. 32 bits covers the
/// deployments this crate targets; all routing arithmetic only assumes the id
/// fits in a machine word.
pub type NodeId = u32;

/// One edge update: a destination queued for a source vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Update {
    pub src: NodeId,
    pub dst: NodeId,
}

impl Update {
    #[inline]
    pub fn new(src: NodeId, dst: NodeId) -> Self {
        Self { src, dst }
    }
}
