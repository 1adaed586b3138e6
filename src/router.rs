//! Source-vertex routing across buffer levels.
//!
//! Every level `l` holds a power-of-two number of buckets. With
//! `bits_l = log2(buckets_l)` and `pos_l = max(ceil(log2 num_nodes) - bits_l, 0)`,
//! the bucket for a source is just `src >> pos_l`. Because bucket counts only
//! grow down the hierarchy, `pos_1 >= pos_2 >= pos_3 >= pos_ram`, and a
//! child's bucket always carries its parent's bucket in its high bits. That
//! makes level-to-level routing a pure shift and lets one parent-level lock
//! cover a contiguous group of child buckets.

use crate::gutter::{NUM_L1_BUFS, NUM_L2_BUFS, NUM_L3_BUFS};
use crate::NodeId;

/// Ceiling of `log2(n)` for `n >= 1`.
#[inline]
pub(crate) fn ceil_log2(n: u64) -> u32 {
    assert!(n >= 1);
    n.next_power_of_two().trailing_zeros()
}

/// Per-level shift amounts for one `num_nodes` universe.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Router {
    num_nodes: NodeId,
    l1_pos: u32,
    l2_pos: u32,
    l3_pos: u32,
    ram_pos: u32,
}

impl Router {
    /// Builds the routing table for `num_nodes` vertices.
    ///
    /// `max_ram_buckets` is the bucket count of the RAM tier
    /// (`NUM_L3_BUFS * fanout`); its shift is computed whether or not the
    /// tier ends up instantiated.
    pub(crate) fn new(num_nodes: NodeId, max_ram_buckets: u64) -> Self {
        assert!(num_nodes >= 1, "need at least one vertex");
        let node_bits = ceil_log2(u64::from(num_nodes));

        let l1_pos = node_bits.saturating_sub(NUM_L1_BUFS.trailing_zeros());
        let l2_pos = node_bits.saturating_sub(NUM_L2_BUFS.trailing_zeros());
        let l3_pos = node_bits.saturating_sub(NUM_L3_BUFS.trailing_zeros());
        let ram_pos = node_bits.saturating_sub(ceil_log2(max_ram_buckets));

        let router = Self {
            num_nodes,
            l1_pos,
            l2_pos,
            l3_pos,
            ram_pos,
        };

        // Shifts shrink down the hierarchy; this is what makes a child bucket
        // derivable from its parent by a further right shift.
        assert!(router.l1_pos >= router.l2_pos);
        assert!(router.l2_pos >= router.l3_pos);
        assert!(router.l3_pos >= router.ram_pos);

        router
    }

    #[inline]
    pub(crate) fn l1_bucket(&self, src: NodeId) -> usize {
        debug_assert!(src < self.num_nodes);
        (src >> self.l1_pos) as usize
    }

    #[inline]
    pub(crate) fn l2_bucket(&self, src: NodeId) -> usize {
        debug_assert!(src < self.num_nodes);
        (src >> self.l2_pos) as usize
    }

    #[inline]
    pub(crate) fn l3_bucket(&self, src: NodeId) -> usize {
        debug_assert!(src < self.num_nodes);
        (src >> self.l3_pos) as usize
    }

    #[inline]
    pub(crate) fn ram_bucket(&self, src: NodeId) -> usize {
        debug_assert!(src < self.num_nodes);
        (src >> self.ram_pos) as usize
    }

    /// Shift between the L2 (shard) index and the L3 index: each L2 bucket
    /// covers `1 << shard_child_bits()` L3 gutters.
    #[inline]
    pub(crate) fn shard_child_bits(&self) -> u32 {
        self.l2_pos - self.l3_pos
    }

    #[inline]
    pub(crate) fn l2_pos(&self) -> u32 {
        self.l2_pos
    }

    #[inline]
    pub(crate) fn ram_pos(&self) -> u32 {
        self.ram_pos
    }

    /// Number of reachable L1 buckets (`<= NUM_L1_BUFS`).
    pub(crate) fn l1_buckets(&self) -> usize {
        ((self.num_nodes - 1) >> self.l1_pos) as usize + 1
    }

    /// Number of reachable L2 buckets (`<= NUM_L2_BUFS`).
    pub(crate) fn l2_buckets(&self) -> usize {
        ((self.num_nodes - 1) >> self.l2_pos) as usize + 1
    }

    /// Number of reachable RAM-tier buckets.
    pub(crate) fn ram_buckets(&self) -> usize {
        ((self.num_nodes - 1) >> self.ram_pos) as usize + 1
    }
}
