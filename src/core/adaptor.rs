// This module defines the IrAdaptor trait, the read-only graph view the analyses in core run
// over. The trait exposes just enough of an SSA block graph to compute block orders and
// liveness: dense block and value indices, entry blocks (a function may have several once
// catch handlers and OSR entries are added), successor and predecessor edges, the values of a
// block in program order, and the operands of each value. Joins are modelled the way the
// block graph builds them, as a sink node that defines the join value (a phi) plus one source
// node per incoming path that writes its pending value (an upsilon); JoinRole lets the
// liveness analysis treat that pair specially without knowing any concrete opcode. Keeping
// the analyses generic over this trait means they only ever borrow the graph.

//! Graph view shared by the block order and liveness analyses.
//!
//! Implementations are expected to hand out dense indices: block indices in
//! `0..block_count()` and value indices in `0..value_count()`.

use core::hash::Hash;

/// Role a value plays in a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRole<V> {
    /// Ordinary value.
    None,
    /// Defines the join value at the head of the join block.
    Sink,
    /// Writes the pending value of the given sink on one incoming path.
    Source(V),
}

/// Bridge between an SSA block graph and the analyses.
pub trait IrAdaptor {
    type ValueRef: Copy + Eq;
    type BlockRef: Copy + Eq + Hash;

    /// Number of block indices, including dead blocks.
    fn block_count(&self) -> usize;

    /// Block with the given dense index.
    fn block_ref(&self, index: usize) -> Self::BlockRef;

    /// Dense index of a block.
    fn block_index(&self, block: Self::BlockRef) -> usize;

    /// Blocks that were removed from the graph and must be skipped.
    fn block_is_dead(&self, _block: Self::BlockRef) -> bool {
        false
    }

    /// Blocks control may enter from outside the graph.
    fn entry_blocks(&self) -> Box<dyn Iterator<Item = Self::BlockRef> + '_>;

    /// Values of a block in program order.
    fn block_values(
        &self,
        block: Self::BlockRef,
    ) -> Box<dyn DoubleEndedIterator<Item = Self::ValueRef> + '_>;

    /// Successor blocks of a given block.
    fn block_succs(&self, block: Self::BlockRef) -> Box<dyn Iterator<Item = Self::BlockRef> + '_>;

    /// Predecessor blocks, one per incoming edge.
    fn block_preds(&self, block: Self::BlockRef) -> Box<dyn Iterator<Item = Self::BlockRef> + '_>;

    /// Number of value indices.
    fn value_count(&self) -> usize;

    /// Local index of a value for liveness tracking.
    fn val_local_idx(&self, val: Self::ValueRef) -> usize;

    /// Iterator over the operands of a value.
    fn val_operands(&self, val: Self::ValueRef) -> Box<dyn Iterator<Item = Self::ValueRef> + '_>;

    /// Join role of a value.
    fn val_join_role(&self, _val: Self::ValueRef) -> JoinRole<Self::ValueRef> {
        JoinRole::None
    }

    /// Should this value be ignored during liveness analysis?
    fn val_ignore_liveness(&self, _val: Self::ValueRef) -> bool {
        false
    }
}
