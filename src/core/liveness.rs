// This module implements the fixpoint liveness analysis over any graph exposed through
// IrAdaptor. Every block starts dirty; sweeps walk the block indices from last to first and
// reprocess the dirty ones until a sweep changes nothing. Processing a block seeds a sparse
// workset with its live-at-tail set and scans its values backwards: a value removes its own
// flow index and adds its operands, and an operand that was not yet live is that path's last
// use, so the edge is flagged as a kill. Joins get a second flow index per value, the shadow:
// a phi removes itself and makes its shadow live, an upsilon removes the shadow and adds its
// input, which keeps the many incoming writes of one phi from being live at the same time.
// Live-at-head sets only ever grow, so comparing sizes is enough to detect a change; the
// newly live indices are pushed into each predecessor's live-at-tail set and predecessors
// that grew are marked dirty. Worksets and dirty flags live in the session arena.

//! Fixpoint liveness analysis with kill flags.

use super::adaptor::{IrAdaptor, JoinRole};
use super::session::CompilationSession;
use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into the liveness universe: two per value.
///
/// `2 * v` stands for the value itself, `2 * v + 1` for the pending input of
/// a join value (its shadow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowIndex(pub u32);

impl FlowIndex {
    pub fn value(local_idx: usize) -> Self {
        Self((local_idx as u32) << 1)
    }

    pub fn shadow(local_idx: usize) -> Self {
        Self(((local_idx as u32) << 1) | 1)
    }

    pub fn is_shadow(self) -> bool {
        self.0 & 1 != 0
    }

    /// Local index of the value this flow index belongs to.
    pub fn local_idx(self) -> usize {
        (self.0 >> 1) as usize
    }
}

impl fmt::Display for FlowIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_shadow() {
            write!(f, "^v{}", self.local_idx())
        } else {
            write!(f, "v{}", self.local_idx())
        }
    }
}

/// Sparse set over `0..universe` with O(1) add/remove/clear.
struct Workset<'a> {
    dense: BumpVec<'a, u32>,
    sparse: &'a mut [u32],
}

impl<'a> Workset<'a> {
    fn new(arena: &'a Bump, sparse: &'a mut [u32]) -> Self {
        Self {
            dense: BumpVec::with_capacity_in(sparse.len().min(64), arena),
            sparse,
        }
    }

    fn contains(&self, x: u32) -> bool {
        let slot = self.sparse[x as usize] as usize;
        slot < self.dense.len() && self.dense[slot] == x
    }

    fn add(&mut self, x: u32) -> bool {
        if self.contains(x) {
            return false;
        }
        self.sparse[x as usize] = self.dense.len() as u32;
        self.dense.push(x);
        true
    }

    fn remove(&mut self, x: u32) -> bool {
        if !self.contains(x) {
            return false;
        }
        let slot = self.sparse[x as usize] as usize;
        let last = self.dense[self.dense.len() - 1];
        self.dense[slot] = last;
        self.sparse[last as usize] = slot as u32;
        self.dense.pop();
        true
    }

    fn clear(&mut self) {
        self.dense.clear();
    }

    fn len(&self) -> usize {
        self.dense.len()
    }

    fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.dense.iter().copied()
    }
}

/// Per-block live sets and per-use kill flags.
#[derive(Debug, Clone, Default)]
pub struct LivenessResult {
    /// Indexed by block index, sorted.
    pub live_at_head: Vec<Vec<FlowIndex>>,
    /// Indexed by block index, sorted.
    pub live_at_tail: Vec<Vec<FlowIndex>>,
    /// Indexed by value local index, one flag per operand.
    pub kills: Vec<Vec<bool>>,
    /// Blocks processed until the fixpoint.
    pub blocks_processed: usize,
    /// Full passes over the block list.
    pub sweeps: usize,
}

impl LivenessResult {
    pub fn is_live_at_head(&self, block_index: usize, index: FlowIndex) -> bool {
        self.live_at_head[block_index].binary_search(&index).is_ok()
    }

    pub fn is_live_at_tail(&self, block_index: usize, index: FlowIndex) -> bool {
        self.live_at_tail[block_index].binary_search(&index).is_ok()
    }
}

/// Fixpoint liveness over an [`IrAdaptor`] graph.
pub struct Liveness<'a, A: IrAdaptor> {
    adaptor: &'a A,
    workset: Workset<'a>,
    dirty: BumpVec<'a, bool>,
    live_at_head: Vec<Vec<u32>>,
    live_at_tail: Vec<HashSet<u32>>,
    kills: Vec<Vec<bool>>,
    blocks_processed: usize,
    sweeps: usize,
}

impl<'a, A: IrAdaptor> Liveness<'a, A> {
    /// Prepare the analysis; every live block starts dirty.
    pub fn new<'arena: 'a>(adaptor: &'a A, session: &CompilationSession<'arena>) -> Self {
        let arena = session.arena();
        let block_count = adaptor.block_count();
        let mut dirty = BumpVec::with_capacity_in(block_count, arena);
        for index in 0..block_count {
            dirty.push(!adaptor.block_is_dead(adaptor.block_ref(index)));
        }

        Self {
            adaptor,
            workset: Workset::new(arena, session.alloc_slice_fill(adaptor.value_count() * 2, 0)),
            dirty,
            live_at_head: vec![Vec::new(); block_count],
            live_at_tail: vec![HashSet::new(); block_count],
            kills: vec![Vec::new(); adaptor.value_count()],
            blocks_processed: 0,
            sweeps: 0,
        }
    }

    /// Process every dirty block once, last block first.
    ///
    /// Returns whether any live-at-head set grew.
    pub fn sweep(&mut self) -> bool {
        self.sweeps += 1;
        let mut changed = false;
        for index in (0..self.dirty.len()).rev() {
            if !std::mem::replace(&mut self.dirty[index], false) {
                continue;
            }
            changed |= self.process_block(index);
        }
        changed
    }

    /// Size of a block's live-at-head set so far.
    pub fn live_at_head_len(&self, block_index: usize) -> usize {
        self.live_at_head[block_index].len()
    }

    /// Run to the fixpoint and hand out the result.
    pub fn run(mut self) -> LivenessResult {
        while self.sweep() {}

        log::debug!(
            "liveness converged after {} sweeps, {} block visits",
            self.sweeps,
            self.blocks_processed
        );

        let live_at_head = self
            .live_at_head
            .into_iter()
            .map(|set| {
                let mut v: Vec<FlowIndex> = set.into_iter().map(FlowIndex).collect();
                v.sort_unstable();
                v
            })
            .collect();
        let live_at_tail = self
            .live_at_tail
            .into_iter()
            .map(|set| {
                let mut v: Vec<FlowIndex> = set.into_iter().map(FlowIndex).collect();
                v.sort_unstable();
                v
            })
            .collect();

        LivenessResult {
            live_at_head,
            live_at_tail,
            kills: self.kills,
            blocks_processed: self.blocks_processed,
            sweeps: self.sweeps,
        }
    }

    fn process_block(&mut self, index: usize) -> bool {
        self.blocks_processed += 1;
        let adaptor = self.adaptor;
        let block = adaptor.block_ref(index);

        self.workset.clear();
        for &live in self.live_at_tail[index].iter() {
            self.workset.add(live);
        }

        for value in adaptor.block_values(block).rev() {
            if adaptor.val_ignore_liveness(value) {
                continue;
            }
            let local = adaptor.val_local_idx(value);
            match adaptor.val_join_role(value) {
                JoinRole::Sink => {
                    self.workset.remove(FlowIndex::value(local).0);
                    self.workset.add(FlowIndex::shadow(local).0);
                    continue;
                }
                JoinRole::Source(phi) => {
                    let phi_local = adaptor.val_local_idx(phi);
                    self.workset.remove(FlowIndex::shadow(phi_local).0);
                }
                JoinRole::None => {
                    self.workset.remove(FlowIndex::value(local).0);
                }
            }

            let kills = &mut self.kills[local];
            kills.clear();
            for operand in adaptor.val_operands(value) {
                let operand_idx = adaptor.val_local_idx(operand);
                kills.push(self.workset.add(FlowIndex::value(operand_idx).0));
            }
        }

        let head = &mut self.live_at_head[index];
        if self.workset.len() == head.len() {
            return false;
        }

        for &live in head.iter() {
            self.workset.remove(live);
        }
        head.extend(self.workset.iter());
        log::trace!("block {} live at head grew by {}", index, self.workset.len());

        for pred in adaptor.block_preds(block) {
            let pred_index = adaptor.block_index(pred);
            let tail = &mut self.live_at_tail[pred_index];
            let mut changed_predecessor = false;
            for live in self.workset.iter() {
                changed_predecessor |= tail.insert(live);
            }
            if changed_predecessor {
                self.dirty[pred_index] = true;
            }
        }

        true
    }
}

/// Compute liveness to the fixpoint.
pub fn compute_liveness<A: IrAdaptor>(adaptor: &A, session: &CompilationSession<'_>) -> LivenessResult {
    let result = Liveness::new(adaptor, session).run();
    session.record_liveness_iterations(result.blocks_processed);
    result
}
