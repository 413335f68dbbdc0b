//! [`IrAdaptor`] view of a [`Procedure`] and liveness write-back.

use super::procedure::Procedure;
use super::types::{BlockId, ValueId};
use super::value::Opcode;
use crate::core::adaptor::{IrAdaptor, JoinRole};
use crate::core::liveness::LivenessResult;
use crate::ir::EntrypointKind;

impl IrAdaptor for Procedure {
    type ValueRef = ValueId;
    type BlockRef = BlockId;

    fn block_count(&self) -> usize {
        self.num_blocks()
    }

    fn block_ref(&self, index: usize) -> BlockId {
        BlockId::from_index(index)
    }

    fn block_index(&self, block: BlockId) -> usize {
        block.index()
    }

    fn block_is_dead(&self, block: BlockId) -> bool {
        self.block(block).dead
    }

    fn entry_blocks(&self) -> Box<dyn Iterator<Item = BlockId> + '_> {
        Box::new(self.entrypoints().iter().map(|e| e.block))
    }

    fn block_values(&self, block: BlockId) -> Box<dyn DoubleEndedIterator<Item = ValueId> + '_> {
        Box::new(self.block(block).values.iter().copied())
    }

    fn block_succs(&self, block: BlockId) -> Box<dyn Iterator<Item = BlockId> + '_> {
        Box::new(self.block(block).successors.iter().copied())
    }

    fn block_preds(&self, block: BlockId) -> Box<dyn Iterator<Item = BlockId> + '_> {
        Box::new(self.block(block).predecessors.iter().copied())
    }

    fn value_count(&self) -> usize {
        self.num_values()
    }

    fn val_local_idx(&self, val: ValueId) -> usize {
        val.index()
    }

    fn val_operands(&self, val: ValueId) -> Box<dyn Iterator<Item = ValueId> + '_> {
        Box::new(self.value(val).child_ids())
    }

    fn val_join_role(&self, val: ValueId) -> JoinRole<ValueId> {
        match self.value(val).opcode {
            Opcode::Phi => JoinRole::Sink,
            Opcode::Upsilon(phi) => JoinRole::Source(phi),
            _ => JoinRole::None,
        }
    }
}

impl Procedure {
    /// Store live sets on the blocks and kill flags on the edges.
    pub fn apply_liveness(&mut self, result: &LivenessResult) {
        for index in 0..self.num_blocks() {
            let id = BlockId::from_index(index);
            let block = self.block_mut(id);
            block.live_at_head = result.live_at_head.get(index).cloned().unwrap_or_default();
            block.live_at_tail = result.live_at_tail.get(index).cloned().unwrap_or_default();
        }

        for index in 0..self.num_values() {
            let Some(kills) = result.kills.get(index) else {
                continue;
            };
            let value = self.value_mut(ValueId::from_index(index));
            for (edge, &kill) in value.children.iter_mut().zip(kills.iter()) {
                edge.kill = kill;
            }
        }
    }

    /// Block of the function entrypoint.
    pub fn function_entry(&self) -> Option<BlockId> {
        self.entrypoints()
            .iter()
            .find(|e| e.kind == EntrypointKind::Function)
            .map(|e| e.block)
    }
}
