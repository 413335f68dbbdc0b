//! Basic blocks.

use super::types::{BlockId, ValueId};
use crate::core::liveness::FlowIndex;
use serde::{Deserialize, Serialize};

/// Expected execution frequency of a block, used for layout decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Frequency {
    #[default]
    Normal,
    /// Slow paths: traps, tier-up, write barrier slow path.
    Rare,
}

/// Ordered list of values ending in one terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BlockId,
    pub values: Vec<ValueId>,
    /// Targets of the terminal, in the terminal's order.
    pub successors: Vec<BlockId>,
    /// Recomputed from successor lists; one entry per incoming edge.
    pub predecessors: Vec<BlockId>,
    pub frequency: Frequency,
    pub live_at_head: Vec<FlowIndex>,
    pub live_at_tail: Vec<FlowIndex>,
    /// Unreachable and emptied; kept so block ids stay stable.
    pub dead: bool,
}

impl BasicBlock {
    pub fn new(id: BlockId, frequency: Frequency) -> Self {
        Self {
            id,
            values: Vec::new(),
            successors: Vec::new(),
            predecessors: Vec::new(),
            frequency,
            live_at_head: Vec::new(),
            live_at_tail: Vec::new(),
            dead: false,
        }
    }

    pub fn last(&self) -> Option<ValueId> {
        self.values.last().copied()
    }
}
