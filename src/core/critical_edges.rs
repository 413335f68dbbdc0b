//! Critical edge breaking.
//!
//! An edge A -> B is critical when A has several successors and B several
//! predecessors. Values that must run on exactly that edge (the upsilons SSA
//! repair places, copies emitted when phis are destroyed) have no block to
//! live in, so every unique critical edge gets a pad block holding only a
//! jump to B.

use crate::ir::{BlockId, Opcode, Procedure};
use hashbrown::HashMap;

/// Insert a jump pad on every critical edge; returns the number of pads.
pub fn break_critical_edges(proc: &mut Procedure) -> usize {
    proc.recompute_predecessors();

    let blocks: Vec<BlockId> = proc.live_blocks().collect();
    let mut pads_inserted = 0;

    for block in blocks {
        if proc.block(block).successors.len() <= 1 {
            continue;
        }

        let origin = proc
            .terminal(block)
            .map(|t| proc.value(t).origin)
            .unwrap_or_default();

        // A switch may name the same target for several cases; those share one pad.
        let mut successor_pads: HashMap<BlockId, BlockId> = HashMap::new();
        for index in (0..proc.block(block).successors.len()).rev() {
            let successor = proc.block(block).successors[index];
            if proc.block(successor).predecessors.len() <= 1 {
                continue;
            }

            let pad = match successor_pads.get(&successor) {
                Some(&pad) => pad,
                None => {
                    let frequency = proc.block(successor).frequency;
                    let pad = proc.add_block(frequency);
                    proc.append_terminal(pad, Opcode::Jump, &[], &[successor], origin);
                    successor_pads.insert(successor, pad);
                    pads_inserted += 1;
                    log::trace!("critical edge {} -> {} split by {}", block, successor, pad);
                    pad
                }
            };
            proc.block_mut(block).successors[index] = pad;
        }
    }

    proc.recompute_predecessors();
    pads_inserted
}
