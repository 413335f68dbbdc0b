// This module implements the Analyzer component that computes the block layout of a graph
// exposed through IrAdaptor. It performs a depth-first walk from every entry block (the
// function entry plus catch landing pads and OSR entries) to build a reverse post-order,
// records which blocks are reachable at all, and flags loop headers, the targets of edges
// that lead back to a block still on the DFS stack. The order drives block layout in the
// emission stage and the reachability set drives pruning: blocks the builder created for
// code that turned out to be dead (continuations after unconditional branches, else arms of
// constant conditions) are emptied before liveness runs, so liveness and register allocation
// never see them.

//! Block order, reachability and pruning.

use super::adaptor::IrAdaptor;
use crate::ir::Procedure;
use core::marker::PhantomData;

/// Computes block layout for a function.
pub struct Analyzer<A: IrAdaptor> {
    order: Vec<A::BlockRef>,
    /// RPO position per block index, `usize::MAX` when unreachable.
    position: Vec<usize>,
    loop_headers: Vec<bool>,
    _marker: PhantomData<A>,
}

impl<A: IrAdaptor> Analyzer<A> {
    /// Walk the graph from every entry block.
    pub fn new(adaptor: &A) -> Self {
        let block_count = adaptor.block_count();
        let mut position = vec![usize::MAX; block_count];
        let mut loop_headers = vec![false; block_count];

        // 0 = unvisited, 1 = on stack, 2 = finished
        let mut state = vec![0u8; block_count];
        let mut post = Vec::with_capacity(block_count);

        for entry in adaptor.entry_blocks() {
            let entry_idx = adaptor.block_index(entry);
            if state[entry_idx] != 0 {
                continue;
            }
            state[entry_idx] = 1;
            let mut stack = vec![(entry, adaptor.block_succs(entry).collect::<Vec<_>>(), 0usize)];

            while let Some((block, succs, next)) = stack.last_mut() {
                if let Some(&succ) = succs.get(*next) {
                    *next += 1;
                    let succ_idx = adaptor.block_index(succ);
                    match state[succ_idx] {
                        0 => {
                            state[succ_idx] = 1;
                            let succ_succs = adaptor.block_succs(succ).collect::<Vec<_>>();
                            stack.push((succ, succ_succs, 0));
                        }
                        1 => loop_headers[succ_idx] = true,
                        _ => {}
                    }
                } else {
                    let block = *block;
                    state[adaptor.block_index(block)] = 2;
                    post.push(block);
                    stack.pop();
                }
            }
        }

        post.reverse();
        for (idx, block) in post.iter().enumerate() {
            position[adaptor.block_index(*block)] = idx;
        }

        log::trace!("analyzer: {} of {} blocks reachable", post.len(), block_count);

        Self {
            order: post,
            position,
            loop_headers,
            _marker: PhantomData,
        }
    }

    /// Sequence of reachable blocks in reverse post order.
    pub fn order(&self) -> &[A::BlockRef] {
        &self.order
    }

    pub fn is_reachable(&self, block_index: usize) -> bool {
        self.position[block_index] != usize::MAX
    }

    /// Target of an edge from a block still being visited.
    pub fn is_loop_header(&self, block_index: usize) -> bool {
        self.loop_headers[block_index]
    }
}

/// Clear every block no entrypoint reaches and fix up predecessor lists.
///
/// Returns the number of blocks removed.
pub fn prune_unreachable(proc: &mut Procedure) -> usize {
    proc.recompute_predecessors();
    let analyzer = Analyzer::new(&*proc);

    let unreachable: Vec<_> = proc
        .live_blocks()
        .filter(|b| !analyzer.is_reachable(b.index()))
        .collect();
    for &block in &unreachable {
        proc.kill_block(block);
    }
    proc.recompute_predecessors();

    if !unreachable.is_empty() {
        log::debug!("pruned {} unreachable blocks", unreachable.len());
    }
    unreachable.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{EntrypointKind, Frequency, Opcode, Origin, Type};

    #[test]
    fn test_rpo_and_loop_header() {
        let mut proc = Procedure::new();
        let entry = proc.add_block(Frequency::Normal);
        let header = proc.add_block(Frequency::Normal);
        let exit = proc.add_block(Frequency::Normal);
        proc.add_entrypoint(entry, EntrypointKind::Function);
        let o = Origin::default();

        proc.append_terminal(entry, Opcode::Jump, &[], &[header], o);
        let c = proc.append(header, Opcode::Const32(0), Type::Int32, &[], o);
        proc.append_terminal(header, Opcode::Branch, &[c], &[header, exit], o);
        proc.append_terminal(exit, Opcode::Return, &[], &[], o);
        proc.recompute_predecessors();

        let analyzer = Analyzer::new(&proc);
        assert_eq!(analyzer.order(), &[entry, header, exit]);
        assert!(analyzer.is_loop_header(header.index()));
        assert!(!analyzer.is_loop_header(exit.index()));
    }

    #[test]
    fn test_prune_clears_dead_blocks() {
        let mut proc = Procedure::new();
        let entry = proc.add_block(Frequency::Normal);
        let dead = proc.add_block(Frequency::Normal);
        let exit = proc.add_block(Frequency::Normal);
        proc.add_entrypoint(entry, EntrypointKind::Function);
        let o = Origin::default();

        proc.append_terminal(entry, Opcode::Jump, &[], &[exit], o);
        proc.append_terminal(dead, Opcode::Jump, &[], &[exit], o);
        proc.append_terminal(exit, Opcode::Return, &[], &[], o);

        assert_eq!(prune_unreachable(&mut proc), 1);
        assert!(proc.block(dead).dead);
        assert_eq!(proc.block(exit).predecessors, vec![entry]);
        assert!(proc.validate().is_ok());
    }
}
