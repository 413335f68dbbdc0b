// This module implements Procedure, the index arena that owns one function's block graph for
// the whole compilation, including the bodies of every function inlined into it. Values,
// blocks, variables, tuple shapes and the out-of-line call/patchpoint/switch descriptors all
// live in flat vectors addressed by the newtype ids of ir::types, so nested builders can keep
// appending to the same graph through a plain &mut borrow and no node ever holds a pointer
// to another. Besides creation helpers the procedure offers the small set of mutations the
// later passes need (inserting values in the middle of a block, rewiring successor edges,
// recomputing predecessor lists, clearing unreachable blocks) and a structural validator
// that reports malformed graphs as internal compile errors.

//! The per-function block graph arena.

use super::block::{BasicBlock, Frequency};
use super::descriptor::{CallDescriptor, PatchpointDescriptor, SwitchDescriptor};
use super::types::{
    BlockId, CallId, Origin, PatchpointId, SwitchId, TupleId, Type, ValueId, VariableId,
};
use super::value::{Edge, Opcode, Value};
use crate::core::error::{CompileError, CompileResult};
use serde::{Deserialize, Serialize};

/// Why a block may be entered from outside the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntrypointKind {
    Function,
    /// Landing pad for the handler with this index.
    Catch { handler: u32 },
    /// Resumes a running loop from a lower tier.
    Osr { loop_index: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrypoint {
    pub block: BlockId,
    pub kind: EntrypointKind,
}

/// Mutable storage slot read with `Get` and written with `Set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub ty: Type,
}

/// Value/block graph of one function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Procedure {
    values: Vec<Value>,
    blocks: Vec<BasicBlock>,
    variables: Vec<Variable>,
    tuples: Vec<Vec<Type>>,
    calls: Vec<CallDescriptor>,
    patchpoints: Vec<PatchpointDescriptor>,
    switches: Vec<SwitchDescriptor>,
    entrypoints: Vec<Entrypoint>,
}

impl Procedure {
    pub fn new() -> Self {
        Self::default()
    }

    // ==== CREATION ====

    pub fn add_block(&mut self, frequency: Frequency) -> BlockId {
        let id = BlockId::from_index(self.blocks.len());
        self.blocks.push(BasicBlock::new(id, frequency));
        id
    }

    pub fn add_variable(&mut self, ty: Type) -> VariableId {
        let id = VariableId::from_index(self.variables.len());
        self.variables.push(Variable { ty });
        id
    }

    /// Type for a list of results: void, the single type, or a tuple.
    pub fn result_type(&mut self, types: &[Type]) -> Type {
        match types {
            [] => Type::Void,
            [single] => *single,
            many => {
                let id = TupleId::from_index(self.tuples.len());
                self.tuples.push(many.to_vec());
                Type::Tuple(id)
            }
        }
    }

    pub fn add_call(&mut self, descriptor: CallDescriptor) -> CallId {
        let id = CallId::from_index(self.calls.len());
        self.calls.push(descriptor);
        id
    }

    pub fn add_patchpoint(&mut self, descriptor: PatchpointDescriptor) -> PatchpointId {
        let id = PatchpointId::from_index(self.patchpoints.len());
        self.patchpoints.push(descriptor);
        id
    }

    pub fn add_switch(&mut self, descriptor: SwitchDescriptor) -> SwitchId {
        let id = SwitchId::from_index(self.switches.len());
        self.switches.push(descriptor);
        id
    }

    pub fn add_entrypoint(&mut self, block: BlockId, kind: EntrypointKind) -> usize {
        self.entrypoints.push(Entrypoint { block, kind });
        self.entrypoints.len() - 1
    }

    /// Create a value that belongs to `block` but is not in its value list yet.
    pub fn add_detached(
        &mut self,
        block: BlockId,
        opcode: Opcode,
        ty: Type,
        children: &[ValueId],
        origin: Origin,
    ) -> ValueId {
        let id = ValueId::from_index(self.values.len());
        self.values.push(Value {
            opcode,
            ty,
            children: children.iter().copied().map(Edge::new).collect(),
            block,
            origin,
        });
        id
    }

    /// Append a new value to the end of `block`.
    pub fn append(
        &mut self,
        block: BlockId,
        opcode: Opcode,
        ty: Type,
        children: &[ValueId],
        origin: Origin,
    ) -> ValueId {
        let id = self.add_detached(block, opcode, ty, children, origin);
        self.blocks[block.index()].values.push(id);
        id
    }

    /// Append a value created with [`Procedure::add_detached`].
    pub fn append_existing(&mut self, block: BlockId, value: ValueId) {
        self.values[value.index()].block = block;
        self.blocks[block.index()].values.push(value);
    }

    /// Insert a new value at `position` within `block`.
    pub fn insert(
        &mut self,
        block: BlockId,
        position: usize,
        opcode: Opcode,
        ty: Type,
        children: &[ValueId],
        origin: Origin,
    ) -> ValueId {
        let id = self.add_detached(block, opcode, ty, children, origin);
        self.blocks[block.index()].values.insert(position, id);
        id
    }

    /// Append a terminal and record its targets.
    pub fn append_terminal(
        &mut self,
        block: BlockId,
        opcode: Opcode,
        children: &[ValueId],
        successors: &[BlockId],
        origin: Origin,
    ) -> ValueId {
        let id = self.append(block, opcode, Type::Void, children, origin);
        self.blocks[block.index()].successors = successors.to_vec();
        id
    }

    // ==== ACCESS ====

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }

    pub fn variable(&self, id: VariableId) -> Variable {
        self.variables[id.index()]
    }

    pub fn tuple(&self, id: TupleId) -> &[Type] {
        &self.tuples[id.index()]
    }

    pub fn call(&self, id: CallId) -> &CallDescriptor {
        &self.calls[id.index()]
    }

    pub fn calls(&self) -> &[CallDescriptor] {
        &self.calls
    }

    pub fn patchpoint(&self, id: PatchpointId) -> &PatchpointDescriptor {
        &self.patchpoints[id.index()]
    }

    pub fn patchpoints(&self) -> &[PatchpointDescriptor] {
        &self.patchpoints
    }

    pub fn switch(&self, id: SwitchId) -> &SwitchDescriptor {
        &self.switches[id.index()]
    }

    pub fn entrypoints(&self) -> &[Entrypoint] {
        &self.entrypoints
    }

    /// Terminal of `block`, if it has been closed.
    pub fn terminal(&self, block: BlockId) -> Option<ValueId> {
        let last = self.blocks[block.index()].last()?;
        self.values[last.index()].opcode.is_terminal().then_some(last)
    }

    pub fn is_terminated(&self, block: BlockId) -> bool {
        self.terminal(block).is_some()
    }

    /// Live (not pruned) block ids in index order.
    pub fn live_blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().filter(|b| !b.dead).map(|b| b.id)
    }

    /// Count values per opcode category over live blocks.
    pub fn count_values(&self, pred: impl Fn(&Opcode) -> bool) -> usize {
        self.live_blocks()
            .flat_map(|b| self.blocks[b.index()].values.iter())
            .filter(|v| pred(&self.values[v.index()].opcode))
            .count()
    }

    // ==== MUTATION ====

    /// Rebuild every predecessor list from the successor lists.
    pub fn recompute_predecessors(&mut self) {
        for block in self.blocks.iter_mut() {
            block.predecessors.clear();
        }
        for index in 0..self.blocks.len() {
            if self.blocks[index].dead {
                continue;
            }
            let from = self.blocks[index].id;
            let successors = self.blocks[index].successors.clone();
            for succ in successors {
                self.blocks[succ.index()].predecessors.push(from);
            }
        }
    }

    /// Empty a block that can never run.
    pub fn kill_block(&mut self, id: BlockId) {
        let block = &mut self.blocks[id.index()];
        block.values.clear();
        block.successors.clear();
        block.predecessors.clear();
        block.live_at_head.clear();
        block.live_at_tail.clear();
        block.dead = true;
    }

    /// Drop values matching `pred` from every block's value list.
    pub fn remove_values_where(&mut self, pred: impl Fn(&Value) -> bool) {
        let values = &self.values;
        for block in self.blocks.iter_mut() {
            block.values.retain(|v| !pred(&values[v.index()]));
        }
    }

    // ==== VALIDATION ====

    /// Check the structural invariants every later pass relies on.
    pub fn validate(&self) -> CompileResult<()> {
        let fail = |reason: String| Err(CompileError::internal(reason));

        if self.entrypoints.is_empty() {
            return fail("procedure has no entrypoint".to_string());
        }

        let mut placed = vec![None; self.values.len()];
        for block in self.blocks.iter().filter(|b| !b.dead) {
            let Some(&last) = block.values.last() else {
                return fail(format!("{} is empty", block.id));
            };
            if !self.values[last.index()].opcode.is_terminal() {
                return fail(format!("{} does not end in a terminal", block.id));
            }
            for (position, &value) in block.values.iter().enumerate() {
                if placed[value.index()].replace(block.id).is_some() {
                    return fail(format!("{} placed twice", value));
                }
                let opcode = self.values[value.index()].opcode;
                if opcode.is_terminal() && position + 1 != block.values.len() {
                    return fail(format!("terminal {} in the middle of {}", value, block.id));
                }
                let expected = match opcode {
                    Opcode::Jump => Some(1),
                    Opcode::Branch => Some(2),
                    Opcode::Switch(id) => Some(self.switch(id).cases.len() + 1),
                    Opcode::Return | Opcode::Oops | Opcode::Trap(_) => Some(0),
                    _ => None,
                };
                if let Some(expected) = expected {
                    if block.successors.len() != expected {
                        return fail(format!(
                            "{} has {} successors, terminal wants {}",
                            block.id,
                            block.successors.len(),
                            expected
                        ));
                    }
                }
            }
        }

        for block in self.blocks.iter().filter(|b| !b.dead) {
            for &value in &block.values {
                let data = &self.values[value.index()];
                for child in data.child_ids() {
                    if placed.get(child.index()).copied().flatten().is_none() {
                        return fail(format!("{} uses unplaced {}", value, child));
                    }
                }
                match data.opcode {
                    Opcode::Upsilon(phi) => {
                        if self.values[phi.index()].opcode != Opcode::Phi {
                            return fail(format!("{} feeds non-phi {}", value, phi));
                        }
                        if placed[phi.index()].is_none() {
                            return fail(format!("{} feeds unplaced phi {}", value, phi));
                        }
                        let fed = self.values[data.child(0).index()].ty;
                        if fed != self.values[phi.index()].ty {
                            return fail(format!("{} feeds {} with {}", value, phi, fed));
                        }
                    }
                    Opcode::Set(var) => {
                        let ty = self.values[data.child(0).index()].ty;
                        if ty != self.variable(var).ty {
                            return fail(format!("{} stores {} into {}", value, ty, var));
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::default()
    }

    #[test]
    fn test_append_and_terminal() {
        let mut proc = Procedure::new();
        let entry = proc.add_block(Frequency::Normal);
        proc.add_entrypoint(entry, EntrypointKind::Function);

        let c = proc.append(entry, Opcode::Const32(7), Type::Int32, &[], origin());
        assert!(!proc.is_terminated(entry));
        proc.append_terminal(entry, Opcode::Return, &[c], &[], origin());

        assert!(proc.is_terminated(entry));
        assert_eq!(proc.block(entry).values.len(), 2);
        assert!(proc.validate().is_ok());
    }

    #[test]
    fn test_predecessors_follow_successors() {
        let mut proc = Procedure::new();
        let a = proc.add_block(Frequency::Normal);
        let b = proc.add_block(Frequency::Normal);
        let c = proc.add_block(Frequency::Normal);
        proc.add_entrypoint(a, EntrypointKind::Function);

        let cond = proc.append(a, Opcode::Const32(1), Type::Int32, &[], origin());
        proc.append_terminal(a, Opcode::Branch, &[cond], &[b, c], origin());
        proc.append_terminal(b, Opcode::Jump, &[], &[c], origin());
        proc.append_terminal(c, Opcode::Return, &[], &[], origin());
        proc.recompute_predecessors();

        assert_eq!(proc.block(c).predecessors, vec![a, b]);
        assert_eq!(proc.block(b).predecessors, vec![a]);
        assert!(proc.block(a).predecessors.is_empty());
    }

    #[test]
    fn test_validate_rejects_open_block() {
        let mut proc = Procedure::new();
        let entry = proc.add_block(Frequency::Normal);
        proc.add_entrypoint(entry, EntrypointKind::Function);
        proc.append(entry, Opcode::Const32(1), Type::Int32, &[], origin());

        assert!(matches!(proc.validate(), Err(CompileError::Internal { .. })));
    }

    #[test]
    fn test_tuple_result_type() {
        let mut proc = Procedure::new();
        assert_eq!(proc.result_type(&[]), Type::Void);
        assert_eq!(proc.result_type(&[Type::Int64]), Type::Int64);
        let tuple = proc.result_type(&[Type::Int32, Type::Double]);
        let Type::Tuple(id) = tuple else {
            panic!("expected tuple");
        };
        assert_eq!(proc.tuple(id), &[Type::Int32, Type::Double]);
    }
}
