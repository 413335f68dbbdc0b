// This module converts Variables into SSA joins once the builder is done. The builder keeps
// every local and every operand-stack slot in a Variable so straight-line code can overwrite
// them freely; liveness and register allocation need single definitions instead. The pass
// records the last Set of each variable per block, then resolves every Get: a Set earlier in
// the same block wins, otherwise the value at block entry is looked up through the unique
// predecessor chain, and a block with several predecessors gets a new Phi fed by an Upsilon
// at the end of each predecessor. The phi is memoised before its inputs are resolved so that
// loops terminate. Resolved Gets become Identity values, Sets become Nops, and a final sweep
// rewires every use past the identities and drops both from the blocks.

//! Variable elimination into Phi/Upsilon form.

use super::procedure::Procedure;
use super::types::{BlockId, Origin, Type, ValueId, VariableId};
use super::value::{Edge, Opcode};
use hashbrown::{HashMap, HashSet};

struct SsaFixer<'p> {
    proc: &'p mut Procedure,
    last_def: HashMap<(BlockId, VariableId), ValueId>,
    head_def: HashMap<(BlockId, VariableId), ValueId>,
    new_phis: Vec<(BlockId, ValueId)>,
    new_upsilons: Vec<(BlockId, ValueId, ValueId)>,
}

impl<'p> SsaFixer<'p> {
    fn read_at_end(&mut self, var: VariableId, block: BlockId) -> ValueId {
        match self.last_def.get(&(block, var)) {
            Some(&def) => def,
            None => self.read_at_head(var, block),
        }
    }

    fn read_at_head(&mut self, var: VariableId, block: BlockId) -> ValueId {
        let mut chain = Vec::new();
        let mut current = block;

        let result = loop {
            if let Some(&def) = self.head_def.get(&(current, var)) {
                break def;
            }
            let preds = &self.proc.block(current).predecessors;
            match preds.len() {
                0 => break self.undefined(var, current),
                1 => {
                    let pred = preds[0];
                    chain.push(current);
                    if let Some(&def) = self.last_def.get(&(pred, var)) {
                        break def;
                    }
                    current = pred;
                }
                _ => break self.place_phi(var, current),
            }
        };

        for block in chain {
            self.head_def.insert((block, var), result);
        }
        result
    }

    fn place_phi(&mut self, var: VariableId, block: BlockId) -> ValueId {
        let ty = self.proc.variable(var).ty;
        let phi = self.proc.add_detached(block, Opcode::Phi, ty, &[], Origin::default());
        self.head_def.insert((block, var), phi);
        self.new_phis.push((block, phi));

        let mut seen = HashSet::new();
        let preds = self.proc.block(block).predecessors.clone();
        for pred in preds {
            if !seen.insert(pred) {
                continue;
            }
            let input = self.read_at_end(var, pred);
            self.new_upsilons.push((pred, phi, input));
        }
        phi
    }

    /// Read with no reaching definition: only entrypoints get here.
    fn undefined(&mut self, var: VariableId, block: BlockId) -> ValueId {
        let ty = self.proc.variable(var).ty;
        let opcode = match ty {
            Type::Int64 => Opcode::Const64(0),
            Type::Float => Opcode::ConstFloat(0),
            Type::Double => Opcode::ConstDouble(0),
            Type::V128 => Opcode::ConstVector(0),
            _ => Opcode::Const32(0),
        };
        log::trace!("{} read before any write in {}", var, block);
        let zero = self.proc.insert(block, 0, opcode, ty, &[], Origin::default());
        self.head_def.insert((block, var), zero);
        zero
    }
}

/// Replace every `Get`/`Set` with direct uses and Phi/Upsilon joins.
///
/// Returns the number of phis created.
pub fn fix_ssa(proc: &mut Procedure) -> usize {
    proc.recompute_predecessors();
    let blocks: Vec<BlockId> = proc.live_blocks().collect();

    let mut last_def = HashMap::new();
    for &block in &blocks {
        for &value in &proc.block(block).values {
            let data = proc.value(value);
            if let Opcode::Set(var) = data.opcode {
                last_def.insert((block, var), data.child(0));
            }
        }
    }

    let mut fixer = SsaFixer {
        proc,
        last_def,
        head_def: HashMap::new(),
        new_phis: Vec::new(),
        new_upsilons: Vec::new(),
    };

    for &block in &blocks {
        let mut current: HashMap<VariableId, ValueId> = HashMap::new();
        let values = fixer.proc.block(block).values.clone();
        for value in values {
            match fixer.proc.value(value).opcode {
                Opcode::Set(var) => {
                    current.insert(var, fixer.proc.value(value).child(0));
                    let data = fixer.proc.value_mut(value);
                    data.opcode = Opcode::Nop;
                    data.children.clear();
                }
                Opcode::Get(var) => {
                    let def = match current.get(&var) {
                        Some(&def) => def,
                        None => fixer.read_at_head(var, block),
                    };
                    let data = fixer.proc.value_mut(value);
                    data.opcode = Opcode::Identity;
                    data.children = vec![Edge::new(def)];
                }
                _ => {}
            }
        }
    }

    let SsaFixer {
        proc,
        new_phis,
        new_upsilons,
        ..
    } = fixer;

    for &(block, phi) in &new_phis {
        proc.block_mut(block).values.insert(0, phi);
    }
    for (pred, phi, input) in new_upsilons {
        let position = proc.block(pred).values.len().saturating_sub(1);
        let origin = proc.value(phi).origin;
        proc.insert(pred, position, Opcode::Upsilon(phi), Type::Void, &[input], origin);
    }

    let resolve = |proc: &Procedure, mut value: ValueId| {
        while proc.value(value).opcode == Opcode::Identity {
            value = proc.value(value).child(0);
        }
        value
    };
    for block in proc.live_blocks().collect::<Vec<_>>() {
        for value in proc.block(block).values.clone() {
            let resolved: Vec<ValueId> = proc
                .value(value)
                .child_ids()
                .map(|child| resolve(proc, child))
                .collect();
            for (edge, target) in proc.value_mut(value).children.iter_mut().zip(resolved) {
                edge.value = target;
            }
        }
    }
    proc.remove_values_where(|v| matches!(v.opcode, Opcode::Identity | Opcode::Nop));

    log::debug!("ssa: {} phis, {} blocks", new_phis.len(), blocks.len());
    new_phis.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, CompareOp, EntrypointKind, Frequency};

    #[test]
    fn test_straight_line_get_resolves_to_set() {
        let mut proc = Procedure::new();
        let entry = proc.add_block(Frequency::Normal);
        proc.add_entrypoint(entry, EntrypointKind::Function);
        let o = Origin::default();
        let var = proc.add_variable(Type::Int32);

        let c = proc.append(entry, Opcode::Const32(4), Type::Int32, &[], o);
        proc.append(entry, Opcode::Set(var), Type::Void, &[c], o);
        let get = proc.append(entry, Opcode::Get(var), Type::Int32, &[], o);
        let ret = proc.append_terminal(entry, Opcode::Return, &[get], &[], o);

        assert_eq!(fix_ssa(&mut proc), 0);
        assert_eq!(proc.value(ret).child(0), c);
        assert_eq!(proc.block(entry).values, vec![c, ret]);
        assert!(proc.validate().is_ok());
    }

    #[test]
    fn test_loop_variable_gets_phi() {
        // entry: x = 10; jump loop
        // loop:  x = x - 1; branch x > 0 -> loop, exit
        // exit:  return x
        let mut proc = Procedure::new();
        let entry = proc.add_block(Frequency::Normal);
        let body = proc.add_block(Frequency::Normal);
        let exit = proc.add_block(Frequency::Normal);
        proc.add_entrypoint(entry, EntrypointKind::Function);
        let o = Origin::default();
        let x = proc.add_variable(Type::Int32);

        let ten = proc.append(entry, Opcode::Const32(10), Type::Int32, &[], o);
        proc.append(entry, Opcode::Set(x), Type::Void, &[ten], o);
        proc.append_terminal(entry, Opcode::Jump, &[], &[body], o);

        let get = proc.append(body, Opcode::Get(x), Type::Int32, &[], o);
        let one = proc.append(body, Opcode::Const32(1), Type::Int32, &[], o);
        let sub = proc.append(body, Opcode::Binary(BinaryOp::Sub), Type::Int32, &[get, one], o);
        proc.append(body, Opcode::Set(x), Type::Void, &[sub], o);
        let zero = proc.append(body, Opcode::Const32(0), Type::Int32, &[], o);
        let cmp = proc.append(
            body,
            Opcode::Compare(CompareOp::GreaterThan),
            Type::Int32,
            &[sub, zero],
            o,
        );
        proc.append_terminal(body, Opcode::Branch, &[cmp], &[body, exit], o);

        let final_get = proc.append(exit, Opcode::Get(x), Type::Int32, &[], o);
        let ret = proc.append_terminal(exit, Opcode::Return, &[final_get], &[], o);

        assert_eq!(fix_ssa(&mut proc), 1);

        let phi = proc.block(body).values[0];
        assert_eq!(proc.value(phi).opcode, Opcode::Phi);
        assert_eq!(proc.value(sub).child(0), phi);
        assert_eq!(proc.value(ret).child(0), sub);

        let upsilons: Vec<_> = proc
            .live_blocks()
            .flat_map(|b| proc.block(b).values.clone())
            .filter(|&v| proc.value(v).opcode == Opcode::Upsilon(phi))
            .map(|v| proc.value(v).child(0))
            .collect();
        assert_eq!(upsilons.len(), 2);
        assert!(upsilons.contains(&ten));
        assert!(upsilons.contains(&sub));
        assert!(proc.validate().is_ok());
    }
}
