//! Textual dump of a procedure.

use super::procedure::{EntrypointKind, Procedure};
use super::types::ValueId;
use crate::core::liveness::FlowIndex;
use std::fmt;

fn write_set(f: &mut fmt::Formatter<'_>, label: &str, set: &[FlowIndex]) -> fmt::Result {
    write!(f, "    {}: {{", label)?;
    for (i, index) in set.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", index)?;
    }
    writeln!(f, "}}")
}

impl Procedure {
    fn write_value(&self, f: &mut fmt::Formatter<'_>, id: ValueId) -> fmt::Result {
        let value = self.value(id);
        write!(f, "    {}: {} = {}(", id, value.ty, value.opcode)?;
        for (i, edge) in value.children.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            // '!' marks the last use on this path
            write!(f, "{}{}", edge.value, if edge.kill { "!" } else { "" })?;
        }
        write!(f, ")")?;
        if let super::value::Opcode::Call(call) = value.opcode {
            let desc = self.call(call);
            write!(f, " {:?} site={}", desc.kind, desc.call_site)?;
        }
        if let super::value::Opcode::Patchpoint(pp) = value.opcode {
            let desc = self.patchpoint(pp);
            write!(f, " {:?}", desc.kind)?;
            if let Some(map) = desc.stack_map {
                write!(f, " stackmap={}", map)?;
            }
        }
        writeln!(f)
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.entrypoints() {
            match entry.kind {
                EntrypointKind::Function => writeln!(f, "entry: {}", entry.block)?,
                EntrypointKind::Catch { handler } => {
                    writeln!(f, "catch entry: {} (handler {})", entry.block, handler)?
                }
                EntrypointKind::Osr { loop_index } => {
                    writeln!(f, "osr entry: {} (loop {})", entry.block, loop_index)?
                }
            }
        }

        for block in self.blocks().iter().filter(|b| !b.dead) {
            write!(f, "{}:", block.id)?;
            if !block.predecessors.is_empty() {
                write!(f, " preds =")?;
                for pred in &block.predecessors {
                    write!(f, " {}", pred)?;
                }
            }
            if block.frequency == super::block::Frequency::Rare {
                write!(f, " (rare)")?;
            }
            writeln!(f)?;
            if !block.live_at_head.is_empty() {
                write_set(f, "live at head", &block.live_at_head)?;
            }
            for &value in &block.values {
                self.write_value(f, value)?;
            }
            if !block.successors.is_empty() {
                write!(f, "    ->")?;
                for succ in &block.successors {
                    write!(f, " {}", succ)?;
                }
                writeln!(f)?;
            }
            if !block.live_at_tail.is_empty() {
                write_set(f, "live at tail", &block.live_at_tail)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::{EntrypointKind, Frequency, Opcode, Origin, Procedure, Type};

    #[test]
    fn test_dump_lists_blocks_and_values() {
        let mut proc = Procedure::new();
        let entry = proc.add_block(Frequency::Normal);
        proc.add_entrypoint(entry, EntrypointKind::Function);
        let c = proc.append(entry, Opcode::Const32(42), Type::Int32, &[], Origin::default());
        proc.append_terminal(entry, Opcode::Return, &[c], &[], Origin::default());
        proc.value_mut(crate::ir::ValueId(1)).children[0].kill = true;

        let text = proc.to_string();
        assert!(text.contains("entry: bb0"));
        assert!(text.contains("v0: i32 = Const32(42)()"));
        assert!(text.contains("v1: void = Return(v0!)"));
    }
}
