//! Structured control flow.

use super::IrBuilder;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{CompareOp, Frequency, Opcode, SwitchDescriptor, TrapKind, Type, ValueId};
use crate::wasm::control::{ControlData, ControlKind};
use crate::wasm::instruction::BlockType;
use crate::wasm::module_info::{RefType, ValType};
use hashbrown::HashSet;

impl<'a, 'arena> IrBuilder<'a, 'arena> {
    fn frame_params_available(&self, count: usize, operation: &'static str) -> CompileResult<()> {
        let available = self.stack.len() - self.frame_base().min(self.stack.len());
        if available < count {
            return Err(CompileError::StackUnderflow {
                operation,
                needed: count,
                available,
            });
        }
        Ok(())
    }

    /// Index of the innermost open frame.
    pub(super) fn innermost_control(&self, operation: &str) -> CompileResult<usize> {
        self.controls.len().checked_sub(1).ok_or_else(|| {
            CompileError::validation(format!("{} outside any control frame", operation))
        })
    }

    pub fn add_block(&mut self, block_type: BlockType) -> CompileResult<()> {
        let (params, results) = self.block_signature(block_type)?;
        self.frame_params_available(params.len(), "block")?;
        let continuation = self.new_block(Frequency::Normal);
        let phis = self.make_phis(continuation, &results);
        let height = self.stack.len() - params.len();
        let mut data = ControlData::new(ControlKind::Block, params, results, continuation, height);
        data.phis = phis;
        self.controls.push(data);
        Ok(())
    }

    pub fn add_loop(&mut self, block_type: BlockType) -> CompileResult<()> {
        let (params, results) = self.block_signature(block_type)?;
        let initial = self.pop_n(params.len(), "loop")?;
        let body = self.new_block(Frequency::Normal);
        let continuation = self.new_block(Frequency::Normal);
        let phis = self.make_phis(body, &params);
        self.unify(&phis, &initial);
        self.jump(body);

        self.current = body;
        for &phi in &phis {
            self.compilation.procedure.append_existing(body, phi);
        }
        let height = self.stack.len();
        for (&phi, &ty) in phis.iter().zip(params.iter()) {
            self.push(phi, ty);
        }

        // Only the outer function's loops are numbered; inlined loops
        // have no OSR entry.
        let loop_index = if self.is_inlinee() {
            None
        } else {
            self.compilation.loop_count += 1;
            Some(self.compilation.loop_count - 1)
        };
        let mut data = ControlData::new(ControlKind::Loop, params, results, continuation, height);
        data.special = Some(body);
        data.phis = phis;
        data.loop_index = loop_index;
        self.controls.push(data);
        let index = self.controls.len() - 1;
        log::trace!("loop {:?} body {}", loop_index, body);

        if loop_index.is_some() && self.options.osr_entry_loop == loop_index {
            self.build_osr_entry(index)?;
        }
        if self.options.enable_tier_up {
            self.emit_loop_tier_up_check(index);
        }
        Ok(())
    }

    pub fn add_if(&mut self, block_type: BlockType) -> CompileResult<()> {
        let (params, results) = self.block_signature(block_type)?;
        let condition = self.pop("if")?;
        let else_params = self.peek_n(params.len(), "if")?;
        let taken = self.new_block(Frequency::Normal);
        let not_taken = self.new_block(Frequency::Normal);
        let continuation = self.new_block(Frequency::Normal);
        self.terminate(Opcode::Branch, &[condition], &[taken, not_taken]);
        self.current = taken;

        let phis = self.make_phis(continuation, &results);
        let height = self.stack.len() - params.len();
        let mut data = ControlData::new(ControlKind::If, params, results, continuation, height);
        data.special = Some(not_taken);
        data.phis = phis;
        data.else_params = else_params;
        self.controls.push(data);
        Ok(())
    }

    pub fn add_else(&mut self) -> CompileResult<()> {
        let index = self.innermost_control("else")?;
        let results = self.controls[index].results.len();
        let expected = self.controls[index].stack_height + results;
        if self.stack.len() != expected {
            return Err(CompileError::InvalidArity {
                operation: "else",
                expected: results,
                actual: self.stack.len().saturating_sub(self.controls[index].stack_height),
            });
        }
        let values = self.pop_n(results, "else")?;
        let phis = self.controls[index].phis.clone();
        self.unify(&phis, &values);
        self.jump(self.controls[index].continuation);
        self.enter_else(index)
    }

    pub fn add_else_to_unreachable(&mut self) -> CompileResult<()> {
        let index = self.innermost_control("else")?;
        self.enter_else(index)
    }

    fn enter_else(&mut self, index: usize) -> CompileResult<()> {
        let not_taken = self.controls[index]
            .special
            .ok_or_else(|| CompileError::validation("else without matching if"))?;
        self.controls[index].convert_if_to_block()?;
        self.current = not_taken;
        self.stack.truncate(self.controls[index].stack_height);
        let params = self.controls[index].params.clone();
        let values = std::mem::take(&mut self.controls[index].else_params);
        for (value, ty) in values.into_iter().zip(params) {
            self.push(value, ty);
        }
        Ok(())
    }

    pub fn add_end(&mut self) -> CompileResult<()> {
        self.end_frame(true)
    }

    pub fn add_end_to_unreachable(&mut self) -> CompileResult<()> {
        self.end_frame(false)
    }

    fn end_frame(&mut self, reachable: bool) -> CompileResult<()> {
        let data = self
            .controls
            .pop()
            .ok_or_else(|| CompileError::validation("end without open frame"))?;

        if reachable {
            let expected = data.stack_height + data.results.len();
            if self.stack.len() != expected {
                return Err(CompileError::InvalidArity {
                    operation: "end",
                    expected: data.results.len(),
                    actual: self.stack.len().saturating_sub(data.stack_height),
                });
            }
        }

        if data.is_try() {
            self.exit_try_region();
        }

        if data.is_loop() {
            // Results stay in their stack cells; only fallthrough reaches the continuation.
            if reachable {
                self.jump(data.continuation);
            } else {
                self.stack.truncate(data.stack_height);
                for &ty in &data.results {
                    self.push_unset(ty);
                }
            }
            self.current = data.continuation;
            return Ok(());
        }

        if reachable {
            let values = self.pop_n(data.results.len(), "end")?;
            self.unify(&data.phis, &values);
            self.jump(data.continuation);
        }

        if data.kind == ControlKind::If {
            // No else arm: the parameters flow through unchanged.
            if let Some(not_taken) = data.special {
                self.current = not_taken;
                self.unify(&data.phis, &data.else_params);
                self.jump(data.continuation);
            }
        }

        self.current = data.continuation;
        self.stack.truncate(data.stack_height);

        if data.kind == ControlKind::TopLevel {
            if self.is_inlinee() {
                // The caller owns the continuation and places the phis.
                return Ok(());
            }
            for &phi in &data.phis {
                self.compilation.procedure.append_existing(data.continuation, phi);
            }
            self.terminate(Opcode::Return, &data.phis, &[]);
            return Ok(());
        }

        for &phi in &data.phis {
            self.compilation.procedure.append_existing(data.continuation, phi);
        }
        for (&phi, &ty) in data.phis.iter().zip(data.results.iter()) {
            self.push(phi, ty);
        }
        Ok(())
    }

    /// Upsilons for a branch to the frame at `index` with `values`.
    fn feed_branch_target(&mut self, index: usize, values: &[ValueId]) {
        let phis = self.controls[index].phis.clone();
        self.unify(&phis, values);
    }

    pub fn add_br(&mut self, depth: u32) -> CompileResult<()> {
        let index = self.control_index(depth)?;
        let arity = self.controls[index].branch_types().len();
        let values = self.pop_n(arity, "br")?;
        self.feed_branch_target(index, &values);
        self.jump(self.controls[index].branch_target());
        Ok(())
    }

    pub fn add_br_if(&mut self, depth: u32) -> CompileResult<()> {
        let index = self.control_index(depth)?;
        let condition = self.pop("br_if")?;
        let arity = self.controls[index].branch_types().len();
        let values = self.peek_n(arity, "br_if")?;
        self.feed_branch_target(index, &values);
        let fallthrough = self.new_block(Frequency::Normal);
        let target = self.controls[index].branch_target();
        self.terminate(Opcode::Branch, &[condition], &[target, fallthrough]);
        self.current = fallthrough;
        Ok(())
    }

    /// Lowered to a Switch over `0..targets.len()` with the default last.
    pub fn add_br_table(&mut self, targets: &[u32], default: u32) -> CompileResult<()> {
        let index = self.pop("br_table")?;
        let default_index = self.control_index(default)?;
        let arity = self.controls[default_index].branch_types().len();
        let values = self.peek_n(arity, "br_table")?;

        let mut successors = Vec::with_capacity(targets.len() + 1);
        let mut fed = HashSet::new();
        for &depth in targets.iter().chain(std::iter::once(&default)) {
            let target = self.control_index(depth)?;
            if self.controls[target].branch_types().len() != arity {
                return Err(CompileError::InvalidArity {
                    operation: "br_table",
                    expected: arity,
                    actual: self.controls[target].branch_types().len(),
                });
            }
            if fed.insert(target) {
                self.feed_branch_target(target, &values);
            }
            successors.push(self.controls[target].branch_target());
        }

        let switch = self.compilation.procedure.add_switch(SwitchDescriptor {
            cases: (0..targets.len() as i64).collect(),
        });
        self.terminate(Opcode::Switch(switch), &[index], &successors);
        Ok(())
    }

    pub fn add_return(&mut self) -> CompileResult<()> {
        let count = self.signature.results.len();
        let values = self.pop_n(count, "return")?;
        if self.is_inlinee() {
            self.feed_branch_target(0, &values);
            self.jump(self.controls[0].continuation);
        } else {
            self.terminate(Opcode::Return, &values, &[]);
        }
        Ok(())
    }

    pub fn add_unreachable(&mut self) -> CompileResult<()> {
        self.terminate(Opcode::Trap(TrapKind::Unreachable), &[], &[]);
        Ok(())
    }

    pub fn add_nop(&mut self) -> CompileResult<()> {
        Ok(())
    }

    /// Branch with the remaining operands when the reference is null.
    pub fn add_br_on_null(&mut self, depth: u32) -> CompileResult<()> {
        let index = self.control_index(depth)?;
        let (reference, ty) = self.pop_entry("br_on_null")?;
        let arity = self.controls[index].branch_types().len();
        let values = self.peek_n(arity, "br_on_null")?;
        let is_null = self.is_null(reference);
        self.feed_branch_target(index, &values);
        let fallthrough = self.new_block(Frequency::Normal);
        let target = self.controls[index].branch_target();
        self.terminate(Opcode::Branch, &[is_null], &[target, fallthrough]);
        self.current = fallthrough;
        self.push(reference, non_null(ty));
        Ok(())
    }

    /// Branch with the reference when it is not null; drop it otherwise.
    pub fn add_br_on_non_null(&mut self, depth: u32) -> CompileResult<()> {
        let index = self.control_index(depth)?;
        let (reference, _) = self.pop_entry("br_on_non_null")?;
        let arity = self.controls[index].branch_types().len();
        if arity == 0 {
            return Err(CompileError::InvalidArity {
                operation: "br_on_non_null",
                expected: 1,
                actual: 0,
            });
        }
        let mut values = self.peek_n(arity - 1, "br_on_non_null")?;
        values.push(reference);
        let zero = self.const64(0);
        let non_null = self.compare(CompareOp::NotEqual, reference, zero);
        self.feed_branch_target(index, &values);
        let fallthrough = self.new_block(Frequency::Normal);
        let target = self.controls[index].branch_target();
        self.terminate(Opcode::Branch, &[non_null], &[target, fallthrough]);
        self.current = fallthrough;
        Ok(())
    }

    /// Branch with the reference when the cast succeeds, or when it fails
    /// for `on_fail`. The reference stays on the stack either way.
    pub fn add_br_on_cast(&mut self, depth: u32, to: RefType, on_fail: bool) -> CompileResult<()> {
        let index = self.control_index(depth)?;
        let (reference, ty) = self.pop_entry("br_on_cast")?;
        let arity = self.controls[index].branch_types().len();
        if arity == 0 {
            return Err(CompileError::InvalidArity {
                operation: "br_on_cast",
                expected: 1,
                actual: 0,
            });
        }
        let mut values = self.peek_n(arity - 1, "br_on_cast")?;
        values.push(reference);
        let passes = self.emit_ref_test(reference, to)?;
        let condition = if on_fail {
            self.emit(Opcode::EqualZero, Type::Int32, &[passes])
        } else {
            passes
        };
        self.feed_branch_target(index, &values);
        let fallthrough = self.new_block(Frequency::Normal);
        let target = self.controls[index].branch_target();
        self.terminate(Opcode::Branch, &[condition], &[target, fallthrough]);
        self.current = fallthrough;
        self.push(reference, ty);
        Ok(())
    }
}

fn non_null(ty: ValType) -> ValType {
    match ty {
        ValType::Ref(r) => ValType::Ref(RefType { nullable: false, heap: r.heap }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use crate::core::options::CompilerOptions;
    use crate::core::test_utils::test::TestContext;
    use crate::ir::interp::{Interpreter, NoCalls, Outcome};
    use crate::ir::{fix_ssa, CompareOp, Opcode};
    use crate::wasm::builder::IrBuilder;
    use crate::wasm::compilation::Compilation;
    use crate::wasm::control::ControlKind;
    use crate::wasm::instruction::{BlockType, NumType, NumericOp};
    use crate::wasm::module_info::{FunctionBody, FunctionType, ModuleInformation, TypeDefinition, ValType};

    fn unary_module() -> ModuleInformation {
        ModuleInformation {
            types: vec![TypeDefinition::Func(FunctionType::new(
                vec![ValType::I32],
                vec![ValType::I32],
            ))],
            functions: vec![FunctionBody { type_index: 0, locals: vec![], code: vec![] }],
            ..Default::default()
        }
    }

    fn run(compilation: &mut Compilation, arg: i32) -> Outcome {
        fix_ssa(&mut compilation.procedure);
        Interpreter::new(&compilation.procedure)
            .run(&[arg as u32 as u128], &mut NoCalls)
            .unwrap()
    }

    #[test]
    fn test_if_else_joins_through_one_phi() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = unary_module();
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            b.add_local_get(0).unwrap();
            b.add_i32_const(0).unwrap();
            b.add_numeric(NumericOp::Compare(NumType::I32, CompareOp::Equal)).unwrap();
            b.add_if(BlockType::Value(ValType::I32)).unwrap();
            assert_eq!(b.controls.last().unwrap().kind, ControlKind::If);
            assert_eq!(b.controls.last().unwrap().phis.len(), 1);
            b.add_i32_const(1).unwrap();
            b.add_else().unwrap();
            assert_eq!(b.controls.last().unwrap().kind, ControlKind::Block);
            b.add_i32_const(2).unwrap();
            b.add_end().unwrap();
            assert_eq!(b.stack_height(), 1);
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        assert_eq!(run(&mut compilation.clone(), 0), Outcome::Return(vec![1]));
        assert_eq!(run(&mut compilation, 9), Outcome::Return(vec![2]));
    }

    #[test]
    fn test_if_without_else_forwards_params() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut module = unary_module();
        module.types.push(TypeDefinition::Func(FunctionType::new(
            vec![ValType::I32],
            vec![ValType::I32],
        )));
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            // local.get 0; local.get 0; if (param i32) (result i32) i32.const 10 i32.add end
            b.add_local_get(0).unwrap();
            b.add_local_get(0).unwrap();
            b.add_if(BlockType::Index(1)).unwrap();
            b.add_i32_const(10).unwrap();
            b.add_numeric(NumericOp::Binary(NumType::I32, crate::ir::BinaryOp::Add)).unwrap();
            b.add_end().unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        assert_eq!(run(&mut compilation.clone(), 0), Outcome::Return(vec![0]));
        assert_eq!(run(&mut compilation, 5), Outcome::Return(vec![15]));
    }

    #[test]
    fn test_br_table_selects_target_and_default() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = unary_module();
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            // block block block (local.get 0; br_table 0 1 2) return 10 end return 11 end return 12 end i32.const 13
            b.add_block(BlockType::Empty).unwrap();
            b.add_block(BlockType::Empty).unwrap();
            b.add_block(BlockType::Empty).unwrap();
            b.add_local_get(0).unwrap();
            b.add_br_table(&[0, 1], 2).unwrap();
            b.add_end_to_unreachable().unwrap();
            b.add_i32_const(10).unwrap();
            b.add_return().unwrap();
            b.add_end_to_unreachable().unwrap();
            b.add_i32_const(11).unwrap();
            b.add_return().unwrap();
            b.add_end_to_unreachable().unwrap();
            b.add_i32_const(12).unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        let switches = compilation.procedure.count_values(|op| matches!(op, Opcode::Switch(_)));
        assert_eq!(switches, 1);
        assert_eq!(run(&mut compilation.clone(), 0), Outcome::Return(vec![10]));
        assert_eq!(run(&mut compilation.clone(), 1), Outcome::Return(vec![11]));
        assert_eq!(run(&mut compilation.clone(), 2), Outcome::Return(vec![12]));
        assert_eq!(run(&mut compilation, 77), Outcome::Return(vec![12]));
    }

    #[test]
    fn test_end_checks_result_arity() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = unary_module();
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
        b.add_block(BlockType::Value(ValType::I32)).unwrap();
        assert!(b.add_end().is_err());
    }

    #[test]
    fn test_else_after_final_end_is_rejected() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = unary_module();
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
        b.add_local_get(0).unwrap();
        b.add_end().unwrap();
        assert!(b.add_else().is_err());
        assert!(b.add_else_to_unreachable().is_err());
        assert!(b.add_end().is_err());
    }
}
