//! Try regions, handler landing pads and the state they restore.

use super::IrBuilder;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{
    CallKind, EntrypointKind, Frequency, Opcode, RuntimeOperation, Type, ValueId, VariableId,
};
use crate::wasm::control::{CatchKind, ControlData, ControlKind};
use crate::wasm::instance;
use crate::wasm::instruction::BlockType;
use crate::wasm::stackmap::{ExceptionHandler, HandlerKind, ScratchLayout, StackMap};

impl<'a, 'arena> IrBuilder<'a, 'arena> {
    // ==== STATE CAPTURE ====

    /// Variables live across an unwind into the frame at `upto`: caller
    /// state, locals, then every frame below `upto` with its operand cells
    /// and its caught exception.
    pub(super) fn state_prefix(&self, upto: usize) -> Vec<(VariableId, Type)> {
        let procedure = &self.compilation.procedure;
        let mut state: Vec<(VariableId, Type)> = Vec::new();
        if let Some(frame) = &self.inline {
            state.extend(frame.parent_state.iter().map(|&v| (v, procedure.variable(v).ty)));
        }
        state.extend(self.locals.iter().map(|&(v, ty)| (v, ty.to_ir())));
        for index in 0..upto.min(self.controls.len()) {
            let start = self.controls[index].stack_height.min(self.stack.len());
            let end = self
                .controls
                .get(index + 1)
                .map_or(self.stack.len(), |next| next.stack_height)
                .min(self.stack.len());
            for entry in &self.stack[start..end.max(start)] {
                state.push((entry.var, entry.ty.to_ir()));
            }
            if let Some(exception) = self.controls[index].exception() {
                state.push((exception, Type::POINTER));
            }
        }
        state
    }

    /// Everything a stack map at the current point preserves.
    pub(super) fn full_state(&self) -> Vec<(VariableId, Type)> {
        let innermost = self.controls.len().saturating_sub(1);
        let mut state = self.state_prefix(innermost);
        let base = self.frame_base().min(self.stack.len());
        for entry in &self.stack[base..] {
            state.push((entry.var, entry.ty.to_ir()));
        }
        state
    }

    /// Read the full state when an exception raised here could be caught
    /// in this compilation.
    pub(super) fn capture_for_unwind(&mut self) -> Option<(Vec<ValueId>, ScratchLayout)> {
        if self.compilation.try_depth == 0 {
            return None;
        }
        Some(self.read_state(&self.full_state()))
    }

    pub(super) fn read_state(&mut self, state: &[(VariableId, Type)]) -> (Vec<ValueId>, ScratchLayout) {
        let values = state
            .iter()
            .map(|&(var, ty)| self.emit(Opcode::Get(var), ty, &[]))
            .collect();
        let layout = self.entry_layout(state.iter().map(|&(_, ty)| ty).collect());
        (values, layout)
    }

    /// Entry buffer layout in the function-wide slot width.
    pub(super) fn entry_layout(&self, types: Vec<Type>) -> ScratchLayout {
        ScratchLayout::with_slot_size(types, self.compilation.entry_slot_size)
    }

    pub(super) fn record_stack_map(
        &mut self,
        call_site: Option<u32>,
        owner: ValueId,
        first_child: u32,
        layout: ScratchLayout,
    ) -> u32 {
        self.session.record_stack_map();
        self.compilation.stack_maps.push(StackMap {
            call_site,
            owner,
            first_child,
            layout,
        });
        (self.compilation.stack_maps.len() - 1) as u32
    }

    /// Load `state` from the entry buffer into its variables.
    pub(super) fn restore_state(&mut self, state: &[(VariableId, Type)], layout: &ScratchLayout) -> ValueId {
        let buffer = self.emit(Opcode::EntryBuffer, Type::POINTER, &[]);
        for (slot, &(var, ty)) in state.iter().enumerate() {
            let value = self.load(ty, ty.size_bytes() as u8, false, buffer, layout.offset(slot) as i32);
            self.emit(Opcode::Set(var), Type::Void, &[value]);
        }
        buffer
    }

    // ==== TRY REGIONS ====

    pub(super) fn exit_try_region(&mut self) {
        self.compilation.try_depth = self.compilation.try_depth.saturating_sub(1);
    }

    pub fn add_try(&mut self, block_type: BlockType) -> CompileResult<()> {
        let (params, results) = self.block_signature(block_type)?;
        let available = self.stack.len() - self.frame_base().min(self.stack.len());
        if available < params.len() {
            return Err(CompileError::StackUnderflow {
                operation: "try",
                needed: params.len(),
                available,
            });
        }
        let continuation = self.new_block(Frequency::Normal);
        let phis = self.make_phis(continuation, &results);
        let height = self.stack.len() - params.len();

        self.compilation.try_depth += 1;
        let mut data = ControlData::new(ControlKind::Try, params, results, continuation, height);
        data.phis = phis;
        data.try_depth = self.compilation.try_depth;
        data.try_start = self.compilation.call_site_count;
        self.controls.push(data);
        Ok(())
    }

    pub fn add_catch(&mut self, tag: u32) -> CompileResult<()> {
        self.close_clause("catch")?;
        self.enter_catch(CatchKind::Catch, Some(tag))
    }

    pub fn add_catch_to_unreachable(&mut self, tag: u32) -> CompileResult<()> {
        self.enter_catch(CatchKind::Catch, Some(tag))
    }

    pub fn add_catch_all(&mut self) -> CompileResult<()> {
        self.close_clause("catch_all")?;
        self.enter_catch(CatchKind::CatchAll, None)
    }

    pub fn add_catch_all_to_unreachable(&mut self) -> CompileResult<()> {
        self.enter_catch(CatchKind::CatchAll, None)
    }

    /// Fall through from the try body or previous clause to the continuation.
    fn close_clause(&mut self, operation: &'static str) -> CompileResult<()> {
        let index = self.innermost_control(operation)?;
        let count = self.controls[index].results.len();
        let height = self.controls[index].stack_height;
        if self.stack.len() != height + count {
            return Err(CompileError::InvalidArity {
                operation,
                expected: count,
                actual: self.stack.len().saturating_sub(height),
            });
        }
        let values = self.pop_n(count, operation)?;
        let phis = self.controls[index].phis.clone();
        self.unify(&phis, &values);
        self.jump(self.controls[index].continuation);
        Ok(())
    }

    fn enter_catch(&mut self, kind: CatchKind, tag: Option<u32>) -> CompileResult<()> {
        let index = self.innermost_control("catch")?;
        let exception = self.compilation.procedure.add_variable(Type::POINTER);
        let closes_region = self.controls[index].convert_to_catch(kind, exception)?;
        if closes_region {
            self.controls[index].try_end = self.compilation.call_site_count;
            self.exit_try_region();
        }

        let prefix = self.state_prefix(index);
        let mut types: Vec<Type> = prefix.iter().map(|&(_, ty)| ty).collect();
        types.push(Type::POINTER);
        let layout = self.entry_layout(types);

        let handler_kind = match tag {
            Some(tag) => HandlerKind::Catch { tag },
            None => HandlerKind::CatchAll,
        };
        let entry = self.new_block(Frequency::Rare);
        let handler_block = self.new_block(Frequency::Normal);
        let handler_index = self.compilation.handlers.len() as u32;
        let entrypoint = self
            .compilation
            .procedure
            .add_entrypoint(entry, EntrypointKind::Catch { handler: handler_index });
        let data = &self.controls[index];
        self.compilation.handlers.push(ExceptionHandler {
            kind: handler_kind,
            start: data.try_start,
            end: data.try_end,
            try_depth: data.try_depth,
            entrypoint: Some(entrypoint),
        });
        log::trace!(
            "handler {} {:?} covers call sites {}..{}",
            handler_index,
            handler_kind,
            data.try_start,
            data.try_end
        );

        self.current = entry;
        let buffer = self.restore_state(&prefix, &layout);
        let caught = self.load_pointer(buffer, layout.offset(prefix.len()) as i32);
        self.emit(Opcode::Set(exception), Type::Void, &[caught]);
        self.jump(handler_block);

        self.current = handler_block;
        self.stack.truncate(self.controls[index].stack_height);
        if let Some(tag) = tag {
            let payload = self.module.tag_type(tag)?.params.clone();
            let slots = ScratchLayout::new(payload.iter().map(|t| t.to_ir()).collect());
            let object = self.emit(Opcode::Get(exception), Type::POINTER, &[]);
            for (i, ty) in payload.into_iter().enumerate() {
                let ir = ty.to_ir();
                let offset = instance::EXCEPTION_PAYLOAD + slots.offset(i) as i32;
                let value = self.load(ir, ir.size_bytes() as u8, false, object, offset);
                self.push(value, ty);
            }
        }
        Ok(())
    }

    pub fn add_delegate(&mut self, depth: u32) -> CompileResult<()> {
        self.delegate(depth, true)
    }

    pub fn add_delegate_to_unreachable(&mut self, depth: u32) -> CompileResult<()> {
        self.delegate(depth, false)
    }

    fn delegate(&mut self, depth: u32, reachable: bool) -> CompileResult<()> {
        let index = self.innermost_control("delegate")?;
        if !self.controls[index].is_try() {
            return Err(CompileError::validation(format!(
                "delegate closes a {:?} frame",
                self.controls[index].kind
            )));
        }
        if reachable {
            self.close_clause("delegate")?;
        }
        let Some(data) = self.controls.pop() else {
            return Err(CompileError::internal("delegate lost its frame"));
        };
        let try_end = self.compilation.call_site_count;
        self.exit_try_region();

        // Trys still open at or outside the target keep their depth.
        let target = self.control_index(depth)?;
        let open_inside = self.controls[target + 1..]
            .iter()
            .filter(|c| c.is_try())
            .count() as u32;
        let target_depth = self.compilation.try_depth.saturating_sub(open_inside);
        self.compilation.handlers.push(ExceptionHandler {
            kind: HandlerKind::Delegate { target_depth },
            start: data.try_start,
            end: try_end,
            try_depth: data.try_depth,
            entrypoint: None,
        });

        self.current = data.continuation;
        self.stack.truncate(data.stack_height);
        for &phi in &data.phis {
            self.compilation.procedure.append_existing(data.continuation, phi);
        }
        for (&phi, &ty) in data.phis.iter().zip(data.results.iter()) {
            self.push(phi, ty);
        }
        Ok(())
    }

    pub fn add_throw(&mut self, tag: u32) -> CompileResult<()> {
        let payload = self.module.tag_type(tag)?.params.len();
        let values = self.pop_n(payload, "throw")?;
        let inst = self.instance();
        let tag_value = self.const32(tag as i32);
        let mut operands = vec![inst, tag_value];
        operands.extend(values);
        self.emit_call(CallKind::Operation(RuntimeOperation::Throw), &operands, Vec::new());
        self.terminate(Opcode::Oops, &[], &[]);
        Ok(())
    }

    pub fn add_rethrow(&mut self, depth: u32) -> CompileResult<()> {
        let index = self.control_index(depth)?;
        let exception = self.controls[index].exception().ok_or_else(|| {
            CompileError::validation(format!("rethrow {} does not name a catch clause", depth))
        })?;
        let inst = self.instance();
        let object = self.emit(Opcode::Get(exception), Type::POINTER, &[]);
        self.emit_call(
            CallKind::Operation(RuntimeOperation::Rethrow),
            &[inst, object],
            Vec::new(),
        );
        self.terminate(Opcode::Oops, &[], &[]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::options::CompilerOptions;
    use crate::core::test_utils::test::TestContext;
    use crate::ir::{CallKind, EntrypointKind, Opcode, RuntimeOperation};
    use crate::wasm::builder::IrBuilder;
    use crate::wasm::compilation::Compilation;
    use crate::wasm::instruction::{BlockType, Instruction};
    use crate::wasm::module_info::{
        FunctionBody, FunctionType, ModuleInformation, TagInfo, TypeDefinition, ValType,
    };
    use crate::wasm::stackmap::HandlerKind;

    fn module() -> ModuleInformation {
        let mut module = ModuleInformation {
            types: vec![
                TypeDefinition::Func(FunctionType::new(vec![ValType::I32], vec![ValType::I32])),
                TypeDefinition::Func(FunctionType::new(vec![ValType::I64], vec![])),
            ],
            functions: vec![FunctionBody { type_index: 0, locals: vec![], code: vec![] }],
            tags: vec![TagInfo { type_index: 1 }],
            ..Default::default()
        };
        module.publish_callees();
        module
    }

    #[test]
    fn test_try_depth_returns_to_zero() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module();
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            b.add_try(BlockType::Value(ValType::I32)).unwrap();
            assert_eq!(b.compilation.try_depth, 1);
            b.add_try(BlockType::Empty).unwrap();
            assert_eq!(b.compilation.try_depth, 2);
            b.add_end().unwrap();
            assert_eq!(b.compilation.try_depth, 1);
            b.add_i32_const(1).unwrap();
            b.add_catch(0).unwrap();
            assert_eq!(b.compilation.try_depth, 0);
            b.add_drop().unwrap();
            b.add_i32_const(2).unwrap();
            b.add_catch_all().unwrap();
            b.add_i32_const(3).unwrap();
            b.add_end().unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        assert_eq!(compilation.try_depth(), 0);
        assert_eq!(compilation.handlers.len(), 2);
        let catch_entries = compilation
            .procedure
            .entrypoints()
            .iter()
            .filter(|e| matches!(e.kind, EntrypointKind::Catch { .. }))
            .count();
        assert_eq!(catch_entries, 2);
    }

    #[test]
    fn test_calls_in_try_carry_stack_maps() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module();
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            // Throwing outside any try needs no stack map.
            b.add_block(BlockType::Empty).unwrap();
            b.add_i64_const(7).unwrap();
            b.add_throw(0).unwrap();
            b.add_end_to_unreachable().unwrap();

            b.add_try(BlockType::Empty).unwrap();
            b.add_i32_const(5).unwrap();
            b.add_i64_const(7).unwrap();
            b.add_throw(0).unwrap();
            b.add_catch_to_unreachable(0).unwrap();
            b.add_drop().unwrap();
            b.add_end().unwrap();
            b.add_local_get(0).unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        assert_eq!(compilation.call_site_count(), 2);
        assert_eq!(compilation.stack_maps.len(), 1);
        let map = &compilation.stack_maps[0];
        assert_eq!(map.call_site, Some(1));
        // local 0 plus the i32 left on the operand stack
        assert_eq!(map.layout.len(), 2);

        let handler = compilation.handlers.get(0).unwrap();
        assert_eq!(handler.kind, HandlerKind::Catch { tag: 0 });
        assert!(handler.covers(1));
        assert!(!handler.covers(0));

        let throws = compilation.procedure.calls().iter().filter(|c| {
            c.kind == CallKind::Operation(RuntimeOperation::Throw)
        });
        assert_eq!(throws.count(), 2);
        assert_eq!(compilation.procedure.count_values(|op| *op == Opcode::EntryBuffer), 1);
    }

    #[test]
    fn test_delegate_targets_enclosing_try() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module();
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            b.add_try(BlockType::Empty).unwrap();
            b.add_block(BlockType::Empty).unwrap();
            b.add_try(BlockType::Empty).unwrap();
            b.add_delegate(1).unwrap();
            b.add_end().unwrap();
            b.add_catch_all().unwrap();
            b.add_end().unwrap();

            b.add_try(BlockType::Empty).unwrap();
            b.add_delegate(0).unwrap();
            b.add_local_get(0).unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        let kinds: Vec<HandlerKind> = compilation.handlers.iter().map(|h| h.kind).collect();
        assert_eq!(
            kinds,
            vec![
                HandlerKind::Delegate { target_depth: 1 },
                HandlerKind::CatchAll,
                HandlerKind::Delegate { target_depth: 0 },
            ]
        );
        assert_eq!(compilation.try_depth(), 0);
    }

    #[test]
    fn test_catch_entry_matches_throw_site_slots() {
        let mut module = module();
        // the vector lives only on the try body's stack
        module.functions[0] = FunctionBody {
            type_index: 0,
            locals: vec![ValType::I64],
            code: vec![
                Instruction::Try(BlockType::Empty),
                Instruction::V128Const(1),
                Instruction::I64Const(7),
                Instruction::Throw(0),
                Instruction::Catch(0),
                Instruction::Drop,
                Instruction::End,
                Instruction::LocalGet(0),
                Instruction::End,
            ],
        };
        module.publish_callees();
        let ctx = TestContext::new();
        let compilation = ctx.build(&module, 0, &CompilerOptions::default()).unwrap();

        let map = &compilation.stack_maps[0];
        assert_eq!(map.layout.len(), 3);
        assert_eq!(map.layout.slot_size(), 16);

        let procedure = &compilation.procedure;
        let entry = procedure
            .entrypoints()
            .iter()
            .find(|e| matches!(e.kind, EntrypointKind::Catch { .. }))
            .unwrap();
        let offsets: Vec<u32> = procedure
            .block(entry.block)
            .values
            .iter()
            .filter_map(|&v| match &procedure.value(v).opcode {
                Opcode::Load(access) => Some(access.offset),
                _ => None,
            })
            .collect();
        // both locals, then the caught exception
        assert_eq!(offsets, vec![map.layout.offset(0), map.layout.offset(1), 32]);
    }

    #[test]
    fn test_unbalanced_clauses_are_rejected() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module();
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
        b.add_local_get(0).unwrap();
        b.add_end().unwrap();
        assert!(b.add_catch(0).is_err());
        assert!(b.add_catch_to_unreachable(0).is_err());
        assert!(b.add_catch_all().is_err());
        assert!(b.add_delegate(0).is_err());
        assert!(b.add_delegate_to_unreachable(0).is_err());
    }

    #[test]
    fn test_rethrow_requires_catch_clause() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module();
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
        b.add_block(BlockType::Empty).unwrap();
        assert!(b.add_rethrow(0).is_err());
    }
}
