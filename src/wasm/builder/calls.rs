//! Calls, tail calls and inlining.

use super::{InlineFrame, IrBuilder};
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{
    BinaryOp, CallDescriptor, CallId, CallKind, CompareOp, ConvertOp, Frequency, Opcode,
    PatchpointDescriptor, PatchpointKind, TrapKind, Type, ValueId,
};
use crate::wasm::compilation::{TailCallSite, UnlinkedCall};
use crate::wasm::driver;
use crate::wasm::instance;
use crate::wasm::module_info::{FunctionType, ValType};

impl<'a, 'arena> IrBuilder<'a, 'arena> {
    /// Emit a call with the next call-site index. Inside a try region the
    /// unwind state follows the operands as stack map children.
    pub(super) fn emit_call(
        &mut self,
        kind: CallKind,
        operands: &[ValueId],
        result_types: Vec<Type>,
    ) -> (ValueId, CallId) {
        let call_site = self.compilation.next_call_site();
        let captured = self.capture_for_unwind();
        let arg_types = operands
            .iter()
            .map(|&v| self.compilation.procedure.value(v).ty)
            .collect();
        let result_ty = self.compilation.procedure.result_type(&result_types);
        let call = self.compilation.procedure.add_call(CallDescriptor {
            kind,
            arg_types,
            result_types,
            call_site,
            operand_count: operands.len() as u32,
        });

        let mut children = operands.to_vec();
        if let Some((values, _)) = &captured {
            children.extend_from_slice(values);
        }
        let value = self.emit(Opcode::Call(call), result_ty, &children);
        if let Some((_, layout)) = captured {
            self.record_stack_map(Some(call_site), value, operands.len() as u32, layout);
        }
        (value, call)
    }

    /// Push the results of `call`, unpacking tuples.
    pub(super) fn push_results(&mut self, call: ValueId, results: &[ValType]) {
        match results {
            [] => {}
            [single] => self.push(call, *single),
            many => {
                for (i, &ty) in many.iter().enumerate() {
                    let value = self.emit(Opcode::Extract(i as u16), ty.to_ir(), &[call]);
                    self.push(value, ty);
                }
            }
        }
    }

    pub(super) fn restore_global_state(&mut self) {
        let inst = self.instance();
        self.emit_patchpoint(PatchpointKind::RestoreGlobalState, &[inst], None);
    }

    fn context_switch(&mut self, callee_instance: ValueId) {
        self.emit_patchpoint(PatchpointKind::ContextSwitch, &[callee_instance], None);
    }

    // ==== CALLEE RESOLUTION ====

    /// Instance and code pointer of an imported function.
    fn resolve_import(&mut self, function_index: u32) -> (ValueId, ValueId) {
        let inst = self.instance();
        let imports = self.load_pointer(inst, instance::INSTANCE_IMPORTS);
        let record = function_index as i32 * instance::IMPORT_ENTRY_SIZE;
        let callee_instance = self.load_pointer(imports, record + instance::IMPORT_INSTANCE);
        let code = self.load_pointer(imports, record + instance::IMPORT_CODE);
        (callee_instance, code)
    }

    /// Checked table entry lookup: bounds, null entry, then signature.
    fn resolve_indirect(
        &mut self,
        table_index: u32,
        type_index: u32,
        index: ValueId,
    ) -> CompileResult<(ValueId, ValueId)> {
        self.module.table(table_index)?;
        let table = self.table_pointer(table_index);
        self.check_table_index(table, index, TrapKind::OutOfBoundsCallIndirect);

        let entries = self.load_pointer(table, instance::TABLE_ENTRIES);
        let wide = self.convert(ConvertOp::ZExt32, Type::Int64, index);
        let stride = self.const64(instance::TABLE_ENTRY_SIZE as i64);
        let scaled = self.binary(BinaryOp::Mul, Type::Int64, wide, stride);
        let entry = self.binary(BinaryOp::Add, Type::Int64, entries, scaled);

        let code = self.load_pointer(entry, instance::TABLE_ENTRY_CODE);
        let null = self.is_zero(code);
        self.check(TrapKind::NullTableEntry, null);
        let signature = self.load(Type::Int32, 4, false, entry, instance::TABLE_ENTRY_SIGNATURE);
        let expected = self.const32(type_index as i32);
        let mismatch = self.compare(CompareOp::NotEqual, signature, expected);
        self.check(TrapKind::BadSignature, mismatch);

        let callee_instance = self.load_pointer(entry, instance::TABLE_ENTRY_INSTANCE);
        Ok((callee_instance, code))
    }

    fn resolve_ref(&mut self, reference: ValueId) -> (ValueId, ValueId) {
        let null = self.is_zero(reference);
        self.check(TrapKind::NullReference, null);
        let code = self.load_pointer(reference, instance::FUNC_REF_CODE);
        let callee_instance = self.load_pointer(reference, instance::FUNC_REF_INSTANCE);
        (callee_instance, code)
    }

    // ==== CALLS ====

    pub fn add_call(&mut self, function_index: u32) -> CompileResult<()> {
        let signature = self.module.function_type(function_index)?.clone();
        if self.try_inline(function_index, &signature)? {
            return Ok(());
        }
        let args = self.pop_n(signature.params.len(), "call")?;

        let value = if self.module.is_import(function_index) {
            let (callee_instance, code) = self.resolve_import(function_index);
            self.context_switch(callee_instance);
            let mut operands = vec![callee_instance, code];
            operands.extend(args);
            let kind = CallKind::Import { function_index };
            self.emit_call(kind, &operands, signature.result_types()).0
        } else {
            let mut operands = vec![self.instance()];
            operands.extend(args);
            let kind = CallKind::Direct { function_index };
            let (value, call) = self.emit_call(kind, &operands, signature.result_types());
            self.compilation
                .unlinked_calls
                .push(UnlinkedCall { call, function_index });
            value
        };
        self.restore_global_state();
        self.push_results(value, &signature.results);
        Ok(())
    }

    pub fn add_call_indirect(&mut self, type_index: u32, table_index: u32) -> CompileResult<()> {
        let signature = self.module.function_type_at(type_index)?.clone();
        let index = self.pop("call_indirect")?;
        let args = self.pop_n(signature.params.len(), "call_indirect")?;
        let (callee_instance, code) = self.resolve_indirect(table_index, type_index, index)?;
        self.context_switch(callee_instance);

        let mut operands = vec![callee_instance, code];
        operands.extend(args);
        let kind = CallKind::Indirect { table_index, type_index };
        let (value, _) = self.emit_call(kind, &operands, signature.result_types());
        self.restore_global_state();
        self.push_results(value, &signature.results);
        Ok(())
    }

    pub fn add_call_ref(&mut self, type_index: u32) -> CompileResult<()> {
        let signature = self.module.function_type_at(type_index)?.clone();
        let reference = self.pop("call_ref")?;
        let args = self.pop_n(signature.params.len(), "call_ref")?;
        let (callee_instance, code) = self.resolve_ref(reference);
        self.context_switch(callee_instance);

        let mut operands = vec![callee_instance, code];
        operands.extend(args);
        let (value, _) = self.emit_call(CallKind::Ref { type_index }, &operands, signature.result_types());
        self.restore_global_state();
        self.push_results(value, &signature.results);
        Ok(())
    }

    // ==== TAIL CALLS ====

    fn check_tail_signature(&self, callee: &FunctionType) -> CompileResult<()> {
        if callee.results != self.signature.results {
            return Err(CompileError::validation(format!(
                "tail call result types {:?} differ from the caller's {:?}",
                callee.results, self.signature.results
            )));
        }
        if self.is_inlinee() {
            return Err(CompileError::internal("tail call inside an inlined callee"));
        }
        Ok(())
    }

    /// Replace this frame with the callee's. Nothing after it runs.
    fn emit_tail_call(&mut self, callee: CallKind, operands: &[ValueId], signature: &FunctionType) {
        let tail_call = self.compilation.tail_calls.len() as u32;
        let patchpoint = self.compilation.procedure.add_patchpoint(PatchpointDescriptor {
            kind: PatchpointKind::TailCall { tail_call },
            call_site: None,
            stack_map: None,
        });
        self.emit(Opcode::Patchpoint(patchpoint), Type::Void, operands);
        self.compilation.tail_calls.push(TailCallSite {
            patchpoint,
            callee,
            arg_types: signature.param_types(),
            result_types: signature.result_types(),
        });
        self.terminate(Opcode::Oops, &[], &[]);
    }

    pub fn add_return_call(&mut self, function_index: u32) -> CompileResult<()> {
        if self.module.is_import(function_index) {
            // Imports run on their own instance; call and return instead.
            self.add_call(function_index)?;
            return self.add_return();
        }
        let signature = self.module.function_type(function_index)?.clone();
        self.check_tail_signature(&signature)?;
        let args = self.pop_n(signature.params.len(), "return_call")?;
        let mut operands = vec![self.instance()];
        operands.extend(args);
        self.emit_tail_call(CallKind::Direct { function_index }, &operands, &signature);
        Ok(())
    }

    pub fn add_return_call_indirect(&mut self, type_index: u32, table_index: u32) -> CompileResult<()> {
        let signature = self.module.function_type_at(type_index)?.clone();
        self.check_tail_signature(&signature)?;
        let index = self.pop("return_call_indirect")?;
        let args = self.pop_n(signature.params.len(), "return_call_indirect")?;
        let (callee_instance, code) = self.resolve_indirect(table_index, type_index, index)?;
        self.context_switch(callee_instance);
        let mut operands = vec![callee_instance, code];
        operands.extend(args);
        self.emit_tail_call(CallKind::Indirect { table_index, type_index }, &operands, &signature);
        Ok(())
    }

    pub fn add_return_call_ref(&mut self, type_index: u32) -> CompileResult<()> {
        let signature = self.module.function_type_at(type_index)?.clone();
        self.check_tail_signature(&signature)?;
        let reference = self.pop("return_call_ref")?;
        let args = self.pop_n(signature.params.len(), "return_call_ref")?;
        let (callee_instance, code) = self.resolve_ref(reference);
        self.context_switch(callee_instance);
        let mut operands = vec![callee_instance, code];
        operands.extend(args);
        self.emit_tail_call(CallKind::Ref { type_index }, &operands, &signature);
        Ok(())
    }

    // ==== INLINING ====

    fn should_inline(&self, function_index: u32) -> bool {
        if self.module.is_import(function_index)
            || self.inline_depth() >= self.options.max_inline_depth
            || self.root_size > self.options.max_caller_size_for_inlining
            || self.inline_chain.contains(&function_index)
        {
            return false;
        }
        let Some(info) = self.module.callee_info(function_index) else {
            return false;
        };
        info.size <= self.options.max_inline_size
            && !info.has_tail_calls
            && !self.options.inline_eligibility.can_clobber_instance(function_index)
    }

    /// Translate the callee's body in place of a call. Returns false when
    /// the callee is not eligible.
    fn try_inline(&mut self, function_index: u32, signature: &FunctionType) -> CompileResult<bool> {
        if !self.should_inline(function_index) {
            return Ok(false);
        }
        let module = self.module;
        let body = module.body(function_index)?;
        let arguments = self.pop_n(signature.params.len(), "call")?;
        let parent_state = self.full_state().into_iter().map(|(var, _)| var).collect();
        let continuation = self.new_block(Frequency::Normal);
        let phis = self.make_phis(continuation, &signature.results);
        let frame = InlineFrame {
            parent_state,
            depth: self.inline_depth() + 1,
        };
        log::debug!(
            "inlining function {} into {} at depth {}",
            function_index,
            self.function_index,
            frame.depth
        );

        let mut callee = IrBuilder::new_inlinee(
            &mut *self.compilation,
            module,
            self.options,
            self.session,
            function_index,
            self.current,
            &arguments,
            continuation,
            phis.clone(),
            frame,
            self.inline_chain.clone(),
            self.root_size,
        )?;
        driver::translate(&mut callee, &body.code)?;
        callee.finish()?;

        self.current = continuation;
        for &phi in &phis {
            self.compilation.procedure.append_existing(continuation, phi);
        }
        for (&phi, &ty) in phis.iter().zip(signature.results.iter()) {
            self.push(phi, ty);
        }
        self.session.record_inlined_call();
        self.compilation.inlined_functions.push(function_index);
        Ok(true)
    }
}
