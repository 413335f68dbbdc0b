// This module implements IrBuilder, the translator from decoded wasm instructions into the
// block graph of ir::Procedure. The builder is driven one instruction at a time by
// wasm::driver and keeps three pieces of state: the operand stack, the stack of open control
// frames, and the block it is currently appending to. Every operand stack cell is a Variable
// keyed by (height, type), so pushing a value is a Set and popping it is a Get; cells of
// different types at the same height never share storage, and fix_ssa later turns the
// variables into direct uses and joins. Locals are Variables too. Control frames carry
// Phi values for their branch targets: loop parameters at the loop body head and results at
// the continuation of every other frame; every branch writes Upsilons into them before its
// terminal. The submodules add the instruction families: control flow, calls and inlining,
// exceptions and stack maps, memory and tables, GC references, SIMD, and tier-up checks.
// Runtime failures are never compile errors: they become Check values carrying a TrapKind.

//! Bytecode to block graph translation.

mod calls;
mod control;
mod exceptions;
mod gc;
mod memory;
mod simd;
mod tiering;

use super::compilation::Compilation;
use super::control::{ControlData, ControlKind};
use super::instance;
use super::instruction::{BlockType, NumType, NumericOp};
use super::module_info::{FunctionType, ModuleInformation, ValType};
use super::stackmap::ScratchLayout;
use crate::core::error::{CompileError, CompileResult};
use crate::core::options::CompilerOptions;
use crate::core::session::CompilationSession;
use crate::ir::{
    BinaryOp, BlockId, CompareOp, ConvertOp, EntrypointKind, Frequency, MemoryAccess, Opcode,
    Origin, PatchpointDescriptor, PatchpointKind, PinnedReg, TrapKind, Type, ValueId, VariableId,
};
use hashbrown::HashMap;

/// One operand stack cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StackEntry {
    var: VariableId,
    ty: ValType,
}

/// Links an inlined callee to the frame that inlined it.
#[derive(Debug, Clone)]
struct InlineFrame {
    /// Caller state a stack map inside the callee must also preserve.
    parent_state: Vec<VariableId>,
    depth: u32,
}

/// Translates one function body, or one inlined callee body, into the
/// shared [`Compilation`].
pub struct IrBuilder<'a, 'arena> {
    compilation: &'a mut Compilation,
    module: &'a ModuleInformation,
    options: &'a CompilerOptions,
    session: &'a CompilationSession<'arena>,
    function_index: u32,
    signature: FunctionType,
    locals: Vec<(VariableId, ValType)>,
    stack: Vec<StackEntry>,
    stack_vars: HashMap<(usize, Type), VariableId>,
    controls: Vec<ControlData>,
    current: BlockId,
    origin: Origin,
    inline: Option<InlineFrame>,
    /// This function and every function inlining it, outermost first.
    inline_chain: Vec<u32>,
    /// Instructions in the outermost function.
    root_size: usize,
}

impl<'a, 'arena> IrBuilder<'a, 'arena> {
    /// Builder for the function `function_index`, starting at a fresh
    /// function entrypoint.
    pub fn new(
        compilation: &'a mut Compilation,
        module: &'a ModuleInformation,
        options: &'a CompilerOptions,
        session: &'a CompilationSession<'arena>,
        function_index: u32,
    ) -> CompileResult<Self> {
        let signature = module.function_type(function_index)?.clone();
        let body = module.body(function_index)?;
        let entry = compilation.procedure.add_block(Frequency::Normal);
        compilation.procedure.add_entrypoint(entry, EntrypointKind::Function);
        compilation.entry_slot_size = ScratchLayout::slot_size_for(module.uses_vectors());
        session.record_blocks_created(1);

        let mut builder = Self {
            compilation,
            module,
            options,
            session,
            function_index,
            signature,
            locals: Vec::new(),
            stack: Vec::new(),
            stack_vars: HashMap::new(),
            controls: Vec::new(),
            current: entry,
            origin: Origin::default(),
            inline: None,
            inline_chain: vec![function_index],
            root_size: body.code.len(),
        };

        builder.emit_patchpoint(PatchpointKind::StackOverflowCheck, &[], None);
        let arguments: Vec<ValueId> = builder
            .signature
            .params
            .clone()
            .iter()
            .enumerate()
            .map(|(i, ty)| builder.emit(Opcode::Argument(i as u32), ty.to_ir(), &[]))
            .collect();
        builder.declare_locals(&arguments, &body.locals);

        let continuation = builder.new_block(Frequency::Normal);
        let results = builder.signature.results.clone();
        let phis = builder.make_phis(continuation, &results);
        let mut top = ControlData::new(ControlKind::TopLevel, Vec::new(), results, continuation, 0);
        top.phis = phis;
        builder.controls.push(top);

        if builder.options.enable_tier_up {
            builder.emit_entry_tier_up_check();
        }

        log::debug!(
            "building function {} ({} params, {} locals, {} instructions)",
            function_index,
            builder.signature.params.len(),
            builder.locals.len(),
            builder.root_size
        );
        Ok(builder)
    }

    /// Builder for a callee inlined at the caller's current block. Branches
    /// to the callee's function frame feed `phis` and jump to
    /// `continuation`.
    #[allow(clippy::too_many_arguments)]
    fn new_inlinee(
        compilation: &'a mut Compilation,
        module: &'a ModuleInformation,
        options: &'a CompilerOptions,
        session: &'a CompilationSession<'arena>,
        function_index: u32,
        start: BlockId,
        arguments: &[ValueId],
        continuation: BlockId,
        phis: Vec<ValueId>,
        frame: InlineFrame,
        mut inline_chain: Vec<u32>,
        root_size: usize,
    ) -> CompileResult<Self> {
        let signature = module.function_type(function_index)?.clone();
        let body = module.body(function_index)?;
        inline_chain.push(function_index);

        let mut builder = Self {
            compilation,
            module,
            options,
            session,
            function_index,
            signature,
            locals: Vec::new(),
            stack: Vec::new(),
            stack_vars: HashMap::new(),
            controls: Vec::new(),
            current: start,
            origin: Origin::default(),
            inline: Some(frame),
            inline_chain,
            root_size,
        };
        builder.declare_locals(arguments, &body.locals);

        let results = builder.signature.results.clone();
        let mut top = ControlData::new(ControlKind::TopLevel, Vec::new(), results, continuation, 0);
        top.phis = phis;
        builder.controls.push(top);
        Ok(builder)
    }

    fn declare_locals(&mut self, arguments: &[ValueId], declared: &[ValType]) {
        let params = self.signature.params.clone();
        for (&value, &ty) in arguments.iter().zip(params.iter()) {
            let var = self.compilation.procedure.add_variable(ty.to_ir());
            self.emit(Opcode::Set(var), Type::Void, &[value]);
            self.locals.push((var, ty));
        }
        for &ty in declared {
            let var = self.compilation.procedure.add_variable(ty.to_ir());
            let zero = self.zero(ty.to_ir());
            self.emit(Opcode::Set(var), Type::Void, &[zero]);
            self.locals.push((var, ty));
        }
    }

    /// Check that every frame was closed.
    pub fn finish(self) -> CompileResult<()> {
        if !self.controls.is_empty() {
            return Err(CompileError::validation(format!(
                "function {} ends with {} open frames",
                self.function_index,
                self.controls.len()
            )));
        }
        if self.inline.is_none() && self.compilation.try_depth != 0 {
            return Err(CompileError::internal(format!(
                "try depth {} after the last end",
                self.compilation.try_depth
            )));
        }
        log::debug!(
            "built function {}: {} blocks, {} values",
            self.function_index,
            self.compilation.procedure.num_blocks(),
            self.compilation.procedure.num_values()
        );
        Ok(())
    }

    // ==== STATE ====

    pub fn set_origin(&mut self, origin: Origin) {
        self.origin = origin;
    }

    pub fn stack_height(&self) -> usize {
        self.stack.len()
    }

    /// Open control frames, including the function frame.
    pub fn control_depth(&self) -> usize {
        self.controls.len()
    }

    /// Whether the current block can still be appended to.
    pub fn is_reachable(&self) -> bool {
        !self.compilation.procedure.is_terminated(self.current)
    }

    pub fn module(&self) -> &'a ModuleInformation {
        self.module
    }

    /// Values the function frame returns.
    pub fn result_count(&self) -> usize {
        self.signature.results.len()
    }

    pub fn inline_depth(&self) -> u32 {
        self.inline.as_ref().map_or(0, |frame| frame.depth)
    }

    fn is_inlinee(&self) -> bool {
        self.inline.is_some()
    }

    // ==== OPERAND STACK ====

    fn stack_variable(&mut self, height: usize, ty: Type) -> VariableId {
        let procedure = &mut self.compilation.procedure;
        *self
            .stack_vars
            .entry((height, ty))
            .or_insert_with(|| procedure.add_variable(ty))
    }

    fn push(&mut self, value: ValueId, ty: ValType) {
        let var = self.stack_variable(self.stack.len(), ty.to_ir());
        self.emit(Opcode::Set(var), Type::Void, &[value]);
        self.stack.push(StackEntry { var, ty });
    }

    /// Push a cell without writing it, for frames entered only from dead code.
    fn push_unset(&mut self, ty: ValType) {
        let var = self.stack_variable(self.stack.len(), ty.to_ir());
        self.stack.push(StackEntry { var, ty });
    }

    fn frame_base(&self) -> usize {
        self.controls.last().map_or(0, |c| c.stack_height)
    }

    fn pop_entry(&mut self, operation: &'static str) -> CompileResult<(ValueId, ValType)> {
        if self.stack.len() <= self.frame_base() {
            return Err(CompileError::StackUnderflow {
                operation,
                needed: 1,
                available: 0,
            });
        }
        let entry = self
            .stack
            .pop()
            .ok_or_else(|| CompileError::internal("operand stack empty"))?;
        let value = self.emit(Opcode::Get(entry.var), entry.ty.to_ir(), &[]);
        Ok((value, entry.ty))
    }

    fn pop(&mut self, operation: &'static str) -> CompileResult<ValueId> {
        Ok(self.pop_entry(operation)?.0)
    }

    /// Pop `count` cells; the result is in stack order, bottom first.
    fn pop_n(&mut self, count: usize, operation: &'static str) -> CompileResult<Vec<ValueId>> {
        let available = self.stack.len() - self.frame_base().min(self.stack.len());
        if available < count {
            return Err(CompileError::StackUnderflow {
                operation,
                needed: count,
                available,
            });
        }
        let entries = self.stack.split_off(self.stack.len() - count);
        Ok(entries
            .into_iter()
            .map(|entry| self.emit(Opcode::Get(entry.var), entry.ty.to_ir(), &[]))
            .collect())
    }

    /// Read the top `count` cells without popping them.
    fn peek_n(&mut self, count: usize, operation: &'static str) -> CompileResult<Vec<ValueId>> {
        let available = self.stack.len() - self.frame_base().min(self.stack.len());
        if available < count {
            return Err(CompileError::StackUnderflow {
                operation,
                needed: count,
                available,
            });
        }
        let entries: Vec<StackEntry> = self.stack[self.stack.len() - count..].to_vec();
        Ok(entries
            .into_iter()
            .map(|entry| self.emit(Opcode::Get(entry.var), entry.ty.to_ir(), &[]))
            .collect())
    }

    // ==== EMISSION ====

    fn emit(&mut self, opcode: Opcode, ty: Type, children: &[ValueId]) -> ValueId {
        self.session.record_opcode(opcode.category());
        self.compilation
            .procedure
            .append(self.current, opcode, ty, children, self.origin)
    }

    fn terminate(&mut self, opcode: Opcode, children: &[ValueId], successors: &[BlockId]) {
        self.compilation
            .procedure
            .append_terminal(self.current, opcode, children, successors, self.origin);
    }

    fn jump(&mut self, target: BlockId) {
        self.terminate(Opcode::Jump, &[], &[target]);
    }

    fn new_block(&mut self, frequency: Frequency) -> BlockId {
        self.session.record_blocks_created(1);
        self.compilation.procedure.add_block(frequency)
    }

    fn make_phis(&mut self, block: BlockId, types: &[ValType]) -> Vec<ValueId> {
        types
            .iter()
            .map(|ty| {
                self.compilation
                    .procedure
                    .add_detached(block, Opcode::Phi, ty.to_ir(), &[], self.origin)
            })
            .collect()
    }

    /// Feed `values` into `phis`, topmost value first.
    fn unify(&mut self, phis: &[ValueId], values: &[ValueId]) {
        for (&phi, &value) in phis.iter().zip(values.iter()).rev() {
            self.emit(Opcode::Upsilon(phi), Type::Void, &[value]);
        }
    }

    fn const32(&mut self, value: i32) -> ValueId {
        self.emit(Opcode::Const32(value), Type::Int32, &[])
    }

    fn const64(&mut self, value: i64) -> ValueId {
        self.emit(Opcode::Const64(value), Type::Int64, &[])
    }

    fn zero(&mut self, ty: Type) -> ValueId {
        let opcode = match ty {
            Type::Int64 => Opcode::Const64(0),
            Type::Float => Opcode::ConstFloat(0),
            Type::Double => Opcode::ConstDouble(0),
            Type::V128 => Opcode::ConstVector(0),
            _ => Opcode::Const32(0),
        };
        self.emit(opcode, ty, &[])
    }

    fn instance(&mut self) -> ValueId {
        self.emit(Opcode::Pinned(PinnedReg::Instance), Type::POINTER, &[])
    }

    fn binary(&mut self, op: BinaryOp, ty: Type, a: ValueId, b: ValueId) -> ValueId {
        self.emit(Opcode::Binary(op), ty, &[a, b])
    }

    fn compare(&mut self, op: CompareOp, a: ValueId, b: ValueId) -> ValueId {
        self.emit(Opcode::Compare(op), Type::Int32, &[a, b])
    }

    fn convert(&mut self, op: ConvertOp, ty: Type, value: ValueId) -> ValueId {
        self.emit(Opcode::Convert(op), ty, &[value])
    }

    /// Int32 1 when `value` is zero.
    fn is_zero(&mut self, value: ValueId) -> ValueId {
        match self.compilation.procedure.value(value).ty {
            Type::Int64 => {
                let zero = self.const64(0);
                self.compare(CompareOp::Equal, value, zero)
            }
            _ => self.emit(Opcode::EqualZero, Type::Int32, &[value]),
        }
    }

    fn load(&mut self, ty: Type, width: u8, signed: bool, address: ValueId, offset: i32) -> ValueId {
        let access = MemoryAccess {
            width,
            signed,
            offset: offset as u32,
        };
        self.emit(Opcode::Load(access), ty, &[address])
    }

    fn load_pointer(&mut self, address: ValueId, offset: i32) -> ValueId {
        self.load(Type::POINTER, 8, false, address, offset)
    }

    fn store(&mut self, width: u8, address: ValueId, offset: i32, value: ValueId) {
        let access = MemoryAccess {
            width,
            signed: false,
            offset: offset as u32,
        };
        self.emit(Opcode::Store(access), Type::Void, &[address, value]);
    }

    /// Trap with `kind` when `condition` is non-zero.
    fn check(&mut self, kind: TrapKind, condition: ValueId) {
        let mut children = vec![condition];
        let captured = self.capture_for_unwind();
        let call_site = captured.as_ref().map(|_| self.compilation.next_call_site());
        if let Some((values, _)) = &captured {
            children.extend_from_slice(values);
        }
        let check = self.emit(Opcode::Check(kind), Type::Void, &children);
        if let Some((_, layout)) = captured {
            self.record_stack_map(call_site, check, 1, layout);
        }
    }

    fn emit_patchpoint(
        &mut self,
        kind: PatchpointKind,
        children: &[ValueId],
        call_site: Option<u32>,
    ) -> ValueId {
        let id = self.compilation.procedure.add_patchpoint(PatchpointDescriptor {
            kind,
            call_site,
            stack_map: None,
        });
        self.emit(Opcode::Patchpoint(id), Type::Void, children)
    }

    fn block_signature(&self, block_type: BlockType) -> CompileResult<(Vec<ValType>, Vec<ValType>)> {
        Ok(match block_type {
            BlockType::Empty => (Vec::new(), Vec::new()),
            BlockType::Value(ty) => (Vec::new(), vec![ty]),
            BlockType::Index(index) => {
                let sig = self.module.function_type_at(index)?;
                (sig.params.clone(), sig.results.clone())
            }
        })
    }

    fn control_index(&self, depth: u32) -> CompileResult<usize> {
        (self.controls.len() as u32)
            .checked_sub(depth + 1)
            .map(|i| i as usize)
            .ok_or(CompileError::InvalidIndex {
                kind: "label",
                index: depth,
            })
    }

    // ==== VARIABLES ====

    fn local(&self, index: u32) -> CompileResult<(VariableId, ValType)> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or(CompileError::InvalidIndex { kind: "local", index })
    }

    pub fn add_local_get(&mut self, index: u32) -> CompileResult<()> {
        let (var, ty) = self.local(index)?;
        let value = self.emit(Opcode::Get(var), ty.to_ir(), &[]);
        self.push(value, ty);
        Ok(())
    }

    pub fn add_local_set(&mut self, index: u32) -> CompileResult<()> {
        let (var, _) = self.local(index)?;
        let value = self.pop("local.set")?;
        self.emit(Opcode::Set(var), Type::Void, &[value]);
        Ok(())
    }

    pub fn add_local_tee(&mut self, index: u32) -> CompileResult<()> {
        let (var, ty) = self.local(index)?;
        let value = self.pop("local.tee")?;
        self.emit(Opcode::Set(var), Type::Void, &[value]);
        self.push(value, ty);
        Ok(())
    }

    fn global_offset(index: u32) -> i32 {
        instance::INSTANCE_GLOBALS + index as i32 * instance::GLOBAL_SLOT_SIZE
    }

    pub fn add_global_get(&mut self, index: u32) -> CompileResult<()> {
        let global = self.module.global(index)?;
        let ty = global.ty.to_ir();
        let inst = self.instance();
        let value = self.load(ty, ty.size_bytes() as u8, false, inst, Self::global_offset(index));
        self.push(value, global.ty);
        Ok(())
    }

    pub fn add_global_set(&mut self, index: u32) -> CompileResult<()> {
        let global = self.module.global(index)?;
        if !global.mutable {
            return Err(CompileError::validation(format!("global {} is immutable", index)));
        }
        let value = self.pop("global.set")?;
        let inst = self.instance();
        let width = global.ty.to_ir().size_bytes() as u8;
        self.store(width, inst, Self::global_offset(index), value);
        if global.ty.is_ref() {
            self.emit_write_barrier(inst);
        }
        Ok(())
    }

    // ==== CONSTANTS AND PARAMETRIC ====

    pub fn add_i32_const(&mut self, value: i32) -> CompileResult<()> {
        let c = self.const32(value);
        self.push(c, ValType::I32);
        Ok(())
    }

    pub fn add_i64_const(&mut self, value: i64) -> CompileResult<()> {
        let c = self.const64(value);
        self.push(c, ValType::I64);
        Ok(())
    }

    pub fn add_f32_const(&mut self, bits: u32) -> CompileResult<()> {
        let c = self.emit(Opcode::ConstFloat(bits), Type::Float, &[]);
        self.push(c, ValType::F32);
        Ok(())
    }

    pub fn add_f64_const(&mut self, bits: u64) -> CompileResult<()> {
        let c = self.emit(Opcode::ConstDouble(bits), Type::Double, &[]);
        self.push(c, ValType::F64);
        Ok(())
    }

    pub fn add_drop(&mut self) -> CompileResult<()> {
        self.pop_entry("drop")?;
        Ok(())
    }

    pub fn add_select(&mut self) -> CompileResult<()> {
        let condition = self.pop("select")?;
        let (on_false, _) = self.pop_entry("select")?;
        let (on_true, ty) = self.pop_entry("select")?;
        let value = self.emit(Opcode::Select, ty.to_ir(), &[condition, on_true, on_false]);
        self.push(value, ty);
        Ok(())
    }

    // ==== NUMERIC ====

    pub fn add_numeric(&mut self, op: NumericOp) -> CompileResult<()> {
        match op {
            NumericOp::Binary(ty, op) => {
                let b = self.pop("binary")?;
                let a = self.pop("binary")?;
                if !ty.is_float() {
                    self.emit_division_checks(ty, op, a, b);
                }
                let value = self.binary(op, ty.ir(), a, b);
                self.push(value, ty.val_type());
            }
            NumericOp::Unary(ty, op) => {
                let a = self.pop("unary")?;
                let value = self.emit(Opcode::Unary(op), ty.ir(), &[a]);
                self.push(value, ty.val_type());
            }
            NumericOp::Compare(_, op) => {
                let b = self.pop("compare")?;
                let a = self.pop("compare")?;
                let value = self.compare(op, a, b);
                self.push(value, ValType::I32);
            }
            NumericOp::Eqz(_) => {
                let a = self.pop("eqz")?;
                let value = self.is_zero(a);
                self.push(value, ValType::I32);
            }
            NumericOp::Convert { from, to, op } => {
                let a = self.pop("convert")?;
                if let ConvertOp::FloatToInt { signed, saturating: false } = op {
                    self.emit_truncation_check(from, to, signed, a);
                }
                let value = self.convert(op, to.ir(), a);
                self.push(value, to.val_type());
            }
        }
        Ok(())
    }

    fn emit_division_checks(&mut self, ty: NumType, op: BinaryOp, a: ValueId, b: ValueId) {
        if !matches!(op, BinaryOp::Div | BinaryOp::UDiv | BinaryOp::Mod | BinaryOp::UMod) {
            return;
        }
        let by_zero = self.is_zero(b);
        self.check(TrapKind::DivisionByZero, by_zero);

        if op == BinaryOp::Div {
            let (min, minus_one) = match ty {
                NumType::I64 => (self.const64(i64::MIN), self.const64(-1)),
                _ => (self.const32(i32::MIN), self.const32(-1)),
            };
            let is_min = self.compare(CompareOp::Equal, a, min);
            let is_minus_one = self.compare(CompareOp::Equal, b, minus_one);
            let overflow = self.binary(BinaryOp::BitAnd, Type::Int32, is_min, is_minus_one);
            self.check(TrapKind::IntegerOverflow, overflow);
        }
    }

    /// Trap unless `value` truncates into the target integer range.
    fn emit_truncation_check(&mut self, from: NumType, to: NumType, signed: bool, value: ValueId) {
        // Exclusive bounds: the largest float below the range and 2^bits.
        let (low, high): (f64, f64) = match (to, signed, from) {
            (NumType::I32, true, NumType::F32) => (-2147483904.0, 2147483648.0),
            (NumType::I32, true, _) => (-2147483649.0, 2147483648.0),
            (NumType::I32, false, _) => (-1.0, 4294967296.0),
            (_, true, NumType::F32) => (-9223373136366403584.0, 9223372036854775808.0),
            (_, true, _) => (-9223372036854777856.0, 9223372036854775808.0),
            (_, false, _) => (-1.0, 18446744073709551616.0),
        };
        let (low, high) = match from {
            NumType::F32 => (
                self.emit(Opcode::ConstFloat((low as f32).to_bits()), Type::Float, &[]),
                self.emit(Opcode::ConstFloat((high as f32).to_bits()), Type::Float, &[]),
            ),
            _ => (
                self.emit(Opcode::ConstDouble(low.to_bits()), Type::Double, &[]),
                self.emit(Opcode::ConstDouble(high.to_bits()), Type::Double, &[]),
            ),
        };
        let above_low = self.compare(CompareOp::GreaterThan, value, low);
        let below_high = self.compare(CompareOp::LessThan, value, high);
        let in_range = self.binary(BinaryOp::BitAnd, Type::Int32, above_low, below_high);
        let out_of_range = self.emit(Opcode::EqualZero, Type::Int32, &[in_range]);
        self.check(TrapKind::OutOfBoundsTrunc, out_of_range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::TestContext;
    use crate::ir::interp::{Interpreter, NoCalls, Outcome};
    use crate::ir::fix_ssa;
    use crate::wasm::module_info::{FunctionBody, TypeDefinition};

    fn module(params: Vec<ValType>, results: Vec<ValType>, locals: Vec<ValType>) -> ModuleInformation {
        let mut module = ModuleInformation {
            types: vec![TypeDefinition::Func(FunctionType::new(params, results))],
            functions: vec![FunctionBody { type_index: 0, locals, code: Vec::new() }],
            ..Default::default()
        };
        module.publish_callees();
        module
    }

    #[test]
    fn test_stack_cells_are_keyed_by_height_and_type() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module(vec![], vec![], vec![]);
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        let mut builder = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();

        builder.add_i32_const(1).unwrap();
        let first = builder.stack[0].var;
        builder.add_drop().unwrap();
        builder.add_i64_const(1).unwrap();
        let wide = builder.stack[0].var;
        builder.add_drop().unwrap();
        builder.add_i32_const(2).unwrap();

        assert_ne!(first, wide);
        assert_eq!(builder.stack[0].var, first);
        assert_eq!(builder.stack_height(), 1);
    }

    #[test]
    fn test_pop_below_frame_is_an_error() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module(vec![], vec![], vec![]);
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        let mut builder = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();

        let err = builder.add_drop().unwrap_err();
        assert!(matches!(err, CompileError::StackUnderflow { operation: "drop", .. }));
        assert!(builder.add_local_get(0).is_err());
    }

    #[test]
    fn test_signed_division_gets_both_checks() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module(vec![ValType::I32, ValType::I32], vec![ValType::I32], vec![]);
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut builder =
                IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            builder.add_local_get(0).unwrap();
            builder.add_local_get(1).unwrap();
            builder
                .add_numeric(NumericOp::Binary(NumType::I32, BinaryOp::Div))
                .unwrap();
            builder.add_end().unwrap();
            builder.finish().unwrap();
        }
        let proc = &compilation.procedure;
        assert_eq!(proc.count_values(|op| *op == Opcode::Check(TrapKind::DivisionByZero)), 1);
        assert_eq!(proc.count_values(|op| *op == Opcode::Check(TrapKind::IntegerOverflow)), 1);

        fix_ssa(&mut compilation.procedure);
        let proc = &compilation.procedure;
        let run = |a: i32, b: i32| {
            Interpreter::new(proc)
                .run(&[a as u32 as u128, b as u32 as u128], &mut NoCalls)
                .unwrap()
        };
        assert_eq!(run(7, 2), Outcome::Return(vec![3]));
        assert_eq!(run(7, 0), Outcome::Trap(TrapKind::DivisionByZero));
        assert_eq!(run(i32::MIN, -1), Outcome::Trap(TrapKind::IntegerOverflow));
    }

    #[test]
    fn test_truncation_traps_on_nan_and_overflow() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module(vec![ValType::F64], vec![ValType::I32], vec![]);
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut builder =
                IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            builder.add_local_get(0).unwrap();
            builder
                .add_numeric(NumericOp::Convert {
                    from: NumType::F64,
                    to: NumType::I32,
                    op: ConvertOp::FloatToInt { signed: true, saturating: false },
                })
                .unwrap();
            builder.add_end().unwrap();
            builder.finish().unwrap();
        }
        fix_ssa(&mut compilation.procedure);
        let proc = &compilation.procedure;
        let run = |x: f64| {
            Interpreter::new(proc)
                .run(&[x.to_bits() as u128], &mut NoCalls)
                .unwrap()
        };
        assert_eq!(run(-3.9), Outcome::Return(vec![(-3i32) as u32 as u128]));
        assert_eq!(run(2147483647.5), Outcome::Return(vec![i32::MAX as u128]));
        assert_eq!(run(f64::NAN), Outcome::Trap(TrapKind::OutOfBoundsTrunc));
        assert_eq!(run(2147483648.0), Outcome::Trap(TrapKind::OutOfBoundsTrunc));
    }
}
