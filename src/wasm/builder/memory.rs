//! Linear memory, atomics and tables.

use super::IrBuilder;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{
    AtomicOp, BinaryOp, CallKind, CompareOp, ConvertOp, MemoryAccess, Opcode, PinnedReg,
    RuntimeOperation, TrapKind, Type, ValueId,
};
use crate::wasm::instance;
use crate::wasm::instruction::MemArg;
use crate::wasm::module_info::ValType;

impl<'a, 'arena> IrBuilder<'a, 'arena> {
    fn require_memory(&self, operation: &str) -> CompileResult<()> {
        if self.module.memory.is_none() {
            return Err(CompileError::validation(format!("{} without a memory", operation)));
        }
        Ok(())
    }

    /// Native address of the wasm address `pointer`, checked for an access
    /// of `size` bytes at `offset` unless the guard region covers it.
    pub(super) fn memory_address(&mut self, pointer: ValueId, offset: u32, size: u32) -> ValueId {
        let wide = self.convert(ConvertOp::ZExt32, Type::Int64, pointer);
        let reach = offset as u64 + size as u64;
        if reach > self.options.unchecked_reach() {
            let end = self.const64(reach as i64);
            let last = self.binary(BinaryOp::Add, Type::Int64, wide, end);
            let bound = self.emit(Opcode::Pinned(PinnedReg::MemoryBound), Type::POINTER, &[]);
            let out_of_bounds = self.compare(CompareOp::Above, last, bound);
            self.check(TrapKind::OutOfBoundsMemoryAccess, out_of_bounds);
            self.session.record_bounds_check();
        }
        let base = self.emit(Opcode::Pinned(PinnedReg::MemoryBase), Type::POINTER, &[]);
        self.binary(BinaryOp::Add, Type::Int64, base, wide)
    }

    pub fn add_load(&mut self, ty: ValType, width: u8, signed: bool, memarg: MemArg) -> CompileResult<()> {
        self.require_memory("load")?;
        let pointer = self.pop("load")?;
        let address = self.memory_address(pointer, memarg.offset, width as u32);
        let value = self.load(ty.to_ir(), width, signed, address, memarg.offset as i32);
        self.push(value, ty);
        Ok(())
    }

    pub fn add_store(&mut self, width: u8, memarg: MemArg) -> CompileResult<()> {
        self.require_memory("store")?;
        let value = self.pop("store")?;
        let pointer = self.pop("store")?;
        let address = self.memory_address(pointer, memarg.offset, width as u32);
        self.store(width, address, memarg.offset as i32, value);
        Ok(())
    }

    pub fn add_memory_size(&mut self) -> CompileResult<()> {
        self.require_memory("memory.size")?;
        let bound = self.emit(Opcode::Pinned(PinnedReg::MemoryBound), Type::POINTER, &[]);
        let shift = self.const64(instance::PAGE_SIZE_LOG2);
        let pages = self.binary(BinaryOp::ZShr, Type::Int64, bound, shift);
        let narrow = self.convert(ConvertOp::Trunc, Type::Int32, pages);
        self.push(narrow, ValType::I32);
        Ok(())
    }

    pub fn add_memory_grow(&mut self) -> CompileResult<()> {
        self.require_memory("memory.grow")?;
        let delta = self.pop("memory.grow")?;
        let inst = self.instance();
        let (previous, _) = self.emit_call(
            CallKind::Operation(RuntimeOperation::GrowMemory),
            &[inst, delta],
            vec![Type::Int32],
        );
        // Base and bound may have moved.
        self.restore_global_state();
        self.push(previous, ValType::I32);
        Ok(())
    }

    /// Bulk operation returning zero when it ran out of bounds.
    fn bulk_memory(&mut self, operation: RuntimeOperation, name: &'static str) -> CompileResult<()> {
        self.require_memory(name)?;
        let operands = self.pop_n(3, name)?;
        let inst = self.instance();
        let mut children = vec![inst];
        children.extend(operands);
        let (ok, _) = self.emit_call(CallKind::Operation(operation), &children, vec![Type::Int32]);
        let failed = self.emit(Opcode::EqualZero, Type::Int32, &[ok]);
        self.check(TrapKind::OutOfBoundsMemoryAccess, failed);
        Ok(())
    }

    pub fn add_memory_fill(&mut self) -> CompileResult<()> {
        self.bulk_memory(RuntimeOperation::MemoryFill, "memory.fill")
    }

    pub fn add_memory_copy(&mut self) -> CompileResult<()> {
        self.bulk_memory(RuntimeOperation::MemoryCopy, "memory.copy")
    }

    // ==== ATOMICS ====

    /// Wasm effective address of an atomic access, trapping unless it is
    /// naturally aligned.
    fn atomic_effective_address(&mut self, pointer: ValueId, offset: u32, width: u8) -> ValueId {
        let wide = self.convert(ConvertOp::ZExt32, Type::Int64, pointer);
        let displacement = self.const64(offset as i64);
        let effective = self.binary(BinaryOp::Add, Type::Int64, wide, displacement);
        if width > 1 {
            let mask = self.const64(width as i64 - 1);
            let low = self.binary(BinaryOp::BitAnd, Type::Int64, effective, mask);
            let zero = self.const64(0);
            let unaligned = self.compare(CompareOp::NotEqual, low, zero);
            self.check(TrapKind::UnalignedMemoryAccess, unaligned);
        }
        effective
    }

    fn atomic_access(&mut self, pointer: ValueId, memarg: MemArg, width: u8) -> (ValueId, MemoryAccess) {
        self.atomic_effective_address(pointer, memarg.offset, width);
        let address = self.memory_address(pointer, memarg.offset, width as u32);
        let access = MemoryAccess {
            width,
            signed: false,
            offset: memarg.offset,
        };
        (address, access)
    }

    pub fn add_atomic_load(&mut self, ty: ValType, width: u8, memarg: MemArg) -> CompileResult<()> {
        self.require_memory("atomic.load")?;
        let pointer = self.pop("atomic.load")?;
        let (address, access) = self.atomic_access(pointer, memarg, width);
        let value = self.emit(Opcode::Load(access), ty.to_ir(), &[address]);
        self.push(value, ty);
        Ok(())
    }

    pub fn add_atomic_store(&mut self, width: u8, memarg: MemArg) -> CompileResult<()> {
        self.require_memory("atomic.store")?;
        let value = self.pop("atomic.store")?;
        let pointer = self.pop("atomic.store")?;
        let (address, access) = self.atomic_access(pointer, memarg, width);
        self.emit(Opcode::Store(access), Type::Void, &[address, value]);
        self.emit(Opcode::Fence, Type::Void, &[]);
        Ok(())
    }

    pub fn add_atomic_rmw(&mut self, op: AtomicOp, ty: ValType, width: u8, memarg: MemArg) -> CompileResult<()> {
        self.require_memory("atomic.rmw")?;
        let operand = self.pop("atomic.rmw")?;
        let pointer = self.pop("atomic.rmw")?;
        let (address, access) = self.atomic_access(pointer, memarg, width);
        let old = self.emit(Opcode::AtomicRmw { op, access }, ty.to_ir(), &[address, operand]);
        self.push(old, ty);
        Ok(())
    }

    pub fn add_atomic_cmpxchg(&mut self, ty: ValType, width: u8, memarg: MemArg) -> CompileResult<()> {
        self.require_memory("atomic.cmpxchg")?;
        let replacement = self.pop("atomic.cmpxchg")?;
        let expected = self.pop("atomic.cmpxchg")?;
        let pointer = self.pop("atomic.cmpxchg")?;
        let (address, access) = self.atomic_access(pointer, memarg, width);

        let ir = ty.to_ir();
        // Narrow accesses compare against the zero-extended stored value.
        let expected = if (width as u32) < ir.size_bytes() {
            let bits = (1u64 << (8 * width as u32)) - 1;
            let mask = match ir {
                Type::Int64 => self.const64(bits as i64),
                _ => self.const32(bits as i32),
            };
            self.binary(BinaryOp::BitAnd, ir, expected, mask)
        } else {
            expected
        };
        let old = self.emit(Opcode::AtomicCas(access), ir, &[address, expected, replacement]);
        self.push(old, ty);
        Ok(())
    }

    pub fn add_atomic_wait(&mut self, ty: ValType, memarg: MemArg) -> CompileResult<()> {
        self.require_memory("atomic.wait")?;
        let timeout = self.pop("atomic.wait")?;
        let expected = self.pop("atomic.wait")?;
        let pointer = self.pop("atomic.wait")?;
        let (operation, width) = match ty {
            ValType::I64 => (RuntimeOperation::AtomicWait64, 8),
            _ => (RuntimeOperation::AtomicWait32, 4),
        };
        let effective = self.atomic_effective_address(pointer, memarg.offset, width);
        let inst = self.instance();
        let (result, _) = self.emit_call(
            CallKind::Operation(operation),
            &[inst, effective, expected, timeout],
            vec![Type::Int32],
        );
        self.push(result, ValType::I32);
        Ok(())
    }

    pub fn add_atomic_notify(&mut self, memarg: MemArg) -> CompileResult<()> {
        self.require_memory("atomic.notify")?;
        let count = self.pop("atomic.notify")?;
        let pointer = self.pop("atomic.notify")?;
        let effective = self.atomic_effective_address(pointer, memarg.offset, 4);
        let inst = self.instance();
        let (woken, _) = self.emit_call(
            CallKind::Operation(RuntimeOperation::AtomicNotify),
            &[inst, effective, count],
            vec![Type::Int32],
        );
        self.push(woken, ValType::I32);
        Ok(())
    }

    pub fn add_atomic_fence(&mut self) -> CompileResult<()> {
        self.emit(Opcode::Fence, Type::Void, &[]);
        Ok(())
    }

    // ==== TABLES ====

    /// Pointer to the table object of `table_index`.
    pub(super) fn table_pointer(&mut self, table_index: u32) -> ValueId {
        let inst = self.instance();
        let tables = self.load_pointer(inst, instance::INSTANCE_TABLES);
        self.load_pointer(tables, 8 * table_index as i32)
    }

    pub(super) fn check_table_index(&mut self, table: ValueId, index: ValueId, trap: TrapKind) {
        let length = self.load(Type::Int32, 4, false, table, instance::TABLE_LENGTH);
        let out_of_bounds = self.compare(CompareOp::AboveEqual, index, length);
        self.check(trap, out_of_bounds);
    }

    pub fn add_table_get(&mut self, table_index: u32) -> CompileResult<()> {
        let info = self.module.table(table_index)?;
        let index = self.pop("table.get")?;
        let table = self.table_pointer(table_index);
        self.check_table_index(table, index, TrapKind::OutOfBoundsTableAccess);
        let inst = self.instance();
        let which = self.const32(table_index as i32);
        let (element, _) = self.emit_call(
            CallKind::Operation(RuntimeOperation::TableGet),
            &[inst, which, index],
            vec![Type::POINTER],
        );
        self.push(element, ValType::Ref(info.element));
        Ok(())
    }

    pub fn add_table_set(&mut self, table_index: u32) -> CompileResult<()> {
        self.module.table(table_index)?;
        let value = self.pop("table.set")?;
        let index = self.pop("table.set")?;
        let table = self.table_pointer(table_index);
        self.check_table_index(table, index, TrapKind::OutOfBoundsTableAccess);
        let inst = self.instance();
        let which = self.const32(table_index as i32);
        self.emit_call(
            CallKind::Operation(RuntimeOperation::TableSet),
            &[inst, which, index, value],
            Vec::new(),
        );
        Ok(())
    }

    pub fn add_table_size(&mut self, table_index: u32) -> CompileResult<()> {
        self.module.table(table_index)?;
        let table = self.table_pointer(table_index);
        let length = self.load(Type::Int32, 4, false, table, instance::TABLE_LENGTH);
        self.push(length, ValType::I32);
        Ok(())
    }

    pub fn add_table_grow(&mut self, table_index: u32) -> CompileResult<()> {
        self.module.table(table_index)?;
        let delta = self.pop("table.grow")?;
        let initial = self.pop("table.grow")?;
        let inst = self.instance();
        let which = self.const32(table_index as i32);
        let (previous, _) = self.emit_call(
            CallKind::Operation(RuntimeOperation::TableGrow),
            &[inst, which, initial, delta],
            vec![Type::Int32],
        );
        self.push(previous, ValType::I32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::options::{BoundsCheckingMode, CompilerOptions};
    use crate::core::test_utils::test::TestContext;
    use crate::ir::interp::{Interpreter, NoCalls, Outcome};
    use crate::ir::{fix_ssa, AtomicOp, Opcode, TrapKind};
    use crate::wasm::builder::IrBuilder;
    use crate::wasm::compilation::Compilation;
    use crate::wasm::instruction::MemArg;
    use crate::wasm::module_info::{
        FunctionBody, FunctionType, MemoryInfo, ModuleInformation, TypeDefinition, ValType,
    };

    fn module(params: Vec<ValType>, results: Vec<ValType>) -> ModuleInformation {
        let mut module = ModuleInformation {
            types: vec![TypeDefinition::Func(FunctionType::new(params, results))],
            functions: vec![FunctionBody { type_index: 0, locals: vec![], code: vec![] }],
            memory: Some(MemoryInfo { initial_pages: 1, maximum_pages: None, shared: true }),
            ..Default::default()
        };
        module.publish_callees();
        module
    }

    fn checks(compilation: &Compilation) -> usize {
        compilation
            .procedure
            .count_values(|op| *op == Opcode::Check(TrapKind::OutOfBoundsMemoryAccess))
    }

    fn two_loads(options: &CompilerOptions, offset: u32) -> Compilation {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module(vec![ValType::I32], vec![ValType::I32]);
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, options, &session, 0).unwrap();
            let memarg = MemArg { offset, align: 2 };
            b.add_local_get(0).unwrap();
            b.add_load(ValType::I32, 4, false, memarg).unwrap();
            b.add_local_get(0).unwrap();
            b.add_load(ValType::I32, 4, false, memarg).unwrap();
            b.add_numeric(crate::wasm::instruction::NumericOp::Binary(
                crate::wasm::instruction::NumType::I32,
                crate::ir::BinaryOp::Add,
            ))
            .unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
            assert_eq!(session.stats().bounds_checks, checks_expected(options, offset));
        }
        compilation
    }

    fn checks_expected(options: &CompilerOptions, offset: u32) -> usize {
        if offset as u64 + 4 > options.unchecked_reach() {
            2
        } else {
            0
        }
    }

    #[test]
    fn test_every_access_checked_in_bounds_checking_mode() {
        let mut compilation = two_loads(&CompilerOptions::default(), 0);
        assert_eq!(checks(&compilation), 2);

        fix_ssa(&mut compilation.procedure);
        let mut memory = vec![0u8; 64];
        memory[8..12].copy_from_slice(&21u32.to_le_bytes());
        let run = |p: u128| {
            Interpreter::new(&compilation.procedure)
                .with_memory(memory.clone())
                .run(&[p], &mut NoCalls)
                .unwrap()
        };
        assert_eq!(run(8), Outcome::Return(vec![42]));
        assert_eq!(run(61), Outcome::Trap(TrapKind::OutOfBoundsMemoryAccess));
    }

    #[test]
    fn test_signaling_mode_checks_only_past_guard() {
        let options = CompilerOptions {
            bounds_checking: BoundsCheckingMode::Signaling,
            guard_region_size: 1 << 16,
            ..Default::default()
        };
        assert_eq!(checks(&two_loads(&options, 16)), 0);
        assert_eq!(checks(&two_loads(&options, (1 << 16) - 2)), 2);
    }

    #[test]
    fn test_atomic_rmw_checks_alignment() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module(vec![ValType::I32], vec![ValType::I32]);
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            b.add_local_get(0).unwrap();
            b.add_i32_const(5).unwrap();
            b.add_atomic_rmw(AtomicOp::Add, ValType::I32, 4, MemArg::default()).unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        fix_ssa(&mut compilation.procedure);
        let mut memory = vec![0u8; 64];
        memory[4..8].copy_from_slice(&7u32.to_le_bytes());
        let mut interp = Interpreter::new(&compilation.procedure).with_memory(memory.clone());
        assert_eq!(interp.run(&[4], &mut NoCalls).unwrap(), Outcome::Return(vec![7]));
        assert_eq!(&interp.memory()[4..8], &12u32.to_le_bytes());

        let outcome = Interpreter::new(&compilation.procedure)
            .with_memory(memory)
            .run(&[6], &mut NoCalls)
            .unwrap();
        assert_eq!(outcome, Outcome::Trap(TrapKind::UnalignedMemoryAccess));
    }

    #[test]
    fn test_memory_ops_need_a_memory() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut module = module(vec![], vec![]);
        module.memory = None;
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
        assert!(b.add_memory_size().is_err());
    }
}
