//! References, GC objects and the store barrier.

use super::IrBuilder;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{
    BinaryOp, CallKind, CompareOp, ConvertOp, Frequency, Opcode, RuntimeOperation, TrapKind, Type,
    ValueId,
};
use crate::wasm::instance;
use crate::wasm::module_info::{FieldType, HeapType, RefType, StorageType, ValType};

/// Runtime type codes for abstract cast targets; concrete types pass their index.
const REF_TEST_ANY_STRUCT: i32 = -1;
const REF_TEST_ANY_ARRAY: i32 = -2;

impl<'a, 'arena> IrBuilder<'a, 'arena> {
    fn require_gc(&self, operation: &str) -> CompileResult<()> {
        if !self.options.enable_gc {
            return Err(CompileError::unsupported(format!("{} with GC disabled", operation)));
        }
        Ok(())
    }

    /// Int32 1 when `reference` is null.
    pub(super) fn is_null(&mut self, reference: ValueId) -> ValueId {
        let zero = self.const64(0);
        self.compare(CompareOp::Equal, reference, zero)
    }

    fn null_check(&mut self, reference: ValueId) {
        let null = self.is_null(reference);
        self.check(TrapKind::NullReference, null);
    }

    // ==== REFERENCES ====

    pub fn add_ref_null(&mut self, heap: HeapType) -> CompileResult<()> {
        let null = self.const64(0);
        self.push(null, ValType::Ref(RefType { nullable: true, heap }));
        Ok(())
    }

    pub fn add_ref_is_null(&mut self) -> CompileResult<()> {
        let reference = self.pop("ref.is_null")?;
        let null = self.is_null(reference);
        self.push(null, ValType::I32);
        Ok(())
    }

    pub fn add_ref_func(&mut self, function_index: u32) -> CompileResult<()> {
        self.module.function_type_index(function_index)?;
        let inst = self.instance();
        let index = self.const32(function_index as i32);
        let (reference, _) = self.emit_call(
            CallKind::Operation(RuntimeOperation::RefFunc),
            &[inst, index],
            vec![Type::POINTER],
        );
        self.push(reference, ValType::Ref(RefType { nullable: false, heap: HeapType::Func }));
        Ok(())
    }

    pub fn add_ref_as_non_null(&mut self) -> CompileResult<()> {
        let (reference, ty) = self.pop_entry("ref.as_non_null")?;
        self.null_check(reference);
        let ty = match ty {
            ValType::Ref(r) => ValType::Ref(RefType { nullable: false, heap: r.heap }),
            other => other,
        };
        self.push(reference, ty);
        Ok(())
    }

    pub fn add_ref_eq(&mut self) -> CompileResult<()> {
        self.require_gc("ref.eq")?;
        let b = self.pop("ref.eq")?;
        let a = self.pop("ref.eq")?;
        let equal = self.compare(CompareOp::Equal, a, b);
        self.push(equal, ValType::I32);
        Ok(())
    }

    // ==== I31 ====

    pub fn add_ref_i31(&mut self) -> CompileResult<()> {
        self.require_gc("ref.i31")?;
        let value = self.pop("ref.i31")?;
        let one = self.const32(1);
        let shifted = self.binary(BinaryOp::Shl, Type::Int32, value, one);
        let tagged = self.binary(BinaryOp::BitOr, Type::Int32, shifted, one);
        let reference = self.convert(ConvertOp::ZExt32, Type::Int64, tagged);
        self.push(reference, ValType::Ref(RefType { nullable: false, heap: HeapType::I31 }));
        Ok(())
    }

    pub fn add_i31_get(&mut self, signed: bool) -> CompileResult<()> {
        self.require_gc("i31.get")?;
        let reference = self.pop("i31.get")?;
        self.null_check(reference);
        let narrow = self.convert(ConvertOp::Trunc, Type::Int32, reference);
        let one = self.const32(1);
        let op = if signed { BinaryOp::SShr } else { BinaryOp::ZShr };
        let value = self.binary(op, Type::Int32, narrow, one);
        self.push(value, ValType::I32);
        Ok(())
    }

    // ==== STRUCTS AND ARRAYS ====

    fn load_field(&mut self, field: FieldType, signed: bool, address: ValueId, offset: i32) -> ValueId {
        let width = field.storage.size_bytes() as u8;
        let ty = field.storage.unpacked().to_ir();
        self.load(ty, width, signed && field.storage.is_packed(), address, offset)
    }

    fn store_field(&mut self, field: FieldType, object: ValueId, address: ValueId, offset: i32, value: ValueId) {
        self.store(field.storage.size_bytes() as u8, address, offset, value);
        if matches!(field.storage, StorageType::Val(ValType::Ref(_))) {
            self.emit_write_barrier(object);
        }
    }

    fn struct_field(&self, type_index: u32, field: u32) -> CompileResult<(FieldType, i32)> {
        let ty = self.module.struct_type(type_index)?;
        let offset = ty.field_offset(field).ok_or(CompileError::InvalidIndex {
            kind: "field",
            index: field,
        })?;
        Ok((ty.fields[field as usize], offset as i32))
    }

    pub fn add_struct_new(&mut self, type_index: u32) -> CompileResult<()> {
        self.require_gc("struct.new")?;
        let count = self.module.struct_type(type_index)?.fields.len();
        let values = self.pop_n(count, "struct.new")?;
        let inst = self.instance();
        let which = self.const32(type_index as i32);
        let (object, _) = self.emit_call(
            CallKind::Operation(RuntimeOperation::StructNew),
            &[inst, which],
            vec![Type::POINTER],
        );
        for (index, value) in values.into_iter().enumerate() {
            let (field, offset) = self.struct_field(type_index, index as u32)?;
            self.store_field(field, object, object, offset, value);
        }
        let heap = HeapType::Concrete(type_index);
        self.push(object, ValType::Ref(RefType { nullable: false, heap }));
        Ok(())
    }

    pub fn add_struct_get(&mut self, type_index: u32, field: u32, signed: bool) -> CompileResult<()> {
        self.require_gc("struct.get")?;
        let (field_type, offset) = self.struct_field(type_index, field)?;
        let object = self.pop("struct.get")?;
        self.null_check(object);
        let value = self.load_field(field_type, signed, object, offset);
        self.push(value, field_type.storage.unpacked());
        Ok(())
    }

    pub fn add_struct_set(&mut self, type_index: u32, field: u32) -> CompileResult<()> {
        self.require_gc("struct.set")?;
        let (field_type, offset) = self.struct_field(type_index, field)?;
        if !field_type.mutable {
            return Err(CompileError::validation(format!(
                "field {} of type {} is immutable",
                field, type_index
            )));
        }
        let value = self.pop("struct.set")?;
        let object = self.pop("struct.set")?;
        self.null_check(object);
        self.store_field(field_type, object, object, offset, value);
        Ok(())
    }

    pub fn add_array_new(&mut self, type_index: u32) -> CompileResult<()> {
        self.require_gc("array.new")?;
        self.module.array_type(type_index)?;
        let length = self.pop("array.new")?;
        let initial = self.pop("array.new")?;
        let inst = self.instance();
        let which = self.const32(type_index as i32);
        let (array, _) = self.emit_call(
            CallKind::Operation(RuntimeOperation::ArrayNew),
            &[inst, which, initial, length],
            vec![Type::POINTER],
        );
        let heap = HeapType::Concrete(type_index);
        self.push(array, ValType::Ref(RefType { nullable: false, heap }));
        Ok(())
    }

    /// Address of element `index`, after null and bounds checks. The
    /// element sits at [`instance::GC_OBJECT_PAYLOAD`] from the result.
    fn array_element(&mut self, array: ValueId, index: ValueId, element_size: u32) -> ValueId {
        self.null_check(array);
        let length = self.load(Type::Int32, 4, false, array, instance::GC_ARRAY_LENGTH);
        let out_of_bounds = self.compare(CompareOp::AboveEqual, index, length);
        self.check(TrapKind::OutOfBoundsArrayAccess, out_of_bounds);
        let wide = self.convert(ConvertOp::ZExt32, Type::Int64, index);
        let size = self.const64(element_size as i64);
        let scaled = self.binary(BinaryOp::Mul, Type::Int64, wide, size);
        self.binary(BinaryOp::Add, Type::Int64, array, scaled)
    }

    pub fn add_array_get(&mut self, type_index: u32, signed: bool) -> CompileResult<()> {
        self.require_gc("array.get")?;
        let element = self.module.array_type(type_index)?.element;
        let index = self.pop("array.get")?;
        let array = self.pop("array.get")?;
        let address = self.array_element(array, index, element.storage.size_bytes());
        let value = self.load_field(element, signed, address, instance::GC_OBJECT_PAYLOAD);
        self.push(value, element.storage.unpacked());
        Ok(())
    }

    pub fn add_array_set(&mut self, type_index: u32) -> CompileResult<()> {
        self.require_gc("array.set")?;
        let element = self.module.array_type(type_index)?.element;
        if !element.mutable {
            return Err(CompileError::validation(format!("array type {} is immutable", type_index)));
        }
        let value = self.pop("array.set")?;
        let index = self.pop("array.set")?;
        let array = self.pop("array.set")?;
        let address = self.array_element(array, index, element.storage.size_bytes());
        self.store_field(element, array, address, instance::GC_OBJECT_PAYLOAD, value);
        Ok(())
    }

    pub fn add_array_len(&mut self) -> CompileResult<()> {
        self.require_gc("array.len")?;
        let array = self.pop("array.len")?;
        self.null_check(array);
        let length = self.load(Type::Int32, 4, false, array, instance::GC_ARRAY_LENGTH);
        self.push(length, ValType::I32);
        Ok(())
    }

    // ==== CASTS ====

    /// Int32 1 when `reference` is an instance of `target`.
    pub(super) fn emit_ref_test(&mut self, reference: ValueId, target: RefType) -> CompileResult<ValueId> {
        self.require_gc("ref.test")?;
        let null = self.is_null(reference);
        let non_null = match target.heap {
            HeapType::I31 => {
                let one = self.const64(1);
                let tag = self.binary(BinaryOp::BitAnd, Type::Int64, reference, one);
                let zero = self.const64(0);
                self.compare(CompareOp::NotEqual, tag, zero)
            }
            HeapType::Any | HeapType::Eq | HeapType::Extern | HeapType::Func => self.const32(1),
            HeapType::None => self.const32(0),
            HeapType::Struct => self.runtime_ref_test(reference, REF_TEST_ANY_STRUCT),
            HeapType::Array => self.runtime_ref_test(reference, REF_TEST_ANY_ARRAY),
            HeapType::Concrete(index) => {
                self.module.type_definition(index)?;
                self.runtime_ref_test(reference, index as i32)
            }
        };
        let nullable = self.const32(target.nullable as i32);
        Ok(self.emit(Opcode::Select, Type::Int32, &[null, nullable, non_null]))
    }

    fn runtime_ref_test(&mut self, reference: ValueId, code: i32) -> ValueId {
        let inst = self.instance();
        let code = self.const32(code);
        let (result, _) = self.emit_call(
            CallKind::Operation(RuntimeOperation::RefTest),
            &[inst, reference, code],
            vec![Type::Int32],
        );
        result
    }

    pub fn add_ref_test(&mut self, target: RefType) -> CompileResult<()> {
        let reference = self.pop("ref.test")?;
        let passes = self.emit_ref_test(reference, target)?;
        self.push(passes, ValType::I32);
        Ok(())
    }

    pub fn add_ref_cast(&mut self, target: RefType) -> CompileResult<()> {
        let reference = self.pop("ref.cast")?;
        let passes = self.emit_ref_test(reference, target)?;
        let fails = self.emit(Opcode::EqualZero, Type::Int32, &[passes]);
        self.check(TrapKind::BadCast, fails);
        self.push(reference, ValType::Ref(target));
        Ok(())
    }

    // ==== WRITE BARRIER ====

    /// Barrier after storing a reference into `cell`. Cells whose state is
    /// above the instance threshold need nothing; otherwise the slow path
    /// runs, after a fence and a re-read when the collector asks for one.
    pub(super) fn emit_write_barrier(&mut self, cell: ValueId) {
        let state = self.load(Type::Int32, 1, false, cell, instance::GC_CELL_STATE);
        let inst = self.instance();
        let threshold = self.load(Type::Int32, 1, false, inst, instance::INSTANCE_BARRIER_THRESHOLD);
        let skip = self.compare(CompareOp::Above, state, threshold);

        let slow = self.new_block(Frequency::Rare);
        let fenced_path = self.new_block(Frequency::Rare);
        let call_path = self.new_block(Frequency::Rare);
        let done = self.new_block(Frequency::Normal);
        self.terminate(Opcode::Branch, &[skip], &[done, slow]);

        self.current = slow;
        let fenced = self.load(Type::Int32, 1, false, inst, instance::INSTANCE_MUTATOR_FENCED);
        self.terminate(Opcode::Branch, &[fenced], &[fenced_path, call_path]);

        self.current = fenced_path;
        self.emit(Opcode::Fence, Type::Void, &[]);
        let reloaded = self.load(Type::Int32, 1, false, cell, instance::GC_CELL_STATE);
        let black = self.const32(instance::GC_BLACK_THRESHOLD);
        let still_black = self.compare(CompareOp::BelowEqual, reloaded, black);
        self.terminate(Opcode::Branch, &[still_black], &[call_path, done]);

        self.current = call_path;
        self.emit_call(
            CallKind::Operation(RuntimeOperation::WriteBarrierSlowPath),
            &[inst, cell],
            Vec::new(),
        );
        self.jump(done);
        self.current = done;
    }
}

#[cfg(test)]
mod tests {
    use crate::core::error::CompileError;
    use crate::core::options::CompilerOptions;
    use crate::core::test_utils::test::TestContext;
    use crate::ir::interp::{Interpreter, NoCalls, Outcome};
    use crate::ir::{fix_ssa, TrapKind};
    use crate::wasm::builder::IrBuilder;
    use crate::wasm::compilation::Compilation;
    use crate::wasm::module_info::{
        FieldType, FunctionBody, FunctionType, HeapType, ModuleInformation, RefType, StorageType,
        StructType, TypeDefinition, ValType,
    };

    fn module(params: Vec<ValType>, results: Vec<ValType>) -> ModuleInformation {
        let mut module = ModuleInformation {
            types: vec![
                TypeDefinition::Func(FunctionType::new(params, results)),
                TypeDefinition::Struct(StructType::new(vec![
                    FieldType { storage: StorageType::I8, mutable: true },
                    FieldType { storage: StorageType::Val(ValType::I32), mutable: true },
                ])),
            ],
            functions: vec![FunctionBody { type_index: 0, locals: vec![], code: vec![] }],
            ..Default::default()
        };
        module.publish_callees();
        module
    }

    #[test]
    fn test_i31_round_trip_sign() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module(vec![ValType::I32], vec![ValType::I32, ValType::I32]);
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            b.add_local_get(0).unwrap();
            b.add_ref_i31().unwrap();
            b.add_i31_get(true).unwrap();
            b.add_local_get(0).unwrap();
            b.add_ref_i31().unwrap();
            b.add_i31_get(false).unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        fix_ssa(&mut compilation.procedure);
        let outcome = Interpreter::new(&compilation.procedure)
            .run(&[(-5i32) as u32 as u128], &mut NoCalls)
            .unwrap();
        assert_eq!(outcome, Outcome::Return(vec![(-5i32) as u32 as u128, 0x7fff_fffb]));
    }

    #[test]
    fn test_struct_get_reads_packed_field_and_traps_on_null() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let object = ValType::Ref(RefType { nullable: true, heap: HeapType::Concrete(1) });
        let module = module(vec![object], vec![ValType::I32]);
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            b.add_local_get(0).unwrap();
            b.add_struct_get(1, 0, true).unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        fix_ssa(&mut compilation.procedure);
        let mut memory = vec![0u8; 128];
        // object at 32, field 0 at payload offset 16
        memory[48] = 0xfe;
        let run = |pointer: u128| {
            Interpreter::new(&compilation.procedure)
                .with_memory(memory.clone())
                .run(&[pointer], &mut NoCalls)
                .unwrap()
        };
        assert_eq!(run(32), Outcome::Return(vec![(-2i32) as u32 as u128]));
        assert_eq!(run(0), Outcome::Trap(TrapKind::NullReference));
    }

    #[test]
    fn test_i31_cast_uses_tag_bit() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let anyref = ValType::Ref(RefType { nullable: true, heap: HeapType::Any });
        let module = module(vec![anyref], vec![ValType::I32]);
        let options = CompilerOptions::default();
        let mut compilation = Compilation::new(0);
        {
            let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
            b.add_local_get(0).unwrap();
            b.add_ref_cast(RefType { nullable: false, heap: HeapType::I31 }).unwrap();
            b.add_i31_get(false).unwrap();
            b.add_end().unwrap();
            b.finish().unwrap();
        }
        fix_ssa(&mut compilation.procedure);
        let run = |reference: u128| {
            Interpreter::new(&compilation.procedure)
                .run(&[reference], &mut NoCalls)
                .unwrap()
        };
        assert_eq!(run(0x0f), Outcome::Return(vec![7]));
        assert_eq!(run(0x40), Outcome::Trap(TrapKind::BadCast));
        assert_eq!(run(0), Outcome::Trap(TrapKind::BadCast));
    }

    #[test]
    fn test_gc_instructions_rejected_when_disabled() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let module = module(vec![ValType::I32], vec![]);
        let options = CompilerOptions {
            enable_gc: false,
            ..Default::default()
        };
        let mut compilation = Compilation::new(0);
        let mut b = IrBuilder::new(&mut compilation, &module, &options, &session, 0).unwrap();
        b.add_local_get(0).unwrap();
        assert!(matches!(b.add_ref_i31(), Err(CompileError::Unsupported { .. })));
    }
}
