//! Decoded wasm instructions.
//!
//! This is the opcode stream the builder consumes. Immediates are already
//! decoded and validated; numeric instructions are grouped by their IR
//! operation so the builder lowers them from one table.

use super::module_info::{HeapType, RefType, ValType};
use crate::ir::{AtomicOp, BinaryOp, CompareOp, ConvertOp, SimdOp, Type, UnaryOp};

/// Type annotation of a block, loop, if or try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
    /// Function type from the type section.
    Index(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemArg {
    pub offset: u32,
    /// Log2 of the alignment hint.
    pub align: u32,
}

/// Numeric value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumType {
    I32,
    I64,
    F32,
    F64,
}

impl NumType {
    pub fn val_type(self) -> ValType {
        match self {
            NumType::I32 => ValType::I32,
            NumType::I64 => ValType::I64,
            NumType::F32 => ValType::F32,
            NumType::F64 => ValType::F64,
        }
    }

    pub fn ir(self) -> Type {
        self.val_type().to_ir()
    }

    pub fn is_float(self) -> bool {
        matches!(self, NumType::F32 | NumType::F64)
    }
}

/// Numeric instruction, named by its IR lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOp {
    Binary(NumType, BinaryOp),
    Unary(NumType, UnaryOp),
    /// Operands have the given type; the result is i32.
    Compare(NumType, CompareOp),
    Eqz(NumType),
    Convert {
        from: NumType,
        to: NumType,
        op: ConvertOp,
    },
}

impl NumericOp {
    /// Operand count and result type.
    pub fn signature(self) -> (usize, ValType) {
        match self {
            NumericOp::Binary(ty, _) => (2, ty.val_type()),
            NumericOp::Unary(ty, _) => (1, ty.val_type()),
            NumericOp::Compare(..) => (2, ValType::I32),
            NumericOp::Eqz(_) => (1, ValType::I32),
            NumericOp::Convert { to, .. } => (1, to.val_type()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Unreachable,
    Nop,
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    /// Last entry of `targets` is not special; `default` is separate.
    BrTable { targets: Vec<u32>, default: u32 },
    Return,
    BrOnNull(u32),
    BrOnNonNull(u32),
    /// Branch when the cast succeeds, or fails with `on_fail`.
    BrOnCast { depth: u32, to: RefType, on_fail: bool },

    Call(u32),
    CallIndirect { type_index: u32, table_index: u32 },
    CallRef(u32),
    ReturnCall(u32),
    ReturnCallIndirect { type_index: u32, table_index: u32 },
    ReturnCallRef(u32),

    Try(BlockType),
    Catch(u32),
    CatchAll,
    Delegate(u32),
    Throw(u32),
    Rethrow(u32),

    Drop,
    Select,

    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),

    TableGet(u32),
    TableSet(u32),
    TableSize(u32),
    TableGrow(u32),

    /// Width in bytes; narrow loads extend to `ty`.
    Load { ty: ValType, width: u8, signed: bool, memarg: MemArg },
    Store { ty: ValType, width: u8, memarg: MemArg },
    MemorySize,
    MemoryGrow,
    MemoryFill,
    MemoryCopy,

    AtomicLoad { ty: ValType, width: u8, memarg: MemArg },
    AtomicStore { ty: ValType, width: u8, memarg: MemArg },
    AtomicRmw { op: AtomicOp, ty: ValType, width: u8, memarg: MemArg },
    AtomicCmpxchg { ty: ValType, width: u8, memarg: MemArg },
    /// memory.atomic.wait32 or wait64 depending on `ty`.
    AtomicWait { ty: ValType, memarg: MemArg },
    AtomicNotify(MemArg),
    AtomicFence,

    I32Const(i32),
    I64Const(i64),
    /// Bit pattern.
    F32Const(u32),
    /// Bit pattern.
    F64Const(u64),
    V128Const(u128),
    Numeric(NumericOp),

    RefNull(HeapType),
    RefIsNull,
    RefFunc(u32),
    RefAsNonNull,
    RefEq,

    StructNew(u32),
    /// `signed` selects the extension of packed fields.
    StructGet { type_index: u32, field: u32, signed: bool },
    StructSet { type_index: u32, field: u32 },
    ArrayNew(u32),
    ArrayGet { type_index: u32, signed: bool },
    ArraySet(u32),
    ArrayLen,
    RefTest(RefType),
    RefCast(RefType),
    RefI31,
    I31Get { signed: bool },

    Simd(SimdOp),
}

impl Instruction {
    pub fn is_tail_call(&self) -> bool {
        matches!(
            self,
            Instruction::ReturnCall(_)
                | Instruction::ReturnCallIndirect { .. }
                | Instruction::ReturnCallRef(_)
        )
    }

    /// Whether the instruction reads or produces a v128.
    pub fn uses_vectors(&self) -> bool {
        match self {
            Instruction::V128Const(_) | Instruction::Simd(_) => true,
            Instruction::Load { ty, .. } | Instruction::Store { ty, .. } => *ty == ValType::V128,
            _ => false,
        }
    }

    /// Short mnemonic for statistics.
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Unreachable => "unreachable",
            Instruction::Nop => "nop",
            Instruction::Block(_) => "block",
            Instruction::Loop(_) => "loop",
            Instruction::If(_) => "if",
            Instruction::Else => "else",
            Instruction::End => "end",
            Instruction::Br(_) => "br",
            Instruction::BrIf(_) => "br_if",
            Instruction::BrTable { .. } => "br_table",
            Instruction::Return => "return",
            Instruction::BrOnNull(_) => "br_on_null",
            Instruction::BrOnNonNull(_) => "br_on_non_null",
            Instruction::BrOnCast { .. } => "br_on_cast",
            Instruction::Call(_) => "call",
            Instruction::CallIndirect { .. } => "call_indirect",
            Instruction::CallRef(_) => "call_ref",
            Instruction::ReturnCall(_) => "return_call",
            Instruction::ReturnCallIndirect { .. } => "return_call_indirect",
            Instruction::ReturnCallRef(_) => "return_call_ref",
            Instruction::Try(_) => "try",
            Instruction::Catch(_) => "catch",
            Instruction::CatchAll => "catch_all",
            Instruction::Delegate(_) => "delegate",
            Instruction::Throw(_) => "throw",
            Instruction::Rethrow(_) => "rethrow",
            Instruction::Drop => "drop",
            Instruction::Select => "select",
            Instruction::LocalGet(_) => "local.get",
            Instruction::LocalSet(_) => "local.set",
            Instruction::LocalTee(_) => "local.tee",
            Instruction::GlobalGet(_) => "global.get",
            Instruction::GlobalSet(_) => "global.set",
            Instruction::TableGet(_) => "table.get",
            Instruction::TableSet(_) => "table.set",
            Instruction::TableSize(_) => "table.size",
            Instruction::TableGrow(_) => "table.grow",
            Instruction::Load { .. } => "load",
            Instruction::Store { .. } => "store",
            Instruction::MemorySize => "memory.size",
            Instruction::MemoryGrow => "memory.grow",
            Instruction::MemoryFill => "memory.fill",
            Instruction::MemoryCopy => "memory.copy",
            Instruction::AtomicLoad { .. } => "atomic.load",
            Instruction::AtomicStore { .. } => "atomic.store",
            Instruction::AtomicRmw { .. } => "atomic.rmw",
            Instruction::AtomicCmpxchg { .. } => "atomic.cmpxchg",
            Instruction::AtomicWait { .. } => "atomic.wait",
            Instruction::AtomicNotify(_) => "atomic.notify",
            Instruction::AtomicFence => "atomic.fence",
            Instruction::I32Const(_) => "i32.const",
            Instruction::I64Const(_) => "i64.const",
            Instruction::F32Const(_) => "f32.const",
            Instruction::F64Const(_) => "f64.const",
            Instruction::V128Const(_) => "v128.const",
            Instruction::Numeric(_) => "numeric",
            Instruction::RefNull(_) => "ref.null",
            Instruction::RefIsNull => "ref.is_null",
            Instruction::RefFunc(_) => "ref.func",
            Instruction::RefAsNonNull => "ref.as_non_null",
            Instruction::RefEq => "ref.eq",
            Instruction::StructNew(_) => "struct.new",
            Instruction::StructGet { .. } => "struct.get",
            Instruction::StructSet { .. } => "struct.set",
            Instruction::ArrayNew(_) => "array.new",
            Instruction::ArrayGet { .. } => "array.get",
            Instruction::ArraySet(_) => "array.set",
            Instruction::ArrayLen => "array.len",
            Instruction::RefTest(_) => "ref.test",
            Instruction::RefCast(_) => "ref.cast",
            Instruction::RefI31 => "ref.i31",
            Instruction::I31Get { .. } => "i31.get",
            Instruction::Simd(_) => "simd",
        }
    }
}
