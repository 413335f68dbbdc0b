// This module defines the operations of the block graph. Every Value is the single definition
// of its result: an Opcode tag carrying the operation's immediate data, a result Type, an
// ordered list of child edges naming the values it reads, the block it lives in and the
// bytecode origin it was produced for. Control transfer targets are not stored on the
// terminal value but in the owning block's successor list, so rewriting an edge (critical
// edge splitting, pruning) never touches values. Two opcode pairs carry the mutable parts of
// the graph: Get/Set read and write a Variable, and Upsilon/Phi implement joins, where each
// Upsilon writes the pending value of one Phi on an incoming path and the Phi reads it at the
// head of the join block. Edges carry a kill flag written back by liveness analysis.

//! Opcodes, values and edges.

use super::types::{BlockId, CallId, Origin, PatchpointId, SwitchId, Type, ValueId, VariableId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Two-operand arithmetic and bitwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Signed integer or float division.
    Div,
    UDiv,
    /// Signed remainder, `MIN % -1` yields 0.
    Mod,
    UMod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    SShr,
    ZShr,
    RotL,
    RotR,
    FMin,
    FMax,
    CopySign,
}

/// One-operand operations that keep the operand type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Clz,
    Ctz,
    Popcnt,
    Abs,
    Sqrt,
    Ceil,
    Floor,
    FTrunc,
    Nearest,
}

/// Comparisons, all producing an Int32 0 or 1.
///
/// Float comparisons are ordered: any NaN operand makes them false except
/// `NotEqual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessEqual,
    GreaterEqual,
    Above,
    Below,
    AboveEqual,
    BelowEqual,
}

/// Width and representation changes. The result type selects the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvertOp {
    /// Int32 to Int64, zero filled.
    ZExt32,
    /// Int32 to Int64, sign filled.
    SExt32,
    /// Int64 to Int32.
    Trunc,
    /// Sign extend the low byte within the same width.
    SExt8,
    /// Sign extend the low half word within the same width.
    SExt16,
    IntToFloat { signed: bool },
    /// Float to integer. Non-saturating conversions are guarded by a range check.
    FloatToInt { signed: bool, saturating: bool },
    /// Float to Double or Double to Float.
    FloatToFloat,
    BitwiseCast,
}

/// Read-modify-write operations for atomics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Xchg,
}

/// Shape of a memory access. The value type gives the register width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryAccess {
    /// Bytes touched in memory.
    pub width: u8,
    /// Sign extend narrow loads.
    pub signed: bool,
    /// Constant offset added to the address child.
    pub offset: u32,
}

/// Values kept in reserved registers for the whole function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinnedReg {
    MemoryBase,
    /// Size in bytes of the accessible memory.
    MemoryBound,
    Instance,
}

/// Runtime failures a `Check` or `Trap` raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrapKind {
    Unreachable,
    OutOfBoundsMemoryAccess,
    UnalignedMemoryAccess,
    OutOfBoundsTableAccess,
    OutOfBoundsCallIndirect,
    NullTableEntry,
    BadSignature,
    OutOfBoundsTrunc,
    DivisionByZero,
    IntegerOverflow,
    StackOverflow,
    NullReference,
    OutOfBoundsArrayAccess,
    BadCast,
}

/// Lane interpretation of a 128-bit vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimdLane {
    I8x16,
    I16x8,
    I32x4,
    I64x2,
    F32x4,
    F64x2,
}

impl SimdLane {
    pub fn lane_count(self) -> u8 {
        match self {
            SimdLane::I8x16 => 16,
            SimdLane::I16x8 => 8,
            SimdLane::I32x4 | SimdLane::F32x4 => 4,
            SimdLane::I64x2 | SimdLane::F64x2 => 2,
        }
    }

    pub fn lane_bits(self) -> u32 {
        128 / self.lane_count() as u32
    }

    pub fn is_float(self) -> bool {
        matches!(self, SimdLane::F32x4 | SimdLane::F64x2)
    }

    /// Scalar type a lane is read into.
    pub fn scalar_type(self) -> Type {
        match self {
            SimdLane::I8x16 | SimdLane::I16x8 | SimdLane::I32x4 => Type::Int32,
            SimdLane::I64x2 => Type::Int64,
            SimdLane::F32x4 => Type::Float,
            SimdLane::F64x2 => Type::Double,
        }
    }
}

/// Vector operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimdOp {
    Splat(SimdLane),
    ExtractLane { lane: SimdLane, index: u8, signed: bool },
    ReplaceLane { lane: SimdLane, index: u8 },
    /// Lane-wise Add, Sub, Mul, FMin or FMax.
    Lanewise { lane: SimdLane, op: BinaryOp },
    /// Whole-register BitAnd, BitOr or BitXor.
    Bitwise(BinaryOp),
    AnyTrue,
}

/// Operation a value performs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    Nop,
    /// Copy of the single child; removed once uses are rewired.
    Identity,
    Const32(i32),
    Const64(i64),
    /// Bit pattern of an f32.
    ConstFloat(u32),
    /// Bit pattern of an f64.
    ConstDouble(u64),
    ConstVector(u128),
    /// Incoming parameter of the function entrypoint.
    Argument(u32),
    /// Scratch buffer pointer handed to a catch or OSR entrypoint.
    EntryBuffer,
    Binary(BinaryOp),
    Unary(UnaryOp),
    Compare(CompareOp),
    /// Int32 zero test.
    EqualZero,
    Convert(ConvertOp),
    /// children: condition, then, else.
    Select,
    Pinned(PinnedReg),
    /// children: address.
    Load(MemoryAccess),
    /// children: address, value.
    Store(MemoryAccess),
    /// children: address, operand. Yields the old value.
    AtomicRmw { op: AtomicOp, access: MemoryAccess },
    /// children: address, expected, replacement. Yields the old value.
    AtomicCas(MemoryAccess),
    Fence,
    Get(VariableId),
    /// children: value.
    Set(VariableId),
    Phi,
    /// Feeds the given phi. children: value.
    Upsilon(ValueId),
    Extract(u16),
    Call(CallId),
    Patchpoint(PatchpointId),
    /// Raises when children[0] is non-zero. Later children are kept live for unwinding.
    Check(TrapKind),
    Simd(SimdOp),
    Jump,
    /// Goes to successor 0 when children[0] is non-zero, else successor 1.
    Branch,
    Switch(SwitchId),
    Return,
    /// Marks a point control never reaches.
    Oops,
    /// Unconditionally raises.
    Trap(TrapKind),
}

impl Opcode {
    /// Whether the value ends its block.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::Branch
                | Opcode::Switch(_)
                | Opcode::Return
                | Opcode::Oops
                | Opcode::Trap(_)
        )
    }

    /// Short category name, used for statistics and dumps.
    pub fn category(&self) -> &'static str {
        match self {
            Opcode::Nop | Opcode::Identity => "misc",
            Opcode::Const32(_)
            | Opcode::Const64(_)
            | Opcode::ConstFloat(_)
            | Opcode::ConstDouble(_)
            | Opcode::ConstVector(_) => "constant",
            Opcode::Argument(_) | Opcode::EntryBuffer => "entry",
            Opcode::Binary(_)
            | Opcode::Unary(_)
            | Opcode::Compare(_)
            | Opcode::EqualZero
            | Opcode::Convert(_)
            | Opcode::Select => "numeric",
            Opcode::Pinned(_) => "pinned",
            Opcode::Load(_)
            | Opcode::Store(_)
            | Opcode::AtomicRmw { .. }
            | Opcode::AtomicCas(_)
            | Opcode::Fence => "memory",
            Opcode::Get(_) | Opcode::Set(_) => "variable",
            Opcode::Phi | Opcode::Upsilon(_) => "ssa",
            Opcode::Extract(_) | Opcode::Call(_) | Opcode::Patchpoint(_) => "call",
            Opcode::Check(_) => "check",
            Opcode::Simd(_) => "simd",
            Opcode::Jump
            | Opcode::Branch
            | Opcode::Switch(_)
            | Opcode::Return
            | Opcode::Oops
            | Opcode::Trap(_) => "control",
        }
    }
}

/// Use of a value by another value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub value: ValueId,
    /// Last use on this path; set by liveness analysis.
    pub kill: bool,
}

impl Edge {
    pub fn new(value: ValueId) -> Self {
        Self { value, kill: false }
    }
}

/// One operation in the block graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Value {
    pub opcode: Opcode,
    pub ty: Type,
    pub children: Vec<Edge>,
    /// Owning block. Detached phis keep the block they were reserved for.
    pub block: BlockId,
    pub origin: Origin,
}

impl Value {
    pub fn child(&self, index: usize) -> ValueId {
        self.children[index].value
    }

    pub fn child_ids(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.children.iter().map(|edge| edge.value)
    }

    /// Phi fed by this value, if it is an Upsilon.
    pub fn upsilon_phi(&self) -> Option<ValueId> {
        match self.opcode {
            Opcode::Upsilon(phi) => Some(phi),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Const32(v) => write!(f, "Const32({})", v),
            Opcode::Const64(v) => write!(f, "Const64({})", v),
            Opcode::ConstFloat(bits) => write!(f, "ConstFloat({})", f32::from_bits(*bits)),
            Opcode::ConstDouble(bits) => write!(f, "ConstDouble({})", f64::from_bits(*bits)),
            Opcode::ConstVector(bits) => write!(f, "ConstVector({:#034x})", bits),
            Opcode::Argument(i) => write!(f, "Argument({})", i),
            Opcode::Binary(op) => write!(f, "{:?}", op),
            Opcode::Unary(op) => write!(f, "{:?}", op),
            Opcode::Compare(op) => write!(f, "{:?}", op),
            Opcode::Convert(op) => write!(f, "{:?}", op),
            Opcode::Pinned(reg) => write!(f, "Pinned({:?})", reg),
            Opcode::Load(access) => write!(f, "Load{}(offset = {})", access.width * 8, access.offset),
            Opcode::Store(access) => {
                write!(f, "Store{}(offset = {})", access.width * 8, access.offset)
            }
            Opcode::AtomicRmw { op, access } => {
                write!(f, "Atomic{:?}{}(offset = {})", op, access.width * 8, access.offset)
            }
            Opcode::AtomicCas(access) => {
                write!(f, "AtomicCas{}(offset = {})", access.width * 8, access.offset)
            }
            Opcode::Get(var) => write!(f, "Get({})", var),
            Opcode::Set(var) => write!(f, "Set({})", var),
            Opcode::Upsilon(phi) => write!(f, "Upsilon(^{})", phi),
            Opcode::Extract(i) => write!(f, "Extract({})", i),
            Opcode::Call(id) => write!(f, "Call({})", id),
            Opcode::Patchpoint(id) => write!(f, "Patchpoint({})", id),
            Opcode::Check(kind) => write!(f, "Check({:?})", kind),
            Opcode::Simd(op) => write!(f, "Simd({:?})", op),
            Opcode::Switch(id) => write!(f, "Switch({})", id),
            Opcode::Trap(kind) => write!(f, "Trap({:?})", kind),
            other => write!(f, "{:?}", other),
        }
    }
}
