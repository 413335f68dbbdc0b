// This module is a reference interpreter for the block graph. It executes a procedure from its
// function entrypoint over a flat linear memory and a separate instance area, so tests can
// check what built IR computes instead of matching its exact shape. Every value is held as
// raw bits in a u128 slot and reinterpreted through its type; tuples are kept per value.
// Variables, Phi/Upsilon shadows, checks and all terminals are modelled, so graphs can be run
// both before and after SSA repair. Calls go to a Host, which tests implement to stand in
// for other functions and runtime operations. A fuel counter stops runaway loops. Accesses
// outside memory end the run with an out-of-bounds trap, which is what the guard region
// produces in the signaling bounds-check mode.

//! Reference interpreter for built procedures.

use super::descriptor::{CallDescriptor, PatchpointKind};
use super::procedure::Procedure;
use super::types::{BlockId, Type, ValueId};
use super::value::{
    AtomicOp, BinaryOp, CompareOp, ConvertOp, MemoryAccess, Opcode, PinnedReg, SimdLane, SimdOp,
    TrapKind, UnaryOp,
};
use hashbrown::HashMap;
use thiserror::Error;

/// Address the instance area starts at.
pub const INSTANCE_BASE: u64 = 1 << 48;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Return(Vec<u128>),
    Trap(TrapKind),
    /// A runtime operation threw a wasm exception.
    Throw,
    /// Frame replaced by the tail call with this index.
    TailCall { tail_call: u32, args: Vec<u128> },
}

/// Failures of the interpreter itself, not of the program.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum InterpError {
    #[error("no function entrypoint")]
    NoEntry,
    #[error("cannot interpret {0}")]
    Unsupported(String),
    #[error("fuel exhausted")]
    OutOfFuel,
    #[error("{0} read before it was computed")]
    Undefined(ValueId),
}

/// Stands in for everything outside the procedure.
pub trait Host {
    /// Perform a call; `Err` ends the run with that outcome.
    fn call(&mut self, desc: &CallDescriptor, args: &[u128]) -> Result<Vec<u128>, Outcome>;
}

/// Host that fails every call.
pub struct NoCalls;

impl Host for NoCalls {
    fn call(&mut self, _desc: &CallDescriptor, _args: &[u128]) -> Result<Vec<u128>, Outcome> {
        Err(Outcome::Trap(TrapKind::Unreachable))
    }
}

pub struct Interpreter<'p> {
    proc: &'p Procedure,
    memory: Vec<u8>,
    instance: Vec<u8>,
    values: Vec<Option<u128>>,
    shadows: Vec<u128>,
    variables: Vec<u128>,
    tuples: HashMap<ValueId, Vec<u128>>,
    fuel: usize,
}

fn mask(ty: Type, bits: u128) -> u128 {
    match ty {
        Type::Int32 | Type::Float => bits & 0xffff_ffff,
        Type::Int64 | Type::Double => bits & 0xffff_ffff_ffff_ffff,
        _ => bits,
    }
}

fn f32_of(bits: u128) -> f32 {
    f32::from_bits(bits as u32)
}

fn f64_of(bits: u128) -> f64 {
    f64::from_bits(bits as u64)
}

fn wasm_min<F: num_like::Float>(a: F, b: F) -> F {
    if a.is_nan() || b.is_nan() {
        F::nan()
    } else if a == b {
        if a.is_sign_negative() {
            a
        } else {
            b
        }
    } else if a < b {
        a
    } else {
        b
    }
}

fn wasm_max<F: num_like::Float>(a: F, b: F) -> F {
    if a.is_nan() || b.is_nan() {
        F::nan()
    } else if a == b {
        if a.is_sign_positive() {
            a
        } else {
            b
        }
    } else if a > b {
        a
    } else {
        b
    }
}

mod num_like {
    pub trait Float: Copy + PartialOrd {
        fn is_nan(self) -> bool;
        fn nan() -> Self;
        fn is_sign_negative(self) -> bool;
        fn is_sign_positive(self) -> bool;
    }

    macro_rules! impl_float {
        ($t:ty) => {
            impl Float for $t {
                fn is_nan(self) -> bool {
                    <$t>::is_nan(self)
                }
                fn nan() -> Self {
                    <$t>::NAN
                }
                fn is_sign_negative(self) -> bool {
                    <$t>::is_sign_negative(self)
                }
                fn is_sign_positive(self) -> bool {
                    <$t>::is_sign_positive(self)
                }
            }
        };
    }

    impl_float!(f32);
    impl_float!(f64);
}

fn int_binary(op: BinaryOp, wide: bool, a: u64, b: u64) -> Result<u64, InterpError> {
    let bits = if wide { 64 } else { 32 };
    let m = if wide { u64::MAX } else { 0xffff_ffff };
    let (a, b) = (a & m, b & m);
    let sa = if wide { a as i64 } else { a as u32 as i32 as i64 };
    let sb = if wide { b as i64 } else { b as u32 as i32 as i64 };
    let shift = (b % bits) as u32;
    let r = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => {
            if sb == 0 {
                return Err(InterpError::Unsupported("unchecked division by zero".into()));
            }
            if wide {
                (sa.wrapping_div(sb)) as u64
            } else {
                ((sa as i32).wrapping_div(sb as i32)) as u32 as u64
            }
        }
        BinaryOp::UDiv => {
            if b == 0 {
                return Err(InterpError::Unsupported("unchecked division by zero".into()));
            }
            a / b
        }
        BinaryOp::Mod => {
            if sb == 0 {
                return Err(InterpError::Unsupported("unchecked division by zero".into()));
            }
            if wide {
                sa.wrapping_rem(sb) as u64
            } else {
                (sa as i32).wrapping_rem(sb as i32) as u32 as u64
            }
        }
        BinaryOp::UMod => {
            if b == 0 {
                return Err(InterpError::Unsupported("unchecked division by zero".into()));
            }
            a % b
        }
        BinaryOp::BitAnd => a & b,
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
        BinaryOp::Shl => a << shift,
        BinaryOp::SShr => {
            if wide {
                (sa >> shift) as u64
            } else {
                ((sa as i32) >> shift) as u32 as u64
            }
        }
        BinaryOp::ZShr => a >> shift,
        BinaryOp::RotL => {
            if wide {
                a.rotate_left(shift)
            } else {
                (a as u32).rotate_left(shift) as u64
            }
        }
        BinaryOp::RotR => {
            if wide {
                a.rotate_right(shift)
            } else {
                (a as u32).rotate_right(shift) as u64
            }
        }
        other => return Err(InterpError::Unsupported(format!("integer {:?}", other))),
    };
    Ok(r & m)
}

macro_rules! float_binary {
    ($op:expr, $a:expr, $b:expr) => {
        match $op {
            BinaryOp::Add => $a + $b,
            BinaryOp::Sub => $a - $b,
            BinaryOp::Mul => $a * $b,
            BinaryOp::Div => $a / $b,
            BinaryOp::FMin => wasm_min($a, $b),
            BinaryOp::FMax => wasm_max($a, $b),
            BinaryOp::CopySign => $a.copysign($b),
            other => return Err(InterpError::Unsupported(format!("float {:?}", other))),
        }
    };
}

macro_rules! float_unary {
    ($op:expr, $a:expr) => {
        match $op {
            UnaryOp::Neg => -$a,
            UnaryOp::Abs => $a.abs(),
            UnaryOp::Sqrt => $a.sqrt(),
            UnaryOp::Ceil => $a.ceil(),
            UnaryOp::Floor => $a.floor(),
            UnaryOp::FTrunc => $a.trunc(),
            UnaryOp::Nearest => $a.round_ties_even(),
            other => return Err(InterpError::Unsupported(format!("float {:?}", other))),
        }
    };
}

macro_rules! compare {
    ($op:expr, $a:expr, $b:expr, $ua:expr, $ub:expr) => {
        match $op {
            CompareOp::Equal => $a == $b,
            CompareOp::NotEqual => $a != $b,
            CompareOp::LessThan => $a < $b,
            CompareOp::GreaterThan => $a > $b,
            CompareOp::LessEqual => $a <= $b,
            CompareOp::GreaterEqual => $a >= $b,
            CompareOp::Above => $ua > $ub,
            CompareOp::Below => $ua < $ub,
            CompareOp::AboveEqual => $ua >= $ub,
            CompareOp::BelowEqual => $ua <= $ub,
        }
    };
}

fn lane(v: u128, lane: SimdLane, index: u8) -> u128 {
    let width = lane.lane_bits();
    let m = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
    (v >> (index as u32 * width)) & m
}

fn with_lane(v: u128, lane: SimdLane, index: u8, x: u128) -> u128 {
    let width = lane.lane_bits();
    let m = (1u128 << width) - 1;
    let shift = index as u32 * width;
    (v & !(m << shift)) | ((x & m) << shift)
}

impl<'p> Interpreter<'p> {
    pub fn new(proc: &'p Procedure) -> Self {
        Self {
            proc,
            memory: vec![0; 65536],
            instance: vec![0; 4096],
            values: vec![None; proc.num_values()],
            shadows: vec![0; proc.num_values()],
            variables: vec![0; proc.num_variables()],
            tuples: HashMap::new(),
            fuel: 1_000_000,
        }
    }

    pub fn with_memory(mut self, memory: Vec<u8>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_instance(mut self, instance: Vec<u8>) -> Self {
        self.instance = instance;
        self
    }

    pub fn with_fuel(mut self, fuel: usize) -> Self {
        self.fuel = fuel;
        self
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn instance(&self) -> &[u8] {
        &self.instance
    }

    fn get(&self, id: ValueId) -> Result<u128, InterpError> {
        self.values[id.index()].ok_or(InterpError::Undefined(id))
    }

    fn child(&self, value: ValueId, index: usize) -> Result<u128, InterpError> {
        self.get(self.proc.value(value).child(index))
    }

    fn child_type(&self, value: ValueId, index: usize) -> Type {
        self.proc.value(self.proc.value(value).child(index)).ty
    }

    /// Bytes at `address` or `None` if outside both areas.
    fn bytes_mut(&mut self, address: u64, width: usize) -> Option<&mut [u8]> {
        let (area, offset) = if address >= INSTANCE_BASE {
            (&mut self.instance, address - INSTANCE_BASE)
        } else {
            (&mut self.memory, address)
        };
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(width)?;
        area.get_mut(start..end)
    }

    fn load(&mut self, address: u64, access: MemoryAccess, ty: Type) -> Result<u128, Outcome> {
        let width = access.width as usize;
        let bytes = self
            .bytes_mut(address.wrapping_add(access.offset as u64), width)
            .ok_or(Outcome::Trap(TrapKind::OutOfBoundsMemoryAccess))?;
        let mut raw = [0u8; 16];
        raw[..width].copy_from_slice(bytes);
        let mut v = u128::from_le_bytes(raw);
        if access.signed && width < 16 {
            let shift = 128 - 8 * width as u32;
            v = (((v << shift) as i128) >> shift) as u128;
        }
        Ok(mask(ty, v))
    }

    fn store(&mut self, address: u64, access: MemoryAccess, value: u128) -> Result<(), Outcome> {
        let width = access.width as usize;
        let bytes = self
            .bytes_mut(address.wrapping_add(access.offset as u64), width)
            .ok_or(Outcome::Trap(TrapKind::OutOfBoundsMemoryAccess))?;
        bytes.copy_from_slice(&value.to_le_bytes()[..width]);
        Ok(())
    }

    /// Execute from the function entrypoint with the given arguments.
    pub fn run(&mut self, args: &[u128], host: &mut dyn Host) -> Result<Outcome, InterpError> {
        let entry = self.proc.function_entry().ok_or(InterpError::NoEntry)?;
        let mut block = entry;

        loop {
            match self.run_block(block, args, host)? {
                Step::Goto(next) => block = next,
                Step::Done(outcome) => return Ok(outcome),
            }
        }
    }

    fn run_block(
        &mut self,
        block: BlockId,
        args: &[u128],
        host: &mut dyn Host,
    ) -> Result<Step, InterpError> {
        let proc = self.proc;
        let data = proc.block(block);

        for &id in &data.values {
            if self.fuel == 0 {
                return Err(InterpError::OutOfFuel);
            }
            self.fuel -= 1;

            let value = proc.value(id);
            let ty = value.ty;
            let result: u128 = match value.opcode {
                Opcode::Nop | Opcode::Fence => continue,
                Opcode::Identity => self.child(id, 0)?,
                Opcode::Const32(v) => v as u32 as u128,
                Opcode::Const64(v) => v as u64 as u128,
                Opcode::ConstFloat(bits) => bits as u128,
                Opcode::ConstDouble(bits) => bits as u128,
                Opcode::ConstVector(bits) => bits,
                Opcode::Argument(i) => *args
                    .get(i as usize)
                    .ok_or_else(|| InterpError::Unsupported(format!("missing argument {}", i)))?,
                Opcode::EntryBuffer => {
                    return Err(InterpError::Unsupported("entry buffer outside an entry".into()))
                }
                Opcode::Binary(op) => {
                    let (a, b) = (self.child(id, 0)?, self.child(id, 1)?);
                    match ty {
                        Type::Int32 => int_binary(op, false, a as u64, b as u64)? as u128,
                        Type::Int64 => int_binary(op, true, a as u64, b as u64)? as u128,
                        Type::Float => float_binary!(op, f32_of(a), f32_of(b)).to_bits() as u128,
                        Type::Double => float_binary!(op, f64_of(a), f64_of(b)).to_bits() as u128,
                        other => {
                            return Err(InterpError::Unsupported(format!("{:?} on {}", op, other)))
                        }
                    }
                }
                Opcode::Unary(op) => {
                    let a = self.child(id, 0)?;
                    match (ty, op) {
                        (Type::Int32, UnaryOp::Clz) => (a as u32).leading_zeros() as u128,
                        (Type::Int32, UnaryOp::Ctz) => (a as u32).trailing_zeros() as u128,
                        (Type::Int32, UnaryOp::Popcnt) => (a as u32).count_ones() as u128,
                        (Type::Int32, UnaryOp::Neg) => (a as u32).wrapping_neg() as u128,
                        (Type::Int64, UnaryOp::Clz) => (a as u64).leading_zeros() as u128,
                        (Type::Int64, UnaryOp::Ctz) => (a as u64).trailing_zeros() as u128,
                        (Type::Int64, UnaryOp::Popcnt) => (a as u64).count_ones() as u128,
                        (Type::Int64, UnaryOp::Neg) => (a as u64).wrapping_neg() as u128,
                        (Type::Float, op) => float_unary!(op, f32_of(a)).to_bits() as u128,
                        (Type::Double, op) => float_unary!(op, f64_of(a)).to_bits() as u128,
                        (other, op) => {
                            return Err(InterpError::Unsupported(format!("{:?} on {}", op, other)))
                        }
                    }
                }
                Opcode::Compare(op) => {
                    let (a, b) = (self.child(id, 0)?, self.child(id, 1)?);
                    let holds = match self.child_type(id, 0) {
                        Type::Int32 => {
                            compare!(op, a as u32 as i32, b as u32 as i32, a as u32, b as u32)
                        }
                        Type::Int64 => {
                            compare!(op, a as u64 as i64, b as u64 as i64, a as u64, b as u64)
                        }
                        Type::Float => {
                            let (x, y) = (f32_of(a), f32_of(b));
                            compare!(op, x, y, x, y)
                        }
                        Type::Double => {
                            let (x, y) = (f64_of(a), f64_of(b));
                            compare!(op, x, y, x, y)
                        }
                        other => {
                            return Err(InterpError::Unsupported(format!("compare {}", other)))
                        }
                    };
                    holds as u128
                }
                Opcode::EqualZero => (mask(self.child_type(id, 0), self.child(id, 0)?) == 0) as u128,
                Opcode::Convert(op) => self.convert(id, op)?,
                Opcode::Select => {
                    if self.child(id, 0)? != 0 {
                        self.child(id, 1)?
                    } else {
                        self.child(id, 2)?
                    }
                }
                Opcode::Pinned(PinnedReg::MemoryBase) => 0,
                Opcode::Pinned(PinnedReg::MemoryBound) => self.memory.len() as u128,
                Opcode::Pinned(PinnedReg::Instance) => INSTANCE_BASE as u128,
                Opcode::Load(access) => {
                    let address = self.child(id, 0)? as u64;
                    match self.load(address, access, ty) {
                        Ok(v) => v,
                        Err(outcome) => return Ok(Step::Done(outcome)),
                    }
                }
                Opcode::Store(access) => {
                    let address = self.child(id, 0)? as u64;
                    let v = self.child(id, 1)?;
                    if let Err(outcome) = self.store(address, access, v) {
                        return Ok(Step::Done(outcome));
                    }
                    continue;
                }
                Opcode::AtomicRmw { op, access } => {
                    let address = self.child(id, 0)? as u64;
                    let operand = self.child(id, 1)?;
                    let old = match self.load(address, access, ty) {
                        Ok(v) => v,
                        Err(outcome) => return Ok(Step::Done(outcome)),
                    };
                    let new = match op {
                        AtomicOp::Add => old.wrapping_add(operand),
                        AtomicOp::Sub => old.wrapping_sub(operand),
                        AtomicOp::And => old & operand,
                        AtomicOp::Or => old | operand,
                        AtomicOp::Xor => old ^ operand,
                        AtomicOp::Xchg => operand,
                    };
                    if let Err(outcome) = self.store(address, access, new) {
                        return Ok(Step::Done(outcome));
                    }
                    old
                }
                Opcode::AtomicCas(access) => {
                    let address = self.child(id, 0)? as u64;
                    let expected = self.child(id, 1)?;
                    let replacement = self.child(id, 2)?;
                    let old = match self.load(address, access, ty) {
                        Ok(v) => v,
                        Err(outcome) => return Ok(Step::Done(outcome)),
                    };
                    let width_mask = if access.width >= 16 {
                        u128::MAX
                    } else {
                        (1u128 << (8 * access.width as u32)) - 1
                    };
                    if old == expected & width_mask {
                        if let Err(outcome) = self.store(address, access, replacement) {
                            return Ok(Step::Done(outcome));
                        }
                    }
                    old
                }
                Opcode::Get(var) => self.variables[var.index()],
                Opcode::Set(var) => {
                    self.variables[var.index()] = self.child(id, 0)?;
                    continue;
                }
                Opcode::Phi => self.shadows[id.index()],
                Opcode::Upsilon(phi) => {
                    self.shadows[phi.index()] = self.child(id, 0)?;
                    continue;
                }
                Opcode::Extract(index) => {
                    let tuple = self.proc.value(id).child(0);
                    self.tuples
                        .get(&tuple)
                        .and_then(|t| t.get(index as usize).copied())
                        .ok_or(InterpError::Undefined(tuple))?
                }
                Opcode::Call(call) => {
                    let desc = proc.call(call);
                    let operands = (0..desc.operand_count as usize)
                        .map(|i| self.child(id, i))
                        .collect::<Result<Vec<_>, _>>()?;
                    let results = match host.call(desc, &operands) {
                        Ok(results) => results,
                        Err(outcome) => return Ok(Step::Done(outcome)),
                    };
                    if let Type::Tuple(_) = ty {
                        self.tuples.insert(id, results);
                        0
                    } else {
                        results.first().copied().unwrap_or(0)
                    }
                }
                Opcode::Patchpoint(pp) => {
                    if let PatchpointKind::TailCall { tail_call } = proc.patchpoint(pp).kind {
                        let args = (0..value.children.len())
                            .map(|i| self.child(id, i))
                            .collect::<Result<Vec<_>, _>>()?;
                        return Ok(Step::Done(Outcome::TailCall { tail_call, args }));
                    }
                    continue;
                }
                Opcode::Check(kind) => {
                    if self.child(id, 0)? != 0 {
                        return Ok(Step::Done(Outcome::Trap(kind)));
                    }
                    continue;
                }
                Opcode::Simd(op) => self.simd(id, op)?,
                Opcode::Jump => return Ok(Step::Goto(data.successors[0])),
                Opcode::Branch => {
                    let taken = mask(self.child_type(id, 0), self.child(id, 0)?) != 0;
                    return Ok(Step::Goto(data.successors[if taken { 0 } else { 1 }]));
                }
                Opcode::Switch(switch) => {
                    let scrutinee = self.child(id, 0)?;
                    let key = match self.child_type(id, 0) {
                        Type::Int32 => scrutinee as u32 as i32 as i64,
                        _ => scrutinee as u64 as i64,
                    };
                    let cases = &proc.switch(switch).cases;
                    let target = cases.iter().position(|&c| c == key).unwrap_or(cases.len());
                    return Ok(Step::Goto(data.successors[target]));
                }
                Opcode::Return => {
                    let mut results = Vec::new();
                    for i in 0..value.children.len() {
                        results.push(self.child(id, i)?);
                    }
                    return Ok(Step::Done(Outcome::Return(results)));
                }
                Opcode::Oops => {
                    return Err(InterpError::Unsupported(format!("reached oops {}", id)))
                }
                Opcode::Trap(kind) => return Ok(Step::Done(Outcome::Trap(kind))),
            };
            self.values[id.index()] = Some(mask(ty, result));
        }

        Err(InterpError::Unsupported(format!("{} fell off its end", block)))
    }

    fn convert(&self, id: ValueId, op: ConvertOp) -> Result<u128, InterpError> {
        let a = self.child(id, 0)?;
        let from = self.child_type(id, 0);
        let to = self.proc.value(id).ty;
        let r = match op {
            ConvertOp::ZExt32 => a as u32 as u128,
            ConvertOp::SExt32 => a as u32 as i32 as i64 as u64 as u128,
            ConvertOp::Trunc => a as u32 as u128,
            ConvertOp::SExt8 => a as u8 as i8 as i64 as u64 as u128,
            ConvertOp::SExt16 => a as u16 as i16 as i64 as u64 as u128,
            ConvertOp::IntToFloat { signed } => {
                let as_f64 = match (from, signed) {
                    (Type::Int32, true) => a as u32 as i32 as f64,
                    (Type::Int32, false) => a as u32 as f64,
                    (Type::Int64, true) => a as u64 as i64 as f64,
                    _ => a as u64 as f64,
                };
                // i64 to f32 must round once, straight from the integer.
                match (to, from, signed) {
                    (Type::Float, Type::Int64, true) => (a as u64 as i64 as f32).to_bits() as u128,
                    (Type::Float, Type::Int64, false) => (a as u64 as f32).to_bits() as u128,
                    (Type::Float, _, _) => (as_f64 as f32).to_bits() as u128,
                    _ => as_f64.to_bits() as u128,
                }
            }
            ConvertOp::FloatToInt { signed, .. } => {
                let x = match from {
                    Type::Float => f32_of(a) as f64,
                    _ => f64_of(a),
                };
                match (to, signed) {
                    (Type::Int32, true) => x as i32 as u32 as u128,
                    (Type::Int32, false) => x as u32 as u128,
                    (_, true) => x as i64 as u64 as u128,
                    (_, false) => x as u64 as u128,
                }
            }
            ConvertOp::FloatToFloat => match to {
                Type::Double => (f32_of(a) as f64).to_bits() as u128,
                _ => (f64_of(a) as f32).to_bits() as u128,
            },
            ConvertOp::BitwiseCast => a,
        };
        Ok(r)
    }

    fn simd(&self, id: ValueId, op: SimdOp) -> Result<u128, InterpError> {
        let r = match op {
            SimdOp::Splat(shape) => {
                let x = self.child(id, 0)?;
                let mut v = 0u128;
                for i in 0..shape.lane_count() {
                    v = with_lane(v, shape, i, x);
                }
                v
            }
            SimdOp::ExtractLane { lane: shape, index, signed } => {
                let x = lane(self.child(id, 0)?, shape, index);
                let width = shape.lane_bits();
                if signed && width < 32 {
                    let shift = 32 - width;
                    ((((x as u32) << shift) as i32) >> shift) as u32 as u128
                } else {
                    x
                }
            }
            SimdOp::ReplaceLane { lane: shape, index } => {
                with_lane(self.child(id, 0)?, shape, index, self.child(id, 1)?)
            }
            SimdOp::Lanewise { lane: shape, op } => {
                let (a, b) = (self.child(id, 0)?, self.child(id, 1)?);
                let mut v = 0u128;
                for i in 0..shape.lane_count() {
                    let (x, y) = (lane(a, shape, i), lane(b, shape, i));
                    let r = match shape {
                        SimdLane::F32x4 => {
                            float_binary!(op, f32_of(x), f32_of(y)).to_bits() as u128
                        }
                        SimdLane::F64x2 => {
                            float_binary!(op, f64_of(x), f64_of(y)).to_bits() as u128
                        }
                        _ => match op {
                            BinaryOp::Add => x.wrapping_add(y),
                            BinaryOp::Sub => x.wrapping_sub(y),
                            BinaryOp::Mul => x.wrapping_mul(y),
                            other => {
                                return Err(InterpError::Unsupported(format!("lanewise {:?}", other)))
                            }
                        },
                    };
                    v = with_lane(v, shape, i, r);
                }
                v
            }
            SimdOp::Bitwise(op) => {
                let (a, b) = (self.child(id, 0)?, self.child(id, 1)?);
                match op {
                    BinaryOp::BitAnd => a & b,
                    BinaryOp::BitOr => a | b,
                    BinaryOp::BitXor => a ^ b,
                    other => return Err(InterpError::Unsupported(format!("bitwise {:?}", other))),
                }
            }
            SimdOp::AnyTrue => (self.child(id, 0)? != 0) as u128,
        };
        Ok(r)
    }
}

enum Step {
    Goto(BlockId),
    Done(Outcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{EntrypointKind, Frequency, Origin};

    #[test]
    fn test_branch_and_phi() {
        let mut proc = Procedure::new();
        let entry = proc.add_block(Frequency::Normal);
        let then = proc.add_block(Frequency::Normal);
        let other = proc.add_block(Frequency::Normal);
        let join = proc.add_block(Frequency::Normal);
        proc.add_entrypoint(entry, EntrypointKind::Function);
        let o = Origin::default();

        let arg = proc.append(entry, Opcode::Argument(0), Type::Int32, &[], o);
        proc.append_terminal(entry, Opcode::Branch, &[arg], &[then, other], o);
        let phi = proc.add_detached(join, Opcode::Phi, Type::Int32, &[], o);

        let a = proc.append(then, Opcode::Const32(10), Type::Int32, &[], o);
        proc.append(then, Opcode::Upsilon(phi), Type::Void, &[a], o);
        proc.append_terminal(then, Opcode::Jump, &[], &[join], o);
        let b = proc.append(other, Opcode::Const32(20), Type::Int32, &[], o);
        proc.append(other, Opcode::Upsilon(phi), Type::Void, &[b], o);
        proc.append_terminal(other, Opcode::Jump, &[], &[join], o);

        proc.append_existing(join, phi);
        proc.append_terminal(join, Opcode::Return, &[phi], &[], o);

        let run = |x: u128| Interpreter::new(&proc).run(&[x], &mut NoCalls).unwrap();
        assert_eq!(run(1), Outcome::Return(vec![10]));
        assert_eq!(run(0), Outcome::Return(vec![20]));
    }

    #[test]
    fn test_out_of_bounds_load_traps() {
        let mut proc = Procedure::new();
        let entry = proc.add_block(Frequency::Normal);
        proc.add_entrypoint(entry, EntrypointKind::Function);
        let o = Origin::default();
        let access = MemoryAccess { width: 4, signed: false, offset: 0 };

        let addr = proc.append(entry, Opcode::Const64(1 << 20), Type::Int64, &[], o);
        let load = proc.append(entry, Opcode::Load(access), Type::Int32, &[addr], o);
        proc.append_terminal(entry, Opcode::Return, &[load], &[], o);

        let outcome = Interpreter::new(&proc).run(&[], &mut NoCalls).unwrap();
        assert_eq!(outcome, Outcome::Trap(TrapKind::OutOfBoundsMemoryAccess));
    }

    #[test]
    fn test_signed_narrow_load_and_float_min() {
        let mut proc = Procedure::new();
        let entry = proc.add_block(Frequency::Normal);
        proc.add_entrypoint(entry, EntrypointKind::Function);
        let o = Origin::default();
        let access = MemoryAccess { width: 1, signed: true, offset: 3 };

        let addr = proc.append(entry, Opcode::Const64(0), Type::Int64, &[], o);
        let load = proc.append(entry, Opcode::Load(access), Type::Int32, &[addr], o);
        let x = proc.append(entry, Opcode::ConstFloat((-0.0f32).to_bits()), Type::Float, &[], o);
        let y = proc.append(entry, Opcode::ConstFloat(0.0f32.to_bits()), Type::Float, &[], o);
        let min = proc.append(entry, Opcode::Binary(BinaryOp::FMin), Type::Float, &[y, x], o);
        proc.append_terminal(entry, Opcode::Return, &[load, min], &[], o);

        let mut memory = vec![0u8; 16];
        memory[3] = 0xff;
        let outcome = Interpreter::new(&proc)
            .with_memory(memory)
            .run(&[], &mut NoCalls)
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Return(vec![0xffff_ffff, (-0.0f32).to_bits() as u128])
        );
    }
}
