// This module feeds a decoded instruction sequence into an IrBuilder, playing the part of the
// function parser that normally drives the builder. It dispatches one add_* call per
// instruction and tags every emitted value with the instruction index as its origin. After
// an instruction that leaves the current block terminated, code up to the matching else,
// catch, catch_all, delegate or end is dead: it is skipped with a nesting counter, and the
// instruction that revives the frame is passed to the *_to_unreachable variant instead.
// Alongside the builder, HeightValidator tracks the operand stack height from instruction
// stack effects alone, the way a type-checking validator would, and the driver compares the
// two after every reachable instruction. A disagreement is a builder bug and is reported as
// an internal error rather than as invalid input.

//! Instruction stream driver.

use super::builder::IrBuilder;
use super::instruction::{BlockType, Instruction};
use super::module_info::ModuleInformation;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{Origin, SimdOp};

#[derive(Debug, Clone, Copy)]
struct HeightFrame {
    base: usize,
    params: usize,
    results: usize,
    is_try: bool,
}

/// Operand stack height derived from stack effects only.
#[derive(Debug)]
pub struct HeightValidator<'m> {
    module: &'m ModuleInformation,
    height: usize,
    frames: Vec<HeightFrame>,
}

impl<'m> HeightValidator<'m> {
    /// Validator for a function returning `results` values.
    pub fn new(module: &'m ModuleInformation, results: usize) -> Self {
        Self {
            module,
            height: 0,
            frames: vec![HeightFrame { base: 0, params: 0, results, is_try: false }],
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn arity(&self, block_type: BlockType) -> CompileResult<(usize, usize)> {
        Ok(match block_type {
            BlockType::Empty => (0, 0),
            BlockType::Value(_) => (0, 1),
            BlockType::Index(index) => {
                let sig = self.module.function_type_at(index)?;
                (sig.params.len(), sig.results.len())
            }
        })
    }

    fn pop(&mut self, count: usize) -> CompileResult<()> {
        self.height = self.height.checked_sub(count).ok_or_else(|| {
            CompileError::validation(format!("stack height {} below {}", self.height, count))
        })?;
        Ok(())
    }

    fn open(&mut self, block_type: BlockType, condition: bool, is_try: bool) -> CompileResult<()> {
        let (params, results) = self.arity(block_type)?;
        if condition {
            self.pop(1)?;
        }
        self.pop(params)?;
        self.frames.push(HeightFrame { base: self.height, params, results, is_try });
        self.height += params;
        Ok(())
    }

    fn top(&self) -> CompileResult<HeightFrame> {
        self.frames
            .last()
            .copied()
            .ok_or_else(|| CompileError::validation("no open frame"))
    }

    fn close(&mut self) -> CompileResult<()> {
        let frame = self.top()?;
        self.frames.pop();
        self.height = frame.base + frame.results;
        Ok(())
    }

    /// Apply the effect of `instruction`, reached or not.
    pub fn apply(&mut self, instruction: &Instruction) -> CompileResult<()> {
        let module = self.module;
        let (pops, pushes) = match instruction {
            Instruction::Block(bt) | Instruction::Loop(bt) => return self.open(*bt, false, false),
            Instruction::If(bt) => return self.open(*bt, true, false),
            Instruction::Try(bt) => return self.open(*bt, false, true),
            Instruction::Else => {
                let frame = self.top()?;
                self.height = frame.base + frame.params;
                return Ok(());
            }
            Instruction::Catch(tag) => {
                let frame = self.top()?;
                self.height = frame.base + module.tag_type(*tag)?.params.len();
                return Ok(());
            }
            Instruction::CatchAll => {
                self.height = self.top()?.base;
                return Ok(());
            }
            Instruction::End | Instruction::Delegate(_) => return self.close(),

            Instruction::Unreachable
            | Instruction::Nop
            | Instruction::Br(_)
            | Instruction::Return
            | Instruction::Throw(_)
            | Instruction::Rethrow(_)
            | Instruction::ReturnCall(_)
            | Instruction::ReturnCallIndirect { .. }
            | Instruction::ReturnCallRef(_) => (0, 0),
            Instruction::BrIf(_) | Instruction::BrTable { .. } => (1, 0),
            Instruction::BrOnNull(_) | Instruction::BrOnCast { .. } => (1, 1),
            Instruction::BrOnNonNull(_) => (1, 0),

            Instruction::Call(f) => {
                let sig = module.function_type(*f)?;
                (sig.params.len(), sig.results.len())
            }
            Instruction::CallIndirect { type_index, .. } | Instruction::CallRef(type_index) => {
                let sig = module.function_type_at(*type_index)?;
                (sig.params.len() + 1, sig.results.len())
            }

            Instruction::Drop => (1, 0),
            Instruction::Select => (3, 1),
            Instruction::LocalGet(_) | Instruction::GlobalGet(_) => (0, 1),
            Instruction::LocalSet(_) | Instruction::GlobalSet(_) => (1, 0),
            Instruction::LocalTee(_) => (1, 1),

            Instruction::TableGet(_) => (1, 1),
            Instruction::TableSet(_) => (2, 0),
            Instruction::TableSize(_) => (0, 1),
            Instruction::TableGrow(_) => (2, 1),

            Instruction::Load { .. } | Instruction::AtomicLoad { .. } => (1, 1),
            Instruction::Store { .. } | Instruction::AtomicStore { .. } => (2, 0),
            Instruction::MemorySize => (0, 1),
            Instruction::MemoryGrow => (1, 1),
            Instruction::MemoryFill | Instruction::MemoryCopy => (3, 0),
            Instruction::AtomicRmw { .. } => (2, 1),
            Instruction::AtomicCmpxchg { .. } | Instruction::AtomicWait { .. } => (3, 1),
            Instruction::AtomicNotify(_) => (2, 1),
            Instruction::AtomicFence => (0, 0),

            Instruction::I32Const(_)
            | Instruction::I64Const(_)
            | Instruction::F32Const(_)
            | Instruction::F64Const(_)
            | Instruction::V128Const(_) => (0, 1),
            Instruction::Numeric(op) => (op.signature().0, 1),

            Instruction::RefNull(_) | Instruction::RefFunc(_) => (0, 1),
            Instruction::RefIsNull
            | Instruction::RefAsNonNull
            | Instruction::RefTest(_)
            | Instruction::RefCast(_)
            | Instruction::RefI31
            | Instruction::I31Get { .. }
            | Instruction::StructGet { .. }
            | Instruction::ArrayLen => (1, 1),
            Instruction::RefEq | Instruction::ArrayNew(_) | Instruction::ArrayGet { .. } => (2, 1),
            Instruction::StructNew(t) => (module.struct_type(*t)?.fields.len(), 1),
            Instruction::StructSet { .. } => (2, 0),
            Instruction::ArraySet(_) => (3, 0),

            Instruction::Simd(op) => match op {
                SimdOp::Splat(_) | SimdOp::ExtractLane { .. } | SimdOp::AnyTrue => (1, 1),
                SimdOp::ReplaceLane { .. } | SimdOp::Lanewise { .. } | SimdOp::Bitwise(_) => (2, 1),
            },
        };
        self.pop(pops)?;
        self.height += pushes;
        Ok(())
    }

    /// Drop below-frame operands once code becomes unreachable.
    pub fn enter_unreachable(&mut self) -> CompileResult<()> {
        let frame = self.top()?;
        self.height = self.height.min(frame.base + frame.params);
        Ok(())
    }

    /// Whether the innermost frame is a try.
    fn innermost_is_try(&self) -> bool {
        self.frames.last().is_some_and(|f| f.is_try)
    }
}

fn dispatch(builder: &mut IrBuilder<'_, '_>, instruction: &Instruction) -> CompileResult<()> {
    match instruction {
        Instruction::Unreachable => builder.add_unreachable(),
        Instruction::Nop => builder.add_nop(),
        Instruction::Block(bt) => builder.add_block(*bt),
        Instruction::Loop(bt) => builder.add_loop(*bt),
        Instruction::If(bt) => builder.add_if(*bt),
        Instruction::Else => builder.add_else(),
        Instruction::End => builder.add_end(),
        Instruction::Br(depth) => builder.add_br(*depth),
        Instruction::BrIf(depth) => builder.add_br_if(*depth),
        Instruction::BrTable { targets, default } => builder.add_br_table(targets, *default),
        Instruction::Return => builder.add_return(),
        Instruction::BrOnNull(depth) => builder.add_br_on_null(*depth),
        Instruction::BrOnNonNull(depth) => builder.add_br_on_non_null(*depth),
        Instruction::BrOnCast { depth, to, on_fail } => builder.add_br_on_cast(*depth, *to, *on_fail),

        Instruction::Call(f) => builder.add_call(*f),
        Instruction::CallIndirect { type_index, table_index } => {
            builder.add_call_indirect(*type_index, *table_index)
        }
        Instruction::CallRef(t) => builder.add_call_ref(*t),
        Instruction::ReturnCall(f) => builder.add_return_call(*f),
        Instruction::ReturnCallIndirect { type_index, table_index } => {
            builder.add_return_call_indirect(*type_index, *table_index)
        }
        Instruction::ReturnCallRef(t) => builder.add_return_call_ref(*t),

        Instruction::Try(bt) => builder.add_try(*bt),
        Instruction::Catch(tag) => builder.add_catch(*tag),
        Instruction::CatchAll => builder.add_catch_all(),
        Instruction::Delegate(depth) => builder.add_delegate(*depth),
        Instruction::Throw(tag) => builder.add_throw(*tag),
        Instruction::Rethrow(depth) => builder.add_rethrow(*depth),

        Instruction::Drop => builder.add_drop(),
        Instruction::Select => builder.add_select(),
        Instruction::LocalGet(i) => builder.add_local_get(*i),
        Instruction::LocalSet(i) => builder.add_local_set(*i),
        Instruction::LocalTee(i) => builder.add_local_tee(*i),
        Instruction::GlobalGet(i) => builder.add_global_get(*i),
        Instruction::GlobalSet(i) => builder.add_global_set(*i),

        Instruction::TableGet(t) => builder.add_table_get(*t),
        Instruction::TableSet(t) => builder.add_table_set(*t),
        Instruction::TableSize(t) => builder.add_table_size(*t),
        Instruction::TableGrow(t) => builder.add_table_grow(*t),

        Instruction::Load { ty, width, signed, memarg } => builder.add_load(*ty, *width, *signed, *memarg),
        Instruction::Store { width, memarg, .. } => builder.add_store(*width, *memarg),
        Instruction::MemorySize => builder.add_memory_size(),
        Instruction::MemoryGrow => builder.add_memory_grow(),
        Instruction::MemoryFill => builder.add_memory_fill(),
        Instruction::MemoryCopy => builder.add_memory_copy(),
        Instruction::AtomicLoad { ty, width, memarg } => builder.add_atomic_load(*ty, *width, *memarg),
        Instruction::AtomicStore { width, memarg, .. } => builder.add_atomic_store(*width, *memarg),
        Instruction::AtomicRmw { op, ty, width, memarg } => {
            builder.add_atomic_rmw(*op, *ty, *width, *memarg)
        }
        Instruction::AtomicCmpxchg { ty, width, memarg } => {
            builder.add_atomic_cmpxchg(*ty, *width, *memarg)
        }
        Instruction::AtomicWait { ty, memarg } => builder.add_atomic_wait(*ty, *memarg),
        Instruction::AtomicNotify(memarg) => builder.add_atomic_notify(*memarg),
        Instruction::AtomicFence => builder.add_atomic_fence(),

        Instruction::I32Const(v) => builder.add_i32_const(*v),
        Instruction::I64Const(v) => builder.add_i64_const(*v),
        Instruction::F32Const(bits) => builder.add_f32_const(*bits),
        Instruction::F64Const(bits) => builder.add_f64_const(*bits),
        Instruction::V128Const(bits) => builder.add_v128_const(*bits),
        Instruction::Numeric(op) => builder.add_numeric(*op),

        Instruction::RefNull(heap) => builder.add_ref_null(*heap),
        Instruction::RefIsNull => builder.add_ref_is_null(),
        Instruction::RefFunc(f) => builder.add_ref_func(*f),
        Instruction::RefAsNonNull => builder.add_ref_as_non_null(),
        Instruction::RefEq => builder.add_ref_eq(),
        Instruction::StructNew(t) => builder.add_struct_new(*t),
        Instruction::StructGet { type_index, field, signed } => {
            builder.add_struct_get(*type_index, *field, *signed)
        }
        Instruction::StructSet { type_index, field } => builder.add_struct_set(*type_index, *field),
        Instruction::ArrayNew(t) => builder.add_array_new(*t),
        Instruction::ArrayGet { type_index, signed } => builder.add_array_get(*type_index, *signed),
        Instruction::ArraySet(t) => builder.add_array_set(*t),
        Instruction::ArrayLen => builder.add_array_len(),
        Instruction::RefTest(rt) => builder.add_ref_test(*rt),
        Instruction::RefCast(rt) => builder.add_ref_cast(*rt),
        Instruction::RefI31 => builder.add_ref_i31(),
        Instruction::I31Get { signed } => builder.add_i31_get(*signed),

        Instruction::Simd(op) => builder.add_simd(*op),
    }
}

/// Instruction that closes or reopens the dead frame, passed to its
/// unreachable variant. `Ok(false)` when `instruction` is still dead.
fn revive(builder: &mut IrBuilder<'_, '_>, instruction: &Instruction) -> CompileResult<bool> {
    match instruction {
        Instruction::Else => builder.add_else_to_unreachable()?,
        Instruction::End => builder.add_end_to_unreachable()?,
        Instruction::Catch(tag) => builder.add_catch_to_unreachable(*tag)?,
        Instruction::CatchAll => builder.add_catch_all_to_unreachable()?,
        Instruction::Delegate(depth) => builder.add_delegate_to_unreachable(*depth)?,
        _ => return Ok(false),
    }
    Ok(true)
}

/// Translate `code`, a whole function body ending in its final `end`.
pub fn translate(builder: &mut IrBuilder<'_, '_>, code: &[Instruction]) -> CompileResult<()> {
    let results = builder.result_count();
    let mut validator = HeightValidator::new(builder.module(), results);
    // Nested frames opened inside dead code.
    let mut dead_depth: Option<usize> = None;

    for (index, instruction) in code.iter().enumerate() {
        if builder.control_depth() == 0 {
            return Err(CompileError::validation(format!(
                "{} at {} after the function's final end",
                instruction.name(),
                index
            )));
        }
        builder.set_origin(Origin(index as u32));

        if let Some(depth) = dead_depth {
            match instruction {
                Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_) | Instruction::Try(_) => {
                    dead_depth = Some(depth + 1);
                }
                Instruction::End | Instruction::Delegate(_) if depth > 0 => dead_depth = Some(depth - 1),
                _ if depth > 0 => {}
                _ => {
                    if matches!(instruction, Instruction::Delegate(_)) && !validator.innermost_is_try() {
                        return Err(CompileError::validation("delegate outside try"));
                    }
                    if revive(builder, instruction)? {
                        validator.apply(instruction)?;
                        dead_depth = None;
                        log::trace!("{}: {} revives the frame", index, instruction.name());
                    }
                }
            }
            continue;
        }

        log::trace!("{}: {}", index, instruction.name());
        dispatch(builder, instruction)?;
        validator.apply(instruction)?;

        if builder.control_depth() == 0 {
            continue;
        }
        if !builder.is_reachable() {
            validator.enter_unreachable()?;
            dead_depth = Some(0);
            continue;
        }
        if validator.height() != builder.stack_height() {
            return Err(CompileError::internal(format!(
                "stack height {} after {} at {}, validator expects {}",
                builder.stack_height(),
                instruction.name(),
                index,
                validator.height()
            )));
        }
    }

    if builder.control_depth() != 0 {
        return Err(CompileError::validation("function body ends without its final end"));
    }
    Ok(())
}
