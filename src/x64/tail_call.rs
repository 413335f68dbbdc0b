// This module plans and emits the frame shuffle of a wasm tail call. The callee reuses the
// caller's frame: its stack arguments land where the caller's incoming arguments were, moved
// up or down by the difference in argument area size, with the return address directly
// below them. The lowest byte the new frame writes is the danger line; any source above it
// may be overwritten before it is read. The plan therefore runs in two phases. Phase one
// copies every outgoing value into scratch slots below both the danger line and the current
// frame, register sources before stack sources since stack-to-stack copies go through the
// R11/XMM15 temporaries, and also saves the return address and caller frame pointer and
// restores callee-saved registers. Phase two copies scratch slots to the final stack and
// register locations, writes the return address, and loads the caller frame pointer into
// R11. Indirect and ref tail calls carry the callee's code pointer as the second source; it
// takes a scratch slot like any argument and is loaded into R10, which no argument uses, as
// the last move before the jump through it. Every move records which earlier move (if any)
// produced the value it reads, which lets verify_moves prove that no read observes a
// clobbered location.

//! Tail-call argument shuffling.

use super::calling_convention::{CallInformation, FunctionFrame, RegBank, WasmAssigner};
use super::encoder::{EncodingError, X64Encoder};
use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::AsmReg;
use crate::ir::Type;
use bumpalo::{collections::Vec as BumpVec, Bump};
use serde::{Deserialize, Serialize};

/// GP temporary for memory-to-memory moves.
pub const GP_TEMP: AsmReg = AsmReg::R11;
/// XMM temporary for memory-to-memory moves.
pub const XMM_TEMP: AsmReg = AsmReg::xmm(15);
/// Holds the callee's code pointer of an indirect tail call at the jump.
pub const CODE_REG: AsmReg = AsmReg::R10;

/// Register or rbp-relative stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    Reg(AsmReg),
    Stack(i32),
}

/// One copy in the shuffle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub from: Location,
    pub to: Location,
    pub bank: RegBank,
    /// Bytes copied.
    pub width: u32,
    /// Move whose result `from` must still hold; `None` for original contents.
    pub expects: Option<usize>,
}

impl Move {
    fn temp(&self) -> Option<AsmReg> {
        match (self.from, self.to) {
            (Location::Stack(_), Location::Stack(_)) => Some(match self.bank {
                RegBank::GeneralPurpose => GP_TEMP,
                RegBank::Xmm => XMM_TEMP,
            }),
            _ => None,
        }
    }
}

fn overlaps(a: Location, a_width: u32, b: Location, b_width: u32) -> bool {
    match (a, b) {
        (Location::Reg(x), Location::Reg(y)) => x == y,
        (Location::Stack(x), Location::Stack(y)) => {
            x < y + b_width as i32 && y < x + a_width as i32
        }
        _ => false,
    }
}

/// Check that every move reads the value it expects.
pub fn verify_moves(moves: &[Move]) -> bool {
    for (i, mv) in moves.iter().enumerate() {
        let last_writer = (0..i).rev().find(|&j| {
            let earlier = &moves[j];
            overlaps(earlier.to, earlier.width, mv.from, mv.width)
                || earlier
                    .temp()
                    .is_some_and(|t| overlaps(Location::Reg(t), 16, mv.from, mv.width))
        });
        if last_writer != mv.expects {
            log::trace!("move {} reads {:?} last written by {:?}", i, mv.from, last_writer);
            return false;
        }
    }
    true
}

/// Complete frame replacement for one tail call.
#[derive(Debug)]
pub struct TailCallPlan<'a> {
    pub moves: BumpVec<'a, Move>,
    /// Lowest rbp-relative byte the new frame writes.
    pub danger_line: i32,
    /// Lowest scratch byte; rsp is lowered here first.
    pub scratch_base: i32,
    /// rbp-relative slot of the return address, where rsp points at the jump.
    pub return_slot: i32,
    /// Moves before this index belong to phase one.
    pub phase_split: usize,
    /// Register the shuffle jumps through; `None` for a direct target.
    pub code_reg: Option<AsmReg>,
}

fn width_of(ty: Type) -> u32 {
    if ty.is_vector() {
        16
    } else {
        8
    }
}

impl<'a> TailCallPlan<'a> {
    /// Plan moving `sources` into the callee's argument locations. The first
    /// source is the callee instance.
    pub fn new(
        arena: &'a Bump,
        sources: &[(Location, Type)],
        callee: &CallInformation,
        frame: &FunctionFrame<'_>,
    ) -> CompileResult<Self> {
        Self::plan(arena, sources, callee, frame, false)
    }

    /// Plan for a callee only known at run time: the callee instance, then
    /// its code pointer, then the arguments.
    pub fn new_indirect(
        arena: &'a Bump,
        sources: &[(Location, Type)],
        callee: &CallInformation,
        frame: &FunctionFrame<'_>,
    ) -> CompileResult<Self> {
        Self::plan(arena, sources, callee, frame, true)
    }

    fn plan(
        arena: &'a Bump,
        sources: &[(Location, Type)],
        callee: &CallInformation,
        frame: &FunctionFrame<'_>,
        indirect: bool,
    ) -> CompileResult<Self> {
        let leading = if indirect { 2 } else { 1 };
        if sources.len() != callee.params.len() + leading {
            return Err(CompileError::InvalidArity {
                operation: "tail call",
                expected: callee.params.len() + leading,
                actual: sources.len(),
            });
        }

        let new_args_base = 16 + frame.incoming_stack_args as i32
            - callee.header_and_args_size() as i32;
        let return_slot = new_args_base - 8;
        let danger_line = return_slot;

        let mut destinations = Vec::with_capacity(sources.len());
        destinations.push(Location::Reg(WasmAssigner::INSTANCE_REG));
        if indirect {
            destinations.push(Location::Reg(CODE_REG));
        }
        for param in &callee.params {
            destinations.push(match (param.reg, param.stack_off) {
                (Some(reg), _) => Location::Reg(reg),
                (None, Some(off)) => Location::Stack(new_args_base + off),
                (None, None) => {
                    return Err(CompileError::internal("unassigned tail call argument"))
                }
            });
        }

        // Scratch slots grow down from below both the frame and the danger line.
        let mut cursor = danger_line.min(-(frame.frame_size as i32));
        let mut take_slot = |width: u32| {
            cursor -= width as i32;
            cursor &= !(width as i32 - 1);
            cursor
        };
        let scratch: Vec<i32> = sources.iter().map(|&(_, ty)| take_slot(width_of(ty))).collect();
        let return_scratch = take_slot(8);
        let fp_scratch = take_slot(8);
        let scratch_base = cursor & !15;

        let mut moves = BumpVec::new_in(arena);
        let mut filled = vec![0usize; sources.len()];

        // Phase 1: register sources, then stack sources through the temps.
        let order = sources
            .iter()
            .enumerate()
            .filter(|(_, (loc, _))| matches!(loc, Location::Reg(_)))
            .chain(
                sources
                    .iter()
                    .enumerate()
                    .filter(|(_, (loc, _))| matches!(loc, Location::Stack(_))),
            );
        for (i, &(from, ty)) in order {
            filled[i] = moves.len();
            moves.push(Move {
                from,
                to: Location::Stack(scratch[i]),
                bank: RegBank::of(ty),
                width: width_of(ty),
                expects: None,
            });
        }
        let return_saved = moves.len();
        moves.push(Move {
            from: Location::Stack(8),
            to: Location::Stack(return_scratch),
            bank: RegBank::GeneralPurpose,
            width: 8,
            expects: None,
        });
        let fp_saved = moves.len();
        moves.push(Move {
            from: Location::Stack(0),
            to: Location::Stack(fp_scratch),
            bank: RegBank::GeneralPurpose,
            width: 8,
            expects: None,
        });
        for (i, &reg) in frame.saved_registers.iter().enumerate() {
            moves.push(Move {
                from: Location::Stack(-8 * (i as i32 + 1)),
                to: Location::Reg(reg),
                bank: RegBank::GeneralPurpose,
                width: 8,
                expects: None,
            });
        }
        let phase_split = moves.len();

        // Phase 2: stack destinations first so the temps are free for registers.
        let stack_first = destinations
            .iter()
            .enumerate()
            .filter(|(_, loc)| matches!(loc, Location::Stack(_)))
            .chain(
                destinations
                    .iter()
                    .enumerate()
                    .filter(|(_, loc)| matches!(loc, Location::Reg(_))),
            );
        for (i, &to) in stack_first {
            let ty = sources[i].1;
            moves.push(Move {
                from: Location::Stack(scratch[i]),
                to,
                bank: RegBank::of(ty),
                width: width_of(ty),
                expects: Some(filled[i]),
            });
        }
        moves.push(Move {
            from: Location::Stack(return_scratch),
            to: Location::Stack(return_slot),
            bank: RegBank::GeneralPurpose,
            width: 8,
            expects: Some(return_saved),
        });
        moves.push(Move {
            from: Location::Stack(fp_scratch),
            to: Location::Reg(GP_TEMP),
            bank: RegBank::GeneralPurpose,
            width: 8,
            expects: Some(fp_saved),
        });

        log::trace!(
            "tail call: {} moves, danger line {}, scratch at {}",
            moves.len(),
            danger_line,
            scratch_base
        );

        Ok(Self {
            moves,
            danger_line,
            scratch_base,
            return_slot,
            phase_split,
            code_reg: indirect.then_some(CODE_REG),
        })
    }

    pub fn verify_no_clobber(&self) -> bool {
        verify_moves(&self.moves)
    }

    /// Emit the shuffle followed by a jump to `target`.
    pub fn emit(&self, encoder: &mut X64Encoder, target: u64) -> Result<(), EncodingError> {
        if self.code_reg.is_some() {
            return Err(EncodingError::UnsupportedInstruction);
        }
        self.emit_shuffle(encoder)?;
        encoder.jmp_absolute(target)
    }

    /// Emit the shuffle followed by a jump through the code pointer.
    pub fn emit_indirect(&self, encoder: &mut X64Encoder) -> Result<(), EncodingError> {
        let code = self.code_reg.ok_or(EncodingError::UnsupportedInstruction)?;
        self.emit_shuffle(encoder)?;
        encoder.jmp_reg(code)
    }

    fn emit_shuffle(&self, encoder: &mut X64Encoder) -> Result<(), EncodingError> {
        encoder.lea64(AsmReg::RSP, AsmReg::RBP, self.scratch_base)?;
        for mv in self.moves.iter() {
            emit_move(encoder, mv)?;
        }
        encoder.lea64(AsmReg::RSP, AsmReg::RBP, self.return_slot)?;
        encoder.mov64_reg_reg(AsmReg::RBP, GP_TEMP)
    }
}

fn emit_move(encoder: &mut X64Encoder, mv: &Move) -> Result<(), EncodingError> {
    let rbp = AsmReg::RBP;
    let wide = mv.width > 8;
    match (mv.bank, mv.from, mv.to) {
        (RegBank::GeneralPurpose, Location::Reg(src), Location::Reg(dst)) => {
            encoder.mov64_reg_reg(dst, src)
        }
        (RegBank::GeneralPurpose, Location::Reg(src), Location::Stack(off)) => {
            encoder.mov64_mem_reg(rbp, off, src)
        }
        (RegBank::GeneralPurpose, Location::Stack(off), Location::Reg(dst)) => {
            encoder.mov64_reg_mem(dst, rbp, off)
        }
        (RegBank::GeneralPurpose, Location::Stack(from), Location::Stack(to)) => {
            encoder.mov64_reg_mem(GP_TEMP, rbp, from)?;
            encoder.mov64_mem_reg(rbp, to, GP_TEMP)
        }
        (RegBank::Xmm, Location::Reg(src), Location::Reg(dst)) => encoder.movaps_reg_reg(dst, src),
        (RegBank::Xmm, Location::Reg(src), Location::Stack(off)) if wide => {
            encoder.movups_mem_reg(rbp, off, src)
        }
        (RegBank::Xmm, Location::Reg(src), Location::Stack(off)) => {
            encoder.movsd_mem_reg(rbp, off, src)
        }
        (RegBank::Xmm, Location::Stack(off), Location::Reg(dst)) if wide => {
            encoder.movups_reg_mem(dst, rbp, off)
        }
        (RegBank::Xmm, Location::Stack(off), Location::Reg(dst)) => {
            encoder.movsd_reg_mem(dst, rbp, off)
        }
        (RegBank::Xmm, Location::Stack(from), Location::Stack(to)) if wide => {
            encoder.movups_reg_mem(XMM_TEMP, rbp, from)?;
            encoder.movups_mem_reg(rbp, to, XMM_TEMP)
        }
        (RegBank::Xmm, Location::Stack(from), Location::Stack(to)) => {
            encoder.movsd_reg_mem(XMM_TEMP, rbp, from)?;
            encoder.movsd_mem_reg(rbp, to, XMM_TEMP)
        }
    }
}
