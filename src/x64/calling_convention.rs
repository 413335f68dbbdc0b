// This module implements the calling convention compiled wasm functions use with each other.
// WasmAssigner follows the shape of the System V AMD64 assigner: the callee instance travels
// as a hidden first argument in RDI, integer and reference arguments then take RSI, RDX, RCX,
// R8 and R9, float and vector arguments take XMM0-XMM7, and the remainder goes to 8-byte
// stack slots (16 for vectors) above the return address. Results use RAX, RCX, RDX for
// integers and XMM0-XMM3 for floats; further results of a multi-value signature are written
// to a stack area the caller reserves. R14 and R15 are pinned for the memory base and bound
// and never carry arguments. CallInformation bundles the assignments for one signature and
// is what the builder consults for stack argument sizes and what the tail-call planner uses
// for destination locations. FunctionFrame keeps the per-function layout of saved registers
// and spill slots, which the tail-call shuffle needs to restore callee-saved state.

//! Wasm-to-wasm calling convention for x86-64.

use crate::core::register_file::{AsmReg, RegBitSet};
use crate::ir::Type;
use bumpalo::{collections::Vec as BumpVec, Bump};

/// Register banks for different register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegBank {
    GeneralPurpose = 0,
    Xmm = 1,
}

impl RegBank {
    pub fn of(ty: Type) -> Self {
        if ty.is_float() || ty.is_vector() {
            RegBank::Xmm
        } else {
            RegBank::GeneralPurpose
        }
    }
}

/// Argument or result assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CCAssignment {
    pub bank: RegBank,
    /// Size of the value in bytes.
    pub size: u32,
    /// Assigned register (if any).
    pub reg: Option<AsmReg>,
    /// Offset within the stack argument or result area.
    pub stack_off: Option<i32>,
}

impl CCAssignment {
    pub fn new(bank: RegBank, size: u32) -> Self {
        Self {
            bank,
            size,
            reg: None,
            stack_off: None,
        }
    }

    pub fn for_type(ty: Type) -> Self {
        Self::new(RegBank::of(ty), ty.size_bytes().max(4))
    }
}

/// Information about a calling convention.
#[derive(Debug, Clone)]
pub struct CCInfo {
    /// Registers that must be preserved by callee.
    pub callee_saved_regs: RegBitSet,
    /// Registers used for argument passing.
    pub arg_regs: RegBitSet,
    /// Registers reserved for the whole function.
    pub pinned_regs: RegBitSet,
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    fn get_ccinfo(&self) -> &CCInfo;

    fn assign_arg(&mut self, arg: &mut CCAssignment);

    fn assign_ret(&mut self, ret: &mut CCAssignment);

    fn reset(&mut self);

    /// Total stack space the assigned arguments need.
    fn get_stack_size(&self) -> u32;
}

/// Wasm calling convention assigner.
pub struct WasmAssigner {
    cc_info: CCInfo,
    gp_cnt: usize,
    xmm_cnt: usize,
    stack: u32,
    ret_gp_cnt: usize,
    ret_xmm_cnt: usize,
    ret_stack: u32,
}

impl Default for WasmAssigner {
    fn default() -> Self {
        let callee_saved = RegBitSet::from_regs(&[
            AsmReg::RBX,
            AsmReg::R12,
            AsmReg::R13,
            AsmReg::R14,
            AsmReg::R15,
        ]);

        let mut arg_regs = RegBitSet::new();
        arg_regs.set(Self::INSTANCE_REG);
        for &reg in Self::GP_ARG_REGS.iter().chain(Self::XMM_ARG_REGS.iter()) {
            arg_regs.set(reg);
        }

        let cc_info = CCInfo {
            callee_saved_regs: callee_saved,
            arg_regs,
            pinned_regs: RegBitSet::from_regs(&[Self::MEMORY_BASE_REG, Self::MEMORY_BOUND_REG]),
        };

        Self {
            cc_info,
            gp_cnt: 0,
            xmm_cnt: 0,
            stack: 0,
            ret_gp_cnt: 0,
            ret_xmm_cnt: 0,
            ret_stack: 0,
        }
    }
}

impl WasmAssigner {
    /// Callee instance, passed ahead of the wasm arguments.
    pub const INSTANCE_REG: AsmReg = AsmReg::RDI;
    pub const MEMORY_BASE_REG: AsmReg = AsmReg::R15;
    pub const MEMORY_BOUND_REG: AsmReg = AsmReg::R14;

    pub const GP_ARG_REGS: [AsmReg; 5] = [
        AsmReg::RSI,
        AsmReg::RDX,
        AsmReg::RCX,
        AsmReg::R8,
        AsmReg::R9,
    ];

    pub const XMM_ARG_REGS: [AsmReg; 8] = [
        AsmReg::xmm(0),
        AsmReg::xmm(1),
        AsmReg::xmm(2),
        AsmReg::xmm(3),
        AsmReg::xmm(4),
        AsmReg::xmm(5),
        AsmReg::xmm(6),
        AsmReg::xmm(7),
    ];

    const RET_GP_REGS: [AsmReg; 3] = [AsmReg::RAX, AsmReg::RCX, AsmReg::RDX];

    const RET_XMM_REGS: [AsmReg; 4] = [
        AsmReg::xmm(0),
        AsmReg::xmm(1),
        AsmReg::xmm(2),
        AsmReg::xmm(3),
    ];

    pub fn new() -> Self {
        Self::default()
    }

    /// Stack space taken by results that did not fit in registers.
    pub fn get_ret_stack_size(&self) -> u32 {
        Self::align_up(self.ret_stack, 16)
    }

    fn align_up(value: u32, align: u32) -> u32 {
        (value + align - 1) & !(align - 1)
    }

    fn stack_slot(counter: &mut u32, size: u32) -> i32 {
        let slot = if size > 8 { 16 } else { 8 };
        *counter = Self::align_up(*counter, slot);
        let offset = *counter as i32;
        *counter += slot;
        offset
    }
}

impl CCAssigner for WasmAssigner {
    fn get_ccinfo(&self) -> &CCInfo {
        &self.cc_info
    }

    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        match arg.bank {
            RegBank::GeneralPurpose if self.gp_cnt < Self::GP_ARG_REGS.len() => {
                arg.reg = Some(Self::GP_ARG_REGS[self.gp_cnt]);
                self.gp_cnt += 1;
            }
            RegBank::Xmm if self.xmm_cnt < Self::XMM_ARG_REGS.len() => {
                arg.reg = Some(Self::XMM_ARG_REGS[self.xmm_cnt]);
                self.xmm_cnt += 1;
            }
            _ => arg.stack_off = Some(Self::stack_slot(&mut self.stack, arg.size)),
        }
    }

    fn assign_ret(&mut self, ret: &mut CCAssignment) {
        match ret.bank {
            RegBank::GeneralPurpose if self.ret_gp_cnt < Self::RET_GP_REGS.len() => {
                ret.reg = Some(Self::RET_GP_REGS[self.ret_gp_cnt]);
                self.ret_gp_cnt += 1;
            }
            RegBank::Xmm if self.ret_xmm_cnt < Self::RET_XMM_REGS.len() => {
                ret.reg = Some(Self::RET_XMM_REGS[self.ret_xmm_cnt]);
                self.ret_xmm_cnt += 1;
            }
            _ => ret.stack_off = Some(Self::stack_slot(&mut self.ret_stack, ret.size)),
        }
    }

    fn reset(&mut self) {
        self.gp_cnt = 0;
        self.xmm_cnt = 0;
        self.stack = 0;
        self.ret_gp_cnt = 0;
        self.ret_xmm_cnt = 0;
        self.ret_stack = 0;
    }

    fn get_stack_size(&self) -> u32 {
        Self::align_up(self.stack, 16)
    }
}

/// Where every argument and result of one signature lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInformation {
    pub params: Vec<CCAssignment>,
    pub results: Vec<CCAssignment>,
    /// Bytes of stack arguments, 16-byte aligned.
    pub stack_args_size: u32,
    /// Bytes of stack results, 16-byte aligned.
    pub stack_results_size: u32,
}

impl CallInformation {
    pub fn new(params: &[Type], results: &[Type]) -> Self {
        let mut assigner = WasmAssigner::new();
        let params = params
            .iter()
            .map(|&ty| {
                let mut arg = CCAssignment::for_type(ty);
                assigner.assign_arg(&mut arg);
                arg
            })
            .collect();
        let results = results
            .iter()
            .map(|&ty| {
                let mut ret = CCAssignment::for_type(ty);
                assigner.assign_ret(&mut ret);
                ret
            })
            .collect();
        Self {
            params,
            results,
            stack_args_size: assigner.get_stack_size(),
            stack_results_size: assigner.get_ret_stack_size(),
        }
    }

    /// Bytes the caller reserves above the return address.
    pub fn header_and_args_size(&self) -> u32 {
        self.stack_args_size.max(self.stack_results_size)
    }
}

/// Stack frame layout of one compiled function.
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// Callee-saved registers, stored below the saved frame pointer.
    pub saved_registers: BumpVec<'a, AsmReg>,
    /// Total size of the stack frame.
    pub frame_size: u32,
    pub spill_slots: BumpVec<'a, i32>,
    pub spill_offset: i32,
    /// Bytes of stack arguments this function was called with.
    pub incoming_stack_args: u32,
}

impl<'a> FunctionFrame<'a> {
    pub fn new(arena: &'a Bump, incoming_stack_args: u32) -> Self {
        Self {
            saved_registers: BumpVec::new_in(arena),
            frame_size: 0,
            spill_slots: BumpVec::new_in(arena),
            spill_offset: 0,
            incoming_stack_args,
        }
    }

    pub fn add_saved_register(&mut self, reg: AsmReg) {
        if !self.saved_registers.contains(&reg) {
            self.saved_registers.push(reg);
            self.spill_offset -= 8;
        }
    }

    /// rbp-relative slot of a saved register.
    pub fn saved_register_slot(&self, reg: AsmReg) -> Option<i32> {
        self.saved_registers
            .iter()
            .position(|&r| r == reg)
            .map(|i| -8 * (i as i32 + 1))
    }

    /// Allocate a new spill slot and return its rbp-relative offset.
    pub fn allocate_spill_slot(&mut self, size: u32) -> i32 {
        let aligned_size = size.div_ceil(8) * 8;
        self.spill_offset -= aligned_size as i32;
        let offset = self.spill_offset;
        self.spill_slots.push(offset);
        offset
    }

    pub fn calculate_frame_size(&mut self) {
        // rbp + 16: incoming stack arguments
        // rbp + 8:  return address
        // rbp:      saved rbp
        // rbp - 8:  saved registers, then spill slots
        self.frame_size = ((-self.spill_offset) as u32).div_ceil(16) * 16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    #[test]
    fn test_gp_arguments_spill_to_stack() {
        let params = [Type::Int32; 7];
        let info = CallInformation::new(&params, &[Type::Int64]);

        for (i, param) in info.params.iter().take(5).enumerate() {
            assert_eq!(param.reg, Some(WasmAssigner::GP_ARG_REGS[i]));
        }
        assert_eq!(info.params[5].stack_off, Some(0));
        assert_eq!(info.params[6].stack_off, Some(8));
        assert_eq!(info.stack_args_size, 16);
        assert_eq!(info.results[0].reg, Some(AsmReg::RAX));
    }

    #[test]
    fn test_vectors_take_16_byte_slots() {
        let mut params = vec![Type::Double; 8];
        params.push(Type::Float);
        params.push(Type::V128);
        let info = CallInformation::new(&params, &[]);

        assert_eq!(info.params[7].reg, Some(AsmReg::xmm(7)));
        assert_eq!(info.params[8].stack_off, Some(0));
        assert_eq!(info.params[9].stack_off, Some(16));
        assert_eq!(info.stack_args_size, 32);
    }

    #[test]
    fn test_multi_value_results_use_stack() {
        let results = [Type::Int32, Type::Int64, Type::Int32, Type::Int64];
        let info = CallInformation::new(&[], &results);

        assert_eq!(info.results[2].reg, Some(AsmReg::RDX));
        assert_eq!(info.results[3].stack_off, Some(0));
        assert_eq!(info.stack_results_size, 16);
        assert_eq!(info.header_and_args_size(), 16);
    }

    #[test]
    fn test_function_frame_saved_registers() {
        let arena = Bump::new();
        let mut frame = FunctionFrame::new(&arena, 0);

        frame.add_saved_register(AsmReg::RBX);
        frame.add_saved_register(AsmReg::R12);
        frame.add_saved_register(AsmReg::RBX);
        let spill = frame.allocate_spill_slot(4);
        frame.calculate_frame_size();

        assert_eq!(frame.saved_registers.len(), 2);
        assert_eq!(frame.saved_register_slot(AsmReg::R12), Some(-16));
        assert_eq!(spill, -24);
        assert_eq!(frame.frame_size, 32);
    }
}
