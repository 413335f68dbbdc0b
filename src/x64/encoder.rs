// This module wraps the iced-x86 code assembler for the two places that emit machine code
// themselves: inline cache stubs and tail-call frame shuffles. X64Encoder converts AsmReg
// register references into iced registers and exposes the small set of instructions those
// emitters need: 64/32/8-bit moves between registers and memory, scalar and vector moves for
// XMM registers, the ALU and test forms used by type checks, branches to local labels and to
// absolute addresses, and stack manipulation. One compare is special: a structure check has
// to keep a 32-bit immediate slot that can be repatched later, so it is built as an explicit
// Cmp_rm32_imm32 instruction instead of letting the assembler shrink it to an imm8 form.
// finalize assembles at the address the code will live at, so absolute branch targets
// become correct rel32 displacements, and returns per-instruction offsets and constant
// offsets for locating patchable immediates afterwards.

//! x86-64 instruction encoding using iced-x86.

use crate::core::register_file::{AsmReg, GP_BANK, XMM_BANK};
use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, Code, ConstantOffsets, Instruction, MemoryOperand, Register};
use thiserror::Error;

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("invalid register for operation")]
    InvalidRegister,
    #[error("unsupported instruction or operand combination")]
    UnsupportedInstruction,
    #[error("assembly error: {0}")]
    AssemblyError(String),
    #[error("invalid memory operand")]
    InvalidMemoryOperand,
}

/// Jump conditions for conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    Above,
    Below,
    /// Sign flag set.
    Sign,
    /// Result of a test was non-zero.
    NonZero,
}

/// Assembled bytes plus the layout data patching needs.
#[derive(Debug, Clone)]
pub struct EncodedCode {
    pub bytes: Vec<u8>,
    /// Address the code was assembled for.
    pub base: u64,
    instruction_offsets: Vec<u32>,
    constant_offsets: Vec<ConstantOffsets>,
}

impl EncodedCode {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Byte offset of the immediate of instruction `index`.
    pub fn immediate_offset(&self, index: usize) -> Option<usize> {
        let start = *self.instruction_offsets.get(index)?;
        let constants = self.constant_offsets.get(index)?;
        if start == u32::MAX || !constants.has_immediate() {
            return None;
        }
        Some(start as usize + constants.immediate_offset())
    }
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    assembler: CodeAssembler,
}

fn asm_err(e: iced_x86::IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_err)?;
        Ok(Self { assembler })
    }

    /// Instructions emitted so far. Labels do not count.
    pub fn instruction_count(&self) -> usize {
        self.assembler.instructions().len()
    }

    fn gp64(&self, reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
        if reg.bank != GP_BANK {
            return Err(EncodingError::InvalidRegister);
        }

        const GP64_REGS: [AsmRegister64; 16] = [
            rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
            r8, r9, r10, r11, r12, r13, r14, r15,
        ];

        GP64_REGS.get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    fn gp32(&self, reg: AsmReg) -> Result<AsmRegister32, EncodingError> {
        if reg.bank != GP_BANK {
            return Err(EncodingError::InvalidRegister);
        }

        const GP32_REGS: [AsmRegister32; 16] = [
            eax, ecx, edx, ebx, esp, ebp, esi, edi,
            r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
        ];

        GP32_REGS.get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    fn gp_raw(&self, reg: AsmReg) -> Result<Register, EncodingError> {
        if reg.bank != GP_BANK {
            return Err(EncodingError::InvalidRegister);
        }

        const GP_RAW: [Register; 16] = [
            Register::RAX, Register::RCX, Register::RDX, Register::RBX,
            Register::RSP, Register::RBP, Register::RSI, Register::RDI,
            Register::R8, Register::R9, Register::R10, Register::R11,
            Register::R12, Register::R13, Register::R14, Register::R15,
        ];

        GP_RAW.get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    fn xmm(&self, reg: AsmReg) -> Result<AsmRegisterXmm, EncodingError> {
        if reg.bank != XMM_BANK {
            return Err(EncodingError::InvalidRegister);
        }

        const XMM_REGS: [AsmRegisterXmm; 16] = [
            xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7,
            xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14, xmm15,
        ];

        XMM_REGS.get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    // ==== LABELS ====

    pub fn create_label(&mut self) -> CodeLabel {
        self.assembler.create_label()
    }

    /// Bind `label` to the next emitted instruction.
    pub fn place_label(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        self.assembler.set_label(label).map_err(asm_err)
    }

    // ==== GP MOVES ====

    /// Emit MOV instruction - register to register.
    pub fn mov64_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.gp64(dst)?;
        let src_reg = self.gp64(src)?;
        self.assembler.mov(dst_reg, src_reg).map_err(asm_err)
    }

    /// Emit MOV instruction - immediate to register.
    pub fn mov64_reg_imm(&mut self, dst: AsmReg, imm: i64) -> Result<(), EncodingError> {
        let dst_reg = self.gp64(dst)?;
        self.assembler.mov(dst_reg, imm).map_err(asm_err)
    }

    /// Emit MOV instruction - memory to register.
    pub fn mov64_reg_mem(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        offset: i32,
    ) -> Result<(), EncodingError> {
        let dst_reg = self.gp64(dst)?;
        let base_reg = self.gp64(base)?;
        self.assembler
            .mov(dst_reg, qword_ptr(base_reg + offset))
            .map_err(asm_err)
    }

    /// Emit MOV instruction - register to memory.
    pub fn mov64_mem_reg(
        &mut self,
        base: AsmReg,
        offset: i32,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        let base_reg = self.gp64(base)?;
        let src_reg = self.gp64(src)?;
        self.assembler
            .mov(qword_ptr(base_reg + offset), src_reg)
            .map_err(asm_err)
    }

    /// 32-bit load; the upper half of `dst` is cleared.
    pub fn mov32_reg_mem(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        offset: i32,
    ) -> Result<(), EncodingError> {
        let dst_reg = self.gp32(dst)?;
        let base_reg = self.gp64(base)?;
        self.assembler
            .mov(dst_reg, dword_ptr(base_reg + offset))
            .map_err(asm_err)
    }

    pub fn movzx8_reg_mem(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        offset: i32,
    ) -> Result<(), EncodingError> {
        let dst_reg = self.gp32(dst)?;
        let base_reg = self.gp64(base)?;
        self.assembler
            .movzx(dst_reg, byte_ptr(base_reg + offset))
            .map_err(asm_err)
    }

    pub fn lea64(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let dst_reg = self.gp64(dst)?;
        let base_reg = self.gp64(base)?;
        self.assembler
            .lea(dst_reg, qword_ptr(base_reg + offset))
            .map_err(asm_err)
    }

    // ==== XMM MOVES ====

    pub fn movsd_reg_mem(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        offset: i32,
    ) -> Result<(), EncodingError> {
        let dst_reg = self.xmm(dst)?;
        let base_reg = self.gp64(base)?;
        self.assembler
            .movsd_2(dst_reg, qword_ptr(base_reg + offset))
            .map_err(asm_err)
    }

    pub fn movsd_mem_reg(
        &mut self,
        base: AsmReg,
        offset: i32,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        let base_reg = self.gp64(base)?;
        let src_reg = self.xmm(src)?;
        self.assembler
            .movsd_2(qword_ptr(base_reg + offset), src_reg)
            .map_err(asm_err)
    }

    pub fn movups_reg_mem(
        &mut self,
        dst: AsmReg,
        base: AsmReg,
        offset: i32,
    ) -> Result<(), EncodingError> {
        let dst_reg = self.xmm(dst)?;
        let base_reg = self.gp64(base)?;
        self.assembler
            .movups(dst_reg, xmmword_ptr(base_reg + offset))
            .map_err(asm_err)
    }

    pub fn movups_mem_reg(
        &mut self,
        base: AsmReg,
        offset: i32,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        let base_reg = self.gp64(base)?;
        let src_reg = self.xmm(src)?;
        self.assembler
            .movups(xmmword_ptr(base_reg + offset), src_reg)
            .map_err(asm_err)
    }

    /// Full-width copy between XMM registers.
    pub fn movaps_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.xmm(dst)?;
        let src_reg = self.xmm(src)?;
        self.assembler.movaps(dst_reg, src_reg).map_err(asm_err)
    }

    // ==== ALU ====

    pub fn and32_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst_reg = self.gp32(dst)?;
        self.assembler.and(dst_reg, imm).map_err(asm_err)
    }

    pub fn or64_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.gp64(dst)?;
        let src_reg = self.gp64(src)?;
        self.assembler.or(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn cmp32_reg_imm(&mut self, reg: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let reg32 = self.gp32(reg)?;
        self.assembler.cmp(reg32, imm).map_err(asm_err)
    }

    pub fn test64_reg_imm(&mut self, reg: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let reg64 = self.gp64(reg)?;
        self.assembler.test(reg64, imm).map_err(asm_err)
    }

    /// `cmp dword [base + offset], imm32` that always keeps a 4-byte
    /// immediate. Returns the instruction index for
    /// [`EncodedCode::immediate_offset`].
    pub fn cmp32_mem_imm32_patchable(
        &mut self,
        base: AsmReg,
        offset: i32,
        imm: i32,
    ) -> Result<usize, EncodingError> {
        let base_reg = self.gp_raw(base)?;
        let displ_size = if offset == 0 { 0 } else if i8::try_from(offset).is_ok() { 1 } else { 4 };
        let mem = MemoryOperand::new(
            base_reg,
            Register::None,
            1,
            offset as i64,
            displ_size,
            false,
            Register::None,
        );
        let instr = Instruction::with2(Code::Cmp_rm32_imm32, mem, imm).map_err(asm_err)?;
        self.assembler.add_instruction(instr).map_err(asm_err)?;
        Ok(self.instruction_count() - 1)
    }

    // ==== CONTROL FLOW ====

    /// Conditional branch to an absolute address outside this code.
    pub fn jcc_absolute(&mut self, cond: JumpCondition, target: u64) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        match cond {
            JumpCondition::Equal => a.je(target),
            JumpCondition::NotEqual | JumpCondition::NonZero => a.jne(target),
            JumpCondition::Less => a.jl(target),
            JumpCondition::Greater => a.jg(target),
            JumpCondition::LessEqual => a.jle(target),
            JumpCondition::GreaterEqual => a.jge(target),
            JumpCondition::Above => a.ja(target),
            JumpCondition::Below => a.jb(target),
            JumpCondition::Sign => a.js(target),
        }
        .map_err(asm_err)
    }

    /// Conditional branch to a local label.
    pub fn jcc_label(&mut self, cond: JumpCondition, label: CodeLabel) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        match cond {
            JumpCondition::Equal => a.je(label),
            JumpCondition::NotEqual | JumpCondition::NonZero => a.jne(label),
            JumpCondition::Less => a.jl(label),
            JumpCondition::Greater => a.jg(label),
            JumpCondition::LessEqual => a.jle(label),
            JumpCondition::GreaterEqual => a.jge(label),
            JumpCondition::Above => a.ja(label),
            JumpCondition::Below => a.jb(label),
            JumpCondition::Sign => a.js(label),
        }
        .map_err(asm_err)
    }

    pub fn jmp_label(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.jmp(label).map_err(asm_err)
    }

    pub fn jmp_absolute(&mut self, target: u64) -> Result<(), EncodingError> {
        self.assembler.jmp(target).map_err(asm_err)
    }

    pub fn jmp_reg(&mut self, target: AsmReg) -> Result<(), EncodingError> {
        let target_reg = self.gp64(target)?;
        self.assembler.jmp(target_reg).map_err(asm_err)
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret().map_err(asm_err)
    }

    pub fn nop(&mut self) -> Result<(), EncodingError> {
        self.assembler.nop().map_err(asm_err)
    }

    /// Assemble everything emitted so far for execution at `base`.
    pub fn finalize(&mut self, base: u64) -> Result<EncodedCode, EncodingError> {
        let options = BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS
            | BlockEncoderOptions::RETURN_CONSTANT_OFFSETS;
        let result = self.assembler.assemble_options(base, options).map_err(asm_err)?;
        let inner = result.inner;
        Ok(EncodedCode {
            bytes: inner.code_buffer,
            base,
            instruction_offsets: inner.new_instruction_offsets,
            constant_offsets: inner.constant_offsets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{JumpCondition, X64Encoder};
    use crate::core::register_file::AsmReg;

    #[test]
    fn test_basic_instructions() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.mov64_reg_reg(AsmReg::RAX, AsmReg::RCX).unwrap();
        encoder.ret().unwrap();

        let code = encoder.finalize(0x1000).unwrap();
        assert_eq!(code.bytes, vec![0x48, 0x89, 0xC8, 0xC3]);
    }

    #[test]
    fn test_patchable_compare_keeps_imm32() {
        let mut encoder = X64Encoder::new().unwrap();
        let index = encoder
            .cmp32_mem_imm32_patchable(AsmReg::RDI, 0, 1)
            .unwrap();
        encoder.jcc_absolute(JumpCondition::NotEqual, 0x9000).unwrap();

        let code = encoder.finalize(0x1000).unwrap();
        let imm = code.immediate_offset(index).unwrap();
        assert_eq!(&code.bytes[imm..imm + 4], &1i32.to_le_bytes());
        // opcode 81 selects the imm32 group-1 form
        assert_eq!(code.bytes[0], 0x81);
    }

    #[test]
    fn test_labels_and_xmm() {
        let mut encoder = X64Encoder::new().unwrap();
        let mut done = encoder.create_label();
        encoder.test64_reg_imm(AsmReg::RAX, 1).unwrap();
        encoder.jcc_label(JumpCondition::NonZero, done).unwrap();
        encoder.movsd_reg_mem(AsmReg::xmm(15), AsmReg::RBP, 16).unwrap();
        encoder.movups_mem_reg(AsmReg::RBP, -32, AsmReg::xmm(0)).unwrap();
        encoder.place_label(&mut done).unwrap();
        encoder.nop().unwrap();

        let code = encoder.finalize(0).unwrap();
        assert_eq!(code.bytes.last(), Some(&0x90));
        assert!(encoder_rejects_bank_mismatch());
    }

    fn encoder_rejects_bank_mismatch() -> bool {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.movsd_reg_mem(AsmReg::RAX, AsmReg::RBP, 0).is_err()
    }
}
