// This module provides the register model shared by the inline cache generator and the
// tail-call frame shuffle. AsmReg names one machine register as a (bank, id) pair where bank 0
// holds the sixteen x86-64 general purpose registers in encoding order and bank 1 the XMM
// registers. RegBitSet tracks a set of registers with one u64 mask per bank, which is how a
// call site describes the registers that are live across it. ScratchRegisterAllocator hands
// out a temporary register that is neither locked by the caller nor in the used set: inline
// caches must never clobber a live register, so an allocator that would have to reuse one
// reports that and the generator declines to specialise instead of spilling.

//! Register identifiers, register sets and scratch allocation.

/// Maximum number of register banks supported (GP, XMM).
pub const MAX_REGISTER_BANKS: usize = 2;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// Bank holding general purpose registers.
pub const GP_BANK: RegBank = 0;

/// Bank holding XMM registers.
pub const XMM_BANK: RegBank = 1;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const RAX: AsmReg = AsmReg::gp(0);
    pub const RCX: AsmReg = AsmReg::gp(1);
    pub const RDX: AsmReg = AsmReg::gp(2);
    pub const RBX: AsmReg = AsmReg::gp(3);
    pub const RSP: AsmReg = AsmReg::gp(4);
    pub const RBP: AsmReg = AsmReg::gp(5);
    pub const RSI: AsmReg = AsmReg::gp(6);
    pub const RDI: AsmReg = AsmReg::gp(7);
    pub const R8: AsmReg = AsmReg::gp(8);
    pub const R9: AsmReg = AsmReg::gp(9);
    pub const R10: AsmReg = AsmReg::gp(10);
    pub const R11: AsmReg = AsmReg::gp(11);
    pub const R12: AsmReg = AsmReg::gp(12);
    pub const R13: AsmReg = AsmReg::gp(13);
    pub const R14: AsmReg = AsmReg::gp(14);
    pub const R15: AsmReg = AsmReg::gp(15);

    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    /// General purpose register with the given encoding.
    pub const fn gp(id: RegId) -> Self {
        Self { bank: GP_BANK, id }
    }

    /// XMM register with the given encoding.
    pub const fn xmm(id: RegId) -> Self {
        Self { bank: XMM_BANK, id }
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegBitSet {
    /// Bit mask for each register bank.
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    /// Create empty register set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a register set from a list of registers.
    pub fn from_regs(regs: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    /// Create register set with all registers in bank marked.
    pub fn all_in_bank(bank: RegBank, count: u8) -> Self {
        let mut set = Self::new();
        if (bank as usize) < MAX_REGISTER_BANKS {
            set.banks[bank as usize] = if count >= 64 { u64::MAX } else { (1u64 << count) - 1 };
        }
        set
    }

    /// Check if register is set.
    pub fn contains(&self, reg: AsmReg) -> bool {
        if reg.bank as usize >= MAX_REGISTER_BANKS || reg.id >= 64 {
            return false;
        }
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    /// Set a register.
    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] |= 1u64 << reg.id;
        }
    }

    /// Clear a register.
    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] &= !(1u64 << reg.id);
        }
    }

    /// Set union with another set.
    pub fn union(&mut self, other: &RegBitSet) {
        for i in 0..MAX_REGISTER_BANKS {
            self.banks[i] |= other.banks[i];
        }
    }

    /// Find first set register in the given bank, excluding specified registers.
    pub fn find_first_in_bank(&self, bank: RegBank, exclude: &RegBitSet) -> Option<AsmReg> {
        if bank as usize >= MAX_REGISTER_BANKS {
            return None;
        }

        let available = self.banks[bank as usize] & !exclude.banks[bank as usize];
        if available == 0 {
            return None;
        }

        Some(AsmReg::new(bank, available.trailing_zeros() as RegId))
    }

    /// Count number of set registers in bank.
    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        if bank as usize >= MAX_REGISTER_BANKS {
            return 0;
        }
        self.banks[bank as usize].count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.iter().all(|&b| b == 0)
    }
}

/// General purpose registers the generated code may use as temporaries.
///
/// RSP and RBP hold the frame. R14 and R15 stay pinned for the whole
/// function: the memory bound and base in wasm code, the boxing tags in
/// inline cache stubs.
pub fn allocatable_gp_registers() -> RegBitSet {
    let mut set = RegBitSet::all_in_bank(GP_BANK, 16);
    for reg in [AsmReg::RSP, AsmReg::RBP, AsmReg::R14, AsmReg::R15] {
        set.clear(reg);
    }
    set
}

/// Picks temporaries around code that must not disturb live registers.
///
/// Registers in `used` hold values the surrounding code still needs, registers
/// that were locked are the operands of the sequence being generated. When no
/// free register is left the allocator falls back to a used register and
/// records that, so the caller can decide whether spilling is acceptable.
#[derive(Debug, Clone)]
pub struct ScratchRegisterAllocator {
    allocatable: RegBitSet,
    used: RegBitSet,
    locked: RegBitSet,
    reused: RegBitSet,
}

impl ScratchRegisterAllocator {
    pub fn new(used: RegBitSet) -> Self {
        Self {
            allocatable: allocatable_gp_registers(),
            used,
            locked: RegBitSet::new(),
            reused: RegBitSet::new(),
        }
    }

    /// Exclude a register from allocation.
    pub fn lock(&mut self, reg: AsmReg) {
        self.locked.set(reg);
    }

    /// Allocate a general purpose temporary.
    pub fn allocate_scratch_gpr(&mut self) -> Option<AsmReg> {
        let mut taken = self.used;
        taken.union(&self.locked);

        if let Some(reg) = self.allocatable.find_first_in_bank(GP_BANK, &taken) {
            self.locked.set(reg);
            return Some(reg);
        }

        let reg = self.allocatable.find_first_in_bank(GP_BANK, &self.locked)?;
        self.locked.set(reg);
        self.reused.set(reg);
        Some(reg)
    }

    /// Whether any allocation had to take a live register.
    pub fn did_reuse_registers(&self) -> bool {
        !self.reused.is_empty()
    }

    /// Number of live registers that would have to be preserved.
    pub fn num_reused_registers(&self) -> u32 {
        self.reused.count_in_bank(GP_BANK) + self.reused.count_in_bank(XMM_BANK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regbitset_operations() {
        let mut set = RegBitSet::new();
        let reg = AsmReg::gp(5);

        assert!(!set.contains(reg));
        set.set(reg);
        assert!(set.contains(reg));
        set.clear(reg);
        assert!(!set.contains(reg));
        assert!(set.is_empty());
    }

    #[test]
    fn test_find_first_excludes() {
        let set = RegBitSet::from_regs(&[AsmReg::RAX, AsmReg::RCX, AsmReg::RDX]);
        let exclude = RegBitSet::from_regs(&[AsmReg::RAX]);
        assert_eq!(set.find_first_in_bank(GP_BANK, &exclude), Some(AsmReg::RCX));
        assert_eq!(set.count_in_bank(GP_BANK), 3);
        assert_eq!(set.count_in_bank(XMM_BANK), 0);
    }

    #[test]
    fn test_scratch_skips_used_and_locked() {
        let used = RegBitSet::from_regs(&[AsmReg::RAX, AsmReg::RCX]);
        let mut alloc = ScratchRegisterAllocator::new(used);
        alloc.lock(AsmReg::RDX);

        assert_eq!(alloc.allocate_scratch_gpr(), Some(AsmReg::RBX));
        assert_eq!(alloc.allocate_scratch_gpr(), Some(AsmReg::RSI));
        assert!(!alloc.did_reuse_registers());
    }

    #[test]
    fn test_scratch_reports_reuse_when_exhausted() {
        let used = allocatable_gp_registers();
        let mut alloc = ScratchRegisterAllocator::new(used);
        alloc.lock(AsmReg::RAX);

        let reg = alloc.allocate_scratch_gpr();
        assert_eq!(reg, Some(AsmReg::RCX));
        assert!(alloc.did_reuse_registers());
        assert_eq!(alloc.num_reused_registers(), 1);
    }

    #[test]
    fn test_frame_and_tag_registers_never_allocated() {
        let set = allocatable_gp_registers();
        assert!(!set.contains(AsmReg::RSP));
        assert!(!set.contains(AsmReg::RBP));
        assert!(!set.contains(AsmReg::R14));
        assert!(!set.contains(AsmReg::R15));
        assert_eq!(set.count_in_bank(GP_BANK), 12);
    }
}
