//! Inline cache call-site descriptors.

use crate::core::register_file::{AsmReg, RegBitSet, ScratchRegisterAllocator};
use serde::{Deserialize, Serialize};

/// Operation performed at a cache site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    GetById,
    TryGetById,
    GetByIdDirect,
    GetByIdWithThis,
    GetByVal,
    PutById,
    PutByVal,
    InById,
    InByVal,
}

impl AccessType {
    /// Whether the property name is a compile-time constant. Only those
    /// sites can be specialised inline.
    pub fn has_constant_identifier(self) -> bool {
        matches!(
            self,
            AccessType::GetById
                | AccessType::TryGetById
                | AccessType::GetByIdDirect
                | AccessType::GetByIdWithThis
                | AccessType::PutById
                | AccessType::InById
        )
    }
}

/// Shape a data IC was set up for when the site was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheType {
    ArrayLength,
    StringLength,
}

/// Everything the generator needs to know about one patchable site.
#[derive(Debug, Clone)]
pub struct StubSite {
    pub access: AccessType,
    pub base: AsmReg,
    pub value: AsmReg,
    pub extra: Option<AsmReg>,
    pub extra2: Option<AsmReg>,
    pub stub_info: Option<AsmReg>,
    pub array_profile: Option<AsmReg>,
    /// Registers live across the site.
    pub used_registers: RegBitSet,
    /// Address of the reserved region.
    pub start: u64,
    /// Bytes reserved at `start`.
    pub inline_size: usize,
    pub slow_path_start: u64,
    /// Data ICs dispatch through a stub record and are never patched inline.
    pub use_data_ic: bool,
    pub preconfigured: Option<CacheType>,
}

impl StubSite {
    pub fn new(access: AccessType, base: AsmReg, value: AsmReg) -> Self {
        let mut used_registers = RegBitSet::new();
        used_registers.set(base);
        used_registers.set(value);
        Self {
            access,
            base,
            value,
            extra: None,
            extra2: None,
            stub_info: None,
            array_profile: None,
            used_registers,
            start: 0,
            inline_size: 0,
            slow_path_start: 0,
            use_data_ic: false,
            preconfigured: None,
        }
    }

    /// A temporary that is not an operand of the site and not live across
    /// it, or `None` when every candidate holds a live value.
    pub fn scratch_register(&self) -> Option<AsmReg> {
        let mut allocator = ScratchRegisterAllocator::new(self.used_registers);
        allocator.lock(self.base);
        allocator.lock(self.value);
        for reg in [self.extra, self.extra2, self.stub_info, self.array_profile]
            .into_iter()
            .flatten()
        {
            allocator.lock(reg);
        }
        let scratch = allocator.allocate_scratch_gpr()?;
        if allocator.did_reuse_registers() {
            return None;
        }
        Some(scratch)
    }

    pub fn has_free_register(&self) -> bool {
        self.scratch_register().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::allocatable_gp_registers;

    #[test]
    fn test_scratch_skips_operands_and_live_registers() {
        let mut site = StubSite::new(AccessType::GetById, AsmReg::RAX, AsmReg::RCX);
        site.extra = Some(AsmReg::RDX);
        site.used_registers.set(AsmReg::RBX);
        assert_eq!(site.scratch_register(), Some(AsmReg::RSI));
    }

    #[test]
    fn test_no_scratch_when_everything_is_live() {
        let mut site = StubSite::new(AccessType::PutById, AsmReg::RAX, AsmReg::RCX);
        site.used_registers = allocatable_gp_registers();
        assert_eq!(site.scratch_register(), None);
        assert!(!site.has_free_register());
    }

    #[test]
    fn test_constant_identifier() {
        assert!(AccessType::GetById.has_constant_identifier());
        assert!(AccessType::InById.has_constant_identifier());
        assert!(!AccessType::GetByVal.has_constant_identifier());
        assert!(!AccessType::InByVal.has_constant_identifier());
    }
}
