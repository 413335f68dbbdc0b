// This module generates monomorphic inline cache stubs into a site's reserved region. Each
// variant starts with one identity check whose failure branches to the site's slow path:
// property access, replace and "in" compare the 32-bit structure id with a compare that keeps
// its imm32 slot so the id can be repatched in place, array length compares the masked
// indexing type and string length compares the type-info byte. On a match the stub follows
// at most one pointer (the butterfly, or a string's implementation record) before the final
// load or store. Variants that need a temporary ask the site for a scratch register first
// and decline when it would have to take a live one. Code is assembled for the region's
// address; if it does not fit the budget the attempt is dropped, otherwise it is padded with
// NOPs to the exact reserved size so linking overwrites the whole region.

//! Inline cache stub generation.

use super::layout::*;
use super::site::{CacheType, StubSite};
use crate::core::register_file::AsmReg;
use crate::x64::encoder::{EncodingError, JumpCondition, X64Encoder};
use log::{debug, trace};

const NOP: u8 = 0x90;

/// A generated stub, ready to be linked at `site.start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineStub {
    pub name: &'static str,
    /// Exactly `inline_size` bytes, NOP padded.
    pub code: Vec<u8>,
    /// Bytes before padding.
    pub emitted_size: usize,
    /// Offset of the repatchable structure id, for structure-checked stubs.
    pub structure_immediate: Option<usize>,
}

impl InlineStub {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// Assemble `encoder` at the site and keep it only if it fits.
fn link_code_inline(
    name: &'static str,
    site: &StubSite,
    mut encoder: X64Encoder,
    structure_check: Option<usize>,
) -> Result<Option<InlineStub>, EncodingError> {
    let encoded = encoder.finalize(site.start)?;
    if encoded.len() > site.inline_size {
        debug!(
            "inline cache {} declined: {} bytes, {} reserved",
            name,
            encoded.len(),
            site.inline_size
        );
        return Ok(None);
    }
    let structure_immediate = match structure_check {
        Some(index) => Some(
            encoded
                .immediate_offset(index)
                .ok_or(EncodingError::UnsupportedInstruction)?,
        ),
        None => None,
    };
    let emitted_size = encoded.len();
    let mut code = encoded.bytes;
    code.resize(site.inline_size, NOP);
    trace!("inline cache {}: {} of {} bytes", name, emitted_size, site.inline_size);
    Ok(Some(InlineStub {
        name,
        code,
        emitted_size,
        structure_immediate,
    }))
}

fn finish(name: &'static str, result: Result<Option<InlineStub>, EncodingError>) -> Option<InlineStub> {
    match result {
        Ok(stub) => stub,
        Err(err) => {
            debug!("inline cache {} declined: {}", name, err);
            None
        }
    }
}

fn structure_check(
    encoder: &mut X64Encoder,
    site: &StubSite,
    structure: StructureId,
) -> Result<usize, EncodingError> {
    let index =
        encoder.cmp32_mem_imm32_patchable(site.base, STRUCTURE_ID_OFFSET, structure.0 as i32)?;
    encoder.jcc_absolute(JumpCondition::NotEqual, site.slow_path_start)?;
    Ok(index)
}

fn box_int32(encoder: &mut X64Encoder, value: AsmReg) -> Result<(), EncodingError> {
    encoder.or64_reg_reg(value, NUMBER_TAG_REGISTER)
}

/// Load of a property of a known structure.
pub fn generate_self_property_access(
    site: &StubSite,
    structure: StructureId,
    offset: PropertyOffset,
) -> Option<InlineStub> {
    if !site.access.has_constant_identifier() || site.use_data_ic {
        return None;
    }
    let name = "property access";
    finish(name, (|| {
        let mut encoder = X64Encoder::new()?;
        let check = structure_check(&mut encoder, site, structure)?;
        let storage = if offset.is_inline() {
            site.base
        } else {
            encoder.mov64_reg_mem(site.value, site.base, BUTTERFLY_OFFSET)?;
            site.value
        };
        encoder.mov64_reg_mem(site.value, storage, offset.offset_relative_to_base())?;
        link_code_inline(name, site, encoder, Some(check))
    })())
}

pub fn can_generate_self_property_replace(site: &StubSite, offset: PropertyOffset) -> bool {
    if !site.access.has_constant_identifier() || site.use_data_ic {
        return false;
    }
    offset.is_inline() || site.has_free_register()
}

/// Store into an existing property of a known structure. Out-of-line
/// storage needs a scratch register for the butterfly.
pub fn generate_self_property_replace(
    site: &StubSite,
    structure: StructureId,
    offset: PropertyOffset,
) -> Option<InlineStub> {
    if !can_generate_self_property_replace(site, offset) {
        return None;
    }
    let name = "property replace";
    finish(name, (|| {
        let mut encoder = X64Encoder::new()?;
        let check = structure_check(&mut encoder, site, structure)?;
        let storage = if offset.is_inline() {
            site.base
        } else {
            let Some(scratch) = site.scratch_register() else {
                return Ok(None);
            };
            encoder.mov64_reg_mem(scratch, site.base, BUTTERFLY_OFFSET)?;
            scratch
        };
        encoder.mov64_mem_reg(storage, offset.offset_relative_to_base(), site.value)?;
        link_code_inline(name, site, encoder, Some(check))
    })())
}

/// Whether the `length` of an array with `indexing_type` can be read inline.
pub fn is_cacheable_array_length(site: &StubSite, indexing_type: u8) -> bool {
    debug_assert!(indexing_type & IS_ARRAY != 0);
    if !site.access.has_constant_identifier() {
        return false;
    }
    if site.use_data_ic {
        return site.preconfigured == Some(CacheType::ArrayLength);
    }
    if !site.has_free_register() {
        return false;
    }
    !has_any_array_storage(indexing_type) && indexing_type != ARRAY_CLASS
}

pub fn generate_array_length(site: &StubSite, indexing_type: u8) -> Option<InlineStub> {
    if !is_cacheable_array_length(site, indexing_type) || site.use_data_ic {
        return None;
    }
    let scratch = site.scratch_register()?;
    let name = "array length";
    finish(name, (|| {
        let mut encoder = X64Encoder::new()?;
        encoder.movzx8_reg_mem(scratch, site.base, INDEXING_TYPE_OFFSET)?;
        encoder.and32_reg_imm(scratch, INDEXING_TYPE_MASK as i32)?;
        encoder.cmp32_reg_imm(scratch, indexing_type as i32)?;
        encoder.jcc_absolute(JumpCondition::NotEqual, site.slow_path_start)?;
        encoder.mov64_reg_mem(site.value, site.base, BUTTERFLY_OFFSET)?;
        encoder.mov32_reg_mem(site.value, site.value, BUTTERFLY_PUBLIC_LENGTH_OFFSET)?;
        box_int32(&mut encoder, site.value)?;
        link_code_inline(name, site, encoder, None)
    })())
}

pub fn is_cacheable_string_length(site: &StubSite) -> bool {
    if !site.access.has_constant_identifier() {
        return false;
    }
    if site.use_data_ic {
        return site.preconfigured == Some(CacheType::StringLength);
    }
    site.has_free_register()
}

/// `length` of any string, reading ropes from the rope cell.
pub fn generate_string_length(site: &StubSite) -> Option<InlineStub> {
    if !is_cacheable_string_length(site) || site.use_data_ic {
        return None;
    }
    let scratch = site.scratch_register()?;
    let name = "string length";
    finish(name, (|| {
        let mut encoder = X64Encoder::new()?;
        let mut is_rope = encoder.create_label();
        let mut done = encoder.create_label();

        encoder.movzx8_reg_mem(scratch, site.base, TYPE_INFO_TYPE_OFFSET)?;
        encoder.cmp32_reg_imm(scratch, STRING_TYPE as i32)?;
        encoder.jcc_absolute(JumpCondition::NotEqual, site.slow_path_start)?;

        encoder.mov64_reg_mem(scratch, site.base, STRING_VALUE_OFFSET)?;
        encoder.test64_reg_imm(scratch, IS_ROPE_IN_POINTER)?;
        encoder.jcc_label(JumpCondition::NonZero, is_rope)?;
        encoder.mov32_reg_mem(site.value, scratch, STRING_IMPL_LENGTH_OFFSET)?;
        encoder.jmp_label(done)?;

        encoder.place_label(&mut is_rope)?;
        encoder.mov32_reg_mem(site.value, site.base, ROPE_LENGTH_OFFSET)?;

        encoder.place_label(&mut done)?;
        box_int32(&mut encoder, site.value)?;
        link_code_inline(name, site, encoder, None)
    })())
}

/// `name in object` for a structure known to have the property.
pub fn generate_self_in_access(site: &StubSite, structure: StructureId) -> Option<InlineStub> {
    if !site.access.has_constant_identifier() || site.use_data_ic {
        return None;
    }
    let name = "in access";
    finish(name, (|| {
        let mut encoder = X64Encoder::new()?;
        let check = structure_check(&mut encoder, site, structure)?;
        encoder.mov64_reg_imm(site.value, VALUE_TRUE)?;
        link_code_inline(name, site, encoder, Some(check))
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::allocatable_gp_registers;
    use crate::ic::site::AccessType;
    use iced_x86::{Code, Decoder, DecoderOptions};

    fn site(access: AccessType, inline_size: usize) -> StubSite {
        let mut site = StubSite::new(access, AsmReg::RAX, AsmReg::RDX);
        site.start = 0x10_0000;
        site.slow_path_start = 0x10_4000;
        site.inline_size = inline_size;
        site
    }

    fn first_code(stub: &InlineStub, start: u64) -> Code {
        let mut decoder = Decoder::with_ip(64, &stub.code, start, DecoderOptions::NONE);
        decoder.decode().code()
    }

    #[test]
    fn test_self_access_starts_with_patchable_check() {
        let site = site(AccessType::GetById, 32);
        let stub = generate_self_property_access(&site, StructureId(0x1234), PropertyOffset(2))
            .unwrap();
        assert_eq!(stub.len(), 32);
        assert!(stub.emitted_size <= 32);
        assert_eq!(first_code(&stub, site.start), Code::Cmp_rm32_imm32);
        let imm = stub.structure_immediate.unwrap();
        assert_eq!(&stub.code[imm..imm + 4], &0x1234u32.to_le_bytes());
        assert!(stub.code[stub.emitted_size..].iter().all(|&b| b == NOP));
    }

    #[test]
    fn test_budget_is_never_exceeded() {
        let out_of_line = PropertyOffset(FIRST_OUT_OF_LINE_OFFSET + 3);
        let mut fitted = 0;
        for budget in 0..64 {
            let get = site(AccessType::GetById, budget);
            let put = site(AccessType::PutById, budget);
            for stub in [
                generate_self_property_access(&get, StructureId(7), PropertyOffset(1)),
                generate_self_property_access(&get, StructureId(7), out_of_line),
                generate_self_in_access(&get, StructureId(7)),
                generate_string_length(&get),
                generate_array_length(&get, IS_ARRAY | CONTIGUOUS_SHAPE),
                generate_array_length(&get, IS_ARRAY | DOUBLE_SHAPE),
                generate_self_property_replace(&put, StructureId(7), PropertyOffset(1)),
                generate_self_property_replace(&put, StructureId(7), out_of_line),
            ]
            .into_iter()
            .flatten()
            {
                assert!(stub.emitted_size <= budget, "{} overflows {}", stub.name, budget);
                assert_eq!(stub.len(), budget);
                fitted += 1;
            }
        }
        assert!(fitted > 0);
        assert!(generate_self_in_access(&site(AccessType::InById, 4), StructureId(1)).is_none());
    }

    #[test]
    fn test_out_of_line_replace_needs_scratch() {
        let offset = PropertyOffset(FIRST_OUT_OF_LINE_OFFSET);
        let mut site = site(AccessType::PutById, 48);
        assert!(can_generate_self_property_replace(&site, offset));
        assert!(generate_self_property_replace(&site, StructureId(3), offset).is_some());

        site.used_registers = allocatable_gp_registers();
        assert!(!can_generate_self_property_replace(&site, offset));
        assert!(generate_self_property_replace(&site, StructureId(3), offset).is_none());
        // inline storage is written through the base register
        assert!(generate_self_property_replace(&site, StructureId(3), PropertyOffset(0)).is_some());
    }

    #[test]
    fn test_data_ic_and_non_constant_sites_decline() {
        let mut data = site(AccessType::GetById, 64);
        data.use_data_ic = true;
        assert!(generate_self_property_access(&data, StructureId(1), PropertyOffset(0)).is_none());
        assert!(!is_cacheable_string_length(&data));
        data.preconfigured = Some(CacheType::StringLength);
        assert!(is_cacheable_string_length(&data));
        assert!(generate_string_length(&data).is_none());

        let by_val = site(AccessType::GetByVal, 64);
        assert!(generate_self_property_access(&by_val, StructureId(1), PropertyOffset(0)).is_none());
    }

    #[test]
    fn test_array_length_shapes() {
        let site = site(AccessType::GetById, 48);
        assert!(is_cacheable_array_length(&site, IS_ARRAY | CONTIGUOUS_SHAPE));
        assert!(!is_cacheable_array_length(&site, IS_ARRAY | ARRAY_STORAGE_SHAPE));
        assert!(!is_cacheable_array_length(&site, ARRAY_CLASS));

        let stub = generate_array_length(&site, IS_ARRAY | INT32_SHAPE).unwrap();
        assert_eq!(stub.structure_immediate, None);
        assert_eq!(first_code(&stub, site.start), Code::Movzx_r32_rm8);
    }
}
