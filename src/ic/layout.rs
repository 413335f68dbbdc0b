// This module fixes the runtime object layout that inline cache stubs address directly. Every
// heap cell starts with a 32-bit structure id, followed by the indexing type byte and the
// type-info type byte. Objects keep their first few properties inline after the header and
// spill the rest into an out-of-line butterfly whose public length sits just below the
// butterfly pointer. Strings point at an implementation record, unless they are ropes whose
// pointer has its low bit set, in which case the length lives in the rope cell. Values are
// NaN-boxed 64-bit words: int32 payloads are or'ed with the number tag held in a pinned register.

//! Object layout constants used by inline cache stubs.

use crate::core::register_file::AsmReg;
use serde::{Deserialize, Serialize};

pub const STRUCTURE_ID_OFFSET: i32 = 0;
pub const INDEXING_TYPE_OFFSET: i32 = 4;
pub const TYPE_INFO_TYPE_OFFSET: i32 = 5;
pub const BUTTERFLY_OFFSET: i32 = 8;
/// First inline property slot.
pub const INLINE_STORAGE_OFFSET: i32 = 16;

/// Length of a contiguous butterfly, relative to the butterfly pointer.
pub const BUTTERFLY_PUBLIC_LENGTH_OFFSET: i32 = -8;
/// Bytes of indexing header below the first out-of-line property.
pub const INDEXING_HEADER_SIZE: i32 = 8;

pub const STRING_VALUE_OFFSET: i32 = 8;
pub const STRING_IMPL_LENGTH_OFFSET: i32 = 4;
pub const ROPE_LENGTH_OFFSET: i32 = 12;
/// Low bit of a string's value pointer marks a rope.
pub const IS_ROPE_IN_POINTER: i32 = 1;
pub const STRING_TYPE: u8 = 2;

pub const IS_ARRAY: u8 = 0x01;
pub const INDEXING_SHAPE_MASK: u8 = 0x0e;
pub const INDEXING_TYPE_MASK: u8 = IS_ARRAY | INDEXING_SHAPE_MASK;
pub const NO_INDEXING_SHAPE: u8 = 0x00;
pub const INT32_SHAPE: u8 = 0x04;
pub const DOUBLE_SHAPE: u8 = 0x06;
pub const CONTIGUOUS_SHAPE: u8 = 0x08;
pub const ARRAY_STORAGE_SHAPE: u8 = 0x0a;
pub const SLOW_PUT_ARRAY_STORAGE_SHAPE: u8 = 0x0c;
/// An array with no indexed storage at all.
pub const ARRAY_CLASS: u8 = IS_ARRAY | NO_INDEXING_SHAPE;

pub const VALUE_FALSE: i64 = 0x06;
pub const VALUE_TRUE: i64 = 0x07;
pub const NUMBER_TAG: u64 = 0xfffe_0000_0000_0000;
/// Holds NUMBER_TAG for the whole lifetime of generated code.
pub const NUMBER_TAG_REGISTER: AsmReg = AsmReg::R14;

/// Properties below this offset live inline in the object.
pub const FIRST_OUT_OF_LINE_OFFSET: u32 = 64;

pub fn has_any_array_storage(indexing_type: u8) -> bool {
    (indexing_type & INDEXING_SHAPE_MASK) >= ARRAY_STORAGE_SHAPE
}

/// Identity of an object shape, compared by every stub's first instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructureId(pub u32);

/// Slot number of a property within its structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyOffset(pub u32);

impl PropertyOffset {
    pub fn is_inline(self) -> bool {
        self.0 < FIRST_OUT_OF_LINE_OFFSET
    }

    /// Displacement from the object (inline) or the butterfly (out of line).
    pub fn offset_relative_to_base(self) -> i32 {
        if self.is_inline() {
            INLINE_STORAGE_OFFSET + self.0 as i32 * 8
        } else {
            let slot = FIRST_OUT_OF_LINE_OFFSET as i32 - self.0 as i32 - 1;
            slot * 8 - INDEXING_HEADER_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_offsets() {
        assert_eq!(PropertyOffset(0).offset_relative_to_base(), 16);
        assert_eq!(PropertyOffset(3).offset_relative_to_base(), 40);
        // out-of-line properties grow downwards from the butterfly
        assert_eq!(PropertyOffset(64).offset_relative_to_base(), -16);
        assert_eq!(PropertyOffset(65).offset_relative_to_base(), -24);
        assert!(!PropertyOffset(64).is_inline());
    }

    #[test]
    fn test_array_storage_shapes() {
        assert!(!has_any_array_storage(IS_ARRAY | CONTIGUOUS_SHAPE));
        assert!(!has_any_array_storage(IS_ARRAY | INT32_SHAPE));
        assert!(has_any_array_storage(IS_ARRAY | ARRAY_STORAGE_SHAPE));
        assert!(has_any_array_storage(IS_ARRAY | SLOW_PUT_ARRAY_STORAGE_SHAPE));
    }
}
