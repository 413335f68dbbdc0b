//! Value types and entity identifiers of the block graph.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub fn from_index(index: usize) -> Self {
                Self(index as u32)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

entity_id!(
    /// Identifies a value in its procedure.
    ValueId, "v"
);
entity_id!(
    /// Identifies a basic block in its procedure.
    BlockId, "bb"
);
entity_id!(
    /// Identifies a mutable variable.
    VariableId, "var"
);
entity_id!(TupleId, "tuple");
entity_id!(CallId, "call");
entity_id!(PatchpointId, "pp");
entity_id!(SwitchId, "switch");

/// Type of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    Int32,
    Int64,
    Float,
    Double,
    V128,
    /// Several results, read with `Extract`.
    Tuple(TupleId),
}

impl Type {
    /// Pointers are 64 bits wide on every supported target.
    pub const POINTER: Type = Type::Int64;

    pub fn is_int(self) -> bool {
        matches!(self, Type::Int32 | Type::Int64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Type::Float | Type::Double)
    }

    pub fn is_vector(self) -> bool {
        self == Type::V128
    }

    /// Bytes a value of this type occupies in a stack slot.
    pub fn size_bytes(self) -> u32 {
        match self {
            Type::Void | Type::Tuple(_) => 0,
            Type::Int32 | Type::Float => 4,
            Type::Int64 | Type::Double => 8,
            Type::V128 => 16,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int32 => write!(f, "i32"),
            Type::Int64 => write!(f, "i64"),
            Type::Float => write!(f, "f32"),
            Type::Double => write!(f, "f64"),
            Type::V128 => write!(f, "v128"),
            Type::Tuple(id) => write!(f, "{}", id),
        }
    }
}

/// Bytecode position a value was produced for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_sizes() {
        assert_eq!(Type::Int32.size_bytes(), 4);
        assert_eq!(Type::Double.size_bytes(), 8);
        assert_eq!(Type::V128.size_bytes(), 16);
        assert_eq!(Type::POINTER, Type::Int64);
        assert!(Type::Float.is_float());
        assert!(!Type::V128.is_int());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(ValueId(3).to_string(), "v3");
        assert_eq!(BlockId(0).to_string(), "bb0");
        assert_eq!(Type::Tuple(TupleId(2)).to_string(), "tuple2");
    }
}
