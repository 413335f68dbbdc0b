// This module is the validated module-level catalogue the builder consults: the type
// section (function, struct and array types), imported and defined functions, tables,
// globals, exception tags and the linear memory. It stands in for the output of the external
// module decoder, so it is a plain data structure built either directly in code or by the
// text reader. Value types map onto IR types here: numeric types map one to one, and every
// reference type is a pointer. Struct and array types compute their field layouts once so
// field accesses can use constant offsets. The CalleeGroup is the module-wide table of
// per-function facts shared between compilations on different threads. It sits behind a
// parking_lot RwLock and is only ever read through lookup, which copies one entry out and
// releases the lock before IR construction continues.

//! Module catalogue consumed by the builder.

use super::instance;
use super::instruction::Instruction;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::Type;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Abstract or concrete heap type of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeapType {
    Func,
    Extern,
    Any,
    Eq,
    I31,
    Struct,
    Array,
    None,
    /// Index into the type section.
    Concrete(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefType {
    pub nullable: bool,
    pub heap: HeapType,
}

impl RefType {
    pub const FUNCREF: RefType = RefType { nullable: true, heap: HeapType::Func };
    pub const EXTERNREF: RefType = RefType { nullable: true, heap: HeapType::Extern };
}

/// Wasm value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    Ref(RefType),
}

impl ValType {
    pub fn to_ir(self) -> Type {
        match self {
            ValType::I32 => Type::Int32,
            ValType::I64 => Type::Int64,
            ValType::F32 => Type::Float,
            ValType::F64 => Type::Double,
            ValType::V128 => Type::V128,
            ValType::Ref(_) => Type::POINTER,
        }
    }

    pub fn is_ref(self) -> bool {
        matches!(self, ValType::Ref(_))
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::F32 => write!(f, "f32"),
            ValType::F64 => write!(f, "f64"),
            ValType::V128 => write!(f, "v128"),
            ValType::Ref(r) => write!(f, "(ref {}{:?})", if r.nullable { "null " } else { "" }, r.heap),
        }
    }
}

/// Function signature, also used for block signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FunctionType {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> Self {
        Self { params, results }
    }

    pub fn param_types(&self) -> Vec<Type> {
        self.params.iter().map(|t| t.to_ir()).collect()
    }

    pub fn result_types(&self) -> Vec<Type> {
        self.results.iter().map(|t| t.to_ir()).collect()
    }
}

/// Field storage, including the packed types only structs and arrays use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    I8,
    I16,
    Val(ValType),
}

impl StorageType {
    pub fn size_bytes(self) -> u32 {
        match self {
            StorageType::I8 => 1,
            StorageType::I16 => 2,
            StorageType::Val(v) => v.to_ir().size_bytes(),
        }
    }

    /// Type a field is read into.
    pub fn unpacked(self) -> ValType {
        match self {
            StorageType::I8 | StorageType::I16 => ValType::I32,
            StorageType::Val(v) => v,
        }
    }

    pub fn is_packed(self) -> bool {
        !matches!(self, StorageType::Val(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldType {
    pub storage: StorageType,
    pub mutable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructType {
    pub fields: Vec<FieldType>,
    offsets: Vec<u32>,
}

impl StructType {
    pub fn new(fields: Vec<FieldType>) -> Self {
        let mut offset = instance::GC_OBJECT_PAYLOAD as u32;
        let offsets = fields
            .iter()
            .map(|field| {
                let size = field.storage.size_bytes();
                offset = offset.next_multiple_of(size);
                let at = offset;
                offset += size;
                at
            })
            .collect();
        Self { fields, offsets }
    }

    /// Byte offset of a field from the object pointer.
    pub fn field_offset(&self, index: u32) -> Option<u32> {
        self.offsets.get(index as usize).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayType {
    pub element: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeDefinition {
    Func(FunctionType),
    Struct(StructType),
    Array(ArrayType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalInfo {
    pub ty: ValType,
    pub mutable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub element: RefType,
    pub initial: u32,
    pub maximum: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub initial_pages: u32,
    pub maximum_pages: Option<u32>,
    pub shared: bool,
}

/// Exception tag; its function type's params are the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    pub type_index: u32,
}

/// Body of a function defined in the module.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionBody {
    pub type_index: u32,
    /// Declared locals after the parameters.
    pub locals: Vec<ValType>,
    pub code: Vec<Instruction>,
}

/// Per-function facts shared between compilation threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalleeInfo {
    /// Instructions in the body.
    pub size: usize,
    pub has_tail_calls: bool,
    /// Entry address once the optimized code is installed.
    pub entrypoint: Option<u64>,
}

/// Handle to the module-wide callee table.
#[derive(Debug, Clone, Default)]
pub struct CalleeGroup {
    inner: Arc<RwLock<Vec<CalleeInfo>>>,
}

impl CalleeGroup {
    pub fn new(infos: Vec<CalleeInfo>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(infos)),
        }
    }

    /// Copy one entry out under the shared lock.
    pub fn lookup(&self, defined_index: usize) -> Option<CalleeInfo> {
        self.inner.read().get(defined_index).copied()
    }

    pub fn set_entrypoint(&self, defined_index: usize, address: u64) {
        if let Some(info) = self.inner.write().get_mut(defined_index) {
            info.entrypoint = Some(address);
        }
    }
}

/// Everything the builder needs to know about the module.
#[derive(Debug, Clone, Default)]
pub struct ModuleInformation {
    pub types: Vec<TypeDefinition>,
    /// Type index of each imported function; imports come first in the
    /// function index space.
    pub imported_functions: Vec<u32>,
    pub functions: Vec<FunctionBody>,
    pub globals: Vec<GlobalInfo>,
    pub tables: Vec<TableInfo>,
    pub memory: Option<MemoryInfo>,
    pub tags: Vec<TagInfo>,
    pub callees: CalleeGroup,
}

impl ModuleInformation {
    /// Build the callee table from the function bodies.
    pub fn publish_callees(&mut self) {
        let infos = self
            .functions
            .iter()
            .map(|body| CalleeInfo {
                size: body.code.len(),
                has_tail_calls: body.code.iter().any(Instruction::is_tail_call),
                entrypoint: None,
            })
            .collect();
        self.callees = CalleeGroup::new(infos);
    }

    /// Whether a v128 can appear anywhere in the module's code, including
    /// inlined callees and values read out of globals or GC objects.
    pub fn uses_vectors(&self) -> bool {
        let is_vector = |ty: &ValType| *ty == ValType::V128;
        let field = |f: &FieldType| f.storage == StorageType::Val(ValType::V128);
        let in_types = self.types.iter().any(|def| match def {
            TypeDefinition::Func(sig) => sig.params.iter().chain(&sig.results).any(is_vector),
            TypeDefinition::Struct(s) => s.fields.iter().any(field),
            TypeDefinition::Array(a) => field(&a.element),
        });
        in_types
            || self.globals.iter().any(|g| is_vector(&g.ty))
            || self.functions.iter().any(|body| {
                body.locals.iter().any(is_vector) || body.code.iter().any(Instruction::uses_vectors)
            })
    }

    pub fn function_count(&self) -> u32 {
        (self.imported_functions.len() + self.functions.len()) as u32
    }

    pub fn is_import(&self, function_index: u32) -> bool {
        (function_index as usize) < self.imported_functions.len()
    }

    pub fn type_definition(&self, type_index: u32) -> CompileResult<&TypeDefinition> {
        self.types.get(type_index as usize).ok_or(CompileError::InvalidIndex {
            kind: "type",
            index: type_index,
        })
    }

    pub fn function_type_at(&self, type_index: u32) -> CompileResult<&FunctionType> {
        match self.type_definition(type_index)? {
            TypeDefinition::Func(sig) => Ok(sig),
            _ => Err(CompileError::validation(format!(
                "type {} is not a function type",
                type_index
            ))),
        }
    }

    pub fn struct_type(&self, type_index: u32) -> CompileResult<&StructType> {
        match self.type_definition(type_index)? {
            TypeDefinition::Struct(s) => Ok(s),
            _ => Err(CompileError::validation(format!("type {} is not a struct", type_index))),
        }
    }

    pub fn array_type(&self, type_index: u32) -> CompileResult<&ArrayType> {
        match self.type_definition(type_index)? {
            TypeDefinition::Array(a) => Ok(a),
            _ => Err(CompileError::validation(format!("type {} is not an array", type_index))),
        }
    }

    pub fn function_type_index(&self, function_index: u32) -> CompileResult<u32> {
        let imports = self.imported_functions.len();
        let index = function_index as usize;
        if index < imports {
            return Ok(self.imported_functions[index]);
        }
        self.functions
            .get(index - imports)
            .map(|body| body.type_index)
            .ok_or(CompileError::InvalidIndex {
                kind: "function",
                index: function_index,
            })
    }

    pub fn function_type(&self, function_index: u32) -> CompileResult<&FunctionType> {
        self.function_type_at(self.function_type_index(function_index)?)
    }

    /// Body of a defined function.
    pub fn body(&self, function_index: u32) -> CompileResult<&FunctionBody> {
        let imports = self.imported_functions.len();
        (function_index as usize)
            .checked_sub(imports)
            .and_then(|i| self.functions.get(i))
            .ok_or(CompileError::InvalidIndex {
                kind: "defined function",
                index: function_index,
            })
    }

    pub fn global(&self, index: u32) -> CompileResult<GlobalInfo> {
        self.globals.get(index as usize).copied().ok_or(CompileError::InvalidIndex {
            kind: "global",
            index,
        })
    }

    pub fn table(&self, index: u32) -> CompileResult<TableInfo> {
        self.tables.get(index as usize).copied().ok_or(CompileError::InvalidIndex {
            kind: "table",
            index,
        })
    }

    pub fn tag_type(&self, tag_index: u32) -> CompileResult<&FunctionType> {
        let tag = self.tags.get(tag_index as usize).ok_or(CompileError::InvalidIndex {
            kind: "tag",
            index: tag_index,
        })?;
        self.function_type_at(tag.type_index)
    }

    pub fn callee_info(&self, function_index: u32) -> Option<CalleeInfo> {
        let defined = (function_index as usize).checked_sub(self.imported_functions.len())?;
        self.callees.lookup(defined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_index_space_puts_imports_first() {
        let mut module = ModuleInformation {
            types: vec![
                TypeDefinition::Func(FunctionType::new(vec![ValType::I32], vec![])),
                TypeDefinition::Func(FunctionType::new(vec![], vec![ValType::F64])),
            ],
            imported_functions: vec![0],
            functions: vec![FunctionBody {
                type_index: 1,
                locals: vec![],
                code: vec![Instruction::F64Const(0), Instruction::End],
            }],
            ..Default::default()
        };
        module.publish_callees();

        assert!(module.is_import(0));
        assert_eq!(module.function_type(1).unwrap().results, vec![ValType::F64]);
        assert!(module.body(0).is_err());
        assert_eq!(module.callee_info(1).unwrap().size, 2);
        assert!(module.callee_info(0).is_none());
    }

    #[test]
    fn test_struct_field_offsets_are_aligned() {
        let s = StructType::new(vec![
            FieldType { storage: StorageType::I8, mutable: true },
            FieldType { storage: StorageType::Val(ValType::I64), mutable: false },
            FieldType { storage: StorageType::I16, mutable: true },
        ]);
        let base = instance::GC_OBJECT_PAYLOAD as u32;
        assert_eq!(s.field_offset(0), Some(base));
        assert_eq!(s.field_offset(1), Some(base + 8));
        assert_eq!(s.field_offset(2), Some(base + 16));
        assert_eq!(s.field_offset(3), None);
    }
}
