// This module groups everything specific to the wasm front of the optimizing tier. The module
// catalogue (types, imports, tables, globals, tags, callees) and the decoded instruction enum
// are the inputs; IrBuilder in builder translates one function body into a Compilation, the
// block graph plus its stack maps, exception handler table, OSR buffer size and unlinked
// calls. The driver feeds instructions to the builder the way the external parser does and
// cross-checks operand stack heights; the text reader produces modules for tests and the
// dump binary. instance fixes the runtime object layout the generated code addresses.

//! WebAssembly front end: bytecode to block graph.

pub mod builder;
pub mod compilation;
pub mod control;
pub mod driver;
pub mod instance;
pub mod instruction;
pub mod module_info;
pub mod stackmap;
pub mod text;

pub use builder::IrBuilder;
pub use compilation::{Compilation, TailCallSite, UnlinkedCall};
pub use control::{CatchKind, ControlData, ControlKind};
pub use driver::{translate, HeightValidator};
pub use instruction::{BlockType, Instruction, MemArg, NumType, NumericOp};
pub use module_info::{
    ArrayType, CalleeGroup, CalleeInfo, FieldType, FunctionBody, FunctionType, GlobalInfo,
    HeapType, MemoryInfo, ModuleInformation, RefType, StorageType, StructType, TableInfo,
    TagInfo, TypeDefinition, ValType,
};
pub use stackmap::{ExceptionHandler, HandlerKind, HandlerTable, ScratchLayout, StackMap};
pub use text::{parse_module, ParseError};
