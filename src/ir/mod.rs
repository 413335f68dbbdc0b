// This module is the value/block graph the builder produces and every later stage consumes.
// Procedure is an index arena: values, blocks and variables are addressed by newtype ids so
// nested builders for inlined callees append to the same graph without back-pointers. Calls,
// patchpoints and switches carry their out-of-line data in serializable descriptors that the
// emission stage reads instead of running callbacks. Variables model the operand stack and
// locals during building and fix_ssa turns them into Phi/Upsilon joins afterwards. A textual
// dump and a reference interpreter round the module off for tests and the dump binary.

//! Typed SSA value/block graph.

pub mod adaptor;
pub mod block;
pub mod descriptor;
pub mod dump;
pub mod interp;
pub mod procedure;
pub mod ssa;
pub mod types;
pub mod value;

pub use block::{BasicBlock, Frequency};
pub use descriptor::{
    CallDescriptor, CallKind, PatchpointDescriptor, PatchpointKind, RuntimeOperation,
    SwitchDescriptor,
};
pub use procedure::{Entrypoint, EntrypointKind, Procedure, Variable};
pub use ssa::fix_ssa;
pub use types::{
    BlockId, CallId, Origin, PatchpointId, SwitchId, TupleId, Type, ValueId, VariableId,
};
pub use value::{
    AtomicOp, BinaryOp, CompareOp, ConvertOp, Edge, MemoryAccess, Opcode, PinnedReg, SimdLane,
    SimdOp, TrapKind, UnaryOp, Value,
};
