//! Out-of-line data for calls, patchpoints and switches.
//!
//! These are plain serializable records: the emission stage reads them from
//! the finished procedure instead of running callbacks captured by the
//! builder.

use super::types::Type;
use serde::{Deserialize, Serialize};

/// Runtime entry points the generated code calls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeOperation {
    GrowMemory,
    MemoryFill,
    MemoryCopy,
    AtomicWait32,
    AtomicWait64,
    AtomicNotify,
    TableGet,
    TableSet,
    TableGrow,
    RefFunc,
    StructNew,
    ArrayNew,
    /// Subtype test for casts whose target is not a final type.
    RefTest,
    Throw,
    Rethrow,
    WriteBarrierSlowPath,
}

/// How a call finds its callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    /// Function of this module, linked after assembly. children: instance, args.
    Direct { function_index: u32 },
    /// Imported function. children: callee instance, code pointer, args.
    Import { function_index: u32 },
    /// Entry loaded from a table. children: callee instance, code pointer, args.
    Indirect { table_index: u32, type_index: u32 },
    /// Function reference. children: callee instance, code pointer, args.
    Ref { type_index: u32 },
    /// children: instance, operands, stack map values.
    Operation(RuntimeOperation),
}

/// Signature and identity of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDescriptor {
    pub kind: CallKind,
    pub arg_types: Vec<Type>,
    pub result_types: Vec<Type>,
    /// Call-site index the exception handler table and stack maps refer to.
    pub call_site: u32,
    /// Leading children that are operands rather than stack map values.
    pub operand_count: u32,
}

/// What a patchpoint stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchpointKind {
    /// Store the callee instance and reload memory registers from it.
    /// children: callee instance.
    ContextSwitch,
    /// Reload memory base and bound after a call. children: instance.
    RestoreGlobalState,
    /// Spill live registers and call the tier-up trigger. Loop checks carry
    /// the loop index and the OSR stack map values as children.
    TierUp { loop_index: Option<u32> },
    /// Frame probe at function entry.
    StackOverflowCheck,
    /// Replace the current frame with the callee's; an Oops follows. children: args.
    TailCall { tail_call: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchpointDescriptor {
    pub kind: PatchpointKind,
    pub call_site: Option<u32>,
    /// Index into the compilation's stack map table.
    pub stack_map: Option<u32>,
}

/// Case values of a switch. Successor `i` handles `cases[i]`, the last
/// successor is the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchDescriptor {
    pub cases: Vec<i64>,
}
