//! Output of one function translation.

use super::stackmap::{HandlerTable, StackMap};
use crate::ir::{CallId, CallKind, PatchpointId, Procedure, Type};
use serde::{Deserialize, Serialize};

/// Direct call whose target address the linker fills in after assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkedCall {
    pub call: CallId,
    pub function_index: u32,
}

/// A `return_call*` site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailCallSite {
    pub patchpoint: PatchpointId,
    /// Callee; only `Direct`, `Indirect` and `Ref` occur.
    pub callee: CallKind,
    pub arg_types: Vec<Type>,
    pub result_types: Vec<Type>,
}

/// Block graph plus the side tables the backend needs.
///
/// Inlined callees append to the same compilation, so call-site numbering
/// and try depth are shared by every frame.
#[derive(Debug, Clone, Default)]
pub struct Compilation {
    pub function_index: u32,
    pub procedure: Procedure,
    pub stack_maps: Vec<StackMap>,
    pub handlers: HandlerTable,
    /// Largest OSR entry buffer any loop needs, in bytes.
    pub osr_entry_scratch_size: u32,
    pub unlinked_calls: Vec<UnlinkedCall>,
    pub tail_calls: Vec<TailCallSite>,
    /// Function indices inlined into this one, in inlining order.
    pub inlined_functions: Vec<u32>,
    pub(crate) call_site_count: u32,
    pub(crate) try_depth: u32,
    pub(crate) loop_count: u32,
    /// Slot width shared by every catch and OSR entry buffer.
    pub(crate) entry_slot_size: u32,
}

impl Compilation {
    pub fn new(function_index: u32) -> Self {
        Self {
            function_index,
            ..Default::default()
        }
    }

    /// Call sites numbered so far.
    pub fn call_site_count(&self) -> u32 {
        self.call_site_count
    }

    /// Try regions currently open.
    pub fn try_depth(&self) -> u32 {
        self.try_depth
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub(crate) fn next_call_site(&mut self) -> u32 {
        let site = self.call_site_count;
        self.call_site_count += 1;
        site
    }
}
