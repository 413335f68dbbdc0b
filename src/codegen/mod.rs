// This module is the boundary between the IR builder and the backend. CompiledPlan is the
// serializable summary of a finished Compilation that the backend and the linker consume
// together with the block graph: entrypoints, the stack map table keyed by call site, the
// exception handler table, the OSR entry buffer size, the direct calls left to link and the
// tail-call sites. Nothing here holds a reference into the builder; the emission stage only
// reads the finished compilation. resolve_calls matches unlinked calls against entrypoints
// published in the module's callee table, and emit_tail_call produces the frame shuffle of a
// tail call once its argument locations are known.

//! Backend hand-off descriptors.

use crate::core::error::{CompileError, CompileResult};
use crate::ir::{CallId, CallKind, Entrypoint, Type};
use crate::wasm::compilation::{Compilation, TailCallSite, UnlinkedCall};
use crate::wasm::module_info::ModuleInformation;
use crate::wasm::stackmap::{HandlerTable, StackMap};
use crate::x64::calling_convention::{CallInformation, FunctionFrame};
use crate::x64::encoder::{EncodedCode, X64Encoder};
use crate::x64::tail_call::{Location, TailCallPlan};
use bumpalo::Bump;
use serde::{Deserialize, Serialize};

/// What the backend needs besides the block graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPlan {
    pub function_index: u32,
    pub block_count: usize,
    pub value_count: usize,
    pub entrypoints: Vec<Entrypoint>,
    pub call_site_count: u32,
    pub stack_maps: Vec<StackMap>,
    pub handlers: HandlerTable,
    pub osr_entry_scratch_size: u32,
    pub unlinked_calls: Vec<UnlinkedCall>,
    pub tail_calls: Vec<TailCallSite>,
    pub inlined_functions: Vec<u32>,
}

impl CompiledPlan {
    pub fn from_compilation(compilation: &Compilation) -> Self {
        let procedure = &compilation.procedure;
        Self {
            function_index: compilation.function_index,
            block_count: procedure.blocks().iter().filter(|b| !b.dead).count(),
            value_count: procedure.num_values(),
            entrypoints: procedure.entrypoints().to_vec(),
            call_site_count: compilation.call_site_count(),
            stack_maps: compilation.stack_maps.clone(),
            handlers: compilation.handlers.clone(),
            osr_entry_scratch_size: compilation.osr_entry_scratch_size,
            unlinked_calls: compilation.unlinked_calls.clone(),
            tail_calls: compilation.tail_calls.clone(),
            inlined_functions: compilation.inlined_functions.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Stack map captured at `call_site`.
    pub fn stack_map(&self, call_site: u32) -> Option<&StackMap> {
        self.stack_maps.iter().find(|map| map.call_site == Some(call_site))
    }
}

/// Direct call with the address it should jump to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedCall {
    pub call: CallId,
    pub target: u64,
}

/// Targets for every unlinked call whose callee is installed. Calls to
/// functions without an entrypoint yet are left out.
pub fn resolve_calls(plan: &CompiledPlan, module: &ModuleInformation) -> Vec<LinkedCall> {
    let imports = module.imported_functions.len();
    plan.unlinked_calls
        .iter()
        .filter_map(|call| {
            let defined = (call.function_index as usize).checked_sub(imports)?;
            let target = module.callees.lookup(defined)?.entrypoint?;
            Some(LinkedCall {
                call: call.call,
                target,
            })
        })
        .collect()
}

/// Assemble the frame shuffle and jump for `site` at address `base`.
///
/// `sources` are the patchpoint's operands where the register allocator
/// left them: the callee instance, for indirect and ref callees the code
/// pointer, then the arguments. `target` is the entry of a direct callee.
pub fn emit_tail_call(
    arena: &Bump,
    site: &TailCallSite,
    sources: &[(Location, Type)],
    frame: &FunctionFrame<'_>,
    target: Option<u64>,
    base: u64,
) -> CompileResult<EncodedCode> {
    let callee = CallInformation::new(&site.arg_types, &site.result_types);
    let direct = matches!(site.callee, CallKind::Direct { .. });
    let plan = if direct {
        TailCallPlan::new(arena, sources, &callee, frame)?
    } else {
        TailCallPlan::new_indirect(arena, sources, &callee, frame)?
    };
    if !plan.verify_no_clobber() {
        return Err(CompileError::internal(format!(
            "tail call shuffle for patchpoint {:?} reads a clobbered slot",
            site.patchpoint
        )));
    }
    let mut encoder = X64Encoder::new()?;
    if direct {
        let target = target.ok_or_else(|| {
            CompileError::internal(format!("direct tail call {:?} without a target", site.patchpoint))
        })?;
        plan.emit(&mut encoder, target)?;
    } else {
        plan.emit_indirect(&mut encoder)?;
    }
    Ok(encoder.finalize(base)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile_function;
    use crate::core::options::CompilerOptions;
    use crate::core::register_file::AsmReg;
    use crate::core::test_utils::test::TestContext;
    use crate::wasm::parse_module;

    const LISTING: &str = "type func i32 -> i32\n\
        type func i32 i32 -> i32\n\
        func 0\n\
        \x20 local.get 0\n\
        \x20 local.get 0\n\
        \x20 call 1\n\
        \x20 end\n\
        func 1\n\
        \x20 local.get 0\n\
        \x20 local.get 1\n\
        \x20 return_call 2\n\
        \x20 end\n\
        func 1\n\
        \x20 local.get 0\n\
        \x20 end\n";

    fn no_inlining() -> CompilerOptions {
        CompilerOptions {
            max_inline_size: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_lists_unlinked_calls() {
        let module = parse_module(LISTING).unwrap();
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let compilation = compile_function(&module, 0, &no_inlining(), &session).unwrap();
        let plan = CompiledPlan::from_compilation(&compilation);

        assert_eq!(plan.unlinked_calls.len(), 1);
        assert_eq!(plan.unlinked_calls[0].function_index, 1);
        assert!(resolve_calls(&plan, &module).is_empty());

        module.callees.set_entrypoint(1, 0x4000);
        let linked = resolve_calls(&plan, &module);
        assert_eq!(linked, vec![LinkedCall { call: plan.unlinked_calls[0].call, target: 0x4000 }]);

        let json = plan.to_json().unwrap();
        let back: CompiledPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn test_stack_maps_are_found_by_call_site() {
        let module = parse_module(
            "type func i32 -> i32\n\
             func 0\n\
             \x20 try i32\n\
             \x20   local.get 0\n\
             \x20   call 1\n\
             \x20 catch_all\n\
             \x20   i32.const 0\n\
             \x20 end\n\
             \x20 end\n\
             func 0\n\
             \x20 local.get 0\n\
             \x20 end\n",
        )
        .unwrap();
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let compilation = compile_function(&module, 0, &no_inlining(), &session).unwrap();
        let plan = CompiledPlan::from_compilation(&compilation);

        let map = plan.stack_maps.first().unwrap();
        let call_site = map.call_site.unwrap();
        assert_eq!(plan.stack_map(call_site), Some(map));
        assert!(plan.stack_map(call_site + 1).is_none());
    }

    #[test]
    fn test_tail_call_site_emits_shuffle() {
        let module = parse_module(LISTING).unwrap();
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let compilation = compile_function(&module, 1, &no_inlining(), &session).unwrap();
        let plan = CompiledPlan::from_compilation(&compilation);
        assert_eq!(plan.tail_calls.len(), 1);
        let site = &plan.tail_calls[0];
        assert_eq!(site.arg_types, vec![Type::Int32, Type::Int32]);

        let arena = Bump::new();
        let mut frame = FunctionFrame::new(&arena, 0);
        frame.calculate_frame_size();
        // arguments arrive swapped relative to the callee's registers
        let sources = [
            (Location::Reg(AsmReg::RDI), Type::Int64),
            (Location::Reg(AsmReg::RDX), Type::Int32),
            (Location::Reg(AsmReg::RSI), Type::Int32),
        ];
        let code = emit_tail_call(&arena, site, &sources, &frame, Some(0x20_0000), 0x1000).unwrap();
        assert_eq!(code.bytes[code.len() - 5], 0xE9);

        let err = emit_tail_call(&arena, site, &sources[..2], &frame, Some(0x20_0000), 0x1000).unwrap_err();
        assert!(matches!(err, CompileError::InvalidArity { .. }));
        assert!(emit_tail_call(&arena, site, &sources, &frame, None, 0x1000).is_err());
    }
}
