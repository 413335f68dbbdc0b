//! wasmjit - optimizing tier of a WebAssembly JIT.
//!
//! wasmjit translates one decoded function body at a time into a typed SSA
//! block graph, runs fixpoint liveness over it and hands the graph plus its
//! side tables (stack maps, exception handlers, OSR buffer size, unlinked
//! calls) to a backend. It also generates the patchable inline cache stubs
//! the baseline tier reserves at property access sites.
//!
//! # Primary Usage
//!
//! ```ignore
//! use wasmjit::{compile_function, CompilationSession, CompilerOptions};
//! use wasmjit::wasm::parse_module;
//! use bumpalo::Bump;
//!
//! let module = parse_module(listing)?;
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let compilation = compile_function(&module, 0, &CompilerOptions::default(), &session)?;
//! println!("{}", compilation.procedure);
//! ```
//!
//! # Architecture
//!
//! - [`wasm`] - Module catalogue, opcode driver and the IR builder
//! - [`ir`] - Value/block graph, SSA repair, dump and reference interpreter
//! - [`core`] - Shared infrastructure (session, registers, analyses, options)
//! - [`x64`] - x86-64 encoder, calling convention, tail-call shuffles
//! - [`ic`] - Inline cache stubs
//! - [`codegen`] - Backend hand-off descriptors

pub mod codegen;
pub mod core;
pub mod ic;
pub mod ir;
pub mod wasm;
pub mod x64;

pub use crate::core::{
    // Analyses
    break_critical_edges, compute_liveness, prune_unreachable, Analyzer, IrAdaptor,
    LivenessResult,
    // Configuration and errors
    BoundsCheckingMode, CompileError, CompileResult, CompilerOptions,
    // Registers and sessions
    AsmReg, CompilationSession, RegBitSet, SessionStats,
};
pub use codegen::CompiledPlan;
pub use ir::Procedure;
pub use wasm::{Compilation, IrBuilder, ModuleInformation};

use log::debug;

/// Build, clean up and analyse the defined function `function_index`.
///
/// The builder runs over the whole body first; unreachable blocks are then
/// pruned, critical edges split, local variables rewritten into phis and
/// liveness written back onto the graph. The first failure aborts the
/// function.
pub fn compile_function(
    module: &ModuleInformation,
    function_index: u32,
    options: &CompilerOptions,
    session: &CompilationSession<'_>,
) -> CompileResult<Compilation> {
    session.set_current_function(function_index);
    let body = module.body(function_index)?;
    let mut compilation = Compilation::new(function_index);
    {
        let mut builder = IrBuilder::new(&mut compilation, module, options, session, function_index)?;
        wasm::translate(&mut builder, &body.code)?;
        builder.finish()?;
    }

    let procedure = &mut compilation.procedure;
    let pruned = prune_unreachable(procedure);
    let pads = break_critical_edges(procedure);
    let phis = ir::fix_ssa(procedure);
    let liveness = compute_liveness(&*procedure, session);
    procedure.apply_liveness(&liveness);
    procedure.validate()?;

    debug!(
        "function {}: pruned {} blocks, {} edge pads, {} phis, liveness in {} sweeps",
        function_index, pruned, pads, phis, liveness.sweeps
    );
    session.record_function_compiled(&format!("function{}", function_index), procedure.num_values());
    session.clear_function_state();
    Ok(compilation)
}
