//! End-to-end scenarios: listing -> compile_function -> interpreter.

use bumpalo::Bump;
use wasmjit::core::{Analyzer, FlowIndex};
use wasmjit::ir::interp::{Host, InterpError, Interpreter, NoCalls, Outcome};
use wasmjit::ir::{
    BlockId, CallDescriptor, CallKind, Opcode, Procedure, RuntimeOperation, TrapKind, ValueId,
};
use wasmjit::wasm::parse_module;
use wasmjit::{compile_function, BoundsCheckingMode, CompilationSession, Compilation, CompilerOptions};

fn compile(listing: &str, options: &CompilerOptions) -> Compilation {
    let module = parse_module(listing).unwrap();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    compile_function(&module, 0, options, &session).unwrap()
}

fn run(compilation: &Compilation, arg: u32) -> Outcome {
    Interpreter::new(&compilation.procedure)
        .run(&[arg as u128], &mut NoCalls)
        .unwrap()
}

fn upsilons_of(procedure: &Procedure, phi: ValueId) -> Vec<ValueId> {
    procedure
        .live_blocks()
        .flat_map(|b| procedure.block(b).values.clone())
        .filter(|&v| procedure.value(v).upsilon_phi() == Some(phi))
        .collect()
}

fn return_block(procedure: &Procedure) -> BlockId {
    procedure
        .live_blocks()
        .find(|&b| {
            procedure
                .terminal(b)
                .is_some_and(|t| procedure.value(t).opcode == Opcode::Return)
        })
        .unwrap()
}

const IF_ELSE: &str = "type func i32 -> i32\n\
func 0\n\
\x20 local.get 0\n\
\x20 i32.const 0\n\
\x20 i32.eq\n\
\x20 if i32\n\
\x20   i32.const 1\n\
\x20 else\n\
\x20   i32.const 2\n\
\x20 end\n\
\x20 end\n";

#[test]
fn if_else_materializes_one_or_two() {
    let compilation = compile(IF_ELSE, &CompilerOptions::default());
    assert_eq!(run(&compilation, 0), Outcome::Return(vec![1]));
    assert_eq!(run(&compilation, 9), Outcome::Return(vec![2]));

    let procedure = &compilation.procedure;
    let ret = procedure.terminal(return_block(procedure)).unwrap();
    // follow single-input phis from the return back to the if's join
    let mut joined = procedure.value(ret).child(0);
    loop {
        assert_eq!(procedure.value(joined).opcode, Opcode::Phi);
        let inputs = upsilons_of(procedure, joined);
        if inputs.len() != 1 {
            assert_eq!(inputs.len(), 2);
            break;
        }
        joined = procedure.value(inputs[0]).child(0);
    }

    // the comparison dies at the branch that consumes it
    let entry = procedure.function_entry().unwrap();
    let branch = procedure.terminal(entry).unwrap();
    assert_eq!(procedure.value(branch).opcode, Opcode::Branch);
    let condition = procedure.value(branch).children[0];
    assert!(condition.kill);
    let index = FlowIndex::value(condition.value.index());
    for &succ in &procedure.block(entry).successors {
        assert!(!procedure.block(succ).live_at_head.contains(&index));
    }
}

const COUNTDOWN: &str = "type func i32 -> i32\n\
func 0\n\
\x20 local.get 0\n\
\x20 loop type=0\n\
\x20   local.get 0\n\
\x20   i32.const 1\n\
\x20   i32.sub\n\
\x20   local.tee 0\n\
\x20   i32.const 0\n\
\x20   i32.gt_s\n\
\x20   br_if 0\n\
\x20 end\n\
\x20 drop\n\
\x20 local.get 0\n\
\x20 end\n";

#[test]
fn loop_phi_is_fed_by_entry_and_back_edge() {
    let compilation = compile(COUNTDOWN, &CompilerOptions::default());
    assert_eq!(run(&compilation, 5), Outcome::Return(vec![0]));
    assert_eq!(run(&compilation, (-3i32) as u32), Outcome::Return(vec![(-4i32) as u32 as u128]));

    let procedure = &compilation.procedure;
    let analyzer = Analyzer::new(procedure);
    let loop_phis: Vec<ValueId> = procedure
        .live_blocks()
        .filter(|b| analyzer.is_loop_header(b.index()))
        .flat_map(|b| procedure.block(b).values.clone())
        .filter(|&v| procedure.value(v).opcode == Opcode::Phi)
        .collect();
    assert!(!loop_phis.is_empty());

    let exit = return_block(procedure);
    for phi in loop_phis {
        let header = procedure.value(phi).block;
        let feeders = upsilons_of(procedure, phi);
        assert!(feeders.len() >= 2, "loop phi {:?} has {} inputs", phi, feeders.len());

        let shadow = FlowIndex::shadow(phi.index());
        assert!(procedure.block(header).live_at_head.contains(&shadow));
        for upsilon in feeders {
            let block = procedure.value(upsilon).block;
            assert!(procedure.block(block).live_at_tail.contains(&shadow));
        }
        let exit_live = &procedure.block(exit).live_at_head;
        assert!(!exit_live.contains(&shadow));
        assert!(!exit_live.contains(&FlowIndex::value(phi.index())));
    }
}

const TWO_LOADS: &str = "type func i32 -> i32\n\
memory 1\n\
func 0\n\
\x20 local.get 0\n\
\x20 i32.load offset=16\n\
\x20 local.get 0\n\
\x20 i32.load offset=4096\n\
\x20 i32.add\n\
\x20 end\n";

fn bounds_checks(compilation: &Compilation) -> usize {
    compilation
        .procedure
        .count_values(|op| *op == Opcode::Check(TrapKind::OutOfBoundsMemoryAccess))
}

#[test]
fn unrelated_loads_get_their_own_checks() {
    let compilation = compile(TWO_LOADS, &CompilerOptions::default());
    assert_eq!(bounds_checks(&compilation), 2);

    let mut memory = vec![0u8; 65536];
    memory[16] = 5;
    memory[4096] = 7;
    let outcome = Interpreter::new(&compilation.procedure)
        .with_memory(memory)
        .run(&[0], &mut NoCalls)
        .unwrap();
    assert_eq!(outcome, Outcome::Return(vec![12]));
    assert_eq!(
        run(&compilation, 65530),
        Outcome::Trap(TrapKind::OutOfBoundsMemoryAccess)
    );

    let signaling = CompilerOptions {
        bounds_checking: BoundsCheckingMode::Signaling,
        ..Default::default()
    };
    let compilation = compile(TWO_LOADS, &signaling);
    assert_eq!(bounds_checks(&compilation), 0);
    assert_eq!(
        run(&compilation, 65530),
        Outcome::Trap(TrapKind::OutOfBoundsMemoryAccess)
    );
}

const NESTED_TRY: &str = "type func i32 -> i32\n\
type func i64 ->\n\
tag 1\n\
func 0\n\
\x20 try i32\n\
\x20   try\n\
\x20     local.get 0\n\
\x20     i64.extend_i32_u\n\
\x20     throw 0\n\
\x20   catch 0\n\
\x20     drop\n\
\x20   end\n\
\x20   local.get 0\n\
\x20 catch_all\n\
\x20   i32.const -1\n\
\x20 end\n\
\x20 end\n";

#[test]
fn try_regions_close_at_top_level_end() {
    let compilation = compile(NESTED_TRY, &CompilerOptions::default());
    assert_eq!(compilation.try_depth(), 0);
    assert_eq!(compilation.handlers.len(), 2);
    // the throw is the only call site and sits in both regions
    assert_eq!(compilation.call_site_count(), 1);
    assert!(compilation.handlers.iter().all(|h| h.covers(0)));

    struct Runtime;
    impl Host for Runtime {
        fn call(&mut self, desc: &CallDescriptor, _args: &[u128]) -> Result<Vec<u128>, Outcome> {
            match desc.kind {
                CallKind::Operation(RuntimeOperation::Throw) => Err(Outcome::Throw),
                _ => Err(Outcome::Trap(TrapKind::Unreachable)),
            }
        }
    }
    let outcome = Interpreter::new(&compilation.procedure)
        .run(&[3], &mut Runtime)
        .unwrap();
    assert_eq!(outcome, Outcome::Throw);
}

#[test]
fn malformed_bodies_fail_the_whole_function() {
    let module = parse_module("type func -> i32\nfunc 0\n  i32.add\n  end\n").unwrap();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    assert!(compile_function(&module, 0, &CompilerOptions::default(), &session).is_err());
}

#[test]
fn runaway_loops_run_out_of_fuel() {
    let compilation = compile(
        "type func ->\nfunc 0\n  loop\n    br 0\n  end\n  end\n",
        &CompilerOptions::default(),
    );
    let result = Interpreter::new(&compilation.procedure)
        .with_fuel(10_000)
        .run(&[], &mut NoCalls);
    assert!(matches!(result, Err(InterpError::OutOfFuel)));
}
