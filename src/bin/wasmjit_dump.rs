//! Dump the IR graph of a textual module listing.
//!
//! Reads a listing (see `wasmjit::wasm::text`), compiles every defined
//! function or the one given with `--function`, and prints the block graph
//! with liveness annotations. Options start from the `WASMJIT_*`
//! environment and are then overridden by flags.

use clap::{Parser, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use wasmjit::ir::interp::{Interpreter, NoCalls};
use wasmjit::wasm::parse_module;
use wasmjit::{compile_function, BoundsCheckingMode, CompilationSession, CompiledPlan, CompilerOptions};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Bounds {
    Checking,
    Signaling,
}

#[derive(Parser, Debug)]
#[command(name = "wasmjit-dump", version, about = "Print the optimizing tier's IR for a module listing")]
struct Cli {
    /// Module listing; stdin when omitted
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Only compile this function index
    #[arg(short, long)]
    function: Option<u32>,

    /// Linear memory bounds checking discipline
    #[arg(long, value_enum)]
    bounds: Option<Bounds>,

    /// Largest callee, in instructions, to inline (0 disables inlining)
    #[arg(long)]
    max_inline_size: Option<usize>,

    /// Emit tier-up counter checks
    #[arg(long)]
    tier_up: bool,

    /// Compile an OSR entry into this loop
    #[arg(long, value_name = "LOOP")]
    osr_loop: Option<u32>,

    /// Reject v128 instructions
    #[arg(long)]
    no_simd: bool,

    /// Reject GC instructions
    #[arg(long)]
    no_gc: bool,

    /// Also print the backend hand-off as JSON
    #[arg(long)]
    plan: bool,

    /// Run each function in the reference interpreter with these arguments
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    run: Option<Vec<i64>>,

    /// Print session statistics at the end
    #[arg(long)]
    stats: bool,
}

impl Cli {
    fn options(&self) -> CompilerOptions {
        let mut options = CompilerOptions::from_env();
        match self.bounds {
            Some(Bounds::Checking) => options.bounds_checking = BoundsCheckingMode::BoundsChecking,
            Some(Bounds::Signaling) => options.bounds_checking = BoundsCheckingMode::Signaling,
            None => {}
        }
        if let Some(size) = self.max_inline_size {
            options.max_inline_size = size;
        }
        if self.tier_up {
            options.enable_tier_up = true;
        }
        if let Some(index) = self.osr_loop {
            options.enable_osr = true;
            options.osr_entry_loop = Some(index);
        }
        options.enable_simd &= !self.no_simd;
        options.enable_gc &= !self.no_gc;
        options
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let text = match &cli.file {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let module = match parse_module(&text) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let options = cli.options();
    log::debug!("{:?}", options);
    let arena = bumpalo::Bump::new();
    let session = CompilationSession::new(&arena);

    let first = module.imported_functions.len() as u32;
    let functions: Vec<u32> = match cli.function {
        Some(index) => vec![index],
        None => (first..module.function_count()).collect(),
    };

    let mut failed = false;
    for index in functions {
        let compilation = match compile_function(&module, index, &options, &session) {
            Ok(compilation) => compilation,
            Err(e) => {
                eprintln!("function {}: {}", index, e);
                failed = true;
                continue;
            }
        };
        println!("function {}:", index);
        println!("{}", compilation.procedure);
        if cli.plan {
            println!("{}", CompiledPlan::from_compilation(&compilation).to_json()?);
        }
        if let Some(args) = &cli.run {
            let raw: Vec<u128> = args.iter().map(|&a| a as u64 as u128).collect();
            match Interpreter::new(&compilation.procedure).run(&raw, &mut NoCalls) {
                Ok(outcome) => println!("=> {:?}", outcome),
                Err(e) => println!("=> interpreter error: {}", e),
            }
        }
    }

    if cli.stats {
        println!("{}", session.stats());
    }
    if failed {
        process::exit(1);
    }
    Ok(())
}
