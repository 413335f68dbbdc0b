// This module is the hub for the compiler infrastructure shared by the IR builder, the
// analyses and the inline cache generator. It groups session management (arena-backed
// scratch allocation and statistics), the register model (AsmReg, RegBitSet and the scratch
// register allocator used by inline caches), the compile error type, compiler options, and
// the graph analyses that run between building and emission: the IrAdaptor view, block
// ordering with unreachable-block pruning, critical edge breaking and fixpoint liveness.

//! Core infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based scratch allocation using `bumpalo`
//! - Compilation statistics
//!
//! ## Register Model (`register_file`)
//! - Register identifiers and per-bank bitsets
//! - Scratch register selection that never clobbers live registers
//!
//! ## Analyses (`analyzer`, `liveness`, `critical_edges`)
//! - Reverse post-order, reachability and pruning
//! - Fixpoint liveness with shadow indices for phis and kill flags
//! - Jump pads on critical edges

pub mod adaptor;
pub mod analyzer;
pub mod critical_edges;
pub mod error;
pub mod liveness;
pub mod options;
pub mod register_file;
pub mod session;
pub mod test_utils;

pub use adaptor::{IrAdaptor, JoinRole};
pub use analyzer::{prune_unreachable, Analyzer};
pub use critical_edges::break_critical_edges;
pub use error::{CompileError, CompileResult};
pub use liveness::{compute_liveness, FlowIndex, Liveness, LivenessResult};
pub use options::{BoundsCheckingMode, CompilerOptions, InlineEligibility, TierUpThresholds};
pub use register_file::{AsmReg, RegBitSet, ScratchRegisterAllocator};
pub use session::{CompilationSession, SessionStats};
