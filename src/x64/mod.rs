//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Instruction encoding using iced-x86
//! - The wasm-to-wasm calling convention
//! - Tail-call frame shuffling

pub mod calling_convention;
pub mod encoder;
pub mod tail_call;

pub use calling_convention::{
    CCAssigner, CCAssignment, CallInformation, FunctionFrame, RegBank, WasmAssigner,
};
pub use encoder::{EncodedCode, EncodingError, JumpCondition, X64Encoder};
pub use tail_call::{verify_moves, Location, Move, TailCallPlan};
