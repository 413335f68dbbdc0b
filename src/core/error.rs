// This module defines the compile-time error type for wasmjit using the thiserror crate.
// CompileError covers every way a single function compilation can fail: operand-stack
// underflow or other validation mismatches reported while translating opcodes, out of
// range module indices (types, functions, globals, tables, tags, locals), arity mismatches
// at branches and calls, unsupported opcode/feature combinations, allocation limits
// (locals, variables), encoder failures bubbled up from iced-x86, and internal invariant
// violations. Runtime traps are deliberately not represented here: they are compiled into
// Check/Trap operations and only happen when the generated code runs. CompileResult<T> is
// the alias every builder operation returns, so the first failure propagates with `?` and
// aborts the whole function.

//! Error types for the wasmjit compiler.

use crate::x64::encoder::EncodingError;
use thiserror::Error;

/// Main error type for a function compilation.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Validation failed: {reason}")]
    Validation {
        reason: String,
    },

    #[error("Operand stack underflow in {operation}: need {needed}, have {available}")]
    StackUnderflow {
        operation: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("Invalid {kind} index {index}")]
    InvalidIndex {
        kind: &'static str,
        index: u32,
    },

    #[error("Invalid arity for {operation}: expected {expected}, got {actual}")]
    InvalidArity {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Unsupported: {what}")]
    Unsupported {
        what: String,
    },

    #[error("Allocation failed: {what}")]
    AllocationFailed {
        what: String,
    },

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("Internal compiler error: {reason}")]
    Internal {
        reason: String,
    },
}

impl CompileError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        CompileError::Validation { reason: reason.into() }
    }

    pub(crate) fn unsupported(what: impl Into<String>) -> Self {
        CompileError::Unsupported { what: what.into() }
    }

    pub(crate) fn internal(reason: impl Into<String>) -> Self {
        CompileError::Internal { reason: reason.into() }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
