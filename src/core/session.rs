// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns a reference to the arena that backs every transient, per-function
// allocation that does not belong to the block graph itself: liveness worksets and dirty
// bitmaps, tail-call move lists and frame layouts. The session also
// tracks compilation statistics (opcodes translated per category, values and blocks created,
// calls inlined, bounds checks and tier-up checks emitted, stack maps captured, liveness
// fixpoint iterations) so the dump binary and tests can observe what a compilation did.
// The block graph lives in its own index arena (ir::Procedure) because inlined callees
// append to the caller's graph while the session is shared read-only.

//! Arena-based compilation session management.
//!
//! All scratch data for one compilation is tied to the session lifetime, so
//! nothing has to be freed piecemeal.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation scratch.
    arena: &'arena Bump,

    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,

    /// Current function being compiled.
    current_function: RefCell<Option<u32>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            current_function: RefCell::new(None),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate a slice in the arena, every element set to `value`.
    pub fn alloc_slice_fill<T: Copy>(&self, len: usize, value: T) -> &'arena mut [T] {
        self.arena.alloc_slice_fill_copy(len, value)
    }

    /// Set the function index being compiled.
    pub fn set_current_function(&self, index: u32) {
        *self.current_function.borrow_mut() = Some(index);
    }

    /// Function index being compiled, if any.
    pub fn current_function(&self) -> Option<u32> {
        *self.current_function.borrow()
    }

    /// Clear per-function state.
    pub fn clear_function_state(&self) {
        *self.current_function.borrow_mut() = None;
    }

    /// Record that a function was compiled.
    pub fn record_function_compiled(&self, name: &str, value_count: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_compiled += 1;
        stats.total_values += value_count;

        if stats.largest_function_values < value_count {
            stats.largest_function_values = value_count;
            stats.largest_function_name = name.to_string();
        }
    }

    /// Record one translated opcode.
    pub fn record_opcode(&self, category: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.opcodes_translated += 1;
        *stats.opcode_counts.entry(category).or_insert(0) += 1;
    }

    pub fn record_blocks_created(&self, count: usize) {
        self.stats.borrow_mut().blocks_created += count;
    }

    pub fn record_inlined_call(&self) {
        self.stats.borrow_mut().inlined_calls += 1;
    }

    pub fn record_bounds_check(&self) {
        self.stats.borrow_mut().bounds_checks += 1;
    }

    pub fn record_tier_up_check(&self) {
        self.stats.borrow_mut().tier_up_checks += 1;
    }

    pub fn record_stack_map(&self) {
        self.stats.borrow_mut().stack_maps_captured += 1;
    }

    pub fn record_liveness_iterations(&self, iterations: usize) {
        self.stats.borrow_mut().liveness_iterations += iterations;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of functions compiled.
    pub functions_compiled: usize,

    /// Total number of IR values produced.
    pub total_values: usize,

    /// Number of opcodes fed to the builder.
    pub opcodes_translated: usize,

    /// Count of each opcode category translated.
    pub opcode_counts: HashMap<&'static str, usize>,

    /// Largest function compiled, in IR values.
    pub largest_function_values: usize,

    /// Name of the largest function.
    pub largest_function_name: String,

    /// Basic blocks created.
    pub blocks_created: usize,

    /// Direct calls replaced by their callee body.
    pub inlined_calls: usize,

    /// Explicit memory bounds checks emitted.
    pub bounds_checks: usize,

    /// Tier-up counter checks emitted.
    pub tier_up_checks: usize,

    /// Stack maps captured for unwinding or OSR.
    pub stack_maps_captured: usize,

    /// Blocks processed by the liveness fixpoint.
    pub liveness_iterations: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  Opcodes translated: {}", self.opcodes_translated)?;
        writeln!(f, "  IR values: {}", self.total_values)?;
        writeln!(f, "  Blocks created: {}", self.blocks_created)?;
        writeln!(f, "  Calls inlined: {}", self.inlined_calls)?;
        writeln!(f, "  Bounds checks: {}", self.bounds_checks)?;
        writeln!(f, "  Tier-up checks: {}", self.tier_up_checks)?;
        writeln!(f, "  Stack maps captured: {}", self.stack_maps_captured)?;
        writeln!(f, "  Liveness block visits: {}", self.liveness_iterations)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} values)",
                self.largest_function_name, self.largest_function_values
            )?;
        }

        if !self.opcode_counts.is_empty() {
            writeln!(f, "  Opcode breakdown:")?;
            let mut sorted: Vec<_> = self.opcode_counts.iter().collect();
            sorted.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), **name));

            for (category, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", category, count)?;
            }
        }

        Ok(())
    }
}
