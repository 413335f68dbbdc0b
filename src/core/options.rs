// This module holds CompilerOptions, the configuration every compilation reads. It selects
// the bounds-checking discipline for linear memory (explicit compares against the memory
// bound, or a guard region that faults with explicit checks only for offsets that could
// reach past it), the inlining budgets (callee size, nesting depth, caller size), tier-up
// counter increments and thresholds, OSR switches, and feature gates for vector and GC
// instructions. The inlining eligibility predicate, whether a callee may switch the module
// instance, is injected as a trait object because deciding it needs whole-module knowledge
// the builder does not have. Defaults suit tests; from_env overlays WASMJIT_* variables.

//! Compiler configuration.

use std::fmt;
use std::sync::Arc;

/// How linear memory accesses are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BoundsCheckingMode {
    /// Compare every access against the memory bound.
    BoundsChecking,
    /// Rely on an unmapped guard region; only offsets that may reach past it
    /// get an explicit compare.
    Signaling,
}

/// Decides whether a call may change the active module instance.
///
/// A callee that can is never inlined, since its body would run with the
/// caller's memory registers.
pub trait InlineEligibility: Send + Sync {
    fn can_clobber_instance(&self, function_index: u32) -> bool;
}

/// Assumes no direct callee switches instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct SameInstance;

impl InlineEligibility for SameInstance {
    fn can_clobber_instance(&self, _function_index: u32) -> bool {
        false
    }
}

/// Refuses to inline anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverInline;

impl InlineEligibility for NeverInline {
    fn can_clobber_instance(&self, _function_index: u32) -> bool {
        true
    }
}

/// Tier-up counter parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierUpThresholds {
    /// Added to the counter on function entry.
    pub function_entry_increment: u32,
    /// Added to the counter on every loop iteration.
    pub loop_increment: u32,
    /// Counter value past which the trigger fires.
    pub threshold: u32,
}

impl Default for TierUpThresholds {
    fn default() -> Self {
        Self {
            function_entry_increment: 15,
            loop_increment: 1,
            threshold: 1000,
        }
    }
}

/// Options for one compilation.
#[derive(Clone)]
pub struct CompilerOptions {
    pub bounds_checking: BoundsCheckingMode,
    /// Bytes of unmapped memory after the accessible region (Signaling mode).
    pub guard_region_size: u64,
    /// Largest callee body, in instructions, considered for inlining.
    pub max_inline_size: usize,
    /// Deepest nesting of inlined frames.
    pub max_inline_depth: u32,
    /// Callers bigger than this, in instructions, inline nothing.
    pub max_caller_size_for_inlining: usize,
    pub tier_up: TierUpThresholds,
    pub enable_tier_up: bool,
    pub enable_osr: bool,
    /// Also compile an OSR entry into the loop with this index.
    pub osr_entry_loop: Option<u32>,
    pub enable_simd: bool,
    pub enable_gc: bool,
    pub inline_eligibility: Arc<dyn InlineEligibility>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            bounds_checking: BoundsCheckingMode::BoundsChecking,
            guard_region_size: 4 << 30,
            max_inline_size: 64,
            max_inline_depth: 3,
            max_caller_size_for_inlining: 4096,
            tier_up: TierUpThresholds::default(),
            enable_tier_up: false,
            enable_osr: false,
            osr_entry_loop: None,
            enable_simd: true,
            enable_gc: true,
            inline_eligibility: Arc::new(SameInstance),
        }
    }
}

impl fmt::Debug for CompilerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerOptions")
            .field("bounds_checking", &self.bounds_checking)
            .field("guard_region_size", &self.guard_region_size)
            .field("max_inline_size", &self.max_inline_size)
            .field("max_inline_depth", &self.max_inline_depth)
            .field("max_caller_size_for_inlining", &self.max_caller_size_for_inlining)
            .field("tier_up", &self.tier_up)
            .field("enable_tier_up", &self.enable_tier_up)
            .field("enable_osr", &self.enable_osr)
            .field("osr_entry_loop", &self.osr_entry_loop)
            .field("enable_simd", &self.enable_simd)
            .field("enable_gc", &self.enable_gc)
            .finish_non_exhaustive()
    }
}

impl CompilerOptions {
    /// Defaults overlaid with `WASMJIT_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Apply settings from a key lookup; unknown or malformed values are ignored.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(mode) = lookup("WASMJIT_BOUNDS_CHECKING") {
            match mode.to_ascii_lowercase().as_str() {
                "signaling" => self.bounds_checking = BoundsCheckingMode::Signaling,
                "bounds-checking" | "boundschecking" => {
                    self.bounds_checking = BoundsCheckingMode::BoundsChecking
                }
                other => log::warn!("ignoring WASMJIT_BOUNDS_CHECKING={}", other),
            }
        }
        if let Some(size) = lookup("WASMJIT_MAX_INLINE_SIZE").and_then(|s| s.parse().ok()) {
            self.max_inline_size = size;
        }
        if let Some(depth) = lookup("WASMJIT_MAX_INLINE_DEPTH").and_then(|s| s.parse().ok()) {
            self.max_inline_depth = depth;
        }
        if let Some(size) = lookup("WASMJIT_MAX_CALLER_SIZE").and_then(|s| s.parse().ok()) {
            self.max_caller_size_for_inlining = size;
        }
        if let Some(flag) = lookup("WASMJIT_TIER_UP") {
            self.enable_tier_up = matches!(flag.as_str(), "1" | "true" | "on");
        }
        if let Some(flag) = lookup("WASMJIT_OSR") {
            self.enable_osr = matches!(flag.as_str(), "1" | "true" | "on");
        }
        self
    }

    /// Bytes an access may reach past the bound without an explicit check.
    pub fn unchecked_reach(&self) -> u64 {
        match self.bounds_checking {
            BoundsCheckingMode::BoundsChecking => 0,
            BoundsCheckingMode::Signaling => self.guard_region_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    #[test]
    fn test_overlay_reads_known_keys() {
        let env: HashMap<&str, &str> = [
            ("WASMJIT_BOUNDS_CHECKING", "signaling"),
            ("WASMJIT_MAX_INLINE_DEPTH", "1"),
            ("WASMJIT_TIER_UP", "true"),
            ("WASMJIT_MAX_INLINE_SIZE", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let options = CompilerOptions::default().overlay(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(options.bounds_checking, BoundsCheckingMode::Signaling);
        assert_eq!(options.max_inline_depth, 1);
        assert!(options.enable_tier_up);
        assert_eq!(options.max_inline_size, CompilerOptions::default().max_inline_size);
        assert_eq!(options.unchecked_reach(), 4 << 30);
    }

    #[test]
    fn test_eligibility_predicates() {
        assert!(!SameInstance.can_clobber_instance(3));
        assert!(NeverInline.can_clobber_instance(3));
    }
}
