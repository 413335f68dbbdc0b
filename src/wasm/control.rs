//! Control frames of the builder.
//!
//! One [`ControlData`] per open `block`, `loop`, `if`, `try` or catch
//! clause, plus the function-level frame. Kind changes only go forward:
//! `If` becomes `Block` at `else`, `Try` becomes `Catch` at the first
//! handler, and a `Catch` may start another clause of the same try.

use super::module_info::ValType;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{BlockId, ValueId, VariableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchKind {
    Catch,
    CatchAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    TopLevel,
    Block,
    Loop,
    If,
    Try,
    Catch {
        kind: CatchKind,
        /// Holds the caught exception object for `rethrow`.
        exception: VariableId,
    },
}

#[derive(Debug, Clone)]
pub struct ControlData {
    pub kind: ControlKind,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    /// Block control reaches after `end`.
    pub continuation: BlockId,
    /// Loop body head, or the not-taken side of an `if` before `else`.
    pub special: Option<BlockId>,
    /// Join values of branches to this frame: the loop parameters at the
    /// body head for loops, the results at the continuation otherwise.
    pub phis: Vec<ValueId>,
    /// Operand stack height below this frame's entries.
    pub stack_height: usize,
    /// First call site of a try region.
    pub try_start: u32,
    /// One past the last call site of a try region, set when it closes.
    pub try_end: u32,
    pub try_depth: u32,
    pub loop_index: Option<u32>,
    /// Parameter values of an `if`, pushed again at `else`.
    pub else_params: Vec<ValueId>,
}

impl ControlData {
    pub fn new(
        kind: ControlKind,
        params: Vec<ValType>,
        results: Vec<ValType>,
        continuation: BlockId,
        stack_height: usize,
    ) -> Self {
        Self {
            kind,
            params,
            results,
            continuation,
            special: None,
            phis: Vec::new(),
            stack_height,
            try_start: 0,
            try_end: 0,
            try_depth: 0,
            loop_index: None,
            else_params: Vec::new(),
        }
    }

    pub fn is_loop(&self) -> bool {
        self.kind == ControlKind::Loop
    }

    pub fn is_try(&self) -> bool {
        self.kind == ControlKind::Try
    }

    pub fn exception(&self) -> Option<VariableId> {
        match self.kind {
            ControlKind::Catch { exception, .. } => Some(exception),
            _ => None,
        }
    }

    /// Types a branch to this frame carries.
    pub fn branch_types(&self) -> &[ValType] {
        if self.is_loop() {
            &self.params
        } else {
            &self.results
        }
    }

    /// Block a branch to this frame jumps to.
    pub fn branch_target(&self) -> BlockId {
        match (self.kind, self.special) {
            (ControlKind::Loop, Some(body)) => body,
            _ => self.continuation,
        }
    }

    /// `else` turns an `if` into a plain block.
    pub fn convert_if_to_block(&mut self) -> CompileResult<()> {
        if self.kind != ControlKind::If {
            return Err(CompileError::validation(format!(
                "else without matching if, frame is {:?}",
                self.kind
            )));
        }
        self.kind = ControlKind::Block;
        self.special = None;
        Ok(())
    }

    /// Enter a handler clause. Returns whether this closes the try region.
    pub fn convert_to_catch(&mut self, kind: CatchKind, exception: VariableId) -> CompileResult<bool> {
        let closes_region = match self.kind {
            ControlKind::Try => true,
            ControlKind::Catch { kind: CatchKind::Catch, .. } => false,
            other => {
                return Err(CompileError::validation(format!(
                    "catch without matching try, frame is {:?}",
                    other
                )))
            }
        };
        self.kind = ControlKind::Catch { kind, exception };
        Ok(closes_region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: ControlKind) -> ControlData {
        ControlData::new(kind, vec![ValType::I32], vec![ValType::I64], BlockId(1), 0)
    }

    #[test]
    fn test_if_converts_once() {
        let mut data = frame(ControlKind::If);
        data.special = Some(BlockId(2));
        assert!(data.convert_if_to_block().is_ok());
        assert_eq!(data.kind, ControlKind::Block);
        assert_eq!(data.special, None);
        assert!(data.convert_if_to_block().is_err());
    }

    #[test]
    fn test_try_to_catch_closes_region_once() {
        let mut data = frame(ControlKind::Try);
        assert!(data.convert_to_catch(CatchKind::Catch, VariableId(0)).unwrap());
        assert!(!data.convert_to_catch(CatchKind::CatchAll, VariableId(1)).unwrap());
        assert_eq!(data.exception(), Some(VariableId(1)));
        assert!(data.convert_to_catch(CatchKind::Catch, VariableId(2)).is_err());
        assert!(frame(ControlKind::Block).convert_to_catch(CatchKind::Catch, VariableId(0)).is_err());
    }

    #[test]
    fn test_branch_target_of_loop_is_body() {
        let mut data = frame(ControlKind::Loop);
        data.special = Some(BlockId(5));
        assert_eq!(data.branch_target(), BlockId(5));
        assert_eq!(data.branch_types(), &[ValType::I32]);

        let block = frame(ControlKind::Block);
        assert_eq!(block.branch_target(), BlockId(1));
        assert_eq!(block.branch_types(), &[ValType::I64]);
    }
}
