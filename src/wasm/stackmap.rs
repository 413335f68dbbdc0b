// This module holds the records that let execution re-enter optimized code somewhere other
// than the function entry. A StackMap lists the values a call, check or tier-up patchpoint
// keeps alive for the runtime, in the fixed order locals, then per enclosing frame its
// operand stack cells followed by its caught exception if any, then the innermost frame's
// operand stack. ScratchLayout turns such a list of types into byte offsets inside the flat
// entry buffer. Every slot in a function's entry buffers has the same width: 16 bytes when
// the module can hold a vector anywhere, 8 otherwise. The width is fixed before the first
// capture, so a throw site and the catch entry it reaches agree on slot positions even when
// only the throw site has a vector on its operand stack. The handler table
// records one entry per catch clause or delegate, keyed by the half-open range of call-site
// indices the try region covered, and resolves the handler a throwing call site reaches.

//! Stack maps, entry buffer layout and the exception handler table.

use crate::ir::{Type, ValueId};
use serde::{Deserialize, Serialize};

/// Slot offsets inside a catch or OSR entry buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScratchLayout {
    types: Vec<Type>,
    slot_size: u32,
}

impl ScratchLayout {
    /// Slots just wide enough for `types`.
    pub fn new(types: Vec<Type>) -> Self {
        let slot_size = Self::slot_size_for(types.iter().any(|t| t.is_vector()));
        Self { types, slot_size }
    }

    pub fn with_slot_size(types: Vec<Type>, slot_size: u32) -> Self {
        Self { types, slot_size }
    }

    pub fn slot_size_for(vectors: bool) -> u32 {
        if vectors {
            16
        } else {
            8
        }
    }

    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn offset(&self, index: usize) -> u32 {
        index as u32 * self.slot_size
    }

    /// Bytes the whole buffer needs.
    pub fn size_bytes(&self) -> u32 {
        self.types.len() as u32 * self.slot_size
    }
}

/// Values a runtime entry at one program point must see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackMap {
    /// Call site index, or `None` for tier-up patchpoints.
    pub call_site: Option<u32>,
    /// Call, check or patchpoint that carries the values as children.
    pub owner: ValueId,
    /// Index of the first stack map child; earlier children are operands.
    pub first_child: u32,
    pub layout: ScratchLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    Catch { tag: u32 },
    CatchAll,
    /// Forward to the enclosing try at this depth; 0 leaves the function.
    Delegate { target_depth: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub kind: HandlerKind,
    /// First covered call site.
    pub start: u32,
    /// One past the last covered call site.
    pub end: u32,
    pub try_depth: u32,
    /// Index into the procedure's entrypoints; delegates have none.
    pub entrypoint: Option<usize>,
}

impl ExceptionHandler {
    pub fn covers(&self, call_site: u32) -> bool {
        (self.start..self.end).contains(&call_site)
    }
}

/// Handlers in the order their regions closed, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerTable {
    handlers: Vec<ExceptionHandler>,
}

impl HandlerTable {
    pub fn push(&mut self, handler: ExceptionHandler) -> u32 {
        self.handlers.push(handler);
        (self.handlers.len() - 1) as u32
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ExceptionHandler> {
        self.handlers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExceptionHandler> {
        self.handlers.iter()
    }

    /// Handler an exception with `tag` thrown at `call_site` lands in.
    ///
    /// `tag` is `None` for exceptions without a wasm tag, which only
    /// `catch_all` handles.
    pub fn lookup(&self, call_site: u32, tag: Option<u32>) -> Option<usize> {
        let mut delegated_to: Option<u32> = None;
        for (index, handler) in self.handlers.iter().enumerate() {
            if !handler.covers(call_site) {
                continue;
            }
            if let Some(depth) = delegated_to {
                if handler.try_depth > depth {
                    continue;
                }
            }
            match handler.kind {
                HandlerKind::Catch { tag: wanted } if Some(wanted) == tag => return Some(index),
                HandlerKind::Catch { .. } => {}
                HandlerKind::CatchAll => return Some(index),
                HandlerKind::Delegate { target_depth: 0 } => return None,
                HandlerKind::Delegate { target_depth } => delegated_to = Some(target_depth),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(kind: HandlerKind, start: u32, end: u32, try_depth: u32) -> ExceptionHandler {
        ExceptionHandler { kind, start, end, try_depth, entrypoint: None }
    }

    #[test]
    fn test_layout_widens_for_vectors() {
        let scalar = ScratchLayout::new(vec![Type::Int32, Type::Double]);
        assert_eq!(scalar.offset(1), 8);
        assert_eq!(scalar.size_bytes(), 16);

        let wide = ScratchLayout::new(vec![Type::Int32, Type::V128, Type::Int64]);
        assert_eq!(wide.slot_size(), 16);
        assert_eq!(wide.offset(2), 32);
        assert_eq!(wide.size_bytes(), 48);
    }

    #[test]
    fn test_lookup_prefers_innermost_matching_tag() {
        let mut table = HandlerTable::default();
        table.push(handler(HandlerKind::Catch { tag: 1 }, 2, 4, 2));
        table.push(handler(HandlerKind::Catch { tag: 0 }, 0, 6, 1));
        table.push(handler(HandlerKind::CatchAll, 0, 6, 1));

        assert_eq!(table.lookup(3, Some(1)), Some(0));
        assert_eq!(table.lookup(3, Some(0)), Some(1));
        assert_eq!(table.lookup(3, Some(7)), Some(2));
        assert_eq!(table.lookup(3, None), Some(2));
        assert_eq!(table.lookup(6, Some(0)), None);
    }

    #[test]
    fn test_delegate_skips_to_target_depth() {
        let mut table = HandlerTable::default();
        // try (depth 1) { try (depth 2) { try (depth 3) { call } delegate 1 } catch_all } catch_all
        table.push(handler(HandlerKind::Delegate { target_depth: 1 }, 1, 2, 3));
        table.push(handler(HandlerKind::CatchAll, 0, 3, 2));
        table.push(handler(HandlerKind::CatchAll, 0, 4, 1));

        assert_eq!(table.lookup(1, None), Some(2));
        assert_eq!(table.lookup(2, None), Some(1));

        let mut escaping = HandlerTable::default();
        escaping.push(handler(HandlerKind::Delegate { target_depth: 0 }, 0, 1, 1));
        escaping.push(handler(HandlerKind::CatchAll, 0, 1, 1));
        assert_eq!(escaping.lookup(0, None), None);
    }
}
