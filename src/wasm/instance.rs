//! Byte offsets into runtime objects the generated code touches.
//!
//! The runtime owns these layouts; the builder only bakes the offsets into
//! loads and stores.

// Instance object.
pub const INSTANCE_MEMORY_BASE: i32 = 0x08;
pub const INSTANCE_MEMORY_BOUND: i32 = 0x10;
/// Pointer to an array of table pointers.
pub const INSTANCE_TABLES: i32 = 0x18;
/// Pointer to an array of [`IMPORT_ENTRY_SIZE`] import records.
pub const INSTANCE_IMPORTS: i32 = 0x20;
/// Cell state at or below which a store needs the barrier slow path.
pub const INSTANCE_BARRIER_THRESHOLD: i32 = 0x28;
/// Non-zero while the collector wants mutator stores fenced.
pub const INSTANCE_MUTATOR_FENCED: i32 = 0x29;
/// Pointer to the function-reference objects for ref.func.
pub const INSTANCE_FUNC_REFS: i32 = 0x30;
/// Globals, [`GLOBAL_SLOT_SIZE`] bytes each.
pub const INSTANCE_GLOBALS: i32 = 0x100;
pub const GLOBAL_SLOT_SIZE: i32 = 16;
/// Tier-up counters, one i32 per function.
pub const INSTANCE_TIER_UP_COUNTERS: i32 = 0x800;

// Import record.
pub const IMPORT_INSTANCE: i32 = 0;
pub const IMPORT_CODE: i32 = 8;
pub const IMPORT_ENTRY_SIZE: i32 = 16;

// Table object.
pub const TABLE_LENGTH: i32 = 0;
pub const TABLE_ENTRIES: i32 = 8;
/// Function table entries: signature, code, instance.
pub const TABLE_ENTRY_SIZE: i32 = 24;
pub const TABLE_ENTRY_SIGNATURE: i32 = 0;
pub const TABLE_ENTRY_CODE: i32 = 8;
pub const TABLE_ENTRY_INSTANCE: i32 = 16;

// Function reference object; same field order as a table entry.
pub const FUNC_REF_SIGNATURE: i32 = 0;
pub const FUNC_REF_CODE: i32 = 8;
pub const FUNC_REF_INSTANCE: i32 = 16;

// GC objects.
/// GC cell state byte.
pub const GC_CELL_STATE: i32 = 7;
pub const GC_OBJECT_PAYLOAD: i32 = 16;
pub const GC_ARRAY_LENGTH: i32 = 8;
/// Cell state of a fully marked object.
pub const GC_BLACK_THRESHOLD: i32 = 0;

// Exception object.
pub const EXCEPTION_TAG: i32 = 8;
pub const EXCEPTION_PAYLOAD: i32 = 16;

/// Log2 of the wasm page size.
pub const PAGE_SIZE_LOG2: i64 = 16;
