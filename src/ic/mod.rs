// Inline caches are small patchable stubs the baseline tier reserves at property access
// sites. A StubSite describes one site: what it does, which registers carry the receiver and
// the value, which registers are live across it, where the reserved bytes are and where the
// slow path starts. The generator specialises a site for one observed structure or type and
// either returns a stub that exactly fills the reservation or declines; declining is not an
// error and the caller keeps the unspecialised path. PatchRegion publishes stubs atomically.

//! Monomorphic inline cache generation.

pub mod generator;
pub mod layout;
pub mod patch;
pub mod site;

pub use generator::{
    can_generate_self_property_replace, generate_array_length, generate_self_in_access,
    generate_self_property_access, generate_self_property_replace, generate_string_length,
    is_cacheable_array_length, is_cacheable_string_length, InlineStub,
};
pub use layout::{PropertyOffset, StructureId};
pub use patch::{PatchError, PatchRegion};
pub use site::{AccessType, CacheType, StubSite};
