//! Helpers shared by the unit tests.
//!
//! Every test compiles inside its own arena, the way an embedder hands each
//! function a scratch region that is dropped as a whole.
