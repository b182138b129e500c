//! Engine-wide limits (§3.1), generalized from the teacher's `types/mod.rs` clamp
//! constants (`N_MAX_TABLE_SIZE`, `N_MAX_RECURSION_DEPTH`, `N_MAX_STACK_HEIGHT`, …).
//! Declarations exceeding these are rejected with `CompileError::OutOfBounds` before
//! import-compatibility checks run.

/// 64 Ki pages = 4 GiB, the Wasm32 address-space ceiling.
pub const MAX_MEMORY_PAGES: u32 = 65536;
/// 16 Mi elements.
pub const MAX_TABLE_SIZE: u32 = 16 * 1024 * 1024;
pub const MAX_LOCALS: u32 = 50_000;
pub const MAX_FUNCTION_SIGNATURES: u32 = u32::MAX;
pub const MAX_FUNCTIONS: u32 = u32::MAX;
pub const MAX_GLOBALS: u32 = u32::MAX;
