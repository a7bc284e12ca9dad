//! Stable exit codes for convey CLI commands.

/// Deployment (or extraction) succeeded.
pub const OK: i32 = 0;
/// Any failure without a more specific code (bad input, script failure, provider error).
pub const FAILED: i32 = 1;
/// The stack operation rolled back.
pub const ROLLED_BACK: i32 = 2;
/// The provider denied an operation.
pub const PERMISSION_DENIED: i32 = 3;
/// The run was cancelled or a wait timed out.
pub const CANCELLED: i32 = 4;
