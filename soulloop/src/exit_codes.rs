//! Stable exit codes for soulloop CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments/config or any other error.
pub const INVALID: i32 = 1;
/// `soulloop run` refused to launch because the loop is paused.
pub const PAUSED: i32 = 2;
/// The soul (or bug) does not exist.
pub const NOT_FOUND: i32 = 3;
/// A soul already exists for the project path, or already has an agent in flight.
pub const CONFLICT: i32 = 4;
