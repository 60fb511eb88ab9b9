//! Stable exit codes for `genpipe` commands.

/// Run succeeded, or the config is valid.
pub const OK: i32 = 0;
/// A stage failed or cleanup failed.
pub const FAILED: i32 = 1;
/// Invalid configuration or usage.
pub const INVALID: i32 = 2;
/// Another run holds the pipeline lock.
pub const BUSY: i32 = 3;
/// The run was cancelled.
pub const ABORTED: i32 = 4;
