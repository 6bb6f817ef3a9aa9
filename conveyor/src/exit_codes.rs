//! Stable exit codes for conveyor CLI commands.

/// Command succeeded or the run completed.
pub const OK: i32 = 0;
/// A stage failed, or setup (git, tracker, filesystem) failed.
pub const FAILED: i32 = 1;
/// A refinement loop exceeded its iteration cap or test failures stopped converging.
pub const CAP_EXCEEDED: i32 = 2;
/// Invalid arguments, configuration, or resume document.
pub const CONFIG: i32 = 3;
