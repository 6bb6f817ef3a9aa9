//! Deterministic, pure logic shared by the orchestrator.
//!
//! Nothing here touches the filesystem, spawns processes or reads the clock.
//! Callers pass in paths, timestamps and parsed outputs.

pub mod convergence;
pub mod envelope;
pub mod failures;
pub mod intake;
pub mod iteration_cap;
pub mod rate_limit;
pub mod scope;
pub mod types;
pub mod workflow;
