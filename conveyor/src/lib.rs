//! Resumable issue-to-pull-request orchestrator.
//!
//! A run takes one tracked issue through a fixed pipeline (intake, plan
//! validation, per-task implementation with a quality loop, a test loop,
//! docs, publish, a review loop, finalize), delegating each unit of work to an
//! external coding agent. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (workflow state machine, caps,
//!   convergence, rate-limit detection, scope classification). No I/O.
//! - **[`io`]**: Side-effecting adapters (filesystem, git, executor process,
//!   issue tracker). Isolated behind traits so tests can script them.
//!
//! Orchestration modules ([`stage`], [`refine`], [`controller`], [`batch`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod batch;
pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod refine;
pub mod stage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
