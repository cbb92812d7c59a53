//! Autonomous development loop for tracked projects ("souls").
//!
//! A soul is a project directory with objectives and requirements. The loop
//! alternates coding-agent runs on it: development iterations that fix one
//! thing, and test iterations that either declare the project
//! `PRODUCTION READY` or list what is left. Agent prose is mined for features,
//! bugs and test results, and everything is persisted so the loop survives a
//! restart.
//!
//! - **[`core`]**: Pure, deterministic logic (entity model, feedback
//!   extraction, next-step decisions). No I/O.
//! - **[`io`]**: Side effects (SQLite store, pause flag, config, agent
//!   processes, prompts, git).
//!
//! [`controller`] ties the two together and drives the loop.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
