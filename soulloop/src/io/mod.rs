//! I/O adapters used by the iteration loop.

pub mod config;
pub mod executor;
pub mod git;
pub mod pause;
pub mod process;
pub mod prompt;
pub mod store;
