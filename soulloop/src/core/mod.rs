//! Deterministic, pure logic shared by the loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod decision;
pub mod extractor;
pub mod heuristics;
pub mod ids;
pub mod soul;
pub mod types;
