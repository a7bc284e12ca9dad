//! Deterministic, pure logic shared by the agent.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod cancel;
pub mod context;
pub mod error_code;
pub mod service_message;
pub mod stack;
pub mod variables;
