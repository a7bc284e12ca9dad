//! Deployment-execution agent.
//!
//! Given a package and a set of deployment variables, convey runs an ordered
//! list of install steps ("conventions") against a shared deployment context.
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (variables, context, service
//!   message codec, stack vocabulary). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (child processes, archives, config
//!   files, the AWS CLI). Isolated behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`pipeline`], [`stack`], [`conventions`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod conventions;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod stack;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
