//! Cloud stack orchestration.
//!
//! - [`client`]: provider capability traits and [`client::CloudError`].
//! - [`orchestrator`]: describe/deploy/outputs plus the rollback watcher.
//! - [`poll`]: waits for an operation to reach a terminal state.

pub mod client;
pub mod errors;
pub mod orchestrator;
pub mod poll;

pub use client::{CloudError, CloudErrorKind, StackClient, StackClientFactory, StackDeployment};
pub use errors::StackError;
pub use orchestrator::{DeployAction, RollbackWatcher, StackOrchestrator, WarningLedger};
pub use poll::StackPoller;
