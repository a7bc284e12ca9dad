//! Side-effecting helpers: child processes, output routing, archives, config
//! files and the AWS CLI.

pub mod aws_cli;
pub mod config;
pub mod extractor;
pub mod process;
pub mod service_channel;
pub mod splitter;
