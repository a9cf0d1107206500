//! Pipelined command execution across a cluster

pub mod builders;
pub mod command_table;
pub mod commands;
pub mod executor;
pub mod response;

pub use command_table::{CommandSpec, CommandTable, KeyPosition};
pub use commands::{HashCommands, KeyCommands, ListCommands, Queue, StringCommands};
pub use executor::{ClusterPipeline, DEFAULT_MAX_REDIRECT_PASSES};
pub use response::{Builder, Reply, Response};
