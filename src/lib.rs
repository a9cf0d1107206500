//! valkey-cluster-pipeline library
//!
//! Cluster-aware pipelined command execution for Valkey/Redis Cluster:
//! slot routing from a shared topology cache, deferred per-command results,
//! and MOVED/ASK handling with a bounded number of retry passes.

pub mod client;
pub mod cluster;
pub mod config;
pub mod pipeline;
pub mod utils;

#[cfg(test)]
mod testing;

pub use client::ClusterClient;
pub use config::{ClientConfig, ReadPreference};
pub use pipeline::{ClusterPipeline, Reply, Response};
pub use utils::{ClientError, CommandError, Result};
