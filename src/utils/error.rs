//! Error types for valkey-cluster-pipeline

use std::io;
use thiserror::Error;

/// Top-level client error
///
/// Anything that aborts a call outright. Per-command failures inside a
/// pipeline are carried as [`CommandError`] values instead.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Pipeline state error: {0}")]
    PipelineState(String),
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsFailed(String),

    #[error("Connection to {0} closed")]
    Closed(String),

    #[error("I/O error on {address}: {source}")]
    Io { address: String, source: io::Error },
}

/// RESP protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed reply from {address}: {message}")]
    Malformed { address: String, message: String },

    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    #[error("Server error: {0}")]
    ServerError(String),
}

/// Cluster-related errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("No reachable node could describe the cluster topology")]
    NoReachableNode,

    #[error("Failed to parse CLUSTER SLOTS response: {0}")]
    ParseFailed(String),

    #[error("Cluster slots list is empty")]
    EmptySlots,

    #[error("Cluster slots have holes: {covered} of 16384 slots covered")]
    SlotHoles { covered: usize },

    #[error("Slot {0} has no assigned node")]
    UnassignedSlot(u16),

    #[error("Too many cluster redirections: gave up after {passes} passes")]
    TooManyRedirects { passes: u32 },

    #[error("Cluster client is shut down")]
    Shutdown,
}

/// Failure of a single command, stored as the command's result
///
/// Cloneable so a memoized failure can be handed out on every read of
/// a deferred response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// The server answered with an error reply (e.g. WRONGTYPE)
    #[error("{0}")]
    Server(String),

    /// The node serving this command failed during the batch
    #[error("connection failure: {0}")]
    Connection(String),

    /// The reply does not have the shape the command expects
    #[error("unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply { expected: String, actual: String },

    /// The batch was aborted before this command resolved
    #[error("batch aborted: {0}")]
    Aborted(String),

    /// Read before the pipeline was synced
    #[error("response not available before sync()")]
    Pending,
}

impl CommandError {
    pub(crate) fn unexpected(expected: &str, actual: impl std::fmt::Debug) -> Self {
        CommandError::UnexpectedReply {
            expected: expected.to_string(),
            actual: format!("{:?}", actual),
        }
    }
}

impl ClientError {
    /// Whether the error left topology possibly stale and a retry may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_) | ClientError::Cluster(ClusterError::UnassignedSlot(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
