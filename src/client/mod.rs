//! Client connection layer

pub mod cluster_client;
pub mod connection;
pub mod pool;
pub mod raw_connection;

pub use cluster_client::ClusterClient;
pub use connection::{NodeConnection, NodeConnectionExt};
pub use pool::{Connector, NodePool, PooledConnection};
pub use raw_connection::{ConnectionFactory, RawConnection};
