//! Utility modules

pub mod error;
pub mod resp;

pub use error::{
    ClientError, ClusterError, CommandError, ConnectionError, ProtocolError, Result,
};
pub use resp::{encode, RespDecoder, RespEncoder, RespValue};
