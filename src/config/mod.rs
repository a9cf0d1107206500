//! Configuration module

pub mod cli;
pub mod client_config;
pub mod tls_config;

pub use cli::{CliArgs, ReadPreference};
pub use client_config::{AuthConfig, ClientConfig, PoolConfig};
pub use tls_config::TlsConfig;
