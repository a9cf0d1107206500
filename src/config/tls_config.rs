//! TLS configuration

use std::path::PathBuf;

/// TLS settings applied to every node connection
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub skip_verify: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Overrides the node host as server name
    pub sni: Option<String>,
}

impl TlsConfig {
    /// Check if client certificate authentication is configured
    pub fn has_client_cert(&self) -> bool {
        self.client_cert.is_some() && self.client_key.is_some()
    }

    /// Server name to present when connecting to `host`
    pub fn server_name<'a>(&'a self, host: &'a str) -> &'a str {
        self.sni.as_deref().unwrap_or(host)
    }
}
