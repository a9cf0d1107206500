//! Client configuration derived from CLI arguments or built in code

use std::time::Duration;

use super::cli::{CliArgs, ReadPreference};
use super::tls_config::TlsConfig;
use crate::client::ConnectionFactory;
use crate::cluster::NodeAddress;
use crate::pipeline::DEFAULT_MAX_REDIRECT_PASSES;
use crate::utils::{ClientError, Result};

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub password: String,
    pub username: Option<String>,
}

/// Per-node connection pool sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle connections kept per node; extras are closed on release
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle: 8 }
    }
}

/// Complete client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // Connection
    pub seeds: Vec<NodeAddress>,
    pub auth: Option<AuthConfig>,
    pub tls: Option<TlsConfig>,
    pub dbnum: Option<u32>,
    pub connect_timeout: Duration,
    pub timeout: Duration,

    // Cluster
    pub read_preference: ReadPreference,
    pub max_redirect_passes: u32,
    pub refresh_interval: Option<Duration>,
    pub allow_partial_coverage: bool,
    pub pool: PoolConfig,

    /// Read timeout for blocking commands (`None` = wait forever)
    pub blocking_timeout: Option<Duration>,
}

impl ClientConfig {
    /// Defaults for everything but the seeds
    pub fn new(seeds: Vec<NodeAddress>) -> Self {
        Self {
            seeds,
            auth: None,
            tls: None,
            dbnum: None,
            connect_timeout: Duration::from_secs(2),
            timeout: Duration::from_secs(2),
            read_preference: ReadPreference::Master,
            max_redirect_passes: DEFAULT_MAX_REDIRECT_PASSES,
            refresh_interval: None,
            allow_partial_coverage: false,
            pool: PoolConfig::default(),
            blocking_timeout: None,
        }
    }

    /// Create configuration from CLI arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        args.validate().map_err(ClientError::Config)?;

        let seeds = args
            .hosts
            .iter()
            .map(|h| parse_seed(h, args.port))
            .collect::<Result<Vec<_>>>()?;

        let auth = args.password.as_ref().map(|p| AuthConfig {
            password: p.clone(),
            username: args.username.clone(),
        });

        let tls = if args.tls {
            Some(TlsConfig {
                skip_verify: args.tls_skip_verify,
                ca_cert: args.tls_ca_cert.clone(),
                client_cert: args.tls_cert.clone(),
                client_key: args.tls_key.clone(),
                sni: args.tls_sni.clone(),
            })
        } else {
            None
        };

        let refresh_interval =
            (args.refresh_interval_secs > 0).then(|| Duration::from_secs(args.refresh_interval_secs));

        Ok(Self {
            seeds,
            auth,
            tls,
            dbnum: args.dbnum,
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            timeout: Duration::from_millis(args.timeout_ms),
            read_preference: args.read_preference,
            max_redirect_passes: args.max_redirects,
            refresh_interval,
            allow_partial_coverage: args.allow_partial_coverage,
            pool: PoolConfig {
                max_idle: args.max_idle,
            },
            blocking_timeout: None,
        })
    }

    pub fn auth(mut self, password: impl Into<String>, username: Option<String>) -> Self {
        self.auth = Some(AuthConfig {
            password: password.into(),
            username,
        });
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_preference(mut self, preference: ReadPreference) -> Self {
        self.read_preference = preference;
        self
    }

    pub fn max_redirect_passes(mut self, passes: u32) -> Self {
        self.max_redirect_passes = passes;
        self
    }

    pub fn refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn allow_partial_coverage(mut self, allow: bool) -> Self {
        self.allow_partial_coverage = allow;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn blocking_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    /// Connection factory carrying the timeouts, TLS and credentials
    pub fn connection_factory(&self) -> ConnectionFactory {
        ConnectionFactory {
            connect_timeout: self.connect_timeout,
            read_timeout: self.timeout,
            write_timeout: self.timeout,
            tls_config: self.tls.clone(),
            auth_password: self.auth.as_ref().map(|a| a.password.clone()),
            auth_username: self.auth.as_ref().and_then(|a| a.username.clone()),
            dbnum: self.dbnum,
        }
    }
}

/// `host` or `host:port`; bare IPv6 literals take the default port
fn parse_seed(host: &str, default_port: u16) -> Result<NodeAddress> {
    if host.matches(':').count() == 1 {
        host.parse().map_err(ClientError::Config)
    } else {
        Ok(NodeAddress::new(host, default_port))
    }
}
