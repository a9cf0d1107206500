//! Command-line argument parsing

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Run commands against a Valkey/Redis cluster through one pipeline
#[derive(Parser, Debug, Clone)]
#[command(name = "valkey-cluster-pipeline")]
#[command(version, about, long_about = None)]
#[command(disable_help_flag = true)]
#[allow(clippy::manual_non_exhaustive)]
pub struct CliArgs {
    /// Print help information
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: (),

    /// Command lines to pipeline, one per argument (e.g. "SET k v" "GET k")
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub commands: Vec<String>,

    // ===== Connection Options =====
    /// Seed hostname (can be specified multiple times, host or host:port)
    #[arg(short = 'h', long = "host", default_value = "127.0.0.1", action = clap::ArgAction::Append)]
    pub hosts: Vec<String>,

    /// Port for seeds given without one
    #[arg(short = 'p', long = "port", default_value_t = 6379)]
    pub port: u16,

    /// Password for AUTH command
    #[arg(short = 'a', long = "auth")]
    pub password: Option<String>,

    /// Username for ACL AUTH (requires --auth)
    #[arg(long = "user")]
    pub username: Option<String>,

    /// Database number to SELECT
    #[arg(long = "dbnum")]
    pub dbnum: Option<u32>,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long = "tls")]
    pub tls: bool,

    /// Skip TLS certificate verification (insecure)
    #[arg(long = "tls-skip-verify")]
    pub tls_skip_verify: bool,

    /// CA certificate file for TLS
    #[arg(long = "tls-ca-cert")]
    pub tls_ca_cert: Option<PathBuf>,

    /// Client certificate file for TLS
    #[arg(long = "tls-cert")]
    pub tls_cert: Option<PathBuf>,

    /// Client private key file for TLS
    #[arg(long = "tls-key")]
    pub tls_key: Option<PathBuf>,

    /// Server Name Indication for TLS
    #[arg(long = "tls-sni")]
    pub tls_sni: Option<String>,

    // ===== Timing Options =====
    /// Connection timeout in milliseconds
    #[arg(long = "connect-timeout-ms", default_value_t = 2000)]
    pub connect_timeout_ms: u64,

    /// Socket read/write timeout in milliseconds
    #[arg(long = "timeout-ms", default_value_t = 2000)]
    pub timeout_ms: u64,

    // ===== Cluster Options =====
    /// Which nodes may serve read-only commands
    #[arg(long = "rfr", value_enum, default_value_t = ReadPreference::Master)]
    pub read_preference: ReadPreference,

    /// Read passes per batch before giving up on MOVED/ASK
    #[arg(long = "max-redirects", default_value_t = 20)]
    pub max_redirects: u32,

    /// Background topology refresh period in seconds (0 = off)
    #[arg(long = "refresh-interval-secs", default_value_t = 0)]
    pub refresh_interval_secs: u64,

    /// Idle connections kept per node
    #[arg(long = "max-idle", default_value_t = 8)]
    pub max_idle: usize,

    /// Accept CLUSTER SLOTS replies that leave slots unassigned
    #[arg(long = "allow-partial-coverage")]
    pub allow_partial_coverage: bool,

    // ===== Output Options =====
    /// Print results as JSON
    #[arg(long = "json")]
    pub json: bool,

    /// Quiet mode (errors only)
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Which role may serve a routed read
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPreference {
    /// Masters only
    #[default]
    Master,
    /// A replica of the owning shard, the master when it has none
    Replica,
    /// Any node of the owning shard
    Either,
}

impl ReadPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPreference::Master => "master",
            ReadPreference::Replica => "replica",
            ReadPreference::Either => "either",
        }
    }
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate argument combinations
    pub fn validate(&self) -> Result<(), String> {
        // Username requires password
        if self.username.is_some() && self.password.is_none() {
            return Err("--user requires --auth to be set".to_string());
        }

        // TLS cert requires TLS key
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err("--tls-cert and --tls-key must both be specified".to_string());
        }

        if self.max_redirects == 0 {
            return Err("--max-redirects must be at least 1".to_string());
        }

        if self.timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err("timeouts must be greater than zero".to_string());
        }

        if self.quiet && self.verbose {
            return Err("--quiet and --verbose are mutually exclusive".to_string());
        }

        Ok(())
    }

    /// Command lines split into words, blank lines dropped
    pub fn command_lines(&self) -> Vec<Vec<String>> {
        self.commands
            .iter()
            .map(|line| line.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|words| !words.is_empty())
            .collect()
    }
}
