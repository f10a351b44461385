//! Command-line configuration for the proxy server
//!
//! Everything about backends lives in the JSON config file (see `borg::settings`); the
//! command line only says where that file is and how to serve.
use anyhow::anyhow;
use borg::client::PoolConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The JSON config file describing backends and discovery sources.
    #[arg(short = 'c', long, env = "PROXY_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    /// The port on which the proxy server will listen.
    #[arg(short = 'p', long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// The address on which the proxy and metrics servers bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Base64-url encoded 32-byte key for caller tokens. Overrides `auth_key` in the file.
    #[arg(long, env = "AUTH_KEY", hide_env_values = true)]
    pub auth_key: Option<String>,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long)]
    pub metrics: bool,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "borg")]
    pub metrics_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive per backend host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.config.exists() {
            return Err(anyhow!(
                "Config file '{}' does not exist",
                self.config.display()
            ));
        }
        Ok(self)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}
