//! Dispatcher configuration
//!
//! `TunnelArgs` is meant to be `#[command(flatten)]`-ed into the host
//! binary's CLI; it converts into a validated `DispatcherConfig`.

use std::time::Duration;

use clap::Args;

use lattice_common::{DEFAULT_DIAL_TIMEOUT_SECS, DEFAULT_MAX_IDLE_PER_HOST};

use crate::error::ConfigError;

/// Settings applied to every transport the dispatcher builds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Timeout for opening each logical connection through a tunnel
    pub dial_timeout: Duration,
    /// Idle pooled connections kept per host in each transport
    pub max_idle_per_host: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
        }
    }
}

impl DispatcherConfig {
    /// Reject settings that would make every transport unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dial_timeout.is_zero() {
            return Err(ConfigError::ZeroDialTimeout);
        }
        if self.max_idle_per_host == 0 {
            return Err(ConfigError::ZeroIdlePool);
        }
        Ok(())
    }
}

/// Command-line and environment settings for tunnel dispatch
#[derive(Args, Clone, Debug)]
pub struct TunnelArgs {
    /// Seconds allowed to open a connection through an agent tunnel
    #[arg(
        long = "tunnel-dial-timeout-secs",
        env = "TUNNEL_DIAL_TIMEOUT_SECS",
        default_value_t = DEFAULT_DIAL_TIMEOUT_SECS
    )]
    pub dial_timeout_secs: u64,

    /// Idle connections pooled per host for each cluster transport
    #[arg(
        long = "tunnel-max-idle-per-host",
        env = "TUNNEL_MAX_IDLE_PER_HOST",
        default_value_t = DEFAULT_MAX_IDLE_PER_HOST
    )]
    pub max_idle_per_host: usize,
}

impl TryFrom<TunnelArgs> for DispatcherConfig {
    type Error = ConfigError;

    fn try_from(args: TunnelArgs) -> Result<Self, Self::Error> {
        let config = DispatcherConfig {
            dial_timeout: Duration::from_secs(args.dial_timeout_secs),
            max_idle_per_host: args.max_idle_per_host,
        };
        config.validate()?;
        Ok(config)
    }
}
