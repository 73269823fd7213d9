//! Configuration loading and validation.
//!
//! Every value is read from an environment variable prefixed with `CERTMUX_`, e.g.
//! `CERTMUX_LISTEN_ADDR=0.0.0.0:8443`. Unset variables fall back to their defaults.

use crate::{Error, certificate_authority::validate_hostname};
use serde::Deserialize;
use std::{net::SocketAddr, time::Duration};

const ENV_PREFIX: &str = "CERTMUX";

/// Service configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Config {
    /// The single address both protocols are served on.
    pub listen_addr: SocketAddr,

    /// Bound on classifying a connection, and separately on its TLS handshake.
    pub handshake_timeout_ms: u64,

    /// How long in-flight connections may keep running once shutdown starts.
    pub grace_period_ms: u64,

    /// Maximum number of cached leaf certificates. Unbounded when unset.
    pub cache_capacity: Option<u64>,

    /// Certificate name used for TLS clients that send no server name. Empty disables it.
    pub fallback_server_name: String,

    /// Default tracing filter, overridden by `RUST_LOG`.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            handshake_timeout_ms: 5_000,
            grace_period_ms: 10_000,
            cache_capacity: None,
            fallback_server_name: "localhost".into(),
            log_level: "info".into(),
        }
    }
}

impl Config {
    /// Load and validate configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or a value is out of range.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_source(config::Environment::with_prefix(ENV_PREFIX))
    }

    pub(crate) fn from_source(env: config::Environment) -> Result<Self, Error> {
        let cfg: Self = config::Config::builder()
            .add_source(env)
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks every value, returning a descriptive error for the first invalid one.
    pub fn validate(&self) -> Result<(), Error> {
        if self.handshake_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "handshake_timeout_ms must be > 0".into(),
            ));
        }
        if self.grace_period_ms == 0 {
            return Err(Error::InvalidConfig("grace_period_ms must be > 0".into()));
        }
        if self.cache_capacity == Some(0) {
            return Err(Error::InvalidConfig("cache_capacity must be > 0".into()));
        }
        if let Some(name) = self.fallback_server_name() {
            validate_hostname(name).map_err(|_| {
                Error::InvalidConfig(format!("fallback_server_name {name:?} is not a hostname"))
            })?;
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// The fallback server name, or `None` if disabled.
    pub fn fallback_server_name(&self) -> Option<&str> {
        Some(self.fallback_server_name.as_str()).filter(|name| !name.is_empty())
    }
}
