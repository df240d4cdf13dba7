//! Node configuration
//!
//! A node is a master unless it is given an `upstream` control endpoint to
//! log in to.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use log::warn;
use serde::Serialize;

use crate::cache::DEFAULT_CACHE_BYTES;
use crate::cluster::membership_protocol::peer::{DEFAULT_LOGIN_TIMEOUT, DEFAULT_RECONNECT_INTERVAL};
use crate::coordinator::RedirectPolicy;
use crate::errors::{ConfigError, ServerError};
use crate::origin::{MirrorHandle, DEFAULT_ORIGIN_TIMEOUT};
use crate::ring::DEFAULT_REPLICAS;
use crate::shutdown::{DEFAULT_DRAIN_GRACE, DEFAULT_DRAIN_POLL};
use crate::telemetry::DEFAULT_SEND_QUEUE_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts peers and redirects file requests
    Master,
    /// Caches and serves files
    Peer,
}

/// Everything a node needs to start
///
/// # Example
/// ```rust
/// # use edge_cdn::config::{NodeConfigBuilder, Role};
/// let config = NodeConfigBuilder::default()
///     .address("127.0.0.1:5000")
///     .mirror("http://origin.example/")
///     .build()
///     .unwrap();
/// assert_eq!(config.role(), Role::Master);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct NodeConfig {
    /// HTTP listen address
    #[builder(setter(into), default = r#""0.0.0.0:5000".to_string()"#)]
    pub address: String,

    /// Control channel listen address, master only
    #[builder(setter(into), default = r#""0.0.0.0:5001".to_string()"#)]
    pub control_address: String,

    /// Origin base URL. Peers learn it from the master
    #[builder(setter(into, strip_option), default)]
    pub mirror: Option<String>,

    /// Master control endpoint, `host:port`
    #[builder(setter(into, strip_option), default)]
    pub upstream: Option<String>,

    /// Shared membership token, empty disables the check
    #[builder(setter(into), default)]
    pub token: String,

    #[builder(default = "DEFAULT_REPLICAS")]
    pub replicas: usize,

    #[builder(default = "DEFAULT_CACHE_BYTES")]
    pub cache_bytes: usize,

    /// Durable log of the peers' reports. Stdout when missing or `-`
    #[builder(setter(into, strip_option), default)]
    pub log_file: Option<PathBuf>,

    #[builder(default)]
    pub redirect_policy: RedirectPolicy,

    #[builder(default = "DEFAULT_ORIGIN_TIMEOUT")]
    pub origin_timeout: Duration,

    #[builder(default = "DEFAULT_RECONNECT_INTERVAL")]
    pub reconnect_interval: Duration,

    /// Bound on a peer's connect plus login round trip
    #[builder(default = "DEFAULT_LOGIN_TIMEOUT")]
    pub login_timeout: Duration,

    #[builder(default = "DEFAULT_SEND_QUEUE_CAPACITY")]
    pub send_queue_capacity: usize,

    #[builder(default = "DEFAULT_DRAIN_GRACE")]
    pub drain_grace: Duration,

    #[builder(default = "DEFAULT_DRAIN_POLL")]
    pub drain_poll: Duration,
}

impl From<NodeConfigBuilderError> for ConfigError {
    fn from(err: NodeConfigBuilderError) -> Self {
        ConfigError::Builder(err.to_string())
    }
}

impl From<NodeConfigBuilderError> for ServerError {
    fn from(err: NodeConfigBuilderError) -> Self {
        ServerError::Config(err.into())
    }
}

impl NodeConfig {
    pub fn role(&self) -> Role {
        match self.upstream {
            Some(_) => Role::Peer,
            None => Role::Master,
        }
    }

    /// Checks the values a node cannot start without
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_address(&self.address)?;
        if self.replicas == 0 {
            return Err(ConfigError::NoReplicas);
        }
        if self.cache_bytes == 0 {
            return Err(ConfigError::NoCacheBudget);
        }

        match &self.upstream {
            None => {
                parse_address(&self.control_address)?;
                let mirror = self.mirror.as_deref().ok_or(ConfigError::MissingMirror)?;
                MirrorHandle::parse(mirror)?;
            }
            Some(upstream) => {
                let valid = upstream
                    .rsplit_once(':')
                    .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                    .unwrap_or(false);
                if !valid {
                    return Err(ConfigError::InvalidAddress(upstream.clone()));
                }
                if self.mirror.is_some() {
                    warn!("Mirror is ignored on peers, the master's one is used");
                }
            }
        }
        Ok(())
    }
}

/// Cache budget in bytes from a size in MiB
pub fn cache_bytes_from_mib(mib: usize) -> Result<usize, ConfigError> {
    mib.checked_mul(1 << 20)
        .ok_or(ConfigError::CacheBudgetTooLarge(mib))
}

pub fn parse_address(address: &str) -> Result<SocketAddr, ConfigError> {
    address
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(address.to_string()))
}
