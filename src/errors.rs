//! Repository of all error types for this crate using [thiserror]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the consistent-hash [crate::ring::HashRing]
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum RingError {
    #[error("no peers registered in the ring")]
    EmptyRing,
}

/// Errors of the membership protocol and of the peer registry
/// ([crate::cluster::registry::PeerRegistry])
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum MembershipError {
    #[error("there is no peer to choose from in this group")]
    NoPeers,

    #[error("login token does not match")]
    AuthMismatch,

    #[error("'self' not found in master response")]
    MissingSelf,

    #[error("control channel lost: {0}")]
    ControlChannelLost(String),

    #[error("broadcast stopped at peer {peer}: {reason}")]
    PartialBroadcast { peer: String, reason: String },

    #[error("control message codec error: {0}")]
    Codec(String),

    #[error("unknown peer {0}")]
    UnknownPeer(String),
}

impl From<std::io::Error> for MembershipError {
    fn from(err: std::io::Error) -> Self {
        MembershipError::ControlChannelLost(err.to_string())
    }
}

impl From<serde_json::Error> for MembershipError {
    fn from(err: serde_json::Error) -> Self {
        MembershipError::Codec(err.to_string())
    }
}

/// Origin fetch errors.
///
/// Single-flight followers receive a clone of the leader's error, so this
/// type has to stay [Clone]
#[derive(Error, Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum FetchError {
    #[error("origin unreachable: {0}")]
    OriginUnreachable(String),

    #[error("origin answered with status {0}")]
    OriginError(u16),

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("cached response encoding error: {0}")]
    Encoding(String),
}

impl From<bincode::Error> for FetchError {
    fn from(err: bincode::Error) -> Self {
        FetchError::Encoding(err.to_string())
    }
}

/// Errors surfaced to a file request by the [crate::coordinator::Coordinator]
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum CoordinatorError {
    #[error("routing error")]
    Ring(#[from] RingError),

    #[error("routing error")]
    Membership(#[from] MembershipError),

    #[error("fetch error")]
    Fetch(#[from] FetchError),
}

impl CoordinatorError {
    /// HTTP status used to answer the request that triggered the error
    pub fn status_code(&self) -> u16 {
        match self {
            CoordinatorError::Ring(_) | CoordinatorError::Membership(_) => 503,
            CoordinatorError::Fetch(FetchError::InvalidKey(_)) => 400,
            CoordinatorError::Fetch(FetchError::OriginUnreachable(_))
            | CoordinatorError::Fetch(FetchError::OriginError(_)) => 502,
            CoordinatorError::Fetch(FetchError::Encoding(_)) => 500,
        }
    }

    /// Message sent back in the body of an error response
    pub fn detail(&self) -> String {
        match self {
            CoordinatorError::Ring(err) => err.to_string(),
            CoordinatorError::Membership(err) => err.to_string(),
            CoordinatorError::Fetch(err) => err.to_string(),
        }
    }
}

/// Errors found while validating a [crate::config::NodeConfig]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("a master node needs a mirror base URL")]
    MissingMirror,

    #[error("invalid mirror URL {0:?}")]
    InvalidMirror(String),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("replicas must be at least 1")]
    NoReplicas,

    #[error("cache byte budget must be greater than 0")]
    NoCacheBudget,

    #[error("cache budget of {0} MiB does not fit in memory")]
    CacheBudgetTooLarge(usize),

    #[error("builder")]
    Builder(String),
}

/// Represent errors that happen during the [crate::server::Server] setup and run
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ServerError {
    #[error("bind")]
    Bind(String),

    #[error("config")]
    Config(#[from] ConfigError),

    #[error("membership")]
    Membership(#[from] MembershipError),

    #[error("log sink")]
    LogSink(String),

    #[error("origin http client")]
    HttpClient(String),

    #[error("Run")]
    Run,
}
