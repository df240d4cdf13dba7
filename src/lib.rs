//! Self-organizing CDN edge layer
//!
//! A set of peer nodes cooperatively cache and serve files fetched from an
//! origin ("mirror") site, coordinated by a master over a persistent control
//! channel.
//!
//! - The master accepts peer logins, keeps the member list and pushes every
//!   change to all peers ([cluster::membership_protocol])
//! - A consistent-hash ring assigns each key to exactly one peer, every
//!   node derives the same assignment from the same member list ([ring])
//! - Each peer owns a byte-bounded cache where concurrent misses on a key
//!   share a single origin fetch ([cache])
//!
//! A file request hitting the master is redirected to the peer owning the
//! key; the peer serves it from its cache and reports it back to the
//! master, which appends the report to its durable log.
//!
//! # Running a group
//!
//! ```rust,no_run
//! use edge_cdn::prelude::*;
//!
//! # async fn run() -> Result<(), ServerError> {
//! let master = NodeConfigBuilder::default()
//!     .address("0.0.0.0:5000")
//!     .control_address("0.0.0.0:5001")
//!     .mirror("http://origin.example/")
//!     .build()?;
//! let server = Server::new(master)?;
//! let listeners = server.bind().await?;
//! server.run(listeners).await?;
//! # Ok(())
//! # }
//! ```
//!
//! A peer only needs the master's control endpoint, it learns the mirror
//! and the member list when it logs in:
//!
//! ```rust,no_run
//! # use edge_cdn::prelude::*;
//! # async fn run() -> Result<(), ServerError> {
//! let peer = NodeConfigBuilder::default()
//!     .address("0.0.0.0:6000")
//!     .upstream("master.local:5001")
//!     .build()?;
//! let server = Server::new(peer)?;
//! let listeners = server.bind().await?;
//! server.run(listeners).await?;
//! # Ok(())
//! # }
//! ```
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::missing_crate_level_docs)]

pub mod app_data;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod http;
pub mod origin;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod shutdown;
pub mod telemetry;

pub mod prelude {
    pub use super::app_data::AppData;
    pub use super::cache::{CacheGroup, CacheStats};
    pub use super::cluster::membership_protocol::master::MasterControl;
    pub use super::cluster::membership_protocol::peer::PeerClient;
    pub use super::cluster::registry::PeerRegistry;
    pub use super::config::{cache_bytes_from_mib, NodeConfig, NodeConfigBuilder, Role};
    pub use super::coordinator::{Coordinator, FileRequest, FileResponse, RedirectPolicy};
    pub use super::errors::{
        ConfigError, CoordinatorError, FetchError, MembershipError, RingError, ServerError,
    };
    pub use super::origin::{CachedResponse, Fetcher, MirrorHandle, OriginFetcher};
    pub use super::ring::{HashRing, SharedRing};
    pub use super::server::{Listeners, Server};
    pub use super::shutdown::{wait_for_signals, CloseMode, CloseOutcome, ServerState};
    pub use super::telemetry::{FileLogSink, LogRecord, LogSink, MemoryLogSink, SendQueue};
}
