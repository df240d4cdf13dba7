//! Shared data for the node's handlers
//!
//! One [AppData] is built per node and handed, behind an [Arc], to the HTTP
//! handlers and the control-channel tasks. Nothing lives in process-wide
//! statics, so several nodes can run in the same process.

use std::sync::{Arc, OnceLock};

use crate::cache::CacheGroup;
use crate::cluster::membership_protocol::peer::PeerClient;
use crate::cluster::registry::PeerRegistry;
use crate::config::{NodeConfig, Role};
use crate::coordinator::Coordinator;
use crate::errors::ServerError;
use crate::origin::{MirrorHandle, OriginFetcher};
use crate::ring::SharedRing;
use crate::shutdown::ServerState;
use crate::telemetry::{FileLogSink, LogSink, SendQueue};

pub struct AppData {
    pub role: Role,
    pub state: Arc<ServerState>,
    pub ring: SharedRing,
    /// Only populated on the master
    pub registry: PeerRegistry,
    pub mirror: MirrorHandle,
    pub coordinator: Coordinator,
    pub send_queue: SendQueue,
    pub log_sink: Arc<dyn LogSink>,
    /// Set once a peer has joined
    pub peer: OnceLock<PeerClient>,
}

impl AppData {
    /// Builds the context described by `config`. The log sink is only
    /// opened on the master
    pub fn new(config: &NodeConfig) -> Result<AppData, ServerError> {
        let log_sink: Arc<dyn LogSink> = match config.role() {
            Role::Master => Arc::new(
                FileLogSink::open(config.log_file.as_deref())
                    .map_err(|err| ServerError::LogSink(err.to_string()))?,
            ),
            Role::Peer => Arc::new(FileLogSink::stdout()),
        };
        AppData::with_log_sink(config, log_sink)
    }

    pub fn with_log_sink(
        config: &NodeConfig,
        log_sink: Arc<dyn LogSink>,
    ) -> Result<AppData, ServerError> {
        let role = config.role();
        let state = Arc::new(ServerState::new(config.drain_grace, config.drain_poll));
        let ring = SharedRing::new(config.replicas);
        let registry = PeerRegistry::new();
        let send_queue = SendQueue::new(config.send_queue_capacity);

        let mirror = match (role, config.mirror.as_deref()) {
            (Role::Master, Some(mirror)) => MirrorHandle::new(Some(MirrorHandle::parse(mirror)?)),
            _ => MirrorHandle::default(),
        };

        let coordinator = match role {
            Role::Master => Coordinator::redirecting(
                ring.clone(),
                registry.clone(),
                config.redirect_policy,
            ),
            Role::Peer => {
                let fetcher = OriginFetcher::new(mirror.clone(), config.origin_timeout)
                    .map_err(|err| ServerError::HttpClient(err.to_string()))?;
                let group = CacheGroup::new(config.cache_bytes, Arc::new(fetcher));
                Coordinator::serving(group, Some(send_queue.clone()))
            }
        };

        Ok(AppData {
            role,
            state,
            ring,
            registry,
            mirror,
            coordinator,
            send_queue,
            log_sink,
            peer: OnceLock::new(),
        })
    }

    /// Public name of this node. Peers know it once they have joined
    pub fn self_name(&self) -> Option<String> {
        self.peer.get().and_then(PeerClient::self_name)
    }
}
