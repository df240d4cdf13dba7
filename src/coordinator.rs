//! Decides, per file request, between redirecting and serving
//!
//! A master never stores content: it answers with the URL of the peer
//! owning the key. A peer owns its cache and serves every key it receives,
//! reporting each request to the master through the send queue.

use std::str::FromStr;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::cache::CacheGroup;
use crate::cluster::registry::PeerRegistry;
use crate::errors::{CoordinatorError, FetchError};
use crate::origin::{validate_key, CachedResponse};
use crate::ring::SharedRing;
use crate::telemetry::{build_report, SendQueue};

/// How a master picks the peer a request is redirected to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectPolicy {
    /// Owner of the key on the ring
    #[default]
    ConsistentHash,
    /// Any registered peer
    Random,
}

impl FromStr for RedirectPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "consistent_hash" | "hash" => Ok(RedirectPolicy::ConsistentHash),
            "random" => Ok(RedirectPolicy::Random),
            other => Err(format!("unknown redirect policy {:?}", other)),
        }
    }
}

/// What the HTTP layer extracted from an inbound file request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRequest {
    /// URL path, also the cache key
    pub path: String,
    pub query: Option<String>,
    pub remote_addr: String,
    pub user_agent: Option<String>,
    pub header_data: Option<String>,
    pub header_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileResponse {
    /// Absolute URL of the peer serving the key
    Redirect(String),
    Content(CachedResponse),
}

#[derive(Clone)]
enum Mode {
    Redirect {
        ring: SharedRing,
        registry: PeerRegistry,
        policy: RedirectPolicy,
    },
    Serve {
        group: CacheGroup,
        reports: Option<SendQueue>,
    },
}

#[derive(Clone)]
pub struct Coordinator {
    mode: Mode,
}

impl Coordinator {
    /// Master mode
    pub fn redirecting(
        ring: SharedRing,
        registry: PeerRegistry,
        policy: RedirectPolicy,
    ) -> Coordinator {
        Coordinator {
            mode: Mode::Redirect {
                ring,
                registry,
                policy,
            },
        }
    }

    /// Peer mode. Every request is reported on `reports` when given
    pub fn serving(group: CacheGroup, reports: Option<SendQueue>) -> Coordinator {
        Coordinator {
            mode: Mode::Serve { group, reports },
        }
    }

    pub fn cache(&self) -> Option<&CacheGroup> {
        match &self.mode {
            Mode::Serve { group, .. } => Some(group),
            Mode::Redirect { .. } => None,
        }
    }

    pub async fn serve(&self, request: &FileRequest) -> Result<FileResponse, CoordinatorError> {
        match &self.mode {
            Mode::Redirect {
                ring,
                registry,
                policy,
            } => {
                let peer = match policy {
                    RedirectPolicy::ConsistentHash => ring.get(&request.path)?,
                    RedirectPolicy::Random => registry.pick_peer().await?,
                };
                Ok(FileResponse::Redirect(redirect_url(&peer, request)?))
            }
            Mode::Serve { group, reports } => {
                let result = load(group, &request.path).await;
                if let Some(reports) = reports {
                    reports.push(build_report(
                        &request.remote_addr,
                        &request.path,
                        result.is_ok(),
                        request.user_agent.as_deref(),
                        request.header_data.as_deref(),
                        request.header_type.as_deref(),
                    ));
                }
                Ok(FileResponse::Content(result?))
            }
        }
    }
}

async fn load(group: &CacheGroup, key: &str) -> Result<CachedResponse, FetchError> {
    validate_key(key)?;
    let blob = group.get(key).await?;
    CachedResponse::decode(&blob)
}

/// `peer` with the request's path and query
fn redirect_url(peer: &str, request: &FileRequest) -> Result<String, FetchError> {
    let mut url = Url::parse(peer).map_err(|_| FetchError::InvalidKey(request.path.clone()))?;
    url.set_path(&request.path);
    url.set_query(request.query.as_deref().filter(|query| !query.is_empty()));
    Ok(url.to_string())
}
