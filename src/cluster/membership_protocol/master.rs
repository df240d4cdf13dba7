//! Master side of the control channel
//!
//! Each control connection is a session that goes from awaiting a LOGIN to
//! active, and ends when the connection does. Joins and leaves are applied
//! to the [PeerRegistry] first, then published to the [SharedRing], then
//! broadcast to the other peers, one membership change at a time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::cluster::membership_protocol::peer_name;
use crate::cluster::registry::{PeerConnection, PeerRegistry, DEFAULT_WRITE_TIMEOUT};
use crate::errors::MembershipError;
use crate::protocol::{self, ControlMessage, LoginReply};
use crate::ring::SharedRing;
use crate::telemetry::{LogRecord, LogSink};

/// Pause after a failed accept, so a persistent error (EMFILE) does not spin
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum Session {
    AwaitingLogin,
    Active(String),
}

/// Accepts peers and keeps the group membership
#[derive(Clone)]
pub struct MasterControl {
    registry: PeerRegistry,
    ring: SharedRing,
    token: String,
    mirror: String,
    log_sink: Arc<dyn LogSink>,
    membership: Arc<Mutex<()>>,
    write_timeout: Duration,
}

impl MasterControl {
    /// An empty `token` accepts every LOGIN
    pub fn new(
        registry: PeerRegistry,
        ring: SharedRing,
        token: impl Into<String>,
        mirror: impl Into<String>,
        log_sink: Arc<dyn LogSink>,
    ) -> MasterControl {
        MasterControl {
            registry,
            ring,
            token: token.into(),
            mirror: mirror.into(),
            log_sink,
            membership: Arc::new(Mutex::new(())),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Peers that do not drain a control frame within `write_timeout` are
    /// evicted
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> MasterControl {
        self.write_timeout = write_timeout;
        self
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    /// Accept loop. Aborting the task running it drops every session
    pub async fn serve(&self, listener: TcpListener) -> Result<(), MembershipError> {
        if let Ok(local_addr) = listener.local_addr() {
            info!("Control channel listening on `{}`", local_addr);
        }
        let incoming = stream::unfold(listener, |listener| async move {
            let accepted = listener.accept().await.map(|(stream, remote)| {
                let _ = stream.set_nodelay(true);
                (stream, remote)
            });
            Some((accepted, listener))
        });
        self.serve_incoming(incoming).await
    }

    /// Runs a session per connection yielded by `incoming`, until it ends.
    /// A failed accept is logged and retried after [ACCEPT_BACKOFF]
    pub async fn serve_incoming<S, T>(&self, incoming: S) -> Result<(), MembershipError>
    where
        S: Stream<Item = std::io::Result<(T, SocketAddr)>>,
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut incoming = std::pin::pin!(incoming);
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                accepted = incoming.next() => match accepted {
                    Some(Ok((stream, remote))) => {
                        let master = self.clone();
                        sessions.spawn(async move { master.handle_connection(stream, remote).await });
                    }
                    Some(Err(err)) => {
                        warn!(error:% = err; "Control channel accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    None => return Ok(()),
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    match finished {
                        Ok(Err(err)) => warn!(error:% = err; "Control session ended with an error"),
                        Err(err) => error!(error:% = err; "Control session task failed"),
                        Ok(Ok(())) => (),
                    }
                }
            }
        }
    }

    /// Runs one control session until the connection closes
    pub async fn handle_connection<T>(&self, io: T, remote: SocketAddr) -> Result<(), MembershipError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, mut stream) = protocol::framed(io).split();
        let connection = PeerConnection::with_write_timeout(sink, self.write_timeout);
        let mut session = Session::AwaitingLogin;

        let result = loop {
            let next = tokio::select! {
                next = stream.next() => next,
                // evicted or replaced by a newer login
                _ = connection.closed() => break Ok(()),
            };
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => break Err(MembershipError::from(err)),
                None => break Ok(()),
            };
            let message = match protocol::decode::<ControlMessage>(&frame) {
                Ok(message) => message,
                Err(err) => {
                    debug!(remote:% = remote, error:% = err; "Unreadable control message");
                    continue;
                }
            };

            match message {
                ControlMessage::Login { token, port } => {
                    if !self.token.is_empty() && token != self.token {
                        warn!(remote:% = remote; "Peer LOGIN with a wrong token");
                        connection.close().await;
                        break Err(MembershipError::AuthMismatch);
                    }
                    let port: u16 = match port.parse() {
                        Ok(port) => port,
                        Err(_) => {
                            connection.close().await;
                            break Err(MembershipError::Codec(format!("invalid port {:?}", port)));
                        }
                    };
                    let name = peer_name(remote.ip(), port);
                    if let Session::Active(previous) = &session {
                        if *previous != name {
                            self.leave(previous, &connection).await;
                        }
                    }
                    if let Err(err) = self.join(&name, &connection).await {
                        session = Session::Active(name);
                        break Err(err);
                    }
                    session = Session::Active(name);
                }
                ControlMessage::Log { data } => match &session {
                    Session::Active(name) => self.append_log(name, data).await,
                    Session::AwaitingLogin => {
                        debug!(remote:% = remote; "LOG before LOGIN, ignored")
                    }
                },
                ControlMessage::PeerUpdate { .. } | ControlMessage::Unknown => {
                    debug!(remote:% = remote; "Unknown message");
                }
            }
        };

        if let Session::Active(name) = session {
            self.leave(&name, &connection).await;
        }
        result
    }

    async fn join(&self, name: &str, connection: &PeerConnection) -> Result<(), MembershipError> {
        let _membership = self.membership.lock().await;
        self.registry
            .add_peer(name.to_string(), connection.clone())
            .await;
        let peers = self.publish_ring().await;

        connection
            .send_json(&LoginReply::new(name.to_string(), &peers, self.mirror.clone()))
            .await?;
        info!(peer:% = name, members:% = peers.len(); "Peer JOIN");

        self.broadcast_update(Some(name), peers).await;
        Ok(())
    }

    async fn leave(&self, name: &str, connection: &PeerConnection) {
        let _membership = self.membership.lock().await;
        if !self.registry.remove_connection(name, connection).await {
            return;
        }
        let peers = self.publish_ring().await;
        info!(peer:% = name, members:% = peers.len(); "Peer LEAVE");
        self.broadcast_update(None, peers).await;
    }

    /// Rebuilds the ring from the registry. Returns the member list
    async fn publish_ring(&self) -> Vec<String> {
        let peers = self.registry.keys().await;
        self.ring.replace(&peers);
        peers
    }

    /// Sends the member list to every peer but `excluded`. A peer whose
    /// write fails is evicted and the shrunk list is sent again, this time
    /// to everyone
    async fn broadcast_update(&self, mut excluded: Option<&str>, mut peers: Vec<String>) {
        loop {
            let update = ControlMessage::peer_update(&peers);
            let result = match excluded {
                Some(excluded) => self.registry.broadcast_json_except(excluded, &update).await,
                None => self.registry.broadcast_json(&update).await,
            };
            match result {
                Ok(()) => return,
                Err(MembershipError::PartialBroadcast { peer, reason }) => {
                    warn!(peer:% = peer, reason:% = reason; "Evicting peer, PEER_UPDATE failed");
                    if !self.registry.remove_peer(&peer).await {
                        return;
                    }
                    peers = self.publish_ring().await;
                    excluded = None;
                    info!(peer:% = peer, members:% = peers.len(); "Peer LEAVE");
                }
                Err(err) => {
                    warn!(error:% = err; "PEER_UPDATE broadcast incomplete");
                    return;
                }
            }
        }
    }

    /// Sinks do blocking IO, so the append runs on the blocking pool
    async fn append_log(&self, peer: &str, data: Map<String, Value>) {
        let record = LogRecord::new(peer, data);
        let sink = self.log_sink.clone();
        match tokio::task::spawn_blocking(move || sink.append(&record)).await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => error!(peer:% = peer, error:% = err; "Could not append to the log"),
            Err(err) => error!(peer:% = peer, error:% = err; "Log append task failed"),
        }
    }
}
