//! Peer side of the control channel
//!
//! A peer logs in to the master, learns its own public name, the member
//! list and the mirror, then keeps following PEER_UPDATEs while it
//! forwards its telemetry. A lost connection is retried every
//! `reconnect_interval` until it succeeds or the server closes.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::errors::MembershipError;
use crate::origin::MirrorHandle;
use crate::protocol::{self, ControlMessage, ControlStream, LoginReply};
use crate::ring::SharedRing;
use crate::shutdown::ServerState;
use crate::telemetry::{Report, SendQueue};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
/// Longest wait for the TCP connect plus the master's login reply
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type ControlSink = SplitSink<ControlStream<TcpStream>, bytes::Bytes>;
type ControlUpdates = SplitStream<ControlStream<TcpStream>>;

/// An established, logged in, control connection
pub struct PeerSession {
    stream: ControlStream<TcpStream>,
    self_name: String,
}

impl PeerSession {
    /// Name the master knows this peer by
    pub fn self_name(&self) -> &str {
        &self.self_name
    }
}

/// Client of the master's control channel
#[derive(Clone)]
pub struct PeerClient {
    upstream: String,
    token: String,
    port: u16,
    ring: SharedRing,
    mirror: MirrorHandle,
    send_queue: SendQueue,
    state: Arc<ServerState>,
    self_name: Arc<RwLock<Option<String>>>,
    reconnect_interval: Duration,
    login_timeout: Duration,
}

impl PeerClient {
    /// `port` is the HTTP port announced to the master
    pub fn new(
        upstream: impl Into<String>,
        token: impl Into<String>,
        port: u16,
        ring: SharedRing,
        mirror: MirrorHandle,
        send_queue: SendQueue,
        state: Arc<ServerState>,
    ) -> PeerClient {
        PeerClient {
            upstream: upstream.into(),
            token: token.into(),
            port,
            ring,
            mirror,
            send_queue,
            state,
            self_name: Arc::new(RwLock::new(None)),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> PeerClient {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> PeerClient {
        self.login_timeout = timeout;
        self
    }

    /// Name learnt on the last successful login
    pub fn self_name(&self) -> Option<String> {
        self.self_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connects and logs in. On success the ring holds the master's member
    /// list and the mirror is set. A master that does not answer within the
    /// login timeout fails the join with [MembershipError::ControlChannelLost]
    pub async fn join(&self) -> Result<PeerSession, MembershipError> {
        match tokio::time::timeout(self.login_timeout, self.login()).await {
            Ok(joined) => joined,
            Err(_) => Err(MembershipError::ControlChannelLost(format!(
                "no login reply within {:?}",
                self.login_timeout
            ))),
        }
    }

    async fn login(&self) -> Result<PeerSession, MembershipError> {
        let stream = TcpStream::connect(&self.upstream).await?;
        let _ = stream.set_nodelay(true);
        let mut stream = protocol::framed(stream);

        let login = ControlMessage::login(self.token.clone(), self.port);
        stream.send(protocol::encode(&login)?).await?;

        let frame = stream.next().await.ok_or_else(|| {
            MembershipError::ControlChannelLost("closed before the login reply".to_string())
        })??;
        let reply: LoginReply = protocol::decode(&frame)?;
        let self_name = reply.self_name.clone().ok_or(MembershipError::MissingSelf)?;

        self.mirror
            .set(&reply.mirror)
            .map_err(|err| MembershipError::Codec(err.to_string()))?;
        let peers = reply.peer_list();
        self.ring.replace(&peers);
        *self.self_name.write().unwrap_or_else(PoisonError::into_inner) = Some(self_name.clone());

        info!(name:% = self_name, members:% = peers.len(); "Joined the group");
        Ok(PeerSession { stream, self_name })
    }

    /// Follows `session`, reconnecting whenever it is lost. Returns once the
    /// server closes
    pub async fn run(&self, mut session: PeerSession) -> Result<(), MembershipError> {
        let mut closing = self.state.subscribe_close();
        loop {
            match self.follow(session, &mut closing).await {
                Ok(()) => {
                    info!("Control connection closed");
                    return Ok(());
                }
                Err(err) => warn!(error:% = err; "Lost the control connection"),
            }
            session = match self.rejoin(&mut closing).await {
                Some(session) => session,
                None => return Ok(()),
            };
        }
    }

    /// `Ok` when the server closes, `Err` when the connection is lost
    async fn follow(
        &self,
        session: PeerSession,
        closing: &mut watch::Receiver<bool>,
    ) -> Result<(), MembershipError> {
        let (mut sink, mut updates) = session.stream.split();
        let mut in_flight = None;
        let outcome = if *closing.borrow() {
            Ok(())
        } else {
            tokio::select! {
                result = self.receive_updates(&mut updates) => result,
                result = self.forward_reports(&mut sink, &mut in_flight) => result,
                _ = closed(closing) => Ok(()),
            }
        };
        // not confirmed written, it may reach the master twice
        if let Some(report) = in_flight {
            self.send_queue.requeue(report);
        }
        // a master that stopped reading cannot hold the close forever
        let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await;
        outcome
    }

    async fn receive_updates(&self, updates: &mut ControlUpdates) -> Result<(), MembershipError> {
        loop {
            let frame = match updates.next().await {
                Some(frame) => frame?,
                None => {
                    return Err(MembershipError::ControlChannelLost(
                        "closed by the master".to_string(),
                    ))
                }
            };
            match protocol::decode::<ControlMessage>(&frame) {
                Ok(ControlMessage::PeerUpdate { peers }) => {
                    let peers = protocol::split_peers(&peers);
                    self.ring.replace(&peers);
                    info!(members:% = peers.len(); "PEER_UPDATE");
                }
                Ok(_) => debug!("Unknown message"),
                Err(err) => debug!(error:% = err; "Unreadable control message"),
            }
        }
    }

    /// Drains the send queue. The report being written stays in
    /// `in_flight` until the write completes, so the caller can put it back
    /// when the write fails or is cancelled
    async fn forward_reports(
        &self,
        sink: &mut ControlSink,
        in_flight: &mut Option<Report>,
    ) -> Result<(), MembershipError> {
        loop {
            let report = self.send_queue.pop().await;
            let mut message = report.clone();
            message
                .entry("action")
                .or_insert_with(|| Value::from("LOG"));
            let frame = match protocol::encode(&message) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error:% = err; "Dropping a report that cannot be encoded");
                    continue;
                }
            };
            *in_flight = Some(report);
            sink.send(frame).await?;
            *in_flight = None;
        }
    }

    /// Retries [Self::join] until it works. `None` when the server closes
    /// first
    async fn rejoin(&self, closing: &mut watch::Receiver<bool>) -> Option<PeerSession> {
        loop {
            if *closing.borrow() {
                return None;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_interval) => (),
                _ = closed(closing) => return None,
            }
            let joined = tokio::select! {
                joined = self.join() => joined,
                _ = closed(closing) => return None,
            };
            match joined {
                Ok(session) => return Some(session),
                Err(err) => {
                    warn!(upstream:% = self.upstream, error:% = err; "Reconnect to master failed")
                }
            }
        }
    }
}

async fn closed(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closed| *closed).await;
}
