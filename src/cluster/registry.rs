//! Directory of the peers currently connected to the master
//!
//! A name present in the registry always maps to a writable control
//! connection. Removing a peer closes its connection while the write lock
//! is held, so readers never see a name whose connection is gone.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt};
use rand::seq::IndexedRandom;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::errors::MembershipError;
use crate::protocol;

/// Longest a single control frame write may take before the peer is
/// considered gone
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type BoxedSink = Pin<Box<dyn Sink<Bytes, Error = std::io::Error> + Send>>;

/// Write half of a control connection
///
/// Clones share the same underlying sink
#[derive(Clone)]
pub struct PeerConnection {
    sink: Arc<Mutex<BoxedSink>>,
    closed: CancellationToken,
    write_timeout: Duration,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    pub fn new<S>(sink: S) -> PeerConnection
    where
        S: Sink<Bytes, Error = std::io::Error> + Send + 'static,
    {
        PeerConnection::with_write_timeout(sink, DEFAULT_WRITE_TIMEOUT)
    }

    pub fn with_write_timeout<S>(sink: S, write_timeout: Duration) -> PeerConnection
    where
        S: Sink<Bytes, Error = std::io::Error> + Send + 'static,
    {
        PeerConnection {
            sink: Arc::new(Mutex::new(Box::pin(sink))),
            closed: CancellationToken::new(),
            write_timeout,
        }
    }

    /// Writes one frame. A peer that does not drain it within the write
    /// timeout fails the write
    pub async fn send_frame(&self, frame: Bytes) -> Result<(), MembershipError> {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.write_timeout, sink.send(frame)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(MembershipError::ControlChannelLost(format!(
                "write timed out after {:?}",
                self.write_timeout
            ))),
        }
    }

    pub async fn send_json<T: Serialize>(&self, message: &T) -> Result<(), MembershipError> {
        self.send_frame(protocol::encode(message)?).await
    }

    /// Flushes and closes the sink, then wakes [Self::closed] waiters.
    /// Errors are ignored, the peer is gone either way
    pub async fn close(&self) {
        self.closed.cancel();
        let mut sink = self.sink.lock().await;
        let _ = tokio::time::timeout(self.write_timeout, sink.close()).await;
    }

    /// Resolves once [Self::close] was called on any clone
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Whether both handles point to the same connection
    pub fn same_connection(&self, other: &PeerConnection) -> bool {
        Arc::ptr_eq(&self.sink, &other.sink)
    }
}

/// Concurrency-safe mapping from peer name to its control connection
#[derive(Clone, Default, Debug)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, PeerConnection>>>,
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        PeerRegistry::default()
    }

    /// Registers `name`. A name that is already present is overwritten and
    /// its previous connection closed
    pub async fn add_peer(&self, name: String, connection: PeerConnection) {
        let mut guard = self.peers.write().await;
        if let Some(previous) = guard.insert(name, connection.clone()) {
            if !previous.same_connection(&connection) {
                previous.close().await;
            }
        }
    }

    /// Removes `name` and closes its connection. Returns whether it was
    /// registered
    pub async fn remove_peer(&self, name: &str) -> bool {
        let mut guard = self.peers.write().await;
        match guard.remove(name) {
            Some(connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    /// Same as [Self::remove_peer], but only when `name` is still bound to
    /// `connection`. A stale connection closing must not remove a newer
    /// registration of the same name
    pub async fn remove_connection(&self, name: &str, connection: &PeerConnection) -> bool {
        let mut guard = self.peers.write().await;
        let is_current = guard
            .get(name)
            .map(|current| current.same_connection(connection))
            .unwrap_or(false);
        if !is_current {
            return false;
        }
        if let Some(connection) = guard.remove(name) {
            connection.close().await;
        }
        true
    }

    /// Point-in-time copy of the registered names, sorted
    pub async fn keys(&self) -> Vec<String> {
        let guard = self.peers.read().await;
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.peers.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// One registered peer, picked uniformly at random
    pub async fn pick_peer(&self) -> Result<String, MembershipError> {
        let keys = self.keys().await;
        let mut rng = rand::rng();
        keys.choose(&mut rng)
            .cloned()
            .ok_or(MembershipError::NoPeers)
    }

    /// Sends `message` to a single peer
    pub async fn send_json<T: Serialize>(
        &self,
        name: &str,
        message: &T,
    ) -> Result<(), MembershipError> {
        let guard = self.peers.read().await;
        let connection = guard
            .get(name)
            .ok_or_else(|| MembershipError::UnknownPeer(name.to_string()))?;
        connection.send_json(message).await
    }

    /// Sends `message` to every registered peer
    ///
    /// Stops at the first write error, the remaining peers are not notified
    /// by this call
    pub async fn broadcast_json<T: Serialize>(&self, message: &T) -> Result<(), MembershipError> {
        self.broadcast(message, None).await
    }

    /// Same as [Self::broadcast_json], skipping `excluded`
    pub async fn broadcast_json_except<T: Serialize>(
        &self,
        excluded: &str,
        message: &T,
    ) -> Result<(), MembershipError> {
        self.broadcast(message, Some(excluded)).await
    }

    async fn broadcast<T: Serialize>(
        &self,
        message: &T,
        excluded: Option<&str>,
    ) -> Result<(), MembershipError> {
        let frame = protocol::encode(message)?;
        let guard = self.peers.read().await;
        for (name, connection) in guard.iter() {
            if Some(name.as_str()) == excluded {
                continue;
            }
            connection
                .send_frame(frame.clone())
                .await
                .map_err(|err| MembershipError::PartialBroadcast {
                    peer: name.clone(),
                    reason: err.to_string(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{framed, ControlMessage};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// Returns the registry side of a connection and the remote reader
    fn connection() -> (PeerConnection, protocol::ControlStream<DuplexStream>) {
        let (local, remote) = tokio::io::duplex(4096);
        let (sink, _stream) = framed(local).split();
        (PeerConnection::new(sink), framed(remote))
    }

    /// A connection whose remote side holds at most `buffer` unread bytes
    fn slow_connection(
        buffer: usize,
    ) -> (PeerConnection, protocol::ControlStream<DuplexStream>) {
        let (local, remote) = tokio::io::duplex(buffer);
        let (sink, _stream) = framed(local).split();
        (
            PeerConnection::with_write_timeout(sink, Duration::from_millis(50)),
            framed(remote),
        )
    }

    async fn next_message(
        remote: &mut protocol::ControlStream<DuplexStream>,
    ) -> Result<ControlMessage, Box<dyn std::error::Error>> {
        let frame = remote.next().await.ok_or("connection closed")??;
        Ok(protocol::decode(&frame)?)
    }

    #[tokio::test]
    async fn add_remove_and_keys() {
        let registry = PeerRegistry::new();
        let (a, _ra) = connection();
        let (b, _rb) = connection();
        registry.add_peer("http://10.0.0.2:5000".to_string(), b).await;
        registry.add_peer("http://10.0.0.1:5000".to_string(), a).await;

        assert_eq!(
            registry.keys().await,
            vec![
                "http://10.0.0.1:5000".to_string(),
                "http://10.0.0.2:5000".to_string()
            ]
        );
        assert!(registry.remove_peer("http://10.0.0.1:5000").await);
        assert!(!registry.remove_peer("http://10.0.0.1:5000").await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn overwrite_closes_previous_connection() -> TestResult {
        let registry = PeerRegistry::new();
        let (first, mut first_remote) = connection();
        let (second, _second_remote) = connection();

        registry.add_peer("p".to_string(), first.clone()).await;
        registry.add_peer("p".to_string(), second.clone()).await;
        assert_eq!(registry.len().await, 1);

        // the first connection was closed, its reader sees EOF
        assert!(first_remote.next().await.is_none());

        // the stale connection can't remove the new registration
        assert!(!registry.remove_connection("p", &first).await);
        assert!(registry.contains("p").await);
        assert!(registry.remove_connection("p", &second).await);
        assert!(registry.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn pick_peer() {
        let registry = PeerRegistry::new();
        assert_eq!(registry.pick_peer().await, Err(MembershipError::NoPeers));

        let (a, _ra) = connection();
        let (b, _rb) = connection();
        registry.add_peer("a".to_string(), a).await;
        registry.add_peer("b".to_string(), b).await;
        for _ in 0..20 {
            let picked = registry.pick_peer().await.unwrap();
            assert!(picked == "a" || picked == "b");
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer() -> TestResult {
        let registry = PeerRegistry::new();
        let (a, mut remote_a) = connection();
        let (b, mut remote_b) = connection();
        registry.add_peer("a".to_string(), a).await;
        registry.add_peer("b".to_string(), b).await;

        let update = ControlMessage::peer_update(&registry.keys().await);
        registry.broadcast_json(&update).await?;
        assert_eq!(next_message(&mut remote_a).await?, update);
        assert_eq!(next_message(&mut remote_b).await?, update);

        registry.broadcast_json_except("a", &update).await?;
        assert_eq!(next_message(&mut remote_b).await?, update);
        registry.send_json("a", &update).await?;
        assert_eq!(next_message(&mut remote_a).await?, update);
        Ok(())
    }

    #[tokio::test]
    async fn broadcast_reports_the_failing_peer() {
        let registry = PeerRegistry::new();
        let (broken, broken_remote) = connection();
        drop(broken_remote);
        registry.add_peer("broken".to_string(), broken).await;

        let update = ControlMessage::peer_update(&["broken".to_string()]);
        let result = registry.broadcast_json(&update).await;
        assert!(matches!(
            result,
            Err(MembershipError::PartialBroadcast { peer, .. }) if peer == "broken"
        ));

        let unknown = registry.send_json("nobody", &update).await;
        assert_eq!(unknown, Err(MembershipError::UnknownPeer("nobody".to_string())));
    }

    #[tokio::test]
    async fn writes_to_a_peer_that_stopped_reading_time_out() -> TestResult {
        let (stalled, _stalled_remote) = slow_connection(64);
        let frame = Bytes::from(vec![b'x'; 1024]);
        let result = tokio::time::timeout(Duration::from_secs(2), stalled.send_frame(frame)).await?;
        assert!(matches!(result, Err(MembershipError::ControlChannelLost(_))));

        let registry = PeerRegistry::new();
        let (healthy, mut healthy_remote) = connection();
        registry.add_peer("healthy".to_string(), healthy).await;
        registry.add_peer("stalled".to_string(), stalled.clone()).await;

        let update = ControlMessage::peer_update(&registry.keys().await);
        let result = tokio::time::timeout(Duration::from_secs(2), registry.broadcast_json(&update))
            .await?;
        assert!(matches!(
            result,
            Err(MembershipError::PartialBroadcast { peer, .. }) if peer == "stalled"
        ));

        // closing is bounded too, and wakes the session waiting on it
        tokio::time::timeout(Duration::from_secs(2), registry.remove_peer("stalled")).await?;
        tokio::time::timeout(Duration::from_secs(2), stalled.closed()).await?;
        registry.broadcast_json(&update).await?;
        assert_eq!(next_message(&mut healthy_remote).await?, update);
        Ok(())
    }
}
