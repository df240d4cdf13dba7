//! Consistent-hash ring mapping cache keys to peer names
//!
//! Every peer is placed on the ring `replicas` times. A key belongs to the
//! peer owning the first position at or after the key's hash, wrapping
//! around to the smallest position.
//!
//! Positions come from `xxh3`, which is stable across processes and
//! machines, so two nodes holding the same member list route a key to the
//! same peer without talking to each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use xxhash_rust::xxh3::xxh3_64;

use crate::errors::RingError;

pub const DEFAULT_REPLICAS: usize = 3;

/// Sorted hash positions, each one owned by a peer name
#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    positions: BTreeMap<u64, String>,
    /// Positions actually inserted for each peer, used by [HashRing::remove]
    owned: HashMap<String, Vec<u64>>,
}

impl Default for HashRing {
    fn default() -> Self {
        HashRing::new(DEFAULT_REPLICAS)
    }
}

impl HashRing {
    pub fn new(replicas: usize) -> HashRing {
        HashRing {
            replicas: replicas.max(1),
            positions: BTreeMap::new(),
            owned: HashMap::new(),
        }
    }

    /// Builds a ring holding exactly `peers`
    pub fn with_peers<I, S>(replicas: usize, peers: I) -> HashRing
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = HashRing::new(replicas);
        for peer in peers {
            ring.add(peer.as_ref());
        }
        ring
    }

    fn position(peer: &str, replica: usize) -> u64 {
        xxh3_64(format!("{}{}", replica, peer).as_bytes())
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Inserts the virtual positions of `peer`. Adding a peer twice is a no-op
    pub fn add(&mut self, peer: &str) {
        if peer.is_empty() || self.owned.contains_key(peer) {
            return;
        }
        let mut inserted = Vec::with_capacity(self.replicas);
        for replica in 0..self.replicas {
            let position = Self::position(peer, replica);
            // first owner keeps a colliding position
            if self.positions.contains_key(&position) {
                continue;
            }
            self.positions.insert(position, peer.to_string());
            inserted.push(position);
        }
        self.owned.insert(peer.to_string(), inserted);
    }

    /// Removes every position of `peer`, no-op when it is not in the ring
    pub fn remove(&mut self, peer: &str) {
        if let Some(positions) = self.owned.remove(peer) {
            for position in positions {
                self.positions.remove(&position);
            }
        }
    }

    /// Name of the peer owning `key`
    pub fn get(&self, key: &str) -> Result<&str, RingError> {
        let hash = xxh3_64(key.as_bytes());
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, peer)| peer.as_str())
            .ok_or(RingError::EmptyRing)
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.owned.contains_key(peer)
    }

    /// Number of positions held by `peer`
    pub fn positions_of(&self, peer: &str) -> usize {
        self.owned.get(peer).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Peer names, sorted
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.owned.keys().cloned().collect();
        members.sort();
        members
    }
}

/// Ring shared between the membership tasks (writers) and the request
/// handlers (readers)
///
/// [SharedRing::replace] builds the new ring aside and swaps it in under the
/// write lock, so a concurrent [SharedRing::get] sees either the whole old
/// membership or the whole new one
#[derive(Debug, Clone, Default)]
pub struct SharedRing {
    inner: Arc<RwLock<HashRing>>,
}

impl SharedRing {
    pub fn new(replicas: usize) -> SharedRing {
        SharedRing {
            inner: Arc::new(RwLock::new(HashRing::new(replicas))),
        }
    }

    pub fn add(&self, peer: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(peer);
    }

    pub fn remove(&self, peer: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }

    /// Replaces the whole membership with `peers`
    pub fn replace<I, S>(&self, peers: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let replicas = self.read(|ring| ring.replicas());
        let ring = HashRing::with_peers(replicas, peers);
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = ring;
    }

    pub fn get(&self, key: &str) -> Result<String, RingError> {
        self.read(|ring| ring.get(key).map(str::to_string))
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.read(|ring| ring.contains(peer))
    }

    pub fn members(&self) -> Vec<String> {
        self.read(HashRing::members)
    }

    /// Point-in-time copy of the ring
    pub fn snapshot(&self) -> HashRing {
        self.read(HashRing::clone)
    }

    fn read<T>(&self, f: impl FnOnce(&HashRing) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::distr::Alphanumeric;
    use rand::Rng;

    fn peers(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("http://10.0.0.{}:5000", i + 1))
            .collect()
    }

    fn random_keys(n: usize) -> Vec<String> {
        let mut rng = rand::rng();
        (0..n)
            .map(|_| {
                let suffix: String = (&mut rng)
                    .sample_iter(&Alphanumeric)
                    .take(16)
                    .map(char::from)
                    .collect();
                format!("/{}.png", suffix)
            })
            .collect()
    }

    #[test]
    fn empty_ring() {
        let ring = HashRing::default();
        assert_eq!(ring.get("/logo.png"), Err(RingError::EmptyRing));
        assert!(ring.is_empty());
    }

    #[test]
    fn single_peer_owns_everything() {
        let ring = HashRing::with_peers(3, ["http://10.0.0.1:5000"]);
        for key in random_keys(100) {
            assert_eq!(ring.get(&key), Ok("http://10.0.0.1:5000"));
        }
    }

    #[test]
    fn lookup_is_stable_across_instances() {
        let members = peers(5);
        let ring = HashRing::with_peers(3, &members);
        let mut reversed = members.clone();
        reversed.reverse();
        let other = HashRing::with_peers(3, &reversed);

        for key in random_keys(1_000) {
            let owner = ring.get(&key).unwrap();
            assert_eq!(owner, ring.get(&key).unwrap());
            assert_eq!(owner, other.get(&key).unwrap());
        }
    }

    #[test]
    fn owner_is_first_position_at_or_after_hash() {
        let ring = HashRing::with_peers(3, peers(4));
        for key in random_keys(200) {
            let hash = xxh3_64(key.as_bytes());
            let expected = ring
                .positions
                .iter()
                .find(|(position, _)| **position >= hash)
                .or_else(|| ring.positions.iter().next())
                .map(|(_, peer)| peer.as_str())
                .unwrap();
            assert_eq!(ring.get(&key).unwrap(), expected);
        }
    }

    #[test]
    fn add_is_idempotent() {
        let mut ring = HashRing::new(3);
        ring.add("http://10.0.0.1:5000");
        let positions = ring.positions.len();
        ring.add("http://10.0.0.1:5000");
        assert_eq!(ring.positions.len(), positions);
        assert_eq!(ring.positions_of("http://10.0.0.1:5000"), 3);
    }

    #[test]
    fn remove_drops_every_position() {
        let mut ring = HashRing::with_peers(3, peers(3));
        ring.remove("http://10.0.0.2:5000");
        assert!(!ring.contains("http://10.0.0.2:5000"));
        assert_eq!(ring.positions.len(), 6);
        assert!(ring
            .positions
            .values()
            .all(|peer| peer != "http://10.0.0.2:5000"));

        // absent peer
        ring.remove("http://10.0.0.9:5000");
        assert_eq!(ring.positions.len(), 6);
    }

    #[test]
    fn removing_a_peer_only_remaps_its_own_keys() {
        let members = peers(4);
        let before = HashRing::with_peers(160, &members);
        let removed = members[2].clone();
        let mut after = before.clone();
        after.remove(&removed);

        let keys = random_keys(10_000);
        let mut changed = 0;
        for key in keys.iter() {
            let old_owner = before.get(key).unwrap();
            let new_owner = after.get(key).unwrap();
            if old_owner != new_owner {
                assert_eq!(old_owner, removed);
                changed += 1;
            }
        }
        // expected share of one peer out of four is 25%
        let fraction = changed as f64 / keys.len() as f64;
        assert!(fraction < 0.45, "{} of the keys moved", fraction);
        assert!(changed > 0);
    }

    #[test]
    fn shared_ring_replace_swaps_membership() {
        let ring = SharedRing::new(3);
        ring.replace(peers(3));
        assert_eq!(ring.members(), peers(3));

        ring.replace(["http://10.0.0.7:5000"]);
        assert_eq!(ring.members(), vec!["http://10.0.0.7:5000".to_string()]);
        assert_eq!(ring.get("/a").unwrap(), "http://10.0.0.7:5000");

        ring.replace(Vec::<String>::new());
        assert_eq!(ring.get("/a"), Err(RingError::EmptyRing));
    }

    #[test]
    fn shared_ring_clones_see_updates() {
        let ring = SharedRing::new(3);
        let clone = ring.clone();
        ring.add("http://10.0.0.1:5000");
        assert!(clone.contains("http://10.0.0.1:5000"));
        clone.remove("http://10.0.0.1:5000");
        assert!(!ring.contains("http://10.0.0.1:5000"));
    }
}
