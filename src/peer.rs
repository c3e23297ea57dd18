//! Peer registry: known peers, last-seen tracking, per-peer failure counters.
//!
//! Grounded on this repo's `governance.rs` `MembershipPolicy` bookkeeping
//! style (a `HashMap` behind a single `Mutex`, upsert-shaped mutators) but
//! generalized from a membership set to a liveness-tracked peer table as
//! `spec.md` §3 "Peer Info" and §4.5/§4.6 describe.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::osutil::now_secs;

/// A known peer, as `spec.md` §3 "Peer Info".
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer's node id.
    pub node_id: String,
    /// The peer's last self-reported hostname.
    pub hostname: String,
    /// Base64 ed25519 public key the peer last presented.
    pub public_key: String,
    /// Unix timestamp of the most recent contact, by any transport.
    pub last_seen: u64,
    /// Known TCP address, if the TCP transport has connected to this peer.
    pub socket_addr: Option<SocketAddr>,
    /// Known filesystem rendezvous inbox path, if discovered over `fs`.
    pub fs_inbox: Option<String>,
    /// Consecutive transport send failures recorded for this peer.
    pub failures: u32,
    /// Discovery/pairing state machine position.
    pub state: PeerState,
}

/// Discovery state machine for a peer, per `spec.md` §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Discovered,
    Pending,
    Paired,
    Dead,
}

impl PeerInfo {
    fn new(node_id: String, hostname: String, public_key: String) -> Self {
        Self {
            node_id,
            hostname,
            public_key,
            last_seen: now_secs(),
            socket_addr: None,
            fs_inbox: None,
            failures: 0,
            state: PeerState::Discovered,
        }
    }
}

/// Thread-safe table of known peers. Its own mutex, held independently of
/// the routing table, TCP connection map, and dedup set, per `spec.md` §5's
/// "no worker holds two of these locks at once" rule.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerInfo>>,
}

impl PeerRegistry {
    /// Creates an empty peer registry.
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a peer if unknown, or refreshes `last_seen`/identity fields
    /// if already known. Used by discovery, handshake, and ACK handling.
    pub fn upsert(&self, node_id: &str, hostname: &str, public_key: &str) {
        let mut peers = self.lock();
        let entry = peers
            .entry(node_id.to_string())
            .or_insert_with(|| PeerInfo::new(node_id.to_string(), hostname.to_string(), public_key.to_string()));
        entry.hostname = hostname.to_string();
        entry.public_key = public_key.to_string();
        entry.last_seen = now_secs();
    }

    /// Touches `last_seen` for a peer that is assumed already present
    /// (called on every inbound envelope, per `spec.md` §4.5 step 2).
    pub fn touch(&self, node_id: &str) {
        if let Some(peer) = self.lock().get_mut(node_id) {
            peer.last_seen = now_secs();
        }
    }

    /// Records the peer's live TCP address, once a connection succeeds.
    pub fn set_socket_addr(&self, node_id: &str, addr: SocketAddr) {
        if let Some(peer) = self.lock().get_mut(node_id) {
            peer.socket_addr = Some(addr);
        }
    }

    /// Records the peer's filesystem rendezvous inbox path.
    pub fn set_fs_inbox(&self, node_id: &str, inbox: String) {
        if let Some(peer) = self.lock().get_mut(node_id) {
            peer.fs_inbox = Some(inbox);
        }
    }

    /// Moves a peer to a new point in the discovery/pairing state machine.
    pub fn set_state(&self, node_id: &str, state: PeerState) {
        if let Some(peer) = self.lock().get_mut(node_id) {
            peer.state = state;
        }
    }

    /// Increments a peer's failure counter, called on a transport send
    /// failure before falling back to the other transport.
    pub fn record_failure(&self, node_id: &str) -> u32 {
        let mut peers = self.lock();
        match peers.get_mut(node_id) {
            Some(peer) => {
                peer.failures += 1;
                peer.failures
            }
            None => 0,
        }
    }

    /// Returns whether `node_id` is currently known.
    pub fn contains(&self, node_id: &str) -> bool {
        self.lock().contains_key(node_id)
    }

    /// Returns a clone of the current record for `node_id`, if known.
    pub fn get(&self, node_id: &str) -> Option<PeerInfo> {
        self.lock().get(node_id).cloned()
    }

    /// A point-in-time snapshot of all known peers, used for broadcast
    /// iteration and heartbeat/gossip sweeps.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.lock().values().cloned().collect()
    }

    /// Removes peers whose `last_seen` is older than `timeout_secs`,
    /// returning the evicted node ids so callers can also purge routes via
    /// those peers.
    pub fn evict_dead(&self, timeout_secs: u64) -> Vec<String> {
        let now = now_secs();
        let mut peers = self.lock();
        let dead: Vec<String> = peers
            .iter()
            .filter(|(_, peer)| now.saturating_sub(peer.last_seen) > timeout_secs)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            peers.remove(id);
        }
        dead
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerInfo>> {
        self.peers.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_get_round_trips_fields() {
        let registry = PeerRegistry::new();
        registry.upsert("node-a", "host-a", "pubkey-a");
        let peer = registry.get("node-a").unwrap();
        assert_eq!(peer.hostname, "host-a");
        assert_eq!(peer.public_key, "pubkey-a");
        assert_eq!(peer.failures, 0);
    }

    #[test]
    fn record_failure_increments_counter() {
        let registry = PeerRegistry::new();
        registry.upsert("node-a", "host-a", "pubkey-a");
        assert_eq!(registry.record_failure("node-a"), 1);
        assert_eq!(registry.record_failure("node-a"), 2);
    }

    #[test]
    fn evict_dead_removes_only_stale_peers() {
        let registry = PeerRegistry::new();
        registry.upsert("node-a", "host-a", "pubkey-a");
        registry.upsert("node-b", "host-b", "pubkey-b");
        if let Some(peer) = registry.peers.lock().unwrap().get_mut("node-a") {
            peer.last_seen = now_secs().saturating_sub(100);
        }
        let evicted = registry.evict_dead(15);
        assert_eq!(evicted, vec!["node-a".to_string()]);
        assert!(!registry.contains("node-a"));
        assert!(registry.contains("node-b"));
    }

    #[test]
    fn snapshot_reflects_current_peers() {
        let registry = PeerRegistry::new();
        registry.upsert("node-a", "host-a", "pubkey-a");
        registry.upsert("node-b", "host-b", "pubkey-b");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
    }
}
