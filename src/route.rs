//! Routing table: destination → (next-hop, metric, expiry), with an expiry
//! sweep. Grounded on the same lock-per-table discipline as `peer.rs`, which
//! in turn follows this repo's single-`Mutex`-behind-a-`HashMap` shape in
//! `net/governance.rs`.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::osutil::now_secs;

/// How long a route stays valid after being added or refreshed, per
/// `spec.md` §4.4.
pub const ROUTE_EXPIRE_SEC: u64 = 60;

/// Thread-safe routing table. Held independently of the peer registry — no
/// worker may hold both locks at once.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: Mutex<HashMap<String, (String, u32, u64)>>,
}

impl RoutingTable {
    /// Creates an empty routing table.
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Installs or refreshes a route. Ties on metric are broken by most
    /// recent update, so a same-metric re-add always wins.
    pub fn add(&self, destination: &str, next_hop: &str, metric: u32) {
        let mut routes = self.lock();
        let expires_at = now_secs() + ROUTE_EXPIRE_SEC;
        match routes.get(destination) {
            Some((_, existing_metric, _)) if *existing_metric < metric => {}
            _ => {
                routes.insert(destination.to_string(), (next_hop.to_string(), metric, expires_at));
            }
        }
    }

    /// Returns `(next_hop, metric)` iff a non-expired route exists.
    pub fn get(&self, destination: &str) -> Option<(String, u32)> {
        let routes = self.lock();
        let (next_hop, metric, expires_at) = routes.get(destination)?;
        if *expires_at <= now_secs() {
            return None;
        }
        Some((next_hop.clone(), *metric))
    }

    /// Drops every entry whose `next_hop` equals `node_id`, called when a
    /// peer is evicted.
    pub fn remove_via(&self, node_id: &str) {
        self.lock().retain(|_, (next_hop, _, _)| next_hop != node_id);
    }

    /// A snapshot of all non-expired `(destination, metric)` pairs, used to
    /// build the payload of an outgoing ROUTE gossip message.
    pub fn snapshot_active(&self) -> Vec<(String, u32)> {
        let now = now_secs();
        self.lock()
            .iter()
            .filter(|(_, (_, _, expires_at))| *expires_at > now)
            .map(|(dest, (_, metric, _))| (dest.clone(), *metric))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, u32, u64)>> {
        self.routes.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_returns_the_route() {
        let table = RoutingTable::new();
        table.add("node-c", "node-b", 2);
        assert_eq!(table.get("node-c"), Some(("node-b".to_string(), 2)));
    }

    #[test]
    fn expired_route_is_not_returned() {
        let table = RoutingTable::new();
        table.routes.lock().unwrap().insert(
            "node-c".to_string(),
            ("node-b".to_string(), 2, now_secs().saturating_sub(1)),
        );
        assert_eq!(table.get("node-c"), None);
    }

    #[test]
    fn remove_via_drops_only_matching_next_hop() {
        let table = RoutingTable::new();
        table.add("node-c", "node-b", 2);
        table.add("node-d", "node-x", 1);
        table.remove_via("node-b");
        assert_eq!(table.get("node-c"), None);
        assert_eq!(table.get("node-d"), Some(("node-x".to_string(), 1)));
    }

    #[test]
    fn worse_metric_does_not_overwrite_better_route() {
        let table = RoutingTable::new();
        table.add("node-c", "node-b", 1);
        table.add("node-c", "node-z", 5);
        assert_eq!(table.get("node-c"), Some(("node-b".to_string(), 1)));
    }

    #[test]
    fn equal_metric_update_wins_as_most_recent() {
        let table = RoutingTable::new();
        table.add("node-c", "node-b", 2);
        table.add("node-c", "node-z", 2);
        assert_eq!(table.get("node-c"), Some(("node-z".to_string(), 2)));
    }
}
