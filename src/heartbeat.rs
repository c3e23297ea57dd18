//! Heartbeat / route-gossip loop, per `spec.md` §4.7.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::envelope::{Envelope, MsgType, BROADCAST};
use crate::router::Router;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_TIMEOUT: u64 = 15;

/// Runs the heartbeat/gossip loop until `running` is cleared. Every
/// interval: heartbeats every known peer, evicts peers silent for more than
/// `HEARTBEAT_TIMEOUT` seconds (dropping their routes too), then — if
/// `enable_routing` — broadcasts a ROUTE message listing this node plus
/// every non-expired route.
pub async fn run(router: Arc<Router>, enable_routing: bool, running: Arc<AtomicBool>) {
    let local_id = router.local_node_id_str();
    while running.load(Ordering::Relaxed) {
        for peer in router.peers().snapshot() {
            let heartbeat = Envelope::new(MsgType::Heartbeat, local_id.clone(), peer.node_id.clone(), 8, vec![]);
            router.route_message(heartbeat).await;
        }

        for dead_id in router.peers().evict_dead(HEARTBEAT_TIMEOUT) {
            println!("QSYS|mod=HEARTBEAT|evt=DEAD|peer={dead_id}");
            router.routes().remove_via(&dead_id);
        }

        if enable_routing {
            let mut routes: Vec<(String, u32)> = vec![(local_id.clone(), 0)];
            routes.extend(router.routes().snapshot_active());
            if let Ok(payload) = serde_json::to_vec(&routes) {
                let gossip = Envelope::new(MsgType::Route, local_id.clone(), BROADCAST, 8, payload);
                router.route_message(gossip).await;
            }
        }

        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerRegistry;
    use crate::route::RoutingTable;

    #[tokio::test]
    async fn evicts_peer_silent_past_timeout() {
        let peers = PeerRegistry::new();
        peers.upsert("node-a", "host-a", "pk-a");
        // Manually age the peer past the timeout using the public API's
        // side effects is not available, so this exercises evict_dead
        // directly through the registry rather than the full loop.
        let evicted = peers.evict_dead(0);
        assert_eq!(evicted, vec!["node-a".to_string()]);
    }

    #[tokio::test]
    async fn route_gossip_includes_local_at_metric_zero() {
        let routes = RoutingTable::new();
        routes.add("node-z", "node-b", 3);
        let mut gossip: Vec<(String, u32)> = vec![("local".to_string(), 0)];
        gossip.extend(routes.snapshot_active());
        assert!(gossip.contains(&("local".to_string(), 0)));
        assert!(gossip.contains(&("node-z".to_string(), 3)));
    }
}
