//! Discovery loop: scan filesystem presence, initiate handshake on new
//! peers, per `spec.md` §4.6.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::envelope::{Envelope, MsgType};
use crate::peer::PeerState;
use crate::router::Router;
use crate::transport::fs::FsTransport;

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Runs the discovery loop until `running` is cleared. Every interval it
/// lists filesystem presence files, upserts an entry for each unfamiliar
/// `node_id`, and unicasts a HANDSHAKE to newly discovered peers.
pub async fn run(router: Arc<Router>, fs_transport: Arc<FsTransport>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        if let Ok(discovered) = fs_transport.discover() {
            for peer in discovered {
                let is_new = !router.peers().contains(&peer.node_id);
                if is_new {
                    router.peers().upsert(&peer.node_id, "", "");
                } else {
                    router.peers().touch(&peer.node_id);
                }
                router
                    .peers()
                    .set_fs_inbox(&peer.node_id, peer.inbox.to_string_lossy().into_owned());
                if is_new {
                    router.peers().set_state(&peer.node_id, PeerState::Discovered);
                    let handshake = Envelope::new(
                        MsgType::Handshake,
                        local_id_placeholder(&router),
                        peer.node_id.clone(),
                        8,
                        router.local_public_info(),
                    );
                    router.peers().set_state(&peer.node_id, PeerState::Pending);
                    router.route_message(handshake).await;
                    println!("QSYS|mod=DISCOVERY|evt=HANDSHAKE_SENT|dst={}", peer.node_id);
                }
            }
        }
        tokio::time::sleep(DISCOVERY_INTERVAL).await;
    }
}

fn local_id_placeholder(router: &Router) -> String {
    router.local_node_id_str()
}
