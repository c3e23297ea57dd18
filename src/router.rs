//! Central dispatch: deduplication, address-based dispatch, forward vs.
//! deliver, broadcast. Per `spec.md` §4.5.
//!
//! The dedup set and per-peer send preference are new domain logic with no
//! direct precedent elsewhere in this repo; they are built in the idiom
//! already established by `peer.rs`/`route.rs` (one `Mutex`-guarded
//! collection per concern, never two locks held at once, as `SPEC_FULL.md`
//! §5 requires).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::envelope::{Envelope, MsgType, BROADCAST};
use crate::peer::{PeerRegistry, PeerState};
use crate::route::RoutingTable;
use crate::transport::fs::FsTransport;
use crate::transport::tcp::TcpTransport;

/// Cap on the dedup set; on overflow the oldest half is dropped, per
/// `spec.md` §4.5.
const DEDUP_CAP: usize = 10_000;
const DEDUP_RETAIN: usize = 5_000;

/// Bounded FIFO set of recently seen `msg_id`s.
struct DedupSet {
    order: VecDeque<String>,
    seen: std::collections::HashSet<String>,
}

impl DedupSet {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            seen: std::collections::HashSet::new(),
        }
    }

    /// Returns `true` if `msg_id` was newly inserted (i.e. not a repeat).
    fn insert(&mut self, msg_id: &str) -> bool {
        if self.seen.contains(msg_id) {
            return false;
        }
        self.seen.insert(msg_id.to_string());
        self.order.push_back(msg_id.to_string());
        if self.order.len() > DEDUP_CAP {
            while self.order.len() > DEDUP_RETAIN {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
        true
    }
}

/// Central router: owns references to the peer registry, routing table, and
/// both transports, and dispatches inbound envelopes per `spec.md` §4.5.
pub struct Router {
    local_node_id: String,
    local_public_key: String,
    peers: PeerRegistry,
    routes: RoutingTable,
    fs_transport: Option<Arc<FsTransport>>,
    tcp_transport: Option<Arc<TcpTransport>>,
    dedup: Mutex<DedupSet>,
    enable_routing: bool,
    data_tx: Mutex<Option<UnboundedSender<Envelope>>>,
}

impl Router {
    /// Builds a router over the given peer registry, routing table, and
    /// transports. Either transport may be absent per `policy.enable_socket`.
    pub fn new(
        local_node_id: String,
        local_public_key: String,
        peers: PeerRegistry,
        routes: RoutingTable,
        fs_transport: Option<Arc<FsTransport>>,
        tcp_transport: Option<Arc<TcpTransport>>,
        enable_routing: bool,
    ) -> Self {
        Self {
            local_node_id,
            local_public_key,
            peers,
            routes,
            fs_transport,
            tcp_transport,
            dedup: Mutex::new(DedupSet::new()),
            enable_routing,
            data_tx: Mutex::new(None),
        }
    }

    /// Registers the callback channel invoked for DATA envelopes addressed
    /// to this node.
    pub fn set_data_callback(&self, tx: UnboundedSender<Envelope>) {
        *self.data_tx.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
    }

    /// The peer registry this router dispatches against.
    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// The routing table this router consults for indirect destinations.
    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    /// The TCP transport this router sends over, if `policy.enable_socket`
    /// selected it. Exposed so the daemon can close outbound sockets on
    /// shutdown without the router needing its own shutdown sequencing.
    pub fn tcp_transport(&self) -> Option<&Arc<TcpTransport>> {
        self.tcp_transport.as_ref()
    }

    /// This node's own id, as used in `source`/`destination` fields.
    pub fn local_node_id_str(&self) -> String {
        self.local_node_id.clone()
    }

    /// Handles one inbound envelope per the dispatch rule of `spec.md`
    /// §4.5.
    pub async fn handle_inbound(&self, mut envelope: Envelope) {
        let is_new = self
            .dedup
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(&envelope.msg_id);
        if !is_new {
            return;
        }

        self.peers.touch(&envelope.source);

        if envelope.destination != BROADCAST && envelope.destination != self.local_node_id {
            if envelope.can_forward() && !envelope.hops.contains(&self.local_node_id) {
                envelope.add_hop(&self.local_node_id);
                self.route_message(envelope).await;
            }
            return;
        }

        match envelope.msg_type {
            MsgType::Handshake => self.handle_handshake(&envelope).await,
            MsgType::Ack => self.handle_ack(&envelope),
            MsgType::Heartbeat => self.handle_heartbeat(&envelope).await,
            MsgType::Route => self.handle_route(&envelope),
            MsgType::Data => self.handle_data(envelope),
        }
    }

    async fn handle_handshake(&self, envelope: &Envelope) {
        if let Ok(info) = serde_json::from_slice::<PublicInfo>(&envelope.payload) {
            self.peers.upsert(&envelope.source, &info.hostname, &info.public_key);
            self.peers.set_state(&envelope.source, PeerState::Paired);
            self.routes.add(&envelope.source, &envelope.source, 1);
            let reply = Envelope::new(
                MsgType::Ack,
                self.local_node_id.clone(),
                envelope.source.clone(),
                8,
                self.local_public_info_bytes(),
            );
            self.route_message(reply).await;
        }
    }

    fn handle_ack(&self, envelope: &Envelope) {
        if let Ok(info) = serde_json::from_slice::<PublicInfo>(&envelope.payload) {
            self.peers.upsert(&envelope.source, &info.hostname, &info.public_key);
            self.peers.set_state(&envelope.source, PeerState::Paired);
            self.routes.add(&envelope.source, &envelope.source, 1);
        }
    }

    async fn handle_heartbeat(&self, envelope: &Envelope) {
        let reply = Envelope::new(MsgType::Heartbeat, self.local_node_id.clone(), envelope.source.clone(), 8, vec![]);
        self.route_message(reply).await;
    }

    fn handle_route(&self, envelope: &Envelope) {
        if !self.enable_routing {
            return;
        }
        if let Ok(routes) = serde_json::from_slice::<Vec<(String, u32)>>(&envelope.payload) {
            for (dest, metric) in routes {
                if dest != self.local_node_id {
                    self.routes.add(&dest, &envelope.source, metric + 1);
                }
            }
        }
    }

    fn handle_data(&self, envelope: Envelope) {
        if let Some(tx) = self.data_tx.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            let _ = tx.send(envelope);
        }
    }

    /// Outbound routing per `spec.md` §4.5 `_route_message`: direct send if
    /// the destination is a known peer, else via a non-expired route, else
    /// broadcast.
    pub async fn route_message(&self, mut envelope: Envelope) {
        if envelope.destination != BROADCAST {
            if self.peers.contains(&envelope.destination) {
                self.send_to_peer(&envelope.destination, &envelope).await;
                return;
            }
            if let Some((next_hop, _)) = self.routes.get(&envelope.destination) {
                self.send_to_peer(&next_hop, &envelope).await;
                return;
            }
            envelope.destination = BROADCAST.to_string();
        }
        self.broadcast(&envelope).await;
    }

    /// Tries TCP first if the peer has a `socket_addr`, falls back to the
    /// filesystem transport, and increments the failure counter if both
    /// fail.
    async fn send_to_peer(&self, node_id: &str, envelope: &Envelope) {
        let Some(peer) = self.peers.get(node_id) else { return };

        if let (Some(addr), Some(tcp)) = (peer.socket_addr, self.tcp_transport.as_ref()) {
            if tcp.send(addr, envelope).await.is_ok() {
                return;
            }
        }

        if let (Some(inbox), Some(fs)) = (peer.fs_inbox.as_ref(), self.fs_transport.as_ref()) {
            if fs.send(std::path::Path::new(inbox), envelope).is_ok() {
                return;
            }
        }

        self.peers.record_failure(node_id);
    }

    /// Iterates the current peer snapshot, skipping any peer already present
    /// in the envelope's hops (split-horizon).
    async fn broadcast(&self, envelope: &Envelope) {
        for peer in self.peers.snapshot() {
            if envelope.hops.contains(&peer.node_id) || peer.node_id == envelope.source {
                continue;
            }
            self.send_to_peer(&peer.node_id, envelope).await;
        }
    }

    fn local_public_info_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&PublicInfo {
            hostname: crate::osutil::hostname(),
            public_key: self.local_public_key.clone(),
        })
        .unwrap_or_default()
    }

    /// Encodes this node's hostname and public key the same way a
    /// handshake/ack payload does, for callers that need to publish it
    /// outside the router (e.g. a peer manifest).
    pub fn local_public_info(&self) -> Vec<u8> {
        self.local_public_info_bytes()
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PublicInfo {
    hostname: String,
    public_key: String,
}
