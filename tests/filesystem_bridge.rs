//! Two-node integration tests over the filesystem transport: discovery,
//! handshake, addressed DATA delivery, loop prevention, and the full
//! inbox-to-outbox file bridge (with and without AEAD), per `spec.md` §8
//! scenario 2 ("Two-node filesystem bridge") and scenario 6
//! ("Loop prevention").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use freqrelay::config::{Policy, RuntimeConfig};
use freqrelay::envelope::{Envelope, MsgType, BROADCAST};
use freqrelay::peer::PeerRegistry;
use freqrelay::route::RoutingTable;
use freqrelay::router::Router;
use freqrelay::transport::fs::FsTransport;
use freqrelay::{discovery, heartbeat, pipeline};

fn identity_codec_path() -> String {
    concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/identity_codec.sh").to_string()
}

fn test_config(root: &std::path::Path, shared: &std::path::Path) -> RuntimeConfig {
    RuntimeConfig {
        inbox: root.join("inbox"),
        outbox: root.join("outbox"),
        policy_path: root.join("policy.json"),
        manifest_path: root.join("manifest.json"),
        log_path: root.join("log.jsonl"),
        lock_path: root.join("node.lock"),
        shared_dir: shared.to_path_buf(),
        identity_file: root.join("identity.json"),
        socket_host: "127.0.0.1".to_string(),
        socket_port: 0,
        poll_sec: 0.1,
        backoff_sec: 0.2,
        log_max_bytes: 5 * 1024 * 1024,
        hmac_key: None,
        rendezvous_url: None,
        rendezvous_file: None,
        code_expiry_sec: 300,
        core_cmd: identity_codec_path(),
        aead_cmd: None,
        aead_pass: None,
        aead_pass_file: None,
    }
}

struct Node {
    router: Arc<Router>,
    fs_transport: Arc<FsTransport>,
    running: Arc<AtomicBool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Node {
    /// Spawns one node's full background stack (fs poll, discovery,
    /// heartbeat, and the file pipeline poll loop) over a shared `SHARED`
    /// directory, wired exactly as `Daemon::run` wires it.
    async fn spawn(
        shared_dir: std::path::PathBuf,
        node_id: &str,
        config: RuntimeConfig,
        policy: Policy,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<Envelope>) {
        std::fs::create_dir_all(&config.inbox).unwrap();
        std::fs::create_dir_all(&config.outbox).unwrap();

        let fs_transport = Arc::new(FsTransport::start(shared_dir, node_id.to_string()).unwrap());
        let router = Arc::new(Router::new(
            node_id.to_string(),
            format!("pubkey-{node_id}"),
            PeerRegistry::new(),
            RoutingTable::new(),
            Some(fs_transport.clone()),
            None,
            true,
        ));

        let (data_tx, data_rx) = tokio::sync::mpsc::unbounded_channel();
        router.set_data_callback(data_tx);

        let running = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::new();

        let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::unbounded_channel();
        let poll_transport = fs_transport.clone();
        let poll_running = running.clone();
        handles.push(tokio::spawn(async move {
            poll_transport.run_poll_loop(inbound_tx, poll_running).await;
        }));
        let router_for_inbound = router.clone();
        handles.push(tokio::spawn(async move {
            while let Some(envelope) = inbound_rx.recv().await {
                router_for_inbound.handle_inbound(envelope).await;
            }
        }));

        let discovery_transport = fs_transport.clone();
        let discovery_router = router.clone();
        let discovery_running = running.clone();
        handles.push(tokio::spawn(async move {
            discovery::run(discovery_router, discovery_transport, discovery_running).await;
        }));

        let heartbeat_router = router.clone();
        let heartbeat_running = running.clone();
        handles.push(tokio::spawn(async move {
            heartbeat::run(heartbeat_router, true, heartbeat_running).await;
        }));

        let audit = Arc::new(freqrelay::audit::AuditLog::new(
            config.log_path.clone(),
            policy.log_level,
            config.log_max_bytes,
        ));
        let config = Arc::new(config);
        let policy = Arc::new(Mutex::new(policy));
        let pipeline_router = router.clone();
        let pipeline_running = running.clone();
        handles.push(tokio::spawn(async move {
            pipeline::ingest::run_poll_loop(config, policy, audit, pipeline_router, pipeline_running).await;
        }));

        (
            Self {
                router,
                fs_transport,
                running,
                handles,
            },
            data_rx,
        )
    }

    async fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn trusting_policy(peer_ids: &[&str]) -> Policy {
    let mut policy = Policy::default();
    for id in peer_ids {
        policy.trusted_nodes.insert(id.to_string());
    }
    policy
}

#[tokio::test]
async fn two_nodes_discover_pair_and_exchange_addressed_data() {
    let dir = tempfile::tempdir().unwrap();
    let shared = dir.path().join("SHARED");

    let config_a = test_config(&dir.path().join("a"), &shared);
    let config_b = test_config(&dir.path().join("b"), &shared);
    let (node_a, _a_data_rx) =
        Node::spawn(shared.clone(), "node-a", config_a, trusting_policy(&["node-b"])).await;
    let (node_b, mut b_data_rx) =
        Node::spawn(shared.clone(), "node-b", config_b, trusting_policy(&["node-a"])).await;

    // Discovery loops tick every 5s in production; the bridge must still
    // complete a mutual handshake well inside a generous test timeout.
    let paired = wait_for(
        || node_a.router.peers().contains("node-b") && node_b.router.peers().contains("node-a"),
        Duration::from_secs(12),
    )
    .await;
    assert!(paired, "both nodes should discover and handshake each other");

    // A addresses DATA directly to B; the router should resolve B as a
    // known peer and deliver over the filesystem transport without falling
    // back to broadcast.
    let payload = b"hello from A".to_vec();
    let data = Envelope::new(MsgType::Data, "node-a", "node-b", 8, payload.clone());
    let msg_id = data.msg_id.clone();
    node_a.router.route_message(data).await;

    let received = tokio::time::timeout(Duration::from_secs(5), b_data_rx.recv())
        .await
        .expect("B should receive the DATA envelope within the timeout")
        .expect("channel should not close");
    assert_eq!(received.msg_id, msg_id);
    assert_eq!(received.payload, payload);
    assert_eq!(received.source, "node-a");

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn broadcast_envelope_does_not_loop_back_to_a_node_already_in_its_hops() {
    let dir = tempfile::tempdir().unwrap();
    let shared = dir.path().join("SHARED");

    let config_a = test_config(&dir.path().join("a"), &shared);
    let config_b = test_config(&dir.path().join("b"), &shared);
    let (node_a, mut a_data_rx) =
        Node::spawn(shared.clone(), "node-a", config_a, trusting_policy(&["node-b"])).await;
    let (node_b, _b_data_rx) =
        Node::spawn(shared.clone(), "node-b", config_b, trusting_policy(&["node-a"])).await;

    let paired = wait_for(
        || node_a.router.peers().contains("node-b") && node_b.router.peers().contains("node-a"),
        Duration::from_secs(12),
    )
    .await;
    assert!(paired);

    // Craft a broadcast envelope that already carries node-a in its hop
    // list, as if node-a had already forwarded it once; node-b must not
    // re-deliver it back to node-a.
    let mut envelope = Envelope::new(MsgType::Data, "node-x", BROADCAST, 8, b"gossip".to_vec());
    envelope.hops.push("node-a".to_string());
    node_b.router.handle_inbound(envelope.clone()).await;

    // Give the split-horizon broadcast a moment to (not) deliver, then
    // assert nothing arrived at A.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a_data_rx.try_recv().is_err());

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn file_placed_in_a_inbox_materializes_in_b_outbox() {
    let dir = tempfile::tempdir().unwrap();
    let shared = dir.path().join("SHARED");

    let config_a = test_config(&dir.path().join("a"), &shared);
    let config_b = test_config(&dir.path().join("b"), &shared);
    let b_outbox = config_b.outbox.clone();

    let (node_a, _a_data_rx) =
        Node::spawn(shared.clone(), "node-a", config_a.clone(), trusting_policy(&["node-b"])).await;
    let (node_b, _b_data_rx) =
        Node::spawn(shared.clone(), "node-b", config_b, trusting_policy(&["node-a"])).await;

    let paired = wait_for(
        || node_a.router.peers().contains("node-b") && node_b.router.peers().contains("node-a"),
        Duration::from_secs(12),
    )
    .await;
    assert!(paired, "both nodes should discover and handshake each other");

    let original = b"PAXECT Link Demo 01\n".to_vec();
    std::fs::write(config_a.inbox.join("hello.txt"), &original).unwrap();

    let delivered = b_outbox.join("hello.txt");
    let arrived = wait_for(|| delivered.exists(), Duration::from_secs(10)).await;
    assert!(arrived, "the file should cross from A's inbox to B's outbox");
    assert_eq!(std::fs::read(&delivered).unwrap(), original);

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn file_bridges_across_nodes_with_aead_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let shared = dir.path().join("SHARED");

    let mut config_a = test_config(&dir.path().join("a"), &shared);
    config_a.aead_cmd = Some(identity_codec_path());
    let mut config_b = test_config(&dir.path().join("b"), &shared);
    config_b.aead_cmd = Some(identity_codec_path());
    let b_outbox = config_b.outbox.clone();

    let mut policy_a = trusting_policy(&["node-b"]);
    policy_a.enable_aead = true;
    let mut policy_b = trusting_policy(&["node-a"]);
    policy_b.enable_aead = true;

    let (node_a, _a_data_rx) = Node::spawn(shared.clone(), "node-a", config_a.clone(), policy_a).await;
    let (node_b, _b_data_rx) = Node::spawn(shared.clone(), "node-b", config_b, policy_b).await;

    let paired = wait_for(
        || node_a.router.peers().contains("node-b") && node_b.router.peers().contains("node-a"),
        Duration::from_secs(12),
    )
    .await;
    assert!(paired, "both nodes should discover and handshake each other");

    let original = b"secret payload".to_vec();
    std::fs::write(config_a.inbox.join("secret.txt"), &original).unwrap();

    let delivered = b_outbox.join("secret.txt");
    let arrived = wait_for(|| delivered.exists(), Duration::from_secs(10)).await;
    assert!(arrived, "the AEAD-wrapped file should still cross from A's inbox to B's outbox");
    assert_eq!(std::fs::read(&delivered).unwrap(), original);

    node_a.stop().await;
    node_b.stop().await;
}
