//! Daemon wiring and lifecycle: acquires the single-instance lock, loads
//! policy and identity, starts whichever transports `policy.enable_socket`
//! selects, launches the background discovery/heartbeat/pipeline loops, and
//! serves until interrupted. Grounded on `net/swarm.rs::run_network`'s
//! `tokio::spawn` + `select! { ..., _ = signal::ctrl_c() => ... }` shape.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::signal;

use crate::audit::AuditLog;
use crate::config::{LogLevel, Policy, RuntimeConfig};
use crate::envelope::{Envelope, MsgType, BROADCAST};
use crate::error::RelayError;
use crate::identity::NodeIdentity;
use crate::osutil::atomic_write;
use crate::peer::PeerRegistry;
use crate::pipeline::FileTransfer;
use crate::route::RoutingTable;
use crate::router::Router;
use crate::transport::fs::FsTransport;
use crate::transport::tcp::TcpTransport;
use crate::{discovery, heartbeat, pipeline};

/// Everything a running daemon holds for the duration of a `watch` session.
/// Exists so `run` and the CLI's pairing/peer-listing commands can share one
/// construction path without duplicating the load-policy-and-identity
/// sequence.
pub struct Daemon {
    /// Environment-derived paths and tunables.
    pub config: Arc<RuntimeConfig>,
    /// Mutex-guarded policy, reloaded in place when pairing admits a peer.
    pub policy: Arc<Mutex<Policy>>,
    /// This node's persistent identity.
    pub identity: NodeIdentity,
    /// JSONL audit log handle.
    pub audit: Arc<AuditLog>,
    /// Central router wired over whichever transports are enabled.
    pub router: Arc<Router>,
    fs_transport: Option<Arc<FsTransport>>,
    tcp_enabled: bool,
}

impl Daemon {
    /// Loads policy and identity from `config`'s configured paths, starts
    /// enabled transports, and constructs the router. Does not yet launch
    /// any background loop — callers decide which of `run`'s services they
    /// need (the CLI's `--list-peers` path, for instance, only needs the
    /// registry, not the network).
    pub async fn bootstrap(config: RuntimeConfig) -> Result<Self, RelayError> {
        let config = Arc::new(config);
        let policy = Policy::load_or_create(&config.policy_path)?;
        let identity = NodeIdentity::load_or_create(&config.identity_file)?;
        let audit = Arc::new(AuditLog::new(&config.log_path, policy.log_level, config.log_max_bytes));

        // The filesystem transport is the baseline rendezvous mechanism and
        // runs even when the TCP transport is disabled.
        let fs_transport = Arc::new(FsTransport::start(
            config.shared_dir.clone(),
            identity.node_id.clone(),
        )?);

        let tcp_enabled = policy.enable_socket && config.socket_port != 0;
        let tcp_transport = if tcp_enabled { Some(Arc::new(TcpTransport::new())) } else { None };

        let router = Arc::new(Router::new(
            identity.node_id.clone(),
            identity.public_key.clone(),
            PeerRegistry::new(),
            RoutingTable::new(),
            Some(fs_transport.clone()),
            tcp_transport,
            policy.enable_routing,
        ));

        Ok(Self {
            config,
            policy: Arc::new(Mutex::new(policy)),
            identity,
            audit,
            router,
            fs_transport: Some(fs_transport),
            tcp_enabled,
        })
    }

    /// Runs the daemon until `ctrl_c` (or, in tests, until `running` is
    /// externally cleared): starts discovery, heartbeat, the TCP listener
    /// (if enabled), the filesystem inbox poll loop, and the file pipeline
    /// poll loop as background tasks, then blocks on the shutdown signal.
    /// On shutdown, best-effort broadcasts a disconnect DATA envelope,
    /// shuts down the TCP outbound cache, and removes this node's presence
    /// file, per `spec.md` §5.
    pub async fn run(&self) -> Result<(), RelayError> {
        let running = Arc::new(AtomicBool::new(true));
        let (data_tx, mut data_rx) = tokio::sync::mpsc::unbounded_channel::<Envelope>();
        self.router.set_data_callback(data_tx);

        let mut handles = Vec::new();

        if let Some(fs_transport) = self.fs_transport.clone() {
            let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::unbounded_channel();
            let running_fs = running.clone();
            let fs_for_poll = fs_transport.clone();
            handles.push(tokio::spawn(async move {
                fs_for_poll.run_poll_loop(inbound_tx, running_fs).await;
            }));
            let router_for_fs = self.router.clone();
            handles.push(tokio::spawn(async move {
                while let Some(envelope) = inbound_rx.recv().await {
                    router_for_fs.handle_inbound(envelope).await;
                }
            }));

            let running_discovery = running.clone();
            let router_for_discovery = self.router.clone();
            handles.push(tokio::spawn(async move {
                discovery::run(router_for_discovery, fs_transport, running_discovery).await;
            }));
        }

        if self.tcp_enabled {
            let (tcp_tx, mut tcp_rx) = tokio::sync::mpsc::unbounded_channel();
            let host = self.config.socket_host.clone();
            let port = self.config.socket_port;
            let running_tcp = running.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = TcpTransport::run_listener(&host, port, tcp_tx, running_tcp).await {
                    eprintln!("QSYS|mod=DAEMON|evt=TCP_LISTEN_ERROR|err={err}");
                }
            }));
            let router_for_tcp = self.router.clone();
            handles.push(tokio::spawn(async move {
                while let Some(envelope) = tcp_rx.recv().await {
                    router_for_tcp.handle_inbound(envelope).await;
                }
            }));
        }

        {
            let enable_routing = self.policy.lock().unwrap_or_else(|p| p.into_inner()).enable_routing;
            let running_heartbeat = running.clone();
            let router_for_heartbeat = self.router.clone();
            handles.push(tokio::spawn(async move {
                heartbeat::run(router_for_heartbeat, enable_routing, running_heartbeat).await;
            }));
        }

        {
            let running_pipeline = running.clone();
            let config = self.config.clone();
            let policy = self.policy.clone();
            let audit = self.audit.clone();
            let router_for_pipeline = self.router.clone();
            handles.push(tokio::spawn(async move {
                pipeline::ingest::run_poll_loop(config, policy, audit, router_for_pipeline, running_pipeline).await;
            }));
        }

        let audit_for_data = self.audit.clone();
        let config_for_data = self.config.clone();
        handles.push(tokio::spawn(async move {
            while let Some(envelope) = data_rx.recv().await {
                handle_data_envelope(&config_for_data, &audit_for_data, &envelope).await;
            }
        }));

        println!(
            "QSYS|mod=DAEMON|evt=START|node={}|socket={}",
            self.identity.node_id, self.tcp_enabled
        );

        signal::ctrl_c().await.map_err(RelayError::Io)?;
        println!("QSYS|mod=DAEMON|evt=SHUTDOWN|node={}", self.identity.node_id);

        running.store(false, Ordering::Relaxed);

        let disconnect = Envelope::new(
            MsgType::Data,
            self.identity.node_id.clone(),
            BROADCAST,
            1,
            br#"{"disconnect":true}"#.to_vec(),
        );
        self.router.route_message(disconnect).await;

        if let Some(fs_transport) = &self.fs_transport {
            fs_transport.shutdown();
        }
        if let Some(tcp_transport) = self.router.tcp_transport() {
            tcp_transport.shutdown().await;
        }

        for handle in handles {
            handle.abort();
        }

        Ok(())
    }
}

/// Handles one DATA envelope delivered to this node: if the payload decodes
/// as a [`FileTransfer`], writes the `.freq` artifact and its sidecar into
/// `inbox` so the next ingest poll's deliver path picks it up exactly as it
/// would a locally encoded file. Anything else (the shutdown `disconnect`
/// marker, a future payload kind) is just audited.
async fn handle_data_envelope(config: &RuntimeConfig, audit: &AuditLog, envelope: &Envelope) {
    let Ok(transfer) = serde_json::from_slice::<FileTransfer>(&envelope.payload) else {
        let _ = audit.log(
            LogLevel::Info,
            "data_received",
            "ok",
            Some(&envelope.source),
            Some(&envelope.destination),
            None,
        );
        return;
    };

    let Ok(bytes) = BASE64.decode(transfer.bytes_b64.as_bytes()) else {
        let _ = audit.log(
            LogLevel::Error,
            "file_receive_decode_error",
            "error",
            Some(&envelope.source),
            None,
            Some(&transfer.file_name),
        );
        return;
    };

    let freq_path = config.inbox.join(&transfer.file_name);
    if atomic_write(&freq_path, &bytes).is_err() {
        let _ = audit.log(
            LogLevel::Error,
            "file_receive_write_error",
            "error",
            Some(&envelope.source),
            None,
            Some(&transfer.file_name),
        );
        return;
    }
    let sidecar = pipeline::ingest::sidecar_path(&freq_path);
    let _ = atomic_write(&sidecar, format!("{}\n", transfer.sha256).as_bytes());

    let _ = audit.log(
        LogLevel::Info,
        "file_received",
        "ok",
        Some(&envelope.source),
        Some(&envelope.destination),
        Some(&transfer.file_name),
    );
}
