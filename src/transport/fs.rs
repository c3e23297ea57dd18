//! Filesystem transport: presence files plus a per-node inbox of `.msg`
//! blobs, per `spec.md` §4.2.
//!
//! Grounded on this repo's `src/io.rs` atomic tmp-then-rename writer,
//! generalized from a single artifact writer to the send-a-message and
//! publish-a-presence-file operations this transport needs, and on the
//! `tokio::time::sleep` poll-loop shape in `src/net/swarm.rs`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::envelope::Envelope;
use crate::osutil::{atomic_write, now_secs};
use crate::transport::TransportError;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Content of a `SHARED/<node_id>.presence` file, per `spec.md` §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    /// The publishing node's id.
    pub node_id: String,
    /// The publishing node's inbox path, as a string for JSON portability.
    pub inbox: String,
    /// Unix timestamp the presence file was last published.
    pub ts: u64,
}

/// A peer discovered via its presence file.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// The discovered peer's node id.
    pub node_id: String,
    /// The discovered peer's inbox path.
    pub inbox: PathBuf,
}

/// Filesystem rendezvous transport: a presence file plus a polled inbox
/// directory under a shared directory both nodes can see.
pub struct FsTransport {
    shared_dir: PathBuf,
    local_node_id: String,
    local_inbox: PathBuf,
}

impl FsTransport {
    /// Creates `SHARED/<node_id>/inbox` and publishes the presence file.
    pub fn start(shared_dir: PathBuf, local_node_id: String) -> Result<Self, TransportError> {
        let local_inbox = shared_dir.join(&local_node_id).join("inbox");
        std::fs::create_dir_all(&local_inbox)?;
        let transport = Self {
            shared_dir,
            local_node_id,
            local_inbox,
        };
        transport.publish_presence()?;
        Ok(transport)
    }

    fn presence_path(&self) -> PathBuf {
        self.shared_dir.join(format!("{}.presence", self.local_node_id))
    }

    fn publish_presence(&self) -> Result<(), TransportError> {
        let presence = Presence {
            node_id: self.local_node_id.clone(),
            inbox: self.local_inbox.to_string_lossy().into_owned(),
            ts: now_secs(),
        };
        let contents = serde_json::to_vec(&presence)
            .map_err(|err| TransportError::SendFailed(err.to_string()))?;
        atomic_write(&self.presence_path(), &contents)?;
        Ok(())
    }

    /// Enumerates `*.presence` files under `SHARED`, excluding the local
    /// node's own entry.
    pub fn discover(&self) -> Result<Vec<DiscoveredPeer>, TransportError> {
        let mut peers = Vec::new();
        let entries = match std::fs::read_dir(&self.shared_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(peers),
            Err(err) => return Err(err.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("presence") {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else { continue };
            let Ok(presence): Result<Presence, _> = serde_json::from_slice(&bytes) else { continue };
            if presence.node_id == self.local_node_id {
                continue;
            }
            peers.push(DiscoveredPeer {
                node_id: presence.node_id,
                inbox: PathBuf::from(presence.inbox),
            });
        }
        Ok(peers)
    }

    /// Atomically writes `envelope` into `dst_inbox` as `<msg_id>.msg`.
    pub fn send(&self, dst_inbox: &Path, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = envelope
            .to_bytes()
            .map_err(|err| TransportError::SendFailed(err.to_string()))?;
        let dest = dst_inbox.join(format!("{}.msg", envelope.msg_id));
        atomic_write(&dest, &bytes)?;
        Ok(())
    }

    /// Runs the 500ms poll loop, draining the local inbox and dispatching
    /// each parsed envelope to `tx`. A `.msg` file is always removed after
    /// being read, whether or not it parsed — a malformed blob is simply
    /// dropped, per `spec.md` §7 `MalformedEnvelope`.
    pub async fn run_poll_loop(&self, tx: UnboundedSender<Envelope>, running: std::sync::Arc<std::sync::atomic::AtomicBool>) {
        use std::sync::atomic::Ordering;
        while running.load(Ordering::Relaxed) {
            if let Ok(mut entries) = tokio::fs::read_dir(&self.local_inbox).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("msg") {
                        continue;
                    }
                    if let Ok(bytes) = tokio::fs::read(&path).await {
                        if let Ok(envelope) = Envelope::from_bytes(&bytes) {
                            let _ = tx.send(envelope);
                        }
                    }
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// This node's own inbox directory.
    pub fn local_inbox(&self) -> &Path {
        &self.local_inbox
    }

    /// Removes this node's presence file, called on cooperative shutdown.
    pub fn shutdown(&self) {
        let _ = std::fs::remove_file(self.presence_path());
    }
}
