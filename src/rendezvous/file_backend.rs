//! File-backed rendezvous store: a single JSON map persisted at
//! `RENDEZVOUS_FILE`, protected by a process-local mutex, per `spec.md`
//! §4.10.
//!
//! Grounded on `audit.rs`'s `WRITE_LOCK: Lazy<Mutex<()>>` (serializing
//! concurrent writers to one file through a single process-wide mutex) and
//! `osutil::atomic_write` for the persist step.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::osutil::atomic_write;
use crate::rendezvous::{Rendezvous, RendezvousError, WormholeCode};

static FILE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Rendezvous backend persisting entries as a JSON map on local disk.
pub struct FileRendezvous {
    path: PathBuf,
}

impl FileRendezvous {
    /// Creates a backend persisting its JSON map at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> HashMap<String, WormholeCode> {
        std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn persist(&self, map: &HashMap<String, WormholeCode>) -> Result<(), RendezvousError> {
        let contents = serde_json::to_vec(map)
            .map_err(|err| RendezvousError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())))?;
        atomic_write(&self.path, &contents)?;
        Ok(())
    }
}

/// Drops every entry whose lifetime has elapsed, called before each publish
/// per `spec.md` §4.10.
fn sweep_expired(map: &mut HashMap<String, WormholeCode>) {
    map.retain(|_, entry| !entry.is_expired());
}

#[async_trait::async_trait]
impl Rendezvous for FileRendezvous {
    async fn publish(&self, entry: WormholeCode) -> Result<(), RendezvousError> {
        let _guard = FILE_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let mut map = self.load();
        sweep_expired(&mut map);
        map.insert(entry.code.clone(), entry);
        self.persist(&map)
    }

    async fn lookup(&self, code: &str) -> Result<WormholeCode, RendezvousError> {
        let _guard = FILE_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let map = self.load();
        match map.get(code) {
            Some(entry) if entry.is_expired() => Err(RendezvousError::Expired),
            Some(entry) => Ok(entry.clone()),
            None => Err(RendezvousError::NotFound),
        }
    }

    async fn remove(&self, code: &str) -> Result<(), RendezvousError> {
        let _guard = FILE_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let mut map = self.load();
        map.remove(code);
        self.persist(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osutil::now_secs;

    fn sample(code: &str) -> WormholeCode {
        WormholeCode {
            code: code.to_string(),
            node_id: "node-a".to_string(),
            hostname: "host-a".to_string(),
            public_key: "pk".to_string(),
            socket_addr: None,
            created_at: now_secs(),
            expires_at: now_secs() + 300,
        }
    }

    #[tokio::test]
    async fn publish_then_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let rendezvous = FileRendezvous::new(dir.path().join("rendezvous.json"));
        rendezvous.publish(sample("7-amber-anchor")).await.unwrap();
        let found = rendezvous.lookup("7-amber-anchor").await.unwrap();
        assert_eq!(found.node_id, "node-a");
    }

    #[tokio::test]
    async fn lookup_missing_code_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let rendezvous = FileRendezvous::new(dir.path().join("rendezvous.json"));
        assert!(matches!(rendezvous.lookup("nope").await, Err(RendezvousError::NotFound)));
    }

    #[tokio::test]
    async fn remove_drops_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let rendezvous = FileRendezvous::new(dir.path().join("rendezvous.json"));
        rendezvous.publish(sample("7-amber-anchor")).await.unwrap();
        rendezvous.remove("7-amber-anchor").await.unwrap();
        assert!(matches!(rendezvous.lookup("7-amber-anchor").await, Err(RendezvousError::NotFound)));
    }

    #[tokio::test]
    async fn lookup_expired_code_reports_expired() {
        let dir = tempfile::tempdir().unwrap();
        let rendezvous = FileRendezvous::new(dir.path().join("rendezvous.json"));
        let mut entry = sample("7-amber-anchor");
        entry.expires_at = now_secs().saturating_sub(1);
        rendezvous.publish(entry).await.unwrap();
        assert!(matches!(rendezvous.lookup("7-amber-anchor").await, Err(RendezvousError::Expired)));
    }
}
