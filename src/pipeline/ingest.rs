//! File pipeline ingest path: policy gate plus AEAD-then-codec encode, per
//! `spec.md` §4.8.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};

use crate::audit::AuditLog;
use crate::config::{LogLevel, Policy, RuntimeConfig};
use crate::envelope::{Envelope, MsgType};
use crate::osutil::atomic_write;
use crate::pipeline::{codec, deliver, FileTransfer, PipelineError};
use crate::router::Router;

/// Runs the ingest/deliver poll loop at `config.poll_sec` until `running`
/// is cleared.
pub async fn run_poll_loop(
    config: Arc<RuntimeConfig>,
    policy: Arc<std::sync::Mutex<Policy>>,
    audit: Arc<AuditLog>,
    router: Arc<Router>,
    running: Arc<AtomicBool>,
) {
    let interval = Duration::from_secs_f64(config.poll_sec.max(0.05));
    while running.load(Ordering::Relaxed) {
        let snapshot = policy.lock().unwrap_or_else(|p| p.into_inner()).clone();
        poll_once(&config, &snapshot, &audit, &router).await;
        tokio::time::sleep(interval).await;
    }
}

/// Enumerates `inbox` once, skipping hidden files and `.part`/`.tmp`
/// suffixes, and dispatches each candidate to the encode or deliver path
/// based on its extension.
pub async fn poll_once(config: &RuntimeConfig, policy: &Policy, audit: &AuditLog, router: &Router) {
    let entries = match std::fs::read_dir(&config.inbox) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_candidate(&path) {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) == Some("freq") {
            deliver::deliver_one(config, policy, audit, &path).await;
        } else {
            encode_one(config, policy, audit, router, &path).await;
        }
    }
}

fn is_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else { return false };
    if name.starts_with('.') {
        return false;
    }
    if name.ends_with(".part") || name.ends_with(".tmp") || name.ends_with(".sha256") {
        return false;
    }
    path.is_file()
}

/// Returns `(full_suffix_chain, last_suffix)`, e.g. for `data.aead.freq`:
/// `(".aead.freq", ".freq")`.
fn suffixes(path: &Path) -> (String, String) {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    match name.find('.') {
        Some(idx) => {
            let chain = name[idx..].to_string();
            let last = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{e}"))
                .unwrap_or_default();
            (chain, last)
        }
        None => (String::new(), String::new()),
    }
}

/// The policy gate of `spec.md` §4.8: local hostname must be trusted, the
/// suffix chain (or last suffix) must be allowed, and the file must not
/// exceed `max_file_mb`.
pub fn policy_gate(path: &Path, policy: &Policy) -> Result<(), PipelineError> {
    let hostname = crate::osutil::hostname();
    if !policy.trusted_nodes.contains(&hostname) {
        return Err(PipelineError::PolicyBlock(format!("host {hostname} is not trusted")));
    }
    let (chain, last) = suffixes(path);
    if !policy.allowed_suffixes.contains(&chain) && !policy.allowed_suffixes.contains(&last) {
        return Err(PipelineError::PolicyBlock(format!("suffix {chain} not allowed")));
    }
    let size = std::fs::metadata(path)?.len();
    let max_bytes = policy.max_file_mb * 1024 * 1024;
    if size > max_bytes {
        return Err(PipelineError::PolicyBlock(format!("file exceeds {} MiB", policy.max_file_mb)));
    }
    Ok(())
}

async fn encode_one(config: &RuntimeConfig, policy: &Policy, audit: &AuditLog, router: &Router, path: &Path) {
    if let Err(err) = policy_gate(path, policy) {
        let _ = audit.log(LogLevel::Warn, "policy_block", "warn", None, None, Some(&err.to_string()));
        if policy.quarantine_on_policy_block {
            quarantine(config, path);
        }
        return;
    }

    let mut current = path.to_path_buf();
    if policy.enable_aead {
        if let Some(aead_cmd) = &config.aead_cmd {
            let passphrase = codec::resolve_passphrase(config).unwrap_or_default();
            let aead_out = append_suffix(path, "aead");
            match codec::aead_encrypt(aead_cmd, &current, &aead_out, &passphrase).await {
                Ok(()) => {
                    let _ = audit.log(LogLevel::Info, "aead_encrypt", "ok", None, None, None);
                    current = aead_out;
                }
                Err(err) => {
                    let _ = audit.log(LogLevel::Error, "aead_encrypt_error", "error", None, None, Some(&err.to_string()));
                    tokio::time::sleep(Duration::from_secs_f64(config.backoff_sec)).await;
                    return;
                }
            }
        }
    }

    let freq_out = append_suffix(&current, "freq");
    if let Err(err) = codec::encode(&config.core_cmd, &current, &freq_out).await {
        let _ = audit.log(LogLevel::Error, "encode_error", "error", None, None, Some(&err.to_string()));
        tokio::time::sleep(Duration::from_secs_f64(config.backoff_sec)).await;
        return;
    }

    let bytes = match std::fs::read(&freq_out) {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = audit.log(LogLevel::Error, "encode_error", "error", None, None, Some(&err.to_string()));
            return;
        }
    };
    let digest = hex::encode(Sha256::digest(&bytes));
    let sidecar = sidecar_path(&freq_out);
    if atomic_write(&sidecar, format!("{digest}\n").as_bytes()).is_err() {
        return;
    }
    let _ = audit.log(LogLevel::Info, "encode", "ok", None, None, Some(&digest));

    let transfer = FileTransfer {
        file_name: freq_out.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string(),
        sha256: digest.clone(),
        bytes_b64: BASE64.encode(&bytes),
    };
    if let Ok(payload) = serde_json::to_vec(&transfer) {
        transmit_to_trusted_peers(router, policy, &payload).await;
    }

    if policy.auto_delete {
        let _ = std::fs::remove_file(path);
        if current != path {
            let _ = std::fs::remove_file(&current);
        }
    }
}

/// Sends one DATA envelope carrying `payload` to every known peer admitted
/// into `trusted_nodes` (by node id or last-reported hostname) — the `.freq`
/// artifact is the cross-host transport unit, so only peers the policy gate
/// would itself admit a file from are offered one.
async fn transmit_to_trusted_peers(router: &Router, policy: &Policy, payload: &[u8]) {
    for peer in router.peers().snapshot() {
        let trusted = policy.trusted_nodes.contains(&peer.node_id) || policy.trusted_nodes.contains(&peer.hostname);
        if !trusted {
            continue;
        }
        let envelope = Envelope::new(MsgType::Data, router.local_node_id_str(), peer.node_id.clone(), 8, payload.to_vec());
        router.route_message(envelope).await;
    }
}

fn quarantine(config: &RuntimeConfig, path: &Path) {
    let quarantine_dir = config.inbox.join("quarantine");
    if std::fs::create_dir_all(&quarantine_dir).is_ok() {
        if let Some(name) = path.file_name() {
            let _ = std::fs::rename(path, quarantine_dir.join(name));
        }
    }
}

pub(crate) fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
    name.push('.');
    name.push_str(suffix);
    path.with_file_name(name)
}

pub(crate) fn sidecar_path(freq_path: &Path) -> PathBuf {
    append_suffix(freq_path, "sha256")
}
