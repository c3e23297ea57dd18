//! Policy store and runtime configuration.
//!
//! `Policy` holds the recognized admission options of `spec.md` §3 and is
//! persisted as canonical pretty JSON, atomically, the same way this repo
//! persists `AnchorCheckpoint` in `src/net/checkpoint.rs`. `RuntimeConfig`
//! covers the environment-driven key set of `spec.md` §6, read with the
//! `env::var(...)` idiom this repo uses in `src/bin/julian.rs` for things
//! like `PH_MIGRATION_TOKEN_ID`.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::osutil::atomic_write;

const ENV_PREFIX: &str = "FREQRELAY_";

/// Errors raised while loading, parsing, or persisting policy.
#[derive(Debug)]
pub enum PolicyError {
    /// Underlying filesystem failure.
    Io(std::io::Error),
    /// The policy file's JSON did not parse.
    Decode(String),
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "policy I/O error: {err}"),
            Self::Decode(err) => write!(f, "policy decode error: {err}"),
        }
    }
}

impl std::error::Error for PolicyError {}

impl From<std::io::Error> for PolicyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Log verbosity recognized by `Policy.log_level` and consulted by `audit.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

/// The recognized policy options of `spec.md` §3 "Policy".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Hostnames and node ids permitted to pass the ingest policy gate.
    pub trusted_nodes: HashSet<String>,
    /// Suffix chains or final suffixes permitted through the policy gate.
    pub allowed_suffixes: HashSet<String>,
    /// Maximum ingest file size, in mebibytes.
    pub max_file_mb: u64,
    /// Whether a peer manifest HMAC is required before trusting it.
    pub require_sig: bool,
    /// Whether source files are deleted after a successful encode/decode.
    pub auto_delete: bool,
    /// Minimum level a log entry must meet to be appended.
    pub log_level: LogLevel,
    /// Whether the TCP transport is started.
    pub enable_socket: bool,
    /// Master switch for the heartbeat/route-gossip loop.
    pub enable_routing: bool,
    /// Whether ingest/deliver run the AEAD step around the codec.
    pub enable_aead: bool,
    /// Whether a policy-blocked file is moved to `quarantine/` instead of left in place.
    pub quarantine_on_policy_block: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            trusted_nodes: [crate::osutil::hostname(), "localhost".to_string()]
                .into_iter()
                .collect(),
            allowed_suffixes: [".txt", ".freq"].iter().map(|s| s.to_string()).collect(),
            max_file_mb: 64,
            require_sig: false,
            auto_delete: false,
            log_level: LogLevel::Info,
            enable_socket: true,
            enable_routing: true,
            enable_aead: false,
            quarantine_on_policy_block: false,
        }
    }
}

impl Policy {
    /// Loads policy from `path`, writing out the default policy if the file
    /// does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, PolicyError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|err| PolicyError::Decode(err.to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let policy = Self::default();
                policy.persist(path)?;
                Ok(policy)
            }
            Err(err) => Err(PolicyError::Io(err)),
        }
    }

    /// Re-reads policy from disk, e.g. after a pairing update installs a new
    /// trusted node. Callers hold the policy mutex across this call.
    pub fn reload(path: &Path) -> Result<Self, PolicyError> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|err| PolicyError::Decode(err.to_string()))
    }

    /// Persists this policy atomically as canonical indented JSON.
    pub fn persist(&self, path: &Path) -> Result<(), PolicyError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|err| PolicyError::Decode(err.to_string()))?;
        atomic_write(path, contents.as_bytes())?;
        Ok(())
    }

    /// Adds a node to `trusted_nodes` by id and hostname, as the pairing
    /// protocol does on both sharer and connector sides.
    pub fn trust(&mut self, node_id: &str, hostname: &str) {
        self.trusted_nodes.insert(node_id.to_string());
        self.trusted_nodes.insert(hostname.to_string());
    }
}

/// Environment-driven runtime configuration, covering the key set of
/// `spec.md` §6. Every key is read with the `FREQRELAY_` prefix.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory watched by the file pipeline's ingest/deliver poll loop.
    pub inbox: PathBuf,
    /// Directory delivered decoded files land in.
    pub outbox: PathBuf,
    /// Path to the persisted `Policy` JSON file.
    pub policy_path: PathBuf,
    /// Path to the optional peer-manifest file.
    pub manifest_path: PathBuf,
    /// Path to the JSONL audit log.
    pub log_path: PathBuf,
    /// Path to the single-instance lock file.
    pub lock_path: PathBuf,
    /// Root directory of the filesystem transport's presence files and inboxes.
    pub shared_dir: PathBuf,
    /// Path to the persisted node identity file.
    pub identity_file: PathBuf,
    /// Host the TCP transport listener binds.
    pub socket_host: String,
    /// Port the TCP transport listener binds; `0` disables TCP.
    pub socket_port: u16,
    /// Seconds between file pipeline poll iterations.
    pub poll_sec: f64,
    /// Seconds to sleep after a codec/AEAD failure before the next poll revisits the file.
    pub backoff_sec: f64,
    /// Byte threshold at which the audit log rotates.
    pub log_max_bytes: u64,
    /// Shared key used to sign/verify peer manifests, if configured.
    pub hmac_key: Option<String>,
    /// Base URL of an HTTP rendezvous backend, if configured.
    pub rendezvous_url: Option<String>,
    /// Path to a file rendezvous backend, if configured.
    pub rendezvous_file: Option<PathBuf>,
    /// Lifetime of a published wormhole code, in seconds.
    pub code_expiry_sec: u64,
    /// Invocation name of the external codec collaborator.
    pub core_cmd: String,
    /// Invocation name of the external AEAD collaborator, if AEAD is enabled.
    pub aead_cmd: Option<String>,
    /// Inline AEAD passphrase, if configured.
    pub aead_pass: Option<String>,
    /// Path to a file holding the AEAD passphrase, if configured.
    pub aead_pass_file: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Reads configuration from the process environment, falling back to
    /// the documented defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            inbox: env_path("INBOX", "inbox"),
            outbox: env_path("OUTBOX", "outbox"),
            policy_path: env_path("POLICY_PATH", "policy.json"),
            manifest_path: env_path("MANIFEST_PATH", "manifest.json"),
            log_path: env_path("LOG_PATH", "freqrelay.log.jsonl"),
            lock_path: env_path("LOCK_PATH", "freqrelay.lock"),
            shared_dir: env_path("SHARED_DIR", "SHARED"),
            identity_file: env_path("IDENTITY_FILE", "identity.json"),
            socket_host: env_string("SOCKET_HOST", "0.0.0.0"),
            socket_port: env_parse("SOCKET_PORT", 7777),
            poll_sec: env_parse("POLL_SEC", 2.0),
            backoff_sec: env_parse("BACKOFF_SEC", 5.0),
            log_max_bytes: env_parse("LOG_MAX_BYTES", 5 * 1024 * 1024),
            hmac_key: env_opt_string("HMAC_KEY"),
            rendezvous_url: env_opt_string("RENDEZVOUS_URL"),
            rendezvous_file: env_opt_string("RENDEZVOUS_FILE").map(PathBuf::from),
            code_expiry_sec: env_parse("CODE_EXPIRY_SEC", 300),
            core_cmd: env_string("CORE_CMD", "freqcodec"),
            aead_cmd: env_opt_string("AEAD_CMD"),
            aead_pass: env_opt_string("AEAD_PASS"),
            aead_pass_file: env_opt_string("AEAD_PASS_FILE").map(PathBuf::from),
        }
    }
}

fn env_key(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(env_key(name)).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(env_key(name)).ok().filter(|s| !s.is_empty())
}

fn env_path(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(name, default))
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(env_key(name))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_txt_and_freq() {
        let policy = Policy::default();
        assert!(policy.allowed_suffixes.contains(".txt"));
        assert!(policy.allowed_suffixes.contains(".freq"));
        assert!(policy.enable_routing);
    }

    #[test]
    fn load_or_create_persists_default_then_reloads_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        let created = Policy::load_or_create(&path).unwrap();
        let reloaded = Policy::reload(&path).unwrap();
        assert_eq!(created.max_file_mb, reloaded.max_file_mb);
        assert_eq!(created.allowed_suffixes, reloaded.allowed_suffixes);
    }

    #[test]
    fn trust_adds_both_node_id_and_hostname() {
        let mut policy = Policy::default();
        policy.trust("node-123", "alice-laptop");
        assert!(policy.trusted_nodes.contains("node-123"));
        assert!(policy.trusted_nodes.contains("alice-laptop"));
    }

    #[test]
    fn policy_gate_is_monotone_in_trusted_nodes() {
        let mut policy = Policy::default();
        let before = policy.trusted_nodes.contains("new-node");
        policy.trust("new-node", "new-host");
        let after = policy.trusted_nodes.contains("new-node");
        assert!(!before);
        assert!(after);
    }

    #[test]
    fn runtime_config_falls_back_to_documented_defaults() {
        std::env::remove_var("FREQRELAY_SOCKET_PORT");
        std::env::remove_var("FREQRELAY_POLL_SEC");
        let config = RuntimeConfig::from_env();
        assert_eq!(config.socket_host, "0.0.0.0");
        assert_eq!(config.poll_sec, 2.0);
        assert_eq!(config.backoff_sec, 5.0);
        assert_eq!(config.code_expiry_sec, 300);
        assert_eq!(config.log_max_bytes, 5 * 1024 * 1024);
    }
}
