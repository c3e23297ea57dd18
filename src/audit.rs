//! JSONL audit log: one JSON object per line, level-filtered against
//! `policy.log_level`, rotated when it exceeds a byte cap.
//!
//! Grounded on this repo's `TX_WRITE_LOCK: Lazy<Mutex<()>>` pattern in
//! `src/net/rpc.rs` (serializing concurrent appends through a single
//! process-local mutex) and the `checkpoint_<epoch>.json` rotation naming in
//! `src/net/checkpoint.rs`, applied here to a rotated log file instead of a
//! versioned checkpoint.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::config::LogLevel;
use crate::osutil::now_utc_string;

static WRITE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors raised while appending or rotating the audit log.
#[derive(Debug)]
pub enum AuditError {
    /// Underlying filesystem failure.
    Io(std::io::Error),
    /// The entry could not be serialized to JSON.
    Encode(String),
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "audit log I/O error: {err}"),
            Self::Encode(err) => write!(f, "audit log encode error: {err}"),
        }
    }
}

impl std::error::Error for AuditError {}

/// A single JSONL audit record, per `spec.md` §3 "Log Entry".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// UTC timestamp the entry was written.
    pub datetime_utc: String,
    /// Severity of this entry.
    pub level: LogLevel,
    /// Event name, e.g. `"encode"`, `"policy_block"`, `"checksum_mismatch"`.
    pub event: String,
    /// Source node id, if this entry concerns a specific peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Destination node id, if this entry concerns a specific peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    /// Outcome string, e.g. `"ok"`, `"warn"`, `"error"`.
    pub status: String,
    /// Free-form detail, e.g. an error message or digest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Crate version that produced the entry.
    pub version: String,
}

/// Handle to the audit log, holding the configured path, level filter, and
/// rotation threshold. Cheaply cloned — all instances serialize writes
/// through the same process-wide mutex.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    min_level: LogLevel,
    max_bytes: u64,
}

impl AuditLog {
    /// Creates a handle writing to `path`, dropping entries below `min_level`,
    /// rotating once the file exceeds `max_bytes`.
    pub fn new(path: impl Into<PathBuf>, min_level: LogLevel, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            min_level,
            max_bytes,
        }
    }

    /// Appends an entry, first checking the level filter then rotating the
    /// file if it has grown past `max_bytes`.
    pub fn log(
        &self,
        level: LogLevel,
        event: &str,
        status: &str,
        src: Option<&str>,
        dst: Option<&str>,
        message: Option<&str>,
    ) -> Result<(), AuditError> {
        if level < self.min_level {
            return Ok(());
        }
        let entry = LogEntry {
            datetime_utc: now_utc_string(),
            level,
            event: event.to_string(),
            src: src.map(str::to_string),
            dst: dst.map(str::to_string),
            status: status.to_string(),
            message: message.map(str::to_string),
            version: CRATE_VERSION.to_string(),
        };
        self.append(&entry)
    }

    fn append(&self, entry: &LogEntry) -> Result<(), AuditError> {
        let mut line =
            serde_json::to_vec(entry).map_err(|err| AuditError::Encode(err.to_string()))?;
        line.push(b'\n');

        let _guard = WRITE_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());

        self.rotate_if_needed().map_err(AuditError::Io)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(AuditError::Io)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(AuditError::Io)?;
        file.write_all(&line).map_err(AuditError::Io)?;
        Ok(())
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if size < self.max_bytes {
            return Ok(());
        }
        let rotated = self.path.with_extension(format!(
            "{}.jsonl",
            crate::osutil::now_secs()
        ));
        std::fs::rename(&self.path, rotated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(&path, LogLevel::Debug, 1024 * 1024);
        log.log(LogLevel::Info, "handshake", "ok", Some("a"), Some("b"), None)
            .unwrap();
        log.log(LogLevel::Warn, "policy_block", "warn", Some("a"), None, Some("bad suffix"))
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("datetime_utc").is_some());
        }
    }

    #[test]
    fn below_min_level_entries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(&path, LogLevel::Warn, 1024 * 1024);
        log.log(LogLevel::Debug, "discovery", "ok", None, None, None).unwrap();
        log.log(LogLevel::Info, "discovery", "ok", None, None, None).unwrap();
        assert!(!path.exists());
        log.log(LogLevel::Error, "decode_error", "error", None, None, None)
            .unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn rotates_when_over_max_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(&path, LogLevel::Debug, 10);
        log.log(LogLevel::Info, "heartbeat", "ok", None, None, None).unwrap();
        log.log(LogLevel::Info, "heartbeat", "ok", None, None, None).unwrap();
        assert!(path.exists());
        let rotated_count = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(rotated_count >= 2);
    }
}
