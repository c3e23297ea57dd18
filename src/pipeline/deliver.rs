//! File pipeline deliver path: checksum verification then
//! codec-then-AEAD decode, per `spec.md` §4.9.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::audit::AuditLog;
use crate::config::{LogLevel, Policy, RuntimeConfig};
use crate::pipeline::ingest::{policy_gate, sidecar_path};
use crate::pipeline::codec;

/// Processes a single `.freq` candidate already known to exist in `inbox`.
pub async fn deliver_one(config: &RuntimeConfig, policy: &Policy, audit: &AuditLog, path: &Path) {
    if let Err(err) = policy_gate(path, policy) {
        let _ = audit.log(LogLevel::Warn, "policy_block", "warn", None, None, Some(&err.to_string()));
        return;
    }

    let sidecar = sidecar_path(path);
    if sidecar.exists() {
        match verify_checksum(path, &sidecar) {
            Ok(true) => {}
            Ok(false) => {
                let _ = audit.log(LogLevel::Error, "checksum_mismatch", "error", None, None, None);
                return;
            }
            Err(_) => return,
        }
    }

    let stem = strip_suffix(path, ".freq");
    let mut intermediate = config.outbox.join(file_name(&stem));
    if let Err(err) = codec::decode(&config.core_cmd, path, &intermediate).await {
        let _ = audit.log(LogLevel::Error, "decode_error", "error", None, None, Some(&err.to_string()));
        tokio::time::sleep(std::time::Duration::from_secs_f64(config.backoff_sec)).await;
        return;
    }

    if intermediate.to_string_lossy().ends_with(".aead") {
        if let Some(aead_cmd) = &config.aead_cmd {
            let passphrase = codec::resolve_passphrase(config).unwrap_or_default();
            let final_path = strip_suffix(&intermediate, ".aead");
            match codec::aead_decrypt(aead_cmd, &intermediate, &final_path, &passphrase).await {
                Ok(()) => {
                    let _ = audit.log(LogLevel::Info, "aead_decrypt", "ok", None, None, None);
                    let _ = std::fs::remove_file(&intermediate);
                    intermediate = final_path;
                }
                Err(err) => {
                    let _ = audit.log(LogLevel::Error, "aead_decrypt_error", "error", None, None, Some(&err.to_string()));
                    return;
                }
            }
        }
    }

    let _ = audit.log(LogLevel::Info, "decode", "ok", None, None, None);
    let _ = intermediate;

    if policy.auto_delete {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(&sidecar);
    }
}

/// Recomputes the SHA-256 of `path` and compares against the hex digest in
/// `sidecar`, in constant time (mirroring `hmac.compare_digest` semantics).
fn verify_checksum(path: &Path, sidecar: &Path) -> std::io::Result<bool> {
    let expected_hex = std::fs::read_to_string(sidecar)?;
    let expected_hex = expected_hex.trim();
    let Ok(expected) = hex::decode(expected_hex) else { return Ok(false) };
    let bytes = std::fs::read(path)?;
    let actual = Sha256::digest(&bytes);
    Ok(constant_time_eq(&expected, actual.as_slice()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn strip_suffix(path: &Path, suffix: &str) -> std::path::PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let stripped = name.strip_suffix(suffix).unwrap_or(name);
    path.with_file_name(stripped)
}

fn file_name(path: &Path) -> String {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn verify_checksum_detects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let freq = dir.path().join("artifact.freq");
        std::fs::write(&freq, b"real content").unwrap();
        let sidecar = dir.path().join("artifact.freq.sha256");
        std::fs::write(&sidecar, "deadbeef\n").unwrap();
        assert_eq!(verify_checksum(&freq, &sidecar).unwrap(), false);
    }

    #[test]
    fn verify_checksum_accepts_matching_digest() {
        let dir = tempfile::tempdir().unwrap();
        let freq = dir.path().join("artifact.freq");
        std::fs::write(&freq, b"real content").unwrap();
        let digest = hex::encode(Sha256::digest(b"real content"));
        let sidecar = dir.path().join("artifact.freq.sha256");
        std::fs::write(&sidecar, format!("{digest}\n")).unwrap();
        assert_eq!(verify_checksum(&freq, &sidecar).unwrap(), true);
    }

    #[test]
    fn strip_suffix_removes_trailing_extension() {
        let stripped = strip_suffix(Path::new("inbox/hello.txt.freq"), ".freq");
        assert_eq!(stripped.file_name().unwrap().to_str().unwrap(), "hello.txt");
    }
}
