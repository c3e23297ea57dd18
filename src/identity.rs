//! Node identity: a persistent `(node_id, hostname, public_key)` created on
//! first run and never mutated afterward, plus the optional HMAC-signed peer
//! manifest described in `SPEC_FULL.md` §3.1.
//!
//! Key handling is grounded on this repo's `src/net/sign.rs`
//! (`KeyMaterial`, base64 encode/decode helpers, `SigningKey::generate`);
//! atomic persistence follows `src/net/checkpoint.rs::write_checkpoint`.

use std::fmt;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::osutil::{atomic_write, hostname, now_utc_string};

type HmacSha256 = Hmac<Sha256>;

/// Errors raised while loading, creating, or parsing node identity material.
#[derive(Debug)]
pub enum IdentityError {
    /// Underlying filesystem failure.
    Io(std::io::Error),
    /// The identity file's JSON did not parse or its key material was malformed.
    Decode(String),
    /// An HMAC key was required (manifest signing) but none is configured.
    MissingHmacKey,
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "identity I/O error: {err}"),
            Self::Decode(err) => write!(f, "identity decode error: {err}"),
            Self::MissingHmacKey => write!(f, "manifest signing requires HMAC_KEY"),
        }
    }
}

impl std::error::Error for IdentityError {}

impl From<std::io::Error> for IdentityError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// A node's persistent identity, as `spec.md` §3 "Node Identity".
///
/// Created once on first run and loaded verbatim on every subsequent start;
/// only the router process owns a `SigningKey` derived from it, every other
/// component sees this read-only public record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// UUID-v4-shaped identifier that never changes across restarts.
    pub node_id: String,
    /// Hostname recorded at creation time.
    pub hostname: String,
    /// `std::env::consts::OS` value recorded at creation time.
    pub platform: String,
    /// UTC timestamp this identity was created.
    pub created_at: String,
    /// Base64 of the 32-byte ed25519 public key.
    pub public_key: String,
    /// Base64 of the 32-byte ed25519 secret seed. Never transmitted to peers
    /// — only `public_key` appears in handshakes, presence, and manifests.
    secret_key: String,
}

impl NodeIdentity {
    /// Loads the identity at `path`, creating and persisting a fresh one if
    /// the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        match std::fs::read(path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|err| IdentityError::Decode(err.to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.persist(path)?;
                Ok(identity)
            }
            Err(err) => Err(IdentityError::Io(err)),
        }
    }

    fn generate() -> Self {
        let mut rng = OsRng;
        let signing = SigningKey::generate(&mut rng);
        let verifying = signing.verifying_key();
        Self {
            node_id: new_node_id(),
            hostname: hostname(),
            platform: std::env::consts::OS.to_string(),
            created_at: now_utc_string(),
            public_key: BASE64.encode(verifying.to_bytes()),
            secret_key: BASE64.encode(signing.to_bytes()),
        }
    }

    fn persist(&self, path: &Path) -> Result<(), IdentityError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|err| IdentityError::Decode(err.to_string()))?;
        atomic_write(path, contents.as_bytes())?;
        Ok(())
    }

    /// Reconstructs the ed25519 signing key for this node, for use by the
    /// router when producing handshake signatures or manifest HMACs that
    /// need the node's own secret material.
    pub fn signing_key(&self) -> Result<SigningKey, IdentityError> {
        let bytes = BASE64
            .decode(&self.secret_key)
            .map_err(|err| IdentityError::Decode(err.to_string()))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::Decode("secret key is not 32 bytes".to_string()))?;
        Ok(SigningKey::from_bytes(&array))
    }

    /// Decodes `public_key` into a verifying key, e.g. to validate a peer's
    /// self-reported key against a stored presence/handshake record.
    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        decode_public_key(&self.public_key)
    }
}

fn decode_public_key(b64: &str) -> Result<VerifyingKey, IdentityError> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|err| IdentityError::Decode(err.to_string()))?;
    VerifyingKey::try_from(bytes.as_slice()).map_err(|err| IdentityError::Decode(err.to_string()))
}

/// A UUID-v4-shaped identifier without pulling in the `uuid` crate: 16 random
/// bytes from the OS CSPRNG, hyphenated per RFC 4122 §4.4 layout.
fn new_node_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// The out-of-band peer manifest described in `SPEC_FULL.md` §3.1: exchanged
/// alongside presence files, and verified against a shared `HMAC_KEY` only
/// when a node has opted into `policy.require_sig`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerManifest {
    /// The signed fields.
    pub payload: ManifestPayload,
    /// Hex-encoded HMAC-SHA256 of the canonical JSON encoding of `payload`.
    pub hmac_sha256: String,
}

/// The signed fields of a [`PeerManifest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestPayload {
    /// UTC timestamp the manifest was produced.
    pub datetime_utc: String,
    /// The signing node's id.
    pub node: String,
    /// The signing node's platform string.
    pub platform: String,
    /// Canonical JSON encoding of the signing node's current policy.
    pub policy: String,
    /// The signing node's inbox path, as advertised to peers.
    pub inbox: String,
    /// The signing node's outbox path, as advertised to peers.
    pub outbox: String,
    /// Crate version that produced the manifest.
    pub version: String,
}

/// Signs a manifest payload with the shared `HMAC_KEY`, producing the
/// complete manifest ready to publish alongside a presence file.
pub fn sign_manifest(payload: ManifestPayload, hmac_key: &str) -> Result<PeerManifest, IdentityError> {
    let canonical = serde_json::to_vec(&payload).map_err(|err| IdentityError::Decode(err.to_string()))?;
    let mut mac = HmacSha256::new_from_slice(hmac_key.as_bytes())
        .map_err(|err| IdentityError::Decode(err.to_string()))?;
    mac.update(&canonical);
    let digest = mac.finalize().into_bytes();
    Ok(PeerManifest {
        payload,
        hmac_sha256: hex::encode(digest),
    })
}

/// Verifies a manifest's HMAC against the shared `HMAC_KEY`, in constant
/// time. Returns `Ok(())` on match, `Err` otherwise — callers with
/// `require_sig: true` must treat any `Err` the same as a missing manifest.
pub fn verify_manifest(manifest: &PeerManifest, hmac_key: &str) -> Result<(), IdentityError> {
    let canonical = serde_json::to_vec(&manifest.payload)
        .map_err(|err| IdentityError::Decode(err.to_string()))?;
    let mut mac = HmacSha256::new_from_slice(hmac_key.as_bytes())
        .map_err(|err| IdentityError::Decode(err.to_string()))?;
    mac.update(&canonical);
    let expected = hex::decode(&manifest.hmac_sha256)
        .map_err(|err| IdentityError::Decode(err.to_string()))?;
    mac.verify_slice(&expected)
        .map_err(|_| IdentityError::Decode("manifest HMAC mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_reloads_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let first = NodeIdentity::load_or_create(&path).unwrap();
        let second = NodeIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.node_id, second.node_id);
        assert_eq!(first.public_key, second.public_key);
    }

    #[test]
    fn node_id_is_uuid_shaped() {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::load_or_create(&dir.path().join("identity.json")).unwrap();
        let parts: Vec<&str> = identity.node_id.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![8, 4, 4, 4, 12]);
    }

    #[test]
    fn public_key_decodes_to_valid_verifying_key() {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::load_or_create(&dir.path().join("identity.json")).unwrap();
        assert!(identity.verifying_key().is_ok());
    }

    #[test]
    fn manifest_round_trips_with_correct_key() {
        let payload = ManifestPayload {
            datetime_utc: now_utc_string(),
            node: "node-a".to_string(),
            platform: "linux".to_string(),
            policy: "{}".to_string(),
            inbox: "/tmp/inbox".to_string(),
            outbox: "/tmp/outbox".to_string(),
            version: "0.1.0".to_string(),
        };
        let manifest = sign_manifest(payload, "sharedsecret").unwrap();
        assert!(verify_manifest(&manifest, "sharedsecret").is_ok());
    }

    #[test]
    fn manifest_rejects_wrong_key() {
        let payload = ManifestPayload {
            datetime_utc: now_utc_string(),
            node: "node-a".to_string(),
            platform: "linux".to_string(),
            policy: "{}".to_string(),
            inbox: "/tmp/inbox".to_string(),
            outbox: "/tmp/outbox".to_string(),
            version: "0.1.0".to_string(),
        };
        let manifest = sign_manifest(payload, "sharedsecret").unwrap();
        assert!(verify_manifest(&manifest, "wrongsecret").is_err());
    }

    #[test]
    fn manifest_rejects_tampered_payload() {
        let payload = ManifestPayload {
            datetime_utc: now_utc_string(),
            node: "node-a".to_string(),
            platform: "linux".to_string(),
            policy: "{}".to_string(),
            inbox: "/tmp/inbox".to_string(),
            outbox: "/tmp/outbox".to_string(),
            version: "0.1.0".to_string(),
        };
        let mut manifest = sign_manifest(payload, "sharedsecret").unwrap();
        manifest.payload.node = "node-b".to_string();
        assert!(verify_manifest(&manifest, "sharedsecret").is_err());
    }
}
