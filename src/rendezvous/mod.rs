//! Pairing / rendezvous: publish, lookup, and remove short-lived wormhole
//! codes, over an interchangeable file- or HTTP-backed store, per
//! `spec.md` §4.10.

pub mod file_backend;
pub mod http_backend;

use std::fmt;
use std::net::SocketAddr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::osutil::now_secs;

/// Default lifetime of a published code, per `spec.md` §3.
pub const CODE_EXPIRY_SEC: u64 = 300;

/// Errors raised while publishing, looking up, or removing a wormhole code.
#[derive(Debug)]
pub enum RendezvousError {
    /// No entry exists for the requested code.
    NotFound,
    /// The entry exists but its lifetime has elapsed.
    Expired,
    /// Underlying filesystem failure (file backend only).
    Io(std::io::Error),
    /// Underlying HTTP transport failure (HTTP backend only).
    Http(String),
}

impl fmt::Display for RendezvousError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "code not found"),
            Self::Expired => write!(f, "code expired"),
            Self::Io(err) => write!(f, "rendezvous I/O error: {err}"),
            Self::Http(err) => write!(f, "rendezvous HTTP error: {err}"),
        }
    }
}

impl std::error::Error for RendezvousError {}

impl From<std::io::Error> for RendezvousError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// A published pairing entry, `spec.md` §3 "Wormhole Code".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WormholeCode {
    /// The human-pronounceable code itself, e.g. `7-amber-anchor`.
    pub code: String,
    /// Node id of the publishing node.
    pub node_id: String,
    /// Hostname of the publishing node.
    pub hostname: String,
    /// Base64 ed25519 public key of the publishing node.
    pub public_key: String,
    /// TCP address of the publishing node, if it runs the socket transport.
    pub socket_addr: Option<SocketAddr>,
    /// Unix timestamp this entry was published.
    pub created_at: u64,
    /// Unix timestamp this entry stops being a valid lookup target.
    pub expires_at: u64,
}

impl WormholeCode {
    /// Whether the current time is at or past `expires_at`.
    pub fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }
}

/// Interchangeable rendezvous backend — file-based or HTTP-based — with
/// identical semantics.
#[async_trait::async_trait]
pub trait Rendezvous: Send + Sync {
    /// Publishes or overwrites the entry for `entry.code`.
    async fn publish(&self, entry: WormholeCode) -> Result<(), RendezvousError>;
    /// Looks up `code`, failing with `NotFound`/`Expired` as appropriate.
    async fn lookup(&self, code: &str) -> Result<WormholeCode, RendezvousError>;
    /// Removes the entry for `code`, if any. Idempotent.
    async fn remove(&self, code: &str) -> Result<(), RendezvousError>;
}

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusty", "eager", "frosty", "golden", "hollow",
    "indigo", "jolly", "keen", "lucid", "mellow", "nimble", "opal", "quiet",
];

const NOUNS: &[&str] = &[
    "anchor", "beacon", "canyon", "delta", "ember", "falcon", "glacier",
    "harbor", "island", "juniper", "kettle", "lantern", "meadow", "nebula",
];

/// Generates a code `{1..999}-<adj>-<noun>` using a cryptographic RNG for
/// the numeric prefix, per `spec.md` §9's note on avoiding predictable codes.
pub fn generate_code() -> String {
    let mut rng = rand::rngs::OsRng;
    let number: u32 = rng.gen_range(1..=999);
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{number}-{adjective}-{noun}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_code_matches_expected_shape() {
        let code = generate_code();
        let parts: Vec<&str> = code.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].parse::<u32>().is_ok());
    }

    #[test]
    fn is_expired_reflects_expires_at() {
        let entry = WormholeCode {
            code: "1-amber-anchor".to_string(),
            node_id: "node-a".to_string(),
            hostname: "host-a".to_string(),
            public_key: "pk".to_string(),
            socket_addr: None,
            created_at: now_secs(),
            expires_at: now_secs().saturating_sub(1),
        };
        assert!(entry.is_expired());
    }
}
