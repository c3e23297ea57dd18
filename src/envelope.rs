//! Envelope wire format: the framed unit of inter-node communication.
//!
//! Binary layout: a 2-byte big-endian header length `H`, then `H` bytes of
//! canonical (fixed key order, no whitespace) JSON header, then exactly
//! `pl` raw payload bytes. Grounded on this repo's `src/net/schema.rs`
//! pattern of a small `#[derive(Serialize, Deserialize)]` wire struct with a
//! hand-written `validate()`, applied here to a binary-framed header instead
//! of a standalone JSON document.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of hops an envelope may accumulate before it is no longer
/// forwardable, per `spec.md` §3.
pub const MAX_HOPS: usize = 32;

/// The wildcard destination meaning "deliver to every peer".
pub const BROADCAST: &str = "*";

/// Errors raised while encoding or decoding an [`Envelope`].
#[derive(Debug)]
pub enum EnvelopeError {
    /// The declared header length exceeds the available buffer, or the
    /// payload length disagrees with what remains after the header.
    Malformed(String),
    /// The header parsed but failed an envelope invariant (duplicate hop,
    /// negative/overflowing ttl).
    InvalidInvariant(String),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(err) => write!(f, "malformed envelope: {err}"),
            Self::InvalidInvariant(err) => write!(f, "invalid envelope: {err}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Message kind carried by an envelope, as `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    #[serde(rename = "DATA")]
    Data,
    #[serde(rename = "HANDSHAKE")]
    Handshake,
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "ROUTE")]
    Route,
}

/// Canonical on-wire header. Field order is fixed by declaration order —
/// `serde_json`'s struct serialization preserves it — which is what makes
/// `to_bytes`/`from_bytes` deterministic byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireHeader {
    id: String,
    t: MsgType,
    s: String,
    d: String,
    ttl: i32,
    h: Vec<String>,
    ts: u64,
    pl: u32,
}

/// The framed unit of inter-node communication.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// 8 hex character identifier, used for dedup.
    pub msg_id: String,
    /// Message kind, dictating how the router dispatches it.
    pub msg_type: MsgType,
    /// Node id of the originating node.
    pub source: String,
    /// Node id of the intended recipient, or [`BROADCAST`].
    pub destination: String,
    /// Remaining hop budget; reaching `0` stops forwarding.
    pub ttl: i32,
    /// Node ids this envelope has already passed through, most recent last.
    pub hops: Vec<String>,
    /// Unix timestamp the envelope was created.
    pub timestamp: u64,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Builds a new envelope with a freshly generated 8-character id.
    pub fn new(
        msg_type: MsgType,
        source: impl Into<String>,
        destination: impl Into<String>,
        ttl: i32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_id: new_msg_id(),
            msg_type,
            source: source.into(),
            destination: destination.into(),
            ttl,
            hops: Vec::new(),
            timestamp: crate::osutil::now_secs(),
            payload,
        }
    }

    /// Appends `node` to the hop list and decrements `ttl`, as the router
    /// does immediately before re-routing a forwarded envelope.
    pub fn add_hop(&mut self, node: &str) {
        self.hops.push(node.to_string());
        self.ttl -= 1;
    }

    /// `ttl > 0 ∧ len(hops) < MAX_HOPS`.
    pub fn can_forward(&self) -> bool {
        self.ttl > 0 && self.hops.len() < MAX_HOPS
    }

    /// Encodes the envelope to its binary wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let header = WireHeader {
            id: self.msg_id.clone(),
            t: self.msg_type,
            s: self.source.clone(),
            d: self.destination.clone(),
            ttl: self.ttl,
            h: self.hops.clone(),
            ts: self.timestamp,
            pl: self.payload.len() as u32,
        };
        let header_bytes =
            serde_json::to_vec(&header).map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
        if header_bytes.len() > u16::MAX as usize {
            return Err(EnvelopeError::Malformed("header too large".to_string()));
        }
        let mut out = Vec::with_capacity(2 + header_bytes.len() + self.payload.len());
        out.extend_from_slice(&(header_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decodes an envelope from its binary wire form, failing with
    /// `EnvelopeError::Malformed` on any length mismatch.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, EnvelopeError> {
        if buf.len() < 2 {
            return Err(EnvelopeError::Malformed("buffer shorter than length prefix".to_string()));
        }
        let header_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + header_len {
            return Err(EnvelopeError::Malformed("header length exceeds buffer".to_string()));
        }
        let header: WireHeader = serde_json::from_slice(&buf[2..2 + header_len])
            .map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
        let remaining = &buf[2 + header_len..];
        if remaining.len() != header.pl as usize {
            return Err(EnvelopeError::Malformed(format!(
                "payload length {} disagrees with remaining {} bytes",
                header.pl,
                remaining.len()
            )));
        }
        Ok(Self {
            msg_id: header.id,
            msg_type: header.t,
            source: header.s,
            destination: header.d,
            ttl: header.ttl,
            hops: header.h,
            timestamp: header.ts,
            payload: remaining.to_vec(),
        })
    }
}

fn new_msg_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trips_a_simple_envelope() {
        let env = Envelope::new(MsgType::Data, "node-a", "node-b", 8, b"hello".to_vec());
        let bytes = env.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn rejects_truncated_header_length() {
        let mut bytes = vec![0xff, 0xff];
        bytes.extend_from_slice(b"short");
        assert!(matches!(Envelope::from_bytes(&bytes), Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn rejects_payload_length_mismatch() {
        let env = Envelope::new(MsgType::Data, "node-a", "node-b", 8, b"hello".to_vec());
        let mut bytes = env.to_bytes().unwrap();
        bytes.push(0xAA);
        assert!(matches!(Envelope::from_bytes(&bytes), Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn add_hop_decrements_ttl_and_appends_node() {
        let mut env = Envelope::new(MsgType::Data, "node-a", "*", 3, vec![]);
        env.add_hop("node-b");
        assert_eq!(env.ttl, 2);
        assert_eq!(env.hops, vec!["node-b".to_string()]);
    }

    #[test]
    fn can_forward_is_false_at_zero_ttl() {
        let mut env = Envelope::new(MsgType::Data, "node-a", "*", 1, vec![]);
        assert!(env.can_forward());
        env.add_hop("node-b");
        assert!(!env.can_forward());
    }

    #[test]
    fn can_forward_is_false_at_max_hops() {
        let mut env = Envelope::new(MsgType::Data, "node-a", "*", 1000, vec![]);
        for i in 0..MAX_HOPS {
            assert!(env.can_forward());
            env.add_hop(&format!("node-{i}"));
        }
        assert!(!env.can_forward());
    }

    proptest! {
        #[test]
        fn round_trip_holds_for_arbitrary_envelopes(
            msg_id in "[0-9a-f]{8}",
            source in "[a-zA-Z0-9_-]{1,16}",
            destination in "[a-zA-Z0-9_*-]{1,16}",
            ttl in -5i32..1000,
            hops in proptest::collection::vec("[a-zA-Z0-9_-]{1,8}", 0..10),
            timestamp in 0u64..4_000_000_000,
            payload in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let env = Envelope {
                msg_id,
                msg_type: MsgType::Data,
                source,
                destination,
                ttl,
                hops,
                timestamp,
                payload,
            };
            let bytes = env.to_bytes().unwrap();
            let decoded = Envelope::from_bytes(&bytes).unwrap();
            prop_assert_eq!(env, decoded);
        }
    }
}
