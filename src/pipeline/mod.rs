//! File processing pipeline: policy gate, codec/AEAD subprocess
//! invocation, checksum-verified ingestion, per `spec.md` §4.8/§4.9.

pub mod codec;
pub mod deliver;
pub mod ingest;

use std::fmt;

/// Errors raised while moving a file through the ingest/deliver pipeline.
#[derive(Debug)]
pub enum PipelineError {
    /// A candidate file failed the policy gate (untrusted host, disallowed
    /// suffix, or oversize).
    PolicyBlock(String),
    /// The codec subprocess exited non-zero or could not be spawned.
    CodecFailed(String),
    /// The AEAD subprocess exited non-zero or could not be spawned.
    AeadFailed(String),
    /// The sidecar SHA-256 did not match the artifact's computed digest.
    ChecksumMismatch,
    /// Underlying filesystem failure.
    Io(std::io::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyBlock(reason) => write!(f, "policy block: {reason}"),
            Self::CodecFailed(err) => write!(f, "codec failed: {err}"),
            Self::AeadFailed(err) => write!(f, "aead failed: {err}"),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::Io(err) => write!(f, "pipeline I/O error: {err}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Wire payload carrying an encoded `.freq` artifact across a DATA envelope
/// — the `.freq` file is the sole cross-host transport unit for user files,
/// per `spec.md`'s GLOSSARY; this struct is how it rides inside `Envelope`
/// payload bytes alongside the name and digest the receiving node needs to
/// drop it back into its own inbox for `deliver_one` to pick up.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct FileTransfer {
    /// The `.freq` (or `.aead.freq`) file name, including its full suffix chain.
    pub file_name: String,
    /// Lowercase hex SHA-256 of the artifact, written as the receiver's sidecar.
    pub sha256: String,
    /// The artifact's bytes, base64-encoded.
    pub bytes_b64: String,
}
