//! Crate-wide error aggregation.
//!
//! Each subsystem defines its own error enum close to the code that raises
//! it (`EnvelopeError`, `TransportError`, `PipelineError`, ...). `RelayError`
//! exists only at the daemon's outermost boundary — the CLI entrypoint — so
//! that a single `Result<(), RelayError>` can flow out of `main` without the
//! caller needing to match on every subsystem's concrete type.

use thiserror::Error;

use crate::config::PolicyError;
use crate::envelope::EnvelopeError;
use crate::identity::IdentityError;
use crate::lock::LockError;
use crate::pipeline::PipelineError;
use crate::rendezvous::RendezvousError;
use crate::transport::TransportError;

/// Top-level error type surfaced to the CLI.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Policy file could not be loaded or parsed.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),
    /// Node identity could not be loaded, created, or parsed.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    /// Envelope encode/decode failure at a boundary that must surface.
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    /// Transport bind/listen failure during startup.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// File pipeline failure severe enough to abort startup.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    /// Rendezvous publish/lookup/remove failure.
    #[error("rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),
    /// Single-instance lock could not be acquired or released.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    /// Generic I/O failure not otherwise categorized.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
