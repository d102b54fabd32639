/*!
 * Error Types
 * Centralized error handling with thiserror, one enum per component composed
 * into a single top-level error, mirroring `core::errors::KernelError` in the
 * kernel this pipeline was generalized from.
 */

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("anomaly is missing fields required to compute a fingerprint (metric/value/ewma)")]
    InvalidAnomaly,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error(transparent)]
    InvalidAnomaly(#[from] FingerprintError),

    #[error("lease does not match any claimed anomaly")]
    InvalidLease,

    #[error("no pending anomalies")]
    Empty,

    #[error("backpressure: queue is settling after a cascade")]
    Settling,

    #[error("anomaly {0} not found")]
    NotFound(Uuid),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("a verification is already in progress for this fingerprint")]
    AlreadyVerifying,

    #[error("no active verification for this fingerprint")]
    NotFound,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error("actor task is no longer running")]
    ActorUnavailable,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
