//! Pipeline error taxonomy
//!
//! Every failure the pipeline can surface maps onto one of these kinds with a
//! stable numeric code. Transient I/O problems are retried inside the
//! component that owns the I/O and become counter increments, not errors;
//! only `InvariantViolation` is allowed to take the process down.

use thiserror::Error;

/// Sub-reason for `ResourceExhausted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustKind {
    Fuel,
    Time,
    Memory,
}

impl ExhaustKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExhaustKind::Fuel => "fuel",
            ExhaustKind::Time => "time",
            ExhaustKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Error)]
pub enum MipError {
    #[error("config error: {0}")]
    Config(String),

    #[error("endpoint unreachable: {0}")]
    EndpointUnreachable(String),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("artifact integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("resource exhausted ({}): {detail}", reason.as_str())]
    ResourceExhausted { reason: ExhaustKind, detail: String },

    #[error("simulation reverted: {0}")]
    SimulationRevert(String),

    #[error("nonce conflict: {0}")]
    NonceConflict(String),

    #[error("relay rejected: {0}")]
    RelayRejected(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl MipError {
    /// Stable kind label, used as a metric label and in control-plane payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            MipError::Config(_) => "config_error",
            MipError::EndpointUnreachable(_) => "endpoint_unreachable",
            MipError::ProtocolMismatch(_) => "protocol_mismatch",
            MipError::IntegrityFailure(_) => "integrity_failure",
            MipError::ResourceExhausted { .. } => "resource_exhausted",
            MipError::SimulationRevert(_) => "simulation_revert",
            MipError::NonceConflict(_) => "nonce_conflict",
            MipError::RelayRejected(_) => "relay_rejected",
            MipError::Cancelled => "cancelled",
            MipError::InvariantViolation(_) => "invariant_violation",
        }
    }

    /// Stable numeric code surfaced on the control plane.
    pub fn code(&self) -> u16 {
        match self {
            MipError::Config(_) => 100,
            MipError::EndpointUnreachable(_) => 101,
            MipError::ProtocolMismatch(_) => 102,
            MipError::IntegrityFailure(_) => 103,
            MipError::ResourceExhausted { .. } => 104,
            MipError::SimulationRevert(_) => 105,
            MipError::NonceConflict(_) => 106,
            MipError::RelayRejected(_) => 107,
            MipError::Cancelled => 108,
            MipError::InvariantViolation(_) => 109,
        }
    }

    /// Whether the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MipError::EndpointUnreachable(_) | MipError::NonceConflict(_)
        )
    }
}

pub type MipResult<T> = Result<T, MipError>;

/// Process exit codes for the `stingbot` binary.
pub mod exit {
    pub const OK: i32 = 0;
    pub const CONFIG: i32 = 64;
    pub const UNREACHABLE: i32 = 69;
    pub const INVARIANT: i32 = 70;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_unique() {
        let errs = [
            MipError::Config("x".into()),
            MipError::EndpointUnreachable("x".into()),
            MipError::ProtocolMismatch("x".into()),
            MipError::IntegrityFailure("x".into()),
            MipError::ResourceExhausted {
                reason: ExhaustKind::Fuel,
                detail: "x".into(),
            },
            MipError::SimulationRevert("x".into()),
            MipError::NonceConflict("x".into()),
            MipError::RelayRejected("x".into()),
            MipError::Cancelled,
            MipError::InvariantViolation("x".into()),
        ];
        let mut codes: Vec<u16> = errs.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn retryable_kinds() {
        assert!(MipError::NonceConflict("stale".into()).is_retryable());
        assert!(!MipError::IntegrityFailure("digest".into()).is_retryable());
    }
}
