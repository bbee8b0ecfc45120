//! PitError: unified error type for mesh-pitfill public APIs.
//!
//! Every fallible entry point returns `Result<_, PitError>`. A zero-depression
//! step is not an error; it is reported through
//! [`FillOutcome::NoDepressions`](crate::pit::step::FillOutcome).

use crate::algs::collective::SyncPoint;
use thiserror::Error;

/// Unified error type for depression filling and sediment redistribution.
#[derive(Debug, Error)]
pub enum PitError {
    /// A configuration value is out of range; detected before the first step.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The partition handed in by the caller is inconsistent.
    #[error("invalid mesh partition: {0}")]
    InvalidMesh(String),
    /// A per-node field does not match the number of local nodes.
    #[error("field `{field}` has {got} entries, expected {expected}")]
    FieldLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
    /// Communication with a neighbor failed.
    #[error("communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A received buffer did not have the expected size.
    #[error("buffer size mismatch from rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// Ranks disagree on which step or phase they are executing.
    #[error(
        "fingerprint mismatch at {point:?}: rank {rank} sent {got:#x}, expected {expected:#x}"
    )]
    FingerprintMismatch {
        point: SyncPoint,
        rank: usize,
        expected: u64,
        got: u64,
    },
    /// Another rank rejected its input at a synchronisation point.
    #[error("rank {rank} rejected its step input at {point:?}")]
    PeerFailed { rank: usize, point: SyncPoint },
    /// Operations were called out of order (e.g. deposit before the first fill).
    #[error("step order violated: {0}")]
    StepOrder(String),
    /// The merged or solved depression graph could not be decoded.
    #[error("malformed depression graph: {0}")]
    MalformedGraph(String),
    /// Deposited sediment was not fully accounted for.
    #[error(
        "sediment not conserved: input {input}, kept {retained}, excess {excess}, outside {outside}"
    )]
    NonConservation {
        input: f64,
        retained: f64,
        excess: f64,
        outside: f64,
    },
    /// MPI could not be initialised.
    #[error("MPI error: {0}")]
    Mpi(String),
}

impl PitError {
    pub(crate) fn field_length(field: &'static str, expected: usize, got: usize) -> Self {
        PitError::FieldLength {
            field,
            expected,
            got,
        }
    }

    /// Check that `got` matches `expected` for the named per-node field.
    pub(crate) fn check_len(field: &'static str, expected: usize, got: usize) -> Result<(), Self> {
        if expected == got {
            Ok(())
        } else {
            Err(Self::field_length(field, expected, got))
        }
    }
}
