//! Shared error model and transaction status taxonomy.

use thiserror::Error;

use crate::ids::PartitionSet;

/// Unified result type used by all public interfaces in `hornet`.
pub type HornetResult<T> = Result<T, HornetError>;

/// Infrastructure failures.
///
/// Transaction-level aborts are *not* errors in this sense; they travel as
/// [`AbortReason`] inside client responses and work results. Anything in this
/// enum that reaches the executor loop is treated as fatal for the cluster.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HornetError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Wire payload is malformed or exceeds format limits.
    #[error("codec error: {0}")]
    Codec(String),

    /// A channel peer went away while a message was outstanding.
    #[error("channel disconnected: {0}")]
    Disconnected(&'static str),

    /// The storage engine rejected an operation that must never fail.
    #[error("engine fault: {0}")]
    EngineFault(String),
}

/// Final status of one transaction at one partition, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Committed.
    Ok,
    /// Procedure aborted voluntarily.
    AbortUser,
    /// Predicted partition set was wrong; requeue as multi-partition.
    AbortMispredict,
    /// Invalidated by a cascading speculative rollback; requeue.
    AbortSpeculative,
    /// Touched an evicted tuple; the anti-cache layer retries.
    AbortEvictedAccess,
    /// Partition is in halt mode; no engine work was done.
    AbortReject,
    /// Constraint/SQL/engine error surfaced to the client.
    AbortUnexpected,
}

impl Status {
    /// Returns whether this status is any kind of abort.
    #[must_use]
    pub fn is_abort(self) -> bool {
        self != Status::Ok
    }

    /// Returns whether the transaction must be requeued for another attempt
    /// instead of answering the client with a failure.
    #[must_use]
    pub fn needs_restart(self) -> bool {
        matches!(
            self,
            Status::AbortMispredict | Status::AbortSpeculative | Status::AbortEvictedAccess
        )
    }
}

/// Why a transaction aborted, with enough payload for the recovery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The procedure called its abort primitive.
    User(String),
    /// Dispatch discovered a partition outside the predicted set.
    Misprediction {
        /// Partitions the transaction actually touched before the abort.
        touched: PartitionSet,
    },
    /// A distributed abort rolled this speculative transaction back.
    Speculative {
        /// Partitions the transaction touched before the rollback.
        touched: PartitionSet,
    },
    /// The engine hit a tuple that was evicted to cold storage.
    EvictedAccess {
        /// Table the access landed on.
        table: String,
    },
    /// The partition rejected the request outright.
    Reject(&'static str),
    /// Constraint violation, SQL failure, or engine error.
    Unexpected(String),
}

impl AbortReason {
    /// Maps the reason onto its wire status.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            AbortReason::User(_) => Status::AbortUser,
            AbortReason::Misprediction { .. } => Status::AbortMispredict,
            AbortReason::Speculative { .. } => Status::AbortSpeculative,
            AbortReason::EvictedAccess { .. } => Status::AbortEvictedAccess,
            AbortReason::Reject(_) => Status::AbortReject,
            AbortReason::Unexpected(_) => Status::AbortUnexpected,
        }
    }
}
