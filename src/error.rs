//! Error types for minirep
//!
//! Every lifecycle operation returns `Result<()>`. The error carries enough
//! information for the owning session to decide what to do next, and
//! [`ReplError::status`] collapses it into the small status code set that
//! an engine integration layer switches on.

use std::fmt;
use std::io;

use crate::provider::ProviderStatus;
use crate::transaction::State;
use crate::types::{Seqno, TransactionId};

/// Unified error type for minirep operations
#[derive(Debug)]
pub enum ReplError {
    /// Certification rejected the write-set. Terminal for this attempt,
    /// the caller must roll back.
    CertificationFailed { id: TransactionId },
    /// The transaction was brute-force aborted and must be rolled back.
    BfAborted { id: TransactionId, bf_seqno: Seqno },
    /// The transaction was brute-force aborted after its write-set was
    /// ordered and must be replayed.
    MustReplay { id: TransactionId },
    /// Lifecycle call on a context with no active transaction
    NotActive(&'static str),
    /// `start_transaction` while a transaction is already active
    AlreadyActive(TransactionId),
    /// Argument rejected by a lifecycle call (e.g. the invalid id)
    InvalidArgument(&'static str),
    /// Key or data appended outside of `executing` / `preparing`
    Append { id: TransactionId, state: State },
    /// Attempted a transition outside the state graph
    InvalidTransition { from: State, to: State },
    /// Operation not valid in the current state
    InvalidState { operation: &'static str, state: State },
    /// Provider call failed
    Provider { operation: &'static str, status: ProviderStatus },
    /// Unrecoverable failure (e.g. replay failed)
    Fatal(String),
    /// I/O error (config files, reports)
    Io(io::Error),
    /// JSON error (config files, reports)
    Json(String),
    /// Invalid configuration value
    Config(String),
}

/// Status code returned to the integration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    Success,
    CertificationFailed,
    MustAbort,
    MustReplay,
    /// Protocol misuse by the integration layer
    ProtocolError,
    ProviderError,
    Fatal,
}

impl TxnStatus {
    /// Stable integer code: zero on success, negative otherwise.
    pub fn code(&self) -> i32 {
        match self {
            TxnStatus::Success => 0,
            TxnStatus::CertificationFailed => -1,
            TxnStatus::MustAbort => -2,
            TxnStatus::MustReplay => -3,
            TxnStatus::ProtocolError => -4,
            TxnStatus::ProviderError => -5,
            TxnStatus::Fatal => -6,
        }
    }

    /// Collapse an operation result into a status.
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => TxnStatus::Success,
            Err(e) => e.status(),
        }
    }
}

impl ReplError {
    /// Map the error into the lifecycle status code set
    pub fn status(&self) -> TxnStatus {
        match self {
            ReplError::CertificationFailed { .. } => TxnStatus::CertificationFailed,
            ReplError::BfAborted { .. } => TxnStatus::MustAbort,
            ReplError::MustReplay { .. } => TxnStatus::MustReplay,
            ReplError::NotActive(_)
            | ReplError::AlreadyActive(_)
            | ReplError::InvalidArgument(_)
            | ReplError::Append { .. }
            | ReplError::InvalidTransition { .. }
            | ReplError::InvalidState { .. } => TxnStatus::ProtocolError,
            ReplError::Provider { .. } => TxnStatus::ProviderError,
            ReplError::Fatal(_) | ReplError::Io(_) | ReplError::Json(_) | ReplError::Config(_) => {
                TxnStatus::Fatal
            }
        }
    }

    /// True if the caller has to roll the transaction back
    pub fn requires_rollback(&self) -> bool {
        matches!(
            self.status(),
            TxnStatus::CertificationFailed | TxnStatus::MustAbort | TxnStatus::ProviderError
        )
    }
}

impl fmt::Display for ReplError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplError::CertificationFailed { id } => {
                write!(f, "Certification failed for transaction {}", id)
            }
            ReplError::BfAborted { id, bf_seqno } => write!(
                f,
                "Transaction {} was brute-force aborted by write-set {}",
                id, bf_seqno
            ),
            ReplError::MustReplay { id } => write!(f, "Transaction {} must be replayed", id),
            ReplError::NotActive(op) => write!(f, "{}: no active transaction", op),
            ReplError::AlreadyActive(id) => {
                write!(f, "Transaction {} already in progress", id)
            }
            ReplError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            ReplError::Append { id, state } => write!(
                f,
                "Cannot append to transaction {} in state '{}'",
                id, state
            ),
            ReplError::InvalidTransition { from, to } => {
                write!(f, "Invalid state transition '{}' -> '{}'", from, to)
            }
            ReplError::InvalidState { operation, state } => {
                write!(f, "{} not allowed in state '{}'", operation, state)
            }
            ReplError::Provider { operation, status } => {
                write!(f, "Provider {} failed: {}", operation, status)
            }
            ReplError::Fatal(msg) => write!(f, "{}", msg),
            ReplError::Io(e) => write!(f, "{}", e),
            ReplError::Json(msg) => write!(f, "{}", msg),
            ReplError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ReplError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReplError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ReplError {
    fn from(e: io::Error) -> Self {
        ReplError::Io(e)
    }
}

impl From<serde_json::Error> for ReplError {
    fn from(e: serde_json::Error) -> Self {
        ReplError::Json(e.to_string())
    }
}

/// Result type alias for minirep operations
pub type Result<T> = std::result::Result<T, ReplError>;
