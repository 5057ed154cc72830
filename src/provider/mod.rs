//! Certification provider interface
//!
//! The provider is the global sequencer and conflict detector. The
//! transaction core calls it to register a write-set, append keys and
//! data, certify, pass through the global commit order and release.
//!
//! Implementations must be safe to call from several threads at once. The
//! core never holds a transaction's mutex while calling into the provider,
//! so a provider may block (waiting for a cluster-wide decision or for its
//! turn in commit order) and may deliver BF-aborts from its own threads.

pub mod certification;
pub mod memory;

pub use certification::{CertificationIndex, WriteSet};
pub use memory::{InMemoryProvider, SyncPoint};

use std::fmt;

use crate::types::{ClientId, Data, Key, Seqno, TransactionId, TrxMeta, TxnFlags, WsHandle};

/// Result of a provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderStatus {
    Success,
    /// Succeeded with a non-fatal condition
    Warning,
    /// The provider has no write-set for this transaction
    TransactionMissing,
    /// Operation failed, transaction must be rolled back
    TransactionFailed,
    /// The transaction was brute-force aborted inside the provider
    BfAbort,
    /// Write-set conflicts with an already ordered write-set
    CertificationFailed,
    SizeExceeded,
    ConnectionFailed,
    NodeFailed,
    Fatal,
    NotImplemented,
}

impl ProviderStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ProviderStatus::Success | ProviderStatus::Warning)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Success => "success",
            ProviderStatus::Warning => "warning",
            ProviderStatus::TransactionMissing => "transaction missing",
            ProviderStatus::TransactionFailed => "transaction failed",
            ProviderStatus::BfAbort => "brute force abort",
            ProviderStatus::CertificationFailed => "certification failed",
            ProviderStatus::SizeExceeded => "size exceeded",
            ProviderStatus::ConnectionFailed => "connection failed",
            ProviderStatus::NodeFailed => "node failed",
            ProviderStatus::Fatal => "fatal",
            ProviderStatus::NotImplemented => "not implemented",
        }
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait implemented by certification providers.
///
/// All write-set primitives are keyed by the opaque [`WsHandle`] handed out
/// by [`Provider::start_transaction`].
pub trait Provider: Send + Sync {
    /// Register a new write-set. The provider may fill in `handle.opaque`.
    fn start_transaction(&self, handle: &mut WsHandle) -> ProviderStatus;

    /// Append a certification key to the write-set
    fn append_key(&self, handle: &WsHandle, key: &Key) -> ProviderStatus;

    /// Append payload to the write-set
    fn append_data(&self, handle: &WsHandle, data: &Data) -> ProviderStatus;

    /// Replicate and certify the write-set.
    ///
    /// On `Success` the provider has filled `meta` with the global ordering
    /// of the write-set. `BfAbort` may also carry an ordered `meta` if the
    /// abort raced with ordering.
    fn certify(
        &self,
        client: ClientId,
        handle: &WsHandle,
        flags: TxnFlags,
        meta: &mut TrxMeta,
    ) -> ProviderStatus;

    /// Block until it is this write-set's turn in global commit order
    fn commit_order_enter(&self, handle: &WsHandle, meta: &TrxMeta) -> ProviderStatus;

    /// Leave the commit order, letting the next write-set commit
    fn commit_order_leave(&self, handle: &WsHandle, meta: &TrxMeta) -> ProviderStatus;

    /// Release all provider resources held for the write-set, including a
    /// commit order position that was never left.
    fn release(&self, handle: &WsHandle) -> ProviderStatus;

    /// Discard the transaction on the provider side (replicating a rollback
    /// event if any fragment was already replicated)
    fn rollback(&self, id: TransactionId) -> ProviderStatus;

    /// Wake up `victim` if it is blocked inside the provider. Called after
    /// the core has accepted a BF-abort by `bf_seqno`.
    fn bf_abort(&self, bf_seqno: Seqno, victim: TransactionId) -> ProviderStatus;
}
