//! Identifier and value types shared between the transaction core and the
//! provider.
//!
//! The core stores and forwards these values but never interprets the
//! provider-owned parts (`WsHandle::opaque`, key and data bytes).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction identifier assigned by the integration layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    const INVALID: u64 = u64::MAX;

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The "no active transaction" sentinel
    pub fn invalid() -> Self {
        Self(Self::INVALID)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != Self::INVALID
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::invalid()
    }
}

impl From<u64> for TransactionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Global sequence number. Positive once the provider has ordered a write-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Seqno(i64);

impl Seqno {
    pub const UNDEFINED: Seqno = Seqno(-1);

    pub fn new(seqno: i64) -> Self {
        Self(seqno)
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    pub fn is_undefined(&self) -> bool {
        self.0 <= 0
    }

    pub fn next(&self) -> Seqno {
        Seqno(self.0.max(0) + 1)
    }

    pub fn prev(&self) -> Seqno {
        Seqno(self.0 - 1)
    }
}

impl Default for Seqno {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the node a write-set originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identity of the owning session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global transaction id: position of a write-set in the cluster history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Gtid {
    pub source: SourceId,
    pub seqno: Seqno,
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.seqno)
    }
}

/// Source transaction id: who produced a write-set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Stid {
    pub source: SourceId,
    pub trx: TransactionId,
    pub client: ClientId,
}

/// Ordering metadata filled in by the provider on certification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrxMeta {
    pub gtid: Gtid,
    pub stid: Stid,
    /// Last seqno this write-set must wait for before it can be applied
    /// in parallel on other nodes
    pub depends_on: Seqno,
}

impl TrxMeta {
    pub fn seqno(&self) -> Seqno {
        self.gtid.seqno
    }
}

/// Handle identifying a transaction's write-set to the provider.
///
/// `opaque` belongs to the provider and is only stored and forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WsHandle {
    pub trx_id: TransactionId,
    pub opaque: u64,
}

impl WsHandle {
    pub fn new(trx_id: TransactionId) -> Self {
        Self { trx_id, opaque: 0 }
    }
}

bitflags::bitflags! {
    /// Flags passed to the provider with a write-set
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TxnFlags: u32 {
        /// Last fragment of the transaction
        const TRX_END = 1 << 0;
        const ROLLBACK = 1 << 1;
        /// Write-set must not be applied out of order on other nodes
        const PA_UNSAFE = 1 << 3;
        /// First fragment of the transaction
        const TRX_START = 1 << 6;
    }
}

impl fmt::Display for TxnFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.bits())
    }
}

/// Key access type for certification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyKind {
    /// Read / reference access, does not conflict with other shared keys
    Shared,
    /// Write access
    Exclusive,
}

/// A certification key: a path of byte segments (e.g. schema, table, row)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub kind: KeyKind,
    pub parts: Vec<Vec<u8>>,
}

impl Key {
    pub fn exclusive<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        Self {
            kind: KeyKind::Exclusive,
            parts: parts.into_iter().map(|p| p.as_ref().to_vec()).collect(),
        }
    }

    pub fn shared<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        Self {
            kind: KeyKind::Shared,
            parts: parts.into_iter().map(|p| p.as_ref().to_vec()).collect(),
        }
    }
}

/// Opaque write-set payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data(pub Vec<u8>);

impl Data {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
