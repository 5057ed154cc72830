//! Write-set representation and key based certification
//!
//! A write-set is certified against every write-set ordered after the
//! snapshot it was executed on (`last_seen`). If any of those touched one of
//! its keys in a conflicting mode the write-set fails certification.
//!
//! ## Conflict rules
//! - exclusive vs exclusive: conflict
//! - exclusive vs shared: conflict
//! - shared vs shared: no conflict
//!
//! Replicated write-sets are binary-encoded with bincode, the same format
//! other nodes would apply them from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{ClientId, Data, Key, KeyKind, Seqno, SourceId, TransactionId, TxnFlags};

/// A transaction's accumulated keys and payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSet {
    pub trx_id: TransactionId,
    pub source: SourceId,
    pub client: ClientId,
    pub flags: TxnFlags,
    /// Highest seqno committed when the transaction started
    pub last_seen: Seqno,
    pub keys: Vec<Key>,
    pub data: Vec<Data>,
}

impl WriteSet {
    pub fn new(trx_id: TransactionId, source: SourceId, last_seen: Seqno) -> Self {
        Self {
            trx_id,
            source,
            client: ClientId::default(),
            flags: TxnFlags::empty(),
            last_seen,
            keys: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Approximate payload size in bytes
    pub fn size(&self) -> usize {
        let keys: usize = self
            .keys
            .iter()
            .map(|k| k.parts.iter().map(|p| p.len()).sum::<usize>())
            .sum();
        let data: usize = self.data.iter().map(|d| d.len()).sum();
        keys + data
    }

    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyEntry {
    last_exclusive: Seqno,
    last_shared: Seqno,
}

impl KeyEntry {
    fn max_seqno(&self) -> Seqno {
        self.last_exclusive.max(self.last_shared)
    }
}

/// Index of the last ordered write-set that referenced each key
#[derive(Debug, Default)]
pub struct CertificationIndex {
    entries: HashMap<Vec<Vec<u8>>, KeyEntry>,
}

impl CertificationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the seqno of the write-set `ws` conflicts with, if any
    pub fn check(&self, ws: &WriteSet) -> Option<Seqno> {
        let last_seen = ws.last_seen;
        ws.keys.iter().find_map(|key| {
            let entry = self.entries.get(&key.parts)?;
            let conflicting = match key.kind {
                KeyKind::Exclusive => entry.max_seqno(),
                KeyKind::Shared => entry.last_exclusive,
            };
            (conflicting > last_seen).then_some(conflicting)
        })
    }

    /// Record the keys of a write-set ordered at `seqno`
    pub fn insert(&mut self, ws: &WriteSet, seqno: Seqno) {
        for key in &ws.keys {
            let entry = self.entries.entry(key.parts.clone()).or_default();
            match key.kind {
                KeyKind::Exclusive => entry.last_exclusive = entry.last_exclusive.max(seqno),
                KeyKind::Shared => entry.last_shared = entry.last_shared.max(seqno),
            }
        }
    }

    /// Drop entries no in-flight write-set can conflict with anymore
    pub fn purge_up_to(&mut self, seqno: Seqno) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.max_seqno() > seqno);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
