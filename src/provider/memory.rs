//! In-process certification provider
//!
//! A single-node provider that does real certification and ordering:
//!
//! 1. `start_transaction` registers a write-set and records the last
//!    committed seqno as its snapshot (`last_seen`).
//! 2. `certify` assigns the next global seqno and checks the write-set's
//!    keys against the [`CertificationIndex`]. Successful write-sets are
//!    encoded with bincode into the replication log.
//! 3. `commit_order_enter` blocks on a condvar until every lower seqno has
//!    left the commit order (or was released / failed certification).
//! 4. `bf_abort` marks a victim and wakes it if it is waiting.
//!
//! ### Sync points
//! Tests can register callbacks that run at fixed points inside `certify`
//! and `commit_order_enter`. They run without any provider lock held, so a
//! callback may BF-abort the very transaction that is being processed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::certification::{CertificationIndex, WriteSet};
use super::{Provider, ProviderStatus};
use crate::config::ProviderConfig;
use crate::types::{
    ClientId, Data, Gtid, Key, Seqno, SourceId, Stid, TransactionId, TrxMeta, TxnFlags, WsHandle,
};

/// Points inside the provider where a test callback can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPoint {
    BeforeCertify,
    AfterCertify,
    BeforeCommitOrderEnter,
}

type SyncCallback = Arc<dyn Fn(TransactionId) + Send + Sync>;

/// Counters exposed for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub certified: u64,
    pub cert_failures: u64,
    pub bf_aborts: u64,
    pub released: u64,
    pub rollbacks: u64,
}

struct PendingWriteSet {
    ws: WriteSet,
    seqno: Seqno,
    bf_aborted: bool,
    /// The seqno has left (or been skipped in) commit order
    order_done: bool,
}

/// Tracks which seqnos have passed through commit order
#[derive(Debug)]
struct CommitOrder {
    last_left: Seqno,
    finished: BTreeSet<Seqno>,
}

impl CommitOrder {
    fn new() -> Self {
        Self {
            last_left: Seqno::new(0),
            finished: BTreeSet::new(),
        }
    }

    fn is_turn_of(&self, seqno: Seqno) -> bool {
        self.last_left.next() == seqno
    }

    fn finish(&mut self, seqno: Seqno) {
        if seqno <= self.last_left {
            return;
        }
        self.finished.insert(seqno);
        while self.finished.remove(&self.last_left.next()) {
            self.last_left = self.last_left.next();
        }
    }
}

struct ProviderState {
    next_opaque: u64,
    last_ordered: Seqno,
    write_sets: HashMap<TransactionId, PendingWriteSet>,
    index: CertificationIndex,
    commit_order: CommitOrder,
    replicated: BTreeMap<Seqno, Vec<u8>>,
    rollbacks: Vec<TransactionId>,
    stats: ProviderStats,
}

impl ProviderState {
    fn finish_order(&mut self, seqno: Seqno) {
        self.commit_order.finish(seqno);
        self.purge_index();
    }

    fn purge_index(&mut self) {
        let horizon = self
            .write_sets
            .values()
            .map(|p| p.ws.last_seen)
            .min()
            .unwrap_or(self.commit_order.last_left);
        self.index.purge_up_to(horizon);
    }
}

/// Single-node certification provider living in the same process
pub struct InMemoryProvider {
    config: ProviderConfig,
    state: Mutex<ProviderState>,
    /// Signalled whenever commit order advances or a victim is aborted
    order_changed: Condvar,
    sync_points: Mutex<HashMap<SyncPoint, SyncCallback>>,
}

impl InMemoryProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ProviderState {
                next_opaque: 1,
                last_ordered: Seqno::new(0),
                write_sets: HashMap::new(),
                index: CertificationIndex::new(),
                commit_order: CommitOrder::new(),
                replicated: BTreeMap::new(),
                rollbacks: Vec::new(),
                stats: ProviderStats::default(),
            }),
            order_changed: Condvar::new(),
            sync_points: Mutex::new(HashMap::new()),
        }
    }

    /// Start seqno assignment after `seqno`, as if that much history had
    /// already been committed
    pub fn with_initial_seqno(config: ProviderConfig, seqno: Seqno) -> Self {
        let provider = Self::new(config);
        {
            let mut state = provider.lock_state();
            state.last_ordered = seqno;
            state.commit_order.last_left = seqno;
        }
        provider
    }

    pub fn source_id(&self) -> SourceId {
        SourceId(self.config.source_id)
    }

    /// Register a callback for a sync point, replacing any previous one
    pub fn set_sync_point<F>(&self, point: SyncPoint, callback: F)
    where
        F: Fn(TransactionId) + Send + Sync + 'static,
    {
        self.lock_sync_points().insert(point, Arc::new(callback));
    }

    pub fn clear_sync_point(&self, point: SyncPoint) {
        self.lock_sync_points().remove(&point);
    }

    /// Highest seqno that has left commit order with no gaps below it
    pub fn last_committed(&self) -> Seqno {
        self.lock_state().commit_order.last_left
    }

    /// Highest seqno assigned so far
    pub fn last_ordered(&self) -> Seqno {
        self.lock_state().last_ordered
    }

    /// Decode the write-set replicated at `seqno`
    pub fn replicated_write_set(&self, seqno: Seqno) -> Option<WriteSet> {
        let state = self.lock_state();
        let bytes = state.replicated.get(&seqno)?;
        match WriteSet::decode(bytes) {
            Ok(ws) => Some(ws),
            Err(e) => {
                log::error!("Corrupt replicated write-set at seqno {}: {}", seqno, e);
                None
            }
        }
    }

    pub fn replicated_count(&self) -> usize {
        self.lock_state().replicated.len()
    }

    /// Transactions for which a rollback was replicated, in call order
    pub fn rollbacks(&self) -> Vec<TransactionId> {
        self.lock_state().rollbacks.clone()
    }

    /// Write-sets registered and not yet released
    pub fn pending_write_sets(&self) -> usize {
        self.lock_state().write_sets.len()
    }

    pub fn stats(&self) -> ProviderStats {
        self.lock_state().stats
    }

    fn lock_state(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sync_points(&self) -> MutexGuard<'_, HashMap<SyncPoint, SyncCallback>> {
        self.sync_points.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_sync_point(&self, point: SyncPoint, id: TransactionId) {
        let callback = self.lock_sync_points().get(&point).cloned();
        if let Some(callback) = callback {
            log::trace!("Running sync point {:?} for transaction {}", point, id);
            callback(id);
        }
    }

    fn exceeds_size_limit(&self, ws: &WriteSet, extra: usize) -> bool {
        self.config.max_write_set_bytes > 0 && ws.size() + extra > self.config.max_write_set_bytes
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new(ProviderConfig::default())
    }
}

impl Provider for InMemoryProvider {
    fn start_transaction(&self, handle: &mut WsHandle) -> ProviderStatus {
        let mut state = self.lock_state();
        handle.opaque = state.next_opaque;
        state.next_opaque += 1;

        let last_seen = state.commit_order.last_left;
        let pending = PendingWriteSet {
            ws: WriteSet::new(handle.trx_id, self.source_id(), last_seen),
            seqno: Seqno::UNDEFINED,
            bf_aborted: false,
            order_done: false,
        };
        if let Some(stale) = state.write_sets.insert(handle.trx_id, pending) {
            log::warn!(
                "Replacing unreleased write-set of transaction {}",
                stale.ws.trx_id
            );
            if !stale.seqno.is_undefined() && !stale.order_done {
                state.finish_order(stale.seqno);
                self.order_changed.notify_all();
            }
        }
        ProviderStatus::Success
    }

    fn append_key(&self, handle: &WsHandle, key: &Key) -> ProviderStatus {
        let mut state = self.lock_state();
        let Some(pending) = state.write_sets.get_mut(&handle.trx_id) else {
            return ProviderStatus::TransactionMissing;
        };
        let key_size: usize = key.parts.iter().map(|p| p.len()).sum();
        if self.exceeds_size_limit(&pending.ws, key_size) {
            return ProviderStatus::SizeExceeded;
        }
        pending.ws.keys.push(key.clone());
        ProviderStatus::Success
    }

    fn append_data(&self, handle: &WsHandle, data: &Data) -> ProviderStatus {
        let mut state = self.lock_state();
        let Some(pending) = state.write_sets.get_mut(&handle.trx_id) else {
            return ProviderStatus::TransactionMissing;
        };
        if self.exceeds_size_limit(&pending.ws, data.len()) {
            return ProviderStatus::SizeExceeded;
        }
        pending.ws.data.push(data.clone());
        ProviderStatus::Success
    }

    fn certify(
        &self,
        client: ClientId,
        handle: &WsHandle,
        flags: TxnFlags,
        meta: &mut TrxMeta,
    ) -> ProviderStatus {
        self.run_sync_point(SyncPoint::BeforeCertify, handle.trx_id);

        let status = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let source = self.source_id();
            let Some(pending) = state.write_sets.get_mut(&handle.trx_id) else {
                return ProviderStatus::TransactionMissing;
            };
            if pending.bf_aborted {
                // Aborted before replication, never ordered
                return ProviderStatus::BfAbort;
            }
            pending.ws.flags = flags;
            pending.ws.client = client;

            let seqno = state.last_ordered.next();
            state.last_ordered = seqno;
            pending.seqno = seqno;

            if let Some(conflict) = state.index.check(&pending.ws) {
                log::debug!(
                    "Write-set of transaction {} at seqno {} conflicts with seqno {}",
                    handle.trx_id,
                    seqno,
                    conflict
                );
                pending.order_done = true;
                state.stats.cert_failures += 1;
                state.finish_order(seqno);
                self.order_changed.notify_all();
                ProviderStatus::CertificationFailed
            } else {
                let bytes = match pending.ws.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Failed to encode write-set {}: {}", handle.trx_id, e);
                        return ProviderStatus::Fatal;
                    }
                };
                *meta = TrxMeta {
                    gtid: Gtid { source, seqno },
                    stid: Stid {
                        source,
                        trx: handle.trx_id,
                        client,
                    },
                    depends_on: if flags.contains(TxnFlags::PA_UNSAFE) {
                        seqno.prev()
                    } else {
                        pending.ws.last_seen
                    },
                };
                state.index.insert(&pending.ws, seqno);
                state.replicated.insert(seqno, bytes);
                state.stats.certified += 1;
                ProviderStatus::Success
            }
        };

        self.run_sync_point(SyncPoint::AfterCertify, handle.trx_id);
        status
    }

    fn commit_order_enter(&self, handle: &WsHandle, meta: &TrxMeta) -> ProviderStatus {
        self.run_sync_point(SyncPoint::BeforeCommitOrderEnter, handle.trx_id);

        let seqno = meta.seqno();
        if seqno.is_undefined() {
            return ProviderStatus::TransactionFailed;
        }
        let deadline = Instant::now() + Duration::from_millis(self.config.commit_order_timeout_ms);
        let mut state = self.lock_state();
        loop {
            match state.write_sets.get(&handle.trx_id) {
                None => return ProviderStatus::TransactionMissing,
                Some(pending) if pending.bf_aborted => return ProviderStatus::BfAbort,
                Some(_) => {}
            }
            if state.commit_order.is_turn_of(seqno) {
                return ProviderStatus::Success;
            }
            if seqno <= state.commit_order.last_left {
                log::error!("Seqno {} already left commit order", seqno);
                return ProviderStatus::TransactionFailed;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!(
                    "Timeout waiting for commit order of seqno {} (last committed {})",
                    seqno,
                    state.commit_order.last_left
                );
                return ProviderStatus::NodeFailed;
            }
            state = self
                .order_changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn commit_order_leave(&self, handle: &WsHandle, meta: &TrxMeta) -> ProviderStatus {
        let seqno = meta.seqno();
        let mut state = self.lock_state();
        if !state.commit_order.is_turn_of(seqno) {
            log::error!(
                "Transaction {} leaving commit order out of turn (seqno {}, last committed {})",
                handle.trx_id,
                seqno,
                state.commit_order.last_left
            );
            return ProviderStatus::TransactionFailed;
        }
        if let Some(pending) = state.write_sets.get_mut(&handle.trx_id) {
            pending.order_done = true;
        }
        state.finish_order(seqno);
        self.order_changed.notify_all();
        ProviderStatus::Success
    }

    fn release(&self, handle: &WsHandle) -> ProviderStatus {
        let mut state = self.lock_state();
        let Some(pending) = state.write_sets.remove(&handle.trx_id) else {
            return ProviderStatus::TransactionMissing;
        };
        state.stats.released += 1;
        if !pending.seqno.is_undefined() && !pending.order_done {
            log::debug!(
                "Releasing seqno {} of transaction {} without commit",
                pending.seqno,
                handle.trx_id
            );
            state.finish_order(pending.seqno);
        } else {
            state.purge_index();
        }
        self.order_changed.notify_all();
        ProviderStatus::Success
    }

    fn rollback(&self, id: TransactionId) -> ProviderStatus {
        let mut state = self.lock_state();
        state.rollbacks.push(id);
        state.stats.rollbacks += 1;
        ProviderStatus::Success
    }

    fn bf_abort(&self, bf_seqno: Seqno, victim: TransactionId) -> ProviderStatus {
        let mut state = self.lock_state();
        let Some(pending) = state.write_sets.get_mut(&victim) else {
            return ProviderStatus::TransactionMissing;
        };
        log::debug!("Write-set {} aborts transaction {}", bf_seqno, victim);
        pending.bf_aborted = true;
        state.stats.bf_aborts += 1;
        self.order_changed.notify_all();
        ProviderStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn started(provider: &InMemoryProvider, id: u64, keys: &[&str]) -> WsHandle {
        let mut handle = WsHandle::new(TransactionId::new(id));
        assert_eq!(provider.start_transaction(&mut handle), ProviderStatus::Success);
        for k in keys {
            assert_eq!(
                provider.append_key(&handle, &Key::exclusive(["t", k])),
                ProviderStatus::Success
            );
        }
        handle
    }

    fn certify(provider: &InMemoryProvider, handle: &WsHandle) -> (ProviderStatus, TrxMeta) {
        let mut meta = TrxMeta::default();
        let status = provider.certify(ClientId(1), handle, TxnFlags::TRX_END, &mut meta);
        (status, meta)
    }

    #[test]
    fn test_certify_assigns_increasing_seqnos() {
        let provider = InMemoryProvider::default();
        let h1 = started(&provider, 1, &["a"]);
        let h2 = started(&provider, 2, &["b"]);

        let (s1, m1) = certify(&provider, &h1);
        let (s2, m2) = certify(&provider, &h2);
        assert_eq!(s1, ProviderStatus::Success);
        assert_eq!(s2, ProviderStatus::Success);
        assert_eq!(m1.seqno(), Seqno::new(1));
        assert_eq!(m2.seqno(), Seqno::new(2));
        assert_eq!(m1.stid.trx, TransactionId::new(1));
        assert_ne!(h1.opaque, h2.opaque);
        assert_eq!(provider.replicated_count(), 2);
    }

    #[test]
    fn test_conflicting_write_sets() {
        let provider = InMemoryProvider::default();
        let h1 = started(&provider, 1, &["x"]);
        let h2 = started(&provider, 2, &["x"]);

        let (s1, m1) = certify(&provider, &h1);
        assert_eq!(s1, ProviderStatus::Success);
        // Both executed on the same snapshot, the second loses
        let (s2, m2) = certify(&provider, &h2);
        assert_eq!(s2, ProviderStatus::CertificationFailed);
        assert!(m2.seqno().is_undefined());
        assert_eq!(provider.stats().cert_failures, 1);

        // Failed seqno 2 must not block commit order
        assert_eq!(provider.commit_order_enter(&h1, &m1), ProviderStatus::Success);
        assert_eq!(provider.commit_order_leave(&h1, &m1), ProviderStatus::Success);
        assert_eq!(provider.last_committed(), Seqno::new(2));
    }

    #[test]
    fn test_commit_order_blocks_until_turn() {
        let provider = Arc::new(InMemoryProvider::default());
        let h1 = started(&provider, 1, &["a"]);
        let h2 = started(&provider, 2, &["b"]);
        let (_, m1) = certify(&provider, &h1);
        let (_, m2) = certify(&provider, &h2);

        let p = Arc::clone(&provider);
        let waiter = thread::spawn(move || {
            let status = p.commit_order_enter(&h2, &m2);
            let leave = p.commit_order_leave(&h2, &m2);
            (status, leave)
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(provider.last_committed(), Seqno::new(0));
        assert_eq!(provider.commit_order_enter(&h1, &m1), ProviderStatus::Success);
        assert_eq!(provider.commit_order_leave(&h1, &m1), ProviderStatus::Success);

        let (status, leave) = waiter.join().unwrap();
        assert_eq!(status, ProviderStatus::Success);
        assert_eq!(leave, ProviderStatus::Success);
        assert_eq!(provider.last_committed(), Seqno::new(2));
    }

    #[test]
    fn test_bf_abort_wakes_commit_order_waiter() {
        let provider = Arc::new(InMemoryProvider::default());
        let h1 = started(&provider, 1, &["a"]);
        let h2 = started(&provider, 2, &["b"]);
        let (_, _m1) = certify(&provider, &h1);
        let (_, m2) = certify(&provider, &h2);

        let p = Arc::clone(&provider);
        let waiter = thread::spawn(move || p.commit_order_enter(&h2, &m2));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            provider.bf_abort(Seqno::new(1), TransactionId::new(2)),
            ProviderStatus::Success
        );
        assert_eq!(waiter.join().unwrap(), ProviderStatus::BfAbort);
    }

    #[test]
    fn test_release_skips_unfinished_seqno() {
        let provider = InMemoryProvider::default();
        let h1 = started(&provider, 1, &["a"]);
        let h2 = started(&provider, 2, &["b"]);
        let (_, _m1) = certify(&provider, &h1);
        let (_, m2) = certify(&provider, &h2);

        assert_eq!(provider.release(&h1), ProviderStatus::Success);
        assert_eq!(provider.commit_order_enter(&h2, &m2), ProviderStatus::Success);
        assert_eq!(provider.commit_order_leave(&h2, &m2), ProviderStatus::Success);
        assert_eq!(provider.release(&h2), ProviderStatus::Success);
        assert_eq!(provider.last_committed(), Seqno::new(2));
        assert_eq!(provider.pending_write_sets(), 0);
        assert_eq!(provider.release(&h2), ProviderStatus::TransactionMissing);
    }

    #[test]
    fn test_commit_order_timeout() {
        let config = ProviderConfig {
            commit_order_timeout_ms: 10,
            ..Default::default()
        };
        let provider = InMemoryProvider::new(config);
        let h1 = started(&provider, 1, &["a"]);
        let h2 = started(&provider, 2, &["b"]);
        let (_, _m1) = certify(&provider, &h1);
        let (_, m2) = certify(&provider, &h2);
        assert_eq!(provider.commit_order_enter(&h2, &m2), ProviderStatus::NodeFailed);
    }

    #[test]
    fn test_pa_unsafe_dependency() {
        let provider = InMemoryProvider::default();
        let h1 = started(&provider, 1, &["a"]);
        let mut meta = TrxMeta::default();
        let flags = TxnFlags::TRX_END | TxnFlags::PA_UNSAFE;
        assert_eq!(
            provider.certify(ClientId(1), &h1, flags, &mut meta),
            ProviderStatus::Success
        );
        assert_eq!(meta.depends_on, meta.seqno().prev());

        let ws = provider.replicated_write_set(meta.seqno()).unwrap();
        assert!(ws.flags.contains(TxnFlags::PA_UNSAFE));
        assert_eq!(ws.keys.len(), 1);
    }

    #[test]
    fn test_size_limit() {
        let config = ProviderConfig {
            max_write_set_bytes: 4,
            ..Default::default()
        };
        let provider = InMemoryProvider::new(config);
        let mut handle = WsHandle::new(TransactionId::new(1));
        provider.start_transaction(&mut handle);
        assert_eq!(
            provider.append_data(&handle, &Data::new(b"abc".to_vec())),
            ProviderStatus::Success
        );
        assert_eq!(
            provider.append_data(&handle, &Data::new(b"de".to_vec())),
            ProviderStatus::SizeExceeded
        );
    }

    #[test]
    fn test_sync_point_runs_without_lock() {
        let provider = Arc::new(InMemoryProvider::default());
        let h1 = started(&provider, 1, &["a"]);
        let p = Arc::clone(&provider);
        provider.set_sync_point(SyncPoint::BeforeCertify, move |id| {
            // Re-entering the provider must not deadlock
            p.bf_abort(Seqno::new(99), id);
        });
        let (status, meta) = certify(&provider, &h1);
        assert_eq!(status, ProviderStatus::BfAbort);
        assert!(meta.seqno().is_undefined());
        provider.clear_sync_point(SyncPoint::BeforeCertify);
    }

    #[test]
    fn test_initial_seqno() {
        let provider =
            InMemoryProvider::with_initial_seqno(ProviderConfig::default(), Seqno::new(99));
        let h1 = started(&provider, 5, &["k"]);
        let (status, meta) = certify(&provider, &h1);
        assert_eq!(status, ProviderStatus::Success);
        assert_eq!(meta.seqno(), Seqno::new(100));
    }
}
