//! Transaction context for certification-based replication
//!
//! ## Lifecycle
//!
//! The owning session drives the transaction through its hooks:
//! 1. `start_transaction`: register the write-set with the provider
//! 2. `append_key` / `append_data`: build up the write-set while executing
//! 3. `before_prepare` / `after_prepare`: optional two-phase prepare;
//!    certification happens in `after_prepare`
//! 4. `before_commit`: certify (if not done yet) and wait for the
//!    write-set's turn in global commit order
//! 5. `ordered_commit`: leave commit order once the engine has committed
//! 6. `after_commit`: finalize, release the write-set
//!
//! Rollback goes `before_rollback` → `after_rollback`. Statement boundaries
//! (`before_statement` / `after_statement`) are where a pending BF-abort is
//! reported and where replay is driven.
//!
//! ## Brute-force aborts
//!
//! `bf_abort` may be called from any thread at any time. It takes the same
//! mutex as the lifecycle hooks, records the state it interrupted and moves
//! the transaction to `must_abort`. The owning thread discovers this on its
//! next hook call. If the interrupted state was before `ordered_commit` the
//! transaction is rolled back, otherwise it is replayed.
//!
//! ## Locking
//!
//! Every public operation takes the mutex on entry and releases it before
//! any provider or session callback. Blocking provider calls (certify,
//! commit order) are made unlocked and the state is re-checked afterwards,
//! since a BF-abort may have arrived in between.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::state::{BfAbortResolution, State, StateHistory};
use crate::client::{ClientMode, ClientService};
use crate::config::TransactionConfig;
use crate::error::{ReplError, Result};
use crate::provider::{Provider, ProviderStatus};
use crate::types::{ClientId, Data, Gtid, Key, Seqno, TransactionId, TrxMeta, TxnFlags, WsHandle};

/// Consistent copy of a transaction's fields, taken under one lock
#[derive(Debug, Clone)]
pub struct TransactionSnapshot {
    pub id: TransactionId,
    pub state: State,
    pub history: Vec<State>,
    pub bf_abort_state: Option<State>,
    pub bf_seqno: Seqno,
    pub ws_handle: WsHandle,
    pub trx_meta: TrxMeta,
    pub flags: TxnFlags,
    pub pa_unsafe: bool,
    pub certified: bool,
    pub fragments: Vec<Gtid>,
    pub rollback_replicated_for: TransactionId,
}

impl TransactionSnapshot {
    pub fn active(&self) -> bool {
        self.id.is_valid()
    }

    pub fn ordered(&self) -> bool {
        !self.trx_meta.seqno().is_undefined()
    }
}

/// State guarded by the transaction mutex
struct Inner {
    id: TransactionId,
    state: State,
    history: StateHistory,
    bf_abort_state: Option<State>,
    bf_seqno: Seqno,
    ws_handle: WsHandle,
    trx_meta: TrxMeta,
    flags: TxnFlags,
    pa_unsafe: bool,
    certified: bool,
    fragments: Vec<Gtid>,
    rollback_replicated_for: TransactionId,
    /// Commit order was entered and not yet left
    in_commit_order: bool,
}

impl Inner {
    fn new(history_limit: usize) -> Self {
        Self {
            id: TransactionId::invalid(),
            state: State::Executing,
            history: StateHistory::new(history_limit),
            bf_abort_state: None,
            bf_seqno: Seqno::UNDEFINED,
            ws_handle: WsHandle::default(),
            trx_meta: TrxMeta::default(),
            flags: TxnFlags::empty(),
            pa_unsafe: false,
            certified: false,
            fragments: Vec::new(),
            rollback_replicated_for: TransactionId::invalid(),
            in_commit_order: false,
        }
    }

    fn active(&self) -> bool {
        self.id.is_valid()
    }

    fn require_active(&self, operation: &'static str) -> Result<()> {
        if self.active() {
            Ok(())
        } else {
            Err(ReplError::NotActive(operation))
        }
    }

    /// Begin a new attempt. The history restarts with `executing`.
    fn begin(&mut self, id: TransactionId, handle: WsHandle, meta: TrxMeta, flags: TxnFlags) {
        self.id = id;
        self.state = State::Executing;
        self.history.clear();
        self.history.push(State::Executing);
        self.bf_abort_state = None;
        self.bf_seqno = Seqno::UNDEFINED;
        self.ws_handle = handle;
        self.trx_meta = meta;
        self.flags = flags;
        self.pa_unsafe = false;
        self.certified = false;
        self.fragments.clear();
        self.rollback_replicated_for = TransactionId::invalid();
        self.in_commit_order = false;
    }

    fn transition(&mut self, next: State) -> Result<()> {
        if !self.state.can_transition(next) {
            log::error!(
                "Transaction {}: rejected state transition {} -> {} (history: {})",
                self.id,
                self.state,
                next,
                self.history
            );
            return Err(ReplError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        log::trace!("Transaction {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `must_abort` unless the current state ignores BF-aborts.
    /// Returns whether the abort was accepted.
    fn capture_bf_abort(&mut self, bf_seqno: Seqno) -> Result<bool> {
        if !self.active() || self.state.ignores_bf_abort() {
            return Ok(false);
        }
        let captured = self.state;
        self.transition(State::MustAbort)?;
        self.bf_abort_state = Some(captured);
        self.bf_seqno = bf_seqno;
        Ok(true)
    }

    fn resolution(&self) -> BfAbortResolution {
        match self.bf_abort_state {
            Some(captured) => BfAbortResolution::for_captured(captured),
            // No record of where we were interrupted, so ordering may be fixed
            None => BfAbortResolution::Replay,
        }
    }

    /// Report a pending BF-abort to the owning thread. On the replay path
    /// this also takes the `must_abort -> must_replay` step.
    fn resolve_bf_abort(&mut self) -> ReplError {
        match self.resolution() {
            BfAbortResolution::Abort => ReplError::BfAborted {
                id: self.id,
                bf_seqno: self.bf_seqno,
            },
            BfAbortResolution::Replay => {
                if self.state == State::MustAbort {
                    if let Err(e) = self.transition(State::MustReplay) {
                        return e;
                    }
                }
                ReplError::MustReplay { id: self.id }
            }
        }
    }

    fn record_ordering(&mut self, meta: TrxMeta) {
        if meta.seqno().is_undefined() {
            return;
        }
        self.trx_meta = meta;
        self.fragments.push(meta.gtid);
    }

    /// Forget replicated fragments after rollback
    fn remove_fragments(&mut self) {
        if self.fragments.is_empty() {
            return;
        }
        log::debug!(
            "Transaction {}: removing {} replicated fragment(s)",
            self.id,
            self.fragments.len()
        );
        self.fragments.clear();
    }

    /// Forget replicated fragments after commit
    fn clear_fragments(&mut self) {
        if self.fragments.is_empty() {
            return;
        }
        self.fragments.clear();
    }

    /// Deactivate after reaching `committed` or `aborted`. State, history and
    /// ordering metadata stay readable until the next `start_transaction`.
    fn cleanup(&mut self) {
        self.id = TransactionId::invalid();
        self.ws_handle = WsHandle::default();
        self.fragments.clear();
        self.certified = false;
        self.pa_unsafe = false;
        self.bf_abort_state = None;
        self.in_commit_order = false;
    }
}

/// One session's in-flight transaction and its replication state machine.
///
/// Created inactive and reused for every transaction the session runs.
/// Shared as `Arc<TransactionContext>` between the owning thread and
/// whatever delivers BF-aborts.
pub struct TransactionContext {
    client: Arc<dyn ClientService>,
    provider: Arc<dyn Provider>,
    inner: Mutex<Inner>,
}

impl TransactionContext {
    pub fn new(client: Arc<dyn ClientService>, provider: Arc<dyn Provider>) -> Self {
        Self::with_config(client, provider, TransactionConfig::default())
    }

    pub fn with_config(
        client: Arc<dyn ClientService>,
        provider: Arc<dyn Provider>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            client,
            provider,
            inner: Mutex::new(Inner::new(config.state_history_limit)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replicates(&self) -> bool {
        self.client.mode() != ClientMode::Local
    }

    // ===== Accessors =====

    pub fn id(&self) -> TransactionId {
        self.lock().id
    }

    pub fn active(&self) -> bool {
        self.lock().active()
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    /// True if the most recent certification attempt succeeded
    pub fn certified(&self) -> bool {
        self.lock().certified
    }

    pub fn seqno(&self) -> Seqno {
        self.lock().trx_meta.seqno()
    }

    /// True once the provider has ordered the write-set
    pub fn ordered(&self) -> bool {
        !self.lock().trx_meta.seqno().is_undefined()
    }

    pub fn is_streaming(&self) -> bool {
        false
    }

    pub fn pa_unsafe(&self) -> bool {
        self.lock().pa_unsafe
    }

    /// Mark the write-set unsafe for parallel applying. Only possible before
    /// certification starts, since the flag travels with the write-set.
    pub fn set_pa_unsafe(&self, pa_unsafe: bool) -> Result<()> {
        let mut inner = self.lock();
        inner.require_active("set_pa_unsafe")?;
        match inner.state {
            State::Executing | State::Preparing => {
                inner.pa_unsafe = pa_unsafe;
                Ok(())
            }
            state => Err(ReplError::InvalidState {
                operation: "set_pa_unsafe",
                state,
            }),
        }
    }

    pub fn flags(&self) -> TxnFlags {
        self.lock().flags
    }

    pub fn reset_flags(&self, flags: TxnFlags) {
        self.lock().flags = flags;
    }

    pub fn ws_handle(&self) -> WsHandle {
        self.lock().ws_handle
    }

    pub fn trx_meta(&self) -> TrxMeta {
        self.lock().trx_meta
    }

    pub fn bf_abort_state(&self) -> Option<State> {
        self.lock().bf_abort_state
    }

    /// Seqno of the write-set that BF-aborted this transaction
    pub fn bf_seqno(&self) -> Seqno {
        self.lock().bf_seqno
    }

    pub fn fragments(&self) -> Vec<Gtid> {
        self.lock().fragments.clone()
    }

    pub fn state_history(&self) -> Vec<State> {
        self.lock().history.to_vec()
    }

    pub fn client_id(&self) -> ClientId {
        self.client.id()
    }

    pub fn snapshot(&self) -> TransactionSnapshot {
        let inner = self.lock();
        TransactionSnapshot {
            id: inner.id,
            state: inner.state,
            history: inner.history.to_vec(),
            bf_abort_state: inner.bf_abort_state,
            bf_seqno: inner.bf_seqno,
            ws_handle: inner.ws_handle,
            trx_meta: inner.trx_meta,
            flags: inner.flags,
            pa_unsafe: inner.pa_unsafe,
            certified: inner.certified,
            fragments: inner.fragments.clone(),
            rollback_replicated_for: inner.rollback_replicated_for,
        }
    }

    pub fn debug_log_state(&self, context: &str) {
        let inner = self.lock();
        log::debug!(
            "{}: client {} trx {} state {} seqno {} certified {} flags {} fragments {} history [{}]",
            context,
            self.client.id(),
            inner.id,
            inner.state,
            inner.trx_meta.seqno(),
            inner.certified,
            inner.flags,
            inner.fragments.len(),
            inner.history
        );
    }

    // ===== Lifecycle =====

    /// Start a new local transaction
    pub fn start_transaction(&self, id: TransactionId) -> Result<()> {
        if !id.is_valid() {
            return Err(ReplError::InvalidArgument("start_transaction with invalid id"));
        }
        {
            let inner = self.lock();
            if inner.active() {
                return Err(ReplError::AlreadyActive(inner.id));
            }
        }

        let mut handle = WsHandle::new(id);
        if self.client.mode() == ClientMode::Replicating {
            let status = self.provider.start_transaction(&mut handle);
            if !status.is_success() {
                return Err(ReplError::Provider {
                    operation: "start_transaction",
                    status,
                });
            }
        }

        let mut inner = self.lock();
        if inner.active() {
            return Err(ReplError::AlreadyActive(inner.id));
        }
        inner.begin(id, handle, TrxMeta::default(), TxnFlags::TRX_START);
        log::trace!("Client {}: started transaction {}", self.client.id(), id);
        Ok(())
    }

    /// Start applying a write-set the provider has already ordered
    pub fn start_transaction_applier(
        &self,
        handle: WsHandle,
        meta: TrxMeta,
        flags: TxnFlags,
    ) -> Result<()> {
        if !handle.trx_id.is_valid() {
            return Err(ReplError::InvalidArgument("applier handle with invalid id"));
        }
        if meta.seqno().is_undefined() {
            return Err(ReplError::InvalidArgument("applier write-set is not ordered"));
        }
        let mut inner = self.lock();
        if inner.active() {
            return Err(ReplError::AlreadyActive(inner.id));
        }
        inner.begin(handle.trx_id, handle, meta, flags);
        inner.certified = true;
        log::trace!(
            "Client {}: applying transaction {} at seqno {}",
            self.client.id(),
            handle.trx_id,
            meta.seqno()
        );
        Ok(())
    }

    fn appendable_handle(&self, operation: &'static str) -> Result<WsHandle> {
        let mut inner = self.lock();
        inner.require_active(operation)?;
        match inner.state {
            State::Executing | State::Preparing => Ok(inner.ws_handle),
            State::MustAbort | State::MustReplay => Err(inner.resolve_bf_abort()),
            state => Err(ReplError::Append { id: inner.id, state }),
        }
    }

    pub fn append_key(&self, key: &Key) -> Result<()> {
        let handle = self.appendable_handle("append_key")?;
        if self.client.mode() != ClientMode::Replicating {
            return Ok(());
        }
        let status = self.provider.append_key(&handle, key);
        if !status.is_success() {
            return Err(ReplError::Provider {
                operation: "append_key",
                status,
            });
        }
        Ok(())
    }

    pub fn append_data(&self, data: &Data) -> Result<()> {
        let handle = self.appendable_handle("append_data")?;
        if self.client.mode() != ClientMode::Replicating {
            return Ok(());
        }
        let status = self.provider.append_data(&handle, data);
        if !status.is_success() {
            return Err(ReplError::Provider {
                operation: "append_data",
                status,
            });
        }
        Ok(())
    }

    /// Called after each row change. Without streaming there is nothing to
    /// replicate; only a pending BF-abort is reported.
    pub fn after_row(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.require_active("after_row")?;
        match inner.state {
            State::MustAbort | State::MustReplay => Err(inner.resolve_bf_abort()),
            _ => Ok(()),
        }
    }

    pub fn before_prepare(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.require_active("before_prepare")?;
        match inner.state {
            State::Executing => inner.transition(State::Preparing),
            State::MustAbort | State::MustReplay => Err(inner.resolve_bf_abort()),
            state => Err(ReplError::InvalidState {
                operation: "before_prepare",
                state,
            }),
        }
    }

    pub fn after_prepare(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.require_active("after_prepare")?;
            match inner.state {
                State::Preparing => {}
                State::MustAbort | State::MustReplay => return Err(inner.resolve_bf_abort()),
                state => {
                    return Err(ReplError::InvalidState {
                        operation: "after_prepare",
                        state,
                    })
                }
            }
        }
        match self.client.mode() {
            ClientMode::Replicating => self.certify_commit(),
            ClientMode::Local | ClientMode::HighPriority => Ok(()),
        }
    }

    /// Replicate and certify the whole write-set as a single fragment
    fn certify_commit(&self) -> Result<()> {
        let (handle, flags) = {
            let mut inner = self.lock();
            match inner.state {
                State::Executing | State::Preparing => {}
                State::MustAbort | State::MustReplay => return Err(inner.resolve_bf_abort()),
                state => {
                    return Err(ReplError::InvalidState {
                        operation: "certify",
                        state,
                    })
                }
            }
            inner.certified = false;
            inner.flags.insert(TxnFlags::TRX_END);
            if inner.pa_unsafe {
                inner.flags.insert(TxnFlags::PA_UNSAFE);
            }
            inner.transition(State::Certifying)?;
            (inner.ws_handle, inner.flags)
        };

        let mut meta = TrxMeta::default();
        let status = self
            .provider
            .certify(self.client.id(), &handle, flags, &mut meta);

        let mut inner = self.lock();
        inner.record_ordering(meta);
        match status {
            ProviderStatus::Success | ProviderStatus::Warning => {
                inner.certified = true;
                match inner.state {
                    State::Certifying => inner.transition(State::Committing),
                    State::MustAbort => Err(inner.resolve_bf_abort()),
                    state => Err(ReplError::Fatal(format!(
                        "Transaction {} in unexpected state '{}' after certification",
                        inner.id, state
                    ))),
                }
            }
            ProviderStatus::CertificationFailed => match inner.state {
                State::Certifying => {
                    inner.transition(State::CertFailed)?;
                    log::debug!("Transaction {} failed certification", inner.id);
                    Err(ReplError::CertificationFailed { id: inner.id })
                }
                State::MustAbort => Err(inner.resolve_bf_abort()),
                state => Err(ReplError::Fatal(format!(
                    "Transaction {} in unexpected state '{}' after failed certification",
                    inner.id, state
                ))),
            },
            ProviderStatus::BfAbort => {
                // Aborted inside the provider before bf_abort() reached us
                if inner.state == State::Certifying {
                    inner.capture_bf_abort(Seqno::UNDEFINED)?;
                }
                Err(inner.resolve_bf_abort())
            }
            status => {
                if inner.state == State::Certifying {
                    inner.transition(State::CertFailed)?;
                }
                log::warn!(
                    "Transaction {}: certification failed in provider: {}",
                    inner.id,
                    status
                );
                Err(ReplError::Provider {
                    operation: "certify",
                    status,
                })
            }
        }
    }

    /// Wait for the write-set's turn in commit order
    fn enter_commit_order(&self) -> Result<()> {
        let (handle, meta) = {
            let mut inner = self.lock();
            match inner.state {
                State::Committing => {}
                State::MustAbort | State::MustReplay => return Err(inner.resolve_bf_abort()),
                state => {
                    return Err(ReplError::InvalidState {
                        operation: "commit_order_enter",
                        state,
                    })
                }
            }
            if !self.replicates() {
                return inner.transition(State::OrderedCommit);
            }
            (inner.ws_handle, inner.trx_meta)
        };

        let status = self.provider.commit_order_enter(&handle, &meta);

        let mut inner = self.lock();
        match status {
            ProviderStatus::Success | ProviderStatus::Warning => {
                inner.in_commit_order = true;
                match inner.state {
                    State::Committing => inner.transition(State::OrderedCommit),
                    State::MustAbort => Err(inner.resolve_bf_abort()),
                    state => Err(ReplError::Fatal(format!(
                        "Transaction {} in unexpected state '{}' after entering commit order",
                        inner.id, state
                    ))),
                }
            }
            ProviderStatus::BfAbort => {
                if inner.state == State::Committing {
                    inner.capture_bf_abort(Seqno::UNDEFINED)?;
                }
                Err(inner.resolve_bf_abort())
            }
            status => Err(ReplError::Provider {
                operation: "commit_order_enter",
                status,
            }),
        }
    }

    /// Certify the transaction if needed and wait for its commit order.
    /// On success the transaction is in `ordered_commit` and the engine
    /// may commit.
    pub fn before_commit(&self) -> Result<()> {
        let state = {
            let mut inner = self.lock();
            inner.require_active("before_commit")?;
            match inner.state {
                State::MustAbort | State::MustReplay => return Err(inner.resolve_bf_abort()),
                State::CertFailed => return Err(ReplError::CertificationFailed { id: inner.id }),
                state => state,
            }
        };

        match (self.client.mode(), state) {
            (ClientMode::Replicating, State::Executing | State::Preparing) => {
                self.certify_commit()?;
            }
            (ClientMode::Replicating, State::Committing) => {}
            (ClientMode::Local | ClientMode::HighPriority, State::Executing | State::Preparing) => {
                let mut inner = self.lock();
                match inner.state {
                    State::Executing | State::Preparing => inner.transition(State::Committing)?,
                    State::MustAbort | State::MustReplay => return Err(inner.resolve_bf_abort()),
                    state => {
                        return Err(ReplError::InvalidState {
                            operation: "before_commit",
                            state,
                        })
                    }
                }
            }
            (_, state) => {
                return Err(ReplError::InvalidState {
                    operation: "before_commit",
                    state,
                })
            }
        }

        self.enter_commit_order()
    }

    /// Leave commit order so the next write-set can commit. Optional;
    /// `after_commit` does it if this was not called.
    pub fn ordered_commit(&self) -> Result<()> {
        let (handle, meta) = {
            let mut inner = self.lock();
            inner.require_active("ordered_commit")?;
            match inner.state {
                State::OrderedCommit => {}
                State::MustAbort | State::MustReplay => return Err(inner.resolve_bf_abort()),
                state => {
                    return Err(ReplError::InvalidState {
                        operation: "ordered_commit",
                        state,
                    })
                }
            }
            if !inner.in_commit_order {
                return Ok(());
            }
            inner.in_commit_order = false;
            (inner.ws_handle, inner.trx_meta)
        };
        self.leave_commit_order(&handle, &meta)
    }

    fn leave_commit_order(&self, handle: &WsHandle, meta: &TrxMeta) -> Result<()> {
        let status = self.provider.commit_order_leave(handle, meta);
        if !status.is_success() {
            return Err(ReplError::Provider {
                operation: "commit_order_leave",
                status,
            });
        }
        Ok(())
    }

    fn release(&self, handle: &WsHandle) {
        if !self.replicates() {
            return;
        }
        let status = self.provider.release(handle);
        if !status.is_success() {
            log::warn!(
                "Failed to release write-set of transaction {}: {}",
                handle.trx_id,
                status
            );
        }
    }

    /// The engine has committed; finalize the transaction
    pub fn after_commit(&self) -> Result<()> {
        let leave = {
            let mut inner = self.lock();
            inner.require_active("after_commit")?;
            match inner.state {
                State::OrderedCommit => {}
                State::MustAbort | State::MustReplay => return Err(inner.resolve_bf_abort()),
                state => {
                    return Err(ReplError::InvalidState {
                        operation: "after_commit",
                        state,
                    })
                }
            }
            let leave = inner.in_commit_order.then_some((inner.ws_handle, inner.trx_meta));
            inner.in_commit_order = false;
            leave
        };
        if let Some((handle, meta)) = leave {
            self.leave_commit_order(&handle, &meta)?;
        }

        let handle = {
            let mut inner = self.lock();
            match inner.state {
                State::OrderedCommit => {}
                // BF-aborted while leaving commit order
                State::MustAbort => return Err(inner.resolve_bf_abort()),
                state => {
                    return Err(ReplError::Fatal(format!(
                        "Transaction {} in unexpected state '{}' in after_commit",
                        inner.id, state
                    )))
                }
            }
            inner.transition(State::Committed)?;
            inner.clear_fragments();
            let handle = inner.ws_handle;
            inner.cleanup();
            handle
        };
        self.release(&handle);
        self.debug_log_state("after_commit");
        Ok(())
    }

    pub fn before_rollback(&self) -> Result<()> {
        let replicate = {
            let mut inner = self.lock();
            inner.require_active("before_rollback")?;
            match inner.state {
                State::Executing | State::Preparing | State::CertFailed => {
                    inner.transition(State::Aborting)?
                }
                State::Committing if !inner.in_commit_order => inner.transition(State::Aborting)?,
                State::MustAbort => match inner.resolution() {
                    BfAbortResolution::Abort => inner.transition(State::Aborting)?,
                    BfAbortResolution::Replay => {
                        // Engine undoes local changes before the replay
                        return inner.transition(State::MustReplay);
                    }
                },
                State::MustReplay => return Ok(()),
                State::Aborting => {}
                state => {
                    return Err(ReplError::InvalidState {
                        operation: "before_rollback",
                        state,
                    })
                }
            }
            let replicate = self.client.mode() == ClientMode::Replicating
                && inner.rollback_replicated_for != inner.id;
            replicate.then_some(inner.id)
        };

        if let Some(id) = replicate {
            let status = self.provider.rollback(id);
            if !status.is_success() {
                // Not marked as replicated, a repeated before_rollback retries
                log::warn!("Failed to replicate rollback of transaction {}: {}", id, status);
                return Err(ReplError::Provider {
                    operation: "rollback",
                    status,
                });
            }
            let mut inner = self.lock();
            if inner.id == id {
                inner.rollback_replicated_for = id;
                inner.flags.insert(TxnFlags::ROLLBACK);
            }
        }
        Ok(())
    }

    pub fn after_rollback(&self) -> Result<()> {
        let handle = {
            let mut inner = self.lock();
            inner.require_active("after_rollback")?;
            match inner.state {
                State::Aborting => {
                    inner.transition(State::Aborted)?;
                    inner.remove_fragments();
                    let handle = inner.ws_handle;
                    inner.cleanup();
                    handle
                }
                State::MustReplay => return Ok(()),
                state => {
                    return Err(ReplError::InvalidState {
                        operation: "after_rollback",
                        state,
                    })
                }
            }
        };
        self.release(&handle);
        self.debug_log_state("after_rollback");
        Ok(())
    }

    pub fn before_statement(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.active() {
            return Ok(());
        }
        match inner.state {
            State::MustAbort | State::MustReplay => Err(inner.resolve_bf_abort()),
            _ => Ok(()),
        }
    }

    /// Statement finished. Reports a pending abort or certification failure,
    /// and replays the transaction if it was BF-aborted after ordering.
    pub fn after_statement(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if !inner.active() {
                return Ok(());
            }
            match inner.state {
                State::MustAbort => match inner.resolve_bf_abort() {
                    ReplError::MustReplay { .. } => {}
                    e => return Err(e),
                },
                State::MustReplay => {}
                State::CertFailed => return Err(ReplError::CertificationFailed { id: inner.id }),
                _ => return Ok(()),
            }
        }
        self.replay()
    }

    fn replay(&self) -> Result<()> {
        let id = {
            let mut inner = self.lock();
            inner.transition(State::Replaying)?;
            log::info!(
                "Replaying transaction {} at seqno {} (aborted by {})",
                inner.id,
                inner.trx_meta.seqno(),
                inner.bf_seqno
            );
            inner.id
        };

        if let Err(e) = self.client.replay(self) {
            log::error!("Replay of transaction {} failed: {}", id, e);
            return Err(ReplError::Fatal(format!(
                "Replay of transaction {} failed: {}",
                id, e
            )));
        }

        let leave = {
            let mut inner = self.lock();
            let leave = inner.in_commit_order.then_some((inner.ws_handle, inner.trx_meta));
            inner.in_commit_order = false;
            leave
        };
        if let Some((handle, meta)) = leave {
            if self.replicates() {
                self.leave_commit_order(&handle, &meta).map_err(|e| {
                    ReplError::Fatal(format!(
                        "Transaction {} could not leave commit order after replay: {}",
                        id, e
                    ))
                })?;
            }
        }

        let handle = {
            let mut inner = self.lock();
            inner.transition(State::Committed)?;
            inner.clear_fragments();
            let handle = inner.ws_handle;
            inner.cleanup();
            handle
        };
        self.release(&handle);
        self.debug_log_state("replay");
        Ok(())
    }

    // ===== Brute-force abort =====

    /// Brute-force abort this transaction on behalf of the already ordered
    /// write-set `bf_seqno`. May be called from any thread.
    ///
    /// Returns false if the transaction was not active, was already
    /// aborting, replaying or finished, or belongs to a high priority
    /// applier.
    pub fn bf_abort(&self, bf_seqno: Seqno) -> bool {
        // An applier's write-set is already ordered and must be applied
        if self.client.mode() == ClientMode::HighPriority {
            log::debug!(
                "Ignoring BF-abort by seqno {} of applier transaction {}",
                bf_seqno,
                self.id()
            );
            return false;
        }
        let victim = {
            let mut inner = self.lock();
            let state = inner.state;
            match inner.capture_bf_abort(bf_seqno) {
                Ok(true) => {
                    log::debug!(
                        "Transaction {} BF-aborted by seqno {} in state {}",
                        inner.id,
                        bf_seqno,
                        state
                    );
                    inner.id
                }
                Ok(false) => {
                    log::debug!(
                        "Ignoring BF-abort by seqno {} of transaction {} in state {}",
                        bf_seqno,
                        inner.id,
                        state
                    );
                    return false;
                }
                Err(e) => {
                    log::error!("BF-abort by seqno {} failed: {}", bf_seqno, e);
                    return false;
                }
            }
        };

        if self.replicates() {
            let status = self.provider.bf_abort(bf_seqno, victim);
            if !status.is_success() {
                log::debug!(
                    "Provider holds nothing to interrupt for transaction {}: {}",
                    victim,
                    status
                );
            }
        }
        self.client.interrupt();
        true
    }
}
