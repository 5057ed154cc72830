//! End-to-end lifecycle scenarios through the public API
//!
//! - Normal commit
//! - Certification failure
//! - BF-abort before ordering (rolled back)
//! - BF-abort after ordering (replayed)

use minirep::{
    ClientId, ClientMode, ClientService, Data, InMemoryProvider, Key, ProviderConfig, ReplError,
    Seqno, State, SyncPoint, TransactionContext, TransactionId, TxnStatus,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

struct Session {
    id: ClientId,
    replays: AtomicUsize,
}

impl Session {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id: ClientId(id),
            replays: AtomicUsize::new(0),
        })
    }
}

impl ClientService for Session {
    fn id(&self) -> ClientId {
        self.id
    }

    fn mode(&self) -> ClientMode {
        ClientMode::Replicating
    }

    fn replay(&self, txc: &TransactionContext) -> minirep::Result<()> {
        assert_eq!(txc.state(), State::Replaying);
        self.replays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn write(txc: &TransactionContext, id: u64, row: &str) {
    txc.start_transaction(TransactionId::new(id)).unwrap();
    txc.before_statement().unwrap();
    txc.append_key(&Key::exclusive(["db", "accounts", row])).unwrap();
    txc.append_data(&Data::new(format!("UPDATE {}", row).into_bytes()))
        .unwrap();
    txc.after_statement().unwrap();
}

fn assert_valid_walk(history: &[State]) {
    for pair in history.windows(2) {
        assert!(
            pair[0].can_transition(pair[1]),
            "invalid step {} -> {} in {:?}",
            pair[0],
            pair[1],
            history
        );
    }
}

// ============== Scenario 1: normal commit ==============

#[test]
fn test_scenario_normal_commit() {
    let provider = Arc::new(InMemoryProvider::with_initial_seqno(
        ProviderConfig::default(),
        Seqno::new(99),
    ));
    let session = Session::new(1);
    let txc = TransactionContext::new(session.clone(), provider.clone());

    write(&txc, 1, "alice");
    txc.before_prepare().unwrap();
    txc.after_prepare().unwrap();
    txc.before_commit().unwrap();
    txc.ordered_commit().unwrap();
    txc.after_commit().unwrap();

    assert_eq!(txc.state(), State::Committed);
    assert!(!txc.active());
    assert!(txc.ordered());
    assert_eq!(txc.seqno(), Seqno::new(100));
    assert_eq!(provider.last_committed(), Seqno::new(100));
    assert_valid_walk(&txc.state_history());

    let ws = provider.replicated_write_set(txc.seqno()).unwrap();
    assert_eq!(ws.keys.len(), 1);
    assert_eq!(ws.data[0].0, b"UPDATE alice".to_vec());
}

// ============== Scenario 2: certification failure ==============

#[test]
fn test_scenario_certification_failure() {
    let provider = Arc::new(InMemoryProvider::default());
    let winner = TransactionContext::new(Session::new(1), provider.clone());
    let loser = TransactionContext::new(Session::new(2), provider.clone());

    write(&winner, 1, "bob");
    write(&loser, 2, "bob");

    winner.before_commit().unwrap();
    winner.after_commit().unwrap();

    let result = loser.before_commit();
    assert_eq!(TxnStatus::of(&result), TxnStatus::CertificationFailed);
    assert!(!loser.certified());
    loser.before_rollback().unwrap();
    loser.after_rollback().unwrap();

    assert_eq!(loser.state(), State::Aborted);
    assert_eq!(provider.rollbacks(), vec![TransactionId::new(2)]);

    // The loser retries on a fresh snapshot and wins
    write(&loser, 3, "bob");
    loser.before_commit().unwrap();
    loser.after_commit().unwrap();
    assert_eq!(loser.state(), State::Committed);
}

// ============== Scenario 3: BF-abort before ordering ==============

#[test]
fn test_scenario_bf_abort_during_certification() {
    let provider = Arc::new(InMemoryProvider::default());
    let session = Session::new(1);
    let txc = Arc::new(TransactionContext::new(session.clone(), provider.clone()));

    // Deliver the abort from another thread while the write-set is
    // being certified
    let target = Arc::downgrade(&txc);
    provider.set_sync_point(SyncPoint::BeforeCertify, move |_| {
        let target = target.clone();
        let accepted = thread::spawn(move || {
            target
                .upgrade()
                .map(|txc| txc.bf_abort(Seqno::new(100)))
                .unwrap_or(false)
        })
        .join()
        .unwrap();
        assert!(accepted);
    });

    write(&txc, 1, "carol");
    let result = txc.before_commit();
    assert_eq!(TxnStatus::of(&result), TxnStatus::MustAbort);
    assert_eq!(txc.bf_abort_state(), Some(State::Certifying));
    assert_eq!(txc.bf_seqno(), Seqno::new(100));

    txc.before_rollback().unwrap();
    txc.after_rollback().unwrap();
    provider.clear_sync_point(SyncPoint::BeforeCertify);

    assert_eq!(txc.state(), State::Aborted);
    assert_eq!(session.replays.load(Ordering::SeqCst), 0);
    assert!(!txc.state_history().contains(&State::Committed));
    assert_valid_walk(&txc.state_history());
}

// ============== Scenario 4: BF-abort after ordering ==============

#[test]
fn test_scenario_bf_abort_after_ordering() {
    let provider = Arc::new(InMemoryProvider::default());
    let session = Session::new(1);
    let txc = Arc::new(TransactionContext::new(session.clone(), provider.clone()));

    write(&txc, 1, "dave");
    txc.before_commit().unwrap();
    assert_eq!(txc.state(), State::OrderedCommit);

    let victim = Arc::clone(&txc);
    assert!(thread::spawn(move || victim.bf_abort(Seqno::new(200)))
        .join()
        .unwrap());

    match txc.after_commit() {
        Err(ReplError::MustReplay { id }) => assert_eq!(id, TransactionId::new(1)),
        other => panic!("expected replay, got {:?}", other),
    }
    txc.before_rollback().unwrap();
    txc.after_rollback().unwrap();
    txc.after_statement().unwrap();

    assert_eq!(session.replays.load(Ordering::SeqCst), 1);
    assert_eq!(txc.state(), State::Committed);
    let history = txc.state_history();
    assert_valid_walk(&history);
    assert_eq!(
        &history[history.len() - 4..],
        &[
            State::MustAbort,
            State::MustReplay,
            State::Replaying,
            State::Committed
        ]
    );
    assert_eq!(provider.last_committed(), txc.seqno());
}

// ============== Properties ==============

#[test]
fn test_bf_abort_is_idempotent() {
    let provider = Arc::new(InMemoryProvider::default());
    let txc = TransactionContext::new(Session::new(1), provider);

    write(&txc, 1, "erin");
    assert!(txc.bf_abort(Seqno::new(5)));
    let before = txc.snapshot();
    for seqno in 6..10 {
        assert!(!txc.bf_abort(Seqno::new(seqno)));
    }
    let after = txc.snapshot();
    assert_eq!(before.history, after.history);
    assert_eq!(after.bf_seqno, Seqno::new(5));
    assert_eq!(after.bf_abort_state, Some(State::Executing));
}

#[test]
fn test_active_iff_valid_id() {
    let provider = Arc::new(InMemoryProvider::default());
    let txc = TransactionContext::new(Session::new(1), provider);

    assert_eq!(txc.active(), txc.id().is_valid());
    write(&txc, 1, "frank");
    assert_eq!(txc.active(), txc.id().is_valid());
    assert!(txc.active());
    txc.before_commit().unwrap();
    txc.after_commit().unwrap();
    assert_eq!(txc.active(), txc.id().is_valid());
    assert!(!txc.active());
}
