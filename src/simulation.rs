//! Multi-client workload over a shared [`InMemoryProvider`]
//!
//! Each client thread owns one [`TransactionContext`] and runs a stream of
//! small write transactions over a shared key space. A separate injector
//! thread BF-aborts random clients at random moments. Every transaction is
//! driven to `committed` or `aborted` and its state history is checked
//! against the state graph.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::client::{ClientMode, ClientService};
use crate::config::{Config, SimulationConfig};
use crate::error::{ReplError, Result};
use crate::provider::InMemoryProvider;
use crate::transaction::{State, TransactionContext};
use crate::types::{ClientId, Data, Key, TransactionId};

/// Outcome counters of a simulation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub transactions: u64,
    pub committed: u64,
    pub cert_failed: u64,
    pub bf_aborted: u64,
    pub replayed: u64,
    pub provider_failures: u64,
    /// BF-aborts accepted by a transaction (ignored ones are not counted)
    pub bf_aborts_delivered: u64,
    /// Histories that left the state graph; always zero unless there is a bug
    pub invalid_histories: u64,
    pub last_committed_seqno: i64,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct Counters {
    transactions: AtomicU64,
    committed: AtomicU64,
    cert_failed: AtomicU64,
    bf_aborted: AtomicU64,
    replayed: AtomicU64,
    provider_failures: AtomicU64,
    invalid_histories: AtomicU64,
}

/// Session stand-in; the engine side of replay is a no-op here
struct SimClient {
    id: ClientId,
    interrupts: AtomicU64,
}

impl ClientService for SimClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn mode(&self) -> ClientMode {
        ClientMode::Replicating
    }

    fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    fn replay(&self, txc: &TransactionContext) -> Result<()> {
        log::trace!("Client {} re-applying transaction {}", self.id, txc.id());
        Ok(())
    }
}

/// Run the configured workload to completion
pub fn run(config: &Config) -> Result<SimulationReport> {
    let sim = &config.simulation;
    sim.validate()?;

    let provider = Arc::new(InMemoryProvider::new(config.provider.clone()));
    let contexts: Vec<Arc<TransactionContext>> = (0..sim.clients)
        .map(|i| {
            let client = Arc::new(SimClient {
                id: ClientId(i as u64 + 1),
                interrupts: AtomicU64::new(0),
            });
            Arc::new(TransactionContext::with_config(
                client,
                provider.clone(),
                config.transaction.clone(),
            ))
        })
        .collect();

    let counters = Arc::new(Counters::default());
    let done = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    log::info!(
        "Starting simulation: {} clients x {} transactions, key space {}",
        sim.clients,
        sim.transactions_per_client,
        sim.key_space
    );

    let injector = {
        let contexts = contexts.clone();
        let provider = provider.clone();
        let done = done.clone();
        let sim = sim.clone();
        thread::spawn(move || inject_bf_aborts(&contexts, &provider, &sim, &done))
    };

    let workers: Vec<_> = contexts
        .iter()
        .enumerate()
        .map(|(i, txc)| {
            let txc = Arc::clone(txc);
            let counters = Arc::clone(&counters);
            let sim = sim.clone();
            thread::spawn(move || client_loop(i, &txc, &sim, &counters))
        })
        .collect();

    let mut first_error = None;
    for worker in workers {
        let result = worker
            .join()
            .unwrap_or_else(|_| Err(ReplError::Fatal("client thread panicked".into())));
        if let Err(e) = result {
            log::error!("Client failed: {}", e);
            first_error.get_or_insert(e);
        }
    }
    done.store(true, Ordering::SeqCst);
    let delivered = injector.join().unwrap_or(0);

    if let Some(e) = first_error {
        return Err(e);
    }

    let report = SimulationReport {
        transactions: counters.transactions.load(Ordering::SeqCst),
        committed: counters.committed.load(Ordering::SeqCst),
        cert_failed: counters.cert_failed.load(Ordering::SeqCst),
        bf_aborted: counters.bf_aborted.load(Ordering::SeqCst),
        replayed: counters.replayed.load(Ordering::SeqCst),
        provider_failures: counters.provider_failures.load(Ordering::SeqCst),
        bf_aborts_delivered: delivered,
        invalid_histories: counters.invalid_histories.load(Ordering::SeqCst),
        last_committed_seqno: provider.last_committed().get(),
        elapsed_ms: start.elapsed().as_millis() as u64,
    };
    log::info!(
        "Simulation finished in {} ms: {} committed, {} cert failures, {} aborted, {} replayed",
        report.elapsed_ms,
        report.committed,
        report.cert_failed,
        report.bf_aborted,
        report.replayed
    );
    Ok(report)
}

fn client_loop(
    index: usize,
    txc: &TransactionContext,
    sim: &SimulationConfig,
    counters: &Counters,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(sim.seed.wrapping_add(index as u64 + 1));
    let id_base = (index as u64 + 1) << 32;

    for n in 0..sim.transactions_per_client {
        let id = TransactionId::new(id_base + n as u64);
        let keys: Vec<u64> = (0..sim.keys_per_transaction)
            .map(|_| rng.gen_range(0..sim.key_space))
            .collect();

        counters.transactions.fetch_add(1, Ordering::Relaxed);
        match execute(txc, id, &keys) {
            Ok(()) => {
                counters.committed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => settle(txc, e, counters)?,
        }

        if txc.active() {
            return Err(ReplError::Fatal(format!(
                "Transaction {} left active in state '{}'",
                id,
                txc.state()
            )));
        }
        let history = txc.state_history();
        if !history.windows(2).all(|w| w[0].can_transition(w[1])) {
            log::error!("Transaction {} took an invalid path: {:?}", id, history);
            counters.invalid_histories.fetch_add(1, Ordering::Relaxed);
        }
    }
    Ok(())
}

/// One transaction with a single statement, committed without two-phase
/// prepare
fn execute(txc: &TransactionContext, id: TransactionId, keys: &[u64]) -> Result<()> {
    txc.start_transaction(id)?;
    txc.before_statement()?;
    for key in keys {
        txc.append_key(&Key::exclusive([b"sim".to_vec(), key.to_be_bytes().to_vec()]))?;
        txc.append_data(&Data::new(key.to_le_bytes().to_vec()))?;
        txc.after_row()?;
    }
    txc.after_statement()?;
    txc.before_commit()?;
    txc.ordered_commit()?;
    txc.after_commit()?;
    // Picks up a replay if the BF-abort landed during commit
    txc.after_statement()
}

/// Bring a failed transaction to a final state
fn settle(txc: &TransactionContext, error: ReplError, counters: &Counters) -> Result<()> {
    match error {
        ReplError::MustReplay { .. } => {
            txc.before_rollback()?;
            txc.after_rollback()?;
            txc.after_statement()?;
            counters.replayed.fetch_add(1, Ordering::Relaxed);
            counters.committed.fetch_add(1, Ordering::Relaxed);
        }
        e if e.requires_rollback() => {
            let counter = match e {
                ReplError::CertificationFailed { .. } => &counters.cert_failed,
                ReplError::BfAborted { .. } => &counters.bf_aborted,
                _ => {
                    log::warn!("Rolling back after provider failure: {}", e);
                    &counters.provider_failures
                }
            };
            counter.fetch_add(1, Ordering::Relaxed);
            txc.before_rollback()?;
            txc.after_rollback()?;
        }
        e => return Err(e),
    }
    match txc.state() {
        State::Committed | State::Aborted => Ok(()),
        state => Err(ReplError::Fatal(format!(
            "Transaction {} settled in state '{}'",
            txc.id(),
            state
        ))),
    }
}

fn inject_bf_aborts(
    contexts: &[Arc<TransactionContext>],
    provider: &InMemoryProvider,
    sim: &SimulationConfig,
    done: &AtomicBool,
) -> u64 {
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let mut delivered = 0;
    while !done.load(Ordering::SeqCst) {
        if sim.bf_abort_probability > 0.0 && rng.gen_bool(sim.bf_abort_probability) {
            let victim = &contexts[rng.gen_range(0..contexts.len())];
            // Stands in for the remote write-set that wins the conflict
            let bf_seqno = provider.last_ordered().next();
            if victim.bf_abort(bf_seqno) {
                delivered += 1;
            }
        }
        thread::sleep(Duration::from_micros(200));
    }
    log::debug!("BF-abort injector delivered {} aborts", delivered);
    delivered
}
