//! minirep - transaction state core for certification-based replication
//!
//! Tracks each local transaction of a multi-master replicated database
//! through execution, certification, ordering and commit, and keeps it
//! consistent when a conflicting write-set ordered elsewhere brute-force
//! aborts it from another thread.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Session (ClientService)                        │
//! │     drives lifecycle hooks, replays on request              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TransactionContext                         │
//! │   state machine, BF-abort capture, replay driver            │◄── bf_abort()
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Provider                               │
//! │   certification, global seqno, commit order                 │
//! │   (InMemoryProvider for single-process use and tests)       │
//! └─────────────────────────────────────────────────────────────┘

pub mod client;
pub mod config;
pub mod error;
pub mod provider;
pub mod simulation;
pub mod transaction;
pub mod types;

pub use client::{ClientMode, ClientService};
pub use config::{Config, ProviderConfig, SimulationConfig, TransactionConfig};
pub use error::{ReplError, Result, TxnStatus};
pub use provider::{InMemoryProvider, Provider, ProviderStatus, SyncPoint};
pub use simulation::SimulationReport;
pub use transaction::{BfAbortResolution, State, TransactionContext, TransactionSnapshot};
pub use types::{
    ClientId, Data, Gtid, Key, KeyKind, Seqno, SourceId, Stid, TransactionId, TrxMeta, TxnFlags,
    WsHandle,
};
