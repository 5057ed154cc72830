//! Transaction state machine and the per-session transaction context

pub mod context;
pub mod state;

pub use context::{TransactionContext, TransactionSnapshot};
pub use state::{BfAbortResolution, State, StateHistory};
