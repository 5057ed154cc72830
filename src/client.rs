//! The owning execution context of a transaction
//!
//! A session (client connection, applier thread) owns one
//! [`TransactionContext`] for its whole lifetime and drives it through the
//! lifecycle hooks. The context calls back into the session through this
//! trait when it needs engine-side work done.

use std::fmt;

use crate::error::Result;
use crate::transaction::TransactionContext;
use crate::types::ClientId;

/// How a session's transactions take part in replication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientMode {
    /// Replication disabled for this session; the provider is never called
    Local,
    /// Local transactions are certified and replicated
    #[default]
    Replicating,
    /// Applies write-sets already ordered by the provider
    HighPriority,
}

impl ClientMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientMode::Local => "local",
            ClientMode::Replicating => "replicating",
            ClientMode::HighPriority => "high_priority",
        }
    }
}

impl fmt::Display for ClientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callbacks from the transaction core into its owning session.
///
/// None of these are invoked with the transaction's mutex held, so they may
/// call any accessor of the [`TransactionContext`].
pub trait ClientService: Send + Sync {
    fn id(&self) -> ClientId;

    fn mode(&self) -> ClientMode;

    /// Wake the owning thread if it is blocked in the engine (lock wait,
    /// long running statement) after its transaction was BF-aborted.
    fn interrupt(&self) {}

    /// Re-execute the transaction after a BF-abort that arrived once its
    /// write-set was already ordered. Called with the transaction in
    /// `replaying`. The ordering decision stands; certification is skipped.
    fn replay(&self, txc: &TransactionContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_is_replicating() {
        assert_eq!(ClientMode::default(), ClientMode::Replicating);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(ClientMode::Local.to_string(), "local");
        assert_eq!(ClientMode::HighPriority.to_string(), "high_priority");
    }
}
