//! Transaction states, the allowed transition graph and the diagnostic
//! state history.
//!
//! ```text
//! executing ─► preparing ─► certifying ─► committing ─► ordered_commit ─► committed
//!     │            │             │             │               │              ▲
//!     │            │             ▼             │               │              │
//!     │            │        cert_failed        │               │          replaying
//!     │            │             │             │               │              ▲
//!     └────────────┴─────────────┴─► must_abort ◄──────────────┘              │
//!                                        │                                     │
//!                                        ├─► aborting ─► aborted               │
//!                                        └─► must_replay ──────────────────────┘
//! ```
//!
//! Voluntary rollback (`executing`/`preparing`/`cert_failed` → `aborting`)
//! and the local / applier commit shortcut (`executing`/`preparing` →
//! `committing`) complete the graph.

use std::collections::VecDeque;
use std::fmt;

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    Executing,
    Preparing,
    Certifying,
    Committing,
    OrderedCommit,
    Committed,
    CertFailed,
    MustAbort,
    Aborting,
    Aborted,
    MustReplay,
    Replaying,
}

const N_STATES: usize = 12;

const STATE_NAMES: [&str; N_STATES] = [
    "executing",
    "preparing",
    "certifying",
    "committing",
    "ordered_commit",
    "committed",
    "cert_failed",
    "must_abort",
    "aborting",
    "aborted",
    "must_replay",
    "replaying",
];

/// `ALLOWED[from][to]`
#[rustfmt::skip]
const ALLOWED: [[bool; N_STATES]; N_STATES] = {
    const O: bool = false;
    const X: bool = true;
    [
        /*          ex pr ce co oc ct cf ma ab ad mr re */
        /* ex */  [ O, X, X, X, O, O, O, X, X, O, O, O ],
        /* pr */  [ O, O, X, X, O, O, O, X, X, O, O, O ],
        /* ce */  [ O, O, O, X, O, O, X, X, O, O, O, O ],
        /* co */  [ O, O, O, O, X, O, O, X, X, O, O, O ],
        /* oc */  [ O, O, O, O, O, X, O, X, O, O, O, O ],
        /* ct */  [ O, O, O, O, O, O, O, O, O, O, O, O ],
        /* cf */  [ O, O, O, O, O, O, O, X, X, O, O, O ],
        /* ma */  [ O, O, O, O, O, O, O, O, X, O, X, O ],
        /* ab */  [ O, O, O, O, O, O, O, O, O, X, O, O ],
        /* ad */  [ O, O, O, O, O, O, O, O, O, O, O, O ],
        /* mr */  [ O, O, O, O, O, O, O, O, O, O, O, X ],
        /* re */  [ O, O, O, O, O, X, O, O, O, O, O, O ],
    ]
};

impl State {
    pub const ALL: [State; N_STATES] = [
        State::Executing,
        State::Preparing,
        State::Certifying,
        State::Committing,
        State::OrderedCommit,
        State::Committed,
        State::CertFailed,
        State::MustAbort,
        State::Aborting,
        State::Aborted,
        State::MustReplay,
        State::Replaying,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        STATE_NAMES[self.index()]
    }

    /// Whether `self -> next` is an edge of the state graph
    pub fn can_transition(self, next: State) -> bool {
        ALLOWED[self.index()][next.index()]
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Committed | State::Aborted)
    }

    /// States in which a BF-abort notification is ignored
    pub fn ignores_bf_abort(self) -> bool {
        matches!(
            self,
            State::Committed
                | State::Aborted
                | State::MustAbort
                | State::Aborting
                | State::MustReplay
                | State::Replaying
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way a BF-aborted transaction leaves `must_abort`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BfAbortResolution {
    /// Nothing globally visible yet, rolling back is enough
    Abort,
    /// The write-set is part of the global order and must be re-applied
    Replay,
}

impl BfAbortResolution {
    /// Decide from the state captured when the BF-abort was accepted.
    ///
    /// Only states known to precede `ordered_commit` may be discarded;
    /// everything else replays.
    pub fn for_captured(captured: State) -> Self {
        match captured {
            State::Executing
            | State::Preparing
            | State::Certifying
            | State::Committing
            | State::CertFailed => BfAbortResolution::Abort,
            State::OrderedCommit
            | State::Committed
            | State::MustAbort
            | State::Aborting
            | State::Aborted
            | State::MustReplay
            | State::Replaying => BfAbortResolution::Replay,
        }
    }
}

/// Append-only log of visited states, optionally bounded.
///
/// Only used for diagnostics; no decision is ever made from it.
#[derive(Debug, Clone)]
pub struct StateHistory {
    entries: VecDeque<State>,
    limit: usize,
    discarded: u64,
}

impl StateHistory {
    /// `limit == 0` keeps every entry
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
            discarded: 0,
        }
    }

    pub fn push(&mut self, state: State) {
        if self.limit > 0 && self.entries.len() >= self.limit {
            self.entries.pop_front();
            self.discarded += 1;
        }
        self.entries.push_back(state);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.discarded = 0;
    }

    pub fn to_vec(&self) -> Vec<State> {
        self.entries.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped because of the size limit
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// True if consecutive entries only follow edges of the state graph
    pub fn is_valid_walk(&self) -> bool {
        self.entries
            .iter()
            .zip(self.entries.iter().skip(1))
            .all(|(from, to)| from.can_transition(*to))
    }
}

impl fmt::Display for StateHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.entries.iter().map(|s| s.as_str()).collect();
        write!(f, "{}", names.join(" -> "))
    }
}
