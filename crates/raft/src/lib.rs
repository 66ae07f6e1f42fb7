//! Per-partition leader-based log replication. Each partition of a space
//! is one replication group: a set of voters plus non-voting learners,
//! coordinated through `AppendLog` / `AskForVote` / `InstallSnapshot`
//! RPCs. The committed apply stream is the sole write path into the KV
//! engine.

mod group;
mod network;
mod state_machine;
mod wal;

pub use group::{GroupConfig, RaftGroup, Role};
pub use network::{LocalNetwork, NetworkError, RaftNetwork};
pub use state_machine::StateMachine;
pub use wal::Wal;

use models::HostAddr;

pub type Term = u64;
pub type LogIndex = u64;

/// Why an `append_async` future resolved without the entry applying.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AppendError {
    /// This replica is not (or is no longer) the leader. Carries the
    /// freshest leader hint for the caller's retry.
    #[error("leadership changed (hint: {0:?})")]
    LeaderChanged(Option<HostAddr>),
    /// The caller's deadline elapsed. The entry is *not* retracted and may
    /// still commit and apply.
    #[error("append timed out; the entry may still commit")]
    Timeout,
    /// A membership change was rejected because another is in flight.
    #[error("a membership change is already in flight")]
    ChangeInFlight,
    #[error("replication group is shutting down")]
    Stopped,
    #[error("log storage error: {0}")]
    Storage(String),
}

pub type AppendResult = std::result::Result<LogIndex, AppendError>;
