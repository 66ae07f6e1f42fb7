use super::{LogIndex, Term};
use proto_storage::raft::{HardState, Membership, SnapshotMeta};

/// The state machine a replication group drives. Implemented by the
/// storage partition; the group guarantees `commit_logs` is invoked in
/// log order, once the entries are known committed.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a contiguous batch of committed `Data` payloads beginning at
    /// log index `first_index`. Must be idempotent against partial
    /// re-apply after a crash: implementations persist the applied index
    /// atomically with the batch itself.
    fn commit_logs(&self, first_index: LogIndex, payloads: Vec<Vec<u8>>) -> bool;

    /// This replica just won an election.
    fn on_elected(&self, term: Term) {
        let _ = term;
    }

    /// This replica stepped down from leadership.
    fn on_lost_leadership(&self, term: Term) {
        let _ = term;
    }

    /// The last applied log index persisted with the state, if any.
    fn applied_index(&self) -> LogIndex;

    /// Load / persist the replica's hard state. Stored under the
    /// partition's system keys so it survives restart.
    fn load_hard_state(&self) -> Option<HardState>;
    fn save_hard_state(&self, hs: &HardState);

    fn load_snapshot_meta(&self) -> Option<SnapshotMeta>;
    fn save_snapshot_meta(&self, meta: &SnapshotMeta);

    /// Load / persist the committed membership of the group.
    fn load_membership(&self) -> Option<Membership>;
    fn save_membership(&self, membership: &Membership);

    /// A consistent scan of the partition's entire keyspace, in key
    /// order, for streaming to a lagging follower. The iterator pins a
    /// point-in-time engine snapshot at creation.
    fn snapshot_rows(&self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send>;

    /// Replace the partition's keyspace with the streamed snapshot and
    /// persist `meta` with it. After this returns, `applied_index()`
    /// reports `meta.last_included_index`.
    fn install_snapshot(&self, rows: Vec<(Vec<u8>, Vec<u8>)>, meta: &SnapshotMeta) -> bool;
}
