//! Messages of the per-partition replication protocol, plus the persisted
//! forms of a replica's hard state.

use super::HostAddr;

/// The kind of a replicated log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum EntryKind {
    /// Emitted by a fresh leader to commit entries of prior terms.
    Noop = 0,
    /// Opaque payload handed to the state machine on apply.
    Data = 1,
    AddPeer = 2,
    RemovePeer = 3,
    PromoteLearner = 4,
    /// Marks the point at which a snapshot was taken.
    SnapshotMarker = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntry {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub index: u64,
    #[prost(enumeration = "EntryKind", tag = "3")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

/// Payload of membership-change entries: the changed peer plus the full
/// resulting configuration, so a replica joining mid-stream learns the
/// whole group from the entry alone.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigChange {
    #[prost(message, optional, tag = "1")]
    pub peer: Option<HostAddr>,
    #[prost(message, repeated, tag = "2")]
    pub voters: Vec<HostAddr>,
    #[prost(message, repeated, tag = "3")]
    pub learners: Vec<HostAddr>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendLogRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    #[prost(uint64, tag = "3")]
    pub term: u64,
    #[prost(message, optional, tag = "4")]
    pub leader: Option<HostAddr>,
    #[prost(uint64, tag = "5")]
    pub prev_log_index: u64,
    #[prost(uint64, tag = "6")]
    pub prev_log_term: u64,
    #[prost(message, repeated, tag = "7")]
    pub entries: Vec<LogEntry>,
    #[prost(uint64, tag = "8")]
    pub leader_commit: u64,
    /// Leadership transfer: the receiver should start an election
    /// immediately instead of waiting out its timeout.
    #[prost(bool, tag = "9")]
    pub timeout_now: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendLogResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub success: bool,
    /// On rejection: the follower's last log index, letting the leader
    /// skip back over a gap in one round instead of one index at a time.
    #[prost(uint64, tag = "3")]
    pub conflict_hint: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AskForVoteRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    #[prost(uint64, tag = "3")]
    pub term: u64,
    #[prost(message, optional, tag = "4")]
    pub candidate: Option<HostAddr>,
    #[prost(uint64, tag = "5")]
    pub last_log_index: u64,
    #[prost(uint64, tag = "6")]
    pub last_log_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AskForVoteResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub granted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstallSnapshotRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    #[prost(uint64, tag = "3")]
    pub term: u64,
    #[prost(message, optional, tag = "4")]
    pub leader: Option<HostAddr>,
    #[prost(uint64, tag = "5")]
    pub last_included_index: u64,
    #[prost(uint64, tag = "6")]
    pub last_included_term: u64,
    #[prost(message, optional, tag = "7")]
    pub chunk: Option<SnapshotChunk>,
}

/// One streamed chunk of a snapshot: a batch of partition rows, in key
/// order. The receiver stages chunks until the final one arrives, then
/// replaces its keyspace with the staged rows in one atomic write.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotChunk {
    #[prost(message, repeated, tag = "1")]
    pub rows: Vec<KvPair>,
    #[prost(bool, tag = "2")]
    pub done: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KvPair {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstallSnapshotResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub success: bool,
}

/// Persisted under a partition's system keys; survives restart.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HardState {
    #[prost(uint64, tag = "1")]
    pub current_term: u64,
    #[prost(message, optional, tag = "2")]
    pub voted_for: Option<HostAddr>,
    #[prost(uint64, tag = "3")]
    pub committed_log_id: u64,
}

/// Persisted membership of the group.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Membership {
    #[prost(message, repeated, tag = "1")]
    pub voters: Vec<HostAddr>,
    #[prost(message, repeated, tag = "2")]
    pub learners: Vec<HostAddr>,
}

/// Persisted descriptor of the latest local snapshot.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotMeta {
    #[prost(uint64, tag = "1")]
    pub last_included_index: u64,
    #[prost(uint64, tag = "2")]
    pub last_included_term: u64,
}

#[cfg(test)]
mod test {
    use super::*;
    use prost::Message;

    #[test]
    fn test_append_log_round_trip() {
        let req = AppendLogRequest {
            space_id: 1,
            part_id: 2,
            term: 3,
            leader: Some(HostAddr {
                host: "n1".to_string(),
                port: 9779,
            }),
            prev_log_index: 7,
            prev_log_term: 2,
            entries: vec![LogEntry {
                term: 3,
                index: 8,
                kind: EntryKind::Data as i32,
                payload: b"payload".to_vec(),
            }],
            leader_commit: 7,
            timeout_now: false,
        };
        let bytes = req.encode_to_vec();
        assert_eq!(AppendLogRequest::decode(bytes.as_slice()).unwrap(), req);
    }
}
