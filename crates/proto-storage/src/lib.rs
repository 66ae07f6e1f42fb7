//! Wire and log message types of the storage service: the Raft RPC
//! surface, the batched client RPCs, serialized apply plans, and the
//! stable error-code enumeration. Message *semantics* are the contract;
//! the protobuf encoding is an implementation convenience shared by the
//! WAL, snapshots, and the transport.

pub mod plan;
pub mod raft;
pub mod storage;

mod value;
pub use value::{value_from_wire, value_to_wire, WireValue, WireValueError};

/// Stable error codes surfaced on the wire. New codes append; existing
/// values never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    LeaderChanged = 1,
    PartNotFound = 2,
    SpaceNotFound = 3,
    TagNotFound = 4,
    EdgeNotFound = 5,
    SchemaMismatch = 6,
    IndexConflict = 7,
    VidLengthMismatch = 8,
    Timeout = 9,
    Busy = 10,
    Corruption = 11,
    NoSuchFile = 12,
    NoPermission = 13,
    IllFormat = 14,
    WrongType = 15,
    EmptyFile = 16,
    ItemNotFound = 17,
    Unknown = 18,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

/// A network address carried on the wire.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct HostAddr {
    #[prost(string, tag = "1")]
    pub host: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

impl From<&models::HostAddr> for HostAddr {
    fn from(addr: &models::HostAddr) -> Self {
        Self {
            host: addr.host.clone(),
            port: addr.port as u32,
        }
    }
}

impl From<&HostAddr> for models::HostAddr {
    fn from(addr: &HostAddr) -> Self {
        models::HostAddr::new(&addr.host, addr.port as u16)
    }
}

/// Outcome of one partition's sub-request within a batched RPC.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartitionResult {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    /// Set when `code == LeaderChanged`: the freshest leader hint.
    #[prost(message, optional, tag = "3")]
    pub leader: Option<HostAddr>,
}

/// Trailer carried by every batched response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseCommon {
    #[prost(message, repeated, tag = "1")]
    pub failed_parts: Vec<PartitionResult>,
    /// Percentage of partitions whose sub-request succeeded, 0..=100.
    #[prost(uint32, tag = "2")]
    pub completeness: u32,
    #[prost(uint64, tag = "3")]
    pub latency_us: u64,
}

impl ResponseCommon {
    /// Build a trailer from per-partition outcomes.
    pub fn of(total_parts: usize, failed_parts: Vec<PartitionResult>) -> Self {
        let completeness = if total_parts == 0 {
            100
        } else {
            (100 * (total_parts - failed_parts.len().min(total_parts)) / total_parts) as u32
        };
        Self {
            failed_parts,
            completeness,
            latency_us: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use prost::Message;

    #[test]
    fn test_response_common_completeness() {
        let ok = ResponseCommon::of(4, vec![]);
        assert_eq!(ok.completeness, 100);

        let half = ResponseCommon::of(
            4,
            vec![
                PartitionResult {
                    code: ErrorCode::Timeout as i32,
                    part_id: 1,
                    leader: None,
                },
                PartitionResult {
                    code: ErrorCode::LeaderChanged as i32,
                    part_id: 2,
                    leader: Some(HostAddr {
                        host: "n2".to_string(),
                        port: 7777,
                    }),
                },
            ],
        );
        assert_eq!(half.completeness, 50);
    }

    #[test]
    fn test_round_trip() {
        let msg = ResponseCommon::of(
            3,
            vec![PartitionResult {
                code: ErrorCode::Busy as i32,
                part_id: 3,
                leader: None,
            }],
        );
        let bytes = msg.encode_to_vec();
        assert_eq!(ResponseCommon::decode(bytes.as_slice()).unwrap(), msg);
    }
}
