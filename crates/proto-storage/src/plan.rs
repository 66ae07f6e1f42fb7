//! The serialized apply plan: the opaque payload of a `Data` log entry.
//!
//! A plan is assembled on the leader (data puts and removes plus the index
//! maintenance they imply) and applied as one atomic engine batch by every
//! replica, in log order. Apply must be deterministic: the plan therefore
//! carries fully-encoded keys and values, never anything resolved at apply
//! time.

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum OpType {
    Put = 0,
    Remove = 1,
    /// Remove the half-open key range `[key, end)`.
    RemoveRange = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KvOp {
    #[prost(enumeration = "OpType", tag = "1")]
    pub op: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub end: Vec<u8>,
}

impl KvOp {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            op: OpType::Put as i32,
            key,
            value,
            end: Vec::new(),
        }
    }

    pub fn remove(key: Vec<u8>) -> Self {
        Self {
            op: OpType::Remove as i32,
            key,
            value: Vec::new(),
            end: Vec::new(),
        }
    }

    pub fn remove_range(key: Vec<u8>, end: Vec<u8>) -> Self {
        Self {
            op: OpType::RemoveRange as i32,
            key,
            value: Vec::new(),
            end,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplyPlan {
    #[prost(message, repeated, tag = "1")]
    pub ops: Vec<KvOp>,
    /// Fingerprint of the originating client request. A leader keeps a
    /// short window of recently appended fingerprints and drops duplicate
    /// submissions, making retried client mutations at-most-once per
    /// fingerprint within that window.
    #[prost(uint64, tag = "2")]
    pub fingerprint: u64,
    /// The (vertexId, tagId) cache entries a leader must evict after the
    /// plan commits. Encoded as padded vid || big-endian tagId.
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub evict: Vec<Vec<u8>>,
}

#[cfg(test)]
mod test {
    use super::*;
    use prost::Message;

    #[test]
    fn test_plan_round_trip() {
        let plan = ApplyPlan {
            ops: vec![
                KvOp::put(b"k1".to_vec(), b"v1".to_vec()),
                KvOp::remove(b"k2".to_vec()),
                KvOp::remove_range(b"a".to_vec(), b"b".to_vec()),
            ],
            fingerprint: 0xfeed,
            evict: vec![b"v1\0\0tag1".to_vec()],
        };
        let bytes = plan.encode_to_vec();
        assert_eq!(ApplyPlan::decode(bytes.as_slice()).unwrap(), plan);
    }
}
