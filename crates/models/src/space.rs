use super::{PartitionId, SpaceId, VertexId};
use std::collections::BTreeMap;

/// A network address of a storage or metadata host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl std::fmt::Display for HostAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Immutable properties of a space, fixed at creation for the life of the
/// space: they pin the physical key layout and replica placement.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SpaceDesc {
    pub space_id: SpaceId,
    pub name: String,
    /// Number of partitions. Partition ids run 1..=partition_num.
    pub partition_num: i32,
    /// Replication factor per partition.
    pub replica_factor: i32,
    /// Fixed width of every VertexId in this space, in bytes.
    pub vid_len: usize,
    pub charset: String,
    pub collation: String,
    pub zones: Vec<String>,
    /// Engine-specific knobs forwarded verbatim to the KV engine.
    pub options: BTreeMap<String, String>,
}

impl SpaceDesc {
    pub fn new(space_id: SpaceId, name: &str, partition_num: i32, replica_factor: i32, vid_len: usize) -> Self {
        Self {
            space_id,
            name: name.to_string(),
            partition_num,
            replica_factor,
            vid_len,
            charset: "utf8".to_string(),
            collation: "utf8_bin".to_string(),
            zones: Vec::new(),
            options: BTreeMap::new(),
        }
    }
}

/// Route a vertex to its partition: `hash(vid) mod P + 1`. Partition ids
/// are 1-based. The hash runs over the *unpadded* id bytes with trailing
/// NULs stripped, so `"v1"` and `"v1\0\0"` route identically.
pub fn partition_of(vid: &VertexId, partition_num: i32) -> PartitionId {
    let bytes = vid.as_bytes();
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
    let hash = fxhash::hash64(&bytes[..end]);
    (hash % partition_num as u64) as PartitionId + 1
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partition_of_is_stable_and_in_range() {
        for i in 0..64 {
            let vid = VertexId::new(format!("vertex-{i}"));
            let part = partition_of(&vid, 3);
            assert!((1..=3).contains(&part));
            assert_eq!(part, partition_of(&vid, 3));
        }
    }

    #[test]
    fn test_padding_does_not_change_routing() {
        let short = VertexId::from("v1");
        let padded = VertexId::from(&b"v1\0\0\0\0\0\0"[..]);
        assert_eq!(partition_of(&short, 7), partition_of(&padded, 7));
    }
}
