//! Core data model of the graph store: identifiers, property values,
//! schemas, and space descriptors. Everything above the KV engine speaks
//! in these types.

mod schema;
mod space;
mod value;

pub use schema::{FieldDef, IndexDef, Schema};
pub use space::{partition_of, HostAddr, SpaceDesc};
pub use value::{FieldType, Value};

/// Identifies a logical graph database (the top-level tenant unit).
pub type SpaceId = i32;

/// Identifies one horizontal shard of a space. Partition ids are 1-based.
pub type PartitionId = i32;

/// Identifies a tag (a typed attribute set attachable to a vertex).
pub type TagId = i32;

/// Identifies a typed relationship. A negative value denotes the reverse
/// direction of its positive counterpart; both directions share the
/// absolute type for schema lookup.
pub type EdgeType = i32;

/// Identifies a secondary index.
pub type IndexId = i32;

/// A monotonic version of a tag or edge schema.
pub type SchemaVer = i64;

/// User-provided integer distinguishing parallel edges between the same
/// endpoints.
pub type EdgeRanking = i64;

/// A monotonic 64-bit stamp on a row. Encoded bitwise-inverted on disk so
/// that the newest version sorts first.
pub type Version = u64;

/// A fixed-width opaque byte string identifying a vertex. The width is a
/// per-space constant (`SpaceDesc::vid_len`); shorter ids are right-padded
/// with NUL bytes at the storage boundary.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct VertexId(Vec<u8>);

impl VertexId {
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Right-pad to `vid_len` with NUL bytes, or error if already longer.
    /// Two ids which differ only in trailing NUL padding address the same
    /// vertex.
    pub fn padded(&self, vid_len: usize) -> Result<Vec<u8>, VidLengthMismatch> {
        if self.0.len() > vid_len {
            return Err(VidLengthMismatch {
                actual: self.0.len(),
                max: vid_len,
            });
        }
        let mut out = self.0.clone();
        out.resize(vid_len, 0);
        Ok(out)
    }
}

impl std::fmt::Debug for VertexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Vids are commonly printable; fall back to escaped bytes when not.
        write!(f, "VertexId({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for VertexId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for VertexId {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

/// A VertexId argument exceeded the space's declared fixed width.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("vertex id is {actual} bytes but the space declares a fixed width of {max}")]
pub struct VidLengthMismatch {
    pub actual: usize,
    pub max: usize,
}
