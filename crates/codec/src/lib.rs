//! Deterministic, prefix-respecting binary encodings of keys, rows, and
//! secondary-index entries, such that lexicographic byte comparison of
//! encoded keys implements the intended logical ordering:
//! partition, then vertex, then tag/edge, then newest version first.
//!
//! The on-disk format is a hard compatibility surface: the same logical
//! inputs must produce the same bytes on every node and every release, or
//! existing snapshots become unreadable. Layouts are pinned by snapshot
//! tests in each module.

mod keys;
mod row;
mod value;

pub mod index;

pub use keys::{
    edge_key, edge_prefix, edge_prefix_no_version, edge_prefix_src, edge_prefix_src_type,
    key_type, parse_edge, parse_vertex, partition_id_of_key, partition_range, sys_key, sys_prefix,
    vertex_key, vertex_prefix, vertex_prefix_tag, vertex_prefix_vid, EdgeKey, KeyType, VertexKey,
    PACKED_PREFIX_LEN,
};
pub use row::{RowReader, RowWriter};

/// Errors surfaced by the codecs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key of {len} bytes does not decode as a {expected} key")]
    InvalidKey { expected: &'static str, len: usize },
    #[error(transparent)]
    VidLength(#[from] models::VidLengthMismatch),
    #[error("field {field:?} holds a value of the wrong type (expected {expected:?})")]
    WrongType {
        field: String,
        expected: models::FieldType,
    },
    #[error("field {field:?} is not nullable and no value or default was supplied")]
    MissingField { field: String },
    #[error("row is truncated or malformed: {0}")]
    BadRow(&'static str),
    #[error("row was written under unknown schema version {0}")]
    UnknownSchemaVer(models::SchemaVer),
}

pub type Result<T> = std::result::Result<T, Error>;
