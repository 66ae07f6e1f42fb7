//! The metadata catalog as consumed by the storage core: a
//! strongly-consistent service contract (`MetaService`), a locally cached
//! view of routing and schemas (`MetaCache`), and the WorkerId-driven
//! snowflake id generator.
//!
//! The storage core only *reads* the catalog; all catalog writes are
//! driven by operator commands through the query service.

mod cache;
mod meta;
mod worker_id;

pub use cache::{MetaCache, PartHandler, SchemaTarget};
pub use meta::{
    EdgeCatalog, MemMetaService, MetaService, MetaSnapshot, PartInfo, SpaceCatalog, TagCatalog,
};
pub use worker_id::Snowflake;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("space {0:?} not found")]
    SpaceNotFound(String),
    #[error("tag {0:?} not found")]
    TagNotFound(String),
    #[error("edge {0:?} not found")]
    EdgeNotFound(String),
    #[error("index {0} not found")]
    IndexNotFound(models::IndexId),
    #[error("partition {1} of space {0} not found")]
    PartNotFound(models::SpaceId, models::PartitionId),
    #[error("schema version {0} not found")]
    SchemaVerNotFound(models::SchemaVer),
    #[error("metadata service unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;
