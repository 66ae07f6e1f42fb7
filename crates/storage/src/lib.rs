//! The storage service: per-partition mutation and read pipelines over
//! the replicated KV engine, and the partition-aware dispatcher that
//! batches client requests across partition leaders.

mod cache;
mod dispatch;
mod mutate;
mod part;
mod pools;
mod query;
mod store;
mod topk;

pub use cache::VertexCache;
pub use pools::{Priority, PriorityPools};
pub use dispatch::{
    ClientConfig, LocalTransport, StorageClient, StorageRequest, StorageResponse,
    StorageTransport, TransportError,
};
pub use part::Part;
pub use store::{EngineType, GraphStore, PartType, StoreConfig, StoreHandler};
pub use topk::TopK;

use models::{HostAddr, PartitionId};
use proto_storage::ErrorCode;

/// Errors of the storage pipelines. `code()` gives the stable wire code;
/// routing errors carry the freshest leader hint for the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("partition {part} is led elsewhere (hint: {leader:?})")]
    LeaderChanged {
        part: PartitionId,
        leader: Option<HostAddr>,
    },
    #[error("partition {0} is not hosted here")]
    PartNotFound(PartitionId),
    #[error("space {0} is unknown")]
    SpaceNotFound(models::SpaceId),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("unique index {0} would be violated")]
    IndexConflict(models::IndexId),
    #[error(transparent)]
    VidLength(#[from] models::VidLengthMismatch),
    #[error("{0} not found")]
    ItemNotFound(String),
    #[error("operation timed out")]
    Timeout,
    #[error("back-pressure; slow down")]
    Busy,
    #[error("only {completeness}% of partitions succeeded")]
    Incomplete { completeness: u32 },
    #[error(transparent)]
    Codec(codec::Error),
    #[error(transparent)]
    Engine(engine::Error),
    #[error(transparent)]
    Catalog(catalog::Error),
    #[error("filter expression error: {0}")]
    Expr(#[from] expr::Error),
    #[error("malformed request: {0}")]
    IllFormed(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::LeaderChanged { .. } => ErrorCode::LeaderChanged,
            Error::PartNotFound(_) => ErrorCode::PartNotFound,
            Error::SpaceNotFound(_) => ErrorCode::SpaceNotFound,
            Error::SchemaMismatch(_) => ErrorCode::SchemaMismatch,
            Error::IndexConflict(_) => ErrorCode::IndexConflict,
            Error::VidLength(_) => ErrorCode::VidLengthMismatch,
            Error::ItemNotFound(_) => ErrorCode::ItemNotFound,
            Error::Incomplete { .. } => ErrorCode::Unknown,
            Error::Timeout => ErrorCode::Timeout,
            Error::Busy => ErrorCode::Busy,
            Error::Expr(_) | Error::IllFormed(_) => ErrorCode::IllFormat,
            Error::Codec(err) => match err {
                codec::Error::VidLength(_) => ErrorCode::VidLengthMismatch,
                codec::Error::WrongType { .. } => ErrorCode::WrongType,
                codec::Error::MissingField { .. } => ErrorCode::SchemaMismatch,
                codec::Error::UnknownSchemaVer(_) => ErrorCode::SchemaMismatch,
                _ => ErrorCode::IllFormat,
            },
            Error::Engine(err) => match err {
                engine::Error::Corruption(_) => ErrorCode::Corruption,
                engine::Error::CfClosed => ErrorCode::Busy,
                _ => ErrorCode::Unknown,
            },
            Error::Catalog(err) => match err {
                catalog::Error::SpaceNotFound(_) => ErrorCode::SpaceNotFound,
                catalog::Error::TagNotFound(_) => ErrorCode::TagNotFound,
                catalog::Error::EdgeNotFound(_) => ErrorCode::EdgeNotFound,
                catalog::Error::IndexNotFound(_) => ErrorCode::ItemNotFound,
                catalog::Error::PartNotFound(..) => ErrorCode::PartNotFound,
                catalog::Error::SchemaVerNotFound(_) => ErrorCode::SchemaMismatch,
                catalog::Error::Unavailable(_) => ErrorCode::Busy,
            },
        }
    }

    pub fn leader_hint(&self) -> Option<HostAddr> {
        match self {
            Error::LeaderChanged { leader, .. } => leader.clone(),
            _ => None,
        }
    }

    pub(crate) fn from_append(part: PartitionId, err: raft::AppendError) -> Error {
        match err {
            raft::AppendError::LeaderChanged(leader) => Error::LeaderChanged { part, leader },
            raft::AppendError::Timeout => Error::Timeout,
            raft::AppendError::ChangeInFlight => Error::Busy,
            raft::AppendError::Stopped => Error::PartNotFound(part),
            raft::AppendError::Storage(msg) => Error::IllFormed(msg),
        }
    }
}

impl From<codec::Error> for Error {
    fn from(err: codec::Error) -> Self {
        match err {
            codec::Error::VidLength(inner) => Error::VidLength(inner),
            other => Error::Codec(other),
        }
    }
}

impl From<engine::Error> for Error {
    fn from(err: engine::Error) -> Self {
        Error::Engine(err)
    }
}

impl From<catalog::Error> for Error {
    fn from(err: catalog::Error) -> Self {
        Error::Catalog(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
