//! Batched client RPCs of the storage service. Every request carries a
//! space id and partition-keyed sub-requests; every response carries a
//! `ResponseCommon` trailer with per-partition failures and an overall
//! completeness percentage.

use super::{HostAddr, ResponseCommon, WireValue};
use std::collections::BTreeMap;

/// A tag attached to a new vertex: parallel name/value columns.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewTag {
    #[prost(int32, tag = "1")]
    pub tag_id: i32,
    #[prost(string, repeated, tag = "2")]
    pub prop_names: Vec<String>,
    #[prost(message, repeated, tag = "3")]
    pub prop_values: Vec<WireValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewVertex {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub tags: Vec<NewTag>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewVertexList {
    #[prost(message, repeated, tag = "1")]
    pub vertices: Vec<NewVertex>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddVerticesRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(btree_map = "int32, message", tag = "2")]
    pub parts: BTreeMap<i32, NewVertexList>,
    /// Skip (rather than overwrite) vertices which already exist.
    #[prost(bool, tag = "3")]
    pub if_not_exists: bool,
}

/// The identifying quadruple of a logical edge, as submitted by clients:
/// always the out-edge orientation (positive type, src-side partition).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EdgeId {
    #[prost(bytes = "vec", tag = "1")]
    pub src: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub edge_type: i32,
    #[prost(int64, tag = "3")]
    pub ranking: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub dst: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewEdge {
    #[prost(message, optional, tag = "1")]
    pub id: Option<EdgeId>,
    #[prost(string, repeated, tag = "2")]
    pub prop_names: Vec<String>,
    #[prost(message, repeated, tag = "3")]
    pub prop_values: Vec<WireValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewEdgeList {
    #[prost(message, repeated, tag = "1")]
    pub edges: Vec<NewEdge>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddEdgesRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(btree_map = "int32, message", tag = "2")]
    pub parts: BTreeMap<i32, NewEdgeList>,
    #[prost(bool, tag = "3")]
    pub if_not_exists: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecResponse {
    #[prost(message, optional, tag = "1")]
    pub result: Option<ResponseCommon>,
}

/// One property assignment of an update.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdatedProp {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub value: Option<WireValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateVertexRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub vid: Vec<u8>,
    #[prost(int32, tag = "4")]
    pub tag_id: i32,
    #[prost(message, repeated, tag = "5")]
    pub updated_props: Vec<UpdatedProp>,
    /// Insert a fresh row when the vertex does not yet hold this tag.
    #[prost(bool, tag = "6")]
    pub insertable: bool,
    /// Serialized filter expression; the update applies only when it
    /// evaluates true against the current row.
    #[prost(bytes = "vec", tag = "7")]
    pub condition: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateEdgeRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    #[prost(message, optional, tag = "3")]
    pub edge: Option<EdgeId>,
    #[prost(message, repeated, tag = "4")]
    pub updated_props: Vec<UpdatedProp>,
    #[prost(bool, tag = "5")]
    pub insertable: bool,
    #[prost(bytes = "vec", tag = "6")]
    pub condition: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateResponse {
    #[prost(message, optional, tag = "1")]
    pub result: Option<ResponseCommon>,
    /// The post-update row, when return columns were requested.
    #[prost(message, optional, tag = "2")]
    pub data: Option<DataSet>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteVertexRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub vid: Vec<u8>,
    /// Resume token from a previous `PartialDelete` response.
    #[prost(bytes = "vec", tag = "4")]
    pub cursor: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteVertexResponse {
    #[prost(message, optional, tag = "1")]
    pub result: Option<ResponseCommon>,
    /// Non-empty when the incident-edge scan hit the response-size cap;
    /// the caller resubmits with this cursor to resume.
    #[prost(bytes = "vec", tag = "2")]
    pub cursor: Vec<u8>,
    /// The paired halves living on other partitions, which the caller
    /// (the dispatching RPC layer) deletes via `DeleteEdges`.
    #[prost(message, repeated, tag = "3")]
    pub pending_edges: Vec<EdgeId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EdgeIdList {
    #[prost(message, repeated, tag = "1")]
    pub edges: Vec<EdgeId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteEdgesRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(btree_map = "int32, message", tag = "2")]
    pub parts: BTreeMap<i32, EdgeIdList>,
}

/// Priority class of a read request. Classes are admitted through
/// separate server-side pools so control-plane traffic is never starved
/// by a flood of best-effort scans. The wire default (zero) is `Normal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum RequestPriority {
    Normal = 0,
    HighImportant = 1,
    High = 2,
    Important = 3,
    BestEffort = 4,
}

/// Tabular result: named columns over value rows.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataSet {
    #[prost(string, repeated, tag = "1")]
    pub column_names: Vec<String>,
    #[prost(message, repeated, tag = "2")]
    pub rows: Vec<Row>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Row {
    #[prost(message, repeated, tag = "1")]
    pub values: Vec<WireValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VidList {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub vids: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetVertexPropsRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(btree_map = "int32, message", tag = "2")]
    pub parts: BTreeMap<i32, VidList>,
    /// Restrict to one tag; zero means every tag of the vertex.
    #[prost(int32, tag = "3")]
    pub tag_id: i32,
    /// Requested property names; empty means all.
    #[prost(string, repeated, tag = "4")]
    pub props: Vec<String>,
    #[prost(bytes = "vec", tag = "5")]
    pub filter: Vec<u8>,
    #[prost(enumeration = "RequestPriority", tag = "6")]
    pub priority: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetEdgePropsRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(btree_map = "int32, message", tag = "2")]
    pub parts: BTreeMap<i32, EdgeIdList>,
    #[prost(string, repeated, tag = "3")]
    pub props: Vec<String>,
    #[prost(bytes = "vec", tag = "4")]
    pub filter: Vec<u8>,
    #[prost(enumeration = "RequestPriority", tag = "5")]
    pub priority: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetPropsResponse {
    #[prost(message, optional, tag = "1")]
    pub result: Option<ResponseCommon>,
    #[prost(message, optional, tag = "2")]
    pub data: Option<DataSet>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum EdgeDirection {
    Out = 0,
    In = 1,
    Both = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OrderBy {
    /// A response column name.
    #[prost(string, tag = "1")]
    pub prop: String,
    #[prost(bool, tag = "2")]
    pub desc: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetNeighborsRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(btree_map = "int32, message", tag = "2")]
    pub parts: BTreeMap<i32, VidList>,
    /// Positive edge types; direction selects the stored orientation.
    #[prost(int32, repeated, tag = "3")]
    pub edge_types: Vec<i32>,
    #[prost(enumeration = "EdgeDirection", tag = "4")]
    pub direction: i32,
    /// Source-vertex tag properties to return, as (tagId, prop name).
    #[prost(message, repeated, tag = "5")]
    pub vertex_props: Vec<TagProp>,
    /// Edge properties to return; empty means all.
    #[prost(string, repeated, tag = "6")]
    pub edge_props: Vec<String>,
    /// Serialized edge-scoped expressions computed per row.
    #[prost(bytes = "vec", repeated, tag = "7")]
    pub exprs: Vec<Vec<u8>>,
    #[prost(bool, tag = "8")]
    pub dedup: bool,
    #[prost(message, repeated, tag = "9")]
    pub order_by: Vec<OrderBy>,
    /// Bound on returned rows per source vertex; zero means unbounded.
    #[prost(int64, tag = "10")]
    pub limit: i64,
    #[prost(bytes = "vec", tag = "11")]
    pub filter: Vec<u8>,
    /// Aggregates computed per source vertex over its matching edges.
    #[prost(message, repeated, tag = "12")]
    pub stat_props: Vec<StatProp>,
    #[prost(enumeration = "RequestPriority", tag = "13")]
    pub priority: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatKind {
    Count = 0,
    Sum = 1,
    Avg = 2,
    Min = 3,
    Max = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatProp {
    #[prost(string, tag = "1")]
    pub prop: String,
    #[prost(enumeration = "StatKind", tag = "2")]
    pub kind: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TagProp {
    #[prost(int32, tag = "1")]
    pub tag_id: i32,
    #[prost(string, tag = "2")]
    pub prop: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetNeighborsResponse {
    #[prost(message, optional, tag = "1")]
    pub result: Option<ResponseCommon>,
    #[prost(message, optional, tag = "2")]
    pub data: Option<DataSet>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDstBySrcRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(btree_map = "int32, message", tag = "2")]
    pub parts: BTreeMap<i32, VidList>,
    #[prost(int32, repeated, tag = "3")]
    pub edge_types: Vec<i32>,
    #[prost(enumeration = "RequestPriority", tag = "4")]
    pub priority: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetDstBySrcResponse {
    #[prost(message, optional, tag = "1")]
    pub result: Option<ResponseCommon>,
    /// Partition-locally deduplicated destination ids; global
    /// deduplication is the caller's concern.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub dsts: Vec<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ColumnHintKind {
    /// Equality on a leading column.
    Prefix = 0,
    /// Half-open range on the last hinted column.
    Range = 1,
}

/// A planner-classified scan hint over one indexed column.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnHint {
    #[prost(string, tag = "1")]
    pub column: String,
    #[prost(enumeration = "ColumnHintKind", tag = "2")]
    pub kind: i32,
    /// The equality value for `Prefix`; the inclusive lower bound for
    /// `Range` (absent kind = unbounded).
    #[prost(message, optional, tag = "3")]
    pub begin: Option<WireValue>,
    /// The exclusive upper bound for `Range`.
    #[prost(message, optional, tag = "4")]
    pub end: Option<WireValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LookupIndexRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, repeated, tag = "2")]
    pub part_ids: Vec<i32>,
    #[prost(int32, tag = "3")]
    pub index_id: i32,
    #[prost(message, repeated, tag = "4")]
    pub column_hints: Vec<ColumnHint>,
    #[prost(string, repeated, tag = "5")]
    pub return_columns: Vec<String>,
    /// Residual filter the planner could not push into the hints.
    #[prost(bytes = "vec", tag = "6")]
    pub filter: Vec<u8>,
    #[prost(message, repeated, tag = "7")]
    pub order_by: Vec<OrderBy>,
    #[prost(int64, tag = "8")]
    pub limit: i64,
    #[prost(enumeration = "RequestPriority", tag = "9")]
    pub priority: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LookupIndexResponse {
    #[prost(message, optional, tag = "1")]
    pub result: Option<ResponseCommon>,
    #[prost(message, optional, tag = "2")]
    pub data: Option<DataSet>,
}

// Admin surface.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransferLeaderRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    #[prost(message, optional, tag = "3")]
    pub new_leader: Option<HostAddr>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddPartRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    #[prost(bool, tag = "3")]
    pub as_learner: bool,
    #[prost(message, repeated, tag = "4")]
    pub peers: Vec<HostAddr>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemovePartRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemberChangeRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    #[prost(bool, tag = "3")]
    pub add: bool,
    #[prost(message, optional, tag = "4")]
    pub peer: Option<HostAddr>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddLearnerRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    #[prost(message, optional, tag = "3")]
    pub learner: Option<HostAddr>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CatchUpDataRequest {
    #[prost(int32, tag = "1")]
    pub space_id: i32,
    #[prost(int32, tag = "2")]
    pub part_id: i32,
    #[prost(message, optional, tag = "3")]
    pub target: Option<HostAddr>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLeaderRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PartList {
    #[prost(int32, repeated, tag = "1")]
    pub part_ids: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLeaderResponse {
    #[prost(message, optional, tag = "1")]
    pub result: Option<ResponseCommon>,
    /// Partitions this host currently leads, by space.
    #[prost(btree_map = "int32, message", tag = "2")]
    pub leader_parts: BTreeMap<i32, PartList>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminResponse {
    #[prost(message, optional, tag = "1")]
    pub result: Option<ResponseCommon>,
}
