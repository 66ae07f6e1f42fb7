//! The partition-aware client: groups sub-requests by partition leader,
//! fans out in parallel under a per-host concurrency cap, refreshes
//! leader hints and retries on `LeaderChanged`, and merges per-partition
//! outcomes into one response with a completeness percentage.
//!
//! Paired-edge handling lives here: every logical edge is expanded into
//! its out-edge record (source partition) and in-edge record
//! (destination partition, negated type) before dispatch. The two sides
//! are independent groups; a half-failure is reported and absorbed by
//! the next write on the same idempotency key.

use super::store::GraphStore;
use models::{partition_of, HostAddr, PartitionId, SpaceId, VertexId};
use proto_storage::storage::*;
use proto_storage::{ErrorCode, PartitionResult, ResponseCommon};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("host {0} is unreachable")]
    Unreachable(HostAddr),
    #[error("request to {0} timed out")]
    Timeout(HostAddr),
}

/// One storage RPC, batched per destination host.
#[derive(Clone)]
pub enum StorageRequest {
    AddVertices(AddVerticesRequest),
    AddEdges(AddEdgesRequest),
    UpdateVertex(UpdateVertexRequest),
    UpdateEdge(UpdateEdgeRequest),
    DeleteVertex(DeleteVertexRequest),
    DeleteEdges(DeleteEdgesRequest),
    GetVertexProps(GetVertexPropsRequest),
    GetEdgeProps(GetEdgePropsRequest),
    GetNeighbors(GetNeighborsRequest),
    GetDstBySrc(GetDstBySrcRequest),
    LookupIndex(LookupIndexRequest),
}

#[derive(Clone)]
pub enum StorageResponse {
    Exec(ExecResponse),
    Update(UpdateResponse),
    DeleteVertex(DeleteVertexResponse),
    Props(GetPropsResponse),
    Neighbors(GetNeighborsResponse),
    Dsts(GetDstBySrcResponse),
    Lookup(LookupIndexResponse),
}

impl StorageResponse {
    fn common(&self) -> ResponseCommon {
        let common = match self {
            StorageResponse::Exec(r) => &r.result,
            StorageResponse::Update(r) => &r.result,
            StorageResponse::DeleteVertex(r) => &r.result,
            StorageResponse::Props(r) => &r.result,
            StorageResponse::Neighbors(r) => &r.result,
            StorageResponse::Dsts(r) => &r.result,
            StorageResponse::Lookup(r) => &r.result,
        };
        common.clone().unwrap_or_default()
    }
}

#[async_trait::async_trait]
pub trait StorageTransport: Send + Sync + 'static {
    async fn exec(
        &self,
        host: &HostAddr,
        request: StorageRequest,
    ) -> std::result::Result<StorageResponse, TransportError>;
}

/// In-process transport: routes requests to registered stores directly.
#[derive(Default)]
pub struct LocalTransport {
    stores: Mutex<HashMap<HostAddr, Arc<GraphStore>>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, host: HostAddr, store: Arc<GraphStore>) {
        self.stores.lock().unwrap().insert(host, store);
    }
}

#[async_trait::async_trait]
impl StorageTransport for LocalTransport {
    async fn exec(
        &self,
        host: &HostAddr,
        request: StorageRequest,
    ) -> std::result::Result<StorageResponse, TransportError> {
        let store = self
            .stores
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(host.clone()))?;

        Ok(match request {
            StorageRequest::AddVertices(req) => StorageResponse::Exec(store.add_vertices(req).await),
            StorageRequest::AddEdges(req) => StorageResponse::Exec(store.add_edges(req).await),
            StorageRequest::UpdateVertex(req) => {
                StorageResponse::Update(store.update_vertex(req).await)
            }
            StorageRequest::UpdateEdge(req) => StorageResponse::Update(store.update_edge(req).await),
            StorageRequest::DeleteVertex(req) => {
                StorageResponse::DeleteVertex(store.delete_vertex(req).await)
            }
            StorageRequest::DeleteEdges(req) => StorageResponse::Exec(store.delete_edges(req).await),
            StorageRequest::GetVertexProps(req) => {
                StorageResponse::Props(store.get_vertex_props(req).await)
            }
            StorageRequest::GetEdgeProps(req) => {
                StorageResponse::Props(store.get_edge_props(req).await)
            }
            StorageRequest::GetNeighbors(req) => {
                StorageResponse::Neighbors(store.get_neighbors(req).await)
            }
            StorageRequest::GetDstBySrc(req) => {
                StorageResponse::Dsts(store.get_dst_by_src(req).await)
            }
            StorageRequest::LookupIndex(req) => {
                StorageResponse::Lookup(store.lookup_index(req).await)
            }
        })
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub max_retries: u32,
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
    pub per_host_concurrency: usize,
    /// Return partial results instead of failing the whole request.
    pub accept_partial_success: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_min: Duration::from_millis(50),
            retry_backoff_max: Duration::from_secs(2),
            per_host_concurrency: 8,
            accept_partial_success: false,
        }
    }
}

pub struct StorageClient {
    meta: Arc<catalog::MetaCache>,
    transport: Arc<dyn StorageTransport>,
    config: ClientConfig,
    gates: Mutex<HashMap<HostAddr, Arc<Semaphore>>>,
}

impl StorageClient {
    pub fn new(
        meta: Arc<catalog::MetaCache>,
        transport: Arc<dyn StorageTransport>,
        config: ClientConfig,
    ) -> Arc<StorageClient> {
        Arc::new(StorageClient {
            meta,
            transport,
            config,
            gates: Mutex::new(HashMap::new()),
        })
    }


    /// Apply the read-side partial-success policy.
    fn read_result(&self, common: ResponseCommon) -> crate::Result<ResponseCommon> {
        if !self.config.accept_partial_success && common.completeness < 100 {
            return Err(crate::Error::Incomplete {
                completeness: common.completeness,
            });
        }
        Ok(common)
    }

    fn gate(&self, host: &HostAddr) -> Arc<Semaphore> {
        self.gates
            .lock()
            .unwrap()
            .entry(host.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_host_concurrency)))
            .clone()
    }

    /// Drive partition-keyed sub-requests to completion: resolve leaders,
    /// fan out per host, fold `LeaderChanged` parts back into the retry
    /// set with refreshed hints, give up after the retry budget.
    async fn dispatch<S: Clone>(
        &self,
        space_id: SpaceId,
        mut remaining: BTreeMap<PartitionId, S>,
        make: impl Fn(BTreeMap<PartitionId, S>) -> StorageRequest,
    ) -> (Vec<StorageResponse>, Vec<PartitionResult>) {
        let backoff = exponential_backoff::Backoff::new(
            self.config.max_retries,
            self.config.retry_backoff_min,
            Some(self.config.retry_backoff_max),
        );
        let mut responses = Vec::new();
        let mut failed: Vec<PartitionResult> = Vec::new();

        for attempt in 0..=self.config.max_retries {
            if remaining.is_empty() {
                break;
            }
            if attempt > 0 {
                if let Some(delay) = backoff.next(attempt) {
                    tokio::time::sleep(delay).await;
                }
            }

            // Group this round's parts by their leader hint.
            let mut by_host: HashMap<HostAddr, BTreeMap<PartitionId, S>> = HashMap::new();
            let mut undeliverable = Vec::new();
            for (part_id, sub) in std::mem::take(&mut remaining) {
                match self.meta.leader_of(space_id, part_id) {
                    Ok(Some(leader)) => {
                        by_host.entry(leader).or_default().insert(part_id, sub);
                    }
                    Ok(None) => undeliverable.push((part_id, ErrorCode::LeaderChanged, sub)),
                    Err(_) => undeliverable.push((part_id, ErrorCode::PartNotFound, sub)),
                }
            }
            for (part_id, code, sub) in undeliverable {
                if code == ErrorCode::LeaderChanged && attempt < self.config.max_retries {
                    remaining.insert(part_id, sub); // Hint may refresh.
                } else {
                    failed.push(PartitionResult {
                        code: code as i32,
                        part_id,
                        leader: None,
                    });
                }
            }

            // Parallel fan-out, bounded per host.
            let sends = by_host.into_iter().map(|(host, parts)| {
                let request = make(parts.clone());
                let gate = self.gate(&host);
                let transport = self.transport.clone();
                async move {
                    let _permit = gate.acquire().await.expect("gate never closes");
                    let outcome = transport.exec(&host, request).await;
                    (host, parts, outcome)
                }
            });
            let outcomes = futures::future::join_all(sends).await;

            for (host, parts, outcome) in outcomes {
                match outcome {
                    Err(err) => {
                        tracing::debug!(%host, %err, "host batch failed; retrying its parts");
                        for (part_id, sub) in parts {
                            if attempt < self.config.max_retries {
                                remaining.insert(part_id, sub);
                            } else {
                                failed.push(PartitionResult {
                                    code: ErrorCode::Timeout as i32,
                                    part_id,
                                    leader: None,
                                });
                            }
                        }
                    }
                    Ok(response) => {
                        let common = response.common();
                        for failure in &common.failed_parts {
                            let code =
                                ErrorCode::try_from(failure.code).unwrap_or(ErrorCode::Unknown);
                            if code == ErrorCode::LeaderChanged && attempt < self.config.max_retries
                            {
                                if let Some(leader) = &failure.leader {
                                    self.meta.note_leader(
                                        space_id,
                                        failure.part_id,
                                        leader.into(),
                                    );
                                }
                                if let Some(sub) = parts.get(&failure.part_id) {
                                    remaining.insert(failure.part_id, sub.clone());
                                }
                            } else {
                                failed.push(failure.clone());
                            }
                        }
                        responses.push(response);
                    }
                }
            }
        }
        (responses, failed)
    }

    pub async fn add_vertices(
        &self,
        space_id: SpaceId,
        vertices: Vec<NewVertex>,
        if_not_exists: bool,
    ) -> crate::Result<ExecResponse> {
        let desc = self.meta.space_desc(space_id)?;
        let mut parts: BTreeMap<PartitionId, NewVertexList> = BTreeMap::new();
        for vertex in vertices {
            let part = partition_of(&VertexId::new(vertex.id.clone()), desc.partition_num);
            parts.entry(part).or_default().vertices.push(vertex);
        }
        let total = parts.len();

        let (_, failed) = self
            .dispatch(space_id, parts, |parts| {
                StorageRequest::AddVertices(AddVerticesRequest {
                    space_id,
                    parts,
                    if_not_exists,
                })
            })
            .await;
        Ok(ExecResponse {
            result: Some(ResponseCommon::of(total, failed)),
        })
    }

    /// Expand each logical edge into its two stored records, then add.
    pub async fn add_edges(
        &self,
        space_id: SpaceId,
        edges: Vec<NewEdge>,
        if_not_exists: bool,
    ) -> crate::Result<ExecResponse> {
        let desc = self.meta.space_desc(space_id)?;
        let mut parts: BTreeMap<PartitionId, NewEdgeList> = BTreeMap::new();
        for edge in edges {
            let Some(id) = edge.id.clone() else {
                continue;
            };
            let out_part = partition_of(&VertexId::new(id.src.clone()), desc.partition_num);
            parts.entry(out_part).or_default().edges.push(edge.clone());

            let reversed = NewEdge {
                id: Some(EdgeId {
                    src: id.dst.clone(),
                    edge_type: -id.edge_type,
                    ranking: id.ranking,
                    dst: id.src.clone(),
                }),
                prop_names: edge.prop_names.clone(),
                prop_values: edge.prop_values.clone(),
            };
            let in_part = partition_of(&VertexId::new(id.dst), desc.partition_num);
            parts.entry(in_part).or_default().edges.push(reversed);
        }
        let total = parts.len();

        let (_, failed) = self
            .dispatch(space_id, parts, |parts| {
                StorageRequest::AddEdges(AddEdgesRequest {
                    space_id,
                    parts,
                    if_not_exists,
                })
            })
            .await;
        Ok(ExecResponse {
            result: Some(ResponseCommon::of(total, failed)),
        })
    }

    pub async fn delete_edges(
        &self,
        space_id: SpaceId,
        edges: Vec<EdgeId>,
    ) -> crate::Result<ExecResponse> {
        let desc = self.meta.space_desc(space_id)?;
        let mut parts: BTreeMap<PartitionId, EdgeIdList> = BTreeMap::new();
        for id in edges {
            let out_part = partition_of(&VertexId::new(id.src.clone()), desc.partition_num);
            let reversed = EdgeId {
                src: id.dst.clone(),
                edge_type: -id.edge_type,
                ranking: id.ranking,
                dst: id.src.clone(),
            };
            let in_part = partition_of(&VertexId::new(id.dst.clone()), desc.partition_num);
            parts.entry(out_part).or_default().edges.push(id);
            parts.entry(in_part).or_default().edges.push(reversed);
        }
        let total = parts.len();

        let (_, failed) = self
            .dispatch(space_id, parts, |parts| {
                StorageRequest::DeleteEdges(DeleteEdgesRequest { space_id, parts })
            })
            .await;
        Ok(ExecResponse {
            result: Some(ResponseCommon::of(total, failed)),
        })
    }

    pub async fn update_vertex(&self, req: UpdateVertexRequest) -> crate::Result<UpdateResponse> {
        let space_id = req.space_id;
        let part_id = req.part_id;
        let (responses, failed) = self
            .dispatch(
                space_id,
                [(part_id, req)].into_iter().collect::<BTreeMap<_, _>>(),
                |mut parts| {
                    StorageRequest::UpdateVertex(parts.remove(&part_id).expect("one part"))
                },
            )
            .await;

        for response in responses {
            if let StorageResponse::Update(update) = response {
                let ok = update
                    .result
                    .as_ref()
                    .map(|common| common.failed_parts.is_empty())
                    .unwrap_or(false);
                if ok {
                    return Ok(update);
                }
            }
        }
        Ok(UpdateResponse {
            result: Some(ResponseCommon::of(1, failed)),
            data: None,
        })
    }

    /// Update both stored halves of a logical edge: the addressed
    /// orientation first, then its pair on the other endpoint's
    /// partition with the same assignments.
    pub async fn update_edge(&self, req: UpdateEdgeRequest) -> crate::Result<UpdateResponse> {
        let space_id = req.space_id;
        let part_id = req.part_id;

        let pair = req.edge.as_ref().map(|id| {
            let desc = self.meta.space_desc(space_id);
            (
                id.clone(),
                desc.map(|desc| {
                    partition_of(&VertexId::new(id.dst.clone()), desc.partition_num)
                }),
            )
        });

        let (responses, failed) = self
            .dispatch(
                space_id,
                [(part_id, req.clone())].into_iter().collect::<BTreeMap<_, _>>(),
                |mut parts| StorageRequest::UpdateEdge(parts.remove(&part_id).expect("one part")),
            )
            .await;

        let mut primary = None;
        for response in responses {
            if let StorageResponse::Update(update) = response {
                let ok = update
                    .result
                    .as_ref()
                    .map(|common| common.failed_parts.is_empty())
                    .unwrap_or(false);
                if ok {
                    primary = Some(update);
                }
            }
        }
        let Some(primary) = primary else {
            return Ok(UpdateResponse {
                result: Some(ResponseCommon::of(1, failed)),
                data: None,
            });
        };

        if let Some((id, Ok(pair_part))) = pair {
            let reversed = UpdateEdgeRequest {
                space_id,
                part_id: pair_part,
                edge: Some(EdgeId {
                    src: id.dst,
                    edge_type: -id.edge_type,
                    ranking: id.ranking,
                    dst: id.src,
                }),
                updated_props: req.updated_props.clone(),
                insertable: req.insertable,
                condition: req.condition.clone(),
            };
            // A half-failure here is repaired by the next write on the
            // same edge; report it without unwinding the primary.
            let (_, pair_failed) = self
                .dispatch(
                    space_id,
                    [(pair_part, reversed)].into_iter().collect::<BTreeMap<_, _>>(),
                    |mut parts| {
                        StorageRequest::UpdateEdge(parts.remove(&pair_part).expect("one part"))
                    },
                )
                .await;
            if !pair_failed.is_empty() {
                tracing::warn!(
                    space = space_id,
                    part = pair_part,
                    "paired edge update half-failed; next write reconciles"
                );
            }
        }
        Ok(primary)
    }

    /// Delete a vertex, its tag rows, and every incident edge: loops
    /// capped delete rounds through the owning partition, deleting the
    /// reported remote halves between rounds.
    pub async fn delete_vertex(
        &self,
        space_id: SpaceId,
        vid: Vec<u8>,
    ) -> crate::Result<ExecResponse> {
        let desc = self.meta.space_desc(space_id)?;
        let part_id = partition_of(&VertexId::new(vid.clone()), desc.partition_num);

        let mut cursor = Vec::new();
        let mut failed = Vec::new();
        loop {
            let req = DeleteVertexRequest {
                space_id,
                part_id,
                vid: vid.clone(),
                cursor: cursor.clone(),
            };
            let (responses, mut round_failed) = self
                .dispatch(
                    space_id,
                    [(part_id, req)].into_iter().collect::<BTreeMap<_, _>>(),
                    |mut parts| {
                        StorageRequest::DeleteVertex(parts.remove(&part_id).expect("one part"))
                    },
                )
                .await;
            failed.append(&mut round_failed);

            let mut next_cursor = Vec::new();
            let mut pending = Vec::new();
            for response in responses {
                if let StorageResponse::DeleteVertex(del) = response {
                    next_cursor = del.cursor;
                    pending = del.pending_edges;
                }
            }

            // Remote halves go through their own partitions' logs. They
            // are already oriented for their storing partition, so they
            // dispatch directly, without pair expansion.
            if !pending.is_empty() {
                let mut parts: BTreeMap<PartitionId, EdgeIdList> = BTreeMap::new();
                for id in pending {
                    let part = partition_of(&VertexId::new(id.src.clone()), desc.partition_num);
                    parts.entry(part).or_default().edges.push(id);
                }
                let (_, mut edge_failed) = self
                    .dispatch(space_id, parts, |parts| {
                        StorageRequest::DeleteEdges(DeleteEdgesRequest { space_id, parts })
                    })
                    .await;
                failed.append(&mut edge_failed);
            }

            if next_cursor.is_empty() {
                break;
            }
            cursor = next_cursor;
        }

        Ok(ExecResponse {
            result: Some(ResponseCommon::of(1, failed)),
        })
    }

    pub async fn get_vertex_props(
        &self,
        space_id: SpaceId,
        vids: Vec<Vec<u8>>,
        tag_id: i32,
        props: Vec<String>,
        filter: Vec<u8>,
    ) -> crate::Result<GetPropsResponse> {
        let desc = self.meta.space_desc(space_id)?;
        let mut parts: BTreeMap<PartitionId, VidList> = BTreeMap::new();
        for vid in vids {
            let part = partition_of(&VertexId::new(vid.clone()), desc.partition_num);
            parts.entry(part).or_default().vids.push(vid);
        }
        let total = parts.len();

        let (responses, failed) = self
            .dispatch(space_id, parts, |parts| {
                StorageRequest::GetVertexProps(GetVertexPropsRequest {
                    space_id,
                    parts,
                    tag_id,
                    props: props.clone(),
                    filter: filter.clone(),
                    priority: RequestPriority::Normal as i32,
                })
            })
            .await;

        let mut data = DataSet::default();
        for response in responses {
            if let StorageResponse::Props(props) = response {
                if let Some(part_data) = props.data {
                    if data.column_names.is_empty() {
                        data.column_names = part_data.column_names;
                    }
                    data.rows.extend(part_data.rows);
                }
            }
        }
        Ok(GetPropsResponse {
            result: Some(self.read_result(ResponseCommon::of(total, failed))?),
            data: Some(data),
        })
    }

    pub async fn get_neighbors(
        &self,
        space_id: SpaceId,
        vids: Vec<Vec<u8>>,
        template: GetNeighborsRequest,
    ) -> crate::Result<GetNeighborsResponse> {
        let desc = self.meta.space_desc(space_id)?;
        let mut parts: BTreeMap<PartitionId, VidList> = BTreeMap::new();
        for vid in vids {
            let part = partition_of(&VertexId::new(vid.clone()), desc.partition_num);
            parts.entry(part).or_default().vids.push(vid);
        }
        let total = parts.len();

        let (responses, failed) = self
            .dispatch(space_id, parts, |parts| {
                let mut request = template.clone();
                request.space_id = space_id;
                request.parts = parts;
                StorageRequest::GetNeighbors(request)
            })
            .await;

        let mut data = DataSet::default();
        for response in responses {
            if let StorageResponse::Neighbors(neighbors) = response {
                if let Some(part_data) = neighbors.data {
                    if data.column_names.is_empty() {
                        data.column_names = part_data.column_names;
                    }
                    data.rows.extend(part_data.rows);
                }
            }
        }
        Ok(GetNeighborsResponse {
            result: Some(self.read_result(ResponseCommon::of(total, failed))?),
            data: Some(data),
        })
    }

    pub async fn get_dst_by_src(
        &self,
        space_id: SpaceId,
        vids: Vec<Vec<u8>>,
        edge_types: Vec<i32>,
    ) -> crate::Result<GetDstBySrcResponse> {
        let desc = self.meta.space_desc(space_id)?;
        let mut parts: BTreeMap<PartitionId, VidList> = BTreeMap::new();
        for vid in vids {
            let part = partition_of(&VertexId::new(vid.clone()), desc.partition_num);
            parts.entry(part).or_default().vids.push(vid);
        }
        let total = parts.len();

        let (responses, failed) = self
            .dispatch(space_id, parts, |parts| {
                StorageRequest::GetDstBySrc(GetDstBySrcRequest {
                    space_id,
                    parts,
                    edge_types: edge_types.clone(),
                    priority: RequestPriority::Normal as i32,
                })
            })
            .await;

        let mut dsts = BTreeSet::new();
        for response in responses {
            if let StorageResponse::Dsts(part_dsts) = response {
                dsts.extend(part_dsts.dsts);
            }
        }
        Ok(GetDstBySrcResponse {
            result: Some(self.read_result(ResponseCommon::of(total, failed))?),
            dsts: dsts.into_iter().collect(),
        })
    }

    pub async fn lookup_index(
        &self,
        space_id: SpaceId,
        template: LookupIndexRequest,
    ) -> crate::Result<LookupIndexResponse> {
        let desc = self.meta.space_desc(space_id)?;
        let parts: BTreeMap<PartitionId, ()> =
            (1..=desc.partition_num).map(|part| (part, ())).collect();
        let total = parts.len();

        let (responses, failed) = self
            .dispatch(space_id, parts, |parts| {
                let mut request = template.clone();
                request.space_id = space_id;
                request.part_ids = parts.keys().copied().collect();
                StorageRequest::LookupIndex(request)
            })
            .await;

        let mut data = DataSet::default();
        for response in responses {
            if let StorageResponse::Lookup(lookup) = response {
                if let Some(part_data) = lookup.data {
                    if data.column_names.is_empty() {
                        data.column_names = part_data.column_names;
                    }
                    data.rows.extend(part_data.rows);
                }
            }
        }
        Ok(LookupIndexResponse {
            result: Some(self.read_result(ResponseCommon::of(total, failed))?),
            data: Some(data),
        })
    }
}
