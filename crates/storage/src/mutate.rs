//! The mutation pipeline: validate against the cached schema, resolve the
//! current row under an engine snapshot, assemble a deterministic apply
//! plan (data operations plus the index maintenance they imply), and
//! replicate it through the partition's log. Apply happens in
//! `Part::commit_logs`, identically on every replica.

use super::part::{evict_token, plan_with};
use super::store::GraphStore;
use super::{Error, Result};
use catalog::SchemaTarget;
use codec::{RowReader, RowWriter};
use engine::KvEngine;
use models::{
    EdgeRanking, EdgeType, PartitionId, Schema, SpaceDesc, SpaceId, TagId, Value, VertexId,
};
use proto_storage::plan::KvOp;
use proto_storage::storage::*;
use proto_storage::{value_from_wire, ErrorCode, PartitionResult, ResponseCommon, WireValue};
use std::collections::BTreeMap;
use std::sync::Arc;

impl GraphStore {
    pub async fn add_vertices(&self, req: AddVerticesRequest) -> ExecResponse {
        let mut failed = Vec::new();
        let total = req.parts.len();
        for (part_id, list) in &req.parts {
            let fingerprint = fingerprint_of("add_vertices", req.space_id, *part_id, list);
            if let Err(err) = self
                .add_vertices_part(req.space_id, *part_id, list, req.if_not_exists, fingerprint)
                .await
            {
                failed.push(part_failure(*part_id, &err));
            }
        }
        ExecResponse {
            result: Some(ResponseCommon::of(total, failed)),
        }
    }

    async fn add_vertices_part(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        list: &NewVertexList,
        if_not_exists: bool,
        fingerprint: u64,
    ) -> Result<()> {
        let desc = self.space_desc(space_id)?;
        let part = self.part(space_id, part_id)?;
        part.ensure_leader()?;
        if part.absorb_fingerprint(fingerprint) {
            return Ok(());
        }

        let version = (self.version_clock)();
        let now = (self.wall_clock)();
        let mut ops = Vec::new();
        let mut evict = Vec::new();

        for vertex in &list.vertices {
            let vid = VertexId::new(vertex.id.clone());
            let padded = vid.padded(desc.vid_len)?;
            for tag in &vertex.tags {
                let schema = self
                    .meta
                    .schema(space_id, SchemaTarget::Tag(tag.tag_id), None)?;
                let old_row = current_tag_row(part.engine(), part_id, &vid, desc.vid_len, tag.tag_id)?;
                if if_not_exists && old_row.is_some() {
                    continue;
                }

                let row = build_row(&schema, &tag.prop_names, &tag.prop_values, now)?;
                let key = codec::vertex_key(part_id, &vid, desc.vid_len, tag.tag_id, version)?;
                ops.push(KvOp::put(key, row.clone()));

                let new_vals = self.row_values(space_id, SchemaTarget::Tag(tag.tag_id), &row)?;
                let old_vals = old_row
                    .map(|row| self.row_values(space_id, SchemaTarget::Tag(tag.tag_id), &row))
                    .transpose()?;
                self.index_ops(
                    &mut ops,
                    part.engine(),
                    space_id,
                    part_id,
                    desc.vid_len,
                    tag.tag_id,
                    false,
                    &schema,
                    IndexOwner::Tag { vid: &vid },
                    old_vals.as_ref(),
                    Some(&new_vals),
                )?;
                evict.push(evict_token(&padded, tag.tag_id));
            }
        }

        part.append_plan(
            plan_with(ops, fingerprint, evict),
            self.config.mutation_timeout,
        )
        .await
        .map(|_| ())
    }

    pub async fn add_edges(&self, req: AddEdgesRequest) -> ExecResponse {
        let mut failed = Vec::new();
        let total = req.parts.len();
        for (part_id, list) in &req.parts {
            let fingerprint = fingerprint_of("add_edges", req.space_id, *part_id, list);
            if let Err(err) = self
                .add_edges_part(req.space_id, *part_id, list, req.if_not_exists, fingerprint)
                .await
            {
                failed.push(part_failure(*part_id, &err));
            }
        }
        ExecResponse {
            result: Some(ResponseCommon::of(total, failed)),
        }
    }

    async fn add_edges_part(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        list: &NewEdgeList,
        if_not_exists: bool,
        fingerprint: u64,
    ) -> Result<()> {
        let desc = self.space_desc(space_id)?;
        let part = self.part(space_id, part_id)?;
        part.ensure_leader()?;
        if part.absorb_fingerprint(fingerprint) {
            return Ok(());
        }

        let version = (self.version_clock)();
        let now = (self.wall_clock)();
        let mut ops = Vec::new();

        for edge in &list.edges {
            let id = edge
                .id
                .as_ref()
                .ok_or_else(|| Error::IllFormed("edge without an id".to_string()))?;
            let src = VertexId::new(id.src.clone());
            let dst = VertexId::new(id.dst.clone());
            let schema = self
                .meta
                .schema(space_id, SchemaTarget::Edge(id.edge_type), None)?;

            let old_row = current_edge_row(
                part.engine(),
                part_id,
                &src,
                desc.vid_len,
                id.edge_type,
                id.ranking,
                &dst,
            )?;
            if if_not_exists && old_row.is_some() {
                continue;
            }

            let row = build_row(&schema, &edge.prop_names, &edge.prop_values, now)?;
            let key = codec::edge_key(
                part_id,
                &src,
                desc.vid_len,
                id.edge_type,
                id.ranking,
                &dst,
                version,
            )?;
            ops.push(KvOp::put(key, row.clone()));

            // Only the outbound orientation contributes to edge indexes.
            if id.edge_type > 0 {
                let new_vals =
                    self.row_values(space_id, SchemaTarget::Edge(id.edge_type), &row)?;
                let old_vals = old_row
                    .map(|row| self.row_values(space_id, SchemaTarget::Edge(id.edge_type), &row))
                    .transpose()?;
                self.index_ops(
                    &mut ops,
                    part.engine(),
                    space_id,
                    part_id,
                    desc.vid_len,
                    id.edge_type,
                    true,
                    &schema,
                    IndexOwner::Edge {
                        src: &src,
                        ranking: id.ranking,
                        dst: &dst,
                    },
                    old_vals.as_ref(),
                    Some(&new_vals),
                )?;
            }
        }

        part.append_plan(
            plan_with(ops, fingerprint, Vec::new()),
            self.config.mutation_timeout,
        )
        .await
        .map(|_| ())
    }

    pub async fn update_vertex(&self, req: UpdateVertexRequest) -> UpdateResponse {
        match self.update_vertex_inner(&req).await {
            Ok(data) => UpdateResponse {
                result: Some(ResponseCommon::of(1, Vec::new())),
                data,
            },
            Err(err) => UpdateResponse {
                result: Some(ResponseCommon::of(1, vec![part_failure(req.part_id, &err)])),
                data: None,
            },
        }
    }

    async fn update_vertex_inner(&self, req: &UpdateVertexRequest) -> Result<Option<DataSet>> {
        let space_id = req.space_id;
        let desc = self.space_desc(space_id)?;
        let part = self.part(space_id, req.part_id)?;
        part.ensure_leader()?;

        let vid = VertexId::new(req.vid.clone());
        let schema = self
            .meta
            .schema(space_id, SchemaTarget::Tag(req.tag_id), None)?;
        let old_row = current_tag_row(part.engine(), req.part_id, &vid, desc.vid_len, req.tag_id)?;

        let old_vals = match &old_row {
            Some(row) => Some(self.row_values(space_id, SchemaTarget::Tag(req.tag_id), row)?),
            None if req.insertable => None,
            None => return Err(Error::ItemNotFound(format!("vertex {vid:?}"))),
        };

        // The update applies only when the condition holds on the current
        // row; otherwise the current state is returned unchanged.
        if !req.condition.is_empty() {
            let expr = expr::Expr::from_bytes(&req.condition)?;
            let scope = old_vals.clone().unwrap_or_default();
            if !expr::matches(&expr, &scope)? {
                return Ok(Some(dataset_of(&schema, old_vals.as_ref())));
            }
        }

        let mut merged = old_vals.clone().unwrap_or_default();
        for prop in &req.updated_props {
            let value = wire_value(prop.value.as_ref())?;
            merged.insert(prop.name.clone(), value);
        }

        let now = (self.wall_clock)();
        let version = (self.version_clock)();
        let mut writer = RowWriter::new(&schema);
        for (index, field) in schema.fields.iter().enumerate() {
            if let Some(value) = merged.get(&field.name) {
                writer.set_at(index, value.clone())?;
            }
        }
        writer.set_write_ts(now);
        let row = writer.finish()?;
        let key = codec::vertex_key(req.part_id, &vid, desc.vid_len, req.tag_id, version)?;

        let mut ops = vec![KvOp::put(key, row.clone())];
        let new_vals = self.row_values(space_id, SchemaTarget::Tag(req.tag_id), &row)?;
        self.index_ops(
            &mut ops,
            part.engine(),
            space_id,
            req.part_id,
            desc.vid_len,
            req.tag_id,
            false,
            &schema,
            IndexOwner::Tag { vid: &vid },
            old_vals.as_ref(),
            Some(&new_vals),
        )?;

        let padded = vid.padded(desc.vid_len)?;
        let fingerprint = fingerprint_of("update_vertex", space_id, req.part_id, req);
        part.append_plan(
            plan_with(ops, fingerprint, vec![evict_token(&padded, req.tag_id)]),
            self.config.mutation_timeout,
        )
        .await?;

        Ok(Some(dataset_of(&schema, Some(&new_vals))))
    }

    pub async fn update_edge(&self, req: UpdateEdgeRequest) -> UpdateResponse {
        match self.update_edge_inner(&req).await {
            Ok(data) => UpdateResponse {
                result: Some(ResponseCommon::of(1, Vec::new())),
                data,
            },
            Err(err) => UpdateResponse {
                result: Some(ResponseCommon::of(1, vec![part_failure(req.part_id, &err)])),
                data: None,
            },
        }
    }

    async fn update_edge_inner(&self, req: &UpdateEdgeRequest) -> Result<Option<DataSet>> {
        let space_id = req.space_id;
        let desc = self.space_desc(space_id)?;
        let part = self.part(space_id, req.part_id)?;
        part.ensure_leader()?;

        let id = req
            .edge
            .as_ref()
            .ok_or_else(|| Error::IllFormed("update without an edge id".to_string()))?;
        let src = VertexId::new(id.src.clone());
        let dst = VertexId::new(id.dst.clone());
        let schema = self
            .meta
            .schema(space_id, SchemaTarget::Edge(id.edge_type), None)?;

        let old_row = current_edge_row(
            part.engine(),
            req.part_id,
            &src,
            desc.vid_len,
            id.edge_type,
            id.ranking,
            &dst,
        )?;
        let old_vals = match &old_row {
            Some(row) => Some(self.row_values(space_id, SchemaTarget::Edge(id.edge_type), row)?),
            None if req.insertable => None,
            None => return Err(Error::ItemNotFound(format!("edge {:?}", id.src))),
        };

        if !req.condition.is_empty() {
            let expr = expr::Expr::from_bytes(&req.condition)?;
            let scope = old_vals.clone().unwrap_or_default();
            if !expr::matches(&expr, &scope)? {
                return Ok(Some(dataset_of(&schema, old_vals.as_ref())));
            }
        }

        let mut merged = old_vals.clone().unwrap_or_default();
        for prop in &req.updated_props {
            merged.insert(prop.name.clone(), wire_value(prop.value.as_ref())?);
        }

        let now = (self.wall_clock)();
        let version = (self.version_clock)();
        let mut writer = RowWriter::new(&schema);
        for (index, field) in schema.fields.iter().enumerate() {
            if let Some(value) = merged.get(&field.name) {
                writer.set_at(index, value.clone())?;
            }
        }
        writer.set_write_ts(now);
        let row = writer.finish()?;
        let key = codec::edge_key(
            req.part_id,
            &src,
            desc.vid_len,
            id.edge_type,
            id.ranking,
            &dst,
            version,
        )?;

        let mut ops = vec![KvOp::put(key, row.clone())];
        if id.edge_type > 0 {
            let new_vals = self.row_values(space_id, SchemaTarget::Edge(id.edge_type), &row)?;
            self.index_ops(
                &mut ops,
                part.engine(),
                space_id,
                req.part_id,
                desc.vid_len,
                id.edge_type,
                true,
                &schema,
                IndexOwner::Edge {
                    src: &src,
                    ranking: id.ranking,
                    dst: &dst,
                },
                old_vals.as_ref(),
                Some(&new_vals),
            )?;
        }

        let fingerprint = fingerprint_of("update_edge", space_id, req.part_id, req);
        part.append_plan(plan_with(ops, fingerprint, Vec::new()), self.config.mutation_timeout)
            .await?;

        let new_vals = self.row_values(space_id, SchemaTarget::Edge(id.edge_type), &row)?;
        Ok(Some(dataset_of(&schema, Some(&new_vals))))
    }

    pub async fn delete_vertex(&self, req: DeleteVertexRequest) -> DeleteVertexResponse {
        match self.delete_vertex_inner(&req).await {
            Ok((cursor, pending_edges)) => DeleteVertexResponse {
                result: Some(ResponseCommon::of(1, Vec::new())),
                cursor,
                pending_edges,
            },
            Err(err) => DeleteVertexResponse {
                result: Some(ResponseCommon::of(1, vec![part_failure(req.part_id, &err)])),
                cursor: Vec::new(),
                pending_edges: Vec::new(),
            },
        }
    }

    /// Delete a vertex's tag rows and local incident-edge records, capped
    /// per round. Remote halves are reported back for the dispatcher to
    /// delete; a non-empty cursor means the caller must resume.
    async fn delete_vertex_inner(
        &self,
        req: &DeleteVertexRequest,
    ) -> Result<(Vec<u8>, Vec<EdgeId>)> {
        let space_id = req.space_id;
        let desc = self.space_desc(space_id)?;
        let part = self.part(space_id, req.part_id)?;
        part.ensure_leader()?;

        let vid = VertexId::new(req.vid.clone());
        let padded = vid.padded(desc.vid_len)?;
        let mut ops = Vec::new();
        let mut evict = Vec::new();
        let mut pending = Vec::new();

        // Incident edges, resuming from the caller's cursor.
        let scan_from = if req.cursor.is_empty() {
            codec::edge_prefix_src(req.part_id, &vid, desc.vid_len)?
        } else {
            req.cursor.clone()
        };
        let prefix = codec::edge_prefix_src(req.part_id, &vid, desc.vid_len)?;
        let (_, part_end) = codec::partition_range(req.part_id);
        let mut iter = part.engine().range(&scan_from, &part_end)?;

        let mut scanned_edges = 0usize;
        let mut cursor = Vec::new();
        let mut last_logical: Option<(EdgeType, EdgeRanking, VertexId)> = None;
        let mut visited = 0usize;
        loop {
            let Some((key, row)) = iter.next_pair()? else { break };
            if !key.starts_with(&prefix) {
                break;
            }
            visited += 1;
            if visited % self.config.scan_yield_every == 0 {
                tokio::task::yield_now().await;
            }

            let parsed = codec::parse_edge(&key, desc.vid_len)?;
            let logical = (parsed.edge_type, parsed.ranking, parsed.dst.clone());
            if last_logical.as_ref() != Some(&logical) {
                if scanned_edges >= self.config.delete_scan_cap {
                    cursor = key;
                    break;
                }
                scanned_edges += 1;
                last_logical = Some(logical);

                // The paired record lives on the other endpoint's
                // partition, with the type negated.
                pending.push(EdgeId {
                    src: parsed.dst.as_bytes().to_vec(),
                    edge_type: -parsed.edge_type,
                    ranking: parsed.ranking,
                    dst: padded.clone(),
                });

                if parsed.edge_type > 0 {
                    let schema = self
                        .meta
                        .schema(space_id, SchemaTarget::Edge(parsed.edge_type), None)?;
                    let old_vals =
                        self.row_values(space_id, SchemaTarget::Edge(parsed.edge_type), &row)?;
                    self.index_ops(
                        &mut ops,
                        part.engine(),
                        space_id,
                        req.part_id,
                        desc.vid_len,
                        parsed.edge_type,
                        true,
                        &schema,
                        IndexOwner::Edge {
                            src: &vid,
                            ranking: parsed.ranking,
                            dst: &parsed.dst,
                        },
                        Some(&old_vals),
                        None,
                    )?;
                }
            }
            ops.push(KvOp::remove(key));
        }
        drop(iter);

        // Tag rows go in the final round, so the vertex stays readable
        // while a capped delete is resumed.
        if cursor.is_empty() {
            let tag_prefix = codec::vertex_prefix_vid(req.part_id, &vid, desc.vid_len)?;
            let mut iter = part.engine().prefix(&tag_prefix)?;
            let mut seen_tags: Vec<TagId> = Vec::new();
            while let Some((key, row)) = iter.next_pair()? {
                let parsed = codec::parse_vertex(&key, desc.vid_len)?;
                if !seen_tags.contains(&parsed.tag) {
                    seen_tags.push(parsed.tag);
                    let schema = self
                        .meta
                        .schema(space_id, SchemaTarget::Tag(parsed.tag), None)?;
                    let old_vals = self.row_values(space_id, SchemaTarget::Tag(parsed.tag), &row)?;
                    self.index_ops(
                        &mut ops,
                        part.engine(),
                        space_id,
                        req.part_id,
                        desc.vid_len,
                        parsed.tag,
                        false,
                        &schema,
                        IndexOwner::Tag { vid: &vid },
                        Some(&old_vals),
                        None,
                    )?;
                    evict.push(evict_token(&padded, parsed.tag));
                }
                ops.push(KvOp::remove(key));
            }
        }

        let fingerprint = fingerprint_of("delete_vertex", space_id, req.part_id, req);
        part.append_plan(plan_with(ops, fingerprint, evict), self.config.mutation_timeout)
            .await?;
        Ok((cursor, pending))
    }

    pub async fn delete_edges(&self, req: DeleteEdgesRequest) -> ExecResponse {
        let mut failed = Vec::new();
        let total = req.parts.len();
        for (part_id, list) in &req.parts {
            let fingerprint = fingerprint_of("delete_edges", req.space_id, *part_id, list);
            if let Err(err) = self
                .delete_edges_part(req.space_id, *part_id, list, fingerprint)
                .await
            {
                failed.push(part_failure(*part_id, &err));
            }
        }
        ExecResponse {
            result: Some(ResponseCommon::of(total, failed)),
        }
    }

    async fn delete_edges_part(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        list: &EdgeIdList,
        fingerprint: u64,
    ) -> Result<()> {
        let desc = self.space_desc(space_id)?;
        let part = self.part(space_id, part_id)?;
        part.ensure_leader()?;
        if part.absorb_fingerprint(fingerprint) {
            return Ok(());
        }

        let mut ops = Vec::new();
        for id in &list.edges {
            let src = VertexId::new(id.src.clone());
            let dst = VertexId::new(id.dst.clone());
            let prefix = codec::edge_prefix_no_version(
                part_id,
                &src,
                desc.vid_len,
                id.edge_type,
                id.ranking,
                &dst,
            )?;

            let mut newest = None;
            let mut iter = part.engine().prefix(&prefix)?;
            while let Some((key, row)) = iter.next_pair()? {
                if newest.is_none() {
                    newest = Some(row);
                }
                ops.push(KvOp::remove(key));
            }

            if id.edge_type > 0 {
                if let Some(row) = newest {
                    let schema = self
                        .meta
                        .schema(space_id, SchemaTarget::Edge(id.edge_type), None)?;
                    let old_vals =
                        self.row_values(space_id, SchemaTarget::Edge(id.edge_type), &row)?;
                    self.index_ops(
                        &mut ops,
                        part.engine(),
                        space_id,
                        part_id,
                        desc.vid_len,
                        id.edge_type,
                        true,
                        &schema,
                        IndexOwner::Edge {
                            src: &src,
                            ranking: id.ranking,
                            dst: &dst,
                        },
                        Some(&old_vals),
                        None,
                    )?;
                }
            }
        }

        part.append_plan(plan_with(ops, fingerprint, Vec::new()), self.config.mutation_timeout)
            .await
            .map(|_| ())
    }

    // ---- Shared helpers ----

    /// Decode a stored row into named values: read under its writer
    /// schema, then materialize defaults of newer fields.
    pub(crate) fn row_values(
        &self,
        space_id: SpaceId,
        target: SchemaTarget,
        row: &[u8],
    ) -> Result<BTreeMap<String, Value>> {
        let ver = RowReader::peek_schema_ver(row)?;
        let writer_schema = self.meta.schema(space_id, target, Some(ver))?;
        let newest = self.meta.schema(space_id, target, None)?;

        let reader = RowReader::new(&writer_schema, row)?;
        let mut values = BTreeMap::new();
        for (index, field) in writer_schema.fields.iter().enumerate() {
            values.insert(field.name.clone(), reader.get(index)?);
        }
        for field in &newest.fields {
            values.entry(field.name.clone()).or_insert_with(|| {
                field.default.clone().unwrap_or(Value::Null)
            });
        }
        Ok(values)
    }

    /// Emit the index deletions and insertions implied by replacing
    /// `old` with `new` (either side absent for pure insert / delete).
    #[allow(clippy::too_many_arguments)]
    fn index_ops(
        &self,
        ops: &mut Vec<KvOp>,
        engine: &Arc<dyn KvEngine>,
        space_id: SpaceId,
        part_id: PartitionId,
        vid_len: usize,
        schema_id: i32,
        is_edge: bool,
        newest: &Schema,
        owner: IndexOwner<'_>,
        old: Option<&BTreeMap<String, Value>>,
        new: Option<&BTreeMap<String, Value>>,
    ) -> Result<()> {
        for index in self.meta.indexes_of(space_id, schema_id, is_edge) {
            let collect = |vals: &BTreeMap<String, Value>| -> Vec<Value> {
                index
                    .fields
                    .iter()
                    .map(|field| vals.get(field).cloned().unwrap_or(Value::Null))
                    .collect()
            };
            let old_seg = old
                .map(|vals| codec::index::encode_values(&index, newest, &collect(vals)))
                .transpose()?;
            let new_seg = new
                .map(|vals| codec::index::encode_values(&index, newest, &collect(vals)))
                .transpose()?;
            if old_seg == new_seg {
                continue; // Indexed columns unchanged.
            }

            if let Some(segment) = &old_seg {
                ops.push(KvOp::remove(owner.index_key(
                    part_id,
                    index.index_id,
                    segment,
                    vid_len,
                )?));
            }
            if let Some(segment) = &new_seg {
                let key = owner.index_key(part_id, index.index_id, segment, vid_len)?;
                if index.unique {
                    // At most one data record per encoded value.
                    let mut prefix = codec::index::index_prefix(part_id, index.index_id);
                    prefix.extend_from_slice(segment);
                    let mut iter = engine.prefix(&prefix)?;
                    while let Some((existing, _)) = iter.next_pair()? {
                        if existing != key {
                            return Err(Error::IndexConflict(index.index_id));
                        }
                    }
                }
                ops.push(KvOp::put(key, Vec::new()));
            }
        }
        Ok(())
    }
}

pub(crate) enum IndexOwner<'a> {
    Tag {
        vid: &'a VertexId,
    },
    Edge {
        src: &'a VertexId,
        ranking: EdgeRanking,
        dst: &'a VertexId,
    },
}

impl IndexOwner<'_> {
    fn index_key(
        &self,
        part_id: PartitionId,
        index_id: models::IndexId,
        segment: &[u8],
        vid_len: usize,
    ) -> Result<Vec<u8>> {
        Ok(match self {
            IndexOwner::Tag { vid } => {
                codec::index::tag_index_key(part_id, index_id, segment, vid, vid_len)?
            }
            IndexOwner::Edge { src, ranking, dst } => codec::index::edge_index_key(
                part_id, index_id, segment, src, *ranking, dst, vid_len,
            )?,
        })
    }
}

/// Newest version of a (vertex, tag) row, raw. TTL is a read-path
/// concern; index maintenance needs the row even when expired.
pub(crate) fn current_tag_row(
    engine: &Arc<dyn KvEngine>,
    part_id: PartitionId,
    vid: &VertexId,
    vid_len: usize,
    tag: TagId,
) -> Result<Option<Vec<u8>>> {
    let prefix = codec::vertex_prefix_tag(part_id, vid, vid_len, tag)?;
    let mut iter = engine.prefix(&prefix)?;
    Ok(iter.next_pair()?.map(|(_, row)| row))
}

/// Newest version of one logical edge record, raw.
pub(crate) fn current_edge_row(
    engine: &Arc<dyn KvEngine>,
    part_id: PartitionId,
    src: &VertexId,
    vid_len: usize,
    edge_type: EdgeType,
    ranking: EdgeRanking,
    dst: &VertexId,
) -> Result<Option<Vec<u8>>> {
    let prefix = codec::edge_prefix_no_version(part_id, src, vid_len, edge_type, ranking, dst)?;
    let mut iter = engine.prefix(&prefix)?;
    Ok(iter.next_pair()?.map(|(_, row)| row))
}

fn build_row(schema: &Schema, names: &[String], values: &[WireValue], now: i64) -> Result<Vec<u8>> {
    if names.len() != values.len() {
        return Err(Error::IllFormed("prop names and values differ in length".to_string()));
    }
    let mut writer = RowWriter::new(schema);
    for (name, value) in names.iter().zip(values.iter()) {
        let value = value_from_wire(value)
            .map_err(|err| Error::IllFormed(err.to_string()))?;
        writer.set(name, value)?;
    }
    writer.set_write_ts(now);
    Ok(writer.finish()?)
}

fn wire_value(value: Option<&WireValue>) -> Result<Value> {
    match value {
        None => Ok(Value::Null),
        Some(value) => value_from_wire(value).map_err(|err| Error::IllFormed(err.to_string())),
    }
}

fn dataset_of(schema: &Schema, values: Option<&BTreeMap<String, Value>>) -> DataSet {
    let column_names: Vec<String> = schema.fields.iter().map(|f| f.name.clone()).collect();
    let rows = match values {
        None => Vec::new(),
        Some(values) => vec![Row {
            values: column_names
                .iter()
                .map(|name| {
                    proto_storage::value_to_wire(values.get(name).unwrap_or(&Value::Null))
                })
                .collect(),
        }],
    };
    DataSet { column_names, rows }
}

pub(crate) fn part_failure(part_id: PartitionId, err: &Error) -> PartitionResult {
    if !matches!(err.code(), ErrorCode::LeaderChanged) {
        tracing::debug!(part = part_id, %err, "partition sub-request failed");
    }
    PartitionResult {
        code: err.code() as i32,
        part_id,
        leader: err.leader_hint().as_ref().map(Into::into),
    }
}

/// Fingerprint of a sub-request, for the at-most-once window.
fn fingerprint_of(
    kind: &str,
    space_id: SpaceId,
    part_id: PartitionId,
    body: &impl prost::Message,
) -> u64 {
    use std::hash::Hasher;
    let mut hasher = fxhash::FxHasher64::default();
    hasher.write(kind.as_bytes());
    hasher.write_i32(space_id);
    hasher.write_i32(part_id);
    hasher.write(&body.encode_to_vec());
    hasher.finish()
}
