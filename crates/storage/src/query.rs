//! The read pipeline: vertex point reads, bounded neighbor scans with
//! top-K, secondary-index lookups with pushed-down hints and a residual
//! filter, and the deduplicated destination fan-out. Strong reads are
//! served by a leaseholding leader; stale reads may be served by any
//! replica when the host allows them.

use super::mutate::{current_edge_row, current_tag_row};
use super::part::Part;
use super::pools::Priority;
use super::store::GraphStore;
use super::topk::TopK;
use super::{Error, Result};
use catalog::SchemaTarget;
use codec::RowReader;
use models::{PartitionId, SpaceId, Value, VertexId};
use proto_storage::storage::*;
use proto_storage::{value_to_wire, ResponseCommon};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

impl GraphStore {
    fn ensure_readable(&self, part: &Arc<Part>) -> Result<()> {
        if self.config.allow_stale_reads {
            return Ok(());
        }
        part.ensure_lease()
    }

    /// TTL check against the row's declared schema.
    fn row_live(&self, space_id: SpaceId, target: SchemaTarget, row: &[u8], now: i64) -> bool {
        let Ok(ver) = RowReader::peek_schema_ver(row) else {
            return false;
        };
        let Ok(schema) = self.meta.schema(space_id, target, Some(ver)) else {
            return false;
        };
        match RowReader::new(&schema, row) {
            Ok(reader) => !reader.expired(now),
            Err(_) => false,
        }
    }

    pub async fn get_vertex_props(&self, req: GetVertexPropsRequest) -> GetPropsResponse {
        let _permit = self.read_pools.admit(Priority::from_wire(req.priority)).await;
        let mut failed = Vec::new();
        let total = req.parts.len();
        let mut data = DataSet {
            column_names: Vec::new(),
            rows: Vec::new(),
        };
        let filter = match parse_filter(&req.filter) {
            Ok(filter) => filter,
            Err(err) => return props_failure(&req.parts, &err),
        };

        for (part_id, vids) in &req.parts {
            match self
                .get_vertex_props_part(req.space_id, *part_id, vids, req.tag_id, &req.props, &filter)
                .await
            {
                Ok(rows) => merge_rows(&mut data, rows),
                Err(err) => failed.push(super::mutate::part_failure(*part_id, &err)),
            }
        }
        GetPropsResponse {
            result: Some(ResponseCommon::of(total, failed)),
            data: Some(data),
        }
    }

    async fn get_vertex_props_part(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        vids: &VidList,
        tag_id: i32,
        props: &[String],
        filter: &Option<expr::Expr>,
    ) -> Result<DataSet> {
        let desc = self.space_desc(space_id)?;
        let part = self.part(space_id, part_id)?;
        self.ensure_readable(&part)?;
        let now = (self.wall_clock)();

        let mut out = DataSet {
            column_names: Vec::new(),
            rows: Vec::new(),
        };

        for raw_vid in &vids.vids {
            let vid = VertexId::new(raw_vid.clone());
            let targets: Vec<(i32, Vec<u8>)> = if tag_id != 0 {
                // Point lookup of one tag, through the leader cache.
                let padded = vid.padded(desc.vid_len)?;
                let cached = part
                    .vertex_cache()
                    .filter(|_| !self.config.allow_stale_reads)
                    .and_then(|cache| cache.get(&padded, tag_id));
                let row = match cached {
                    Some(row) => Some(row),
                    None => {
                        let row =
                            current_tag_row(part.engine(), part_id, &vid, desc.vid_len, tag_id)?;
                        if let (Some(row), Some(cache)) = (&row, part.vertex_cache()) {
                            if !self.config.allow_stale_reads {
                                cache.put(&padded, tag_id, row.clone());
                            }
                        }
                        row
                    }
                };
                row.map(|row| (tag_id, row)).into_iter().collect()
            } else {
                // Every tag of the vertex: first (newest) version each.
                let prefix = codec::vertex_prefix_vid(part_id, &vid, desc.vid_len)?;
                let mut iter = part.engine().prefix(&prefix)?;
                let mut rows = Vec::new();
                let mut last_tag = None;
                let mut visited = 0usize;
                while let Some((key, row)) = iter.next_pair()? {
                    visited += 1;
                    if visited % self.config.scan_yield_every == 0 {
                        tokio::task::yield_now().await;
                    }
                    let parsed = codec::parse_vertex(&key, desc.vid_len)?;
                    if last_tag == Some(parsed.tag) {
                        continue; // Stale version.
                    }
                    last_tag = Some(parsed.tag);
                    rows.push((parsed.tag, row));
                }
                rows
            };

            for (tag, row) in targets {
                if !self.row_live(space_id, SchemaTarget::Tag(tag), &row, now) {
                    continue;
                }
                let values = self.row_values(space_id, SchemaTarget::Tag(tag), &row)?;
                if let Some(filter) = filter {
                    if !expr::matches(filter, &values)? {
                        continue;
                    }
                }

                let schema = self.meta.schema(space_id, SchemaTarget::Tag(tag), None)?;
                let columns: Vec<String> = if props.is_empty() {
                    schema.fields.iter().map(|f| f.name.clone()).collect()
                } else {
                    props.to_vec()
                };
                if out.column_names.is_empty() {
                    out.column_names = ["_vid".to_string(), "_tag".to_string()]
                        .into_iter()
                        .chain(columns.iter().cloned())
                        .collect();
                }
                let mut row_values = vec![
                    value_to_wire(&Value::Str(String::from_utf8_lossy(raw_vid).into_owned())),
                    value_to_wire(&Value::Int(tag as i64)),
                ];
                for column in &columns {
                    row_values
                        .push(value_to_wire(values.get(column).unwrap_or(&Value::Null)));
                }
                out.rows.push(Row { values: row_values });
            }
        }
        Ok(out)
    }

    pub async fn get_edge_props(&self, req: GetEdgePropsRequest) -> GetPropsResponse {
        let _permit = self.read_pools.admit(Priority::from_wire(req.priority)).await;
        let mut failed = Vec::new();
        let total = req.parts.len();
        let mut data = DataSet {
            column_names: Vec::new(),
            rows: Vec::new(),
        };
        let filter = match parse_filter(&req.filter) {
            Ok(filter) => filter,
            Err(err) => {
                return GetPropsResponse {
                    result: Some(ResponseCommon::of(
                        req.parts.len(),
                        req.parts
                            .keys()
                            .map(|part| super::mutate::part_failure(*part, &err))
                            .collect(),
                    )),
                    data: None,
                }
            }
        };

        for (part_id, edges) in &req.parts {
            match self
                .get_edge_props_part(req.space_id, *part_id, edges, &req.props, &filter)
                .await
            {
                Ok(rows) => merge_rows(&mut data, rows),
                Err(err) => failed.push(super::mutate::part_failure(*part_id, &err)),
            }
        }
        GetPropsResponse {
            result: Some(ResponseCommon::of(total, failed)),
            data: Some(data),
        }
    }

    async fn get_edge_props_part(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        edges: &EdgeIdList,
        props: &[String],
        filter: &Option<expr::Expr>,
    ) -> Result<DataSet> {
        let desc = self.space_desc(space_id)?;
        let part = self.part(space_id, part_id)?;
        self.ensure_readable(&part)?;
        let now = (self.wall_clock)();

        let mut out = DataSet {
            column_names: Vec::new(),
            rows: Vec::new(),
        };
        for id in &edges.edges {
            let src = VertexId::new(id.src.clone());
            let dst = VertexId::new(id.dst.clone());
            let Some(row) = current_edge_row(
                part.engine(),
                part_id,
                &src,
                desc.vid_len,
                id.edge_type,
                id.ranking,
                &dst,
            )?
            else {
                continue;
            };
            if !self.row_live(space_id, SchemaTarget::Edge(id.edge_type), &row, now) {
                continue;
            }
            let values = self.row_values(space_id, SchemaTarget::Edge(id.edge_type), &row)?;
            if let Some(filter) = filter {
                if !expr::matches(filter, &values)? {
                    continue;
                }
            }

            let schema = self
                .meta
                .schema(space_id, SchemaTarget::Edge(id.edge_type), None)?;
            let columns: Vec<String> = if props.is_empty() {
                schema.fields.iter().map(|f| f.name.clone()).collect()
            } else {
                props.to_vec()
            };
            if out.column_names.is_empty() {
                out.column_names = edge_id_columns()
                    .into_iter()
                    .chain(columns.iter().cloned())
                    .collect();
            }
            let mut row_values = edge_id_values(&id.src, id.edge_type, id.ranking, &id.dst);
            for column in &columns {
                row_values.push(value_to_wire(values.get(column).unwrap_or(&Value::Null)));
            }
            out.rows.push(Row { values: row_values });
        }
        Ok(out)
    }

    pub async fn get_neighbors(&self, req: GetNeighborsRequest) -> GetNeighborsResponse {
        let _permit = self.read_pools.admit(Priority::from_wire(req.priority)).await;
        let mut failed = Vec::new();
        let total = req.parts.len();
        let mut data = DataSet {
            column_names: Vec::new(),
            rows: Vec::new(),
        };

        for (part_id, vids) in &req.parts {
            match self.get_neighbors_part(&req, *part_id, vids).await {
                Ok(rows) => merge_rows(&mut data, rows),
                Err(err) => failed.push(super::mutate::part_failure(*part_id, &err)),
            }
        }
        GetNeighborsResponse {
            result: Some(ResponseCommon::of(total, failed)),
            data: Some(data),
        }
    }

    async fn get_neighbors_part(
        &self,
        req: &GetNeighborsRequest,
        part_id: PartitionId,
        vids: &VidList,
    ) -> Result<DataSet> {
        let space_id = req.space_id;
        let desc = self.space_desc(space_id)?;
        let part = self.part(space_id, part_id)?;
        self.ensure_readable(&part)?;
        let now = (self.wall_clock)();

        let filter = parse_filter(&req.filter)?;
        let exprs: Vec<expr::Expr> = req
            .exprs
            .iter()
            .map(|bytes| expr::Expr::from_bytes(bytes))
            .collect::<std::result::Result<_, _>>()?;

        // Stored orientations to scan, by requested direction.
        let direction = EdgeDirection::try_from(req.direction).unwrap_or(EdgeDirection::Out);
        let mut stored_types = Vec::new();
        for edge_type in &req.edge_types {
            let positive = edge_type.abs();
            if matches!(direction, EdgeDirection::Out | EdgeDirection::Both) {
                stored_types.push(positive);
            }
            if matches!(direction, EdgeDirection::In | EdgeDirection::Both) {
                stored_types.push(-positive);
            }
        }

        // Resolve edge prop columns against the shared (absolute) schema
        // of the first requested type; all types share the columns the
        // request names.
        let mut columns: Vec<String> = edge_id_columns();
        let vertex_prop_columns: Vec<String> = req
            .vertex_props
            .iter()
            .map(|tp| format!("{}.{}", tp.tag_id, tp.prop))
            .collect();
        columns.extend(vertex_prop_columns.iter().cloned());
        columns.extend(req.edge_props.iter().cloned());
        for index in 0..exprs.len() {
            columns.push(format!("_expr{index}"));
        }
        let stat_at = columns.len();
        for stat in &req.stat_props {
            let kind = StatKind::try_from(stat.kind).unwrap_or(StatKind::Count);
            columns.push(format!("_{}({})", stat_label(kind), stat.prop));
        }

        let order: Vec<(usize, bool)> = req
            .order_by
            .iter()
            .filter_map(|ob| {
                columns
                    .iter()
                    .position(|c| *c == ob.prop)
                    .map(|at| (at, ob.desc))
            })
            .collect();

        let mut out = DataSet {
            column_names: columns.clone(),
            rows: Vec::new(),
        };

        for raw_vid in &vids.vids {
            let vid = VertexId::new(raw_vid.clone());

            // Source-vertex properties, shared by every emitted row.
            let mut vertex_values = Vec::new();
            for tag_prop in &req.vertex_props {
                let row =
                    current_tag_row(part.engine(), part_id, &vid, desc.vid_len, tag_prop.tag_id)?;
                let value = match row {
                    Some(row)
                        if self.row_live(space_id, SchemaTarget::Tag(tag_prop.tag_id), &row, now) =>
                    {
                        self.row_values(space_id, SchemaTarget::Tag(tag_prop.tag_id), &row)?
                            .get(&tag_prop.prop)
                            .cloned()
                            .unwrap_or(Value::Null)
                    }
                    _ => Value::Null,
                };
                vertex_values.push(value);
            }

            let mut heap: Option<TopK<NeighborRow>> = if req.limit > 0 {
                let order = order.clone();
                Some(TopK::new(req.limit as usize, move |a, b| {
                    better_row(a, b, &order)
                }))
            } else {
                None
            };
            let mut flat: Vec<NeighborRow> = Vec::new();
            let mut seen_dsts: BTreeSet<Vec<u8>> = BTreeSet::new();
            let mut matched_edges = 0i64;
            let mut stats: Vec<StatAcc> = req.stat_props.iter().map(|_| StatAcc::default()).collect();

            for stored_type in &stored_types {
                let prefix =
                    codec::edge_prefix_src_type(part_id, &vid, desc.vid_len, *stored_type)?;
                let mut iter = part.engine().prefix(&prefix)?;
                let mut last_logical = None;
                let mut visited = 0usize;

                while let Some((key, row)) = iter.next_pair()? {
                    visited += 1;
                    if visited % self.config.scan_yield_every == 0 {
                        tokio::task::yield_now().await;
                    }
                    let parsed = codec::parse_edge(&key, desc.vid_len)?;
                    let logical = (parsed.ranking, parsed.dst.clone());
                    if last_logical.as_ref() == Some(&logical) {
                        continue; // Older version of the same edge.
                    }
                    last_logical = Some(logical);

                    if !self.row_live(space_id, SchemaTarget::Edge(*stored_type), &row, now) {
                        continue;
                    }
                    if req.dedup && !seen_dsts.insert(parsed.dst.as_bytes().to_vec()) {
                        continue;
                    }

                    let edge_values =
                        self.row_values(space_id, SchemaTarget::Edge(*stored_type), &row)?;
                    if let Some(filter) = &filter {
                        if !expr::matches(filter, &edge_values)? {
                            continue;
                        }
                    }

                    matched_edges += 1;
                    for (stat, acc) in req.stat_props.iter().zip(stats.iter_mut()) {
                        acc.fold(edge_values.get(&stat.prop));
                    }

                    let mut values: Vec<Value> = vec![
                        Value::Str(String::from_utf8_lossy(raw_vid).into_owned()),
                        Value::Int(*stored_type as i64),
                        Value::Int(parsed.ranking),
                        Value::Str(String::from_utf8_lossy(parsed.dst.as_bytes()).into_owned()),
                    ];
                    values.extend(vertex_values.iter().cloned());
                    for prop in &req.edge_props {
                        values.push(edge_values.get(prop).cloned().unwrap_or(Value::Null));
                    }
                    for computed in &exprs {
                        values.push(expr::evaluate(computed, &edge_values)?);
                    }
                    // Per-source aggregates are filled in after the scan.
                    values.extend(req.stat_props.iter().map(|_| Value::Null));

                    let row = NeighborRow {
                        tie: (
                            raw_vid.clone(),
                            stored_type.signum(),
                            stored_type.abs(),
                            parsed.ranking,
                            parsed.dst.as_bytes().to_vec(),
                        ),
                        values,
                    };
                    match &mut heap {
                        Some(heap) => heap.push(row),
                        None => flat.push(row),
                    }
                }
            }

            let mut rows = match heap {
                Some(heap) => heap.into_sorted(),
                None => flat,
            };
            let stat_values: Vec<Value> = req
                .stat_props
                .iter()
                .zip(stats.iter())
                .map(|(stat, acc)| {
                    acc.finish(
                        StatKind::try_from(stat.kind).unwrap_or(StatKind::Count),
                        matched_edges,
                    )
                })
                .collect();
            for row in &mut rows {
                for (offset, value) in stat_values.iter().enumerate() {
                    row.values[stat_at + offset] = value.clone();
                }
            }
            for row in rows {
                out.rows.push(Row {
                    values: row.values.iter().map(value_to_wire).collect(),
                });
            }
        }
        Ok(out)
    }

    pub async fn get_dst_by_src(&self, req: GetDstBySrcRequest) -> GetDstBySrcResponse {
        let _permit = self.read_pools.admit(Priority::from_wire(req.priority)).await;
        let mut failed = Vec::new();
        let total = req.parts.len();
        let mut dsts = Vec::new();

        for (part_id, vids) in &req.parts {
            match self
                .get_dst_by_src_part(req.space_id, *part_id, vids, &req.edge_types)
                .await
            {
                Ok(part_dsts) => dsts.extend(part_dsts),
                Err(err) => failed.push(super::mutate::part_failure(*part_id, &err)),
            }
        }
        GetDstBySrcResponse {
            result: Some(ResponseCommon::of(total, failed)),
            dsts,
        }
    }

    async fn get_dst_by_src_part(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        vids: &VidList,
        edge_types: &[i32],
    ) -> Result<Vec<Vec<u8>>> {
        let desc = self.space_desc(space_id)?;
        let part = self.part(space_id, part_id)?;
        self.ensure_readable(&part)?;
        let now = (self.wall_clock)();

        // Partition-local dedup; global dedup belongs to the caller.
        let mut dsts = BTreeSet::new();
        for raw_vid in &vids.vids {
            let vid = VertexId::new(raw_vid.clone());
            for edge_type in edge_types {
                let stored = edge_type.abs();
                let prefix = codec::edge_prefix_src_type(part_id, &vid, desc.vid_len, stored)?;
                let mut iter = part.engine().prefix(&prefix)?;
                let mut visited = 0usize;
                while let Some((key, row)) = iter.next_pair()? {
                    visited += 1;
                    if visited % self.config.scan_yield_every == 0 {
                        tokio::task::yield_now().await;
                    }
                    let parsed = codec::parse_edge(&key, desc.vid_len)?;
                    if !self.row_live(space_id, SchemaTarget::Edge(stored), &row, now) {
                        continue;
                    }
                    dsts.insert(parsed.dst.as_bytes().to_vec());
                }
            }
        }
        Ok(dsts.into_iter().collect())
    }

    pub async fn lookup_index(&self, req: LookupIndexRequest) -> LookupIndexResponse {
        let _permit = self.read_pools.admit(Priority::from_wire(req.priority)).await;
        let mut failed = Vec::new();
        let total = req.part_ids.len();
        let mut data = DataSet {
            column_names: Vec::new(),
            rows: Vec::new(),
        };

        for part_id in &req.part_ids {
            match self.lookup_index_part(&req, *part_id).await {
                Ok(rows) => merge_rows(&mut data, rows),
                Err(err) => failed.push(super::mutate::part_failure(*part_id, &err)),
            }
        }
        LookupIndexResponse {
            result: Some(ResponseCommon::of(total, failed)),
            data: Some(data),
        }
    }

    async fn lookup_index_part(
        &self,
        req: &LookupIndexRequest,
        part_id: PartitionId,
    ) -> Result<DataSet> {
        let space_id = req.space_id;
        let desc = self.space_desc(space_id)?;
        let part = self.part(space_id, part_id)?;
        self.ensure_readable(&part)?;
        let now = (self.wall_clock)();

        let index = self.meta.index(space_id, req.index_id)?;
        let target = if index.is_edge {
            SchemaTarget::Edge(index.schema_id)
        } else {
            SchemaTarget::Tag(index.schema_id)
        };
        let schema = self.meta.schema(space_id, target, None)?;
        let filter = parse_filter(&req.filter)?;

        // Build the scan interval from the planner's column hints:
        // equality prefixes, then an optional half-open range on the
        // last hinted column.
        let prefix = codec::index::index_prefix(part_id, req.index_id);
        let mut begin = prefix.clone();
        let mut end_prefix = prefix;
        let mut bounded_end = false;

        for hint in &req.column_hints {
            let (_, field) = schema
                .field(&hint.column)
                .ok_or_else(|| Error::SchemaMismatch(format!("no column {:?}", hint.column)))?;
            let string_len = index.string_lens.get(&hint.column).copied().unwrap_or(0);

            match ColumnHintKind::try_from(hint.kind).unwrap_or(ColumnHintKind::Prefix) {
                ColumnHintKind::Prefix => {
                    let value = hint_value(hint.begin.as_ref())?;
                    codec::index::encode_single(&mut begin, &value, &field.field_type, string_len)?;
                    codec::index::encode_single(
                        &mut end_prefix,
                        &value,
                        &field.field_type,
                        string_len,
                    )?;
                }
                ColumnHintKind::Range => {
                    if let Some(low) = &hint.begin {
                        let value = proto_storage::value_from_wire(low)
                            .map_err(|err| Error::IllFormed(err.to_string()))?;
                        codec::index::encode_single(
                            &mut begin,
                            &value,
                            &field.field_type,
                            string_len,
                        )?;
                    }
                    if let Some(high) = &hint.end {
                        let value = proto_storage::value_from_wire(high)
                            .map_err(|err| Error::IllFormed(err.to_string()))?;
                        codec::index::encode_single(
                            &mut end_prefix,
                            &value,
                            &field.field_type,
                            string_len,
                        )?;
                        bounded_end = true;
                    }
                }
            }
        }
        let end = if bounded_end {
            end_prefix
        } else {
            match upper_bound(&end_prefix) {
                Some(end) => end,
                None => codec::partition_range(part_id).1,
            }
        };

        let covering = req.return_columns.is_empty() && filter.is_none();
        let mut columns = if index.is_edge {
            edge_id_columns()
        } else {
            vec!["_vid".to_string()]
        };
        columns.extend(req.return_columns.iter().cloned());

        let order: Vec<(usize, bool)> = req
            .order_by
            .iter()
            .filter_map(|ob| {
                columns
                    .iter()
                    .position(|c| *c == ob.prop)
                    .map(|at| (at, ob.desc))
            })
            .collect();
        let mut heap: Option<TopK<Vec<Value>>> = if req.limit > 0 {
            let order = order.clone();
            Some(TopK::new(req.limit as usize, move |a, b| {
                better_values(a, b, &order)
            }))
        } else {
            None
        };
        let mut flat = Vec::new();

        let mut iter = part.engine().range(&begin, &end)?;
        let mut visited = 0usize;
        while let Some((key, _)) = iter.next_pair()? {
            visited += 1;
            if visited % self.config.scan_yield_every == 0 {
                tokio::task::yield_now().await;
            }

            // The index never learns about TTL expiry, so the data row is
            // the authority on liveness even when the response itself is
            // covering: confirm it exists and is not expired before
            // accepting the entry.
            let mut values: Vec<Value>;
            let row;
            if index.is_edge {
                let (src, ranking, dst) = codec::index::edge_index_tail(&key, desc.vid_len)?;
                values = vec![
                    Value::Str(String::from_utf8_lossy(src.as_bytes()).into_owned()),
                    Value::Int(index.schema_id as i64),
                    Value::Int(ranking),
                    Value::Str(String::from_utf8_lossy(dst.as_bytes()).into_owned()),
                ];
                row = current_edge_row(
                    part.engine(),
                    part_id,
                    &src,
                    desc.vid_len,
                    index.schema_id,
                    ranking,
                    &dst,
                )?;
            } else {
                let vid = codec::index::tag_index_vid(&key, desc.vid_len)?;
                values = vec![Value::Str(
                    String::from_utf8_lossy(vid.as_bytes()).into_owned(),
                )];
                row = current_tag_row(part.engine(), part_id, &vid, desc.vid_len, index.schema_id)?;
            }
            let Some(row) = row else {
                continue; // Dangling entry pending repair.
            };
            if !self.row_live(space_id, target, &row, now) {
                continue;
            }

            if !covering {
                let row_values = self.row_values(space_id, target, &row)?;
                if let Some(filter) = &filter {
                    if !expr::matches(filter, &row_values)? {
                        continue;
                    }
                }
                for column in &req.return_columns {
                    values.push(row_values.get(column).cloned().unwrap_or(Value::Null));
                }
            }

            match &mut heap {
                Some(heap) => heap.push(values),
                None => flat.push(values),
            }
        }

        let rows = match heap {
            Some(heap) => heap.into_sorted(),
            None => flat,
        };
        Ok(DataSet {
            column_names: columns,
            rows: rows
                .into_iter()
                .map(|values| Row {
                    values: values.iter().map(value_to_wire).collect(),
                })
                .collect(),
        })
    }
}

/// One per-source aggregate over an edge property.
#[derive(Default)]
struct StatAcc {
    sum: f64,
    non_null: i64,
    min: Option<Value>,
    max: Option<Value>,
}

impl StatAcc {
    fn fold(&mut self, value: Option<&Value>) {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            return;
        };
        if let Some(number) = value.as_float() {
            self.sum += number;
            self.non_null += 1;
        }
        let better_min = self
            .min
            .as_ref()
            .map_or(true, |min| value.cmp_total(min).is_lt());
        if better_min {
            self.min = Some(value.clone());
        }
        let better_max = self
            .max
            .as_ref()
            .map_or(true, |max| value.cmp_total(max).is_gt());
        if better_max {
            self.max = Some(value.clone());
        }
    }

    fn finish(&self, kind: StatKind, matched_edges: i64) -> Value {
        match kind {
            StatKind::Count => Value::Int(matched_edges),
            StatKind::Sum => Value::Float(self.sum),
            StatKind::Avg if self.non_null > 0 => {
                Value::Float(self.sum / self.non_null as f64)
            }
            StatKind::Avg => Value::Null,
            StatKind::Min => self.min.clone().unwrap_or(Value::Null),
            StatKind::Max => self.max.clone().unwrap_or(Value::Null),
        }
    }
}

fn stat_label(kind: StatKind) -> &'static str {
    match kind {
        StatKind::Count => "count",
        StatKind::Sum => "sum",
        StatKind::Avg => "avg",
        StatKind::Min => "min",
        StatKind::Max => "max",
    }
}

struct NeighborRow {
    /// (src, type sign, |type|, ranking, dst): the deterministic
    /// tie-break under equal order-by keys.
    tie: (Vec<u8>, i32, i32, i64, Vec<u8>),
    values: Vec<Value>,
}

fn better_row(a: &NeighborRow, b: &NeighborRow, order: &[(usize, bool)]) -> bool {
    for (at, desc) in order {
        let ord = a.values[*at].cmp_total(&b.values[*at]);
        let ord = if *desc { ord.reverse() } else { ord };
        match ord {
            std::cmp::Ordering::Less => return true,
            std::cmp::Ordering::Greater => return false,
            std::cmp::Ordering::Equal => continue,
        }
    }
    a.tie < b.tie
}

fn better_values(a: &[Value], b: &[Value], order: &[(usize, bool)]) -> bool {
    for (at, desc) in order {
        let ord = a[*at].cmp_total(&b[*at]);
        let ord = if *desc { ord.reverse() } else { ord };
        match ord {
            std::cmp::Ordering::Less => return true,
            std::cmp::Ordering::Greater => return false,
            std::cmp::Ordering::Equal => continue,
        }
    }
    false
}

fn parse_filter(bytes: &[u8]) -> Result<Option<expr::Expr>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(expr::Expr::from_bytes(bytes)?))
}

fn hint_value(value: Option<&proto_storage::WireValue>) -> Result<Value> {
    let value = value.ok_or_else(|| Error::IllFormed("prefix hint without a value".to_string()))?;
    proto_storage::value_from_wire(value).map_err(|err| Error::IllFormed(err.to_string()))
}

fn merge_rows(into: &mut DataSet, from: DataSet) {
    if into.column_names.is_empty() {
        into.column_names = from.column_names;
    }
    into.rows.extend(from.rows);
}

fn edge_id_columns() -> Vec<String> {
    vec![
        "_src".to_string(),
        "_type".to_string(),
        "_rank".to_string(),
        "_dst".to_string(),
    ]
}

fn edge_id_values(src: &[u8], edge_type: i32, ranking: i64, dst: &[u8]) -> Vec<proto_storage::WireValue> {
    vec![
        value_to_wire(&Value::Str(String::from_utf8_lossy(src).into_owned())),
        value_to_wire(&Value::Int(edge_type as i64)),
        value_to_wire(&Value::Int(ranking)),
        value_to_wire(&Value::Str(String::from_utf8_lossy(dst).into_owned())),
    ]
}

/// Smallest key strictly greater than every key with this prefix.
fn upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

fn props_failure(
    parts: &BTreeMap<i32, VidList>,
    err: &Error,
) -> GetPropsResponse {
    GetPropsResponse {
        result: Some(ResponseCommon::of(
            parts.len(),
            parts
                .keys()
                .map(|part| super::mutate::part_failure(*part, err))
                .collect(),
        )),
        data: None,
    }
}
