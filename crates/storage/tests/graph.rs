//! End-to-end behavior of the storage pipelines through the
//! partition-aware client: vertex and edge round-trips, paired edge
//! records, index lookups and maintenance, TTL, neighbor top-K, vid
//! padding, capped vertex deletion, and leader-hint refresh.

use catalog::{MemMetaService, MetaCache, MetaService};
use models::{
    partition_of, FieldDef, FieldType, HostAddr, IndexDef, PartitionId, Schema, SpaceDesc, Value,
    VertexId,
};
use proto_storage::storage::*;
use proto_storage::{value_from_wire, value_to_wire};
use raft::{GroupConfig, LocalNetwork};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::{
    ClientConfig, EngineType, GraphStore, LocalTransport, PartType, StorageClient, StoreConfig,
};

const SPACE: i32 = 1;
const PERSON: i32 = 10;
const SESSION: i32 = 11;
const KNOWS: i32 = 20;
const IDX_AGE: i32 = 100;
const IDX_NAME_UNIQUE: i32 = 101;
const IDX_SEEN: i32 = 102;
const PARTS: i32 = 3;
const VID_LEN: usize = 8;

struct TestCluster {
    meta: Arc<MetaCache>,
    stores: Vec<(HostAddr, Arc<GraphStore>)>,
    client: Arc<StorageClient>,
    wall: Arc<AtomicI64>,
}

fn fast_raft() -> GroupConfig {
    GroupConfig {
        election_timeout: Duration::from_millis(150),
        heartbeat_interval: Duration::from_millis(40),
        rpc_timeout: Duration::from_millis(100),
        ..GroupConfig::default()
    }
}

fn person_schema() -> Schema {
    Schema::new(
        0,
        vec![
            FieldDef::new("name", FieldType::String),
            FieldDef::new("age", FieldType::Int64),
        ],
    )
}

fn knows_schema() -> Schema {
    Schema::new(
        0,
        vec![
            FieldDef::new("since", FieldType::Int64).nullable(),
            FieldDef::new("weight", FieldType::Int64).nullable(),
        ],
    )
}

fn session_schema() -> Schema {
    Schema::new(
        0,
        vec![
            FieldDef::new("token", FieldType::String).nullable(),
            FieldDef::new("seen", FieldType::Timestamp)
                .nullable()
                .with_ttl(100),
        ],
    )
}

async fn cluster(hosts: usize, part_type: PartType, delete_scan_cap: usize) -> TestCluster {
    let meta_svc = Arc::new(MemMetaService::new());
    let all_hosts: Vec<HostAddr> = (1..=hosts)
        .map(|i| HostAddr::new(&format!("s{i}"), 9779))
        .collect();

    let peers: BTreeMap<PartitionId, Vec<HostAddr>> =
        (1..=PARTS).map(|p| (p, all_hosts.clone())).collect();
    meta_svc
        .create_space(SpaceDesc::new(SPACE, "test", PARTS, hosts as i32, VID_LEN), peers)
        .unwrap();
    meta_svc
        .create_tag(SPACE, PERSON, "person", person_schema())
        .unwrap();
    meta_svc
        .create_tag(SPACE, SESSION, "session", session_schema())
        .unwrap();
    meta_svc
        .create_edge(SPACE, KNOWS, "knows", knows_schema())
        .unwrap();
    meta_svc
        .create_index(
            SPACE,
            IndexDef {
                index_id: IDX_AGE,
                schema_id: PERSON,
                is_edge: false,
                fields: vec!["age".to_string()],
                string_lens: BTreeMap::new(),
                unique: false,
            },
        )
        .unwrap();
    meta_svc
        .create_index(
            SPACE,
            IndexDef {
                index_id: IDX_NAME_UNIQUE,
                schema_id: PERSON,
                is_edge: false,
                fields: vec!["name".to_string()],
                string_lens: [("name".to_string(), 16)].into_iter().collect(),
                unique: true,
            },
        )
        .unwrap();
    meta_svc
        .create_index(
            SPACE,
            IndexDef {
                index_id: IDX_SEEN,
                schema_id: SESSION,
                is_edge: false,
                fields: vec!["seen".to_string()],
                string_lens: BTreeMap::new(),
                unique: false,
            },
        )
        .unwrap();

    let meta = Arc::new(MetaCache::new());
    meta.apply(meta_svc.snapshot().await.unwrap());

    let network = LocalNetwork::new();
    let transport = LocalTransport::new();
    let version = Arc::new(AtomicU64::new(1));
    let wall = Arc::new(AtomicI64::new(1_000_000));

    let mut stores = Vec::new();
    for host in &all_hosts {
        let config = StoreConfig {
            engine_type: EngineType::Memory,
            part_type,
            raft: fast_raft(),
            delete_scan_cap,
            ..StoreConfig::default()
        };
        let version = version.clone();
        let wall = wall.clone();
        let store = GraphStore::new(host.clone(), meta.clone(), network.clone(), config)
            .with_clocks(
                move || version.fetch_add(1, Ordering::SeqCst),
                move || wall.load(Ordering::SeqCst),
            );

        let desc = meta.space_desc(SPACE).unwrap();
        store.add_space(&desc).unwrap();
        for part in 1..=PARTS {
            let part_ref = store
                .add_part(SPACE, part, all_hosts.clone(), false)
                .unwrap();
            network.register(host.clone(), part_ref.group().unwrap());
        }
        transport.register(host.clone(), store.clone());
        stores.push((host.clone(), store.clone()));
    }

    let client = StorageClient::new(meta.clone(), transport, ClientConfig::default());
    let cluster = TestCluster {
        meta,
        stores,
        client,
        wall,
    };
    cluster.wait_for_leaders().await;
    cluster
}

impl TestCluster {
    /// Wait until every partition has a leader, then point the cached
    /// hints at the true leaders.
    async fn wait_for_leaders(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        for part in 1..=PARTS {
            loop {
                let leader = self.stores.iter().find(|(_, store)| {
                    store
                        .part(SPACE, part)
                        .ok()
                        .and_then(|p| p.group().ok().map(|g| g.is_leader()))
                        .unwrap_or(false)
                });
                if let Some((host, _)) = leader {
                    self.meta.note_leader(SPACE, part, host.clone());
                    break;
                }
                assert!(Instant::now() < deadline, "partition {part} has no leader");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    fn any_store(&self) -> &Arc<GraphStore> {
        &self.stores[0].1
    }
}

fn person(vid: &str, name: &str, age: i64) -> NewVertex {
    NewVertex {
        id: vid.as_bytes().to_vec(),
        tags: vec![NewTag {
            tag_id: PERSON,
            prop_names: vec!["name".to_string(), "age".to_string()],
            prop_values: vec![
                value_to_wire(&Value::Str(name.to_string())),
                value_to_wire(&Value::Int(age)),
            ],
        }],
    }
}

fn knows(src: &str, rank: i64, dst: &str, weight: i64) -> NewEdge {
    NewEdge {
        id: Some(EdgeId {
            src: src.as_bytes().to_vec(),
            edge_type: KNOWS,
            ranking: rank,
            dst: dst.as_bytes().to_vec(),
        }),
        prop_names: vec!["since".to_string(), "weight".to_string()],
        prop_values: vec![
            value_to_wire(&Value::Int(2020)),
            value_to_wire(&Value::Int(weight)),
        ],
    }
}

fn decoded_rows(data: &DataSet) -> Vec<Vec<Value>> {
    data.rows
        .iter()
        .map(|row| {
            row.values
                .iter()
                .map(|value| value_from_wire(value).unwrap())
                .collect()
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_vertex_round_trip_newest_wins() {
    let cluster = cluster(1, PartType::Simple, 1024).await;
    let client = &cluster.client;

    let resp = client
        .add_vertices(SPACE, vec![person("v1______", "alice", 30)], false)
        .await
        .unwrap();
    assert_eq!(resp.result.unwrap().completeness, 100);

    let resp = client
        .get_vertex_props(SPACE, vec![b"v1______".to_vec()], PERSON, vec![], vec![])
        .await
        .unwrap();
    let rows = decoded_rows(resp.data.as_ref().unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][2], Value::Str("alice".to_string()));
    assert_eq!(rows[0][3], Value::Int(30));

    // Re-insert: only the newest version is visible, exactly once.
    client
        .add_vertices(SPACE, vec![person("v1______", "alice", 31)], false)
        .await
        .unwrap();
    let resp = client
        .get_vertex_props(SPACE, vec![b"v1______".to_vec()], PERSON, vec![], vec![])
        .await
        .unwrap();
    let rows = decoded_rows(resp.data.as_ref().unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][3], Value::Int(31));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_edge_pair_stored_and_deleted_on_both_partitions() {
    let cluster = cluster(1, PartType::Simple, 1024).await;
    let client = &cluster.client;
    let store = cluster.any_store();

    client
        .add_vertices(
            SPACE,
            vec![person("v1", "a", 1), person("v2", "b", 2)],
            false,
        )
        .await
        .unwrap();
    let resp = client
        .add_edges(SPACE, vec![knows("v1", 0, "v2", 7)], false)
        .await
        .unwrap();
    assert_eq!(resp.result.unwrap().completeness, 100);

    let src_part = partition_of(&VertexId::from("v1"), PARTS);
    let dst_part = partition_of(&VertexId::from("v2"), PARTS);

    let scan = |part: PartitionId, vid: &str| {
        let prefix = codec::edge_prefix_src(
            part,
            &VertexId::from(vid),
            VID_LEN,
        )
        .unwrap();
        let mut iter = store.part(SPACE, part).unwrap().engine().prefix(&prefix).unwrap();
        let mut found = Vec::new();
        while let Some((key, _)) = iter.next_pair().unwrap() {
            found.push(codec::parse_edge(&key, VID_LEN).unwrap());
        }
        found
    };

    // Out-edge under the source's partition, positive type.
    let out = scan(src_part, "v1");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].edge_type, KNOWS);
    assert_eq!(out[0].ranking, 0);

    // In-edge under the destination's partition, negated type.
    let inbound = scan(dst_part, "v2");
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].edge_type, -KNOWS);

    // Deleting the logical edge removes both records.
    client
        .delete_edges(
            SPACE,
            vec![EdgeId {
                src: b"v1".to_vec(),
                edge_type: KNOWS,
                ranking: 0,
                dst: b"v2".to_vec(),
            }],
        )
        .await
        .unwrap();
    assert!(scan(src_part, "v1").is_empty());
    assert!(scan(dst_part, "v2").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_index_range_lookup_tracks_updates() {
    let cluster = cluster(1, PartType::Simple, 1024).await;
    let client = &cluster.client;

    client
        .add_vertices(
            SPACE,
            vec![
                person("p-young_", "ann", 18),
                person("p-mid___", "ben", 25),
                person("p-old___", "cyn", 40),
            ],
            false,
        )
        .await
        .unwrap();

    let lookup = LookupIndexRequest {
        space_id: SPACE,
        part_ids: vec![],
        index_id: IDX_AGE,
        column_hints: vec![ColumnHint {
            column: "age".to_string(),
            kind: ColumnHintKind::Range as i32,
            begin: Some(value_to_wire(&Value::Int(20))),
            end: Some(value_to_wire(&Value::Int(30))),
        }],
        return_columns: vec![],
        filter: vec![],
        order_by: vec![],
        limit: 0,
        priority: 0,
    };

    let resp = client.lookup_index(SPACE, lookup.clone()).await.unwrap();
    let rows = decoded_rows(resp.data.as_ref().unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0][0],
        Value::Str("p-mid___".to_string())
    );

    // Move the matching vertex out of range; the entry must follow.
    let part = partition_of(&VertexId::from("p-mid___"), PARTS);
    let update = UpdateVertexRequest {
        space_id: SPACE,
        part_id: part,
        vid: b"p-mid___".to_vec(),
        tag_id: PERSON,
        updated_props: vec![UpdatedProp {
            name: "age".to_string(),
            value: Some(value_to_wire(&Value::Int(35))),
        }],
        insertable: false,
        condition: vec![],
    };
    let resp = client.update_vertex(update).await.unwrap();
    assert!(resp.result.unwrap().failed_parts.is_empty());

    let resp = client.lookup_index(SPACE, lookup).await.unwrap();
    assert!(resp.data.unwrap().rows.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unique_index_conflict() {
    let cluster = cluster(1, PartType::Simple, 1024).await;
    let client = &cluster.client;

    // Two vids on the same partition, same unique name.
    let base = VertexId::from("dup-1");
    let part = partition_of(&base, PARTS);
    let mut other = None;
    for i in 2..64 {
        let vid = format!("dup-{i}");
        if partition_of(&VertexId::from(vid.as_str()), PARTS) == part {
            other = Some(vid);
            break;
        }
    }
    let other = other.expect("some vid shares the partition");

    client
        .add_vertices(SPACE, vec![person("dup-1", "same-name", 1)], false)
        .await
        .unwrap();
    let resp = client
        .add_vertices(SPACE, vec![person(&other, "same-name", 2)], false)
        .await
        .unwrap();

    let result = resp.result.unwrap();
    assert_eq!(result.failed_parts.len(), 1);
    assert_eq!(
        result.failed_parts[0].code,
        proto_storage::ErrorCode::IndexConflict as i32
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_neighbors_top_k_by_weight() {
    let cluster = cluster(1, PartType::Simple, 1024).await;
    let client = &cluster.client;

    client
        .add_vertices(SPACE, vec![person("v1", "hub", 1)], false)
        .await
        .unwrap();
    let edges: Vec<NewEdge> = (0..100)
        .map(|rank| knows("v1", rank, &format!("nb-{rank:03}"), 100 - rank))
        .collect();
    client.add_edges(SPACE, edges, false).await.unwrap();

    let template = GetNeighborsRequest {
        space_id: SPACE,
        parts: BTreeMap::new(),
        edge_types: vec![KNOWS],
        direction: EdgeDirection::Out as i32,
        vertex_props: vec![],
        edge_props: vec!["weight".to_string()],
        exprs: vec![],
        dedup: false,
        order_by: vec![OrderBy {
            prop: "weight".to_string(),
            desc: true,
        }],
        limit: 5,
        filter: vec![],
        stat_props: vec![
            StatProp {
                prop: "weight".to_string(),
                kind: StatKind::Count as i32,
            },
            StatProp {
                prop: "weight".to_string(),
                kind: StatKind::Max as i32,
            },
        ],
        priority: 0,
    };
    let resp = client
        .get_neighbors(SPACE, vec![b"v1".to_vec()], template)
        .await
        .unwrap();

    let rows = decoded_rows(resp.data.as_ref().unwrap());
    assert_eq!(rows.len(), 5);
    // Columns: _src, _type, _rank, _dst, weight, _count(weight), _max(weight).
    let ranks: Vec<i64> = rows
        .iter()
        .map(|row| row[2].as_int().unwrap())
        .collect();
    assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
    assert_eq!(rows[0][4], Value::Int(100));

    // Aggregates run over every matching edge, not only the retained K.
    assert_eq!(rows[0][5], Value::Int(100));
    assert_eq!(rows[0][6], Value::Int(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_vid_padding_equivalence() {
    let cluster = cluster(1, PartType::Simple, 1024).await;
    let client = &cluster.client;

    client
        .add_vertices(SPACE, vec![person("v1", "short", 9)], false)
        .await
        .unwrap();

    for vid in [b"v1".to_vec(), b"v1\0\0\0\0\0\0".to_vec()] {
        let resp = client
            .get_vertex_props(SPACE, vec![vid], PERSON, vec![], vec![])
            .await
            .unwrap();
        let rows = decoded_rows(resp.data.as_ref().unwrap());
        assert_eq!(rows.len(), 1, "padded and unpadded vids read the same row");
        assert_eq!(rows[0][2], Value::Str("short".to_string()));
    }

    // Oversized vids are rejected outright.
    let resp = client
        .add_vertices(SPACE, vec![person("way-too-long-vid", "x", 1)], false)
        .await
        .unwrap();
    let result = resp.result.unwrap();
    assert_eq!(result.failed_parts.len(), 1);
    assert_eq!(
        result.failed_parts[0].code,
        proto_storage::ErrorCode::VidLengthMismatch as i32
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ttl_hides_expired_rows() {
    let cluster = cluster(1, PartType::Simple, 1024).await;
    let client = &cluster.client;
    let now = cluster.wall.load(Ordering::SeqCst);

    // The session tag declares a 100-second TTL on `seen`.
    let vertex = NewVertex {
        id: b"sess-1__".to_vec(),
        tags: vec![NewTag {
            tag_id: SESSION,
            prop_names: vec!["token".to_string(), "seen".to_string()],
            prop_values: vec![
                value_to_wire(&Value::Str("tkn".to_string())),
                value_to_wire(&Value::Timestamp(now)),
            ],
        }],
    };
    client
        .add_vertices(SPACE, vec![vertex], false)
        .await
        .unwrap();

    let read = || {
        client.get_vertex_props(SPACE, vec![b"sess-1__".to_vec()], SESSION, vec![], vec![])
    };

    // Alive within the TTL window.
    cluster.wall.store(now + 99, Ordering::SeqCst);
    assert_eq!(read().await.unwrap().data.unwrap().rows.len(), 1);

    // Dead once the anchor plus the TTL is in the past.
    cluster.wall.store(now + 100, Ordering::SeqCst);
    assert!(read().await.unwrap().data.unwrap().rows.is_empty());

    // A TTL-free tag is indifferent to the clock.
    client
        .add_vertices(SPACE, vec![person("ttl-none", "keep", 1)], false)
        .await
        .unwrap();
    cluster.wall.fetch_add(10_000_000, Ordering::SeqCst);
    let resp = client
        .get_vertex_props(SPACE, vec![b"ttl-none".to_vec()], PERSON, vec![], vec![])
        .await
        .unwrap();
    assert_eq!(resp.data.unwrap().rows.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_covering_index_lookup_respects_ttl() {
    let cluster = cluster(1, PartType::Simple, 1024).await;
    let client = &cluster.client;
    let now = cluster.wall.load(Ordering::SeqCst);

    let vertex = NewVertex {
        id: b"sess-2__".to_vec(),
        tags: vec![NewTag {
            tag_id: SESSION,
            prop_names: vec!["token".to_string(), "seen".to_string()],
            prop_values: vec![
                value_to_wire(&Value::Str("tkn".to_string())),
                value_to_wire(&Value::Timestamp(now)),
            ],
        }],
    };
    client
        .add_vertices(SPACE, vec![vertex], false)
        .await
        .unwrap();

    // A full covering scan of the index over the TTL-bearing column: no
    // return columns, no residual filter.
    let covering = LookupIndexRequest {
        space_id: SPACE,
        part_ids: vec![],
        index_id: IDX_SEEN,
        column_hints: vec![],
        return_columns: vec![],
        filter: vec![],
        order_by: vec![],
        limit: 0,
        priority: 0,
    };

    let resp = client.lookup_index(SPACE, covering.clone()).await.unwrap();
    let rows = decoded_rows(resp.data.as_ref().unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], Value::Str("sess-2__".to_string()));

    // Past the TTL the entry still exists in the index, but the dead row
    // must not surface, covering or not.
    cluster.wall.store(now + 100, Ordering::SeqCst);
    let resp = client.lookup_index(SPACE, covering).await.unwrap();
    assert!(resp.data.unwrap().rows.is_empty());

    let fetching = LookupIndexRequest {
        space_id: SPACE,
        part_ids: vec![],
        index_id: IDX_SEEN,
        column_hints: vec![],
        return_columns: vec!["token".to_string()],
        filter: vec![],
        order_by: vec![],
        limit: 0,
        priority: 0,
    };
    let resp = client.lookup_index(SPACE, fetching).await.unwrap();
    assert!(resp.data.unwrap().rows.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capped_delete_vertex_removes_everything() {
    // A tiny scan cap forces multiple delete rounds with cursors.
    let cluster = cluster(1, PartType::Simple, 8).await;
    let client = &cluster.client;
    let store = cluster.any_store();

    client
        .add_vertices(SPACE, vec![person("hub", "h", 1)], false)
        .await
        .unwrap();
    let edges: Vec<NewEdge> = (0..50)
        .map(|rank| knows("hub", rank, &format!("spoke-{rank:02}"), rank))
        .collect();
    client.add_edges(SPACE, edges, false).await.unwrap();

    let resp = client.delete_vertex(SPACE, b"hub".to_vec()).await.unwrap();
    assert_eq!(resp.result.unwrap().completeness, 100);

    // The hub's tag rows and all incident records, both sides, are gone.
    let resp = client
        .get_vertex_props(SPACE, vec![b"hub".to_vec()], PERSON, vec![], vec![])
        .await
        .unwrap();
    assert!(resp.data.unwrap().rows.is_empty());

    for part in 1..=PARTS {
        let engine = store.part(SPACE, part).unwrap().engine().clone();
        let prefix = codec::edge_prefix(part);
        let mut iter = engine.prefix(&prefix).unwrap();
        while let Some((key, _)) = iter.next_pair().unwrap() {
            let parsed = codec::parse_edge(&key, VID_LEN).unwrap();
            let hub = VertexId::from("hub").padded(VID_LEN).unwrap();
            assert_ne!(parsed.src.as_bytes(), hub, "dangling record from hub");
            assert_ne!(parsed.dst.as_bytes(), hub, "dangling record to hub");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_leader_hint_is_refreshed() {
    let cluster = cluster(2, PartType::Consensus, 1024).await;
    let client = &cluster.client;

    // Point every cached hint at a replica which may not be the leader;
    // the dispatcher must follow the LeaderChanged hint and succeed.
    for part in 1..=PARTS {
        cluster
            .meta
            .note_leader(SPACE, part, cluster.stores[1].0.clone());
    }

    let resp = client
        .add_vertices(
            SPACE,
            vec![
                person("r-one___", "a", 1),
                person("r-two___", "b", 2),
                person("r-three_", "c", 3),
            ],
            false,
        )
        .await
        .unwrap();
    assert_eq!(resp.result.unwrap().completeness, 100);

    let resp = client
        .get_vertex_props(
            SPACE,
            vec![
                b"r-one___".to_vec(),
                b"r-two___".to_vec(),
                b"r-three_".to_vec(),
            ],
            PERSON,
            vec![],
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(resp.data.unwrap().rows.len(), 3);
}
