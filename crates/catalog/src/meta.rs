//! The metadata-service read contract, and an in-process implementation
//! backing tests and single-node deployments.

use super::{Error, Result};
use models::{
    EdgeType, HostAddr, IndexDef, IndexId, PartitionId, Schema, SpaceDesc, SpaceId, TagId,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A tag's catalog entry: its name and every schema version, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TagCatalog {
    pub tag_id: TagId,
    pub name: String,
    pub versions: Vec<Schema>,
}

/// An edge type's catalog entry. `edge_type` is always the positive
/// (outbound) value; the negated value shares it for schema lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeCatalog {
    pub edge_type: EdgeType,
    pub name: String,
    pub versions: Vec<Schema>,
}

/// Replica placement and the current leader hint of one partition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartInfo {
    pub peers: Vec<HostAddr>,
    pub leader: Option<HostAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpaceCatalog {
    pub desc: SpaceDesc,
    pub tags: BTreeMap<TagId, TagCatalog>,
    pub edges: BTreeMap<EdgeType, EdgeCatalog>,
    pub indexes: BTreeMap<IndexId, IndexDef>,
    pub parts: BTreeMap<PartitionId, PartInfo>,
}

/// A complete, revisioned view of the catalog.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetaSnapshot {
    pub revision: u64,
    pub spaces: BTreeMap<SpaceId, SpaceCatalog>,
}

/// The read API the storage core consumes. Implementations are expected
/// to be strongly consistent (the catalog itself is a single Raft group).
#[async_trait::async_trait]
pub trait MetaService: Send + Sync + 'static {
    /// The current catalog.
    async fn snapshot(&self) -> Result<MetaSnapshot>;

    /// Long-poll: resolves with a catalog strictly newer than
    /// `last_revision`.
    async fn watch(&self, last_revision: u64) -> Result<MetaSnapshot>;

    /// Issue a monotonically increasing WorkerId for `host`, for snowflake
    /// id generation.
    async fn issue_worker_id(&self, host: &HostAddr) -> Result<i64>;

    /// Report liveness and the partitions this host currently leads.
    async fn heartbeat(
        &self,
        host: &HostAddr,
        leader_parts: BTreeMap<SpaceId, Vec<PartitionId>>,
    ) -> Result<()>;
}

/// In-process catalog. Mutators mirror the operator commands the real
/// metadata service accepts; each bumps the revision and wakes watchers.
pub struct MemMetaService {
    state: Mutex<MemState>,
    changed: Arc<tokio::sync::Notify>,
}

struct MemState {
    snapshot: MetaSnapshot,
    next_worker_id: i64,
    workers: BTreeMap<HostAddr, i64>,
}

impl Default for MemMetaService {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemState {
                snapshot: MetaSnapshot {
                    revision: 1,
                    spaces: BTreeMap::new(),
                },
                next_worker_id: 1,
                workers: BTreeMap::new(),
            }),
            changed: Arc::new(tokio::sync::Notify::new()),
        }
    }
}

impl MemMetaService {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate(&self, f: impl FnOnce(&mut MetaSnapshot) -> Result<()>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        f(&mut state.snapshot)?;
        state.snapshot.revision += 1;
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    pub fn create_space(&self, desc: SpaceDesc, peers_by_part: BTreeMap<PartitionId, Vec<HostAddr>>) -> Result<()> {
        self.mutate(|snapshot| {
            let parts = peers_by_part
                .into_iter()
                .map(|(part_id, peers)| {
                    let leader = peers.first().cloned();
                    (part_id, PartInfo { peers, leader })
                })
                .collect();
            snapshot.spaces.insert(
                desc.space_id,
                SpaceCatalog {
                    desc,
                    tags: BTreeMap::new(),
                    edges: BTreeMap::new(),
                    indexes: BTreeMap::new(),
                    parts,
                },
            );
            Ok(())
        })
    }

    pub fn drop_space(&self, space_id: SpaceId) -> Result<()> {
        self.mutate(|snapshot| {
            snapshot
                .spaces
                .remove(&space_id)
                .map(|_| ())
                .ok_or_else(|| Error::SpaceNotFound(space_id.to_string()))
        })
    }

    pub fn create_tag(&self, space_id: SpaceId, tag_id: TagId, name: &str, schema: Schema) -> Result<()> {
        self.mutate(|snapshot| {
            let space = space_of(snapshot, space_id)?;
            space
                .tags
                .entry(tag_id)
                .or_insert_with(|| TagCatalog {
                    tag_id,
                    name: name.to_string(),
                    versions: Vec::new(),
                })
                .versions
                .push(schema);
            Ok(())
        })
    }

    pub fn create_edge(
        &self,
        space_id: SpaceId,
        edge_type: EdgeType,
        name: &str,
        schema: Schema,
    ) -> Result<()> {
        self.mutate(|snapshot| {
            let space = space_of(snapshot, space_id)?;
            space
                .edges
                .entry(edge_type.abs())
                .or_insert_with(|| EdgeCatalog {
                    edge_type: edge_type.abs(),
                    name: name.to_string(),
                    versions: Vec::new(),
                })
                .versions
                .push(schema);
            Ok(())
        })
    }

    pub fn create_index(&self, space_id: SpaceId, index: IndexDef) -> Result<()> {
        self.mutate(|snapshot| {
            let space = space_of(snapshot, space_id)?;
            space.indexes.insert(index.index_id, index);
            Ok(())
        })
    }

    pub fn update_space_options(
        &self,
        space_id: SpaceId,
        options: BTreeMap<String, String>,
    ) -> Result<()> {
        self.mutate(|snapshot| {
            let space = space_of(snapshot, space_id)?;
            space.desc.options.extend(options);
            Ok(())
        })
    }

    pub fn set_leader(&self, space_id: SpaceId, part_id: PartitionId, leader: HostAddr) -> Result<()> {
        self.mutate(|snapshot| {
            let space = space_of(snapshot, space_id)?;
            let part = space
                .parts
                .get_mut(&part_id)
                .ok_or(Error::PartNotFound(space_id, part_id))?;
            part.leader = Some(leader);
            Ok(())
        })
    }
}

fn space_of(snapshot: &mut MetaSnapshot, space_id: SpaceId) -> Result<&mut SpaceCatalog> {
    snapshot
        .spaces
        .get_mut(&space_id)
        .ok_or_else(|| Error::SpaceNotFound(space_id.to_string()))
}

#[async_trait::async_trait]
impl MetaService for MemMetaService {
    async fn snapshot(&self) -> Result<MetaSnapshot> {
        Ok(self.state.lock().unwrap().snapshot.clone())
    }

    async fn watch(&self, last_revision: u64) -> Result<MetaSnapshot> {
        loop {
            // Register interest before checking, or a change landing
            // between check and await would be missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().unwrap();
                if state.snapshot.revision > last_revision {
                    return Ok(state.snapshot.clone());
                }
            }
            notified.await;
        }
    }

    async fn issue_worker_id(&self, host: &HostAddr) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.workers.get(host) {
            return Ok(*id);
        }
        let id = state.next_worker_id;
        state.next_worker_id += 1;
        state.workers.insert(host.clone(), id);
        Ok(id)
    }

    async fn heartbeat(
        &self,
        host: &HostAddr,
        leader_parts: BTreeMap<SpaceId, Vec<PartitionId>>,
    ) -> Result<()> {
        let mut changed = false;
        {
            let mut state = self.state.lock().unwrap();
            for (space_id, parts) in leader_parts {
                let Some(space) = state.snapshot.spaces.get_mut(&space_id) else {
                    continue;
                };
                for part_id in parts {
                    if let Some(part) = space.parts.get_mut(&part_id) {
                        if part.leader.as_ref() != Some(host) {
                            part.leader = Some(host.clone());
                            changed = true;
                        }
                    }
                }
            }
            if changed {
                state.snapshot.revision += 1;
            }
        }
        if changed {
            self.changed.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{FieldDef, FieldType};

    fn desc() -> SpaceDesc {
        SpaceDesc::new(1, "test", 3, 1, 8)
    }

    #[tokio::test]
    async fn test_watch_resolves_on_change() {
        let meta = Arc::new(MemMetaService::new());
        let initial = meta.snapshot().await.unwrap();

        let waiter = {
            let meta = meta.clone();
            let last = initial.revision;
            tokio::spawn(async move { meta.watch(last).await.unwrap() })
        };

        meta.create_space(desc(), BTreeMap::new()).unwrap();

        let next = waiter.await.unwrap();
        assert!(next.revision > initial.revision);
        assert!(next.spaces.contains_key(&1));
    }

    #[tokio::test]
    async fn test_worker_ids_are_sticky_and_increasing() {
        let meta = MemMetaService::new();
        let n1 = HostAddr::new("n1", 1);
        let n2 = HostAddr::new("n2", 2);

        let id1 = meta.issue_worker_id(&n1).await.unwrap();
        let id2 = meta.issue_worker_id(&n2).await.unwrap();
        assert!(id2 > id1);
        assert_eq!(meta.issue_worker_id(&n1).await.unwrap(), id1);
    }

    #[tokio::test]
    async fn test_schema_evolution_appends() {
        let meta = MemMetaService::new();
        meta.create_space(desc(), BTreeMap::new()).unwrap();

        let v0 = Schema::new(0, vec![FieldDef::new("name", FieldType::String)]);
        let v1 = Schema::new(
            1,
            vec![
                FieldDef::new("name", FieldType::String),
                FieldDef::new("age", FieldType::Int64).nullable(),
            ],
        );
        meta.create_tag(1, 10, "person", v0.clone()).unwrap();
        meta.create_tag(1, 10, "person", v1.clone()).unwrap();

        let snapshot = meta.snapshot().await.unwrap();
        let tag = &snapshot.spaces[&1].tags[&10];
        assert_eq!(tag.versions, vec![v0, v1]);
    }
}
