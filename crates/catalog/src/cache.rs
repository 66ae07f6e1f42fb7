//! The locally cached catalog: partition routing and schema resolution
//! for everything above the KV engine. Many readers, one writer (the
//! watch task); leader hints are best-effort and refreshed when the RPC
//! layer observes `LeaderChanged`.

use super::meta::{MetaService, MetaSnapshot};
use super::{Error, Result};
use models::{
    EdgeType, HostAddr, IndexDef, IndexId, PartitionId, Schema, SchemaVer, SpaceDesc, SpaceId,
    TagId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

/// Which schema family a lookup addresses. Edge lookups resolve through
/// the absolute edge type, so both directions share one schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaTarget {
    Tag(TagId),
    Edge(EdgeType),
}

/// Callbacks fired as the watched catalog changes. Delivery is serial:
/// the single watch task fires them in order, so a handler observes a
/// consistent sequence per (space, partition).
#[allow(unused_variables)]
pub trait PartHandler: Send + Sync {
    fn on_space_added(&self, desc: &SpaceDesc) {}
    fn on_space_removed(&self, space_id: SpaceId) {}
    fn on_space_option_updated(&self, space_id: SpaceId, options: &BTreeMap<String, String>) {}
    fn on_part_added(&self, space_id: SpaceId, part_id: PartitionId, peers: &[HostAddr]) {}
    fn on_part_removed(&self, space_id: SpaceId, part_id: PartitionId) {}
    fn on_leader_changed(&self, space_id: SpaceId, part_id: PartitionId, leader: &HostAddr) {}
}

#[derive(Default)]
pub struct MetaCache {
    snapshot: RwLock<MetaSnapshot>,
    handlers: Mutex<Vec<Arc<dyn PartHandler>>>,
}

impl MetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&self, handler: Arc<dyn PartHandler>) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// Spawn the background task which long-polls `meta` and folds each
    /// newer catalog into this cache.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        meta: Arc<dyn MetaService>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut revision = cache.snapshot.read().unwrap().revision;
            loop {
                match meta.watch(revision).await {
                    Ok(snapshot) => {
                        revision = snapshot.revision;
                        cache.apply(snapshot);
                    }
                    Err(err) => {
                        tracing::warn!(%err, "metadata watch failed; backing off");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    /// Fold a newer catalog into the cache, firing handler callbacks for
    /// every observed difference.
    pub fn apply(&self, next: MetaSnapshot) {
        let prev = {
            let mut guard = self.snapshot.write().unwrap();
            std::mem::replace(&mut *guard, next.clone())
        };
        let handlers: Vec<_> = self.handlers.lock().unwrap().clone();
        if handlers.is_empty() {
            return;
        }

        for (space_id, space) in &next.spaces {
            match prev.spaces.get(space_id) {
                None => {
                    for handler in &handlers {
                        handler.on_space_added(&space.desc);
                        for (part_id, part) in &space.parts {
                            handler.on_part_added(*space_id, *part_id, &part.peers);
                        }
                    }
                }
                Some(old) => {
                    if old.desc.options != space.desc.options {
                        for handler in &handlers {
                            handler.on_space_option_updated(*space_id, &space.desc.options);
                        }
                    }
                    for (part_id, part) in &space.parts {
                        match old.parts.get(part_id) {
                            None => {
                                for handler in &handlers {
                                    handler.on_part_added(*space_id, *part_id, &part.peers);
                                }
                            }
                            Some(old_part) => {
                                if part.leader != old_part.leader {
                                    if let Some(leader) = &part.leader {
                                        for handler in &handlers {
                                            handler.on_leader_changed(*space_id, *part_id, leader);
                                        }
                                    }
                                }
                            }
                        }
                    }
                    for part_id in old.parts.keys() {
                        if !space.parts.contains_key(part_id) {
                            for handler in &handlers {
                                handler.on_part_removed(*space_id, *part_id);
                            }
                        }
                    }
                }
            }
        }
        for space_id in prev.spaces.keys() {
            if !next.spaces.contains_key(space_id) {
                for handler in &handlers {
                    handler.on_space_removed(*space_id);
                }
            }
        }
    }

    /// Partitions hosted on `host`, across every space.
    pub fn parts_on(&self, host: &HostAddr) -> BTreeMap<SpaceId, BTreeSet<PartitionId>> {
        let snapshot = self.snapshot.read().unwrap();
        let mut out = BTreeMap::new();
        for (space_id, space) in &snapshot.spaces {
            let parts: BTreeSet<_> = space
                .parts
                .iter()
                .filter(|(_, part)| part.peers.contains(host))
                .map(|(part_id, _)| *part_id)
                .collect();
            if !parts.is_empty() {
                out.insert(*space_id, parts);
            }
        }
        out
    }

    /// The cached leader hint of a partition. The hint may be stale;
    /// callers must refresh on `LeaderChanged`.
    pub fn leader_of(&self, space_id: SpaceId, part_id: PartitionId) -> Result<Option<HostAddr>> {
        let snapshot = self.snapshot.read().unwrap();
        let space = snapshot
            .spaces
            .get(&space_id)
            .ok_or_else(|| Error::SpaceNotFound(space_id.to_string()))?;
        let part = space
            .parts
            .get(&part_id)
            .ok_or(Error::PartNotFound(space_id, part_id))?;
        Ok(part.leader.clone())
    }

    pub fn peers_of(&self, space_id: SpaceId, part_id: PartitionId) -> Result<Vec<HostAddr>> {
        let snapshot = self.snapshot.read().unwrap();
        let space = snapshot
            .spaces
            .get(&space_id)
            .ok_or_else(|| Error::SpaceNotFound(space_id.to_string()))?;
        let part = space
            .parts
            .get(&part_id)
            .ok_or(Error::PartNotFound(space_id, part_id))?;
        Ok(part.peers.clone())
    }

    /// Record a fresher leader hint observed out-of-band (from a
    /// `LeaderChanged` response). Local only; the catalog itself learns
    /// through host heartbeats.
    pub fn note_leader(&self, space_id: SpaceId, part_id: PartitionId, leader: HostAddr) {
        let mut snapshot = self.snapshot.write().unwrap();
        if let Some(part) = snapshot
            .spaces
            .get_mut(&space_id)
            .and_then(|space| space.parts.get_mut(&part_id))
        {
            part.leader = Some(leader);
        }
    }

    pub fn space_id(&self, name: &str) -> Result<SpaceId> {
        let snapshot = self.snapshot.read().unwrap();
        snapshot
            .spaces
            .values()
            .find(|space| space.desc.name == name)
            .map(|space| space.desc.space_id)
            .ok_or_else(|| Error::SpaceNotFound(name.to_string()))
    }

    pub fn space_desc(&self, space_id: SpaceId) -> Result<SpaceDesc> {
        let snapshot = self.snapshot.read().unwrap();
        snapshot
            .spaces
            .get(&space_id)
            .map(|space| space.desc.clone())
            .ok_or_else(|| Error::SpaceNotFound(space_id.to_string()))
    }

    pub fn tag_id(&self, space_id: SpaceId, name: &str) -> Result<TagId> {
        let snapshot = self.snapshot.read().unwrap();
        let space = snapshot
            .spaces
            .get(&space_id)
            .ok_or_else(|| Error::SpaceNotFound(space_id.to_string()))?;
        space
            .tags
            .values()
            .find(|tag| tag.name == name)
            .map(|tag| tag.tag_id)
            .ok_or_else(|| Error::TagNotFound(name.to_string()))
    }

    pub fn edge_type(&self, space_id: SpaceId, name: &str) -> Result<EdgeType> {
        let snapshot = self.snapshot.read().unwrap();
        let space = snapshot
            .spaces
            .get(&space_id)
            .ok_or_else(|| Error::SpaceNotFound(space_id.to_string()))?;
        space
            .edges
            .values()
            .find(|edge| edge.name == name)
            .map(|edge| edge.edge_type)
            .ok_or_else(|| Error::EdgeNotFound(name.to_string()))
    }

    /// Resolve a schema. `ver` of None means the newest version.
    pub fn schema(
        &self,
        space_id: SpaceId,
        target: SchemaTarget,
        ver: Option<SchemaVer>,
    ) -> Result<Schema> {
        let snapshot = self.snapshot.read().unwrap();
        let space = snapshot
            .spaces
            .get(&space_id)
            .ok_or_else(|| Error::SpaceNotFound(space_id.to_string()))?;

        let versions = match target {
            SchemaTarget::Tag(tag_id) => space
                .tags
                .get(&tag_id)
                .map(|tag| &tag.versions)
                .ok_or_else(|| Error::TagNotFound(tag_id.to_string()))?,
            SchemaTarget::Edge(edge_type) => space
                .edges
                .get(&edge_type.abs())
                .map(|edge| &edge.versions)
                .ok_or_else(|| Error::EdgeNotFound(edge_type.to_string()))?,
        };

        match ver {
            None => versions
                .last()
                .cloned()
                .ok_or(Error::SchemaVerNotFound(-1)),
            Some(ver) => versions
                .iter()
                .find(|schema| schema.ver == ver)
                .cloned()
                .ok_or(Error::SchemaVerNotFound(ver)),
        }
    }

    /// Indexes defined over a tag or edge schema.
    pub fn indexes_of(&self, space_id: SpaceId, schema_id: i32, is_edge: bool) -> Vec<IndexDef> {
        let snapshot = self.snapshot.read().unwrap();
        snapshot
            .spaces
            .get(&space_id)
            .map(|space| {
                space
                    .indexes
                    .values()
                    .filter(|index| index.is_edge == is_edge && index.schema_id == schema_id.abs())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn index(&self, space_id: SpaceId, index_id: IndexId) -> Result<IndexDef> {
        let snapshot = self.snapshot.read().unwrap();
        snapshot
            .spaces
            .get(&space_id)
            .and_then(|space| space.indexes.get(&index_id))
            .cloned()
            .ok_or(Error::IndexNotFound(index_id))
    }
}

#[cfg(test)]
mod test {
    use super::super::meta::{MemMetaService, PartInfo, SpaceCatalog};
    use super::*;
    use models::{FieldDef, FieldType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot_with(revision: u64, leader: &str) -> MetaSnapshot {
        let mut parts = BTreeMap::new();
        parts.insert(
            1,
            PartInfo {
                peers: vec![HostAddr::new("n1", 1), HostAddr::new("n2", 1)],
                leader: Some(HostAddr::new(leader, 1)),
            },
        );
        let mut spaces = BTreeMap::new();
        spaces.insert(
            1,
            SpaceCatalog {
                desc: SpaceDesc::new(1, "test", 1, 2, 8),
                tags: BTreeMap::new(),
                edges: BTreeMap::new(),
                indexes: BTreeMap::new(),
                parts,
            },
        );
        MetaSnapshot { revision, spaces }
    }

    #[derive(Default)]
    struct CountingHandler {
        spaces_added: AtomicUsize,
        parts_added: AtomicUsize,
        leaders_changed: AtomicUsize,
        spaces_removed: AtomicUsize,
    }

    impl PartHandler for CountingHandler {
        fn on_space_added(&self, _desc: &SpaceDesc) {
            self.spaces_added.fetch_add(1, Ordering::SeqCst);
        }
        fn on_part_added(&self, _space: SpaceId, _part: PartitionId, _peers: &[HostAddr]) {
            self.parts_added.fetch_add(1, Ordering::SeqCst);
        }
        fn on_leader_changed(&self, _space: SpaceId, _part: PartitionId, _leader: &HostAddr) {
            self.leaders_changed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_space_removed(&self, _space: SpaceId) {
            self.spaces_removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_apply_fires_diff_callbacks() {
        let cache = MetaCache::new();
        let handler = Arc::new(CountingHandler::default());
        cache.register_handler(handler.clone());

        cache.apply(snapshot_with(2, "n1"));
        assert_eq!(handler.spaces_added.load(Ordering::SeqCst), 1);
        assert_eq!(handler.parts_added.load(Ordering::SeqCst), 1);

        // Leader moves.
        cache.apply(snapshot_with(3, "n2"));
        assert_eq!(handler.leaders_changed.load(Ordering::SeqCst), 1);

        // Space goes away.
        cache.apply(MetaSnapshot {
            revision: 4,
            spaces: BTreeMap::new(),
        });
        assert_eq!(handler.spaces_removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lookups() {
        let cache = MetaCache::new();
        cache.apply(snapshot_with(2, "n1"));

        assert_eq!(cache.space_id("test").unwrap(), 1);
        assert!(matches!(
            cache.space_id("missing"),
            Err(Error::SpaceNotFound(_))
        ));
        assert_eq!(
            cache.leader_of(1, 1).unwrap(),
            Some(HostAddr::new("n1", 1))
        );
        assert!(matches!(
            cache.leader_of(1, 9),
            Err(Error::PartNotFound(1, 9))
        ));

        let on_n2 = cache.parts_on(&HostAddr::new("n2", 1));
        assert_eq!(on_n2[&1], [1].into_iter().collect());

        cache.note_leader(1, 1, HostAddr::new("n2", 1));
        assert_eq!(
            cache.leader_of(1, 1).unwrap(),
            Some(HostAddr::new("n2", 1))
        );
    }

    #[tokio::test]
    async fn test_watcher_follows_meta() {
        let meta = Arc::new(MemMetaService::new());
        let cache = Arc::new(MetaCache::new());
        let _task = cache.spawn_watcher(meta.clone());

        meta.create_space(SpaceDesc::new(7, "graph", 3, 1, 8), BTreeMap::new())
            .unwrap();
        meta.create_tag(
            7,
            1,
            "person",
            models::Schema::new(0, vec![FieldDef::new("name", FieldType::String)]),
        )
        .unwrap();

        // The watch task needs a moment to observe the change.
        for _ in 0..50 {
            if cache.space_id("graph").is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(cache.space_id("graph").unwrap(), 7);
        assert_eq!(cache.tag_id(7, "person").unwrap(), 1);
        let schema = cache.schema(7, SchemaTarget::Tag(1), None).unwrap();
        assert_eq!(schema.fields.len(), 1);
    }
}
