//! The per-host registry of spaces, engines, and hosted partitions, plus
//! the admin surface operating on them. Partition placement is driven by
//! the watched catalog: the registered `StoreHandler` materializes and
//! tears down partitions as the metadata changes.

use super::cache::VertexCache;
use super::part::Part;
use super::pools::PriorityPools;
use super::{Error, Result};
use catalog::{MetaCache, PartHandler};
use engine::{Batch, KvEngine, MemEngine, RocksEngine};
use models::{HostAddr, PartitionId, SpaceDesc, SpaceId};
use proto_storage::raft::EntryKind;
use raft::{GroupConfig, RaftGroup, RaftNetwork, Wal};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    Rocksdb,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartType {
    /// Single-node: a one-voter group with a volatile log.
    Simple,
    /// Replicated: quorum commit over the peers the catalog assigns.
    Consensus,
}

#[derive(Clone)]
pub struct StoreConfig {
    /// Data roots; a space's engine lands on `data_paths[space % len]`.
    pub data_paths: Vec<PathBuf>,
    pub engine_type: EngineType,
    pub part_type: PartType,
    pub raft: GroupConfig,
    pub enable_vertex_cache: bool,
    pub vertex_cache_capacity: usize,
    /// Serve reads from followers without a leadership check.
    pub allow_stale_reads: bool,
    /// Read-admission slots per priority class, highest class first
    /// (the `num_threads_per_priority` knob).
    pub read_pool_sizes: Vec<usize>,
    /// Cap on incident edges scanned per delete-vertex round.
    pub delete_scan_cap: usize,
    /// Cooperative yield granularity of long scans.
    pub scan_yield_every: usize,
    pub mutation_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_paths: vec![PathBuf::from("data")],
            engine_type: EngineType::Rocksdb,
            part_type: PartType::Consensus,
            raft: GroupConfig::default(),
            enable_vertex_cache: true,
            vertex_cache_capacity: 64 * 1024,
            allow_stale_reads: false,
            read_pool_sizes: vec![2, 4, 4, 8, 2],
            delete_scan_cap: 1024,
            scan_yield_every: 128,
            mutation_timeout: Duration::from_secs(5),
        }
    }
}

struct SpaceStore {
    desc: SpaceDesc,
    engine: Arc<dyn KvEngine>,
    vertex_cache: Option<Arc<VertexCache>>,
    parts: HashMap<PartitionId, Arc<Part>>,
}

pub struct GraphStore {
    local: HostAddr,
    pub(crate) meta: Arc<MetaCache>,
    pub(crate) config: StoreConfig,
    network: Arc<dyn RaftNetwork>,
    spaces: RwLock<HashMap<SpaceId, SpaceStore>>,
    /// Per-priority-class admission for the read pipeline.
    pub(crate) read_pools: PriorityPools,
    /// Versions stamp rows newest-first; injectable for deterministic
    /// tests.
    pub(crate) version_clock: Arc<dyn Fn() -> u64 + Send + Sync>,
    /// Seconds since epoch, for TTL and write timestamps.
    pub(crate) wall_clock: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl GraphStore {
    pub fn new(
        local: HostAddr,
        meta: Arc<MetaCache>,
        network: Arc<dyn RaftNetwork>,
        config: StoreConfig,
    ) -> Arc<GraphStore> {
        let read_pools = PriorityPools::new(&config.read_pool_sizes);
        Arc::new(GraphStore {
            local,
            meta,
            config,
            network,
            spaces: RwLock::new(HashMap::new()),
            read_pools,
            version_clock: Arc::new(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .expect("system clock precedes the unix epoch")
                    .as_nanos() as u64
            }),
            wall_clock: Arc::new(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .expect("system clock precedes the unix epoch")
                    .as_secs() as i64
            }),
        })
    }

    /// Replace the version source; newer stamps must sort after older.
    pub fn with_clocks(
        self: Arc<Self>,
        version: impl Fn() -> u64 + Send + Sync + 'static,
        wall: impl Fn() -> i64 + Send + Sync + 'static,
    ) -> Arc<Self> {
        let mut store = Arc::try_unwrap(self).unwrap_or_else(|_| panic!("clocks set after sharing"));
        store.version_clock = Arc::new(version);
        store.wall_clock = Arc::new(wall);
        Arc::new(store)
    }

    pub fn local(&self) -> &HostAddr {
        &self.local
    }

    /// Materialize a space's engine (idempotent).
    pub fn add_space(&self, desc: &SpaceDesc) -> Result<()> {
        let mut spaces = self.spaces.write().unwrap();
        if spaces.contains_key(&desc.space_id) {
            return Ok(());
        }
        let engine: Arc<dyn KvEngine> = match self.config.engine_type {
            EngineType::Memory => Arc::new(MemEngine::new()),
            EngineType::Rocksdb => {
                let root =
                    &self.config.data_paths[desc.space_id as usize % self.config.data_paths.len()];
                let path = root.join(desc.space_id.to_string()).join("data");
                std::fs::create_dir_all(&path)
                    .map_err(|err| Error::Engine(engine::Error::Io(err.to_string())))?;
                Arc::new(RocksEngine::open(&path)?)
            }
        };
        engine.update_options(&desc.options)?;

        let vertex_cache = self
            .config
            .enable_vertex_cache
            .then(|| Arc::new(VertexCache::new(self.config.vertex_cache_capacity)));

        spaces.insert(
            desc.space_id,
            SpaceStore {
                desc: desc.clone(),
                engine,
                vertex_cache,
                parts: HashMap::new(),
            },
        );
        tracing::info!(space = desc.space_id, name = %desc.name, "space added");
        Ok(())
    }

    pub fn remove_space(&self, space_id: SpaceId) {
        let removed = self.spaces.write().unwrap().remove(&space_id);
        if let Some(space) = removed {
            for (_, part) in space.parts {
                if let Ok(group) = part.group() {
                    group.stop();
                }
            }
            tracing::info!(space = space_id, "space removed");
        }
    }

    /// Materialize a partition as a replication group on this host.
    pub fn add_part(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        peers: Vec<HostAddr>,
        as_learner: bool,
    ) -> Result<Arc<Part>> {
        let mut spaces = self.spaces.write().unwrap();
        let space = spaces
            .get_mut(&space_id)
            .ok_or(Error::SpaceNotFound(space_id))?;
        if let Some(part) = space.parts.get(&part_id) {
            return Ok(part.clone());
        }

        let part = Part::new(
            space_id,
            part_id,
            space.engine.clone(),
            space.vertex_cache.clone(),
        );

        let (voters, learners, wal) = match self.config.part_type {
            PartType::Simple => (
                vec![self.local.clone()],
                Vec::new(),
                Wal::open(None, 1).map_err(|err| Error::IllFormed(err.to_string()))?,
            ),
            PartType::Consensus => {
                let wal_dir = match space.engine.path() {
                    Some(path) => {
                        // <root>/<spaceId>/data -> <root>/<spaceId>/wals/<partId>
                        let space_root = path.parent().map(PathBuf::from).unwrap_or_default();
                        Some(space_root.join("wals").join(part_id.to_string()))
                    }
                    None => None,
                };
                let learners = if as_learner {
                    vec![self.local.clone()]
                } else {
                    Vec::new()
                };
                (
                    peers,
                    learners,
                    Wal::open(wal_dir.as_deref(), 1)
                        .map_err(|err| Error::IllFormed(err.to_string()))?,
                )
            }
        };

        let group = RaftGroup::start(
            space_id,
            part_id,
            self.local.clone(),
            voters,
            learners,
            wal,
            part.clone(),
            self.network.clone(),
            self.config.raft.clone(),
        );
        part.bind_group(group);
        space.parts.insert(part_id, part.clone());
        tracing::info!(space = space_id, part = part_id, "partition added");
        Ok(part)
    }

    /// Tear down a partition and delete its keyspace.
    pub fn remove_part(&self, space_id: SpaceId, part_id: PartitionId) -> Result<()> {
        let part = {
            let mut spaces = self.spaces.write().unwrap();
            let space = spaces
                .get_mut(&space_id)
                .ok_or(Error::SpaceNotFound(space_id))?;
            space.parts.remove(&part_id)
        };
        let Some(part) = part else {
            return Err(Error::PartNotFound(part_id));
        };
        if let Ok(group) = part.group() {
            group.stop();
        }
        let (begin, end) = codec::partition_range(part_id);
        let mut batch = Batch::new();
        batch.remove_range(begin, end);
        part.engine().write(batch)?;
        tracing::info!(space = space_id, part = part_id, "partition removed");
        Ok(())
    }

    pub fn part(&self, space_id: SpaceId, part_id: PartitionId) -> Result<Arc<Part>> {
        let spaces = self.spaces.read().unwrap();
        let space = spaces
            .get(&space_id)
            .ok_or(Error::SpaceNotFound(space_id))?;
        space
            .parts
            .get(&part_id)
            .cloned()
            .ok_or(Error::PartNotFound(part_id))
    }

    pub fn space_desc(&self, space_id: SpaceId) -> Result<SpaceDesc> {
        let spaces = self.spaces.read().unwrap();
        spaces
            .get(&space_id)
            .map(|space| space.desc.clone())
            .ok_or(Error::SpaceNotFound(space_id))
    }

    pub fn update_space_options(
        &self,
        space_id: SpaceId,
        options: &BTreeMap<String, String>,
    ) -> Result<()> {
        let spaces = self.spaces.read().unwrap();
        let space = spaces
            .get(&space_id)
            .ok_or(Error::SpaceNotFound(space_id))?;
        space.engine.update_options(options)?;
        Ok(())
    }

    /// Partitions this host currently leads, by space.
    pub fn leader_parts(&self) -> BTreeMap<SpaceId, Vec<PartitionId>> {
        let spaces = self.spaces.read().unwrap();
        let mut out = BTreeMap::new();
        for (space_id, space) in spaces.iter() {
            let led: Vec<PartitionId> = space
                .parts
                .iter()
                .filter(|(_, part)| part.group().map(|g| g.is_leader()).unwrap_or(false))
                .map(|(part_id, _)| *part_id)
                .collect();
            if !led.is_empty() {
                out.insert(*space_id, led);
            }
        }
        out
    }

    // ---- Admin surface ----

    pub async fn transfer_leader(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        target: HostAddr,
    ) -> Result<()> {
        let part = self.part(space_id, part_id)?;
        part.group()?
            .transfer_leader(target)
            .await
            .map_err(|err| Error::from_append(part_id, err))
    }

    pub async fn member_change(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        add: bool,
        peer: HostAddr,
    ) -> Result<()> {
        let part = self.part(space_id, part_id)?;
        let kind = if add {
            EntryKind::PromoteLearner
        } else {
            EntryKind::RemovePeer
        };
        part.group()?
            .propose_config_change(kind, peer, self.config.mutation_timeout)
            .await
            .map(|_| ())
            .map_err(|err| Error::from_append(part_id, err))
    }

    pub async fn add_learner(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        learner: HostAddr,
    ) -> Result<()> {
        let part = self.part(space_id, part_id)?;
        part.group()?
            .propose_config_change(EntryKind::AddPeer, learner, self.config.mutation_timeout)
            .await
            .map(|_| ())
            .map_err(|err| Error::from_append(part_id, err))
    }

    pub async fn wait_for_catch_up(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        target: HostAddr,
        timeout: Duration,
    ) -> Result<()> {
        let part = self.part(space_id, part_id)?;
        part.group()?
            .wait_for_catch_up(target, timeout)
            .await
            .map_err(|err| Error::from_append(part_id, err))
    }

    pub fn get_leader(&self) -> proto_storage::storage::GetLeaderResponse {
        proto_storage::storage::GetLeaderResponse {
            result: Some(proto_storage::ResponseCommon::of(0, Vec::new())),
            leader_parts: self
                .leader_parts()
                .into_iter()
                .map(|(space_id, part_ids)| {
                    (space_id, proto_storage::storage::PartList { part_ids })
                })
                .collect(),
        }
    }

    pub fn compact(&self, space_id: SpaceId) -> Result<()> {
        let spaces = self.spaces.read().unwrap();
        let space = spaces
            .get(&space_id)
            .ok_or(Error::SpaceNotFound(space_id))?;
        space.engine.compact()?;
        Ok(())
    }

    pub fn flush(&self, space_id: SpaceId) -> Result<()> {
        let spaces = self.spaces.read().unwrap();
        let space = spaces
            .get(&space_id)
            .ok_or(Error::SpaceNotFound(space_id))?;
        space.engine.flush()?;
        Ok(())
    }
}

/// Bridges catalog changes into store actions. Register with the
/// `MetaCache`; holds the store weakly so shutdown order is free.
pub struct StoreHandler(Weak<GraphStore>);

impl StoreHandler {
    pub fn new(store: &Arc<GraphStore>) -> Arc<StoreHandler> {
        Arc::new(StoreHandler(Arc::downgrade(store)))
    }
}

impl PartHandler for StoreHandler {
    fn on_space_added(&self, desc: &SpaceDesc) {
        if let Some(store) = self.0.upgrade() {
            if let Err(err) = store.add_space(desc) {
                tracing::error!(space = desc.space_id, %err, "failed to add space");
            }
        }
    }

    fn on_space_removed(&self, space_id: SpaceId) {
        if let Some(store) = self.0.upgrade() {
            store.remove_space(space_id);
        }
    }

    fn on_space_option_updated(&self, space_id: SpaceId, options: &BTreeMap<String, String>) {
        if let Some(store) = self.0.upgrade() {
            if let Err(err) = store.update_space_options(space_id, options) {
                tracing::warn!(space = space_id, %err, "failed to update space options");
            }
        }
    }

    fn on_part_added(&self, space_id: SpaceId, part_id: PartitionId, peers: &[HostAddr]) {
        let Some(store) = self.0.upgrade() else { return };
        if !peers.contains(store.local()) {
            return;
        }
        if let Err(err) = store.add_part(space_id, part_id, peers.to_vec(), false) {
            tracing::error!(space = space_id, part = part_id, %err, "failed to add partition");
        }
    }

    fn on_part_removed(&self, space_id: SpaceId, part_id: PartitionId) {
        if let Some(store) = self.0.upgrade() {
            if let Err(err) = store.remove_part(space_id, part_id) {
                tracing::warn!(space = space_id, part = part_id, %err, "failed to remove partition");
            }
        }
    }
}
