//! One hosted partition: the glue between a replication group and the
//! engine keyspace it writes. `Part` is the group's state machine — the
//! apply stream of committed plans is the only writer of the partition's
//! data keys — and the holder of the partition's system records (raft
//! hard state, membership, snapshot meta, applied index).

use super::cache::VertexCache;
use super::{Error, Result};
use engine::{Batch, KvEngine};
use models::{PartitionId, SpaceId};
use prost::Message;
use proto_storage::plan::{ApplyPlan, KvOp, OpType};
use proto_storage::raft::{HardState, Membership, SnapshotMeta};
use raft::{LogIndex, RaftGroup, StateMachine};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

// System-key payloads. Raft-prefixed records never travel in snapshots.
const SYS_APPLIED: &[u8] = b"applied";
const SYS_RAFT_HARD: &[u8] = b"raft_hard";
const SYS_RAFT_MEMBERSHIP: &[u8] = b"raft_membership";
const SYS_RAFT_SNAPSHOT: &[u8] = b"raft_snapshot";
const SYS_RAFT_PREFIX: &[u8] = b"raft_";

/// Recently appended request fingerprints, bounding duplicate submission
/// of retried client mutations to at-most-once within the window.
const FINGERPRINT_WINDOW: usize = 4096;

pub struct Part {
    space_id: SpaceId,
    part_id: PartitionId,
    engine: Arc<dyn KvEngine>,
    group: OnceLock<Arc<RaftGroup>>,
    applied: AtomicU64,
    vertex_cache: Option<Arc<VertexCache>>,
    fingerprints: Mutex<(VecDeque<u64>, HashSet<u64>)>,
}

impl Part {
    pub fn new(
        space_id: SpaceId,
        part_id: PartitionId,
        engine: Arc<dyn KvEngine>,
        vertex_cache: Option<Arc<VertexCache>>,
    ) -> Arc<Part> {
        let applied = read_sys_u64(&engine, part_id, SYS_APPLIED).unwrap_or(0);
        Arc::new(Part {
            space_id,
            part_id,
            engine,
            group: OnceLock::new(),
            applied: AtomicU64::new(applied),
            vertex_cache,
            fingerprints: Mutex::new((VecDeque::new(), HashSet::new())),
        })
    }

    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    pub fn part_id(&self) -> PartitionId {
        self.part_id
    }

    pub fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    pub fn vertex_cache(&self) -> Option<&Arc<VertexCache>> {
        self.vertex_cache.as_ref()
    }

    pub(crate) fn bind_group(&self, group: Arc<RaftGroup>) {
        if self.group.set(group).is_err() {
            tracing::error!(part = self.part_id, "partition group bound twice");
        }
    }

    pub fn group(&self) -> Result<&Arc<RaftGroup>> {
        self.group
            .get()
            .ok_or(Error::PartNotFound(self.part_id))
    }

    /// Err(LeaderChanged) with the freshest hint unless this replica
    /// currently leads the partition.
    pub fn ensure_leader(&self) -> Result<()> {
        let group = self.group()?;
        if group.is_leader() {
            return Ok(());
        }
        Err(Error::LeaderChanged {
            part: self.part_id,
            leader: group.leader_hint(),
        })
    }

    /// Leadership for strong reads: role plus a fresh quorum lease.
    pub fn ensure_lease(&self) -> Result<()> {
        self.ensure_leader()?;
        if self.group()?.leadership_lease_valid() {
            return Ok(());
        }
        Err(Error::LeaderChanged {
            part: self.part_id,
            leader: None,
        })
    }

    /// True when `fingerprint` was appended recently; records it
    /// otherwise.
    pub fn absorb_fingerprint(&self, fingerprint: u64) -> bool {
        let mut guard = self.fingerprints.lock().unwrap();
        let (order, seen) = &mut *guard;
        if seen.contains(&fingerprint) {
            return true;
        }
        order.push_back(fingerprint);
        seen.insert(fingerprint);
        if order.len() > FINGERPRINT_WINDOW {
            if let Some(old) = order.pop_front() {
                seen.remove(&old);
            }
        }
        false
    }

    /// Replicate an apply plan and await its local apply.
    pub async fn append_plan(&self, plan: ApplyPlan, timeout: Duration) -> Result<LogIndex> {
        let group = self.group()?;
        group
            .append_async(plan.encode_to_vec(), timeout)
            .await
            .map_err(|err| Error::from_append(self.part_id, err))
    }

    fn sys_key(&self, payload: &[u8]) -> Vec<u8> {
        codec::sys_key(self.part_id, payload)
    }
}

fn read_sys_u64(engine: &Arc<dyn KvEngine>, part_id: PartitionId, payload: &[u8]) -> Option<u64> {
    let key = codec::sys_key(part_id, payload);
    let value = engine.get(&key).ok()??;
    Some(u64::from_be_bytes(value.try_into().ok()?))
}

fn read_sys_message<M: Message + Default>(
    engine: &Arc<dyn KvEngine>,
    part_id: PartitionId,
    payload: &[u8],
) -> Option<M> {
    let key = codec::sys_key(part_id, payload);
    let value = engine.get(&key).ok()??;
    M::decode(value.as_slice()).ok()
}

fn write_sys_message<M: Message>(
    engine: &Arc<dyn KvEngine>,
    part_id: PartitionId,
    payload: &[u8],
    message: &M,
) {
    let mut batch = Batch::new();
    batch.put(codec::sys_key(part_id, payload), message.encode_to_vec());
    if let Err(err) = engine.write(batch) {
        tracing::error!(part = part_id, %err, "failed to persist system record");
    }
}

impl StateMachine for Part {
    fn commit_logs(&self, first_index: LogIndex, payloads: Vec<Vec<u8>>) -> bool {
        let last_index = first_index + payloads.len() as u64 - 1;
        if last_index <= self.applied.load(Ordering::Acquire) {
            return true; // Replayed prefix after restart.
        }

        // All plans of the batch land in one engine write, together with
        // the applied index, so a crash re-applies idempotently.
        let mut batch = Batch::new();
        let mut evict = Vec::new();
        for payload in &payloads {
            let plan = match ApplyPlan::decode(payload.as_slice()) {
                Ok(plan) => plan,
                Err(err) => {
                    tracing::error!(part = self.part_id, %err, "undecodable apply plan");
                    return false;
                }
            };
            for op in plan.ops {
                match OpType::try_from(op.op).unwrap_or(OpType::Put) {
                    OpType::Put => {
                        batch.put(op.key, op.value);
                    }
                    OpType::Remove => {
                        batch.remove(op.key);
                    }
                    OpType::RemoveRange => {
                        batch.remove_range(op.key, op.end);
                    }
                }
            }
            evict.extend(plan.evict);
        }
        batch.put(self.sys_key(SYS_APPLIED), last_index.to_be_bytes().to_vec());

        if let Err(err) = self.engine.write(batch) {
            tracing::error!(part = self.part_id, %err, "apply batch failed");
            return false;
        }
        self.applied.store(last_index, Ordering::Release);

        // Only the current leader maintains the tag-row cache.
        if let (Some(cache), Some(group)) = (&self.vertex_cache, self.group.get()) {
            if group.is_leader() {
                for entry in evict {
                    if entry.len() > 4 {
                        let (vid, tag) = entry.split_at(entry.len() - 4);
                        cache.evict(vid, i32::from_be_bytes(tag.try_into().unwrap()));
                    }
                }
            }
        }
        true
    }

    fn on_elected(&self, term: u64) {
        tracing::info!(
            space = self.space_id,
            part = self.part_id,
            term,
            "partition gained leadership"
        );
    }

    fn on_lost_leadership(&self, term: u64) {
        // Followers never serve the cache; drop it wholesale.
        if let Some(cache) = &self.vertex_cache {
            cache.clear();
        }
        tracing::info!(
            space = self.space_id,
            part = self.part_id,
            term,
            "partition lost leadership"
        );
    }

    fn applied_index(&self) -> LogIndex {
        self.applied.load(Ordering::Acquire)
    }

    fn load_hard_state(&self) -> Option<HardState> {
        read_sys_message(&self.engine, self.part_id, SYS_RAFT_HARD)
    }

    fn save_hard_state(&self, hs: &HardState) {
        write_sys_message(&self.engine, self.part_id, SYS_RAFT_HARD, hs);
    }

    fn load_snapshot_meta(&self) -> Option<SnapshotMeta> {
        read_sys_message(&self.engine, self.part_id, SYS_RAFT_SNAPSHOT)
    }

    fn save_snapshot_meta(&self, meta: &SnapshotMeta) {
        write_sys_message(&self.engine, self.part_id, SYS_RAFT_SNAPSHOT, meta);
    }

    fn load_membership(&self) -> Option<Membership> {
        read_sys_message(&self.engine, self.part_id, SYS_RAFT_MEMBERSHIP)
    }

    fn save_membership(&self, membership: &Membership) {
        write_sys_message(&self.engine, self.part_id, SYS_RAFT_MEMBERSHIP, membership);
    }

    fn snapshot_rows(&self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send> {
        // Everything in the partition except raft bookkeeping: the
        // receiver must not inherit this replica's term or vote, and the
        // applied index is rewritten by the install.
        let sys_at = codec::PACKED_PREFIX_LEN;
        let (begin, end) = codec::partition_range(self.part_id);
        let iter = match self.engine.range(&begin, &end) {
            Ok(iter) => iter,
            Err(err) => {
                tracing::error!(part = self.part_id, %err, "snapshot scan failed");
                return Box::new(std::iter::empty());
            }
        };
        Box::new(SnapshotIter { iter, sys_at })
    }

    fn install_snapshot(&self, rows: Vec<(Vec<u8>, Vec<u8>)>, meta: &SnapshotMeta) -> bool {
        let mut batch = Batch::new();

        // Clear data keys, then stale non-raft system keys.
        let (begin, _) = codec::partition_range(self.part_id);
        batch.remove_range(begin, codec::sys_prefix(self.part_id));
        match self.engine.prefix(&codec::sys_prefix(self.part_id)) {
            Ok(mut iter) => loop {
                match iter.next_pair() {
                    Ok(Some((key, _))) => {
                        if !key[codec::PACKED_PREFIX_LEN..].starts_with(SYS_RAFT_PREFIX) {
                            batch.remove(key);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::error!(part = self.part_id, %err, "system-key scan failed");
                        return false;
                    }
                }
            },
            Err(err) => {
                tracing::error!(part = self.part_id, %err, "system-key scan failed");
                return false;
            }
        }

        for (key, value) in rows {
            batch.put(key, value);
        }
        batch.put(
            self.sys_key(SYS_APPLIED),
            meta.last_included_index.to_be_bytes().to_vec(),
        );
        batch.put(self.sys_key(SYS_RAFT_SNAPSHOT), meta.encode_to_vec());

        if let Err(err) = self.engine.write(batch) {
            tracing::error!(part = self.part_id, %err, "snapshot install failed");
            return false;
        }
        self.applied
            .store(meta.last_included_index, Ordering::Release);
        if let Some(cache) = &self.vertex_cache {
            cache.clear();
        }
        true
    }
}

struct SnapshotIter {
    iter: Box<dyn engine::KvIterator>,
    sys_at: usize,
}

impl Iterator for SnapshotIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.iter.next_pair() {
                Ok(Some((key, value))) => {
                    let is_raft = codec::key_type(&key)
                        .map(|t| t == codec::KeyType::System)
                        .unwrap_or(false)
                        && (key[self.sys_at..].starts_with(SYS_RAFT_PREFIX)
                            || key[self.sys_at..].starts_with(SYS_APPLIED));
                    if is_raft {
                        continue;
                    }
                    return Some((key, value));
                }
                Ok(None) => return None,
                Err(err) => {
                    tracing::error!(%err, "snapshot iteration failed");
                    return None;
                }
            }
        }
    }
}

/// Build the cache-eviction token a plan carries: padded vid || tagId.
pub(crate) fn evict_token(padded_vid: &[u8], tag: i32) -> Vec<u8> {
    let mut token = padded_vid.to_vec();
    token.extend_from_slice(&tag.to_be_bytes());
    token
}

pub(crate) fn plan_with(ops: Vec<KvOp>, fingerprint: u64, evict: Vec<Vec<u8>>) -> ApplyPlan {
    ApplyPlan {
        ops,
        fingerprint,
        evict,
    }
}
