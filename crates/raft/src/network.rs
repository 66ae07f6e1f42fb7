//! The transport seam of the replication group. Production deployments
//! put an RPC client behind `RaftNetwork`; tests and single-process
//! clusters use `LocalNetwork`, which routes requests directly to the
//! registered groups and can sever hosts to simulate failures.

use super::group::RaftGroup;
use models::{HostAddr, PartitionId, SpaceId};
use proto_storage::raft::{
    AppendLogRequest, AppendLogResponse, AskForVoteRequest, AskForVoteResponse,
    InstallSnapshotRequest, InstallSnapshotResponse,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum NetworkError {
    #[error("peer {0} is unreachable")]
    Unreachable(HostAddr),
    #[error("peer {0} has no group for the partition")]
    NoSuchGroup(HostAddr),
    #[error("request to {0} timed out")]
    Timeout(HostAddr),
}

pub type Result<T> = std::result::Result<T, NetworkError>;

#[async_trait::async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    async fn append_log(&self, to: &HostAddr, req: AppendLogRequest) -> Result<AppendLogResponse>;

    async fn ask_for_vote(
        &self,
        to: &HostAddr,
        req: AskForVoteRequest,
    ) -> Result<AskForVoteResponse>;

    async fn install_snapshot(
        &self,
        to: &HostAddr,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// In-process message routing between replication groups.
#[derive(Default)]
pub struct LocalNetwork {
    // Weak: groups own the network, not the reverse.
    groups: Mutex<HashMap<(HostAddr, SpaceId, PartitionId), Weak<RaftGroup>>>,
    severed: Mutex<HashSet<HostAddr>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, host: HostAddr, group: &Arc<RaftGroup>) {
        self.groups.lock().unwrap().insert(
            (host, group.space_id(), group.part_id()),
            Arc::downgrade(group),
        );
    }

    /// Sever a host: requests to and from it fail until `heal`. Models a
    /// crashed or partitioned process.
    pub fn sever(&self, host: &HostAddr) {
        self.severed.lock().unwrap().insert(host.clone());
    }

    pub fn heal(&self, host: &HostAddr) {
        self.severed.lock().unwrap().remove(host);
    }

    fn resolve(
        &self,
        to: &HostAddr,
        space_id: SpaceId,
        part_id: PartitionId,
    ) -> Result<Arc<RaftGroup>> {
        if self.severed.lock().unwrap().contains(to) {
            return Err(NetworkError::Unreachable(to.clone()));
        }
        self.groups
            .lock()
            .unwrap()
            .get(&(to.clone(), space_id, part_id))
            .and_then(Weak::upgrade)
            .ok_or_else(|| NetworkError::NoSuchGroup(to.clone()))
    }
}

#[async_trait::async_trait]
impl RaftNetwork for LocalNetwork {
    async fn append_log(&self, to: &HostAddr, req: AppendLogRequest) -> Result<AppendLogResponse> {
        let group = self.resolve(to, req.space_id, req.part_id)?;
        Ok(group.process_append_log(req))
    }

    async fn ask_for_vote(
        &self,
        to: &HostAddr,
        req: AskForVoteRequest,
    ) -> Result<AskForVoteResponse> {
        let group = self.resolve(to, req.space_id, req.part_id)?;
        Ok(group.process_ask_for_vote(req))
    }

    async fn install_snapshot(
        &self,
        to: &HostAddr,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let group = self.resolve(to, req.space_id, req.part_id)?;
        Ok(group.process_install_snapshot(req))
    }
}
