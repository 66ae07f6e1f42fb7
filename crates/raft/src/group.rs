//! The replication group of one partition.
//!
//! Locking: `state` is the consensus lock. It serializes every transition
//! of (term, role, votedFor, log tail) and is never held across an await
//! point; RPC fan-out is dispatched by background tasks which take the
//! lock only to read a batch or fold in a response. The packed
//! `role_sig` word (low 32 bits role, high 32 an ABA counter bumped on
//! every transition) lets the hot read path observe the current role, and
//! detect a concurrent transition, without touching the lock.

use super::network::{NetworkError, RaftNetwork};
use super::state_machine::StateMachine;
use super::wal::Wal;
use super::{AppendError, AppendResult, LogIndex, Term};
use models::{HostAddr, PartitionId, SpaceId};
use proto_storage::raft::{
    AppendLogRequest, AppendLogResponse, AskForVoteRequest, AskForVoteResponse, ConfigChange,
    EntryKind, HardState, InstallSnapshotRequest, InstallSnapshotResponse, KvPair, LogEntry,
    Membership, SnapshotChunk, SnapshotMeta,
};
use prost::Message;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Role {
    Follower = 0,
    Candidate = 1,
    Leader = 2,
    /// Receives the log but never votes nor counts toward quorum.
    Learner = 3,
}

impl Role {
    fn from_u32(v: u32) -> Role {
        match v {
            0 => Role::Follower,
            1 => Role::Candidate,
            2 => Role::Leader,
            _ => Role::Learner,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Base election timeout; each deadline is drawn from a 2x window
    /// above it.
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
    /// Snapshot once the live log exceeds this many entries.
    pub snapshot_logs_threshold: u64,
    pub max_append_entries: usize,
    pub snapshot_chunk_rows: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(200),
            rpc_timeout: Duration::from_millis(500),
            snapshot_logs_threshold: 10_000,
            max_append_entries: 128,
            snapshot_chunk_rows: 256,
        }
    }
}

// Volatile consensus state, guarded by the consensus lock.
struct Consensus {
    term: Term,
    role: Role,
    voted_for: Option<HostAddr>,
    leader_hint: Option<HostAddr>,
    wal: Wal,
    commit_index: LogIndex,
    /// Highest index already handed to the apply task.
    enqueued: LogIndex,
    voters: Vec<HostAddr>,
    learners: Vec<HostAddr>,
    /// Leader bookkeeping, rebuilt on election.
    next_index: HashMap<HostAddr, LogIndex>,
    match_index: HashMap<HostAddr, LogIndex>,
    last_ack: HashMap<HostAddr, Instant>,
    peer_tasks: HashMap<HostAddr, tokio::task::JoinHandle<()>>,
    /// Callers awaiting apply of their entry, by index. Completed in
    /// index order, so futures fulfill in call order within a term.
    pending: BTreeMap<LogIndex, oneshot::Sender<AppendResult>>,
    /// Index of the uncommitted membership change, if one is in flight.
    change_in_flight: Option<LogIndex>,
    election_deadline: Instant,
    snapshot_meta: SnapshotMeta,
    /// Rows staged by an in-progress snapshot install.
    snapshot_staging: Vec<(Vec<u8>, Vec<u8>)>,
}

struct ApplyBatch {
    first_index: LogIndex,
    entries: Vec<LogEntry>,
}

pub struct RaftGroup {
    space_id: SpaceId,
    part_id: PartitionId,
    local: HostAddr,
    config: GroupConfig,
    sm: Arc<dyn StateMachine>,
    network: Arc<dyn RaftNetwork>,
    role_sig: AtomicU64,
    last_applied: AtomicU64,
    state: Mutex<Consensus>,
    apply_tx: mpsc::UnboundedSender<ApplyBatch>,
    replicate: Arc<Notify>,
    shutdown: CancellationToken,
}

impl RaftGroup {
    /// Bring up the replica: recover persisted state, re-apply any
    /// committed-but-unapplied suffix, and start the election timer and
    /// apply loop. The replica starts as a follower (or learner) and
    /// discovers its leader through the protocol.
    pub fn start(
        space_id: SpaceId,
        part_id: PartitionId,
        local: HostAddr,
        voters: Vec<HostAddr>,
        learners: Vec<HostAddr>,
        wal: Wal,
        sm: Arc<dyn StateMachine>,
        network: Arc<dyn RaftNetwork>,
        config: GroupConfig,
    ) -> Arc<RaftGroup> {
        let hard = sm.load_hard_state().unwrap_or_default();
        let snapshot_meta = sm.load_snapshot_meta().unwrap_or_default();
        let (voters, learners) = match sm.load_membership() {
            Some(membership) => (
                membership.voters.iter().map(Into::into).collect(),
                membership.learners.iter().map(Into::into).collect(),
            ),
            None => (voters, learners),
        };

        let role = if learners.contains(&local) {
            Role::Learner
        } else {
            Role::Follower
        };
        let applied = sm.applied_index();

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let group = Arc::new(RaftGroup {
            space_id,
            part_id,
            local,
            sm,
            network,
            role_sig: AtomicU64::new(role as u32 as u64),
            last_applied: AtomicU64::new(applied),
            state: Mutex::new(Consensus {
                term: hard.current_term,
                role,
                voted_for: hard.voted_for.as_ref().map(Into::into),
                leader_hint: None,
                wal,
                commit_index: hard.committed_log_id,
                enqueued: applied,
                voters,
                learners,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                last_ack: HashMap::new(),
                peer_tasks: HashMap::new(),
                pending: BTreeMap::new(),
                change_in_flight: None,
                election_deadline: Instant::now() + randomized(config.election_timeout),
                snapshot_meta,
                snapshot_staging: Vec::new(),
            }),
            config,
            apply_tx,
            replicate: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        });

        // Recovery: re-enqueue the committed suffix that never applied.
        {
            let mut state = group.state.lock().unwrap();
            let commit = state.commit_index;
            group.enqueue_apply(&mut state, commit);
        }

        spawn_apply_loop(&group, apply_rx);
        spawn_tick_loop(&group);
        group
    }

    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    pub fn part_id(&self) -> PartitionId {
        self.part_id
    }

    pub fn local(&self) -> &HostAddr {
        &self.local
    }

    /// The packed (ABA counter, role) word. Lock-free; two equal readings
    /// bracket a window with no role transition.
    pub fn role_signature(&self) -> u64 {
        self.role_sig.load(Ordering::Acquire)
    }

    pub fn role(&self) -> Role {
        Role::from_u32(self.role_signature() as u32)
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn current_term(&self) -> Term {
        self.state.lock().unwrap().term
    }

    pub fn leader_hint(&self) -> Option<HostAddr> {
        self.state.lock().unwrap().leader_hint.clone()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        let mut state = self.state.lock().unwrap();
        for (_, task) in state.peer_tasks.drain() {
            task.abort();
        }
        for (_, waiter) in std::mem::take(&mut state.pending) {
            let _ = waiter.send(Err(AppendError::Stopped));
        }
    }

    // Bump the ABA counter and store the new role. Caller holds the
    // consensus lock.
    fn set_role(&self, state: &mut Consensus, role: Role) {
        state.role = role;
        let prev = self.role_sig.load(Ordering::Relaxed);
        let next = ((prev >> 32).wrapping_add(1) << 32) | role as u32 as u64;
        self.role_sig.store(next, Ordering::Release);
    }

    fn persist_hard_state(&self, state: &Consensus) {
        self.sm.save_hard_state(&HardState {
            current_term: state.term,
            voted_for: state.voted_for.as_ref().map(Into::into),
            committed_log_id: state.commit_index,
        });
    }

    fn persist_membership(&self, state: &Consensus) {
        self.sm.save_membership(&Membership {
            voters: state.voters.iter().map(Into::into).collect(),
            learners: state.learners.iter().map(Into::into).collect(),
        });
    }

    /// Append a payload to the replicated log and await its local apply.
    /// Within one leader term, callers' futures fulfill in call order.
    /// A `Timeout` resolution does not retract the entry.
    pub async fn append_async(&self, payload: Vec<u8>, timeout: Duration) -> AppendResult {
        let rx = {
            let mut state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return Err(AppendError::LeaderChanged(state.leader_hint.clone()));
            }
            let index = state.wal.last_index() + 1;
            let entry = LogEntry {
                term: state.term,
                index,
                kind: EntryKind::Data as i32,
                payload,
            };
            state
                .wal
                .append(&[entry])
                .map_err(|err| AppendError::Storage(err.to_string()))?;

            let (tx, rx) = oneshot::channel();
            state.pending.insert(index, tx);
            // A single-voter group commits immediately.
            self.advance_commit(&mut state);
            rx
        };
        self.replicate.notify_waiters();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppendError::Stopped),
            Err(_) => Err(AppendError::Timeout),
        }
    }

    /// Propose a membership change. One change may be in flight at a
    /// time; the future resolves when the change commits.
    pub async fn propose_config_change(
        self: &Arc<Self>,
        kind: EntryKind,
        peer: HostAddr,
        timeout: Duration,
    ) -> AppendResult {
        debug_assert!(matches!(
            kind,
            EntryKind::AddPeer | EntryKind::RemovePeer | EntryKind::PromoteLearner
        ));
        let rx = {
            let mut state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return Err(AppendError::LeaderChanged(state.leader_hint.clone()));
            }
            if state.change_in_flight.is_some() {
                return Err(AppendError::ChangeInFlight);
            }

            // The entry carries the full post-change configuration. A new
            // replica joins as a learner and is promoted once caught up.
            let mut voters = state.voters.clone();
            let mut learners = state.learners.clone();
            match kind {
                EntryKind::AddPeer => {
                    if !voters.contains(&peer) && !learners.contains(&peer) {
                        learners.push(peer.clone());
                    }
                }
                EntryKind::PromoteLearner => {
                    learners.retain(|l| *l != peer);
                    if !voters.contains(&peer) {
                        voters.push(peer.clone());
                    }
                }
                EntryKind::RemovePeer => {
                    voters.retain(|v| *v != peer);
                    learners.retain(|l| *l != peer);
                }
                _ => (),
            }

            let index = state.wal.last_index() + 1;
            let entry = LogEntry {
                term: state.term,
                index,
                kind: kind as i32,
                payload: ConfigChange {
                    peer: Some((&peer).into()),
                    voters: voters.iter().map(Into::into).collect(),
                    learners: learners.iter().map(Into::into).collect(),
                }
                .encode_to_vec(),
            };
            state
                .wal
                .append(&[entry])
                .map_err(|err| AppendError::Storage(err.to_string()))?;
            state.change_in_flight = Some(index);

            // An added peer starts replicating right away, as a learner
            // until the entry commits and the config applies.
            if kind == EntryKind::AddPeer && state.role == Role::Leader {
                let next = state.wal.last_index() + 1;
                state.next_index.insert(peer.clone(), next);
                state.match_index.insert(peer.clone(), 0);
                let task = spawn_peer_task(self, peer.clone(), state.term);
                state.peer_tasks.insert(peer, task);
            }

            let (tx, rx) = oneshot::channel();
            state.pending.insert(index, tx);
            self.advance_commit(&mut state);
            rx
        };
        self.replicate.notify_waiters();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppendError::Stopped),
            Err(_) => Err(AppendError::Timeout),
        }
    }

    /// Whether this leader's lease is fresh: a majority of voters acked
    /// within the base election timeout, so no other leader can have been
    /// elected since. Strong reads require this.
    pub fn leadership_lease_valid(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.role != Role::Leader {
            return false;
        }
        let quorum = state.voters.len() / 2 + 1;
        let fresh = Instant::now() - self.config.election_timeout;
        let mut count = 1; // Self.
        for voter in &state.voters {
            if *voter == self.local {
                continue;
            }
            if state.last_ack.get(voter).is_some_and(|at| *at >= fresh) {
                count += 1;
            }
        }
        count >= quorum
    }

    /// Hand leadership to `target`: once it is caught up, tell it to
    /// start an election immediately.
    pub async fn transfer_leader(&self, target: HostAddr) -> Result<(), AppendError> {
        let req = {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return Err(AppendError::LeaderChanged(state.leader_hint.clone()));
            }
            if !state.voters.contains(&target) {
                return Err(AppendError::LeaderChanged(Some(self.local.clone())));
            }
            AppendLogRequest {
                space_id: self.space_id,
                part_id: self.part_id,
                term: state.term,
                leader: Some((&self.local).into()),
                prev_log_index: state.wal.last_index(),
                prev_log_term: state.wal.term_of(state.wal.last_index()).unwrap_or(0),
                entries: Vec::new(),
                leader_commit: state.commit_index,
                timeout_now: true,
            }
        };
        self.wait_for_catch_up(target.clone(), self.config.rpc_timeout * 4)
            .await?;
        let _ = self.network.append_log(&target, req).await;
        Ok(())
    }

    /// Block until `target`'s match index reaches the current log end.
    pub async fn wait_for_catch_up(
        &self,
        target: HostAddr,
        timeout: Duration,
    ) -> Result<(), AppendError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.role != Role::Leader {
                    return Err(AppendError::LeaderChanged(state.leader_hint.clone()));
                }
                let caught_up = state
                    .match_index
                    .get(&target)
                    .is_some_and(|m| *m >= state.wal.last_index());
                if caught_up {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(AppendError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    // ---- Incoming RPCs ----

    pub fn process_ask_for_vote(&self, req: AskForVoteRequest) -> AskForVoteResponse {
        let mut state = self.state.lock().unwrap();

        if req.term < state.term {
            return AskForVoteResponse {
                term: state.term,
                granted: false,
            };
        }
        if req.term > state.term {
            self.step_down(&mut state, req.term, None);
        }

        let candidate: Option<HostAddr> = req.candidate.as_ref().map(Into::into);
        let last_index = state.wal.last_index();
        let last_term = state
            .wal
            .term_of(last_index)
            .unwrap_or(state.snapshot_meta.last_included_term);

        // Grant iff we haven't voted for someone else this term and the
        // candidate's log is at least as up to date as ours.
        let may_vote =
            state.voted_for.is_none() || state.voted_for == candidate;
        let up_to_date = (req.last_log_term, req.last_log_index) >= (last_term, last_index);
        let granted = may_vote && up_to_date && candidate.is_some();

        if granted {
            state.voted_for = candidate;
            state.election_deadline = Instant::now() + randomized(self.config.election_timeout);
            self.persist_hard_state(&state);
        }
        AskForVoteResponse {
            term: state.term,
            granted,
        }
    }

    pub fn process_append_log(&self, req: AppendLogRequest) -> AppendLogResponse {
        let mut state = self.state.lock().unwrap();

        if req.term < state.term {
            return AppendLogResponse {
                term: state.term,
                success: false,
                conflict_hint: state.wal.last_index(),
            };
        }
        let leader: Option<HostAddr> = req.leader.as_ref().map(Into::into);
        if req.term > state.term || state.role == Role::Candidate {
            self.step_down(&mut state, req.term, leader.clone());
        }
        state.leader_hint = leader;
        state.election_deadline = Instant::now() + randomized(self.config.election_timeout);

        // Consistency check at prev_log_index.
        let first = state.wal.first_index();
        let last = state.wal.last_index();
        if req.prev_log_index > last {
            return AppendLogResponse {
                term: state.term,
                success: false,
                conflict_hint: last,
            };
        }
        if req.prev_log_index + 1 >= first && req.prev_log_index > 0 {
            let local_term = if req.prev_log_index + 1 == first {
                state.snapshot_meta.last_included_term
            } else {
                state.wal.term_of(req.prev_log_index).unwrap_or(0)
            };
            if req.prev_log_index + 1 != first && local_term != req.prev_log_term {
                return AppendLogResponse {
                    term: state.term,
                    success: false,
                    conflict_hint: req.prev_log_index.saturating_sub(1),
                };
            }
        }

        // Truncate any conflicting suffix, then append the new tail.
        let mut to_append = Vec::new();
        for entry in req.entries {
            if entry.index < first {
                continue; // Covered by our snapshot.
            }
            match state.wal.term_of(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if state.wal.truncate_from(entry.index).is_err() {
                        return AppendLogResponse {
                            term: state.term,
                            success: false,
                            conflict_hint: state.wal.last_index(),
                        };
                    }
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }
        if !to_append.is_empty() {
            if let Err(err) = state.wal.append(&to_append) {
                tracing::error!(%err, "wal append failed");
                return AppendLogResponse {
                    term: state.term,
                    success: false,
                    conflict_hint: state.wal.last_index(),
                };
            }
        }

        // Advance commit to what the leader says is safe.
        let last = state.wal.last_index();
        if req.leader_commit > state.commit_index {
            state.commit_index = req.leader_commit.min(last);
            self.persist_hard_state(&state);
            let commit = state.commit_index;
            self.enqueue_apply(&mut state, commit);
        }

        if req.timeout_now && state.role == Role::Follower {
            state.election_deadline = Instant::now();
        }

        AppendLogResponse {
            term: state.term,
            success: true,
            conflict_hint: last,
        }
    }

    pub fn process_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut state = self.state.lock().unwrap();

        if req.term < state.term {
            return InstallSnapshotResponse {
                term: state.term,
                success: false,
            };
        }
        if req.term > state.term || state.role == Role::Candidate {
            let leader = req.leader.as_ref().map(Into::into);
            self.step_down(&mut state, req.term, leader);
        }
        state.election_deadline = Instant::now() + randomized(self.config.election_timeout);

        let Some(chunk) = req.chunk else {
            return InstallSnapshotResponse {
                term: state.term,
                success: false,
            };
        };
        state
            .snapshot_staging
            .extend(chunk.rows.into_iter().map(|kv| (kv.key, kv.value)));
        if !chunk.done {
            return InstallSnapshotResponse {
                term: state.term,
                success: true,
            };
        }

        let rows = std::mem::take(&mut state.snapshot_staging);
        if req.last_included_index <= self.last_applied.load(Ordering::Acquire) {
            // Stale snapshot; nothing to do.
            return InstallSnapshotResponse {
                term: state.term,
                success: true,
            };
        }
        let meta = SnapshotMeta {
            last_included_index: req.last_included_index,
            last_included_term: req.last_included_term,
        };
        if !self.sm.install_snapshot(rows, &meta) {
            return InstallSnapshotResponse {
                term: state.term,
                success: false,
            };
        }
        state.snapshot_meta = meta;
        if let Err(err) = state.wal.reset(req.last_included_index + 1) {
            tracing::error!(%err, "wal reset after snapshot install failed");
        }
        state.commit_index = req.last_included_index;
        state.enqueued = req.last_included_index;
        self.last_applied
            .store(req.last_included_index, Ordering::Release);
        self.persist_hard_state(&state);

        tracing::info!(
            space = self.space_id,
            part = self.part_id,
            last_included = req.last_included_index,
            "installed snapshot"
        );
        InstallSnapshotResponse {
            term: state.term,
            success: true,
        }
    }

    // ---- Role transitions ----

    fn step_down(&self, state: &mut Consensus, term: Term, leader: Option<HostAddr>) {
        let was_leader = state.role == Role::Leader;
        let old_term = state.term;

        state.term = term;
        state.voted_for = None;
        state.leader_hint = leader;
        if state.role != Role::Learner {
            self.set_role(state, Role::Follower);
        }
        state.election_deadline = Instant::now() + randomized(self.config.election_timeout);
        self.persist_hard_state(state);

        if was_leader {
            for (_, task) in state.peer_tasks.drain() {
                task.abort();
            }
            state.next_index.clear();
            state.match_index.clear();
            state.last_ack.clear();
            state.change_in_flight = None;

            let hint = state.leader_hint.clone();
            for (_, waiter) in std::mem::take(&mut state.pending) {
                let _ = waiter.send(Err(AppendError::LeaderChanged(hint.clone())));
            }
            self.sm.on_lost_leadership(old_term);
            tracing::info!(
                space = self.space_id,
                part = self.part_id,
                term,
                "stepped down"
            );
        }
    }

    fn become_leader(self: &Arc<Self>, state: &mut Consensus) {
        self.set_role(state, Role::Leader);
        state.leader_hint = Some(self.local.clone());

        let next = state.wal.last_index() + 1;
        let peers: Vec<HostAddr> = state
            .voters
            .iter()
            .chain(state.learners.iter())
            .filter(|peer| **peer != self.local)
            .cloned()
            .collect();
        for peer in &peers {
            state.next_index.insert(peer.clone(), next);
            state.match_index.insert(peer.clone(), 0);
        }
        let term = state.term;
        for peer in peers {
            let task = spawn_peer_task(self, peer.clone(), term);
            state.peer_tasks.insert(peer, task);
        }

        // Commit entries of prior terms by committing one of our own.
        let noop = LogEntry {
            term: state.term,
            index: next,
            kind: EntryKind::Noop as i32,
            payload: Vec::new(),
        };
        if let Err(err) = state.wal.append(&[noop]) {
            tracing::error!(%err, "wal append of noop failed");
        }
        self.advance_commit(state);

        tracing::info!(
            space = self.space_id,
            part = self.part_id,
            term = state.term,
            "elected leader"
        );
        self.sm.on_elected(state.term);
    }

    async fn start_election(self: &Arc<Self>) {
        let (term, last_index, last_term, peers, quorum) = {
            let mut state = self.state.lock().unwrap();
            if state.role == Role::Leader || state.role == Role::Learner {
                return;
            }
            state.term += 1;
            self.set_role(&mut state, Role::Candidate);
            state.voted_for = Some(self.local.clone());
            state.leader_hint = None;
            state.election_deadline = Instant::now() + randomized(self.config.election_timeout);
            self.persist_hard_state(&state);

            let last_index = state.wal.last_index();
            let last_term = state
                .wal
                .term_of(last_index)
                .unwrap_or(state.snapshot_meta.last_included_term);
            let peers: Vec<HostAddr> = state
                .voters
                .iter()
                .filter(|peer| **peer != self.local)
                .cloned()
                .collect();
            let quorum = state.voters.len() / 2 + 1;
            (state.term, last_index, last_term, peers, quorum)
        };

        tracing::debug!(
            space = self.space_id,
            part = self.part_id,
            term,
            "starting election"
        );

        let mut granted = 1usize; // Own vote.
        if granted >= quorum {
            let mut state = self.state.lock().unwrap();
            if state.role == Role::Candidate && state.term == term {
                self.become_leader(&mut state);
            }
            return;
        }

        let req = AskForVoteRequest {
            space_id: self.space_id,
            part_id: self.part_id,
            term,
            candidate: Some((&self.local).into()),
            last_log_index: last_index,
            last_log_term: last_term,
        };

        let mut votes = futures::stream::FuturesUnordered::new();
        for peer in peers {
            let network = self.network.clone();
            let req = req.clone();
            let rpc_timeout = self.config.rpc_timeout;
            votes.push(async move {
                tokio::time::timeout(rpc_timeout, network.ask_for_vote(&peer, req)).await
            });
        }

        use futures::StreamExt;
        while let Some(outcome) = votes.next().await {
            let response = match outcome {
                Ok(Ok(response)) => response,
                _ => continue,
            };
            if response.term > term {
                let mut state = self.state.lock().unwrap();
                if response.term > state.term {
                    self.step_down(&mut state, response.term, None);
                }
                return;
            }
            if !response.granted {
                continue;
            }
            granted += 1;
            if granted >= quorum {
                let mut state = self.state.lock().unwrap();
                // The world may have moved on while votes were in flight.
                if state.role == Role::Candidate && state.term == term {
                    self.become_leader(&mut state);
                }
                return;
            }
        }
    }

    // ---- Commit & apply ----

    // Leader: advance commit_index to the highest N in the current term
    // acknowledged by a majority of voters. Caller holds the lock.
    fn advance_commit(&self, state: &mut Consensus) {
        if state.role != Role::Leader {
            return;
        }
        let quorum = state.voters.len() / 2 + 1;
        let last = state.wal.last_index();
        let mut target = state.commit_index;

        for n in (state.commit_index + 1)..=last {
            if state.wal.term_of(n) != Some(state.term) {
                continue;
            }
            let mut acks = if state.voters.contains(&self.local) { 1 } else { 0 };
            for voter in &state.voters {
                if *voter == self.local {
                    continue;
                }
                if state.match_index.get(voter).is_some_and(|m| *m >= n) {
                    acks += 1;
                }
            }
            if acks >= quorum {
                target = n;
            }
        }

        if target > state.commit_index {
            state.commit_index = target;
            self.persist_hard_state(state);
            self.enqueue_apply(state, target);
        }
    }

    // Hand committed-but-unenqueued entries to the apply task.
    fn enqueue_apply(&self, state: &mut Consensus, upto: LogIndex) {
        if upto <= state.enqueued {
            return;
        }
        let first = state.enqueued + 1;
        let entries = state
            .wal
            .entries_from(first, (upto - state.enqueued) as usize);
        if entries.is_empty() {
            return;
        }
        state.enqueued = entries.last().expect("non-empty").index;
        let _ = self.apply_tx.send(ApplyBatch {
            first_index: first,
            entries,
        });
    }

    // Runs on the apply task: fold one committed batch into the state
    // machine and resolve waiting callers.
    fn apply_batch(self: &Arc<Self>, batch: ApplyBatch) {
        let mut data = Vec::new();
        let mut data_first = 0;
        let mut flush = |first: LogIndex, payloads: &mut Vec<Vec<u8>>, sm: &dyn StateMachine| {
            if payloads.is_empty() {
                return;
            }
            if !sm.commit_logs(first, std::mem::take(payloads)) {
                tracing::error!(first, "state machine rejected commit batch");
            }
        };

        for entry in &batch.entries {
            match EntryKind::try_from(entry.kind).unwrap_or(EntryKind::Noop) {
                EntryKind::Data => {
                    if data.is_empty() {
                        data_first = entry.index;
                    }
                    data.push(entry.payload.clone());
                }
                EntryKind::AddPeer | EntryKind::RemovePeer | EntryKind::PromoteLearner => {
                    flush(data_first, &mut data, self.sm.as_ref());
                    self.apply_config_change(entry);
                }
                EntryKind::Noop | EntryKind::SnapshotMarker => {
                    flush(data_first, &mut data, self.sm.as_ref());
                }
            }
        }
        flush(data_first, &mut data, self.sm.as_ref());

        let applied = batch.entries.last().expect("non-empty batch").index;
        self.last_applied.store(applied, Ordering::Release);

        // Resolve ordered waiters, then consider a snapshot.
        let mut state = self.state.lock().unwrap();
        let not_yet = state.pending.split_off(&(applied + 1));
        let done = std::mem::replace(&mut state.pending, not_yet);
        for (index, waiter) in done {
            let _ = waiter.send(Ok(index));
        }
        self.maybe_snapshot(&mut state, applied);
    }

    fn apply_config_change(self: &Arc<Self>, entry: &LogEntry) {
        let Ok(change) = ConfigChange::decode(entry.payload.as_slice()) else {
            tracing::error!(index = entry.index, "undecodable membership change");
            return;
        };
        let Some(peer) = change.peer.as_ref().map(HostAddr::from) else {
            return;
        };
        let kind = EntryKind::try_from(entry.kind).unwrap_or(EntryKind::Noop);

        let mut state = self.state.lock().unwrap();
        state.voters = change.voters.iter().map(Into::into).collect();
        state.learners = change.learners.iter().map(Into::into).collect();

        // A learner that just became a voter starts electing; a leader
        // tending a removed peer stops replicating to it.
        if state.role == Role::Learner && state.voters.contains(&self.local) {
            self.set_role(&mut state, Role::Follower);
            state.election_deadline = Instant::now() + randomized(self.config.election_timeout);
        }
        if state.role == Role::Leader && kind == EntryKind::RemovePeer {
            if let Some(task) = state.peer_tasks.remove(&peer) {
                task.abort();
            }
            state.next_index.remove(&peer);
            state.match_index.remove(&peer);
        }
        state.change_in_flight = None;
        self.persist_membership(&state);
        tracing::info!(
            space = self.space_id,
            part = self.part_id,
            ?kind,
            peer = %peer,
            "membership change committed"
        );

        // A leader removed by the change steps down once it commits.
        if kind == EntryKind::RemovePeer && peer == self.local && state.role == Role::Leader {
            let term = state.term;
            self.step_down(&mut state, term, None);
        }
    }

    // Compact the local log once the applied prefix grows past the
    // threshold. Caller holds the lock.
    fn maybe_snapshot(&self, state: &mut Consensus, applied: LogIndex) {
        let live = state.wal.last_index().saturating_sub(state.wal.first_index()) + 1;
        if live <= self.config.snapshot_logs_threshold {
            return;
        }
        let term = state
            .wal
            .term_of(applied)
            .unwrap_or(state.snapshot_meta.last_included_term);
        let meta = SnapshotMeta {
            last_included_index: applied,
            last_included_term: term,
        };
        self.sm.save_snapshot_meta(&meta);
        state.snapshot_meta = meta;
        if let Err(err) = state.wal.truncate_prefix(applied + 1) {
            tracing::warn!(%err, "log compaction failed");
        }
        tracing::debug!(
            space = self.space_id,
            part = self.part_id,
            applied,
            "compacted log prefix"
        );
    }

    // ---- Leader-side replication (runs on per-peer tasks) ----

    // One replication round toward `peer`. Returns false when the task
    // should exit (no longer leader at `term`).
    async fn replicate_once(self: &Arc<Self>, peer: &HostAddr, term: Term) -> bool {
        enum Step {
            Entries(AppendLogRequest, LogIndex),
            Snapshot(SnapshotMeta),
            Exit,
        }

        let step = {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader || state.term != term {
                Step::Exit
            } else {
                let next = state.next_index.get(peer).copied().unwrap_or(1);
                if next < state.wal.first_index() {
                    Step::Snapshot(state.snapshot_meta.clone())
                } else {
                    let entries = state
                        .wal
                        .entries_from(next, self.config.max_append_entries);
                    let sent_through = entries.last().map_or(next - 1, |e| e.index);
                    let prev = next - 1;
                    let prev_term = if prev == 0 {
                        0
                    } else if prev + 1 == state.wal.first_index() {
                        state.snapshot_meta.last_included_term
                    } else {
                        state.wal.term_of(prev).unwrap_or(0)
                    };
                    Step::Entries(
                        AppendLogRequest {
                            space_id: self.space_id,
                            part_id: self.part_id,
                            term,
                            leader: Some((&self.local).into()),
                            prev_log_index: prev,
                            prev_log_term: prev_term,
                            entries,
                            leader_commit: state.commit_index,
                            timeout_now: false,
                        },
                        sent_through,
                    )
                }
            }
        };

        match step {
            Step::Exit => false,
            Step::Snapshot(meta) => self.send_snapshot(peer, term, meta).await,
            Step::Entries(req, sent_through) => {
                let outcome =
                    tokio::time::timeout(self.config.rpc_timeout, self.network.append_log(peer, req))
                        .await;
                let response = match outcome {
                    Ok(Ok(response)) => response,
                    Ok(Err(NetworkError::Unreachable(_))) | Err(_) => return true,
                    Ok(Err(_)) => return true,
                };

                let mut state = self.state.lock().unwrap();
                if state.role != Role::Leader || state.term != term {
                    return false;
                }
                if response.term > state.term {
                    self.step_down(&mut state, response.term, None);
                    return false;
                }
                state.last_ack.insert(peer.clone(), Instant::now());
                if response.success {
                    state.match_index.insert(peer.clone(), sent_through);
                    state.next_index.insert(peer.clone(), sent_through + 1);
                    self.advance_commit(&mut state);
                } else {
                    // Skip back using the follower's hint.
                    let next = state.next_index.get(peer).copied().unwrap_or(1);
                    let fallback = next.saturating_sub(1).max(1);
                    state
                        .next_index
                        .insert(peer.clone(), fallback.min(response.conflict_hint + 1).max(1));
                }
                true
            }
        }
    }

    async fn send_snapshot(self: &Arc<Self>, peer: &HostAddr, term: Term, meta: SnapshotMeta) -> bool {
        tracing::info!(
            space = self.space_id,
            part = self.part_id,
            peer = %peer,
            last_included = meta.last_included_index,
            "follower is behind the log start; sending snapshot"
        );
        let mut rows = self.sm.snapshot_rows();

        loop {
            let mut chunk = SnapshotChunk {
                rows: Vec::with_capacity(self.config.snapshot_chunk_rows),
                done: false,
            };
            for _ in 0..self.config.snapshot_chunk_rows {
                match rows.next() {
                    Some((key, value)) => chunk.rows.push(KvPair { key, value }),
                    None => {
                        chunk.done = true;
                        break;
                    }
                }
            }
            let done = chunk.done;
            let req = InstallSnapshotRequest {
                space_id: self.space_id,
                part_id: self.part_id,
                term,
                leader: Some((&self.local).into()),
                last_included_index: meta.last_included_index,
                last_included_term: meta.last_included_term,
                chunk: Some(chunk),
            };

            let outcome =
                tokio::time::timeout(self.config.rpc_timeout, self.network.install_snapshot(peer, req))
                    .await;
            let response = match outcome {
                Ok(Ok(response)) => response,
                _ => return true, // Retry the whole snapshot next round.
            };
            if response.term > term {
                let mut state = self.state.lock().unwrap();
                if response.term > state.term {
                    self.step_down(&mut state, response.term, None);
                }
                return false;
            }
            if !response.success {
                return true;
            }
            if done {
                break;
            }
        }

        let mut state = self.state.lock().unwrap();
        if state.role != Role::Leader || state.term != term {
            return false;
        }
        state
            .match_index
            .insert(peer.clone(), meta.last_included_index);
        state
            .next_index
            .insert(peer.clone(), meta.last_included_index + 1);
        self.advance_commit(&mut state);
        true
    }

    // Whether `peer` has unsent entries, so its task should run another
    // round without waiting for the heartbeat timer.
    fn peer_has_backlog(&self, peer: &HostAddr, term: Term) -> bool {
        let state = self.state.lock().unwrap();
        state.role == Role::Leader
            && state.term == term
            && state
                .next_index
                .get(peer)
                .is_some_and(|next| *next <= state.wal.last_index())
    }
}

fn randomized(base: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..base.as_millis().max(1) as u64);
    base + Duration::from_millis(extra)
}

fn spawn_tick_loop(group: &Arc<RaftGroup>) {
    let weak = Arc::downgrade(group);
    let shutdown = group.shutdown.clone();
    tokio::spawn(async move {
        let tick = Duration::from_millis(20);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(tick) => (),
            }
            let Some(group) = weak.upgrade() else { return };

            let election_due = {
                let state = group.state.lock().unwrap();
                matches!(state.role, Role::Follower | Role::Candidate)
                    && Instant::now() >= state.election_deadline
            };
            if election_due {
                group.start_election().await;
            }
        }
    });
}

fn spawn_apply_loop(group: &Arc<RaftGroup>, mut rx: mpsc::UnboundedReceiver<ApplyBatch>) {
    let weak = Arc::downgrade(group);
    let shutdown = group.shutdown.clone();
    tokio::spawn(async move {
        loop {
            let batch = tokio::select! {
                () = shutdown.cancelled() => return,
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => return,
                },
            };
            let Some(group) = weak.upgrade() else { return };
            // Blocking engine work off the async threads.
            let _ = tokio::task::block_in_place(|| {
                group.apply_batch(batch);
            });
        }
    });
}

fn spawn_peer_task(group: &Arc<RaftGroup>, peer: HostAddr, term: Term) -> tokio::task::JoinHandle<()> {
    let weak = Arc::downgrade(group);
    let shutdown = group.shutdown.clone();
    tokio::spawn(async move {
        loop {
            let Some(group) = weak.upgrade() else { return };
            if !group.replicate_once(&peer, term).await {
                return;
            }
            if group.peer_has_backlog(&peer, term) {
                continue;
            }
            let interval = group.config.heartbeat_interval;
            let notify = group.replicate.clone();
            drop(group);
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = notify.notified() => (),
                () = tokio::time::sleep(interval) => (),
            }
        }
    })
}
