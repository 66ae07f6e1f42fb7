//! Multi-replica behavior of the replication group, over the in-process
//! transport: elections, quorum commit, ordered appends, failover,
//! membership change, and snapshot catch-up.

use models::HostAddr;
use proto_storage::raft::{EntryKind, HardState, Membership, SnapshotMeta};
use raft::{
    AppendError, GroupConfig, LocalNetwork, RaftGroup, Role, StateMachine, Wal,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A state machine which records applied payloads as rows, with the
/// persistence hooks held in memory.
#[derive(Default)]
struct MemSm {
    rows: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    applied_index: AtomicU64,
    hard: Mutex<Option<HardState>>,
    snapshot: Mutex<Option<SnapshotMeta>>,
    membership: Mutex<Option<Membership>>,
    elected: AtomicU64,
    lost: AtomicU64,
}

impl StateMachine for MemSm {
    fn commit_logs(&self, first_index: u64, payloads: Vec<Vec<u8>>) -> bool {
        let mut rows = self.rows.lock().unwrap();
        for (i, payload) in payloads.iter().enumerate() {
            let index = first_index + i as u64;
            rows.insert(payload.clone(), index.to_be_bytes().to_vec());
            self.applied_index.store(index, Ordering::SeqCst);
        }
        true
    }

    fn on_elected(&self, _term: u64) {
        self.elected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_lost_leadership(&self, _term: u64) {
        self.lost.fetch_add(1, Ordering::SeqCst);
    }

    fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }

    fn load_hard_state(&self) -> Option<HardState> {
        self.hard.lock().unwrap().clone()
    }

    fn save_hard_state(&self, hs: &HardState) {
        *self.hard.lock().unwrap() = Some(hs.clone());
    }

    fn load_snapshot_meta(&self) -> Option<SnapshotMeta> {
        self.snapshot.lock().unwrap().clone()
    }

    fn save_snapshot_meta(&self, meta: &SnapshotMeta) {
        *self.snapshot.lock().unwrap() = Some(meta.clone());
    }

    fn load_membership(&self) -> Option<Membership> {
        self.membership.lock().unwrap().clone()
    }

    fn save_membership(&self, membership: &Membership) {
        *self.membership.lock().unwrap() = Some(membership.clone());
    }

    fn snapshot_rows(&self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send> {
        let rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(rows.into_iter())
    }

    fn install_snapshot(&self, rows: Vec<(Vec<u8>, Vec<u8>)>, meta: &SnapshotMeta) -> bool {
        *self.rows.lock().unwrap() = rows.into_iter().collect();
        self.applied_index
            .store(meta.last_included_index, Ordering::SeqCst);
        true
    }
}

struct Cluster {
    network: Arc<LocalNetwork>,
    replicas: Vec<(HostAddr, Arc<RaftGroup>, Arc<MemSm>)>,
}

fn test_config() -> GroupConfig {
    GroupConfig {
        election_timeout: Duration::from_millis(150),
        heartbeat_interval: Duration::from_millis(40),
        rpc_timeout: Duration::from_millis(100),
        snapshot_logs_threshold: 10_000,
        max_append_entries: 64,
        snapshot_chunk_rows: 16,
    }
}

fn host(i: usize) -> HostAddr {
    HostAddr::new(&format!("n{i}"), 9780)
}

impl Cluster {
    fn start(voters: usize, config: GroupConfig) -> Cluster {
        let network = LocalNetwork::new();
        let all: Vec<HostAddr> = (1..=voters).map(host).collect();

        let replicas = all
            .iter()
            .map(|local| {
                let sm = Arc::new(MemSm::default());
                let group = RaftGroup::start(
                    1,
                    1,
                    local.clone(),
                    all.clone(),
                    Vec::new(),
                    Wal::open(None, 1).unwrap(),
                    sm.clone(),
                    network.clone(),
                    config.clone(),
                );
                network.register(local.clone(), &group);
                (local.clone(), group, sm)
            })
            .collect();

        Cluster { network, replicas }
    }

    async fn wait_for_leader(&self) -> (HostAddr, Arc<RaftGroup>, Arc<MemSm>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let leaders: Vec<_> = self
                .replicas
                .iter()
                .filter(|(_, group, _)| group.role() == Role::Leader)
                .collect();
            if leaders.len() == 1 {
                let (host, group, sm) = leaders[0];
                return (host.clone(), group.clone(), sm.clone());
            }
            assert!(Instant::now() < deadline, "no single leader emerged");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_converged(&self, live: &[HostAddr]) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let states: Vec<_> = self
                .replicas
                .iter()
                .filter(|(host, _, _)| live.contains(host))
                .map(|(_, _, sm)| sm.rows.lock().unwrap().clone())
                .collect();
            if states.windows(2).all(|w| w[0] == w[1]) {
                return;
            }
            assert!(Instant::now() < deadline, "replicas did not converge");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_replica_appends() {
    let cluster = Cluster::start(1, test_config());
    let (_, leader, sm) = cluster.wait_for_leader().await;

    let index = leader
        .append_async(b"hello".to_vec(), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(index > 0);
    assert!(sm.rows.lock().unwrap().contains_key(b"hello".as_slice()));
    assert_eq!(sm.elected.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_replicas_commit_and_converge() {
    let cluster = Cluster::start(3, test_config());
    let (_, leader, _) = cluster.wait_for_leader().await;

    for i in 0..32 {
        leader
            .append_async(format!("key-{i}").into_bytes(), Duration::from_secs(1))
            .await
            .unwrap();
    }

    let all: Vec<_> = cluster.replicas.iter().map(|(h, _, _)| h.clone()).collect();
    cluster.wait_converged(&all).await;

    let rows = cluster.replicas[0].2.rows.lock().unwrap().clone();
    assert_eq!(rows.len(), 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_appends_fulfill_in_call_order() {
    let cluster = Cluster::start(3, test_config());
    let (_, leader, _) = cluster.wait_for_leader().await;

    let mut futures = Vec::new();
    for i in 0..16 {
        // Issue without awaiting: indices must be assigned in call order.
        futures.push(leader.append_async(format!("ordered-{i}").into_bytes(), Duration::from_secs(2)));
    }
    let results = futures::future::join_all(futures).await;

    let indices: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
    let mut sorted = indices.clone();
    sorted.sort();
    assert_eq!(indices, sorted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_rejects_append_with_hint() {
    let cluster = Cluster::start(3, test_config());
    let (leader_host, _, _) = cluster.wait_for_leader().await;

    let (_, follower, _) = cluster
        .replicas
        .iter()
        .find(|(host, _, _)| *host != leader_host)
        .unwrap();

    // The hint arrives with the leader's first heartbeat.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let err = follower
            .append_async(b"nope".to_vec(), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            AppendError::LeaderChanged(Some(hint)) => {
                assert_eq!(hint, leader_host);
                return;
            }
            AppendError::LeaderChanged(None) => {
                assert!(Instant::now() < deadline, "hint never learned");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_failover_preserves_committed_entries() {
    let cluster = Cluster::start(3, test_config());
    let (old_leader, leader, _) = cluster.wait_for_leader().await;

    for i in 0..10 {
        leader
            .append_async(format!("pre-{i}").into_bytes(), Duration::from_secs(1))
            .await
            .unwrap();
    }

    // Kill the leader.
    cluster.network.sever(&old_leader);

    // A new leader emerges among the survivors and accepts writes.
    let deadline = Instant::now() + Duration::from_secs(5);
    let new_leader = loop {
        let survivor = cluster
            .replicas
            .iter()
            .find(|(host, group, _)| *host != old_leader && group.role() == Role::Leader);
        if let Some((_, group, _)) = survivor {
            break group.clone();
        }
        assert!(Instant::now() < deadline, "no failover leader emerged");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    for i in 0..10 {
        new_leader
            .append_async(format!("post-{i}").into_bytes(), Duration::from_secs(2))
            .await
            .unwrap();
    }

    let live: Vec<_> = cluster
        .replicas
        .iter()
        .map(|(h, _, _)| h.clone())
        .filter(|h| *h != old_leader)
        .collect();
    cluster.wait_converged(&live).await;

    let survivor_sm = &cluster
        .replicas
        .iter()
        .find(|(host, _, _)| *host != old_leader)
        .unwrap()
        .2;
    let rows = survivor_sm.rows.lock().unwrap();
    for i in 0..10 {
        assert!(rows.contains_key(format!("pre-{i}").as_bytes()), "lost pre-{i}");
        assert!(rows.contains_key(format!("post-{i}").as_bytes()), "lost post-{i}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_healed_old_leader_rejoins_as_follower() {
    let cluster = Cluster::start(3, test_config());
    let (old_leader_host, old_leader, _) = cluster.wait_for_leader().await;

    cluster.network.sever(&old_leader_host);

    // Wait for a successor.
    let deadline = Instant::now() + Duration::from_secs(5);
    let successor = loop {
        let found = cluster
            .replicas
            .iter()
            .find(|(host, group, _)| *host != old_leader_host && group.role() == Role::Leader);
        if let Some((_, group, _)) = found {
            break group.clone();
        }
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    successor
        .append_async(b"after-failover".to_vec(), Duration::from_secs(2))
        .await
        .unwrap();

    cluster.network.heal(&old_leader_host);

    // The deposed leader observes the higher term and steps down.
    let deadline = Instant::now() + Duration::from_secs(5);
    while old_leader.role() == Role::Leader {
        assert!(Instant::now() < deadline, "old leader never stepped down");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let all: Vec<_> = cluster.replicas.iter().map(|(h, _, _)| h.clone()).collect();
    cluster.wait_converged(&all).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lagging_follower_catches_up_by_snapshot() {
    let mut config = test_config();
    config.snapshot_logs_threshold = 8;
    let cluster = Cluster::start(3, config);
    let (leader_host, leader, _) = cluster.wait_for_leader().await;

    let lagging = cluster
        .replicas
        .iter()
        .find(|(host, _, _)| *host != leader_host)
        .unwrap()
        .0
        .clone();
    cluster.network.sever(&lagging);

    // Enough appends that the leader compacts past the follower's tail.
    for i in 0..64 {
        leader
            .append_async(format!("bulk-{i}").into_bytes(), Duration::from_secs(2))
            .await
            .unwrap();
    }

    cluster.network.heal(&lagging);

    let all: Vec<_> = cluster.replicas.iter().map(|(h, _, _)| h.clone()).collect();
    cluster.wait_converged(&all).await;

    let lagging_sm = &cluster
        .replicas
        .iter()
        .find(|(host, _, _)| *host == lagging)
        .unwrap()
        .2;
    assert_eq!(lagging_sm.rows.lock().unwrap().len(), 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_peer_then_promote_learner() {
    let cluster = Cluster::start(2, test_config());
    let (_, leader, _) = cluster.wait_for_leader().await;

    leader
        .append_async(b"before-join".to_vec(), Duration::from_secs(1))
        .await
        .unwrap();

    // Bring up a third replica as a learner, then promote it.
    let joiner = host(3);
    let sm = Arc::new(MemSm::default());
    let group = RaftGroup::start(
        1,
        1,
        joiner.clone(),
        Vec::new(),
        vec![joiner.clone()],
        Wal::open(None, 1).unwrap(),
        sm.clone(),
        cluster.network.clone(),
        test_config(),
    );
    cluster.network.register(joiner.clone(), &group);

    leader
        .propose_config_change(EntryKind::AddPeer, joiner.clone(), Duration::from_secs(2))
        .await
        .unwrap();

    // The joiner replicates the existing log.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !sm.rows.lock().unwrap().contains_key(b"before-join".as_slice()) {
        assert!(Instant::now() < deadline, "joiner never caught up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Promote the caught-up learner to a voter, then lose one of the
    // original voters: the promoted replica sustains the quorum.
    leader
        .propose_config_change(EntryKind::PromoteLearner, joiner.clone(), Duration::from_secs(2))
        .await
        .unwrap();
    cluster.network.sever(&host(2));

    leader
        .append_async(b"after-promotion".to_vec(), Duration::from_secs(2))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !sm.rows.lock().unwrap().contains_key(b"after-promotion".as_slice()) {
        assert!(Instant::now() < deadline, "promoted voter missed entry");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(group.role() == Role::Follower || group.role() == Role::Leader);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leadership_lease() {
    let cluster = Cluster::start(3, test_config());
    let (leader_host, leader, _) = cluster.wait_for_leader().await;

    // With live followers the lease holds.
    leader
        .append_async(b"warm".to_vec(), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(leader.leadership_lease_valid());

    // Cut the leader off; once the lease ages out, strong reads must not
    // be served even though the role has not flipped yet.
    cluster.network.sever(&leader_host);
    tokio::time::sleep(test_config().election_timeout * 2).await;
    assert!(!leader.leadership_lease_valid());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_role_signature_tracks_transitions() {
    let cluster = Cluster::start(1, test_config());
    let (_, group, _) = cluster.wait_for_leader().await;

    let sig = group.role_signature();
    assert_eq!(sig as u32, Role::Leader as u32);
    // The ABA counter recorded at least the follower->candidate->leader
    // transitions.
    assert!(sig >> 32 >= 2);
}
