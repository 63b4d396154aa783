//! Cluster harness for integration tests.
//!
//! Runs `n` nodes over a [`LocalNetwork`] inside the test runtime (tests use
//! a paused clock, so multi-second scenarios finish instantly). Every node
//! gets a host that checks apply order and cross-node agreement, and can
//! optionally snapshot every few entries.
#![allow(dead_code)]

use bytes::Bytes;
use raftnode::storage::MemStorage;
use raftnode::testing::LocalNetwork;
use raftnode::{ApplyMsg, Config, Node, NodeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Upper bound for electing a leader, in line with the election timeout.
pub const RAFT_ELECTION_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Default)]
struct Applied {
    /// Host state per node: every command it has applied, by index.
    logs: HashMap<NodeId, BTreeMap<u64, Bytes>>,
    last: HashMap<NodeId, u64>,
    errors: Vec<String>,
}

impl Applied {
    fn apply(&mut self, id: NodeId, index: u64, command: Bytes) {
        let last = self.last.get(&id).copied().unwrap_or(0);
        if index != last + 1 {
            self.errors.push(format!(
                "node {id} applied index {index} after {last}"
            ));
        }
        for (other, log) in &self.logs {
            if *other == id {
                continue;
            }
            if let Some(existing) = log.get(&index) {
                if *existing != command {
                    self.errors.push(format!(
                        "commit index {index}: node {id} has {command:?}, node {other} has {existing:?}"
                    ));
                }
            }
        }
        self.logs.entry(id).or_default().insert(index, command);
        self.last.insert(id, index);
    }

    fn install(&mut self, id: NodeId, index: u64, state: BTreeMap<u64, Bytes>) {
        for (i, command) in &state {
            for (other, log) in &self.logs {
                if *other != id && log.get(i).is_some_and(|c| c != command) {
                    self.errors.push(format!(
                        "snapshot on node {id} disagrees with node {other} at {i}"
                    ));
                }
            }
        }
        self.logs.insert(id, state);
        self.last.insert(id, index);
    }
}

pub struct Cluster {
    pub n: usize,
    pub network: LocalNetwork,
    config: Config,
    nodes: HashMap<NodeId, Node>,
    storages: HashMap<NodeId, MemStorage>,
    applied: Arc<Mutex<Applied>>,
    snapshot_every: Option<u64>,
}

impl Cluster {
    pub async fn new(n: usize) -> Self {
        Self::build(n, None).await
    }

    /// Cluster whose hosts call `Snapshot` every `every` applied entries.
    pub async fn with_snapshots(n: usize, every: u64) -> Self {
        Self::build(n, Some(every)).await
    }

    async fn build(n: usize, snapshot_every: Option<u64>) -> Self {
        let mut cluster = Self {
            n,
            network: LocalNetwork::new(),
            config: Config::default(),
            nodes: HashMap::new(),
            storages: HashMap::new(),
            applied: Arc::new(Mutex::new(Applied::default())),
            snapshot_every,
        };
        for id in cluster.ids() {
            cluster.start(id).await;
        }
        cluster
    }

    pub fn ids(&self) -> Vec<NodeId> {
        (1..=self.n as NodeId).collect()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[&id]
    }

    /// Starts (or restarts) node `id` from whatever its storage holds.
    pub async fn start(&mut self, id: NodeId) {
        let storage = self.storages.entry(id).or_default().clone();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let node = Node::new(
            id,
            self.ids(),
            self.config.clone(),
            Arc::new(storage),
            &self.network,
            apply_tx,
        )
        .await
        .expect("node starts");

        {
            // The host restarts empty; it is rebuilt from snapshot and log.
            let mut applied = self.applied.lock().unwrap();
            applied.logs.remove(&id);
            applied.last.remove(&id);
        }
        tokio::spawn(run_host(
            node.clone(),
            apply_rx,
            Arc::clone(&self.applied),
            self.snapshot_every,
        ));
        self.network.register(node.clone()).await;
        self.nodes.insert(id, node);
    }

    /// Kills node `id`. Its storage keeps what was durable at this point;
    /// writes still racing in from the dying instance are discarded.
    pub async fn crash(&mut self, id: NodeId) {
        self.network.unregister(id).await;
        if let Some(node) = self.nodes.get(&id) {
            node.kill();
        }
        if let Some(storage) = self.storages.get(&id) {
            let durable = storage.duplicate().await;
            self.storages.insert(id, durable);
        }
    }

    pub async fn restart(&mut self, id: NodeId) {
        self.crash(id).await;
        self.start(id).await;
    }

    pub async fn disconnect(&self, id: NodeId) {
        self.network.disconnect_node(id).await;
    }

    pub async fn connect(&self, id: NodeId) {
        self.network.connect_node(id).await;
    }

    pub async fn set_unreliable(&self, unreliable: bool) {
        self.network.set_unreliable(unreliable).await;
    }

    async fn live(&self, id: NodeId) -> bool {
        self.network.is_connected(id).await && !self.nodes[&id].killed()
    }

    /// Waits until exactly one connected node leads in the newest term and
    /// returns it. Panics if no leader emerges or a term has two leaders.
    pub async fn check_one_leader(&self) -> NodeId {
        for _ in 0..10 {
            let ms = 450 + rand::random::<u64>() % 100;
            tokio::time::sleep(Duration::from_millis(ms)).await;

            let mut leaders: BTreeMap<u64, Vec<NodeId>> = BTreeMap::new();
            for id in self.ids() {
                if !self.live(id).await {
                    continue;
                }
                let (term, is_leader) = self.nodes[&id].get_state().await;
                if is_leader {
                    leaders.entry(term).or_default().push(id);
                }
            }
            for (term, ids) in &leaders {
                assert!(ids.len() <= 1, "term {term} has {} leaders: {ids:?}", ids.len());
            }
            if let Some((_, ids)) = leaders.iter().next_back() {
                return ids[0];
            }
        }
        panic!("expected one leader, got none");
    }

    /// Asserts every connected node agrees on the term and returns it.
    pub async fn check_terms(&self) -> u64 {
        let mut term = None;
        for id in self.ids() {
            if !self.live(id).await {
                continue;
            }
            let (t, _) = self.nodes[&id].get_state().await;
            match term {
                None => term = Some(t),
                Some(existing) => assert_eq!(existing, t, "servers disagree on term"),
            }
        }
        term.expect("no connected servers")
    }

    pub async fn check_no_leader(&self) {
        for id in self.ids() {
            if !self.live(id).await {
                continue;
            }
            let (_, is_leader) = self.nodes[&id].get_state().await;
            assert!(!is_leader, "node {id} is leader, but should not be");
        }
    }

    /// How many hosts have applied `index`, and the command there.
    pub fn n_committed(&self, index: u64) -> (usize, Option<Bytes>) {
        let applied = self.applied.lock().unwrap();
        assert!(applied.errors.is_empty(), "apply errors: {:?}", applied.errors);
        let mut count = 0;
        let mut command = None;
        for log in applied.logs.values() {
            if let Some(c) = log.get(&index) {
                if let Some(prev) = &command {
                    assert_eq!(prev, c, "hosts disagree at index {index}");
                }
                count += 1;
                command = Some(c.clone());
            }
        }
        (count, command)
    }

    /// Waits for at least `n` hosts to apply `index`. Gives up early if the
    /// term moves past `start_term`.
    pub async fn wait(&self, index: u64, n: usize, start_term: Option<u64>) -> Option<Bytes> {
        let mut pause = Duration::from_millis(10);
        for _ in 0..30 {
            let (count, _) = self.n_committed(index);
            if count >= n {
                break;
            }
            tokio::time::sleep(pause).await;
            if pause < Duration::from_secs(1) {
                pause *= 2;
            }
            if let Some(start_term) = start_term {
                for id in self.ids() {
                    let (term, _) = self.nodes[&id].get_state().await;
                    if term > start_term {
                        return None;
                    }
                }
            }
        }
        let (count, command) = self.n_committed(index);
        assert!(count >= n, "only {count} decided for index {index}; wanted {n}");
        command
    }

    /// Submits `command` until `expected` hosts applied it, returning its
    /// index. With `retry`, resubmits after a leader change.
    pub async fn one(&self, command: impl Into<Bytes>, expected: usize, retry: bool) -> u64 {
        let command: Bytes = command.into();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut starts = 0;
        while tokio::time::Instant::now() < deadline {
            let mut index = None;
            for _ in 0..self.n {
                starts = (starts % self.n) + 1;
                let id = starts as NodeId;
                if !self.live(id).await {
                    continue;
                }
                let (i, _, is_leader) = self.nodes[&id]
                    .start(command.clone())
                    .await
                    .expect("start succeeds");
                if is_leader {
                    index = Some(i);
                    break;
                }
            }

            if let Some(index) = index {
                let submitted = tokio::time::Instant::now();
                while submitted.elapsed() < Duration::from_secs(2) {
                    let (count, got) = self.n_committed(index);
                    if count >= expected && got.as_ref() == Some(&command) {
                        return index;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                if !retry {
                    panic!("one({command:?}) failed to reach agreement");
                }
            } else {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        panic!("one({command:?}) failed to reach agreement");
    }

    pub fn check_no_errors(&self) {
        let applied = self.applied.lock().unwrap();
        assert!(applied.errors.is_empty(), "apply errors: {:?}", applied.errors);
    }

    pub async fn shutdown(self) {
        for node in self.nodes.values() {
            node.kill();
        }
        self.check_no_errors();
    }
}

/// Host loop for one node instance: applies commands, installs snapshots
/// and takes snapshots of its own.
async fn run_host(
    node: Node,
    mut apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
    applied: Arc<Mutex<Applied>>,
    snapshot_every: Option<u64>,
) {
    let id = node.id();
    while let Some(msg) = apply_rx.recv().await {
        if node.killed() {
            break;
        }
        match msg {
            ApplyMsg::Command { index, command } => {
                let image = {
                    let mut applied = applied.lock().unwrap();
                    applied.apply(id, index, command);
                    match snapshot_every {
                        Some(every) if index % every == 0 => {
                            let state = applied.logs.get(&id).cloned().unwrap_or_default();
                            Some(bincode::serialize(&state).expect("encode host state"))
                        }
                        _ => None,
                    }
                };
                if let Some(image) = image {
                    if node.snapshot(index, image).await.is_err() {
                        break;
                    }
                }
            }
            ApplyMsg::Snapshot { term, index, data } => {
                if node.cond_install_snapshot(term, index, &data).await {
                    let state: BTreeMap<u64, Bytes> =
                        bincode::deserialize(&data).expect("decode host state");
                    applied.lock().unwrap().install(id, index, state);
                }
            }
        }
    }
}
