//! Shared harness for the integration tests: a small in-process cluster of
//! real `Node`s wired together over the crate's own `transport::Proxy`, so
//! the partition tests flip the same toggle a production deployment's
//! transport layer would expose.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use raft::config::RaftConfig;
use raft::membership::{MembershipView, Peer, StaticMembership};
use raft::node::Node;
use raft::protos::{Command, Message, Role, ServerId};
use raft::server::RaftServer;
use raft::state_machine::{StateMachine, StateMachineRouter};
use raft::transport::{Proxy, WorkerPool};

#[derive(Serialize, Deserialize)]
struct KvSet {
    key: String,
    value: String,
}

pub fn kv_command(key: &str, value: &str) -> Command {
    let payload = rmp_serde::to_vec(&KvSet { key: key.to_string(), value: value.to_string() })
        .expect("kv command always encodes");
    Command::new("kv", payload)
}

/// A trivial replicated key-value table: exactly the kind of user state
/// machine the core treats as an opaque `apply` sink.
pub struct KvStateMachine {
    table: Mutex<HashMap<String, String>>,
}

impl KvStateMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(KvStateMachine { table: Mutex::new(HashMap::new()) })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.table.lock().unwrap().get(key).cloned()
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&self, command: &Command) {
        let op: KvSet = rmp_serde::from_slice(&command.payload).expect("valid kv command payload");
        self.table.lock().unwrap().insert(op.key, op.value);
    }
}

/// Routes straight into another server's `handle_message`, bypassing any
/// real socket. The target isn't known until that server has been
/// constructed, so it's filled in after the fact via a shared slot.
struct DirectPeer {
    id: ServerId,
    target: Arc<Mutex<Option<Arc<RaftServer>>>>,
}

impl Peer for DirectPeer {
    fn id(&self) -> ServerId {
        self.id
    }

    fn invoke(&self, msg: Message) {
        if let Some(target) = self.target.lock().unwrap().clone() {
            target.handle_message(msg);
        }
    }
}

/// An in-process cluster of `Node`s, each backed by an in-memory log and
/// durable state, connected by real `Proxy`es so tests can partition a
/// server from the rest of the cluster exactly like the transport seam
/// intends.
pub struct TestCluster {
    pub nodes: Vec<Arc<Node>>,
    pub kvs: HashMap<ServerId, Arc<KvStateMachine>>,
    proxies: HashMap<(ServerId, ServerId), Arc<Proxy>>,
}

impl TestCluster {
    pub fn new(ids: &[ServerId], heartbeat: Duration, term_timeout: Duration) -> Self {
        // best-effort: a second test in the same process racing to init the
        // logger is expected and harmless, so the error is simply ignored.
        let _ = env_logger::try_init();

        let pool = Arc::new(WorkerPool::new(4));
        let slots: HashMap<ServerId, Arc<Mutex<Option<Arc<RaftServer>>>>> =
            ids.iter().map(|&id| (id, Arc::new(Mutex::new(None)))).collect();

        let mut proxies = HashMap::new();
        let mut nodes = Vec::new();
        let mut kvs = HashMap::new();

        for &id in ids {
            let mut peers: Vec<Arc<dyn Peer>> = Vec::new();
            for &other in ids {
                if other == id {
                    continue;
                }
                let direct = Arc::new(DirectPeer { id: other, target: slots[&other].clone() });
                let proxy = Arc::new(Proxy::new(direct, pool.clone()));
                proxies.insert((id, other), proxy.clone());
                peers.push(proxy);
            }
            let membership: Arc<dyn MembershipView> = Arc::new(StaticMembership::new(peers));

            let kv = KvStateMachine::new();
            let mut router = StateMachineRouter::new();
            router.register("kv", kv.clone());

            let config = RaftConfig::new(format!("/tmp/raft-test-unused-{}", id))
                .with_heartbeat_period(heartbeat)
                .with_term_timeout(term_timeout);

            let node = Node::start_in_memory(config, id, membership, router)
                .expect("in-memory node construction never fails");
            *slots[&id].lock().unwrap() = Some(node.server().clone());

            nodes.push(node);
            kvs.insert(id, kv);
        }

        TestCluster { nodes, kvs, proxies }
    }

    pub fn disconnect(&self, from: ServerId, to: ServerId) {
        self.proxies[&(from, to)].disconnect();
    }

    pub fn reconnect(&self, from: ServerId, to: ServerId) {
        self.proxies[&(from, to)].reconnect();
    }

    /// Cuts `id` off from every other member, in both directions.
    pub fn partition(&self, id: ServerId, ids: &[ServerId]) {
        for &other in ids {
            if other == id {
                continue;
            }
            self.disconnect(id, other);
            self.disconnect(other, id);
        }
    }

    pub fn heal(&self, id: ServerId, ids: &[ServerId]) {
        for &other in ids {
            if other == id {
                continue;
            }
            self.reconnect(id, other);
            self.reconnect(other, id);
        }
    }

    pub fn node(&self, id: ServerId) -> &Arc<Node> {
        self.nodes.iter().find(|n| n.id() == id).expect("unknown node id")
    }

    pub fn leader(&self) -> Option<Arc<Node>> {
        self.nodes.iter().find(|n| n.server().role() == Role::Leader).cloned()
    }

    pub fn wait_for_leader(&self, timeout: Duration) -> Arc<Node> {
        let start = Instant::now();
        loop {
            if let Some(n) = self.leader() {
                return n;
            }
            if start.elapsed() > timeout {
                panic!("no leader elected within {:?}", timeout);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Polls until every node in `ids` reports the given commit index (or
    /// times out), then returns the value of `commit_index` actually seen.
    pub fn wait_for_common_commit_index(&self, ids: &[ServerId], timeout: Duration) -> u64 {
        let start = Instant::now();
        loop {
            let indices: Vec<u64> = ids.iter().map(|&id| self.node(id).server().commit_index()).collect();
            if indices.iter().all(|&i| i == indices[0]) && indices[0] > 0 {
                return indices[0];
            }
            if start.elapsed() > timeout {
                panic!("commit index did not converge within {:?}: {:?}", timeout, indices);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
