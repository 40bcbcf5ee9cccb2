//! Common test helpers and utilities
//!
//! Builds simulated meshes on the in-process [`MemoryNetwork`]: every node gets
//! a pump task feeding its link events into the node, and an event log.

#![allow(dead_code)]

use parking_lot::Mutex;
use relaymesh::network::MemoryNetwork;
use relaymesh::{Event, MeshConfig, Message, Node, NodeBuilder, PeerId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long helpers wait for the mesh to settle
pub const SETTLE: Duration = Duration::from_secs(2);

/// Install a tracing subscriber honouring `RUST_LOG`, once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shorthand for a peer id
pub fn peer(id: &str) -> PeerId {
    PeerId::from(id)
}

/// Configuration with maintenance effectively disabled, so tests drive time
pub fn test_config() -> MeshConfig {
    MeshConfig {
        maintenance_interval_ms: 3_600_000,
        discovery_timeout_ms: 1_000,
        ..MeshConfig::default()
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A node of the simulation plus everything it reported
pub struct SimNode {
    /// The node under test
    pub node: Node,
    events: Arc<Mutex<Vec<Event>>>,
    pump: JoinHandle<()>,
}

impl SimNode {
    /// Every event dispatched so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Messages delivered to this node's application
    pub fn delivered(&self) -> Vec<Message> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::MessageDelivered { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Events matching a predicate
    pub fn count_events(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl Drop for SimNode {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// A simulated mesh
pub struct Mesh {
    /// Shared medium
    pub network: MemoryNetwork,
    nodes: BTreeMap<PeerId, SimNode>,
}

impl Mesh {
    /// Empty mesh
    pub fn new() -> Self {
        init_tracing();
        Self {
            network: MemoryNetwork::new(),
            nodes: BTreeMap::new(),
        }
    }

    /// Mesh of started nodes sharing one configuration
    pub async fn with_nodes(ids: &[&str], config: MeshConfig) -> Self {
        let mut mesh = Self::new();
        for id in ids {
            mesh.add_node(id, config.clone()).await;
        }
        mesh
    }

    /// Register, wire up and start a node
    pub async fn add_node(&mut self, id: &str, config: MeshConfig) -> Node {
        let (transport, inbox) = self.network.register(id);
        let node = NodeBuilder::new(id)
            .with_config(config)
            .with_transport(transport)
            .build()
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        node.subscribe(move |event| sink.lock().push(event));

        let pump = node.spawn_link_pump(inbox);
        node.start().await.unwrap();

        self.nodes.insert(
            peer(id),
            SimNode {
                node: node.clone(),
                events,
                pump,
            },
        );
        node
    }

    /// The node with this id
    pub fn node(&self, id: &str) -> &Node {
        &self.sim(id).node
    }

    /// The simulation record of a node
    pub fn sim(&self, id: &str) -> &SimNode {
        self.nodes
            .get(&peer(id))
            .unwrap_or_else(|| panic!("no node {}", id))
    }

    /// Link two nodes and wait until both consider the other a neighbor
    pub async fn link(&self, a: &str, b: &str) {
        self.network.link(&peer(a), &peer(b)).unwrap();
        let settled = wait_until(SETTLE, || {
            self.node(a).router().is_neighbor(&peer(b))
                && self.node(b).router().is_neighbor(&peer(a))
        })
        .await;
        assert!(settled, "link {}-{} did not come up", a, b);
    }

    /// Cut a link and wait until both ends noticed
    pub async fn unlink(&self, a: &str, b: &str) {
        self.network.unlink(&peer(a), &peer(b));
        let settled = wait_until(SETTLE, || {
            !self.node(a).router().is_neighbor(&peer(b))
                && !self.node(b).router().is_neighbor(&peer(a))
        })
        .await;
        assert!(settled, "link {}-{} did not go down", a, b);
    }

    /// Link consecutive ids into a line
    pub async fn link_line(&self, ids: &[&str]) {
        for pair in ids.windows(2) {
            self.link(pair[0], pair[1]).await;
        }
    }

    /// Wait until `id` has delivered `count` messages
    pub async fn wait_for_deliveries(&self, id: &str, count: usize) -> bool {
        wait_until(SETTLE, || self.sim(id).delivered().len() >= count).await
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}
