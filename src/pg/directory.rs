//! Registry of scope registries
//!
//! A node may run several independent scopes. The directory owns them, keyed
//! by scope name, and pumps cluster events from a [`FailureAdapter`] into each
//! of them. Inbound frames on a peer channel are decoded once and routed by
//! the scope name in their header; frames for scopes this node does not run
//! are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterEvent, FailureAdapter, PeerSender};
use crate::config::PgConfig;
use crate::error::{PgError, PgResult};
use crate::pg::protocol::PgMessage;
use crate::pg::scope::ScopeRegistry;
use crate::runtime::ProcessTable;
use crate::types::NodeId;

#[derive(Debug)]
struct DirectoryInner {
    scopes: DashMap<String, ScopeRegistry>,
    /// Connected peers; also serializes scope start against node up/down so a
    /// scope never misses or doubles a node-up
    peers: Mutex<HashMap<NodeId, PeerSender>>,
}

/// All scope registries of one node
#[derive(Debug, Clone)]
pub struct PgDirectory {
    processes: ProcessTable,
    config: PgConfig,
    inner: Arc<DirectoryInner>,
}

impl PgDirectory {
    /// Create a directory and start the scopes named in `config`
    pub fn new(processes: ProcessTable, config: PgConfig) -> Self {
        let directory = Self {
            processes,
            config,
            inner: Arc::new(DirectoryInner {
                scopes: DashMap::new(),
                peers: Mutex::new(HashMap::new()),
            }),
        };
        for name in directory.config.scopes.clone() {
            if let Err(e) = directory.start_scope(&name) {
                warn!(scope = %name, error = %e, "configured scope not started");
            }
        }
        directory
    }

    /// Create a directory and attach it to a failure adapter
    pub fn start<A: FailureAdapter>(processes: ProcessTable, config: PgConfig, adapter: A) -> Self {
        let directory = Self::new(processes, config);
        directory.attach(adapter);
        directory
    }

    pub fn node(&self) -> NodeId {
        self.processes.node()
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    /// Start a new scope; it immediately opens sessions with connected peers
    pub fn start_scope(&self, name: &str) -> PgResult<ScopeRegistry> {
        let peers = self.inner.peers.lock();
        if self.inner.scopes.contains_key(name) {
            return Err(PgError::ScopeExists(name.to_string()));
        }

        let registry = ScopeRegistry::start(name, self.processes.clone(), self.config.event_buffer);
        for (node, sender) in peers.iter() {
            registry.node_up(*node, sender.clone())?;
        }
        self.inner.scopes.insert(name.to_string(), registry.clone());
        Ok(registry)
    }

    /// Look up a running scope
    pub fn scope(&self, name: &str) -> PgResult<ScopeRegistry> {
        self.inner
            .scopes
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PgError::ScopeNotFound(name.to_string()))
    }

    /// Stop and remove a scope
    pub async fn stop_scope(&self, name: &str) -> PgResult<()> {
        let registry = {
            let _peers = self.inner.peers.lock();
            self.inner.scopes.remove(name).map(|(_, registry)| registry)
        };
        match registry {
            Some(registry) => registry.shutdown().await,
            None => Err(PgError::ScopeNotFound(name.to_string())),
        }
    }

    /// Names of running scopes, sorted
    pub fn scopes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.scopes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Nodes with an open channel
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.inner.peers.lock().keys().copied().collect();
        nodes.sort();
        nodes
    }

    /// Stop every scope
    pub async fn shutdown(&self) {
        let names = self.scopes();
        for name in names {
            let _ = self.stop_scope(&name).await;
        }
    }

    /// Spawn the task that feeds cluster events into every scope
    pub fn attach<A: FailureAdapter>(&self, adapter: A) -> JoinHandle<()> {
        let pump = EventPump {
            node: self.node(),
            inner: Arc::clone(&self.inner),
            readers: HashMap::new(),
        };
        tokio::spawn(pump.run(adapter))
    }
}

struct EventPump {
    node: NodeId,
    inner: Arc<DirectoryInner>,
    readers: HashMap<NodeId, JoinHandle<()>>,
}

impl EventPump {
    async fn run<A: FailureAdapter>(mut self, mut adapter: A) {
        while let Some(event) = adapter.next_event().await {
            match event {
                ClusterEvent::NodeUp { node, channel } => {
                    if node == self.node {
                        continue;
                    }
                    if self.readers.contains_key(&node) {
                        warn!(peer = %node.short(), "node-up without node-down, treating as reconnect");
                        self.node_down(node).await;
                    }
                    info!(peer = %node.short(), "node up");
                    {
                        let mut peers = self.inner.peers.lock();
                        peers.insert(node, channel.sender.clone());
                        for scope in self.inner.scopes.iter() {
                            let _ = scope.value().node_up(node, channel.sender.clone());
                        }
                    }
                    let reader = tokio::spawn(read_frames(node, channel.receiver, Arc::clone(&self.inner)));
                    self.readers.insert(node, reader);
                }
                ClusterEvent::NodeDown { node } => {
                    info!(peer = %node.short(), "node down");
                    self.node_down(node).await;
                }
            }
        }

        debug!(node = %self.node.short(), "failure adapter closed");
        for (_, reader) in self.readers.drain() {
            reader.abort();
        }
    }

    async fn node_down(&mut self, node: NodeId) {
        // The reader must be gone before the scopes see node-down, so no frame
        // from the dead channel can be queued behind it.
        if let Some(reader) = self.readers.remove(&node) {
            reader.abort();
            let _ = reader.await;
        }
        let mut peers = self.inner.peers.lock();
        peers.remove(&node);
        for scope in self.inner.scopes.iter() {
            let _ = scope.value().node_down(node);
        }
    }
}

async fn read_frames(
    node: NodeId,
    mut receiver: mpsc::UnboundedReceiver<bytes::Bytes>,
    inner: Arc<DirectoryInner>,
) {
    while let Some(frame) = receiver.recv().await {
        let message = match PgMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %node.short(), error = %e, "undecodable frame dropped");
                continue;
            }
        };
        let scope = inner.scopes.get(&message.header().scope).map(|e| e.value().clone());
        match scope {
            Some(registry) => {
                let _ = registry.deliver(node, message);
            }
            None => {
                debug!(peer = %node.short(), scope = %message.header().scope, "frame for unknown scope dropped");
            }
        }
    }
    debug!(peer = %node.short(), "peer channel closed");
}
