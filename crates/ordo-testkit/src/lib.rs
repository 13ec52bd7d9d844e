//! # ordo-testkit — in-memory cluster harness
//!
//! A loopback transport with the guarantees the middleware assumes from its
//! real transport — reliable delivery, FIFO per sender-receiver pair,
//! multicast looping back to the sender — plus a cluster harness that
//! assembles replica nodes over it and scripts membership events.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ordo_core::config::NodeConfig;
use ordo_core::errors::Result;
use ordo_core::token::NodeId;

use ordo_node::{NodeBuilder, ReplicaNode};
use ordo_protocol::messages::{Envelope, Payload, View};
use ordo_protocol::ordering::OperationHandler;
use ordo_protocol::transport::{MembershipListener, Transport};

/// Install a compact tracing subscriber for debugging test runs. Safe to
/// call from several tests; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Routing fabric connecting the in-memory transports.
#[derive(Default)]
pub struct MemoryHub {
    inboxes: Mutex<BTreeMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node, returning its transport endpoint and inbox.
    pub fn register(
        self: &Arc<Self>,
        node: NodeId,
    ) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<Envelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inboxes.lock().insert(node, sender);
        (
            Arc::new(MemoryTransport {
                hub: self.clone(),
                node,
            }),
            receiver,
        )
    }

    /// Disconnect a node; its inbox is dropped and subsequent sends to it
    /// vanish, like sends to a crashed process.
    pub fn disconnect(&self, node: NodeId) {
        self.inboxes.lock().remove(&node);
    }

    fn send_to(&self, target: NodeId, envelope: Envelope) {
        let inboxes = self.inboxes.lock();
        if let Some(sender) = inboxes.get(&target) {
            // an unbounded channel preserves per-sender order: FIFO holds
            let _ = sender.send(envelope);
        } else {
            tracing::trace!(%target, "dropping send to disconnected node");
        }
    }

    fn broadcast(&self, envelope: Envelope) {
        let targets: Vec<NodeId> = self.inboxes.lock().keys().copied().collect();
        for target in targets {
            self.send_to(target, envelope.clone());
        }
    }
}

/// One node's endpoint on the hub.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    node: NodeId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn unicast(&self, target: NodeId, envelope: Envelope) -> Result<()> {
        self.hub.send_to(target, envelope);
        Ok(())
    }

    async fn multicast(&self, envelope: Envelope) -> Result<()> {
        tracing::trace!(sender = %self.node, "multicasting");
        self.hub.broadcast(envelope);
        Ok(())
    }
}

/// Handler recording every execution, for asserting delivery order.
#[derive(Default)]
pub struct RecordingHandler {
    log: Mutex<Vec<String>>,
}

impl RecordingHandler {
    /// Create an empty handler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The executions recorded so far, in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Number of recorded executions.
    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    /// Whether nothing has executed yet.
    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }
}

impl OperationHandler for RecordingHandler {
    fn execute(&self, operation: &str, session: Option<&str>, args: &[u8]) -> Vec<u8> {
        let tag = match session {
            Some(session) => format!("{operation}@{session}:{}", String::from_utf8_lossy(args)),
            None => format!("{operation}:{}", String::from_utf8_lossy(args)),
        };
        self.log.lock().push(tag.clone());
        tag.into_bytes()
    }

    fn install(&self, operation: &str, _session: Option<&str>, result: &[u8]) {
        self.log
            .lock()
            .push(format!("install:{operation}:{}", String::from_utf8_lossy(result)));
    }
}

/// One assembled cluster member.
pub struct ClusterMember {
    /// The replica node
    pub node: Arc<ReplicaNode>,
    /// Its recording handler
    pub handler: Arc<RecordingHandler>,
    pump: JoinHandle<()>,
}

/// An in-memory cluster of replica nodes.
pub struct TestCluster {
    hub: Arc<MemoryHub>,
    members: HashMap<u32, ClusterMember>,
    view_id: u64,
}

impl TestCluster {
    /// Assemble a cluster; `config_for` yields each member's configuration.
    pub fn start(ids: &[u32], config_for: impl Fn(u32) -> NodeConfig) -> Result<Self> {
        let hub = MemoryHub::new();
        let mut members = HashMap::new();

        for &id in ids {
            let (transport, mut inbox) = hub.register(NodeId(id));
            let handler = RecordingHandler::new();
            let node = NodeBuilder::new(config_for(id), transport, handler.clone()).build()?;

            let pump_node = node.clone();
            // deliveries (and the dissemination step a coordinate reply can
            // trigger) may suspend on a gate, so they run on their own task;
            // everything else is processed in FIFO order on the pump
            let pump = tokio::spawn(async move {
                while let Some(envelope) = inbox.recv().await {
                    match &envelope.payload {
                        Payload::Deliver(_) | Payload::CoordinateReply(_) => {
                            let node = pump_node.clone();
                            tokio::spawn(async move {
                                if let Err(err) = node.handle(envelope).await {
                                    tracing::warn!(error = %err, "envelope handling failed");
                                }
                            });
                        }
                        _ => {
                            if let Err(err) = pump_node.handle(envelope).await {
                                tracing::warn!(error = %err, "envelope handling failed");
                            }
                        }
                    }
                }
            });

            members.insert(
                id,
                ClusterMember {
                    node,
                    handler,
                    pump,
                },
            );
        }

        Ok(Self {
            hub,
            members,
            view_id: 1,
        })
    }

    /// A member by id.
    pub fn member(&self, id: u32) -> &ClusterMember {
        &self.members[&id]
    }

    /// Ids of the live members.
    pub fn live_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.members.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Crash a member: disconnect it, stop its pump, and deliver the
    /// membership event to every survivor.
    pub fn crash(&mut self, id: u32) {
        let Some(member) = self.members.remove(&id) else {
            return;
        };
        self.hub.disconnect(NodeId(id));
        member.pump.abort();
        self.view_id += 1;

        let surviving = View::new(
            self.view_id,
            self.live_ids().into_iter().map(NodeId),
        );
        for member in self.members.values() {
            member.node.on_node_crash(NodeId(id), &surviving);
        }
    }

    /// Let in-flight work drain.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    /// The execution logs of every live member, keyed by id.
    pub fn logs(&self) -> HashMap<u32, Vec<String>> {
        self.members
            .iter()
            .map(|(id, member)| (*id, member.handler.log()))
            .collect()
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for member in self.members.values() {
            member.pump.abort();
        }
    }
}

/// A fully-ordered single-partition configuration shared by every member.
pub fn single_partition_config(node: u32, sequencer: u32, operations: &[&str]) -> NodeConfig {
    use ordo_core::config::{OperationConfig, OperationShape, PartitionConfig};
    use ordo_core::partition::PartitionScope;

    NodeConfig {
        node,
        partitions: vec![PartitionConfig {
            id: 1,
            scope: PartitionScope::FullyOrdered,
            sequencer,
        }],
        operations: operations
            .iter()
            .map(|name| OperationConfig {
                name: (*name).to_owned(),
                kind: OperationShape::Simple,
                partition: Some(1),
                children: vec![],
                ordered: true,
                idempotent: false,
            })
            .collect(),
        ..NodeConfig::default()
    }
}
