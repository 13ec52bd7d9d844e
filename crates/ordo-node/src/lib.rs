//! # ordo-node — replica composition root
//!
//! Constructs one replica's ordering context, protocol driver and
//! fault-tolerance engine, and wires them together by interface at startup.
//! There is no reflective binding and no global registry: everything a
//! component needs is handed to it here, once.

use std::sync::Arc;

use ordo_core::config::NodeConfig;
use ordo_core::errors::Result;
use ordo_core::registry::OrderingContext;
use ordo_core::token::{NodeId, PartitionId};

use ordo_protocol::messages::{Envelope, Payload, RequestId, View};
use ordo_protocol::ordering::{OperationHandler, OrderingProtocol};
use ordo_protocol::transport::{MembershipListener, Transport};

use ordo_tolerance::engine::{
    FaultToleranceEngine, LowestSurvivorElector, RecoveryPhase, SequencerElector,
};

/// Builder for a [`ReplicaNode`].
pub struct NodeBuilder {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn OperationHandler>,
    elector: Arc<dyn SequencerElector>,
}

impl NodeBuilder {
    /// Start from a configuration, a transport and the host's operation
    /// handler.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn OperationHandler>,
    ) -> Self {
        Self {
            config,
            transport,
            handler,
            elector: Arc::new(LowestSurvivorElector),
        }
    }

    /// Override the sequencer election strategy.
    pub fn elector(mut self, elector: Arc<dyn SequencerElector>) -> Self {
        self.elector = elector;
        self
    }

    /// Validate the configuration and wire the components together.
    pub fn build(self) -> Result<Arc<ReplicaNode>> {
        let node = self.config.node_id();
        let context = Arc::new(self.config.build_context()?);

        let protocol =
            OrderingProtocol::new(node, context.clone(), self.transport.clone(), self.handler);
        let engine = FaultToleranceEngine::new(
            node,
            context.clone(),
            self.transport,
            protocol.outstanding().clone(),
            self.elector,
        );
        protocol.set_observer(engine.clone());

        tracing::info!(%node, "replica node assembled");
        Ok(Arc::new(ReplicaNode {
            node,
            config: self.config,
            context,
            protocol,
            engine,
        }))
    }
}

/// One assembled replica.
pub struct ReplicaNode {
    node: NodeId,
    config: NodeConfig,
    context: Arc<OrderingContext>,
    protocol: Arc<OrderingProtocol>,
    engine: Arc<FaultToleranceEngine>,
}

impl ReplicaNode {
    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.node
    }

    /// The shared ordering context.
    pub fn context(&self) -> &Arc<OrderingContext> {
        &self.context
    }

    /// The request lifecycle driver.
    pub fn protocol(&self) -> &Arc<OrderingProtocol> {
        &self.protocol
    }

    /// The crash-recovery engine.
    pub fn engine(&self) -> &Arc<FaultToleranceEngine> {
        &self.engine
    }

    /// Invoke an operation across the group.
    pub async fn submit(
        &self,
        operation: &str,
        session: Option<String>,
        args: Vec<u8>,
    ) -> Result<RequestId> {
        self.protocol.submit(operation, session, args).await
    }

    /// Route one inbound envelope to the protocol or the recovery engine.
    /// Run each envelope on its own task: gated deliveries may suspend until
    /// their predecessors arrive.
    pub async fn handle(&self, envelope: Envelope) -> Result<()> {
        match &envelope.payload {
            Payload::Coordinate(_) | Payload::CoordinateReply(_) | Payload::Deliver(_) => {
                self.protocol.handle(envelope).await
            }
            Payload::ConsensusRequest(_) | Payload::ConsensusReport(_) | Payload::Agreement(_) => {
                self.engine.handle(envelope).await
            }
        }
    }

    /// The recovery phase of a partition on this node.
    pub fn recovery_phase(&self, partition: PartitionId) -> RecoveryPhase {
        self.engine.phase(partition)
    }

    /// Evict session sub-partitions idle for longer than the configured
    /// window. Returns how many were dropped. The host decides when to
    /// sweep; nothing is evicted behind the protocol's back.
    pub fn evict_idle_sessions(&self) -> usize {
        let max_idle = self.config.session.max_idle();
        let mut evicted = 0;
        for handle in self.context.partitions() {
            if let ordo_core::registry::PartitionHandle::Session(session) = handle {
                evicted += session.evict_idle(max_idle);
            }
        }
        evicted
    }
}

impl MembershipListener for ReplicaNode {
    fn on_node_join(&self, node: NodeId) {
        self.engine.on_node_join(node);
    }

    fn on_node_crash(&self, node: NodeId, surviving: &View) {
        self.engine.on_node_crash(node, surviving);
    }
}
