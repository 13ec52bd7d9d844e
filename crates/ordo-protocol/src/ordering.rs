//! The ordering protocol: coordinate → acquire → deliver.
//!
//! A request is coordinated with the partition's sequencer to obtain its
//! token(s), acquired into the outstanding cache (assembled through the
//! token collector for composites), then disseminated; every node, the
//! requester included, gates the dissemination through the partition before
//! executing. Deliveries that cannot proceed synchronously are handed off to
//! the blocking worker pool so a suspended gate never stalls the transport's
//! message-processing task.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use ordo_core::errors::{OrdoError, Result};
use ordo_core::registry::OrderingContext;
use ordo_core::service::{Operation, ResolvedKind};
use ordo_core::token::{NodeId, Token};

use crate::collector::TokenCollector;
use crate::messages::{
    CoordinateReply, CoordinateRequest, DeliverMessage, Envelope, IndexedToken, Payload,
    RequestHeader, RequestId, TokenAssignment,
};
use crate::observer::{FaultObserver, NoopObserver};
use crate::outstanding::{OutstandingRequests, PendingRequest};
use crate::transport::Transport;

/// Execution seam supplied by the host application.
///
/// Invocation machinery stays outside the core: the protocol hands the
/// operation name and opaque payload to the handler at the right slot in the
/// delivery order.
pub trait OperationHandler: Send + Sync {
    /// Execute an operation and return its result payload.
    fn execute(&self, operation: &str, session: Option<&str>, args: &[u8]) -> Vec<u8>;

    /// Install the recorded result of a side-effecting operation executed at
    /// the requester.
    fn install(&self, operation: &str, session: Option<&str>, result: &[u8]);
}

/// The request lifecycle driver of one node.
pub struct OrderingProtocol {
    node: NodeId,
    context: Arc<OrderingContext>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn OperationHandler>,
    outstanding: Arc<OutstandingRequests>,
    observer: RwLock<Arc<dyn FaultObserver>>,
}

impl OrderingProtocol {
    /// Create the protocol driver for `node`.
    pub fn new(
        node: NodeId,
        context: Arc<OrderingContext>,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn OperationHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            context,
            transport,
            handler,
            outstanding: Arc::new(OutstandingRequests::new()),
            observer: RwLock::new(Arc::new(NoopObserver)),
        })
    }

    /// This node's id.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The shared ordering context.
    pub fn context(&self) -> &Arc<OrderingContext> {
        &self.context
    }

    /// The outstanding-request cache, shared with the fault-tolerance engine.
    pub fn outstanding(&self) -> &Arc<OutstandingRequests> {
        &self.outstanding
    }

    /// Hook in the fault-tolerance engine.
    pub fn set_observer(&self, observer: Arc<dyn FaultObserver>) {
        *self.observer.write() = observer;
    }

    fn observer(&self) -> Arc<dyn FaultObserver> {
        self.observer.read().clone()
    }

    // ---- requester side ---------------------------------------------------

    /// Invoke `operation` across the group. Returns the correlation id; the
    /// result of the invocation is observed through the handler at delivery
    /// time.
    ///
    /// When the target partition is suspended for crash recovery, the
    /// request stays parked in the outstanding cache and is retransmitted
    /// once the skip agreement arrives.
    pub async fn submit(
        &self,
        operation: &str,
        session: Option<String>,
        args: Vec<u8>,
    ) -> Result<RequestId> {
        let op = self.context.operation(operation)?;
        if op.is_sessional() && session.is_none() {
            return Err(OrdoError::configuration(format!(
                "operation {operation} is session-scoped but no session was supplied"
            )));
        }

        let request_id = RequestId::fresh();
        let header = RequestHeader {
            operation: operation.to_owned(),
            session,
            requester: self.node,
            unordered: !op.requires_ordering(),
        };

        if !op.requires_ordering() {
            tracing::trace!(%request_id, operation, "disseminating without ordering");
            let deliver = DeliverMessage {
                header,
                assignment: None,
                args,
                result: None,
            };
            self.transport
                .multicast(Envelope::correlated(
                    self.node,
                    request_id,
                    Payload::Deliver(deliver),
                ))
                .await?;
            return Ok(request_id);
        }

        if let Some(plan) = op.composite() {
            let ordered: Vec<usize> = plan
                .leaves
                .iter()
                .enumerate()
                .filter(|(_, leaf)| leaf.ordered)
                .map(|(index, _)| index)
                .collect();
            let collector = TokenCollector::new(plan.leaves.len(), ordered);
            self.outstanding.insert(
                request_id,
                PendingRequest::composite(header.clone(), args, collector),
            );

            let mut targets = Vec::new();
            for leaf in plan.leaves.iter().filter(|leaf| leaf.ordered) {
                let Ok(handle) = self.context.partition(leaf.partition) else {
                    continue;
                };
                if !handle.is_accepting_requests() {
                    continue;
                }
                let sequencer = handle.sequencer();
                if !targets.contains(&sequencer) {
                    targets.push(sequencer);
                }
            }
            tracing::trace!(
                %request_id,
                operation,
                sequencers = targets.len(),
                "coordinating composite request"
            );
            for target in targets {
                self.transport
                    .unicast(
                        target,
                        Envelope::correlated(
                            self.node,
                            request_id,
                            Payload::Coordinate(CoordinateRequest {
                                header: header.clone(),
                                retransmit_indices: None,
                            }),
                        ),
                    )
                    .await?;
            }
            return Ok(request_id);
        }

        self.outstanding
            .insert(request_id, PendingRequest::simple(header.clone(), args));
        match op.sequencer_for_request() {
            Some(sequencer) => {
                self.outstanding.with_mut(request_id, |pending| {
                    pending.coordinated_by = Some(sequencer);
                });
                tracing::trace!(%request_id, operation, %sequencer, "coordinating request");
                self.transport
                    .unicast(
                        sequencer,
                        Envelope::correlated(
                            self.node,
                            request_id,
                            Payload::Coordinate(CoordinateRequest {
                                header,
                                retransmit_indices: None,
                            }),
                        ),
                    )
                    .await?;
            }
            None => {
                tracing::debug!(
                    %request_id,
                    operation,
                    "partition suspended, request parked until the skip agreement"
                );
            }
        }
        Ok(request_id)
    }

    // ---- inbound messages -------------------------------------------------

    /// Process one inbound envelope. Callers should run each envelope on its
    /// own task: a gated delivery may suspend until its predecessors arrive.
    pub async fn handle(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        match envelope.payload {
            Payload::Coordinate(request) => {
                self.handle_coordinate(envelope.sender, envelope.request_id, request)
                    .await
            }
            Payload::CoordinateReply(reply) => {
                self.handle_coordinate_reply(envelope.sender, envelope.request_id, reply)
                    .await
            }
            Payload::Deliver(message) => self.handle_deliver(envelope.request_id, message).await,
            other => {
                tracing::warn!(
                    payload = ?other,
                    "recovery payload routed to the ordering protocol, ignoring"
                );
                Ok(())
            }
        }
    }

    /// Sequencer side: assign tokens for a request.
    async fn handle_coordinate(
        &self,
        sender: NodeId,
        request_id: RequestId,
        request: CoordinateRequest,
    ) -> Result<()> {
        let op = self.context.operation(&request.header.operation)?;
        let session = request.header.session.as_deref();

        let reply = if let Some(plan) = op.composite() {
            let indices: Vec<usize> = request
                .retransmit_indices
                .clone()
                .unwrap_or_else(|| (0..plan.leaves.len()).collect());
            let mut assigned = Vec::new();
            for index in indices {
                let Some(leaf) = plan.leaves.get(index) else {
                    continue;
                };
                if !leaf.ordered {
                    continue;
                }
                let Ok(leaf_op) = self.context.operation(&leaf.name) else {
                    continue;
                };
                // leaves sequenced elsewhere yield no token here
                if let Some(token) = leaf_op.next_token(session, self.node) {
                    assigned.push(IndexedToken { index, token });
                }
            }
            if assigned.is_empty() {
                CoordinateReply::NotSequencer
            } else {
                CoordinateReply::Assigned(TokenAssignment::Vector(assigned))
            }
        } else {
            match op.next_token(session, self.node) {
                Some(token) => CoordinateReply::Assigned(TokenAssignment::Single(token)),
                None => CoordinateReply::NotSequencer,
            }
        };

        if let CoordinateReply::Assigned(assignment) = &reply {
            tracing::debug!(
                %request_id,
                operation = %request.header.operation,
                requester = %request.header.requester,
                "assigned tokens"
            );
            self.observer()
                .on_tokens_assigned(request.header.requester, assignment);
        } else {
            tracing::debug!(
                %request_id,
                operation = %request.header.operation,
                "not the sequencer, refusing assignment"
            );
        }

        self.transport
            .unicast(
                sender,
                Envelope::correlated(self.node, request_id, Payload::CoordinateReply(reply)),
            )
            .await
    }

    /// Requester side: acquire assigned tokens.
    async fn handle_coordinate_reply(
        self: &Arc<Self>,
        sender: NodeId,
        request_id: RequestId,
        reply: CoordinateReply,
    ) -> Result<()> {
        if !self.outstanding.contains(request_id) {
            // assumed superseded by a retransmission
            tracing::debug!(
                %request_id,
                "coordination reply for a request no longer tracked, discarding"
            );
            return Ok(());
        }

        match reply {
            CoordinateReply::NotSequencer => {
                let Some(header) = self
                    .outstanding
                    .with_mut(request_id, |pending| pending.header.clone())
                else {
                    return Ok(());
                };
                let op = self.context.operation(&header.operation)?;
                match op.sequencer_for_request() {
                    Some(sequencer) if sequencer != sender => {
                        tracing::debug!(
                            %request_id,
                            %sequencer,
                            "re-resolving sequencer after refusal"
                        );
                        self.outstanding.with_mut(request_id, |pending| {
                            pending.coordinated_by = Some(sequencer);
                        });
                        self.transport
                            .unicast(
                                sequencer,
                                Envelope::correlated(
                                    self.node,
                                    request_id,
                                    Payload::Coordinate(CoordinateRequest {
                                        header,
                                        retransmit_indices: None,
                                    }),
                                ),
                            )
                            .await?;
                    }
                    _ => {
                        tracing::debug!(
                            %request_id,
                            "sequencer unresolved after refusal, awaiting recovery"
                        );
                    }
                }
                Ok(())
            }
            CoordinateReply::Assigned(TokenAssignment::Single(token)) => {
                let Some(operation) = self
                    .outstanding
                    .with_mut(request_id, |pending| pending.header.operation.clone())
                else {
                    return Ok(());
                };
                if !self.observer().on_token_acquired(sender, &operation, &token) {
                    tracing::debug!(
                        %request_id,
                        %token,
                        "token from a deposed sequencer, awaiting retransmission"
                    );
                    return Ok(());
                }
                self.outstanding.with_mut(request_id, |pending| {
                    pending.needs_retransmission = false;
                    pending.assignment = Some(TokenAssignment::Single(token.clone()));
                });
                self.disseminate(request_id).await
            }
            CoordinateReply::Assigned(TokenAssignment::Vector(tokens)) => {
                let observer = self.observer();
                let complete = self
                    .outstanding
                    .with_mut(request_id, |pending| {
                        let mut complete = false;
                        for entry in tokens {
                            let accepted = observer.on_token_acquired(
                                sender,
                                &pending.header.operation,
                                &entry.token,
                            );
                            if !accepted {
                                tracing::debug!(
                                    %request_id,
                                    index = entry.index,
                                    "slot token from a deposed sequencer, kept waiting"
                                );
                                continue;
                            }
                            if let Some(collector) = pending.collector.as_mut() {
                                complete = collector.add(entry);
                            }
                        }
                        if complete {
                            if let Some(collector) = pending.collector.take() {
                                pending.assignment =
                                    Some(TokenAssignment::Vector(collector.into_assignment()));
                            }
                        }
                        complete
                    })
                    .unwrap_or(false);

                if complete {
                    tracing::debug!(%request_id, "all composite slots tokened");
                    self.disseminate(request_id).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Disseminate a fully tokened request to the group.
    async fn disseminate(self: &Arc<Self>, request_id: RequestId) -> Result<()> {
        let Some((header, args, assignment)) = self.outstanding.with_mut(request_id, |pending| {
            (
                pending.header.clone(),
                pending.args.clone(),
                pending.assignment.clone(),
            )
        }) else {
            return Ok(());
        };
        let op = self.context.operation(&header.operation)?;

        // a side-effecting operation runs once, here, gated at the
        // requester; the group receives only its recorded result
        let result = if op.is_side_effecting() {
            let this = self.clone();
            let pre = DeliverMessage {
                header: header.clone(),
                assignment: assignment.clone(),
                args: args.clone(),
                result: None,
            };
            tokio::task::spawn_blocking(move || this.execute_gated(&pre, ExecuteMode::Origin))
                .await
                .map_err(|err| OrdoError::internal(err.to_string()))?
        } else {
            None
        };

        let deliver = DeliverMessage {
            header,
            assignment,
            args,
            result,
        };
        self.transport
            .multicast(Envelope::correlated(
                self.node,
                request_id,
                Payload::Deliver(deliver),
            ))
            .await
    }

    /// Every node: gate and execute a disseminated request.
    async fn handle_deliver(
        self: &Arc<Self>,
        request_id: RequestId,
        message: DeliverMessage,
    ) -> Result<()> {
        let op = self.context.operation(&message.header.operation)?;

        // completion observed: the sequencer among the receivers releases
        // its assigned-token records
        if let Some(assignment) = &message.assignment {
            self.observer()
                .on_broadcast_observed(message.header.requester, assignment);
        }

        let own = message.header.requester == self.node;
        if own && !message.header.unordered && self.outstanding.remove(request_id).is_none() {
            tracing::debug!(
                %request_id,
                "own dissemination no longer correlated, assumed superseded"
            );
            return Ok(());
        }

        if own && op.is_side_effecting() {
            // already executed before dissemination; release the records
            let observer = self.observer();
            if let Some(assignment) = &message.assignment {
                for token in assignment.tokens() {
                    observer.on_executed(&message.header.operation, token);
                }
            }
            return Ok(());
        }

        let mode = if own {
            ExecuteMode::Origin
        } else {
            ExecuteMode::Replica
        };

        if message.assignment.is_none() {
            // unordered requests skip gating entirely
            self.execute_gated(&message, mode);
            return Ok(());
        }

        // hand the gated execution to the blocking pool: the gate may
        // suspend until predecessors arrive, and that must never stall the
        // task processing inbound messages
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.execute_gated(&message, mode))
            .await
            .map_err(|err| OrdoError::internal(err.to_string()))?;
        Ok(())
    }

    /// Gate and execute one delivery. Runs on the blocking pool for ordered
    /// requests. Returns the result payload of the executed operation.
    fn execute_gated(&self, message: &DeliverMessage, mode: ExecuteMode) -> Option<Vec<u8>> {
        let op = match self.context.operation(&message.header.operation) {
            Ok(op) => op,
            Err(err) => {
                tracing::error!(error = %err, "dissemination for unknown operation");
                return None;
            }
        };
        let session = message.header.session.as_deref();

        match &message.assignment {
            None => Some(self.run_payload(&op, message, mode)),
            Some(TokenAssignment::Single(token)) => {
                let outcome = op.deliver_gated(session, token, || {
                    self.run_payload(&op, message, mode)
                });
                let result = outcome.into_result();
                // a side-effecting origin runs before dissemination; its
                // record is released once the own dissemination is observed
                if result.is_some() && mode == ExecuteMode::Origin && !op.is_side_effecting() {
                    self.observer()
                        .on_executed(&message.header.operation, token);
                }
                result
            }
            Some(TokenAssignment::Vector(tokens)) => {
                let Some(plan) = op.composite() else {
                    tracing::error!(
                        operation = %message.header.operation,
                        "token vector for a non-composite operation"
                    );
                    return None;
                };
                let by_index: HashMap<usize, &Token> = tokens
                    .iter()
                    .map(|entry| (entry.index, &entry.token))
                    .collect();
                // leaves execute in program order, each gated by its own
                // partition
                for (index, leaf) in plan.leaves.iter().enumerate() {
                    let Ok(leaf_op) = self.context.operation(&leaf.name) else {
                        continue;
                    };
                    match by_index.get(&index) {
                        Some(token) => {
                            let outcome = leaf_op.deliver_gated(session, token, || {
                                self.handler.execute(&leaf.name, session, &message.args);
                            });
                            if outcome.into_result().is_some() && mode == ExecuteMode::Origin {
                                self.observer().on_executed(&leaf.name, token);
                            }
                        }
                        None => {
                            self.handler.execute(&leaf.name, session, &message.args);
                        }
                    }
                }
                None
            }
        }
    }

    /// Execute or install one leaf payload.
    fn run_payload(
        &self,
        op: &Arc<Operation>,
        message: &DeliverMessage,
        mode: ExecuteMode,
    ) -> Vec<u8> {
        let session = message.header.session.as_deref();
        if matches!(op.kind(), ResolvedKind::SideEffecting) && mode == ExecuteMode::Replica {
            if let Some(result) = &message.result {
                tracing::debug!(
                    operation = %op.name(),
                    "installing recorded side-effecting result"
                );
                self.handler.install(op.name(), session, result);
                return result.clone();
            }
        }
        tracing::debug!(node = %self.node, operation = %op.name(), "executing operation");
        self.handler.execute(op.name(), session, &message.args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecuteMode {
    /// This node originated the request
    Origin,
    /// This node replays someone else's request
    Replica,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ordo_core::partition::PartitionScope;
    use ordo_core::service::OperationSpec;
    use ordo_core::token::PartitionId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Option<NodeId>, Envelope)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn unicast(&self, target: NodeId, envelope: Envelope) -> Result<()> {
            self.sent.lock().push((Some(target), envelope));
            Ok(())
        }

        async fn multicast(&self, envelope: Envelope) -> Result<()> {
            self.sent.lock().push((None, envelope));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        executed: Mutex<Vec<String>>,
    }

    impl OperationHandler for RecordingHandler {
        fn execute(&self, operation: &str, _session: Option<&str>, _args: &[u8]) -> Vec<u8> {
            self.executed.lock().push(operation.to_owned());
            vec![1]
        }

        fn install(&self, operation: &str, _session: Option<&str>, _result: &[u8]) {
            self.executed.lock().push(format!("install:{operation}"));
        }
    }

    fn context(sequencer: NodeId) -> Arc<OrderingContext> {
        Arc::new(
            OrderingContext::builder()
                .partition(PartitionId(1), PartitionScope::FullyOrdered, sequencer)
                .partition(PartitionId(2), PartitionScope::Unordered, sequencer)
                .operation(OperationSpec::simple("kv.put", PartitionId(1)))
                .operation(OperationSpec::unordered("kv.stats", PartitionId(2)))
                .build()
                .expect("valid context"),
        )
    }

    fn protocol(
        node: NodeId,
        sequencer: NodeId,
    ) -> (
        Arc<OrderingProtocol>,
        Arc<RecordingTransport>,
        Arc<RecordingHandler>,
    ) {
        let transport = Arc::new(RecordingTransport::default());
        let handler = Arc::new(RecordingHandler::default());
        let protocol = OrderingProtocol::new(
            node,
            context(sequencer),
            transport.clone(),
            handler.clone(),
        );
        (protocol, transport, handler)
    }

    #[tokio::test]
    async fn unordered_submit_disseminates_immediately() {
        let (protocol, transport, _) = protocol(NodeId(1), NodeId(2));
        protocol
            .submit("kv.stats", None, vec![])
            .await
            .expect("submitted");

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.is_none());
        assert!(matches!(sent[0].1.payload, Payload::Deliver(_)));
        assert!(protocol.outstanding().is_empty());
    }

    #[tokio::test]
    async fn ordered_submit_coordinates_with_sequencer() {
        let (protocol, transport, _) = protocol(NodeId(1), NodeId(2));
        let id = protocol
            .submit("kv.put", None, b"v".to_vec())
            .await
            .expect("submitted");

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Some(NodeId(2)));
        assert_eq!(sent[0].1.request_id, id);
        assert!(matches!(sent[0].1.payload, Payload::Coordinate(_)));
        assert!(protocol.outstanding().contains(id));
    }

    #[tokio::test]
    async fn sequencer_assigns_and_replies() {
        let (protocol, transport, _) = protocol(NodeId(2), NodeId(2));
        let request = CoordinateRequest {
            header: RequestHeader {
                operation: "kv.put".to_owned(),
                session: None,
                requester: NodeId(1),
                unordered: false,
            },
            retransmit_indices: None,
        };
        protocol
            .handle(Envelope::new(NodeId(1), Payload::Coordinate(request)))
            .await
            .expect("handled");

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Some(NodeId(1)));
        match &sent[0].1.payload {
            Payload::CoordinateReply(CoordinateReply::Assigned(TokenAssignment::Single(
                token,
            ))) => {
                assert_eq!((token.seqno, token.concurrentno), (0, None));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_sequencer_refuses_assignment() {
        let (protocol, transport, _) = protocol(NodeId(3), NodeId(2));
        let request = CoordinateRequest {
            header: RequestHeader {
                operation: "kv.put".to_owned(),
                session: None,
                requester: NodeId(1),
                unordered: false,
            },
            retransmit_indices: None,
        };
        protocol
            .handle(Envelope::new(NodeId(1), Payload::Coordinate(request)))
            .await
            .expect("handled");

        let sent = transport.sent.lock();
        assert!(matches!(
            sent[0].1.payload,
            Payload::CoordinateReply(CoordinateReply::NotSequencer)
        ));
    }

    #[tokio::test]
    async fn stale_coordinate_reply_is_discarded() {
        let (protocol, transport, _) = protocol(NodeId(1), NodeId(2));
        let reply = CoordinateReply::Assigned(TokenAssignment::Single(
            Token::unbatched(0).with_partition(PartitionId(1)),
        ));
        // no outstanding request with this id
        protocol
            .handle(Envelope::new(NodeId(2), Payload::CoordinateReply(reply)))
            .await
            .expect("handled");
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn acquired_token_triggers_dissemination() {
        let (protocol, transport, _) = protocol(NodeId(1), NodeId(2));
        let id = protocol
            .submit("kv.put", None, b"v".to_vec())
            .await
            .expect("submitted");
        transport.sent.lock().clear();

        let reply = CoordinateReply::Assigned(TokenAssignment::Single(
            Token::unbatched(0).with_partition(PartitionId(1)),
        ));
        protocol
            .handle(Envelope::correlated(
                NodeId(2),
                id,
                Payload::CoordinateReply(reply),
            ))
            .await
            .expect("handled");

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.is_none());
        match &sent[0].1.payload {
            Payload::Deliver(message) => {
                assert_eq!(message.args, b"v".to_vec());
                assert!(message.assignment.is_some());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivery_gates_and_executes_in_order() {
        let (protocol, _, handler) = protocol(NodeId(3), NodeId(2));

        let deliver = |seqno: i32, tag: &str| {
            Envelope::new(
                NodeId(1),
                Payload::Deliver(DeliverMessage {
                    header: RequestHeader {
                        operation: "kv.put".to_owned(),
                        session: None,
                        requester: NodeId(1),
                        unordered: false,
                    },
                    assignment: Some(TokenAssignment::Single(
                        Token::unbatched(seqno).with_partition(PartitionId(1)),
                    )),
                    args: tag.as_bytes().to_vec(),
                    result: None,
                }),
            )
        };

        // deliver slot 1 on its own task; it must suspend until slot 0 lands
        let blocked = {
            let protocol = protocol.clone();
            let envelope = deliver(1, "second");
            tokio::spawn(async move { protocol.handle(envelope).await })
        };
        tokio::task::yield_now().await;
        protocol
            .handle(deliver(0, "first"))
            .await
            .expect("handled");
        blocked.await.expect("joined").expect("handled");

        assert_eq!(handler.executed.lock().len(), 2);
    }
}
