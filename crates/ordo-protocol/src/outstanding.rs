//! Outstanding-request cache.
//!
//! Every request this node has originated stays here until its delivery
//! completes. The cache is shared with the fault-tolerance engine, which
//! scans it after a skip agreement to retransmit requests whose coordination
//! became indeterminate with the crashed sequencer.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use ordo_core::registry::OrderingContext;
use ordo_core::token::{NodeId, PartitionId};

use crate::collector::TokenCollector;
use crate::messages::{
    CoordinateRequest, Envelope, Payload, RequestHeader, RequestId, TokenAssignment,
};

/// One request originated by this node, awaiting its tokens or delivery.
#[derive(Debug)]
pub struct PendingRequest {
    /// The request header as sent
    pub header: RequestHeader,
    /// Operation payload, replayed on dissemination
    pub args: Vec<u8>,
    /// Sub-token accumulator for composite requests
    pub collector: Option<TokenCollector>,
    /// Final tokens, once acquired
    pub assignment: Option<TokenAssignment>,
    /// Whether a crash of the coordinating sequencer must trigger a resend
    pub needs_retransmission: bool,
    /// The sequencer the coordinate request was last sent to
    pub coordinated_by: Option<NodeId>,
}

impl PendingRequest {
    /// A pending simple request.
    pub fn simple(header: RequestHeader, args: Vec<u8>) -> Self {
        Self {
            header,
            args,
            collector: None,
            assignment: None,
            needs_retransmission: true,
            coordinated_by: None,
        }
    }

    /// A pending composite request with its collector.
    pub fn composite(header: RequestHeader, args: Vec<u8>, collector: TokenCollector) -> Self {
        Self {
            header,
            args,
            collector: Some(collector),
            assignment: None,
            // composite resends are driven by the collector's waiting set
            needs_retransmission: false,
            coordinated_by: None,
        }
    }
}

/// The cache of requests this node has sent and not yet completed.
#[derive(Debug, Default)]
pub struct OutstandingRequests {
    inner: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl OutstandingRequests {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request.
    pub fn insert(&self, id: RequestId, pending: PendingRequest) {
        self.inner.lock().insert(id, pending);
    }

    /// Stop tracking a request.
    pub fn remove(&self, id: RequestId) -> Option<PendingRequest> {
        self.inner.lock().remove(&id)
    }

    /// Whether a request is tracked.
    pub fn contains(&self, id: RequestId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    /// Number of tracked requests.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Mutate a tracked request, if present.
    pub fn with_mut<R>(
        &self,
        id: RequestId,
        mutate: impl FnOnce(&mut PendingRequest) -> R,
    ) -> Option<R> {
        self.inner.lock().get_mut(&id).map(mutate)
    }

    /// Build the coordinate requests to resend after a skip agreement.
    ///
    /// A composite request resends exactly its still-waiting slot indices
    /// that belong to affected partitions; a simple request resends when its
    /// partition is affected, still suspended, and no token has arrived.
    pub fn collect_retransmissions(
        &self,
        node: NodeId,
        affected: &HashSet<PartitionId>,
        context: &OrderingContext,
    ) -> Vec<Envelope> {
        let inner = self.inner.lock();
        let mut resend = Vec::new();

        for (id, pending) in inner.iter() {
            let Ok(operation) = context.operation(&pending.header.operation) else {
                continue;
            };

            if let Some(collector) = &pending.collector {
                if !collector.needs_retransmission() {
                    continue;
                }
                let Some(plan) = operation.composite() else {
                    continue;
                };
                let indices: Vec<usize> = collector
                    .waiting_indices()
                    .into_iter()
                    .filter(|&index| {
                        plan.leaves
                            .get(index)
                            .map(|leaf| affected.contains(&leaf.partition))
                            .unwrap_or(false)
                    })
                    .collect();
                if indices.is_empty() {
                    continue;
                }
                tracing::debug!(
                    request = %id,
                    operation = %pending.header.operation,
                    ?indices,
                    "retransmitting composite slots"
                );
                resend.push(Envelope::correlated(
                    node,
                    *id,
                    Payload::Coordinate(CoordinateRequest {
                        header: pending.header.clone(),
                        retransmit_indices: Some(indices),
                    }),
                ));
            } else if pending.needs_retransmission && pending.assignment.is_none() {
                let Some(partition) = operation.partition_id() else {
                    continue;
                };
                let suspended = context
                    .partition(partition)
                    .map(|handle| !handle.is_accepting_requests())
                    .unwrap_or(false);
                if affected.contains(&partition) && suspended {
                    tracing::debug!(
                        request = %id,
                        operation = %pending.header.operation,
                        %partition,
                        "retransmitting request"
                    );
                    resend.push(Envelope::correlated(
                        node,
                        *id,
                        Payload::Coordinate(CoordinateRequest {
                            header: pending.header.clone(),
                            retransmit_indices: None,
                        }),
                    ));
                }
            }
        }
        resend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_core::partition::PartitionScope;
    use ordo_core::service::OperationSpec;

    fn header(operation: &str) -> RequestHeader {
        RequestHeader {
            operation: operation.to_owned(),
            session: None,
            requester: NodeId(1),
            unordered: false,
        }
    }

    fn context() -> OrderingContext {
        OrderingContext::builder()
            .partition(PartitionId(1), PartitionScope::FullyOrdered, NodeId(2))
            .partition(PartitionId(2), PartitionScope::FullyOrdered, NodeId(3))
            .operation(OperationSpec::simple("a", PartitionId(1)))
            .operation(OperationSpec::simple("b", PartitionId(2)))
            .operation(OperationSpec::composite("both", ["a", "b"]))
            .build()
            .expect("valid context")
    }

    #[test]
    fn simple_request_retransmits_when_partition_suspended() {
        let context = context();
        let cache = OutstandingRequests::new();
        let id = RequestId::fresh();
        cache.insert(id, PendingRequest::simple(header("a"), vec![]));

        let affected: HashSet<PartitionId> = [PartitionId(1)].into_iter().collect();

        // partition still accepting: no resend
        assert!(cache
            .collect_retransmissions(NodeId(1), &affected, &context)
            .is_empty());

        context
            .partition(PartitionId(1))
            .expect("partition")
            .suspend_requests(NodeId(4));
        let resend = cache.collect_retransmissions(NodeId(1), &affected, &context);
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].request_id, id);
    }

    #[test]
    fn tokened_request_is_not_retransmitted() {
        let context = context();
        context
            .partition(PartitionId(1))
            .expect("partition")
            .suspend_requests(NodeId(4));
        let cache = OutstandingRequests::new();
        let id = RequestId::fresh();
        let mut pending = PendingRequest::simple(header("a"), vec![]);
        pending.needs_retransmission = false;
        cache.insert(id, pending);

        let affected: HashSet<PartitionId> = [PartitionId(1)].into_iter().collect();
        assert!(cache
            .collect_retransmissions(NodeId(1), &affected, &context)
            .is_empty());
    }

    #[test]
    fn composite_resends_only_waiting_slots_of_affected_partitions() {
        let context = context();
        let cache = OutstandingRequests::new();
        let id = RequestId::fresh();

        let mut collector = TokenCollector::new(2, [0, 1]);
        // slot 1 (partition 2) already has its token
        let _ = collector.add(crate::messages::IndexedToken {
            index: 1,
            token: ordo_core::token::Token::unbatched(0),
        });
        cache.insert(id, PendingRequest::composite(header("both"), vec![], collector));

        let affected: HashSet<PartitionId> =
            [PartitionId(1), PartitionId(2)].into_iter().collect();
        let resend = cache.collect_retransmissions(NodeId(1), &affected, &context);
        assert_eq!(resend.len(), 1);
        match &resend[0].payload {
            Payload::Coordinate(request) => {
                assert_eq!(request.retransmit_indices.as_deref(), Some(&[0][..]));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
