//! The fault-tolerance engine.
//!
//! Orchestrates sequencer-crash recovery: it keeps the in-flight token
//! caches current through the protocol's observer seam, runs the
//! decentralized consensus collection when this node is the candidate
//! sequencer for a crashed partition, broadcasts the agreed skip list, and
//! applies incoming agreements — queueing skips, releasing suspended
//! deliveries, and retransmitting requests whose coordination died with the
//! old sequencer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use ordo_core::errors::Result;
use ordo_core::registry::{OrderingContext, PartitionHandle};
use ordo_core::token::{NodeId, PartitionId, Token};

use ordo_protocol::messages::{
    AgreementMessage, ConsensusReport, ConsensusRequest, Envelope, Payload, PartitionReport,
    RequestId, SessionDomainReport, SessionReport, TokenAssignment, View,
};
use ordo_protocol::observer::FaultObserver;
use ordo_protocol::outstanding::OutstandingRequests;
use ordo_protocol::transport::Transport;

use crate::caches::{AssignedCache, ExecutedCache};

/// How many consensus reports that raced ahead of the local crash
/// notification are buffered for replay.
const PENDING_REPORT_LIMIT: usize = 64;

/// Picks the candidate sequencer for a crashed partition. Consumed from the
/// election layer; the default takes the lowest surviving node id, which
/// every survivor resolves identically.
pub trait SequencerElector: Send + Sync {
    /// The node that should sequence `partition` now that `crashed` is gone.
    fn next_sequencer(
        &self,
        partition: PartitionId,
        crashed: NodeId,
        surviving: &View,
    ) -> Option<NodeId>;
}

/// Deterministic default election: the lowest surviving node id.
#[derive(Debug, Default)]
pub struct LowestSurvivorElector;

impl SequencerElector for LowestSurvivorElector {
    fn next_sequencer(
        &self,
        _partition: PartitionId,
        _crashed: NodeId,
        surviving: &View,
    ) -> Option<NodeId> {
        surviving.members.iter().min().copied()
    }
}

/// Recovery state of one partition, as seen by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// No recovery in progress
    Normal,
    /// This node is the candidate sequencer, collecting survivor state
    CandidateCollecting,
}

/// Crash-recovery engine of one node.
pub struct FaultToleranceEngine {
    node: NodeId,
    context: Arc<OrderingContext>,
    transport: Arc<dyn Transport>,
    outstanding: Arc<OutstandingRequests>,
    elector: Arc<dyn SequencerElector>,
    assigned: AssignedCache,
    executed: ExecutedCache,
    /// Partitions this node is candidate-collecting for, with the view the
    /// collection was opened under.
    collecting: Mutex<HashMap<PartitionId, Option<u64>>>,
    /// Reports that arrived before the local crash notification opened the
    /// collection.
    pending_reports: Mutex<Vec<(NodeId, ConsensusReport)>>,
}

impl FaultToleranceEngine {
    /// Create the engine for `node`, sharing the protocol's outstanding
    /// cache.
    pub fn new(
        node: NodeId,
        context: Arc<OrderingContext>,
        transport: Arc<dyn Transport>,
        outstanding: Arc<OutstandingRequests>,
        elector: Arc<dyn SequencerElector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            context,
            transport,
            outstanding,
            elector,
            assigned: AssignedCache::new(),
            executed: ExecutedCache::new(),
            collecting: Mutex::new(HashMap::new()),
            pending_reports: Mutex::new(Vec::new()),
        })
    }

    /// The recovery phase of `partition` on this node.
    pub fn phase(&self, partition: PartitionId) -> RecoveryPhase {
        if self.collecting.lock().contains_key(&partition) {
            RecoveryPhase::CandidateCollecting
        } else {
            RecoveryPhase::Normal
        }
    }

    /// Drop assigned-token records of a partition whose sequencer role was
    /// handed over to a joining node.
    pub fn on_sequencer_handover(&self, partition: PartitionId) {
        self.assigned.release_partition(partition);
    }

    // ---- crash protocol ---------------------------------------------------

    /// Drive recovery for a crashed node. Must not run on the thread that
    /// delivers inbound transport messages; see the [`MembershipListener`]
    /// impl, which hands the work to a fresh task.
    pub async fn process_crash(self: &Arc<Self>, crashed: NodeId, surviving: View) -> Result<()> {
        tracing::info!(%crashed, view = surviving.id, "processing node crash");

        // the crashed node may have been a reporter in an ongoing collection
        let in_progress: Vec<PartitionId> = self.collecting.lock().keys().copied().collect();
        for partition in in_progress {
            let Ok(handle) = self.context.partition(partition) else {
                continue;
            };
            if handle.note_reporter(crashed) && handle.collection_finished() {
                tracing::debug!(
                    %partition,
                    %crashed,
                    "reporter crashed, collection completed by its removal"
                );
                self.finish_collection(partition).await?;
            }
        }

        // tokens assigned to the crashed requester can never complete; the
        // group skips them without consensus
        let orphaned = self.assigned.drain_for_node(crashed);
        if !orphaned.is_empty() {
            tracing::info!(
                count = orphaned.len(),
                %crashed,
                "broadcasting skips for a crashed requester"
            );
            self.transport
                .multicast(Envelope::new(
                    self.node,
                    Payload::Agreement(AgreementMessage {
                        partitions: Vec::new(),
                        skips: orphaned,
                        triggers_retransmission: false,
                        view_id: None,
                    }),
                ))
                .await?;
        }

        // partitions the crashed node sequenced: suspend, elect, and collect
        // when this node is the candidate
        let mut candidate_for = Vec::new();
        for handle in self.context.partitions() {
            if !handle.is_sequencer(crashed) {
                continue;
            }
            let Some(new_sequencer) =
                self.elector
                    .next_sequencer(handle.id(), crashed, &surviving)
            else {
                continue;
            };
            handle.suspend_requests(new_sequencer);
            tracing::info!(
                partition = %handle.id(),
                %new_sequencer,
                "sequencer crashed, partition suspended"
            );
            if new_sequencer == self.node {
                handle.begin_collection(surviving.members.iter().copied());
                self.collecting.lock().insert(handle.id(), Some(surviving.id));
                candidate_for.push(handle.id());
            }
        }

        if !candidate_for.is_empty() {
            tracing::info!(
                partitions = ?candidate_for,
                "requesting survivor state as candidate sequencer"
            );
            self.transport
                .multicast(Envelope::new(
                    self.node,
                    Payload::ConsensusRequest(ConsensusRequest {
                        partitions: candidate_for,
                    }),
                ))
                .await?;

            // replay reports that raced ahead of this crash notification
            let stashed: Vec<(NodeId, ConsensusReport)> =
                self.pending_reports.lock().drain(..).collect();
            for (sender, report) in stashed {
                self.apply_report(sender, report).await?;
            }
        }
        Ok(())
    }

    /// Process one inbound recovery envelope.
    pub async fn handle(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        match envelope.payload {
            Payload::ConsensusRequest(request) => {
                self.answer_consensus(envelope.sender, envelope.request_id, request)
                    .await
            }
            Payload::ConsensusReport(report) => self.accept_report(envelope.sender, report).await,
            Payload::Agreement(agreement) => self.apply_agreement(envelope.sender, agreement).await,
            other => {
                tracing::warn!(
                    payload = ?other,
                    "ordering payload routed to the fault-tolerance engine, ignoring"
                );
                Ok(())
            }
        }
    }

    /// Survivor side: answer a candidate's state request with this node's
    /// unproposed executed tokens and expected positions.
    async fn answer_consensus(
        &self,
        sender: NodeId,
        request_id: RequestId,
        request: ConsensusRequest,
    ) -> Result<()> {
        let mut partitions = Vec::new();
        let mut session_domain = None;

        for partition in request.partitions {
            let Ok(handle) = self.context.partition(partition) else {
                continue;
            };
            match &handle {
                PartitionHandle::Plain(plain) => {
                    partitions.push(PartitionReport {
                        partition,
                        latest: plain.expected_token().with_partition(partition),
                        reported: self.executed.unproposed(partition),
                    });
                }
                PartitionHandle::Session(session) => {
                    let mut grouped: HashMap<String, Vec<Token>> = HashMap::new();
                    for token in self.executed.unproposed(partition) {
                        if let Some(key) = token.session.clone() {
                            grouped.entry(key).or_default().push(token);
                        }
                    }
                    let sessions = session
                        .expected_states()
                        .into_iter()
                        .map(|(key, latest)| SessionReport {
                            reported: grouped.remove(&key).unwrap_or_default(),
                            latest: latest.with_partition(partition).with_session(key.clone()),
                            session: key,
                        })
                        .collect();
                    session_domain = Some(SessionDomainReport { partition, sessions });
                }
            }
        }

        tracing::debug!(
            candidate = %sender,
            partitions = partitions.len(),
            "answering consensus request"
        );
        self.transport
            .unicast(
                sender,
                Envelope::correlated(
                    self.node,
                    request_id,
                    Payload::ConsensusReport(ConsensusReport {
                        partitions,
                        session_domain,
                    }),
                ),
            )
            .await
    }

    /// Candidate side: accept one survivor's report, buffering it when the
    /// local crash notification has not opened the collection yet.
    async fn accept_report(self: &Arc<Self>, sender: NodeId, report: ConsensusReport) -> Result<()> {
        let covered: Vec<PartitionId> = report
            .partitions
            .iter()
            .map(|part| part.partition)
            .chain(report.session_domain.as_ref().map(|domain| domain.partition))
            .collect();
        let opened = {
            let collecting = self.collecting.lock();
            covered.iter().any(|partition| collecting.contains_key(partition))
        };
        if !opened {
            tracing::debug!(
                %sender,
                "consensus report ahead of the crash notification, buffering"
            );
            let mut pending = self.pending_reports.lock();
            if pending.len() < PENDING_REPORT_LIMIT {
                pending.push((sender, report));
            }
            return Ok(());
        }
        self.apply_report(sender, report).await
    }

    async fn apply_report(&self, sender: NodeId, report: ConsensusReport) -> Result<()> {
        let mut touched = Vec::new();

        for part in report.partitions {
            let Ok(PartitionHandle::Plain(plain)) = self.context.partition(part.partition) else {
                continue;
            };
            if !plain.note_reporter(sender) {
                tracing::debug!(
                    %sender,
                    partition = %part.partition,
                    "report from an unexpected node, ignoring"
                );
                continue;
            }
            // reported tokens become assigned state of the new sequencer, so
            // a subsequent crash of the reporter stays recoverable
            for token in &part.reported {
                self.assigned.record(sender, token.clone());
            }
            plain.add_collected(part.reported, part.latest);
            touched.push(part.partition);
        }

        if let Some(domain) = report.session_domain {
            if let Ok(PartitionHandle::Session(session)) = self.context.partition(domain.partition)
            {
                if session.note_reporter(sender) {
                    for entry in domain.sessions {
                        for token in &entry.reported {
                            self.assigned.record(sender, token.clone());
                        }
                        session.add_collected(&entry.session, entry.reported, entry.latest);
                    }
                    touched.push(domain.partition);
                }
            }
        }

        for partition in touched {
            if !self.collecting.lock().contains_key(&partition) {
                continue;
            }
            let handle = self.context.partition(partition)?;
            if handle.collection_finished() {
                tracing::debug!(%partition, "every survivor reported");
                self.finish_collection(partition).await?;
            }
        }
        Ok(())
    }

    /// Every survivor reported: reconstruct the gap and broadcast the
    /// agreement.
    async fn finish_collection(&self, partition: PartitionId) -> Result<()> {
        let view_id = self.collecting.lock().remove(&partition).flatten();
        let handle = self.context.partition(partition)?;
        let skips = handle.extract_skips();
        tracing::info!(
            %partition,
            skips = skips.len(),
            "survivor state agreed, broadcasting skip list"
        );
        self.transport
            .multicast(Envelope::new(
                self.node,
                Payload::Agreement(AgreementMessage {
                    partitions: vec![partition],
                    skips,
                    triggers_retransmission: true,
                    view_id,
                }),
            ))
            .await
    }

    /// Every node: apply an agreed skip list, release suspended deliveries,
    /// and retransmit indeterminate requests to the agreement's sender.
    async fn apply_agreement(&self, sender: NodeId, agreement: AgreementMessage) -> Result<()> {
        let mut affected: HashSet<PartitionId> = agreement.partitions.iter().copied().collect();
        let mut marked: HashSet<PartitionId> = HashSet::new();

        for token in &agreement.skips {
            let Some(partition) = token.partition else {
                continue;
            };
            let Ok(handle) = self.context.partition(partition) else {
                continue;
            };
            affected.insert(partition);
            if marked.insert(partition) {
                // no tokens are cached while suspended, so the mark covers
                // exactly what this round proposed
                self.executed.mark_all_proposed(partition);
            }
            tracing::debug!(%partition, skip = %token, "queueing agreed skip");
            handle.add_skip(token.clone());
        }

        // the sender of a retransmission agreement is the partitions' agreed
        // new sequencer; install it even when the local crash notification
        // has not been processed yet
        if agreement.triggers_retransmission {
            for partition in &agreement.partitions {
                if let Ok(handle) = self.context.partition(*partition) {
                    handle.set_sequencer(sender);
                }
            }
        }

        // partitions the sender now sequences release their suspensions even
        // when no skip named them
        for handle in self.context.partitions() {
            if handle.is_sequencer(sender) {
                affected.insert(handle.id());
            }
        }

        if agreement.triggers_retransmission {
            let resend =
                self.outstanding
                    .collect_retransmissions(self.node, &affected, &self.context);
            tracing::info!(
                resend = resend.len(),
                new_sequencer = %sender,
                "retransmitting indeterminate requests"
            );
            for envelope in resend {
                self.transport.unicast(sender, envelope).await?;
            }
        }

        for partition in &affected {
            let Ok(handle) = self.context.partition(*partition) else {
                continue;
            };
            if !handle.is_accepting_requests() {
                handle.allow_requests();
            }
            handle.trigger_all();
            self.collecting.lock().remove(partition);
        }

        tracing::info!(
            skips = agreement.skips.len(),
            retransmission = agreement.triggers_retransmission,
            "applied skip agreement"
        );
        Ok(())
    }
}

impl FaultObserver for FaultToleranceEngine {
    fn on_tokens_assigned(&self, requester: NodeId, assignment: &TokenAssignment) {
        for token in assignment.tokens() {
            self.assigned.record(requester, token.clone());
        }
    }

    fn on_token_acquired(&self, sequencer: NodeId, _operation: &str, token: &Token) -> bool {
        let Some(partition) = token.partition else {
            return true;
        };
        let Ok(handle) = self.context.partition(partition) else {
            return true;
        };
        if !handle.is_sequencer(sequencer) {
            tracing::debug!(
                %partition,
                %sequencer,
                %token,
                "token from a deposed sequencer, rejected"
            );
            return false;
        }
        self.executed.record(token.clone());
        true
    }

    fn on_broadcast_observed(&self, requester: NodeId, assignment: &TokenAssignment) {
        for token in assignment.tokens() {
            let Some(partition) = token.partition else {
                continue;
            };
            let Ok(handle) = self.context.partition(partition) else {
                continue;
            };
            if handle.is_sequencer(self.node) {
                self.assigned.release(requester, token);
            }
        }
    }

    fn on_executed(&self, _operation: &str, token: &Token) {
        self.executed.release(token);
    }
}

impl FaultToleranceEngine {
    /// Membership hook: a node joined the group.
    pub fn on_node_join(&self, node: NodeId) {
        tracing::info!(%node, "node joined the group");
    }

    /// Membership hook: a node crashed. Hands recovery to a fresh task so the
    /// collection never runs on the thread delivering transport messages.
    pub fn on_node_crash(self: &Arc<Self>, node: NodeId, surviving: &View) {
        // the collection must never run on the thread delivering transport
        // messages; hand it to a fresh task
        let engine = self.clone();
        let surviving = surviving.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.process_crash(node, surviving).await {
                tracing::error!(error = %err, "crash recovery failed");
            }
        });
    }
}
