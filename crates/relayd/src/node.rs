//! The Relay node
//!
//! A single task owns the event DAG and applies every structural change:
//! admission, revocation, consensus rounds, pruning and reconciliation.
//! Everything else talks to it over a command channel. Admitted events fan
//! out to the fork resolver, the integrity monitor and the outbound path
//! (gossip or offline buffer), each running in its own task, so a failure
//! in one of them cannot leave the DAG half-updated.
//!
//! Reads for presentation go straight to the store under a read lock.

use crate::config::NodeConfig;
use crate::event_store::{AddOutcome, EventStore, StoreError, StoreStats};
use crate::fork::{
    Fork, ForkAction, ForkError, ForkResolution, ForkResolver, ForkStats, ResolutionMethod,
};
use crate::gossip::{GossipError, GossipPropagator, GossipStats};
use crate::integrity::{
    AlertStatus, AlertType, AlertUpdate, DetectionAlert, IntegrityError, IntegrityMonitor,
    IntegrityStats, RiskAnalysis,
};
use crate::partition::{
    OfflineBufferStatus, PartitionCoordinator, PartitionRecord, PartitionStats,
    PartitionTransition, PartitionType,
};
use crate::scheduler::{Scheduler, TaskStats};
use crate::sinks::Sinks;
use crate::storage::{Storage, StorageError};
use parking_lot::{Mutex, RwLock};
use relay_core::crypto::dag_snapshot_hash;
use relay_core::types::*;
use relay_net::framing::FrameError;
use relay_net::messages::{EventBatch, Heartbeat, StateRequest, StateResponse};
use relay_net::{Frame, FrameType, PeerId, PeerInfo, Transport, TransportError, TransportEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_STREAM_CAPACITY: usize = 4096;
const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Source of unix-millisecond timestamps
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Wall-clock time
pub fn system_clock() -> Clock {
    Arc::new(now_millis)
}

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),
    #[error("Fork error: {0}")]
    Fork(#[from] ForkError),
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Event {0} is waiting on missing parents")]
    Parked(EventId),
    #[error("Node is shutting down")]
    ShuttingDown,
}

/// Where an admitted event came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote(PeerId),
    /// Reported by a peer during partition reconciliation
    Reconciled,
}

/// Everything observable that happens inside the node
#[derive(Clone, Debug)]
pub enum NodeEvent {
    EventAdmitted { event: Event, origin: Origin },
    EventPending { id: EventId, missing: Vec<EventId> },
    EventRejected { id: Option<EventId>, reason: String },
    ConsensusReached { id: EventId, round: u64 },
    EventsRevoked { ids: Vec<EventId>, reason: String },
    ForkDetected(Fork),
    ModeratorRequested {
        fork_id: ForkId,
        channel: ChannelId,
        conflicting: Vec<EventId>,
    },
    ForkResolved(ForkResolution),
    AlertRaised(DetectionAlert),
    PartitionDetected {
        kind: PartitionType,
        remaining_peers: usize,
    },
    RecoveryStarted { peers: Vec<PeerId> },
    PartitionRecovered(PartitionRecord),
}

/// Periodic work items
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickKind {
    Gossip,
    Heartbeat,
    HealthCheck,
    Consensus,
    ForkTimers,
    Prune,
    Cleanup,
}

impl TickKind {
    pub const ALL: [TickKind; 7] = [
        TickKind::Gossip,
        TickKind::Heartbeat,
        TickKind::HealthCheck,
        TickKind::Consensus,
        TickKind::ForkTimers,
        TickKind::Prune,
        TickKind::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TickKind::Gossip => "gossip",
            TickKind::Heartbeat => "heartbeat",
            TickKind::HealthCheck => "health_check",
            TickKind::Consensus => "consensus",
            TickKind::ForkTimers => "fork_timers",
            TickKind::Prune => "prune",
            TickKind::Cleanup => "cleanup",
        }
    }

    fn period(&self, config: &NodeConfig) -> Duration {
        match self {
            TickKind::Gossip => config.gossip.interval,
            TickKind::Heartbeat | TickKind::HealthCheck => {
                Duration::from_millis(config.partition.heartbeat_interval_ms)
            }
            TickKind::Consensus => config.consensus_interval,
            TickKind::ForkTimers => config.fork_tick_interval,
            TickKind::Prune => config.prune_interval,
            TickKind::Cleanup => config.cleanup_interval,
        }
    }
}

/// Aggregated statistics
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub store: StoreStats,
    pub gossip: GossipStats,
    pub forks: ForkStats,
    pub integrity: IntegrityStats,
    pub partition: PartitionStats,
    pub tasks: Vec<TaskStats>,
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// An admitted event on its way to the subsystems
#[derive(Clone)]
struct Admitted {
    event: Event,
    envelope: Option<GossipEnvelope>,
    origin: Origin,
}

enum DagCommand {
    Submit {
        draft: EventDraft,
        reply: oneshot::Sender<Result<EventId, NodeError>>,
    },
    Ingest {
        envelope: GossipEnvelope,
        from: PeerId,
    },
    ApplyResolution {
        resolution: ForkResolution,
        done: oneshot::Sender<()>,
    },
    StateResponse {
        from: PeerId,
        response: StateResponse,
    },
    Tick {
        kind: TickKind,
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct Shared {
    config: NodeConfig,
    node_id: PeerId,
    clock: Clock,
    store: RwLock<EventStore>,
    gossip: GossipPropagator,
    forks: Mutex<ForkResolver>,
    integrity: Mutex<IntegrityMonitor>,
    partition: Mutex<PartitionCoordinator>,
    storage: Option<Arc<Storage>>,
    sinks: Sinks,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<NodeEvent>,
    commands: mpsc::Sender<DagCommand>,
}

impl Shared {
    fn now(&self) -> u64 {
        (self.clock)()
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    /// Mirror a change to storage; failures are logged, never propagated
    fn persist<F>(&self, what: &str, write: F)
    where
        F: FnOnce(&Storage) -> Result<(), StorageError>,
    {
        if let Some(storage) = &self.storage {
            if let Err(e) = write(storage) {
                error!("Failed to persist {}: {}", what, e);
            }
        }
    }

    /// Re-persist admitted events after an in-place change
    fn persist_events(&self, ids: &[EventId]) {
        if self.storage.is_none() {
            return;
        }
        let store = self.store.read();
        for id in ids {
            if let (Some(event), Some(received_at)) = (store.get(id), store.received_at(id)) {
                self.persist("event", |s| s.put_event(event, received_at));
            }
        }
    }

    async fn send_command(&self, command: DagCommand) -> Result<(), NodeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NodeError::ShuttingDown)
    }
}

// =============================================================================
// DAG OWNER
// =============================================================================

struct DagOwner {
    shared: Arc<Shared>,
    subscribers: Vec<mpsc::UnboundedSender<Admitted>>,
    /// Envelopes of remote events waiting on parents
    parked: HashMap<EventId, (GossipEnvelope, PeerId)>,
}

impl DagOwner {
    async fn run(mut self, mut commands: mpsc::Receiver<DagCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                DagCommand::Submit { draft, reply } => {
                    let _ = reply.send(self.submit(draft));
                }
                DagCommand::Ingest { envelope, from } => self.ingest(envelope, from),
                DagCommand::ApplyResolution { resolution, done } => {
                    self.apply_resolution(&resolution);
                    let _ = done.send(());
                }
                DagCommand::StateResponse { from, response } => {
                    self.state_response(from, response)
                }
                DagCommand::Tick { kind, done } => {
                    self.tick(kind);
                    let _ = done.send(());
                }
                DagCommand::Shutdown { done } => {
                    self.shared.persist("flush", |s| s.flush());
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!("DAG owner stopped");
    }

    fn submit(&mut self, draft: EventDraft) -> Result<EventId, NodeError> {
        let now = self.shared.now();
        let created = {
            let mut store = self.shared.store.write();
            self.shared.gossip.create_event(&mut store, draft, now)
        };
        let (event, outcome) = match created {
            Ok(created) => created,
            Err(e) => {
                self.shared.emit(NodeEvent::EventRejected {
                    id: None,
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };
        match outcome {
            AddOutcome::Admitted(events) => {
                self.admitted(events, Origin::Local, None, now);
                Ok(event.id)
            }
            AddOutcome::Pending { id, .. } => Err(NodeError::Parked(id)),
            AddOutcome::Duplicate(id) => Ok(id),
        }
    }

    fn ingest(&mut self, envelope: GossipEnvelope, from: PeerId) {
        let now = self.shared.now();
        let id = envelope.event.id;
        let result = self
            .shared
            .store
            .write()
            .add_external_event(envelope.event.clone(), now);
        match result {
            Ok(AddOutcome::Admitted(events)) => {
                self.admitted(events, Origin::Remote(from), Some(envelope), now)
            }
            Ok(AddOutcome::Pending { id, missing }) => {
                self.parked.insert(id, (envelope, from));
                self.shared.emit(NodeEvent::EventPending { id, missing });
            }
            Ok(AddOutcome::Duplicate(_)) => {}
            Err(e) => {
                debug!("Rejected event {} from {}: {}", id, from, e);
                self.shared.emit(NodeEvent::EventRejected {
                    id: Some(id),
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Persist, announce and fan out freshly admitted events. The first
    /// event is the one offered; the rest were released from the pending set.
    fn admitted(
        &mut self,
        events: Vec<Event>,
        origin: Origin,
        mut envelope: Option<GossipEnvelope>,
        now: u64,
    ) {
        for (i, event) in events.into_iter().enumerate() {
            let (envelope, origin) = if i == 0 {
                (envelope.take(), origin.clone())
            } else {
                match self.parked.remove(&event.id) {
                    Some((parked, peer)) => (Some(parked), Origin::Remote(peer)),
                    None => (None, origin.clone()),
                }
            };

            self.shared
                .persist("event", |s| s.put_event(&event, now));
            self.shared.sinks.metrics.counter("dag_events_admitted", 1);
            self.apply_self_revocation(&event);

            self.shared.emit(NodeEvent::EventAdmitted {
                event: event.clone(),
                origin: origin.clone(),
            });
            let admitted = Admitted {
                event,
                envelope,
                origin,
            };
            for subscriber in &self.subscribers {
                let _ = subscriber.send(admitted.clone());
            }
        }
        let size = self.shared.store.read().len();
        self.shared.sinks.metrics.gauge("dag_size", size as f64);
    }

    /// A creator may revoke their own earlier events
    fn apply_self_revocation(&self, event: &Event) {
        let EventPayload::Revocation(revocation) = &event.payload else {
            return;
        };
        let target = revocation.target_event;
        let changed = {
            let mut store = self.shared.store.write();
            let target_creator = store.get(&target).map(|e| e.creator.clone());
            match target_creator {
                Some(creator) if creator == event.creator => store
                    .set_revocation_status(&target, RevocationStatus::Revoked)
                    .unwrap_or(false),
                Some(_) => {
                    warn!(
                        "{} tried to revoke {} created by someone else",
                        event.creator, target
                    );
                    false
                }
                None => false,
            }
        };
        if changed {
            self.shared.persist_events(&[target]);
            self.shared.emit(NodeEvent::EventsRevoked {
                ids: vec![target],
                reason: format!("revoked by creator: {}", revocation.reason),
            });
        }
    }

    fn revoke(&self, ids: &[EventId], reason: String) {
        let mut revoked = Vec::new();
        {
            let mut store = self.shared.store.write();
            for id in ids {
                match store.set_revocation_status(id, RevocationStatus::Revoked) {
                    Ok(true) => revoked.push(*id),
                    Ok(false) => {}
                    Err(e) => debug!("Cannot revoke {}: {}", id, e),
                }
            }
        }
        if revoked.is_empty() {
            return;
        }
        self.shared.persist_events(&revoked);
        info!("Revoked {} events: {}", revoked.len(), reason);
        self.shared.emit(NodeEvent::EventsRevoked {
            ids: revoked,
            reason,
        });
    }

    fn apply_resolution(&self, resolution: &ForkResolution) {
        self.revoke(
            &resolution.losers,
            format!(
                "fork {} resolved by {}",
                resolution.fork_id,
                resolution.method.as_str()
            ),
        );
    }

    fn tick(&mut self, kind: TickKind) {
        let now = self.shared.now();
        match kind {
            TickKind::Consensus => self.advance_consensus(now),
            TickKind::Prune => self.prune(now),
            TickKind::HealthCheck => self.health_check(now),
            _ => {}
        }
    }

    fn advance_consensus(&self, now: u64) {
        let (finalized, tips, next_round) = {
            let mut store = self.shared.store.write();
            let finalized = store.advance_consensus(now);
            let tips = if finalized.is_empty() {
                Vec::new()
            } else {
                store.tips()
            };
            (finalized, tips, store.next_round())
        };
        if finalized.is_empty() {
            return;
        }

        let ids: Vec<EventId> = finalized.iter().map(|e| e.id).collect();
        self.shared.persist_events(&ids);
        self.shared
            .persist("round counter", |s| s.put_next_round(next_round));
        self.shared
            .sinks
            .metrics
            .counter("consensus_finalized", finalized.len() as u64);

        let snapshot = dag_snapshot_hash(&tips);
        for event in finalized {
            let Some(round) = event.consensus_round else {
                continue;
            };
            if self.shared.config.anchor_types.contains(&event.event_type) && !event.is_revoked() {
                let anchor_id = self.shared.sinks.anchor.queue_for_anchoring(&event, snapshot);
                debug!("Event {} queued for anchoring as {}", event.id, anchor_id);
            }
            self.shared.emit(NodeEvent::ConsensusReached {
                id: event.id,
                round,
            });
        }
    }

    fn prune(&mut self, now: u64) {
        let report = self.shared.store.write().prune(now);
        for id in &report.pruned {
            self.shared.persist("pruned event", |s| s.delete_event(id));
        }
        {
            let store = self.shared.store.read();
            self.parked.retain(|id, _| store.is_pending(id));
        }
        let expired_forks = self.shared.forks.lock().prune(now);
        for id in &expired_forks {
            self.shared.persist("pruned fork", |s| s.delete_fork(id));
        }
        if !report.pruned.is_empty() || !expired_forks.is_empty() {
            info!(
                "Pruned {} events ({} tombstones, {} stale pending), {} forks",
                report.pruned.len(),
                report.tombstones,
                report.pending_expired,
                expired_forks.len()
            );
        }
    }

    fn health_check(&mut self, now: u64) {
        let transition = self.shared.partition.lock().health_check(now);
        match transition {
            Some(PartitionTransition::Detected {
                kind,
                remaining_peers,
            }) => {
                self.shared.sinks.metrics.counter("partitions_detected", 1);
                self.shared.emit(NodeEvent::PartitionDetected {
                    kind,
                    remaining_peers,
                });
            }
            Some(PartitionTransition::RecoveryStarted { requests }) => {
                let peers: Vec<PeerId> = requests.iter().map(|(p, _)| p.clone()).collect();
                for (peer, request) in requests {
                    if let Err(e) = send_state_request(self.shared.transport.as_ref(), &peer, &request) {
                        warn!("State request to {} failed: {}", peer, e);
                    }
                }
                self.shared.emit(NodeEvent::RecoveryStarted { peers });
            }
            _ => {}
        }

        let ready = self.shared.partition.lock().reconciliation_ready(now);
        if ready {
            self.finish_reconciliation(now);
        }
    }

    fn state_response(&mut self, from: PeerId, response: StateResponse) {
        let now = self.shared.now();
        let ready = {
            let mut partition = self.shared.partition.lock();
            if !partition.handle_state_response(&from, response, now) {
                debug!("Ignored state response from {}", from);
            }
            partition.reconciliation_ready(now)
        };
        if ready {
            self.finish_reconciliation(now);
        }
    }

    fn finish_reconciliation(&mut self, now: u64) {
        // peer events we lack go through normal admission first
        let peer_events = self.shared.partition.lock().session_events();
        for event in peer_events {
            if self.shared.store.read().is_known(&event.id) {
                continue;
            }
            self.shared.gossip.mark_seen(event.id);
            let id = event.id;
            let result = self.shared.store.write().add_external_event(event, now);
            match result {
                Ok(AddOutcome::Admitted(events)) => {
                    self.admitted(events, Origin::Reconciled, None, now)
                }
                Ok(AddOutcome::Pending { id, missing }) => {
                    self.shared.emit(NodeEvent::EventPending { id, missing })
                }
                Ok(AddOutcome::Duplicate(_)) => {}
                Err(e) => debug!("Peer event {} rejected during reconciliation: {}", id, e),
            }
        }

        let transition = {
            let store = self.shared.store.read();
            let mut partition = self.shared.partition.lock();
            partition.finish_reconciliation(&self.shared.config.fork, now, |x, y| {
                store.can_see(y, x)
            })
        };
        match transition {
            Ok(PartitionTransition::Recovered(report)) => {
                self.revoke(&report.rejected, "lost partition reconciliation".to_string());
                for envelope in report.released {
                    self.shared.gossip.enqueue(envelope);
                }
                let metrics = &self.shared.sinks.metrics;
                metrics.counter("partitions_recovered", 1);
                metrics.histogram(
                    "partition_duration_ms",
                    report.record.ended_at.saturating_sub(report.record.started_at) as f64,
                );
                self.shared
                    .emit(NodeEvent::PartitionRecovered(report.record));
            }
            Ok(PartitionTransition::RecoveryFailed { .. }) => {
                self.shared.sinks.metrics.counter("recoveries_failed", 1);
            }
            Ok(_) => {}
            Err(e) => debug!("Reconciliation not finished: {}", e),
        }
    }
}

fn send_state_request(
    transport: &dyn Transport,
    peer: &PeerId,
    request: &StateRequest,
) -> Result<(), NodeError> {
    transport.send(peer, request.to_frame()?)?;
    Ok(())
}

// =============================================================================
// SUBSYSTEM TASKS
// =============================================================================

async fn fork_subscriber(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Admitted>) {
    while let Some(admitted) = rx.recv().await {
        if admitted.event.is_revoked() {
            continue;
        }
        let actions = {
            let now = shared.now();
            shared.forks.lock().on_event_admitted(&admitted.event, now)
        };
        handle_fork_actions(&shared, actions).await;
    }
}

async fn handle_fork_actions(shared: &Arc<Shared>, actions: Vec<ForkAction>) {
    for action in actions {
        let fork = shared.forks.lock().get_fork(&action.fork_id());
        if let Some(fork) = &fork {
            shared.persist("fork", |s| s.put_fork(fork));
        }
        match action {
            ForkAction::Detected(fork) => {
                shared.sinks.metrics.counter("forks_detected", 1);
                shared.emit(NodeEvent::ForkDetected(fork));
            }
            ForkAction::ConflictExtended { fork_id, event } => {
                debug!("Event {} joined fork {}", event, fork_id);
            }
            ForkAction::ModeratorRequested {
                fork_id,
                channel,
                conflicting,
            } => {
                shared.emit(NodeEvent::ModeratorRequested {
                    fork_id,
                    channel,
                    conflicting,
                });
            }
            ForkAction::CommunityVoteOpened { fork_id } => {
                debug!("Community vote opened for fork {}", fork_id);
            }
            ForkAction::Resolved(resolution) => {
                let detected_at = fork.as_ref().map(|f| f.detected_at);
                apply_fork_resolution(shared, resolution, detected_at).await;
            }
        }
    }
}

/// Report a resolution and have the DAG owner revoke the losers
async fn apply_fork_resolution(
    shared: &Arc<Shared>,
    resolution: ForkResolution,
    detected_at: Option<u64>,
) {
    let metrics = &shared.sinks.metrics;
    metrics.counter("forks_resolved", 1);
    if let Some(detected_at) = detected_at {
        metrics.histogram(
            "fork_resolution_ms",
            resolution.resolved_at.saturating_sub(detected_at) as f64,
        );
    }
    if resolution.method == ResolutionMethod::ModeratorDecision {
        shared.sinks.audit.record_moderation_action(
            &resolution.actor,
            "fork_resolution",
            "fork",
            &resolution.fork_id.to_hex(),
            serde_json::json!({
                "channel": resolution.channel.as_str(),
                "winner": resolution.winner.to_hex(),
                "losers": resolution.losers.iter().map(|id| id.to_hex()).collect::<Vec<_>>(),
                "reasoning": resolution.reasoning,
            }),
        );
    }

    let (done, wait) = oneshot::channel();
    let command = DagCommand::ApplyResolution {
        resolution: resolution.clone(),
        done,
    };
    if shared.send_command(command).await.is_ok() {
        let _ = wait.await;
    }
    shared.emit(NodeEvent::ForkResolved(resolution));
}

async fn integrity_subscriber(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Admitted>) {
    while let Some(admitted) = rx.recv().await {
        let updates = {
            let now = shared.now();
            shared.integrity.lock().on_event_admitted(&admitted.event, now)
        };
        for update in updates {
            shared.persist("alert", |s| s.put_alert(update.alert()));
            if let AlertUpdate::Raised(alert) = update {
                shared.sinks.metrics.counter("alerts_raised", 1);
                if alert.alert_type == AlertType::SybilCluster {
                    shared.sinks.metrics.counter("sybil_alerts", 1);
                }
                shared.emit(NodeEvent::AlertRaised(alert));
            }
        }
    }
}

async fn outbound_subscriber(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Admitted>) {
    while let Some(admitted) = rx.recv().await {
        route_outbound(&shared, admitted);
    }
}

/// Gossip an admitted event, or hold it while partitioned
fn route_outbound(shared: &Shared, admitted: Admitted) {
    let Admitted {
        event,
        envelope,
        origin,
    } = admitted;
    if origin == Origin::Reconciled {
        return;
    }
    let envelope = envelope.unwrap_or_else(|| GossipEnvelope::new(event.clone()));
    let now = shared.now();

    let mut partition = shared.partition.lock();
    partition.observe_creator(&event.creator);
    if partition.is_in_partition() {
        if partition.buffer_event(envelope, now).is_some() {
            shared.sinks.metrics.counter("offline_buffer_evicted", 1);
        }
        return;
    }
    drop(partition);
    shared.gossip.enqueue(envelope);
}

// =============================================================================
// TRANSPORT
// =============================================================================

async fn transport_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::PeerConnected(peer) => {
                info!("Peer connected: {}", peer);
                shared.gossip.connect_peer(PeerInfo::new(peer.clone(), None));
                let now = shared.now();
                shared.partition.lock().record_heartbeat(&peer, now);
            }
            TransportEvent::PeerDisconnected(peer) => {
                info!("Peer disconnected: {}", peer);
                shared.gossip.disconnect_peer(&peer);
            }
            TransportEvent::FrameReceived { from, frame } => {
                if let Err(e) = handle_frame(&shared, &from, frame).await {
                    debug!("Frame from {} dropped: {}", from, e);
                }
            }
        }
    }
    debug!("Transport loop stopped");
}

async fn handle_frame(shared: &Arc<Shared>, from: &PeerId, frame: Frame) -> Result<(), NodeError> {
    let now = shared.now();
    shared.partition.lock().record_heartbeat(from, now);

    match frame.frame_type {
        FrameType::EventGossip => {
            let batch = EventBatch::from_frame(&frame)?;
            for envelope in batch.envelopes {
                if let Some(hop) = envelope.propagation_path.last() {
                    shared
                        .sinks
                        .metrics
                        .histogram("gossip_latency_ms", now.saturating_sub(hop.forwarded_at) as f64);
                }
                shared.sinks.metrics.counter("gossip_received", 1);
                if let Some(envelope) = shared.gossip.receive_event(envelope, from) {
                    shared
                        .send_command(DagCommand::Ingest {
                            envelope,
                            from: from.clone(),
                        })
                        .await?;
                }
            }
        }
        FrameType::Heartbeat => {
            let heartbeat = Heartbeat::from_frame(&frame)?;
            debug!(
                "Heartbeat from {} ({} events)",
                from, heartbeat.event_count
            );
        }
        FrameType::StateRequest => {
            let request = StateRequest::from_frame(&frame)?;
            let response = {
                let store = shared.store.read();
                StateResponse {
                    request_id: request.request_id,
                    events: store.events_since(request.since, request.max_events as usize),
                    tips: store.tips(),
                }
            };
            shared.transport.send(from, response.to_frame()?)?;
        }
        FrameType::StateResponse => {
            let response = StateResponse::from_frame(&frame)?;
            shared
                .send_command(DagCommand::StateResponse {
                    from: from.clone(),
                    response,
                })
                .await?;
        }
        FrameType::Hello => {}
    }
    Ok(())
}

// =============================================================================
// TIMERS
// =============================================================================

async fn run_tick(shared: &Arc<Shared>, kind: TickKind) {
    match kind {
        TickKind::Gossip => {
            let report = shared
                .gossip
                .gossip_round(shared.transport.as_ref(), shared.now());
            let metrics = &shared.sinks.metrics;
            metrics.counter("gossip_sent", report.events_sent as u64);
            metrics.counter("gossip_send_failures", report.send_failures as u64);
        }
        TickKind::Heartbeat => {
            let heartbeat = Heartbeat {
                sent_at: shared.now(),
                event_count: shared.store.read().len() as u64,
            };
            match heartbeat.to_frame() {
                Ok(frame) => {
                    let delivered = shared.transport.broadcast(frame);
                    debug!("Heartbeat sent to {} peers", delivered);
                }
                Err(e) => warn!("Cannot encode heartbeat: {}", e),
            }
        }
        TickKind::ForkTimers => {
            let actions = {
                let now = shared.now();
                shared.forks.lock().tick(now)
            };
            handle_fork_actions(shared, actions).await;
        }
        TickKind::Cleanup => {
            let dropped = {
                let now = shared.now();
                shared.integrity.lock().cleanup(now)
            };
            for id in &dropped {
                shared.persist("dropped alert", |s| s.delete_alert(id));
            }
        }
        TickKind::HealthCheck | TickKind::Consensus | TickKind::Prune => {
            let (done, wait) = oneshot::channel();
            if shared
                .send_command(DagCommand::Tick { kind, done })
                .await
                .is_ok()
            {
                let _ = wait.await;
            }
        }
    }
}

// =============================================================================
// NODE
// =============================================================================

fn restore_state(
    storage: &Storage,
    store: &mut EventStore,
    gossip: &GossipPropagator,
    forks: &mut ForkResolver,
    integrity: &mut IntegrityMonitor,
) -> Result<(), StorageError> {
    let events = storage.load_events()?;
    for fork in storage.load_forks()? {
        forks.restore(fork);
    }
    for stored in &events {
        forks.restore_candidate(&stored.event, stored.received_at);
    }
    let event_count = events.len();
    for stored in events {
        gossip.mark_seen(stored.event.id);
        store.restore(stored.event, stored.received_at);
    }
    if let Some(round) = storage.get_next_round()? {
        store.set_next_round(round);
    }
    let alerts = storage.load_alerts()?;
    let alert_count = alerts.len();
    for alert in alerts {
        integrity.restore_alert(alert);
    }
    info!(
        "Restored {} events, {} forks, {} alerts",
        event_count,
        forks.stats().total,
        alert_count
    );
    Ok(())
}

/// A running Relay node
pub struct RelayNode {
    shared: Arc<Shared>,
    scheduler: Scheduler,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayNode {
    /// Start a node on wall-clock time
    pub async fn start(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        storage: Option<Arc<Storage>>,
        sinks: Sinks,
    ) -> Result<Self, NodeError> {
        Self::start_with_clock(config, transport, transport_events, storage, sinks, system_clock())
            .await
    }

    pub async fn start_with_clock(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        storage: Option<Arc<Storage>>,
        sinks: Sinks,
        clock: Clock,
    ) -> Result<Self, NodeError> {
        let node_id = transport.local_id().clone();
        let mut store = EventStore::new(config.store.clone());
        let gossip = GossipPropagator::new(config.gossip.clone(), node_id.as_str());
        let mut forks = ForkResolver::new(config.fork.clone());
        let mut integrity = IntegrityMonitor::new(config.integrity.clone());
        if let Some(storage) = &storage {
            restore_state(storage, &mut store, &gossip, &mut forks, &mut integrity)?;
        }

        let (events, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            partition: Mutex::new(PartitionCoordinator::new(config.partition.clone())),
            config,
            node_id,
            clock,
            store: RwLock::new(store),
            gossip,
            forks: Mutex::new(forks),
            integrity: Mutex::new(integrity),
            storage,
            sinks,
            transport,
            events,
            commands,
        });

        let (fork_tx, fork_rx) = mpsc::unbounded_channel();
        let (integrity_tx, integrity_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let owner = DagOwner {
            shared: shared.clone(),
            subscribers: vec![fork_tx, integrity_tx, outbound_tx],
            parked: HashMap::new(),
        };
        let tasks = vec![
            tokio::spawn(owner.run(command_rx)),
            tokio::spawn(fork_subscriber(shared.clone(), fork_rx)),
            tokio::spawn(integrity_subscriber(shared.clone(), integrity_rx)),
            tokio::spawn(outbound_subscriber(shared.clone(), outbound_rx)),
            tokio::spawn(transport_loop(shared.clone(), transport_events)),
        ];

        let scheduler = Scheduler::new();
        if shared.config.run_timers {
            for kind in TickKind::ALL {
                let node = shared.clone();
                scheduler.spawn_periodic(kind.as_str(), kind.period(&shared.config), move || {
                    let node = node.clone();
                    async move { run_tick(&node, kind).await }
                });
            }
        }

        info!("Relay node {} started", shared.node_id);
        Ok(Self {
            shared,
            scheduler,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn node_id(&self) -> &PeerId {
        &self.shared.node_id
    }

    /// Stream of node events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.shared.events.subscribe()
    }

    // ===== EVENTS =====

    /// Turn an application-level action into a DAG event
    pub async fn submit_user_action(
        &self,
        creator: impl Into<UserId>,
        channel: impl Into<ChannelId>,
        payload: EventPayload,
        region: Option<String>,
    ) -> Result<EventId, NodeError> {
        let mut draft = EventDraft::new(creator, channel, payload);
        draft.region = region;
        let (reply, wait) = oneshot::channel();
        self.shared
            .send_command(DagCommand::Submit { draft, reply })
            .await?;
        wait.await.map_err(|_| NodeError::ShuttingDown)?
    }

    pub fn get_event(&self, id: &EventId) -> Option<Event> {
        self.shared.store.read().get(id).cloned()
    }

    pub fn get_channel_events(&self, channel: &ChannelId, include_revoked: bool) -> Vec<Event> {
        self.shared
            .store
            .read()
            .get_channel_events(channel, include_revoked)
    }

    pub fn get_user_events(&self, user: &UserId, include_revoked: bool) -> Vec<Event> {
        self.shared.store.read().get_user_events(user, include_revoked)
    }

    // ===== FORKS =====

    pub fn get_active_forks(&self) -> Vec<Fork> {
        self.shared.forks.lock().get_active_forks()
    }

    pub fn get_fork(&self, id: &ForkId) -> Option<Fork> {
        self.shared.forks.lock().get_fork(id)
    }

    /// Resolve a fork in favour of `event`. Losing events are revoked before
    /// this returns.
    pub async fn submit_moderator_decision(
        &self,
        fork_id: &ForkId,
        moderator: &UserId,
        event: &EventId,
        reasoning: &str,
    ) -> Result<ForkResolution, NodeError> {
        let now = self.shared.now();
        let (resolution, fork) = {
            let mut forks = self.shared.forks.lock();
            let resolution = forks.submit_moderator_decision(fork_id, moderator, event, reasoning, now)?;
            (resolution, forks.get_fork(fork_id))
        };
        if let Some(fork) = &fork {
            self.shared.persist("fork", |s| s.put_fork(fork));
        }
        apply_fork_resolution(&self.shared, resolution.clone(), fork.map(|f| f.detected_at)).await;
        Ok(resolution)
    }

    pub fn submit_community_vote(
        &self,
        fork_id: &ForkId,
        voter: &UserId,
        event: &EventId,
        weight: f64,
    ) -> Result<(), NodeError> {
        let now = self.shared.now();
        let fork = {
            let mut forks = self.shared.forks.lock();
            forks.submit_community_vote(fork_id, voter, event, weight, now)?;
            forks.get_fork(fork_id)
        };
        if let Some(fork) = &fork {
            self.shared.persist("fork", |s| s.put_fork(fork));
        }
        Ok(())
    }

    // ===== INTEGRITY =====

    pub fn get_user_risk_analysis(&self, user: &UserId) -> RiskAnalysis {
        let now = self.shared.now();
        self.shared.integrity.lock().get_user_risk_analysis(user, now)
    }

    pub fn get_alerts(&self) -> Vec<DetectionAlert> {
        self.shared.integrity.lock().alerts()
    }

    /// Move an alert through investigation; confirmation is escalated to
    /// the audit sink
    pub fn update_alert_status(
        &self,
        alert_id: &AlertId,
        investigator: &UserId,
        status: AlertStatus,
        notes: &str,
    ) -> Result<DetectionAlert, NodeError> {
        let now = self.shared.now();
        let alert = self
            .shared
            .integrity
            .lock()
            .update_alert_status(alert_id, investigator, status, notes, now)?;
        self.shared.persist("alert", |s| s.put_alert(&alert));

        if alert.status == AlertStatus::Confirmed {
            self.shared.sinks.audit.record_moderation_action(
                investigator.as_str(),
                "alert_confirmed",
                alert.alert_type.as_str(),
                &alert.id.to_hex(),
                serde_json::json!({
                    "severity": alert.severity,
                    "confidence": alert.confidence,
                    "users": alert.suspicious_users,
                    "notes": notes,
                }),
            );
        }
        Ok(alert)
    }

    // ===== PARTITION =====

    pub fn is_in_partition(&self) -> bool {
        self.shared.partition.lock().is_in_partition()
    }

    pub fn get_offline_buffer_status(&self) -> OfflineBufferStatus {
        self.shared.partition.lock().get_offline_buffer_status()
    }

    pub fn partition_history(&self) -> Vec<PartitionRecord> {
        self.shared.partition.lock().history()
    }

    // ===== LIFECYCLE =====

    /// Run one round of periodic work now and wait for it
    pub async fn run_tick(&self, kind: TickKind) {
        run_tick(&self.shared, kind).await;
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            store: self.shared.store.read().stats(),
            gossip: self.shared.gossip.stats(),
            forks: self.shared.forks.lock().stats(),
            integrity: self.shared.integrity.lock().stats(),
            partition: self.shared.partition.lock().stats(),
            tasks: self.scheduler.stats(),
        }
    }

    /// Drain timers, stop the DAG owner and flush storage
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        let (done, wait) = oneshot::channel();
        if self
            .shared
            .send_command(DagCommand::Shutdown { done })
            .await
            .is_ok()
        {
            let _ = wait.await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Relay node {} stopped", self.shared.node_id);
    }
}
