//! Partition detection and recovery
//!
//! Peers are tracked through a heartbeat registry. A periodic health check
//! drops peers that have gone quiet; when too few remain the node considers
//! itself partitioned and diverts outbound gossip into a bounded offline
//! buffer. Once enough peers are reachable again a reconciliation session is
//! opened and the buffer is ruled on event by event.

use crate::config::{ForkConfig, PartitionConfig};
use crate::reconcile::{reconcile_event, ReconcileOutcome, ReconcileResult, ReconcileSession};
use relay_core::types::*;
use relay_net::messages::{StateRequest, StateResponse};
use relay_net::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Partition coordinator errors
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("No reconciliation in progress")]
    NoSession,
    #[error("Reconciliation still waiting on peers")]
    SessionIncomplete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionType {
    /// Some peers remain, too few for global participation
    Regional,
    /// No peers remain
    Global,
}

impl PartitionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionType::Regional => "regional",
            PartitionType::Global => "global",
        }
    }

    fn for_peer_count(remaining: usize) -> Self {
        if remaining == 0 {
            PartitionType::Global
        } else {
            PartitionType::Regional
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionPhase {
    Connected,
    Partitioned { kind: PartitionType, since: u64 },
    Reconciling { kind: PartitionType, since: u64 },
}

impl PartitionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionPhase::Connected => "connected",
            PartitionPhase::Partitioned { .. } => "partitioned",
            PartitionPhase::Reconciling { .. } => "reconciling",
        }
    }
}

/// Provisional local verdict on a buffered event. Never final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalConsensus {
    Accepted,
    Pending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BufferedEvent {
    pub envelope: GossipEnvelope,
    pub buffered_at: u64,
    pub local_consensus: LocalConsensus,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OfflineBufferStatus {
    pub in_partition: bool,
    pub phase: &'static str,
    pub partition_type: Option<PartitionType>,
    pub partition_since: Option<u64>,
    pub buffered: usize,
    pub capacity: usize,
    pub locally_accepted: usize,
    pub locally_pending: usize,
    pub evicted: u64,
}

/// Archived partition episode
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub kind: PartitionType,
    pub started_at: u64,
    pub ended_at: u64,
    pub buffered_events: usize,
    pub accepted: usize,
    pub conflicts: usize,
    pub rejected: usize,
    pub responding_peers: usize,
    pub silent_peers: usize,
}

/// Outcome of a completed reconciliation
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileReport {
    pub record: PartitionRecord,
    pub results: Vec<ReconcileResult>,
    /// Envelopes cleared for outbound gossip
    pub released: Vec<GossipEnvelope>,
    /// Buffered events that lost to a peer's event
    pub rejected: Vec<EventId>,
}

/// State change produced by the coordinator
#[derive(Clone, Debug, PartialEq)]
pub enum PartitionTransition {
    Detected {
        kind: PartitionType,
        remaining_peers: usize,
    },
    RecoveryStarted {
        requests: Vec<(PeerId, StateRequest)>,
    },
    Recovered(ReconcileReport),
    /// No peer answered; back to partitioned with the buffer intact
    RecoveryFailed {
        silent_peers: Vec<PeerId>,
    },
}

/// Partition coordinator statistics
#[derive(Debug, Clone, Default)]
pub struct PartitionStats {
    pub phase: &'static str,
    pub live_peers: usize,
    pub known_peers: usize,
    pub buffered: usize,
    pub evicted: u64,
    pub partitions_detected: u64,
    pub recoveries: u64,
    pub failed_recoveries: u64,
}

/// Partition coordinator
pub struct PartitionCoordinator {
    config: PartitionConfig,
    phase: PartitionPhase,
    /// Peer -> last heard from
    heartbeats: HashMap<PeerId, u64>,
    /// Every peer or creator ever observed while connected
    known: HashSet<String>,
    buffer: VecDeque<BufferedEvent>,
    session: Option<ReconcileSession>,
    history: VecDeque<PartitionRecord>,
    evicted: u64,
    partitions_detected: u64,
    recoveries: u64,
    failed_recoveries: u64,
}

impl PartitionCoordinator {
    pub fn new(config: PartitionConfig) -> Self {
        Self {
            config,
            phase: PartitionPhase::Connected,
            heartbeats: HashMap::new(),
            known: HashSet::new(),
            buffer: VecDeque::new(),
            session: None,
            history: VecDeque::new(),
            evicted: 0,
            partitions_detected: 0,
            recoveries: 0,
            failed_recoveries: 0,
        }
    }

    pub fn phase(&self) -> PartitionPhase {
        self.phase
    }

    pub fn is_in_partition(&self) -> bool {
        !matches!(self.phase, PartitionPhase::Connected)
    }

    // =========================================================================
    // HEARTBEATS
    // =========================================================================

    /// Note that a peer was heard from
    pub fn record_heartbeat(&mut self, peer: &PeerId, now: u64) {
        let last = self.heartbeats.entry(peer.clone()).or_insert(now);
        *last = (*last).max(now);
        self.known.insert(peer.as_str().to_string());
    }

    /// Remember a creator as part of the known network
    pub fn observe_creator(&mut self, creator: &UserId) {
        if !self.is_in_partition() {
            self.known.insert(creator.as_str().to_string());
        }
    }

    pub fn live_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.heartbeats.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Drop quiet peers and move the state machine.
    pub fn health_check(&mut self, now: u64) -> Option<PartitionTransition> {
        let threshold = self.config.partition_threshold_ms;
        let before = self.heartbeats.len();
        self.heartbeats
            .retain(|_, last_seen| last_seen.saturating_add(threshold) >= now);
        let remaining = self.heartbeats.len();
        if remaining < before {
            debug!("Health check dropped {} silent peers", before - remaining);
        }

        match self.phase {
            PartitionPhase::Connected => {
                if remaining >= self.config.recovery_min_peers {
                    return None;
                }
                let kind = PartitionType::for_peer_count(remaining);
                self.phase = PartitionPhase::Partitioned { kind, since: now };
                self.partitions_detected += 1;
                info!(
                    "Partition detected: {} ({} peers remaining)",
                    kind.as_str(),
                    remaining
                );
                Some(PartitionTransition::Detected {
                    kind,
                    remaining_peers: remaining,
                })
            }
            PartitionPhase::Partitioned { kind, since } => {
                if remaining < self.config.recovery_min_peers {
                    // a regional split that loses its last peers deepens silently
                    let deeper = PartitionType::for_peer_count(remaining);
                    if deeper == PartitionType::Global && kind != deeper {
                        self.phase = PartitionPhase::Partitioned { kind: deeper, since };
                    }
                    return None;
                }
                let peers = self.live_peers();
                let request_since = since.saturating_sub(threshold);
                let session = ReconcileSession::new(
                    &peers,
                    request_since,
                    now,
                    self.config.reconcile_timeout_ms,
                );
                let requests = session.requests();
                self.session = Some(session);
                self.phase = PartitionPhase::Reconciling { kind, since };
                info!(
                    "Recovery started with {} peers, {} buffered events",
                    peers.len(),
                    self.buffer.len()
                );
                Some(PartitionTransition::RecoveryStarted { requests })
            }
            PartitionPhase::Reconciling { .. } => None,
        }
    }

    // =========================================================================
    // OFFLINE BUFFER
    // =========================================================================

    /// Hold an outbound envelope while partitioned. Returns the evicted
    /// oldest entry when the buffer was full.
    pub fn buffer_event(&mut self, envelope: GossipEnvelope, now: u64) -> Option<EventId> {
        let local_consensus = if self.known.contains(envelope.event.creator.as_str()) {
            LocalConsensus::Accepted
        } else {
            LocalConsensus::Pending
        };

        let mut evicted = None;
        if self.config.max_offline_buffer == 0 {
            self.evicted += 1;
            return Some(envelope.event.id);
        }
        while self.buffer.len() >= self.config.max_offline_buffer {
            if let Some(oldest) = self.buffer.pop_front() {
                self.evicted += 1;
                evicted = Some(oldest.envelope.event.id);
            }
        }
        self.buffer.push_back(BufferedEvent {
            envelope,
            buffered_at: now,
            local_consensus,
        });
        if let Some(id) = evicted {
            warn!("Offline buffer full, evicted {}", id);
        }
        evicted
    }

    pub fn buffered(&self) -> impl Iterator<Item = &BufferedEvent> {
        self.buffer.iter()
    }

    pub fn get_offline_buffer_status(&self) -> OfflineBufferStatus {
        let (partition_type, partition_since) = match self.phase {
            PartitionPhase::Connected => (None, None),
            PartitionPhase::Partitioned { kind, since }
            | PartitionPhase::Reconciling { kind, since } => (Some(kind), Some(since)),
        };
        let locally_accepted = self
            .buffer
            .iter()
            .filter(|b| b.local_consensus == LocalConsensus::Accepted)
            .count();
        OfflineBufferStatus {
            in_partition: self.is_in_partition(),
            phase: self.phase.as_str(),
            partition_type,
            partition_since,
            buffered: self.buffer.len(),
            capacity: self.config.max_offline_buffer,
            locally_accepted,
            locally_pending: self.buffer.len() - locally_accepted,
            evicted: self.evicted,
        }
    }

    // =========================================================================
    // RECONCILIATION
    // =========================================================================

    /// Feed a peer's state response into the open session
    pub fn handle_state_response(&mut self, from: &PeerId, response: StateResponse, now: u64) -> bool {
        match self.session.as_mut() {
            Some(session) => session.record_response(from, response, now),
            None => false,
        }
    }

    /// Whether an open session is ready to be finished
    pub fn reconciliation_ready(&self, now: u64) -> bool {
        self.session.as_ref().map_or(false, |s| s.is_complete(now))
    }

    /// Events reported by peers so far, for admission before finishing
    pub fn session_events(&self) -> Vec<Event> {
        self.session
            .as_ref()
            .map(|s| s.peer_events())
            .unwrap_or_default()
    }

    /// Rule on every buffered event and leave the partitioned state.
    ///
    /// `is_ancestor(x, y)` reports whether `x` is a causal ancestor of `y`.
    pub fn finish_reconciliation<F>(
        &mut self,
        fork_config: &ForkConfig,
        now: u64,
        is_ancestor: F,
    ) -> Result<PartitionTransition, PartitionError>
    where
        F: Fn(&EventId, &EventId) -> bool,
    {
        let PartitionPhase::Reconciling { kind, since } = self.phase else {
            return Err(PartitionError::NoSession);
        };
        let session = self.session.as_ref().ok_or(PartitionError::NoSession)?;
        if !session.is_complete(now) {
            return Err(PartitionError::SessionIncomplete);
        }

        let responded = session.responded_peers();
        let silent = session.silent_peers();
        if responded.is_empty() {
            self.session = None;
            self.phase = PartitionPhase::Partitioned { kind, since };
            self.failed_recoveries += 1;
            warn!(
                "Reconciliation failed: none of {} peers answered",
                silent.len()
            );
            return Ok(PartitionTransition::RecoveryFailed {
                silent_peers: silent,
            });
        }
        if !silent.is_empty() {
            warn!("Reconciling without {} silent peers", silent.len());
        }

        let peer_events = session.peer_events();
        let mut results = Vec::with_capacity(self.buffer.len());
        let mut released = Vec::new();
        let mut rejected = Vec::new();
        for buffered in &self.buffer {
            let result =
                reconcile_event(fork_config, &buffered.envelope.event, &peer_events, &is_ancestor);
            match result.outcome {
                ReconcileOutcome::Accepted | ReconcileOutcome::Conflict => {
                    released.push(buffered.envelope.clone())
                }
                ReconcileOutcome::Rejected => rejected.push(result.event_id),
            }
            results.push(result);
        }

        let count = |outcome| results.iter().filter(|r| r.outcome == outcome).count();
        let record = PartitionRecord {
            kind,
            started_at: since,
            ended_at: now,
            buffered_events: self.buffer.len(),
            accepted: count(ReconcileOutcome::Accepted),
            conflicts: count(ReconcileOutcome::Conflict),
            rejected: count(ReconcileOutcome::Rejected),
            responding_peers: responded.len(),
            silent_peers: silent.len(),
        };

        self.buffer.clear();
        self.session = None;
        self.phase = PartitionPhase::Connected;
        self.recoveries += 1;
        self.history.push_back(record.clone());
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
        info!(
            "Partition recovered after {} ms: {} accepted, {} conflicts, {} rejected",
            now.saturating_sub(since),
            record.accepted,
            record.conflicts,
            record.rejected
        );

        Ok(PartitionTransition::Recovered(ReconcileReport {
            record,
            results,
            released,
            rejected,
        }))
    }

    /// Past partition episodes, oldest first
    pub fn history(&self) -> Vec<PartitionRecord> {
        self.history.iter().cloned().collect()
    }

    pub fn stats(&self) -> PartitionStats {
        PartitionStats {
            phase: self.phase.as_str(),
            live_peers: self.heartbeats.len(),
            known_peers: self.known.len(),
            buffered: self.buffer.len(),
            evicted: self.evicted,
            partitions_detected: self.partitions_detected,
            recoveries: self.recoveries,
            failed_recoveries: self.failed_recoveries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::crypto::build_event;

    fn envelope(creator: &str, decision: &str, ts: u64) -> GossipEnvelope {
        let draft = EventDraft::new(
            creator,
            "general",
            EventPayload::Vote(VotePayload {
                target: "P1".into(),
                decision: decision.into(),
            }),
        );
        GossipEnvelope::new(build_event(draft, ts, None, None, &[]).unwrap())
    }

    fn coordinator_with_peers(peers: &[&str], now: u64) -> PartitionCoordinator {
        let mut coordinator = PartitionCoordinator::new(PartitionConfig::default());
        for peer in peers {
            coordinator.record_heartbeat(&PeerId::from(*peer), now);
        }
        coordinator
    }

    fn recover(coordinator: &mut PartitionCoordinator, now: u64) -> Vec<(PeerId, StateRequest)> {
        for peer in ["a", "b", "c"] {
            coordinator.record_heartbeat(&PeerId::from(peer), now);
        }
        match coordinator.health_check(now) {
            Some(PartitionTransition::RecoveryStarted { requests }) => requests,
            other => panic!("expected recovery, got {:?}", other),
        }
    }

    #[test]
    fn test_global_partition_fires_once() {
        let mut coordinator = coordinator_with_peers(&["a", "b", "c"], 0);
        assert_eq!(coordinator.health_check(30_000), None);
        assert!(!coordinator.is_in_partition());

        let transition = coordinator.health_check(70_000);
        assert_eq!(
            transition,
            Some(PartitionTransition::Detected {
                kind: PartitionType::Global,
                remaining_peers: 0
            })
        );
        assert!(coordinator.is_in_partition());
        assert_eq!(coordinator.health_check(100_000), None);
        assert_eq!(coordinator.health_check(130_000), None);
        assert_eq!(coordinator.stats().partitions_detected, 1);
    }

    #[test]
    fn test_regional_partition() {
        let mut coordinator = coordinator_with_peers(&["a", "b", "c"], 0);
        coordinator.record_heartbeat(&PeerId::from("a"), 50_000);
        let transition = coordinator.health_check(70_000);
        assert_eq!(
            transition,
            Some(PartitionTransition::Detected {
                kind: PartitionType::Regional,
                remaining_peers: 1
            })
        );

        // losing the last peer deepens the partition without a second signal
        assert_eq!(coordinator.health_check(120_000), None);
        assert!(matches!(
            coordinator.phase(),
            PartitionPhase::Partitioned {
                kind: PartitionType::Global,
                ..
            }
        ));
    }

    #[test]
    fn test_buffer_bound_and_fifo() {
        let config = PartitionConfig {
            max_offline_buffer: 3,
            ..PartitionConfig::default()
        };
        let mut coordinator = PartitionCoordinator::new(config);
        let envelopes: Vec<GossipEnvelope> =
            (0..5).map(|i| envelope("u1", "yes", 1_000 + i)).collect();
        let mut evicted = Vec::new();
        for env in &envelopes {
            evicted.extend(coordinator.buffer_event(env.clone(), 0));
            assert!(coordinator.buffered().count() <= 3);
        }
        assert_eq!(evicted, vec![envelopes[0].event.id, envelopes[1].event.id]);
        let kept: Vec<EventId> = coordinator.buffered().map(|b| b.envelope.event.id).collect();
        assert_eq!(
            kept,
            envelopes[2..].iter().map(|e| e.event.id).collect::<Vec<_>>()
        );
        assert_eq!(coordinator.get_offline_buffer_status().evicted, 2);
    }

    #[test]
    fn test_local_consensus_tag() {
        let mut coordinator = coordinator_with_peers(&[], 0);
        coordinator.observe_creator(&UserId::from("friend"));
        coordinator.buffer_event(envelope("friend", "yes", 1), 1);
        coordinator.buffer_event(envelope("stranger", "yes", 2), 2);
        let status = coordinator.get_offline_buffer_status();
        assert_eq!(status.locally_accepted, 1);
        assert_eq!(status.locally_pending, 1);
    }

    #[test]
    fn test_recovery_and_reconcile() {
        let mut coordinator = coordinator_with_peers(&["a", "b", "c"], 0);
        coordinator.health_check(70_000);

        let ours = envelope("u1", "yes", 75_000);
        let loser = envelope("u2", "no", 76_000);
        coordinator.buffer_event(ours.clone(), 75_000);
        coordinator.buffer_event(loser.clone(), 76_000);

        let requests = recover(&mut coordinator, 90_000);
        assert_eq!(requests.len(), 3);
        assert!(coordinator.is_in_partition());

        // peer reports an earlier rival for u2's vote; "c" stays silent
        let rival = envelope("u3", "yes", 70_500).event;
        for (peer, request) in requests.iter().take(2) {
            let events = if peer.as_str() == "a" {
                vec![rival.clone()]
            } else {
                vec![]
            };
            assert!(coordinator.handle_state_response(
                peer,
                StateResponse {
                    request_id: request.request_id,
                    events,
                    tips: vec![],
                },
                91_000,
            ));
        }
        assert!(!coordinator.reconciliation_ready(91_000));
        assert!(matches!(
            coordinator.finish_reconciliation(&ForkConfig::default(), 91_000, |_, _| false),
            Err(PartitionError::SessionIncomplete)
        ));
        assert!(coordinator.reconciliation_ready(100_000));
        assert_eq!(coordinator.session_events(), vec![rival.clone()]);

        let transition = coordinator
            .finish_reconciliation(&ForkConfig::default(), 100_000, |_, _| false)
            .unwrap();
        let PartitionTransition::Recovered(report) = transition else {
            panic!("expected recovery");
        };
        assert_eq!(report.record.responding_peers, 2);
        assert_eq!(report.record.silent_peers, 1);
        assert_eq!(report.rejected, vec![loser.event.id]);
        assert_eq!(report.released, vec![ours]);
        assert_eq!(report.results.len(), 2);

        assert!(!coordinator.is_in_partition());
        assert_eq!(coordinator.get_offline_buffer_status().buffered, 0);
        assert_eq!(coordinator.history().len(), 1);
    }

    #[test]
    fn test_recovery_without_answers_keeps_buffer() {
        let mut coordinator = coordinator_with_peers(&["a", "b", "c"], 0);
        coordinator.health_check(70_000);
        coordinator.buffer_event(envelope("u1", "yes", 75_000), 75_000);
        recover(&mut coordinator, 90_000);

        let transition = coordinator
            .finish_reconciliation(&ForkConfig::default(), 100_000, |_, _| false)
            .unwrap();
        assert!(matches!(
            transition,
            PartitionTransition::RecoveryFailed { ref silent_peers } if silent_peers.len() == 3
        ));
        assert!(coordinator.is_in_partition());
        assert_eq!(coordinator.get_offline_buffer_status().buffered, 1);
        assert_eq!(coordinator.stats().failed_recoveries, 1);
    }
}
