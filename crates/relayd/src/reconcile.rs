//! Post-partition reconciliation
//!
//! A session asks every newly reachable peer for the state it accumulated
//! while we were cut off, collects whatever answers arrive before the
//! deadline, then rules on each buffered event using the same precedence the
//! fork resolver applies.

use crate::config::ForkConfig;
use crate::fork::{are_conflicting, compare_precedence};
use relay_core::types::*;
use relay_net::messages::{StateRequest, StateResponse};
use relay_net::PeerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Most events a single state response may carry
pub const STATE_REQUEST_LIMIT: u32 = 2_000;

/// Verdict on one buffered event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// No peer reported anything conflicting
    Accepted,
    /// Conflicting peer events exist and ours takes precedence
    Conflict,
    /// A conflicting peer event takes precedence; ours is revoked
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub event_id: EventId,
    pub outcome: ReconcileOutcome,
    /// Peer events this one was weighed against
    pub against: Vec<EventId>,
}

/// Per-peer request bookkeeping
#[derive(Debug, Clone)]
pub struct PeerReconcileState {
    pub request_id: u64,
    pub requested_at: u64,
    pub responded_at: Option<u64>,
    pub events: Vec<Event>,
    pub tips: Vec<EventId>,
    /// Responses that did not match the outstanding request
    pub failures: u32,
}

/// One reconciliation attempt
#[derive(Debug)]
pub struct ReconcileSession {
    pub started_at: u64,
    pub deadline: u64,
    /// Lower bound on the receive time of requested events
    pub since: u64,
    peers: BTreeMap<PeerId, PeerReconcileState>,
}

impl ReconcileSession {
    pub fn new(peers: &[PeerId], since: u64, now: u64, timeout_ms: u64) -> Self {
        let peers = peers
            .iter()
            .map(|peer| {
                (
                    peer.clone(),
                    PeerReconcileState {
                        request_id: rand::random(),
                        requested_at: now,
                        responded_at: None,
                        events: Vec::new(),
                        tips: Vec::new(),
                        failures: 0,
                    },
                )
            })
            .collect();
        Self {
            started_at: now,
            deadline: now + timeout_ms,
            since,
            peers,
        }
    }

    /// State requests to send, one per peer
    pub fn requests(&self) -> Vec<(PeerId, StateRequest)> {
        self.peers
            .iter()
            .map(|(peer, state)| {
                (
                    peer.clone(),
                    StateRequest {
                        request_id: state.request_id,
                        since: self.since,
                        max_events: STATE_REQUEST_LIMIT,
                    },
                )
            })
            .collect()
    }

    /// Record a peer's answer. Unknown peers, stale request ids and repeat
    /// answers are ignored.
    pub fn record_response(&mut self, from: &PeerId, response: StateResponse, now: u64) -> bool {
        let Some(state) = self.peers.get_mut(from) else {
            return false;
        };
        if state.request_id != response.request_id || state.responded_at.is_some() {
            state.failures += 1;
            return false;
        }
        state.responded_at = Some(now);
        state.events = response.events;
        state.tips = response.tips;
        true
    }

    /// Every peer answered or the deadline passed
    pub fn is_complete(&self, now: u64) -> bool {
        now >= self.deadline || self.peers.values().all(|s| s.responded_at.is_some())
    }

    pub fn responded_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, s)| s.responded_at.is_some())
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Peers that have not answered
    pub fn silent_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, s)| s.responded_at.is_none())
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn peer_state(&self, peer: &PeerId) -> Option<&PeerReconcileState> {
        self.peers.get(peer)
    }

    /// Events reported by all responding peers, deduplicated by id
    pub fn peer_events(&self) -> Vec<Event> {
        let mut seen: HashMap<EventId, Event> = HashMap::new();
        for state in self.peers.values() {
            for event in &state.events {
                seen.entry(event.id).or_insert_with(|| event.clone());
            }
        }
        let mut events: Vec<Event> = seen.into_values().collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        events
    }
}

/// Rule on one buffered event against what the peers reported.
///
/// `is_ancestor(x, y)` must report whether `x` is a causal ancestor of `y`.
pub fn reconcile_event<F>(
    config: &ForkConfig,
    buffered: &Event,
    peer_events: &[Event],
    is_ancestor: F,
) -> ReconcileResult
where
    F: Fn(&EventId, &EventId) -> bool,
{
    let rivals: Vec<&Event> = peer_events
        .iter()
        .filter(|peer_event| are_conflicting(config, buffered, peer_event))
        .collect();

    let outcome = if rivals.is_empty() {
        ReconcileOutcome::Accepted
    } else if rivals
        .iter()
        .all(|rival| compare_precedence(buffered, rival, &is_ancestor) == Ordering::Less)
    {
        ReconcileOutcome::Conflict
    } else {
        ReconcileOutcome::Rejected
    };

    ReconcileResult {
        event_id: buffered.id,
        outcome,
        against: rivals.iter().map(|e| e.id).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::crypto::build_event;

    fn vote(creator: &str, decision: &str, ts: u64) -> Event {
        let draft = EventDraft::new(
            creator,
            "general",
            EventPayload::Vote(VotePayload {
                target: "P1".into(),
                decision: decision.into(),
            }),
        );
        build_event(draft, ts, None, None, &[]).unwrap()
    }

    fn no_ancestry(_: &EventId, _: &EventId) -> bool {
        false
    }

    #[test]
    fn test_session_collects_responses() {
        let peers = vec![PeerId::from("a"), PeerId::from("b")];
        let mut session = ReconcileSession::new(&peers, 500, 1_000, 10_000);
        let requests = session.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|(_, r)| r.since == 500));
        assert!(!session.is_complete(1_000));

        let (peer, request) = requests[0].clone();
        let response = StateResponse {
            request_id: request.request_id,
            events: vec![vote("u1", "yes", 900)],
            tips: vec![],
        };
        assert!(session.record_response(&peer, response.clone(), 1_100));
        // a repeat answer is ignored
        assert!(!session.record_response(&peer, response, 1_200));
        assert_eq!(session.peer_state(&peer).unwrap().failures, 1);

        assert_eq!(session.responded_peers(), vec![peer]);
        assert_eq!(session.silent_peers().len(), 1);
        assert!(!session.is_complete(5_000));
        assert!(session.is_complete(11_000));
        assert_eq!(session.peer_events().len(), 1);
    }

    #[test]
    fn test_stale_request_id_ignored() {
        let peers = vec![PeerId::from("a")];
        let mut session = ReconcileSession::new(&peers, 0, 0, 1_000);
        let request_id = session.requests()[0].1.request_id;
        let response = StateResponse {
            request_id: request_id.wrapping_add(1),
            events: vec![],
            tips: vec![],
        };
        assert!(!session.record_response(&PeerId::from("a"), response, 10));
        let stranger = StateResponse {
            request_id,
            events: vec![],
            tips: vec![],
        };
        assert!(!session.record_response(&PeerId::from("zz"), stranger, 10));
        assert!(session.responded_peers().is_empty());
    }

    #[test]
    fn test_peer_events_deduplicated() {
        let peers = vec![PeerId::from("a"), PeerId::from("b")];
        let mut session = ReconcileSession::new(&peers, 0, 0, 1_000);
        let shared = vote("u1", "yes", 10);
        for (peer, request) in session.requests() {
            session.record_response(
                &peer,
                StateResponse {
                    request_id: request.request_id,
                    events: vec![shared.clone()],
                    tips: vec![shared.id],
                },
                5,
            );
        }
        assert!(session.is_complete(5));
        assert_eq!(session.peer_events(), vec![shared]);
    }

    #[test]
    fn test_reconcile_outcomes() {
        let config = ForkConfig::default();
        let ours = vote("u1", "yes", 1_000);

        let unrelated = vote("u2", "yes", 1_200);
        let result = reconcile_event(&config, &ours, &[unrelated], no_ancestry);
        assert_eq!(result.outcome, ReconcileOutcome::Accepted);
        assert!(result.against.is_empty());

        let later = vote("u2", "no", 1_500);
        let result = reconcile_event(&config, &ours, &[later.clone()], no_ancestry);
        assert_eq!(result.outcome, ReconcileOutcome::Conflict);
        assert_eq!(result.against, vec![later.id]);

        let earlier = vote("u2", "no", 400);
        let result = reconcile_event(&config, &ours, &[earlier], no_ancestry);
        assert_eq!(result.outcome, ReconcileOutcome::Rejected);
    }

    #[test]
    fn test_ancestor_beats_timestamp() {
        let config = ForkConfig::default();
        let ours = vote("u1", "yes", 5_000);
        let rival = vote("u2", "no", 1_000);
        let ours_id = ours.id;
        let result = reconcile_event(&config, &ours, &[rival], |x, _| *x == ours_id);
        assert_eq!(result.outcome, ReconcileOutcome::Conflict);
    }
}
