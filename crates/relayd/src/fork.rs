//! Fork detection and resolution
//!
//! Every admitted event is compared against recent events of its channel.
//! A conflict opens a fork, which moves through:
//!
//! 1. automatic resolution (clear timestamp gap between the earliest two)
//! 2. moderator intervention, for up to `resolution_timeout`
//! 3. community vote, for half a timeout, escalating back to the moderator
//!    on a tie or missing quorum
//! 4. timeout fallback at twice the timeout, forcing timestamp order
//!
//! The resolver never touches the DAG. Resolutions are returned to the
//! caller, which revokes the losing events.

use crate::config::ForkConfig;
use relay_core::crypto::derive_fork_id;
use relay_core::types::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info};

/// Actor name recorded for pipeline-driven audit entries
pub const SYSTEM_ACTOR: &str = "system";

/// Fork resolver errors
#[derive(Debug, Error)]
pub enum ForkError {
    #[error("Unknown fork: {0}")]
    UnknownFork(ForkId),
    #[error("Fork already resolved: {0}")]
    AlreadyResolved(ForkId),
    #[error("Event {event} is not part of fork {fork}")]
    NotInFork { fork: ForkId, event: EventId },
    #[error("Invalid vote weight: {0}")]
    InvalidWeight(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkStatus {
    Detected,
    Resolving,
    Resolved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Automatic,
    ModeratorDecision,
    CommunityVote,
    TimeoutFallback,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::Automatic => "automatic",
            ResolutionMethod::ModeratorDecision => "moderator_decision",
            ResolutionMethod::CommunityVote => "community_vote",
            ResolutionMethod::TimeoutFallback => "timeout_fallback",
        }
    }
}

/// Where an unresolved fork waits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStage {
    AwaitingModerator { since: u64 },
    CommunityVote { since: u64 },
}

/// Append-only audit record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: u64,
    pub action: String,
    pub actor: String,
    pub details: String,
}

/// A weighted community vote
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommunityVote {
    pub event: EventId,
    pub weight: f64,
    pub cast_at: u64,
}

/// A set of mutually conflicting events and its resolution state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fork {
    pub id: ForkId,
    pub channel: ChannelId,
    pub conflicting_events: Vec<EventId>,
    pub status: ForkStatus,
    pub resolution_method: Option<ResolutionMethod>,
    pub winning_event: Option<EventId>,
    pub audit_trail: Vec<AuditEntry>,
    pub detected_at: u64,
    pub resolved_at: Option<u64>,
    pub stage: Option<ResolutionStage>,
    pub votes: BTreeMap<UserId, CommunityVote>,
}

impl Fork {
    pub fn is_resolved(&self) -> bool {
        self.status == ForkStatus::Resolved
    }

    fn audit(&mut self, timestamp: u64, action: &str, actor: &str, details: String) {
        self.audit_trail.push(AuditEntry {
            timestamp,
            action: action.to_string(),
            actor: actor.to_string(),
            details,
        });
    }
}

/// A decided fork, for the caller to apply
#[derive(Clone, Debug, PartialEq)]
pub struct ForkResolution {
    pub fork_id: ForkId,
    pub channel: ChannelId,
    pub winner: EventId,
    pub losers: Vec<EventId>,
    pub method: ResolutionMethod,
    /// Moderator id for moderator decisions, otherwise [`SYSTEM_ACTOR`]
    pub actor: String,
    pub reasoning: Option<String>,
    pub resolved_at: u64,
}

/// Something the caller should react to
#[derive(Clone, Debug, PartialEq)]
pub enum ForkAction {
    /// A new fork was opened
    Detected(Fork),
    /// A new event joined an open fork
    ConflictExtended { fork_id: ForkId, event: EventId },
    /// A moderator decision is wanted
    ModeratorRequested {
        fork_id: ForkId,
        channel: ChannelId,
        conflicting: Vec<EventId>,
    },
    /// Community voting opened
    CommunityVoteOpened { fork_id: ForkId },
    Resolved(ForkResolution),
}

impl ForkAction {
    pub fn fork_id(&self) -> ForkId {
        match self {
            ForkAction::Detected(fork) => fork.id,
            ForkAction::ConflictExtended { fork_id, .. }
            | ForkAction::ModeratorRequested { fork_id, .. }
            | ForkAction::CommunityVoteOpened { fork_id } => *fork_id,
            ForkAction::Resolved(resolution) => resolution.fork_id,
        }
    }
}

// =============================================================================
// CONFLICT PREDICATE & PRECEDENCE
// =============================================================================

/// Whether two events conflict. Symmetric in its arguments.
///
/// - same creator within the timestamp tolerance (narrowed to the same
///   event type and self-parent when `strict_creator_forks` is set)
/// - votes on the same target with different decisions
/// - moderation of the same target with different actions
pub fn are_conflicting(config: &ForkConfig, a: &Event, b: &Event) -> bool {
    if a.id == b.id || a.channel != b.channel {
        return false;
    }

    if a.creator == b.creator
        && a.timestamp.abs_diff(b.timestamp) <= config.timestamp_tolerance_ms
        && (!config.strict_creator_forks
            || (a.event_type == b.event_type && a.self_parent == b.self_parent))
    {
        return true;
    }

    match (&a.payload, &b.payload) {
        (EventPayload::Vote(x), EventPayload::Vote(y)) => {
            x.target == y.target && x.decision != y.decision
        }
        (EventPayload::Moderation(x), EventPayload::Moderation(y)) => {
            x.target == y.target && x.action != y.action
        }
        _ => false,
    }
}

/// Order two conflicting events by precedence; `Less` means `a` wins.
///
/// A causal ancestor beats its descendant; otherwise the earlier timestamp
/// wins; ties go to the lexicographically smaller id.
pub fn compare_precedence<F>(a: &Event, b: &Event, is_ancestor: F) -> Ordering
where
    F: Fn(&EventId, &EventId) -> bool,
{
    if is_ancestor(&a.id, &b.id) {
        return Ordering::Less;
    }
    if is_ancestor(&b.id, &a.id) {
        return Ordering::Greater;
    }
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.id.cmp(&b.id))
}

// =============================================================================
// RESOLVER
// =============================================================================

struct Candidate {
    event: Event,
    added_at: u64,
}

/// Fork resolver statistics
#[derive(Debug, Clone, Default)]
pub struct ForkStats {
    pub active: usize,
    pub total: usize,
    pub detected: u64,
    pub resolved: u64,
    pub resolved_by_method: HashMap<ResolutionMethod, u64>,
    /// Mean time from detection to resolution, in ms
    pub mean_resolution_ms: u64,
}

/// Fork resolver
pub struct ForkResolver {
    config: ForkConfig,
    forks: HashMap<ForkId, Fork>,
    /// Recent events per channel, compared against each new arrival
    candidates: HashMap<ChannelId, VecDeque<Candidate>>,
    /// Event -> open fork containing it
    event_forks: HashMap<EventId, ForkId>,
    /// Snapshot of each fork's events, for the automatic and fallback stages
    fork_events: HashMap<ForkId, Vec<Event>>,
    detected: u64,
    resolved_by_method: HashMap<ResolutionMethod, u64>,
    resolution_time_total: u64,
}

impl ForkResolver {
    pub fn new(config: ForkConfig) -> Self {
        Self {
            config,
            forks: HashMap::new(),
            candidates: HashMap::new(),
            event_forks: HashMap::new(),
            fork_events: HashMap::new(),
            detected: 0,
            resolved_by_method: HashMap::new(),
            resolution_time_total: 0,
        }
    }

    pub fn config(&self) -> &ForkConfig {
        &self.config
    }

    pub fn are_conflicting(&self, a: &Event, b: &Event) -> bool {
        are_conflicting(&self.config, a, b)
    }

    /// Compare a newly admitted event against its channel and open or
    /// extend a fork on conflict.
    pub fn on_event_admitted(&mut self, event: &Event, now: u64) -> Vec<ForkAction> {
        if event.is_revoked() || event.event_type == EventType::Revocation {
            return Vec::new();
        }

        let conflicts: Vec<Event> = self
            .candidates
            .get(&event.channel)
            .into_iter()
            .flatten()
            .filter(|c| !c.event.is_revoked() && self.are_conflicting(&c.event, event))
            .map(|c| c.event.clone())
            .collect();

        let queue = self.candidates.entry(event.channel.clone()).or_default();
        if !queue.iter().any(|c| c.event.id == event.id) {
            queue.push_back(Candidate {
                event: event.clone(),
                added_at: now,
            });
            while queue.len() > self.config.candidates_per_channel {
                queue.pop_front();
            }
        }

        if conflicts.is_empty() {
            return Vec::new();
        }

        // join an open fork if any conflicting event already belongs to one
        let open = conflicts
            .iter()
            .filter_map(|c| self.event_forks.get(&c.id))
            .find(|id| self.forks.get(*id).map_or(false, |f| !f.is_resolved()))
            .copied();
        if let Some(fork_id) = open {
            return self.extend_fork(fork_id, event, now);
        }

        let mut events = conflicts;
        events.push(event.clone());
        self.open_fork(events, now)
    }

    fn extend_fork(&mut self, fork_id: ForkId, event: &Event, now: u64) -> Vec<ForkAction> {
        let Some(fork) = self.forks.get_mut(&fork_id) else {
            return Vec::new();
        };
        if fork.conflicting_events.contains(&event.id) {
            return Vec::new();
        }
        fork.conflicting_events.push(event.id);
        fork.audit(
            now,
            "conflict_extended",
            SYSTEM_ACTOR,
            format!("event {} joined the conflict", event.id.to_hex()),
        );
        self.event_forks.insert(event.id, fork_id);
        self.fork_events
            .entry(fork_id)
            .or_default()
            .push(event.clone());
        info!("Event {} joined fork {}", event.id, fork_id);
        vec![ForkAction::ConflictExtended {
            fork_id,
            event: event.id,
        }]
    }

    fn open_fork(&mut self, mut events: Vec<Event>, now: u64) -> Vec<ForkAction> {
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        events.dedup_by(|a, b| a.id == b.id);

        let channel = events[0].channel.clone();
        let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
        let fork_id = derive_fork_id(&channel, &ids);
        if self.forks.contains_key(&fork_id) {
            return Vec::new();
        }

        let mut fork = Fork {
            id: fork_id,
            channel: channel.clone(),
            conflicting_events: ids.clone(),
            status: ForkStatus::Detected,
            resolution_method: None,
            winning_event: None,
            audit_trail: Vec::new(),
            detected_at: now,
            resolved_at: None,
            stage: None,
            votes: BTreeMap::new(),
        };
        fork.audit(
            now,
            "fork_detected",
            SYSTEM_ACTOR,
            format!("{} conflicting events: {}", ids.len(), hex_list(&ids)),
        );
        info!("Fork {} detected in channel {} ({} events)", fork_id, channel, ids.len());

        self.detected += 1;
        for id in &ids {
            self.event_forks.insert(*id, fork_id);
        }
        self.fork_events.insert(fork_id, events.clone());

        let mut actions = vec![ForkAction::Detected(fork.clone())];

        // stage 1: automatic
        let same_creator = events.iter().all(|e| e.creator == events[0].creator);
        let gap = events[1].timestamp.saturating_sub(events[0].timestamp);
        let reason = if gap > self.config.auto_resolve_gap_ms {
            None
        } else if same_creator {
            Some("same_creator_conflict")
        } else {
            Some("ambiguous_timestamps")
        };

        self.forks.insert(fork_id, fork);
        match reason {
            None => {
                let winner = events[0].id;
                if let Some(resolution) = self.resolve(
                    fork_id,
                    winner,
                    ResolutionMethod::Automatic,
                    SYSTEM_ACTOR,
                    Some(format!("timestamp_priority: {} ms ahead", gap)),
                    now,
                ) {
                    actions.push(ForkAction::Resolved(resolution));
                }
            }
            Some(reason) => {
                if let Some(fork) = self.forks.get_mut(&fork_id) {
                    fork.status = ForkStatus::Resolving;
                    fork.stage = Some(ResolutionStage::AwaitingModerator { since: now });
                    fork.audit(now, "automatic_refused", SYSTEM_ACTOR, reason.to_string());
                    fork.audit(now, "moderator_requested", SYSTEM_ACTOR, String::new());
                }
                actions.push(ForkAction::ModeratorRequested {
                    fork_id,
                    channel,
                    conflicting: ids,
                });
            }
        }
        actions
    }

    fn resolve(
        &mut self,
        fork_id: ForkId,
        winner: EventId,
        method: ResolutionMethod,
        actor: &str,
        reasoning: Option<String>,
        now: u64,
    ) -> Option<ForkResolution> {
        let fork = self.forks.get_mut(&fork_id)?;
        let losers: Vec<EventId> = fork
            .conflicting_events
            .iter()
            .filter(|id| **id != winner)
            .copied()
            .collect();

        fork.status = ForkStatus::Resolved;
        fork.stage = None;
        fork.resolution_method = Some(method);
        fork.winning_event = Some(winner);
        fork.resolved_at = Some(now);
        fork.audit(
            now,
            "fork_resolved",
            actor,
            format!(
                "method={} winner={} losers=[{}]{}",
                method.as_str(),
                winner.to_hex(),
                hex_list(&losers),
                reasoning
                    .as_ref()
                    .map(|r| format!(" reasoning={}", r))
                    .unwrap_or_default()
            ),
        );
        let resolution = ForkResolution {
            fork_id,
            channel: fork.channel.clone(),
            winner,
            losers: losers.clone(),
            method,
            actor: actor.to_string(),
            reasoning,
            resolved_at: now,
        };

        *self.resolved_by_method.entry(method).or_insert(0) += 1;
        self.resolution_time_total += now.saturating_sub(fork.detected_at);
        for loser in &losers {
            self.event_forks.remove(loser);
        }
        if let Some(queue) = self.candidates.get_mut(&resolution.channel) {
            queue.retain(|c| !losers.contains(&c.event.id));
        }
        self.fork_events.remove(&fork_id);

        info!(
            "Fork {} resolved by {}: winner {}, {} revoked",
            fork_id,
            method.as_str(),
            winner,
            losers.len()
        );
        Some(resolution)
    }

    fn check_open(&self, fork_id: &ForkId, event: &EventId) -> Result<(), ForkError> {
        let fork = self
            .forks
            .get(fork_id)
            .ok_or(ForkError::UnknownFork(*fork_id))?;
        if fork.is_resolved() {
            return Err(ForkError::AlreadyResolved(*fork_id));
        }
        if !fork.conflicting_events.contains(event) {
            return Err(ForkError::NotInFork {
                fork: *fork_id,
                event: *event,
            });
        }
        Ok(())
    }

    /// Resolve a fork by moderator decision
    pub fn submit_moderator_decision(
        &mut self,
        fork_id: &ForkId,
        moderator: &UserId,
        event: &EventId,
        reasoning: &str,
        now: u64,
    ) -> Result<ForkResolution, ForkError> {
        self.check_open(fork_id, event)?;
        self.resolve(
            *fork_id,
            *event,
            ResolutionMethod::ModeratorDecision,
            moderator.as_str(),
            Some(reasoning.to_string()),
            now,
        )
        .ok_or(ForkError::UnknownFork(*fork_id))
    }

    /// Record a weighted community vote. A voter's later vote replaces the
    /// earlier one; votes are tallied when the voting window closes.
    pub fn submit_community_vote(
        &mut self,
        fork_id: &ForkId,
        voter: &UserId,
        event: &EventId,
        weight: f64,
        now: u64,
    ) -> Result<(), ForkError> {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(ForkError::InvalidWeight(weight));
        }
        self.check_open(fork_id, event)?;
        let fork = self
            .forks
            .get_mut(fork_id)
            .ok_or(ForkError::UnknownFork(*fork_id))?;
        fork.votes.insert(
            voter.clone(),
            CommunityVote {
                event: *event,
                weight,
                cast_at: now,
            },
        );
        fork.audit(
            now,
            "community_vote",
            voter.as_str(),
            format!("event={} weight={}", event.to_hex(), weight),
        );
        debug!("Vote on fork {} by {}", fork_id, voter);
        Ok(())
    }

    /// Winner of the community tally, if any candidate clears the threshold
    /// with a quorum of voters
    fn tally(&self, fork: &Fork) -> Option<EventId> {
        if fork.votes.len() < self.config.min_community_votes {
            return None;
        }
        let mut weights: BTreeMap<EventId, f64> = BTreeMap::new();
        let mut total = 0.0;
        for vote in fork.votes.values() {
            *weights.entry(vote.event).or_insert(0.0) += vote.weight;
            total += vote.weight;
        }
        if total <= 0.0 {
            return None;
        }

        let mut ranked: Vec<(EventId, f64)> = weights.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        let (leader, weight) = ranked[0];
        if ranked.len() > 1 && (ranked[1].1 - weight).abs() < f64::EPSILON {
            return None;
        }
        (weight / total > self.config.community_vote_threshold).then_some(leader)
    }

    /// Advance every open fork's timers
    pub fn tick(&mut self, now: u64) -> Vec<ForkAction> {
        let timeout = self.config.resolution_timeout_ms;
        let vote_window = timeout / 2;
        let mut actions = Vec::new();

        let mut open: Vec<ForkId> = self
            .forks
            .values()
            .filter(|f| !f.is_resolved())
            .map(|f| f.id)
            .collect();
        open.sort();

        for fork_id in open {
            let Some(fork) = self.forks.get(&fork_id) else {
                continue;
            };

            if now.saturating_sub(fork.detected_at) >= 2 * timeout {
                let winner = self.fallback_winner(fork);
                if let Some(resolution) = self.resolve(
                    fork_id,
                    winner,
                    ResolutionMethod::TimeoutFallback,
                    SYSTEM_ACTOR,
                    Some("no resolution within the timeout".to_string()),
                    now,
                ) {
                    actions.push(ForkAction::Resolved(resolution));
                }
                continue;
            }

            let stage = fork.stage;
            match stage {
                Some(ResolutionStage::AwaitingModerator { since })
                    if now.saturating_sub(since) >= timeout =>
                {
                    if let Some(fork) = self.forks.get_mut(&fork_id) {
                        fork.stage = Some(ResolutionStage::CommunityVote { since: now });
                        fork.audit(now, "community_vote_opened", SYSTEM_ACTOR, String::new());
                    }
                    info!("Fork {} opened for community vote", fork_id);
                    actions.push(ForkAction::CommunityVoteOpened { fork_id });
                }
                Some(ResolutionStage::CommunityVote { since })
                    if now.saturating_sub(since) >= vote_window =>
                {
                    match self.tally(fork) {
                        Some(winner) => {
                            let voters = fork.votes.len();
                            if let Some(resolution) = self.resolve(
                                fork_id,
                                winner,
                                ResolutionMethod::CommunityVote,
                                SYSTEM_ACTOR,
                                Some(format!("{} voters", voters)),
                                now,
                            ) {
                                actions.push(ForkAction::Resolved(resolution));
                            }
                        }
                        None => {
                            let (channel, conflicting) =
                                (fork.channel.clone(), fork.conflicting_events.clone());
                            if let Some(fork) = self.forks.get_mut(&fork_id) {
                                fork.stage =
                                    Some(ResolutionStage::AwaitingModerator { since: now });
                                fork.audit(
                                    now,
                                    "escalated_to_moderator",
                                    SYSTEM_ACTOR,
                                    "tie or no quorum".to_string(),
                                );
                            }
                            actions.push(ForkAction::ModeratorRequested {
                                fork_id,
                                channel,
                                conflicting,
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        actions
    }

    fn fallback_winner(&self, fork: &Fork) -> EventId {
        self.fork_events
            .get(&fork.id)
            .and_then(|events| {
                events
                    .iter()
                    .filter(|e| fork.conflicting_events.contains(&e.id))
                    .min_by(|a, b| compare_precedence(a, b, |_, _| false))
                    .map(|e| e.id)
            })
            .or_else(|| fork.conflicting_events.iter().min().copied())
            .unwrap_or(fork.conflicting_events[0])
    }

    /// Drop resolved forks and candidate events older than the retention window
    pub fn prune(&mut self, now: u64) -> Vec<ForkId> {
        let cutoff = now.saturating_sub(self.config.retention_ms);
        let expired: Vec<ForkId> = self
            .forks
            .values()
            .filter(|f| f.resolved_at.map_or(false, |t| t < cutoff))
            .map(|f| f.id)
            .collect();
        for id in &expired {
            if let Some(fork) = self.forks.remove(id) {
                for event in &fork.conflicting_events {
                    if self.event_forks.get(event) == Some(id) {
                        self.event_forks.remove(event);
                    }
                }
            }
        }
        for queue in self.candidates.values_mut() {
            queue.retain(|c| c.added_at >= cutoff);
        }
        self.candidates.retain(|_, queue| !queue.is_empty());
        expired
    }

    /// Re-load a persisted fork
    pub fn restore(&mut self, fork: Fork) {
        if !fork.is_resolved() {
            for id in &fork.conflicting_events {
                self.event_forks.insert(*id, fork.id);
            }
        }
        self.forks.insert(fork.id, fork);
    }

    /// Re-load a candidate event (and fork snapshot) after restart
    pub fn restore_candidate(&mut self, event: &Event, now: u64) {
        if let Some(fork_id) = self.event_forks.get(&event.id).copied() {
            self.fork_events
                .entry(fork_id)
                .or_default()
                .push(event.clone());
        }
        if event.is_revoked() {
            return;
        }
        let queue = self.candidates.entry(event.channel.clone()).or_default();
        queue.push_back(Candidate {
            event: event.clone(),
            added_at: now,
        });
        while queue.len() > self.config.candidates_per_channel {
            queue.pop_front();
        }
    }

    pub fn get_fork(&self, id: &ForkId) -> Option<Fork> {
        self.forks.get(id).cloned()
    }

    /// Unresolved forks, oldest first
    pub fn get_active_forks(&self) -> Vec<Fork> {
        let mut forks: Vec<Fork> = self
            .forks
            .values()
            .filter(|f| !f.is_resolved())
            .cloned()
            .collect();
        forks.sort_by_key(|f| (f.detected_at, f.id));
        forks
    }

    pub fn stats(&self) -> ForkStats {
        let resolved: u64 = self.resolved_by_method.values().sum();
        ForkStats {
            active: self.forks.values().filter(|f| !f.is_resolved()).count(),
            total: self.forks.len(),
            detected: self.detected,
            resolved,
            resolved_by_method: self.resolved_by_method.clone(),
            mean_resolution_ms: if resolved == 0 {
                0
            } else {
                self.resolution_time_total / resolved
            },
        }
    }
}

fn hex_list(ids: &[EventId]) -> String {
    ids.iter().map(|id| id.to_hex()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::crypto::build_event;

    const T: u64 = 300_000;

    fn vote(creator: &str, target: &str, decision: &str, ts: u64, self_parent: Option<EventId>) -> Event {
        let draft = EventDraft::new(
            creator,
            "general",
            EventPayload::Vote(VotePayload {
                target: target.into(),
                decision: decision.into(),
            }),
        );
        build_event(draft, ts, self_parent, None, &[]).unwrap()
    }

    fn message(creator: &str, body: &str, ts: u64, self_parent: Option<EventId>) -> Event {
        let draft = EventDraft::new(
            creator,
            "general",
            EventPayload::Message(MessagePayload { body: body.into() }),
        );
        build_event(draft, ts, self_parent, None, &[]).unwrap()
    }

    fn moderation(creator: &str, target: &str, action: &str, ts: u64) -> Event {
        let draft = EventDraft::new(
            creator,
            "general",
            EventPayload::Moderation(ModerationPayload {
                target: target.into(),
                action: action.into(),
                reason: None,
            }),
        );
        build_event(draft, ts, None, None, &[]).unwrap()
    }

    fn resolved(actions: &[ForkAction]) -> Option<&ForkResolution> {
        actions.iter().find_map(|a| match a {
            ForkAction::Resolved(r) => Some(r),
            _ => None,
        })
    }

    /// Open an ambiguous fork between two voters; returns its id and events
    fn ambiguous_fork(resolver: &mut ForkResolver) -> (ForkId, Event, Event) {
        let x = vote("u1", "P1", "yes", 1_000, None);
        let y = vote("u2", "P1", "no", 1_100, None);
        resolver.on_event_admitted(&x, 1_000);
        let actions = resolver.on_event_admitted(&y, 1_100);
        let fork_id = actions[0].fork_id();
        assert!(actions
            .iter()
            .any(|a| matches!(a, ForkAction::ModeratorRequested { .. })));
        (fork_id, x, y)
    }

    #[test]
    fn test_conflict_rules() {
        let config = ForkConfig::default();
        let yes = vote("u1", "P1", "yes", 1_000, None);
        let no = vote("u2", "P1", "no", 5_000, None);
        let other_target = vote("u2", "P2", "no", 5_000, None);
        assert!(are_conflicting(&config, &yes, &no));
        assert!(!are_conflicting(&config, &yes, &other_target));

        let ban = moderation("m1", "u9", "ban", 1_000);
        let warn = moderation("m2", "u9", "warn", 9_000);
        assert!(are_conflicting(&config, &ban, &warn));

        // same creator, same slot in the chain
        let a = message("u1", "a", 1_000, None);
        let b = message("u1", "b", 1_500, None);
        assert!(are_conflicting(&config, &a, &b));
        // chained events are not equivocation under the strict rule
        let c = message("u1", "c", 1_500, Some(a.id));
        assert!(!are_conflicting(&config, &a, &c));

        let broad = ForkConfig {
            strict_creator_forks: false,
            ..Default::default()
        };
        assert!(are_conflicting(&broad, &a, &c));
        assert!(!are_conflicting(&config, &a, &a));
    }

    #[test]
    fn test_conflict_symmetry() {
        let config = ForkConfig::default();
        let events = vec![
            vote("u1", "P1", "yes", 1_000, None),
            vote("u2", "P1", "no", 1_600, None),
            message("u1", "m", 1_200, None),
            moderation("u3", "P1", "ban", 1_000),
        ];
        for a in &events {
            for b in &events {
                assert_eq!(are_conflicting(&config, a, b), are_conflicting(&config, b, a));
            }
        }
    }

    #[test]
    fn test_vote_scenario_resolves_to_earliest() {
        let mut resolver = ForkResolver::new(ForkConfig::default());
        let a = message("U1", "hello", 1_000, None);
        let b = vote("U1", "P1", "yes", 1_000, Some(a.id));
        let c = vote("U2", "P1", "no", 1_600, None);

        // not a same-creator conflict, but a same-target vote conflict
        assert_ne!(b.creator, c.creator);
        assert!(c.timestamp - b.timestamp > resolver.config().auto_resolve_gap_ms);
        assert!(resolver.are_conflicting(&b, &c));

        assert!(resolver.on_event_admitted(&a, 1_000).is_empty());
        assert!(resolver.on_event_admitted(&b, 1_000).is_empty());
        let actions = resolver.on_event_admitted(&c, 1_600);

        let resolution = resolved(&actions).expect("resolved automatically");
        assert_eq!(resolution.winner, b.id);
        assert_eq!(resolution.losers, vec![c.id]);
        assert_eq!(resolution.method, ResolutionMethod::Automatic);

        let fork = resolver.get_fork(&resolution.fork_id).unwrap();
        assert!(fork.is_resolved());
        assert_eq!(fork.winning_event, Some(b.id));
        assert!(resolver.get_active_forks().is_empty());
    }

    #[test]
    fn test_same_creator_refuses_automatic() {
        let mut resolver = ForkResolver::new(ForkConfig::default());
        let a = vote("u1", "P1", "yes", 1_000, None);
        let b = vote("u1", "P1", "no", 1_200, None);
        resolver.on_event_admitted(&a, 1_000);
        let actions = resolver.on_event_admitted(&b, 1_200);

        assert!(resolved(&actions).is_none());
        let fork = resolver.get_fork(&actions[0].fork_id()).unwrap();
        assert_eq!(fork.status, ForkStatus::Resolving);
        assert!(fork
            .audit_trail
            .iter()
            .any(|e| e.details == "same_creator_conflict"));
    }

    #[test]
    fn test_timestamp_gap_checked_before_creator() {
        let mut resolver = ForkResolver::new(ForkConfig::default());
        let a = vote("u1", "P1", "yes", 1_000, None);
        let b = vote("u1", "P1", "no", 3_000, None);
        resolver.on_event_admitted(&a, 1_000);
        let actions = resolver.on_event_admitted(&b, 3_000);

        let resolution = resolved(&actions).expect("gap beyond tolerance resolves");
        assert_eq!(resolution.winner, a.id);
        assert_eq!(resolution.method, ResolutionMethod::Automatic);
        let fork = resolver.get_fork(&resolution.fork_id).unwrap();
        assert!(!fork
            .audit_trail
            .iter()
            .any(|e| e.details == "same_creator_conflict"));
    }

    #[test]
    fn test_moderator_decision() {
        let mut resolver = ForkResolver::new(ForkConfig::default());
        let (fork_id, _x, y) = ambiguous_fork(&mut resolver);

        let err = resolver.submit_moderator_decision(
            &fork_id,
            &UserId::from("mod"),
            &EventId([1; 32]),
            "bad",
            2_000,
        );
        assert!(matches!(err, Err(ForkError::NotInFork { .. })));

        let resolution = resolver
            .submit_moderator_decision(&fork_id, &UserId::from("mod"), &y.id, "later is right", 2_000)
            .unwrap();
        assert_eq!(resolution.winner, y.id);
        assert_eq!(resolution.method, ResolutionMethod::ModeratorDecision);
        assert_eq!(resolution.actor, "mod");

        let again = resolver.submit_moderator_decision(&fork_id, &UserId::from("mod"), &y.id, "", 3_000);
        assert!(matches!(again, Err(ForkError::AlreadyResolved(_))));
        let fork = resolver.get_fork(&fork_id).unwrap();
        assert_eq!(fork.audit_trail.last().unwrap().actor, "mod");
    }

    #[test]
    fn test_community_vote_resolves() {
        let mut resolver = ForkResolver::new(ForkConfig::default());
        let (fork_id, x, y) = ambiguous_fork(&mut resolver);

        let actions = resolver.tick(1_100 + T);
        assert_eq!(actions, vec![ForkAction::CommunityVoteOpened { fork_id }]);

        for voter in ["v1", "v2", "v3"] {
            resolver
                .submit_community_vote(&fork_id, &UserId::from(voter), &x.id, 1.0, 1_200 + T)
                .unwrap();
        }
        resolver
            .submit_community_vote(&fork_id, &UserId::from("v4"), &y.id, 1.0, 1_200 + T)
            .unwrap();
        assert!(resolver
            .submit_community_vote(&fork_id, &UserId::from("v5"), &y.id, -1.0, 1_200 + T)
            .is_err());

        let actions = resolver.tick(1_100 + T + T / 2);
        let resolution = resolved(&actions).unwrap();
        assert_eq!(resolution.winner, x.id);
        assert_eq!(resolution.method, ResolutionMethod::CommunityVote);
    }

    #[test]
    fn test_tied_vote_escalates_then_times_out() {
        let mut resolver = ForkResolver::new(ForkConfig::default());
        let (fork_id, x, y) = ambiguous_fork(&mut resolver);
        resolver.tick(1_100 + T);
        for (voter, event) in [("v1", x.id), ("v2", y.id), ("v3", x.id), ("v4", y.id)] {
            resolver
                .submit_community_vote(&fork_id, &UserId::from(voter), &event, 1.0, 1_200 + T)
                .unwrap();
        }

        let actions = resolver.tick(1_100 + T + T / 2);
        assert!(matches!(actions[0], ForkAction::ModeratorRequested { .. }));
        assert!(!resolver.get_fork(&fork_id).unwrap().is_resolved());

        let actions = resolver.tick(1_100 + 2 * T);
        let resolution = resolved(&actions).unwrap();
        assert_eq!(resolution.method, ResolutionMethod::TimeoutFallback);
        assert_eq!(resolution.winner, x.id);
    }

    #[test]
    fn test_fork_liveness_without_input() {
        let mut resolver = ForkResolver::new(ForkConfig::default());
        let (fork_id, _, _) = ambiguous_fork(&mut resolver);

        let mut now = 1_100;
        while now <= 1_100 + 2 * T {
            resolver.tick(now);
            now += 10_000;
        }
        resolver.tick(1_100 + 2 * T);
        let fork = resolver.get_fork(&fork_id).unwrap();
        assert!(fork.is_resolved());
        assert_eq!(fork.resolution_method, Some(ResolutionMethod::TimeoutFallback));
        // audit trail kept in full
        assert!(fork.audit_trail.len() >= 4);
    }

    #[test]
    fn test_third_conflict_extends_open_fork() {
        let mut resolver = ForkResolver::new(ForkConfig::default());
        let (fork_id, _, _) = ambiguous_fork(&mut resolver);
        let z = vote("u3", "P1", "abstain", 1_150, None);
        let actions = resolver.on_event_admitted(&z, 1_150);
        assert_eq!(
            actions,
            vec![ForkAction::ConflictExtended {
                fork_id,
                event: z.id
            }]
        );
        assert_eq!(resolver.get_fork(&fork_id).unwrap().conflicting_events.len(), 3);
    }

    #[test]
    fn test_precedence_prefers_ancestor() {
        let a = message("u1", "a", 5_000, None);
        let b = message("u2", "b", 1_000, None);
        assert_eq!(compare_precedence(&a, &b, |_, _| false), Ordering::Greater);
        assert_eq!(
            compare_precedence(&a, &b, |x, y| *x == a.id && *y == b.id),
            Ordering::Less
        );
    }

    #[test]
    fn test_prune_drops_old_resolved_forks_only() {
        let mut resolver = ForkResolver::new(ForkConfig {
            retention_ms: 10_000,
            ..Default::default()
        });
        let b = vote("U1", "P1", "yes", 1_000, None);
        let c = vote("U2", "P1", "no", 1_600, None);
        resolver.on_event_admitted(&b, 1_000);
        let resolved_id = resolver.on_event_admitted(&c, 1_600)[0].fork_id();
        let (open_id, _, _) = {
            let x = vote("u1", "P9", "yes", 20_000, None);
            let y = vote("u2", "P9", "no", 20_100, None);
            resolver.on_event_admitted(&x, 20_000);
            let id = resolver.on_event_admitted(&y, 20_100)[0].fork_id();
            (id, x, y)
        };

        let pruned = resolver.prune(30_000);
        assert_eq!(pruned, vec![resolved_id]);
        assert!(resolver.get_fork(&resolved_id).is_none());
        assert!(resolver.get_fork(&open_id).is_some());
    }
}
