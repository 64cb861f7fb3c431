//! Event DAG store
//!
//! Events live in an arena indexed by integer handle, with secondary
//! indices by id, channel and creator. Events whose parents have not arrived
//! yet wait in a pending set keyed by the missing ids and are admitted as
//! soon as their last parent lands, cascading down chains.
//!
//! Each slot also carries the set of creators whose events descend from it.
//! The set grows as children are admitted, so finalization only compares a
//! size against the quorum. Prune compacts the arena and remaps handles.
//!
//! The store is a plain owned structure. The node wraps it in a lock and
//! routes every mutation through a single task.

use crate::config::StoreConfig;
use relay_core::canonical::{validate_event_shape, validate_payload};
use relay_core::crypto::{build_event, verify_event};
use relay_core::types::*;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};

/// Arena slot index
pub type Handle = usize;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid event: {0}")]
    Validation(#[from] relay_core::Error),
    #[error("Parent not found: {0}")]
    InvalidParent(EventId),
    #[error("Cycle detected through event {0}")]
    CycleDetected(EventId),
    #[error("Unknown event: {0}")]
    UnknownEvent(EventId),
    #[error("Signer key does not match the key bound to creator {creator}")]
    SignerMismatch { creator: UserId },
}

/// Result of offering an event to the store
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// The event was admitted. The first entry is the event itself, followed
    /// by every pending event its arrival released, in admission order.
    Admitted(Vec<Event>),
    /// Parked until the listed parents arrive
    Pending { id: EventId, missing: Vec<EventId> },
    /// Already admitted, pending or pruned; nothing changed
    Duplicate(EventId),
}

impl AddOutcome {
    /// Events admitted by this call
    pub fn admitted(&self) -> &[Event] {
        match self {
            AddOutcome::Admitted(events) => events,
            _ => &[],
        }
    }
}

/// Parent slots for a locally created event
#[derive(Debug, Clone, Default)]
pub struct ParentRefs {
    pub self_parent: Option<EventId>,
    pub other_parent: Option<EventId>,
    pub additional: Vec<EventId>,
    /// Parents that may be absent from the store; the event parks until they arrive
    pub allow_missing: Vec<EventId>,
}

struct Slot {
    event: Event,
    received_at: u64,
    /// Admission sequence number; survives compaction
    seq: u64,
    children: Vec<Handle>,
    /// Creators of admitted descendants
    witnesses: HashSet<UserId>,
}

struct PendingEntry {
    event: Event,
    missing: HashSet<EventId>,
    parked_at: u64,
}

/// Events pruned by a call to [`EventStore::prune`]
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub pruned: Vec<EventId>,
    pub tombstones: usize,
    pub pending_expired: usize,
}

/// Store statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub events: usize,
    pub pending: usize,
    pub tombstones: usize,
    pub channels: usize,
    pub creators: usize,
    pub finalized: usize,
    pub next_round: u64,
    pub duplicates_ignored: u64,
    pub pending_evicted: u64,
    pub cycles_rejected: u64,
    pub validation_rejected: u64,
    pub signer_rejected: u64,
    /// Witness set insertions performed while admitting events
    pub witness_updates: u64,
    /// Allocated arena slots (live events after a prune)
    pub arena_slots: usize,
}

/// The event DAG
pub struct EventStore {
    config: StoreConfig,
    slots: Vec<Option<Slot>>,
    index: HashMap<EventId, Handle>,
    by_channel: HashMap<ChannelId, Vec<Handle>>,
    by_creator: HashMap<UserId, Vec<Handle>>,
    /// Pruned events still referenced by survivors: id -> height
    tombstones: HashMap<EventId, u64>,
    pending: HashMap<EventId, PendingEntry>,
    /// Missing parent id -> pending events waiting on it
    waiting_on: HashMap<EventId, Vec<EventId>>,
    /// Park order, for oldest-first eviction
    pending_order: VecDeque<EventId>,
    /// First signing key seen per creator
    creator_keys: HashMap<UserId, Vec<u8>>,
    /// Events without a round: (height, seq, id)
    unfinalized: BTreeSet<(u64, u64, EventId)>,
    next_seq: u64,
    next_round: u64,
    finalized: usize,
    duplicates_ignored: u64,
    pending_evicted: u64,
    cycles_rejected: u64,
    validation_rejected: u64,
    signer_rejected: u64,
    witness_updates: u64,
}

impl EventStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
            index: HashMap::new(),
            by_channel: HashMap::new(),
            by_creator: HashMap::new(),
            tombstones: HashMap::new(),
            pending: HashMap::new(),
            waiting_on: HashMap::new(),
            pending_order: VecDeque::new(),
            creator_keys: HashMap::new(),
            unfinalized: BTreeSet::new(),
            next_seq: 0,
            next_round: 1,
            finalized: 0,
            duplicates_ignored: 0,
            pending_evicted: 0,
            cycles_rejected: 0,
            validation_rejected: 0,
            signer_rejected: 0,
            witness_updates: 0,
        }
    }

    // =========================================================================
    // ADMISSION
    // =========================================================================

    /// Build a local event from a draft and admit it.
    ///
    /// Every referenced parent must be in the store (or pruned) unless it is
    /// listed in `allow_missing`.
    pub fn create_event(
        &mut self,
        draft: EventDraft,
        parents: ParentRefs,
        now: u64,
    ) -> Result<(Event, AddOutcome), StoreError> {
        let referenced = parents
            .self_parent
            .iter()
            .chain(parents.other_parent.iter())
            .chain(parents.additional.iter());
        for id in referenced {
            if !self.is_resolved(id) && !parents.allow_missing.contains(id) {
                return Err(StoreError::InvalidParent(*id));
            }
        }

        if let Err(e) = validate_payload(draft.payload.event_type(), &draft.payload) {
            self.validation_rejected += 1;
            return Err(e.into());
        }
        let event = build_event(
            draft,
            now,
            parents.self_parent,
            parents.other_parent,
            &parents.additional,
        )?;
        if let Err(e) = validate_event_shape(&event) {
            self.validation_rejected += 1;
            return Err(e.into());
        }

        if let Some(existing) = self.get(&event.id).cloned() {
            self.duplicates_ignored += 1;
            return Ok((existing, AddOutcome::Duplicate(event.id)));
        }

        let outcome = self.admit_or_park(event.clone(), now)?;
        let created = outcome.admitted().first().cloned().unwrap_or(event);
        Ok((created, outcome))
    }

    /// Offer an event received from the network.
    ///
    /// Duplicates are a no-op. Malformed events and events whose parent set
    /// loops back to themselves are rejected without touching the DAG.
    ///
    /// The first signing key seen for a creator is bound to it. Later events
    /// claiming that creator must carry the same key.
    pub fn add_external_event(&mut self, event: Event, now: u64) -> Result<AddOutcome, StoreError> {
        if self.is_known(&event.id) {
            self.duplicates_ignored += 1;
            return Ok(AddOutcome::Duplicate(event.id));
        }
        if let Err(e) = verify_event(&event) {
            self.validation_rejected += 1;
            warn!("Rejected event {} from {}: {}", event.id, event.creator, e);
            return Err(e.into());
        }
        if !self.signer_matches(&event) {
            self.signer_rejected += 1;
            warn!(
                "Rejected event {}: signer is not the key bound to {}",
                event.id, event.creator
            );
            return Err(StoreError::SignerMismatch {
                creator: event.creator,
            });
        }

        let binding = event
            .signer_pubkey
            .clone()
            .map(|key| (event.creator.clone(), key));
        let outcome = self.admit_or_park(event, now)?;
        if let Some((creator, key)) = binding {
            self.creator_keys.entry(creator).or_insert(key);
        }
        Ok(outcome)
    }

    /// Unsigned events are accepted only for creators with no bound key.
    fn signer_matches(&self, event: &Event) -> bool {
        match self.creator_keys.get(&event.creator) {
            None => true,
            Some(bound) => event.signer_pubkey.as_deref() == Some(bound.as_slice()),
        }
    }

    /// Key bound to a creator, if any signed event has been seen
    pub fn creator_key(&self, creator: &UserId) -> Option<&[u8]> {
        self.creator_keys.get(creator).map(Vec::as_slice)
    }

    fn admit_or_park(&mut self, event: Event, now: u64) -> Result<AddOutcome, StoreError> {
        if self.closes_cycle(&event) {
            self.cycles_rejected += 1;
            warn!(
                "Cycle detected through event {} (creator {}), possible attack",
                event.id, event.creator
            );
            return Err(StoreError::CycleDetected(event.id));
        }

        let missing: Vec<EventId> = event
            .parents
            .iter()
            .filter(|p| !self.is_resolved(p))
            .copied()
            .collect();

        if missing.is_empty() {
            let mut admitted = vec![self.insert(event, now)];
            self.release_pending(&mut admitted, now);
            return Ok(AddOutcome::Admitted(admitted));
        }

        let id = event.id;
        debug!("Event {} pending on {} parents", id, missing.len());
        for parent in &missing {
            self.waiting_on.entry(*parent).or_default().push(id);
        }
        self.pending.insert(
            id,
            PendingEntry {
                event,
                missing: missing.iter().copied().collect(),
                parked_at: now,
            },
        );
        self.pending_order.push_back(id);
        self.evict_pending_overflow();

        Ok(AddOutcome::Pending { id, missing })
    }

    /// Whether the event's parents reach the event itself through pending
    /// events. Admitted events cannot be involved: all their ancestors were
    /// admitted before them.
    fn closes_cycle(&self, event: &Event) -> bool {
        let target = event.id;
        let mut stack: Vec<EventId> = event.parents.clone();
        let mut visited = HashSet::new();

        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if visited.len() > self.config.max_dag_depth {
                return false;
            }
            if let Some(entry) = self.pending.get(&id) {
                stack.extend(entry.event.parents.iter().copied());
            }
        }
        false
    }

    fn insert(&mut self, mut event: Event, now: u64) -> Event {
        let parent_height = event
            .parents
            .iter()
            .filter_map(|p| self.height_of(p))
            .max();
        event.height = parent_height.map_or(0, |h| h + 1);
        event.consensus_round = None;
        event.revocation_status = RevocationStatus::Active;

        self.link(event.clone(), now);

        debug!(
            "Admitted event {} (creator {}, height {})",
            event.id, event.creator, event.height
        );
        event
    }

    /// Place an event in the arena, wire it into the indices and credit its
    /// creator to every ancestor.
    fn link(&mut self, event: Event, received_at: u64) -> Handle {
        let handle = self.slots.len();
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut parent_handles = Vec::with_capacity(event.parents.len());
        for parent in &event.parents {
            match self.index.get(parent) {
                Some(&ph) => parent_handles.push(ph),
                None => {
                    self.tombstones
                        .entry(*parent)
                        .or_insert(event.height.saturating_sub(1));
                }
            }
        }
        for &ph in &parent_handles {
            if let Some(slot) = self.slots[ph].as_mut() {
                slot.children.push(handle);
            }
        }

        self.index.insert(event.id, handle);
        self.by_channel
            .entry(event.channel.clone())
            .or_default()
            .push(handle);
        self.by_creator
            .entry(event.creator.clone())
            .or_default()
            .push(handle);
        if event.consensus_round.is_none() {
            self.unfinalized.insert((event.height, seq, event.id));
        }
        let creator = event.creator.clone();
        self.slots.push(Some(Slot {
            event,
            received_at,
            seq,
            children: Vec::new(),
            witnesses: HashSet::new(),
        }));

        self.credit_witness(&creator, parent_handles);
        handle
    }

    /// Add `creator` to the witness set of each ancestor. A slot that already
    /// holds it has ancestors that hold it too, so the walk stops there.
    fn credit_witness(&mut self, creator: &UserId, mut stack: Vec<Handle>) {
        let index = &self.index;
        while let Some(handle) = stack.pop() {
            let Some(slot) = self.slots[handle].as_mut() else {
                continue;
            };
            if !slot.witnesses.insert(creator.clone()) {
                continue;
            }
            self.witness_updates += 1;
            stack.extend(slot.event.parents.iter().filter_map(|p| index.get(p).copied()));
        }
    }

    fn release_pending(&mut self, admitted: &mut Vec<Event>, now: u64) {
        let mut queue: VecDeque<EventId> = admitted.iter().map(|e| e.id).collect();

        while let Some(arrived) = queue.pop_front() {
            let Some(waiters) = self.waiting_on.remove(&arrived) else {
                continue;
            };
            for waiter in waiters {
                let ready = match self.pending.get_mut(&waiter) {
                    Some(entry) => {
                        entry.missing.remove(&arrived);
                        entry.missing.is_empty()
                    }
                    None => false,
                };
                if !ready {
                    continue;
                }
                if let Some(entry) = self.pending.remove(&waiter) {
                    let event = self.insert(entry.event, now);
                    queue.push_back(event.id);
                    admitted.push(event);
                }
            }
        }
    }

    fn evict_pending_overflow(&mut self) {
        while self.pending.len() > self.config.max_pending {
            let Some(oldest) = self.pending_order.pop_front() else {
                break;
            };
            if let Some(entry) = self.pending.remove(&oldest) {
                self.unlink_waiter(&oldest, &entry);
                self.pending_evicted += 1;
                debug!("Evicted pending event {}", oldest);
            }
        }
        // drop ids already admitted or evicted
        while let Some(front) = self.pending_order.front() {
            if self.pending.contains_key(front) {
                break;
            }
            self.pending_order.pop_front();
        }
    }

    fn unlink_waiter(&mut self, id: &EventId, entry: &PendingEntry) {
        for parent in &entry.missing {
            if let Some(waiters) = self.waiting_on.get_mut(parent) {
                waiters.retain(|w| w != id);
                if waiters.is_empty() {
                    self.waiting_on.remove(parent);
                }
            }
        }
    }

    /// Re-insert a persisted event verbatim (height, round and status kept).
    ///
    /// Callers restore in height order.
    pub fn restore(&mut self, event: Event, received_at: u64) {
        if self.index.contains_key(&event.id) {
            return;
        }
        if let Some(round) = event.consensus_round {
            self.next_round = self.next_round.max(round + 1);
            self.finalized += 1;
        }
        if let Some(key) = &event.signer_pubkey {
            self.creator_keys
                .entry(event.creator.clone())
                .or_insert_with(|| key.clone());
        }
        self.link(event, received_at);
    }

    // =========================================================================
    // CONSENSUS
    // =========================================================================

    /// Distinct creators seen within the participant window, floored at the
    /// configured minimum
    pub fn active_participants(&self, now: u64) -> usize {
        let since = now.saturating_sub(self.config.participant_window_ms);
        let active = self
            .by_creator
            .values()
            .filter(|handles| {
                handles
                    .iter()
                    .rev()
                    .filter_map(|h| self.slots[*h].as_ref())
                    .any(|slot| slot.received_at >= since)
            })
            .count();
        active.max(self.config.min_participants)
    }

    fn witnesses_needed(&self, active: usize) -> usize {
        ((active as f64) * self.config.consensus_threshold - 1e-9).ceil() as usize
    }

    /// Distinct creators of events that can see `id`
    pub fn witness_creators(&self, id: &EventId) -> HashSet<UserId> {
        self.index
            .get(id)
            .and_then(|h| self.slots[*h].as_ref())
            .map(|slot| slot.witnesses.clone())
            .unwrap_or_default()
    }

    /// Assign a consensus round to `id` if enough distinct creators witness it.
    ///
    /// Returns the event's round, whether newly assigned or already set.
    pub fn compute_consensus_round(&mut self, id: &EventId, now: u64) -> Option<u64> {
        let handle = *self.index.get(id)?;
        if let Some(round) = self.slots[handle].as_ref()?.event.consensus_round {
            return Some(round);
        }
        let needed = self.witnesses_needed(self.active_participants(now));
        self.finalize_if_witnessed(handle, needed)
    }

    fn finalize_if_witnessed(&mut self, handle: Handle, needed: usize) -> Option<u64> {
        let slot = self.slots[handle].as_mut()?;
        if slot.witnesses.len() < needed {
            return None;
        }
        let round = self.next_round;
        slot.event.consensus_round = Some(round);
        self.unfinalized
            .remove(&(slot.event.height, slot.seq, slot.event.id));
        self.next_round += 1;
        self.finalized += 1;
        debug!("Event {} finalized in round {}", slot.event.id, round);
        Some(round)
    }

    /// Try to finalize every unfinalized event, lowest height first.
    ///
    /// Returns the newly finalized events.
    pub fn advance_consensus(&mut self, now: u64) -> Vec<Event> {
        if self.unfinalized.is_empty() {
            return Vec::new();
        }
        let needed = self.witnesses_needed(self.active_participants(now));
        let ready: Vec<Handle> = self
            .unfinalized
            .iter()
            .filter_map(|(_, _, id)| self.index.get(id).copied())
            .filter(|h| {
                self.slots[*h]
                    .as_ref()
                    .is_some_and(|s| s.witnesses.len() >= needed)
            })
            .collect();

        let mut finalized = Vec::new();
        for handle in ready {
            if self.finalize_if_witnessed(handle, needed).is_some() {
                if let Some(slot) = &self.slots[handle] {
                    finalized.push(slot.event.clone());
                }
            }
        }
        finalized
    }

    // =========================================================================
    // TRAVERSAL
    // =========================================================================

    /// Whether `a` can reach `b` through parent edges. An event sees itself.
    pub fn can_see(&self, a: &EventId, b: &EventId) -> bool {
        if a == b {
            return self.contains(a);
        }
        let Some(target_height) = self.height_of(b) else {
            return false;
        };
        let Some(start) = self.get(a) else {
            return false;
        };

        // heights strictly decrease along parent edges
        let mut visited: HashSet<EventId> = HashSet::new();
        let mut queue: VecDeque<EventId> = start.parents.iter().copied().collect();

        while let Some(id) = queue.pop_front() {
            if id == *b {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            let Some(event) = self.get(&id) else {
                continue;
            };
            if event.height <= target_height {
                continue;
            }
            queue.extend(event.parents.iter().copied());
        }
        false
    }

    // =========================================================================
    // PRUNING
    // =========================================================================

    /// Remove events received before the retention window.
    ///
    /// Pruned events still referenced by survivors leave a tombstone carrying
    /// their height. Stale pending events are dropped as well, and the arena
    /// is compacted so its size follows the live event count.
    pub fn prune(&mut self, now: u64) -> PruneReport {
        let cutoff = now.saturating_sub(self.config.retention_ms);
        let mut report = PruneReport::default();

        let expired: Vec<Handle> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(h, slot)| match slot {
                Some(s) if s.received_at < cutoff => Some(h),
                _ => None,
            })
            .collect();
        let expired_set: HashSet<Handle> = expired.iter().copied().collect();

        for handle in &expired {
            let Some(slot) = self.slots[*handle].take() else {
                continue;
            };
            let id = slot.event.id;
            self.index.remove(&id);
            if slot.children.iter().any(|c| !expired_set.contains(c)) {
                self.tombstones.insert(id, slot.event.height);
            }
            if slot.event.consensus_round.is_some() {
                self.finalized = self.finalized.saturating_sub(1);
            } else {
                self.unfinalized
                    .remove(&(slot.event.height, slot.seq, id));
            }
            report.pruned.push(id);
        }

        if !expired.is_empty() {
            self.compact();

            let referenced: HashSet<EventId> = self
                .slots
                .iter()
                .flatten()
                .flat_map(|s| s.event.parents.iter().copied())
                .collect();
            self.tombstones.retain(|id, _| referenced.contains(id));
        }

        let stale: Vec<EventId> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.parked_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(entry) = self.pending.remove(&id) {
                self.unlink_waiter(&id, &entry);
                report.pending_expired += 1;
            }
        }
        self.pending_order.retain(|id| self.pending.contains_key(id));

        report.tombstones = self.tombstones.len();
        if !report.pruned.is_empty() {
            debug!(
                "Pruned {} events ({} tombstones)",
                report.pruned.len(),
                report.tombstones
            );
        }
        report
    }

    /// Drop empty slots and rewrite every stored handle. Admission order is
    /// preserved.
    fn compact(&mut self) {
        let mut remap: Vec<Option<Handle>> = Vec::with_capacity(self.slots.len());
        let mut live: Vec<Option<Slot>> = Vec::with_capacity(self.index.len());
        for slot in self.slots.drain(..) {
            match slot {
                Some(slot) => {
                    remap.push(Some(live.len()));
                    live.push(Some(slot));
                }
                None => remap.push(None),
            }
        }
        let remap_all = |handles: &mut Vec<Handle>| {
            *handles = handles.iter().filter_map(|h| remap[*h]).collect();
        };

        for slot in live.iter_mut().flatten() {
            remap_all(&mut slot.children);
        }
        for handles in self.by_channel.values_mut() {
            remap_all(handles);
        }
        self.by_channel.retain(|_, handles| !handles.is_empty());
        for handles in self.by_creator.values_mut() {
            remap_all(handles);
        }
        self.by_creator.retain(|_, handles| !handles.is_empty());
        for handle in self.index.values_mut() {
            if let Some(new) = remap[*handle] {
                *handle = new;
            }
        }
        self.slots = live;
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn get(&self, id: &EventId) -> Option<&Event> {
        let handle = *self.index.get(id)?;
        self.slots[handle].as_ref().map(|s| &s.event)
    }

    /// Whether the event is admitted
    pub fn contains(&self, id: &EventId) -> bool {
        self.index.contains_key(id)
    }

    /// Whether the event is admitted, pending or pruned
    pub fn is_known(&self, id: &EventId) -> bool {
        self.index.contains_key(id) || self.pending.contains_key(id) || self.tombstones.contains_key(id)
    }

    pub fn is_pending(&self, id: &EventId) -> bool {
        self.pending.contains_key(id)
    }

    fn is_resolved(&self, id: &EventId) -> bool {
        self.index.contains_key(id) || self.tombstones.contains_key(id)
    }

    fn height_of(&self, id: &EventId) -> Option<u64> {
        self.get(id)
            .map(|e| e.height)
            .or_else(|| self.tombstones.get(id).copied())
    }

    /// Channel events in admission order (parents before children)
    pub fn get_channel_events(&self, channel: &ChannelId, include_revoked: bool) -> Vec<Event> {
        self.collect(self.by_channel.get(channel), include_revoked)
    }

    /// A user's events in admission order
    pub fn get_user_events(&self, user: &UserId, include_revoked: bool) -> Vec<Event> {
        self.collect(self.by_creator.get(user), include_revoked)
    }

    fn collect(&self, handles: Option<&Vec<Handle>>, include_revoked: bool) -> Vec<Event> {
        handles
            .into_iter()
            .flatten()
            .filter_map(|h| self.slots[*h].as_ref())
            .map(|s| &s.event)
            .filter(|e| include_revoked || !e.is_revoked())
            .cloned()
            .collect()
    }

    /// Latest admitted event of a creator (the next self-parent)
    pub fn latest_by_creator(&self, user: &UserId) -> Option<EventId> {
        self.by_creator
            .get(user)?
            .iter()
            .rev()
            .find_map(|h| self.slots[*h].as_ref())
            .map(|s| s.event.id)
    }

    /// Events with no admitted children
    pub fn tips(&self) -> Vec<EventId> {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.children.is_empty())
            .map(|s| s.event.id)
            .collect()
    }

    /// Events received at or after `since` (local clock), oldest first
    pub fn events_since(&self, since: u64, max: usize) -> Vec<Event> {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.received_at >= since)
            .take(max)
            .map(|s| s.event.clone())
            .collect()
    }

    /// Local receive time of an admitted event
    pub fn received_at(&self, id: &EventId) -> Option<u64> {
        let handle = *self.index.get(id)?;
        self.slots[handle].as_ref().map(|s| s.received_at)
    }

    /// Change an admitted event's revocation status. Returns whether it changed.
    pub fn set_revocation_status(
        &mut self,
        id: &EventId,
        status: RevocationStatus,
    ) -> Result<bool, StoreError> {
        let handle = *self.index.get(id).ok_or(StoreError::UnknownEvent(*id))?;
        let slot = self.slots[handle]
            .as_mut()
            .ok_or(StoreError::UnknownEvent(*id))?;
        if slot.event.revocation_status == status {
            return Ok(false);
        }
        slot.event.revocation_status = status;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Raise the round counter to at least `round` (persisted counter on restart)
    pub fn set_next_round(&mut self, round: u64) {
        self.next_round = self.next_round.max(round);
    }

    pub fn next_round(&self) -> u64 {
        self.next_round
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            events: self.index.len(),
            pending: self.pending.len(),
            tombstones: self.tombstones.len(),
            channels: self.by_channel.len(),
            creators: self.by_creator.len(),
            finalized: self.finalized,
            next_round: self.next_round,
            duplicates_ignored: self.duplicates_ignored,
            pending_evicted: self.pending_evicted,
            cycles_rejected: self.cycles_rejected,
            validation_rejected: self.validation_rejected,
            signer_rejected: self.signer_rejected,
            witness_updates: self.witness_updates,
            arena_slots: self.slots.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::crypto::{sign_event, KeyPair};

    fn vote(creator: &str, target: &str, decision: &str) -> EventDraft {
        EventDraft::new(
            creator,
            "general",
            EventPayload::Vote(VotePayload {
                target: target.into(),
                decision: decision.into(),
            }),
        )
    }

    fn message(creator: &str, body: &str) -> EventDraft {
        EventDraft::new(
            creator,
            "general",
            EventPayload::Message(MessagePayload { body: body.into() }),
        )
    }

    /// External event with a chosen id and arbitrary parents
    fn external(tag: u8, creator: &str, parents: &[EventId]) -> Event {
        let mut event =
            build_event(message(creator, &format!("m{}", tag)), 1_000 + tag as u64, None, None, parents)
                .unwrap();
        event.id = EventId([tag; 32]);
        event
    }

    fn store() -> EventStore {
        EventStore::new(StoreConfig::default())
    }

    /// Content-addressed chain of `len` events, each the child of the previous
    fn chain(creator: &str, tag: &str, start: u64, len: usize, root: Option<EventId>) -> Vec<Event> {
        let mut events: Vec<Event> = Vec::with_capacity(len);
        let mut prev = root;
        for i in 0..len {
            let parents: Vec<EventId> = prev.into_iter().collect();
            let event = build_event(
                message(creator, &format!("{}-{}", tag, i)),
                start + i as u64,
                None,
                None,
                &parents,
            )
            .unwrap();
            prev = Some(event.id);
            events.push(event);
        }
        events
    }

    fn signed(creator: &str, body: &str, keypair: &KeyPair) -> Event {
        let mut event = build_event(message(creator, body), 1_000, None, None, &[]).unwrap();
        sign_event(&mut event, keypair).unwrap();
        event
    }

    #[test]
    fn test_create_chain_heights() {
        let mut store = store();
        let (a, _) = store
            .create_event(message("u1", "a"), ParentRefs::default(), 1_000)
            .unwrap();
        let (b, outcome) = store
            .create_event(
                message("u1", "b"),
                ParentRefs {
                    self_parent: Some(a.id),
                    ..Default::default()
                },
                1_001,
            )
            .unwrap();

        assert_eq!(a.height, 0);
        assert_eq!(b.height, 1);
        assert_eq!(outcome.admitted().len(), 1);
        assert_eq!(store.latest_by_creator(&UserId::from("u1")), Some(b.id));
        assert_eq!(store.tips(), vec![b.id]);
    }

    #[test]
    fn test_create_with_unknown_parent_rejected() {
        let mut store = store();
        let missing = EventId([9; 32]);
        let result = store.create_event(
            message("u1", "a"),
            ParentRefs {
                self_parent: Some(missing),
                ..Default::default()
            },
            1_000,
        );
        assert!(matches!(result, Err(StoreError::InvalidParent(id)) if id == missing));
        assert!(store.is_empty());
    }

    #[test]
    fn test_create_with_allowed_missing_parent_parks() {
        let mut store = store();
        let missing = EventId([9; 32]);
        let (event, outcome) = store
            .create_event(
                message("u1", "a"),
                ParentRefs {
                    other_parent: Some(missing),
                    allow_missing: vec![missing],
                    ..Default::default()
                },
                1_000,
            )
            .unwrap();
        assert!(matches!(outcome, AddOutcome::Pending { .. }));
        assert!(store.is_pending(&event.id));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let mut store = store();
        let result = store.create_event(vote("u1", "", "yes"), ParentRefs::default(), 1_000);
        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(store.stats().validation_rejected, 1);
    }

    #[test]
    fn test_duplicate_is_noop() {
        let mut store = store();
        let a = external(1, "u1", &[]);
        assert!(matches!(
            store.add_external_event(a.clone(), 10).unwrap(),
            AddOutcome::Admitted(_)
        ));
        assert!(matches!(
            store.add_external_event(a, 20).unwrap(),
            AddOutcome::Duplicate(_)
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().duplicates_ignored, 1);
    }

    #[test]
    fn test_pending_cascade_admits_chain() {
        let mut store = store();
        let a = external(1, "u1", &[]);
        let b = external(2, "u1", &[a.id]);
        let c = external(3, "u1", &[b.id]);

        assert!(matches!(
            store.add_external_event(c.clone(), 10).unwrap(),
            AddOutcome::Pending { .. }
        ));
        assert!(matches!(
            store.add_external_event(b.clone(), 11).unwrap(),
            AddOutcome::Pending { .. }
        ));
        assert_eq!(store.pending_len(), 2);

        let outcome = store.add_external_event(a.clone(), 12).unwrap();
        let ids: Vec<EventId> = outcome.admitted().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        assert_eq!(store.pending_len(), 0);
        assert_eq!(store.get(&c.id).unwrap().height, 2);
    }

    #[test]
    fn test_self_reference_rejected() {
        let mut store = store();
        let mut event = external(5, "u1", &[EventId([5; 32])]);
        event.id = EventId([5; 32]);
        assert!(matches!(
            store.add_external_event(event, 10),
            Err(StoreError::CycleDetected(_))
        ));
        assert_eq!(store.stats().cycles_rejected, 1);
    }

    #[test]
    fn test_cycle_through_pending_rejected() {
        let mut store = store();
        let x = EventId([1; 32]);
        let y = EventId([2; 32]);
        // y waits on x; then x arrives claiming y as its parent
        store.add_external_event(external(2, "u1", &[x]), 10).unwrap();
        let result = store.add_external_event(external(1, "u2", &[y]), 11);
        assert!(matches!(result, Err(StoreError::CycleDetected(_))));
        assert!(!store.contains(&x));
    }

    #[test]
    fn test_pending_overflow_evicts_oldest() {
        let mut store = EventStore::new(StoreConfig {
            max_pending: 2,
            ..Default::default()
        });
        let missing = EventId([200; 32]);
        for tag in 1..=3u8 {
            store
                .add_external_event(external(tag, "u1", &[missing]), tag as u64)
                .unwrap();
        }
        assert_eq!(store.pending_len(), 2);
        assert!(!store.is_pending(&EventId([1; 32])));
        assert!(store.is_pending(&EventId([3; 32])));
        assert_eq!(store.stats().pending_evicted, 1);
    }

    #[test]
    fn test_tampered_external_rejected() {
        let mut store = store();
        let mut event = external(1, "u1", &[]);
        event.timestamp += 1;
        assert!(matches!(
            store.add_external_event(event, 10),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_can_see() {
        let mut store = store();
        let a = external(1, "u1", &[]);
        let b = external(2, "u2", &[a.id]);
        let c = external(3, "u3", &[b.id]);
        let d = external(4, "u4", &[]);
        for e in [&a, &b, &c, &d] {
            store.add_external_event(e.clone(), 10).unwrap();
        }

        assert!(store.can_see(&c.id, &a.id));
        assert!(!store.can_see(&a.id, &c.id));
        assert!(!store.can_see(&c.id, &d.id));
        assert!(store.can_see(&a.id, &a.id));
    }

    #[test]
    fn test_consensus_round_assigned_with_quorum() {
        let mut store = store();
        let a = external(1, "u1", &[]);
        let b = external(2, "u2", &[a.id]);
        let c = external(3, "u3", &[b.id]);
        for e in [&a, &b, &c] {
            store.add_external_event(e.clone(), 100).unwrap();
        }
        // active = 3 -> needs 3 witnesses; only u2, u3 see a
        assert_eq!(store.compute_consensus_round(&a.id, 200), None);

        let d = external(4, "u1", &[c.id]);
        store.add_external_event(d, 100).unwrap();
        // u1 also sees a through its own later event
        assert_eq!(store.compute_consensus_round(&a.id, 200), Some(1));
        // already assigned; round is stable
        assert_eq!(store.compute_consensus_round(&a.id, 300), Some(1));
        assert_eq!(store.get(&a.id).unwrap().consensus_round, Some(1));
    }

    #[test]
    fn test_advance_consensus_monotonic_rounds() {
        let mut store = store();
        let mut prev: Vec<EventId> = vec![];
        for tag in 1..=6u8 {
            let creator = format!("u{}", tag % 3);
            let e = external(tag, &creator, &prev);
            prev = vec![e.id];
            store.add_external_event(e, 100).unwrap();
        }
        let finalized = store.advance_consensus(200);
        assert!(!finalized.is_empty());
        let rounds: Vec<u64> = finalized.iter().filter_map(|e| e.consensus_round).collect();
        assert!(rounds.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_prune_leaves_tombstone_for_referenced_parent() {
        let mut store = EventStore::new(StoreConfig {
            retention_ms: 1_000,
            ..Default::default()
        });
        let a = external(1, "u1", &[]);
        let b = external(2, "u1", &[a.id]);
        store.add_external_event(a.clone(), 0).unwrap();
        store.add_external_event(b.clone(), 5_000).unwrap();

        let report = store.prune(5_500);
        assert_eq!(report.pruned, vec![a.id]);
        assert_eq!(report.tombstones, 1);
        assert!(!store.contains(&a.id));
        assert!(store.is_known(&a.id));

        // a child of the survivor still gets a stable height
        let c = external(3, "u1", &[a.id, b.id]);
        let outcome = store.add_external_event(c, 5_600).unwrap();
        assert_eq!(outcome.admitted()[0].height, 2);
    }

    #[test]
    fn test_revocation_filtering() {
        let mut store = store();
        let a = external(1, "u1", &[]);
        store.add_external_event(a.clone(), 10).unwrap();

        assert!(store
            .set_revocation_status(&a.id, RevocationStatus::Revoked)
            .unwrap());
        assert!(store
            .get_channel_events(&ChannelId::from("general"), false)
            .is_empty());
        let all = store.get_channel_events(&ChannelId::from("general"), true);
        assert_eq!(all.len(), 1);
        assert!(all[0].is_revoked());

        assert!(matches!(
            store.set_revocation_status(&EventId([77; 32]), RevocationStatus::Revoked),
            Err(StoreError::UnknownEvent(_))
        ));
    }

    #[test]
    fn test_restore_keeps_round() {
        let mut store = store();
        let mut a = external(1, "u1", &[]);
        a.consensus_round = Some(7);
        store.restore(a.clone(), 10);
        assert_eq!(store.get(&a.id).unwrap().consensus_round, Some(7));
        assert_eq!(store.next_round(), 8);
    }

    #[test]
    fn test_can_see_ancestor_far_below() {
        let mut store = store();
        let events = chain("u1", "deep", 1_000, 1_200, None);
        for event in &events {
            store.add_external_event(event.clone(), 10).unwrap();
        }
        let first = &events[0];
        let last = &events[events.len() - 1];

        assert_eq!(store.get(&last.id).unwrap().height, 1_199);
        assert!(store.can_see(&last.id, &first.id));
        assert!(store.can_see(&events[1_000].id, &first.id));
        assert!(!store.can_see(&first.id, &last.id));
    }

    #[test]
    fn test_prune_compacts_arena() {
        let mut store = EventStore::new(StoreConfig {
            retention_ms: 1_000,
            ..Default::default()
        });
        let mut root = None;
        for round in 0..50u64 {
            let now = round * 10_000;
            let events = chain("u1", &format!("r{}", round), now, 100, root);
            for event in &events {
                store.add_external_event(event.clone(), now).unwrap();
            }
            store.prune(now + 500);

            let stats = store.stats();
            assert_eq!(stats.events, 100);
            assert!(stats.arena_slots <= 100);

            let last = &events[99];
            assert_eq!(store.tips(), vec![last.id]);
            assert!(store.can_see(&last.id, &events[0].id));
            assert_eq!(store.latest_by_creator(&UserId::from("u1")), Some(last.id));
            let channel = store.get_channel_events(&ChannelId::from("general"), true);
            assert_eq!(channel.first().map(|e| e.id), Some(events[0].id));
            assert_eq!(channel.len(), 100);
            root = Some(last.id);
        }
        // heights keep counting through the tombstoned roots
        assert_eq!(store.get(&root.unwrap()).unwrap().height, 50 * 100 - 1);
    }

    #[test]
    fn test_witnesses_follow_admissions() {
        let mut store = store();
        let a = external(1, "u1", &[]);
        let b = external(2, "u2", &[a.id]);
        let c = external(3, "u3", &[b.id]);
        for e in [&a, &b, &c] {
            store.add_external_event(e.clone(), 100).unwrap();
        }
        let names = |set: HashSet<UserId>| {
            let mut names: Vec<String> = set.into_iter().map(|u| u.0).collect();
            names.sort();
            names
        };
        assert_eq!(names(store.witness_creators(&a.id)), vec!["u2", "u3"]);
        assert_eq!(names(store.witness_creators(&b.id)), vec!["u3"]);
        assert!(store.witness_creators(&c.id).is_empty());

        store.add_external_event(external(4, "u1", &[c.id]), 100).unwrap();
        assert_eq!(names(store.witness_creators(&a.id)), vec!["u1", "u2", "u3"]);
        assert_eq!(names(store.witness_creators(&c.id)), vec!["u1"]);
    }

    #[test]
    fn test_witness_credit_stops_at_known_creator() {
        let mut store = store();
        let mut prev: Vec<EventId> = vec![];
        for tag in 1..=100u8 {
            let e = external(tag, if tag % 2 == 0 { "u2" } else { "u1" }, &prev);
            prev = vec![e.id];
            store.add_external_event(e, 100).unwrap();
        }
        let before = store.stats().witness_updates;
        // u1 already witnesses everything below the tip's parent
        store.add_external_event(external(101, "u1", &prev), 100).unwrap();
        assert!(store.stats().witness_updates - before <= 2);

        // no new events: nothing to finalize twice, and rounds are stable
        let first = store.advance_consensus(200);
        assert!(store.advance_consensus(200).is_empty());
        assert!(first.iter().all(|e| e.consensus_round.is_some()));
    }

    #[test]
    fn test_signer_bound_to_creator() {
        let mut store = store();
        let alice = KeyPair::from_seed(&[1; 32]);
        let bob = KeyPair::from_seed(&[2; 32]);

        store
            .add_external_event(signed("alice", "hello", &alice), 10)
            .unwrap();
        store.add_external_event(signed("bob", "hi", &bob), 10).unwrap();
        assert_eq!(
            store.creator_key(&UserId::from("alice")),
            Some(alice.public_key().as_slice())
        );

        // bob's key signing an event that claims alice
        let forged = signed("alice", "transfer everything", &bob);
        assert!(matches!(
            store.add_external_event(forged.clone(), 11),
            Err(StoreError::SignerMismatch { creator }) if creator.as_str() == "alice"
        ));
        assert!(!store.is_known(&forged.id));

        // an unsigned claim is refused once the creator has a key
        let unsigned = external(9, "alice", &[]);
        assert!(matches!(
            store.add_external_event(unsigned, 12),
            Err(StoreError::SignerMismatch { .. })
        ));
        assert_eq!(store.stats().signer_rejected, 2);

        // the bound key keeps working
        assert!(store
            .add_external_event(signed("alice", "again", &alice), 13)
            .is_ok());
    }

    #[test]
    fn test_restore_binds_signer() {
        let mut store = store();
        let alice = KeyPair::from_seed(&[1; 32]);
        let bob = KeyPair::from_seed(&[2; 32]);
        store.restore(signed("alice", "hello", &alice), 10);
        assert!(matches!(
            store.add_external_event(signed("alice", "later", &bob), 20),
            Err(StoreError::SignerMismatch { .. })
        ));
    }
}
