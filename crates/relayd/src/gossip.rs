//! Gossip propagation
//!
//! Local events are chained onto the creator's previous event (self-parent)
//! and the last event received from a peer (other-parent). Every gossip
//! round picks a few connected peers at random and pushes a batch of
//! pending envelopes to each. Delivery is best-effort: a batch leaves the
//! queue whether or not any send succeeded, and redundancy across rounds
//! and peers does the rest.

use crate::config::GossipConfig;
use crate::event_store::{AddOutcome, EventStore, ParentRefs, StoreError};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use relay_core::types::*;
use relay_net::framing::FrameError;
use relay_net::transport::messages::EventBatch;
use relay_net::{PeerId, PeerInfo, Transport, TransportError};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::debug;

/// Gossip errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Bounded set of recently seen event ids, oldest forgotten first
struct SeenCache {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns false if the id was already present
    fn insert(&mut self, id: EventId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }
}

/// Outcome of one gossip round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub peers_contacted: usize,
    pub events_drained: usize,
    pub events_sent: usize,
    pub send_failures: usize,
}

/// Gossip statistics
#[derive(Debug, Clone, Default)]
pub struct GossipStats {
    pub peer_count: usize,
    pub pending: usize,
    pub events_created: u64,
    pub events_received: u64,
    pub duplicates_dropped: u64,
    pub hop_limit_dropped: u64,
    pub queue_overflow_dropped: u64,
    pub rounds: u64,
    pub events_sent: u64,
    pub send_failures: u64,
}

/// Gossip propagator: peer directory, pending queue and round logic
pub struct GossipPropagator {
    config: GossipConfig,
    /// Our node id, recorded in propagation paths
    node_id: String,
    /// Peer directory
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    /// Envelopes waiting for a gossip round
    pending: Mutex<VecDeque<GossipEnvelope>>,
    seen: Mutex<SeenCache>,
    /// Most recent event received from a peer (next other-parent)
    last_received: RwLock<Option<EventId>>,
    stats: Mutex<GossipStats>,
}

impl GossipPropagator {
    pub fn new(config: GossipConfig, node_id: impl Into<String>) -> Self {
        let seen = SeenCache::new(config.seen_cache_size);
        Self {
            config,
            node_id: node_id.into(),
            peers: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            seen: Mutex::new(seen),
            last_received: RwLock::new(None),
            stats: Mutex::new(GossipStats::default()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // =========================================================================
    // PEER DIRECTORY
    // =========================================================================

    /// Add a peer to the directory
    pub fn connect_peer(&self, peer: PeerInfo) {
        debug!("Gossip peer connected: {}", peer.id);
        self.peers.write().insert(peer.id.clone(), peer);
    }

    /// Remove a peer from the directory
    pub fn disconnect_peer(&self, id: &PeerId) -> bool {
        let removed = self.peers.write().remove(id).is_some();
        if removed {
            debug!("Gossip peer disconnected: {}", id);
        }
        removed
    }

    /// Record activity from a peer
    pub fn touch_peer(&self, id: &PeerId) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.touch();
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.peers.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Build a local event chained to the creator's latest event and the
    /// last event received from a peer, and admit it.
    ///
    /// The caller decides whether to enqueue it for gossip or buffer it.
    pub fn create_event(
        &self,
        store: &mut EventStore,
        draft: EventDraft,
        now: u64,
    ) -> Result<(Event, AddOutcome), GossipError> {
        let self_parent = store.latest_by_creator(&draft.creator);
        let other_parent = (*self.last_received.read())
            .filter(|id| store.contains(id) && Some(*id) != self_parent);

        let (event, outcome) = store.create_event(
            draft,
            ParentRefs {
                self_parent,
                other_parent,
                ..Default::default()
            },
            now,
        )?;
        self.seen.lock().insert(event.id);
        self.stats.lock().events_created += 1;
        Ok((event, outcome))
    }

    /// Accept an envelope from a peer.
    ///
    /// Returns the envelope if it should be offered to the store; envelopes
    /// over the hop limit and already-seen events are dropped silently.
    pub fn receive_event(&self, envelope: GossipEnvelope, from: &PeerId) -> Option<GossipEnvelope> {
        self.touch_peer(from);
        let mut stats = self.stats.lock();

        if envelope.hop_count() > self.config.max_hops {
            stats.hop_limit_dropped += 1;
            debug!(
                "Dropped event {} from {}: {} hops",
                envelope.event.id,
                from,
                envelope.hop_count()
            );
            return None;
        }
        if !self.seen.lock().insert(envelope.event.id) {
            stats.duplicates_dropped += 1;
            return None;
        }

        stats.events_received += 1;
        *self.last_received.write() = Some(envelope.event.id);
        Some(envelope)
    }

    /// Whether an event id has passed through this propagator
    pub fn has_seen(&self, id: &EventId) -> bool {
        self.seen.lock().contains(id)
    }

    /// Mark an event as known without gossiping it
    pub fn mark_seen(&self, id: EventId) {
        self.seen.lock().insert(id);
    }

    /// Queue an envelope for the next rounds
    pub fn enqueue(&self, envelope: GossipEnvelope) {
        let mut pending = self.pending.lock();
        pending.push_back(envelope);
        if pending.len() > self.config.max_pending {
            pending.pop_front();
            self.stats.lock().queue_overflow_dropped += 1;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    // =========================================================================
    // ROUNDS
    // =========================================================================

    /// Run one gossip round over `transport`.
    ///
    /// Chooses up to `fanout` directory peers that the transport can reach,
    /// sends each up to `batch_size` pending envelopes (skipping peers already
    /// on an envelope's path) and drops the batch from the queue.
    pub fn gossip_round(&self, transport: &dyn Transport, now: u64) -> RoundReport {
        let mut report = RoundReport::default();
        let reachable: HashSet<PeerId> = transport.connected_peers().into_iter().collect();
        let candidates: Vec<PeerId> = self
            .peers()
            .into_iter()
            .filter(|p| reachable.contains(p))
            .collect();

        self.stats.lock().rounds += 1;
        if candidates.is_empty() {
            return report;
        }

        let batch: Vec<GossipEnvelope> = {
            let mut pending = self.pending.lock();
            let take = self.config.batch_size.min(pending.len());
            pending.drain(..take).collect()
        };
        if batch.is_empty() {
            return report;
        }
        report.events_drained = batch.len();

        let hop = PropagationHop {
            node_id: self.node_id.clone(),
            forwarded_at: now,
        };
        let chosen: Vec<&PeerId> = candidates
            .choose_multiple(&mut rand::thread_rng(), self.config.fanout)
            .collect();

        for peer in chosen {
            let envelopes: Vec<GossipEnvelope> = batch
                .iter()
                .filter(|env| !env.visited(peer.as_str()))
                .map(|env| {
                    let mut env = env.clone();
                    env.propagation_path.push(hop.clone());
                    env
                })
                .collect();
            if envelopes.is_empty() {
                continue;
            }
            let count = envelopes.len();

            report.peers_contacted += 1;
            let sent = EventBatch { envelopes }
                .to_frame()
                .map_err(GossipError::from)
                .and_then(|frame| transport.send(peer, frame).map_err(GossipError::from));
            match sent {
                Ok(()) => report.events_sent += count,
                Err(e) => {
                    report.send_failures += 1;
                    debug!("Gossip to {} failed: {}", peer, e);
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.events_sent += report.events_sent as u64;
        stats.send_failures += report.send_failures as u64;
        debug!(
            "Gossip round: {} events to {} peers ({} failures)",
            report.events_sent, report.peers_contacted, report.send_failures
        );
        report
    }

    pub fn stats(&self) -> GossipStats {
        let mut stats = self.stats.lock().clone();
        stats.peer_count = self.peer_count();
        stats.pending = self.pending_len();
        stats
    }
}
