//! Hash derivations and event signatures
//!
//! All hash derivations use BLAKE3 with domain separation prefixes.
//! This module provides the normative implementations.

use crate::canonical::{canonical_bytes, normalize_parents, validate_event_shape};
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for event hashes
pub const DOMAIN_EVENT: &[u8] = b"relay-event";
/// Domain prefix for event signatures
pub const DOMAIN_EVENT_SIG: &[u8] = b"relay-event-sig";
/// Domain prefix for DAG snapshot hashes (anchoring)
pub const DOMAIN_SNAPSHOT: &[u8] = b"dag-snapshot";
/// Domain prefix for fork ids
pub const DOMAIN_FORK: &[u8] = b"fork";
/// Domain prefix for alert ids
pub const DOMAIN_ALERT: &[u8] = b"alert";

// =============================================================================
// EVENT HASH
// =============================================================================

/// Immutable portion of an event, in hash order.
#[derive(serde::Serialize)]
struct EventContent<'a> {
    creator: &'a UserId,
    channel: &'a ChannelId,
    event_type: EventType,
    payload: &'a EventPayload,
    timestamp: u64,
    parents: &'a [EventId],
    self_parent: &'a Option<EventId>,
    other_parent: &'a Option<EventId>,
    region: &'a Option<String>,
    signer_pubkey: &'a Option<Vec<u8>>,
}

/// Compute the content hash of an event.
///
/// `hash = BLAKE3("relay-event" || canonical_bytes(EventContent))`
///
/// The parent list must already be sorted and deduped.
pub fn compute_event_hash(event: &Event) -> Result<Bytes32> {
    let content = EventContent {
        creator: &event.creator,
        channel: &event.channel,
        event_type: event.event_type,
        payload: &event.payload,
        timestamp: event.timestamp,
        parents: &event.parents,
        self_parent: &event.self_parent,
        other_parent: &event.other_parent,
        region: &event.region,
        signer_pubkey: &event.signer_pubkey,
    };
    let bytes = canonical_bytes(&content)?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_EVENT);
    hasher.update(&bytes);
    Ok(*hasher.finalize().as_bytes())
}

/// Verify that an event's transmitted hash matches its content.
pub fn verify_event_hash(event: &Event) -> Result<()> {
    let computed = compute_event_hash(event)?;
    if computed != event.hash {
        return Err(Error::HashMismatch {
            computed: hex::encode(computed),
            transmitted: hex::encode(event.hash),
        });
    }
    Ok(())
}

/// Seal a draft into an event with a content-derived id.
///
/// The parent list is `self_parent ∪ other_parent ∪ additional`, normalized.
/// Height is left at zero; the store computes it on admission.
pub fn build_event(
    draft: EventDraft,
    timestamp: u64,
    self_parent: Option<EventId>,
    other_parent: Option<EventId>,
    additional: &[EventId],
) -> Result<Event> {
    let mut parents: Vec<EventId> = self_parent
        .into_iter()
        .chain(other_parent)
        .chain(additional.iter().copied())
        .collect();
    normalize_parents(&mut parents);

    let mut event = Event {
        id: EventId([0; 32]),
        creator: draft.creator,
        channel: draft.channel,
        event_type: draft.payload.event_type(),
        payload: draft.payload,
        timestamp,
        parents,
        self_parent,
        other_parent,
        region: draft.region,
        height: 0,
        consensus_round: None,
        revocation_status: RevocationStatus::Active,
        hash: [0; 32],
        signer_pubkey: None,
        signature: None,
    };
    event.hash = compute_event_hash(&event)?;
    event.id = EventId(event.hash);
    Ok(event)
}

// =============================================================================
// SIGNATURES
// =============================================================================

/// Ed25519 keypair for creator-bound event signatures
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Compute the bytes to sign for an event.
///
/// `sign_bytes = "relay-event-sig" || hash`
pub fn event_sign_bytes(hash: &Bytes32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN_EVENT_SIG.len() + 32);
    bytes.extend_from_slice(DOMAIN_EVENT_SIG);
    bytes.extend_from_slice(hash);
    bytes
}

/// Bind the event to `keypair` and sign its hash.
///
/// The public key is part of the hashed content, so the hash is recomputed
/// first. An event whose id was derived from its hash keeps that property.
pub fn sign_event(event: &mut Event, keypair: &KeyPair) -> Result<()> {
    let content_id = event.id.0 == event.hash;
    event.signer_pubkey = Some(keypair.public_key().to_vec());
    event.hash = compute_event_hash(event)?;
    if content_id {
        event.id = EventId(event.hash);
    }
    let signature = keypair.sign(&event_sign_bytes(&event.hash));
    event.signature = Some(signature.to_vec());
    Ok(())
}

/// Verify an event's signature. Unsigned events pass; a signature without a
/// key (or vice versa) does not.
pub fn verify_event_signature(event: &Event) -> Result<()> {
    match (&event.signer_pubkey, &event.signature) {
        (None, None) => Ok(()),
        (Some(pubkey), Some(signature)) => {
            let key_bytes: [u8; 32] = pubkey
                .as_slice()
                .try_into()
                .map_err(|_| Error::InvalidPublicKey(format!("{} bytes", pubkey.len())))?;
            let verifying_key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
            let sig_bytes: [u8; 64] = signature
                .as_slice()
                .try_into()
                .map_err(|_| Error::InvalidSignature)?;
            verifying_key
                .verify(&event_sign_bytes(&event.hash), &Signature::from_bytes(&sig_bytes))
                .map_err(|_| Error::InvalidSignature)
        }
        _ => Err(Error::InvalidSignature),
    }
}

/// Full boundary check: shape, hash, signature.
pub fn verify_event(event: &Event) -> Result<()> {
    validate_event_shape(event)?;
    verify_event_hash(event)?;
    verify_event_signature(event)
}

// =============================================================================
// DERIVED IDS
// =============================================================================

/// Hash over the sorted ids of the current DAG tips.
///
/// `snapshot = BLAKE3("dag-snapshot" || tip_0 || tip_1 || ...)`
pub fn dag_snapshot_hash(tips: &[EventId]) -> Bytes32 {
    let mut sorted = tips.to_vec();
    normalize_parents(&mut sorted);

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_SNAPSHOT);
    for tip in &sorted {
        hasher.update(&tip.0);
    }
    *hasher.finalize().as_bytes()
}

/// Derive a fork id from its channel and initial conflict set.
pub fn derive_fork_id(channel: &ChannelId, events: &[EventId]) -> ForkId {
    let mut sorted = events.to_vec();
    normalize_parents(&mut sorted);

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_FORK);
    hasher.update(channel.as_str().as_bytes());
    for id in &sorted {
        hasher.update(&id.0);
    }
    ForkId(*hasher.finalize().as_bytes())
}

/// Derive an alert id from its type, subjects and time.
pub fn derive_alert_id(
    alert_type: &str,
    users: &[UserId],
    events: &[EventId],
    raised_at: u64,
) -> AlertId {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_ALERT);
    hasher.update(alert_type.as_bytes());
    for user in users {
        hasher.update(user.as_str().as_bytes());
        hasher.update(&[0]);
    }
    for id in events {
        hasher.update(&id.0);
    }
    hasher.update(&raised_at.to_le_bytes());
    AlertId(*hasher.finalize().as_bytes())
}
