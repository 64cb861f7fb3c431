//! Canonical encoding for Relay events
//!
//! All hashed/signed objects use postcard serialization with strict constraints:
//! - No maps/hashmaps
//! - Floats must be finite and normalized (-0.0 → +0.0)
//! - Repeated fields (parent lists) must be sorted and deduped
//! - Field order is Rust struct field order

use crate::error::{Error, Result};
use crate::types::*;
use serde::Serialize;

/// Maximum number of parents an event may reference
pub const MAX_PARENTS: usize = 16;

/// Maximum payload text size in bytes
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
/// Implementations in other languages MUST produce identical bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Sort and dedup a parent list in place.
pub fn normalize_parents(parents: &mut Vec<EventId>) {
    parents.sort();
    parents.dedup();
}

/// Check that a parent list is strictly ascending (sorted, no duplicates).
pub fn validate_parents_sorted(parents: &[EventId]) -> Result<()> {
    for i in 1..parents.len() {
        if parents[i] <= parents[i - 1] {
            return Err(Error::UnsortedRepeatedField {
                field: "parents".into(),
            });
        }
    }
    Ok(())
}

/// Check the payload schema for its declared event type.
pub fn validate_payload(event_type: EventType, payload: &EventPayload) -> Result<()> {
    if payload.event_type() != event_type {
        return Err(Error::InvalidPayload(format!(
            "event type {} carries a {} payload",
            event_type,
            payload.event_type()
        )));
    }

    let required: Vec<(&str, &str)> = match payload {
        EventPayload::Vote(v) => vec![("target", v.target.as_str()), ("decision", v.decision.as_str())],
        EventPayload::Content(c) => vec![("content_id", c.content_id.as_str())],
        EventPayload::Moderation(m) => vec![("target", m.target.as_str()), ("action", m.action.as_str())],
        EventPayload::Message(m) => vec![("body", m.body.as_str())],
        EventPayload::Revocation(r) => {
            if r.target_event.is_zero() {
                return Err(Error::InvalidPayload("revocation targets the zero id".into()));
            }
            Vec::new()
        }
    };
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(Error::InvalidPayload(format!("{} must not be empty", field)));
        }
    }

    if payload.text_len() > MAX_PAYLOAD_BYTES {
        return Err(Error::InvalidPayload(format!(
            "payload exceeds {} bytes",
            MAX_PAYLOAD_BYTES
        )));
    }
    Ok(())
}

/// Structural validation of an event at the admission boundary.
///
/// Does not check the hash or signature; see [`crate::crypto::verify_event`].
pub fn validate_event_shape(event: &Event) -> Result<()> {
    if event.id.is_zero() {
        return Err(Error::MissingField("id".into()));
    }
    if event.creator.as_str().trim().is_empty() {
        return Err(Error::MissingField("creator".into()));
    }
    if event.channel.as_str().trim().is_empty() {
        return Err(Error::MissingField("channel".into()));
    }
    validate_payload(event.event_type, &event.payload)?;
    validate_parents_sorted(&event.parents)?;
    if event.parents.len() > MAX_PARENTS {
        return Err(Error::InvalidPayload(format!(
            "{} parents exceeds the limit of {}",
            event.parents.len(),
            MAX_PARENTS
        )));
    }
    for slot in [&event.self_parent, &event.other_parent].into_iter().flatten() {
        if !event.parents.contains(slot) {
            return Err(Error::MissingField(format!("parent {} not in parent list", slot)));
        }
    }
    Ok(())
}

/// Decode an untrusted JSON event and validate its shape.
///
/// Non-numeric timestamps and unknown payload shapes fail here, before the
/// event ever reaches the store.
pub fn decode_event_json(json: &str) -> Result<Event> {
    let event: Event = serde_json::from_str(json)?;
    validate_event_shape(&event)?;
    Ok(event)
}

/// Encode an event as JSON. Parent order is the canonical (sorted) order.
pub fn encode_event_json(event: &Event) -> Result<String> {
    serde_json::to_string(event).map_err(Error::from)
}
