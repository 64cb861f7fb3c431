//! Core data types for the Relay integrity DAG
//!
//! All wire types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Event identifier. Locally created events use their content hash.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub Bytes32);

impl EventId {
    /// The all-zero id is reserved and never admitted.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Full hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Bytes32);

        impl $name {
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0[..8]))
            }
        }
    };
}

digest_id!(
    /// Fork identifier: BLAKE3("fork" || channel || sorted conflicting ids)
    ForkId
);
digest_id!(
    /// Detection alert identifier: BLAKE3("alert" || type || users || events || raised_at)
    AlertId
);

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Application-level user (event creator) identifier
    UserId
);
string_id!(
    /// Channel identifier
    ChannelId
);

// =============================================================================
// EVENT PAYLOADS
// =============================================================================

/// Event type discriminant
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EventType {
    Vote = 0,
    Content = 1,
    Moderation = 2,
    Message = 3,
    Revocation = 4,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Vote,
        EventType::Content,
        EventType::Moderation,
        EventType::Message,
        EventType::Revocation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Vote => "vote",
            EventType::Content => "content",
            EventType::Moderation => "moderation",
            EventType::Message => "message",
            EventType::Revocation => "revocation",
        }
    }

    /// Position in [`EventType::ALL`]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vote cast on a subject (proposal, poll, content item)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VotePayload {
    pub target: String,
    pub decision: String,
}

/// A content post
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContentPayload {
    pub content_id: String,
    pub body: String,
}

/// A moderation action on a subject
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ModerationPayload {
    pub target: String,
    pub action: String,
    pub reason: Option<String>,
}

/// A chat message
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessagePayload {
    pub body: String,
}

/// Revocation of an earlier event by its creator
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RevocationPayload {
    pub target_event: EventId,
    pub reason: String,
}

/// Union of all event payloads, tagged by event type.
///
/// Externally tagged: postcard cannot decode internally tagged enums.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    Vote(VotePayload),
    Content(ContentPayload),
    Moderation(ModerationPayload),
    Message(MessagePayload),
    Revocation(RevocationPayload),
}

impl EventPayload {
    /// Event type this payload belongs to
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Vote(_) => EventType::Vote,
            EventPayload::Content(_) => EventType::Content,
            EventPayload::Moderation(_) => EventType::Moderation,
            EventPayload::Message(_) => EventType::Message,
            EventPayload::Revocation(_) => EventType::Revocation,
        }
    }

    /// Subject the payload acts on, for payloads that target something
    pub fn subject(&self) -> Option<&str> {
        match self {
            EventPayload::Vote(v) => Some(&v.target),
            EventPayload::Moderation(m) => Some(&m.target),
            EventPayload::Content(c) => Some(&c.content_id),
            EventPayload::Message(_) | EventPayload::Revocation(_) => None,
        }
    }

    /// Flattened key/value view used for similarity scoring
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            EventPayload::Vote(v) => vec![
                ("target", v.target.clone()),
                ("decision", v.decision.clone()),
            ],
            EventPayload::Content(c) => vec![
                ("content_id", c.content_id.clone()),
                ("body", c.body.clone()),
            ],
            EventPayload::Moderation(m) => {
                let mut fields = vec![
                    ("target", m.target.clone()),
                    ("action", m.action.clone()),
                ];
                if let Some(reason) = &m.reason {
                    fields.push(("reason", reason.clone()));
                }
                fields
            }
            EventPayload::Message(m) => vec![("body", m.body.clone())],
            EventPayload::Revocation(r) => vec![
                ("target_event", r.target_event.to_hex()),
                ("reason", r.reason.clone()),
            ],
        }
    }

    /// Approximate encoded size of the payload's free-form text
    pub fn text_len(&self) -> usize {
        self.fields().iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

// =============================================================================
// EVENT
// =============================================================================

/// Revocation status of an admitted event
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RevocationStatus {
    #[default]
    Active,
    Revoked,
    Disputed,
}

/// DAG node. Everything except `height`, `consensus_round` and
/// `revocation_status` is covered by `hash`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique event identifier
    pub id: EventId,
    /// Creating user
    pub creator: UserId,
    /// Channel the event belongs to
    pub channel: ChannelId,
    /// Event type discriminator (must match the payload variant)
    pub event_type: EventType,
    /// Type-tagged payload
    pub payload: EventPayload,
    /// Creator-supplied unix millis (untrusted)
    pub timestamp: u64,
    /// Ancestor ids. MUST be sorted and deduped before hashing
    pub parents: Vec<EventId>,
    /// Creator's own previous event
    pub self_parent: Option<EventId>,
    /// Last event received from a peer when this one was created
    pub other_parent: Option<EventId>,
    /// Proximity region the event was created in
    pub region: Option<String>,
    /// 1 + max parent height (recomputed locally on admission)
    pub height: u64,
    /// Assigned once witness coverage crosses the quorum
    pub consensus_round: Option<u64>,
    pub revocation_status: RevocationStatus,
    /// BLAKE3 digest over the immutable fields
    pub hash: Bytes32,
    /// Ed25519 public key of the signer, if signed
    pub signer_pubkey: Option<Vec<u8>>,
    /// Signature over ("relay-event-sig" || hash)
    pub signature: Option<Vec<u8>>,
}

impl Event {
    pub fn is_revoked(&self) -> bool {
        self.revocation_status == RevocationStatus::Revoked
    }
}

/// Application-level action waiting to become an event
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventDraft {
    pub creator: UserId,
    pub channel: ChannelId,
    pub payload: EventPayload,
    pub region: Option<String>,
}

impl EventDraft {
    pub fn new(
        creator: impl Into<UserId>,
        channel: impl Into<ChannelId>,
        payload: EventPayload,
    ) -> Self {
        Self {
            creator: creator.into(),
            channel: channel.into(),
            payload,
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

// =============================================================================
// GOSSIP
// =============================================================================

/// One hop an event took through the mesh
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropagationHop {
    /// Node that forwarded the event
    pub node_id: String,
    /// Forwarding time (unix millis, forwarder's clock)
    pub forwarded_at: u64,
}

/// An event in flight, carrying the path it took (gossip-about-gossip)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GossipEnvelope {
    pub event: Event,
    pub propagation_path: Vec<PropagationHop>,
}

impl GossipEnvelope {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            propagation_path: Vec::new(),
        }
    }

    /// Number of hops taken so far
    pub fn hop_count(&self) -> usize {
        self.propagation_path.len()
    }

    /// Whether a node already forwarded this envelope
    pub fn visited(&self, node_id: &str) -> bool {
        self.propagation_path.iter().any(|h| h.node_id == node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_event_type() {
        let vote = EventPayload::Vote(VotePayload {
            target: "P1".into(),
            decision: "yes".into(),
        });
        assert_eq!(vote.event_type(), EventType::Vote);
        assert_eq!(vote.subject(), Some("P1"));

        let msg = EventPayload::Message(MessagePayload { body: "hi".into() });
        assert_eq!(msg.event_type(), EventType::Message);
        assert_eq!(msg.subject(), None);
    }

    #[test]
    fn test_moderation_fields_include_reason() {
        let payload = EventPayload::Moderation(ModerationPayload {
            target: "user-9".into(),
            action: "mute".into(),
            reason: Some("spam".into()),
        });
        let fields = payload.fields();
        assert_eq!(fields.len(), 3);
        assert!(fields.contains(&("reason", "spam".to_string())));
    }

    #[test]
    fn test_payload_json_is_type_tagged() {
        let payload = EventPayload::Vote(VotePayload {
            target: "X".into(),
            decision: "no".into(),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["vote"]["decision"], "no");
    }

    #[test]
    fn test_event_type_index_matches_all() {
        for (i, ty) in EventType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
    }
}
