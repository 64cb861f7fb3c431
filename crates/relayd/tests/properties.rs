//! Property tests for the DAG, the conflict predicate and the offline buffer

use proptest::prelude::*;
use relay_core::crypto::build_event;
use relay_core::types::*;
use relayd::config::{ForkConfig, PartitionConfig, StoreConfig};
use relayd::event_store::{AddOutcome, EventStore};
use relayd::fork::are_conflicting;
use relayd::partition::PartitionCoordinator;

/// Creator index and parent picks (resolved against earlier events) per event
type DagShape = Vec<(usize, Vec<prop::sample::Index>)>;

fn dag_strategy() -> impl Strategy<Value = (DagShape, Vec<usize>)> {
    (1usize..24).prop_flat_map(|n| {
        (
            prop::collection::vec(
                (0usize..4, prop::collection::vec(any::<prop::sample::Index>(), 0..3)),
                n,
            ),
            Just((0..n).collect::<Vec<usize>>()).prop_shuffle(),
        )
    })
}

fn build_dag(shape: &DagShape) -> Vec<Event> {
    let mut events: Vec<Event> = Vec::with_capacity(shape.len());
    for (i, (creator, picks)) in shape.iter().enumerate() {
        let parents: Vec<EventId> = if i == 0 {
            Vec::new()
        } else {
            picks.iter().map(|ix| events[ix.index(i)].id).collect()
        };
        let draft = EventDraft::new(
            format!("u{}", creator),
            "general",
            EventPayload::Message(MessagePayload {
                body: format!("m{}", i),
            }),
        );
        events.push(build_event(draft, 1_000 + i as u64, None, None, &parents).unwrap());
    }
    events
}

fn admit_in_order(events: &[Event], order: &[usize]) -> EventStore {
    let mut store = EventStore::new(StoreConfig::default());
    for &i in order {
        store.add_external_event(events[i].clone(), 5_000).unwrap();
    }
    store
}

fn event_strategy() -> impl Strategy<Value = Event> {
    (
        0usize..2,
        0usize..2,
        0usize..3,
        0usize..2,
        0usize..2,
        0u64..3_000,
    )
        .prop_map(|(creator, channel, kind, target, choice, ts)| {
            let target = format!("T{}", target);
            let payload = match kind {
                0 => EventPayload::Vote(VotePayload {
                    target,
                    decision: ["yes", "no"][choice].into(),
                }),
                1 => EventPayload::Moderation(ModerationPayload {
                    target,
                    action: ["hide", "ban"][choice].into(),
                    reason: None,
                }),
                _ => EventPayload::Message(MessagePayload {
                    body: format!("{}{}", target, choice),
                }),
            };
            let draft = EventDraft::new(format!("u{}", creator), format!("c{}", channel), payload);
            build_event(draft, ts, None, None, &[]).unwrap()
        })
}

proptest! {
    /// Any arrival order admits the whole DAG, with every parent strictly
    /// below its child and reachable from it but never the reverse
    #[test]
    fn prop_dag_admission_is_order_independent((shape, order) in dag_strategy()) {
        let events = build_dag(&shape);
        let store = admit_in_order(&events, &order);

        prop_assert_eq!(store.len(), events.len());
        prop_assert_eq!(store.pending_len(), 0);
        for event in &events {
            let admitted = store.get(&event.id).unwrap();
            for parent in &event.parents {
                let parent_height = store.get(parent).unwrap().height;
                prop_assert!(parent_height < admitted.height);
                prop_assert!(store.can_see(&event.id, parent));
                prop_assert!(!store.can_see(parent, &event.id));
            }
            prop_assert!(store.can_see(&event.id, &event.id));
        }
    }

    /// Heights do not depend on arrival order
    #[test]
    fn prop_heights_match_sequential_admission((shape, order) in dag_strategy()) {
        let events = build_dag(&shape);
        let shuffled = admit_in_order(&events, &order);
        let sequential = admit_in_order(&events, &(0..events.len()).collect::<Vec<_>>());
        for event in &events {
            prop_assert_eq!(
                shuffled.get(&event.id).map(|e| e.height),
                sequential.get(&event.id).map(|e| e.height)
            );
        }
    }

    /// Offering an admitted event again changes nothing
    #[test]
    fn prop_admission_is_idempotent((shape, order) in dag_strategy()) {
        let events = build_dag(&shape);
        let mut store = admit_in_order(&events, &order);
        let before = store.len();
        for event in &events {
            let outcome = store.add_external_event(event.clone(), 9_000).unwrap();
            prop_assert_eq!(outcome, AddOutcome::Duplicate(event.id));
        }
        prop_assert_eq!(store.len(), before);
        prop_assert_eq!(store.stats().duplicates_ignored, events.len() as u64);
    }

    /// The conflict predicate does not care about argument order
    #[test]
    fn prop_conflict_is_symmetric(
        a in event_strategy(),
        b in event_strategy(),
        strict in any::<bool>(),
    ) {
        let config = ForkConfig {
            strict_creator_forks: strict,
            ..ForkConfig::default()
        };
        prop_assert_eq!(are_conflicting(&config, &a, &b), are_conflicting(&config, &b, &a));
        prop_assert!(!are_conflicting(&config, &a, &a));
    }

    /// The offline buffer never exceeds its capacity and evicts oldest first
    #[test]
    fn prop_offline_buffer_bounded(capacity in 1usize..20, count in 0usize..60) {
        let mut coordinator = PartitionCoordinator::new(PartitionConfig {
            max_offline_buffer: capacity,
            ..PartitionConfig::default()
        });
        // no live peers: the first health check partitions the node
        prop_assert!(coordinator.health_check(0).is_some());
        prop_assert!(coordinator.is_in_partition());

        let mut ids = Vec::new();
        for i in 0..count {
            let draft = EventDraft::new(
                "u1",
                "general",
                EventPayload::Message(MessagePayload { body: format!("m{}", i) }),
            );
            let event = build_event(draft, i as u64, None, None, &[]).unwrap();
            ids.push(event.id);
            coordinator.buffer_event(GossipEnvelope::new(event), i as u64);
            prop_assert!(coordinator.get_offline_buffer_status().buffered <= capacity);
        }

        let status = coordinator.get_offline_buffer_status();
        prop_assert_eq!(status.buffered, count.min(capacity));
        prop_assert_eq!(status.evicted, count.saturating_sub(capacity) as u64);
        let kept: Vec<EventId> = coordinator.buffered().map(|b| b.envelope.event.id).collect();
        prop_assert_eq!(kept, ids[count.saturating_sub(capacity)..].to_vec());
    }
}
