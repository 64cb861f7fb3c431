//! External collaborators the node reports to
//!
//! Sinks are fire-and-forget. The node never waits on them and works with
//! the no-op implementations.

use relay_core::types::*;
use std::sync::Arc;
use tracing::{debug, info};

/// Receives finalized critical events for external anchoring
pub trait AnchorSink: Send + Sync {
    /// Queue an event together with the DAG snapshot it was finalized in.
    /// Returns the anchor id.
    fn queue_for_anchoring(&self, event: &Event, dag_snapshot_hash: Bytes32) -> String;
}

/// Counters, gauges and histograms. Purely observational.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, _name: &'static str, _value: u64) {}
    fn gauge(&self, _name: &'static str, _value: f64) {}
    fn histogram(&self, _name: &'static str, _value: f64) {}
}

/// Moderation audit ledger
pub trait AuditSink: Send + Sync {
    fn record_moderation_action(
        &self,
        actor: &str,
        action_type: &str,
        target_type: &str,
        target_id: &str,
        details: serde_json::Value,
    );
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl AnchorSink for NoopSink {
    fn queue_for_anchoring(&self, event: &Event, _dag_snapshot_hash: Bytes32) -> String {
        event.id.to_hex()
    }
}

impl MetricsSink for NoopSink {}

impl AuditSink for NoopSink {
    fn record_moderation_action(&self, _: &str, _: &str, _: &str, _: &str, _: serde_json::Value) {}
}

/// Sink that writes everything to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AnchorSink for LogSink {
    fn queue_for_anchoring(&self, event: &Event, dag_snapshot_hash: Bytes32) -> String {
        let anchor_id = format!("anchor-{}", event.id.to_hex());
        info!(
            target: "relayd::anchor",
            "Anchoring {} ({}) at snapshot {}",
            event.id,
            event.event_type,
            hex::encode(&dag_snapshot_hash[..8])
        );
        anchor_id
    }
}

impl MetricsSink for LogSink {
    fn counter(&self, name: &'static str, value: u64) {
        debug!(target: "relayd::metrics", "{} += {}", name, value);
    }

    fn gauge(&self, name: &'static str, value: f64) {
        debug!(target: "relayd::metrics", "{} = {}", name, value);
    }

    fn histogram(&self, name: &'static str, value: f64) {
        debug!(target: "relayd::metrics", "{} <- {}", name, value);
    }
}

impl AuditSink for LogSink {
    fn record_moderation_action(
        &self,
        actor: &str,
        action_type: &str,
        target_type: &str,
        target_id: &str,
        details: serde_json::Value,
    ) {
        info!(
            target: "relayd::audit",
            "{} {} {} {}: {}",
            actor, action_type, target_type, target_id, details
        );
    }
}

/// The sinks a node reports to
#[derive(Clone)]
pub struct Sinks {
    pub anchor: Arc<dyn AnchorSink>,
    pub metrics: Arc<dyn MetricsSink>,
    pub audit: Arc<dyn AuditSink>,
}

impl Sinks {
    /// Route every sink to the log
    pub fn logging() -> Self {
        Self {
            anchor: Arc::new(LogSink),
            metrics: Arc::new(LogSink),
            audit: Arc::new(LogSink),
        }
    }
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            anchor: Arc::new(NoopSink),
            metrics: Arc::new(NoopSink),
            audit: Arc::new(NoopSink),
        }
    }
}

/// Sink that remembers every call
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub anchored: parking_lot::Mutex<Vec<EventId>>,
    pub counters: parking_lot::Mutex<Vec<(&'static str, u64)>>,
    pub audits: parking_lot::Mutex<Vec<(String, String, String)>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn sinks(self: &Arc<Self>) -> Sinks {
        Sinks {
            anchor: self.clone(),
            metrics: self.clone(),
            audit: self.clone(),
        }
    }

    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .sum()
    }
}

#[cfg(test)]
impl AnchorSink for RecordingSink {
    fn queue_for_anchoring(&self, event: &Event, _dag_snapshot_hash: Bytes32) -> String {
        self.anchored.lock().push(event.id);
        event.id.to_hex()
    }
}

#[cfg(test)]
impl MetricsSink for RecordingSink {
    fn counter(&self, name: &'static str, value: u64) {
        self.counters.lock().push((name, value));
    }
}

#[cfg(test)]
impl AuditSink for RecordingSink {
    fn record_moderation_action(
        &self,
        actor: &str,
        action_type: &str,
        _target_type: &str,
        target_id: &str,
        _details: serde_json::Value,
    ) {
        self.audits
            .lock()
            .push((actor.to_string(), action_type.to_string(), target_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::crypto::build_event;

    #[test]
    fn test_noop_sinks_accept_everything() {
        let sinks = Sinks::default();
        let event = build_event(
            EventDraft::new(
                "u1",
                "general",
                EventPayload::Message(MessagePayload { body: "hi".into() }),
            ),
            1,
            None,
            None,
            &[],
        )
        .unwrap();
        assert_eq!(sinks.anchor.queue_for_anchoring(&event, [0; 32]), event.id.to_hex());
        sinks.metrics.counter("dag_events", 1);
        sinks
            .audit
            .record_moderation_action("m", "fork_resolution", "fork", "f", serde_json::json!({}));
    }

    #[test]
    fn test_recording_sink() {
        let recorder = Arc::new(RecordingSink::default());
        let sinks = recorder.sinks();
        sinks.metrics.counter("forks_detected", 2);
        sinks.metrics.counter("forks_detected", 1);
        sinks.audit.record_moderation_action(
            "mod",
            "fork_resolution",
            "fork",
            "abc",
            serde_json::Value::Null,
        );
        assert_eq!(recorder.counter_total("forks_detected"), 3);
        assert_eq!(recorder.audits.lock().len(), 1);
    }
}
