//! Behavioral integrity monitoring
//!
//! Every admitted event updates its creator's profile and is then run
//! through four independent checks:
//!
//! - replay: near-identical event seen within the replay window
//! - coordination: several distinct creators emitting the same action at once
//! - timing: a creator suddenly acting much faster than their own baseline
//! - Sybil: users whose behavioral fingerprints are implausibly alike
//!
//! Alerts are state, not errors. They change status only through explicit
//! investigation calls and are never deleted while younger than the alert
//! retention window.

use crate::config::IntegrityConfig;
use relay_core::crypto::derive_alert_id;
use relay_core::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

const HOUR_MS: u64 = 60 * 60 * 1000;

/// Integrity monitor errors
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Unknown alert: {0}")]
    UnknownAlert(AlertId),
    #[error("Invalid alert transition: {from:?} -> {to:?}")]
    InvalidTransition { from: AlertStatus, to: AlertStatus },
    #[error("Analysis failed: {0}")]
    Analysis(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    SybilCluster,
    ReplayAttack,
    CoordinationPattern,
    TimingAnomaly,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::SybilCluster => "sybil_cluster",
            AlertType::ReplayAttack => "replay_attack",
            AlertType::CoordinationPattern => "coordination_pattern",
            AlertType::TimingAnomaly => "timing_anomaly",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    fn risk_weight(&self) -> f64 {
        match self {
            Severity::Low => 0.1,
            Severity::Medium => 0.25,
            Severity::High => 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Investigating,
    Confirmed,
    FalsePositive,
    Resolved,
}

impl AlertStatus {
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, next),
            (Pending, Investigating)
                | (Investigating, Confirmed)
                | (Investigating, FalsePositive)
                | (Confirmed, Resolved)
                | (FalsePositive, Resolved)
        )
    }

    /// Still awaiting a verdict
    pub fn is_open(&self) -> bool {
        matches!(self, AlertStatus::Pending | AlertStatus::Investigating)
    }
}

/// One step of an alert investigation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvestigationNote {
    pub timestamp: u64,
    pub investigator: UserId,
    pub from: AlertStatus,
    pub to: AlertStatus,
    pub notes: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionAlert {
    pub id: AlertId,
    pub alert_type: AlertType,
    pub severity: Severity,
    /// 0..=1
    pub confidence: f64,
    pub suspicious_users: BTreeSet<UserId>,
    pub suspicious_events: BTreeSet<EventId>,
    pub status: AlertStatus,
    pub description: String,
    pub raised_at: u64,
    pub updated_at: u64,
    pub investigation_log: Vec<InvestigationNote>,
    /// Grouping key for coordination alerts
    pub pattern_key: Option<String>,
}

/// Alert raised or grown by an admitted event
#[derive(Clone, Debug, PartialEq)]
pub enum AlertUpdate {
    Raised(DetectionAlert),
    Updated(DetectionAlert),
}

impl AlertUpdate {
    pub fn alert(&self) -> &DetectionAlert {
        match self {
            AlertUpdate::Raised(a) | AlertUpdate::Updated(a) => a,
        }
    }
}

// =============================================================================
// PROFILES
// =============================================================================

#[derive(Clone, Debug)]
struct ProfileEntry {
    timestamp: u64,
    received_at: u64,
}

/// Behavioral fingerprint of a user
#[derive(Clone, Debug, Default)]
pub struct UserProfile {
    history: VecDeque<ProfileEntry>,
    type_counts: [f64; 5],
    vote_options: HashMap<String, f64>,
    active_hours: [f64; 24],
    interactions: HashMap<UserId, u64>,
    regions: HashMap<String, u64>,
    pub total_events: u64,
    pub first_seen: u64,
    pub last_seen: u64,
}

impl UserProfile {
    fn record(&mut self, event: &Event, other_parent_creator: Option<&UserId>, now: u64) {
        if self.total_events == 0 {
            self.first_seen = now;
        }
        self.total_events += 1;
        self.last_seen = now;
        self.history.push_back(ProfileEntry {
            timestamp: event.timestamp,
            received_at: now,
        });
        self.type_counts[event.event_type.index()] += 1.0;
        if let EventPayload::Vote(vote) = &event.payload {
            *self.vote_options.entry(vote.decision.clone()).or_insert(0.0) += 1.0;
        }
        self.active_hours[((event.timestamp / HOUR_MS) % 24) as usize] += 1.0;
        if let Some(peer) = other_parent_creator {
            if *peer != event.creator {
                *self.interactions.entry(peer.clone()).or_insert(0) += 1;
            }
        }
        if let Some(region) = &event.region {
            *self.regions.entry(region.clone()).or_insert(0) += 1;
        }
    }

    /// Events currently in the rolling window
    pub fn window_len(&self) -> usize {
        self.history.len()
    }

    /// Gaps between consecutive events in the window, by creator timestamp
    fn intervals(&self) -> Vec<f64> {
        self.history
            .iter()
            .zip(self.history.iter().skip(1))
            .map(|(a, b)| b.timestamp.saturating_sub(a.timestamp) as f64)
            .collect()
    }

    fn mean_interval(&self) -> f64 {
        let intervals = self.intervals();
        if intervals.is_empty() {
            return 0.0;
        }
        intervals.iter().sum::<f64>() / intervals.len() as f64
    }

    fn interaction_diversity(&self) -> f64 {
        self.interactions.len() as f64 / self.total_events.max(1) as f64
    }

    fn region_diversity(&self) -> f64 {
        self.regions.len() as f64 / self.total_events.max(1) as f64
    }

    fn trim(&mut self, cutoff: u64) {
        while self
            .history
            .front()
            .map_or(false, |entry| entry.received_at < cutoff)
        {
            self.history.pop_front();
        }
    }
}

// =============================================================================
// SIMILARITY
// =============================================================================

fn cosine(a: &[f64], b: &[f64]) -> Option<f64> {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 && nb == 0.0 {
        return Some(1.0);
    }
    if na == 0.0 || nb == 0.0 {
        return Some(0.0);
    }
    let value = dot / (na * nb);
    value.is_finite().then_some(value)
}

fn map_cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> Option<f64> {
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    let va: Vec<f64> = keys.iter().map(|k| a.get(*k).copied().unwrap_or(0.0)).collect();
    let vb: Vec<f64> = keys.iter().map(|k| b.get(*k).copied().unwrap_or(0.0)).collect();
    cosine(&va, &vb)
}

fn ratio_similarity(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max <= 0.0 {
        return 1.0;
    }
    a.min(b) / max
}

/// Jaccard overlap of two payloads' key/value pairs
fn payload_overlap(a: &EventPayload, b: &EventPayload) -> f64 {
    let fa: HashSet<(&str, String)> = a.fields().into_iter().collect();
    let fb: HashSet<(&str, String)> = b.fields().into_iter().collect();
    let union = fa.union(&fb).count();
    if union == 0 {
        return 0.0;
    }
    fa.intersection(&fb).count() as f64 / union as f64
}

/// Weighted event similarity: type 0.3, payload 0.4, region 0.2, closeness 0.1
pub fn event_similarity(a: &Event, b: &Event, window_ms: u64) -> f64 {
    let mut score = 0.0;
    if a.event_type == b.event_type {
        score += 0.3;
    }
    score += 0.4 * payload_overlap(&a.payload, &b.payload);
    if a.region == b.region {
        score += 0.2;
    }
    if window_ms > 0 {
        let gap = a.timestamp.abs_diff(b.timestamp) as f64;
        score += 0.1 * (1.0 - gap / window_ms as f64).max(0.0);
    }
    score
}

/// Similarity of two behavioral fingerprints in 0..=1
pub fn fingerprint_similarity(a: &UserProfile, b: &UserProfile) -> Option<f64> {
    let types = cosine(&a.type_counts, &b.type_counts)?;
    let votes = if a.vote_options.is_empty() && b.vote_options.is_empty() {
        1.0
    } else {
        map_cosine(&a.vote_options, &b.vote_options)?
    };
    let hours = cosine(&a.active_hours, &b.active_hours)?;
    let frequency = ratio_similarity(a.mean_interval(), b.mean_interval());
    let diversity = 1.0
        - ((a.interaction_diversity() - b.interaction_diversity()).abs()
            + (a.region_diversity() - b.region_diversity()).abs())
            / 2.0;

    let score = 0.3 * types + 0.2 * votes + 0.2 * hours + 0.15 * frequency + 0.15 * diversity;
    score.is_finite().then_some(score.clamp(0.0, 1.0))
}

fn coordination_key(event: &Event) -> String {
    let fields: Vec<String> = event
        .payload
        .fields()
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    format!("{}|{}|{}", event.event_type, event.channel, fields.join("&"))
}

// =============================================================================
// MONITOR
// =============================================================================

/// Risk summary for a user
#[derive(Clone, Debug, PartialEq)]
pub struct RiskAnalysis {
    pub user: UserId,
    /// 0..=1
    pub risk_score: f64,
    pub alerts: Vec<DetectionAlert>,
    /// Alerts raised in the last 24 hours
    pub recent_alerts: Vec<DetectionAlert>,
    pub events_in_window: usize,
}

/// Integrity monitor statistics
#[derive(Debug, Clone, Default)]
pub struct IntegrityStats {
    pub profiles: usize,
    pub alerts: usize,
    pub open_alerts: usize,
    pub alerts_by_type: HashMap<AlertType, usize>,
    pub events_analyzed: u64,
    pub unscored_checks: u64,
}

struct RecentEvent {
    event: Event,
    received_at: u64,
}

/// Integrity monitor
pub struct IntegrityMonitor {
    config: IntegrityConfig,
    profiles: HashMap<UserId, UserProfile>,
    alerts: HashMap<AlertId, DetectionAlert>,
    /// Events inside the widest comparison window
    recent: VecDeque<RecentEvent>,
    /// Event id -> creator, for the interaction graph
    creators: HashMap<EventId, (UserId, u64)>,
    events_analyzed: u64,
    unscored_checks: u64,
}

impl IntegrityMonitor {
    pub fn new(config: IntegrityConfig) -> Self {
        Self {
            config,
            profiles: HashMap::new(),
            alerts: HashMap::new(),
            recent: VecDeque::new(),
            creators: HashMap::new(),
            events_analyzed: 0,
            unscored_checks: 0,
        }
    }

    /// Profile and analyze an admitted event
    pub fn on_event_admitted(&mut self, event: &Event, now: u64) -> Vec<AlertUpdate> {
        self.events_analyzed += 1;

        let other_creator = event
            .other_parent
            .and_then(|id| self.creators.get(&id))
            .map(|(user, _)| user.clone());
        self.profiles
            .entry(event.creator.clone())
            .or_default()
            .record(event, other_creator.as_ref(), now);
        self.creators
            .insert(event.id, (event.creator.clone(), now));

        let window = self
            .config
            .replay_window_ms
            .max(self.config.coordination_window_ms);
        while self
            .recent
            .front()
            .map_or(false, |r| r.received_at + window < now)
        {
            self.recent.pop_front();
        }

        let mut updates = Vec::new();
        let checks: [(&str, fn(&mut Self, &Event, u64) -> Result<Option<AlertUpdate>, IntegrityError>); 4] = [
            ("replay", Self::check_replay),
            ("coordination", Self::check_coordination),
            ("timing", Self::check_timing),
            ("sybil", Self::check_sybil),
        ];
        for (name, check) in checks {
            match check(self, event, now) {
                Ok(Some(update)) => updates.push(update),
                Ok(None) => {}
                Err(e) => {
                    self.unscored_checks += 1;
                    warn!("{} check left event {} unscored: {}", name, event.id, e);
                }
            }
        }

        self.recent.push_back(RecentEvent {
            event: event.clone(),
            received_at: now,
        });

        for update in &updates {
            let alert = update.alert();
            if matches!(update, AlertUpdate::Raised(_)) {
                info!(
                    "Alert {} raised: {} ({:?}, confidence {:.2}, {} users)",
                    alert.id,
                    alert.alert_type.as_str(),
                    alert.severity,
                    alert.confidence,
                    alert.suspicious_users.len()
                );
            }
        }
        updates
    }

    fn raise(
        &mut self,
        alert_type: AlertType,
        severity: Severity,
        confidence: f64,
        users: BTreeSet<UserId>,
        events: BTreeSet<EventId>,
        description: String,
        pattern_key: Option<String>,
        now: u64,
    ) -> AlertUpdate {
        let user_list: Vec<UserId> = users.iter().cloned().collect();
        let event_list: Vec<EventId> = events.iter().copied().collect();
        let id = derive_alert_id(alert_type.as_str(), &user_list, &event_list, now);
        let alert = DetectionAlert {
            id,
            alert_type,
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            suspicious_users: users,
            suspicious_events: events,
            status: AlertStatus::Pending,
            description,
            raised_at: now,
            updated_at: now,
            investigation_log: Vec::new(),
            pattern_key,
        };
        self.alerts.insert(id, alert.clone());
        AlertUpdate::Raised(alert)
    }

    fn check_replay(&mut self, event: &Event, now: u64) -> Result<Option<AlertUpdate>, IntegrityError> {
        let window = self.config.replay_window_ms;
        let mut best: Option<(f64, &Event)> = None;
        for recent in self.recent.iter().filter(|r| r.received_at + window >= now) {
            if recent.event.id == event.id {
                continue;
            }
            let similarity = event_similarity(event, &recent.event, window);
            if !similarity.is_finite() {
                return Err(IntegrityError::Analysis(format!(
                    "non-finite replay similarity against {}",
                    recent.event.id
                )));
            }
            if best.map_or(true, |(s, _)| similarity > s) {
                best = Some((similarity, &recent.event));
            }
        }

        let Some((similarity, original)) = best else {
            return Ok(None);
        };
        if similarity <= self.config.replay_threshold {
            return Ok(None);
        }

        let users: BTreeSet<UserId> = [event.creator.clone(), original.creator.clone()].into();
        let events: BTreeSet<EventId> = [event.id, original.id].into();
        let description = format!(
            "event {} replays {} (similarity {:.2})",
            event.id, original.id, similarity
        );
        Ok(Some(self.raise(
            AlertType::ReplayAttack,
            Severity::High,
            similarity,
            users,
            events,
            description,
            None,
            now,
        )))
    }

    fn check_coordination(
        &mut self,
        event: &Event,
        now: u64,
    ) -> Result<Option<AlertUpdate>, IntegrityError> {
        let window = self.config.coordination_window_ms;
        let key = coordination_key(event);

        let mut users: BTreeSet<UserId> = [event.creator.clone()].into();
        let mut events: BTreeSet<EventId> = [event.id].into();
        let mut similarity_sum = 0.0;
        let mut matched = 0usize;
        for recent in self.recent.iter().filter(|r| r.received_at + window >= now) {
            if recent.event.id == event.id || coordination_key(&recent.event) != key {
                continue;
            }
            let similarity = event_similarity(event, &recent.event, window);
            if !similarity.is_finite() {
                return Err(IntegrityError::Analysis("non-finite coordination similarity".into()));
            }
            if similarity > self.config.coordination_similarity {
                users.insert(recent.event.creator.clone());
                events.insert(recent.event.id);
                similarity_sum += similarity;
                matched += 1;
            }
        }

        if users.len() < self.config.min_coordinated_users {
            return Ok(None);
        }
        let confidence = if matched == 0 {
            0.0
        } else {
            similarity_sum / matched as f64
        };

        // grow an open alert for the same pattern instead of raising another
        let existing = self
            .alerts
            .values_mut()
            .filter(|a| {
                a.alert_type == AlertType::CoordinationPattern
                    && a.status.is_open()
                    && a.pattern_key.as_deref() == Some(key.as_str())
                    && a.updated_at + window >= now
            })
            .max_by_key(|a| a.updated_at);
        if let Some(alert) = existing {
            alert.suspicious_users.extend(users);
            alert.suspicious_events.extend(events);
            alert.confidence = alert.confidence.max(confidence.clamp(0.0, 1.0));
            alert.updated_at = now;
            debug!("Coordination alert {} grew to {} users", alert.id, alert.suspicious_users.len());
            return Ok(Some(AlertUpdate::Updated(alert.clone())));
        }

        let description = format!(
            "{} distinct creators emitted the same {} within {} ms",
            users.len(),
            event.event_type,
            window
        );
        Ok(Some(self.raise(
            AlertType::CoordinationPattern,
            Severity::Medium,
            confidence,
            users,
            events,
            description,
            Some(key),
            now,
        )))
    }

    fn check_timing(&mut self, event: &Event, now: u64) -> Result<Option<AlertUpdate>, IntegrityError> {
        let Some(profile) = self.profiles.get(&event.creator) else {
            return Ok(None);
        };
        // the new event is already in the window
        if profile.window_len() < self.config.timing_min_history + 1 {
            return Ok(None);
        }
        let mut intervals = profile.intervals();
        let Some(latest) = intervals.pop() else {
            return Ok(None);
        };
        if intervals.is_empty() {
            return Ok(None);
        }

        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        let variance =
            intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
        let std_dev = variance.sqrt();
        if !std_dev.is_finite() {
            return Err(IntegrityError::Analysis("non-finite interval variance".into()));
        }
        if latest >= mean - 2.0 * std_dev {
            return Ok(None);
        }

        let description = format!(
            "interval {:.0} ms vs mean {:.0} ms (std dev {:.0})",
            latest, mean, std_dev
        );
        Ok(Some(self.raise(
            AlertType::TimingAnomaly,
            Severity::Low,
            0.3,
            [event.creator.clone()].into(),
            [event.id].into(),
            description,
            None,
            now,
        )))
    }

    fn check_sybil(&mut self, event: &Event, now: u64) -> Result<Option<AlertUpdate>, IntegrityError> {
        let min_events = self.config.min_profile_events as u64;
        let Some(subject) = self.profiles.get(&event.creator) else {
            return Ok(None);
        };
        if subject.total_events < min_events {
            return Ok(None);
        }

        let mut cluster: Vec<&UserId> = vec![&event.creator];
        for (user, profile) in &self.profiles {
            if *user == event.creator || profile.total_events < min_events {
                continue;
            }
            let similarity = fingerprint_similarity(subject, profile).ok_or_else(|| {
                IntegrityError::Analysis(format!("fingerprint of {} not comparable", user))
            })?;
            if similarity > self.config.similarity_threshold {
                cluster.push(user);
            }
        }
        if cluster.len() < self.config.min_cluster_size {
            return Ok(None);
        }

        let mut total = 0.0;
        let mut pairs = 0usize;
        for (i, a) in cluster.iter().enumerate() {
            for b in &cluster[i + 1..] {
                if let (Some(pa), Some(pb)) = (self.profiles.get(*a), self.profiles.get(*b)) {
                    total += fingerprint_similarity(pa, pb).unwrap_or(0.0);
                    pairs += 1;
                }
            }
        }
        let confidence = if pairs == 0 { 0.0 } else { total / pairs as f64 };
        let users: BTreeSet<UserId> = cluster.into_iter().cloned().collect();

        let already_flagged = self.alerts.values().any(|a| {
            a.alert_type == AlertType::SybilCluster
                && a.status.is_open()
                && users.is_subset(&a.suspicious_users)
        });
        if already_flagged {
            return Ok(None);
        }

        let description = format!(
            "{} users with mean fingerprint similarity {:.2}",
            users.len(),
            confidence
        );
        Ok(Some(self.raise(
            AlertType::SybilCluster,
            Severity::High,
            confidence,
            users,
            [event.id].into(),
            description,
            None,
            now,
        )))
    }

    // =========================================================================
    // INVESTIGATION
    // =========================================================================

    /// Move an alert along its investigation lifecycle
    pub fn update_alert_status(
        &mut self,
        id: &AlertId,
        investigator: &UserId,
        status: AlertStatus,
        notes: &str,
        now: u64,
    ) -> Result<DetectionAlert, IntegrityError> {
        let alert = self
            .alerts
            .get_mut(id)
            .ok_or(IntegrityError::UnknownAlert(*id))?;
        if !alert.status.can_transition_to(status) {
            return Err(IntegrityError::InvalidTransition {
                from: alert.status,
                to: status,
            });
        }
        alert.investigation_log.push(InvestigationNote {
            timestamp: now,
            investigator: investigator.clone(),
            from: alert.status,
            to: status,
            notes: notes.to_string(),
        });
        alert.status = status;
        alert.updated_at = now;
        info!("Alert {} now {:?} ({})", id, status, investigator);
        Ok(alert.clone())
    }

    pub fn get_alert(&self, id: &AlertId) -> Option<DetectionAlert> {
        self.alerts.get(id).cloned()
    }

    /// All alerts, newest first
    pub fn alerts(&self) -> Vec<DetectionAlert> {
        let mut alerts: Vec<DetectionAlert> = self.alerts.values().cloned().collect();
        alerts.sort_by(|a, b| b.raised_at.cmp(&a.raised_at).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    /// Risk summary for a user from the alerts naming them
    pub fn get_user_risk_analysis(&self, user: &UserId, now: u64) -> RiskAnalysis {
        let alerts: Vec<DetectionAlert> = self
            .alerts()
            .into_iter()
            .filter(|a| a.suspicious_users.contains(user))
            .collect();
        let recent_alerts = alerts
            .iter()
            .filter(|a| a.raised_at + 24 * HOUR_MS >= now)
            .cloned()
            .collect();

        let risk: f64 = alerts
            .iter()
            .map(|a| {
                let base = a.severity.risk_weight() * a.confidence;
                match a.status {
                    AlertStatus::FalsePositive => 0.0,
                    AlertStatus::Confirmed => base * 2.0,
                    AlertStatus::Resolved => base * 0.5,
                    _ => base,
                }
            })
            .sum();

        RiskAnalysis {
            user: user.clone(),
            risk_score: risk.min(1.0),
            alerts,
            recent_alerts,
            events_in_window: self.profiles.get(user).map_or(0, |p| p.window_len()),
        }
    }

    pub fn profile(&self, user: &UserId) -> Option<&UserProfile> {
        self.profiles.get(user)
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    /// Drop raw history past the analysis window and resolved alerts past
    /// the alert retention window. Returns the ids of deleted alerts.
    pub fn cleanup(&mut self, now: u64) -> Vec<AlertId> {
        let cutoff = now.saturating_sub(self.config.analysis_window_ms);
        for profile in self.profiles.values_mut() {
            profile.trim(cutoff);
        }
        self.profiles
            .retain(|_, p| !p.history.is_empty() || p.last_seen >= cutoff);
        self.creators.retain(|_, (_, seen)| *seen >= cutoff);

        let alert_cutoff = now.saturating_sub(self.config.alert_retention_ms);
        let expired: Vec<AlertId> = self
            .alerts
            .values()
            .filter(|a| a.status == AlertStatus::Resolved && a.updated_at < alert_cutoff)
            .map(|a| a.id)
            .collect();
        for id in &expired {
            self.alerts.remove(id);
        }
        if !expired.is_empty() {
            debug!("Dropped {} resolved alerts", expired.len());
        }
        expired
    }

    /// Re-load a persisted alert
    pub fn restore_alert(&mut self, alert: DetectionAlert) {
        self.alerts.insert(alert.id, alert);
    }

    pub fn stats(&self) -> IntegrityStats {
        let mut alerts_by_type = HashMap::new();
        for alert in self.alerts.values() {
            *alerts_by_type.entry(alert.alert_type).or_insert(0) += 1;
        }
        IntegrityStats {
            profiles: self.profiles.len(),
            alerts: self.alerts.len(),
            open_alerts: self.alerts.values().filter(|a| a.status.is_open()).count(),
            alerts_by_type,
            events_analyzed: self.events_analyzed,
            unscored_checks: self.unscored_checks,
        }
    }
}
