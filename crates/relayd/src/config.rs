//! Configuration for relayd

use clap::Parser;
use relay_core::EventType;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// relayd - Relay integrity node
#[derive(Parser, Debug, Clone)]
#[command(name = "relayd")]
#[command(about = "Relay integrity node: event DAG, gossip, forks, abuse detection, partitions")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:9300")]
    pub listen: SocketAddr,

    /// Node id announced to peers (random if unset)
    #[arg(long, env = "RELAY_NODE_ID")]
    pub node_id: Option<String>,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/relayd")]
    pub data_dir: PathBuf,

    /// Keep all state in memory (nothing written to disk)
    #[arg(long)]
    pub ephemeral: bool,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    // --- event store ---
    /// Retention window for admitted events, in seconds
    #[arg(long, default_value = "86400")]
    pub retention_secs: u64,

    /// Maximum pending-chain length walked by the cycle check
    #[arg(long, default_value = "1000")]
    pub max_dag_depth: usize,

    /// Maximum events waiting on missing parents
    #[arg(long, default_value = "10000")]
    pub max_pending: usize,

    /// Fraction of active participants that must witness an event
    #[arg(long, default_value = "0.67")]
    pub consensus_threshold: f64,

    /// Floor for the active-participant count
    #[arg(long, default_value = "3")]
    pub min_participants: usize,

    // --- gossip ---
    /// Gossip round interval in milliseconds
    #[arg(long, default_value = "500")]
    pub gossip_interval_ms: u64,

    /// Peers contacted per gossip round
    #[arg(long, default_value = "3")]
    pub gossip_fanout: usize,

    /// Events sent to each peer per round
    #[arg(long, default_value = "10")]
    pub gossip_batch_size: usize,

    /// Hop limit for forwarded events
    #[arg(long, default_value = "10")]
    pub max_propagation_hops: usize,

    // --- forks ---
    /// Timestamp tolerance for the same-creator conflict rule, in ms
    #[arg(long, default_value = "1000")]
    pub timestamp_tolerance_ms: u64,

    /// Minimum gap between the two earliest events for automatic resolution, in ms
    #[arg(long, default_value = "500")]
    pub auto_resolve_gap_ms: u64,

    /// Moderator wait before community voting, in seconds
    #[arg(long, default_value = "300")]
    pub resolution_timeout_secs: u64,

    /// Share of cast weight a candidate needs to win a community vote
    #[arg(long, default_value = "0.6")]
    pub community_vote_threshold: f64,

    // --- integrity ---
    /// Replay comparison window in seconds
    #[arg(long, default_value = "60")]
    pub replay_window_secs: u64,

    /// Coordination grouping window in seconds
    #[arg(long, default_value = "5")]
    pub coordination_window_secs: u64,

    /// Fingerprint similarity above which users are clustered
    #[arg(long, default_value = "0.85")]
    pub similarity_threshold: f64,

    /// Minimum Sybil cluster size (including the subject)
    #[arg(long, default_value = "3")]
    pub min_cluster_size: usize,

    // --- partition ---
    /// Heartbeat and health-check interval in seconds
    #[arg(long, default_value = "30")]
    pub heartbeat_interval_secs: u64,

    /// Silence after which a peer is dropped, in seconds
    #[arg(long, default_value = "60")]
    pub partition_threshold_secs: u64,

    /// Offline buffer capacity
    #[arg(long, default_value = "1000")]
    pub max_offline_buffer: usize,

    /// Event types queued for anchoring once finalized
    #[arg(long, value_delimiter = ',', default_value = "vote,moderation")]
    pub anchor_types: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gossip_fanout == 0 {
            anyhow::bail!("Gossip fanout must be at least 1");
        }
        if self.gossip_batch_size == 0 {
            anyhow::bail!("Gossip batch size must be at least 1");
        }
        if self.gossip_interval_ms == 0 {
            anyhow::bail!("Gossip interval must be non-zero");
        }
        if !(self.consensus_threshold > 0.0 && self.consensus_threshold <= 1.0) {
            anyhow::bail!("Consensus threshold must be in (0, 1]");
        }
        if !(self.community_vote_threshold > 0.0 && self.community_vote_threshold <= 1.0) {
            anyhow::bail!("Community vote threshold must be in (0, 1]");
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            anyhow::bail!("Similarity threshold must be in (0, 1]");
        }
        if self.min_cluster_size < 2 {
            anyhow::bail!("Minimum cluster size must be at least 2");
        }
        if self.max_offline_buffer == 0 || self.max_pending == 0 {
            anyhow::bail!("Buffer capacities must be non-zero");
        }
        if self.partition_threshold_secs < self.heartbeat_interval_secs {
            anyhow::bail!("Partition threshold must not be shorter than the heartbeat interval");
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            anyhow::bail!("Log format must be 'json' or 'pretty'");
        }
        self.anchor_event_types()?;
        Ok(())
    }

    /// Parse the anchoring allow-list
    pub fn anchor_event_types(&self) -> anyhow::Result<Vec<EventType>> {
        self.anchor_types
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| {
                EventType::ALL
                    .iter()
                    .copied()
                    .find(|t| t.as_str() == s.trim())
                    .ok_or_else(|| anyhow::anyhow!("Unknown event type for anchoring: {}", s))
            })
            .collect()
    }

    pub fn store(&self) -> StoreConfig {
        StoreConfig {
            retention_ms: self.retention_secs * 1000,
            max_dag_depth: self.max_dag_depth,
            max_pending: self.max_pending,
            consensus_threshold: self.consensus_threshold,
            min_participants: self.min_participants,
            ..StoreConfig::default()
        }
    }

    pub fn gossip(&self) -> GossipConfig {
        GossipConfig {
            interval: Duration::from_millis(self.gossip_interval_ms),
            fanout: self.gossip_fanout,
            batch_size: self.gossip_batch_size,
            max_hops: self.max_propagation_hops,
            ..GossipConfig::default()
        }
    }

    pub fn fork(&self) -> ForkConfig {
        ForkConfig {
            timestamp_tolerance_ms: self.timestamp_tolerance_ms,
            auto_resolve_gap_ms: self.auto_resolve_gap_ms,
            resolution_timeout_ms: self.resolution_timeout_secs * 1000,
            community_vote_threshold: self.community_vote_threshold,
            retention_ms: self.retention_secs * 1000,
            ..ForkConfig::default()
        }
    }

    pub fn integrity(&self) -> IntegrityConfig {
        IntegrityConfig {
            replay_window_ms: self.replay_window_secs * 1000,
            coordination_window_ms: self.coordination_window_secs * 1000,
            similarity_threshold: self.similarity_threshold,
            min_cluster_size: self.min_cluster_size,
            ..IntegrityConfig::default()
        }
    }

    pub fn partition(&self) -> PartitionConfig {
        PartitionConfig {
            heartbeat_interval_ms: self.heartbeat_interval_secs * 1000,
            partition_threshold_ms: self.partition_threshold_secs * 1000,
            max_offline_buffer: self.max_offline_buffer,
            ..PartitionConfig::default()
        }
    }

    /// Everything a node needs, projected from the command line
    pub fn node(&self) -> anyhow::Result<NodeConfig> {
        Ok(NodeConfig {
            store: self.store(),
            gossip: self.gossip(),
            fork: self.fork(),
            integrity: self.integrity(),
            partition: self.partition(),
            anchor_types: self.anchor_event_types()?,
            ..NodeConfig::default()
        })
    }
}

/// Node-wide settings: subsystem configs plus timer periods
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub store: StoreConfig,
    pub gossip: GossipConfig,
    pub fork: ForkConfig,
    pub integrity: IntegrityConfig,
    pub partition: PartitionConfig,
    /// Finalized event types handed to the anchor sink
    pub anchor_types: Vec<EventType>,
    pub consensus_interval: Duration,
    pub fork_tick_interval: Duration,
    pub prune_interval: Duration,
    pub cleanup_interval: Duration,
    /// Drive periodic work from the scheduler; when off, callers run ticks
    pub run_timers: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            gossip: GossipConfig::default(),
            fork: ForkConfig::default(),
            integrity: IntegrityConfig::default(),
            partition: PartitionConfig::default(),
            anchor_types: vec![EventType::Vote, EventType::Moderation],
            consensus_interval: Duration::from_secs(1),
            fork_tick_interval: Duration::from_secs(1),
            prune_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60 * 60),
            run_timers: true,
        }
    }
}

/// EventStore tunables
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub retention_ms: u64,
    pub max_dag_depth: usize,
    pub max_pending: usize,
    pub consensus_threshold: f64,
    pub min_participants: usize,
    /// Window over which distinct creators count as active participants
    pub participant_window_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_ms: 24 * 60 * 60 * 1000,
            max_dag_depth: 1000,
            max_pending: 10_000,
            consensus_threshold: 0.67,
            min_participants: 3,
            participant_window_ms: 5 * 60 * 1000,
        }
    }
}

/// GossipPropagator tunables
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub interval: Duration,
    pub fanout: usize,
    pub batch_size: usize,
    pub max_hops: usize,
    /// Capacity of the recently-seen id cache
    pub seen_cache_size: usize,
    /// Capacity of the pending-gossip queue
    pub max_pending: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            fanout: 3,
            batch_size: 10,
            max_hops: 10,
            seen_cache_size: 50_000,
            max_pending: 10_000,
        }
    }
}

/// ForkResolver tunables
#[derive(Debug, Clone)]
pub struct ForkConfig {
    pub timestamp_tolerance_ms: u64,
    pub auto_resolve_gap_ms: u64,
    pub resolution_timeout_ms: u64,
    pub community_vote_threshold: f64,
    /// Distinct voters required before a community tally counts
    pub min_community_votes: usize,
    /// Restrict the same-creator rule to events sharing a self-parent
    pub strict_creator_forks: bool,
    /// Recent events per channel kept as conflict candidates
    pub candidates_per_channel: usize,
    pub retention_ms: u64,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance_ms: 1000,
            auto_resolve_gap_ms: 500,
            resolution_timeout_ms: 5 * 60 * 1000,
            community_vote_threshold: 0.6,
            min_community_votes: 3,
            strict_creator_forks: true,
            candidates_per_channel: 512,
            retention_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// IntegrityMonitor tunables
#[derive(Debug, Clone)]
pub struct IntegrityConfig {
    pub replay_window_ms: u64,
    pub replay_threshold: f64,
    pub coordination_window_ms: u64,
    pub coordination_similarity: f64,
    pub min_coordinated_users: usize,
    pub timing_min_history: usize,
    pub similarity_threshold: f64,
    pub min_cluster_size: usize,
    /// Events a profile needs before it takes part in Sybil comparison
    pub min_profile_events: usize,
    /// Raw history kept per profile
    pub analysis_window_ms: u64,
    /// Resolved alerts older than this may be dropped by cleanup
    pub alert_retention_ms: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            replay_window_ms: 60_000,
            replay_threshold: 0.9,
            coordination_window_ms: 5_000,
            coordination_similarity: 0.7,
            min_coordinated_users: 3,
            timing_min_history: 10,
            similarity_threshold: 0.85,
            min_cluster_size: 3,
            min_profile_events: 5,
            analysis_window_ms: 24 * 60 * 60 * 1000,
            alert_retention_ms: 30 * 24 * 60 * 60 * 1000,
        }
    }
}

/// PartitionCoordinator tunables
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub heartbeat_interval_ms: u64,
    pub partition_threshold_ms: u64,
    pub max_offline_buffer: usize,
    /// Peers needed to leave the partitioned state
    pub recovery_min_peers: usize,
    /// How long a reconciliation session waits for state responses
    pub reconcile_timeout_ms: u64,
    /// Archived partition records kept
    pub history_limit: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            partition_threshold_ms: 60_000,
            max_offline_buffer: 1000,
            recovery_min_peers: 3,
            reconcile_timeout_ms: 10_000,
            history_limit: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["relayd"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_match_subsystem_defaults() {
        let config = parse(&[]);
        assert!(config.validate().is_ok());

        let gossip = config.gossip();
        assert_eq!(gossip.interval, Duration::from_millis(500));
        assert_eq!(gossip.fanout, 3);
        assert_eq!(gossip.batch_size, 10);

        let fork = config.fork();
        assert_eq!(fork.resolution_timeout_ms, 300_000);
        assert_eq!(fork.timestamp_tolerance_ms, 1000);

        let partition = config.partition();
        assert_eq!(partition.partition_threshold_ms, 60_000);
        assert_eq!(partition.max_offline_buffer, 1000);

        let node = config.node().unwrap();
        assert_eq!(node.anchor_types, vec![EventType::Vote, EventType::Moderation]);
        assert_eq!(node.partition.heartbeat_interval_ms, 30_000);
        assert!(node.run_timers);
    }

    #[test]
    fn test_anchor_types_parsed() {
        let config = parse(&["--anchor-types", "vote,content"]);
        assert_eq!(
            config.anchor_event_types().unwrap(),
            vec![EventType::Vote, EventType::Content]
        );

        let bad = parse(&["--anchor-types", "vote,bogus"]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse(&["--gossip-fanout", "0"]).validate().is_err());
        assert!(parse(&["--consensus-threshold", "1.5"]).validate().is_err());
        assert!(parse(&["--log-format", "xml"]).validate().is_err());
        assert!(parse(&[
            "--heartbeat-interval-secs",
            "90",
            "--partition-threshold-secs",
            "60"
        ])
        .validate()
        .is_err());
    }
}
