//! Configuration file management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kadmesh_dht::{
    PeerMapConfig, DEFAULT_BAG_SIZE, DEFAULT_MAINTENANCE_LADDER_SECS, DEFAULT_OFFLINE_CACHE_SIZE,
    DEFAULT_OFFLINE_COUNT, DEFAULT_OFFLINE_TIMEOUT_SECS,
};
use kadmesh_replication::{
    AutoReplicationConfig, ReplicationConfig, DEFAULT_MAX_FACTOR, DEFAULT_MIN_FACTOR,
    DEFAULT_OBSERVATION_LENGTH, DEFAULT_RELIABILITY,
};
use kadmesh_types::Id;
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "KADMESH_CONFIG";

/// Config file read when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_FILE: &str = "kadmesh.toml";

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Routing table settings.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Replication model settings.
    #[serde(default)]
    pub replication: ReplicationSettings,
    /// Churn predictor settings.
    #[serde(default)]
    pub churn: ChurnConfig,
    /// Background task periods.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// In-process overlay driven by the binary.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Routing table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Peers kept per distance class.
    #[serde(default = "default_bag_size")]
    pub bag_size: usize,
    /// How long an excluded peer stays banned.
    #[serde(default = "default_offline_timeout")]
    pub offline_timeout_secs: u64,
    /// Failed checks before a peer is excluded.
    #[serde(default = "default_offline_count")]
    pub offline_count: u32,
    #[serde(default = "default_offline_cache_size")]
    pub offline_cache_size: usize,
    /// Re-check delays by number of successful checks. Empty disables
    /// maintenance.
    #[serde(default = "default_maintenance_ladder")]
    pub maintenance_ladder_ms: Vec<u64>,
    /// Refuse peers behind a TCP firewall.
    #[serde(default = "default_true")]
    pub reject_firewalled: bool,
    /// Only admit peers we talked to directly.
    #[serde(default)]
    pub first_hand_only: bool,
}

/// Replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Use the n-root model instead of 0-root.
    #[serde(default)]
    pub n_root: bool,
    /// Keep local data after responsibility moved away.
    #[serde(default)]
    pub keep_data: bool,
    /// Let the churn predictor choose the factor.
    #[serde(default = "default_true")]
    pub auto_factor: bool,
    /// Factor used when `auto_factor` is off.
    #[serde(default = "default_fixed_factor")]
    pub factor: usize,
}

/// Churn predictor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnConfig {
    /// Probability that at least one replica survives.
    #[serde(default = "default_reliability")]
    pub reliability: f64,
    #[serde(default = "default_min_factor")]
    pub min_factor: usize,
    #[serde(default = "default_max_factor")]
    pub max_factor: usize,
    /// Observations kept by the predictor.
    #[serde(default = "default_observation_length")]
    pub observation_length: usize,
}

/// Periods of the background tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,
    /// How often the churn predictor folds in departures.
    #[serde(default = "default_churn_interval")]
    pub churn_interval_ms: u64,
    /// How often responsible locations are re-published.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Simulated overlay run by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Nodes started before churn begins.
    #[serde(default = "default_peers")]
    pub peers: usize,
    /// Items stored before churn begins.
    #[serde(default = "default_keys")]
    pub keys: usize,
    #[serde(default = "default_ticks")]
    pub ticks: usize,
    /// Departures, and as many arrivals, per tick.
    #[serde(default = "default_churn_per_tick")]
    pub churn_per_tick: usize,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Fixed RNG seed for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_bag_size() -> usize {
    DEFAULT_BAG_SIZE
}

fn default_offline_timeout() -> u64 {
    DEFAULT_OFFLINE_TIMEOUT_SECS
}

fn default_offline_count() -> u32 {
    DEFAULT_OFFLINE_COUNT
}

fn default_offline_cache_size() -> usize {
    DEFAULT_OFFLINE_CACHE_SIZE
}

fn default_maintenance_ladder() -> Vec<u64> {
    DEFAULT_MAINTENANCE_LADDER_SECS
        .iter()
        .map(|secs| secs * 1000)
        .collect()
}

fn default_fixed_factor() -> usize {
    6
}

fn default_reliability() -> f64 {
    DEFAULT_RELIABILITY
}

fn default_min_factor() -> usize {
    DEFAULT_MIN_FACTOR
}

fn default_max_factor() -> usize {
    DEFAULT_MAX_FACTOR
}

fn default_observation_length() -> usize {
    DEFAULT_OBSERVATION_LENGTH
}

fn default_maintenance_interval() -> u64 {
    1_000
}

fn default_churn_interval() -> u64 {
    5_000
}

fn default_refresh_interval() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_peers() -> usize {
    40
}

fn default_keys() -> usize {
    100
}

fn default_ticks() -> usize {
    20
}

fn default_churn_per_tick() -> usize {
    2
}

fn default_tick_interval() -> u64 {
    500
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            bag_size: default_bag_size(),
            offline_timeout_secs: default_offline_timeout(),
            offline_count: default_offline_count(),
            offline_cache_size: default_offline_cache_size(),
            maintenance_ladder_ms: default_maintenance_ladder(),
            reject_firewalled: true,
            first_hand_only: false,
        }
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            n_root: false,
            keep_data: false,
            auto_factor: true,
            factor: default_fixed_factor(),
        }
    }
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            reliability: default_reliability(),
            min_factor: default_min_factor(),
            max_factor: default_max_factor(),
            observation_length: default_observation_length(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_ms: default_maintenance_interval(),
            churn_interval_ms: default_churn_interval(),
            refresh_interval_ms: default_refresh_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            peers: default_peers(),
            keys: default_keys(),
            ticks: default_ticks(),
            churn_per_tick: default_churn_per_tick(),
            tick_interval_ms: default_tick_interval(),
            seed: None,
        }
    }
}

impl RoutingConfig {
    /// Routing table options for a node with identifier `self_id`.
    pub fn peer_map_config(&self, self_id: Id) -> PeerMapConfig {
        PeerMapConfig::new(self_id)
            .bag_size(self.bag_size)
            .offline_timeout(Duration::from_secs(self.offline_timeout_secs))
            .offline_count(self.offline_count)
            .offline_cache_size(self.offline_cache_size)
            .maintenance_ladder(
                self.maintenance_ladder_ms
                    .iter()
                    .map(|ms| Duration::from_millis(*ms))
                    .collect(),
            )
            .reject_firewalled(self.reject_firewalled)
            .first_hand_only(self.first_hand_only)
    }
}

impl ReplicationSettings {
    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            n_root: self.n_root,
            keep_data: self.keep_data,
        }
    }
}

impl ChurnConfig {
    pub fn auto_replication_config(&self) -> AutoReplicationConfig {
        AutoReplicationConfig {
            reliability: self.reliability,
            min_factor: self.min_factor,
            max_factor: self.max_factor,
            observation_length: self.observation_length,
        }
    }
}

impl SchedulerConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }

    pub fn churn_interval(&self) -> Duration {
        Duration::from_millis(self.churn_interval_ms.max(1))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }
}

impl NodeConfig {
    /// Load configuration from the config file location.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the config file path.
    fn config_path() -> PathBuf {
        // Check env var override first
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.routing.bag_size, 2);
        assert_eq!(config.routing.offline_count, 2);
        assert_eq!(
            config.routing.maintenance_ladder_ms,
            vec![5_000, 10_000, 20_000, 40_000, 80_000, 160_000]
        );
        assert!(config.routing.reject_firewalled);
        assert!(!config.replication.n_root);
        assert!(config.replication.auto_factor);
        assert_eq!(config.churn.min_factor, 2);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = NodeConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: NodeConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.routing.offline_timeout_secs, 60);
        assert_eq!(parsed.churn.observation_length, 10);
        assert_eq!(parsed.simulation.seed, None);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let parsed: NodeConfig = toml::from_str(
            r#"
            [replication]
            n_root = true

            [simulation]
            peers = 12
            seed = 7
            "#,
        )
        .expect("deserialize");
        assert!(parsed.replication.n_root);
        assert_eq!(parsed.replication.factor, 6);
        assert_eq!(parsed.simulation.peers, 12);
        assert_eq!(parsed.simulation.seed, Some(7));
        assert_eq!(parsed.scheduler.refresh_interval_ms, 60_000);
    }

    #[test]
    fn test_typed_conversions() {
        let config = NodeConfig::default();
        let peer_map = config.routing.peer_map_config(Id::from_u64(3));
        assert_eq!(peer_map.self_id(), Id::from_u64(3));
        assert_eq!(peer_map.max_peers(), 2 * 160);
        assert!(peer_map.validate().is_ok());

        let churn = config.churn.auto_replication_config();
        assert_eq!(churn, AutoReplicationConfig::default());
        assert_eq!(
            config.replication.replication_config(),
            ReplicationConfig::default()
        );
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config =
            NodeConfig::load_from(Path::new("/nonexistent/kadmesh.toml")).expect("defaults");
        assert_eq!(config.simulation.ticks, 20);
    }
}
