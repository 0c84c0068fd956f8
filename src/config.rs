use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error loading or validating settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub placement: PlacementSettings,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.placement;
        if p.repcount < 1 {
            return Err(ConfigError::Invalid("repcount must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&p.rebalance_threshold) {
            return Err(ConfigError::Invalid(format!(
                "rebalance_threshold {} is outside 0..=1",
                p.rebalance_threshold
            )));
        }
        for (name, value) in [("busy.loadavg", p.busy.loadavg), ("busy.mem_used", p.busy.mem_used)] {
            if value <= 0.0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if p.max_outstanding_actions == 0 {
            return Err(ConfigError::Invalid("max_outstanding_actions must be positive".into()));
        }
        if self.sync.max_buf_history == 0 {
            return Err(ConfigError::Invalid("max_buf_history must be positive".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &p.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node id {}", node.id)));
            }
        }
        Ok(())
    }
}

/// Buffer engine and room settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_max_buf_history")]
    pub max_buf_history: usize,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_save_delay_ms")]
    pub save_delay_ms: u64,
    #[serde(default = "default_resync_delay_ms")]
    pub resync_delay_ms: u64,
    #[serde(default = "default_desync_resync_delay_ms")]
    pub desync_resync_delay_ms: u64,
    #[serde(default = "default_max_buf_len")]
    pub max_buf_len: usize,
    #[serde(default = "default_max_workspace_size")]
    pub max_workspace_size: usize,
    #[serde(default = "default_indent_warning_interval_ms")]
    pub indent_warning_interval_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_buf_history: default_max_buf_history(),
            max_events: default_max_events(),
            save_delay_ms: default_save_delay_ms(),
            resync_delay_ms: default_resync_delay_ms(),
            desync_resync_delay_ms: default_desync_resync_delay_ms(),
            max_buf_len: default_max_buf_len(),
            max_workspace_size: default_max_workspace_size(),
            indent_warning_interval_ms: default_indent_warning_interval_ms(),
        }
    }
}

impl SyncSettings {
    pub fn save_delay(&self) -> Duration {
        Duration::from_millis(self.save_delay_ms)
    }

    pub fn resync_delay(&self) -> Duration {
        Duration::from_millis(self.resync_delay_ms)
    }

    pub fn desync_resync_delay(&self) -> Duration {
        Duration::from_millis(self.desync_resync_delay_ms)
    }

    pub fn indent_warning_interval(&self) -> Duration {
        Duration::from_millis(self.indent_warning_interval_ms)
    }
}

fn default_max_buf_history() -> usize {
    15
}

fn default_max_events() -> usize {
    20
}

fn default_save_delay_ms() -> u64 {
    120_000
}

fn default_resync_delay_ms() -> u64 {
    1500
}

fn default_desync_resync_delay_ms() -> u64 {
    1000
}

fn default_max_buf_len() -> usize {
    10_000_000
}

fn default_max_workspace_size() -> usize {
    default_max_buf_len() * 20
}

fn default_indent_warning_interval_ms() -> u64 {
    60_000
}

/// Where workspace stores live and how many stay open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_max_open_stores")]
    pub max_open_stores: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_open_stores: default_max_open_stores(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_open_stores() -> usize {
    10
}

/// A node is busy if either fraction is exceeded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BusyThresholds {
    #[serde(default = "default_busy")]
    pub loadavg: f64,
    #[serde(default = "default_busy")]
    pub mem_used: f64,
}

impl Default for BusyThresholds {
    fn default() -> Self {
        Self {
            loadavg: default_busy(),
            mem_used: default_busy(),
        }
    }
}

fn default_busy() -> f64 {
    0.7
}

/// A storage node the controller manages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub backup: bool,
    #[serde(default)]
    pub excluded: bool,
}

/// Replication controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementSettings {
    #[serde(default = "default_repcount")]
    pub repcount: usize,
    #[serde(default = "default_actions_per_pass")]
    pub actions_per_pass: usize,
    #[serde(default = "default_max_outstanding_actions")]
    pub max_outstanding_actions: usize,
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    #[serde(default = "default_replicate_interval_ms")]
    pub replicate_interval_ms: u64,
    #[serde(default = "default_rebalance_interval_ms")]
    pub rebalance_interval_ms: u64,
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: f64,
    #[serde(default = "default_rebalance_sample")]
    pub rebalance_sample: usize,
    #[serde(default = "default_node_error_threshold_ms")]
    pub node_error_threshold_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_max_route_age")]
    pub max_route_age: u32,
    #[serde(default)]
    pub busy: BusyThresholds,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            repcount: default_repcount(),
            actions_per_pass: default_actions_per_pass(),
            max_outstanding_actions: default_max_outstanding_actions(),
            action_timeout_ms: default_action_timeout_ms(),
            replicate_interval_ms: default_replicate_interval_ms(),
            rebalance_interval_ms: default_rebalance_interval_ms(),
            rebalance_threshold: default_rebalance_threshold(),
            rebalance_sample: default_rebalance_sample(),
            node_error_threshold_ms: default_node_error_threshold_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_route_age: default_max_route_age(),
            busy: BusyThresholds::default(),
            nodes: Vec::new(),
        }
    }
}

impl PlacementSettings {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn replicate_interval(&self) -> Duration {
        Duration::from_millis(self.replicate_interval_ms)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }

    pub fn node_error_threshold(&self) -> Duration {
        Duration::from_millis(self.node_error_threshold_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn default_repcount() -> usize {
    3
}

fn default_actions_per_pass() -> usize {
    100
}

fn default_max_outstanding_actions() -> usize {
    20
}

fn default_action_timeout_ms() -> u64 {
    60_000
}

fn default_replicate_interval_ms() -> u64 {
    15_000
}

fn default_rebalance_interval_ms() -> u64 {
    11_000
}

fn default_rebalance_threshold() -> f64 {
    0.1
}

fn default_rebalance_sample() -> usize {
    50
}

fn default_node_error_threshold_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_poll_timeout_ms() -> u64 {
    10_000
}

fn default_max_route_age() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.sync.max_buf_history, 15);
        assert_eq!(settings.sync.max_events, 20);
        assert_eq!(settings.sync.save_delay(), Duration::from_secs(120));
        assert_eq!(settings.storage.max_open_stores, 10);
        assert_eq!(settings.placement.repcount, 3);
        assert_eq!(settings.placement.actions_per_pass, 100);
        assert_eq!(settings.placement.max_outstanding_actions, 20);
        assert_eq!(settings.placement.busy.loadavg, 0.7);
        assert!(settings.placement.nodes.is_empty());
        settings.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "sync": { "max_buf_history": 5, "save_delay_ms": 1000 },
            "storage": { "data_dir": "/var/lib/colab", "max_open_stores": 3 },
            "placement": {
                "repcount": 2,
                "rebalance_threshold": 0.2,
                "busy": { "loadavg": 0.9 },
                "nodes": [
                    { "id": "a", "address": "http://10.0.0.1:8048" },
                    { "id": "vault", "address": "http://10.0.0.9:8048", "backup": true }
                ]
            }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.sync.max_buf_history, 5);
        assert_eq!(settings.sync.max_events, 20);
        assert_eq!(settings.storage.data_dir, PathBuf::from("/var/lib/colab"));
        assert_eq!(settings.placement.repcount, 2);
        assert_eq!(settings.placement.busy.loadavg, 0.9);
        assert_eq!(settings.placement.busy.mem_used, 0.7);
        assert!(settings.placement.nodes[1].backup);
        assert!(!settings.placement.nodes[0].excluded);
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.placement.repcount = 0;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = Settings::default();
        settings.placement.rebalance_threshold = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        let node = NodeConfig {
            id: "a".into(),
            address: "http://a".into(),
            backup: false,
            excluded: false,
        };
        settings.placement.nodes = vec![node.clone(), node];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "placement": { "repcount": 4 } }"#).unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.placement.repcount, 4);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Settings::load(&path), Err(ConfigError::Parse(_))));
    }
}
