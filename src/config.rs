//! WolfHA Configuration
//!
//! TOML configuration for a domain node: its identity, the other domain
//! members, election and replication tuning, and logging.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::replication::ReplicationConfig;
use crate::state::{DomainMembership, DomainNode, ElectionConfig};

/// Main WolfHA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfHaConfig {
    /// Local node
    pub node: DomainNode,

    /// Domain members
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Election timers
    #[serde(default)]
    pub election: ElectionConfig,

    /// Push replication tuning
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Domain membership configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Every domain member; may include the local node
    #[serde(default)]
    pub nodes: Vec<DomainNode>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl LoggingConfig {
    /// Apply command-line overrides on top of the configured values
    pub fn with_overrides(mut self, level: Option<String>, format: Option<String>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(format) = format {
            self.format = format;
        }
        self
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfHaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: WolfHaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(Error::ReservedNodeId);
        }

        if self.node.host.is_empty() {
            return Err(Error::Config("node.host cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for node in &self.cluster.nodes {
            if node.id == 0 {
                return Err(Error::ReservedNodeId);
            }
            if !seen.insert(node.id) {
                return Err(Error::DuplicateNodeId(node.id));
            }
            // [node] owns the local eligibility; the cluster entry must only agree on placement
            if node.id == self.node.id
                && (node.domain_id != self.node.domain_id || node.address() != self.node.address())
            {
                return Err(Error::Config(format!(
                    "cluster entry for node {} does not match [node]",
                    node.id
                )));
            }
        }

        let replication = &self.replication;
        if replication.quiescence_ms == 0 {
            return Err(Error::Config("replication.quiescence_ms must be positive".into()));
        }
        if replication.initial_backoff_min_ms > replication.initial_backoff_max_ms {
            return Err(Error::Config(
                "replication.initial_backoff_min_ms exceeds initial_backoff_max_ms".into(),
            ));
        }

        if self.election.phase_timeout_ms == 0 {
            return Err(Error::Config("election.phase_timeout_ms must be positive".into()));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(Error::Config(format!(
                "unknown logging.format '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Membership of the local node's domain. Nodes of other domains are skipped.
    pub fn membership(&self) -> Result<DomainMembership> {
        DomainMembership::with_nodes(self.node.clone(), self.cluster.nodes.clone())
    }

    /// Domain peers other than the local node
    pub fn peers(&self) -> impl Iterator<Item = &DomainNode> {
        self.cluster
            .nodes
            .iter()
            .filter(|n| n.id != self.node.id && n.domain_id == self.node.domain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
[node]
id = 2
domain_id = 1
host = "10.0.0.2"
port = 6642

[[cluster.nodes]]
id = 1
domain_id = 1
host = "10.0.0.1"
port = 6642

[[cluster.nodes]]
id = 2
domain_id = 1
host = "10.0.0.2"
port = 6642

[[cluster.nodes]]
id = 3
domain_id = 1
host = "10.0.0.3"
port = 6642
leader_eligible = false

[[cluster.nodes]]
id = 9
domain_id = 7
host = "10.0.7.9"
port = 6642

[replication]
quiescence_ms = 500
"#;

    #[test]
    fn test_parse_config() {
        let config = WolfHaConfig::from_str(CONFIG).unwrap();
        assert_eq!(config.node.id, 2);
        assert!(config.node.leader_eligible);
        assert_eq!(config.cluster.nodes.len(), 4);
        assert_eq!(config.peers().map(|n| n.id).collect::<Vec<_>>(), vec![1, 3]);

        // Unset knobs take their defaults
        assert_eq!(config.replication.quiescence_ms, 500);
        assert_eq!(config.replication.update_timeout_ms, 2000);
        assert_eq!(config.election.phase_timeout_ms, 1000);
        assert_eq!(config.logging.format, "pretty");

        let membership = config.membership().unwrap();
        assert_eq!(membership.peer_ids(), vec![1, 3]);
        assert!(!membership.peer(3).unwrap().leader_eligible);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = WolfHaConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.address(), "10.0.0.2:6642");
    }

    #[test]
    fn test_validation() {
        let duplicate = CONFIG.replace("id = 3\n", "id = 1\n");
        assert!(matches!(
            WolfHaConfig::from_str(&duplicate),
            Err(Error::DuplicateNodeId(1))
        ));

        let reserved = CONFIG.replacen("id = 2\n", "id = 0\n", 1);
        assert!(matches!(
            WolfHaConfig::from_str(&reserved),
            Err(Error::ReservedNodeId)
        ));

        let backoff = format!("{}initial_backoff_min_ms = 500\n", CONFIG);
        assert!(matches!(
            WolfHaConfig::from_str(&backoff),
            Err(Error::Config(_))
        ));

        assert!(matches!(
            WolfHaConfig::from_str("[node]\nid = 1\n"),
            Err(Error::ConfigParse(_))
        ));

        // Cluster entry for node 2 placed on another host
        let moved = CONFIG.replace(
            "host = \"10.0.0.2\"\nport = 6642\n\n[[cluster.nodes]]\nid = 3",
            "host = \"10.0.0.22\"\nport = 6642\n\n[[cluster.nodes]]\nid = 3",
        );
        assert!(matches!(
            WolfHaConfig::from_str(&moved),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_local_eligibility_comes_from_node_section() {
        let ineligible =
            CONFIG.replacen("port = 6642\n", "port = 6642\nleader_eligible = false\n", 1);
        let config = WolfHaConfig::from_str(&ineligible).unwrap();
        assert!(!config.node.leader_eligible);

        // The cluster entry for node 2 leaves eligibility at its default
        let self_entry = config.cluster.nodes.iter().find(|n| n.id == 2).unwrap();
        assert!(self_entry.leader_eligible);

        let membership = config.membership().unwrap();
        assert!(!membership.leader_eligible());
        assert_eq!(membership.peer_ids(), vec![1, 3]);
    }

    #[test]
    fn test_logging_overrides() {
        let config = WolfHaConfig::from_str(&format!(
            "{}\n[logging]\nlevel = \"debug\"\nformat = \"json\"\n",
            CONFIG
        ))
        .unwrap();

        let from_file = config.logging.clone().with_overrides(None, None);
        assert_eq!(from_file.level, "debug");
        assert_eq!(from_file.format, "json");

        let overridden = config
            .logging
            .with_overrides(Some("warn".into()), None);
        assert_eq!(overridden.level, "warn");
        assert_eq!(overridden.format, "json");

        let defaults = LoggingConfig::default().with_overrides(None, Some("json".into()));
        assert_eq!(defaults.level, "info");
        assert_eq!(defaults.format, "json");
    }
}
