// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Setup contract handed to a node by the bootstrap layer.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::placement::Placement;
use crate::placement::range_split_owner;
use crate::{NodeId, PageIndex};

/// Upper bound on fault worker threads per node.
pub const MAX_FAULT_WORKERS: usize = 8;

/// Errors associated with a node or cluster configuration.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// The shared region needs at least one page
    NoPages,
    /// The cluster needs at least one node
    NoNodes,
    /// Node index {0} is not smaller than the number of nodes {1}
    NodeIndex(NodeId, usize),
    /// Coordinator {0} is not smaller than the number of nodes {1}
    Coordinator(NodeId, usize),
    /// Fault worker count {0} is out of range
    FaultWorkers(usize),
    /// At least one attempt per coherence request is needed
    RetryAttempts,
    /// Request timeout must be positive
    Timeout,
    /// Cannot read configuration file: {0}
    Read(std::io::Error),
    /// Cannot parse configuration: {0}
    Parse(serde_json::Error),
}

/// Which node answers directory requests for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Topology {
    /// One node is the authority for every page.
    Centralized {
        /// The authority.
        coordinator: NodeId,
    },
    /// Pages are divided into contiguous ranges, one per node.
    StaticPartitioned,
}

impl Default for Topology {
    fn default() -> Self {
        Topology::Centralized { coordinator: 0 }
    }
}

impl Topology {
    /// Home node of `page`.
    pub fn home_of(self, page: PageIndex, num_pages: usize, total_nodes: usize) -> NodeId {
        match self {
            Topology::Centralized { coordinator } => coordinator,
            Topology::StaticPartitioned => range_split_owner(page, num_pages, total_nodes),
        }
    }
}

/// How often a failed coherence transaction is attempted before the access is given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per faulting access, including the first one.
    #[serde(default = "RetryConfig::default_attempts")]
    pub attempts: u32,
    /// Pause between attempts, in milliseconds.
    #[serde(default = "RetryConfig::default_backoff_ms")]
    pub backoff_ms: u64,
}

impl RetryConfig {
    fn default_attempts() -> u32 {
        3
    }

    fn default_backoff_ms() -> u64 {
        50
    }

    /// Pause between attempts.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: Self::default_attempts(),
            backoff_ms: Self::default_backoff_ms(),
        }
    }
}

/// Settings shared by every node of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Pages in the shared region.
    pub num_pages: usize,
    /// Nodes in the cluster.
    pub total_nodes: usize,
    /// Initial ownership.
    #[serde(default)]
    pub placement: Placement,
    /// Directory layout.
    #[serde(default)]
    pub topology: Topology,
    /// Timeout of every outbound coherence request, in milliseconds.
    #[serde(default = "ClusterConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retry policy for faulting accesses.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Threads resolving faults on each node.
    #[serde(default = "ClusterConfig::default_fault_workers")]
    pub fault_workers: usize,
}

impl ClusterConfig {
    fn default_request_timeout_ms() -> u64 {
        1000
    }

    fn default_fault_workers() -> usize {
        1
    }

    /// A configuration with default policies.
    pub fn new(num_pages: usize, total_nodes: usize) -> Self {
        ClusterConfig {
            num_pages,
            total_nodes,
            placement: Placement::default(),
            topology: Topology::default(),
            request_timeout_ms: Self::default_request_timeout_ms(),
            retry: RetryConfig::default(),
            fault_workers: Self::default_fault_workers(),
        }
    }

    /// Parses a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::from_json(&json)
    }

    /// Checks the cluster-wide part of the setup contract.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_pages == 0 {
            return Err(ConfigError::NoPages);
        }
        if self.total_nodes == 0 {
            return Err(ConfigError::NoNodes);
        }
        if let Topology::Centralized { coordinator } = self.topology {
            if coordinator >= self.total_nodes {
                return Err(ConfigError::Coordinator(coordinator, self.total_nodes));
            }
        }
        if self.fault_workers == 0 || self.fault_workers > MAX_FAULT_WORKERS {
            return Err(ConfigError::FaultWorkers(self.fault_workers));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::RetryAttempts);
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Timeout);
        }
        Ok(())
    }

    /// Timeout of every outbound coherence request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Setup contract of node `node_index`.
    pub fn for_node(&self, node_index: NodeId) -> Result<NodeConfig, ConfigError> {
        let config = NodeConfig {
            node_index,
            cluster: self.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Setup contract of a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node.
    pub node_index: NodeId,
    /// Cluster-wide settings.
    pub cluster: ClusterConfig,
}

impl NodeConfig {
    /// Checks the whole setup contract.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cluster.validate()?;
        if self.node_index >= self.cluster.total_nodes {
            return Err(ConfigError::NodeIndex(
                self.node_index,
                self.cluster.total_nodes,
            ));
        }
        Ok(())
    }

    /// Home node of `page`.
    pub fn home_of(&self, page: PageIndex) -> NodeId {
        self.cluster
            .topology
            .home_of(page, self.cluster.num_pages, self.cluster.total_nodes)
    }

    /// Owner of `page` before any fault.
    pub fn initial_owner(&self, page: PageIndex) -> NodeId {
        self.cluster
            .placement
            .initial_owner(page, self.cluster.num_pages, self.cluster.total_nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let config = ClusterConfig::from_json(r#"{"num_pages": 8, "total_nodes": 2}"#).unwrap();
        assert_eq!(config, ClusterConfig::new(8, 2));
        assert_eq!(config.request_timeout(), Duration::from_millis(1000));
        assert_eq!(config.retry.backoff(), Duration::from_millis(50));
    }

    #[test]
    fn test_parse_full() {
        let json = r#"{
            "num_pages": 16,
            "total_nodes": 4,
            "placement": "single-owner",
            "topology": {"kind": "static-partitioned"},
            "request_timeout_ms": 250,
            "retry": {"attempts": 5, "backoff_ms": 10},
            "fault_workers": 2
        }"#;
        let config = ClusterConfig::from_json(json).unwrap();
        assert_eq!(config.placement, Placement::SingleOwner);
        assert_eq!(config.topology, Topology::StaticPartitioned);
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.fault_workers, 2);

        let json = r#"{"num_pages": 4, "total_nodes": 2, "topology": {"kind": "centralized", "coordinator": 1}}"#;
        let config = ClusterConfig::from_json(json).unwrap();
        assert_eq!(config.topology, Topology::Centralized { coordinator: 1 });
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            ClusterConfig::from_json(r#"{"num_pages": 0, "total_nodes": 2}"#),
            Err(ConfigError::NoPages)
        ));
        assert!(matches!(
            ClusterConfig::from_json(r#"{"num_pages": 1, "total_nodes": 0}"#),
            Err(ConfigError::NoNodes)
        ));
        assert!(matches!(
            ClusterConfig::from_json(r#"{"num_pages": 1, "total_nodes": 1, "bogus": 1}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ClusterConfig::from_json(
                r#"{"num_pages": 1, "total_nodes": 2, "topology": {"kind": "centralized", "coordinator": 2}}"#
            ),
            Err(ConfigError::Coordinator(2, 2))
        ));
        assert!(matches!(
            ClusterConfig::from_json(r#"{"num_pages": 1, "total_nodes": 1, "fault_workers": 0}"#),
            Err(ConfigError::FaultWorkers(0))
        ));
        assert!(matches!(
            ClusterConfig::from_json(r#"{"num_pages": 1, "total_nodes": 1, "retry": {"attempts": 0}}"#),
            Err(ConfigError::RetryAttempts)
        ));
        assert!(matches!(
            ClusterConfig::new(4, 2).for_node(2),
            Err(ConfigError::NodeIndex(2, 2))
        ));
    }

    #[test]
    fn test_home_of() {
        let mut cluster = ClusterConfig::new(4, 2);
        cluster.topology = Topology::StaticPartitioned;
        let node = cluster.for_node(0).unwrap();
        assert_eq!(node.home_of(1), 0);
        assert_eq!(node.home_of(2), 1);

        cluster.topology = Topology::Centralized { coordinator: 1 };
        let node = cluster.for_node(0).unwrap();
        assert!((0..4).all(|page| node.home_of(page) == 1));
    }
}
