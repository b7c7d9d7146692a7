// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runs a whole cluster inside one process: every node gets its own region, directory and fault
//! interceptor, and they talk over the loopback transport. A workload then drives the nodes with
//! plain loads and stores.

mod workload;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Barrier};

use clap::{Parser, ValueEnum};
use dsm::config::ConfigError;
use dsm::fault::FaultError;
use dsm::metrics::NodeMetrics;
use dsm::{
    ClusterConfig, Interceptor, LoopbackNetwork, Node, NodeError, NodeId, Placement, Topology,
};
use serde::Serialize;

use crate::workload::{Workload, WorkloadError};

#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
enum ClusterError {
    /// Invalid configuration: {0}
    Config(#[from] ConfigError),
    /// Cannot start node: {0}
    Node(#[from] NodeError),
    /// Cannot intercept faults: {0}
    Fault(#[from] FaultError),
    /// Workload failed: {0}
    Workload(#[from] WorkloadError),
    /// Node {0} panicked while running the workload
    Panic(NodeId),
    /// Cannot print metrics: {0}
    Report(serde_json::Error),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlacementArg {
    RangeSplit,
    SingleOwner,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TopologyArg {
    Centralized,
    StaticPartitioned,
}

/// Distributed shared memory cluster simulator.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// JSON cluster configuration; overrides the cluster flags below.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Pages in the shared region.
    #[arg(long, default_value_t = 32)]
    pages: usize,
    /// Nodes in the cluster.
    #[arg(long, default_value_t = 2)]
    nodes: usize,
    /// Initial page ownership.
    #[arg(long, value_enum, default_value_t = PlacementArg::RangeSplit)]
    placement: PlacementArg,
    /// Directory layout.
    #[arg(long, value_enum, default_value_t = TopologyArg::StaticPartitioned)]
    topology: TopologyArg,
    /// Directory node of the centralized topology.
    #[arg(long, default_value_t = 0)]
    coordinator: NodeId,
    /// Fault worker threads per node.
    #[arg(long, default_value_t = 1)]
    fault_workers: usize,
    /// Timeout of each coherence request, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    request_timeout_ms: u64,
    /// Attempts per faulting access, including the first one.
    #[arg(long, default_value_t = 3)]
    retry_attempts: u32,
    /// Pause between attempts, in milliseconds.
    #[arg(long, default_value_t = 50)]
    retry_backoff_ms: u64,
    /// What to run on the cluster.
    #[arg(long, value_enum, default_value_t = Workload::Selfcheck)]
    workload: Workload,
    /// Side of the square matrices of the matmul workload.
    #[arg(long, default_value_t = 16)]
    matrix_dim: usize,
    /// Log level; RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

impl Cli {
    fn cluster_config(&self) -> Result<ClusterConfig, ConfigError> {
        if let Some(path) = &self.config {
            return ClusterConfig::from_file(path);
        }
        let mut config = ClusterConfig::new(self.pages, self.nodes);
        config.placement = match self.placement {
            PlacementArg::RangeSplit => Placement::RangeSplit,
            PlacementArg::SingleOwner => Placement::SingleOwner,
        };
        config.topology = match self.topology {
            TopologyArg::Centralized => Topology::Centralized {
                coordinator: self.coordinator,
            },
            TopologyArg::StaticPartitioned => Topology::StaticPartitioned,
        };
        config.fault_workers = self.fault_workers;
        config.request_timeout_ms = self.request_timeout_ms;
        config.retry.attempts = self.retry_attempts;
        config.retry.backoff_ms = self.retry_backoff_ms;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
struct NodeReport<'a> {
    node: NodeId,
    metrics: &'a NodeMetrics,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .parse_default_env()
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), ClusterError> {
    let config = cli.cluster_config()?;
    cli.workload.check(&config, cli.matrix_dim)?;
    log::info!(
        "Starting {} nodes sharing {} pages, running {:?}",
        config.total_nodes,
        config.num_pages,
        cli.workload
    );

    let network = LoopbackNetwork::new();
    let mut nodes = Vec::with_capacity(config.total_nodes);
    for index in 0..config.total_nodes {
        let node = Node::new(config.for_node(index)?, network.clone())?;
        network.attach(&node);
        nodes.push(node);
    }
    let interceptors = nodes
        .iter()
        .map(|node| Interceptor::install(node.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    let barrier = Arc::new(Barrier::new(nodes.len()));
    let workload = cli.workload;
    let dim = cli.matrix_dim;
    let handles: Vec<_> = nodes
        .iter()
        .cloned()
        .map(|node| {
            let barrier = barrier.clone();
            std::thread::spawn(move || workload.run(&node, &barrier, dim))
        })
        .collect();
    let mut outcome = Ok(());
    for (index, handle) in handles.into_iter().enumerate() {
        let result = match handle.join() {
            Ok(result) => result.map_err(ClusterError::from),
            Err(_) => Err(ClusterError::Panic(index)),
        };
        if outcome.is_ok() {
            outcome = result;
        }
    }
    drop(interceptors);
    outcome?;

    let report: Vec<_> = nodes
        .iter()
        .map(|node| NodeReport {
            node: node.id(),
            metrics: node.metrics(),
        })
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(ClusterError::Report)?
    );
    log::info!("{:?} finished on {} nodes", workload, nodes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_to_config() {
        let cli = Cli::try_parse_from([
            "dsm-cluster",
            "--pages",
            "8",
            "--nodes",
            "4",
            "--placement",
            "single-owner",
            "--topology",
            "centralized",
            "--coordinator",
            "3",
            "--fault-workers",
            "2",
            "--retry-attempts",
            "7",
            "--retry-backoff-ms",
            "5",
        ])
        .unwrap();
        let config = cli.cluster_config().unwrap();
        assert_eq!(config.retry.attempts, 7);
        assert_eq!(config.retry.backoff_ms, 5);
        assert_eq!(config.num_pages, 8);
        assert_eq!(config.placement, Placement::SingleOwner);
        assert_eq!(config.topology, Topology::Centralized { coordinator: 3 });
        assert_eq!(config.fault_workers, 2);
        assert_eq!(cli.workload, Workload::Selfcheck);
    }

    #[test]
    fn test_invalid_flags() {
        let cli = Cli::try_parse_from([
            "dsm-cluster",
            "--nodes",
            "2",
            "--topology",
            "centralized",
            "--coordinator",
            "2",
        ])
        .unwrap();
        assert!(matches!(
            cli.cluster_config(),
            Err(ConfigError::Coordinator(2, 2))
        ));
        Cli::try_parse_from(["dsm-cluster", "--workload", "bogus"]).unwrap_err();

        let cli = Cli::try_parse_from(["dsm-cluster", "--retry-attempts", "0"]).unwrap();
        assert!(matches!(
            cli.cluster_config(),
            Err(ConfigError::RetryAttempts)
        ));
    }
}
