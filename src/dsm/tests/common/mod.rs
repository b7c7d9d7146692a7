// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use dsm::protocol::message::{Request, Response};
use dsm::transport::TransportError;
use dsm::{
    ClusterConfig, LoopbackNetwork, Node, NodeId, PageIndex, PageState, Placement, Topology,
    Transport,
};

static LOGGER: Once = Once::new();

/// Sends the crate's log output to the test harness; `RUST_LOG` picks the level.
pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A loopback network that can lose answers after the request was handled.
#[derive(Debug)]
pub struct LossyNetwork {
    network: Arc<LoopbackNetwork>,
    lose: Mutex<Vec<&'static str>>,
}

impl LossyNetwork {
    /// Loses the answer to the next request of kind `name` ("fetch", "upgrade", "downgrade" or
    /// "invalidate"), once per call.
    pub fn lose_next(&self, name: &'static str) {
        self.lose.lock().unwrap().push(name);
    }

    /// Answers still scheduled to be lost.
    pub fn pending(&self) -> usize {
        self.lose.lock().unwrap().len()
    }
}

impl Transport for LossyNetwork {
    fn call(
        &self,
        to: NodeId,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let response = self.network.call(to, request, timeout)?;
        let mut lose = self.lose.lock().unwrap();
        if let Some(index) = lose.iter().position(|&name| name == request.name()) {
            lose.remove(index);
            log::info!("Losing the answer to {:?}", request);
            return Err(TransportError::Timeout(to, timeout));
        }
        Ok(response)
    }
}

/// Brings up every node of `config` on one loopback network.
pub fn cluster(config: &ClusterConfig) -> (Arc<LoopbackNetwork>, Vec<Arc<Node>>) {
    init_logging();
    let network = LoopbackNetwork::new();
    let nodes = (0..config.total_nodes)
        .map(|index| {
            let node = Node::new(config.for_node(index).unwrap(), network.clone()).unwrap();
            network.attach(&node);
            node
        })
        .collect();
    (network, nodes)
}

/// Brings up every node of `config` on a [`LossyNetwork`].
pub fn lossy_cluster(config: &ClusterConfig) -> (Arc<LossyNetwork>, Vec<Arc<Node>>) {
    init_logging();
    let lossy = Arc::new(LossyNetwork {
        network: LoopbackNetwork::new(),
        lose: Mutex::new(Vec::new()),
    });
    let nodes = (0..config.total_nodes)
        .map(|index| {
            let node = Node::new(config.for_node(index).unwrap(), lossy.clone()).unwrap();
            lossy.network.attach(&node);
            node
        })
        .collect();
    (lossy, nodes)
}

/// Four pages over two nodes, range split, each node home of the pages it owns.
pub fn two_node_config() -> ClusterConfig {
    let mut config = ClusterConfig::new(4, 2);
    config.placement = Placement::RangeSplit;
    config.topology = Topology::StaticPartitioned;
    config.request_timeout_ms = 100;
    config
}

/// Single writer or multiple readers on `page` across `nodes`.
pub fn single_writer(nodes: &[Arc<Node>], page: PageIndex) -> bool {
    let states: Vec<_> = nodes
        .iter()
        .map(|node| node.page_state(page).unwrap())
        .collect();
    let writers = states
        .iter()
        .filter(|&&state| state == PageState::ExclusiveWrite)
        .count();
    let readers = states
        .iter()
        .filter(|&&state| state == PageState::SharedRead)
        .count();
    writers == 0 || (writers == 1 && readers == 0)
}
