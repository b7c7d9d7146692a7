// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport between nodes living in the same process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use super::{Transport, TransportError};
use crate::NodeId;
use crate::protocol::Node;
use crate::protocol::message::{Request, Response, decode, encode};
use crate::utils::lock;

/// Connects nodes of one process.
///
/// Requests and responses are encoded to bytes on one side and decoded on the other, exactly as
/// they would travel over a socket. The request runs on the caller's thread.
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    nodes: RwLock<BTreeMap<NodeId, Weak<Node>>>,
    unreachable: Mutex<BTreeSet<NodeId>>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `node` reachable under its id.
    pub fn attach(&self, node: &Arc<Node>) {
        self.nodes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(node.id(), Arc::downgrade(node));
    }

    /// Cuts off or restores `node`. Calls to a cut-off node fail as if they timed out.
    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        let mut unreachable = lock(&self.unreachable);
        if reachable {
            unreachable.remove(&node);
        } else {
            unreachable.insert(node);
        }
        log::info!(
            "Loopback: node {} is {}",
            node,
            if reachable { "reachable" } else { "unreachable" }
        );
    }

    fn peer(&self, to: NodeId) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&to)
            .and_then(Weak::upgrade)
    }
}

impl Transport for LoopbackNetwork {
    fn call(
        &self,
        to: NodeId,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        if lock(&self.unreachable).contains(&to) {
            return Err(TransportError::Timeout(to, timeout));
        }
        let peer = self.peer(to).ok_or(TransportError::UnknownPeer(to))?;
        let wire = encode(request)?;
        let answer = peer
            .handle_message(&wire)
            .map_err(|_| TransportError::Dropped(to))?;
        Ok(decode(&answer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::protocol::message::Grant;

    #[test]
    fn test_call_and_reachability() {
        let network = LoopbackNetwork::new();
        let config = ClusterConfig::new(2, 2);
        let node = Node::new(config.for_node(0).unwrap(), network.clone()).unwrap();
        network.attach(&node);

        let timeout = Duration::from_millis(10);
        let fetch = Request::Fetch {
            page: 0,
            requester: 1,
        };
        let Response::Fetch(Grant { bytes, version, .. }) =
            network.call(0, &fetch, timeout).unwrap()
        else {
            panic!("expected a fetch grant");
        };
        assert_eq!(bytes.unwrap().len(), node.region().page_size());
        assert_eq!(version, 0);

        network.set_reachable(0, false);
        assert!(matches!(
            network.call(0, &fetch, timeout),
            Err(TransportError::Timeout(0, _))
        ));
        network.set_reachable(0, true);
        network.call(0, &fetch, timeout).unwrap();

        assert!(matches!(
            network.call(1, &fetch, timeout),
            Err(TransportError::UnknownPeer(1))
        ));
    }

    #[test]
    fn test_violation_is_dropped() {
        let network = LoopbackNetwork::new();
        let node = Node::new(ClusterConfig::new(2, 2).for_node(0).unwrap(), network.clone())
            .unwrap();
        network.attach(&node);

        let bogus = Request::Fetch {
            page: 17,
            requester: 1,
        };
        assert!(matches!(
            network.call(0, &bogus, Duration::from_millis(10)),
            Err(TransportError::Dropped(0))
        ));
    }

    #[test]
    fn test_detached_node_is_unknown() {
        let network = LoopbackNetwork::new();
        let node = Node::new(ClusterConfig::new(1, 1).for_node(0).unwrap(), network.clone())
            .unwrap();
        network.attach(&node);
        drop(node);
        assert!(matches!(
            network.call(
                0,
                &Request::Fetch {
                    page: 0,
                    requester: 0
                },
                Duration::from_millis(10)
            ),
            Err(TransportError::UnknownPeer(0))
        ));
    }
}
