// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Delivery of coherence requests between nodes.

pub mod loopback;

use std::fmt::Debug;
use std::time::Duration;

use crate::NodeId;
use crate::protocol::message::{CodecError, Request, Response};

/// Errors associated with delivering a request.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum TransportError {
    /// No answer from node {0} within {1:?}
    Timeout(NodeId, Duration),
    /// Node {0} is not known to the transport
    UnknownPeer(NodeId),
    /// Node {0} dropped the request
    Dropped(NodeId),
    /// {0}
    Codec(#[from] CodecError),
}

/// Request/response delivery between the nodes of a cluster.
///
/// Every call is bounded by `timeout`; an implementation that cannot get an answer in time
/// returns [`TransportError::Timeout`]. Page content must cross by value.
pub trait Transport: Send + Sync + Debug {
    /// Delivers `request` to node `to` and waits for its response.
    fn call(
        &self,
        to: NodeId,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, TransportError>;
}
