// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-node coherence counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};

/// A monotonically increasing counter that can be shared between threads.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Adds one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Adds `value`.
    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    /// Current value.
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Serialize for Counter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.count())
    }
}

/// Counters of one node.
#[derive(Debug, Default, Serialize)]
pub struct NodeMetrics {
    /// Faults that completed with the access granted.
    pub faults_resolved: Counter,
    /// Shared-access requests issued by this node.
    pub fetches: Counter,
    /// Exclusive-access requests issued by this node.
    pub upgrades: Counter,
    /// Directory transactions served as home node.
    pub transactions_served: Counter,
    /// Downgrade requests served as a holder.
    pub downgrades_served: Counter,
    /// Invalidate requests served as a holder.
    pub invalidations_served: Counter,
    /// Requests that timed out or hit an unreachable peer.
    pub timeouts: Counter,
    /// Incoming messages dropped as malformed or stale.
    pub protocol_violations: Counter,
    /// Grants that lost a race with a later revocation.
    pub stale_grants: Counter,
    /// Repeated attempts of a faulting access.
    pub retries: Counter,
}
