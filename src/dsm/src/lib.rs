// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Page-fault driven distributed shared memory.
//!
//! Every node of a cluster reserves the same number of pages of memory. Ordinary loads and
//! stores into that region trap when the node lacks the required access; the trap is
//! classified by the [`fault`] interceptor and resolved by the coherence engine in [`protocol`],
//! which negotiates ownership of the page with its home [`directory`] over a [`transport`] and
//! then re-establishes local access through the [`region`] manager.
//!
//! The protocol keeps a single writer or multiple readers per page at any instant.

#![cfg(target_os = "linux")]
#![warn(missing_docs)]

pub mod config;
pub mod directory;
pub mod fault;
pub mod metrics;
pub mod placement;
pub mod protocol;
pub mod region;
pub mod transport;
pub mod utils;

use serde::{Deserialize, Serialize};

pub use crate::config::{ClusterConfig, NodeConfig, Placement, Topology};
pub use crate::fault::Interceptor;
pub use crate::protocol::{Node, NodeError};
pub use crate::region::Region;
pub use crate::transport::Transport;
pub use crate::transport::loopback::LoopbackNetwork;

/// Index of a page inside the shared region.
pub type PageIndex = usize;

/// Index of a node inside the cluster, in `[0, total_nodes)`.
pub type NodeId = usize;

/// Local hardware protection of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccessLevel {
    /// Any access traps.
    None = 0,
    /// Loads succeed, stores trap.
    Read = 1,
    /// Loads and stores succeed.
    ReadWrite = 2,
}

impl AccessLevel {
    /// The `PROT_*` flags matching this level.
    pub fn prot_flags(self) -> libc::c_int {
        match self {
            AccessLevel::None => libc::PROT_NONE,
            AccessLevel::Read => libc::PROT_READ,
            AccessLevel::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }

    /// Inverse of `self as u8`; unknown values decode as [`AccessLevel::None`].
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => AccessLevel::Read,
            2 => AccessLevel::ReadWrite,
            _ => AccessLevel::None,
        }
    }
}

/// Coherence state of a page on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PageState {
    /// No valid local copy.
    Invalid,
    /// Read-only copy; other nodes may hold one too.
    SharedRead,
    /// The only valid copy in the cluster, writable.
    ExclusiveWrite,
}

impl PageState {
    /// Protection that must back this state.
    pub fn access_level(self) -> AccessLevel {
        match self {
            PageState::Invalid => AccessLevel::None,
            PageState::SharedRead => AccessLevel::Read,
            PageState::ExclusiveWrite => AccessLevel::ReadWrite,
        }
    }

    /// State entitled by a protection level.
    pub fn from_access_level(level: AccessLevel) -> Self {
        match level {
            AccessLevel::None => PageState::Invalid,
            AccessLevel::Read => PageState::SharedRead,
            AccessLevel::ReadWrite => PageState::ExclusiveWrite,
        }
    }

    /// Whether an access of kind `access` can proceed without a coherence transaction.
    pub fn permits(self, access: Access) -> bool {
        match access {
            Access::Read => self != PageState::Invalid,
            Access::Write => self == PageState::ExclusiveWrite,
        }
    }
}

/// Kind of memory access that trapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    /// A load.
    Read,
    /// A store.
    Write,
}

impl Access {
    /// Protection needed for this access to succeed.
    pub fn required_level(self) -> AccessLevel {
        match self {
            Access::Read => AccessLevel::Read,
            Access::Write => AccessLevel::ReadWrite,
        }
    }
}
