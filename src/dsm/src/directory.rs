// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-page ownership records kept by a page's home node.
//!
//! Transactions on one page are strictly serialized in arrival order: a transaction holds the
//! page's ticket gate from [`Directory::begin`] until it is dropped, across every network round
//! trip it makes. Transactions on different pages never wait for each other.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};

use crate::config::{NodeConfig, Topology};
use crate::utils::lock;
use crate::{NodeId, PageIndex};

/// Errors associated with the directory.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DirectoryError {
    /// Page {0} is homed on node {1}, not here
    NotHome(PageIndex, NodeId),
    /// Page {0} is out of range
    PageIndex(PageIndex),
}

/// Directory record of one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Node entitled to write, or that last held write access.
    pub owner: Option<NodeId>,
    /// Nodes holding a read-only copy, excluding the owner.
    pub sharers: BTreeSet<NodeId>,
    /// Incremented on every ownership change.
    pub version: u64,
}

impl DirectoryEntry {
    /// Adds `requester` to the sharers.
    pub fn record_fetch(&mut self, requester: NodeId) {
        if self.owner != Some(requester) {
            self.sharers.insert(requester);
        }
    }

    /// Makes `requester` the sole owner. The version only moves when the owner changes: an owner
    /// taking write access back keeps writing the same content.
    pub fn record_upgrade(&mut self, requester: NodeId) {
        self.sharers.clear();
        if self.owner != Some(requester) {
            self.owner = Some(requester);
            self.version += 1;
        }
    }

    /// Whether the owner may currently hold write access, which is the case until some other
    /// node has been handed a shared copy.
    pub fn owner_may_write(&self) -> bool {
        self.owner.is_some() && self.sharers.is_empty()
    }
}

#[derive(Debug, Default)]
struct Tickets {
    next: u64,
    serving: u64,
}

/// FIFO mutual exclusion: whoever called [`TicketGate::enter`] first goes first.
#[derive(Debug, Default)]
struct TicketGate {
    tickets: Mutex<Tickets>,
    turn: Condvar,
}

impl TicketGate {
    fn enter(&self) -> GateGuard<'_> {
        let mut tickets = lock(&self.tickets);
        let ticket = tickets.next;
        tickets.next += 1;
        while tickets.serving != ticket {
            tickets = self
                .turn
                .wait(tickets)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        GateGuard { gate: self }
    }
}

#[derive(Debug)]
struct GateGuard<'a> {
    gate: &'a TicketGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        lock(&self.gate.tickets).serving += 1;
        self.gate.turn.notify_all();
    }
}

#[derive(Debug, Default)]
struct SlotState {
    entry: DirectoryEntry,
    seq: u64,
    committed: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Slot {
    gate: TicketGate,
    state: Mutex<SlotState>,
}

/// The part of the cluster directory homed on this node.
#[derive(Debug)]
pub struct Directory {
    node: NodeId,
    num_pages: usize,
    total_nodes: usize,
    topology: Topology,
    slots: Box<[Option<Slot>]>,
}

impl Directory {
    /// Creates the directory of `config.node_index`, seeded with the initial placement of every
    /// page homed here.
    pub fn new(config: &NodeConfig) -> Self {
        let cluster = &config.cluster;
        let slots: Box<[Option<Slot>]> = (0..cluster.num_pages)
            .map(|page| {
                (config.home_of(page) == config.node_index).then(|| Slot {
                    gate: TicketGate::default(),
                    state: Mutex::new(SlotState {
                        entry: DirectoryEntry {
                            owner: Some(config.initial_owner(page)),
                            ..Default::default()
                        },
                        ..Default::default()
                    }),
                })
            })
            .collect();

        let homed = slots.iter().filter(|slot| slot.is_some()).count();
        log::info!(
            "Node {} seeded directory with {} of {} pages",
            config.node_index,
            homed,
            cluster.num_pages
        );

        Directory {
            node: config.node_index,
            num_pages: cluster.num_pages,
            total_nodes: cluster.total_nodes,
            topology: cluster.topology,
            slots,
        }
    }

    /// Home node of `page`.
    pub fn home_of(&self, page: PageIndex) -> NodeId {
        self.topology.home_of(page, self.num_pages, self.total_nodes)
    }

    /// Whether this node is the home of `page`.
    pub fn is_home(&self, page: PageIndex) -> bool {
        self.slots.get(page).is_some_and(Option::is_some)
    }

    /// Snapshot of the record of `page`.
    pub fn lookup(&self, page: PageIndex) -> Result<DirectoryEntry, DirectoryError> {
        Ok(lock(&self.slot(page)?.state).entry.clone())
    }

    /// Adds `requester` to the sharers of `page`, as its own transaction.
    pub fn record_fetch(&self, page: PageIndex, requester: NodeId) -> Result<(), DirectoryError> {
        self.begin(page)?.record_fetch(requester);
        Ok(())
    }

    /// Makes `requester` the owner of `page`, as its own transaction. Returns the new version.
    pub fn record_upgrade(
        &self,
        page: PageIndex,
        requester: NodeId,
    ) -> Result<u64, DirectoryError> {
        Ok(self.begin(page)?.record_upgrade(requester))
    }

    /// Waits for every earlier transaction on `page` to finish and starts a new one.
    pub fn begin(&self, page: PageIndex) -> Result<Transaction<'_>, DirectoryError> {
        let slot = self.slot(page)?;
        let gate = slot.gate.enter();
        let seq = {
            let mut state = lock(&slot.state);
            state.seq += 1;
            state.seq
        };
        Ok(Transaction {
            page,
            seq,
            state: &slot.state,
            _gate: gate,
        })
    }

    fn slot(&self, page: PageIndex) -> Result<&Slot, DirectoryError> {
        match self.slots.get(page) {
            None => Err(DirectoryError::PageIndex(page)),
            Some(None) => Err(DirectoryError::NotHome(page, self.home_of(page))),
            Some(Some(slot)) => Ok(slot),
        }
    }

    /// Node owning this directory.
    pub fn node(&self) -> NodeId {
        self.node
    }
}

/// Exclusive access to the record of one page. Dropping it lets the next transaction in.
#[derive(Debug)]
pub struct Transaction<'a> {
    page: PageIndex,
    seq: u64,
    state: &'a Mutex<SlotState>,
    _gate: GateGuard<'a>,
}

impl Transaction<'_> {
    /// Page this transaction works on.
    pub fn page(&self) -> PageIndex {
        self.page
    }

    /// Position of this transaction in the page's serialization order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Snapshot of the record.
    pub fn entry(&self) -> DirectoryEntry {
        lock(self.state).entry.clone()
    }

    /// Content most recently handed over through this directory.
    pub fn committed(&self) -> Option<Vec<u8>> {
        lock(self.state).committed.clone()
    }

    /// Remembers `bytes` as the latest content of the page.
    pub fn set_committed(&self, bytes: Vec<u8>) {
        lock(self.state).committed = Some(bytes);
    }

    /// Drops `node` from the sharers once it has been invalidated.
    pub fn remove_sharer(&self, node: NodeId) {
        lock(self.state).entry.sharers.remove(&node);
    }

    /// See [`DirectoryEntry::record_fetch`]. Returns the current version.
    pub fn record_fetch(&self, requester: NodeId) -> u64 {
        let mut state = lock(self.state);
        state.entry.record_fetch(requester);
        state.entry.version
    }

    /// See [`DirectoryEntry::record_upgrade`]. Returns the new version.
    pub fn record_upgrade(&self, requester: NodeId) -> u64 {
        let mut state = lock(self.state);
        state.entry.record_upgrade(requester);
        state.entry.version
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::{ClusterConfig, Placement};

    fn directory(node: NodeId, topology: Topology, placement: Placement) -> Directory {
        let mut cluster = ClusterConfig::new(4, 2);
        cluster.topology = topology;
        cluster.placement = placement;
        Directory::new(&cluster.for_node(node).unwrap())
    }

    #[test]
    fn test_seed_static_partitioned() {
        let dir = directory(1, Topology::StaticPartitioned, Placement::RangeSplit);
        assert!(!dir.is_home(0));
        assert!(dir.is_home(2));
        assert!(matches!(dir.lookup(0), Err(DirectoryError::NotHome(0, 0))));
        assert!(matches!(dir.lookup(4), Err(DirectoryError::PageIndex(4))));
        assert_eq!(
            dir.lookup(3).unwrap(),
            DirectoryEntry {
                owner: Some(1),
                sharers: BTreeSet::new(),
                version: 0
            }
        );
    }

    #[test]
    fn test_seed_centralized() {
        let dir = directory(
            0,
            Topology::Centralized { coordinator: 0 },
            Placement::RangeSplit,
        );
        assert!((0..4).all(|page| dir.is_home(page)));
        assert_eq!(dir.lookup(1).unwrap().owner, Some(0));
        assert_eq!(dir.lookup(2).unwrap().owner, Some(1));

        let dir = directory(
            1,
            Topology::Centralized { coordinator: 0 },
            Placement::RangeSplit,
        );
        assert!((0..4).all(|page| !dir.is_home(page)));

        let dir = directory(
            0,
            Topology::Centralized { coordinator: 0 },
            Placement::SingleOwner,
        );
        assert!((0..4).all(|page| dir.lookup(page).unwrap().owner == Some(0)));
    }

    #[test]
    fn test_record_fetch_and_upgrade() {
        let dir = directory(
            0,
            Topology::Centralized { coordinator: 0 },
            Placement::RangeSplit,
        );

        dir.record_fetch(2, 0).unwrap();
        // The owner is never listed as a sharer.
        dir.record_fetch(2, 1).unwrap();
        let entry = dir.lookup(2).unwrap();
        assert_eq!(entry.owner, Some(1));
        assert_eq!(entry.sharers, BTreeSet::from([0]));
        assert_eq!(entry.version, 0);
        assert!(!entry.owner_may_write());

        assert_eq!(dir.record_upgrade(2, 0).unwrap(), 1);
        let entry = dir.lookup(2).unwrap();
        assert_eq!(entry.owner, Some(0));
        assert!(entry.sharers.is_empty());
        assert!(entry.owner_may_write());

        dir.record_fetch(2, 1).unwrap();
        assert_eq!(dir.record_upgrade(2, 0).unwrap(), 1);
        assert!(dir.lookup(2).unwrap().sharers.is_empty());
    }

    #[test]
    fn test_transaction_sequence() {
        let dir = directory(
            0,
            Topology::Centralized { coordinator: 0 },
            Placement::RangeSplit,
        );
        let first = dir.begin(1).unwrap().seq();
        let second = dir.begin(1).unwrap().seq();
        assert!(second > first);
        // Pages are sequenced independently.
        assert_eq!(dir.begin(3).unwrap().seq(), 1);
    }

    #[test]
    fn test_transactions_are_fifo() {
        let dir = Arc::new(directory(
            0,
            Topology::Centralized { coordinator: 0 },
            Placement::RangeSplit,
        ));
        let order = Arc::new(Mutex::new(Vec::new()));

        let txn = dir.begin(0).unwrap();
        let mut handles = Vec::new();
        for requester in 1..4 {
            let dir = dir.clone();
            let order = order.clone();
            handles.push(std::thread::spawn(move || {
                let txn = dir.begin(0).unwrap();
                order.lock().unwrap().push((requester, txn.seq()));
                txn.record_upgrade(requester % 2);
            }));
            // Give each thread time to queue up behind the previous one.
            std::thread::sleep(Duration::from_millis(20));
        }
        drop(txn);
        for handle in handles {
            handle.join().unwrap();
        }

        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec![(1, 2), (2, 3), (3, 4)]);
        assert_eq!(dir.lookup(0).unwrap().version, 3);
    }

    #[test]
    fn test_committed_copy() {
        let dir = directory(
            0,
            Topology::Centralized { coordinator: 0 },
            Placement::RangeSplit,
        );
        let txn = dir.begin(0).unwrap();
        assert_eq!(txn.committed(), None);
        txn.set_committed(vec![7; 4]);
        drop(txn);
        assert_eq!(dir.begin(0).unwrap().committed(), Some(vec![7; 4]));
    }
}
