// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The coherence engine of one node.
//!
//! A [`Node`] plays two roles. As a *requester* it turns a local fault into a `Fetch` or
//! `Upgrade` transaction with the page's home node and installs the resulting grant. As a *home*
//! it runs those transactions against its [`Directory`], revoking access on the current holders
//! with `Downgrade`/`Invalidate`, and as a *holder* it answers such revocations.
//!
//! Locking: a locally initiated transaction holds the page's `txn` lock for its whole duration,
//! including the network round trip. Incoming revocations only take the page's `local` lock,
//! which is never held across a network call, so a node waiting on the directory can still be
//! revoked by it.

pub mod message;
mod page_table;

use std::sync::Arc;

use self::message::{CodecError, Grant, Request, Response, decode, encode};
use self::page_table::{LocalPage, PageSlot, PageTable};
use crate::config::{ConfigError, NodeConfig};
use crate::directory::{Directory, DirectoryError, Transaction};
use crate::fault::FaultEvent;
use crate::metrics::NodeMetrics;
use crate::region::{Region, RegionError};
use crate::transport::Transport;
use crate::utils::lock;
use crate::{Access, AccessLevel, NodeId, PageIndex, PageState};

/// Reasons to drop an incoming message without acting on it.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum Violation {
    /// Page {0} does not exist
    UnknownPage(PageIndex),
    /// Node {0} is not a member of the cluster
    UnknownNode(NodeId),
    /// {0}
    Directory(#[from] DirectoryError),
    /// Stale transaction {seq} for page {page}, already saw {seen}
    Stale {
        /// Page concerned.
        page: PageIndex,
        /// Transaction carried by the message.
        seq: u64,
        /// Highest transaction seen for the page.
        seen: u64,
    },
    /// Grant for page {0} carries {1} bytes instead of a page
    PageSize(PageIndex, usize),
    /// Unexpected answer to a {0} request
    UnexpectedResponse(&'static str),
    /// {0}
    Malformed(#[from] CodecError),
}

/// Errors associated with coherence transactions.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ProtocolError {
    /// Node {0} did not answer in time
    Unreachable(NodeId),
    /// Protocol violation: {0}
    Violation(#[from] Violation),
    /// No node holds valid content of page {0}
    ContentLost(PageIndex),
    /// {0}
    Region(#[from] RegionError),
}

/// Errors associated with bringing up a node.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum NodeError {
    /// Invalid configuration: {0}
    Config(#[from] ConfigError),
    /// Cannot set up the shared region: {0}
    Region(#[from] RegionError),
}

/// One member of the cluster: its region, its page states and its share of the directory.
#[derive(Debug)]
pub struct Node {
    config: NodeConfig,
    region: Region,
    pages: PageTable,
    directory: Directory,
    transport: Arc<dyn Transport>,
    metrics: NodeMetrics,
}

impl Node {
    /// Reserves the region, grants the pages this node initially owns and seeds its directory.
    pub fn new(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Arc<Node>, NodeError> {
        config.validate()?;
        let cluster = &config.cluster;
        let owned =
            cluster
                .placement
                .initial_pages(config.node_index, cluster.num_pages, cluster.total_nodes);

        let region = Region::reserve(cluster.num_pages)?;
        for page in owned.clone() {
            region.grant(page, AccessLevel::ReadWrite)?;
        }
        let pages = PageTable::new(cluster.num_pages, |page| {
            if owned.contains(&page) {
                PageState::ExclusiveWrite
            } else {
                PageState::Invalid
            }
        });
        let directory = Directory::new(&config);

        log::info!(
            "Node {} of {} up: owns pages {:?}, {:?}, {:?}",
            config.node_index,
            cluster.total_nodes,
            owned,
            cluster.placement,
            cluster.topology
        );

        Ok(Arc::new(Node {
            config,
            region,
            pages,
            directory,
            transport,
            metrics: NodeMetrics::default(),
        }))
    }

    /// Index of this node.
    pub fn id(&self) -> NodeId {
        self.config.node_index
    }

    /// Setup contract of this node.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The local shared region.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// The part of the directory homed here.
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Counters of this node.
    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Coherence state of `page` on this node.
    pub fn page_state(&self, page: PageIndex) -> Option<PageState> {
        self.pages.slot(page).map(|slot| lock(&slot.local).state)
    }

    /// Directory version of the copy of `page` held here.
    pub fn page_version(&self, page: PageIndex) -> Option<u64> {
        self.pages.slot(page).map(|slot| lock(&slot.local).version)
    }

    /// Resolves a classified fault, retrying transactions that hit an unreachable peer as the
    /// retry policy allows.
    pub fn resolve_fault(&self, event: FaultEvent) -> Result<(), ProtocolError> {
        let retry = self.config.cluster.retry;
        let mut attempt = 1;
        loop {
            match self.acquire(event.page, event.access) {
                Ok(()) => {
                    self.metrics.faults_resolved.inc();
                    return Ok(());
                }
                Err(ProtocolError::Unreachable(peer)) if attempt < retry.attempts => {
                    log::warn!(
                        "Node {}: {:?} on page {} could not reach node {} (attempt {}/{})",
                        self.id(),
                        event.kind,
                        event.page,
                        peer,
                        attempt,
                        retry.attempts
                    );
                    self.metrics.retries.inc();
                    attempt += 1;
                    std::thread::sleep(retry.backoff());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Obtains at least the access `access` needs on `page`.
    ///
    /// On failure the page is left invalid locally and nothing is committed on this node.
    pub fn acquire(&self, page: PageIndex, access: Access) -> Result<(), ProtocolError> {
        let slot = self.slot(page)?;
        let _txn = lock(&slot.txn);
        loop {
            if lock(&slot.local).state.permits(access) {
                return Ok(());
            }
            let grant = match self.request_grant(page, access) {
                Ok(grant) => grant,
                Err(err) => {
                    self.revert(page, slot)?;
                    return Err(err);
                }
            };
            if self.install(page, slot, grant, access)? {
                return Ok(());
            }
            self.metrics.stale_grants.inc();
            log::debug!(
                "Node {}: grant for page {} overtaken by a later revocation, asking again",
                self.id(),
                page
            );
        }
    }

    /// Copies out `page`, fetching a shared copy first if needed.
    pub fn read_page(&self, page: PageIndex) -> Result<Vec<u8>, ProtocolError> {
        self.with_access(page, Access::Read, || self.region.read_page(page))
    }

    /// Stores `data` at `offset` inside `page`, acquiring exclusive access first if needed.
    pub fn write_bytes(
        &self,
        page: PageIndex,
        offset: usize,
        data: &[u8],
    ) -> Result<(), ProtocolError> {
        self.with_access(page, Access::Write, || {
            self.region.write_bytes(page, offset, data)
        })
    }

    /// Handles a request from another node, or from this node when it is the home of a page it
    /// faulted on.
    pub fn handle_request(&self, request: Request) -> Result<Response, ProtocolError> {
        log::debug!("Node {} handling {:?}", self.id(), request);
        let result = self.dispatch(request);
        if let Err(ProtocolError::Violation(violation)) = &result {
            self.metrics.protocol_violations.inc();
            log::warn!("Node {} dropped a message: {}", self.id(), violation);
        }
        result
    }

    /// Decodes a request, handles it and encodes the response.
    pub fn handle_message(&self, bytes: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let request = match decode::<Request>(bytes) {
            Ok(request) => request,
            Err(err) => {
                self.metrics.protocol_violations.inc();
                log::warn!("Node {} dropped an undecodable message: {}", self.id(), err);
                return Err(Violation::Malformed(err).into());
            }
        };
        let response = self.handle_request(request)?;
        Ok(encode(&response).map_err(Violation::Malformed)?)
    }

    fn dispatch(&self, request: Request) -> Result<Response, ProtocolError> {
        let page = request.page();
        if page >= self.region.num_pages() {
            return Err(Violation::UnknownPage(page).into());
        }
        match request {
            Request::Fetch { page, requester } => {
                self.check_member(requester)?;
                self.serve_fetch(page, requester)
            }
            Request::Upgrade { page, requester } => {
                self.check_member(requester)?;
                self.serve_upgrade(page, requester)
            }
            Request::Downgrade {
                page,
                requester,
                seq,
            } => {
                self.check_member(requester)?;
                self.downgrade(page, seq)
            }
            Request::Invalidate {
                page,
                new_owner,
                seq,
            } => {
                self.check_member(new_owner)?;
                self.invalidate(page, seq)
            }
        }
    }

    fn check_member(&self, node: NodeId) -> Result<(), Violation> {
        if node >= self.config.cluster.total_nodes {
            return Err(Violation::UnknownNode(node));
        }
        Ok(())
    }

    fn slot(&self, page: PageIndex) -> Result<&PageSlot, Violation> {
        self.pages.slot(page).ok_or(Violation::UnknownPage(page))
    }

    fn with_access<T>(
        &self,
        page: PageIndex,
        access: Access,
        op: impl Fn() -> Result<T, RegionError>,
    ) -> Result<T, ProtocolError> {
        let slot = self.slot(page)?;
        loop {
            self.acquire(page, access)?;
            let local = lock(&slot.local);
            // A revocation may slip in between acquiring and taking the lock.
            if local.state.permits(access) {
                return Ok(op()?);
            }
        }
    }

    /// Sends `request` to `to`, short-circuiting requests addressed to this node.
    fn deliver(&self, to: NodeId, request: Request) -> Result<Response, ProtocolError> {
        if to == self.id() {
            return self.handle_request(request);
        }
        let timeout = self.config.cluster.request_timeout();
        self.transport
            .call(to, &request, timeout)
            .map_err(|err| {
                self.metrics.timeouts.inc();
                log::warn!(
                    "Node {}: {} for page {} to node {} failed: {}",
                    self.id(),
                    request.name(),
                    request.page(),
                    to,
                    err
                );
                ProtocolError::Unreachable(to)
            })
    }

    // Requester side.

    fn request_grant(&self, page: PageIndex, access: Access) -> Result<Grant, ProtocolError> {
        let home = self.directory.home_of(page);
        let requester = self.id();
        let request = match access {
            Access::Read => {
                self.metrics.fetches.inc();
                Request::Fetch { page, requester }
            }
            Access::Write => {
                self.metrics.upgrades.inc();
                Request::Upgrade { page, requester }
            }
        };
        let name = request.name();
        log::debug!("Node {} sends {} for page {} to node {}", requester, name, page, home);

        match (access, self.deliver(home, request)?) {
            (Access::Read, Response::Fetch(grant)) | (Access::Write, Response::Upgrade(grant)) => {
                Ok(grant)
            }
            (_, Response::Unreachable { peer }) => Err(ProtocolError::Unreachable(peer)),
            _ => Err(Violation::UnexpectedResponse(name).into()),
        }
    }

    /// Installs `grant`. Returns whether the installed state permits `access`.
    fn install(
        &self,
        page: PageIndex,
        slot: &PageSlot,
        grant: Grant,
        access: Access,
    ) -> Result<bool, ProtocolError> {
        match grant.bytes.as_ref().map(Vec::len) {
            Some(len) if len != self.region.page_size() => {
                self.revert(page, slot)?;
                return Err(Violation::PageSize(page, len).into());
            }
            _ => (),
        }
        let wanted = PageState::from_access_level(access.required_level());

        let mut local = lock(&slot.local);
        let state = local.admit(grant.seq, wanted);
        if state == PageState::Invalid {
            return Ok(false);
        }
        let keep_local = grant.keep_local && local.writer && local.version == grant.version;
        match grant.bytes {
            _ if keep_local => self.region.grant(page, state.access_level())?,
            Some(bytes) => {
                self.region
                    .write_page(page, &bytes, state.access_level())?;
                local.writer = false;
            }
            None => {
                self.region.grant(page, AccessLevel::None)?;
                local.state = PageState::Invalid;
                return Err(ProtocolError::ContentLost(page));
            }
        }
        if state == PageState::ExclusiveWrite {
            local.writer = true;
        }
        local.state = state;
        local.version = grant.version;
        log::debug!(
            "Node {} installed page {} as {:?} at version {}",
            self.id(),
            page,
            state,
            grant.version
        );
        Ok(state.permits(access))
    }

    fn revert(&self, page: PageIndex, slot: &PageSlot) -> Result<(), ProtocolError> {
        let mut local = lock(&slot.local);
        self.region.grant(page, AccessLevel::None)?;
        local.state = PageState::Invalid;
        Ok(())
    }

    // Home side.

    fn serve_fetch(&self, page: PageIndex, requester: NodeId) -> Result<Response, ProtocolError> {
        let txn = self.directory.begin(page).map_err(Violation::from)?;
        self.metrics.transactions_served.inc();
        let entry = txn.entry();

        let bytes = match entry.owner {
            Some(owner) if owner == requester => txn.committed(),
            Some(owner) if entry.owner_may_write() => {
                let request = Request::Downgrade {
                    page,
                    requester,
                    seq: txn.seq(),
                };
                match self.deliver(owner, request) {
                    Ok(Response::DowngradeAck { bytes, version }) => {
                        Some(self.collect(&txn, entry.version, bytes, version)?)
                    }
                    Ok(_) => return Err(Violation::UnexpectedResponse("downgrade").into()),
                    Err(ProtocolError::Unreachable(peer)) => {
                        return Ok(Response::Unreachable { peer });
                    }
                    Err(err) => return Err(err),
                }
            }
            Some(_) => Some(txn.committed().ok_or(ProtocolError::ContentLost(page))?),
            None => Some(vec![0; self.region.page_size()]),
        };

        let version = txn.record_fetch(requester);
        log::debug!(
            "Node {} granted page {} shared to node {} (txn {})",
            self.id(),
            page,
            requester,
            txn.seq()
        );
        Ok(Response::Fetch(Grant {
            bytes,
            keep_local: entry.owner == Some(requester),
            version,
            seq: txn.seq(),
        }))
    }

    fn serve_upgrade(
        &self,
        page: PageIndex,
        requester: NodeId,
    ) -> Result<Response, ProtocolError> {
        let txn = self.directory.begin(page).map_err(Violation::from)?;
        self.metrics.transactions_served.inc();
        let entry = txn.entry();
        let invalidate = Request::Invalidate {
            page,
            new_owner: requester,
            seq: txn.seq(),
        };

        for &sharer in entry.sharers.iter().filter(|&&sharer| sharer != requester) {
            match self.deliver(sharer, invalidate.clone()) {
                // A sharer's content is never newer than the owner's.
                Ok(Response::InvalidateAck { .. }) => txn.remove_sharer(sharer),
                Ok(_) => return Err(Violation::UnexpectedResponse("invalidate").into()),
                Err(ProtocolError::Unreachable(peer)) => {
                    return Ok(Response::Unreachable { peer });
                }
                Err(err) => return Err(err),
            }
        }

        let keep_local = entry.owner == Some(requester);
        let bytes = match entry.owner {
            Some(owner) if owner == requester => txn.committed(),
            Some(owner) => match self.deliver(owner, invalidate) {
                Ok(Response::InvalidateAck { bytes, version }) => {
                    Some(self.collect(&txn, entry.version, bytes, version)?)
                }
                Ok(_) => return Err(Violation::UnexpectedResponse("invalidate").into()),
                Err(ProtocolError::Unreachable(peer)) => {
                    return Ok(Response::Unreachable { peer });
                }
                Err(err) => return Err(err),
            },
            None => {
                let zero = vec![0; self.region.page_size()];
                txn.set_committed(zero.clone());
                Some(zero)
            }
        };

        let version = txn.record_upgrade(requester);
        log::debug!(
            "Node {} made node {} owner of page {} at version {} (txn {})",
            self.id(),
            requester,
            page,
            version,
            txn.seq()
        );
        Ok(Response::Upgrade(Grant {
            bytes,
            keep_local,
            version,
            seq: txn.seq(),
        }))
    }

    /// Content returned by the revoked owner if it belongs to the `current` version, otherwise
    /// the committed copy.
    fn collect(
        &self,
        txn: &Transaction<'_>,
        current: u64,
        bytes: Option<Vec<u8>>,
        version: u64,
    ) -> Result<Vec<u8>, ProtocolError> {
        match bytes {
            Some(bytes) if bytes.len() != self.region.page_size() => {
                Err(Violation::PageSize(txn.page(), bytes.len()).into())
            }
            Some(bytes) if version == current => {
                txn.set_committed(bytes.clone());
                Ok(bytes)
            }
            held => {
                if held.is_some() {
                    log::debug!(
                        "Node {}: ignoring content of page {} at version {}, directory is at {}",
                        self.id(),
                        txn.page(),
                        version,
                        current
                    );
                }
                txn.committed()
                    .ok_or(ProtocolError::ContentLost(txn.page()))
            }
        }
    }

    // Holder side.

    fn downgrade(&self, page: PageIndex, seq: u64) -> Result<Response, ProtocolError> {
        let slot = self.slot(page)?;
        let mut local = lock(&slot.local);
        if local.is_stale(seq) {
            return Err(Violation::Stale {
                page,
                seq,
                seen: local.seen_seq,
            }
            .into());
        }
        local.revoke(seq, PageState::SharedRead);

        if local.state == PageState::ExclusiveWrite {
            // Write-protect first so that no store lands after the copy.
            self.region.grant(page, AccessLevel::Read)?;
            local.state = PageState::SharedRead;
        }
        let bytes = self.handed_back(page, &local)?;
        self.metrics.downgrades_served.inc();
        log::debug!("Node {} downgraded page {} (txn {})", self.id(), page, seq);
        Ok(Response::DowngradeAck {
            bytes,
            version: local.version,
        })
    }

    fn invalidate(&self, page: PageIndex, seq: u64) -> Result<Response, ProtocolError> {
        let slot = self.slot(page)?;
        let mut local = lock(&slot.local);
        if local.is_stale(seq) {
            return Err(Violation::Stale {
                page,
                seq,
                seen: local.seen_seq,
            }
            .into());
        }
        local.revoke(seq, PageState::Invalid);

        self.region.grant(page, AccessLevel::None)?;
        local.state = PageState::Invalid;
        let bytes = self.handed_back(page, &local)?;
        self.metrics.invalidations_served.inc();
        log::debug!("Node {} invalidated page {} (txn {})", self.id(), page, seq);
        Ok(Response::InvalidateAck {
            bytes,
            version: local.version,
        })
    }

    /// Content a revoked holder answers with: what it wrote as owner, even if an earlier answer
    /// carrying it never made it back to the home.
    fn handed_back(
        &self,
        page: PageIndex,
        local: &LocalPage,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        if !local.writer {
            return Ok(None);
        }
        Ok(Some(self.region.retained_page(page)?))
    }
}
