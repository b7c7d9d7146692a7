// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Turns protection faults inside a node's region into coherence transactions.
//!
//! The signal handler in [`handler`] does as little as possible: it classifies the fault from
//! the region's protection record, writes a fixed-size [`FaultRecord`] into the pipe of one of
//! the node's fault workers and sleeps on a futex. The worker runs the coherence engine, which
//! may block on the network, and then wakes the faulting thread, which retries its access.

mod handler;

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

use vmm_sys_util::syscall::SyscallReturnCode;

use crate::protocol::Node;
use crate::region::{ProtectionQuery, Region};
use crate::utils::{u64_to_usize, usize_to_u64};
use crate::{Access, AccessLevel, PageIndex};

/// Errors associated with fault interception.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum FaultError {
    /// Address {0:#x} is outside the shared region
    OutOfRegion(usize),
    /// Fault on page {0} is already satisfied by its current access level
    Spurious(PageIndex),
    /// Cannot install fault handler: {0}
    Install(std::io::Error),
    /// Cannot create fault pipe: {0}
    Pipe(std::io::Error),
    /// Cannot spawn fault worker: {0}
    Worker(std::io::Error),
    /// Every fault interception slot of this process is in use
    Registry,
}

/// Why a page has to be negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultKind {
    /// The page has no local access at all.
    Miss = 0,
    /// The page is readable and a store trapped.
    Upgrade = 1,
}

/// A classified fault, ready for the coherence engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    /// Faulting page.
    pub page: PageIndex,
    /// Access to obtain.
    pub access: Access,
    /// Branch the fault takes.
    pub kind: FaultKind,
}

/// Decides what a fault on a page at `level` needs. `attempted` is `None` when the hardware does
/// not report whether the access was a store.
///
/// Returns `None` when the current level already allows the access, which happens when another
/// thread resolved the page in the meantime.
pub fn classify_level(level: AccessLevel, attempted: Option<Access>) -> Option<FaultEvent> {
    let (access, kind) = match (level, attempted) {
        (AccessLevel::None, Some(Access::Write)) => (Access::Write, FaultKind::Miss),
        (AccessLevel::None, _) => (Access::Read, FaultKind::Miss),
        (AccessLevel::Read, Some(Access::Read)) => return None,
        (AccessLevel::Read, _) => (Access::Write, FaultKind::Upgrade),
        (AccessLevel::ReadWrite, _) => return None,
    };
    Some(FaultEvent {
        page: 0,
        access,
        kind,
    })
}

/// Classifies a fault at `addr` against `region`.
pub fn classify(
    region: &Region,
    addr: usize,
    attempted: Option<Access>,
) -> Result<FaultEvent, FaultError> {
    let page = region
        .page_index_of(addr)
        .map_err(|_| FaultError::OutOfRegion(addr))?;
    let level = region
        .protection(page)
        .map_err(|_| FaultError::OutOfRegion(addr))?;
    classify_level(level, attempted)
        .map(|event| FaultEvent { page, ..event })
        .ok_or(FaultError::Spurious(page))
}

/// Size of a [`FaultRecord`] on the wire, far below `PIPE_BUF`.
const RECORD_SIZE: usize = 24;

/// What the signal handler hands to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FaultRecord {
    page: u64,
    access: Access,
    kind: FaultKind,
    /// Address of the futex word the faulting thread sleeps on.
    done: usize,
}

impl FaultRecord {
    fn to_bytes(self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0..8].copy_from_slice(&self.page.to_ne_bytes());
        bytes[8] = match self.access {
            Access::Read => 0,
            Access::Write => 1,
        };
        bytes[9] = self.kind as u8;
        bytes[16..24].copy_from_slice(&usize_to_u64(self.done).to_ne_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        let word = |range: std::ops::Range<usize>| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[range]);
            u64::from_ne_bytes(raw)
        };
        FaultRecord {
            page: word(0..8),
            access: if bytes[8] == 0 {
                Access::Read
            } else {
                Access::Write
            },
            kind: if bytes[9] == 0 {
                FaultKind::Miss
            } else {
                FaultKind::Upgrade
            },
            done: u64_to_usize(word(16..24)),
        }
    }

    fn event(&self) -> FaultEvent {
        FaultEvent {
            page: u64_to_usize(self.page),
            access: self.access,
            kind: self.kind,
        }
    }
}

/// Fault interception for one node.
///
/// While an `Interceptor` lives, loads and stores into the node's region that lack access are
/// resolved transparently. Dropping it stops interception for the region: later faults there are
/// treated like any fault outside a shared region.
#[derive(Debug)]
pub struct Interceptor {
    node: Arc<Node>,
    slot: usize,
    pipes: Vec<OwnedFd>,
    workers: Vec<JoinHandle<()>>,
}

impl Interceptor {
    /// Starts resolving faults in `node`'s region with `fault_workers` worker threads.
    pub fn install(node: Arc<Node>) -> Result<Self, FaultError> {
        handler::install_handlers()?;

        let count = node.config().cluster.fault_workers;
        let mut pipes = Vec::with_capacity(count);
        let mut readers = Vec::with_capacity(count);
        for _ in 0..count {
            let (reader, writer) = pipe()?;
            readers.push(reader);
            pipes.push(writer);
        }

        let mut workers = Vec::with_capacity(count);
        for (index, reader) in readers.into_iter().enumerate() {
            let worker_node = node.clone();
            let worker = std::thread::Builder::new()
                .name(format!("dsm-fault-{}.{}", node.id(), index))
                .spawn(move || run_worker(&worker_node, File::from(reader)))
                .map_err(FaultError::Worker)?;
            workers.push(worker);
        }

        let fds: Vec<_> = pipes.iter().map(AsRawFd::as_raw_fd).collect();
        let slot = handler::register(node.region(), &fds).ok_or(FaultError::Registry)?;
        log::info!(
            "Node {}: intercepting faults in {:#x}..{:#x} with {} workers",
            node.id(),
            node.region().base(),
            node.region().base() + node.region().len(),
            count
        );

        Ok(Interceptor {
            node,
            slot,
            pipes,
            workers,
        })
    }

    /// The node faults are resolved for.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        handler::unregister(self.slot);
        // Closing the write ends makes every worker see end-of-file.
        self.pipes.clear();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Node {}: fault worker panicked", self.node.id());
            }
        }
        log::info!("Node {}: fault interception stopped", self.node.id());
    }
}

fn pipe() -> Result<(OwnedFd, OwnedFd), FaultError> {
    let mut fds = [-1; 2];
    // SAFETY: `fds` has room for the two descriptors.
    SyscallReturnCode(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })
        .into_empty_result()
        .map_err(FaultError::Pipe)?;
    // SAFETY: Both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn run_worker(node: &Node, mut pipe: File) {
    let mut buf = [0u8; RECORD_SIZE];
    let mut last: Option<(FaultEvent, Option<u64>)> = None;
    loop {
        match pipe.read_exact(&mut buf) {
            Ok(()) => (),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                log::error!("Node {}: cannot read fault record: {}", node.id(), err);
                std::process::abort();
            }
        }
        let record = FaultRecord::from_bytes(&buf);
        let event = record.event();
        let version = node.page_version(event.page);
        if last == Some((event, version)) {
            log::warn!(
                "Node {}: page {} faulted again for {:?} with no ownership change",
                node.id(),
                event.page,
                event.access
            );
        }

        if let Err(err) = node.resolve_fault(event) {
            log::error!(
                "Node {}: cannot resolve {:?} on page {}: {}",
                node.id(),
                event.kind,
                event.page,
                err
            );
            std::process::abort();
        }
        last = Some((event, node.page_version(event.page)));

        // SAFETY: The faulting thread sleeps on this word until it is set, so it is alive.
        let done = unsafe { &*(record.done as *const AtomicU32) };
        done.store(1, Ordering::Release);
        handler::futex_wake(done);
    }
}
