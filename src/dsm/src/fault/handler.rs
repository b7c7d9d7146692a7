// Copyright 2026 The DSM Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The process-wide `SIGSEGV`/`SIGBUS` handler.
//!
//! Nothing in here may allocate, lock or log: the handler runs on whatever thread faulted, in
//! the middle of whatever that thread was doing. Regions are published in a fixed-size table of
//! atomics, and a faulting thread hands its fault to a worker with `write(2)` and sleeps on a
//! futex until the worker is done.

use std::os::fd::RawFd;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering,
};
use std::sync::{Mutex, OnceLock};

use super::{FaultError, FaultRecord, RECORD_SIZE, classify_level};
use crate::config::MAX_FAULT_WORKERS;
use crate::region::Region;
use crate::utils::{lock, usize_to_u64};
use crate::{Access, AccessLevel};

/// Regions that can be intercepted at the same time in one process.
const MAX_REGIONS: usize = 64;

/// Published description of one intercepted region.
struct RegistrySlot {
    claimed: AtomicBool,
    active: AtomicBool,
    /// Handlers currently reading this slot.
    inflight: AtomicUsize,
    base: AtomicUsize,
    len: AtomicUsize,
    page_shift: AtomicU32,
    levels: AtomicPtr<AtomicU8>,
    workers: AtomicUsize,
    pipes: [AtomicI32; MAX_FAULT_WORKERS],
}

impl RegistrySlot {
    const fn new() -> Self {
        RegistrySlot {
            claimed: AtomicBool::new(false),
            active: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            base: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            page_shift: AtomicU32::new(0),
            levels: AtomicPtr::new(std::ptr::null_mut()),
            workers: AtomicUsize::new(0),
            pipes: [const { AtomicI32::new(-1) }; MAX_FAULT_WORKERS],
        }
    }
}

static REGISTRY: [RegistrySlot; MAX_REGIONS] = [const { RegistrySlot::new() }; MAX_REGIONS];

/// Dispositions in place before ours, for faults that are not ours.
#[derive(Clone, Copy)]
struct PreviousActions {
    segv: libc::sigaction,
    bus: libc::sigaction,
}

static PREVIOUS: OnceLock<PreviousActions> = OnceLock::new();
static INSTALL: Mutex<()> = Mutex::new(());

/// Installs the handler for `SIGSEGV` and `SIGBUS`, once per process.
pub(super) fn install_handlers() -> Result<(), FaultError> {
    let _guard = lock(&INSTALL);
    if PREVIOUS.get().is_some() {
        return Ok(());
    }
    // Record the old dispositions before ours can run.
    let previous = PreviousActions {
        segv: query_action(libc::SIGSEGV)?,
        bus: query_action(libc::SIGBUS)?,
    };
    let _ = PREVIOUS.set(previous);

    // SAFETY: An all-zero sigaction is a valid value to start from.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handle_signal
        as extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)
        as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    // SAFETY: `sa_mask` is a valid signal set owned by `action`.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    for signal in [libc::SIGSEGV, libc::SIGBUS] {
        // SAFETY: `action` is fully initialized and the handler has the signature `SA_SIGINFO`
        // requires.
        if unsafe { libc::sigaction(signal, &action, std::ptr::null_mut()) } != 0 {
            return Err(FaultError::Install(std::io::Error::last_os_error()));
        }
    }
    log::info!("Installed SIGSEGV/SIGBUS handler");
    Ok(())
}

fn query_action(signal: libc::c_int) -> Result<libc::sigaction, FaultError> {
    // SAFETY: An all-zero sigaction is a valid value to be overwritten.
    let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: A null new action only queries the current disposition into `old`.
    if unsafe { libc::sigaction(signal, std::ptr::null(), &mut old) } != 0 {
        return Err(FaultError::Install(std::io::Error::last_os_error()));
    }
    Ok(old)
}

/// Publishes `region`, whose faults go to the workers reading from `pipes`. Returns the slot, or
/// `None` if the table is full.
pub(super) fn register(region: &Region, pipes: &[RawFd]) -> Option<usize> {
    let index = REGISTRY.iter().position(|slot| {
        slot.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    })?;
    let slot = &REGISTRY[index];
    slot.base.store(region.base(), Ordering::SeqCst);
    slot.len.store(region.len(), Ordering::SeqCst);
    slot.page_shift.store(region.page_shift(), Ordering::SeqCst);
    slot.levels
        .store(region.levels().as_ptr().cast_mut(), Ordering::SeqCst);
    for (pipe, &fd) in slot.pipes.iter().zip(pipes) {
        pipe.store(fd, Ordering::SeqCst);
    }
    slot.workers
        .store(pipes.len().min(MAX_FAULT_WORKERS), Ordering::SeqCst);
    slot.active.store(true, Ordering::SeqCst);
    Some(index)
}

/// Withdraws a slot. Once this returns no handler reads it any more.
pub(super) fn unregister(index: usize) {
    let slot = &REGISTRY[index];
    slot.active.store(false, Ordering::SeqCst);
    while slot.inflight.load(Ordering::SeqCst) != 0 {
        std::thread::yield_now();
    }
    for pipe in &slot.pipes {
        pipe.store(-1, Ordering::SeqCst);
    }
    slot.levels.store(std::ptr::null_mut(), Ordering::SeqCst);
    slot.claimed.store(false, Ordering::SeqCst);
}

fn futex_wait(word: &AtomicU32, expected: u32) {
    // SAFETY: `word` is a valid, aligned futex word for the duration of the call.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
        );
    }
}

pub(super) fn futex_wake(word: &AtomicU32) {
    // SAFETY: Waking never dereferences anything but the futex word's address.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            i32::MAX,
        );
    }
}

extern "C" fn handle_signal(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    // SAFETY: errno is thread-local and always addressable.
    let errno = unsafe { *libc::__errno_location() };
    // SAFETY: The kernel passes a valid siginfo for SA_SIGINFO handlers.
    let addr = unsafe { (*info).si_addr() } as usize;

    if !dispatch(signal, addr, context) {
        chain(signal, info, context);
    }

    // SAFETY: See above.
    unsafe { *libc::__errno_location() = errno };
}

/// Resolves the fault if `addr` is in a registered region. Returns whether it was ours.
fn dispatch(signal: libc::c_int, addr: usize, context: *mut libc::c_void) -> bool {
    for slot in &REGISTRY {
        if !slot.active.load(Ordering::SeqCst) {
            continue;
        }
        slot.inflight.fetch_add(1, Ordering::SeqCst);
        let base = slot.base.load(Ordering::SeqCst);
        let ours = slot.active.load(Ordering::SeqCst)
            && addr >= base
            && addr - base < slot.len.load(Ordering::SeqCst);
        if ours {
            resolve(slot, addr - base, attempted_access(signal, context));
        }
        slot.inflight.fetch_sub(1, Ordering::SeqCst);
        if ours {
            return true;
        }
    }
    false
}

fn resolve(slot: &RegistrySlot, offset: usize, attempted: Option<Access>) {
    let page = offset >> slot.page_shift.load(Ordering::SeqCst);
    let levels = slot.levels.load(Ordering::SeqCst);
    // SAFETY: The levels table outlives the registration, which `inflight` keeps alive, and has
    // one entry per page of the region.
    let level = AccessLevel::from_raw(unsafe { &*levels.add(page) }.load(Ordering::Acquire));
    let Some(event) = classify_level(level, attempted) else {
        // Resolved by someone else since the fault; retry the access.
        return;
    };

    let workers = slot.workers.load(Ordering::SeqCst).max(1);
    let fd = slot.pipes[page % workers].load(Ordering::SeqCst);
    let done = AtomicU32::new(0);
    let record = FaultRecord {
        page: usize_to_u64(page),
        access: event.access,
        kind: event.kind,
        done: std::ptr::from_ref(&done) as usize,
    }
    .to_bytes();

    loop {
        // SAFETY: `record` is a live buffer of RECORD_SIZE bytes.
        let written = unsafe { libc::write(fd, record.as_ptr().cast(), RECORD_SIZE) };
        if usize::try_from(written) == Ok(RECORD_SIZE) {
            break;
        }
        // SAFETY: errno is thread-local.
        if written < 0 && unsafe { *libc::__errno_location() } == libc::EINTR {
            continue;
        }
        // No worker to hand the fault to: the access can never succeed.
        // SAFETY: abort is async-signal-safe.
        unsafe { libc::abort() };
    }

    while done.load(Ordering::Acquire) == 0 {
        futex_wait(&done, 0);
    }
}

/// Whether the trapping access was a store, where the hardware tells.
#[cfg(target_arch = "x86_64")]
#[allow(clippy::cast_sign_loss)]
fn attempted_access(signal: libc::c_int, context: *mut libc::c_void) -> Option<Access> {
    const PF_WRITE: libc::greg_t = 0x2;
    if signal != libc::SIGSEGV || context.is_null() {
        return None;
    }
    // SAFETY: The kernel passes a valid ucontext for SA_SIGINFO handlers.
    let err = unsafe {
        (*context.cast::<libc::ucontext_t>()).uc_mcontext.gregs[libc::REG_ERR as usize]
    };
    Some(if err & PF_WRITE != 0 {
        Access::Write
    } else {
        Access::Read
    })
}

#[cfg(not(target_arch = "x86_64"))]
fn attempted_access(_signal: libc::c_int, _context: *mut libc::c_void) -> Option<Access> {
    None
}

/// Hands a fault that is not ours to whoever handled it before us.
fn chain(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let previous = PREVIOUS.get().map(|previous| match signal {
        libc::SIGBUS => previous.bus,
        _ => previous.segv,
    });
    match previous {
        Some(action)
            if action.sa_sigaction != libc::SIG_DFL && action.sa_sigaction != libc::SIG_IGN =>
        {
            if action.sa_flags & libc::SA_SIGINFO != 0 {
                // SAFETY: With SA_SIGINFO the previous handler has this signature.
                let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                    unsafe { std::mem::transmute(action.sa_sigaction) };
                handler(signal, info, context);
            } else {
                // SAFETY: Without SA_SIGINFO the previous handler takes only the signal number.
                let handler: extern "C" fn(libc::c_int) =
                    unsafe { std::mem::transmute(action.sa_sigaction) };
                handler(signal);
            }
        }
        _ => {
            // Restore the default disposition; the access traps again and terminates the process.
            // SAFETY: An all-zero sigaction with SIG_DFL is a valid disposition.
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigaction(signal, &action, std::ptr::null_mut());
            }
        }
    }
}
