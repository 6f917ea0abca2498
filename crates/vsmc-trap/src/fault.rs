//! Page-fault backend for Linux x86-64.
//!
//! The window is a real anonymous mapping with per-region protections. A
//! host access that the protection map forbids raises SIGSEGV; the handler
//! classifies the access through `REG_ERR`, lifts the page to read-write,
//! runs `pre_read` for loads, and sets the trap flag so the faulting
//! instruction replays and completes. The subsequent SIGTRAP runs
//! `post_write` for stores, restores the region protection and clears the
//! trap flag. The accessing code never knows the window is instrumented.
//!
//! Contract: one window per process, accesses from one thread, and the
//! observer must not be borrowed while an access instruction executes. The
//! fault path does not allocate, and the hooks run in signal context:
//! [`crate::in_fault_context`] is set around each hook call so observer
//! code can skip diagnostics that would allocate or take a lock.

use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use libc::c_int;
use thiserror::Error;
use vsmc_types::mmio::{Protection, Region, PAGE_SIZE};

use crate::AccessObserver;

#[derive(Debug, Error)]
pub enum TrapError {
    #[error("a trapped window is already installed in this process")]
    AlreadyInstalled,
    #[error("window length {0:#x} is not page aligned")]
    UnalignedLength(usize),
    #[error("region at {0:#x} (len {1:#x}) is not page aligned or exceeds the window")]
    BadRegion(usize, usize),
    #[error("mmap failed (errno {0})")]
    Mmap(i32),
    #[error("mprotect failed (errno {0})")]
    Mprotect(i32),
    #[error("sigaction failed (errno {0})")]
    Sigaction(i32),
}

/// Page-fault error code bit 1: the faulting access was a write.
const ERR_WRITE: i64 = 0x2;
/// x86 trap flag, bit 8 of EFLAGS.
const EFLAGS_TF: i64 = 0x100;

struct PendingFault {
    offset: usize,
    page: usize,
    write: bool,
}

struct TrapState {
    base: usize,
    len: usize,
    regions: Vec<Region>,
    observer: Box<dyn AccessObserver>,
    pending: Option<PendingFault>,
    old_segv: libc::sigaction,
    old_trap: libc::sigaction,
}

static INSTALLED: AtomicBool = AtomicBool::new(false);
static STATE: AtomicPtr<TrapState> = AtomicPtr::new(ptr::null_mut());

fn protection_of(regions: &[Region], offset: usize) -> c_int {
    for region in regions {
        if offset >= region.start && offset < region.start + region.len {
            return match region.prot {
                Protection::None => libc::PROT_NONE,
                Protection::ReadOnly => libc::PROT_READ,
            };
        }
    }
    libc::PROT_READ | libc::PROT_WRITE
}

/// Async-signal-safe bailout. The fault path cannot return an error to
/// anyone, and resuming after a handler bug would corrupt the window.
fn die(msg: &str) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const c_void, msg.len());
        libc::abort();
    }
}

unsafe extern "C" fn on_segv(signal: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let state = STATE.load(Ordering::Acquire);
    if state.is_null() {
        die("window fault with no trap state installed\n");
    }
    let state = &mut *state;
    let addr = (*info).si_addr() as usize;
    if addr < state.base || addr >= state.base + state.len {
        // Not our fault. Put the previous disposition back; the kernel
        // re-raises on return and the old handler (or default) takes it.
        libc::sigaction(signal, &state.old_segv, ptr::null_mut());
        return;
    }
    if state.pending.is_some() {
        die("nested fault inside the trapped window\n");
    }

    let uctx = &mut *(ctx as *mut libc::ucontext_t);
    let write = uctx.uc_mcontext.gregs[libc::REG_ERR as usize] & ERR_WRITE != 0;
    let offset = addr - state.base;
    let page = offset & !(PAGE_SIZE - 1);

    let rc = libc::mprotect(
        (state.base + page) as *mut c_void,
        PAGE_SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
    );
    if rc != 0 {
        die("mprotect lift failed in the fault path\n");
    }

    let window = slice::from_raw_parts_mut(state.base as *mut u8, state.len);
    if !write {
        // The instruction replays after this handler returns, so bytes
        // published here are exactly what the load observes.
        crate::set_fault_context(true);
        state.observer.pre_read(window, offset);
        crate::set_fault_context(false);
    }
    state.pending = Some(PendingFault { offset, page, write });
    uctx.uc_mcontext.gregs[libc::REG_EFL as usize] |= EFLAGS_TF;
}

unsafe extern "C" fn on_trap(signal: c_int, _info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let state = STATE.load(Ordering::Acquire);
    if state.is_null() {
        return;
    }
    let state = &mut *state;
    let Some(fault) = state.pending.take() else {
        // A single-step we did not request; hand it to the old handler.
        libc::sigaction(signal, &state.old_trap, ptr::null_mut());
        return;
    };

    if fault.write {
        let window = slice::from_raw_parts_mut(state.base as *mut u8, state.len);
        crate::set_fault_context(true);
        state.observer.post_write(window, fault.offset);
        crate::set_fault_context(false);
    }
    let rc = libc::mprotect(
        (state.base + fault.page) as *mut c_void,
        PAGE_SIZE,
        protection_of(&state.regions, fault.page),
    );
    if rc != 0 {
        die("mprotect restore failed in the fault path\n");
    }

    let uctx = &mut *(ctx as *mut libc::ucontext_t);
    uctx.uc_mcontext.gregs[libc::REG_EFL as usize] &= !EFLAGS_TF;
}

/// A protected mapping whose forbidden accesses run the observer hooks
/// transparently.
pub struct TrappedWindow {
    base: *mut u8,
    len: usize,
}

impl TrappedWindow {
    pub fn new(
        len: usize,
        regions: &[Region],
        observer: Box<dyn AccessObserver>,
    ) -> Result<Self, TrapError> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(TrapError::UnalignedLength(len));
        }
        for region in regions {
            let aligned = region.start % PAGE_SIZE == 0 && region.len % PAGE_SIZE == 0;
            if !aligned || region.len == 0 || region.start + region.len > len {
                return Err(TrapError::BadRegion(region.start, region.len));
            }
        }
        if INSTALLED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TrapError::AlreadyInstalled);
        }
        match Self::install(len, regions, observer) {
            Ok(window) => Ok(window),
            Err(err) => {
                INSTALLED.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    fn install(
        len: usize,
        regions: &[Region],
        observer: Box<dyn AccessObserver>,
    ) -> Result<Self, TrapError> {
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(TrapError::Mmap(errno()));
        }
        let base = base as *mut u8;

        let state = Box::into_raw(Box::new(TrapState {
            base: base as usize,
            len,
            regions: regions.to_vec(),
            observer,
            pending: None,
            old_segv: unsafe { mem::zeroed() },
            old_trap: unsafe { mem::zeroed() },
        }));
        // The handlers read the global, so it must be set before they are.
        STATE.store(state, Ordering::Release);

        let teardown = move |err: TrapError| {
            STATE.store(ptr::null_mut(), Ordering::Release);
            unsafe {
                drop(Box::from_raw(state));
                libc::munmap(base as *mut c_void, len);
            }
            err
        };

        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = on_segv as usize;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGSEGV, &action, &mut (*state).old_segv) != 0 {
                return Err(teardown(TrapError::Sigaction(errno())));
            }
            action.sa_sigaction = on_trap as usize;
            if libc::sigaction(libc::SIGTRAP, &action, &mut (*state).old_trap) != 0 {
                libc::sigaction(libc::SIGSEGV, &(*state).old_segv, ptr::null_mut());
                return Err(teardown(TrapError::Sigaction(errno())));
            }
        }

        for region in regions {
            let prot = protection_of(regions, region.start);
            let rc = unsafe {
                libc::mprotect(base.add(region.start) as *mut c_void, region.len, prot)
            };
            if rc != 0 {
                unsafe {
                    libc::sigaction(libc::SIGSEGV, &(*state).old_segv, ptr::null_mut());
                    libc::sigaction(libc::SIGTRAP, &(*state).old_trap, ptr::null_mut());
                }
                return Err(teardown(TrapError::Mprotect(errno())));
            }
        }

        tracing::debug!(target: "trap", len, regions = regions.len(), "trapped window installed");
        Ok(Self { base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base of the mapping, for handing to code that accesses the window
    /// through raw pointers.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn read8(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.len);
        unsafe { ptr::read_volatile(self.base.add(offset)) }
    }

    /// Offset must be 2-aligned so the access is a single instruction.
    pub fn read16(&self, offset: usize) -> u16 {
        debug_assert!(offset % 2 == 0 && offset + 2 <= self.len);
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u16) }
    }

    /// Offset must be 4-aligned so the access is a single instruction.
    pub fn read32(&self, offset: usize) -> u32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    pub fn write8(&self, offset: usize, value: u8) {
        debug_assert!(offset < self.len);
        unsafe { ptr::write_volatile(self.base.add(offset), value) }
    }

    pub fn write16(&self, offset: usize, value: u16) {
        debug_assert!(offset % 2 == 0 && offset + 2 <= self.len);
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u16, value) }
    }

    pub fn write32(&self, offset: usize, value: u32) {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len);
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }
}

impl Drop for TrappedWindow {
    fn drop(&mut self) {
        let state = STATE.swap(ptr::null_mut(), Ordering::AcqRel);
        if !state.is_null() {
            unsafe {
                libc::sigaction(libc::SIGSEGV, &(*state).old_segv, ptr::null_mut());
                libc::sigaction(libc::SIGTRAP, &(*state).old_trap, ptr::null_mut());
                drop(Box::from_raw(state));
            }
        }
        unsafe {
            libc::munmap(self.base as *mut c_void, self.len);
        }
        INSTALLED.store(false, Ordering::Release);
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
