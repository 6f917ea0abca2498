//! Access-trap bridge: turns ordinary loads and stores on a memory window
//! into engine callbacks.
//!
//! The MMIO protocol engine needs to see the host's plain memory accesses:
//! a read of a status field must observe freshly published bytes, a write
//! of the command field must run a command. The [`AccessObserver`] trait is
//! that seam. Two window implementations exist:
//!
//! - [`SoftWindow`]: a plain buffer whose accessors invoke the hooks
//!   directly. Portable; used by tests and scripted replay.
//! - [`TrappedWindow`] (Linux x86-64): a real mapping protected per region,
//!   where the hooks run from the page-fault path and the faulting
//!   instruction is replayed by single-stepping. Code that accesses the
//!   window needs no modification at all.

use std::sync::atomic::{AtomicBool, Ordering};

/// Engine-side hooks around window accesses.
///
/// `pre_read` runs before a load is allowed to complete, so the observer
/// can publish bytes the load will see. `post_write` runs after a store
/// landed in the window. Offsets are relative to the window base.
pub trait AccessObserver {
    fn pre_read(&mut self, window: &mut [u8], offset: usize);
    fn post_write(&mut self, window: &mut [u8], offset: usize);
}

impl<O: AccessObserver> AccessObserver for std::rc::Rc<std::cell::RefCell<O>> {
    fn pre_read(&mut self, window: &mut [u8], offset: usize) {
        self.borrow_mut().pre_read(window, offset);
    }

    fn post_write(&mut self, window: &mut [u8], offset: usize) {
        self.borrow_mut().post_write(window, offset);
    }
}

static FAULT_CONTEXT: AtomicBool = AtomicBool::new(false);

/// Whether the current access-observer hook was entered from the fault
/// backend's signal handlers.
///
/// Only async-signal-safe work is allowed there: no allocation, no locks,
/// which rules out dispatching `tracing` events into a subscriber. Code
/// reachable from a hook checks this before emitting diagnostics.
pub fn in_fault_context() -> bool {
    FAULT_CONTEXT.load(Ordering::Relaxed)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub(crate) fn set_fault_context(active: bool) {
    FAULT_CONTEXT.store(active, Ordering::Relaxed);
}

mod soft;
pub use soft::SoftWindow;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod fault;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use fault::{TrapError, TrappedWindow};
