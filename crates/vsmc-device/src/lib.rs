#![forbid(unsafe_code)]

//! Register-level emulation of the SMC: the byte-serial PMIO engine, the
//! memory-window MMIO engine, the bounded event queue, the watchdog and the
//! device context that wires them to a keystore.
//!
//! Engines speak wire codes, never Rust errors; a protocol mistake lands in
//! the result register and the machine folds back to READY. Rust errors are
//! reserved for construction ([`DeviceError`]).

mod device;
mod events;
mod io;
mod irq;
mod mmio;
mod pmio;
mod watchdog;

pub use device::{
    DeviceCallbacks, DeviceConfig, DeviceError, SmcDevice, SnapshotStore,
};
pub use events::{Event, EventQueue, DEFAULT_EVENT_CAPACITY};
pub use io::{IoPortBus, PortIoDevice};
pub use irq::{IrqLine, NoIrq};
pub use mmio::MmioEngine;
pub use pmio::{register_pmio, PmioEngine};
pub use watchdog::{Watchdog, WatchdogCallbacks};

/// Engine hooks can run inside the trap backend's signal handlers, where
/// dispatching into a tracing subscriber could allocate or take a lock.
pub(crate) fn can_trace() -> bool {
    !vsmc_trap::in_fault_context()
}
