//! Edge-triggered interrupt line seam.
//!
//! The event queue raises the line when a stored event becomes deliverable;
//! the embedder routes it to whatever interrupt controller it emulates.

pub trait IrqLine {
    /// Signal one interrupt edge.
    ///
    /// Runs from the trap backend's signal handlers when the MMIO window is
    /// fault-driven, so implementations must stay async-signal-safe.
    fn raise(&mut self);
}

/// Line for embedders without interrupt wiring.
pub struct NoIrq;

impl IrqLine for NoIrq {
    fn raise(&mut self) {}
}
