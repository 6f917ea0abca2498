//! Bounded interrupt/event queue with per-code coalescing.
//!
//! Posting never allocates once the queue exists; the host observes events
//! one at a time through the protocol engines (the event-status field of the
//! MMIO window), so delivery is at most one in flight: the line is raised on
//! the empty-to-nonempty transition and again after every consume that
//! leaves a backlog.

use std::collections::VecDeque;

use vsmc_types::{EventCode, MAX_EVENT_PAYLOAD};

use crate::irq::IrqLine;

/// Default number of stored events.
pub const DEFAULT_EVENT_CAPACITY: usize = 16;

#[derive(Clone, Copy)]
pub struct Event {
    pub code: EventCode,
    payload: [u8; MAX_EVENT_PAYLOAD],
    len: u8,
}

impl Event {
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }
}

pub struct EventQueue {
    entries: VecDeque<Event>,
    capacity: usize,
    enabled: bool,
    irq: Box<dyn IrqLine>,
}

impl EventQueue {
    pub fn new(capacity: usize, irq: Box<dyn IrqLine>) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            enabled: false,
            irq,
        }
    }

    /// Gate for `post`; typically flipped when the host driver enables the
    /// device interrupt.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store one event. An event with the same code already in the queue is
    /// updated in place (its interrupt was already signalled); a full queue
    /// drops the event. Returns whether the event is now stored.
    pub fn post(&mut self, code: EventCode, payload: &[u8]) -> bool {
        if !self.enabled {
            return false;
        }
        if payload.len() > MAX_EVENT_PAYLOAD {
            if crate::can_trace() {
                tracing::warn!(target: "events", code = code.code(), len = payload.len(), "event payload overflow");
            }
            return false;
        }

        if let Some(entry) = self.entries.iter_mut().find(|e| e.code == code) {
            entry.payload[..payload.len()].copy_from_slice(payload);
            entry.len = payload.len() as u8;
            return true;
        }

        if self.entries.len() == self.capacity {
            if crate::can_trace() {
                tracing::warn!(target: "events", code = code.code(), "event queue overflow, dropping");
            }
            return false;
        }

        let mut event = Event {
            code,
            payload: [0; MAX_EVENT_PAYLOAD],
            len: payload.len() as u8,
        };
        event.payload[..payload.len()].copy_from_slice(payload);
        self.entries.push_back(event);
        if self.entries.len() == 1 {
            if crate::can_trace() {
                tracing::debug!(target: "events", code = code.code(), "raising event interrupt");
            }
            self.irq.raise();
        }
        true
    }

    /// Pop the head for delivery; re-raises the line if a backlog remains.
    pub fn consume(&mut self) -> Option<Event> {
        let event = self.entries.pop_front()?;
        if !self.entries.is_empty() {
            self.irq.raise();
        }
        Some(event)
    }
}
