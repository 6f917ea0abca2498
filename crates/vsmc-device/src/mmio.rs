//! MMIO protocol engine: single-shot commands over a fixed-layout window.
//!
//! The host driver fills the key/size/attribute fields with ordinary stores,
//! then writes the command byte; that one write triggers the whole keystore
//! call and the engine publishes the response over the same fields. Status
//! fields live in a page the access-trap bridge keeps unreadable, so every
//! status load funnels through [`MmioEngine::handle_read`] and behaves as
//! read-once.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use vsmc_keystore::Keystore;
use vsmc_trap::AccessObserver;
use vsmc_types::{
    mmio, EventCode, SmcCommand, SmcKey, SmcResult, Status, MAX_EVENT_PAYLOAD, MAX_VALUE_SIZE,
};

use crate::events::{Event, EventQueue};

pub struct MmioEngine {
    keystore: Arc<Keystore>,
    events: Rc<RefCell<EventQueue>>,
    /// Command-completion status, observed read-once at the key-status field.
    status: Status,
    /// Event-delivery status, observed read-once at the event-status field.
    event_status: Status,
    result: SmcResult,
    buffer: [u8; MAX_VALUE_SIZE],
    len: u8,
}

impl MmioEngine {
    pub fn new(keystore: Arc<Keystore>, events: Rc<RefCell<EventQueue>>) -> Self {
        Self {
            keystore,
            events,
            status: Status::empty(),
            event_status: Status::empty(),
            result: SmcResult::Success,
            buffer: [0; MAX_VALUE_SIZE],
            len: 0,
        }
    }

    /// Hook for loads. Only the two status fields react; everything else is
    /// already published in the window bytes.
    pub fn handle_read(&mut self, window: &mut [u8], offset: usize) {
        if offset == mmio::OFF_KEY_STATUS {
            if crate::can_trace() {
                tracing::debug!(target: "mmio", offset, "key status read");
            }
            window[mmio::OFF_KEY_STATUS] = self.status.bits();
            self.status = Status::empty();
        } else if offset == mmio::OFF_EVENT_STATUS {
            if crate::can_trace() {
                tracing::debug!(target: "mmio", offset, "event status read");
            }
            let event = self.events.borrow_mut().consume();
            if let Some(event) = event {
                self.deliver(window, &event);
                if event.code == EventCode::KeyDone {
                    self.status = Status::empty();
                }
            }
            window[mmio::OFF_EVENT_STATUS] = self.event_status.bits();
            self.event_status = Status::empty();
        }
    }

    /// Hook for stores. A store to the command field runs one keystore call;
    /// all other stores just land in the window for later command decoding.
    pub fn handle_write(&mut self, window: &mut [u8], offset: usize) {
        if offset != mmio::OFF_COMMAND {
            return;
        }
        let raw = window[mmio::OFF_COMMAND];
        if crate::can_trace() {
            tracing::debug!(target: "mmio", cmd = raw, "command write");
        }
        match SmcCommand::from_u8(raw) {
            Some(SmcCommand::ReadValue) => self.read_value(window),
            Some(SmcCommand::WriteValue) => self.write_value(window),
            Some(SmcCommand::GetKeyFromIndex) => self.get_key_from_index(window),
            Some(SmcCommand::GetKeyInfo) => self.get_key_info(window),
            Some(SmcCommand::Reset) => {
                if crate::can_trace() {
                    tracing::debug!(target: "mmio", mode = window[mmio::OFF_MODE], "reset request");
                }
                self.result = SmcResult::BadCommand;
            }
            None => {
                if crate::can_trace() {
                    tracing::warn!(target: "mmio", cmd = raw, "unsupported command");
                }
                self.result = SmcResult::BadCommand;
            }
        }
        self.submit(window);
    }

    fn window_key(window: &[u8]) -> SmcKey {
        SmcKey::from_wire([
            window[mmio::OFF_KEY],
            window[mmio::OFF_KEY + 1],
            window[mmio::OFF_KEY + 2],
            window[mmio::OFF_KEY + 3],
        ])
    }

    /// Attribute field must be zero for plain commands; the privileged forms
    /// are not part of this device.
    fn attr_clear(&mut self, window: &[u8]) -> bool {
        let attr = window[mmio::OFF_ATTR];
        if attr != 0 {
            if crate::can_trace() {
                tracing::debug!(target: "mmio", attr, "command with non-zero attributes");
            }
            self.result = SmcResult::BadCommand;
            return false;
        }
        true
    }

    fn read_value(&mut self, window: &[u8]) {
        if !self.attr_clear(window) {
            return;
        }
        match self.keystore.read(Self::window_key(window)) {
            Ok(value) => {
                self.result = SmcResult::Success;
                self.len = value.size;
                self.buffer[..usize::from(value.size)].copy_from_slice(value.bytes());
            }
            Err(code) => self.result = code,
        }
    }

    fn write_value(&mut self, window: &[u8]) {
        if !self.attr_clear(window) {
            return;
        }
        let size = usize::from(window[mmio::OFF_DATA_SIZE]);
        if size > MAX_VALUE_SIZE {
            self.result = SmcResult::KeySizeMismatch;
            return;
        }
        self.result = match self
            .keystore
            .write(Self::window_key(window), &window[mmio::OFF_DATA..mmio::OFF_DATA + size])
        {
            Ok(()) => SmcResult::Success,
            Err(code) => code,
        };
    }

    fn get_key_from_index(&mut self, window: &[u8]) {
        if !self.attr_clear(window) {
            return;
        }
        let index = u32::from_be_bytes([
            window[mmio::OFF_INDEX],
            window[mmio::OFF_INDEX + 1],
            window[mmio::OFF_INDEX + 2],
            window[mmio::OFF_INDEX + 3],
        ]);
        match self.keystore.key_at_index(index) {
            Ok(key) => {
                self.result = SmcResult::Success;
                self.len = 4;
                self.buffer[..4].copy_from_slice(&key.to_wire());
            }
            Err(code) => self.result = code,
        }
    }

    fn get_key_info(&mut self, window: &[u8]) {
        if !self.attr_clear(window) {
            return;
        }
        match self.keystore.describe(Self::window_key(window)) {
            Ok(info) => {
                self.result = SmcResult::Success;
                self.len = 6;
                self.buffer[0] = info.size;
                self.buffer[1..5].copy_from_slice(&info.key_type.0);
                self.buffer[5] = info.attr.bits();
            }
            Err(code) => self.result = code,
        }
    }

    /// Publish the response: clear the request fields, overwrite the command
    /// byte with the result, stage size and payload, flag completion and
    /// post the completion event.
    fn submit(&mut self, window: &mut [u8]) {
        window[mmio::OFF_KEY..mmio::OFF_KEY + 4].fill(0);
        window[mmio::OFF_ATTR] = 0;
        window[mmio::OFF_RESULT] = self.result.code();
        window[mmio::OFF_DATA_SIZE] = self.len;
        window[mmio::OFF_DATA..mmio::OFF_DATA + MAX_VALUE_SIZE].copy_from_slice(&self.buffer);

        self.buffer = [0; MAX_VALUE_SIZE];
        self.len = 0;
        self.status = Status::KEY_DONE;
        self.events.borrow_mut().post(EventCode::KeyDone, &[]);
    }

    fn deliver(&mut self, window: &mut [u8], event: &Event) {
        match event.code {
            EventCode::LogMessage => {
                let payload = event.payload();
                let log = &mut window[mmio::OFF_EVENT_LOG..mmio::OFF_EVENT_LOG + MAX_EVENT_PAYLOAD];
                log[..payload.len()].copy_from_slice(payload);
                log[payload.len()..].fill(0);
                self.event_status = Status::KEY_DONE;
            }
            EventCode::KeyDone | EventCode::AlsChange => {
                self.event_status = Status::KEY_DONE;
            }
        }
    }
}

impl AccessObserver for MmioEngine {
    fn pre_read(&mut self, window: &mut [u8], offset: usize) {
        self.handle_read(window, offset);
    }

    fn post_write(&mut self, window: &mut [u8], offset: usize) {
        self.handle_write(window, offset);
    }
}

#[cfg(test)]
mod tests {
    use vsmc_keystore::{KeyDef, KeystoreCallbacks, KeystoreConfig};
    use vsmc_types::{KeyAttributes, SmcKeyType};

    use super::*;
    use crate::irq::NoIrq;

    fn engine_with_test_key() -> (MmioEngine, Vec<u8>) {
        let def = KeyDef::new(
            SmcKey::from_chars(*b"TEST"),
            SmcKeyType::UI16,
            KeyAttributes::READ | KeyAttributes::WRITE,
            &[0, 0],
        );
        let keystore = Arc::new(
            Keystore::new(KeystoreConfig::default(), KeystoreCallbacks::default(), vec![def])
                .unwrap(),
        );
        let mut events = EventQueue::new(crate::events::DEFAULT_EVENT_CAPACITY, Box::new(NoIrq));
        events.set_enabled(true);
        let engine = MmioEngine::new(keystore, Rc::new(RefCell::new(events)));
        (engine, vec![0u8; mmio::WINDOW_LEN])
    }

    fn command(engine: &mut MmioEngine, window: &mut [u8], key: &[u8; 4], cmd: SmcCommand) {
        window[mmio::OFF_KEY..mmio::OFF_KEY + 4].copy_from_slice(key);
        window[mmio::OFF_COMMAND] = cmd as u8;
        engine.handle_write(window, mmio::OFF_COMMAND);
    }

    #[test]
    fn write_then_read_publishes_size_and_payload() {
        let (mut engine, mut window) = engine_with_test_key();

        window[mmio::OFF_DATA] = 0x03;
        window[mmio::OFF_DATA + 1] = 0xe8;
        window[mmio::OFF_DATA_SIZE] = 2;
        command(&mut engine, &mut window, b"TEST", SmcCommand::WriteValue);
        assert_eq!(window[mmio::OFF_RESULT], SmcResult::Success.code());

        command(&mut engine, &mut window, b"TEST", SmcCommand::ReadValue);
        assert_eq!(window[mmio::OFF_RESULT], SmcResult::Success.code());
        assert_eq!(window[mmio::OFF_DATA_SIZE], 2);
        assert_eq!(&window[mmio::OFF_DATA..mmio::OFF_DATA + 2], &[0x03, 0xe8]);
        // The key and attribute fields are scrubbed on completion.
        assert_eq!(&window[mmio::OFF_KEY..mmio::OFF_KEY + 4], &[0, 0, 0, 0]);
    }

    #[test]
    fn key_status_is_read_once() {
        let (mut engine, mut window) = engine_with_test_key();
        command(&mut engine, &mut window, b"TEST", SmcCommand::ReadValue);

        engine.handle_read(&mut window, mmio::OFF_KEY_STATUS);
        assert_eq!(window[mmio::OFF_KEY_STATUS], Status::KEY_DONE.bits());
        engine.handle_read(&mut window, mmio::OFF_KEY_STATUS);
        assert_eq!(window[mmio::OFF_KEY_STATUS], 0);
    }

    #[test]
    fn event_status_read_consumes_the_queue_head() {
        let (mut engine, mut window) = engine_with_test_key();
        command(&mut engine, &mut window, b"TEST", SmcCommand::ReadValue);

        engine.handle_read(&mut window, mmio::OFF_EVENT_STATUS);
        assert_eq!(window[mmio::OFF_EVENT_STATUS], Status::KEY_DONE.bits());
        // Delivering the KeyDone event also clears the completion status.
        engine.handle_read(&mut window, mmio::OFF_KEY_STATUS);
        assert_eq!(window[mmio::OFF_KEY_STATUS], 0);

        engine.handle_read(&mut window, mmio::OFF_EVENT_STATUS);
        assert_eq!(window[mmio::OFF_EVENT_STATUS], 0);
    }

    #[test]
    fn log_events_land_in_the_log_field() {
        let (mut engine, mut window) = engine_with_test_key();
        engine
            .events
            .borrow_mut()
            .post(EventCode::LogMessage, b"fan stall");

        engine.handle_read(&mut window, mmio::OFF_EVENT_STATUS);
        assert_eq!(window[mmio::OFF_EVENT_STATUS], Status::KEY_DONE.bits());
        assert_eq!(
            &window[mmio::OFF_EVENT_LOG..mmio::OFF_EVENT_LOG + 9],
            b"fan stall"
        );
        assert_eq!(window[mmio::OFF_EVENT_LOG + 9], 0);
    }

    #[test]
    fn get_key_info_is_idempotent() {
        let (mut engine, mut window) = engine_with_test_key();
        for _ in 0..2 {
            command(&mut engine, &mut window, b"TEST", SmcCommand::GetKeyInfo);
            assert_eq!(window[mmio::OFF_RESULT], SmcResult::Success.code());
            assert_eq!(window[mmio::OFF_DATA_SIZE], 6);
            assert_eq!(window[mmio::OFF_DATA], 2);
            assert_eq!(&window[mmio::OFF_DATA + 1..mmio::OFF_DATA + 5], b"ui16");
        }
    }

    #[test]
    fn nonzero_attribute_field_rejects_the_command() {
        let (mut engine, mut window) = engine_with_test_key();
        window[mmio::OFF_ATTR] = 0x40;
        command(&mut engine, &mut window, b"TEST", SmcCommand::ReadValue);
        assert_eq!(window[mmio::OFF_RESULT], SmcResult::BadCommand.code());
    }

    #[test]
    fn reset_is_always_rejected() {
        let (mut engine, mut window) = engine_with_test_key();
        command(&mut engine, &mut window, b"TEST", SmcCommand::Reset);
        assert_eq!(window[mmio::OFF_RESULT], SmcResult::BadCommand.code());
    }

    #[test]
    fn get_key_from_index_reads_a_big_endian_index() {
        let (mut engine, mut window) = engine_with_test_key();
        window[mmio::OFF_INDEX..mmio::OFF_INDEX + 4].copy_from_slice(&0u32.to_be_bytes());
        window[mmio::OFF_COMMAND] = SmcCommand::GetKeyFromIndex as u8;
        engine.handle_write(&mut window, mmio::OFF_COMMAND);
        assert_eq!(window[mmio::OFF_RESULT], SmcResult::Success.code());
        assert_eq!(&window[mmio::OFF_DATA..mmio::OFF_DATA + 4], b"#KEY");
    }
}
