//! Byte-serial PMIO protocol engine.
//!
//! Four 8-bit registers inside a 32-port window: data (base + 0x00),
//! command/status (base + 0x04) and result (base + 0x1f). Requests arrive
//! one byte at a time on the data port after a command byte; responses are
//! drained from the same port. Protocol errors never surface as Rust errors:
//! they land in the result register and the state machine folds back to
//! READY on the next accepted command.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use vsmc_keystore::Keystore;
use vsmc_types::{pmio, SmcCommand, SmcKey, SmcResult, Status, MAX_VALUE_SIZE};

use crate::events::Event;
use crate::io::{IoPortBus, PortIoDevice};

/// Request header: key (wire order) plus declared payload size as a
/// little-endian u16.
const HEADER_LEN: usize = 6;
/// Staged `GetKeyInfo` response: size, type code, attributes.
const KEY_INFO_LEN: usize = 6;

pub struct PmioEngine {
    keystore: Arc<Keystore>,
    command: Option<SmcCommand>,
    status: Status,
    result: SmcResult,
    key: SmcKey,
    declared_size: u16,
    /// One buffer for request accumulation and staged responses.
    buffer: [u8; MAX_VALUE_SIZE],
    index: usize,
    len: usize,
}

impl PmioEngine {
    pub fn new(keystore: Arc<Keystore>) -> Self {
        Self {
            keystore,
            command: None,
            status: Status::READY,
            result: SmcResult::Success,
            key: SmcKey(0),
            declared_size: 0,
            buffer: [0; MAX_VALUE_SIZE],
            index: 0,
            len: 0,
        }
    }

    fn reset_buffer(&mut self) {
        self.buffer = [0; MAX_VALUE_SIZE];
        self.index = 0;
        self.len = 0;
    }

    pub fn reset_device(&mut self) {
        self.result = SmcResult::Success;
        self.status = Status::READY;
        self.command = None;
        self.key = SmcKey(0);
        self.declared_size = 0;
        self.reset_buffer();
    }

    /// Command-port write. Only legal from READY; a leftover KEY_DONE from
    /// event delivery folds back first, anything else resets the device and
    /// records a collision.
    pub fn write_command(&mut self, raw: u8) {
        if self.status == Status::KEY_DONE {
            self.status = Status::READY;
        }

        if self.status != Status::READY {
            tracing::warn!(
                target: "pmio",
                status = self.status.bits(),
                cmd = raw,
                "command in an unexpected state, resetting"
            );
            self.reset_device();
            self.result = SmcResult::CommCollision;
            return;
        }

        self.reset_device();
        match SmcCommand::from_u8(raw) {
            Some(cmd) => {
                self.status |= Status::BUSY | Status::GOT_COMMAND;
                self.command = Some(cmd);
            }
            None => {
                tracing::warn!(target: "pmio", cmd = raw, "unsupported command");
                self.result = SmcResult::BadCommand;
            }
        }
    }

    /// Data-port write: accumulate request bytes until the active command's
    /// threshold, then run the keystore call and stage the response.
    pub fn write_data(&mut self, byte: u8) {
        // Any data I/O clears the got-command flag.
        self.status -= Status::GOT_COMMAND;

        // Ignore overflowing writes and hope for a reset by command.
        if self.len >= MAX_VALUE_SIZE {
            tracing::debug!(target: "pmio", len = self.len, "out-of-bounds data write");
            self.result = SmcResult::SpuriousData;
            return;
        }

        if self.status != Status::READY | Status::BUSY {
            tracing::debug!(target: "pmio", status = self.status.bits(), "data write in invalid status");
            self.result = SmcResult::CommCollision;
            return;
        }

        self.buffer[self.index] = byte;
        self.index += 1;
        self.len += 1;

        match self.command {
            Some(SmcCommand::ReadValue) => {
                if self.len == HEADER_LEN {
                    self.status |= Status::AWAITING_DATA;
                    self.parse_header();
                    self.load_value();
                }
            }
            Some(SmcCommand::WriteValue) => {
                if usize::from(self.declared_size) == self.len {
                    self.status = Status::READY;
                    self.save_value();
                } else if self.declared_size == 0 && self.len == HEADER_LEN {
                    self.parse_header();
                    self.reset_buffer();
                }
            }
            Some(SmcCommand::GetKeyFromIndex) => {
                if self.len == 4 {
                    self.status |= Status::AWAITING_DATA;
                    let index = u32::from_be_bytes([
                        self.buffer[0],
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]);
                    self.load_key(index);
                }
            }
            Some(SmcCommand::GetKeyInfo) => {
                if self.len == 4 {
                    self.status |= Status::AWAITING_DATA;
                    self.key = SmcKey::from_wire([
                        self.buffer[0],
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]);
                    self.load_key_info();
                }
            }
            Some(SmcCommand::Reset) => {
                if self.len == 1 {
                    self.status = Status::READY;
                    self.result = SmcResult::Success;
                    tracing::debug!(target: "pmio", mode = self.buffer[0], "reset command");
                }
            }
            None => unreachable!("data write accepted without an active command"),
        }
    }

    /// Data-port read: drain the staged response.
    pub fn read_data(&mut self) -> u8 {
        // Any data I/O clears the got-command flag.
        self.status -= Status::GOT_COMMAND;

        if self.index >= self.len {
            tracing::debug!(target: "pmio", index = self.index, len = self.len, "out-of-bounds data read");
            self.result = SmcResult::SpuriousData;
            return 0;
        }

        let byte = self.buffer[self.index];
        self.index += 1;

        if self.status != Status::READY | Status::AWAITING_DATA | Status::BUSY {
            tracing::debug!(target: "pmio", status = self.status.bits(), "data read in invalid status");
            self.result = SmcResult::CommCollision;
            return 0;
        }

        match self.command {
            Some(
                SmcCommand::ReadValue | SmcCommand::GetKeyFromIndex | SmcCommand::GetKeyInfo,
            ) => {
                if self.index == self.len {
                    self.status = Status::READY;
                }
            }
            _ => unreachable!("data drain without a staged response"),
        }

        byte
    }

    pub fn read_status(&self) -> u8 {
        self.status.bits()
    }

    pub fn read_result(&self) -> u8 {
        self.result.code()
    }

    /// Event delivery through PMIO only folds the status back to READY; the
    /// byte-serial protocol has no event payload channel.
    pub fn set_event(&mut self, _event: &Event) {
        self.status = Status::READY;
    }

    fn parse_header(&mut self) {
        self.key = SmcKey::from_wire([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]);
        self.declared_size = u16::from_le_bytes([self.buffer[4], self.buffer[5]]);
    }

    fn load_value(&mut self) {
        self.reset_buffer();
        match self.keystore.read(self.key) {
            Ok(value) if u16::from(value.size) == self.declared_size => {
                self.result = SmcResult::Success;
                let size = usize::from(value.size);
                self.buffer[..size].copy_from_slice(value.bytes());
                self.len = size;
                return;
            }
            Ok(_) => self.result = SmcResult::KeySizeMismatch,
            Err(code) => self.result = code,
        }
        // The host still drains the declared length; it reads zeroes.
        self.len = usize::from(self.declared_size).min(MAX_VALUE_SIZE);
    }

    fn save_value(&mut self) {
        self.result = match self.keystore.write(self.key, &self.buffer[..self.len]) {
            Ok(()) => SmcResult::Success,
            Err(code) => code,
        };
        self.reset_buffer();
    }

    fn load_key(&mut self, index: u32) {
        self.reset_buffer();
        self.len = 4;
        match self.keystore.key_at_index(index) {
            Ok(key) => {
                self.result = SmcResult::Success;
                self.buffer[..4].copy_from_slice(&key.to_wire());
            }
            Err(code) => self.result = code,
        }
    }

    fn load_key_info(&mut self) {
        self.reset_buffer();
        self.len = KEY_INFO_LEN;
        match self.keystore.describe(self.key) {
            Ok(info) => {
                self.result = SmcResult::Success;
                self.buffer[0] = info.size;
                self.buffer[1..5].copy_from_slice(&info.key_type.0);
                self.buffer[5] = info.attr.bits();
            }
            Err(code) => self.result = code,
        }
    }
}

struct PmioPort {
    engine: Rc<RefCell<PmioEngine>>,
    base: u16,
}

impl PortIoDevice for PmioPort {
    fn read(&mut self, port: u16, size: u8) -> u32 {
        if size != 1 {
            return 0xFFFF_FFFF;
        }
        let mut engine = self.engine.borrow_mut();
        match port.wrapping_sub(self.base) {
            pmio::OFF_DATA => u32::from(engine.read_data()),
            pmio::OFF_COMMAND => u32::from(engine.read_status()),
            pmio::OFF_RESULT => u32::from(engine.read_result()),
            _ => 0xFF,
        }
    }

    fn write(&mut self, port: u16, size: u8, value: u32) {
        if size != 1 {
            return;
        }
        let mut engine = self.engine.borrow_mut();
        match port.wrapping_sub(self.base) {
            pmio::OFF_DATA => engine.write_data(value as u8),
            pmio::OFF_COMMAND => engine.write_command(value as u8),
            _ => {}
        }
    }

    fn reset(&mut self) {
        // Every port wrapper shares the engine; repeated resets are idempotent.
        self.engine.borrow_mut().reset_device();
    }
}

/// Map the engine's 32-port window onto the bus.
pub fn register_pmio(bus: &mut IoPortBus, base: u16, engine: Rc<RefCell<PmioEngine>>) {
    bus.register_shared_range(base, pmio::WINDOW_LEN, |_port| {
        Box::new(PmioPort {
            engine: engine.clone(),
            base,
        })
    });
}

#[cfg(test)]
mod tests {
    use vsmc_keystore::{KeyDef, KeystoreCallbacks, KeystoreConfig};
    use vsmc_types::KeyAttributes;
    use vsmc_types::SmcKeyType;

    use super::*;

    fn engine_with_test_key() -> PmioEngine {
        let def = KeyDef::new(
            SmcKey::from_chars(*b"TEST"),
            SmcKeyType::UI16,
            KeyAttributes::READ | KeyAttributes::WRITE,
            &[0x03, 0xe8],
        );
        let keystore = Arc::new(
            Keystore::new(KeystoreConfig::default(), KeystoreCallbacks::default(), vec![def])
                .unwrap(),
        );
        PmioEngine::new(keystore)
    }

    fn request(engine: &mut PmioEngine, cmd: SmcCommand, bytes: &[u8]) {
        engine.write_command(cmd as u8);
        for &b in bytes {
            engine.write_data(b);
        }
    }

    #[test]
    fn read_value_frames_exactly_the_declared_size() {
        let mut engine = engine_with_test_key();
        request(&mut engine, SmcCommand::ReadValue, b"TEST\x02\x00");
        assert_eq!(engine.read_result(), SmcResult::Success.code());
        assert_eq!(
            engine.read_status(),
            (Status::READY | Status::BUSY | Status::AWAITING_DATA).bits()
        );

        assert_eq!(engine.read_data(), 0x03);
        assert_eq!(engine.read_data(), 0xe8);
        assert_eq!(engine.read_status(), Status::READY.bits());

        // Draining past the staged response is spurious.
        assert_eq!(engine.read_data(), 0);
        assert_eq!(engine.read_result(), SmcResult::SpuriousData.code());
    }

    #[test]
    fn read_value_with_a_wrong_declared_size_reports_mismatch() {
        let mut engine = engine_with_test_key();
        request(&mut engine, SmcCommand::ReadValue, b"TEST\x04\x00");
        assert_eq!(engine.read_result(), SmcResult::KeySizeMismatch.code());
        // The declared length still drains, as zeroes.
        for _ in 0..4 {
            assert_eq!(engine.read_data(), 0);
        }
        assert_eq!(engine.read_status(), Status::READY.bits());
    }

    #[test]
    fn write_value_round_trips_through_the_keystore() {
        let mut engine = engine_with_test_key();
        request(&mut engine, SmcCommand::WriteValue, b"TEST\x02\x00\x12\x34");
        assert_eq!(engine.read_result(), SmcResult::Success.code());
        assert_eq!(engine.read_status(), Status::READY.bits());

        request(&mut engine, SmcCommand::ReadValue, b"TEST\x02\x00");
        assert_eq!(engine.read_data(), 0x12);
        assert_eq!(engine.read_data(), 0x34);
    }

    #[test]
    fn get_key_info_and_key_from_index_stage_responses() {
        let mut engine = engine_with_test_key();
        request(&mut engine, SmcCommand::GetKeyInfo, b"TEST");
        assert_eq!(engine.read_result(), SmcResult::Success.code());
        let info: Vec<u8> = (0..6).map(|_| engine.read_data()).collect();
        assert_eq!(info[0], 2);
        assert_eq!(&info[1..5], b"ui16");
        assert_eq!(
            info[5],
            (KeyAttributes::READ | KeyAttributes::WRITE).bits()
        );

        request(&mut engine, SmcCommand::GetKeyFromIndex, &0u32.to_be_bytes());
        assert_eq!(engine.read_result(), SmcResult::Success.code());
        let key: Vec<u8> = (0..4).map(|_| engine.read_data()).collect();
        // Index 0 is the first public key in sorted order.
        assert_eq!(&key[..], b"#KEY");
    }

    #[test]
    fn command_in_a_busy_state_resets_and_records_a_collision() {
        let mut engine = engine_with_test_key();
        engine.write_command(SmcCommand::ReadValue as u8);
        engine.write_data(b'T');
        // A command mid-request is a collision and resets the machine.
        engine.write_command(SmcCommand::ReadValue as u8);
        assert_eq!(engine.read_result(), SmcResult::CommCollision.code());
        assert_eq!(engine.read_status(), Status::READY.bits());

        // The device recovers for the next command.
        request(&mut engine, SmcCommand::ReadValue, b"TEST\x02\x00");
        assert_eq!(engine.read_result(), SmcResult::Success.code());
    }

    #[test]
    fn unknown_commands_and_missing_keys_set_result_codes() {
        let mut engine = engine_with_test_key();
        engine.write_command(0x42);
        assert_eq!(engine.read_result(), SmcResult::BadCommand.code());
        assert_eq!(engine.read_status(), Status::READY.bits());

        request(&mut engine, SmcCommand::ReadValue, b"NOPE\x01\x00");
        assert_eq!(engine.read_result(), SmcResult::NotFound.code());
    }

    #[test]
    fn reset_command_takes_a_mode_byte() {
        let mut engine = engine_with_test_key();
        request(&mut engine, SmcCommand::Reset, &[0x01]);
        assert_eq!(engine.read_result(), SmcResult::Success.code());
        assert_eq!(engine.read_status(), Status::READY.bits());
    }

    #[test]
    fn ports_route_to_the_shared_engine() {
        let engine = Rc::new(RefCell::new(engine_with_test_key()));
        let mut bus = IoPortBus::new();
        register_pmio(&mut bus, pmio::DEFAULT_PORT_BASE, engine);

        let base = pmio::DEFAULT_PORT_BASE;
        bus.write_u8(base + pmio::OFF_COMMAND, SmcCommand::ReadValue as u8);
        for &b in b"TEST\x02\x00" {
            bus.write_u8(base + pmio::OFF_DATA, b);
        }
        assert_eq!(bus.read_u8(base + pmio::OFF_RESULT), SmcResult::Success.code());
        assert_eq!(bus.read_u8(base + pmio::OFF_DATA), 0x03);
        assert_eq!(bus.read_u8(base + pmio::OFF_DATA), 0xe8);
        assert_eq!(bus.read_u8(base + pmio::OFF_COMMAND), Status::READY.bits());
    }
}
