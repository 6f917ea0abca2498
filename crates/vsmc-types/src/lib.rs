#![forbid(unsafe_code)]

//! Wire-level primitives shared by the SMC keystore, the protocol engines and
//! the access-trap bridge.
//!
//! The host driver talks to the emulated controller in fixed byte formats:
//! 4-character key identifiers, single-byte result/status/command codes and a
//! fixed MMIO field layout. Everything that must match that contract exactly
//! lives here so the other crates agree on it by construction.

use std::fmt;

use bitflags::bitflags;

/// Largest value payload the device stores or transfers (bytes).
pub const MAX_VALUE_SIZE: usize = 32;

/// Largest event payload carried by a stored interrupt (bytes).
pub const MAX_EVENT_PAYLOAD: usize = 128;

/// A 4-character ASCII key identifier packed big-endian into a `u32`.
///
/// Ordering is raw integer comparison; the keystore keeps its partitions
/// sorted by this ordering and looks keys up by binary search.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SmcKey(pub u32);

impl SmcKey {
    pub const fn from_chars(chars: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(chars))
    }

    pub const fn to_chars(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Wire encoding used by both protocol engines (big-endian, i.e. the
    /// characters in reading order).
    pub const fn to_wire(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub const fn from_wire(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl fmt::Display for SmcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.to_chars() {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SmcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{self}]")
    }
}

/// A 4-character value type code (`ui8 `, `ui16`, `flag`, `ch8*`, ...).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmcKeyType(pub [u8; 4]);

impl SmcKeyType {
    pub const UI8: Self = Self(*b"ui8 ");
    pub const UI16: Self = Self(*b"ui16");
    pub const UI32: Self = Self(*b"ui32");
    pub const SI8: Self = Self(*b"si8 ");
    pub const FLAG: Self = Self(*b"flag");
    pub const CHAR: Self = Self(*b"char");
    pub const CH8S: Self = Self(*b"ch8*");
    pub const HEX: Self = Self(*b"hex_");
    pub const REV: Self = Self(*b"{rev");
    pub const CLH: Self = Self(*b"{clh");
}

impl fmt::Display for SmcKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SmcKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{self}]")
    }
}

bitflags! {
    /// Per-key access attributes, in the bit positions the host driver
    /// expects from `GetKeyInfo`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyAttributes: u8 {
        const PRIVATE_WRITE = 0x01;
        const PRIVATE_READ  = 0x02;
        const ATOMIC        = 0x04;
        const CONST         = 0x08;
        const FUNCTION      = 0x10;
        const WRITE         = 0x40;
        const READ          = 0x80;
    }
}

bitflags! {
    /// PMIO status register bits. `READY` and `BUSY`/`AWAITING_DATA` are
    /// independent; `GOT_COMMAND` is cleared by any data-port I/O.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        const AWAITING_DATA = 0x01;
        const IB_CLOSED     = 0x02;
        const BUSY          = 0x04;
        const GOT_COMMAND   = 0x08;
        const KEY_DONE      = 0x20;
        const READY         = 0x40;
    }
}

/// Protocol result codes, as reported through the PMIO result register and
/// the MMIO result field. These are wire bytes, not Rust errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmcResult {
    Success = 0x00,
    Error = 0x01,
    CommCollision = 0x80,
    SpuriousData = 0x81,
    BadCommand = 0x82,
    BadParameter = 0x83,
    NotFound = 0x84,
    NotReadable = 0x85,
    NotWritable = 0x86,
    KeySizeMismatch = 0x87,
}

impl SmcResult {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn is_success(self) -> bool {
        matches!(self, SmcResult::Success)
    }
}

/// Command opcodes shared by both protocol engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmcCommand {
    ReadValue = 0x10,
    WriteValue = 0x11,
    GetKeyFromIndex = 0x12,
    GetKeyInfo = 0x13,
    Reset = 0x14,
}

impl SmcCommand {
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x10 => Some(Self::ReadValue),
            0x11 => Some(Self::WriteValue),
            0x12 => Some(Self::GetKeyFromIndex),
            0x13 => Some(Self::GetKeyInfo),
            0x14 => Some(Self::Reset),
            _ => None,
        }
    }
}

/// Device-originated event codes. Zero means "no event pending".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventCode {
    KeyDone = 0x20,
    AlsChange = 0x42,
    LogMessage = 0x4c,
}

impl EventCode {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Device generation. V1 speaks PMIO only; V2 adds the MMIO window and a
/// longer unlock passphrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    V1,
    V2,
}

impl Generation {
    /// The value the `RGEN` key reports.
    pub const fn number(self) -> u8 {
        match self {
            Generation::V1 => 1,
            Generation::V2 => 2,
        }
    }
}

/// Watchdog job codes, as written into the `NATJ` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WatchdogJob {
    DoNothing = 0,
    ShutdownToS5 = 1,
    ForceRestart = 2,
    ForceStartup = 3,
}

impl WatchdogJob {
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::DoNothing),
            1 => Some(Self::ShutdownToS5),
            2 => Some(Self::ForceRestart),
            3 => Some(Self::ForceStartup),
            _ => None,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// PMIO register window: 32 bytes of port I/O space.
pub mod pmio {
    /// Default port base the host driver probes (`$Adr` reports it).
    pub const DEFAULT_PORT_BASE: u16 = 0x300;
    /// Window length in ports.
    pub const WINDOW_LEN: u16 = 0x20;

    /// Data register offset (read: response drain, write: request bytes).
    pub const OFF_DATA: u16 = 0x00;
    /// Command register offset (write: opcode, read: status).
    pub const OFF_COMMAND: u16 = 0x04;
    /// Result register offset (read-only outcome code).
    pub const OFF_RESULT: u16 = 0x1f;
}

/// MMIO window layout. Offsets are fixed by the host driver's register model;
/// the window is a whole number of 4KiB pages.
pub mod mmio {
    /// Window length in bytes (16 pages).
    pub const WINDOW_LEN: usize = 0x1_0000;
    /// Page size the protection map is expressed in.
    pub const PAGE_SIZE: usize = 0x1000;

    /// Value payload staging area (32 bytes at the window base).
    pub const OFF_DATA: usize = 0x0000;
    /// Key field; `GetKeyFromIndex` reuses it as the big-endian index.
    pub const OFF_KEY: usize = 0x0078;
    pub const OFF_INDEX: usize = OFF_KEY;
    /// Reset mode byte; `WriteValue` reuses it as the payload size.
    pub const OFF_MODE: usize = 0x007c;
    pub const OFF_DATA_SIZE: usize = OFF_MODE;
    /// Attribute byte; must be zero for plain (unprivileged) commands.
    pub const OFF_ATTR: usize = 0x007d;
    /// Command byte; the result code is read back at the same offset.
    pub const OFF_COMMAND: usize = 0x007e;
    pub const OFF_RESULT: usize = OFF_COMMAND;
    /// Command-completion status byte (read-once).
    pub const OFF_KEY_STATUS: usize = 0x4005;
    /// Event-delivery status byte (read-once, consumes the queue head).
    pub const OFF_EVENT_STATUS: usize = 0x4000;
    /// Event log payload area (128 bytes).
    pub const OFF_EVENT_LOG: usize = 0x4080;

    /// Page protection applied to a window sub-region while idle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Protection {
        /// Any access faults.
        None,
        /// Reads succeed, writes fault.
        ReadOnly,
    }

    /// One protection-map entry: `[start, start + len)` at `prot`.
    #[derive(Debug, Clone, Copy)]
    pub struct Region {
        pub start: usize,
        pub len: usize,
        pub prot: Protection,
    }

    /// Idle protection map for the whole window. The status page is
    /// no-access so reads of the status fields trap too; everything else
    /// only traps on write.
    pub const PROTECTION_MAP: [Region; 3] = [
        Region {
            start: 0x0000,
            len: 0x4000,
            prot: Protection::ReadOnly,
        },
        Region {
            start: 0x4000,
            len: 0x1000,
            prot: Protection::None,
        },
        Region {
            start: 0x5000,
            len: 0xb000,
            prot: Protection::ReadOnly,
        },
    ];
}
