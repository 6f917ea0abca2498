//! The keystore proper: sorted public/hidden partitions, plugin override
//! with lock-free value resolution, and the single-use privilege unlock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use vsmc_types::{Generation, KeyAttributes, SmcKey, SmcKeyType, SmcResult, MAX_VALUE_SIZE};

use crate::clock::{Clock, SystemClock};
use crate::value::{
    BufferValue, KeyBacking, KeyCountValue, NoWatchdog, UnlockStateValue, UnlockValue,
    WatchdogJobValue, WatchdogSink, WatchdogTimerValue, UNLOCK_PASSWORD_V1, UNLOCK_PASSWORD_V2,
};

/// Plugin slots available per keystore.
pub const MAX_PLUGINS: usize = 8;

/// Sentinel for an empty `backup` handle.
const NO_VALUE: u64 = u64::MAX;

const PLUGIN_BIT: u64 = 1 << 63;
const HIDDEN_BIT: u64 = 1 << 32;

fn plugin_handle(slot: usize, hidden: bool, index: usize) -> u64 {
    PLUGIN_BIT | ((slot as u64) << 40) | (u64::from(hidden) * HIDDEN_BIT) | index as u64
}

/// One key in a core partition. `active` and `backup` hold packed handles
/// into value storage that never moves after registration, so the read path
/// is an atomic load plus an index.
struct KeyEntry {
    key: SmcKey,
    active: AtomicU64,
    backup: AtomicU64,
}

struct PluginEntry {
    key: SmcKey,
    value: Arc<dyn KeyBacking>,
    /// Set when this value was installed over a core key; enumeration and
    /// lookup fallthrough skip transplanted entries.
    transplanted: AtomicBool,
}

struct PluginSlot {
    name: String,
    public: Vec<PluginEntry>,
    hidden: Vec<PluginEntry>,
}

/// Caller-provided plain key definition, merged with the predefined set at
/// construction.
#[derive(Clone)]
pub struct KeyDef {
    pub key: SmcKey,
    pub key_type: SmcKeyType,
    pub attr: KeyAttributes,
    pub size: u8,
    pub initial: Vec<u8>,
    pub hidden: bool,
    pub serialize: bool,
}

impl KeyDef {
    pub fn new(key: SmcKey, key_type: SmcKeyType, attr: KeyAttributes, initial: &[u8]) -> Self {
        Self {
            key,
            key_type,
            attr,
            size: initial.len() as u8,
            initial: initial.to_vec(),
            hidden: false,
            serialize: false,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn serialized(mut self) -> Self {
        self.serialize = true;
        self
    }
}

/// Keys a plugin contributes; unregistration is unsupported, the slot lives
/// for the device lifetime.
pub struct PluginDef {
    pub name: String,
    pub public: Vec<(SmcKey, Arc<dyn KeyBacking>)>,
    pub hidden: Vec<(SmcKey, Arc<dyn KeyBacking>)>,
}

#[derive(Debug, Clone)]
pub struct KeystoreConfig {
    pub generation: Generation,
    /// Reported through `$Adr`.
    pub port_base: u16,
    /// Reported through `$Num`.
    pub device_index: u8,
    /// Log requests for keys the store does not have.
    pub report_missing_keys: bool,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            generation: Generation::V2,
            port_base: vsmc_types::pmio::DEFAULT_PORT_BASE,
            device_index: 0,
            report_missing_keys: false,
        }
    }
}

/// External collaborators the predefined keys need.
pub struct KeystoreCallbacks {
    pub clock: Arc<dyn Clock>,
    pub watchdog: Arc<dyn WatchdogSink>,
}

impl Default for KeystoreCallbacks {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock::new()),
            watchdog: Arc::new(NoWatchdog),
        }
    }
}

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("invalid definition for key {key} ({size} bytes)")]
    InvalidKeyDef { key: SmcKey, size: u8 },
    #[error("persistent key {key} is marked const")]
    PersistentConstKey { key: SmcKey },
    #[error("duplicate key {key} in one partition")]
    DuplicateKey { key: SmcKey },
    #[error("key {key} is reserved for the access-control pair")]
    ReservedKey { key: SmcKey },
    #[error("access-control keys missing after merge")]
    MissingAccessKeys,
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("all {MAX_PLUGINS} plugin slots are occupied")]
    NoFreeSlot,
}

/// Reported key metadata (`GetKeyInfo`). `CONST` is never reported, and the
/// access bits of private keys are hidden while locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub size: u8,
    pub key_type: SmcKeyType,
    pub attr: KeyAttributes,
}

/// An owned copy of one value's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueBytes {
    pub size: u8,
    pub data: [u8; MAX_VALUE_SIZE],
}

impl ValueBytes {
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }
}

const KEY_KPPW: SmcKey = SmcKey::from_chars(*b"KPPW");
const KEY_KPST: SmcKey = SmcKey::from_chars(*b"KPST");

pub struct Keystore {
    /// Core value storage; immutable once construction finishes.
    values: Vec<Arc<dyn KeyBacking>>,
    public: Vec<KeyEntry>,
    hidden: Vec<KeyEntry>,
    plugins: [OnceLock<PluginSlot>; MAX_PLUGINS],
    /// Single-use unlock flag; armed by `KPPW`, consumed by every
    /// read/write.
    unlocked: Arc<AtomicBool>,
    /// Feeds `#KEY`; refreshed on plugin registration.
    public_count: Arc<AtomicU32>,
    report_missing: bool,
}

enum Located<'a> {
    Core(&'a KeyEntry),
    Ext(&'a PluginEntry),
}

impl Keystore {
    pub fn new(
        config: KeystoreConfig,
        callbacks: KeystoreCallbacks,
        defs: Vec<KeyDef>,
    ) -> Result<Self, KeystoreError> {
        let unlocked = Arc::new(AtomicBool::new(false));
        let public_count = Arc::new(AtomicU32::new(0));

        for def in &defs {
            if def.key == KEY_KPPW || def.key == KEY_KPST {
                return Err(KeystoreError::ReservedKey { key: def.key });
            }
            if def.size == 0
                || def.size as usize > MAX_VALUE_SIZE
                || def.initial.len() > def.size as usize
            {
                return Err(KeystoreError::InvalidKeyDef {
                    key: def.key,
                    size: def.size,
                });
            }
            // Snapshot restore writes through the backing hook, past the
            // attribute gate, so a const value must never be persistent.
            if def.serialize && def.attr.contains(KeyAttributes::CONST) {
                return Err(KeystoreError::PersistentConstKey { key: def.key });
            }
        }

        let mut keyed: Vec<(SmcKey, bool, Arc<dyn KeyBacking>)> = defs
            .into_iter()
            .map(|def| {
                let value = BufferValue::with_size(def.size, def.key_type, def.attr, &def.initial);
                let value = if def.serialize {
                    value.persistent()
                } else {
                    value
                };
                (def.key, def.hidden, Arc::new(value) as Arc<dyn KeyBacking>)
            })
            .collect();

        for (key, hidden, value) in Self::predefined(&config, &callbacks, &unlocked, &public_count)
        {
            if !keyed.iter().any(|(k, h, _)| *k == key && *h == hidden) {
                keyed.push((key, hidden, value));
            }
        }

        let mut values: Vec<Arc<dyn KeyBacking>> = Vec::with_capacity(keyed.len());
        let mut public = Vec::new();
        let mut hidden = Vec::new();
        for (key, is_hidden, value) in keyed {
            let handle = values.len() as u64;
            values.push(value);
            let entry = KeyEntry {
                key,
                active: AtomicU64::new(handle),
                backup: AtomicU64::new(NO_VALUE),
            };
            if is_hidden {
                hidden.push(entry);
            } else {
                public.push(entry);
            }
        }
        public.sort_by_key(|e| e.key);
        hidden.sort_by_key(|e| e.key);
        for part in [&public, &hidden] {
            if let Some(dup) = part.windows(2).find(|w| w[0].key == w[1].key) {
                return Err(KeystoreError::DuplicateKey { key: dup[0].key });
            }
        }

        let has_access_pair = hidden.iter().any(|e| e.key == KEY_KPPW)
            && hidden.iter().any(|e| e.key == KEY_KPST);
        if !has_access_pair {
            tracing::error!(target: "kstore", "access-control keys missing after merge");
            return Err(KeystoreError::MissingAccessKeys);
        }

        let store = Self {
            values,
            public,
            hidden,
            plugins: std::array::from_fn(|_| OnceLock::new()),
            unlocked,
            public_count,
            report_missing: config.report_missing_keys,
        };
        store
            .public_count
            .store(store.count_public(), Ordering::Release);
        tracing::debug!(
            target: "kstore",
            public = store.public.len(),
            hidden = store.hidden.len(),
            "keystore initialized"
        );
        Ok(store)
    }

    fn predefined(
        config: &KeystoreConfig,
        callbacks: &KeystoreCallbacks,
        unlocked: &Arc<AtomicBool>,
        public_count: &Arc<AtomicU32>,
    ) -> Vec<(SmcKey, bool, Arc<dyn KeyBacking>)> {
        let ro = KeyAttributes::CONST | KeyAttributes::READ;
        let rw = KeyAttributes::READ | KeyAttributes::WRITE;
        let generation = config.generation.number();
        let password: &'static [u8] = match config.generation {
            Generation::V1 => UNLOCK_PASSWORD_V1,
            Generation::V2 => UNLOCK_PASSWORD_V2,
        };

        let nati = Arc::new(WatchdogTimerValue::new(callbacks.clock.clone(), None));
        let oswd = Arc::new(WatchdogTimerValue::new(
            callbacks.clock.clone(),
            Some(callbacks.watchdog.clone()),
        ));
        let natj = Arc::new(WatchdogJobValue::new(
            nati.clone(),
            callbacks.watchdog.clone(),
        ));

        let buf = |t, a, init: &[u8]| Arc::new(BufferValue::new(t, a, init)) as Arc<dyn KeyBacking>;
        vec![
            (
                SmcKey::from_chars(*b"#KEY"),
                false,
                Arc::new(KeyCountValue::new(public_count.clone())) as Arc<dyn KeyBacking>,
            ),
            (
                SmcKey::from_chars(*b"$Adr"),
                false,
                buf(
                    SmcKeyType::UI32,
                    ro,
                    &u32::from(config.port_base).to_be_bytes(),
                ),
            ),
            (
                SmcKey::from_chars(*b"$Num"),
                false,
                buf(SmcKeyType::UI8, ro, &[config.device_index]),
            ),
            (
                SmcKey::from_chars(*b"RMde"),
                false,
                buf(SmcKeyType::CHAR, ro, b"A"),
            ),
            (
                SmcKey::from_chars(*b"RGEN"),
                false,
                buf(SmcKeyType::UI8, ro, &[generation]),
            ),
            (
                SmcKey::from_chars(*b"LDKN"),
                false,
                buf(SmcKeyType::UI8, ro, &[generation]),
            ),
            (
                SmcKey::from_chars(*b"BEMB"),
                false,
                buf(SmcKeyType::FLAG, ro, &[1]),
            ),
            (
                SmcKey::from_chars(*b"EPCI"),
                false,
                buf(SmcKeyType::HEX, ro, &[0x08, 0x10, 0xf0, 0x00]),
            ),
            (
                SmcKey::from_chars(*b"MSSD"),
                false,
                Arc::new(
                    BufferValue::new(SmcKeyType::SI8, rw, &[0]).persistent(),
                ) as Arc<dyn KeyBacking>,
            ),
            (
                SmcKey::from_chars(*b"MSSP"),
                false,
                Arc::new(
                    BufferValue::new(SmcKeyType::SI8, rw, &[0]).persistent(),
                ) as Arc<dyn KeyBacking>,
            ),
            (SmcKey::from_chars(*b"NATi"), false, nati),
            (SmcKey::from_chars(*b"NATJ"), false, natj),
            (SmcKey::from_chars(*b"OSWD"), false, oswd),
            (
                KEY_KPPW,
                true,
                Arc::new(UnlockValue::new(unlocked.clone(), password)) as Arc<dyn KeyBacking>,
            ),
            (
                KEY_KPST,
                true,
                Arc::new(UnlockStateValue::new(unlocked.clone())) as Arc<dyn KeyBacking>,
            ),
            (
                SmcKey::from_chars(*b"____"),
                true,
                buf(SmcKeyType::FLAG, ro, &[1]),
            ),
        ]
    }

    fn resolve(&self, handle: u64) -> &Arc<dyn KeyBacking> {
        if handle & PLUGIN_BIT == 0 {
            &self.values[handle as usize]
        } else {
            let slot = ((handle >> 40) & 0xff) as usize;
            let index = (handle & 0xffff_ffff) as usize;
            let Some(plugin) = self.plugins[slot].get() else {
                unreachable!("value handle into an empty plugin slot");
            };
            let list = if handle & HIDDEN_BIT != 0 {
                &plugin.hidden
            } else {
                &plugin.public
            };
            &list[index].value
        }
    }

    fn find(&self, key: SmcKey, hidden: bool) -> Option<Located<'_>> {
        let part = if hidden { &self.hidden } else { &self.public };
        if let Ok(i) = part.binary_search_by_key(&key, |e| e.key) {
            return Some(Located::Core(&part[i]));
        }
        // Fallthrough to plugin-only keys, in registration order.
        for plugin in self.plugins.iter().filter_map(|slot| slot.get()) {
            let list = if hidden { &plugin.hidden } else { &plugin.public };
            if let Some(entry) = list
                .iter()
                .find(|e| e.key == key && !e.transplanted.load(Ordering::Acquire))
            {
                return Some(Located::Ext(entry));
            }
        }
        None
    }

    fn locate(&self, key: SmcKey) -> Option<Located<'_>> {
        self.find(key, false).or_else(|| self.find(key, true))
    }

    fn backing<'a>(&'a self, located: &Located<'a>) -> &'a Arc<dyn KeyBacking> {
        match located {
            Located::Core(entry) => self.resolve(entry.active.load(Ordering::Acquire)),
            Located::Ext(entry) => &entry.value,
        }
    }

    fn missing(&self, key: SmcKey) -> SmcResult {
        // Lookups can run from the access-trap signal handlers, where
        // dispatching into a subscriber is not async-signal-safe.
        if self.report_missing && !vsmc_trap::in_fault_context() {
            tracing::warn!(target: "kstore", key = %key, "request for a missing key");
        }
        SmcResult::NotFound
    }

    /// Read one value. Consumes the unlock flag; a PRIVATE-READ key succeeds
    /// iff the flag was armed when the read started.
    pub fn read(&self, key: SmcKey) -> Result<ValueBytes, SmcResult> {
        let unlocked = self.unlocked.swap(false, Ordering::AcqRel);
        let located = self.locate(key).ok_or_else(|| self.missing(key))?;
        let value = self.backing(&located);
        let meta = value.meta();
        if !meta.attr.contains(KeyAttributes::READ) {
            return Err(SmcResult::NotReadable);
        }
        if meta.attr.contains(KeyAttributes::PRIVATE_READ) && !unlocked {
            return Err(SmcResult::NotReadable);
        }
        let mut out = ValueBytes {
            size: meta.size,
            data: [0; MAX_VALUE_SIZE],
        };
        match value.read(&mut out.data[..meta.size as usize]) {
            SmcResult::Success => Ok(out),
            other => Err(other),
        }
    }

    /// Write one value. `data` must be exactly the stored size. The
    /// private-write gate reports NotReadable, which is what the host driver
    /// expects from the hardware.
    pub fn write(&self, key: SmcKey, data: &[u8]) -> Result<(), SmcResult> {
        let unlocked = self.unlocked.swap(false, Ordering::AcqRel);
        let located = self.locate(key).ok_or_else(|| self.missing(key))?;
        let value = self.backing(&located);
        let meta = value.meta();
        if meta.attr.contains(KeyAttributes::CONST) || !meta.attr.contains(KeyAttributes::WRITE) {
            return Err(SmcResult::NotWritable);
        }
        if meta.attr.contains(KeyAttributes::PRIVATE_WRITE) && !unlocked {
            return Err(SmcResult::NotReadable);
        }
        if data.len() != meta.size as usize {
            return Err(SmcResult::KeySizeMismatch);
        }
        match value.write(data) {
            SmcResult::Success => Ok(()),
            other => Err(other),
        }
    }

    /// Report a key's metadata without running its read hook or consuming
    /// the unlock flag.
    pub fn describe(&self, key: SmcKey) -> Result<KeyInfo, SmcResult> {
        let unlocked = self.unlocked.load(Ordering::Acquire);
        let located = self.locate(key).ok_or_else(|| self.missing(key))?;
        let meta = self.backing(&located).meta();
        let mut attr = meta.attr - KeyAttributes::CONST;
        if !unlocked {
            if attr.contains(KeyAttributes::PRIVATE_READ) {
                attr -= KeyAttributes::READ;
            }
            if attr.contains(KeyAttributes::PRIVATE_WRITE) {
                attr -= KeyAttributes::WRITE;
            }
        }
        Ok(KeyInfo {
            size: meta.size,
            key_type: meta.key_type,
            attr,
        })
    }

    /// Enumeration ordinal over core-public keys (sorted) followed by
    /// plugin-public keys in registration order.
    pub fn key_at_index(&self, index: u32) -> Result<SmcKey, SmcResult> {
        let mut remaining = index as usize;
        if remaining < self.public.len() {
            return Ok(self.public[remaining].key);
        }
        remaining -= self.public.len();
        for plugin in self.plugins.iter().filter_map(|slot| slot.get()) {
            for entry in &plugin.public {
                if entry.transplanted.load(Ordering::Acquire) {
                    continue;
                }
                if remaining == 0 {
                    return Ok(entry.key);
                }
                remaining -= 1;
            }
        }
        Err(SmcResult::NotFound)
    }

    pub fn public_key_count(&self) -> u32 {
        self.public_count.load(Ordering::Acquire)
    }

    fn count_public(&self) -> u32 {
        let ext: usize = self
            .plugins
            .iter()
            .filter_map(|slot| slot.get())
            .map(|plugin| {
                plugin
                    .public
                    .iter()
                    .filter(|e| !e.transplanted.load(Ordering::Acquire))
                    .count()
            })
            .sum();
        (self.public.len() + ext) as u32
    }

    /// Install a plugin into the first free slot and override any colliding
    /// core keys.
    ///
    /// # Panics
    ///
    /// Overriding a key that already carries an override is a contract
    /// violation between plugins and halts the device.
    pub fn register_plugin(&self, def: PluginDef) -> Result<(), RegisterError> {
        let to_entries = |list: Vec<(SmcKey, Arc<dyn KeyBacking>)>| {
            list.into_iter()
                .map(|(key, value)| PluginEntry {
                    key,
                    value,
                    transplanted: AtomicBool::new(false),
                })
                .collect::<Vec<_>>()
        };
        let mut pending = PluginSlot {
            name: def.name,
            public: to_entries(def.public),
            hidden: to_entries(def.hidden),
        };

        let mut installed = None;
        for (i, cell) in self.plugins.iter().enumerate() {
            match cell.set(pending) {
                Ok(()) => {
                    installed = Some(i);
                    break;
                }
                Err(back) => pending = back,
            }
        }
        let Some(slot_index) = installed else {
            tracing::warn!(target: "kstore", "plugin registration rejected, no free slot");
            return Err(RegisterError::NoFreeSlot);
        };
        let Some(plugin) = self.plugins[slot_index].get() else {
            unreachable!("slot filled above");
        };
        tracing::debug!(
            target: "kstore",
            plugin = %plugin.name,
            slot = slot_index,
            public = plugin.public.len(),
            hidden = plugin.hidden.len(),
            "plugin registered"
        );

        for (hidden, part, entries) in [
            (false, &self.public, &plugin.public),
            (true, &self.hidden, &plugin.hidden),
        ] {
            for (index, entry) in entries.iter().enumerate() {
                let Ok(pos) = part.binary_search_by_key(&entry.key, |e| e.key) else {
                    continue;
                };
                let core = &part[pos];
                let old = core
                    .active
                    .swap(plugin_handle(slot_index, hidden, index), Ordering::AcqRel);
                if core
                    .backup
                    .compare_exchange(NO_VALUE, old, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    tracing::error!(
                        target: "kstore",
                        key = %entry.key,
                        plugin = %plugin.name,
                        "second override of one key, halting"
                    );
                    panic!("double override of key {}", entry.key);
                }
                entry.transplanted.store(true, Ordering::Release);
                tracing::debug!(target: "kstore", key = %entry.key, "override installed");
            }
        }

        self.public_count
            .store(self.count_public(), Ordering::Release);
        Ok(())
    }

    /// Core entries whose active value participates in the save/restore
    /// blob.
    pub(crate) fn serializable_entries(&self) -> Vec<(SmcKey, &Arc<dyn KeyBacking>)> {
        self.public
            .iter()
            .chain(self.hidden.iter())
            .map(|entry| (entry.key, self.resolve(entry.active.load(Ordering::Acquire))))
            .filter(|(_, value)| value.serializable())
            .collect()
    }

    /// Direct backing lookup for snapshot restore; bypasses the attribute
    /// and unlock gates.
    pub(crate) fn backing_of(&self, key: SmcKey) -> Option<&Arc<dyn KeyBacking>> {
        let located = self.locate(key)?;
        Some(self.backing(&located))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SmcKey {
        SmcKey::from_chars(*b"TEST")
    }

    fn store_with(defs: Vec<KeyDef>) -> Keystore {
        Keystore::new(KeystoreConfig::default(), KeystoreCallbacks::default(), defs)
            .unwrap()
    }

    fn plain_test_key() -> KeyDef {
        KeyDef::new(
            test_key(),
            SmcKeyType::UI16,
            KeyAttributes::READ | KeyAttributes::WRITE,
            &[0, 0],
        )
    }

    #[test]
    fn write_then_read_round_trips() {
        let store = store_with(vec![plain_test_key()]);
        store.write(test_key(), &[0x03, 0xe8]).unwrap();
        let value = store.read(test_key()).unwrap();
        assert_eq!(value.bytes(), &[0x03, 0xe8]);
    }

    #[test]
    fn size_mismatch_and_missing_keys_are_reported() {
        let store = store_with(vec![plain_test_key()]);
        assert_eq!(
            store.write(test_key(), &[1]),
            Err(SmcResult::KeySizeMismatch)
        );
        assert_eq!(
            store.read(SmcKey::from_chars(*b"NOPE")),
            Err(SmcResult::NotFound)
        );
    }

    #[test]
    fn const_keys_reject_writes_and_hide_const_in_describe() {
        let store = store_with(vec![]);
        let rgen = SmcKey::from_chars(*b"RGEN");
        assert_eq!(store.write(rgen, &[9]), Err(SmcResult::NotWritable));
        let info = store.describe(rgen).unwrap();
        assert!(!info.attr.contains(KeyAttributes::CONST));
        assert!(info.attr.contains(KeyAttributes::READ));
    }

    #[test]
    fn unlock_is_single_use() {
        let secret = KeyDef::new(
            SmcKey::from_chars(*b"SECR"),
            SmcKeyType::UI8,
            KeyAttributes::READ | KeyAttributes::PRIVATE_READ,
            &[0x5a],
        )
        .hidden();
        let store = store_with(vec![secret]);
        let secr = SmcKey::from_chars(*b"SECR");

        assert_eq!(store.read(secr), Err(SmcResult::NotReadable));
        store
            .write(KEY_KPPW, b"SMC The place to be, definitely!")
            .unwrap();
        assert_eq!(store.read(secr).unwrap().bytes(), &[0x5a]);
        assert_eq!(store.read(secr), Err(SmcResult::NotReadable));
    }

    #[test]
    fn describe_peeks_without_consuming_the_unlock() {
        let secret = KeyDef::new(
            SmcKey::from_chars(*b"SECR"),
            SmcKeyType::UI8,
            KeyAttributes::READ | KeyAttributes::PRIVATE_READ,
            &[1],
        );
        let store = store_with(vec![secret]);
        let secr = SmcKey::from_chars(*b"SECR");

        let info = store.describe(secr).unwrap();
        assert!(!info.attr.contains(KeyAttributes::READ));

        store
            .write(KEY_KPPW, b"SMC The place to be, definitely!")
            .unwrap();
        let info = store.describe(secr).unwrap();
        assert!(info.attr.contains(KeyAttributes::READ));
        // The peek must not have burned the unlock.
        assert_eq!(store.read(secr).unwrap().bytes(), &[1]);
    }

    #[test]
    fn wrong_passphrase_keeps_the_store_locked() {
        let secret = KeyDef::new(
            SmcKey::from_chars(*b"SECR"),
            SmcKeyType::UI8,
            KeyAttributes::READ | KeyAttributes::PRIVATE_READ,
            &[1],
        );
        let store = store_with(vec![secret]);
        store.write(KEY_KPPW, b"not the passphrase, but 32 bytes").unwrap();
        assert_eq!(
            store.read(SmcKey::from_chars(*b"SECR")),
            Err(SmcResult::NotReadable)
        );
    }

    #[test]
    fn reserved_and_invalid_defs_are_rejected() {
        let bogus = KeyDef::new(
            KEY_KPPW,
            SmcKeyType::CH8S,
            KeyAttributes::WRITE,
            &[0; 16],
        );
        assert!(matches!(
            Keystore::new(
                KeystoreConfig::default(),
                KeystoreCallbacks::default(),
                vec![bogus]
            ),
            Err(KeystoreError::ReservedKey { .. })
        ));

        let mut oversized = plain_test_key();
        oversized.size = 33;
        oversized.initial = vec![0; 33];
        assert!(matches!(
            Keystore::new(
                KeystoreConfig::default(),
                KeystoreCallbacks::default(),
                vec![oversized]
            ),
            Err(KeystoreError::InvalidKeyDef { .. })
        ));
    }

    #[test]
    fn persistent_const_defs_are_rejected() {
        // A blob restore bypasses the attribute gate, so this combination
        // would let a snapshot mutate a read-only value.
        let def = KeyDef::new(
            test_key(),
            SmcKeyType::UI16,
            KeyAttributes::CONST | KeyAttributes::READ,
            &[0, 0],
        )
        .serialized();
        assert!(matches!(
            Keystore::new(
                KeystoreConfig::default(),
                KeystoreCallbacks::default(),
                vec![def]
            ),
            Err(KeystoreError::PersistentConstKey { .. })
        ));
    }

    fn ro_value(byte: u8) -> Arc<dyn KeyBacking> {
        Arc::new(BufferValue::new(
            SmcKeyType::UI8,
            KeyAttributes::READ,
            &[byte],
        ))
    }

    #[test]
    fn plugin_override_swaps_the_active_value() {
        let store = store_with(vec![plain_test_key()]);
        let count_before = store.public_key_count();

        let rw = Arc::new(BufferValue::new(
            SmcKeyType::UI16,
            KeyAttributes::READ | KeyAttributes::WRITE,
            &[0xaa, 0xbb],
        ));
        store
            .register_plugin(PluginDef {
                name: "sensors".into(),
                public: vec![
                    (test_key(), rw as Arc<dyn KeyBacking>),
                    (SmcKey::from_chars(*b"F0Ac"), ro_value(7)),
                ],
                hidden: vec![],
            })
            .unwrap();

        // Overridden key reads the plugin's value; the plugin-only key is
        // reachable by fallthrough; the count grew by the non-colliding key.
        assert_eq!(store.read(test_key()).unwrap().bytes(), &[0xaa, 0xbb]);
        assert_eq!(
            store.read(SmcKey::from_chars(*b"F0Ac")).unwrap().bytes(),
            &[7]
        );
        assert_eq!(store.public_key_count(), count_before + 1);
    }

    #[test]
    fn enumeration_skips_transplanted_entries() {
        let store = store_with(vec![plain_test_key()]);
        store
            .register_plugin(PluginDef {
                name: "sensors".into(),
                public: vec![
                    (test_key(), ro_value(1)),
                    (SmcKey::from_chars(*b"F0Ac"), ro_value(2)),
                ],
                hidden: vec![],
            })
            .unwrap();

        let count = store.public_key_count();
        let mut seen = Vec::new();
        for i in 0..count {
            seen.push(store.key_at_index(i).unwrap());
        }
        assert_eq!(store.key_at_index(count), Err(SmcResult::NotFound));
        // TEST appears once (core slot), F0Ac once (plugin tail).
        assert_eq!(seen.iter().filter(|k| **k == test_key()).count(), 1);
        assert_eq!(
            seen.iter()
                .filter(|k| **k == SmcKey::from_chars(*b"F0Ac"))
                .count(),
            1
        );
        // Core section stays sorted.
        let core: Vec<_> = seen[..seen.len() - 1].to_vec();
        let mut sorted = core.clone();
        sorted.sort();
        assert_eq!(core, sorted);
    }

    #[test]
    #[should_panic(expected = "double override")]
    fn second_override_of_one_key_is_fatal() {
        let store = store_with(vec![plain_test_key()]);
        for name in ["first", "second"] {
            let _ = store.register_plugin(PluginDef {
                name: name.into(),
                public: vec![(test_key(), ro_value(0))],
                hidden: vec![],
            });
        }
    }

    #[test]
    fn plugin_slots_are_bounded() {
        let store = store_with(vec![]);
        for i in 0..MAX_PLUGINS {
            store
                .register_plugin(PluginDef {
                    name: format!("p{i}"),
                    public: vec![],
                    hidden: vec![],
                })
                .unwrap();
        }
        assert!(matches!(
            store.register_plugin(PluginDef {
                name: "overflow".into(),
                public: vec![],
                hidden: vec![],
            }),
            Err(RegisterError::NoFreeSlot)
        ));
    }

    #[test]
    fn key_count_value_tracks_the_store() {
        let store = store_with(vec![plain_test_key()]);
        let value = store.read(SmcKey::from_chars(*b"#KEY")).unwrap();
        let mut count = [0u8; 4];
        count.copy_from_slice(value.bytes());
        assert_eq!(u32::from_be_bytes(count), store.public_key_count());
    }
}
