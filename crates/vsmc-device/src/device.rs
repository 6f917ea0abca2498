//! The device context: keystore, engines, event queue and watchdog wired
//! together, with process-wide single-instance enforcement and the power
//! transition hooks.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use vsmc_keystore::{
    Clock, KeyDef, Keystore, KeystoreCallbacks, KeystoreConfig, KeystoreError, SystemClock,
};
use vsmc_types::{EventCode, Generation, WatchdogJob};

use crate::events::{EventQueue, DEFAULT_EVENT_CAPACITY};
use crate::io::IoPortBus;
use crate::irq::{IrqLine, NoIrq};
use crate::mmio::MmioEngine;
use crate::pmio::{register_pmio, PmioEngine};
use crate::watchdog::{Watchdog, WatchdogCallbacks};

/// The host driver binds to exactly one controller; a second instance in
/// the same process is a wiring bug.
static CLAIMED: AtomicBool = AtomicBool::new(false);

/// Persistence for the keystore blob across power transitions.
pub trait SnapshotStore {
    fn save(&mut self, blob: &[u8]);
    fn load(&mut self) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub keystore: KeystoreConfig,
    pub event_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            keystore: KeystoreConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

pub struct DeviceCallbacks {
    pub clock: Arc<dyn Clock>,
    /// Driven on every event-delivery opportunity.
    pub event_irq: Box<dyn IrqLine>,
    pub watchdog: WatchdogCallbacks,
    /// When present, the keystore blob is saved on power-off and restored
    /// on power-on.
    pub snapshots: Option<Box<dyn SnapshotStore>>,
}

impl Default for DeviceCallbacks {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock::new()),
            event_irq: Box::new(NoIrq),
            watchdog: WatchdogCallbacks::default(),
            snapshots: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("an SMC device is already instantiated in this process")]
    AlreadyInstantiated,
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
}

pub struct SmcDevice {
    config: DeviceConfig,
    keystore: Arc<Keystore>,
    events: Rc<RefCell<EventQueue>>,
    pmio: Rc<RefCell<PmioEngine>>,
    /// Present from generation V2 on.
    mmio: Option<Rc<RefCell<MmioEngine>>>,
    watchdog: Arc<Watchdog>,
    snapshots: Option<Box<dyn SnapshotStore>>,
    clock: Arc<dyn Clock>,
    last_power_on_ns: Option<u64>,
    last_power_off_ns: Option<u64>,
}

impl SmcDevice {
    pub fn new(
        config: DeviceConfig,
        callbacks: DeviceCallbacks,
        keys: Vec<KeyDef>,
    ) -> Result<Self, DeviceError> {
        if CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::error!(target: "vsmc", "refusing a second device instance");
            return Err(DeviceError::AlreadyInstantiated);
        }
        match Self::build(config, callbacks, keys) {
            Ok(device) => Ok(device),
            Err(err) => {
                CLAIMED.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    fn build(
        config: DeviceConfig,
        callbacks: DeviceCallbacks,
        keys: Vec<KeyDef>,
    ) -> Result<Self, DeviceError> {
        let clock = callbacks.clock;
        let watchdog = Arc::new(Watchdog::new(clock.clone(), callbacks.watchdog));
        let keystore = Arc::new(Keystore::new(
            config.keystore.clone(),
            KeystoreCallbacks {
                clock: clock.clone(),
                watchdog: watchdog.clone(),
            },
            keys,
        )?);
        let events = Rc::new(RefCell::new(EventQueue::new(
            config.event_capacity,
            callbacks.event_irq,
        )));
        let pmio = Rc::new(RefCell::new(PmioEngine::new(keystore.clone())));
        let mmio = (config.keystore.generation == Generation::V2).then(|| {
            Rc::new(RefCell::new(MmioEngine::new(
                keystore.clone(),
                events.clone(),
            )))
        });
        tracing::debug!(
            target: "vsmc",
            generation = config.keystore.generation.number(),
            mmio = mmio.is_some(),
            "device instantiated"
        );
        Ok(Self {
            config,
            keystore,
            events,
            pmio,
            mmio,
            watchdog,
            snapshots: callbacks.snapshots,
            clock,
            last_power_on_ns: None,
            last_power_off_ns: None,
        })
    }

    pub fn generation(&self) -> Generation {
        self.config.keystore.generation
    }

    pub fn keystore(&self) -> &Arc<Keystore> {
        &self.keystore
    }

    pub fn events(&self) -> &Rc<RefCell<EventQueue>> {
        &self.events
    }

    pub fn pmio(&self) -> &Rc<RefCell<PmioEngine>> {
        &self.pmio
    }

    pub fn mmio(&self) -> Option<&Rc<RefCell<MmioEngine>>> {
        self.mmio.as_ref()
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    /// Map the PMIO window at the configured port base.
    pub fn attach_pmio(&self, bus: &mut IoPortBus) {
        register_pmio(bus, self.config.keystore.port_base, self.pmio.clone());
    }

    pub fn post_event(&self, code: EventCode, payload: &[u8]) -> bool {
        self.events.borrow_mut().post(code, payload)
    }

    pub fn set_events_enabled(&self, enabled: bool) {
        self.events.borrow_mut().set_enabled(enabled);
    }

    /// Deliver the queue head for PMIO-only generations. With MMIO present
    /// delivery happens when the host reads the event-status field, so this
    /// is a no-op there.
    pub fn deliver_event(&self) {
        if self.mmio.is_some() {
            return;
        }
        let event = self.events.borrow_mut().consume();
        if let Some(event) = event {
            self.pmio.borrow_mut().set_event(&event);
        }
    }

    /// Fire the watchdog if its deadline passed.
    pub fn poll_watchdog(&self) -> Option<WatchdogJob> {
        self.watchdog.poll()
    }

    pub fn handle_power_on(&mut self) {
        self.last_power_on_ns = Some(self.clock.now_ns());
        if let Some(store) = self.snapshots.as_mut() {
            if let Some(blob) = store.load() {
                if let Err(err) = self.keystore.load_snapshot(&blob) {
                    tracing::warn!(target: "vsmc", %err, "snapshot restore failed");
                }
            }
        }
        self.set_events_enabled(true);
        tracing::debug!(target: "vsmc", "power on");
    }

    pub fn handle_power_off(&mut self) {
        self.last_power_off_ns = Some(self.clock.now_ns());
        self.set_events_enabled(false);
        if let Some(store) = self.snapshots.as_mut() {
            store.save(&self.keystore.store_snapshot());
        }
        tracing::debug!(target: "vsmc", "power off");
    }

    pub fn last_power_on_ns(&self) -> Option<u64> {
        self.last_power_on_ns
    }

    pub fn last_power_off_ns(&self) -> Option<u64> {
        self.last_power_off_ns
    }
}

impl Drop for SmcDevice {
    fn drop(&mut self) {
        CLAIMED.store(false, Ordering::Release);
    }
}
