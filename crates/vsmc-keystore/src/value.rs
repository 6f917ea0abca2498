//! Value backings: the plain buffer variant and the computed variants the
//! predefined key set needs.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use vsmc_types::{KeyAttributes, SmcKeyType, SmcResult, WatchdogJob, MAX_VALUE_SIZE};

use crate::clock::Clock;

/// V1 unlock passphrase (`KPPW`, 16 bytes).
pub const UNLOCK_PASSWORD_V1: &[u8; 16] = b"SpecialisRevelio";
/// V2 unlock passphrase (`KPPW`, 32 bytes).
pub const UNLOCK_PASSWORD_V2: &[u8; 32] = b"SMC The place to be, definitely!";

/// Size, type code and attribute mask of one key's value.
#[derive(Debug, Clone, Copy)]
pub struct ValueMeta {
    pub size: u8,
    pub key_type: SmcKeyType,
    pub attr: KeyAttributes,
}

/// Behavior behind one key. Plain values store bytes; computed values run
/// arbitrary logic in their hooks. Attribute and size gating happens in the
/// keystore before the hooks run, so implementations only deal with payloads
/// of exactly `meta().size` bytes.
pub trait KeyBacking: Send + Sync {
    fn meta(&self) -> ValueMeta;

    /// Fill `out` (length `meta().size`) with the current value.
    fn read(&self, out: &mut [u8]) -> SmcResult;

    /// Accept a new value (`data` is exactly `meta().size` bytes).
    fn write(&self, data: &[u8]) -> SmcResult;

    /// Whether this value participates in the save/restore blob. Only plain
    /// buffers with side-effect-free hooks opt in.
    fn serializable(&self) -> bool {
        false
    }
}

/// Plain stored bytes behind a mutex.
pub struct BufferValue {
    meta: ValueMeta,
    data: Mutex<[u8; MAX_VALUE_SIZE]>,
    persist: bool,
}

impl BufferValue {
    /// Value sized to its initial contents.
    ///
    /// # Panics
    ///
    /// If `initial` is empty or longer than [`MAX_VALUE_SIZE`]; sizes are
    /// compile-time constants on every call site.
    pub fn new(key_type: SmcKeyType, attr: KeyAttributes, initial: &[u8]) -> Self {
        Self::with_size(initial.len() as u8, key_type, attr, initial)
    }

    /// Value of explicit size, zero-padded past `initial`.
    pub fn with_size(size: u8, key_type: SmcKeyType, attr: KeyAttributes, initial: &[u8]) -> Self {
        assert!(size as usize <= MAX_VALUE_SIZE && initial.len() <= size as usize);
        assert!(size > 0);
        let mut data = [0u8; MAX_VALUE_SIZE];
        data[..initial.len()].copy_from_slice(initial);
        Self {
            meta: ValueMeta {
                size,
                key_type,
                attr,
            },
            data: Mutex::new(data),
            persist: false,
        }
    }

    /// Mark the value for inclusion in the save/restore blob.
    pub fn persistent(mut self) -> Self {
        self.persist = true;
        self
    }
}

impl KeyBacking for BufferValue {
    fn meta(&self) -> ValueMeta {
        self.meta
    }

    fn read(&self, out: &mut [u8]) -> SmcResult {
        let data = lock(&self.data);
        out.copy_from_slice(&data[..out.len()]);
        SmcResult::Success
    }

    fn write(&self, data: &[u8]) -> SmcResult {
        let mut stored = lock(&self.data);
        stored[..data.len()].copy_from_slice(data);
        SmcResult::Success
    }

    fn serializable(&self) -> bool {
        self.persist
    }
}

/// `#KEY`: public key count, big-endian u32, refreshed by the keystore on
/// plugin registration.
pub struct KeyCountValue {
    count: Arc<AtomicU32>,
}

impl KeyCountValue {
    pub(crate) fn new(count: Arc<AtomicU32>) -> Self {
        Self { count }
    }
}

impl KeyBacking for KeyCountValue {
    fn meta(&self) -> ValueMeta {
        ValueMeta {
            size: 4,
            key_type: SmcKeyType::UI32,
            attr: KeyAttributes::CONST | KeyAttributes::READ,
        }
    }

    fn read(&self, out: &mut [u8]) -> SmcResult {
        out.copy_from_slice(&self.count.load(Ordering::Acquire).to_be_bytes());
        SmcResult::Success
    }

    fn write(&self, _data: &[u8]) -> SmcResult {
        SmcResult::NotWritable
    }
}

/// `KPST` (hidden): reads the unlock flag without consuming it; the keystore
/// itself consumes the flag on the way into this read, so through the wire
/// this reports whether a *further* privileged operation would be admitted.
pub struct UnlockStateValue {
    unlocked: Arc<AtomicBool>,
}

impl UnlockStateValue {
    pub(crate) fn new(unlocked: Arc<AtomicBool>) -> Self {
        Self { unlocked }
    }
}

impl KeyBacking for UnlockStateValue {
    fn meta(&self) -> ValueMeta {
        ValueMeta {
            size: 1,
            key_type: SmcKeyType::UI8,
            attr: KeyAttributes::READ,
        }
    }

    fn read(&self, out: &mut [u8]) -> SmcResult {
        out[0] = self.unlocked.load(Ordering::Acquire) as u8;
        SmcResult::Success
    }

    fn write(&self, _data: &[u8]) -> SmcResult {
        SmcResult::NotWritable
    }
}

/// `KPPW` (hidden): arms the single-use unlock flag when the written payload
/// matches the generation passphrase, disarms it otherwise.
pub struct UnlockValue {
    unlocked: Arc<AtomicBool>,
    password: &'static [u8],
}

impl UnlockValue {
    pub(crate) fn new(unlocked: Arc<AtomicBool>, password: &'static [u8]) -> Self {
        Self { unlocked, password }
    }
}

impl KeyBacking for UnlockValue {
    fn meta(&self) -> ValueMeta {
        ValueMeta {
            size: self.password.len() as u8,
            key_type: SmcKeyType::CH8S,
            attr: KeyAttributes::WRITE,
        }
    }

    fn read(&self, _out: &mut [u8]) -> SmcResult {
        SmcResult::NotReadable
    }

    fn write(&self, data: &[u8]) -> SmcResult {
        let armed = data == self.password;
        if !armed && !vsmc_trap::in_fault_context() {
            tracing::warn!(target: "kstore", "unlock attempt with a wrong passphrase");
        }
        self.unlocked.store(armed, Ordering::Release);
        SmcResult::Success
    }
}

/// Job sink the watchdog keys post into; implemented by the device context.
pub trait WatchdogSink: Send + Sync {
    fn post_job(&self, job: WatchdogJob, timeout_ms: u64);
}

/// Sink for embedders without watchdog wiring.
pub struct NoWatchdog;

impl WatchdogSink for NoWatchdog {
    fn post_job(&self, _job: WatchdogJob, _timeout_ms: u64) {}
}

struct TimerState {
    countdown_secs: u16,
    armed_at_ns: Option<u64>,
}

/// `NATi` / `OSWD`: watchdog countdown in seconds, big-endian u16. A read
/// recomputes the remaining time from the clock; a write re-arms (and, when
/// the value carries a sink, posts the restart job the way `OSWD` does).
pub struct WatchdogTimerValue {
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn WatchdogSink>>,
    state: Mutex<TimerState>,
}

impl WatchdogTimerValue {
    pub(crate) fn new(clock: Arc<dyn Clock>, sink: Option<Arc<dyn WatchdogSink>>) -> Self {
        Self {
            clock,
            sink,
            state: Mutex::new(TimerState {
                countdown_secs: 0,
                armed_at_ns: None,
            }),
        }
    }

    /// Start the countdown from its stored value; returns the timeout in
    /// seconds. Used by the job key.
    fn arm(&self) -> u16 {
        let mut state = lock(&self.state);
        state.armed_at_ns = Some(self.clock.now_ns());
        state.countdown_secs
    }

    fn remaining_secs(&self) -> u16 {
        let state = lock(&self.state);
        match state.armed_at_ns {
            Some(t0) => {
                let elapsed = (self.clock.now_ns().saturating_sub(t0) / 1_000_000_000) as u64;
                state.countdown_secs.saturating_sub(elapsed.min(u16::MAX as u64) as u16)
            }
            None => state.countdown_secs,
        }
    }
}

impl KeyBacking for WatchdogTimerValue {
    fn meta(&self) -> ValueMeta {
        ValueMeta {
            size: 2,
            key_type: SmcKeyType::UI16,
            attr: KeyAttributes::READ | KeyAttributes::WRITE,
        }
    }

    fn read(&self, out: &mut [u8]) -> SmcResult {
        out.copy_from_slice(&self.remaining_secs().to_be_bytes());
        SmcResult::Success
    }

    fn write(&self, data: &[u8]) -> SmcResult {
        let countdown = u16::from_be_bytes([data[0], data[1]]);
        {
            let mut state = lock(&self.state);
            state.countdown_secs = countdown;
            state.armed_at_ns = (countdown > 0).then(|| self.clock.now_ns());
        }
        if let Some(sink) = &self.sink {
            let job = if countdown > 0 {
                WatchdogJob::ForceRestart
            } else {
                WatchdogJob::DoNothing
            };
            sink.post_job(job, u64::from(countdown) * 1000);
        }
        SmcResult::Success
    }
}

/// `NATJ`: writing a job code arms the watchdog with the current `NATi`
/// countdown.
pub struct WatchdogJobValue {
    timer: Arc<WatchdogTimerValue>,
    sink: Arc<dyn WatchdogSink>,
    job: Mutex<u8>,
}

impl WatchdogJobValue {
    pub(crate) fn new(timer: Arc<WatchdogTimerValue>, sink: Arc<dyn WatchdogSink>) -> Self {
        Self {
            timer,
            sink,
            job: Mutex::new(WatchdogJob::DoNothing.code()),
        }
    }
}

impl KeyBacking for WatchdogJobValue {
    fn meta(&self) -> ValueMeta {
        ValueMeta {
            size: 1,
            key_type: SmcKeyType::UI8,
            attr: KeyAttributes::READ | KeyAttributes::WRITE,
        }
    }

    fn read(&self, out: &mut [u8]) -> SmcResult {
        out[0] = *lock(&self.job);
        SmcResult::Success
    }

    fn write(&self, data: &[u8]) -> SmcResult {
        let Some(job) = WatchdogJob::from_u8(data[0]) else {
            return SmcResult::BadParameter;
        };
        *lock(&self.job) = data[0];
        let timeout_secs = self.timer.arm();
        self.sink.post_job(job, u64::from(timeout_secs) * 1000);
        SmcResult::Success
    }
}

/// Mutex recovery: value state stays usable even if a hook panicked mid-write
/// on another thread.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn buffer_value_round_trips() {
        let v = BufferValue::new(
            SmcKeyType::UI16,
            KeyAttributes::READ | KeyAttributes::WRITE,
            &[0x00, 0x00],
        );
        assert_eq!(v.write(&[0x03, 0xe8]), SmcResult::Success);
        let mut out = [0u8; 2];
        assert_eq!(v.read(&mut out), SmcResult::Success);
        assert_eq!(out, [0x03, 0xe8]);
    }

    #[test]
    fn unlock_value_arms_only_on_the_exact_passphrase() {
        let flag = Arc::new(AtomicBool::new(false));
        let v = UnlockValue::new(flag.clone(), UNLOCK_PASSWORD_V1);
        assert_eq!(v.write(b"SpecialisRevelio"), SmcResult::Success);
        assert!(flag.load(Ordering::Acquire));
        assert_eq!(v.write(b"specialisrevelio"), SmcResult::Success);
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn timer_counts_down_against_the_clock() {
        let clock = Arc::new(ManualClock::new());
        let timer = WatchdogTimerValue::new(clock.clone(), None);
        assert_eq!(timer.write(&[0x00, 0x0a]), SmcResult::Success);
        clock.advance_secs(3);
        let mut out = [0u8; 2];
        assert_eq!(timer.read(&mut out), SmcResult::Success);
        assert_eq!(u16::from_be_bytes(out), 7);
        clock.advance_secs(20);
        assert_eq!(timer.read(&mut out), SmcResult::Success);
        assert_eq!(u16::from_be_bytes(out), 0);
    }

    struct RecordingSink {
        posts: StdMutex<Vec<(WatchdogJob, u64)>>,
    }

    impl WatchdogSink for RecordingSink {
        fn post_job(&self, job: WatchdogJob, timeout_ms: u64) {
            self.posts.lock().unwrap().push((job, timeout_ms));
        }
    }

    #[test]
    fn job_write_arms_the_timer_and_posts() {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(RecordingSink {
            posts: StdMutex::new(Vec::new()),
        });
        let timer = Arc::new(WatchdogTimerValue::new(clock.clone(), None));
        assert_eq!(timer.write(&[0x00, 0x05]), SmcResult::Success);

        let job = WatchdogJobValue::new(timer, sink.clone());
        assert_eq!(
            job.write(&[WatchdogJob::ForceRestart.code()]),
            SmcResult::Success
        );
        assert_eq!(job.write(&[0x77]), SmcResult::BadParameter);
        assert_eq!(
            *sink.posts.lock().unwrap(),
            vec![(WatchdogJob::ForceRestart, 5000)]
        );
    }
}
