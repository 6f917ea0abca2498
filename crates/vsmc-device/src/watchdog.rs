//! Clock-driven watchdog. The `NATJ`/`OSWD` keys post jobs here; the
//! embedder polls against its clock and the due job fires a power callback.

use std::sync::{Arc, Mutex, MutexGuard};

use vsmc_keystore::{Clock, WatchdogSink};
use vsmc_types::WatchdogJob;

/// Power-transition callbacks a due job fires.
#[derive(Default)]
pub struct WatchdogCallbacks {
    pub request_power_off: Option<Box<dyn FnMut() + Send>>,
    pub request_restart: Option<Box<dyn FnMut() + Send>>,
    pub request_startup: Option<Box<dyn FnMut() + Send>>,
}

struct PendingJob {
    job: WatchdogJob,
    deadline_ns: u64,
}

struct Inner {
    pending: Option<PendingJob>,
    /// Set by a final post; later jobs are refused.
    closed: bool,
    callbacks: WatchdogCallbacks,
}

pub struct Watchdog {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl Watchdog {
    pub fn new(clock: Arc<dyn Clock>, callbacks: WatchdogCallbacks) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner {
                pending: None,
                closed: false,
                callbacks,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm (or cancel, for DoNothing) the pending job. A post with `last`
    /// set is accepted and then closes the watchdog for good; firmware uses
    /// it on the way into a power transition.
    pub fn post(&self, job: WatchdogJob, timeout_ms: u64, last: bool) {
        let mut inner = self.lock();
        if inner.closed {
            if crate::can_trace() {
                tracing::warn!(target: "wdog", job = job.code(), "job posted after close, ignoring");
            }
            return;
        }
        if job == WatchdogJob::DoNothing {
            inner.pending = None;
            if crate::can_trace() {
                tracing::debug!(target: "wdog", "watchdog cancelled");
            }
        } else {
            let deadline_ns = self
                .clock
                .now_ns()
                .saturating_add(timeout_ms.saturating_mul(1_000_000));
            if crate::can_trace() {
                tracing::debug!(target: "wdog", job = job.code(), timeout_ms, "watchdog armed");
            }
            inner.pending = Some(PendingJob { job, deadline_ns });
        }
        if last {
            inner.closed = true;
        }
    }

    /// Fire the pending job if its deadline passed. Returns the fired job.
    pub fn poll(&self) -> Option<WatchdogJob> {
        let mut inner = self.lock();
        let due = match &inner.pending {
            Some(pending) if self.clock.now_ns() >= pending.deadline_ns => true,
            _ => false,
        };
        if !due {
            return None;
        }
        let pending = inner.pending.take()?;
        tracing::warn!(target: "wdog", job = pending.job.code(), "watchdog expired");
        let callback = match pending.job {
            WatchdogJob::ShutdownToS5 => inner.callbacks.request_power_off.as_mut(),
            WatchdogJob::ForceRestart => inner.callbacks.request_restart.as_mut(),
            WatchdogJob::ForceStartup => inner.callbacks.request_startup.as_mut(),
            WatchdogJob::DoNothing => None,
        };
        if let Some(callback) = callback {
            callback();
        }
        Some(pending.job)
    }

    pub fn is_armed(&self) -> bool {
        self.lock().pending.is_some()
    }
}

impl WatchdogSink for Watchdog {
    fn post_job(&self, job: WatchdogJob, timeout_ms: u64) {
        self.post(job, timeout_ms, false);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use vsmc_keystore::ManualClock;

    use super::*;

    fn restart_counter() -> (Arc<AtomicU32>, WatchdogCallbacks) {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let callbacks = WatchdogCallbacks {
            request_restart: Some(Box::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            })),
            ..WatchdogCallbacks::default()
        };
        (fired, callbacks)
    }

    #[test]
    fn job_fires_once_at_its_deadline() {
        let clock = Arc::new(ManualClock::new());
        let (fired, callbacks) = restart_counter();
        let wd = Watchdog::new(clock.clone(), callbacks);

        wd.post(WatchdogJob::ForceRestart, 2000, false);
        assert!(wd.poll().is_none());
        clock.advance_ms(1999);
        assert!(wd.poll().is_none());
        clock.advance_ms(1);
        assert_eq!(wd.poll(), Some(WatchdogJob::ForceRestart));
        assert_eq!(fired.load(Ordering::Acquire), 1);
        assert!(wd.poll().is_none());
    }

    #[test]
    fn do_nothing_cancels_and_close_refuses_later_jobs() {
        let clock = Arc::new(ManualClock::new());
        let (fired, callbacks) = restart_counter();
        let wd = Watchdog::new(clock.clone(), callbacks);

        wd.post(WatchdogJob::ForceRestart, 1000, false);
        wd.post(WatchdogJob::DoNothing, 0, false);
        clock.advance_ms(5000);
        assert!(wd.poll().is_none());
        assert_eq!(fired.load(Ordering::Acquire), 0);

        wd.post(WatchdogJob::ForceRestart, 1000, true);
        assert!(wd.is_armed());
        // Closed: this post must not replace the armed job.
        wd.post(WatchdogJob::DoNothing, 0, false);
        clock.advance_ms(1000);
        assert_eq!(wd.poll(), Some(WatchdogJob::ForceRestart));
    }

    #[test]
    fn huge_timeouts_saturate_instead_of_wrapping() {
        let clock = Arc::new(ManualClock::new());
        let (fired, callbacks) = restart_counter();
        let wd = Watchdog::new(clock.clone(), callbacks);

        clock.advance_ms(5);
        wd.post(WatchdogJob::ForceRestart, u64::MAX, false);
        assert!(wd.is_armed());
        // A wrapped deadline would already be in the past.
        assert!(wd.poll().is_none());
        assert_eq!(fired.load(Ordering::Acquire), 0);
    }
}
