//! Test doubles shared by the unit tests.

use crate::actuator::{RestartActuator, RestartSignal};
use crate::hang::Heartbeat;
use crate::interceptor::{HangInterceptor, HookInstaller, UncaughtFailureHandler};
use crate::process::ProcessExit;
use crate::timer::{AlarmError, AlarmFacility, TimerKind};
use crate::watchdog::Watchdog;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// In-memory alarm facility: one pending fire per kind.
#[derive(Default)]
pub struct RecordingAlarms {
    pending: Mutex<HashMap<TimerKind, DateTime<Utc>>>,
    failing: bool,
}

impl RecordingAlarms {
    /// A facility whose every call errors.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn pending(&self, kind: TimerKind) -> Option<DateTime<Utc>> {
        self.pending.lock().unwrap().get(&kind).copied()
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.pending(kind).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl AlarmFacility for RecordingAlarms {
    fn arm(&self, kind: TimerKind, fire_at: DateTime<Utc>) -> Result<(), AlarmError> {
        if self.failing {
            return Err(AlarmError::Unavailable("test".to_string()));
        }
        self.pending.lock().unwrap().insert(kind, fire_at);
        Ok(())
    }

    fn cancel(&self, kind: TimerKind) -> Result<(), AlarmError> {
        if self.failing {
            return Err(AlarmError::Unavailable("test".to_string()));
        }
        self.pending.lock().unwrap().remove(&kind);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingActuator {
    signals: Mutex<Vec<RestartSignal>>,
}

impl RecordingActuator {
    pub fn signals(&self) -> Vec<RestartSignal> {
        self.signals.lock().unwrap().clone()
    }
}

impl RestartActuator for RecordingActuator {
    fn bring_to_front(&self, signal: RestartSignal) {
        self.signals.lock().unwrap().push(signal);
    }
}

/// Actuator that marks the primary unit active again, re-entering the core.
#[derive(Default)]
pub struct ReentrantActuator {
    watchdog: Mutex<Weak<Watchdog>>,
}

impl ReentrantActuator {
    pub fn attach(&self, watchdog: &Arc<Watchdog>) {
        *self.watchdog.lock().unwrap() = Arc::downgrade(watchdog);
    }
}

impl RestartActuator for ReentrantActuator {
    fn bring_to_front(&self, _signal: RestartSignal) {
        let watchdog = self.watchdog.lock().unwrap().upgrade();
        if let Some(watchdog) = watchdog {
            watchdog.unit_started("main");
        }
    }
}

#[derive(Default)]
pub struct RecordingExit {
    codes: Mutex<Vec<i32>>,
}

impl RecordingExit {
    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().unwrap().clone()
    }
}

impl ProcessExit for RecordingExit {
    fn terminate(&self, code: i32) {
        self.codes.lock().unwrap().push(code);
    }
}

/// Hook installer that counts installs and keeps the handed-over references.
#[derive(Default)]
pub struct CountingHooks {
    installs: AtomicUsize,
    hang: Mutex<Option<Weak<dyn HangInterceptor>>>,
    crash: Mutex<Option<Weak<dyn UncaughtFailureHandler>>>,
}

impl CountingHooks {
    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    /// Invoke the installed hang interceptor, if it is still alive.
    pub fn trigger_hang(&self, hang: Duration) -> Option<Duration> {
        let interceptor = self.hang.lock().unwrap().as_ref()?.upgrade()?;
        Some(interceptor.on_hang_detected(hang))
    }

    pub fn has_crash_handler(&self) -> bool {
        self.crash
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|weak| weak.upgrade().is_some())
    }
}

impl HookInstaller for CountingHooks {
    fn install(&self, crash: Weak<dyn UncaughtFailureHandler>, hang: Weak<dyn HangInterceptor>) {
        self.installs.fetch_add(1, Ordering::SeqCst);
        *self.crash.lock().unwrap() = Some(crash);
        *self.hang.lock().unwrap() = Some(hang);
    }
}

/// Hang interceptor returning `budget - hang`, optionally beating a heartbeat
/// to simulate the main context recovering.
pub struct FixedInterceptor {
    budget: Duration,
    calls: AtomicUsize,
    beat: Option<Arc<Heartbeat>>,
}

impl FixedInterceptor {
    pub fn budget(budget: Duration) -> Self {
        Self {
            budget,
            calls: AtomicUsize::new(0),
            beat: None,
        }
    }

    pub fn beating(mut self, heartbeat: Arc<Heartbeat>) -> Self {
        self.beat = Some(heartbeat);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HangInterceptor for FixedInterceptor {
    fn on_hang_detected(&self, hang: Duration) -> Duration {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(heartbeat) = &self.beat {
            heartbeat.beat();
        }
        self.budget.saturating_sub(hang)
    }
}
