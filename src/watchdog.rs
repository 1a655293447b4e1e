/// The watchdog state machine.
///
/// Tracks foreground liveness, keeps the Short and Long alarms armed, and
/// requests a forced respawn whenever a fire finds nothing in the foreground.
/// Crashes and hangs are not recovered in-process: the process is terminated
/// and the alarm held outside it brings it back.
///
/// Two locks: `state` guards decisions and is never held across I/O; `timers`
/// serializes calls into the alarm facility. A transition takes `timers`
/// before releasing `state`, so facility calls run in decision order.
use crate::actuator::{RestartActuator, RestartSignal};
use crate::clock::Clock;
use crate::config::ReviveConfig;
use crate::interceptor::{FailureReport, HangInterceptor, HookInstaller, UncaughtFailureHandler};
use crate::liveness::LivenessTracker;
use crate::process::{ProcessExit, EXIT_CRASH, EXIT_USER};
use crate::timer::{AlarmFacility, TimerKind, TimerReceiver, TimerScheduler};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, TryLockResult, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogMode {
    /// Restarts turned off at construction. Terminal.
    Disabled,
    /// Both timers armed.
    Normal,
    /// Only the Long timer armed, until its next fire.
    BackupMode,
}

/// Everything the watchdog talks to outside itself.
pub struct Collaborators {
    /// `None` when the host has no alarm facility; restarts then cannot happen.
    pub alarms: Option<Arc<dyn AlarmFacility>>,
    pub actuator: Arc<dyn RestartActuator>,
    pub exit: Arc<dyn ProcessExit>,
    pub hooks: Arc<dyn HookInstaller>,
    pub clock: Arc<dyn Clock>,
}

struct CoreState {
    mode: WatchdogMode,
    liveness: LivenessTracker,
    /// Set by `pause()`: in-flight fires still run but re-arm nothing.
    paused: bool,
    hooks_installed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerOp {
    Arm(TimerKind),
    Cancel(TimerKind),
}

const NO_OPS: &[TimerOp] = &[];
const REARM_SHORT: &[TimerOp] = &[TimerOp::Arm(TimerKind::Short)];
const REARM_LONG: &[TimerOp] = &[TimerOp::Arm(TimerKind::Long)];
const ARM_ALL: &[TimerOp] = &[TimerOp::Arm(TimerKind::Short), TimerOp::Arm(TimerKind::Long)];
const CANCEL_ALL: &[TimerOp] = &[
    TimerOp::Cancel(TimerKind::Short),
    TimerOp::Cancel(TimerKind::Long),
];

pub struct Watchdog {
    settle_window: Duration,
    hang_budget: Duration,
    timers: Mutex<TimerScheduler>,
    actuator: Arc<dyn RestartActuator>,
    exit: Arc<dyn ProcessExit>,
    hooks: Arc<dyn HookInstaller>,
    clock: Arc<dyn Clock>,
    state: Mutex<CoreState>,
}

fn recover<'a, T>(result: TryLockResult<MutexGuard<'a, T>>) -> Option<MutexGuard<'a, T>> {
    match result {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

impl Watchdog {
    /// Build the watchdog and, unless restarts are disabled, enter Normal:
    /// install the crash and hang hooks and arm both timers.
    pub fn start(config: &ReviveConfig, collaborators: Collaborators) -> Arc<Self> {
        let Collaborators {
            alarms,
            actuator,
            exit,
            hooks,
            clock,
        } = collaborators;
        let disabled = config.watchdog.restart_disabled;

        let watchdog = Arc::new(Self {
            settle_window: config.watchdog.settle_window(),
            hang_budget: config.hang.budget(),
            timers: Mutex::new(TimerScheduler::new(
                alarms,
                Arc::clone(&clock),
                config.watchdog.short_interval(),
                config.watchdog.long_interval(),
            )),
            actuator,
            exit,
            hooks,
            clock,
            state: Mutex::new(CoreState {
                mode: if disabled {
                    WatchdogMode::Disabled
                } else {
                    WatchdogMode::Normal
                },
                liveness: LivenessTracker::new(),
                paused: false,
                hooks_installed: false,
            }),
        });

        if disabled {
            tracing::warn!("restart disabled");
        } else {
            watchdog.enter_normal();
        }
        watchdog
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Release `state` and run `ops` against the facility, in order.
    fn apply(&self, state: MutexGuard<'_, CoreState>, ops: &[TimerOp]) {
        if ops.is_empty() {
            return;
        }
        let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        drop(state);
        for op in ops {
            match *op {
                TimerOp::Arm(kind) => timers.arm(kind),
                TimerOp::Cancel(kind) => timers.cancel(kind),
            }
        }
    }

    fn enter_normal(self: &Arc<Self>) {
        let mut state = self.lock();
        state.mode = WatchdogMode::Normal;
        state.paused = false;
        let install = !std::mem::replace(&mut state.hooks_installed, true);
        self.apply(state, ARM_ALL);

        if install {
            let crash = Arc::downgrade(self);
            let crash: Weak<dyn UncaughtFailureHandler> = crash;
            let hang = Arc::downgrade(self);
            let hang: Weak<dyn HangInterceptor> = hang;
            self.hooks.install(crash, hang);
        }
    }

    pub fn mode(&self) -> WatchdogMode {
        self.lock().mode
    }

    pub fn active_units(&self) -> u32 {
        self.lock().liveness.active_count()
    }

    /// Log how this process instance was launched.
    pub fn app_started(&self, signal: RestartSignal) {
        if signal.respawn {
            tracing::warn!("respawned by watchdog");
        } else {
            tracing::info!("started by user");
        }
    }

    pub fn unit_started(&self, unit_id: &str) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.liveness.unit_started(now);
        tracing::debug!(unit = unit_id, active = state.liveness.active_count(), "unit started");
    }

    /// `transient` marks a stop that is immediately followed by a recreate of
    /// the same unit; it does not count as the unit going away.
    pub fn unit_stopped(&self, unit_id: &str, transient: bool) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.liveness.unit_stopped(now, transient);
        tracing::debug!(
            unit = unit_id,
            transient,
            active = state.liveness.active_count(),
            "unit stopped"
        );
    }

    /// Suspend the fast heartbeat: only the Long timer stays armed until it
    /// next fires.
    pub fn start_backup_mode(&self) {
        let mut state = self.lock();
        if state.mode == WatchdogMode::Disabled {
            tracing::debug!("backup mode ignored: watchdog disabled");
            return;
        }
        tracing::warn!("backup mode activated");
        state.mode = WatchdogMode::BackupMode;
        state.paused = false;
        self.apply(
            state,
            &[
                TimerOp::Cancel(TimerKind::Short),
                TimerOp::Cancel(TimerKind::Long),
                TimerOp::Arm(TimerKind::Long),
            ],
        );
    }

    /// Stop all liveness checks. The mode is kept.
    pub fn pause(&self) {
        let mut state = self.lock();
        if state.mode == WatchdogMode::Disabled {
            return;
        }
        tracing::warn!(mode = ?state.mode, "watchdog paused");
        state.paused = true;
        self.apply(state, CANCEL_ALL);
    }

    pub fn resume(self: &Arc<Self>) {
        if self.mode() == WatchdogMode::Disabled {
            tracing::debug!("resume ignored: watchdog disabled");
            return;
        }
        tracing::warn!("watchdog resumed");
        self.enter_normal();
    }

    /// The sanctioned exit: disarm and terminate normally.
    pub fn on_back_pressed(&self) {
        tracing::warn!("stopped by user; watchdog disabled for this process");
        self.pause();
        self.exit.terminate(EXIT_USER);
    }

    fn foreground_empty(&self, state: &CoreState) -> bool {
        state
            .liveness
            .is_foreground_empty(self.clock.now(), self.settle_window)
    }
}

impl TimerReceiver for Watchdog {
    fn on_timer_fired(&self, kind: TimerKind) {
        let mut state = self.lock();
        let (restart, ops): (bool, &[TimerOp]) = match (state.mode, kind) {
            (WatchdogMode::Disabled, _) => {
                tracing::debug!(%kind, "fire ignored: watchdog disabled");
                (false, NO_OPS)
            }
            (_, kind) if state.paused => {
                tracing::debug!(%kind, "fire after pause; not re-armed");
                (self.foreground_empty(&state), NO_OPS)
            }
            (WatchdogMode::BackupMode, TimerKind::Short) => {
                tracing::debug!("stray short fire ignored in backup mode");
                (false, NO_OPS)
            }
            (WatchdogMode::Normal, TimerKind::Short) => (self.foreground_empty(&state), REARM_SHORT),
            (WatchdogMode::Normal, TimerKind::Long) => (self.foreground_empty(&state), REARM_LONG),
            (WatchdogMode::BackupMode, TimerKind::Long) => {
                let empty = self.foreground_empty(&state);
                state.mode = WatchdogMode::Normal;
                tracing::info!("backup mode over, heartbeat restored");
                (empty, ARM_ALL)
            }
        };
        self.apply(state, ops);

        // Outside both locks: the actuator may call back into the watchdog.
        if restart {
            tracing::error!(%kind, "not running in foreground; pulling back to the front");
            self.actuator.bring_to_front(RestartSignal::RESPAWN);
        }
    }
}

impl HangInterceptor for Watchdog {
    /// Never blocks: the answer is computed from the budget alone, and the
    /// Short re-arm is skipped when either lock is busy.
    fn on_hang_detected(&self, hang: Duration) -> Duration {
        let remaining = self.hang_budget.saturating_sub(hang);
        tracing::error!(
            hang_ms = hang.as_millis(),
            budget_ms = self.hang_budget.as_millis(),
            "hang detected; terminating once the budget is spent"
        );

        let Some(state) = recover(self.state.try_lock()) else {
            tracing::warn!("watchdog busy; short timer not re-armed for hang");
            return remaining;
        };
        if state.mode != WatchdogMode::Normal || state.paused {
            return remaining;
        }
        let Some(timers) = recover(self.timers.try_lock()) else {
            tracing::warn!("alarm facility busy; short timer not re-armed for hang");
            return remaining;
        };
        drop(state);
        timers.cancel(TimerKind::Short);
        timers.arm(TimerKind::Short);
        remaining
    }
}

impl UncaughtFailureHandler for Watchdog {
    fn on_uncaught_failure(&self, report: &FailureReport) {
        // Timers are deliberately left armed: the next fire resurrects us.
        tracing::error!(
            message = %report.message,
            location = report.location.as_deref().unwrap_or("unknown"),
            thread = report.thread.as_deref().unwrap_or("unnamed"),
            "caught a crash; terminating and waiting for the alarm to respawn"
        );
        tracing::error!("backtrace:\n{}", report.backtrace);
        self.exit.terminate(EXIT_CRASH);
    }
}
