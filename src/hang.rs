/// Responsiveness monitor for the host's main execution context.
///
/// The host beats a [`Heartbeat`] from its main loop. A dedicated thread wakes
/// every inspection interval and measures how long the heartbeat has been
/// stale. A stall of at least one interval is reported to the
/// [`HangInterceptor`], which answers with the remaining tolerated time. The
/// monitor waits that long and looks again: if the stall has reached the total
/// budget, the process is terminated so the pending alarm can resurrect it.
use crate::config::HangConfig;
use crate::interceptor::HangInterceptor;
use crate::process::{ProcessExit, EXIT_HANG};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Liveness beacon updated by the main context.
#[derive(Debug)]
pub struct Heartbeat {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn beat(&self) {
        self.last_ms.store(self.elapsed_ms(), Ordering::Release);
    }

    /// Time since the last beat (or since creation).
    pub fn stalled_for(&self) -> Duration {
        let last = self.last_ms.load(Ordering::Acquire);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }
}

/// Result of one inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspection {
    Responsive,
    /// A tracer is attached and `ignore_debugger` is set.
    IgnoredUnderDebugger,
    /// Stalled, but the heartbeat resumed within the budget.
    Recovered { stalled: Duration },
    /// Budget exhausted and termination requested.
    Terminated { stalled: Duration },
    /// Budget exhausted, termination disabled by config.
    Tolerated { stalled: Duration },
    /// The interceptor is gone; the monitor stops.
    Detached,
}

pub struct HangMonitor {
    config: HangConfig,
    heartbeat: Arc<Heartbeat>,
    interceptor: Weak<dyn HangInterceptor>,
    exit: Arc<dyn ProcessExit>,
}

impl HangMonitor {
    pub fn new(
        config: HangConfig,
        heartbeat: Arc<Heartbeat>,
        interceptor: Weak<dyn HangInterceptor>,
        exit: Arc<dyn ProcessExit>,
    ) -> Self {
        Self {
            config,
            heartbeat,
            interceptor,
            exit,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("hang-monitor".to_string())
            .spawn(move || self.run())
    }

    fn run(&self) {
        tracing::info!(
            interval_ms = self.config.inspection_interval_ms,
            budget_ms = self.config.budget_ms,
            "hang monitor started"
        );
        loop {
            std::thread::sleep(self.config.inspection_interval());
            if self.inspect() == Inspection::Detached {
                tracing::info!("hang monitor stopping: watchdog is gone");
                return;
            }
        }
    }

    /// Run one inspection. May sleep for the remaining budget.
    pub fn inspect(&self) -> Inspection {
        let stalled = self.heartbeat.stalled_for();
        if stalled < self.config.inspection_interval() {
            return Inspection::Responsive;
        }
        if self.config.ignore_debugger && debugger_attached() {
            tracing::debug!(stalled_ms = stalled.as_millis(), "stall ignored under debugger");
            return Inspection::IgnoredUnderDebugger;
        }

        let Some(interceptor) = self.interceptor.upgrade() else {
            return Inspection::Detached;
        };
        let remaining = interceptor.on_hang_detected(stalled);
        drop(interceptor);

        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }

        let stalled = self.heartbeat.stalled_for();
        if stalled < self.config.budget() {
            tracing::info!("main context recovered from stall");
            return Inspection::Recovered { stalled };
        }
        if !self.config.terminate_on_exhausted {
            tracing::error!(
                stalled_ms = stalled.as_millis(),
                "hang budget exhausted; termination disabled"
            );
            return Inspection::Tolerated { stalled };
        }
        tracing::error!(
            stalled_ms = stalled.as_millis(),
            budget_ms = self.config.budget_ms,
            "hang budget exhausted; terminating for respawn"
        );
        self.exit.terminate(EXIT_HANG);
        Inspection::Terminated { stalled }
    }
}

/// True when a tracer (debugger) is attached to this process.
///
/// Reads `TracerPid` from `/proc/self/status`; false where that is missing.
pub fn debugger_attached() -> bool {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => tracer_pid(&status).is_some_and(|pid| pid != 0),
        Err(_) => false,
    }
}

fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|rest| rest.trim().parse().ok())
}
