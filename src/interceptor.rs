/// Crash and hang interception hooks.
///
/// The watchdog installs these once on entry into Normal. Each OS-level hook
/// is a single-method trait so the core can be driven without a real panic
/// hook or monitor thread in tests.
use crate::config::HangConfig;
use crate::hang::{HangMonitor, Heartbeat};
use crate::process::ProcessExit;
use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Diagnostic detail captured from an uncaught failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub message: String,
    pub location: Option<String>,
    pub thread: Option<String>,
    pub backtrace: String,
}

impl FailureReport {
    pub fn from_panic(info: &std::panic::PanicHookInfo<'_>) -> Self {
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));
        let thread = std::thread::current().name().map(str::to_string);

        Self {
            message,
            location,
            thread,
            backtrace: Backtrace::force_capture().to_string(),
        }
    }
}

pub trait UncaughtFailureHandler: Send + Sync {
    fn on_uncaught_failure(&self, report: &FailureReport);
}

pub trait HangInterceptor: Send + Sync {
    /// Called when the main context has been stalled for `hang`.
    ///
    /// Returns how much longer the stall is tolerated before the process is
    /// terminated. Zero means "no more".
    fn on_hang_detected(&self, hang: Duration) -> Duration;
}

/// Installs the crash handler and hang interceptor for a watchdog.
///
/// The watchdog is handed over as weak references: the hooks live for the
/// whole process and must not keep a shut-down watchdog alive.
pub trait HookInstaller: Send + Sync {
    fn install(&self, crash: Weak<dyn UncaughtFailureHandler>, hang: Weak<dyn HangInterceptor>);
}

/// Real process hooks: a panic hook plus a hang-monitor thread.
///
/// Repeated installs are no-ops, so at most one panic hook and one monitor
/// thread exist per `ProcessHooks`.
pub struct ProcessHooks {
    config: HangConfig,
    heartbeat: Arc<Heartbeat>,
    exit: Arc<dyn ProcessExit>,
    panic_hook_installed: AtomicBool,
    monitor_started: AtomicBool,
}

impl ProcessHooks {
    pub fn new(config: HangConfig, exit: Arc<dyn ProcessExit>) -> Self {
        Self {
            config,
            heartbeat: Arc::new(Heartbeat::new()),
            exit,
            panic_hook_installed: AtomicBool::new(false),
            monitor_started: AtomicBool::new(false),
        }
    }

    /// Heartbeat handle the host's main context must beat regularly.
    pub fn heartbeat(&self) -> Arc<Heartbeat> {
        Arc::clone(&self.heartbeat)
    }

    fn install_panic_hook(&self, crash: Weak<dyn UncaughtFailureHandler>) {
        if self.panic_hook_installed.swap(true, Ordering::AcqRel) {
            return;
        }
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| match crash.upgrade() {
            Some(handler) => handler.on_uncaught_failure(&FailureReport::from_panic(info)),
            None => previous(info),
        }));
        tracing::debug!("crash handler installed");
    }

    fn start_monitor(&self, hang: Weak<dyn HangInterceptor>) {
        if !self.config.enabled {
            tracing::info!("hang monitor disabled by config");
            return;
        }
        if self.monitor_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let monitor = HangMonitor::new(
            self.config.clone(),
            self.heartbeat(),
            hang,
            Arc::clone(&self.exit),
        );
        if let Err(e) = monitor.spawn() {
            tracing::error!(error = %e, "failed to spawn hang monitor thread");
            self.monitor_started.store(false, Ordering::Release);
        }
    }
}

impl HookInstaller for ProcessHooks {
    fn install(&self, crash: Weak<dyn UncaughtFailureHandler>, hang: Weak<dyn HangInterceptor>) {
        self.install_panic_hook(crash);
        self.start_monitor(hang);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_report_from_str_panic() {
        // Capture a PanicHookInfo by running a panic under a temporary hook
        // on a scratch thread.
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send(FailureReport::from_panic(info));
            }
        }));
        let _ = std::thread::Builder::new()
            .name("crashing-unit".to_string())
            .spawn(|| panic!("boom"))
            .unwrap()
            .join();
        std::panic::set_hook(previous);

        let report = rx.recv().unwrap();
        assert_eq!(report.message, "boom");
        assert_eq!(report.thread.as_deref(), Some("crashing-unit"));
        assert!(report.location.unwrap().contains("interceptor.rs"));
    }

    #[test]
    fn test_disabled_monitor_does_not_start() {
        let hooks = ProcessHooks::new(
            HangConfig {
                enabled: false,
                ..HangConfig::default()
            },
            Arc::new(crate::testing::RecordingExit::default()),
        );
        let hang: Weak<dyn HangInterceptor> = Weak::<crate::testing::FixedInterceptor>::new();
        hooks.start_monitor(hang);
        assert!(!hooks.monitor_started.load(Ordering::Acquire));
    }
}
