/// Process-wide slot for the single watchdog instance.
///
/// Collaborators that are invoked from outside any call chain holding the
/// watchdog (signal delivery, cold-start delivery) look it up here. The slot
/// has an explicit install/shutdown lifecycle; tests build their own
/// `Registry` instead of touching the global one.
use crate::watchdog::Watchdog;
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Default)]
pub struct Registry {
    slot: Mutex<Option<Arc<Watchdog>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<Registry> {
        static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Registry::new())))
    }

    /// Register `watchdog`, returning any instance it replaced.
    pub fn install(&self, watchdog: Arc<Watchdog>) -> Option<Arc<Watchdog>> {
        let previous = self
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(watchdog);
        if previous.is_some() {
            tracing::warn!("replacing an already registered watchdog");
        }
        previous
    }

    pub fn current(&self) -> Option<Arc<Watchdog>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Unregister the watchdog and stop its timers.
    pub fn shutdown(&self) -> Option<Arc<Watchdog>> {
        let watchdog = self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(watchdog) = &watchdog {
            watchdog.pause();
            tracing::info!("watchdog shut down");
        }
        watchdog
    }
}
