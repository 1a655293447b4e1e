/// Inbound delivery of alarm fires into the host process.
///
/// `revive alarmd` reaches a live host with a signal per timer kind and a dead
/// one by relaunching it with the fire in its environment. Either way the
/// fire lands in a fresh execution context, so the watchdog is looked up
/// through the [`Registry`].
use crate::registry::Registry;
use crate::timer::{TimerKind, TimerReceiver};
use nix::sys::signal::Signal;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

/// Environment variable carrying a fire into a relaunched host.
pub const ALARM_ENV: &str = "REVIVE_ALARM";

/// Signal used to deliver a fire of `kind` to a live host.
pub fn signal_for(kind: TimerKind) -> Signal {
    match kind {
        TimerKind::Short => Signal::SIGUSR1,
        TimerKind::Long => Signal::SIGUSR2,
    }
}

/// Read and clear a fire attached to this launch. Returns it at most once.
pub fn take_cold_start_fire() -> Option<TimerKind> {
    let value = std::env::var(ALARM_ENV).ok()?;
    std::env::remove_var(ALARM_ENV);
    let kind = TimerKind::parse(&value);
    if kind.is_none() {
        tracing::warn!(value = %value, "ignoring unknown cold-start alarm");
    }
    kind
}

/// Hand a fire to the registered watchdog.
pub fn deliver(registry: &Registry, kind: TimerKind) {
    match registry.current() {
        Some(watchdog) => watchdog.on_timer_fired(kind),
        None => tracing::warn!(%kind, "alarm fired with no watchdog registered"),
    }
}

/// Listen for the per-kind signals and deliver them until the runtime stops.
///
/// The handlers are registered before this returns, so a signal sent
/// afterwards never hits the default (terminating) action.
pub fn spawn_signal_listener(registry: Arc<Registry>) -> std::io::Result<JoinHandle<()>> {
    let mut short = signal(SignalKind::user_defined1())?;
    let mut long = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        loop {
            let kind = tokio::select! {
                got = short.recv() => got.map(|_| TimerKind::Short),
                got = long.recv() => got.map(|_| TimerKind::Long),
            };
            let Some(kind) = kind else {
                tracing::debug!("alarm signal stream closed");
                return;
            };
            tracing::debug!(%kind, "alarm delivered by signal");
            deliver(&registry, kind);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ReviveConfig;
    use crate::testing::{CountingHooks, RecordingActuator, RecordingAlarms, RecordingExit};
    use crate::timer::AlarmFacility;
    use crate::watchdog::{Collaborators, Watchdog};
    use chrono::Utc;
    use std::time::Duration;

    fn registered(
        registry: &Registry,
        clock: &Arc<ManualClock>,
        actuator: &Arc<RecordingActuator>,
    ) -> Arc<Watchdog> {
        let wd = Watchdog::start(
            &ReviveConfig::default(),
            Collaborators {
                alarms: Some(Arc::new(RecordingAlarms::default()) as Arc<dyn AlarmFacility>),
                actuator: actuator.clone(),
                exit: Arc::new(RecordingExit::default()),
                hooks: Arc::new(CountingHooks::default()),
                clock: clock.clone(),
            },
        );
        registry.install(wd.clone());
        wd
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(signal_for(TimerKind::Short), Signal::SIGUSR1);
        assert_eq!(signal_for(TimerKind::Long), Signal::SIGUSR2);
    }

    #[test]
    fn test_cold_start_fire_is_taken_once() {
        std::env::set_var(ALARM_ENV, "long");
        assert_eq!(take_cold_start_fire(), Some(TimerKind::Long));
        assert_eq!(take_cold_start_fire(), None);
        assert!(std::env::var(ALARM_ENV).is_err());
    }

    #[test]
    fn test_deliver_without_watchdog_is_harmless() {
        deliver(&Registry::new(), TimerKind::Short);
    }

    #[test]
    fn test_deliver_reaches_registered_watchdog() {
        let registry = Registry::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let actuator = Arc::new(RecordingActuator::default());
        let _wd = registered(&registry, &clock, &actuator);

        clock.advance_millis(3100);
        deliver(&registry, TimerKind::Short);
        assert_eq!(actuator.signals().len(), 1);
    }

    #[tokio::test]
    async fn test_signal_listener_delivers_sigusr1_as_short() {
        let registry = Arc::new(Registry::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let actuator = Arc::new(RecordingActuator::default());
        let _wd = registered(&registry, &clock, &actuator);
        clock.advance_millis(3100);

        let handle = spawn_signal_listener(registry.clone()).unwrap();
        nix::sys::signal::raise(Signal::SIGUSR1).unwrap();

        for _ in 0..100 {
            if !actuator.signals().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(actuator.signals().len(), 1);
        handle.abort();
    }
}
