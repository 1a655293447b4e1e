/// Timer scheduling against a host alarm facility.
///
/// The facility holds one pending wall-clock fire per [`TimerKind`] outside
/// the supervised process. An in-process timer thread is useless here: it
/// dies with the very process it is meant to resurrect.
use crate::clock::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// The two recurring wake-ups the watchdog uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Fast heartbeat cadence.
    Short,
    /// Slow backup cadence, for when the host throttles the short one.
    Long,
}

impl TimerKind {
    pub const ALL: [TimerKind; 2] = [TimerKind::Short, TimerKind::Long];

    pub fn as_str(self) -> &'static str {
        match self {
            TimerKind::Short => "short",
            TimerKind::Long => "long",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short" | "0" => Some(TimerKind::Short),
            "long" | "1" => Some(TimerKind::Long),
            _ => None,
        }
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from an alarm facility.
#[derive(Debug, thiserror::Error)]
pub enum AlarmError {
    #[error("alarm I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode alarm entry: {source}")]
    Serialize { source: serde_json::Error },
    #[error("failed to lock alarm store {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("alarm facility unavailable: {0}")]
    Unavailable(String),
}

/// A host-level wall-clock alarm facility.
///
/// `arm` replaces any pending fire of the same kind.
pub trait AlarmFacility: Send + Sync {
    fn arm(&self, kind: TimerKind, fire_at: DateTime<Utc>) -> Result<(), AlarmError>;

    /// Remove a pending fire. Not an error if none is pending.
    fn cancel(&self, kind: TimerKind) -> Result<(), AlarmError>;
}

/// Receives fires delivered by the alarm facility.
pub trait TimerReceiver: Send + Sync {
    fn on_timer_fired(&self, kind: TimerKind);
}

/// Arms and cancels the two timers at their configured cadences.
///
/// A missing facility is reported once, when the scheduler is built; after
/// that every operation is a silent no-op. Facility errors are logged and
/// swallowed so the watchdog itself never fails because of them.
pub struct TimerScheduler {
    facility: Option<Arc<dyn AlarmFacility>>,
    clock: Arc<dyn Clock>,
    short_interval: Duration,
    long_interval: Duration,
}

impl TimerScheduler {
    pub fn new(
        facility: Option<Arc<dyn AlarmFacility>>,
        clock: Arc<dyn Clock>,
        short_interval: Duration,
        long_interval: Duration,
    ) -> Self {
        if facility.is_none() {
            tracing::error!("could not get an alarm facility; forced restarts are not possible");
        }
        Self {
            facility,
            clock,
            short_interval,
            long_interval,
        }
    }

    pub fn interval(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::Short => self.short_interval,
            TimerKind::Long => self.long_interval,
        }
    }

    /// Schedule one fire of `kind` at `now + interval(kind)`.
    pub fn arm(&self, kind: TimerKind) {
        self.arm_after(kind, self.interval(kind));
    }

    /// Schedule one fire of `kind` at `now + delay`, replacing any pending one.
    pub fn arm_after(&self, kind: TimerKind, delay: Duration) {
        let Some(facility) = &self.facility else {
            return;
        };
        let delay_ms = i64::try_from(delay.as_millis())
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1_000);
        let now = self.clock.now();
        let fire_at = now
            .checked_add_signed(ChronoDuration::milliseconds(delay_ms))
            .unwrap_or(now);
        match facility.arm(kind, fire_at) {
            Ok(()) => tracing::debug!(%kind, %fire_at, "timer armed"),
            Err(e) => tracing::warn!(%kind, error = %e, "failed to arm timer"),
        }
    }

    pub fn cancel(&self, kind: TimerKind) {
        let Some(facility) = &self.facility else {
            return;
        };
        if let Err(e) = facility.cancel(kind) {
            tracing::warn!(%kind, error = %e, "failed to cancel timer");
        }
    }

    pub fn arm_all(&self) {
        for kind in TimerKind::ALL {
            self.arm(kind);
        }
    }

    pub fn cancel_all(&self) {
        tracing::debug!("cancelling timers");
        for kind in TimerKind::ALL {
            self.cancel(kind);
        }
    }
}
