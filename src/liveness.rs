use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Counts the host's currently active foreground units.
///
/// Count-based: unit identities are not tracked, only how many are active.
/// The timestamp of the last transition debounces teardown/recreate cycles
/// (e.g. a window being rebuilt) so they are not read as true backgrounding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessTracker {
    active_count: u32,
    /// Transient stops still waiting for their recreate. Never above
    /// `active_count`.
    pending_transient: u32,
    /// `None` until the first transition; never-changed counts as settled.
    last_changed_at: Option<DateTime<Utc>>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    pub fn last_changed_at(&self) -> Option<DateTime<Utc>> {
        self.last_changed_at
    }

    /// Record a unit becoming active. A start that completes a pending
    /// transient stop is the recreate, so the count is left as it is.
    pub fn unit_started(&mut self, now: DateTime<Utc>) {
        if self.pending_transient > 0 {
            self.pending_transient -= 1;
        } else {
            self.active_count = self.active_count.saturating_add(1);
        }
        self.last_changed_at = Some(now);
    }

    /// Record a unit going inactive.
    ///
    /// A transient stop (the unit is about to be recreated under the same
    /// identity) keeps the count and waits for the matching start. Stopping
    /// with nothing active saturates at zero.
    pub fn unit_stopped(&mut self, now: DateTime<Utc>, transient: bool) {
        if transient {
            if self.pending_transient < self.active_count {
                self.pending_transient += 1;
            }
            return;
        }
        if self.active_count == 0 {
            tracing::warn!("unit stopped with no active units; count stays at 0");
        }
        self.active_count = self.active_count.saturating_sub(1);
        self.pending_transient = self.pending_transient.min(self.active_count);
        self.last_changed_at = Some(now);
    }

    /// True when nothing is active and the last transition is older than `settle`.
    pub fn is_foreground_empty(&self, now: DateTime<Utc>, settle: Duration) -> bool {
        if self.active_count > 0 {
            return false;
        }
        let Some(changed) = self.last_changed_at else {
            return true;
        };
        let settle_ms = i64::try_from(settle.as_millis())
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1_000);
        match changed.checked_add_signed(ChronoDuration::milliseconds(settle_ms)) {
            Some(settled_at) => now > settled_at,
            None => false,
        }
    }
}
