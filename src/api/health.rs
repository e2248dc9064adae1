//! Shared health state for the /health endpoint.
//! Updated by the engine after every cycle.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Cycle counters. Written by the engine, read by the API.
#[derive(Default)]
pub struct HealthState {
    /// Unix seconds of the last finished cycle (0 = none yet).
    last_cycle_at: AtomicI64,
    /// Unix seconds of the last successful cycle (0 = none yet).
    last_success_at: AtomicI64,
    cycles_ok: AtomicU64,
    cycles_failed: AtomicU64,
    /// Alerts created by the last successful cycle.
    last_cycle_alerts: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, at_secs: i64, alerts: u64) {
        self.last_cycle_at.store(at_secs, Ordering::Relaxed);
        self.last_success_at.store(at_secs, Ordering::Relaxed);
        self.last_cycle_alerts.store(alerts, Ordering::Relaxed);
        self.cycles_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, at_secs: i64) {
        self.last_cycle_at.store(at_secs, Ordering::Relaxed);
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_cycle_at(&self) -> Option<i64> {
        Some(self.last_cycle_at.load(Ordering::Relaxed)).filter(|t| *t > 0)
    }

    pub fn last_success_at(&self) -> Option<i64> {
        Some(self.last_success_at.load(Ordering::Relaxed)).filter(|t| *t > 0)
    }

    pub fn cycles_ok(&self) -> u64 {
        self.cycles_ok.load(Ordering::Relaxed)
    }

    pub fn cycles_failed(&self) -> u64 {
        self.cycles_failed.load(Ordering::Relaxed)
    }

    pub fn last_cycle_alerts(&self) -> u64 {
        self.last_cycle_alerts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_does_not_move_last_success() {
        let h = HealthState::new();
        assert_eq!(h.last_cycle_at(), None);
        h.record_success(100, 3);
        h.record_failure(200);
        assert_eq!(h.last_cycle_at(), Some(200));
        assert_eq!(h.last_success_at(), Some(100));
        assert_eq!((h.cycles_ok(), h.cycles_failed(), h.last_cycle_alerts()), (1, 1, 3));
    }
}
