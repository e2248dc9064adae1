use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};

use crate::settings::EffectiveSettings;
use crate::state::KvStore;

/// Which Copilot cap ran out first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapKind {
    Day,
    Hour,
    Digest,
}

impl CapKind {
    /// Phrase used in the cap-reached notice.
    pub fn period(&self) -> &'static str {
        match self {
            CapKind::Day => "today",
            CapKind::Hour => "this hour",
            CapKind::Digest => "this digest",
        }
    }
}

/// Copilot messages already sent in each cap period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapUsage {
    pub day: i64,
    pub hour: i64,
    pub digest: i64,
}

impl CapUsage {
    /// Usage as seen after `picks` more themes are selected in this digest.
    pub fn after_picks(self, picks: i64) -> Self {
        Self {
            day: self.day + picks,
            hour: self.hour + picks,
            digest: self.digest + picks,
        }
    }

    /// First exhausted cap, checked day then hour then digest.
    pub fn exhausted(&self, settings: &EffectiveSettings) -> Option<CapKind> {
        if self.day >= settings.max_copilot_per_day {
            Some(CapKind::Day)
        } else if self.hour >= settings.max_copilot_per_hour {
            Some(CapKind::Hour)
        } else if self.digest >= settings.max_copilot_per_digest {
            Some(CapKind::Digest)
        } else {
            None
        }
    }

    /// (used, limit) for the cap-reached notice.
    pub fn figures(&self, kind: CapKind, settings: &EffectiveSettings) -> (i64, i64) {
        match kind {
            CapKind::Day => (self.day, settings.max_copilot_per_day),
            CapKind::Hour => (self.hour, settings.max_copilot_per_hour),
            CapKind::Digest => (self.digest, settings.max_copilot_per_digest),
        }
    }
}

fn day_key(user_id: &str, now: DateTime<Utc>) -> String {
    format!("copilot:count:{user_id}:{}", now.format("%Y-%m-%d"))
}

fn hour_key(user_id: &str, now: DateTime<Utc>) -> String {
    format!("copilot:hour:{user_id}:{}", now.format("%Y-%m-%d-%H"))
}

fn theme_key(user_id: &str, theme_key: &str) -> String {
    format!("copilot:sent:{user_id}:{theme_key}")
}

fn record_key(user_id: &str, theme_key: &str) -> String {
    format!("copilot:rec:{user_id}:{theme_key}")
}

fn seconds_to_next_day(now: DateTime<Utc>) -> u64 {
    let elapsed = now.num_seconds_from_midnight() as u64;
    86_400u64.saturating_sub(elapsed).max(1)
}

fn seconds_to_next_hour(now: DateTime<Utc>) -> u64 {
    let elapsed = u64::from(now.minute()) * 60 + u64::from(now.second());
    3_600u64.saturating_sub(elapsed).max(1)
}

/// Per-user Copilot counters and theme dedupe claims, kept in the TTL
/// store. Counters move only through `record_send`.
#[derive(Clone)]
pub struct CopilotCaps {
    kv: Arc<KvStore>,
}

impl CopilotCaps {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    /// Day and hour usage. Digest usage starts at zero for every digest.
    pub fn usage(&self, user_id: &str, now: DateTime<Utc>) -> CapUsage {
        CapUsage {
            day: self.kv.get_i64(&day_key(user_id, now)),
            hour: self.kv.get_i64(&hour_key(user_id, now)),
            digest: 0,
        }
    }

    /// Count one successfully delivered Copilot message.
    pub fn record_send(&self, user_id: &str, now: DateTime<Utc>) -> CapUsage {
        let day = self.kv.incr(
            &day_key(user_id, now),
            Some(Duration::from_secs(seconds_to_next_day(now) + 60)),
        );
        let hour = self.kv.incr(
            &hour_key(user_id, now),
            Some(Duration::from_secs(seconds_to_next_hour(now) + 60)),
        );
        CapUsage { day, hour, digest: 0 }
    }

    pub fn theme_recently_sent(&self, user_id: &str, theme: &str) -> bool {
        self.kv.get(&theme_key(user_id, theme)).is_some()
    }

    /// NX claim on the theme for `ttl_minutes`. False when already claimed.
    pub fn claim_theme(&self, user_id: &str, theme: &str, ttl_minutes: i64, now: DateTime<Utc>) -> bool {
        let ttl = Duration::from_secs((ttl_minutes.max(1) as u64) * 60);
        self.kv
            .set_nx(&theme_key(user_id, theme), now.timestamp().to_string(), Some(ttl))
    }

    /// Give a claim back after a failed send.
    pub fn release_theme(&self, user_id: &str, theme: &str) {
        self.kv.delete(&theme_key(user_id, theme));
    }

    /// NX claim on writing a skipped recommendation for the theme during
    /// one digest window. False when the window already has a row.
    pub fn claim_record(&self, user_id: &str, theme: &str, window_minutes: i64, now: DateTime<Utc>) -> bool {
        let ttl = Duration::from_secs((window_minutes.max(1) as u64) * 60);
        self.kv
            .set_nx(&record_key(user_id, theme), now.timestamp().to_string(), Some(ttl))
    }

    /// A send attempt always gets a row and opens a fresh window.
    pub fn mark_recorded(&self, user_id: &str, theme: &str, window_minutes: i64, now: DateTime<Utc>) {
        let ttl = Duration::from_secs((window_minutes.max(1) as u64) * 60);
        self.kv
            .set(&record_key(user_id, theme), now.timestamp().to_string(), Some(ttl));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::plans::builtin_plan;
    use crate::settings::{resolve, UserPreferences};
    use crate::types::from_unix;

    fn pro() -> EffectiveSettings {
        let mut user = UserPreferences::new("u1");
        user.plan_name = Some("pro".to_string());
        resolve(&user, builtin_plan("pro").as_ref())
    }

    #[test]
    fn usage_is_unchanged_until_a_send_is_recorded() {
        let caps = CopilotCaps::new(KvStore::new());
        let now = from_unix(1_767_600_000);
        assert_eq!(caps.usage("u1", now), CapUsage::default());
        caps.record_send("u1", now);
        caps.record_send("u1", now);
        let usage = caps.usage("u1", now);
        assert_eq!((usage.day, usage.hour), (2, 2));
        assert_eq!(caps.usage("u2", now), CapUsage::default());
    }

    #[test]
    fn hour_counter_rolls_over() {
        let caps = CopilotCaps::new(KvStore::new());
        let now = from_unix(1_767_600_000);
        caps.record_send("u1", now);
        let later = now + chrono::Duration::hours(1);
        let usage = caps.usage("u1", later);
        assert_eq!(usage.hour, 0);
        assert_eq!(usage.day, 1);
    }

    #[test]
    fn exhausted_reports_first_cap_hit() {
        let s = pro();
        assert_eq!(CapUsage::default().exhausted(&s), None);
        let hour_full = CapUsage { day: 3, hour: 3, digest: 0 };
        assert_eq!(hour_full.exhausted(&s), Some(CapKind::Hour));
        let day_full = CapUsage { day: 30, hour: 0, digest: 0 };
        assert_eq!(day_full.exhausted(&s), Some(CapKind::Day));
        assert_eq!(CapUsage::default().after_picks(1).exhausted(&s), Some(CapKind::Digest));
        assert_eq!(hour_full.after_picks(0), hour_full);
    }

    #[test]
    fn one_skip_record_per_theme_per_window() {
        let kv = KvStore::new();
        let caps = CopilotCaps::new(kv.clone());
        let now = from_unix(1_767_600_000);
        assert!(caps.claim_record("u1", "fed", 30, now));
        assert!(!caps.claim_record("u1", "fed", 30, now));
        assert!(caps.claim_record("u1", "knicks", 30, now));
        assert!(caps.claim_record("u2", "fed", 30, now));

        caps.mark_recorded("u3", "fed", 30, now);
        assert!(!caps.claim_record("u3", "fed", 30, now));
    }

    #[test]
    fn theme_claim_is_exclusive_until_released() {
        let caps = CopilotCaps::new(KvStore::new());
        let now = from_unix(1_767_600_000);
        assert!(caps.claim_theme("u1", "fed", 360, now));
        assert!(!caps.claim_theme("u1", "fed", 360, now));
        assert!(caps.theme_recently_sent("u1", "fed"));
        caps.release_theme("u1", "fed");
        assert!(!caps.theme_recently_sent("u1", "fed"));
    }
}
