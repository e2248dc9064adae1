use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use sqlx::SqlitePool;
use tokio::time::interval;
use tracing::{error, info};

use crate::config::{Config, RETENTION_CHECK_INTERVAL_SECS};
use crate::db;
use crate::delivery::DeliveryTracker;
use crate::error::Result;
use crate::state::KvStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub snapshots: u64,
    pub alerts: u64,
    pub deliveries: u64,
    pub digest_runs: u64,
    pub recommendations: u64,
    pub mutes: u64,
    pub kv_entries: usize,
}

/// Daily cleanup of aged rows. Ticks hourly and sweeps at most once per
/// UTC day, in the configured hour.
pub struct RetentionSweeper {
    pool: SqlitePool,
    kv: Arc<KvStore>,
    deliveries: DeliveryTracker,
    enabled: bool,
    hour_utc: u32,
    snapshot_days: i64,
    alert_days: i64,
    delivery_days: i64,
    last_run: Option<NaiveDate>,
}

impl RetentionSweeper {
    pub fn new(cfg: &Config, pool: SqlitePool, kv: Arc<KvStore>) -> Self {
        Self {
            deliveries: DeliveryTracker::new(pool.clone()),
            pool,
            kv,
            enabled: cfg.cleanup_enabled,
            hour_utc: cfg.cleanup_hour_utc,
            snapshot_days: cfg.snapshot_retention_days,
            alert_days: cfg.alert_retention_days,
            delivery_days: cfg.delivery_retention_days,
            last_run: None,
        }
    }

    pub async fn run(mut self) {
        if !self.enabled {
            info!("[RETENTION] cleanup disabled");
            return;
        }
        let mut ticker = interval(Duration::from_secs(RETENTION_CHECK_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if !self.is_due(now) {
                continue;
            }
            match self.sweep(now).await {
                Ok(_) => self.last_run = Some(now.date_naive()),
                Err(e) => error!("[RETENTION] sweep failed: {e}"),
            }
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now.hour() == self.hour_utc && self.last_run != Some(now.date_naive())
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let days = |n: i64| now - chrono::Duration::days(n.max(1));
        let report = SweepReport {
            snapshots: db::snapshots::delete_older_than(&self.pool, days(self.snapshot_days)).await?,
            alerts: db::alerts::delete_older_than(&self.pool, days(self.alert_days)).await?,
            deliveries: self.deliveries.delete_older_than(days(self.delivery_days)).await?,
            digest_runs: db::digests::delete_runs_older_than(&self.pool, days(self.delivery_days)).await?,
            recommendations: db::digests::delete_recommendations_older_than(&self.pool, days(self.delivery_days))
                .await?,
            mutes: db::users::delete_expired_mutes(&self.pool, now).await?,
            kv_entries: self.kv.purge_expired(),
        };
        info!(
            event = "RETENTION_SWEEP",
            snapshots = report.snapshots,
            alerts = report.alerts,
            deliveries = report.deliveries,
            digest_runs = report.digest_runs,
            recommendations = report.recommendations,
            mutes = report.mutes,
            kv_entries = report.kv_entries,
            kv_live = self.kv.len(),
            "[RETENTION] sweep complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::delivery::DeliveryEntry;
    use crate::types::{from_unix, DeliveryStatus};

    const NOW: i64 = 1_767_600_000;

    fn cfg() -> Config {
        let mut cfg = Config::for_tests();
        cfg.cleanup_hour_utc = from_unix(NOW).hour();
        cfg
    }

    #[tokio::test]
    async fn due_once_per_day_in_the_configured_hour() {
        let mut sweeper = RetentionSweeper::new(&cfg(), test_pool().await, KvStore::new());
        let now = from_unix(NOW);
        assert!(sweeper.is_due(now));
        assert!(!sweeper.is_due(now + chrono::Duration::hours(1)));
        sweeper.last_run = Some(now.date_naive());
        assert!(!sweeper.is_due(now));
        assert!(sweeper.is_due(now + chrono::Duration::days(1)));
    }

    #[tokio::test]
    async fn sweep_deletes_only_aged_rows() {
        let pool = test_pool().await;
        let sweeper = RetentionSweeper::new(&cfg(), pool.clone(), KvStore::new());
        let tracker = DeliveryTracker::new(pool.clone());
        let now = from_unix(NOW);
        tracker
            .record("alice", &[DeliveryEntry::new(1, DeliveryStatus::Sent, None)], None, now - chrono::Duration::days(40))
            .await
            .unwrap();
        tracker
            .record("alice", &[DeliveryEntry::new(2, DeliveryStatus::Sent, None)], None, now - chrono::Duration::days(1))
            .await
            .unwrap();
        db::users::add_mute(&pool, "alice", Some("m1"), None, now - chrono::Duration::minutes(1), now)
            .await
            .unwrap();

        let report = sweeper.sweep(now).await.unwrap();
        assert_eq!(report.deliveries, 1);
        assert_eq!(report.mutes, 1);
        assert_eq!(tracker.for_user("alice", 10).await.unwrap().len(), 1);
    }
}
