use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use crate::db;
use crate::detector::signal::{build_alert, evaluate_confirmed, evaluate_fast, Candidate, ConfirmedParams, FastParams};
use crate::error::Result;
use crate::state::{ClaimOutcome, CooldownLedger};
use crate::types::{Alert, MarketSnapshot};

/// Markets evaluated concurrently within one cycle.
const DETECT_CONCURRENCY: usize = 8;

/// New alerts produced by one detection pass.
#[derive(Debug, Default)]
pub struct CycleDetection {
    pub confirmed: Vec<Alert>,
    pub fast: Vec<Alert>,
    /// Candidates suppressed by an active cooldown.
    pub cooled: usize,
    /// Markets whose evaluation failed (logged, not fatal).
    pub failed: usize,
}

impl CycleDetection {
    pub fn total(&self) -> usize {
        self.confirmed.len() + self.fast.len()
    }
}

enum Fired {
    Alert(Alert),
    Cooling,
    Duplicate,
}

/// Runs both tiers over a cycle's snapshots. Snapshots must already be
/// persisted: baselines and recent points are read back from the store.
pub struct Detector {
    pool: SqlitePool,
    ledger: Arc<CooldownLedger>,
    confirmed: ConfirmedParams,
    fast: FastParams,
    fast_enabled: bool,
}

impl Detector {
    pub fn new(
        pool: SqlitePool,
        ledger: Arc<CooldownLedger>,
        confirmed: ConfirmedParams,
        fast: FastParams,
        fast_enabled: bool,
    ) -> Self {
        Self {
            pool,
            ledger,
            confirmed,
            fast,
            fast_enabled,
        }
    }

    pub async fn run(&self, snapshots: &[MarketSnapshot], now: DateTime<Utc>) -> CycleDetection {
        // One alert per market per tier: duplicate market rows in a feed page
        // only count once.
        let mut seen = HashSet::new();
        let unique: Vec<&MarketSnapshot> = snapshots
            .iter()
            .filter(|s| seen.insert(s.market_id.as_str()))
            .collect();

        let tasks: Vec<_> = unique
            .into_iter()
            .map(|snap| async move { (snap.market_id.clone(), self.detect_market(snap, now).await) })
            .collect();
        let results: Vec<(String, Result<Vec<Fired>>)> = stream::iter(tasks)
            .buffer_unordered(DETECT_CONCURRENCY)
            .collect()
            .await;

        let mut out = CycleDetection::default();
        for (market_id, result) in results {
            match result {
                Ok(fired) => {
                    for f in fired {
                        match f {
                            Fired::Alert(a) if a.tier == crate::types::Tier::Fast => out.fast.push(a),
                            Fired::Alert(a) => out.confirmed.push(a),
                            Fired::Cooling => out.cooled += 1,
                            Fired::Duplicate => {}
                        }
                    }
                }
                Err(e) => {
                    out.failed += 1;
                    error!(market_id = %market_id, "[DETECTOR] market evaluation failed: {e}");
                }
            }
        }

        // Stable output order regardless of task completion order.
        out.confirmed.sort_by(|a, b| a.market_id.cmp(&b.market_id));
        out.fast.sort_by(|a, b| a.market_id.cmp(&b.market_id));

        info!(
            event = "DETECTION_DONE",
            markets = seen.len(),
            confirmed = out.confirmed.len(),
            fast = out.fast.len(),
            cooled = out.cooled,
            failed = out.failed,
            "[DETECTOR] cycle evaluated"
        );
        out
    }

    async fn detect_market(&self, snap: &MarketSnapshot, now: DateTime<Utc>) -> Result<Vec<Fired>> {
        let mut fired = Vec::new();

        let window_start = now - Duration::minutes(self.confirmed.window_minutes);
        if let Some(baseline) =
            db::snapshots::window_baseline(&self.pool, &snap.market_id, window_start, snap.bucket).await?
        {
            if let Some(candidate) = evaluate_confirmed(snap, &baseline, &self.confirmed) {
                fired.push(
                    self.fire(snap, &candidate, self.confirmed.window_minutes, self.confirmed.cooldown_minutes, now)
                        .await?,
                );
            }
        }

        if self.fast_enabled {
            let fast_start = now - Duration::minutes(self.fast.window_minutes);
            let baseline =
                db::snapshots::window_baseline(&self.pool, &snap.market_id, fast_start, snap.bucket).await?;
            if let Some(baseline) = baseline {
                let recent =
                    db::snapshots::points_between(&self.pool, &snap.market_id, fast_start, snap.bucket).await?;
                if let Some(candidate) = evaluate_fast(snap, &baseline, &recent, &self.fast) {
                    fired.push(
                        self.fire(snap, &candidate, self.fast.window_minutes, self.fast.cooldown_minutes, now)
                            .await?,
                    );
                }
            }
        }

        Ok(fired)
    }

    /// Claim the cooldown, then persist. The claim is rolled back if the
    /// alert row cannot be written so the next cycle can retry.
    async fn fire(
        &self,
        snap: &MarketSnapshot,
        candidate: &Candidate,
        window_minutes: i64,
        cooldown_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Fired> {
        let tier = candidate.tier;
        let previous = match self
            .ledger
            .try_claim(&snap.market_id, tier, now, Duration::minutes(cooldown_minutes))
        {
            ClaimOutcome::Cooling { last } => {
                debug!(market_id = %snap.market_id, %tier, last = %last, "[DETECTOR] cooldown active");
                return Ok(Fired::Cooling);
            }
            ClaimOutcome::Claimed { previous } => previous,
        };

        let mut alert = build_alert(snap, candidate, window_minutes, now);
        match db::alerts::insert_with_cooldown(&self.pool, &alert).await {
            Ok(Some(id)) => {
                alert.id = id;
                info!(
                    event = "ALERT_CREATED",
                    alert_id = id,
                    market_id = %alert.market_id,
                    %tier,
                    strength = %alert.strength,
                    delta_pct = alert.delta_pct * 100.0,
                    "{}",
                    alert.message
                );
                Ok(Fired::Alert(alert))
            }
            Ok(None) => {
                self.ledger.release(&snap.market_id, tier, now, previous);
                Ok(Fired::Duplicate)
            }
            Err(e) => {
                self.ledger.release(&snap.market_id, tier, now, previous);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::types::{from_unix, MappingConfidence, Strength, Tier};

    const T0: i64 = 1_767_600_000;

    fn snap(market_id: &str, p_yes: f64, at: i64, liquidity: f64, volume: f64) -> MarketSnapshot {
        MarketSnapshot {
            market_id: market_id.to_string(),
            title: "Will Bitcoin be above 100,000 on January 5?".to_string(),
            category: "Bitcoin above 100k".to_string(),
            p_yes,
            liquidity,
            volume_24h: volume,
            outcome_label: Some("Yes".to_string()),
            mapping_confidence: MappingConfidence::Verified,
            source_ts: from_unix(at),
            bucket: crate::types::snapshot_bucket(from_unix(at)),
        }
    }

    async fn ingest(pool: &SqlitePool, snaps: &[MarketSnapshot]) {
        db::snapshots::upsert_snapshots(pool, snaps, from_unix(T0)).await.unwrap();
    }

    fn detector(pool: &SqlitePool, ledger: Arc<CooldownLedger>, fast_enabled: bool) -> Detector {
        Detector::new(pool.clone(), ledger, ConfirmedParams::default(), FastParams::default(), fast_enabled)
    }

    #[tokio::test]
    async fn fifteen_percent_move_creates_confirmed_alert() {
        let pool = test_pool().await;
        let ledger = CooldownLedger::new();
        let det = detector(&pool, ledger.clone(), false);

        ingest(&pool, &[snap("m1", 0.40, T0, 5_000.0, 6_000.0)]).await;
        let now = T0 + 3_600;
        let current = snap("m1", 0.46, now, 5_000.0, 6_000.0);
        ingest(&pool, std::slice::from_ref(&current)).await;

        let out = det.run(&[current], from_unix(now)).await;
        assert_eq!(out.confirmed.len(), 1);
        let alert = &out.confirmed[0];
        assert!(alert.id > 0);
        assert!((alert.delta_pct * 100.0 - 15.0).abs() < 1e-6);
        assert_eq!(alert.strength, Strength::Medium);
        assert_eq!(ledger.last_triggered("m1", Tier::Confirmed), Some(from_unix(now)));
    }

    #[tokio::test]
    async fn second_fire_inside_cooldown_is_suppressed() {
        let pool = test_pool().await;
        let ledger = CooldownLedger::new();
        let det = detector(&pool, ledger.clone(), false);

        ingest(&pool, &[snap("m1", 0.40, T0, 5_000.0, 6_000.0)]).await;
        let first_at = T0 + 3_000;
        let first = snap("m1", 0.46, first_at, 5_000.0, 6_000.0);
        ingest(&pool, std::slice::from_ref(&first)).await;
        assert_eq!(det.run(&[first], from_unix(first_at)).await.confirmed.len(), 1);

        let again_at = first_at + 600;
        let again = snap("m1", 0.50, again_at, 5_000.0, 6_000.0);
        ingest(&pool, std::slice::from_ref(&again)).await;
        let out = det.run(&[again], from_unix(again_at)).await;
        assert!(out.confirmed.is_empty());
        assert_eq!(out.cooled, 1);
        assert_eq!(ledger.last_triggered("m1", Tier::Confirmed), Some(from_unix(first_at)));

        let stored = db::alerts::latest(&pool, Some(Tier::Confirmed), 10).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn thin_market_never_alerts() {
        let pool = test_pool().await;
        let det = detector(&pool, CooldownLedger::new(), false);
        ingest(&pool, &[snap("m1", 0.40, T0, 500.0, 500.0)]).await;
        let current = snap("m1", 0.60, T0 + 1_800, 500.0, 500.0);
        ingest(&pool, std::slice::from_ref(&current)).await;
        assert_eq!(det.run(&[current], from_unix(T0 + 1_800)).await.total(), 0);
    }

    #[tokio::test]
    async fn fast_tier_fires_independently_when_enabled() {
        let pool = test_pool().await;
        let ledger = CooldownLedger::new();
        let now = T0 + 900;
        let history: Vec<_> = [(T0, 0.40), (T0 + 300, 0.42), (T0 + 600, 0.44)]
            .iter()
            .map(|(t, p)| snap("m1", *p, *t, 20_000.0, 20_000.0))
            .collect();
        ingest(&pool, &history).await;
        let current = snap("m1", 0.46, now, 20_000.0, 20_000.0);
        ingest(&pool, std::slice::from_ref(&current)).await;

        let off = detector(&pool, ledger.clone(), false).run(std::slice::from_ref(&current), from_unix(now)).await;
        assert!(off.fast.is_empty());
        assert_eq!(off.confirmed.len(), 1);

        let on = detector(&pool, ledger.clone(), true).run(&[current], from_unix(now)).await;
        assert_eq!(on.fast.len(), 1);
        assert!(on.fast[0].watch_only);
        assert_eq!(on.fast[0].strength, Strength::Medium);
        // CONFIRMED is cooling from the first pass; FAST has its own ledger entry.
        assert!(on.confirmed.is_empty());
    }

    #[tokio::test]
    async fn duplicate_market_rows_alert_once() {
        let pool = test_pool().await;
        let det = detector(&pool, CooldownLedger::new(), false);
        ingest(&pool, &[snap("m1", 0.40, T0, 5_000.0, 6_000.0)]).await;
        let now = T0 + 3_600;
        let current = snap("m1", 0.46, now, 5_000.0, 6_000.0);
        ingest(&pool, std::slice::from_ref(&current)).await;
        let out = det.run(&[current.clone(), current], from_unix(now)).await;
        assert_eq!(out.confirmed.len(), 1);
    }
}
