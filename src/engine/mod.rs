//! One ingestion + detection + digest cycle.
//!
//! Cycles never overlap. Within a cycle users are processed concurrently and
//! a failure for one user is logged without touching the others. Alerts
//! persisted by detection stay persisted whatever happens afterwards.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::clients::{MarketFeed, Messenger};
use crate::config::PRICE_POINTS_PER_SIDE;
use crate::copilot::{cap_reached_message, CopilotReport, CopilotService};
use crate::db;
use crate::db::digests::NewDigestRun;
use crate::delivery::{DeliveryEntry, DeliveryTracker};
use crate::detector::{classify, Detector};
use crate::digest::{compose_confirmed, compose_fast, render_digest, Composition, DigestOutcome};
use crate::error::Result;
use crate::settings::{EffectiveSettings, SettingsCache, UserPreferences};
use crate::state::KvStore;
use crate::types::{AlertClassification, DeliveryStatus, FastMode, Tier};

/// Classifications computed once per cycle, keyed by alert id.
type ClassificationCache = DashMap<i64, AlertClassification>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UserCycle {
    pub confirmed: Option<DigestOutcome>,
    pub fast: Option<DigestOutcome>,
    pub copilot_sent: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub started_at: i64,
    pub snapshots: usize,
    pub feed_failed: bool,
    pub confirmed_alerts: usize,
    pub fast_alerts: usize,
    pub users: usize,
    pub digests_sent: usize,
    pub digests_failed: usize,
    pub digests_skipped: usize,
    pub user_errors: usize,
    pub copilot_sent: usize,
    pub duration_ms: u64,
}

impl CycleReport {
    fn tally(&mut self, outcome: Option<DigestOutcome>) {
        match outcome {
            Some(DigestOutcome::Sent) => self.digests_sent += 1,
            Some(DigestOutcome::SendFailed) => self.digests_failed += 1,
            Some(_) => self.digests_skipped += 1,
            None => {}
        }
    }
}

pub struct Engine {
    pool: SqlitePool,
    feed: Arc<dyn MarketFeed>,
    messenger: Arc<dyn Messenger>,
    detector: Detector,
    settings: SettingsCache,
    kv: Arc<KvStore>,
    copilot: CopilotService,
    deliveries: DeliveryTracker,
    health: Arc<HealthState>,
    latency: Arc<LatencyStats>,
    fast_global_enabled: bool,
    max_concurrent_users: usize,
    cycle_lock: Mutex<()>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        feed: Arc<dyn MarketFeed>,
        messenger: Arc<dyn Messenger>,
        detector: Detector,
        settings: SettingsCache,
        kv: Arc<KvStore>,
        copilot: CopilotService,
        health: Arc<HealthState>,
        latency: Arc<LatencyStats>,
        fast_global_enabled: bool,
        max_concurrent_users: usize,
    ) -> Self {
        Self {
            deliveries: DeliveryTracker::new(pool.clone()),
            pool,
            feed,
            messenger,
            detector,
            settings,
            kv,
            copilot,
            health,
            latency,
            fast_global_enabled,
            max_concurrent_users: max_concurrent_users.max(1),
            cycle_lock: Mutex::new(()),
        }
    }

    /// Run one full cycle. A second caller waits for the running cycle.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let _running = self.cycle_lock.lock().await;
        let started = Instant::now();
        let result = self.cycle(now).await;
        let elapsed = started.elapsed();
        self.latency.record(elapsed);

        match result {
            Ok(mut report) => {
                report.duration_ms = elapsed.as_millis() as u64;
                self.health
                    .record_success(now.timestamp(), (report.confirmed_alerts + report.fast_alerts) as u64);
                info!(
                    event = "CYCLE_DONE",
                    snapshots = report.snapshots,
                    confirmed = report.confirmed_alerts,
                    fast = report.fast_alerts,
                    users = report.users,
                    sent = report.digests_sent,
                    failed = report.digests_failed,
                    skipped = report.digests_skipped,
                    user_errors = report.user_errors,
                    copilot_sent = report.copilot_sent,
                    duration_ms = report.duration_ms,
                    "[ENGINE] cycle complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.health.record_failure(now.timestamp());
                error!(event = "CYCLE_FAILED", "[ENGINE] cycle aborted: {e}");
                Err(e)
            }
        }
    }

    async fn cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport {
            started_at: now.timestamp(),
            ..CycleReport::default()
        };

        // A feed outage skips detection; digests still go out for alerts
        // already in the window.
        match self.feed.fetch_snapshots(now).await {
            Ok(snapshots) => {
                db::snapshots::upsert_snapshots(&self.pool, &snapshots, now).await?;
                let detection = self.detector.run(&snapshots, now).await;
                report.snapshots = snapshots.len();
                report.confirmed_alerts = detection.confirmed.len();
                report.fast_alerts = detection.fast.len();
            }
            Err(e) => {
                warn!("[ENGINE] feed unavailable, skipping detection: {e}");
                report.feed_failed = true;
            }
        }

        let users = db::users::active_users(&self.pool).await?;
        report.users = users.len();
        let classifications = ClassificationCache::new();
        let classifications = &classifications;

        let results: Vec<(String, Result<UserCycle>)> = stream::iter(users)
            .map(|user| async move {
                let result = self.process_user(&user, classifications, now).await;
                (user.user_id, result)
            })
            .buffer_unordered(self.max_concurrent_users)
            .collect()
            .await;

        for (user_id, result) in results {
            match result {
                Ok(user_cycle) => {
                    report.tally(user_cycle.confirmed);
                    report.tally(user_cycle.fast);
                    report.copilot_sent += user_cycle.copilot_sent;
                }
                Err(e) => {
                    report.user_errors += 1;
                    error!(user_id = %user_id, "[ENGINE] user digest failed: {e}");
                }
            }
        }
        Ok(report)
    }

    async fn process_user(
        &self,
        user: &UserPreferences,
        classifications: &ClassificationCache,
        now: DateTime<Utc>,
    ) -> Result<UserCycle> {
        let settings = self.settings.resolve_for(&self.pool, user).await?;
        let mut out = UserCycle::default();

        let since = now - Duration::minutes(settings.digest_window_minutes);
        let alerts = db::alerts::in_window(&self.pool, Tier::Confirmed, since).await?;
        for alert in &alerts {
            if classifications.contains_key(&alert.id) {
                continue;
            }
            let points =
                db::snapshots::points_around(&self.pool, &alert.market_id, alert.bucket, PRICE_POINTS_PER_SIDE).await?;
            classifications.insert(alert.id, classify(alert, &points));
        }
        let composition = compose_confirmed(&settings, &alerts, |a| {
            classifications
                .get(&a.id)
                .map(|c| *c)
                .unwrap_or(AlertClassification::NOISE)
        });
        let (outcome, copilot) = self.deliver_digest(&settings, &composition, true, now).await?;
        out.confirmed = Some(outcome);
        out.copilot_sent = copilot.sent;

        if self.fast_global_enabled && settings.fast_signals_enabled {
            let since = now - Duration::minutes(settings.fast_window_minutes);
            let mut alerts = db::alerts::in_window(&self.pool, Tier::Fast, since).await?;
            if settings.fast_mode == FastMode::Full {
                for alert in &mut alerts {
                    alert.watch_only = false;
                }
            }
            let composition = compose_fast(&settings, &alerts);
            let (outcome, _) = self.deliver_digest(&settings, &composition, false, now).await?;
            out.fast = Some(outcome);
        }
        Ok(out)
    }

    async fn recently_sent(&self, settings: &EffectiveSettings, tier: Tier, now: DateTime<Utc>) -> Result<bool> {
        if self.kv.get(&last_sent_key(&settings.user_id, tier)).is_some() {
            return Ok(true);
        }
        let window = Duration::minutes(window_minutes(settings, tier));
        let last = db::digests::last_sent_at(&self.pool, &settings.user_id, tier).await?;
        Ok(last.is_some_and(|at| now - at < window))
    }

    /// Gate, render, send and record one digest. Copilot runs only for the
    /// CONFIRMED tier and only after the digest itself went out.
    async fn deliver_digest(
        &self,
        settings: &EffectiveSettings,
        composition: &Composition,
        with_copilot: bool,
        now: DateTime<Utc>,
    ) -> Result<(DigestOutcome, CopilotReport)> {
        let tier = composition.tier;

        if let Some(outcome) = composition.outcome() {
            self.record_skip(settings, composition, outcome, now).await?;
            return Ok((outcome, CopilotReport::default()));
        }

        let recently_sent = self.recently_sent(settings, tier, now).await?;
        let chat_id = match settings.chat_id.as_deref() {
            Some(chat_id) if !recently_sent => chat_id,
            missing_or_blocked => {
                let outcome = if missing_or_blocked.is_none() {
                    DigestOutcome::MissingChatId
                } else {
                    DigestOutcome::DigestRecentlySent
                };
                // The gate still runs so the Copilot skip reason is on record.
                let copilot = if with_copilot {
                    let selection = self
                        .copilot
                        .evaluate(settings, &composition.themes, recently_sent, now)
                        .await?;
                    self.copilot
                        .deliver(settings, &composition.themes, &selection, now)
                        .await?
                } else {
                    CopilotReport::default()
                };
                self.record_skip(settings, composition, outcome, now).await?;
                return Ok((outcome, copilot));
            }
        };

        let alert_ids = composition.alert_ids();
        let already_sent = self.deliveries.sent_alert_ids(&settings.user_id, &alert_ids).await?;
        let fingerprint = composition.fingerprint();
        let fp_key = fingerprint_key(&settings.user_id, tier, &fingerprint);
        let fp_ttl = StdDuration::from_secs((composition.window_minutes.max(0) as u64 * 90).max(60));
        if already_sent.len() == alert_ids.len()
            || !self.kv.set_nx(&fp_key, now.timestamp().to_string(), Some(fp_ttl))
        {
            self.record_skip(settings, composition, DigestOutcome::DuplicateDigest, now)
                .await?;
            return Ok((DigestOutcome::DuplicateDigest, CopilotReport::default()));
        }

        let selection = if with_copilot {
            Some(
                self.copilot
                    .evaluate(settings, &composition.themes, false, now)
                    .await?,
            )
        } else {
            None
        };
        let status_line = selection
            .as_ref()
            .and_then(|s| s.cap_hit)
            .map(|(kind, usage)| cap_reached_message(settings, kind, usage));
        let html = render_digest(composition, status_line.as_deref());

        let outcome = match self.messenger.send(chat_id, &html, &[]).await {
            Ok(()) => DigestOutcome::Sent,
            Err(e) => {
                error!(user_id = %settings.user_id, %tier, "[DIGEST] send failed: {e}");
                self.kv.delete(&fp_key);
                DigestOutcome::SendFailed
            }
        };

        let run_id = db::digests::insert_digest_run(
            &self.pool,
            &NewDigestRun {
                user_id: &settings.user_id,
                tier,
                status: outcome.as_str(),
                theme_keys: composition.theme_keys(),
                alert_ids: alert_ids.clone(),
                actionable_count: composition.actionable_ids.len(),
                skip_log: composition.skip_log(),
                fingerprint: &fingerprint,
                payload: &html,
                created_at: now,
            },
        )
        .await?;
        self.record_deliveries(settings, composition, outcome, Some(run_id), now)
            .await?;

        if outcome != DigestOutcome::Sent {
            return Ok((outcome, CopilotReport::default()));
        }
        self.kv.set(
            &last_sent_key(&settings.user_id, tier),
            now.timestamp().to_string(),
            Some(StdDuration::from_secs(window_minutes(settings, tier).max(1) as u64 * 60)),
        );
        info!(
            event = "DIGEST_SENT",
            user_id = %settings.user_id,
            %tier,
            themes = composition.themes.len(),
            alerts = alert_ids.len(),
            actionable = composition.actionable_ids.len(),
            run_id,
            "[DIGEST] sent"
        );

        let copilot = match selection {
            Some(selection) => {
                self.copilot
                    .deliver(settings, &composition.themes, &selection, now)
                    .await?
            }
            None => CopilotReport::default(),
        };
        Ok((outcome, copilot))
    }

    async fn record_skip(
        &self,
        settings: &EffectiveSettings,
        composition: &Composition,
        outcome: DigestOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        info!(
            event = "DIGEST_SKIPPED",
            user_id = %settings.user_id,
            tier = %composition.tier,
            outcome = outcome.as_str(),
            candidates = composition.candidates,
            filtered = composition.filtered.len(),
            "[DIGEST] skipped"
        );
        self.record_deliveries(settings, composition, outcome, None, now).await
    }

    async fn record_deliveries(
        &self,
        settings: &EffectiveSettings,
        composition: &Composition,
        outcome: DigestOutcome,
        run_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let in_message: HashSet<i64> = composition.alert_ids().into_iter().collect();
        let mut entries: Vec<DeliveryEntry<'_>> = composition
            .filtered
            .iter()
            .map(|(a, reason)| DeliveryEntry::new(a.id, DeliveryStatus::Filtered, Some(reason.as_str())))
            .collect();
        for alert in &composition.included {
            let entry = if outcome == DigestOutcome::Sent && in_message.contains(&alert.id) {
                DeliveryEntry::new(alert.id, DeliveryStatus::Sent, None)
            } else if outcome == DigestOutcome::Sent {
                DeliveryEntry::new(alert.id, DeliveryStatus::Skipped, Some("not_selected"))
            } else {
                DeliveryEntry::new(alert.id, DeliveryStatus::Skipped, Some(outcome.as_str()))
            };
            entries.push(entry);
        }
        self.deliveries
            .record(&settings.user_id, &entries, run_id, now)
            .await?;
        Ok(())
    }
}

fn window_minutes(settings: &EffectiveSettings, tier: Tier) -> i64 {
    match tier {
        Tier::Confirmed => settings.digest_window_minutes,
        Tier::Fast => settings.fast_window_minutes,
    }
}

fn last_sent_key(user_id: &str, tier: Tier) -> String {
    match tier {
        Tier::Confirmed => format!("digest:last_sent:{user_id}"),
        Tier::Fast => format!("digest:last_sent_fast:{user_id}"),
    }
}

fn fingerprint_key(user_id: &str, tier: Tier, fingerprint: &str) -> String {
    format!("digest:fingerprint:{user_id}:{tier}:{fingerprint}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::InlineButton;
    use crate::copilot::{CapUsage, CopilotCaps};
    use crate::db::test_pool;
    use crate::detector::{ConfirmedParams, FastParams};
    use crate::error::AppError;
    use crate::state::CooldownLedger;
    use crate::types::{from_unix, snapshot_bucket, MappingConfidence, MarketSnapshot};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    const T0: i64 = 1_767_600_000;

    /// Feed that serves whatever price is currently scripted.
    #[derive(Default)]
    struct ScriptedFeed {
        price: StdMutex<Option<f64>>,
        down: StdMutex<bool>,
    }

    impl ScriptedFeed {
        fn set(&self, p: f64) {
            *self.price.lock().unwrap() = Some(p);
        }
    }

    #[async_trait]
    impl MarketFeed for ScriptedFeed {
        async fn fetch_snapshots(&self, now: DateTime<Utc>) -> Result<Vec<MarketSnapshot>> {
            if *self.down.lock().unwrap() {
                return Err(AppError::CircuitOpen { dependency: "feed" });
            }
            Ok(self
                .price
                .lock()
                .unwrap()
                .map(|p| MarketSnapshot {
                    market_id: "m1".to_string(),
                    title: "Will the Fed cut rates in March?".to_string(),
                    category: "Fed decision in March".to_string(),
                    p_yes: p,
                    liquidity: 60_000.0,
                    volume_24h: 60_000.0,
                    outcome_label: Some("Yes".to_string()),
                    mapping_confidence: MappingConfidence::Verified,
                    source_ts: now,
                    bucket: snapshot_bucket(now),
                })
                .into_iter()
                .collect())
        }
    }

    #[derive(Default)]
    struct Outbox {
        fail: StdMutex<bool>,
        sent: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Messenger for Outbox {
        async fn send(&self, _chat_id: &str, html: &str, _buttons: &[Vec<InlineButton>]) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(AppError::Messaging("502".to_string()));
            }
            self.sent.lock().unwrap().push(html.to_string());
            Ok(())
        }
    }

    struct Harness {
        engine: Engine,
        feed: Arc<ScriptedFeed>,
        outbox: Arc<Outbox>,
        pool: SqlitePool,
    }

    async fn harness(chat_id: Option<&str>) -> Harness {
        harness_on("pro", chat_id).await
    }

    async fn harness_on(plan: &str, chat_id: Option<&str>) -> Harness {
        let pool = test_pool().await;
        db::users::seed_builtin_plans(&pool, from_unix(T0)).await.unwrap();
        let mut user = UserPreferences::new("alice");
        user.plan_name = Some(plan.to_string());
        user.chat_id = chat_id.map(str::to_string);
        db::users::upsert_user(&pool, &user, from_unix(T0)).await.unwrap();

        let feed = Arc::new(ScriptedFeed::default());
        let outbox = Arc::new(Outbox::default());
        let kv = KvStore::new();
        let detector = Detector::new(
            pool.clone(),
            CooldownLedger::new(),
            ConfirmedParams::default(),
            FastParams::default(),
            false,
        );
        let copilot = CopilotService::new(pool.clone(), CopilotCaps::new(kv.clone()), outbox.clone(), None);
        let engine = Engine::new(
            pool.clone(),
            feed.clone(),
            outbox.clone(),
            detector,
            SettingsCache::new(),
            kv,
            copilot,
            Arc::new(HealthState::new()),
            Arc::new(LatencyStats::new().unwrap()),
            false,
            4,
        );
        Harness {
            engine,
            feed,
            outbox,
            pool,
        }
    }

    /// Baseline at T0, then a 15% move 25 minutes later.
    async fn fire_alert(h: &Harness) -> CycleReport {
        h.feed.set(0.40);
        let first = h.engine.run_cycle(from_unix(T0)).await.unwrap();
        assert_eq!(first.confirmed_alerts, 0);
        h.feed.set(0.46);
        h.engine.run_cycle(from_unix(T0 + 1_500)).await.unwrap()
    }

    #[tokio::test]
    async fn move_produces_one_sent_digest() {
        let h = harness(Some("42")).await;
        let report = fire_alert(&h).await;
        assert_eq!(report.confirmed_alerts, 1);
        assert_eq!(report.digests_sent, 1);

        let sent = h.outbox.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("<b>PMD - 1 theme (30m)</b>"));

        let run = db::digests::last_digest_run(&h.pool, "alice", Some(Tier::Confirmed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, "SENT");
        assert_eq!(run.alert_count, 1);
    }

    #[tokio::test]
    async fn second_cycle_inside_window_is_suppressed() {
        let h = harness(Some("42")).await;
        fire_alert(&h).await;

        let again = h.engine.run_cycle(from_unix(T0 + 1_800)).await.unwrap();
        assert_eq!(again.confirmed_alerts, 0);
        assert_eq!(again.digests_sent, 0);
        assert_eq!(again.digests_skipped, 1);
        assert_eq!(h.outbox.sent.lock().unwrap().len(), 1);

        let rows = DeliveryTracker::new(h.pool.clone()).for_user("alice", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "sent");
    }

    #[tokio::test]
    async fn missing_chat_id_skips_without_a_run() {
        let h = harness(None).await;
        let report = fire_alert(&h).await;
        assert_eq!(report.digests_skipped, 1);
        assert!(h.outbox.sent.lock().unwrap().is_empty());
        assert!(db::digests::last_digest_run(&h.pool, "alice", None).await.unwrap().is_none());

        let rows = DeliveryTracker::new(h.pool.clone()).for_user("alice", 10).await.unwrap();
        assert_eq!(rows[0].status, "skipped");
        assert_eq!(rows[0].reason.as_deref(), Some("MISSING_CHAT_ID"));
    }

    #[tokio::test]
    async fn failed_send_is_recorded_and_retried_next_cycle() {
        let h = harness(Some("42")).await;
        *h.outbox.fail.lock().unwrap() = true;
        let report = fire_alert(&h).await;
        assert_eq!(report.digests_failed, 1);
        let run = db::digests::last_digest_run(&h.pool, "alice", None).await.unwrap().unwrap();
        assert_eq!(run.status, "SEND_FAILED");

        // Fingerprint was released, so the next cycle sends the same digest.
        *h.outbox.fail.lock().unwrap() = false;
        let retry = h.engine.run_cycle(from_unix(T0 + 1_800)).await.unwrap();
        assert_eq!(retry.digests_sent, 1);
        assert_eq!(h.outbox.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn feed_outage_still_runs_digests() {
        let h = harness(Some("42")).await;
        *h.feed.down.lock().unwrap() = true;
        let report = h.engine.run_cycle(from_unix(T0)).await.unwrap();
        assert!(report.feed_failed);
        assert_eq!(report.users, 1);
        assert_eq!(report.digests_skipped, 1);
    }

    async fn recommendation_rows(pool: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM copilot_recommendations WHERE user_id = 'alice'")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn suppressed_cycles_do_not_repeat_copilot_rows() {
        let h = harness(Some("42")).await;
        fire_alert(&h).await;
        for step in 1..=4 {
            let report = h.engine.run_cycle(from_unix(T0 + 1_500 + step * 300)).await.unwrap();
            assert_eq!(report.digests_sent, 0);
        }
        assert_eq!(recommendation_rows(&h.pool).await, 1);
        let last = db::digests::last_recommendation(&h.pool, "alice").await.unwrap().unwrap();
        assert_eq!(last.reason.as_deref(), Some("NOT_REPRICING"));
    }

    #[tokio::test]
    async fn sustained_repricing_sends_one_copilot_message() {
        let h = harness_on("elite", Some("42")).await;
        let caps = h.engine.copilot.caps().clone();

        // Messenger is down while the move builds.
        *h.outbox.fail.lock().unwrap() = true;
        let report = fire_alert(&h).await;
        assert_eq!(report.digests_failed, 1);
        h.feed.set(0.48);
        h.engine.run_cycle(from_unix(T0 + 1_800)).await.unwrap();
        assert_eq!(recommendation_rows(&h.pool).await, 0);
        assert_eq!(caps.usage("alice", from_unix(T0 + 1_800)), CapUsage::default());

        // Two steps up after the alert bucket: REPRICING / HIGH / FOLLOW.
        *h.outbox.fail.lock().unwrap() = false;
        h.feed.set(0.50);
        let now = from_unix(T0 + 2_100);
        let report = h.engine.run_cycle(now).await.unwrap();
        assert_eq!(report.digests_sent, 1);
        assert_eq!(report.copilot_sent, 1);

        let sent = h.outbox.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].starts_with("<b>PMD - 1 theme (15m)</b>"));
        assert!(sent[1].starts_with("<b>AI Copilot: "));
        assert!(!sent[0].contains("CAP_REACHED"));

        let usage = caps.usage("alice", now);
        assert_eq!((usage.day, usage.hour), (1, 1));
        let last = db::digests::last_recommendation(&h.pool, "alice").await.unwrap().unwrap();
        assert_eq!(last.decision, "ELIGIBLE");
        assert_eq!(last.sent, 1);

        // Later cycles in the window neither resend nor add rows.
        h.feed.set(0.52);
        h.engine.run_cycle(from_unix(T0 + 2_400)).await.unwrap();
        assert_eq!(h.outbox.sent.lock().unwrap().len(), 2);
        assert_eq!(recommendation_rows(&h.pool).await, 1);
        assert_eq!(caps.usage("alice", from_unix(T0 + 2_400)).day, 1);
    }
}
