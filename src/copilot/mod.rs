pub mod caps;
pub mod gate;
pub mod rationale;

pub use caps::{CapKind, CapUsage, CopilotCaps};
pub use gate::{cap_reached_message, evaluate, select, Decision, GateHistory, Selection, SkipReason};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::clients::{Messenger, RationaleLlm};
use crate::config::PRICE_POINTS_PER_SIDE;
use crate::db;
use crate::db::digests::NewRecommendation;
use crate::error::Result;
use crate::settings::EffectiveSettings;
use crate::themes::Theme;

/// What happened to the Copilot candidates of one digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopilotReport {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct CopilotService {
    pool: SqlitePool,
    caps: CopilotCaps,
    messenger: Arc<dyn Messenger>,
    llm: Option<Arc<dyn RationaleLlm>>,
}

impl CopilotService {
    pub fn new(
        pool: SqlitePool,
        caps: CopilotCaps,
        messenger: Arc<dyn Messenger>,
        llm: Option<Arc<dyn RationaleLlm>>,
    ) -> Self {
        Self {
            pool,
            caps,
            messenger,
            llm,
        }
    }

    pub fn caps(&self) -> &CopilotCaps {
        &self.caps
    }

    /// Gate inputs per theme key, loaded before the gate runs.
    async fn load_histories(
        &self,
        settings: &EffectiveSettings,
        themes: &[Theme],
        digest_recently_sent: bool,
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, GateHistory>> {
        let mutes = db::users::active_mutes(&self.pool, &settings.user_id, now).await?;
        let mut histories = HashMap::with_capacity(themes.len());
        for theme in themes {
            let rep = &theme.representative().alert;
            let points =
                db::snapshots::points_around(&self.pool, &rep.market_id, rep.bucket, PRICE_POINTS_PER_SIDE).await?;
            let history = GateHistory {
                digest_recently_sent,
                theme_recently_sent: self.caps.theme_recently_sent(&settings.user_id, &theme.key),
                muted: mutes.covers(&rep.market_id, &theme.key),
                snapshot_points: points.len(),
                usage: CapUsage::default(),
            };
            histories.insert(theme.key.clone(), history);
        }
        Ok(histories)
    }

    /// Run the gate over a digest's themes. Reads state only.
    pub async fn evaluate(
        &self,
        settings: &EffectiveSettings,
        themes: &[Theme],
        digest_recently_sent: bool,
        now: DateTime<Utc>,
    ) -> Result<Selection> {
        let histories = self.load_histories(settings, themes, digest_recently_sent, now).await?;
        let usage = self.caps.usage(&settings.user_id, now);
        let selection = select(settings, themes, usage, |theme| {
            histories.get(&theme.key).copied().unwrap_or_default()
        });

        for eval in &selection.evaluations {
            info!(
                event = "COPILOT_EVAL",
                user_id = %settings.user_id,
                theme_key = %eval.theme_key,
                alert_id = eval.alert_id,
                reason = eval.decision.reason().map_or("ELIGIBLE", |r| r.as_str()),
                "[COPILOT] evaluated"
            );
        }
        Ok(selection)
    }

    /// Send a message for every selected theme and record every evaluation.
    /// Caps move only after the messenger accepts a message.
    pub async fn deliver(
        &self,
        settings: &EffectiveSettings,
        themes: &[Theme],
        selection: &Selection,
        now: DateTime<Utc>,
    ) -> Result<CopilotReport> {
        let mut report = CopilotReport::default();
        let expires_at = (now + Duration::minutes(settings.copilot_theme_ttl_minutes)).timestamp();
        let by_key: HashMap<&str, &Theme> = themes.iter().map(|t| (t.key.as_str(), t)).collect();

        for eval in &selection.evaluations {
            let mut record = NewRecommendation {
                user_id: settings.user_id.clone(),
                alert_id: Some(eval.alert_id),
                theme_key: eval.theme_key.clone(),
                created_at: now.timestamp(),
                expires_at,
                ..Default::default()
            };

            let (Decision::Eligible, Some(theme)) = (eval.decision, by_key.get(eval.theme_key.as_str())) else {
                let reason = eval.decision.reason().unwrap_or(SkipReason::CopilotDedupeActive);
                self.record_skip(settings, record, reason, now).await?;
                report.skipped += 1;
                continue;
            };
            record.decision = "ELIGIBLE".to_string();

            // Lost race with a concurrent send for the same theme.
            if !self.caps.claim_theme(
                &settings.user_id,
                &theme.key,
                settings.copilot_theme_ttl_minutes,
                now,
            ) {
                self.record_skip(settings, record, SkipReason::CopilotDedupeActive, now)
                    .await?;
                report.skipped += 1;
                continue;
            }

            let sent = self.send_one(settings, theme, &mut record).await;
            record.sent = sent;
            if sent {
                let usage = self.caps.record_send(&settings.user_id, now);
                info!(
                    user_id = %settings.user_id,
                    theme_key = %theme.key,
                    day = usage.day,
                    hour = usage.hour,
                    "[COPILOT] recommendation sent"
                );
                report.sent += 1;
            } else {
                self.caps.release_theme(&settings.user_id, &theme.key);
                report.failed += 1;
            }
            self.caps
                .mark_recorded(&settings.user_id, &theme.key, settings.digest_window_minutes, now);
            db::digests::insert_recommendation(&self.pool, &record).await?;
        }
        Ok(report)
    }

    /// Write a SKIP row unless this theme already has one in the current
    /// digest window.
    async fn record_skip(
        &self,
        settings: &EffectiveSettings,
        mut record: NewRecommendation,
        reason: SkipReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self
            .caps
            .claim_record(&settings.user_id, &record.theme_key, settings.digest_window_minutes, now)
        {
            debug!(
                user_id = %settings.user_id,
                theme_key = %record.theme_key,
                reason = reason.as_str(),
                "[COPILOT] skip already on record for this window"
            );
            return Ok(());
        }
        record.decision = "SKIP".to_string();
        record.reason = Some(reason.as_str().to_string());
        db::digests::insert_recommendation(&self.pool, &record).await?;
        Ok(())
    }

    async fn send_one(&self, settings: &EffectiveSettings, theme: &Theme, record: &mut NewRecommendation) -> bool {
        let Some(chat_id) = settings.chat_id.as_deref() else {
            return false;
        };
        let rep = theme.representative();
        let points = match db::snapshots::points_around(
            &self.pool,
            &rep.alert.market_id,
            rep.alert.bucket,
            PRICE_POINTS_PER_SIDE,
        )
        .await
        {
            Ok(points) => points,
            Err(e) => {
                warn!(user_id = %settings.user_id, "[COPILOT] evidence lookup failed: {e}");
                Vec::new()
            }
        };
        let evidence = rationale::build_evidence(&rep.alert, &points);
        let context = rationale::build_context(&settings.user_id, &rep.alert, &rep.classification, &evidence);
        let text = rationale::draft(self.llm.as_deref(), &context).await;
        let html = rationale::format_message(&rep.alert, &text, &evidence);

        record.recommendation = Some(text.recommendation);
        record.confidence = Some(text.confidence);
        record.rationale = Some(text.rationale);
        record.risks = Some(text.risks);

        match self
            .messenger
            .send(chat_id, &html, &rationale::mute_buttons(rep.alert.id))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    user_id = %settings.user_id,
                    theme_key = %theme.key,
                    "[COPILOT] send failed: {e}"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::InlineButton;
    use crate::db::test_pool;
    use crate::error::AppError;
    use crate::settings::plans::builtin_plan;
    use crate::settings::{resolve, UserPreferences};
    use crate::state::KvStore;
    use crate::themes::group_alerts;
    use crate::types::{
        from_unix, Alert, AlertClassification, Confidence, MappingConfidence, MarketSnapshot, SignalType, Strength,
        SuggestedAction, Tier,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    const T0: i64 = 1_767_600_000;

    #[derive(Default)]
    struct Outbox {
        fail: bool,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Messenger for Outbox {
        async fn send(&self, chat_id: &str, html: &str, _buttons: &[Vec<InlineButton>]) -> Result<()> {
            if self.fail {
                return Err(AppError::Messaging("503".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), html.to_string()));
            Ok(())
        }
    }

    fn settings(plan: &str) -> EffectiveSettings {
        let mut user = UserPreferences::new("u1");
        user.plan_name = Some(plan.to_string());
        user.chat_id = Some("42".to_string());
        resolve(&user, builtin_plan(plan).as_ref())
    }

    fn alert(id: i64, market_id: &str, title: &str) -> Alert {
        Alert {
            id,
            tier: Tier::Confirmed,
            market_id: market_id.to_string(),
            title: title.to_string(),
            category: "economy".to_string(),
            old_price: Some(0.40),
            new_price: Some(0.50),
            delta_pct: 0.25,
            liquidity: Some(60_000.0),
            volume_24h: Some(60_000.0),
            strength: Strength::Strong,
            watch_only: false,
            outcome_label: Some("Yes".to_string()),
            mapping_confidence: MappingConfidence::Verified,
            bucket: from_unix(T0),
            triggered_at: from_unix(T0),
            message: String::new(),
        }
    }

    fn themes() -> Vec<Theme> {
        group_alerts(
            &[alert(1, "m1", "Will the Fed cut rates in March?")],
            |_| AlertClassification::new(SignalType::Repricing, Confidence::High, SuggestedAction::Follow),
            5,
            3,
        )
    }

    async fn seed_points(pool: &SqlitePool) {
        for (i, p) in [0.40, 0.44, 0.50, 0.52].iter().enumerate() {
            let bucket = from_unix(T0 - 300 + i as i64 * 300);
            let snap = MarketSnapshot {
                market_id: "m1".to_string(),
                title: "Will the Fed cut rates in March?".to_string(),
                category: "economy".to_string(),
                p_yes: *p,
                liquidity: 60_000.0,
                volume_24h: 60_000.0,
                outcome_label: Some("Yes".to_string()),
                mapping_confidence: MappingConfidence::Verified,
                source_ts: bucket,
                bucket,
            };
            db::snapshots::upsert_snapshots(pool, &[snap], bucket).await.unwrap();
        }
    }

    async fn service(fail: bool) -> (CopilotService, Arc<Outbox>, SqlitePool) {
        let pool = test_pool().await;
        seed_points(&pool).await;
        let outbox = Arc::new(Outbox {
            fail,
            ..Outbox::default()
        });
        let svc = CopilotService::new(pool.clone(), CopilotCaps::new(KvStore::new()), outbox.clone(), None);
        (svc, outbox, pool)
    }

    #[tokio::test]
    async fn eligible_theme_is_sent_and_counted() {
        let (svc, outbox, pool) = service(false).await;
        let s = settings("pro");
        let now = from_unix(T0 + 600);
        let themes = themes();
        let selection = svc.evaluate(&s, &themes, false, now).await.unwrap();
        assert_eq!(selection.selected().count(), 1);

        let report = svc.deliver(&s, &themes, &selection, now).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(outbox.sent.lock().unwrap().len(), 1);
        assert_eq!(svc.caps().usage("u1", now).day, 1);

        let last = db::digests::last_recommendation(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(last.decision, "ELIGIBLE");
        assert_eq!(last.recommendation.as_deref(), Some("WAIT"));

        // Same theme in the next cycle is deduped.
        let again = svc.evaluate(&s, &themes, false, now).await.unwrap();
        assert_eq!(
            again.evaluations[0].decision.reason(),
            Some(SkipReason::CopilotDedupeActive)
        );
    }

    #[tokio::test]
    async fn failed_send_leaves_caps_unconsumed() {
        let (svc, _outbox, pool) = service(true).await;
        let s = settings("pro");
        let now = from_unix(T0 + 600);
        let themes = themes();
        let selection = svc.evaluate(&s, &themes, false, now).await.unwrap();
        let report = svc.deliver(&s, &themes, &selection, now).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(svc.caps().usage("u1", now), CapUsage::default());
        assert!(!svc.caps().theme_recently_sent("u1", &themes[0].key));

        let last = db::digests::last_recommendation(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(last.sent, 0);
    }

    #[tokio::test]
    async fn basic_plan_records_plan_disabled() {
        let (svc, outbox, pool) = service(false).await;
        let s = settings("basic");
        let now = from_unix(T0 + 600);
        let themes = themes();
        let selection = svc.evaluate(&s, &themes, false, now).await.unwrap();
        let report = svc.deliver(&s, &themes, &selection, now).await.unwrap();
        assert_eq!(report, CopilotReport { sent: 0, failed: 0, skipped: 1 });
        assert!(outbox.sent.lock().unwrap().is_empty());
        let last = db::digests::last_recommendation(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(last.reason.as_deref(), Some("PLAN_DISABLED"));
    }

    #[tokio::test]
    async fn muted_market_is_skipped() {
        let (svc, _outbox, pool) = service(false).await;
        let s = settings("elite");
        let now = from_unix(T0 + 600);
        db::users::add_mute(&pool, "u1", Some("m1"), None, now + Duration::hours(1), now)
            .await
            .unwrap();
        let selection = svc.evaluate(&s, &themes(), false, now).await.unwrap();
        assert_eq!(selection.evaluations[0].decision.reason(), Some(SkipReason::Muted));
    }

    #[tokio::test]
    async fn suppressed_digest_writes_one_skip_row_per_window() {
        let (svc, _outbox, pool) = service(false).await;
        let s = settings("pro");
        let themes = themes();
        for minute in [10, 15, 20, 25] {
            let now = from_unix(T0 + minute * 60);
            let selection = svc.evaluate(&s, &themes, true, now).await.unwrap();
            let report = svc.deliver(&s, &themes, &selection, now).await.unwrap();
            assert_eq!(report.skipped, 1);
        }
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM copilot_recommendations WHERE user_id = ?")
            .bind("u1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        let last = db::digests::last_recommendation(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(last.reason.as_deref(), Some("DIGEST_RECENTLY_SENT"));
    }

    #[tokio::test]
    async fn send_after_an_earlier_skip_is_still_recorded() {
        let (svc, outbox, pool) = service(false).await;
        let s = settings("pro");
        let themes = themes();
        let now = from_unix(T0 + 600);
        let blocked = svc.evaluate(&s, &themes, true, now).await.unwrap();
        svc.deliver(&s, &themes, &blocked, now).await.unwrap();

        let later = now + Duration::minutes(5);
        let open = svc.evaluate(&s, &themes, false, later).await.unwrap();
        let report = svc.deliver(&s, &themes, &open, later).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(outbox.sent.lock().unwrap().len(), 1);
        let last = db::digests::last_recommendation(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(last.decision, "ELIGIBLE");
    }
}
