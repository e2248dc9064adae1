use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::{CopilotRecommendationRow, DigestRunRow};
use crate::error::Result;
use crate::types::{from_unix, Tier};

/// A composed digest about to be recorded.
#[derive(Debug, Clone)]
pub struct NewDigestRun<'a> {
    pub user_id: &'a str,
    pub tier: Tier,
    /// Final outcome, e.g. `SENT` or `SEND_FAILED`.
    pub status: &'a str,
    pub theme_keys: Vec<String>,
    pub alert_ids: Vec<i64>,
    pub actionable_count: usize,
    pub skip_log: Vec<String>,
    pub fingerprint: &'a str,
    pub payload: &'a str,
    pub created_at: DateTime<Utc>,
}

pub async fn insert_digest_run(pool: &SqlitePool, run: &NewDigestRun<'_>) -> Result<i64> {
    let res = sqlx::query(
        r#"
        INSERT INTO digest_runs (
            user_id, tier, status, theme_count, alert_count, actionable_count,
            theme_keys_json, alert_ids_json, skip_log_json, fingerprint, payload, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(run.user_id)
    .bind(run.tier.to_string())
    .bind(run.status)
    .bind(run.theme_keys.len() as i64)
    .bind(run.alert_ids.len() as i64)
    .bind(run.actionable_count as i64)
    .bind(serde_json::to_string(&run.theme_keys)?)
    .bind(serde_json::to_string(&run.alert_ids)?)
    .bind(serde_json::to_string(&run.skip_log)?)
    .bind(run.fingerprint)
    .bind(run.payload)
    .bind(run.created_at.timestamp())
    .execute(pool)
    .await?;
    Ok(res.last_insert_rowid())
}

const DIGEST_COLUMNS: &str = "id, user_id, tier, status, theme_count, alert_count, actionable_count, \
    theme_keys_json, alert_ids_json, skip_log_json, fingerprint, payload, created_at";

pub async fn last_digest_run(
    pool: &SqlitePool,
    user_id: &str,
    tier: Option<Tier>,
) -> Result<Option<DigestRunRow>> {
    let sql = format!(
        "SELECT {DIGEST_COLUMNS} FROM digest_runs WHERE user_id = ? AND (? IS NULL OR tier = ?) \
         ORDER BY created_at DESC, id DESC LIMIT 1"
    );
    let tier = tier.map(|t| t.to_string());
    let row = sqlx::query_as(&sql)
        .bind(user_id)
        .bind(tier.as_deref())
        .bind(tier.as_deref())
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// When the user last successfully received a digest of this tier.
pub async fn last_sent_at(pool: &SqlitePool, user_id: &str, tier: Tier) -> Result<Option<DateTime<Utc>>> {
    let ts: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(created_at) FROM digest_runs WHERE user_id = ? AND tier = ? AND status = 'SENT'",
    )
    .bind(user_id)
    .bind(tier.to_string())
    .fetch_one(pool)
    .await?;
    Ok(ts.map(from_unix))
}

// ---------------------------------------------------------------------------
// Copilot recommendations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct NewRecommendation {
    pub user_id: String,
    pub alert_id: Option<i64>,
    pub theme_key: String,
    /// `ELIGIBLE` or `SKIP`.
    pub decision: String,
    pub reason: Option<String>,
    pub recommendation: Option<String>,
    pub confidence: Option<String>,
    pub rationale: Option<String>,
    pub risks: Option<String>,
    pub sent: bool,
    pub created_at: i64,
    pub expires_at: i64,
}

pub async fn insert_recommendation(pool: &SqlitePool, rec: &NewRecommendation) -> Result<i64> {
    let res = sqlx::query(
        r#"
        INSERT INTO copilot_recommendations (
            user_id, alert_id, theme_key, decision, reason, recommendation,
            confidence, rationale, risks, sent, created_at, expires_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&rec.user_id)
    .bind(rec.alert_id)
    .bind(&rec.theme_key)
    .bind(&rec.decision)
    .bind(&rec.reason)
    .bind(&rec.recommendation)
    .bind(&rec.confidence)
    .bind(&rec.rationale)
    .bind(&rec.risks)
    .bind(i64::from(rec.sent))
    .bind(rec.created_at)
    .bind(rec.expires_at)
    .execute(pool)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn last_recommendation(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Option<CopilotRecommendationRow>> {
    let row = sqlx::query_as(
        r#"
        SELECT id, user_id, alert_id, theme_key, decision, reason, recommendation,
               confidence, rationale, risks, sent, created_at, expires_at
        FROM copilot_recommendations
        WHERE user_id = ?
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn delete_runs_older_than(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("DELETE FROM digest_runs WHERE created_at < ?")
        .bind(cutoff.timestamp())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn delete_recommendations_older_than(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("DELETE FROM copilot_recommendations WHERE created_at < ?")
        .bind(cutoff.timestamp())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}
