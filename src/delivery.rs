//! Delivery Tracker: one `alert_deliveries` row per (alert, user).
//!
//! Rows are upserted on every digest attempt. A row that reached `sent`
//! keeps that status; later attempts may only refresh rows that were
//! `skipped` or `filtered`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::DeliveryRow;
use crate::error::Result;
use crate::types::DeliveryStatus;

/// One alert's outcome for a user.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryEntry<'a> {
    pub alert_id: i64,
    pub status: DeliveryStatus,
    pub reason: Option<&'a str>,
}

impl<'a> DeliveryEntry<'a> {
    pub fn new(alert_id: i64, status: DeliveryStatus, reason: Option<&'a str>) -> Self {
        Self {
            alert_id,
            status,
            reason,
        }
    }
}

#[derive(Clone)]
pub struct DeliveryTracker {
    pool: SqlitePool,
}

impl DeliveryTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a batch in one transaction. Returns rows written.
    pub async fn record(
        &self,
        user_id: &str,
        entries: &[DeliveryEntry<'_>],
        digest_run_id: Option<i64>,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for entry in entries {
            let res = sqlx::query(
                r#"
                INSERT INTO alert_deliveries (alert_id, user_id, digest_run_id, status, reason, delivered_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (alert_id, user_id) DO UPDATE SET
                    digest_run_id = excluded.digest_run_id,
                    status = excluded.status,
                    reason = excluded.reason,
                    delivered_at = excluded.delivered_at
                WHERE alert_deliveries.status != 'sent'
                "#,
            )
            .bind(entry.alert_id)
            .bind(user_id)
            .bind(digest_run_id)
            .bind(entry.status.to_string())
            .bind(entry.reason)
            .bind(at.timestamp())
            .execute(&mut *tx)
            .await?;
            written += res.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Which of `alert_ids` were already sent to the user.
    pub async fn sent_alert_ids(&self, user_id: &str, alert_ids: &[i64]) -> Result<HashSet<i64>> {
        if alert_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; alert_ids.len()].join(", ");
        let sql = format!(
            "SELECT alert_id FROM alert_deliveries \
             WHERE user_id = ? AND status = 'sent' AND alert_id IN ({placeholders})"
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(user_id);
        for id in alert_ids {
            query = query.bind(*id);
        }
        Ok(query.fetch_all(&self.pool).await?.into_iter().collect())
    }

    pub async fn for_user(&self, user_id: &str, limit: i64) -> Result<Vec<DeliveryRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, alert_id, user_id, digest_run_id, status, reason, delivered_at
            FROM alert_deliveries
            WHERE user_id = ?
            ORDER BY delivered_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM alert_deliveries WHERE delivered_at < ?")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
