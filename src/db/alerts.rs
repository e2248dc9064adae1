use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::{AlertRow, CooldownRow};
use crate::error::Result;
use crate::types::{from_unix, Alert, Tier};

const ALERT_COLUMNS: &str = "id, tier, market_id, title, category, old_price, new_price, delta_pct, \
    liquidity, volume_24h, strength, watch_only, outcome_label, mapping_confidence, bucket, \
    triggered_at, message";

/// Persist an alert and stamp its cooldown row in one transaction.
/// Returns the new id, or None when an alert for the same
/// (tier, market, bucket) already exists.
pub async fn insert_with_cooldown(pool: &SqlitePool, alert: &Alert) -> Result<Option<i64>> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        r#"
        INSERT OR IGNORE INTO alerts (
            tier, market_id, title, category, old_price, new_price, delta_pct,
            liquidity, volume_24h, strength, watch_only, outcome_label,
            mapping_confidence, bucket, triggered_at, message
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(alert.tier.to_string())
    .bind(&alert.market_id)
    .bind(&alert.title)
    .bind(&alert.category)
    .bind(alert.old_price)
    .bind(alert.new_price)
    .bind(alert.delta_pct)
    .bind(alert.liquidity)
    .bind(alert.volume_24h)
    .bind(alert.strength.to_string())
    .bind(i64::from(alert.watch_only))
    .bind(&alert.outcome_label)
    .bind(alert.mapping_confidence.to_string())
    .bind(alert.bucket.timestamp())
    .bind(alert.triggered_at.timestamp())
    .bind(&alert.message)
    .execute(&mut *tx)
    .await?;

    if res.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(None);
    }
    let id = res.last_insert_rowid();

    sqlx::query(
        r#"
        INSERT INTO cooldowns (market_id, tier, last_triggered_at) VALUES (?, ?, ?)
        ON CONFLICT (market_id, tier) DO UPDATE SET last_triggered_at = excluded.last_triggered_at
        "#,
    )
    .bind(&alert.market_id)
    .bind(alert.tier.to_string())
    .bind(alert.triggered_at.timestamp())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(id))
}

/// Every persisted cooldown, for warming the in-memory ledger at startup.
pub async fn load_cooldowns(pool: &SqlitePool) -> Result<Vec<(String, Tier, DateTime<Utc>)>> {
    let rows: Vec<CooldownRow> =
        sqlx::query_as("SELECT market_id, tier, last_triggered_at FROM cooldowns")
            .fetch_all(pool)
            .await?;
    Ok(rows
        .into_iter()
        .filter_map(|r| {
            Tier::parse(&r.tier).map(|tier| (r.market_id, tier, from_unix(r.last_triggered_at)))
        })
        .collect())
}

/// Alerts of one tier triggered at or after `since`, newest first.
pub async fn in_window(pool: &SqlitePool, tier: Tier, since: DateTime<Utc>) -> Result<Vec<Alert>> {
    let sql = format!(
        "SELECT {ALERT_COLUMNS} FROM alerts WHERE tier = ? AND triggered_at >= ? \
         ORDER BY triggered_at DESC, id DESC"
    );
    let rows: Vec<AlertRow> = sqlx::query_as(&sql)
        .bind(tier.to_string())
        .bind(since.timestamp())
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(Alert::from).collect())
}

pub async fn latest(pool: &SqlitePool, tier: Option<Tier>, limit: i64) -> Result<Vec<Alert>> {
    let sql = format!(
        "SELECT {ALERT_COLUMNS} FROM alerts WHERE (? IS NULL OR tier = ?) \
         ORDER BY triggered_at DESC, id DESC LIMIT ?"
    );
    let tier = tier.map(|t| t.to_string());
    let rows: Vec<AlertRow> = sqlx::query_as(&sql)
        .bind(tier.as_deref())
        .bind(tier.as_deref())
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(Alert::from).collect())
}

pub async fn history(
    pool: &SqlitePool,
    market_id: Option<&str>,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Alert>> {
    let sql = format!(
        "SELECT {ALERT_COLUMNS} FROM alerts \
         WHERE (? IS NULL OR market_id = ?) AND triggered_at >= ? \
         ORDER BY triggered_at DESC, id DESC LIMIT ?"
    );
    let rows: Vec<AlertRow> = sqlx::query_as(&sql)
        .bind(market_id)
        .bind(market_id)
        .bind(since.timestamp())
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(Alert::from).collect())
}

pub async fn delete_older_than(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("DELETE FROM alerts WHERE triggered_at < ?")
        .bind(cutoff.timestamp())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::types::{MappingConfidence, Strength};

    const T0: i64 = 1_767_600_000;

    fn alert(market_id: &str, tier: Tier, at: i64) -> Alert {
        Alert {
            id: 0,
            tier,
            market_id: market_id.to_string(),
            title: "Will BTC be above 100k?".to_string(),
            category: "crypto".to_string(),
            old_price: Some(0.40),
            new_price: Some(0.46),
            delta_pct: 0.15,
            liquidity: Some(20_000.0),
            volume_24h: Some(20_000.0),
            strength: Strength::Strong,
            watch_only: false,
            outcome_label: Some("Yes".to_string()),
            mapping_confidence: MappingConfidence::Verified,
            bucket: from_unix(at - at.rem_euclid(300)),
            triggered_at: from_unix(at),
            message: "Dislocation 15.0% over 60m".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_round_trips_and_stamps_cooldown() {
        let pool = test_pool().await;
        let id = insert_with_cooldown(&pool, &alert("m1", Tier::Confirmed, T0)).await.unwrap();
        assert!(id.is_some());

        let cooldowns = load_cooldowns(&pool).await.unwrap();
        assert_eq!(cooldowns.len(), 1);
        assert_eq!(cooldowns[0].1, Tier::Confirmed);
        assert_eq!(cooldowns[0].2.timestamp(), T0);

        let rows = in_window(&pool, Tier::Confirmed, from_unix(T0 - 60)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].strength, Strength::Strong);
        assert_eq!(rows[0].mapping_confidence, MappingConfidence::Verified);
    }

    #[tokio::test]
    async fn duplicate_bucket_is_ignored() {
        let pool = test_pool().await;
        let a = alert("m1", Tier::Confirmed, T0);
        assert!(insert_with_cooldown(&pool, &a).await.unwrap().is_some());
        assert!(insert_with_cooldown(&pool, &a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tiers_are_filtered_independently() {
        let pool = test_pool().await;
        insert_with_cooldown(&pool, &alert("m1", Tier::Confirmed, T0)).await.unwrap();
        insert_with_cooldown(&pool, &alert("m1", Tier::Fast, T0)).await.unwrap();

        assert_eq!(in_window(&pool, Tier::Fast, from_unix(T0 - 60)).await.unwrap().len(), 1);
        assert_eq!(latest(&pool, None, 10).await.unwrap().len(), 2);
        assert_eq!(latest(&pool, Some(Tier::Confirmed), 10).await.unwrap().len(), 1);
        assert_eq!(load_cooldowns(&pool).await.unwrap().len(), 2);
    }
}
