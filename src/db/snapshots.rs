use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::Result;
use crate::types::{from_unix, MarketSnapshot, PricePoint};

/// Upsert one cycle's snapshots. A second ingest inside the same bucket
/// overwrites the earlier row, so each market has at most one point per bucket.
pub async fn upsert_snapshots(
    pool: &SqlitePool,
    snapshots: &[MarketSnapshot],
    ingested_at: DateTime<Utc>,
) -> Result<usize> {
    let mut tx = pool.begin().await?;
    for s in snapshots {
        sqlx::query(
            r#"
            INSERT INTO market_snapshots (
                market_id, title, category, p_yes, liquidity, volume_24h,
                outcome_label, mapping_confidence, source_ts, bucket, ingested_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (market_id, bucket) DO UPDATE SET
                title = excluded.title,
                category = excluded.category,
                p_yes = excluded.p_yes,
                liquidity = excluded.liquidity,
                volume_24h = excluded.volume_24h,
                outcome_label = excluded.outcome_label,
                mapping_confidence = excluded.mapping_confidence,
                source_ts = excluded.source_ts,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&s.market_id)
        .bind(&s.title)
        .bind(&s.category)
        .bind(s.p_yes)
        .bind(s.liquidity)
        .bind(s.volume_24h)
        .bind(&s.outcome_label)
        .bind(s.mapping_confidence.to_string())
        .bind(s.source_ts.timestamp())
        .bind(s.bucket.timestamp())
        .bind(ingested_at.timestamp())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(snapshots.len())
}

/// Oldest point in `[window_start, before)`. This is the baseline a move
/// is measured against.
pub async fn window_baseline(
    pool: &SqlitePool,
    market_id: &str,
    window_start: DateTime<Utc>,
    before: DateTime<Utc>,
) -> Result<Option<PricePoint>> {
    let row: Option<(i64, f64)> = sqlx::query_as(
        r#"
        SELECT bucket, p_yes FROM market_snapshots
        WHERE market_id = ? AND bucket >= ? AND bucket < ?
        ORDER BY bucket ASC
        LIMIT 1
        "#,
    )
    .bind(market_id)
    .bind(window_start.timestamp())
    .bind(before.timestamp())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(bucket, p_yes)| PricePoint { bucket: from_unix(bucket), p_yes }))
}

/// Points in `[from, to]`, oldest first.
pub async fn points_between(
    pool: &SqlitePool,
    market_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<PricePoint>> {
    let rows: Vec<(i64, f64)> = sqlx::query_as(
        r#"
        SELECT bucket, p_yes FROM market_snapshots
        WHERE market_id = ? AND bucket >= ? AND bucket <= ?
        ORDER BY bucket ASC
        "#,
    )
    .bind(market_id)
    .bind(from.timestamp())
    .bind(to.timestamp())
    .fetch_all(pool)
    .await?;
    Ok(to_points(rows))
}

/// Up to `per_side` points before and at-or-after `anchor`, oldest first.
/// Feeds the classifier and the Copilot snapshot-count gate.
pub async fn points_around(
    pool: &SqlitePool,
    market_id: &str,
    anchor: DateTime<Utc>,
    per_side: i64,
) -> Result<Vec<PricePoint>> {
    let before: Vec<(i64, f64)> = sqlx::query_as(
        r#"
        SELECT bucket, p_yes FROM market_snapshots
        WHERE market_id = ? AND bucket < ?
        ORDER BY bucket DESC
        LIMIT ?
        "#,
    )
    .bind(market_id)
    .bind(anchor.timestamp())
    .bind(per_side)
    .fetch_all(pool)
    .await?;
    let after: Vec<(i64, f64)> = sqlx::query_as(
        r#"
        SELECT bucket, p_yes FROM market_snapshots
        WHERE market_id = ? AND bucket >= ?
        ORDER BY bucket ASC
        LIMIT ?
        "#,
    )
    .bind(market_id)
    .bind(anchor.timestamp())
    .bind(per_side)
    .fetch_all(pool)
    .await?;

    let mut rows = before;
    rows.reverse();
    rows.extend(after);
    Ok(to_points(rows))
}

pub async fn delete_older_than(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("DELETE FROM market_snapshots WHERE bucket < ?")
        .bind(cutoff.timestamp())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

fn to_points(rows: Vec<(i64, f64)>) -> Vec<PricePoint> {
    rows.into_iter()
        .map(|(bucket, p_yes)| PricePoint { bucket: from_unix(bucket), p_yes })
        .collect()
}
