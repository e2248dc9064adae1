use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::warn;

use crate::db::models::{PlanRow, UserRow};
use crate::error::Result;
use crate::settings::plans::builtin_plans;
use crate::settings::{Plan, UserPreferences};

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

pub async fn upsert_plan(pool: &SqlitePool, plan: &Plan, now: DateTime<Utc>) -> Result<()> {
    let settings_json = serde_json::to_string(&plan.settings)?;
    sqlx::query(
        r#"
        INSERT INTO plans (name, settings_json, is_active, updated_at) VALUES (?, ?, ?, ?)
        ON CONFLICT (name) DO UPDATE SET
            settings_json = excluded.settings_json,
            is_active = excluded.is_active,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&plan.name)
    .bind(settings_json)
    .bind(i64::from(plan.is_active))
    .bind(now.timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert the built-in plans that are not already present. Operator edits
/// to existing rows are left alone.
pub async fn seed_builtin_plans(pool: &SqlitePool, now: DateTime<Utc>) -> Result<usize> {
    let mut inserted = 0;
    for plan in builtin_plans() {
        let settings_json = serde_json::to_string(&plan.settings)?;
        let res = sqlx::query(
            "INSERT OR IGNORE INTO plans (name, settings_json, is_active, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&plan.name)
        .bind(settings_json)
        .bind(i64::from(plan.is_active))
        .bind(now.timestamp())
        .execute(pool)
        .await?;
        inserted += res.rows_affected() as usize;
    }
    Ok(inserted)
}

pub async fn get_plan(pool: &SqlitePool, name: &str) -> Result<Option<Plan>> {
    let row: Option<PlanRow> =
        sqlx::query_as("SELECT name, settings_json, is_active, updated_at FROM plans WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    row.map(PlanRow::into_plan).transpose()
}

pub async fn list_plans(pool: &SqlitePool) -> Result<Vec<Plan>> {
    let rows: Vec<PlanRow> =
        sqlx::query_as("SELECT name, settings_json, is_active, updated_at FROM plans ORDER BY name")
            .fetch_all(pool)
            .await?;
    let mut plans = Vec::with_capacity(rows.len());
    for row in rows {
        let name = row.name.clone();
        match row.into_plan() {
            Ok(plan) => plans.push(plan),
            Err(e) => warn!(plan = %name, "skipping plan with unreadable settings: {e}"),
        }
    }
    Ok(plans)
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

const USER_COLUMNS: &str =
    "id, plan_name, chat_id, is_active, preferences_json, overrides_json, created_at, updated_at";

pub async fn upsert_user(pool: &SqlitePool, user: &UserPreferences, now: DateTime<Utc>) -> Result<()> {
    let preferences_json = serde_json::to_string(&user.preferences)?;
    let overrides_json = serde_json::to_string(&user.overrides)?;
    sqlx::query(
        r#"
        INSERT INTO users (
            id, plan_name, chat_id, is_active, preferences_json, overrides_json,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            plan_name = excluded.plan_name,
            chat_id = excluded.chat_id,
            is_active = excluded.is_active,
            preferences_json = excluded.preferences_json,
            overrides_json = excluded.overrides_json,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&user.user_id)
    .bind(&user.plan_name)
    .bind(&user.chat_id)
    .bind(i64::from(user.is_active))
    .bind(preferences_json)
    .bind(overrides_json)
    .bind(now.timestamp())
    .bind(now.timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_user(pool: &SqlitePool, user_id: &str) -> Result<Option<UserPreferences>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
    let row: Option<UserRow> = sqlx::query_as(&sql).bind(user_id).fetch_optional(pool).await?;
    Ok(row.map(UserRow::into_preferences))
}

pub async fn active_users(pool: &SqlitePool) -> Result<Vec<UserPreferences>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE is_active = 1 ORDER BY id");
    let rows: Vec<UserRow> = sqlx::query_as(&sql).fetch_all(pool).await?;
    Ok(rows.into_iter().map(UserRow::into_preferences).collect())
}

/// Returns false when the user does not exist.
pub async fn assign_plan(
    pool: &SqlitePool,
    user_id: &str,
    plan_name: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query("UPDATE users SET plan_name = ?, updated_at = ? WHERE id = ?")
        .bind(plan_name)
        .bind(now.timestamp())
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Copilot mutes
// ---------------------------------------------------------------------------

/// Markets and themes a user has silenced for Copilot.
#[derive(Debug, Clone, Default)]
pub struct ActiveMutes {
    pub markets: HashSet<String>,
    pub themes: HashSet<String>,
}

impl ActiveMutes {
    pub fn covers(&self, market_id: &str, theme_key: &str) -> bool {
        self.markets.contains(market_id) || self.themes.contains(theme_key)
    }
}

pub async fn add_mute(
    pool: &SqlitePool,
    user_id: &str,
    market_id: Option<&str>,
    theme_key: Option<&str>,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let res = sqlx::query(
        "INSERT INTO copilot_mutes (user_id, market_id, theme_key, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(market_id)
    .bind(theme_key)
    .bind(expires_at.timestamp())
    .bind(now.timestamp())
    .execute(pool)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn active_mutes(pool: &SqlitePool, user_id: &str, now: DateTime<Utc>) -> Result<ActiveMutes> {
    let rows: Vec<(Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT market_id, theme_key FROM copilot_mutes WHERE user_id = ? AND expires_at > ?",
    )
    .bind(user_id)
    .bind(now.timestamp())
    .fetch_all(pool)
    .await?;

    let mut mutes = ActiveMutes::default();
    for (market_id, theme_key) in rows {
        if let Some(m) = market_id {
            mutes.markets.insert(m);
        }
        if let Some(t) = theme_key {
            mutes.themes.insert(t);
        }
    }
    Ok(mutes)
}

pub async fn delete_expired_mutes(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("DELETE FROM copilot_mutes WHERE expires_at <= ?")
        .bind(now.timestamp())
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::types::from_unix;

    const T0: i64 = 1_767_600_000;

    #[tokio::test]
    async fn seeding_is_idempotent_and_keeps_operator_edits() {
        let pool = test_pool().await;
        assert_eq!(seed_builtin_plans(&pool, from_unix(T0)).await.unwrap(), 3);

        let mut pro = get_plan(&pool, "pro").await.unwrap().unwrap();
        pro.settings.max_copilot_per_day = Some(5);
        upsert_plan(&pool, &pro, from_unix(T0 + 1)).await.unwrap();

        assert_eq!(seed_builtin_plans(&pool, from_unix(T0 + 2)).await.unwrap(), 0);
        let reloaded = get_plan(&pool, "pro").await.unwrap().unwrap();
        assert_eq!(reloaded.settings.max_copilot_per_day, Some(5));
        assert_eq!(list_plans(&pool).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn users_round_trip_and_inactive_are_hidden() {
        let pool = test_pool().await;
        let mut alice = UserPreferences::new("alice");
        alice.plan_name = Some("pro".to_string());
        alice.chat_id = Some("42".to_string());
        alice.preferences.p_min = Some(0.2);
        upsert_user(&pool, &alice, from_unix(T0)).await.unwrap();

        let mut bob = UserPreferences::new("bob");
        bob.is_active = false;
        upsert_user(&pool, &bob, from_unix(T0)).await.unwrap();

        let active = active_users(&pool).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0], alice);

        assert!(assign_plan(&pool, "alice", "elite", from_unix(T0 + 5)).await.unwrap());
        assert!(!assign_plan(&pool, "nobody", "elite", from_unix(T0 + 5)).await.unwrap());
        let alice = get_user(&pool, "alice").await.unwrap().unwrap();
        assert_eq!(alice.plan_name.as_deref(), Some("elite"));
    }

    #[tokio::test]
    async fn mutes_expire() {
        let pool = test_pool().await;
        add_mute(&pool, "alice", Some("m1"), None, from_unix(T0 + 600), from_unix(T0)).await.unwrap();
        add_mute(&pool, "alice", None, Some("bitcoin|jan_5|price-band"), from_unix(T0 + 60), from_unix(T0))
            .await
            .unwrap();

        let mutes = active_mutes(&pool, "alice", from_unix(T0 + 30)).await.unwrap();
        assert!(mutes.covers("m1", "other"));
        assert!(mutes.covers("m2", "bitcoin|jan_5|price-band"));

        let later = active_mutes(&pool, "alice", from_unix(T0 + 120)).await.unwrap();
        assert!(!later.covers("m2", "bitcoin|jan_5|price-band"));
        assert_eq!(delete_expired_mutes(&pool, from_unix(T0 + 120)).await.unwrap(), 1);
    }
}
