/// Database row types. Used by sqlx for typed queries and converted into
/// domain types at the repository boundary.
use serde::Serialize;

use crate::settings::{Plan, SettingsLayer, UserPreferences};
use crate::types::{from_unix, Alert, MappingConfidence, Strength, Tier};

#[derive(Debug, sqlx::FromRow)]
pub struct AlertRow {
    pub id: i64,
    pub tier: String,
    pub market_id: String,
    pub title: String,
    pub category: String,
    pub old_price: Option<f64>,
    pub new_price: Option<f64>,
    pub delta_pct: f64,
    pub liquidity: Option<f64>,
    pub volume_24h: Option<f64>,
    pub strength: String,
    pub watch_only: i64,
    pub outcome_label: Option<String>,
    pub mapping_confidence: String,
    pub bucket: i64,
    pub triggered_at: i64,
    pub message: String,
}

impl From<AlertRow> for Alert {
    fn from(r: AlertRow) -> Self {
        Alert {
            id: r.id,
            tier: Tier::parse(&r.tier).unwrap_or(Tier::Confirmed),
            market_id: r.market_id,
            title: r.title,
            category: r.category,
            old_price: r.old_price,
            new_price: r.new_price,
            delta_pct: r.delta_pct,
            liquidity: r.liquidity,
            volume_24h: r.volume_24h,
            strength: Strength::parse(&r.strength).unwrap_or(Strength::Medium),
            watch_only: r.watch_only != 0,
            outcome_label: r.outcome_label,
            mapping_confidence: MappingConfidence::parse(&r.mapping_confidence),
            bucket: from_unix(r.bucket),
            triggered_at: from_unix(r.triggered_at),
            message: r.message,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct CooldownRow {
    pub market_id: String,
    pub tier: String,
    pub last_triggered_at: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct PlanRow {
    pub name: String,
    pub settings_json: String,
    pub is_active: i64,
    pub updated_at: i64,
}

impl PlanRow {
    pub fn into_plan(self) -> crate::error::Result<Plan> {
        let settings: SettingsLayer = serde_json::from_str(&self.settings_json)?;
        Ok(Plan {
            name: self.name,
            settings,
            is_active: self.is_active != 0,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub plan_name: Option<String>,
    pub chat_id: Option<String>,
    pub is_active: i64,
    pub preferences_json: String,
    pub overrides_json: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UserRow {
    /// Malformed preference JSON degrades to an empty layer rather than
    /// taking the user out of the cycle.
    pub fn into_preferences(self) -> UserPreferences {
        let layer = |raw: &str| serde_json::from_str::<SettingsLayer>(raw).unwrap_or_default();
        UserPreferences {
            preferences: layer(&self.preferences_json),
            overrides: layer(&self.overrides_json),
            user_id: self.id,
            plan_name: self.plan_name,
            chat_id: self.chat_id,
            is_active: self.is_active != 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DigestRunRow {
    pub id: i64,
    pub user_id: String,
    pub tier: String,
    pub status: String,
    pub theme_count: i64,
    pub alert_count: i64,
    pub actionable_count: i64,
    pub theme_keys_json: String,
    pub alert_ids_json: String,
    pub skip_log_json: String,
    pub fingerprint: String,
    pub payload: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CopilotRecommendationRow {
    pub id: i64,
    pub user_id: String,
    pub alert_id: Option<i64>,
    pub theme_key: String,
    pub decision: String,
    pub reason: Option<String>,
    pub recommendation: Option<String>,
    pub confidence: Option<String>,
    pub rationale: Option<String>,
    pub risks: Option<String>,
    pub sent: i64,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeliveryRow {
    pub id: i64,
    pub alert_id: i64,
    pub user_id: String,
    pub digest_run_id: Option<i64>,
    pub status: String,
    pub reason: Option<String>,
    pub delivered_at: i64,
}
