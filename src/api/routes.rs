use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::db;
use crate::db::models::{CopilotRecommendationRow, DigestRunRow};
use crate::engine::{CycleReport, Engine};
use crate::error::AppError;
use crate::resilience::{BreakerState, Guard};
use crate::settings::{EffectiveSettings, Plan, SettingsCache, SettingsLayer, UserPreferences};
use crate::types::{from_unix, Alert, Tier};

const ADMIN_KEY_HEADER: &str = "x-admin-key";
const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;
const DEFAULT_MUTE_MINUTES: i64 = 24 * 60;

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub engine: Arc<Engine>,
    pub settings: SettingsCache,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub guards: Vec<Arc<Guard>>,
    pub admin_key: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .route("/alerts/latest", get(get_latest_alerts))
        .route("/alerts/history", get(get_alert_history))
        .route("/users/:id/digest/last", get(get_last_digest))
        .route("/users/:id/copilot/last", get(get_last_copilot))
        .route("/users/:id/settings", get(get_user_settings))
        .route("/cycle/run", post(post_run_cycle))
        .route("/admin/plans", get(get_plans).post(post_plan))
        .route("/admin/users", post(post_user))
        .route("/admin/users/:id/plan", post(post_assign_plan))
        .route("/admin/users/:id/mutes", post(post_mute))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param / body structs
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
pub struct LatestAlertsQuery {
    pub limit: Option<i64>,
    pub tier: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct AlertHistoryQuery {
    pub market_id: Option<String>,
    /// Unix seconds; defaults to 24h ago.
    pub since: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct DigestQuery {
    pub tier: Option<String>,
}

#[derive(Deserialize)]
pub struct PlanRequest {
    pub name: String,
    #[serde(default)]
    pub settings: SettingsLayer,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Deserialize)]
pub struct UserRequest {
    pub user_id: String,
    pub plan_name: Option<String>,
    pub chat_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub preferences: SettingsLayer,
    #[serde(default)]
    pub overrides: SettingsLayer,
}

#[derive(Deserialize)]
pub struct AssignPlanRequest {
    pub plan_name: String,
}

#[derive(Deserialize)]
pub struct MuteRequest {
    pub market_id: Option<String>,
    pub theme_key: Option<String>,
    pub minutes: Option<i64>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct DependencyHealth {
    pub name: &'static str,
    pub breaker: BreakerState,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub last_cycle_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub last_cycle_alerts: u64,
    pub dependencies: Vec<DependencyHealth>,
}

#[derive(Serialize)]
pub struct LatencyResponse {
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct MuteResponse {
    pub id: i64,
    pub expires_at: i64,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn require_admin(headers: &HeaderMap, admin_key: Option<&str>) -> Result<(), AppError> {
    let Some(expected) = admin_key else {
        return Ok(());
    };
    match headers.get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(given) if given == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

fn parse_tier(raw: Option<&str>) -> Result<Option<Tier>, AppError> {
    match raw {
        None => Ok(None),
        Some(s) => Tier::parse(s)
            .map(Some)
            .ok_or_else(|| AppError::BadRequest(format!("unknown tier: {s}"))),
    }
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let dependencies: Vec<DependencyHealth> = state
        .guards
        .iter()
        .map(|g| DependencyHealth {
            name: g.name(),
            breaker: g.state(),
        })
        .collect();
    let degraded = state.health.last_success_at().is_none()
        || dependencies.iter().any(|d| d.breaker == BreakerState::Open);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        last_cycle_at: state.health.last_cycle_at(),
        last_success_at: state.health.last_success_at(),
        cycles_ok: state.health.cycles_ok(),
        cycles_failed: state.health.cycles_failed(),
        last_cycle_alerts: state.health.last_cycle_alerts(),
        dependencies,
    })
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencyResponse> {
    let (p50_ms, p95_ms, p99_ms) = state.latency.percentiles();
    Json(LatencyResponse {
        samples: state.latency.len(),
        p50_ms,
        p95_ms,
        p99_ms,
    })
}

async fn get_latest_alerts(
    State(state): State<ApiState>,
    Query(params): Query<LatestAlertsQuery>,
) -> Result<Json<Vec<Alert>>, AppError> {
    let tier = parse_tier(params.tier.as_deref())?;
    let alerts = db::alerts::latest(&state.pool, tier, clamp_limit(params.limit)).await?;
    Ok(Json(alerts))
}

async fn get_alert_history(
    State(state): State<ApiState>,
    Query(params): Query<AlertHistoryQuery>,
) -> Result<Json<Vec<Alert>>, AppError> {
    let since = params
        .since
        .map(from_unix)
        .unwrap_or_else(|| Utc::now() - Duration::hours(24));
    let alerts = db::alerts::history(
        &state.pool,
        params.market_id.as_deref(),
        since,
        clamp_limit(params.limit),
    )
    .await?;
    Ok(Json(alerts))
}

async fn get_last_digest(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(params): Query<DigestQuery>,
) -> Result<Json<DigestRunRow>, AppError> {
    let tier = parse_tier(params.tier.as_deref())?;
    db::digests::last_digest_run(&state.pool, &user_id, tier)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no digest for user {user_id}")))
}

async fn get_last_copilot(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Result<Json<CopilotRecommendationRow>, AppError> {
    db::digests::last_recommendation(&state.pool, &user_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no copilot evaluation for user {user_id}")))
}

async fn get_user_settings(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> Result<Json<EffectiveSettings>, AppError> {
    state
        .settings
        .get(&state.pool, &user_id)
        .await?
        .map(|s| Json(s.as_ref().clone()))
        .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))
}

async fn post_run_cycle(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<CycleReport>, AppError> {
    require_admin(&headers, state.admin_key.as_deref())?;
    let report = state.engine.run_cycle(Utc::now()).await?;
    Ok(Json(report))
}

async fn get_plans(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Plan>>, AppError> {
    require_admin(&headers, state.admin_key.as_deref())?;
    Ok(Json(db::users::list_plans(&state.pool).await?))
}

async fn post_plan(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<PlanRequest>,
) -> Result<Json<Plan>, AppError> {
    require_admin(&headers, state.admin_key.as_deref())?;
    let name = body.name.trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(AppError::BadRequest("plan name is required".to_string()));
    }
    let plan = Plan {
        name,
        settings: body.settings,
        is_active: body.is_active,
    };
    db::users::upsert_plan(&state.pool, &plan, Utc::now()).await?;
    // Every user on this plan may resolve differently now.
    state.settings.invalidate_all();
    Ok(Json(plan))
}

async fn post_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<UserRequest>,
) -> Result<Json<EffectiveSettings>, AppError> {
    require_admin(&headers, state.admin_key.as_deref())?;
    let user_id = body.user_id.trim().to_string();
    if user_id.is_empty() {
        return Err(AppError::BadRequest("user_id is required".to_string()));
    }
    let user = UserPreferences {
        user_id,
        plan_name: body.plan_name,
        chat_id: body.chat_id.filter(|c| !c.trim().is_empty()),
        is_active: body.is_active,
        preferences: body.preferences,
        overrides: body.overrides,
    };
    db::users::upsert_user(&state.pool, &user, Utc::now()).await?;
    state.settings.invalidate(&user.user_id).await;
    let settings = state.settings.resolve_for(&state.pool, &user).await?;
    Ok(Json(settings.as_ref().clone()))
}

async fn post_assign_plan(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(body): Json<AssignPlanRequest>,
) -> Result<Json<EffectiveSettings>, AppError> {
    require_admin(&headers, state.admin_key.as_deref())?;
    let plan_name = body.plan_name.trim().to_ascii_lowercase();
    if db::users::get_plan(&state.pool, &plan_name).await?.is_none() {
        return Err(AppError::NotFound(format!("plan {plan_name}")));
    }
    if !db::users::assign_plan(&state.pool, &user_id, &plan_name, Utc::now()).await? {
        return Err(AppError::NotFound(format!("user {user_id}")));
    }
    state.settings.invalidate(&user_id).await;
    state
        .settings
        .get(&state.pool, &user_id)
        .await?
        .map(|s| Json(s.as_ref().clone()))
        .ok_or_else(|| AppError::NotFound(format!("user {user_id}")))
}

async fn post_mute(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(body): Json<MuteRequest>,
) -> Result<Json<MuteResponse>, AppError> {
    require_admin(&headers, state.admin_key.as_deref())?;
    let market_id = body.market_id.as_deref().filter(|s| !s.is_empty());
    let theme_key = body.theme_key.as_deref().filter(|s| !s.is_empty());
    if market_id.is_none() && theme_key.is_none() {
        return Err(AppError::BadRequest("market_id or theme_key is required".to_string()));
    }
    if db::users::get_user(&state.pool, &user_id).await?.is_none() {
        return Err(AppError::NotFound(format!("user {user_id}")));
    }
    let now = Utc::now();
    let expires_at = now + Duration::minutes(body.minutes.unwrap_or(DEFAULT_MUTE_MINUTES).max(1));
    let id = db::users::add_mute(&state.pool, &user_id, market_id, theme_key, expires_at, now).await?;
    Ok(Json(MuteResponse {
        id,
        expires_at: expires_at.timestamp(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{InlineButton, MarketFeed, Messenger};
    use crate::copilot::{CopilotCaps, CopilotService};
    use crate::db::test_pool;
    use crate::detector::{ConfirmedParams, Detector, FastParams};
    use crate::error::Result;
    use crate::state::{CooldownLedger, KvStore};
    use crate::types::MarketSnapshot;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use chrono::DateTime;

    struct EmptyFeed;

    #[async_trait]
    impl MarketFeed for EmptyFeed {
        async fn fetch_snapshots(&self, _now: DateTime<Utc>) -> Result<Vec<MarketSnapshot>> {
            Ok(Vec::new())
        }
    }

    struct Silent;

    #[async_trait]
    impl Messenger for Silent {
        async fn send(&self, _chat_id: &str, _html: &str, _buttons: &[Vec<InlineButton>]) -> Result<()> {
            Ok(())
        }
    }

    async fn state(admin_key: Option<&str>) -> ApiState {
        let pool = test_pool().await;
        db::users::seed_builtin_plans(&pool, Utc::now()).await.unwrap();
        let kv = KvStore::new();
        let settings = SettingsCache::new();
        let health = Arc::new(HealthState::new());
        let latency = Arc::new(LatencyStats::new().unwrap());
        let messenger: Arc<dyn Messenger> = Arc::new(Silent);
        let engine = Engine::new(
            pool.clone(),
            Arc::new(EmptyFeed),
            messenger.clone(),
            Detector::new(
                pool.clone(),
                CooldownLedger::new(),
                ConfirmedParams::default(),
                FastParams::default(),
                false,
            ),
            settings.clone(),
            kv.clone(),
            CopilotService::new(pool.clone(), CopilotCaps::new(kv), messenger, None),
            health.clone(),
            latency.clone(),
            false,
            2,
        );
        ApiState {
            pool,
            engine: Arc::new(engine),
            settings,
            health,
            latency,
            guards: vec![Arc::new(Guard::new("feed", std::time::Duration::from_secs(1), 1))],
            admin_key: admin_key.map(str::to_string),
        }
    }

    fn user_request(user_id: &str, plan: &str) -> UserRequest {
        UserRequest {
            user_id: user_id.to_string(),
            plan_name: Some(plan.to_string()),
            chat_id: Some("42".to_string()),
            is_active: true,
            preferences: SettingsLayer::default(),
            overrides: SettingsLayer::default(),
        }
    }

    #[test]
    fn admin_key_is_enforced_only_when_configured() {
        let mut headers = HeaderMap::new();
        assert!(require_admin(&headers, None).is_ok());
        assert!(matches!(require_admin(&headers, Some("k")), Err(AppError::Unauthorized)));
        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("wrong"));
        assert!(require_admin(&headers, Some("k")).is_err());
        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("k"));
        assert!(require_admin(&headers, Some("k")).is_ok());
    }

    #[test]
    fn tier_and_limit_params() {
        assert_eq!(parse_tier(Some("fast")).unwrap(), Some(Tier::Fast));
        assert_eq!(parse_tier(None).unwrap(), None);
        assert!(matches!(parse_tier(Some("slow")), Err(AppError::BadRequest(_))));
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIMIT);
    }

    #[tokio::test]
    async fn plan_change_is_visible_immediately() {
        let state = state(None).await;
        let headers = HeaderMap::new();

        let Json(created) = post_user(State(state.clone()), headers.clone(), Json(user_request("alice", "basic")))
            .await
            .unwrap();
        assert!(!created.plan_copilot_enabled);

        let Json(upgraded) = post_assign_plan(
            State(state.clone()),
            headers,
            Path("alice".to_string()),
            Json(AssignPlanRequest {
                plan_name: "Elite".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(upgraded.plan_name.as_deref(), Some("elite"));
        assert!(upgraded.copilot_always_on);

        let Json(read) = get_user_settings(State(state), Path("alice".to_string())).await.unwrap();
        assert_eq!(read.digest_window_minutes, 15);
    }

    #[tokio::test]
    async fn unknown_plan_and_user_are_not_found() {
        let state = state(None).await;
        let res = post_assign_plan(
            State(state.clone()),
            HeaderMap::new(),
            Path("ghost".to_string()),
            Json(AssignPlanRequest {
                plan_name: "pro".to_string(),
            }),
        )
        .await;
        assert!(matches!(res, Err(AppError::NotFound(_))));

        let res = post_mute(
            State(state.clone()),
            HeaderMap::new(),
            Path("ghost".to_string()),
            Json(MuteRequest {
                market_id: None,
                theme_key: None,
                minutes: None,
            }),
        )
        .await;
        assert!(matches!(res, Err(AppError::BadRequest(_))));

        let res = get_last_digest(State(state), Path("ghost".to_string()), Query(DigestQuery::default())).await;
        assert!(matches!(res, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn cycle_run_requires_admin_key_and_updates_health() {
        let state = state(Some("secret")).await;
        let res = post_run_cycle(State(state.clone()), HeaderMap::new()).await;
        assert!(matches!(res, Err(AppError::Unauthorized)));

        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_KEY_HEADER, HeaderValue::from_static("secret"));
        let Json(report) = post_run_cycle(State(state.clone()), headers).await.unwrap();
        assert_eq!(report.users, 0);

        let Json(health) = get_health(State(state.clone())).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.cycles_ok, 1);
        assert_eq!(health.dependencies[0].name, "feed");

        let Json(latency) = get_stats_latency(State(state)).await;
        assert_eq!(latency.samples, 1);
    }
}
