//! Layered settings resolution.
//!
//! Every tunable is an `Option` on each layer. Resolution walks
//! operator overrides → user preferences → plan → code default and takes the
//! first value that is set, field by field. The function is pure: the same
//! plan and preferences always resolve to the same settings.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::defaults;
use crate::types::{FastMode, Strength};

/// One layer of optional settings. Used for plans, user preferences and
/// operator overrides alike.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsLayer {
    pub copilot_enabled: Option<bool>,
    pub copilot_always_on: Option<bool>,
    pub max_copilot_per_day: Option<i64>,
    pub max_copilot_per_hour: Option<i64>,
    pub max_copilot_per_digest: Option<i64>,
    pub copilot_theme_ttl_minutes: Option<i64>,
    pub digest_window_minutes: Option<i64>,
    pub max_themes_per_digest: Option<i64>,
    pub max_markets_per_theme: Option<i64>,
    pub max_alerts_per_digest: Option<i64>,
    pub min_liquidity: Option<f64>,
    pub min_volume_24h: Option<f64>,
    pub min_abs_move: Option<f64>,
    pub p_min: Option<f64>,
    pub p_max: Option<f64>,
    /// Comma separated, e.g. "STRONG,MEDIUM".
    pub allowed_strengths: Option<String>,
    pub digest_actionable_only: Option<bool>,
    pub fast_signals_enabled: Option<bool>,
    pub fast_mode: Option<FastMode>,
    pub fast_window_minutes: Option<i64>,
    pub fast_max_themes_per_digest: Option<i64>,
    pub fast_max_markets_per_theme: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub settings: SettingsLayer,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: String,
    pub plan_name: Option<String>,
    /// Telegram destination.
    pub chat_id: Option<String>,
    pub is_active: bool,
    pub preferences: SettingsLayer,
    /// Operator overrides, above the user's own preferences.
    pub overrides: SettingsLayer,
}

impl UserPreferences {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            plan_name: None,
            chat_id: None,
            is_active: true,
            preferences: SettingsLayer::default(),
            overrides: SettingsLayer::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsAnomaly {
    /// User has no plan, or it no longer exists / is inactive.
    NoPlan,
    /// p_min >= p_max (or outside 0..1) after merging; band reset to defaults.
    InvalidBand,
    /// A cap or window resolved negative and was clamped.
    NegativeValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveSettings {
    pub user_id: String,
    pub plan_name: Option<String>,
    pub no_plan: bool,
    pub anomalies: Vec<SettingsAnomaly>,
    pub chat_id: Option<String>,

    pub user_copilot_enabled: bool,
    pub plan_copilot_enabled: bool,
    pub copilot_always_on: bool,
    pub max_copilot_per_day: i64,
    pub max_copilot_per_hour: i64,
    pub max_copilot_per_digest: i64,
    pub copilot_theme_ttl_minutes: i64,

    pub digest_window_minutes: i64,
    pub max_themes_per_digest: usize,
    pub max_markets_per_theme: usize,
    pub max_alerts_per_digest: usize,
    pub min_liquidity: f64,
    pub min_volume_24h: f64,
    pub min_abs_move: f64,
    pub p_min: f64,
    pub p_max: f64,
    pub allowed_strengths: BTreeSet<Strength>,
    pub digest_actionable_only: bool,

    pub fast_signals_enabled: bool,
    pub fast_mode: FastMode,
    pub fast_window_minutes: i64,
    pub fast_max_themes_per_digest: usize,
    pub fast_max_markets_per_theme: usize,
}

impl EffectiveSettings {
    pub fn copilot_enabled(&self) -> bool {
        self.user_copilot_enabled && self.plan_copilot_enabled
    }

    pub fn within_band(&self, p: f64) -> bool {
        p >= self.p_min && p <= self.p_max
    }
}

/// Resolve one user's settings. `plan` is the user's assigned plan if it
/// exists and is active.
pub fn resolve(user: &UserPreferences, plan: Option<&Plan>) -> EffectiveSettings {
    let empty = SettingsLayer::default();
    let plan_layer = plan.filter(|p| p.is_active).map(|p| &p.settings);
    let no_plan = plan_layer.is_none();
    let plan_layer = plan_layer.unwrap_or(&empty);
    let layers = [&user.overrides, &user.preferences, plan_layer];
    let user_layers = [&user.overrides, &user.preferences];

    let mut anomalies = Vec::new();
    if no_plan {
        anomalies.push(SettingsAnomaly::NoPlan);
    }

    macro_rules! pick {
        ($field:ident, $default:expr) => {
            layers
                .iter()
                .find_map(|l| l.$field.clone())
                .unwrap_or($default)
        };
    }

    let mut clamp = |v: i64, min: i64| -> i64 {
        if v < min {
            if v < 0 {
                anomalies.push(SettingsAnomaly::NegativeValue);
            }
            min
        } else {
            v
        }
    };

    let max_copilot_per_day = clamp(pick!(max_copilot_per_day, defaults::MAX_COPILOT_PER_DAY), 0);
    let max_copilot_per_hour = clamp(pick!(max_copilot_per_hour, defaults::MAX_COPILOT_PER_HOUR), 0);
    let max_copilot_per_digest = clamp(pick!(max_copilot_per_digest, defaults::MAX_COPILOT_PER_DIGEST), 0);
    let copilot_theme_ttl_minutes = clamp(pick!(copilot_theme_ttl_minutes, defaults::COPILOT_THEME_TTL_MINUTES), 1);
    let digest_window_minutes = clamp(pick!(digest_window_minutes, defaults::DIGEST_WINDOW_MINUTES), 1);
    let max_themes_per_digest = clamp(pick!(max_themes_per_digest, defaults::MAX_THEMES_PER_DIGEST), 0);
    let max_markets_per_theme = clamp(pick!(max_markets_per_theme, defaults::MAX_MARKETS_PER_THEME), 1);
    let max_alerts_per_digest = clamp(pick!(max_alerts_per_digest, defaults::MAX_ACTIONABLE_PER_DIGEST), 0);
    let fast_window_minutes = clamp(pick!(fast_window_minutes, defaults::FAST_WINDOW_MINUTES), 1);
    let fast_max_themes_per_digest = clamp(pick!(fast_max_themes_per_digest, defaults::FAST_MAX_THEMES_PER_DIGEST), 0);
    let fast_max_markets_per_theme = clamp(pick!(fast_max_markets_per_theme, defaults::FAST_MAX_MARKETS_PER_THEME), 1);

    let mut p_min = pick!(p_min, defaults::PYES_ACTIONABLE_MIN);
    let mut p_max = pick!(p_max, defaults::PYES_ACTIONABLE_MAX);
    if !(0.0..=1.0).contains(&p_min) || !(0.0..=1.0).contains(&p_max) || p_min >= p_max {
        anomalies.push(SettingsAnomaly::InvalidBand);
        p_min = defaults::PYES_ACTIONABLE_MIN;
        p_max = defaults::PYES_ACTIONABLE_MAX;
    }

    let user_copilot_enabled = user_layers
        .iter()
        .find_map(|l| l.copilot_enabled)
        .unwrap_or(true);
    let plan_copilot_enabled = plan_layer.copilot_enabled.unwrap_or(defaults::COPILOT_ENABLED);

    EffectiveSettings {
        user_id: user.user_id.clone(),
        plan_name: if no_plan { None } else { user.plan_name.clone() },
        no_plan,
        anomalies,
        chat_id: user.chat_id.clone().filter(|c| !c.trim().is_empty()),
        user_copilot_enabled,
        plan_copilot_enabled,
        copilot_always_on: pick!(copilot_always_on, false),
        max_copilot_per_day,
        max_copilot_per_hour,
        max_copilot_per_digest,
        copilot_theme_ttl_minutes,
        digest_window_minutes,
        max_themes_per_digest: max_themes_per_digest as usize,
        max_markets_per_theme: max_markets_per_theme as usize,
        max_alerts_per_digest: max_alerts_per_digest as usize,
        min_liquidity: pick!(min_liquidity, defaults::MEDIUM_MIN_LIQUIDITY).max(0.0),
        min_volume_24h: pick!(min_volume_24h, defaults::MEDIUM_MIN_VOLUME_24H).max(0.0),
        min_abs_move: pick!(min_abs_move, defaults::MEDIUM_ABS_MOVE_THRESHOLD).max(0.0),
        p_min,
        p_max,
        allowed_strengths: parse_strengths(&pick!(allowed_strengths, defaults::ALLOWED_STRENGTHS.to_string())),
        digest_actionable_only: pick!(digest_actionable_only, defaults::DIGEST_ACTIONABLE_ONLY),
        fast_signals_enabled: pick!(fast_signals_enabled, false),
        fast_mode: pick!(fast_mode, FastMode::WatchOnly),
        fast_window_minutes,
        fast_max_themes_per_digest: fast_max_themes_per_digest as usize,
        fast_max_markets_per_theme: fast_max_markets_per_theme as usize,
    }
}

/// Parse "STRONG, medium" into a strength set. Unknown tokens are dropped; an
/// empty result falls back to the default set.
pub fn parse_strengths(raw: &str) -> BTreeSet<Strength> {
    let parsed: BTreeSet<Strength> = raw.split(',').filter_map(Strength::parse).collect();
    if parsed.is_empty() {
        defaults::ALLOWED_STRENGTHS
            .split(',')
            .filter_map(Strength::parse)
            .collect()
    } else {
        parsed
    }
}
