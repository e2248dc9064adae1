use crate::settings::resolver::{Plan, SettingsLayer};
use crate::types::FastMode;

pub const DEFAULT_PLAN_NAME: &str = "basic";
pub const RECOMMENDED_PLAN_NAME: &str = "pro";

/// Next plan up, or None at the top.
pub fn upgrade_target(current: Option<&str>) -> Option<&'static str> {
    match current.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        None => Some(RECOMMENDED_PLAN_NAME),
        Some("basic") => Some("pro"),
        Some("pro") => Some("elite"),
        Some("elite") => None,
        Some(_) => Some(RECOMMENDED_PLAN_NAME),
    }
}

/// Plans seeded into an empty database.
pub fn builtin_plans() -> Vec<Plan> {
    ["basic", "pro", "elite"]
        .iter()
        .filter_map(|name| builtin_plan(name))
        .collect()
}

pub fn builtin_plan(name: &str) -> Option<Plan> {
    let settings = match name {
        "basic" => SettingsLayer {
            copilot_enabled: Some(false),
            copilot_always_on: Some(false),
            max_copilot_per_day: Some(0),
            max_copilot_per_hour: Some(0),
            max_copilot_per_digest: Some(0),
            copilot_theme_ttl_minutes: Some(360),
            digest_window_minutes: Some(60),
            max_themes_per_digest: Some(3),
            max_markets_per_theme: Some(3),
            max_alerts_per_digest: Some(3),
            min_liquidity: Some(5_000.0),
            min_volume_24h: Some(5_000.0),
            min_abs_move: Some(0.01),
            p_min: Some(0.15),
            p_max: Some(0.85),
            allowed_strengths: Some("STRONG".to_string()),
            digest_actionable_only: Some(false),
            fast_signals_enabled: Some(false),
            fast_mode: Some(FastMode::WatchOnly),
            fast_window_minutes: Some(15),
            fast_max_themes_per_digest: Some(2),
            fast_max_markets_per_theme: Some(2),
        },
        "pro" => SettingsLayer {
            copilot_enabled: Some(true),
            copilot_always_on: Some(false),
            max_copilot_per_day: Some(30),
            max_copilot_per_hour: Some(3),
            max_copilot_per_digest: Some(1),
            copilot_theme_ttl_minutes: Some(360),
            digest_window_minutes: Some(30),
            max_themes_per_digest: Some(5),
            max_markets_per_theme: Some(3),
            max_alerts_per_digest: Some(7),
            min_liquidity: Some(3_000.0),
            min_volume_24h: Some(3_000.0),
            min_abs_move: Some(0.01),
            p_min: Some(0.15),
            p_max: Some(0.85),
            allowed_strengths: Some("STRONG,MEDIUM".to_string()),
            digest_actionable_only: Some(false),
            fast_signals_enabled: Some(true),
            fast_mode: Some(FastMode::WatchOnly),
            fast_window_minutes: Some(10),
            fast_max_themes_per_digest: Some(2),
            fast_max_markets_per_theme: Some(2),
        },
        "elite" => SettingsLayer {
            copilot_enabled: Some(true),
            copilot_always_on: Some(true),
            max_copilot_per_day: Some(200),
            max_copilot_per_hour: Some(12),
            max_copilot_per_digest: Some(1),
            copilot_theme_ttl_minutes: Some(120),
            digest_window_minutes: Some(15),
            max_themes_per_digest: Some(10),
            max_markets_per_theme: Some(3),
            max_alerts_per_digest: Some(10),
            min_liquidity: Some(1_000.0),
            min_volume_24h: Some(1_000.0),
            min_abs_move: Some(0.01),
            p_min: Some(0.15),
            p_max: Some(0.85),
            allowed_strengths: Some("STRONG,MEDIUM".to_string()),
            digest_actionable_only: Some(false),
            fast_signals_enabled: Some(true),
            fast_mode: Some(FastMode::Full),
            fast_window_minutes: Some(5),
            fast_max_themes_per_digest: Some(2),
            fast_max_markets_per_theme: Some(2),
        },
        _ => return None,
    };
    Some(Plan {
        name: name.to_string(),
        settings,
        is_active: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_path_walks_basic_pro_elite() {
        assert_eq!(upgrade_target(Some("basic")), Some("pro"));
        assert_eq!(upgrade_target(Some("PRO")), Some("elite"));
        assert_eq!(upgrade_target(Some("elite")), None);
        assert_eq!(upgrade_target(None), Some("pro"));
        assert_eq!(upgrade_target(Some("legacy")), Some("pro"));
    }

    #[test]
    fn only_elite_has_always_on_copilot() {
        let plans = builtin_plans();
        assert_eq!(plans.len(), 3);
        for plan in plans {
            let always_on = plan.settings.copilot_always_on.unwrap_or(false);
            assert_eq!(always_on, plan.name == "elite", "{}", plan.name);
        }
    }
}
