//! Per-user digest composition. Pure: the caller loads the window's alerts
//! and their classifications, this decides what goes in.

use std::collections::HashSet;

use serde::Serialize;

use crate::settings::EffectiveSettings;
use crate::themes::{group_alerts, rank_alerts, Theme};
use crate::types::{fnv1a_64, Alert, AlertClassification, Strength, Tier};

/// Per-user, per-tier result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DigestOutcome {
    NoAlerts,
    NoActionableThemes,
    DigestRecentlySent,
    DuplicateDigest,
    MissingChatId,
    SendFailed,
    Sent,
}

impl DigestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestOutcome::NoAlerts => "NO_ALERTS",
            DigestOutcome::NoActionableThemes => "NO_ACTIONABLE_THEMES",
            DigestOutcome::DigestRecentlySent => "DIGEST_RECENTLY_SENT",
            DigestOutcome::DuplicateDigest => "DUPLICATE_DIGEST",
            DigestOutcome::MissingChatId => "MISSING_CHAT_ID",
            DigestOutcome::SendFailed => "SEND_FAILED",
            DigestOutcome::Sent => "SENT",
        }
    }
}

impl std::fmt::Display for DigestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First user filter an alert failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    BelowMinLiquidity,
    BelowMinVolume,
    BelowMinMove,
    StrengthNotAllowed,
    NotActionable,
    OutOfBand,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::BelowMinLiquidity => "below_min_liquidity",
            FilterReason::BelowMinVolume => "below_min_volume",
            FilterReason::BelowMinMove => "below_min_move",
            FilterReason::StrengthNotAllowed => "strength_not_allowed",
            FilterReason::NotActionable => "not_actionable",
            FilterReason::OutOfBand => "p_out_of_band",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Composition {
    pub tier: Tier,
    pub window_minutes: i64,
    /// Alerts in the window before any filtering (deduped by market).
    pub candidates: usize,
    /// Passed every filter; sent if they end up in a theme, skipped otherwise.
    pub included: Vec<Alert>,
    pub filtered: Vec<(Alert, FilterReason)>,
    pub themes: Vec<Theme>,
    /// Included alerts that are actionable (REPRICING/HIGH/FOLLOW inside the band).
    pub actionable_ids: Vec<i64>,
}

impl Composition {
    /// `None` when there is something to send.
    pub fn outcome(&self) -> Option<DigestOutcome> {
        if self.candidates == 0 {
            Some(DigestOutcome::NoAlerts)
        } else if self.themes.is_empty() {
            Some(DigestOutcome::NoActionableThemes)
        } else {
            None
        }
    }

    /// Alerts that appear in the message.
    pub fn alert_ids(&self) -> Vec<i64> {
        self.themes.iter().flat_map(|t| t.alert_ids()).collect()
    }

    pub fn theme_keys(&self) -> Vec<String> {
        self.themes.iter().map(|t| t.key.clone()).collect()
    }

    pub fn skip_log(&self) -> Vec<String> {
        self.filtered
            .iter()
            .map(|(a, r)| format!("{}:{}", a.id, r.as_str()))
            .collect()
    }

    /// Stable identity of the digest content: tier, window and the sorted
    /// (theme key, representative market, bucket) lines.
    pub fn fingerprint(&self) -> String {
        let mut items: Vec<String> = self
            .themes
            .iter()
            .map(|t| {
                let rep = &t.representative().alert;
                format!("{}\x1f{}\x1f{}", t.key, rep.market_id, rep.bucket.timestamp())
            })
            .collect();
        items.sort();
        let canonical = format!("{}\x1e{}\x1e{}", self.tier, self.window_minutes, items.join("\x1e"));
        format!("{:016x}", fnv1a_64(canonical.as_bytes()))
    }
}

/// Keep the latest alert per market.
pub fn dedupe_by_market(alerts: &[Alert]) -> Vec<Alert> {
    let mut ordered = alerts.to_vec();
    ordered.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at).then_with(|| b.id.cmp(&a.id)));
    let mut seen = HashSet::new();
    ordered.retain(|a| seen.insert(a.market_id.clone()));
    ordered
}

pub fn is_actionable(alert: &Alert, classification: &AlertClassification, settings: &EffectiveSettings) -> bool {
    classification.is_actionable() && alert.p_yes().is_some_and(|p| settings.within_band(p))
}

/// Compose the CONFIRMED digest for one user.
pub fn compose_confirmed<F>(settings: &EffectiveSettings, alerts: &[Alert], classify: F) -> Composition
where
    F: Fn(&Alert) -> AlertClassification,
{
    let window = dedupe_by_market(alerts);
    let candidates = window.len();

    let mut included = Vec::new();
    let mut filtered = Vec::new();
    for alert in window {
        let classification = classify(&alert);
        match confirmed_filter(&alert, &classification, settings) {
            Some(reason) => filtered.push((alert, reason)),
            None => included.push(alert),
        }
    }

    // STRONG first, then MEDIUM, each in rank order; cap the total.
    rank_alerts(&mut included);
    included.sort_by_key(|a| std::cmp::Reverse(a.strength == Strength::Strong));
    let selected: Vec<Alert> = included
        .iter()
        .take(settings.max_alerts_per_digest)
        .cloned()
        .collect();

    let themes = group_alerts(
        &selected,
        &classify,
        settings.max_themes_per_digest,
        settings.max_markets_per_theme,
    );
    let actionable_ids = included
        .iter()
        .filter(|a| is_actionable(a, &classify(a), settings))
        .map(|a| a.id)
        .collect();

    Composition {
        tier: Tier::Confirmed,
        window_minutes: settings.digest_window_minutes,
        candidates,
        included,
        filtered,
        themes,
        actionable_ids,
    }
}

fn confirmed_filter(
    alert: &Alert,
    classification: &AlertClassification,
    settings: &EffectiveSettings,
) -> Option<FilterReason> {
    if alert.liquidity_or_zero() < settings.min_liquidity {
        return Some(FilterReason::BelowMinLiquidity);
    }
    if alert.volume_or_zero() < settings.min_volume_24h {
        return Some(FilterReason::BelowMinVolume);
    }
    if alert.abs_move() < settings.min_abs_move {
        return Some(FilterReason::BelowMinMove);
    }
    if !settings.allowed_strengths.contains(&alert.strength) {
        return Some(FilterReason::StrengthNotAllowed);
    }
    if settings.digest_actionable_only {
        if !classification.is_actionable() {
            return Some(FilterReason::NotActionable);
        }
        if !alert.p_yes().is_some_and(|p| settings.within_band(p)) {
            return Some(FilterReason::OutOfBand);
        }
    }
    None
}

/// Compose the FAST watchlist digest. Detection already applied the FAST
/// thresholds; only the user's FAST caps apply here.
pub fn compose_fast(settings: &EffectiveSettings, alerts: &[Alert]) -> Composition {
    let included = dedupe_by_market(alerts);
    let candidates = included.len();
    let themes = group_alerts(
        &included,
        |_| AlertClassification::NOISE,
        settings.fast_max_themes_per_digest,
        settings.fast_max_markets_per_theme,
    );
    Composition {
        tier: Tier::Fast,
        window_minutes: settings.fast_window_minutes,
        candidates,
        included,
        filtered: Vec::new(),
        themes,
        actionable_ids: Vec::new(),
    }
}
