//! Copilot eligibility.
//!
//! `evaluate` is a pure function of its inputs: the same settings, member
//! and history always produce the same decision, and nothing is written.
//! Checks run in a fixed order and the first failure is the reason.
//! `select` applies the gate across one digest's themes.

use std::cmp::Ordering;

use serde::Serialize;

use crate::config::MIN_COPILOT_SNAPSHOT_POINTS;
use crate::copilot::caps::{CapKind, CapUsage};
use crate::settings::plans::upgrade_target;
use crate::settings::EffectiveSettings;
use crate::themes::{Theme, ThemeMember};
use crate::types::{Confidence, MappingConfidence, SignalType, SuggestedAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    UserDisabled,
    PlanDisabled,
    MissingChatId,
    DigestRecentlySent,
    CopilotDedupeActive,
    Muted,
    LabelMappingUnknown,
    NotRepricing,
    ConfidenceNotHigh,
    NotFollow,
    POutOfBand,
    InsufficientSnapshots,
    MissingPriceOrLiquidity,
    CapReached,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::UserDisabled => "USER_DISABLED",
            SkipReason::PlanDisabled => "PLAN_DISABLED",
            SkipReason::MissingChatId => "MISSING_CHAT_ID",
            SkipReason::DigestRecentlySent => "DIGEST_RECENTLY_SENT",
            SkipReason::CopilotDedupeActive => "COPILOT_DEDUPE_ACTIVE",
            SkipReason::Muted => "MUTED",
            SkipReason::LabelMappingUnknown => "LABEL_MAPPING_UNKNOWN",
            SkipReason::NotRepricing => "NOT_REPRICING",
            SkipReason::ConfidenceNotHigh => "CONFIDENCE_NOT_HIGH",
            SkipReason::NotFollow => "NOT_FOLLOW",
            SkipReason::POutOfBand => "P_OUT_OF_BAND",
            SkipReason::InsufficientSnapshots => "INSUFFICIENT_SNAPSHOTS",
            SkipReason::MissingPriceOrLiquidity => "MISSING_PRICE_OR_LIQUIDITY",
            SkipReason::CapReached => "CAP_REACHED",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    Eligible,
    Skip(SkipReason),
}

impl Decision {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Decision::Eligible)
    }

    pub fn reason(&self) -> Option<SkipReason> {
        match self {
            Decision::Eligible => None,
            Decision::Skip(r) => Some(*r),
        }
    }
}

/// Everything the gate needs that is not on the alert itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateHistory {
    pub digest_recently_sent: bool,
    pub theme_recently_sent: bool,
    pub muted: bool,
    /// Distinct snapshot points around the alert bucket.
    pub snapshot_points: usize,
    pub usage: CapUsage,
}

pub fn evaluate(settings: &EffectiveSettings, member: &ThemeMember, history: &GateHistory) -> Decision {
    use SkipReason::*;

    let alert = &member.alert;
    let class = &member.classification;

    let checks: [(bool, SkipReason); 14] = [
        (!settings.user_copilot_enabled, UserDisabled),
        (!settings.plan_copilot_enabled, PlanDisabled),
        (settings.chat_id.is_none(), MissingChatId),
        (history.digest_recently_sent, DigestRecentlySent),
        (history.theme_recently_sent, CopilotDedupeActive),
        (history.muted, Muted),
        (alert.mapping_confidence == MappingConfidence::Unknown, LabelMappingUnknown),
        (class.signal_type != SignalType::Repricing, NotRepricing),
        (class.confidence != Confidence::High, ConfidenceNotHigh),
        (class.action != SuggestedAction::Follow, NotFollow),
        (!alert.p_yes().is_some_and(|p| settings.within_band(p)), POutOfBand),
        (history.snapshot_points < MIN_COPILOT_SNAPSHOT_POINTS, InsufficientSnapshots),
        (
            alert.old_price.is_none() || alert.new_price.is_none() || alert.liquidity.is_none(),
            MissingPriceOrLiquidity,
        ),
        (history.usage.exhausted(settings).is_some(), CapReached),
    ];

    checks
        .iter()
        .find(|(failed, _)| *failed)
        .map_or(Decision::Eligible, |(_, reason)| Decision::Skip(*reason))
}

/// Gate outcome for one theme of a digest.
#[derive(Debug, Clone)]
pub struct ThemeEvaluation {
    pub theme_key: String,
    pub alert_id: i64,
    pub market_id: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Ranked order; `decision` says which themes were picked.
    pub evaluations: Vec<ThemeEvaluation>,
    /// Cap that blocked an otherwise eligible theme, if any.
    pub cap_hit: Option<(CapKind, CapUsage)>,
}

impl Selection {
    pub fn selected(&self) -> impl Iterator<Item = &ThemeEvaluation> {
        self.evaluations.iter().filter(|e| e.decision.is_eligible())
    }
}

/// Copilot candidates ranked by representative liquidity then volume.
fn rank_themes(themes: &[Theme]) -> Vec<&Theme> {
    let mut ranked: Vec<&Theme> = themes.iter().collect();
    ranked.sort_by(|a, b| {
        let (ra, rb) = (&a.representative().alert, &b.representative().alert);
        rb.liquidity_or_zero()
            .partial_cmp(&ra.liquidity_or_zero())
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                rb.volume_or_zero()
                    .partial_cmp(&ra.volume_or_zero())
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| ra.market_id.cmp(&rb.market_id))
    });
    ranked
}

/// Run the gate over a digest's themes.
///
/// Only a selected theme uses up caps, so a skipped top theme never blocks
/// an eligible one below it. Each pick advances the day, hour and digest
/// counters seen by the themes ranked after it, so one digest never
/// selects past any cap. Nothing here bypasses caps, dedupe or mutes.
pub fn select<F>(settings: &EffectiveSettings, themes: &[Theme], usage: CapUsage, history_for: F) -> Selection
where
    F: Fn(&Theme) -> GateHistory,
{
    let mut selection = Selection::default();
    let mut picked = 0i64;

    for theme in rank_themes(themes) {
        let current = usage.after_picks(picked);
        let history = GateHistory {
            usage: current,
            ..history_for(theme)
        };
        let rep = theme.representative();
        let decision = evaluate(settings, rep, &history);

        match decision {
            Decision::Eligible => picked += 1,
            Decision::Skip(SkipReason::CapReached) if selection.cap_hit.is_none() => {
                selection.cap_hit = current.exhausted(settings).map(|k| (k, current));
            }
            Decision::Skip(_) => {}
        }

        selection.evaluations.push(ThemeEvaluation {
            theme_key: theme.key.clone(),
            alert_id: rep.alert.id,
            market_id: rep.alert.market_id.clone(),
            decision,
        });
    }
    selection
}

/// Notice appended to a digest when a cap blocked an eligible theme.
pub fn cap_reached_message(settings: &EffectiveSettings, kind: CapKind, usage: CapUsage) -> String {
    let (used, limit) = usage.figures(kind, settings);
    let plan = settings
        .plan_name
        .as_deref()
        .unwrap_or("default")
        .to_ascii_uppercase();
    let hint = match upgrade_target(settings.plan_name.as_deref()) {
        Some(next) => format!("Upgrade to {} for higher caps.", next.to_ascii_uppercase()),
        None => "Contact support for higher caps.".to_string(),
    };
    format!(
        "CAP_REACHED: {plan} plan limit hit ({used}/{limit} Copilot {}). {hint}",
        kind.period()
    )
}
