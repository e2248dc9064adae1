use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::config::THEME_MERGE_SIMILARITY;
use crate::themes::key::{extract_theme, jaccard};
use crate::types::{Alert, AlertClassification, Confidence, Strength};

#[derive(Debug, Clone)]
pub struct ThemeMember {
    pub alert: Alert,
    pub classification: AlertClassification,
    pub short_title: String,
}

/// A cluster of alerts on the same underlying event.
#[derive(Debug, Clone)]
pub struct Theme {
    pub key: String,
    pub label: String,
    /// Ranked by |delta| desc, then newest trigger, then market id.
    pub members: Vec<ThemeMember>,
    /// Index into `members`.
    representative: usize,
    tokens: BTreeSet<String>,
}

impl Theme {
    pub fn representative(&self) -> &ThemeMember {
        &self.members[self.representative]
    }

    /// Members other than the representative, in rank order.
    pub fn related(&self) -> impl Iterator<Item = &ThemeMember> {
        let rep = self.representative;
        self.members
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != rep)
            .map(|(_, m)| m)
    }

    pub fn top(&self) -> &ThemeMember {
        &self.members[0]
    }

    pub fn alert_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.members.iter().map(|m| m.alert.id)
    }
}

/// Deterministic alert order: |delta| desc, newest trigger first, market id asc.
pub fn compare_alerts(a: &Alert, b: &Alert) -> Ordering {
    b.delta_pct
        .abs()
        .partial_cmp(&a.delta_pct.abs())
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.triggered_at.cmp(&a.triggered_at))
        .then_with(|| a.market_id.cmp(&b.market_id))
}

pub fn rank_alerts(alerts: &mut [Alert]) {
    alerts.sort_by(compare_alerts);
}

/// Group alerts into at most `max_themes` themes of at most
/// `max_markets_per_theme` members each. Overflow members and themes are
/// dropped, never merged into a neighbour.
pub fn group_alerts<F>(
    alerts: &[Alert],
    classify: F,
    max_themes: usize,
    max_markets_per_theme: usize,
) -> Vec<Theme>
where
    F: Fn(&Alert) -> AlertClassification,
{
    let mut ordered = alerts.to_vec();
    rank_alerts(&mut ordered);

    let mut themes: Vec<Theme> = Vec::new();
    for alert in ordered {
        let extract = extract_theme(&alert.title, Some(&alert.category));
        let member = ThemeMember {
            classification: classify(&alert),
            short_title: extract.short_title.clone(),
            alert,
        };

        let matched = themes
            .iter()
            .position(|t| t.key == extract.key)
            .or_else(|| {
                themes
                    .iter()
                    .position(|t| jaccard(&t.tokens, &extract.tokens) >= THEME_MERGE_SIMILARITY)
            });

        match matched {
            Some(i) => {
                let theme = &mut themes[i];
                theme.members.push(member);
                theme.tokens.extend(extract.tokens);
            }
            None => themes.push(Theme {
                key: extract.key,
                label: extract.label,
                members: vec![member],
                representative: 0,
                tokens: extract.tokens,
            }),
        }
    }

    let keep = max_markets_per_theme.max(1);
    for theme in &mut themes {
        theme.members.sort_by(|a, b| compare_alerts(&a.alert, &b.alert));
        theme.members.truncate(keep);
        theme.representative = pick_representative(&theme.members);
    }

    themes.sort_by(|a, b| compare_alerts(&a.top().alert, &b.top().alert));
    themes.truncate(max_themes);
    themes
}

fn confidence_weight(c: Confidence) -> u8 {
    match c {
        Confidence::High => 2,
        Confidence::Medium => 1,
        Confidence::Low => 0,
    }
}

/// Highest by (STRONG, classification confidence, |move|, liquidity, volume, market id).
fn pick_representative(members: &[ThemeMember]) -> usize {
    let score = |m: &ThemeMember| {
        (
            u8::from(m.alert.strength == Strength::Strong),
            confidence_weight(m.classification.confidence),
        )
    };
    members
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            score(a)
                .cmp(&score(b))
                .then_with(|| a.alert.abs_move().partial_cmp(&b.alert.abs_move()).unwrap_or(Ordering::Equal))
                .then_with(|| {
                    a.alert
                        .liquidity_or_zero()
                        .partial_cmp(&b.alert.liquidity_or_zero())
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| {
                    a.alert
                        .volume_or_zero()
                        .partial_cmp(&b.alert.volume_or_zero())
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.alert.market_id.cmp(&b.alert.market_id))
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}
