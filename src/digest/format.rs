use crate::config::{descriptors, MARKET_LINK_BASE};
use crate::digest::composer::Composition;
use crate::themes::{Theme, ThemeMember};
use crate::types::{Alert, MappingConfidence, Strength, Tier};

pub const FOOTER: &str = "<i>Read-only analytics - Not financial advice</i>";

/// Telegram HTML parse mode only needs these three escaped.
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

pub fn descriptor(value: f64, high: f64, moderate: f64) -> &'static str {
    if value >= high {
        "High"
    } else if value >= moderate {
        "Moderate"
    } else {
        "Light"
    }
}

pub fn liquidity_descriptors(alert: &Alert) -> (&'static str, &'static str) {
    (
        descriptor(
            alert.liquidity_or_zero(),
            descriptors::HIGH_LIQUIDITY,
            descriptors::MODERATE_LIQUIDITY,
        ),
        descriptor(
            alert.volume_or_zero(),
            descriptors::HIGH_VOLUME_24H,
            descriptors::MODERATE_VOLUME_24H,
        ),
    )
}

/// Signed relative move, e.g. `+15.0%`.
pub fn compact_move(alert: &Alert) -> String {
    let pct = alert.delta_pct.abs() * 100.0;
    let sign = if alert.signed_move() < 0.0 { '-' } else { '+' };
    format!("{sign}{pct:.1}%")
}

/// `p_yes` for verified Yes/No markets, `p_<LABEL>` for other verified
/// outcome labels and `p_outcome0` when the mapping is a guess.
pub fn probability_label(alert: &Alert) -> String {
    if alert.mapping_confidence != MappingConfidence::Verified {
        return "p_outcome0".to_string();
    }
    let Some(label) = alert.outcome_label.as_deref() else {
        return "p_yes".to_string();
    };
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    match cleaned {
        "" | "YES" => "p_yes".to_string(),
        "OUTCOME_0" | "OUTCOME0" => "p_outcome0".to_string(),
        other => format!("p_{other}"),
    }
}

pub fn compact_probability(alert: &Alert) -> String {
    let label = probability_label(alert);
    match (alert.old_price, alert.new_price) {
        (_, None) => format!("{label} n/a"),
        (Some(prev), Some(new)) => format!("{label} {:.1}->{:.1}", prev * 100.0, new * 100.0),
        (None, Some(new)) => format!("{label} {:.1}", new * 100.0),
    }
}

pub fn market_link(market_id: &str) -> String {
    let safe: String = market_id
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    format!("{MARKET_LINK_BASE}/{safe}")
}

fn related_line(member: &ThemeMember) -> String {
    format!(
        "- {} | {} | {}",
        escape_html(&member.short_title),
        compact_move(&member.alert),
        compact_probability(&member.alert)
    )
}

fn fast_confidence(strength: Strength) -> &'static str {
    if strength == Strength::Medium {
        "MEDIUM"
    } else {
        "LOW"
    }
}

fn theme_block(idx: usize, theme: &Theme, tier: Tier) -> Vec<String> {
    let n = theme.members.len();
    let label = escape_html(&theme.label);
    let heading = match tier {
        Tier::Confirmed => format!("<b>#{idx} THEME - {label} ({n} market{})</b>", plural(n)),
        Tier::Fast => format!("<b>#{idx} FAST - {label} watchlist ({n} market{})</b>", plural(n)),
    };

    let rep = theme.representative();
    let (liq, vol) = liquidity_descriptors(&rep.alert);
    let mut rep_line = format!(
        "Rep: {} | Move {} | {} | Liq {liq} | Vol {vol}",
        escape_html(&rep.short_title),
        compact_move(&rep.alert),
        compact_probability(&rep.alert),
    );
    match tier {
        Tier::Confirmed => rep_line.push_str(&format!(
            " | {} ({})",
            rep.classification.signal_type, rep.classification.confidence
        )),
        Tier::Fast => {
            let tag = if rep.alert.watch_only { "WATCH" } else { "FAST" };
            rep_line.push_str(&format!(" | {tag} ({})", fast_confidence(rep.alert.strength)));
        }
    }

    let mut lines = vec![heading, rep_line];
    lines.extend(theme.related().map(related_line));
    lines.push(market_link(&rep.alert.market_id));
    lines
}

fn body(composition: &Composition) -> Vec<String> {
    let n = composition.themes.len();
    let w = composition.window_minutes;
    let header = match composition.tier {
        Tier::Confirmed => format!("<b>PMD - {n} theme{} ({w}m)</b>", plural(n)),
        Tier::Fast => format!("<b>PMD - FAST: {n} watchlist theme{} ({w}m)</b>", plural(n)),
    };
    let mut lines = vec![header, String::new()];
    for (i, theme) in composition.themes.iter().enumerate() {
        lines.extend(theme_block(i + 1, theme, composition.tier));
        lines.push(String::new());
    }
    lines
}

/// Render a digest as Telegram HTML. `status_line` (e.g. a Copilot cap
/// notice) goes just above the footer. Empty when there are no themes.
pub fn render_digest(composition: &Composition, status_line: Option<&str>) -> String {
    if composition.themes.is_empty() {
        return String::new();
    }
    let mut lines = body(composition);
    if let Some(status) = status_line.filter(|s| !s.trim().is_empty()) {
        lines.push(escape_html(status));
        lines.push(String::new());
    }
    lines.push(FOOTER.to_string());
    lines.join("\n").trim().to_string()
}
