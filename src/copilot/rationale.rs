use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::clients::llm::RationaleLlm;
use crate::clients::telegram::InlineButton;
use crate::digest::format::{compact_move, compact_probability, escape_html, liquidity_descriptors, market_link};
use crate::types::{Alert, AlertClassification, PricePoint};

const SYSTEM_PROMPT: &str = "You are a conservative trade assistant. Provide read-only decision support only. \
No financial advice. If information is insufficient or ambiguous, return WAIT. Respond with strict JSON only.";

const USER_PROMPT: &str = "Given the alert context, provide a recommendation.\n\
Return JSON with keys: recommendation (BUY/WAIT/SKIP), confidence (HIGH/MEDIUM/LOW), \
rationale (short sentence), risks (short sentence).";

/// Minutes a mute button silences a market or theme for.
pub const MUTE_BUTTON_MINUTES: i64 = 1_440;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationText {
    pub recommendation: String,
    pub confidence: String,
    pub rationale: String,
    pub risks: String,
}

impl RecommendationText {
    pub fn fallback(rationale: &str, risks: &str) -> Self {
        Self {
            recommendation: "WAIT".to_string(),
            confidence: "LOW".to_string(),
            rationale: rationale.to_string(),
            risks: risks.to_string(),
        }
    }

    /// Upper-case and clamp to the known vocabularies.
    fn normalized(self) -> Self {
        let recommendation = self.recommendation.trim().to_ascii_uppercase();
        let confidence = self.confidence.trim().to_ascii_uppercase();
        Self {
            recommendation: match recommendation.as_str() {
                "BUY" | "WAIT" | "SKIP" => recommendation,
                _ => "WAIT".to_string(),
            },
            confidence: match confidence.as_str() {
                "HIGH" | "MEDIUM" | "LOW" => confidence,
                _ => "LOW".to_string(),
            },
            rationale: self.rationale.trim().to_string(),
            risks: self.risks.trim().to_string(),
        }
    }
}

pub fn parse_response(raw: &str) -> RecommendationText {
    match serde_json::from_str::<RecommendationText>(raw.trim()) {
        Ok(parsed) => parsed.normalized(),
        Err(e) => {
            warn!("[COPILOT] LLM response invalid: {e}");
            RecommendationText::fallback(
                "LLM response invalid; defaulting to WAIT.",
                "Invalid LLM response payload.",
            )
        }
    }
}

fn direction(alert: &Alert) -> f64 {
    if alert.signed_move() < 0.0 {
        -1.0
    } else {
        1.0
    }
}

fn span_minutes(from: &PricePoint, to: &PricePoint) -> i64 {
    (to.bucket - from.bucket).num_minutes()
}

/// Human-readable evidence lines from the price points around the alert.
pub fn build_evidence(alert: &Alert, points: &[PricePoint]) -> Vec<String> {
    if points.is_empty() {
        return Vec::new();
    }
    let dir = direction(alert);
    let sign = if dir < 0.0 { '-' } else { '+' };

    let mut streak = 0usize;
    for pair in points.windows(2).rev() {
        if (pair[1].p_yes - pair[0].p_yes) * dir > 0.0 {
            streak += 1;
        } else {
            break;
        }
    }
    let streak_minutes = if streak == 0 {
        0
    } else {
        span_minutes(&points[points.len() - 1 - streak], &points[points.len() - 1])
    };
    let window = match (points.first(), points.last()) {
        (Some(first), Some(last)) => span_minutes(first, last),
        _ => 0,
    };

    let (liq, vol) = liquidity_descriptors(alert);
    let abs_move = alert.abs_move();
    let reversal = match points {
        [.., prev, last] if abs_move > 0.0 && (last.p_yes - prev.p_yes) * dir < 0.0 => format!(
            "Reversal risk: last snapshot retraced {:.1}%",
            (last.p_yes - prev.p_yes).abs() / abs_move * 100.0
        ),
        _ => format!("No reversal observed in last {window}m"),
    };

    vec![
        format!("Sustained move across {} snapshots ({streak_minutes}m)", streak + 1),
        format!(
            "Abs move: {sign}{abs_move:.3} | pct: {sign}{:.1}% ({window}m)",
            alert.delta_pct.abs() * 100.0
        ),
        format!(
            "Liquidity: {liq} ${:.0} | Vol24h: {vol} ${:.0}",
            alert.liquidity_or_zero(),
            alert.volume_or_zero()
        ),
        reversal,
    ]
}

/// Context handed to the LLM. Never includes anything the decision depends on
/// beyond what the user already sees.
pub fn build_context(user_id: &str, alert: &Alert, class: &AlertClassification, evidence: &[String]) -> Value {
    json!({
        "user_id": user_id,
        "alert_id": alert.id,
        "market_id": alert.market_id,
        "title": alert.title,
        "category": alert.category,
        "move": alert.delta_pct,
        "market_p_yes": alert.new_price,
        "prev_market_p_yes": alert.old_price,
        "liquidity": alert.liquidity,
        "volume_24h": alert.volume_24h,
        "signal_type": class.signal_type,
        "confidence": class.confidence,
        "suggested_action": class.action,
        "no_financial_advice": true,
        "evidence": evidence,
    })
}

/// Ask the LLM for rationale text. Any failure yields the WAIT/LOW fallback.
pub async fn draft(llm: Option<&dyn RationaleLlm>, context: &Value) -> RecommendationText {
    let Some(llm) = llm else {
        return RecommendationText::fallback(
            "LLM unavailable; defaulting to WAIT.",
            "Recommendation unavailable due to missing API key.",
        );
    };
    let user = format!("{USER_PROMPT}\n{context}");
    match llm.complete(SYSTEM_PROMPT, &user).await {
        Ok(raw) => parse_response(&raw),
        Err(e) => {
            warn!("[COPILOT] LLM call failed: {e}");
            RecommendationText::fallback(
                "LLM unavailable; defaulting to WAIT.",
                "Recommendation unavailable due to request failure.",
            )
        }
    }
}

fn bullets(text: &str) -> String {
    let lines: Vec<String> = text
        .split(['\n', ';'])
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| format!("- {}", escape_html(l)))
        .collect();
    if lines.is_empty() {
        "- n/a".to_string()
    } else {
        lines.join("\n")
    }
}

pub fn format_message(alert: &Alert, rec: &RecommendationText, evidence: &[String]) -> String {
    let title: String = alert.title.chars().take(160).collect();
    let (liq, vol) = liquidity_descriptors(alert);
    let evidence = if evidence.is_empty() {
        "- n/a".to_string()
    } else {
        evidence
            .iter()
            .map(|e| format!("- {}", escape_html(e)))
            .collect::<Vec<_>>()
            .join("\n")
    };
    [
        format!("<b>AI Copilot: {} ({})</b>", rec.recommendation, rec.confidence),
        escape_html(&title),
        format!("Move: {} | {}", compact_move(alert), compact_probability(alert)),
        format!("Liquidity: {liq} | Volume: {vol}"),
        String::new(),
        "<b>Evidence</b>".to_string(),
        evidence,
        String::new(),
        "<b>Rationale</b>".to_string(),
        bullets(&rec.rationale),
        String::new(),
        "<b>Risks</b>".to_string(),
        bullets(&rec.risks),
        String::new(),
        market_link(&alert.market_id),
    ]
    .join("\n")
}

/// Mute buttons attached to every Copilot message.
pub fn mute_buttons(alert_id: i64) -> Vec<Vec<InlineButton>> {
    vec![
        vec![InlineButton::new(
            "Mute theme 24h",
            format!("mute:theme_alert:{alert_id}:{MUTE_BUTTON_MINUTES}"),
        )],
        vec![InlineButton::new(
            "Mute market 24h",
            format!("mute:market_alert:{alert_id}:{MUTE_BUTTON_MINUTES}"),
        )],
    ]
}
