//! Pure detection math for the two alert tiers. Nothing here touches storage;
//! the caller supplies the baseline point and recent history.

use chrono::{DateTime, Utc};

use crate::config::defaults;
use crate::types::{Alert, Confidence, FastMode, MarketSnapshot, PricePoint, Strength, Tier};

#[derive(Debug, Clone)]
pub struct ConfirmedParams {
    pub window_minutes: i64,
    /// Minimum relative move (fraction of the baseline price).
    pub move_threshold: f64,
    pub min_abs_move: f64,
    pub min_price_threshold: f64,
    pub floor_price: f64,
    pub min_liquidity: f64,
    pub min_volume_24h: f64,
    pub strong_abs_move: f64,
    pub strong_min_liquidity: f64,
    pub strong_min_volume_24h: f64,
    pub cooldown_minutes: i64,
}

impl Default for ConfirmedParams {
    fn default() -> Self {
        Self {
            window_minutes: defaults::WINDOW_MINUTES,
            move_threshold: defaults::MOVE_THRESHOLD,
            min_abs_move: defaults::MEDIUM_ABS_MOVE_THRESHOLD,
            min_price_threshold: defaults::MIN_PRICE_THRESHOLD,
            floor_price: defaults::FLOOR_PRICE,
            min_liquidity: defaults::MEDIUM_MIN_LIQUIDITY,
            min_volume_24h: defaults::MEDIUM_MIN_VOLUME_24H,
            strong_abs_move: defaults::STRONG_ABS_MOVE_THRESHOLD,
            strong_min_liquidity: defaults::STRONG_MIN_LIQUIDITY,
            strong_min_volume_24h: defaults::STRONG_MIN_VOLUME_24H,
            cooldown_minutes: defaults::ALERT_COOLDOWN_MINUTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FastParams {
    pub window_minutes: i64,
    pub min_abs_move: f64,
    pub min_pct_move: f64,
    pub min_liquidity: f64,
    pub min_volume_24h: f64,
    /// Actionable probability band the current price must sit in.
    pub p_yes_min: f64,
    pub p_yes_max: f64,
    pub min_price_threshold: f64,
    pub floor_price: f64,
    pub cooldown_minutes: i64,
    pub mode: FastMode,
}

impl Default for FastParams {
    fn default() -> Self {
        Self {
            window_minutes: defaults::FAST_WINDOW_MINUTES,
            min_abs_move: defaults::FAST_MIN_ABS_MOVE,
            min_pct_move: defaults::FAST_MIN_PCT_MOVE,
            min_liquidity: defaults::FAST_MIN_LIQUIDITY,
            min_volume_24h: defaults::FAST_MIN_VOLUME_24H,
            p_yes_min: defaults::FAST_PYES_MIN,
            p_yes_max: defaults::FAST_PYES_MAX,
            min_price_threshold: defaults::MIN_PRICE_THRESHOLD,
            floor_price: defaults::FLOOR_PRICE,
            cooldown_minutes: defaults::FAST_COOLDOWN_MINUTES,
            mode: FastMode::WatchOnly,
        }
    }
}

/// Price change between the window baseline and the latest snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceMove {
    pub old_price: f64,
    pub new_price: f64,
    pub abs_move: f64,
    /// abs_move relative to max(old_price, floor_price).
    pub delta_pct: f64,
}

/// Returns None for moves that can never be signals: non-positive prices,
/// no change, or both ends below the minimum price.
pub fn price_move(old_price: f64, new_price: f64, min_price_threshold: f64, floor_price: f64) -> Option<PriceMove> {
    if old_price <= 0.0 || new_price <= 0.0 {
        return None;
    }
    if old_price == new_price {
        return None;
    }
    if old_price < min_price_threshold && new_price < min_price_threshold {
        return None;
    }
    let abs_move = (new_price - old_price).abs();
    let delta_pct = abs_move / old_price.max(floor_price);
    Some(PriceMove {
        old_price,
        new_price,
        abs_move,
        delta_pct,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub tier: Tier,
    pub movement: PriceMove,
    pub strength: Strength,
    pub watch_only: bool,
}

pub fn evaluate_confirmed(snap: &MarketSnapshot, baseline: &PricePoint, p: &ConfirmedParams) -> Option<Candidate> {
    if snap.liquidity < p.min_liquidity || snap.volume_24h < p.min_volume_24h {
        return None;
    }
    let movement = price_move(baseline.p_yes, snap.p_yes, p.min_price_threshold, p.floor_price)?;
    if movement.abs_move < p.min_abs_move || movement.delta_pct < p.move_threshold {
        return None;
    }
    let strong = movement.abs_move >= p.strong_abs_move
        && snap.liquidity >= p.strong_min_liquidity
        && snap.volume_24h >= p.strong_min_volume_24h;
    Some(Candidate {
        tier: Tier::Confirmed,
        movement,
        strength: if strong { Strength::Strong } else { Strength::Medium },
        watch_only: false,
    })
}

/// FAST evaluation. `recent` holds the most recent points inside the FAST
/// window (any order) and feeds the confidence label.
pub fn evaluate_fast(
    snap: &MarketSnapshot,
    baseline: &PricePoint,
    recent: &[PricePoint],
    p: &FastParams,
) -> Option<Candidate> {
    if snap.liquidity < p.min_liquidity || snap.volume_24h < p.min_volume_24h {
        return None;
    }
    if !(p.p_yes_min..=p.p_yes_max).contains(&snap.p_yes) {
        return None;
    }
    let movement = price_move(baseline.p_yes, snap.p_yes, p.min_price_threshold, p.floor_price)?;
    if movement.abs_move < p.min_abs_move || movement.delta_pct < p.min_pct_move {
        return None;
    }
    let strength = match fast_confidence(recent, p.min_abs_move) {
        Confidence::Medium | Confidence::High => Strength::Medium,
        Confidence::Low => Strength::Low,
    };
    Some(Candidate {
        tier: Tier::Fast,
        movement,
        strength,
        watch_only: p.mode != FastMode::Full,
    })
}

/// MEDIUM when the last three points step consistently in one direction and
/// every step is at least half the minimum move; LOW otherwise.
pub fn fast_confidence(points: &[PricePoint], min_abs_move: f64) -> Confidence {
    let mut ordered: Vec<PricePoint> = points.to_vec();
    ordered.sort_by_key(|p| p.bucket);
    if ordered.len() < 3 {
        return Confidence::Low;
    }
    let last3 = &ordered[ordered.len() - 3..];
    let direction = if last3[2].p_yes - last3[0].p_yes >= 0.0 { 1.0 } else { -1.0 };
    let threshold = min_abs_move * 0.5;
    let consistent = last3.windows(2).all(|w| {
        let delta = w[1].p_yes - w[0].p_yes;
        delta * direction > 0.0 && delta.abs() >= threshold
    });
    if consistent {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

pub fn build_alert(
    snap: &MarketSnapshot,
    candidate: &Candidate,
    window_minutes: i64,
    triggered_at: DateTime<Utc>,
) -> Alert {
    let pct = candidate.movement.delta_pct * 100.0;
    let message = match candidate.tier {
        Tier::Confirmed => format!("Dislocation {pct:.1}% over {window_minutes}m"),
        Tier::Fast => format!(
            "FAST {} watchlist move {pct:.1}% over {window_minutes}m",
            fast_label(candidate.strength)
        ),
    };
    Alert {
        id: 0,
        tier: candidate.tier,
        market_id: snap.market_id.clone(),
        title: snap.title.clone(),
        category: snap.category.clone(),
        old_price: Some(candidate.movement.old_price),
        new_price: Some(candidate.movement.new_price),
        delta_pct: candidate.movement.delta_pct,
        liquidity: Some(snap.liquidity),
        volume_24h: Some(snap.volume_24h),
        strength: candidate.strength,
        watch_only: candidate.watch_only,
        outcome_label: snap.outcome_label.clone(),
        mapping_confidence: snap.mapping_confidence,
        bucket: snap.bucket,
        triggered_at,
        message,
    }
}

fn fast_label(strength: Strength) -> &'static str {
    match strength {
        Strength::Low => "LOW",
        _ => "MEDIUM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{from_unix, MappingConfidence};

    const T0: i64 = 1_767_600_000;

    fn snap(p_yes: f64, liquidity: f64, volume_24h: f64) -> MarketSnapshot {
        MarketSnapshot {
            market_id: "m1".to_string(),
            title: "Will BTC be above 100,000 on January 5?".to_string(),
            category: "crypto".to_string(),
            p_yes,
            liquidity,
            volume_24h,
            outcome_label: Some("Yes".to_string()),
            mapping_confidence: MappingConfidence::Verified,
            source_ts: from_unix(T0 + 3_600),
            bucket: from_unix(T0 + 3_600),
        }
    }

    fn point(offset_secs: i64, p_yes: f64) -> PricePoint {
        PricePoint { bucket: from_unix(T0 + offset_secs), p_yes }
    }

    #[test]
    fn fifteen_percent_move_fires_confirmed() {
        let params = ConfirmedParams {
            move_threshold: 0.05,
            min_liquidity: 1_000.0,
            min_volume_24h: 1_000.0,
            ..ConfirmedParams::default()
        };
        let c = evaluate_confirmed(&snap(0.46, 5_000.0, 6_000.0), &point(0, 0.40), &params).unwrap();
        assert_eq!(c.tier, Tier::Confirmed);
        assert!((c.movement.delta_pct * 100.0 - 15.0).abs() < 1e-6);
        assert_eq!(c.strength, Strength::Medium);
    }

    #[test]
    fn strong_requires_size_and_depth() {
        let c = evaluate_confirmed(&snap(0.50, 20_000.0, 20_000.0), &point(0, 0.40), &ConfirmedParams::default()).unwrap();
        assert_eq!(c.strength, Strength::Strong);
    }

    #[test]
    fn floors_block_thin_markets() {
        let params = ConfirmedParams::default();
        assert!(evaluate_confirmed(&snap(0.46, 500.0, 6_000.0), &point(0, 0.40), &params).is_none());
        assert!(evaluate_confirmed(&snap(0.46, 5_000.0, 500.0), &point(0, 0.40), &params).is_none());
    }

    #[test]
    fn small_relative_move_is_ignored() {
        assert!(evaluate_confirmed(&snap(0.41, 5_000.0, 6_000.0), &point(0, 0.40), &ConfirmedParams::default()).is_none());
    }

    #[test]
    fn price_move_rejects_degenerate_inputs() {
        assert!(price_move(0.0, 0.5, 0.05, 0.05).is_none());
        assert!(price_move(0.4, 0.4, 0.05, 0.05).is_none());
        assert!(price_move(0.01, 0.03, 0.05, 0.05).is_none());
        let m = price_move(0.01, 0.10, 0.05, 0.05).unwrap();
        // Low baseline is floored so tiny prices cannot produce huge percentages.
        assert!((m.delta_pct - 0.09 / 0.05).abs() < 1e-9);
    }

    #[test]
    fn fast_requires_price_inside_band() {
        let params = FastParams::default();
        let recent = [point(0, 0.80), point(300, 0.85), point(600, 0.90)];
        assert!(evaluate_fast(&snap(0.90, 10_000.0, 10_000.0), &point(0, 0.80), &recent, &params).is_none());
    }

    #[test]
    fn fast_consistent_steps_give_medium_confidence() {
        let params = FastParams::default();
        let recent = [point(0, 0.40), point(300, 0.43), point(600, 0.46)];
        let c = evaluate_fast(&snap(0.46, 10_000.0, 10_000.0), &point(0, 0.40), &recent, &params).unwrap();
        assert_eq!(c.tier, Tier::Fast);
        assert_eq!(c.strength, Strength::Medium);
        assert!(c.watch_only);
    }

    #[test]
    fn fast_choppy_steps_give_low_confidence() {
        let recent = [point(0, 0.40), point(300, 0.47), point(600, 0.46)];
        assert_eq!(fast_confidence(&recent, 0.015), Confidence::Low);
        assert_eq!(fast_confidence(&recent[..2], 0.015), Confidence::Low);
    }

    #[test]
    fn full_mode_fast_alert_is_not_watch_only() {
        let params = FastParams { mode: FastMode::Full, ..FastParams::default() };
        let recent = [point(0, 0.40), point(300, 0.43), point(600, 0.46)];
        let c = evaluate_fast(&snap(0.46, 10_000.0, 10_000.0), &point(0, 0.40), &recent, &params).unwrap();
        assert!(!c.watch_only);
    }

    #[test]
    fn alert_message_reports_percent() {
        let s = snap(0.46, 5_000.0, 6_000.0);
        let c = evaluate_confirmed(&s, &point(0, 0.40), &ConfirmedParams::default()).unwrap();
        let alert = build_alert(&s, &c, 60, from_unix(T0 + 3_600));
        assert_eq!(alert.message, "Dislocation 15.0% over 60m");
        assert_eq!(alert.old_price, Some(0.40));
    }
}
