use crate::config::defaults::{
    FLOOR_PRICE, MEDIUM_ABS_MOVE_THRESHOLD, MEDIUM_MIN_LIQUIDITY, MEDIUM_MIN_VOLUME_24H,
    MIN_PRICE_THRESHOLD, STRONG_ABS_MOVE_THRESHOLD, STRONG_MIN_LIQUIDITY, STRONG_MIN_VOLUME_24H,
};
use crate::types::{
    Alert, AlertClassification, Confidence, PricePoint, SignalType, SuggestedAction,
};

/// How the price behaved around the alert bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriceBehavior {
    /// Two consecutive steps in the alert's direction after the bucket.
    pub sustained: bool,
    /// A step against the move, or a snap back to the old price.
    pub reversal: bool,
    /// Every step smaller than the medium move threshold.
    pub flatline: bool,
}

/// Classify an alert from its magnitude, depth and surrounding price points.
/// Pure: identical inputs always classify identically.
pub fn classify(alert: &Alert, points: &[PricePoint]) -> AlertClassification {
    let behavior = analyze_behavior(alert, points);
    let abs_move = alert.abs_move();
    let large_move = abs_move >= STRONG_ABS_MOVE_THRESHOLD;
    let moderate_move = abs_move >= MEDIUM_ABS_MOVE_THRESHOLD;

    let liquidity = alert.liquidity_or_zero();
    let volume = alert.volume_or_zero();
    let high_liquidity = liquidity >= STRONG_MIN_LIQUIDITY;
    let high_volume = volume >= STRONG_MIN_VOLUME_24H;
    let moderate_liquidity = liquidity >= MEDIUM_MIN_LIQUIDITY;
    let moderate_volume = volume >= MEDIUM_MIN_VOLUME_24H;

    let base_price = alert.old_price.unwrap_or(0.0).max(alert.new_price.unwrap_or(0.0));
    if base_price > 0.0 && (base_price < MIN_PRICE_THRESHOLD || base_price < FLOOR_PRICE) {
        return AlertClassification::NOISE;
    }

    let sweep = AlertClassification::new(
        SignalType::LiquiditySweep,
        Confidence::Medium,
        SuggestedAction::Wait,
    );
    let clean = behavior.sustained && !behavior.reversal;

    if clean && high_liquidity && high_volume {
        return AlertClassification::new(SignalType::Repricing, Confidence::High, SuggestedAction::Follow);
    }
    if clean && large_move && moderate_liquidity && moderate_volume {
        return AlertClassification::new(SignalType::Repricing, Confidence::Medium, SuggestedAction::Follow);
    }
    if large_move && (behavior.reversal || !behavior.sustained) {
        return if moderate_liquidity || moderate_volume { sweep } else { AlertClassification::NOISE };
    }
    if moderate_move && (behavior.reversal || behavior.flatline) {
        return if moderate_liquidity || moderate_volume { sweep } else { AlertClassification::NOISE };
    }
    if moderate_move && moderate_liquidity && moderate_volume && behavior.sustained {
        return sweep;
    }
    AlertClassification::NOISE
}

pub fn analyze_behavior(alert: &Alert, points: &[PricePoint]) -> PriceBehavior {
    if points.len() < 3 {
        return PriceBehavior::default();
    }
    let mut ordered = points.to_vec();
    ordered.sort_by_key(|p| p.bucket);

    let direction = if alert.signed_move() >= 0.0 { 1.0 } else { -1.0 };
    let anchor = alert.bucket.timestamp();
    let idx = ordered
        .iter()
        .enumerate()
        .min_by_key(|(_, p)| (p.bucket.timestamp() - anchor).abs())
        .map(|(i, _)| i)
        .unwrap_or(0);

    let post = &ordered[idx..];
    let deltas: Vec<f64> = post.windows(2).map(|w| w[1].p_yes - w[0].p_yes).collect();

    let sustained = deltas
        .windows(2)
        .any(|w| step_matches(w[0], direction) && step_matches(w[1], direction));
    let old_price = alert.old_price.unwrap_or(0.0);
    let snapback = post
        .iter()
        .skip(1)
        .any(|p| (p.p_yes - old_price).abs() < MEDIUM_ABS_MOVE_THRESHOLD);
    let reversal = deltas.iter().any(|d| step_matches(*d, -direction)) || snapback;
    let flatline = !deltas.is_empty() && deltas.iter().all(|d| d.abs() < MEDIUM_ABS_MOVE_THRESHOLD);

    PriceBehavior {
        sustained,
        reversal,
        flatline,
    }
}

fn step_matches(delta: f64, direction: f64) -> bool {
    delta * direction > 0.0 && delta.abs() >= MEDIUM_ABS_MOVE_THRESHOLD
}
