use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SNAPSHOT_BUCKET_MINUTES;

// ---------------------------------------------------------------------------
// Tier / strength
// ---------------------------------------------------------------------------

/// Detection tier. CONFIRMED and FAST never share cooldown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Confirmed,
    Fast,
}

impl Tier {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONFIRMED" => Some(Tier::Confirmed),
            "FAST" => Some(Tier::Fast),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Confirmed => write!(f, "CONFIRMED"),
            Tier::Fast => write!(f, "FAST"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strength {
    Low,
    Medium,
    Strong,
}

impl Strength {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STRONG" => Some(Strength::Strong),
            "MEDIUM" => Some(Strength::Medium),
            "LOW" => Some(Strength::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for Strength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strength::Strong => "STRONG",
            Strength::Medium => "MEDIUM",
            Strength::Low => "LOW",
        };
        write!(f, "{s}")
    }
}

/// How FAST alerts are surfaced. Only FULL lets them count as more than a watchlist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FastMode {
    WatchOnly,
    Full,
}

impl FastMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "WATCH_ONLY" | "WATCH" => Some(FastMode::WatchOnly),
            "FULL" => Some(FastMode::Full),
            _ => None,
        }
    }
}

impl std::fmt::Display for FastMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FastMode::WatchOnly => write!(f, "WATCH_ONLY"),
            FastMode::Full => write!(f, "FULL"),
        }
    }
}

/// Whether the YES outcome of a market could be identified from its outcome labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingConfidence {
    /// Outcomes were literally Yes/No (or Up/Down).
    Verified,
    /// Two outcomes, first one assumed to be YES.
    Inferred,
    Unknown,
}

impl MappingConfidence {
    pub fn parse(s: &str) -> Self {
        match s {
            "verified" => MappingConfidence::Verified,
            "inferred" => MappingConfidence::Inferred,
            _ => MappingConfidence::Unknown,
        }
    }
}

impl std::fmt::Display for MappingConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MappingConfidence::Verified => "verified",
            MappingConfidence::Inferred => "inferred",
            MappingConfidence::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub market_id: String,
    pub title: String,
    pub category: String,
    /// Outcome probability of YES, 0..1.
    pub p_yes: f64,
    pub liquidity: f64,
    pub volume_24h: f64,
    pub outcome_label: Option<String>,
    pub mapping_confidence: MappingConfidence,
    pub source_ts: DateTime<Utc>,
    pub bucket: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PricePoint {
    pub bucket: DateTime<Utc>,
    pub p_yes: f64,
}

/// Floor a timestamp to the snapshot cadence.
pub fn snapshot_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    let step = SNAPSHOT_BUCKET_MINUTES * 60;
    let secs = ts.timestamp();
    from_unix(secs - secs.rem_euclid(step))
}

pub fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// 64-bit FNV-1a. Output is fixed for a given input, so it is safe for
/// keys that are persisted (theme keys, digest fingerprints).
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// 0 until persisted.
    pub id: i64,
    pub tier: Tier,
    pub market_id: String,
    pub title: String,
    pub category: String,
    pub old_price: Option<f64>,
    pub new_price: Option<f64>,
    /// Relative move as a fraction (0.15 = 15%).
    pub delta_pct: f64,
    pub liquidity: Option<f64>,
    pub volume_24h: Option<f64>,
    pub strength: Strength,
    /// FAST alerts surfaced as watchlist entries only.
    pub watch_only: bool,
    pub outcome_label: Option<String>,
    pub mapping_confidence: MappingConfidence,
    pub bucket: DateTime<Utc>,
    pub triggered_at: DateTime<Utc>,
    pub message: String,
}

impl Alert {
    pub fn abs_move(&self) -> f64 {
        match (self.old_price, self.new_price) {
            (Some(old), Some(new)) => (new - old).abs(),
            _ => self.delta_pct.abs(),
        }
    }

    pub fn signed_move(&self) -> f64 {
        match (self.old_price, self.new_price) {
            (Some(old), Some(new)) => new - old,
            _ => 0.0,
        }
    }

    /// Resolved YES probability at trigger time.
    pub fn p_yes(&self) -> Option<f64> {
        self.new_price
    }

    pub fn liquidity_or_zero(&self) -> f64 {
        self.liquidity.unwrap_or(0.0)
    }

    pub fn volume_or_zero(&self) -> f64 {
        self.volume_24h.unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Repricing,
    LiquiditySweep,
    Noisy,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalType::Repricing => "REPRICING",
            SignalType::LiquiditySweep => "LIQUIDITY_SWEEP",
            SignalType::Noisy => "NOISY",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Some(Confidence::High),
            "MEDIUM" => Some(Confidence::Medium),
            "LOW" => Some(Confidence::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Confidence::High => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::Low => "LOW",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestedAction {
    Follow,
    Wait,
    Ignore,
}

impl std::fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SuggestedAction::Follow => "FOLLOW",
            SuggestedAction::Wait => "WAIT",
            SuggestedAction::Ignore => "IGNORE",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertClassification {
    pub signal_type: SignalType,
    pub confidence: Confidence,
    pub action: SuggestedAction,
}

impl AlertClassification {
    pub const NOISE: Self = Self {
        signal_type: SignalType::Noisy,
        confidence: Confidence::Low,
        action: SuggestedAction::Ignore,
    };

    pub fn new(signal_type: SignalType, confidence: Confidence, action: SuggestedAction) -> Self {
        Self { signal_type, confidence, action }
    }

    /// A repricing we are confident enough to follow.
    pub fn is_actionable(&self) -> bool {
        self.signal_type == SignalType::Repricing
            && self.confidence == Confidence::High
            && self.action == SuggestedAction::Follow
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Skipped,
    Filtered,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Skipped => "skipped",
            DeliveryStatus::Filtered => "filtered",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn bucket_floors_to_five_minutes() {
        assert_eq!(snapshot_bucket(ts("2026-01-05T10:07:59Z")), ts("2026-01-05T10:05:00Z"));
        assert_eq!(snapshot_bucket(ts("2026-01-05T10:05:00Z")), ts("2026-01-05T10:05:00Z"));
        assert_eq!(snapshot_bucket(ts("2026-01-05T10:04:59Z")), ts("2026-01-05T10:00:00Z"));
    }

    #[test]
    fn only_high_follow_repricing_is_actionable() {
        let c = AlertClassification::new(SignalType::Repricing, Confidence::High, SuggestedAction::Follow);
        assert!(c.is_actionable());
        let c = AlertClassification::new(SignalType::Repricing, Confidence::Medium, SuggestedAction::Follow);
        assert!(!c.is_actionable());
        assert!(!AlertClassification::NOISE.is_actionable());
    }

    #[test]
    fn tier_and_strength_parse_case_insensitively() {
        assert_eq!(Tier::parse("fast"), Some(Tier::Fast));
        assert_eq!(Strength::parse(" strong "), Some(Strength::Strong));
        assert_eq!(Strength::parse("weak"), None);
        assert_eq!(FastMode::parse("watch_only"), Some(FastMode::WatchOnly));
    }
}
