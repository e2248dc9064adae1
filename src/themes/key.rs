//! Topic keys for grouping related markets.
//!
//! Titles are tokenized by hand: lower-cased, punctuation folded to spaces.
//! Numbers that need their separators (`$88,000`) are read from the raw
//! title tokens instead.

use std::collections::BTreeSet;

use crate::types::fnv1a_64;

const STOPWORDS: &[&str] = &[
    "will", "the", "a", "an", "be", "of", "price", "prices", "on", "by", "in", "at", "for", "to",
    "is", "are", "between", "and", "above", "below", "over", "under", "vs", "versus",
];

const LEAGUE_TOKENS: &[&str] = &["nba", "nfl", "nhl", "mlb", "mls", "ncaa", "ufc"];

const MONTHS: &[(&str, &str, &str)] = &[
    ("jan", "january", "Jan"),
    ("feb", "february", "Feb"),
    ("mar", "march", "Mar"),
    ("apr", "april", "Apr"),
    ("may", "may", "May"),
    ("jun", "june", "Jun"),
    ("jul", "july", "Jul"),
    ("aug", "august", "Aug"),
    ("sep", "september", "Sep"),
    ("oct", "october", "Oct"),
    ("nov", "november", "Nov"),
    ("dec", "december", "Dec"),
];

/// alias → (canonical underlying, display ticker)
const ASSETS: &[(&str, &str, &str)] = &[
    ("bitcoin", "bitcoin", "BTC"),
    ("btc", "bitcoin", "BTC"),
    ("ethereum", "ethereum", "ETH"),
    ("eth", "ethereum", "ETH"),
    ("solana", "solana", "SOL"),
    ("sol", "solana", "SOL"),
    ("dogecoin", "dogecoin", "DOGE"),
    ("doge", "dogecoin", "DOGE"),
    ("xrp", "xrp", "XRP"),
    ("ripple", "xrp", "XRP"),
    ("cardano", "cardano", "ADA"),
    ("ada", "cardano", "ADA"),
    ("litecoin", "litecoin", "LTC"),
    ("ltc", "litecoin", "LTC"),
];

const UNKNOWN_DATE: &str = "unknown-date";
const MAX_GENERIC_KEY_LEN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThemeKind {
    PriceBand,
    IntradayDirection,
    Matchup,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeExtract {
    pub key: String,
    pub label: String,
    /// Compact per-market line, e.g. `Above 90k` inside a BTC band theme.
    pub short_title: String,
    pub kind: ThemeKind,
    /// Significant (non-stopword) tokens, for similarity merging.
    pub tokens: BTreeSet<String>,
}

pub fn extract_theme(title: &str, category: Option<&str>) -> ThemeExtract {
    let normalized = normalize_text(title);
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    let significant = strip_stopwords(&tokens);
    let token_set: BTreeSet<String> = significant.iter().map(|t| t.to_string()).collect();

    let date_key = parse_date(&tokens).unwrap_or_else(|| UNKNOWN_DATE.to_string());
    let detected = detect_underlying(&significant);
    let underlying = || detected.map(str::to_string).unwrap_or_else(|| fallback_underlying(&significant));

    if tokens.contains(&"between") && tokens.contains(&"and") {
        if let Some((low, high)) = extract_price_range(title) {
            let u = underlying();
            return ThemeExtract {
                key: format!("{u}|{date_key}|price-band"),
                label: with_date(format!("{} price band", display_underlying(&u)), &date_key, None),
                short_title: format!("{}-{} range", format_k(low), format_k(high)),
                kind: ThemeKind::PriceBand,
                tokens: token_set,
            };
        }
    }

    if let Some((direction, strike)) = extract_directional_strike(title) {
        let u = underlying();
        let short_title = format!("{direction} {}", format_k(strike));
        return match extract_time(title) {
            Some((time_key, time_label)) => ThemeExtract {
                key: format!("{u}|{date_key}|{time_key}|intraday"),
                label: with_date(format!("{} intraday", display_underlying(&u)), &date_key, Some(&time_label)),
                short_title,
                kind: ThemeKind::IntradayDirection,
                tokens: token_set,
            },
            None => ThemeExtract {
                key: format!("{u}|{date_key}|price-band"),
                label: with_date(
                    format!("{} {} band", display_underlying(&u), format_k(strike)),
                    &date_key,
                    None,
                ),
                short_title,
                kind: ThemeKind::PriceBand,
                tokens: token_set,
            },
        };
    }

    if let Some((team_a, team_b)) = extract_matchup(&tokens) {
        let date_key = if date_key == UNKNOWN_DATE {
            category.and_then(iso_date).unwrap_or(date_key)
        } else {
            date_key
        };
        let mut keys = [team_a.replace(' ', "-"), team_b.replace(' ', "-")];
        keys.sort();
        let base = format!("{} vs {}", title_case(&team_a), title_case(&team_b));
        return ThemeExtract {
            key: format!("{}|{date_key}|matchup", keys.join("_")),
            label: with_date(base.clone(), &date_key, None),
            short_title: base,
            kind: ThemeKind::Matchup,
            tokens: token_set,
        };
    }

    let mut fingerprint = significant.iter().take(6).copied().collect::<Vec<_>>().join("_");
    if fingerprint.is_empty() {
        fingerprint = "unknown".to_string();
    } else if fingerprint.len() > MAX_GENERIC_KEY_LEN {
        fingerprint = format!("{:016x}", fnv1a_64(fingerprint.as_bytes()));
    }
    let label = generic_label(title, &tokens);
    ThemeExtract {
        key: format!("generic|{fingerprint}"),
        short_title: label.clone(),
        label,
        kind: ThemeKind::Generic,
        tokens: token_set,
    }
}

pub fn normalize_text(text: &str) -> String {
    let folded: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn strip_stopwords<'a>(tokens: &[&'a str]) -> Vec<&'a str> {
    tokens
        .iter()
        .copied()
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .collect()
}

/// Significant tokens of a title as a set.
pub fn significant_tokens(title: &str) -> BTreeSet<String> {
    let normalized = normalize_text(title);
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    strip_stopwords(&tokens).into_iter().map(str::to_string).collect()
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.union(b).count();
    inter as f64 / union as f64
}

// ---------------------------------------------------------------------------
// Numbers
// ---------------------------------------------------------------------------

/// `$88,000` → 88000. Trailing punctuation is ignored.
fn parse_money(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    if !cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    cleaned.parse::<f64>().ok().map(|v| v as i64)
}

fn raw_words(title: &str) -> Vec<String> {
    title
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '$').to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

fn extract_price_range(title: &str) -> Option<(i64, i64)> {
    let words = raw_words(title);
    let i = words.iter().position(|w| w == "between")?;
    let low = parse_money(words.get(i + 1)?)?;
    if words.get(i + 2).map(String::as_str) != Some("and") {
        return None;
    }
    let high = parse_money(words.get(i + 3)?)?;
    Some(if low > high { (high, low) } else { (low, high) })
}

fn extract_directional_strike(title: &str) -> Option<(&'static str, i64)> {
    let words = raw_words(title);
    words.iter().enumerate().find_map(|(i, w)| {
        let direction = match w.as_str() {
            "above" | "over" => "Above",
            "below" | "under" => "Below",
            _ => return None,
        };
        let strike = parse_money(words.get(i + 1)?)?;
        Some((direction, strike))
    })
}

pub fn format_k(value: i64) -> String {
    fn compact(value: i64, scale: i64, suffix: &str) -> String {
        if value % scale == 0 {
            return format!("{}{suffix}", value / scale);
        }
        let text = format!("{:.1}", value as f64 / scale as f64);
        let text = text.trim_end_matches('0').trim_end_matches('.');
        format!("{text}{suffix}")
    }
    if value >= 1_000_000 {
        compact(value, 1_000_000, "m")
    } else if value >= 1_000 {
        compact(value, 1_000, "k")
    } else {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Dates & times
// ---------------------------------------------------------------------------

fn month_of(token: &str) -> Option<&'static (&'static str, &'static str, &'static str)> {
    MONTHS.iter().find(|(short, full, _)| {
        token == *short || token == *full || (token.len() > 3 && full.starts_with(token) && token.starts_with(short))
    })
}

/// `january 3` → `january-3`, `jan 3 2026` → `january-3-2026`.
fn parse_date(tokens: &[&str]) -> Option<String> {
    tokens.windows(2).enumerate().find_map(|(i, w)| {
        let (_, full, _) = month_of(w[0])?;
        let day: u32 = w[1].parse().ok().filter(|d| (1..=31).contains(d) && w[1].len() <= 2)?;
        let year = tokens
            .get(i + 2)
            .filter(|y| y.len() == 4 && y.chars().all(|c| c.is_ascii_digit()));
        Some(match year {
            Some(y) => format!("{full}-{day}-{y}"),
            None => format!("{full}-{day}"),
        })
    })
}

/// First `YYYY-MM-DD` inside free text (categories, slugs).
fn iso_date(text: &str) -> Option<String> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '-'))
        .flat_map(|chunk| (0..chunk.len().saturating_sub(9)).map(move |i| &chunk[i..i + 10]))
        .find(|cand| {
            let b = cand.as_bytes();
            b[4] == b'-'
                && b[7] == b'-'
                && cand.chars().enumerate().all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
        })
        .map(str::to_string)
}

fn clock_parts(token: &str) -> Option<(String, Option<String>)> {
    let (hour, minute) = match token.split_once(':') {
        Some((h, m)) => (h, Some(m)),
        None => (token, None),
    };
    let hour_ok = !hour.is_empty() && hour.len() <= 2 && hour.chars().all(|c| c.is_ascii_digit());
    let minute_ok = minute.map_or(true, |m| m.len() == 2 && m.chars().all(|c| c.is_ascii_digit()));
    (hour_ok && minute_ok).then(|| (hour.to_string(), minute.map(str::to_string)))
}

/// `3pm ET` → (`3pm-et`, `3PM ET`).
fn extract_time(title: &str) -> Option<(String, String)> {
    let lowered = title.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == ':'))
        .filter(|w| !w.is_empty())
        .collect();

    for (i, w) in words.iter().enumerate() {
        let (clock, ampm, tz_at) = if let Some(stripped) = w.strip_suffix("am").or_else(|| w.strip_suffix("pm")) {
            (stripped, &w[w.len() - 2..], i + 1)
        } else {
            match words.get(i + 1) {
                Some(next) if *next == "am" || *next == "pm" => (*w, *next, i + 2),
                _ => continue,
            }
        };
        let Some((hour, minute)) = clock_parts(clock) else {
            continue;
        };
        let tz = words.get(tz_at).filter(|t| matches!(**t, "et" | "ct" | "mt" | "pt"));

        let mut key = format!("{hour}{}{ampm}", minute.clone().unwrap_or_default());
        let mut label = match &minute {
            Some(m) => format!("{hour}:{m}{}", ampm.to_uppercase()),
            None => format!("{hour}{}", ampm.to_uppercase()),
        };
        if let Some(tz) = tz {
            key = format!("{key}-{tz}");
            label = format!("{label} {}", tz.to_uppercase());
        }
        return Some((key, label));
    }
    None
}

fn format_date_label(date_key: &str) -> Option<String> {
    if date_key == UNKNOWN_DATE {
        return None;
    }
    let parts: Vec<&str> = date_key.split('-').collect();
    if parts.len() == 3 && parts[0].len() == 4 {
        let month: usize = parts[1].parse().ok()?;
        let day: u32 = parts[2].parse().ok()?;
        let (_, _, short) = MONTHS.get(month.checked_sub(1)?)?;
        return Some(format!("{short} {day} {}", parts[0]));
    }
    let (_, _, short) = MONTHS.iter().find(|(_, full, _)| *full == parts[0])?;
    let day: u32 = parts.get(1)?.parse().ok()?;
    Some(match parts.get(2) {
        Some(year) => format!("{short} {day} {year}"),
        None => format!("{short} {day}"),
    })
}

fn with_date(base: String, date_key: &str, time_label: Option<&str>) -> String {
    let suffix: Vec<String> = format_date_label(date_key)
        .into_iter()
        .chain(time_label.map(str::to_string))
        .collect();
    if suffix.is_empty() {
        base
    } else {
        format!("{base} ({})", suffix.join(" "))
    }
}

// ---------------------------------------------------------------------------
// Underlyings, matchups, labels
// ---------------------------------------------------------------------------

fn detect_underlying(tokens: &[&str]) -> Option<&'static str> {
    tokens
        .iter()
        .find_map(|t| ASSETS.iter().find(|(alias, _, _)| alias == t).map(|(_, canon, _)| *canon))
}

fn fallback_underlying(tokens: &[&str]) -> String {
    tokens
        .iter()
        .find(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .map(|t| t.to_string())
        .unwrap_or_else(|| "market".to_string())
}

fn display_underlying(underlying: &str) -> String {
    ASSETS
        .iter()
        .find(|(_, canon, _)| *canon == underlying)
        .map(|(_, _, display)| display.to_string())
        .unwrap_or_else(|| title_case(underlying))
}

fn extract_matchup(tokens: &[&str]) -> Option<(String, String)> {
    let split = tokens.iter().position(|t| matches!(*t, "vs" | "versus" | "v"))?;
    let team_a = compact_team(&strip_stopwords(&tokens[..split]));
    let team_b = compact_team(&strip_stopwords(&tokens[split + 1..]));
    (!team_a.is_empty() && !team_b.is_empty()).then_some((team_a, team_b))
}

fn compact_team(tokens: &[&str]) -> String {
    let words: Vec<&str> = tokens.iter().copied().filter(|t| is_team_word(t)).collect();
    let tail = &words[words.len().saturating_sub(3)..];
    tail.join(" ")
}

fn is_team_word(token: &str) -> bool {
    !token.is_empty()
        && !LEAGUE_TOKENS.contains(&token)
        && !matches!(token, "u" | "o" | "ou" | "total" | "spread" | "line" | "over" | "under")
        && !token.chars().any(|c| c.is_ascii_digit())
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn generic_label(title: &str, tokens: &[&str]) -> String {
    let trimmed = title.trim();
    if trimmed.to_lowercase().starts_with("will ") {
        let body = trimmed.get(5..).unwrap_or_default().trim().trim_end_matches(['?', ' ']);
        if !body.is_empty() {
            return truncate(&title_case(body), 40);
        }
    }
    if tokens.is_empty() {
        return "Market theme".to_string();
    }
    title_case(&tokens.iter().take(7).copied().collect::<Vec<_>>().join(" "))
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let head: String = text.chars().take(limit - 3).collect();
    format!("{}...", head.trim_end())
}
