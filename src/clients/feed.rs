use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{defaults, resilience as tuning, Config};
use crate::error::{AppError, Result};
use crate::resilience::Guard;
use crate::types::{snapshot_bucket, MappingConfidence, MarketSnapshot};

/// Source of market snapshots for a cycle.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn fetch_snapshots(&self, now: DateTime<Utc>) -> Result<Vec<MarketSnapshot>>;
}

#[derive(Debug, Default)]
pub struct FetchStats {
    pub pages: usize,
    pub events: usize,
    pub markets_seen: usize,
    pub rejected_inactive: usize,
    pub rejected_no_price: usize,
    pub rejected_no_title: usize,
    pub accepted: usize,
}

/// Gamma `/events` feed. Each event carries its markets; prices arrive as a
/// JSON-encoded string array.
pub struct GammaFeed {
    client: reqwest::Client,
    base_url: String,
    page_limit: usize,
    max_pages: usize,
    server_filters: bool,
    guard: Arc<Guard>,
}

impl GammaFeed {
    pub fn new(cfg: &Config, guard: Arc<Guard>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(tuning::FEED_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.polymarket_base_url.clone(),
            page_limit: cfg.poly_page_limit,
            max_pages: cfg.poly_max_pages,
            server_filters: cfg.poly_use_server_filters,
            guard,
        })
    }

    fn page_url(&self, offset: usize) -> String {
        let mut url = format!(
            "{}/events?active=true&closed=false&limit={}&offset={}",
            self.base_url, self.page_limit, offset
        );
        // Payload hint only; thresholds are re-checked locally by the detector.
        if self.server_filters {
            url.push_str(&format!(
                "&liquidity_num_min={}&volume_num_min={}",
                defaults::MEDIUM_MIN_LIQUIDITY,
                defaults::MEDIUM_MIN_VOLUME_24H
            ));
        }
        url
    }

    async fn fetch_page(&self, offset: usize) -> Result<Vec<Value>> {
        let url = self.page_url(offset);
        let (client, url) = (&self.client, url.as_str());
        self.guard
            .call(|| async move {
                let resp = client.get(url).send().await?;
                let status = resp.status();
                if status.is_server_error() || status.as_u16() == 429 {
                    return Err(AppError::Feed(format!("/events returned {status}")));
                }
                let body: Value = resp.error_for_status()?.json().await?;
                match body {
                    Value::Array(items) => Ok(items),
                    _ => Err(AppError::Feed("/events response was not an array".to_string())),
                }
            })
            .await
    }
}

#[async_trait]
impl MarketFeed for GammaFeed {
    async fn fetch_snapshots(&self, now: DateTime<Utc>) -> Result<Vec<MarketSnapshot>> {
        let mut stats = FetchStats::default();
        let mut snapshots = Vec::new();
        let mut offset = 0usize;

        while stats.pages < self.max_pages {
            let events = self.fetch_page(offset).await?;
            stats.pages += 1;
            stats.events += events.len();
            for event in &events {
                snapshots.extend(parse_event(event, now, &mut stats));
            }
            debug!(offset, events = events.len(), "[FEED] page fetched");
            if events.len() < self.page_limit {
                break;
            }
            offset += self.page_limit;
        }

        stats.accepted = snapshots.len();
        info!(
            pages = stats.pages,
            events = stats.events,
            markets = stats.markets_seen,
            accepted = stats.accepted,
            rejected_inactive = stats.rejected_inactive,
            rejected_no_price = stats.rejected_no_price,
            rejected_no_title = stats.rejected_no_title,
            "[FEED] fetch complete"
        );
        Ok(snapshots)
    }
}

fn as_f64(v: Option<&Value>) -> Option<f64> {
    v.and_then(|x| x.as_f64().or_else(|| x.as_str().and_then(|s| s.trim().parse().ok())))
}

/// A JSON array that may arrive either as an array or as a JSON string.
fn string_array(v: Option<&Value>) -> Vec<String> {
    let items = match v {
        Some(Value::String(s)) => serde_json::from_str::<Vec<Value>>(s).unwrap_or_default(),
        Some(Value::Array(a)) => a.clone(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .map(|x| match x {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect()
}

fn parse_ts(v: Option<&Value>) -> Option<DateTime<Utc>> {
    match v? {
        Value::Number(n) => n.as_i64().map(crate::types::from_unix),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        _ => None,
    }
}

/// Which outcome is YES. Literal Yes/Up is verified; any other two-outcome
/// market assumes the first outcome.
fn yes_outcome(outcomes: &[String]) -> (usize, MappingConfidence) {
    let literal = outcomes
        .iter()
        .position(|o| o.eq_ignore_ascii_case("yes") || o.eq_ignore_ascii_case("up"));
    match literal {
        Some(i) => (i, MappingConfidence::Verified),
        None if outcomes.len() == 2 => (0, MappingConfidence::Inferred),
        None => (0, MappingConfidence::Unknown),
    }
}

pub fn parse_event(event: &Value, now: DateTime<Utc>, stats: &mut FetchStats) -> Vec<MarketSnapshot> {
    let category = event
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| event.get("slug").and_then(Value::as_str))
        .unwrap_or("unknown")
        .to_string();

    let Some(markets) = event.get("markets").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for m in markets {
        stats.markets_seen += 1;
        if m.get("active").and_then(Value::as_bool) == Some(false)
            || m.get("closed").and_then(Value::as_bool) == Some(true)
        {
            stats.rejected_inactive += 1;
            continue;
        }

        let outcomes = string_array(m.get("outcomes"));
        let prices = string_array(m.get("outcomePrices"));
        let (yes_idx, mapping_confidence) = yes_outcome(&outcomes);
        let p_yes = prices
            .get(yes_idx)
            .and_then(|p| p.trim().parse::<f64>().ok())
            .filter(|p| (0.0..=1.0).contains(p));
        let Some(p_yes) = p_yes else {
            stats.rejected_no_price += 1;
            continue;
        };

        let title = m.get("question").and_then(Value::as_str).unwrap_or("").trim();
        let market_id = m
            .get("id")
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .or_else(|| m.get("slug").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        if title.is_empty() || market_id.is_empty() {
            stats.rejected_no_title += 1;
            continue;
        }

        let source_ts = parse_ts(m.get("lastUpdated").or_else(|| m.get("updatedAt"))).unwrap_or(now);
        out.push(MarketSnapshot {
            market_id,
            title: title.to_string(),
            category: category.clone(),
            p_yes,
            liquidity: as_f64(m.get("liquidityNum").or_else(|| m.get("liquidity"))).unwrap_or(0.0),
            volume_24h: as_f64(m.get("volume24hr").or_else(|| m.get("volume24h"))).unwrap_or(0.0),
            outcome_label: outcomes.get(yes_idx).cloned(),
            mapping_confidence,
            source_ts,
            // Bucketed on our clock so a stale upstream timestamp cannot rewrite history.
            bucket: snapshot_bucket(now),
        });
    }
    out
}
